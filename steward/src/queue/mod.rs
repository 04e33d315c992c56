mod memory;
mod sqlite;

use crate::{conf, storage};
use async_trait::async_trait;
use serde::Deserialize;
use std::{fmt::Debug, sync::Arc, time::Duration};
use strum::{Display, EnumString};

/// Represents different queue failure possibilities.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    /// Failed to communicate with the queue backend.
    #[error("could not connect to queue; {0}")]
    Connection(String),

    /// A delivery was completed or abandoned that the queue does not consider in flight; usually because it was
    /// already settled.
    #[error("delivery '{0}' is not in flight")]
    UnknownDelivery(String),

    /// An expected and unknown error has occurred.
    #[error("unexpected queue error occurred; {0}")]
    Unknown(String),
}

/// A message to be placed on a queue.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueMessage {
    /// The serialized payload.
    pub body: String,

    /// Ties related messages together; the engine uses the operation id.
    pub correlation_id: String,

    /// Groups messages that must be processed in order; the engine uses the target resource id.
    pub session_id: String,
}

/// A message that has been received from a queue but not yet settled. Every delivery must eventually be handed
/// back through either `complete` or `abandon`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Unique identifier for this specific delivery attempt.
    pub id: String,

    /// The queue the message was received from.
    pub queue: String,

    /// How many times this message has been handed out, including this one.
    pub delivery_count: u32,

    pub message: QueueMessage,
}

/// The queue trait defines the interface between the engine and a message transport. Messages are delivered at
/// least once; a received message is redelivered until it is completed.
#[async_trait]
pub trait Queue: Debug + Send + Sync {
    /// Place a message at the back of the named queue.
    async fn send(&self, queue: &str, message: QueueMessage) -> Result<(), QueueError>;

    /// Wait up to `max_wait` for the next message on the named queue. Returns None if nothing arrived in time.
    async fn receive(&self, queue: &str, max_wait: Duration)
        -> Result<Option<Delivery>, QueueError>;

    /// Acknowledge a delivery; it will never be handed out again.
    async fn complete(&self, delivery: Delivery) -> Result<(), QueueError>;

    /// Give a delivery back to the queue so that it is redelivered. It goes behind the messages already waiting.
    async fn abandon(&self, delivery: Delivery) -> Result<(), QueueError>;
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Display, EnumString, Default)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Engine {
    /// Process local queue. Messages do not survive a restart and are only visible within the same process.
    Memory,

    /// Kept in the engine's database. Every process pointed at the same database file shares the queues.
    #[default]
    Sqlite,
}

pub fn init_queue(config: &conf::Queue, db: &storage::Db) -> Arc<dyn Queue> {
    match config.engine {
        Engine::Memory => Arc::new(memory::Memory::new()),
        Engine::Sqlite => Arc::new(sqlite::Sqlite::new(
            db.clone(),
            Duration::from_secs(config.lock_duration),
            Duration::from_millis(config.poll_interval),
        )),
    }
}
