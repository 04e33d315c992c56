use crate::{
    engine::{epoch_milli, resources::Status},
    storage,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumDiscriminants, EnumString};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

#[derive(Debug, PartialEq, Eq, EnumDiscriminants, Display, Serialize, Deserialize, Clone)]
#[strum_discriminants(derive(EnumString, Display, Hash))]
#[strum_discriminants(strum(serialize_all = "snake_case"))]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    CreatedOperation {
        operation_id: String,
        resource_id: String,
        action: String,
    },
    UpdatedOperationStep {
        operation_id: String,
        step_id: String,
        status: Status,
    },
    CompletedOperation {
        operation_id: String,
        status: Status,
    },
    DispatchedResourceRequest {
        operation_id: String,
        step_id: String,
        resource_id: String,
    },
}

/// A single event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Unique identifier for event.
    pub id: String,

    /// The type of event it is.
    pub kind: Kind,

    /// Time event was performed in epoch milliseconds.
    pub emitted: u64,
}

impl TryFrom<storage::events::Event> for Event {
    type Error = anyhow::Error;

    fn try_from(value: storage::events::Event) -> Result<Self> {
        let emitted = value.emitted.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'emitted' from storage value '{}'",
                value.emitted
            )
        })?;

        let kind: Kind = serde_json::from_str(&value.details).with_context(|| {
            format!(
                "Could not parse field 'details' from storage value '{}'",
                value.details
            )
        })?;

        Ok(Event {
            id: value.id,
            kind,
            emitted,
        })
    }
}

impl TryFrom<Event> for storage::events::Event {
    type Error = anyhow::Error;

    fn try_from(value: Event) -> Result<Self> {
        let details = serde_json::to_string(&value.kind).with_context(|| {
            format!(
                "Could not parse field 'kind' to storage value '{:#?}'",
                value.kind
            )
        })?;

        Ok(Self {
            id: value.id,
            kind: KindDiscriminants::from(&value.kind).to_string(),
            details,
            emitted: value.emitted.to_string(),
        })
    }
}

impl Event {
    pub fn new(kind: Kind) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            kind,
            emitted: epoch_milli(),
        }
    }
}

/// The event bus records everything notable the engine does. Events are persisted so they can be audited later
/// and fanned out to any in-process listener.
#[derive(Debug, Clone)]
pub struct EventBus {
    storage: storage::Db,
    broadcast_channel: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(storage: storage::Db, retention: u64, prune_interval: u64) -> Self {
        let (tx, _) = broadcast::channel(100);

        let event_bus = Self {
            storage: storage.clone(),
            broadcast_channel: tx,
        };

        tokio::spawn(async move {
            loop {
                match prune_events(&storage, retention).await {
                    Ok(_) => (),
                    Err(e) => {
                        error!(error = %e, "encountered an error during attempt to prune old events")
                    }
                };

                tokio::time::sleep(tokio::time::Duration::from_secs(prune_interval)).await;
            }
        });

        event_bus
    }

    /// Returns a channel receiver end which can be used to listen to events.
    /// The receiver will drop automatically when out of scope.
    #[allow(dead_code)]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcast_channel.subscribe()
    }

    /// Emits a new event and waits until it is stored. Returns the resulting event.
    pub async fn try_publish(&self, kind: Kind) -> Result<Event> {
        let new_event = Event::new(kind.clone());

        let new_event_storage: storage::events::Event =
            new_event.clone().try_into().with_context(|| {
                format!(
                    "could not publish event for kind '{}'; could not serialize event into storage",
                    &kind
                )
            })?;

        let mut conn = self.storage.write_conn().await.with_context(|| {
            format!(
                "could not publish event for kind '{}'; Database error;",
                new_event.kind,
            )
        })?;

        storage::events::insert(&mut conn, &new_event_storage)
            .await
            .with_context(|| {
                format!(
                    "could not publish event for kind '{}'; Database insert error",
                    &kind
                )
            })?;

        trace!(id = new_event.id, kind = %kind, emitted = new_event.emitted, "new event");

        // Nobody listening is not an error; the event is already stored.
        let _ = self.broadcast_channel.send(new_event.clone());

        Ok(new_event)
    }

    /// Emits a new event in the background. Failures are logged and otherwise ignored.
    pub fn publish(&self, kind: Kind) {
        let event_bus = self.clone();

        tokio::spawn(async move {
            if let Err(err) = event_bus.try_publish(kind).await {
                error!(error = %format!("{err:#}"), "Could not publish event");
            }
        });
    }
}

/// Lists stored events, oldest first unless `reverse` is set.
pub async fn list_events(
    storage: &storage::Db,
    offset: i64,
    limit: i64,
    reverse: bool,
) -> Result<Vec<Event>> {
    let mut conn = storage
        .read_conn()
        .await
        .context("Could not open connection to list events")?;

    let events = storage::events::list(&mut conn, offset, limit, reverse)
        .await
        .context("Could not list events")?;

    events.into_iter().map(Event::try_from).collect()
}

async fn prune_events(storage: &storage::Db, retention: u64) -> Result<(), storage::StorageError> {
    let mut offset = 0;
    let mut total_pruned = 0;

    let mut conn = match storage.write_conn().await {
        Ok(conn) => conn,
        Err(e) => {
            error!("could not prune events; connection error");
            return Err(e);
        }
    };

    loop {
        let events = storage::events::list(&mut conn, offset, 50, false).await?;

        let mut pruned_this_page = 0;

        for event in &events {
            if is_past_cut_date(event, retention) {
                debug!(
                    emitted = event.emitted,
                    retention = retention,
                    current_time = epoch_milli(),
                    "removed event past retention period"
                );

                storage::events::delete(&mut conn, &event.id).await?;
                pruned_this_page += 1;
            }
        }

        total_pruned += pruned_this_page;

        if events.len() != 50 {
            if total_pruned > 0 {
                info!(
                    retention = retention,
                    total_pruned = total_pruned,
                    "pruned old events"
                );
            }

            return Ok(());
        }

        // Deleted rows no longer take up space in the listing, so only skip over the ones that were kept.
        offset += (events.len() - pruned_this_page) as i64;
    }
}

fn is_past_cut_date(event: &storage::events::Event, limit: u64) -> bool {
    let now = epoch_milli();
    let limit = Duration::from_secs(limit).as_millis() as u64;
    let expiry_time = now.saturating_sub(limit);

    let emitted = match event.emitted.parse::<u64>() {
        Ok(emitted) => emitted,
        Err(_) => return false,
    };

    emitted < expiry_time
}
