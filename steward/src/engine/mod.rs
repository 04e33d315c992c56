pub mod deployment_status;
pub mod event_utils;
pub mod operations;
pub mod resource_requests;
pub mod resource_templates;
pub mod resources;
pub mod step_helpers;
pub mod substitutions;
pub mod supervisor;

use crate::{conf, queue, storage};
use anyhow::{Context, Result};
use std::{sync::Arc, time::Duration};
use tracing::{error, info};

/// Represents the different ways a pipeline operation can fail. How the deployment status consumer settles a
/// message depends on which of these it got back; see `is_terminal`.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PipelineError {
    /// The entity a message refers to does not exist. Retrying will never help.
    #[error("not found; {0}")]
    NotFound(String),

    /// A patch did not pass template validation.
    #[error("validation failed; {0}")]
    Validation(String),

    /// An etag precondition failed; another writer got there first.
    #[error("concurrent modification; {0}")]
    ConcurrencyConflict(String),

    /// A template, pipeline or substitution is set up in a way that can never succeed.
    #[error("configuration error; {0}")]
    Configuration(String),

    /// The store or queue could not be reached or returned an unexpected failure.
    #[error("transient store error; {0}")]
    TransientStore(String),

    #[error("internal error; {0}")]
    Internal(String),
}

impl PipelineError {
    /// Terminal errors are acknowledged and dropped; everything else is left for redelivery.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineError::NotFound(_))
    }

    /// Transient errors say nothing about the operation being processed. The same work may well succeed when
    /// it is tried again, so they must never be recorded as a step failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientStore(_) | PipelineError::Internal(_)
        )
    }
}

impl From<storage::StorageError> for PipelineError {
    fn from(value: storage::StorageError) -> Self {
        match value {
            storage::StorageError::NotFound => PipelineError::NotFound(value.to_string()),
            storage::StorageError::Conflict(_) => {
                PipelineError::ConcurrencyConflict(value.to_string())
            }
            _ => PipelineError::TransientStore(value.to_string()),
        }
    }
}

impl From<queue::QueueError> for PipelineError {
    fn from(value: queue::QueueError) -> Self {
        PipelineError::TransientStore(value.to_string())
    }
}

/// Return the current epoch time in milliseconds.
pub fn epoch_milli() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Everything the engine components need to do their job. Handed around behind an Arc.
#[derive(Debug, Clone)]
pub struct EngineState {
    pub config: conf::Config,
    pub storage: storage::Db,
    pub queue: Arc<dyn queue::Queue>,
    pub event_bus: event_utils::EventBus,
}

impl EngineState {
    pub async fn new(config: conf::Config) -> Result<Self> {
        let storage = storage::Db::new(&config.storage.path)
            .await
            .with_context(|| format!("Could not open database at '{}'", config.storage.path))?;

        let queue = queue::init_queue(&config.queue, &storage);

        let event_bus = event_utils::EventBus::new(
            storage.clone(),
            config.general.event_retention,
            config.general.event_prune_interval,
        );

        Ok(Self {
            config,
            storage,
            queue,
            event_bus,
        })
    }
}

/// Runs the deployment status consumer under the supervisor until a shutdown signal is received.
pub async fn start_consumer(state: Arc<EngineState>) -> Result<()> {
    let heartbeat = Arc::new(supervisor::Heartbeat::new());
    let settings = supervisor::Settings::from(&state.config.consumer);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let supervisor = {
        let state = state.clone();
        let heartbeat = heartbeat.clone();

        tokio::spawn(async move {
            supervisor::supervise(settings, heartbeat.clone(), shutdown_rx, move || {
                deployment_status::receive_loop(state.clone(), heartbeat.clone())
            })
            .await
        })
    };

    info!(
        queue = state.config.queue.deployment_status_queue,
        "started deployment status consumer"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Could not listen for shutdown signal")?;

    info!("shutdown signal received; stopping deployment status consumer");

    if shutdown_tx.send(true).is_err() {
        error!("supervisor exited before it could be told to shut down");
    }

    tokio::time::timeout(Duration::from_secs(10), supervisor)
        .await
        .context("Timed out waiting for the consumer to stop")?
        .context("Consumer supervisor panicked")?;

    Ok(())
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::storage::tests::TestHarness;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// An engine wired to a throw-away database and an in-process queue.
    pub struct TestEngine {
        pub state: Arc<EngineState>,
        _harness: TestHarness,
    }

    fn test_config(configure: impl FnOnce(&mut conf::Config)) -> conf::Config {
        let mut config = conf::Config::load(Some("/nonexistent/steward.toml"))
            .expect("could not load default config");
        config.queue.engine = queue::Engine::Memory;
        config.queue.max_wait = 1;
        configure(&mut config);
        config
    }

    impl TestEngine {
        pub async fn new() -> Self {
            Self::with_config(|_| {}).await
        }

        pub async fn with_config(configure: impl FnOnce(&mut conf::Config)) -> Self {
            let harness = TestHarness::new().await;
            let config = test_config(configure);
            let queue = queue::init_queue(&config.queue, &harness.db);

            Self::assemble(harness, config, queue)
        }

        /// The queue is wrapped so tests can make sends fail on demand.
        pub async fn with_flaky_queue() -> (Self, Arc<FlakyQueue>) {
            let harness = TestHarness::new().await;
            let config = test_config(|_| {});
            let flaky = Arc::new(FlakyQueue::new(queue::init_queue(
                &config.queue,
                &harness.db,
            )));

            (Self::assemble(harness, config, flaky.clone()), flaky)
        }

        fn assemble(
            harness: TestHarness,
            config: conf::Config,
            queue: Arc<dyn queue::Queue>,
        ) -> Self {
            let event_bus = event_utils::EventBus::new(harness.db.clone(), 3600, 3600);

            let state = EngineState {
                queue,
                config,
                storage: harness.db.clone(),
                event_bus,
            };

            Self {
                state: Arc::new(state),
                _harness: harness,
            }
        }
    }

    /// Wraps another queue and fails the next `fail_sends` sends with a connection error.
    #[derive(Debug)]
    pub struct FlakyQueue {
        inner: Arc<dyn queue::Queue>,
        failing_sends: AtomicU32,
    }

    impl FlakyQueue {
        fn new(inner: Arc<dyn queue::Queue>) -> Self {
            Self {
                inner,
                failing_sends: AtomicU32::new(0),
            }
        }

        pub fn fail_sends(&self, count: u32) {
            self.failing_sends.store(count, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl queue::Queue for FlakyQueue {
        async fn send(
            &self,
            queue_name: &str,
            message: queue::QueueMessage,
        ) -> Result<(), queue::QueueError> {
            let should_fail = self
                .failing_sends
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();

            if should_fail {
                return Err(queue::QueueError::Connection("queue unavailable".into()));
            }

            self.inner.send(queue_name, message).await
        }

        async fn receive(
            &self,
            queue_name: &str,
            max_wait: Duration,
        ) -> Result<Option<queue::Delivery>, queue::QueueError> {
            self.inner.receive(queue_name, max_wait).await
        }

        async fn complete(&self, delivery: queue::Delivery) -> Result<(), queue::QueueError> {
            self.inner.complete(delivery).await
        }

        async fn abandon(&self, delivery: queue::Delivery) -> Result<(), queue::QueueError> {
            self.inner.abandon(delivery).await
        }
    }

    #[test]
    fn test_storage_errors_map_to_pipeline_errors() {
        assert!(PipelineError::from(storage::StorageError::NotFound).is_terminal());
        assert!(matches!(
            PipelineError::from(storage::StorageError::Conflict("etag".into())),
            PipelineError::ConcurrencyConflict(_)
        ));
        assert!(matches!(
            PipelineError::from(storage::StorageError::Connection("down".into())),
            PipelineError::TransientStore(_)
        ));
        assert!(!PipelineError::Configuration("bad".into()).is_terminal());
        assert!(PipelineError::from(queue::QueueError::Connection("down".into())).is_transient());
        assert!(!PipelineError::ConcurrencyConflict("etag".into()).is_transient());
    }
}
