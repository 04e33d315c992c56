use crate::{
    conf,
    engine::{epoch_milli, PipelineError},
};
use rand::Rng;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::watch, time::Instant};
use tracing::{error, info, warn};

/// The last time a supervised loop reported itself alive, in epoch milliseconds.
#[derive(Debug)]
pub struct Heartbeat(AtomicU64);

impl Heartbeat {
    pub fn new() -> Self {
        Self(AtomicU64::new(epoch_milli()))
    }

    pub fn beat(&self) {
        self.0.store(epoch_milli(), Ordering::Relaxed);
    }

    pub fn last_beat(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn is_stale(&self, threshold: Duration) -> bool {
        epoch_milli().saturating_sub(self.last_beat()) > threshold.as_millis() as u64
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// How often the heartbeat is looked at.
    pub check_interval: Duration,

    /// A loop that has not beaten for this long is considered stuck and restarted.
    pub staleness_threshold: Duration,
    pub restart_delay_base: Duration,
    pub restart_delay_max: Duration,
}

impl From<&conf::Consumer> for Settings {
    fn from(value: &conf::Consumer) -> Self {
        Self {
            check_interval: Duration::from_secs(value.heartbeat_check_interval),
            staleness_threshold: Duration::from_secs(value.heartbeat_staleness_threshold),
            restart_delay_base: Duration::from_secs(value.restart_delay_base),
            restart_delay_max: Duration::from_secs(value.restart_delay_max),
        }
    }
}

/// Delay before restart number `restarts` (counting from zero): the base doubled per restart, never more than max.
pub fn backoff(restarts: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(restarts).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(max, |delay| delay.min(max))
}

/// Adds up to a tenth of the delay on top so consumers that crashed together do not restart together.
fn jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 10;
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Keeps a loop running until shutdown is signalled.
///
/// `start` is called to create each incarnation of the loop. An incarnation is replaced when it returns, panics
/// or lets its heartbeat go stale. Restarts are delayed with capped exponential backoff; the delay drops back to
/// the base once an incarnation survives a full check interval.
pub async fn supervise<F, Fut>(
    settings: Settings,
    heartbeat: Arc<Heartbeat>,
    mut shutdown: watch::Receiver<bool>,
    mut start: F,
) where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<(), PipelineError>> + Send + 'static,
{
    let mut restarts: u32 = 0;

    loop {
        if *shutdown.borrow() {
            return;
        }

        heartbeat.beat();
        let mut handle = tokio::spawn(start());
        let mut check = tokio::time::interval_at(
            Instant::now() + settings.check_interval,
            settings.check_interval,
        );

        let reason = loop {
            tokio::select! {
                result = &mut handle => {
                    break match result {
                        Ok(Ok(())) => "loop exited".to_string(),
                        Ok(Err(e)) => format!("loop failed; {e}"),
                        Err(e) => format!("loop panicked; {e}"),
                    };
                }
                _ = check.tick() => {
                    if heartbeat.is_stale(settings.staleness_threshold) {
                        handle.abort();
                        break "heartbeat went stale".to_string();
                    }

                    restarts = 0;
                }
                _ = shutdown.changed() => {
                    handle.abort();
                    info!("supervised loop stopped");
                    return;
                }
            }
        };

        let delay = jitter(backoff(
            restarts,
            settings.restart_delay_base,
            settings.restart_delay_max,
        ));
        restarts = restarts.saturating_add(1);

        error!(
            reason,
            restarts,
            delay_ms = delay.as_millis() as u64,
            "supervised loop stopped unexpectedly; restarting"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                warn!("shutdown requested while waiting to restart supervised loop");
                return;
            }
        }
    }
}
