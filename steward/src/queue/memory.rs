use super::{Delivery, Queue, QueueError, QueueMessage};
use async_trait::async_trait;
use dashmap::DashMap;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::sync::{Mutex, Notify};
use tracing::trace;
use uuid::Uuid;

#[derive(Debug)]
struct Pending {
    /// Number of times this message was already handed out.
    delivery_count: u32,
    message: QueueMessage,
}

#[derive(Debug, Default)]
struct Channel {
    pending: Mutex<VecDeque<Pending>>,
    notify: Notify,
}

/// An in-process queue backed by one deque per queue name. Deliveries that are handed out are tracked until they
/// are settled so that double settlement can be detected.
#[derive(Debug, Default)]
pub struct Memory {
    queues: DashMap<String, Arc<Channel>>,
    in_flight: DashMap<String, ()>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, queue: &str) -> Arc<Channel> {
        self.queues.entry(queue.to_string()).or_default().clone()
    }
}

#[async_trait]
impl Queue for Memory {
    async fn send(&self, queue: &str, message: QueueMessage) -> Result<(), QueueError> {
        let channel = self.channel(queue);

        channel.pending.lock().await.push_back(Pending {
            delivery_count: 0,
            message,
        });
        channel.notify.notify_one();

        trace!(queue = queue, "message enqueued");
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        max_wait: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let channel = self.channel(queue);
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            let next = channel.pending.lock().await.pop_front();

            if let Some(pending) = next {
                let delivery = Delivery {
                    id: Uuid::now_v7().to_string(),
                    queue: queue.to_string(),
                    delivery_count: pending.delivery_count + 1,
                    message: pending.message,
                };

                self.in_flight.insert(delivery.id.clone(), ());
                return Ok(Some(delivery));
            }

            // notify_one stores a permit if nobody is waiting, so a send that lands between the pop above and this
            // wait is not lost.
            if tokio::time::timeout_at(deadline, channel.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn complete(&self, delivery: Delivery) -> Result<(), QueueError> {
        self.in_flight
            .remove(&delivery.id)
            .ok_or(QueueError::UnknownDelivery(delivery.id))?;

        Ok(())
    }

    async fn abandon(&self, delivery: Delivery) -> Result<(), QueueError> {
        self.in_flight
            .remove(&delivery.id)
            .ok_or_else(|| QueueError::UnknownDelivery(delivery.id.clone()))?;

        let channel = self.channel(&delivery.queue);

        channel.pending.lock().await.push_back(Pending {
            delivery_count: delivery.delivery_count,
            message: delivery.message,
        });
        channel.notify.notify_one();

        Ok(())
    }
}
