use super::{Delivery, Queue, QueueError, QueueMessage};
use crate::storage::{self, StorageError};
use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::trace;
use uuid::Uuid;

fn epoch_milli() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn map_storage_error(e: StorageError, delivery_id: &str) -> QueueError {
    match e {
        StorageError::NotFound => QueueError::UnknownDelivery(delivery_id.to_string()),
        StorageError::Connection(_) => QueueError::Connection(e.to_string()),
        _ => QueueError::Unknown(e.to_string()),
    }
}

/// A queue kept in the engine's own database so that separate processes sharing the database file see the
/// same messages. Receivers poll; a delivery is hidden for `lock_duration` and becomes visible again if it is
/// not settled in that time.
#[derive(Debug)]
pub struct Sqlite {
    db: storage::Db,
    lock_duration: Duration,
    poll_interval: Duration,
}

impl Sqlite {
    pub fn new(db: storage::Db, lock_duration: Duration, poll_interval: Duration) -> Self {
        Self {
            db,
            lock_duration,
            poll_interval,
        }
    }
}

#[async_trait]
impl Queue for Sqlite {
    async fn send(&self, queue: &str, message: QueueMessage) -> Result<(), QueueError> {
        let mut conn = self
            .db
            .write_conn()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        storage::queue_messages::insert(
            &mut conn,
            &storage::queue_messages::QueueMessage {
                id: Uuid::now_v7().to_string(),
                queue: queue.to_string(),
                body: message.body,
                correlation_id: message.correlation_id,
                session_id: message.session_id,
                ..Default::default()
            },
        )
        .await
        .map_err(|e| map_storage_error(e, ""))?;

        trace!(queue = queue, "message enqueued");
        Ok(())
    }

    async fn receive(
        &self,
        queue: &str,
        max_wait: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            let delivery_id = Uuid::now_v7().to_string();
            let now = epoch_milli();

            let claimed = {
                let mut conn = self
                    .db
                    .write_conn()
                    .await
                    .map_err(|e| QueueError::Connection(e.to_string()))?;

                storage::queue_messages::claim_next(
                    &mut conn,
                    queue,
                    now,
                    now + self.lock_duration.as_millis() as i64,
                    &delivery_id,
                )
                .await
                .map_err(|e| map_storage_error(e, &delivery_id))?
            };

            if let Some(claimed) = claimed {
                return Ok(Some(Delivery {
                    id: delivery_id,
                    queue: claimed.queue,
                    delivery_count: claimed.delivery_count as u32,
                    message: QueueMessage {
                        body: claimed.body,
                        correlation_id: claimed.correlation_id,
                        session_id: claimed.session_id,
                    },
                }));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn complete(&self, delivery: Delivery) -> Result<(), QueueError> {
        let mut conn = self
            .db
            .write_conn()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        storage::queue_messages::delete_delivered(&mut conn, &delivery.id)
            .await
            .map_err(|e| map_storage_error(e, &delivery.id))
    }

    async fn abandon(&self, delivery: Delivery) -> Result<(), QueueError> {
        let mut conn = self
            .db
            .write_conn()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        storage::queue_messages::release(&mut conn, &delivery.id)
            .await
            .map_err(|e| map_storage_error(e, &delivery.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::TestHarness;
    use pretty_assertions::assert_eq;

    fn message(body: &str) -> QueueMessage {
        QueueMessage {
            body: body.into(),
            correlation_id: "op1".into(),
            session_id: "res1".into(),
        }
    }

    #[tokio::test]
    async fn test_messages_are_shared_through_the_database() {
        let harness = TestHarness::new().await;
        let sender = Sqlite::new(
            harness.db.clone(),
            Duration::from_secs(60),
            Duration::from_millis(10),
        );
        let receiver = Sqlite::new(
            harness.db.clone(),
            Duration::from_secs(60),
            Duration::from_millis(10),
        );

        sender.send("status", message("first")).await.unwrap();
        sender.send("status", message("second")).await.unwrap();

        let first = receiver
            .receive("status", Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.message, message("first"));
        assert_eq!(first.delivery_count, 1);

        receiver.abandon(first).await.unwrap();

        let second = receiver
            .receive("status", Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.message.body, "second");
        receiver.complete(second.clone()).await.unwrap();

        let redelivered = receiver
            .receive("status", Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(redelivered.message.body, "first");
        assert_eq!(redelivered.delivery_count, 2);

        let err = receiver.complete(second.clone()).await.unwrap_err();
        assert_eq!(err, QueueError::UnknownDelivery(second.id));
    }

    #[tokio::test]
    async fn test_receive_times_out_when_empty() {
        let harness = TestHarness::new().await;
        let queue = Sqlite::new(
            harness.db.clone(),
            Duration::from_secs(60),
            Duration::from_millis(10),
        );

        let started = tokio::time::Instant::now();
        let delivery = queue
            .receive("status", Duration::from_millis(40))
            .await
            .unwrap();

        assert!(delivery.is_none());
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
