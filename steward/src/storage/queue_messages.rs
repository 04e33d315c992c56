use crate::storage::{map_sqlx_error, StorageError};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, SqliteConnection};

const MESSAGE_COLUMNS: &str =
    "id, queue, body, correlation_id, session_id, delivery_count, delivery_id, locked_until, position";

/// Places a message at the back of its queue by giving it the next position.
const NEXT_POSITION: &str = "(SELECT COALESCE(MAX(position), 0) + 1 FROM queue_messages)";

#[derive(Clone, Debug, Default, FromRow)]
pub struct QueueMessage {
    pub id: String,
    pub queue: String,
    pub body: String,
    pub correlation_id: String,
    pub session_id: String,
    pub delivery_count: i64,

    /// Identifies the current delivery while the message is handed out; empty otherwise.
    pub delivery_id: String,

    /// Epoch milliseconds until which the message is hidden from other receivers.
    pub locked_until: i64,
    pub position: i64,
}

pub async fn insert(conn: &mut SqliteConnection, message: &QueueMessage) -> Result<(), StorageError> {
    let query_str = format!(
        "INSERT INTO queue_messages (id, queue, body, correlation_id, session_id, delivery_count, delivery_id, \
        locked_until, position) VALUES (?, ?, ?, ?, ?, 0, '', 0, {NEXT_POSITION});"
    );

    let query = sqlx::query(&query_str)
        .bind(&message.id)
        .bind(&message.queue)
        .bind(&message.body)
        .bind(&message.correlation_id)
        .bind(&message.session_id);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

/// Hands out the first visible message on the queue and hides it until `locked_until`. A message whose lock ran
/// out without being settled becomes visible again.
pub async fn claim_next(
    conn: &mut SqliteConnection,
    queue: &str,
    now: i64,
    locked_until: i64,
    delivery_id: &str,
) -> Result<Option<QueueMessage>, StorageError> {
    let query_str = format!(
        "UPDATE queue_messages SET delivery_id = ?, locked_until = ?, delivery_count = delivery_count + 1 \
        WHERE id = (SELECT id FROM queue_messages WHERE queue = ? AND locked_until <= ? \
        ORDER BY position ASC LIMIT 1) RETURNING {MESSAGE_COLUMNS};"
    );

    let query = sqlx::query_as::<_, QueueMessage>(&query_str)
        .bind(delivery_id)
        .bind(locked_until)
        .bind(queue)
        .bind(now);

    let sql = query.sql();

    query
        .fetch_optional(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

/// Removes a handed out message for good.
pub async fn delete_delivered(
    conn: &mut SqliteConnection,
    delivery_id: &str,
) -> Result<(), StorageError> {
    let query = sqlx::query("DELETE FROM queue_messages WHERE delivery_id = ? AND delivery_id != '';")
        .bind(delivery_id);

    let sql = query.sql();

    let result = query
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}

/// Makes a handed out message visible again, behind everything already waiting on its queue.
pub async fn release(conn: &mut SqliteConnection, delivery_id: &str) -> Result<(), StorageError> {
    let query_str = format!(
        "UPDATE queue_messages SET delivery_id = '', locked_until = 0, position = {NEXT_POSITION} \
        WHERE delivery_id = ? AND delivery_id != '';"
    );

    let query = sqlx::query(&query_str).bind(delivery_id);

    let sql = query.sql();

    let result = query
        .execute(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}
