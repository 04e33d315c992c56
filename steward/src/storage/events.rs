use crate::storage::{map_sqlx_error, StorageError, MAX_ROW_LIMIT};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, SqliteConnection};

#[derive(Clone, Debug, Default, FromRow)]
pub struct Event {
    pub id: String,
    pub kind: String,
    pub details: String,
    pub emitted: String,
}

pub async fn insert(conn: &mut SqliteConnection, event: &Event) -> Result<(), StorageError> {
    let query = sqlx::query("INSERT INTO events (id, kind, details, emitted) VALUES (?, ?, ?, ?);")
        .bind(&event.id)
        .bind(&event.kind)
        .bind(&event.details)
        .bind(&event.emitted);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

/// Sorted by id (which is time ordered) ascending by default.
pub async fn list(
    conn: &mut SqliteConnection,
    offset: i64,
    limit: i64,
    reverse: bool,
) -> Result<Vec<Event>, StorageError> {
    let mut limit = limit;

    if limit == 0 || limit > MAX_ROW_LIMIT {
        limit = MAX_ROW_LIMIT;
    }

    let order_by = if reverse { "DESC" } else { "ASC" };

    let query_str = format!(
        "SELECT id, kind, details, emitted FROM events ORDER BY id {} LIMIT ? OFFSET ?;",
        order_by
    );

    let query = sqlx::query_as::<_, Event>(&query_str)
        .bind(limit)
        .bind(offset);

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn delete(conn: &mut SqliteConnection, id: &str) -> Result<(), StorageError> {
    let query = sqlx::query("DELETE FROM events WHERE id = ?;").bind(id);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}
