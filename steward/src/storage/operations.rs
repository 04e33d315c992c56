use crate::storage::{map_sqlx_error, StorageError, MAX_ROW_LIMIT};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, QueryBuilder, Sqlite, SqliteConnection};

const OPERATION_COLUMNS: &str = "id, resource_id, resource_path, resource_version, status, action, \
message, steps, created_when, updated_when, user";

#[derive(Clone, Debug, Default, FromRow)]
pub struct Operation {
    pub id: String,
    pub resource_id: String,
    pub resource_path: String,
    pub resource_version: i64,
    pub status: String,
    pub action: String,
    pub message: String,
    pub steps: String,
    pub created_when: String,
    pub updated_when: String,
    pub user: String,
}

#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub status: Option<String>,
    pub message: Option<String>,
    pub steps: Option<String>,
    pub updated_when: Option<String>,
}

pub async fn insert(
    conn: &mut SqliteConnection,
    operation: &Operation,
) -> Result<(), StorageError> {
    let query = sqlx::query(
        "INSERT INTO operations (id, resource_id, resource_path, resource_version, status, action, \
        message, steps, created_when, updated_when, user) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);",
    )
    .bind(&operation.id)
    .bind(&operation.resource_id)
    .bind(&operation.resource_path)
    .bind(operation.resource_version)
    .bind(&operation.status)
    .bind(&operation.action)
    .bind(&operation.message)
    .bind(&operation.steps)
    .bind(&operation.created_when)
    .bind(&operation.updated_when)
    .bind(&operation.user);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Operation, StorageError> {
    let query_str = format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE id = ?;");
    let query = sqlx::query_as::<_, Operation>(&query_str).bind(id);

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

/// Sorted by creation time, newest first.
pub async fn list_by_resource(
    conn: &mut SqliteConnection,
    resource_id: &str,
    offset: i64,
    limit: i64,
) -> Result<Vec<Operation>, StorageError> {
    let mut limit = limit;

    if limit == 0 || limit > MAX_ROW_LIMIT {
        limit = MAX_ROW_LIMIT;
    }

    let query_str = format!(
        "SELECT {OPERATION_COLUMNS} FROM operations WHERE resource_id = ? \
        ORDER BY created_when DESC, id DESC LIMIT ? OFFSET ?;"
    );

    let query = sqlx::query_as::<_, Operation>(&query_str)
        .bind(resource_id)
        .bind(limit)
        .bind(offset);

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn update(
    conn: &mut SqliteConnection,
    id: &str,
    fields: UpdatableFields,
) -> Result<(), StorageError> {
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new(r#"UPDATE operations SET "#);
    let mut updated_fields_total = 0;

    if let Some(value) = &fields.status {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("status = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.message {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("message = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.steps {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("steps = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.updated_when {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("updated_when = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    // If no fields were updated, return an error
    if updated_fields_total == 0 {
        return Err(StorageError::NoFieldsUpdated);
    }

    update_query.push(" WHERE id = ");
    update_query.push_bind(id);
    update_query.push(";");

    let update_query = update_query.build();

    let sql = update_query.sql();

    let result = update_query
        .execute(conn)
        .await
        .map_err(|e| map_sqlx_error(e, sql))?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}
