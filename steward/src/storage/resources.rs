use crate::storage::{map_sqlx_error, StorageError, MAX_ROW_LIMIT};
use futures::TryFutureExt;
use sqlx::{Execute, FromRow, QueryBuilder, Sqlite, SqliteConnection};

const RESOURCE_COLUMNS: &str = "id, resource_type, template_name, template_version, properties, \
is_enabled, is_active, resource_version, deployment_status, etag, resource_path, workspace_id, \
parent_workspace_service_id, owner_id, updated_when, user";

#[derive(Clone, Debug, Default, FromRow)]
pub struct Resource {
    pub id: String,
    pub resource_type: String,
    pub template_name: String,
    pub template_version: String,
    pub properties: String,
    pub is_enabled: bool,
    pub is_active: bool,
    pub resource_version: i64,
    pub deployment_status: String,
    pub etag: String,
    pub resource_path: String,
    pub workspace_id: Option<String>,
    pub parent_workspace_service_id: Option<String>,
    pub owner_id: Option<String>,
    pub updated_when: String,
    pub user: String,
}

/// Fields that can be changed on a resource without an etag precondition.
#[derive(Clone, Debug, Default)]
pub struct UpdatableFields {
    pub properties: Option<String>,
    pub is_active: Option<bool>,
    pub deployment_status: Option<String>,

    /// Writers that change the document should issue a new etag so holders of the old one lose their race.
    pub etag: Option<String>,
    pub updated_when: Option<String>,
}

pub async fn insert(conn: &mut SqliteConnection, resource: &Resource) -> Result<(), StorageError> {
    let query = sqlx::query(
        "INSERT INTO resources (id, resource_type, template_name, template_version, properties, \
        is_enabled, is_active, resource_version, deployment_status, etag, resource_path, workspace_id, \
        parent_workspace_service_id, owner_id, updated_when, user) \
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);",
    )
    .bind(&resource.id)
    .bind(&resource.resource_type)
    .bind(&resource.template_name)
    .bind(&resource.template_version)
    .bind(&resource.properties)
    .bind(resource.is_enabled)
    .bind(resource.is_active)
    .bind(resource.resource_version)
    .bind(&resource.deployment_status)
    .bind(&resource.etag)
    .bind(&resource.resource_path)
    .bind(&resource.workspace_id)
    .bind(&resource.parent_workspace_service_id)
    .bind(&resource.owner_id)
    .bind(&resource.updated_when)
    .bind(&resource.user);

    let sql = query.sql();

    query
        .execute(conn)
        .map_ok(|_| ())
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Resource, StorageError> {
    let query_str = format!("SELECT {RESOURCE_COLUMNS} FROM resources WHERE id = ?;");
    let query = sqlx::query_as::<_, Resource>(&query_str).bind(id);

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

/// Returns all active resources of a type that were created from the named template.
pub async fn list_active_by_template_name(
    conn: &mut SqliteConnection,
    resource_type: &str,
    template_name: &str,
) -> Result<Vec<Resource>, StorageError> {
    let query_str = format!(
        "SELECT {RESOURCE_COLUMNS} FROM resources WHERE is_active = 1 AND resource_type = ? \
        AND template_name = ? ORDER BY id ASC LIMIT ?;"
    );

    let query = sqlx::query_as::<_, Resource>(&query_str)
        .bind(resource_type)
        .bind(template_name)
        .bind(MAX_ROW_LIMIT);

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

/// Returns all active resources whose path lies strictly below the given path. Sorted deepest path first
/// so that dependents always come before the resources they depend on.
pub async fn list_active_dependents(
    conn: &mut SqliteConnection,
    resource_path: &str,
) -> Result<Vec<Resource>, StorageError> {
    let query_str = format!(
        "SELECT {RESOURCE_COLUMNS} FROM resources WHERE is_active = 1 AND substr(resource_path, 1, ?) = ? \
        ORDER BY length(resource_path) DESC, id ASC LIMIT ?;"
    );

    let prefix = format!("{}/", resource_path.trim_end_matches('/'));

    let query = sqlx::query_as::<_, Resource>(&query_str)
        .bind(prefix.len() as i64)
        .bind(prefix)
        .bind(MAX_ROW_LIMIT);

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
    let mut update_query: QueryBuilder<Sqlite> = QueryBuilder::new(r#"UPDATE resources SET "#);
    let mut updated_fields_total = 0;

    if let Some(value) = &fields.properties {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("properties = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.is_active {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("is_active = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.deployment_status {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("deployment_status = ");
        update_query.push_bind(value);
        updated_fields_total += 1;
    }

    if let Some(value) = &fields.etag {
        if updated_fields_total > 0 {
            update_query.push(", ");
        }
        update_query.push("etag = ");
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

/// Replaces the full resource document, but only if the stored etag still equals `expected_etag`.
/// The caller is responsible for handing in the new etag inside `resource`.
pub async fn update_with_etag(
    conn: &mut SqliteConnection,
    resource: &Resource,
    expected_etag: &str,
) -> Result<(), StorageError> {
    let query = sqlx::query(
        "UPDATE resources SET template_name = ?, template_version = ?, properties = ?, is_enabled = ?, \
        is_active = ?, resource_version = ?, deployment_status = ?, etag = ?, updated_when = ?, user = ? \
        WHERE id = ? AND etag = ?;",
    )
    .bind(&resource.template_name)
    .bind(&resource.template_version)
    .bind(&resource.properties)
    .bind(resource.is_enabled)
    .bind(resource.is_active)
    .bind(resource.resource_version)
    .bind(&resource.deployment_status)
    .bind(&resource.etag)
    .bind(&resource.updated_when)
    .bind(&resource.user)
    .bind(&resource.id)
    .bind(expected_etag);

    let sql = query.sql();

    let result = query
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error(e, sql))?;

    if result.rows_affected() > 0 {
        return Ok(());
    }

    // Nothing matched; tell apart a missing document from a stale etag.
    get(conn, &resource.id).await?;

    Err(StorageError::Conflict(expected_etag.into()))
}
