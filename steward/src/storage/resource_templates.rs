use crate::storage::{map_sqlx_error, StorageError, MAX_ROW_LIMIT};
use futures::TryFutureExt;
use sqlx::{Acquire, Execute, FromRow, SqliteConnection};

const TEMPLATE_COLUMNS: &str = "id, name, version, resource_type, parent_service_name, current, title, \
description, required, properties, additional_properties, pipeline, custom_actions";

#[derive(Clone, Debug, Default, FromRow)]
pub struct ResourceTemplate {
    pub id: String,
    pub name: String,
    pub version: String,
    pub resource_type: String,

    /// Only populated for user resource templates; empty string otherwise.
    pub parent_service_name: String,
    pub current: bool,
    pub title: String,
    pub description: String,
    pub required: String,
    pub properties: String,
    pub additional_properties: bool,
    pub pipeline: String,
    pub custom_actions: String,
}

/// Inserts a template. If the template is marked current, every other version of the same
/// (name, resource_type, parent_service_name) loses its current flag within the same transaction.
pub async fn insert(
    conn: &mut SqliteConnection,
    template: &ResourceTemplate,
) -> Result<(), StorageError> {
    let mut tx = conn
        .begin()
        .await
        .map_err(|e| map_sqlx_error(e, "BEGIN;"))?;

    if template.current {
        let query = sqlx::query(
            "UPDATE resource_templates SET current = 0 WHERE name = ? AND resource_type = ? \
            AND parent_service_name = ?;",
        )
        .bind(&template.name)
        .bind(&template.resource_type)
        .bind(&template.parent_service_name);

        let sql = query.sql();

        query
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(e, sql))?;
    }

    let query = sqlx::query(
        "INSERT INTO resource_templates (id, name, version, resource_type, parent_service_name, current, \
        title, description, required, properties, additional_properties, pipeline, custom_actions) \
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);",
    )
    .bind(&template.id)
    .bind(&template.name)
    .bind(&template.version)
    .bind(&template.resource_type)
    .bind(&template.parent_service_name)
    .bind(template.current)
    .bind(&template.title)
    .bind(&template.description)
    .bind(&template.required)
    .bind(&template.properties)
    .bind(template.additional_properties)
    .bind(&template.pipeline)
    .bind(&template.custom_actions);

    let sql = query.sql();

    query
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(e, sql))?;

    tx.commit()
        .await
        .map_err(|e| map_sqlx_error(e, "COMMIT;"))
}

/// Returns the template version marked current. More than one current version is reported as an internal
/// error since registration should never allow it.
pub async fn get_current(
    conn: &mut SqliteConnection,
    name: &str,
    resource_type: &str,
    parent_service_name: &str,
) -> Result<ResourceTemplate, StorageError> {
    let query_str = format!(
        "SELECT {TEMPLATE_COLUMNS} FROM resource_templates WHERE name = ? AND resource_type = ? \
        AND parent_service_name = ? AND current = 1;"
    );

    let query = sqlx::query_as::<_, ResourceTemplate>(&query_str)
        .bind(name)
        .bind(resource_type)
        .bind(parent_service_name);

    let sql = query.sql();

    let mut templates = query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await?;

    match templates.len() {
        0 => Err(StorageError::NotFound),
        1 => Ok(templates.remove(0)),
        _ => Err(StorageError::Internal(format!(
            "found more than one current template for '{name}' of type '{resource_type}'"
        ))),
    }
}

pub async fn get_by_name_and_version(
    conn: &mut SqliteConnection,
    name: &str,
    version: &str,
    resource_type: &str,
    parent_service_name: &str,
) -> Result<ResourceTemplate, StorageError> {
    let query_str = format!(
        "SELECT {TEMPLATE_COLUMNS} FROM resource_templates WHERE name = ? AND version = ? \
        AND resource_type = ? AND parent_service_name = ?;"
    );

    let query = sqlx::query_as::<_, ResourceTemplate>(&query_str)
        .bind(name)
        .bind(version)
        .bind(resource_type)
        .bind(parent_service_name);

    let sql = query.sql();

    query
        .fetch_one(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

/// Lists all versions of a template, newest registration first.
pub async fn list_versions(
    conn: &mut SqliteConnection,
    name: &str,
    resource_type: &str,
) -> Result<Vec<ResourceTemplate>, StorageError> {
    let query_str = format!(
        "SELECT {TEMPLATE_COLUMNS} FROM resource_templates WHERE name = ? AND resource_type = ? \
        ORDER BY id DESC LIMIT ?;"
    );

    let query = sqlx::query_as::<_, ResourceTemplate>(&query_str)
        .bind(name)
        .bind(resource_type)
        .bind(MAX_ROW_LIMIT);

    let sql = query.sql();

    query
        .fetch_all(conn)
        .map_err(|e| map_sqlx_error(e, sql))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::TestHarness;

    fn test_template(id: &str, version: &str, current: bool) -> ResourceTemplate {
        ResourceTemplate {
            id: id.into(),
            name: "base".into(),
            version: version.into(),
            resource_type: "workspace".into(),
            parent_service_name: "".into(),
            current,
            title: "Base workspace".into(),
            description: "A base workspace".into(),
            required: "[]".into(),
            properties: "{}".into(),
            additional_properties: false,
            pipeline: "{}".into(),
            custom_actions: "[]".into(),
        }
    }

    #[tokio::test]
    async fn test_current_flag_moves_to_newest_current_version() {
        let harness = TestHarness::new().await;
        let mut conn = harness.write_conn().await.unwrap();

        insert(&mut conn, &test_template("01", "1.0.0", true))
            .await
            .expect("Failed to insert template");
        insert(&mut conn, &test_template("02", "2.0.0", true))
            .await
            .expect("Failed to insert template");

        let current = get_current(&mut conn, "base", "workspace", "")
            .await
            .expect("Failed to get current template");
        assert_eq!(current.version, "2.0.0");

        let old = get_by_name_and_version(&mut conn, "base", "1.0.0", "workspace", "")
            .await
            .expect("Failed to get template by version");
        assert!(!old.current);

        let versions = list_versions(&mut conn, "base", "workspace").await.unwrap();
        assert_eq!(versions.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_version_is_rejected() {
        let harness = TestHarness::new().await;
        let mut conn = harness.write_conn().await.unwrap();

        insert(&mut conn, &test_template("01", "1.0.0", true))
            .await
            .unwrap();

        let err = insert(&mut conn, &test_template("02", "1.0.0", true))
            .await
            .unwrap_err();
        assert_eq!(err, StorageError::Exists);

        // The failed insert must not have cleared the existing current flag.
        let current = get_current(&mut conn, "base", "workspace", "").await.unwrap();
        assert_eq!(current.id, "01");
    }

    #[tokio::test]
    async fn test_get_current_missing() {
        let harness = TestHarness::new().await;
        let mut conn = harness.write_conn().await.unwrap();

        assert_eq!(
            get_current(&mut conn, "base", "workspace", "")
                .await
                .unwrap_err(),
            StorageError::NotFound
        );
    }
}
