use crate::{
    engine::{epoch_milli, resource_templates, EngineState, PipelineError},
    storage,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr};
use strum::{Display, EnumString};
use tracing::{debug, info};
use uuid::Uuid;

/// The closed set of things the engine knows how to deploy.
#[derive(Debug, Clone, Copy, Display, EnumString, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ResourceType {
    Workspace,
    WorkspaceService,
    UserResource,
    SharedService,
}

impl ResourceType {
    /// How many `.parent` hops a substitution token evaluated against a resource of this type may make.
    pub fn max_parent_hops(&self) -> usize {
        match self {
            ResourceType::UserResource => 2,
            ResourceType::WorkspaceService => 1,
            ResourceType::Workspace | ResourceType::SharedService => 0,
        }
    }

    fn path_segment(&self) -> &'static str {
        match self {
            ResourceType::Workspace => "workspaces",
            ResourceType::WorkspaceService => "workspace-services",
            ResourceType::UserResource => "user-resources",
            ResourceType::SharedService => "shared-services",
        }
    }
}

/// The state of a resource deployment, an operation step or a whole operation.
#[derive(
    Debug, Clone, Copy, Display, EnumString, Serialize, Deserialize, PartialEq, Eq, Hash, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Status {
    #[default]
    NotDeployed,
    AwaitingDeployment,
    Deploying,
    Deployed,
    DeploymentFailed,
    AwaitingDeletion,
    Deleting,
    Deleted,
    DeletingFailed,
    AwaitingUpdate,
    Updating,
    Updated,
    UpdatingFailed,
    AwaitingAction,
    InvokingAction,
    ActionSucceeded,
    ActionFailed,
    PipelineDeploying,
    PipelineFailed,
    PipelineSucceeded,
    Failed,
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Status::Deployed | Status::Updated | Status::Deleted | Status::ActionSucceeded
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Status::Failed
                | Status::DeploymentFailed
                | Status::DeletingFailed
                | Status::UpdatingFailed
                | Status::ActionFailed
                | Status::PipelineFailed
        )
    }
}

/// What a caller wants done to a resource. Anything other than the three lifecycle actions is a custom action
/// declared by the resource's template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RequestAction {
    Install,
    Upgrade,
    Uninstall,
    Custom(String),
}

impl RequestAction {
    /// The status and message a step (or operation) starts out with before anything has been dispatched.
    pub fn initial_status(&self) -> (Status, &'static str) {
        match self {
            RequestAction::Install => (Status::AwaitingDeployment, "awaiting deployment"),
            RequestAction::Uninstall => (Status::AwaitingDeletion, "awaiting deletion"),
            RequestAction::Upgrade => (Status::AwaitingUpdate, "awaiting update"),
            RequestAction::Custom(_) => (Status::AwaitingAction, "awaiting action"),
        }
    }

    /// The status recorded when carrying out this action fails.
    pub fn failure_status(&self) -> Status {
        match self {
            RequestAction::Install => Status::DeploymentFailed,
            RequestAction::Uninstall => Status::DeletingFailed,
            RequestAction::Upgrade => Status::UpdatingFailed,
            RequestAction::Custom(_) => Status::ActionFailed,
        }
    }
}

impl fmt::Display for RequestAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestAction::Install => write!(f, "install"),
            RequestAction::Upgrade => write!(f, "upgrade"),
            RequestAction::Uninstall => write!(f, "uninstall"),
            RequestAction::Custom(action) => write!(f, "{action}"),
        }
    }
}

impl From<String> for RequestAction {
    fn from(value: String) -> Self {
        match value.as_str() {
            "install" => RequestAction::Install,
            "upgrade" => RequestAction::Upgrade,
            "uninstall" => RequestAction::Uninstall,
            _ => RequestAction::Custom(value),
        }
    }
}

impl From<RequestAction> for String {
    fn from(value: RequestAction) -> Self {
        value.to_string()
    }
}

impl FromStr for RequestAction {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(RequestAction::from(s.to_string()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: String,
    pub template_name: String,
    pub template_version: String,
    pub resource_type: ResourceType,
    pub properties: Map<String, Value>,
    pub is_enabled: bool,

    /// Turns false once the resource has been reported deleted.
    pub is_active: bool,

    /// Bumped on every patch; never decreases.
    pub resource_version: u64,
    pub deployment_status: Status,
    pub etag: String,
    pub resource_path: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_workspace_service_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,

    /// Time of last modification in epoch milliseconds.
    pub updated_when: u64,
    pub user: User,
}

impl TryFrom<storage::resources::Resource> for Resource {
    type Error = anyhow::Error;

    fn try_from(value: storage::resources::Resource) -> Result<Self> {
        let resource_type = ResourceType::from_str(&value.resource_type).with_context(|| {
            format!(
                "Could not parse field 'resource_type' from storage value '{}'",
                value.resource_type
            )
        })?;

        let properties: Map<String, Value> = serde_json::from_str(&value.properties)
            .with_context(|| {
                format!(
                    "Could not parse field 'properties' from storage value '{}'",
                    value.properties
                )
            })?;

        let resource_version = u64::try_from(value.resource_version).with_context(|| {
            format!(
                "Could not parse field 'resource_version' from storage value '{}'",
                value.resource_version
            )
        })?;

        let deployment_status = Status::from_str(&value.deployment_status).with_context(|| {
            format!(
                "Could not parse field 'deployment_status' from storage value '{}'",
                value.deployment_status
            )
        })?;

        let updated_when = value.updated_when.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'updated_when' from storage value '{}'",
                value.updated_when
            )
        })?;

        let user: User = serde_json::from_str(&value.user).with_context(|| {
            format!(
                "Could not parse field 'user' from storage value '{}'",
                value.user
            )
        })?;

        Ok(Resource {
            id: value.id,
            template_name: value.template_name,
            template_version: value.template_version,
            resource_type,
            properties,
            is_enabled: value.is_enabled,
            is_active: value.is_active,
            resource_version,
            deployment_status,
            etag: value.etag,
            resource_path: value.resource_path,
            workspace_id: value.workspace_id,
            parent_workspace_service_id: value.parent_workspace_service_id,
            owner_id: value.owner_id,
            updated_when,
            user,
        })
    }
}

impl TryFrom<Resource> for storage::resources::Resource {
    type Error = anyhow::Error;

    fn try_from(value: Resource) -> Result<Self> {
        let properties = serde_json::to_string(&value.properties).with_context(|| {
            format!(
                "Could not parse field 'properties' to storage value '{:#?}'",
                value.properties
            )
        })?;

        let resource_version = i64::try_from(value.resource_version).with_context(|| {
            format!(
                "Could not parse field 'resource_version' to storage value '{}'",
                value.resource_version
            )
        })?;

        let user = serde_json::to_string(&value.user).with_context(|| {
            format!(
                "Could not parse field 'user' to storage value '{:#?}'",
                value.user
            )
        })?;

        Ok(Self {
            id: value.id,
            resource_type: value.resource_type.to_string(),
            template_name: value.template_name,
            template_version: value.template_version,
            properties,
            is_enabled: value.is_enabled,
            is_active: value.is_active,
            resource_version,
            deployment_status: value.deployment_status.to_string(),
            etag: value.etag,
            resource_path: value.resource_path,
            workspace_id: value.workspace_id,
            parent_workspace_service_id: value.parent_workspace_service_id,
            owner_id: value.owner_id,
            updated_when: value.updated_when.to_string(),
            user,
        })
    }
}

/// The resources above a primary resource that substitution tokens may reach with `.parent` hops.
#[derive(Debug, Clone, Default)]
pub struct Ancestry {
    /// One hop up: the parent workspace service of a user resource, or the workspace of a workspace service.
    pub parent: Option<Resource>,

    /// Two hops up: the workspace of a user resource.
    pub grandparent: Option<Resource>,
}

/// The caller supplied part of a new resource.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewResource {
    #[serde(default)]
    pub id: Option<String>,
    pub resource_type: ResourceType,
    pub template_name: String,

    #[serde(default)]
    pub properties: Map<String, Value>,

    #[serde(default)]
    pub workspace_id: Option<String>,

    #[serde(default)]
    pub parent_workspace_service_id: Option<String>,

    #[serde(default)]
    pub owner_id: Option<String>,
}

/// Builds the hierarchical path of a resource from its own id and its parent references.
pub fn build_resource_path(
    resource_type: ResourceType,
    id: &str,
    workspace_id: Option<&str>,
    parent_workspace_service_id: Option<&str>,
) -> Result<String, PipelineError> {
    let missing = |field: &str| {
        PipelineError::Validation(format!(
            "a resource of type '{resource_type}' requires '{field}' to be set"
        ))
    };

    let path = match resource_type {
        ResourceType::Workspace | ResourceType::SharedService => {
            format!("/{}/{id}", resource_type.path_segment())
        }
        ResourceType::WorkspaceService => {
            let workspace_id = workspace_id.ok_or_else(|| missing("workspaceId"))?;
            format!(
                "/{}/{workspace_id}/{}/{id}",
                ResourceType::Workspace.path_segment(),
                resource_type.path_segment()
            )
        }
        ResourceType::UserResource => {
            let workspace_id = workspace_id.ok_or_else(|| missing("workspaceId"))?;
            let service_id =
                parent_workspace_service_id.ok_or_else(|| missing("parentWorkspaceServiceId"))?;
            format!(
                "/{}/{workspace_id}/{}/{service_id}/{}/{id}",
                ResourceType::Workspace.path_segment(),
                ResourceType::WorkspaceService.path_segment(),
                resource_type.path_segment()
            )
        }
    };

    Ok(path)
}

fn internal(e: anyhow::Error) -> PipelineError {
    PipelineError::Internal(format!("{e:#}"))
}

pub async fn get_resource(state: &EngineState, id: &str) -> Result<Resource, PipelineError> {
    let mut conn = state.storage.read_conn().await?;

    let storage_resource = storage::resources::get(&mut conn, id)
        .await
        .map_err(|e| match e {
            storage::StorageError::NotFound => {
                PipelineError::NotFound(format!("resource '{id}' does not exist"))
            }
            _ => e.into(),
        })?;

    Resource::try_from(storage_resource).map_err(internal)
}

/// Returns the single active resource of the given type created from the named template. Anything other than
/// exactly one match is a configuration error since the caller expects a singleton.
pub async fn get_singleton_by_template_name(
    state: &EngineState,
    resource_type: ResourceType,
    template_name: &str,
) -> Result<Resource, PipelineError> {
    let mut conn = state.storage.read_conn().await?;

    let mut matches = storage::resources::list_active_by_template_name(
        &mut conn,
        &resource_type.to_string(),
        template_name,
    )
    .await?;

    match matches.len() {
        1 => Resource::try_from(matches.remove(0)).map_err(internal),
        0 => Err(PipelineError::Configuration(format!(
            "no active {resource_type} created from template '{template_name}' exists"
        ))),
        total => Err(PipelineError::Configuration(format!(
            "expected a single active {resource_type} created from template '{template_name}' but found {total}"
        ))),
    }
}

/// Returns the active resources that live below the given resource, deepest first.
pub async fn list_dependents(
    state: &EngineState,
    resource: &Resource,
) -> Result<Vec<Resource>, PipelineError> {
    let mut conn = state.storage.read_conn().await?;

    let dependents =
        storage::resources::list_active_dependents(&mut conn, &resource.resource_path).await?;

    dependents
        .into_iter()
        .map(|r| Resource::try_from(r).map_err(internal))
        .collect()
}

fn parent_reference<'a>(
    resource: &'a Resource,
    field: &str,
    value: &'a Option<String>,
) -> Result<&'a str, PipelineError> {
    value.as_deref().ok_or_else(|| {
        PipelineError::Configuration(format!(
            "{} '{}' has no '{field}' reference",
            resource.resource_type, resource.id
        ))
    })
}

/// Returns the workspace a workspace service or user resource lives in.
pub async fn get_parent_workspace(
    state: &EngineState,
    resource: &Resource,
) -> Result<Resource, PipelineError> {
    let workspace_id = parent_reference(resource, "workspaceId", &resource.workspace_id)?;
    get_resource(state, workspace_id).await
}

/// Returns the workspace service a user resource lives under.
pub async fn get_parent_workspace_service(
    state: &EngineState,
    resource: &Resource,
) -> Result<Resource, PipelineError> {
    let service_id = parent_reference(
        resource,
        "parentWorkspaceServiceId",
        &resource.parent_workspace_service_id,
    )?;
    get_resource(state, service_id).await
}

pub async fn load_ancestry(
    state: &EngineState,
    resource: &Resource,
) -> Result<Ancestry, PipelineError> {
    match resource.resource_type {
        ResourceType::UserResource => Ok(Ancestry {
            parent: Some(get_parent_workspace_service(state, resource).await?),
            grandparent: Some(get_parent_workspace(state, resource).await?),
        }),
        ResourceType::WorkspaceService => Ok(Ancestry {
            parent: Some(get_parent_workspace(state, resource).await?),
            grandparent: None,
        }),
        ResourceType::Workspace | ResourceType::SharedService => Ok(Ancestry::default()),
    }
}

/// User resource templates are registered per workspace service template; every other kind has no parent
/// service name.
pub async fn parent_service_name(
    state: &EngineState,
    resource: &Resource,
) -> Result<Option<String>, PipelineError> {
    if resource.resource_type != ResourceType::UserResource {
        return Ok(None);
    }

    let service = get_parent_workspace_service(state, resource).await?;
    Ok(Some(service.template_name))
}

async fn validate_parents(state: &EngineState, new: &NewResource) -> Result<(), PipelineError> {
    let expect_type = |resource: &Resource, expected: ResourceType| {
        if resource.resource_type != expected {
            return Err(PipelineError::Validation(format!(
                "parent '{}' is a {} but a {expected} was expected",
                resource.id, resource.resource_type
            )));
        }

        if !resource.is_active {
            return Err(PipelineError::Validation(format!(
                "parent '{}' has been deleted",
                resource.id
            )));
        }

        Ok(())
    };

    let not_found_as_validation = |e: PipelineError| match e {
        PipelineError::NotFound(msg) => PipelineError::Validation(msg),
        other => other,
    };

    if let Some(workspace_id) = &new.workspace_id {
        let workspace = get_resource(state, workspace_id)
            .await
            .map_err(not_found_as_validation)?;
        expect_type(&workspace, ResourceType::Workspace)?;
    }

    if let Some(service_id) = &new.parent_workspace_service_id {
        let service = get_resource(state, service_id)
            .await
            .map_err(not_found_as_validation)?;
        expect_type(&service, ResourceType::WorkspaceService)?;

        if service.workspace_id != new.workspace_id {
            return Err(PipelineError::Validation(format!(
                "workspace service '{service_id}' does not belong to workspace '{}'",
                new.workspace_id.clone().unwrap_or_default()
            )));
        }
    }

    Ok(())
}

/// Creates a resource from the current version of its template. Template defaults are filled in for any
/// property the caller left out and the result must satisfy the template's schema.
pub async fn create_resource(
    state: &EngineState,
    new: NewResource,
    user: &User,
) -> Result<Resource, PipelineError> {
    let id = new.id.clone().unwrap_or_else(|| Uuid::now_v7().to_string());

    let resource_path = build_resource_path(
        new.resource_type,
        &id,
        new.workspace_id.as_deref(),
        new.parent_workspace_service_id.as_deref(),
    )?;

    validate_parents(state, &new).await?;

    let parent_service_name = match &new.parent_workspace_service_id {
        Some(service_id) if new.resource_type == ResourceType::UserResource => {
            Some(get_resource(state, service_id).await?.template_name)
        }
        _ => None,
    };

    let template = resource_templates::get_current_template(
        state,
        &new.template_name,
        new.resource_type,
        parent_service_name.as_deref(),
    )
    .await?;

    let mut properties = template.default_properties();
    properties.extend(new.properties);

    template.validate_properties(&properties, &RequestAction::Install)?;
    template.check_required(&properties)?;

    let resource = Resource {
        id: id.clone(),
        template_name: template.name.clone(),
        template_version: template.version.clone(),
        resource_type: new.resource_type,
        properties,
        is_enabled: true,
        is_active: true,
        resource_version: 0,
        deployment_status: Status::NotDeployed,
        etag: Uuid::now_v7().to_string(),
        resource_path,
        workspace_id: new.workspace_id,
        parent_workspace_service_id: new.parent_workspace_service_id,
        owner_id: new.owner_id,
        updated_when: epoch_milli(),
        user: user.clone(),
    };

    let storage_resource = storage::resources::Resource::try_from(resource.clone()).map_err(internal)?;

    let mut conn = state.storage.write_conn().await?;

    storage::resources::insert(&mut conn, &storage_resource)
        .await
        .map_err(|e| match e {
            storage::StorageError::Exists => {
                PipelineError::Validation(format!("resource '{id}' already exists"))
            }
            _ => e.into(),
        })?;

    info!(
        resource_id = resource.id,
        resource_type = %resource.resource_type,
        template = resource.template_name,
        version = resource.template_version,
        "created resource"
    );

    Ok(resource)
}

/// Sets the deployment status of a resource without an etag precondition. The etag is still rotated, so a
/// writer holding a copy read before the status change fails its precondition instead of reverting it.
pub async fn set_deployment_status(
    state: &EngineState,
    id: &str,
    status: Status,
) -> Result<(), PipelineError> {
    let mut conn = state.storage.write_conn().await?;

    storage::resources::update(
        &mut conn,
        id,
        storage::resources::UpdatableFields {
            deployment_status: Some(status.to_string()),
            etag: Some(Uuid::now_v7().to_string()),
            updated_when: Some(epoch_milli().to_string()),
            ..Default::default()
        },
    )
    .await?;

    debug!(resource_id = id, status = %status, "updated resource deployment status");
    Ok(())
}

/// Writes the full resource back, but only if nobody changed it since `expected_etag` was read. A successful
/// write issues a new etag which is set on the returned resource.
pub async fn replace_resource(
    state: &EngineState,
    mut resource: Resource,
    expected_etag: &str,
) -> Result<Resource, PipelineError> {
    resource.etag = Uuid::now_v7().to_string();
    resource.updated_when = epoch_milli();

    let storage_resource = storage::resources::Resource::try_from(resource.clone()).map_err(internal)?;

    let mut conn = state.storage.write_conn().await?;
    storage::resources::update_with_etag(&mut conn, &storage_resource, expected_etag).await?;

    Ok(resource)
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use rstest::rstest;

    /// Inserts a resource row directly, skipping template lookups.
    pub async fn insert_resource(state: &EngineState, resource: &Resource) {
        let mut conn = state.storage.write_conn().await.unwrap();
        storage::resources::insert(
            &mut conn,
            &storage::resources::Resource::try_from(resource.clone()).unwrap(),
        )
        .await
        .unwrap();
    }

    /// A resource with a correct path for its type. Workspace services and user resources are placed under
    /// the given parents.
    pub fn test_resource(
        id: &str,
        resource_type: ResourceType,
        template_name: &str,
        workspace_id: Option<&str>,
        service_id: Option<&str>,
    ) -> Resource {
        Resource {
            id: id.into(),
            template_name: template_name.into(),
            template_version: "1.0.0".into(),
            resource_type,
            properties: Map::new(),
            is_enabled: true,
            is_active: true,
            resource_version: 0,
            deployment_status: Status::NotDeployed,
            etag: format!("{id}-etag"),
            resource_path: build_resource_path(resource_type, id, workspace_id, service_id)
                .unwrap(),
            workspace_id: workspace_id.map(String::from),
            parent_workspace_service_id: service_id.map(String::from),
            owner_id: None,
            updated_when: 0,
            user: User::default(),
        }
    }

    #[rstest]
    #[case(RequestAction::Install, Status::AwaitingDeployment, Status::DeploymentFailed)]
    #[case(RequestAction::Uninstall, Status::AwaitingDeletion, Status::DeletingFailed)]
    #[case(RequestAction::Upgrade, Status::AwaitingUpdate, Status::UpdatingFailed)]
    #[case(RequestAction::Custom("restart".into()), Status::AwaitingAction, Status::ActionFailed)]
    fn test_action_status_mapping(
        #[case] action: RequestAction,
        #[case] initial: Status,
        #[case] failure: Status,
    ) {
        assert_eq!(action.initial_status().0, initial);
        assert_eq!(action.failure_status(), failure);
        assert_eq!(RequestAction::from(action.to_string()), action);
    }

    #[rstest]
    #[case(ResourceType::Workspace, None, None, "/workspaces/r1")]
    #[case(ResourceType::SharedService, None, None, "/shared-services/r1")]
    #[case(
        ResourceType::WorkspaceService,
        Some("ws"),
        None,
        "/workspaces/ws/workspace-services/r1"
    )]
    #[case(
        ResourceType::UserResource,
        Some("ws"),
        Some("svc"),
        "/workspaces/ws/workspace-services/svc/user-resources/r1"
    )]
    fn test_build_resource_path(
        #[case] resource_type: ResourceType,
        #[case] workspace_id: Option<&str>,
        #[case] service_id: Option<&str>,
        #[case] expected: &str,
    ) {
        assert_eq!(
            build_resource_path(resource_type, "r1", workspace_id, service_id).unwrap(),
            expected
        );
    }

    #[test]
    fn test_build_resource_path_requires_parents() {
        assert!(matches!(
            build_resource_path(ResourceType::UserResource, "r1", Some("ws"), None),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn test_resource_serializes_camel_case() {
        let resource = test_resource(
            "svc1",
            ResourceType::WorkspaceService,
            "guacamole",
            Some("ws1"),
            None,
        );

        let value = serde_json::to_value(&resource).unwrap();
        assert_eq!(value["templateName"], "guacamole");
        assert_eq!(value["resourceType"], "workspace-service");
        assert_eq!(value["workspaceId"], "ws1");
        assert_eq!(value["deploymentStatus"], "not_deployed");
        assert!(value.get("ownerId").is_none());
    }

    #[test]
    fn test_storage_round_trip_keeps_fields() {
        let mut resource = test_resource(
            "ur1",
            ResourceType::UserResource,
            "vm",
            Some("ws1"),
            Some("svc1"),
        );
        resource
            .properties
            .insert("size".into(), Value::String("large".into()));

        let stored = storage::resources::Resource::try_from(resource.clone()).unwrap();
        assert_eq!(stored.resource_type, "user-resource");

        assert_eq!(Resource::try_from(stored).unwrap(), resource);
    }

    #[tokio::test]
    async fn test_status_change_invalidates_earlier_reads() {
        let engine = crate::engine::tests::TestEngine::new().await;
        let state = &engine.state;

        let firewall = test_resource("fw1", ResourceType::SharedService, "firewall", None, None);
        insert_resource(state, &firewall).await;

        let before = get_resource(state, "fw1").await.unwrap();
        set_deployment_status(state, "fw1", Status::Updated)
            .await
            .unwrap();

        let mirrored = get_resource(state, "fw1").await.unwrap();
        assert_ne!(mirrored.etag, before.etag);

        let stale_etag = before.etag.clone();
        let err = replace_resource(state, before, &stale_etag)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ConcurrencyConflict(_)));

        let stored = get_resource(state, "fw1").await.unwrap();
        assert_eq!(stored.deployment_status, Status::Updated);
    }
}
