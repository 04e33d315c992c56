use crate::{
    engine::{
        epoch_milli,
        event_utils::Kind,
        resource_templates::{self, PipelineStep, ResourceTemplate, MAIN_STEP_ID},
        resources::{self, RequestAction, Resource, ResourceType, Status, User},
        EngineState, PipelineError,
    },
    storage,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

/// A single unit of work within an operation; it targets exactly one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OperationStep {
    /// Unique identifier for this step. Sent along with resource requests so status updates can find it again.
    pub id: String,

    /// The step id as declared in the template pipeline; "main" for the resource the pipeline belongs to.
    pub template_step_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_title: Option<String>,

    pub resource_id: String,
    pub resource_template_name: String,
    pub resource_type: ResourceType,
    pub resource_action: RequestAction,
    pub status: Status,
    pub message: String,

    /// Time of last modification in epoch milliseconds.
    pub updated_when: u64,

    /// The resource whose template declared this step. Substitution tokens are resolved against it.
    pub source_template_resource_id: String,
}

impl OperationStep {
    pub fn is_main(&self) -> bool {
        self.template_step_id == MAIN_STEP_ID
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }
}

/// One user triggered lifecycle action against a root resource. The list of steps is fixed once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub resource_id: String,
    pub resource_path: String,
    pub resource_version: u64,
    pub status: Status,
    pub action: RequestAction,
    pub message: String,
    pub steps: Vec<OperationStep>,

    /// Time of creation in epoch milliseconds.
    pub created_when: u64,

    /// Time of last modification in epoch milliseconds.
    pub updated_when: u64,
    pub user: User,
}

impl TryFrom<storage::operations::Operation> for Operation {
    type Error = anyhow::Error;

    fn try_from(value: storage::operations::Operation) -> Result<Self> {
        let resource_version = u64::try_from(value.resource_version).with_context(|| {
            format!(
                "Could not parse field 'resource_version' from storage value '{}'",
                value.resource_version
            )
        })?;

        let status = Status::from_str(&value.status).with_context(|| {
            format!(
                "Could not parse field 'status' from storage value '{}'",
                value.status
            )
        })?;

        let steps: Vec<OperationStep> = serde_json::from_str(&value.steps).with_context(|| {
            format!(
                "Could not parse field 'steps' from storage value '{}'",
                value.steps
            )
        })?;

        let created_when = value.created_when.parse::<u64>().with_context(|| {
            format!(
                "Could not parse field 'created_when' from storage value '{}'",
                value.created_when
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

        Ok(Operation {
            id: value.id,
            resource_id: value.resource_id,
            resource_path: value.resource_path,
            resource_version,
            status,
            action: RequestAction::from(value.action),
            message: value.message,
            steps,
            created_when,
            updated_when,
            user,
        })
    }
}

impl TryFrom<Operation> for storage::operations::Operation {
    type Error = anyhow::Error;

    fn try_from(value: Operation) -> Result<Self> {
        let resource_version = i64::try_from(value.resource_version).with_context(|| {
            format!(
                "Could not parse field 'resource_version' to storage value '{}'",
                value.resource_version
            )
        })?;

        let steps = serde_json::to_string(&value.steps).with_context(|| {
            format!(
                "Could not parse field 'steps' to storage value '{:#?}'",
                value.steps
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
            resource_id: value.resource_id,
            resource_path: value.resource_path,
            resource_version,
            status: value.status.to_string(),
            action: value.action.to_string(),
            message: value.message,
            steps,
            created_when: value.created_when.to_string(),
            updated_when: value.updated_when.to_string(),
            user,
        })
    }
}

impl Operation {
    /// Finds the step a status update refers to. The unique step id wins; older producers only know the
    /// template step id and the target resource, so that pair is tried next.
    pub fn find_step(&self, step_id: &str, resource_id: &str) -> Option<usize> {
        self.steps
            .iter()
            .position(|step| step.id == step_id)
            .or_else(|| {
                self.steps.iter().position(|step| {
                    step.template_step_id == step_id && step.resource_id == resource_id
                })
            })
    }

    /// The resource the operation was requested for; it owns the first main step.
    pub fn primary_step(&self) -> Option<&OperationStep> {
        self.steps
            .iter()
            .find(|step| step.is_main() && step.resource_id == self.resource_id)
            .or_else(|| self.steps.iter().find(|step| step.is_main()))
    }

    pub fn is_multi_step(&self) -> bool {
        self.steps.len() > 1
    }

    /// Recomputes the aggregate status after the step at `processed` changed.
    ///
    /// Single step operations mirror their step exactly. Multi-step operations report pipeline progress and
    /// never leave PipelineSucceeded or PipelineFailed once reached.
    pub fn update_aggregate_status(&mut self, processed: usize) {
        let Some(step) = self.steps.get(processed) else {
            return;
        };

        if !self.is_multi_step() {
            self.status = step.status;
            self.message = step.message.clone();
            return;
        }

        if matches!(
            self.status,
            Status::PipelineSucceeded | Status::PipelineFailed
        ) {
            return;
        }

        let is_last = processed + 1 == self.steps.len();

        let (status, message) = if step.is_failure() {
            (
                Status::PipelineFailed,
                format!(
                    "pipeline failed at step '{}': {}",
                    step.template_step_id, step.message
                ),
            )
        } else if step.is_success() && is_last {
            (Status::PipelineSucceeded, "pipeline succeeded".to_string())
        } else {
            (Status::PipelineDeploying, "pipeline deploying".to_string())
        };

        self.status = status;
        self.message = message;
    }

    /// Whether the aggregate status will no longer change.
    pub fn is_complete(&self) -> bool {
        if self.is_multi_step() {
            return matches!(
                self.status,
                Status::PipelineSucceeded | Status::PipelineFailed
            );
        }

        self.status.is_success() || self.status.is_failure()
    }
}

fn internal(e: anyhow::Error) -> PipelineError {
    PipelineError::Internal(format!("{e:#}"))
}

/// Everything the factory needs to know about the request it is building an operation for.
#[derive(Debug, Clone)]
pub struct OperationRequest<'a> {
    pub resource_id: &'a str,

    /// The primary resource plus any resources that are touched as part of a cascade; in processing order.
    pub resources: &'a [Resource],
    pub action: &'a RequestAction,
    pub resource_path: &'a str,
    pub resource_version: u64,
    pub user: &'a User,
}

fn new_step(
    template_step_id: &str,
    step_title: Option<String>,
    target: &Resource,
    action: &RequestAction,
    source: &Resource,
) -> OperationStep {
    let (status, message) = action.initial_status();

    OperationStep {
        id: Uuid::now_v7().to_string(),
        template_step_id: template_step_id.to_string(),
        step_title,
        resource_id: target.id.clone(),
        resource_template_name: target.template_name.clone(),
        resource_type: target.resource_type,
        resource_action: action.clone(),
        status,
        message: message.to_string(),
        updated_when: epoch_milli(),
        source_template_resource_id: source.id.clone(),
    }
}

fn main_step(resource: &Resource, action: &RequestAction) -> OperationStep {
    new_step(
        MAIN_STEP_ID,
        Some(format!("Main step for {}", resource.id)),
        resource,
        action,
        resource,
    )
}

/// Loads the template a resource was created from.
pub async fn template_for_resource(
    state: &EngineState,
    resource: &Resource,
) -> Result<ResourceTemplate, PipelineError> {
    let parent_service_name = resources::parent_service_name(state, resource).await?;

    resource_templates::get_template_by_name_and_version(
        state,
        &resource.template_name,
        &resource.template_version,
        resource.resource_type,
        parent_service_name.as_deref(),
    )
    .await
}

/// Works out which resource a non-main pipeline step targets.
async fn resolve_step_target(
    state: &EngineState,
    step: &PipelineStep,
    primary: &Resource,
) -> Result<Resource, PipelineError> {
    let (Some(resource_type), Some(template_name)) =
        (step.resource_type, &step.resource_template_name)
    else {
        return Err(PipelineError::Configuration(format!(
            "step '{}' must declare resourceType and resourceTemplateName",
            step.step_id
        )));
    };

    match resource_type {
        ResourceType::SharedService => {
            resources::get_singleton_by_template_name(state, resource_type, template_name).await
        }
        ResourceType::Workspace => match primary.resource_type {
            ResourceType::WorkspaceService | ResourceType::UserResource => {
                resources::get_parent_workspace(state, primary).await
            }
            _ => Err(PipelineError::Configuration(
                "only a workspace service or user resource may reference a workspace".into(),
            )),
        },
        ResourceType::WorkspaceService => match primary.resource_type {
            ResourceType::UserResource => {
                resources::get_parent_workspace_service(state, primary).await
            }
            _ => Err(PipelineError::Configuration(
                "only a user resource may reference a workspace service".into(),
            )),
        },
        ResourceType::UserResource => Err(PipelineError::Configuration(format!(
            "step '{}' targets a user resource, which is not supported",
            step.step_id
        ))),
    }
}

/// Expands the pipelines of every requested resource into an operation. Nothing is persisted.
///
/// The same templates, resources and action always produce the same steps in the same order; only ids and
/// timestamps differ between calls.
pub async fn build_operation(
    state: &EngineState,
    request: &OperationRequest<'_>,
) -> Result<Operation, PipelineError> {
    let mut steps = vec![];

    for resource in request.resources {
        let template = template_for_resource(state, resource).await?;

        let Some(pipeline) = template.pipeline_for(request.action) else {
            steps.push(main_step(resource, request.action));
            continue;
        };

        for template_step in pipeline {
            if template_step.step_id == MAIN_STEP_ID {
                steps.push(main_step(resource, request.action));
                continue;
            }

            let target = resolve_step_target(state, template_step, resource).await?;

            let action = template_step.resource_action.clone().ok_or_else(|| {
                PipelineError::Configuration(format!(
                    "step '{}' must declare a resourceAction",
                    template_step.step_id
                ))
            })?;

            steps.push(new_step(
                &template_step.step_id,
                template_step.step_title.clone(),
                &target,
                &action,
                resource,
            ));
        }
    }

    let (status, message) = request.action.initial_status();
    let now = epoch_milli();

    Ok(Operation {
        id: Uuid::now_v7().to_string(),
        resource_id: request.resource_id.to_string(),
        resource_path: request.resource_path.to_string(),
        resource_version: request.resource_version,
        status,
        action: request.action.clone(),
        message: message.to_string(),
        steps,
        created_when: now,
        updated_when: now,
        user: request.user.clone(),
    })
}

/// Builds an operation and persists it in one write.
pub async fn create_operation(
    state: &EngineState,
    request: &OperationRequest<'_>,
) -> Result<Operation, PipelineError> {
    let operation = build_operation(state, request).await?;

    let storage_operation =
        storage::operations::Operation::try_from(operation.clone()).map_err(internal)?;

    let mut conn = state.storage.write_conn().await?;
    storage::operations::insert(&mut conn, &storage_operation).await?;
    drop(conn);

    info!(
        operation_id = operation.id,
        resource_id = operation.resource_id,
        action = %operation.action,
        steps = operation.steps.len(),
        "created operation"
    );

    state.event_bus.publish(Kind::CreatedOperation {
        operation_id: operation.id.clone(),
        resource_id: operation.resource_id.clone(),
        action: operation.action.to_string(),
    });

    Ok(operation)
}

pub async fn get_operation(state: &EngineState, id: &str) -> Result<Operation, PipelineError> {
    let mut conn = state.storage.read_conn().await?;

    let storage_operation = storage::operations::get(&mut conn, id)
        .await
        .map_err(|e| match e {
            storage::StorageError::NotFound => {
                PipelineError::NotFound(format!("operation '{id}' does not exist"))
            }
            _ => e.into(),
        })?;

    Operation::try_from(storage_operation).map_err(internal)
}

pub async fn list_operations(
    state: &EngineState,
    resource_id: &str,
    offset: i64,
    limit: i64,
) -> Result<Vec<Operation>, PipelineError> {
    let mut conn = state.storage.read_conn().await?;

    let operations =
        storage::operations::list_by_resource(&mut conn, resource_id, offset, limit).await?;

    operations
        .into_iter()
        .map(|o| Operation::try_from(o).map_err(internal))
        .collect()
}

/// Writes back the mutable parts of an operation: aggregate status, message and steps.
pub async fn save_operation(
    state: &EngineState,
    operation: &mut Operation,
) -> Result<(), PipelineError> {
    operation.updated_when = epoch_milli();

    let steps = serde_json::to_string(&operation.steps)
        .context("Could not serialize operation steps")
        .map_err(internal)?;

    let mut conn = state.storage.write_conn().await?;

    storage::operations::update(
        &mut conn,
        &operation.id,
        storage::operations::UpdatableFields {
            status: Some(operation.status.to_string()),
            message: Some(operation.message.clone()),
            steps: Some(steps),
            updated_when: Some(operation.updated_when.to_string()),
        },
    )
    .await?;

    debug!(
        operation_id = operation.id,
        status = %operation.status,
        "saved operation"
    );

    Ok(())
}
