use crate::{
    engine::{
        event_utils::Kind,
        operations::{self, Operation, OperationRequest, OperationStep},
        resources::{self, RequestAction, Resource, User},
        step_helpers::{self, Advance},
        EngineState, PipelineError,
    },
    queue::QueueMessage,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

/// The payload handed to the deployment runner for a single step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequestMessage {
    pub operation_id: String,

    /// The unique id of the step. Status updates must echo it back.
    pub step_id: String,
    pub action: RequestAction,

    /// Id of the resource being acted on.
    pub id: String,

    /// Template name and version the resource was created from.
    pub name: String,
    pub version: String,

    /// Every property of the resource at the time of dispatch.
    pub parameters: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_workspace_service_id: Option<String>,
}

impl ResourceRequestMessage {
    pub fn new(operation_id: &str, step: &OperationStep, resource: &Resource) -> Self {
        Self {
            operation_id: operation_id.to_string(),
            step_id: step.id.clone(),
            action: step.resource_action.clone(),
            id: resource.id.clone(),
            name: resource.template_name.clone(),
            version: resource.template_version.clone(),
            parameters: resource.properties.clone(),
            workspace_id: resource.workspace_id.clone(),
            owner_id: resource.owner_id.clone(),
            parent_workspace_service_id: resource.parent_workspace_service_id.clone(),
        }
    }
}

/// Puts a request for one step on the resource request queue. Requests for the same resource share a session
/// so the runner sees them in order.
pub async fn dispatch_step(
    state: &EngineState,
    operation: &Operation,
    step: &OperationStep,
    resource: &Resource,
) -> Result<(), PipelineError> {
    let message = ResourceRequestMessage::new(&operation.id, step, resource);

    let body = serde_json::to_string(&message).map_err(|e| {
        PipelineError::Internal(format!("could not serialize resource request; {e}"))
    })?;

    state
        .queue
        .send(
            &state.config.queue.resource_request_queue,
            QueueMessage {
                body,
                correlation_id: operation.id.clone(),
                session_id: resource.id.clone(),
            },
        )
        .await?;

    info!(
        operation_id = operation.id,
        step_id = step.template_step_id,
        resource_id = resource.id,
        action = %step.resource_action,
        "dispatched resource request"
    );

    state.event_bus.publish(Kind::DispatchedResourceRequest {
        operation_id: operation.id.clone(),
        step_id: step.id.clone(),
        resource_id: resource.id.clone(),
    });

    Ok(())
}

/// Starts a lifecycle action against a resource: builds and stores an operation, then dispatches its first
/// step. The remaining steps are driven by the deployment status consumer.
///
/// With `cascade` set every active resource below the given one is included ahead of it, deepest first, so that
/// children are dealt with before their parents.
///
/// The operation is always stored before dispatch is attempted. If the first step cannot be started the
/// operation is left failed and the error is returned.
pub async fn send_resource_request(
    state: &EngineState,
    resource: &Resource,
    action: RequestAction,
    user: &User,
    cascade: bool,
) -> Result<Operation, PipelineError> {
    if !resource.is_active {
        return Err(PipelineError::Validation(format!(
            "resource '{}' has been deleted",
            resource.id
        )));
    }

    if let RequestAction::Custom(name) = &action {
        let template = operations::template_for_resource(state, resource).await?;

        if !template.custom_actions.iter().any(|a| &a.name == name) {
            return Err(PipelineError::Validation(format!(
                "template '{}' version '{}' does not declare custom action '{name}'",
                template.name, template.version
            )));
        }
    }

    let mut targets = if cascade {
        resources::list_dependents(state, resource).await?
    } else {
        vec![]
    };
    targets.push(resource.clone());

    let mut operation = operations::create_operation(
        state,
        &OperationRequest {
            resource_id: &resource.id,
            resources: &targets,
            action: &action,
            resource_path: &resource.resource_path,
            resource_version: resource.resource_version,
            user,
        },
    )
    .await?;

    // Nothing will redeliver this request, so a transient failure is recorded on the operation as well.
    match step_helpers::advance_to_step(state, &mut operation, 0).await {
        Ok(Advance::Dispatched) => Ok(operation),
        Ok(Advance::Failed(e)) => Err(e),
        Err(e) => {
            step_helpers::fail_step(state, &mut operation, 0, &e).await?;
            Err(e)
        }
    }
}
