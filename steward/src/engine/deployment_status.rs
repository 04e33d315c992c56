use crate::{
    engine::{
        epoch_milli,
        operations::{self, Operation},
        resources::Status,
        step_helpers::{self, Advance},
        supervisor::Heartbeat,
        EngineState, PipelineError,
    },
    queue::Delivery,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

/// A single value produced by the deployment runner. The capitalized field names are what the runner emits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Output {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Value")]
    pub value: Value,

    #[serde(rename = "Type", default)]
    pub output_type: String,
}

/// Progress report for a single step, sent back by the deployment runner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatusUpdateMessage {
    pub operation_id: String,
    pub step_id: String,

    /// Id of the resource the step acted on.
    pub id: String,
    pub status: Status,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub outputs: Vec<Output>,
}

/// Decides what a step moves to when a status update arrives. None means the update is not allowed from the
/// step's current state and must be ignored.
pub fn next_step_status(current: Status, incoming: Status) -> Option<Status> {
    let allowed = match current {
        Status::DeletingFailed | Status::Deleted | Status::ActionSucceeded | Status::ActionFailed => {
            false
        }
        Status::Failed | Status::Deployed | Status::Deleting => {
            matches!(incoming, Status::Deleted | Status::DeletingFailed)
        }
        Status::InvokingAction => {
            matches!(incoming, Status::ActionSucceeded | Status::ActionFailed)
        }
        _ => true,
    };

    allowed.then_some(incoming)
}

/// Runners sometimes quote their string outputs; one layer of matching quotes is removed.
fn strip_quotes(value: Value) -> Value {
    let Value::String(s) = &value else {
        return value;
    };

    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return Value::String(s[1..s.len() - 1].to_string());
        }
    }

    value
}

/// Writes step outputs onto the resource the step acted on. A deleted resource is also marked inactive.
async fn merge_outputs(
    state: &EngineState,
    resource_id: &str,
    status: Status,
    outputs: &[Output],
) -> Result<(), PipelineError> {
    if outputs.is_empty() && status != Status::Deleted {
        return Ok(());
    }

    step_helpers::modify_resource(state, resource_id, |resource| {
        for output in outputs {
            resource
                .properties
                .insert(output.name.clone(), strip_quotes(output.value.clone()));
        }

        if status == Status::Deleted {
            resource.is_active = false;
        }
    })
    .await?;

    debug!(
        resource_id,
        outputs = outputs.len(),
        "merged step outputs into resource"
    );

    Ok(())
}

/// Moves on to the step after `index` unless the pipeline has already failed or that step was started by an
/// earlier delivery of the same completion.
async fn advance_pipeline(
    state: &EngineState,
    operation: &mut Operation,
    index: usize,
) -> Result<(), PipelineError> {
    let next = index + 1;

    let Some(next_step) = operation.steps.get(next) else {
        return Ok(());
    };

    if operation.status == Status::PipelineFailed
        || next_step.status != next_step.resource_action.initial_status().0
    {
        debug!(
            operation_id = operation.id,
            step_id = next_step.template_step_id,
            status = %next_step.status,
            "next step already started; not advancing"
        );
        return Ok(());
    }

    if let Advance::Failed(e) = step_helpers::advance_to_step(state, operation, next).await? {
        warn!(
            operation_id = operation.id,
            error = %e,
            "pipeline stopped; next step could not be started"
        );
    }

    Ok(())
}

/// Applies one status update to its operation and, when the step it reports on succeeded, drives the pipeline
/// forward.
pub async fn handle_message(
    state: &EngineState,
    message: &DeploymentStatusUpdateMessage,
) -> Result<(), PipelineError> {
    let mut operation = operations::get_operation(state, &message.operation_id).await?;

    let index = operation
        .find_step(&message.step_id, &message.id)
        .ok_or_else(|| {
            PipelineError::NotFound(format!(
                "operation '{}' has no step '{}'",
                operation.id, message.step_id
            ))
        })?;

    let current = operation.steps[index].status;

    match next_step_status(current, message.status) {
        Some(next) => {
            let step = &mut operation.steps[index];
            step.status = next;
            step.message = message.message.clone();
            step.updated_when = epoch_milli();

            step_helpers::save_step_progress(state, &mut operation, index).await?;
            step_helpers::mirror_step_status(state, &operation, index).await;

            info!(
                operation_id = operation.id,
                step_id = operation.steps[index].template_step_id,
                status = %next,
                operation_status = %operation.status,
                "applied deployment status"
            );
        }

        // A redelivered completion. Finish whatever the first delivery may not have got to.
        None if message.status == current && current.is_success() => {
            info!(
                operation_id = operation.id,
                step_id = operation.steps[index].template_step_id,
                status = %current,
                "received repeated completion; resuming pipeline"
            );
        }

        None => {
            info!(
                operation_id = operation.id,
                step_id = operation.steps[index].template_step_id,
                current = %current,
                incoming = %message.status,
                "ignoring status update not allowed from current state"
            );
            return Ok(());
        }
    }

    let step = &operation.steps[index];
    if !step.is_success() {
        return Ok(());
    }

    let resource_id = step.resource_id.clone();
    merge_outputs(state, &resource_id, step.status, &message.outputs).await?;

    advance_pipeline(state, &mut operation, index).await
}

/// Processes one delivery and settles it with the queue.
///
/// Deliveries that can never succeed are completed and dropped; everything else that fails is abandoned so
/// it comes back. A delivery that has already been handed out `queue.max_delivery_count` times is dead-lettered
/// instead of abandoned again.
pub async fn process_delivery(
    state: &EngineState,
    delivery: Delivery,
) -> Result<(), PipelineError> {
    let message: DeploymentStatusUpdateMessage =
        match serde_json::from_str(&delivery.message.body) {
            Ok(message) => message,
            Err(e) => {
                error!(
                    delivery_id = delivery.id,
                    error = %e,
                    "could not parse deployment status message; dropping"
                );
                state.queue.complete(delivery).await?;
                return Ok(());
            }
        };

    match handle_message(state, &message).await {
        Ok(()) => state.queue.complete(delivery).await?,
        Err(e) if e.is_terminal() => {
            warn!(
                operation_id = message.operation_id,
                step_id = message.step_id,
                error = %e,
                "dropping deployment status message"
            );
            state.queue.complete(delivery).await?;
        }
        Err(e) if delivery.delivery_count >= state.config.queue.max_delivery_count => {
            error!(
                operation_id = message.operation_id,
                step_id = message.step_id,
                delivery_count = delivery.delivery_count,
                body = delivery.message.body,
                error = %e,
                "deployment status message failed too many times; dead-lettering"
            );
            state.queue.complete(delivery).await?;
        }
        Err(e) => {
            error!(
                operation_id = message.operation_id,
                step_id = message.step_id,
                delivery_count = delivery.delivery_count,
                error = %e,
                "could not process deployment status message; returning it to the queue"
            );
            state.queue.abandon(delivery).await?;
        }
    }

    Ok(())
}

/// Receives deployment status messages until the queue fails. The heartbeat is bumped on every pass so the
/// supervisor can tell a stuck loop from an idle one.
pub async fn receive_loop(
    state: Arc<EngineState>,
    heartbeat: Arc<Heartbeat>,
) -> Result<(), PipelineError> {
    let queue_name = state.config.queue.deployment_status_queue.clone();
    let max_wait = Duration::from_secs(state.config.queue.max_wait);

    debug!(queue = queue_name, "deployment status receive loop started");

    loop {
        heartbeat.beat();

        let Some(delivery) = state.queue.receive(&queue_name, max_wait).await? else {
            continue;
        };

        process_delivery(&state, delivery).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::{
            operations::{get_operation, tests::seed},
            resource_requests::{send_resource_request, ResourceRequestMessage},
            resource_templates::{register_template, tests::test_template, CustomAction},
            resources::{
                get_resource, tests::insert_resource, tests::test_resource, RequestAction,
                ResourceType, User,
            },
            tests::TestEngine,
        },
        queue::QueueMessage,
    };
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn status_message(
        operation: &Operation,
        index: usize,
        status: Status,
    ) -> DeploymentStatusUpdateMessage {
        DeploymentStatusUpdateMessage {
            operation_id: operation.id.clone(),
            step_id: operation.steps[index].id.clone(),
            id: operation.steps[index].resource_id.clone(),
            status,
            message: status.to_string(),
            outputs: vec![],
        }
    }

    async fn report(state: &EngineState, message: &DeploymentStatusUpdateMessage) {
        state
            .queue
            .send(
                &state.config.queue.deployment_status_queue,
                QueueMessage {
                    body: serde_json::to_string(message).unwrap(),
                    correlation_id: message.operation_id.clone(),
                    session_id: message.id.clone(),
                },
            )
            .await
            .unwrap();
    }

    async fn next_report(state: &EngineState) -> Option<Delivery> {
        state
            .queue
            .receive(
                &state.config.queue.deployment_status_queue,
                Duration::from_millis(10),
            )
            .await
            .unwrap()
    }

    async fn drain_requests(engine: &TestEngine) -> Vec<ResourceRequestMessage> {
        let mut requests = vec![];

        while let Some(delivery) = engine
            .state
            .queue
            .receive(
                &engine.state.config.queue.resource_request_queue,
                Duration::from_millis(10),
            )
            .await
            .unwrap()
        {
            requests.push(serde_json::from_str(&delivery.message.body).unwrap());
            engine.state.queue.complete(delivery).await.unwrap();
        }

        requests
    }

    #[rstest]
    #[case(Status::Deleted, Status::Deploying, None)]
    #[case(Status::DeletingFailed, Status::Deleted, None)]
    #[case(Status::ActionSucceeded, Status::ActionFailed, None)]
    #[case(Status::ActionFailed, Status::InvokingAction, None)]
    #[case(Status::Deployed, Status::Deploying, None)]
    #[case(Status::Deployed, Status::Deleted, Some(Status::Deleted))]
    #[case(Status::Failed, Status::DeletingFailed, Some(Status::DeletingFailed))]
    #[case(Status::Deleting, Status::Deployed, None)]
    #[case(Status::InvokingAction, Status::ActionSucceeded, Some(Status::ActionSucceeded))]
    #[case(Status::InvokingAction, Status::Deployed, None)]
    #[case(Status::AwaitingDeployment, Status::Deploying, Some(Status::Deploying))]
    #[case(Status::Deploying, Status::DeploymentFailed, Some(Status::DeploymentFailed))]
    #[case(Status::Updated, Status::Updating, Some(Status::Updating))]
    fn test_step_transitions(
        #[case] current: Status,
        #[case] incoming: Status,
        #[case] expected: Option<Status>,
    ) {
        assert_eq!(next_step_status(current, incoming), expected);
    }

    #[rstest]
    #[case(json!("\"10.0.0.4\""), json!("10.0.0.4"))]
    #[case(json!("'10.0.0.4'"), json!("10.0.0.4"))]
    #[case(json!("'mixed\""), json!("'mixed\""))]
    #[case(json!("\""), json!("\""))]
    #[case(json!(42), json!(42))]
    fn test_strip_quotes(#[case] value: Value, #[case] expected: Value) {
        assert_eq!(strip_quotes(value), expected);
    }

    #[test]
    fn test_status_message_wire_format() {
        let message: DeploymentStatusUpdateMessage = serde_json::from_value(json!({
            "operationId": "op1",
            "stepId": "step1",
            "id": "ws1",
            "status": "deployed",
            "message": "done",
            "outputs": [{"Name": "ip", "Value": "10.0.0.4", "Type": "string"}]
        }))
        .unwrap();

        assert_eq!(message.status, Status::Deployed);
        assert_eq!(
            message.outputs,
            vec![Output {
                name: "ip".into(),
                value: json!("10.0.0.4"),
                output_type: "string".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_pipeline_runs_to_completion() {
        let engine = TestEngine::new().await;
        let (workspace, _, _, _) = seed(&engine).await;
        let state = &engine.state;

        let operation = send_resource_request(
            state,
            &workspace,
            RequestAction::Install,
            &User::default(),
            false,
        )
        .await
        .unwrap();
        assert_eq!(drain_requests(&engine).await.len(), 1);

        handle_message(state, &status_message(&operation, 0, Status::Deploying))
            .await
            .unwrap();

        let stored = get_operation(state, &operation.id).await.unwrap();
        assert_eq!(stored.status, Status::PipelineDeploying);
        assert!(drain_requests(&engine).await.is_empty());

        let mut deployed = status_message(&operation, 0, Status::Deployed);
        deployed.outputs = vec![Output {
            name: "ip".into(),
            value: json!("'10.0.0.4'"),
            output_type: "string".into(),
        }];
        handle_message(state, &deployed).await.unwrap();

        let ws = get_resource(state, "ws1").await.unwrap();
        assert_eq!(ws.deployment_status, Status::Deployed);
        assert_eq!(ws.properties["ip"], json!("10.0.0.4"));

        let requests = drain_requests(&engine).await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].id, "fw1");
        assert_eq!(requests[0].step_id, operation.steps[1].id);
        assert_eq!(requests[0].action, RequestAction::Upgrade);

        let fw = get_resource(state, "fw1").await.unwrap();
        assert_eq!(fw.resource_version, 1);

        handle_message(state, &status_message(&operation, 1, Status::Updated))
            .await
            .unwrap();

        let stored = get_operation(state, &operation.id).await.unwrap();
        assert_eq!(stored.status, Status::PipelineSucceeded);
        assert_eq!(stored.message, "pipeline succeeded");
        assert!(stored.is_complete());
    }

    #[tokio::test]
    async fn test_deployed_step_ignores_deploying() {
        let engine = TestEngine::new().await;
        let (_, service, _, _) = seed(&engine).await;
        let state = &engine.state;

        let operation = send_resource_request(
            state,
            &service,
            RequestAction::Install,
            &User::default(),
            false,
        )
        .await
        .unwrap();

        handle_message(state, &status_message(&operation, 0, Status::Deployed))
            .await
            .unwrap();
        handle_message(state, &status_message(&operation, 0, Status::Deploying))
            .await
            .unwrap();

        let stored = get_operation(state, &operation.id).await.unwrap();
        assert_eq!(stored.steps[0].status, Status::Deployed);
        assert_eq!(stored.status, Status::Deployed);
    }

    #[tokio::test]
    async fn test_custom_action_completes() {
        let engine = TestEngine::new().await;
        let state = &engine.state;

        let mut template = test_template("firewall", ResourceType::SharedService, BTreeMap::new());
        template.custom_actions = vec![CustomAction {
            name: "restart".into(),
            description: String::new(),
        }];
        register_template(state, template).await.unwrap();

        let firewall = test_resource("fw1", ResourceType::SharedService, "firewall", None, None);
        insert_resource(state, &firewall).await;

        let operation = send_resource_request(
            state,
            &firewall,
            RequestAction::Custom("restart".into()),
            &User::default(),
            false,
        )
        .await
        .unwrap();
        assert_eq!(operation.status, Status::AwaitingAction);

        handle_message(state, &status_message(&operation, 0, Status::InvokingAction))
            .await
            .unwrap();
        handle_message(state, &status_message(&operation, 0, Status::ActionSucceeded))
            .await
            .unwrap();

        let stored = get_operation(state, &operation.id).await.unwrap();
        assert_eq!(stored.status, Status::ActionSucceeded);
        assert!(stored.is_complete());

        let fw = get_resource(state, "fw1").await.unwrap();
        assert_eq!(fw.deployment_status, Status::ActionSucceeded);
    }

    #[tokio::test]
    async fn test_deleted_marks_resource_inactive() {
        let engine = TestEngine::new().await;
        let (_, service, _, _) = seed(&engine).await;
        let state = &engine.state;

        let operation = send_resource_request(
            state,
            &service,
            RequestAction::Uninstall,
            &User::default(),
            false,
        )
        .await
        .unwrap();

        handle_message(state, &status_message(&operation, 0, Status::Deleted))
            .await
            .unwrap();

        let svc = get_resource(state, "svc1").await.unwrap();
        assert!(!svc.is_active);
        assert_eq!(svc.deployment_status, Status::Deleted);
    }

    #[tokio::test]
    async fn test_failed_step_fails_pipeline_and_primary() {
        let engine = TestEngine::new().await;
        let (workspace, _, _, _) = seed(&engine).await;
        let state = &engine.state;

        let operation = send_resource_request(
            state,
            &workspace,
            RequestAction::Install,
            &User::default(),
            false,
        )
        .await
        .unwrap();
        drain_requests(&engine).await;

        let mut failed = status_message(&operation, 0, Status::DeploymentFailed);
        failed.message = "quota exceeded".into();
        handle_message(state, &failed).await.unwrap();

        let stored = get_operation(state, &operation.id).await.unwrap();
        assert_eq!(stored.status, Status::PipelineFailed);
        assert_eq!(
            stored.message,
            "pipeline failed at step 'main': quota exceeded"
        );
        assert_eq!(stored.steps[1].status, Status::AwaitingUpdate);
        assert!(drain_requests(&engine).await.is_empty());

        let ws = get_resource(state, "ws1").await.unwrap();
        assert_eq!(ws.deployment_status, Status::DeploymentFailed);
    }

    #[tokio::test]
    async fn test_replayed_completion_does_not_redispatch_started_step() {
        let engine = TestEngine::new().await;
        let (workspace, _, _, _) = seed(&engine).await;
        let state = &engine.state;

        let operation = send_resource_request(
            state,
            &workspace,
            RequestAction::Install,
            &User::default(),
            false,
        )
        .await
        .unwrap();
        drain_requests(&engine).await;

        let deployed = status_message(&operation, 0, Status::Deployed);
        handle_message(state, &deployed).await.unwrap();
        assert_eq!(drain_requests(&engine).await.len(), 1);

        handle_message(state, &status_message(&operation, 1, Status::Updating))
            .await
            .unwrap();

        handle_message(state, &deployed).await.unwrap();
        assert!(drain_requests(&engine).await.is_empty());

        let stored = get_operation(state, &operation.id).await.unwrap();
        assert_eq!(stored.steps[1].status, Status::Updating);
    }

    #[tokio::test]
    async fn test_unknown_operation_is_terminal() {
        let engine = TestEngine::new().await;

        let err = handle_message(
            &engine.state,
            &DeploymentStatusUpdateMessage {
                operation_id: "missing".into(),
                step_id: "main".into(),
                id: "ws1".into(),
                status: Status::Deployed,
                message: String::new(),
                outputs: vec![],
            },
        )
        .await
        .unwrap_err();

        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_process_delivery_drops_unusable_messages() {
        let engine = TestEngine::new().await;
        let state = &engine.state;
        let queue_name = &state.config.queue.deployment_status_queue;

        let bodies = [
            "not json",
            r#"{"operationId":"missing","stepId":"main","id":"x","status":"deployed"}"#,
        ];

        for body in bodies {
            state
                .queue
                .send(
                    queue_name,
                    QueueMessage {
                        body: body.into(),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();

            let delivery = state
                .queue
                .receive(queue_name, Duration::from_millis(10))
                .await
                .unwrap()
                .unwrap();
            process_delivery(state, delivery).await.unwrap();
        }

        let leftover = state
            .queue
            .receive(queue_name, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(leftover.is_none());
    }

    #[tokio::test]
    async fn test_receive_loop_applies_messages() {
        let engine = TestEngine::new().await;
        let (_, service, _, _) = seed(&engine).await;
        let state = engine.state.clone();

        let operation = send_resource_request(
            &state,
            &service,
            RequestAction::Install,
            &User::default(),
            false,
        )
        .await
        .unwrap();

        let heartbeat = Arc::new(Heartbeat::new());
        let handle = tokio::spawn(receive_loop(state.clone(), heartbeat.clone()));

        state
            .queue
            .send(
                &state.config.queue.deployment_status_queue,
                QueueMessage {
                    body: serde_json::to_string(&status_message(&operation, 0, Status::Deployed))
                        .unwrap(),
                    correlation_id: operation.id.clone(),
                    session_id: service.id.clone(),
                },
            )
            .await
            .unwrap();

        let mut status = Status::AwaitingDeployment;
        for _ in 0..100 {
            status = get_operation(&state, &operation.id).await.unwrap().status;
            if status == Status::Deployed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        handle.abort();

        assert_eq!(status, Status::Deployed);
        assert!(heartbeat.last_beat() > 0);
    }

    #[tokio::test]
    async fn test_transient_dispatch_failure_is_redelivered() {
        let (engine, flaky) = TestEngine::with_flaky_queue().await;
        let (workspace, _, _, _) = seed(&engine).await;
        let state = &engine.state;

        let operation = send_resource_request(
            state,
            &workspace,
            RequestAction::Install,
            &User::default(),
            false,
        )
        .await
        .unwrap();
        drain_requests(&engine).await;

        report(state, &status_message(&operation, 0, Status::Deployed)).await;

        // The request for the firewall step cannot be sent.
        flaky.fail_sends(1);
        let delivery = next_report(state).await.unwrap();
        process_delivery(state, delivery).await.unwrap();

        let stored = get_operation(state, &operation.id).await.unwrap();
        assert_eq!(stored.steps[0].status, Status::Deployed);
        assert_eq!(stored.steps[1].status, Status::AwaitingUpdate);
        assert_ne!(stored.status, Status::PipelineFailed);
        assert!(drain_requests(&engine).await.is_empty());

        let redelivered = next_report(state).await.unwrap();
        assert_eq!(redelivered.delivery_count, 2);
        process_delivery(state, redelivered).await.unwrap();

        let requests = drain_requests(&engine).await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].id, "fw1");
        assert!(next_report(state).await.is_none());

        let stored = get_operation(state, &operation.id).await.unwrap();
        assert_eq!(stored.steps[1].status, Status::AwaitingUpdate);
        assert_ne!(stored.status, Status::PipelineFailed);
    }

    #[tokio::test]
    async fn test_failing_message_is_dead_lettered_without_blocking_others() {
        let engine = TestEngine::with_config(|config| config.queue.max_delivery_count = 3).await;
        let (workspace, service, _, _) = seed(&engine).await;
        let state = &engine.state;

        let broken = send_resource_request(
            state,
            &workspace,
            RequestAction::Install,
            &User::default(),
            false,
        )
        .await
        .unwrap();
        let healthy = send_resource_request(
            state,
            &service,
            RequestAction::Install,
            &User::default(),
            false,
        )
        .await
        .unwrap();

        {
            let mut conn = state.storage.write_conn().await.unwrap();
            sqlx::query("UPDATE operations SET steps = 'garbage' WHERE id = ?;")
                .bind(&broken.id)
                .execute(&mut *conn)
                .await
                .unwrap();
        }

        report(state, &status_message(&broken, 0, Status::Deployed)).await;
        report(state, &status_message(&healthy, 0, Status::Deployed)).await;

        let mut deliveries = 0;
        while let Some(delivery) = next_report(state).await {
            deliveries += 1;
            assert!(deliveries <= 10, "message was never settled");

            process_delivery(state, delivery).await.unwrap();

            // The healthy message is handled right after the first failed attempt.
            if deliveries == 2 {
                let stored = get_operation(state, &healthy.id).await.unwrap();
                assert_eq!(stored.status, Status::Deployed);
            }
        }

        assert_eq!(deliveries, 4);
    }
}
