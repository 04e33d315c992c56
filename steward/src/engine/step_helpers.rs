use crate::engine::{
    epoch_milli,
    event_utils::Kind,
    operations::{self, Operation, OperationStep},
    resource_requests, resource_templates,
    resources::{self, RequestAction, Resource, Status, User},
    substitutions, EngineState, PipelineError,
};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

/// What happened when the engine tried to move an operation on to one of its steps.
#[derive(Debug, PartialEq, Eq)]
pub enum Advance {
    /// The step's resource was prepared and a request for it is on the queue.
    Dispatched,

    /// The step could not be started. The failure has already been written to the operation.
    Failed(PipelineError),
}

/// Applies a template validated property patch to a resource, guarded by the etag the resource was read with.
///
/// Validation always uses the current version of the resource's template. Every patch bumps the resource
/// version, even one that changes nothing.
pub async fn patch_resource(
    state: &EngineState,
    resource: Resource,
    properties: Map<String, Value>,
    action: &RequestAction,
    user: &User,
) -> Result<Resource, PipelineError> {
    let parent_service_name = resources::parent_service_name(state, &resource).await?;

    let template = resource_templates::get_current_template(
        state,
        &resource.template_name,
        resource.resource_type,
        parent_service_name.as_deref(),
    )
    .await?;

    template.validate_properties(&properties, action)?;

    let expected_etag = resource.etag.clone();

    let mut patched = resource;
    patched.properties.extend(properties);
    patched.resource_version += 1;
    patched.user = user.clone();

    let patched = resources::replace_resource(state, patched, &expected_etag).await?;

    debug!(
        resource_id = patched.id,
        resource_version = patched.resource_version,
        "patched resource"
    );

    Ok(patched)
}

/// Re-reads a resource, applies `modify` and writes it back under an etag precondition. Conflicts are retried
/// up to the configured number of times using a fresh copy each round.
pub async fn modify_resource<F>(
    state: &EngineState,
    resource_id: &str,
    mut modify: F,
) -> Result<Resource, PipelineError>
where
    F: FnMut(&mut Resource),
{
    let retries = state.config.consumer.patch_retries;
    let mut attempt = 0;

    loop {
        let mut resource = resources::get_resource(state, resource_id).await?;
        let expected_etag = resource.etag.clone();
        modify(&mut resource);

        match resources::replace_resource(state, resource, &expected_etag).await {
            Err(PipelineError::ConcurrencyConflict(reason)) if attempt < retries => {
                attempt += 1;
                warn!(
                    resource_id,
                    attempt,
                    reason,
                    "resource changed while being modified; retrying"
                );
            }
            result => return result,
        }
    }
}

/// Gets the resource a step targets into the shape the step needs before its request is sent.
///
/// Main steps deploy the resource as stored. Every other step patches its target with the step's substituted
/// properties. Patching is retried on etag conflicts; each attempt re-reads the target and recomputes the
/// substitution so array merges see the latest stored value.
pub async fn update_resource_for_step(
    state: &EngineState,
    operation: &Operation,
    step: &OperationStep,
) -> Result<Resource, PipelineError> {
    if step.is_main() {
        return resources::get_resource(state, &step.resource_id).await;
    }

    let primary = resources::get_resource(state, &step.source_template_resource_id).await?;
    let template = operations::template_for_resource(state, &primary).await?;

    let template_step = template
        .pipeline_for(&operation.action)
        .and_then(|steps| {
            steps
                .iter()
                .find(|candidate| candidate.step_id == step.template_step_id)
        })
        .cloned()
        .ok_or_else(|| {
            PipelineError::Configuration(format!(
                "template '{}' version '{}' no longer declares step '{}' for action '{}'",
                template.name, template.version, step.template_step_id, operation.action
            ))
        })?;

    let ancestry = resources::load_ancestry(state, &primary).await?;
    let retries = state.config.consumer.patch_retries;
    let mut attempt = 0;

    loop {
        let resource_to_update = resources::get_resource(state, &step.resource_id).await?;

        let properties = substitutions::substitute_properties(
            &template_step,
            &primary,
            &ancestry,
            &resource_to_update,
        )?;

        match patch_resource(
            state,
            resource_to_update,
            properties,
            &step.resource_action,
            &operation.user,
        )
        .await
        {
            Err(PipelineError::ConcurrencyConflict(reason)) if attempt < retries => {
                attempt += 1;
                warn!(
                    operation_id = operation.id,
                    step_id = step.template_step_id,
                    resource_id = step.resource_id,
                    attempt,
                    reason,
                    "step target changed while being patched; retrying"
                );
            }
            result => return result,
        }
    }
}

/// Persists the operation after the step at `index` changed and lets listeners know about it.
pub async fn save_step_progress(
    state: &EngineState,
    operation: &mut Operation,
    index: usize,
) -> Result<(), PipelineError> {
    operation.update_aggregate_status(index);
    operations::save_operation(state, operation).await?;

    if let Some(step) = operation.steps.get(index) {
        state.event_bus.publish(Kind::UpdatedOperationStep {
            operation_id: operation.id.clone(),
            step_id: step.id.clone(),
            status: step.status,
        });
    }

    if operation.is_complete() {
        state.event_bus.publish(Kind::CompletedOperation {
            operation_id: operation.id.clone(),
            status: operation.status,
        });
    }

    Ok(())
}

/// Copies the status of the step at `index` onto the resource it targets. When a multi-step operation has just
/// failed the resource the operation belongs to is marked failed as well.
///
/// Failures here are logged only; the operation record stays the source of truth.
pub async fn mirror_step_status(state: &EngineState, operation: &Operation, index: usize) {
    let Some(step) = operation.steps.get(index) else {
        return;
    };

    if let Err(e) = resources::set_deployment_status(state, &step.resource_id, step.status).await {
        warn!(
            operation_id = operation.id,
            resource_id = step.resource_id,
            error = %e,
            "could not update deployment status of step resource"
        );
    }

    if operation.is_multi_step() && operation.status == Status::PipelineFailed {
        let failure = operation.action.failure_status();

        if let Err(e) =
            resources::set_deployment_status(state, &operation.resource_id, failure).await
        {
            warn!(
                operation_id = operation.id,
                resource_id = operation.resource_id,
                error = %e,
                "could not mark primary resource as failed"
            );
        }
    }
}

/// Marks the step at `index` with its action's failure status, saves the operation and mirrors the failure onto
/// the affected resources.
pub async fn fail_step(
    state: &EngineState,
    operation: &mut Operation,
    index: usize,
    err: &PipelineError,
) -> Result<(), PipelineError> {
    if let Some(failed) = operation.steps.get_mut(index) {
        failed.status = failed.resource_action.failure_status();
        failed.message = err.to_string();
        failed.updated_when = epoch_milli();
    }

    save_step_progress(state, operation, index).await?;
    mirror_step_status(state, operation, index).await;

    Ok(())
}

/// Prepares and dispatches the step at `index`.
///
/// When the step can never be started (bad template, failed validation, missing resource or a patch that kept
/// losing its etag race) the step is failed, the operation saved and the failure handed back as
/// `Advance::Failed`. Transient errors leave the operation untouched and are returned as `Err` so the caller
/// can retry the same work later.
pub async fn advance_to_step(
    state: &EngineState,
    operation: &mut Operation,
    index: usize,
) -> Result<Advance, PipelineError> {
    let Some(step) = operation.steps.get(index).cloned() else {
        return Err(PipelineError::Internal(format!(
            "operation '{}' has no step at position {index}",
            operation.id
        )));
    };

    let result = async {
        let resource = update_resource_for_step(state, operation, &step).await?;
        resource_requests::dispatch_step(state, operation, &step, &resource).await
    }
    .await;

    let err = match result {
        Ok(()) => return Ok(Advance::Dispatched),
        Err(err) if err.is_transient() => {
            warn!(
                operation_id = operation.id,
                step_id = step.template_step_id,
                resource_id = step.resource_id,
                error = %err,
                "could not start operation step; leaving it for a retry"
            );
            return Err(err);
        }
        Err(err) => err,
    };

    error!(
        operation_id = operation.id,
        step_id = step.template_step_id,
        resource_id = step.resource_id,
        error = %err,
        "could not start operation step"
    );

    fail_step(state, operation, index, &err).await?;

    Ok(Advance::Failed(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        operations::{create_operation, tests::seed, OperationRequest},
        resource_templates::{
            register_template,
            tests::{main_step as template_main_step, test_step, test_template},
            ArraySubstitutionAction, PipelineStepProperty, Property,
        },
        resources::{get_resource, tests::insert_resource, tests::test_resource, ResourceType},
        tests::TestEngine,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn rule_property(value: Value) -> PipelineStepProperty {
        PipelineStepProperty {
            name: "rules".into(),
            property_type: "array".into(),
            value,
            array_substitution_action: Some(ArraySubstitutionAction::Replace),
            array_match_field: Some("name".into()),
        }
    }

    /// A workspace whose install pipeline upgrades the shared firewall with a rule named after the workspace.
    async fn seed_firewall_pipeline(engine: &TestEngine) -> (Resource, Resource) {
        let state = &engine.state;

        let mut firewall_step = test_step(
            "firewall",
            ResourceType::SharedService,
            "firewall",
            RequestAction::Upgrade,
        );
        firewall_step.properties = vec![rule_property(json!({
            "name": "rule-{{ resource.id }}",
            "address": "{{ resource.properties.address }}"
        }))];

        register_template(
            state,
            test_template(
                "base",
                ResourceType::Workspace,
                BTreeMap::from([(
                    "install".to_string(),
                    vec![template_main_step(), firewall_step],
                )]),
            ),
        )
        .await
        .unwrap();

        let mut firewall_template =
            test_template("firewall", ResourceType::SharedService, BTreeMap::new());
        firewall_template.properties = BTreeMap::from([(
            "rules".to_string(),
            Property {
                property_type: Some("array".into()),
                updateable: true,
                ..Default::default()
            },
        )]);
        register_template(state, firewall_template).await.unwrap();

        let mut workspace = test_resource("ws1", ResourceType::Workspace, "base", None, None);
        workspace
            .properties
            .insert("address".into(), json!("10.0.0.1"));

        let mut firewall = test_resource("fw1", ResourceType::SharedService, "firewall", None, None);
        firewall.properties.insert(
            "rules".into(),
            json!([{"name": "existing", "address": "10.9.9.9"}]),
        );

        insert_resource(state, &workspace).await;
        insert_resource(state, &firewall).await;

        (workspace, firewall)
    }

    async fn install_operation(engine: &TestEngine, workspace: &Resource) -> Operation {
        let user = User::default();
        let resources = [workspace.clone()];

        create_operation(
            &engine.state,
            &OperationRequest {
                resource_id: &workspace.id,
                resources: &resources,
                action: &RequestAction::Install,
                resource_path: &workspace.resource_path,
                resource_version: workspace.resource_version,
                user: &user,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_step_patch_substitutes_and_bumps_version() {
        let engine = TestEngine::new().await;
        let (workspace, firewall) = seed_firewall_pipeline(&engine).await;
        let operation = install_operation(&engine, &workspace).await;

        let patched = update_resource_for_step(&engine.state, &operation, &operation.steps[1])
            .await
            .unwrap();

        assert_eq!(patched.resource_version, firewall.resource_version + 1);
        assert_ne!(patched.etag, firewall.etag);
        assert_eq!(
            patched.properties["rules"],
            json!([
                {"name": "existing", "address": "10.9.9.9"},
                {"name": "rule-ws1", "address": "10.0.0.1"}
            ])
        );

        let stored = get_resource(&engine.state, "fw1").await.unwrap();
        assert_eq!(stored, patched);
    }

    #[tokio::test]
    async fn test_main_step_returns_stored_resource() {
        let engine = TestEngine::new().await;
        let (workspace, _) = seed_firewall_pipeline(&engine).await;
        let operation = install_operation(&engine, &workspace).await;

        let resource = update_resource_for_step(&engine.state, &operation, &operation.steps[0])
            .await
            .unwrap();

        assert_eq!(resource, workspace);
    }

    #[tokio::test]
    async fn test_patch_rejects_non_updateable_property() {
        let engine = TestEngine::new().await;
        let (_, firewall) = seed_firewall_pipeline(&engine).await;

        let mut firewall_v2 =
            test_template("firewall", ResourceType::SharedService, BTreeMap::new());
        firewall_v2.version = "2.0.0".into();
        firewall_v2.properties = BTreeMap::from([(
            "rules".to_string(),
            Property {
                property_type: Some("array".into()),
                updateable: false,
                ..Default::default()
            },
        )]);
        register_template(&engine.state, firewall_v2).await.unwrap();

        let err = patch_resource(
            &engine.state,
            firewall,
            Map::from_iter([("rules".to_string(), json!([]))]),
            &RequestAction::Upgrade,
            &User::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_patch_with_stale_etag_conflicts() {
        let engine = TestEngine::new().await;
        let (_, firewall) = seed_firewall_pipeline(&engine).await;

        let mut stale = firewall.clone();
        stale.etag = "stale".into();

        let err = patch_resource(
            &engine.state,
            stale,
            Map::new(),
            &RequestAction::Upgrade,
            &User::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PipelineError::ConcurrencyConflict(_)));

        let stored = get_resource(&engine.state, "fw1").await.unwrap();
        assert_eq!(stored.resource_version, firewall.resource_version);
    }

    #[tokio::test]
    async fn test_modify_resource_applies_change() {
        let engine = TestEngine::new().await;
        let (_, firewall) = seed_firewall_pipeline(&engine).await;

        let modified = modify_resource(&engine.state, &firewall.id, |resource| {
            resource.properties.insert("ip".into(), json!("10.1.1.1"));
        })
        .await
        .unwrap();

        assert_eq!(modified.properties["ip"], json!("10.1.1.1"));
        assert_eq!(modified.resource_version, firewall.resource_version);
        assert_ne!(modified.etag, firewall.etag);
    }

    #[tokio::test]
    async fn test_advance_failure_marks_step_and_primary() {
        let engine = TestEngine::new().await;
        let (workspace, _, _, _) = seed(&engine).await;
        let mut operation = install_operation(&engine, &workspace).await;

        // Pretend the main step already finished.
        operation.steps[0].status = Status::Deployed;

        // Point the step at a resource that no longer exists.
        operation.steps[1].resource_id = "gone".into();

        let outcome = advance_to_step(&engine.state, &mut operation, 1)
            .await
            .unwrap();

        assert!(matches!(outcome, Advance::Failed(PipelineError::NotFound(_))));
        assert_eq!(operation.steps[1].status, Status::UpdatingFailed);
        assert_eq!(operation.status, Status::PipelineFailed);
        assert!(operation.message.starts_with("pipeline failed at step 'firewall'"));

        let stored = operations::get_operation(&engine.state, &operation.id)
            .await
            .unwrap();
        assert_eq!(stored.status, Status::PipelineFailed);

        let primary = get_resource(&engine.state, &workspace.id).await.unwrap();
        assert_eq!(primary.deployment_status, Status::DeploymentFailed);
    }

    /// Makes the next `times` version-bumping writes to `resource_id` lose their etag race, the way a write from
    /// another consumer landing first would. `races_left` reports how many are still to come.
    async fn lose_patch_races(engine: &TestEngine, resource_id: &str, times: i64) {
        let mut conn = engine.state.storage.write_conn().await.unwrap();

        sqlx::query("CREATE TABLE lost_races (remaining INTEGER NOT NULL);")
            .execute(&mut *conn)
            .await
            .unwrap();
        sqlx::query("INSERT INTO lost_races (remaining) VALUES (?);")
            .bind(times)
            .execute(&mut *conn)
            .await
            .unwrap();
        sqlx::query(&format!(
            "CREATE TRIGGER lose_patch_race BEFORE UPDATE ON resources \
            WHEN OLD.id = '{resource_id}' AND NEW.resource_version > OLD.resource_version \
            AND (SELECT remaining FROM lost_races) > 0 \
            BEGIN UPDATE lost_races SET remaining = remaining - 1; SELECT RAISE(IGNORE); END;"
        ))
        .execute(&mut *conn)
        .await
        .unwrap();
    }

    async fn races_left(engine: &TestEngine) -> i64 {
        let mut conn = engine.state.storage.read_conn().await.unwrap();

        sqlx::query_scalar::<_, i64>("SELECT remaining FROM lost_races;")
            .fetch_one(&mut *conn)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_step_patch_retries_after_losing_race() {
        let engine = TestEngine::new().await;
        let (workspace, firewall) = seed_firewall_pipeline(&engine).await;
        let operation = install_operation(&engine, &workspace).await;

        lose_patch_races(&engine, &firewall.id, 2).await;

        let patched = update_resource_for_step(&engine.state, &operation, &operation.steps[1])
            .await
            .unwrap();

        assert_eq!(races_left(&engine).await, 0);
        assert_eq!(patched.resource_version, firewall.resource_version + 1);
        assert_eq!(
            patched.properties["rules"],
            json!([
                {"name": "existing", "address": "10.9.9.9"},
                {"name": "rule-ws1", "address": "10.0.0.1"}
            ])
        );

        let stored = get_resource(&engine.state, "fw1").await.unwrap();
        assert_eq!(stored, patched);
    }

    #[tokio::test]
    async fn test_step_fails_when_patch_retries_run_out() {
        let engine = TestEngine::new().await;
        let (workspace, firewall) = seed_firewall_pipeline(&engine).await;
        let mut operation = install_operation(&engine, &workspace).await;
        operation.steps[0].status = Status::Deployed;

        lose_patch_races(&engine, &firewall.id, 100).await;

        let outcome = advance_to_step(&engine.state, &mut operation, 1)
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            Advance::Failed(PipelineError::ConcurrencyConflict(_))
        ));

        // The first attempt plus one per configured retry.
        let attempts = i64::from(engine.state.config.consumer.patch_retries) + 1;
        assert_eq!(races_left(&engine).await, 100 - attempts);

        assert_eq!(operation.steps[1].status, Status::UpdatingFailed);
        assert_eq!(operation.status, Status::PipelineFailed);

        let stored = operations::get_operation(&engine.state, &operation.id)
            .await
            .unwrap();
        assert_eq!(stored.status, Status::PipelineFailed);
        assert_eq!(stored.steps[1].status, Status::UpdatingFailed);

        let stored_firewall = get_resource(&engine.state, "fw1").await.unwrap();
        assert_eq!(stored_firewall.resource_version, firewall.resource_version);
    }
}
