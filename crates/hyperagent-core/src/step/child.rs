//! Workflow step executor — nested invocation of another workflow by id.
//!
//! The child resolves through the run's registry, inherits the session
//! dir, model (unless it declares its own), and collaborators, and runs to
//! completion inside the parent step. Its terminal result lands in
//! `parsed` so parent transitions can translate outcomes; a fatal child
//! failure propagates with the child run id attached.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::engine::{self, RunContext};
use crate::error::WorkflowError;
use crate::harness;
use crate::parser::{compile, ParserSchema};
use crate::session::SessionManager;
use crate::step::StepResult;
use crate::template;

pub(crate) async fn execute(
    ctx: &RunContext,
    key: &str,
    workflow_id: &str,
    input: Option<&Value>,
    input_schema: Option<&ParserSchema>,
) -> Result<StepResult, WorkflowError> {
    let registry = ctx
        .registry
        .clone()
        .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_id.to_string()))?;
    let child_doc = registry
        .resolve(workflow_id)
        .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_id.to_string()))?;
    crate::document::validate_document(&child_doc)?;

    let scope = ctx.scope();
    let rendered = match input {
        Some(tree) => template::render_tree(tree, &scope)?,
        None => json!({}),
    };
    let validated = match input_schema {
        Some(schema) => compile(schema).validate(Some(&rendered)).map_err(|issue| {
            WorkflowError::InputValidation {
                workflow_id: workflow_id.to_string(),
                details: issue.to_string(),
            }
        })?,
        None => rendered,
    };

    ctx.log(
        format!("{}.workflow.{key}", ctx.label),
        json!({ "workflowId": workflow_id, "input": &validated }),
    )
    .await?;

    let child_user = harness::coerce_user_inputs(&child_doc, &validated)?;
    let child_run_id = uuid::Uuid::new_v4().to_string();
    let child_state = harness::seed_initial_state(&child_doc, &child_user, &child_run_id)?;
    let child_sessions = SessionManager::new(
        ctx.sessions.provider().clone(),
        ctx.session_dir.clone(),
        child_run_id.clone(),
        &child_doc.sessions,
    );

    tracing::info!(
        "[Step] Run {} delegating step '{key}' to workflow '{workflow_id}' (child run {})",
        ctx.run_id,
        child_run_id
    );

    let child_ctx = RunContext {
        run_id: child_run_id.clone(),
        label: child_doc.id.clone(),
        model: child_doc.model.clone().or_else(|| ctx.model.clone()),
        max_rounds: child_doc.flow.round.max_rounds,
        document: child_doc,
        session_dir: ctx.session_dir.clone(),
        user: child_user,
        state: child_state,
        steps: BTreeMap::new(),
        round: 0,
        rounds: Vec::new(),
        sessions: child_sessions,
        runner: ctx.runner.clone(),
        provenance: ctx.provenance.clone(),
        registry: Some(registry),
        on_stream: ctx.on_stream.clone(),
        cancel: ctx.cancel.child_token(),
        log_cap: ctx.log_cap,
    };

    match engine::run_boxed(child_ctx).await {
        Ok(result) => {
            let details = serde_json::to_value(&result)
                .map_err(|e| WorkflowError::Internal(format!("result serialization: {e}")))?;
            let parsed = json!({
                "outcome": &result.outcome,
                "reason": &result.reason,
                "runId": &result.run_id,
                "rounds": result.rounds.len(),
                "details": details,
            });
            Ok(StepResult::new("workflow", key, result.outcome.clone(), parsed))
        }
        Err(WorkflowError::Cancelled) => Err(WorkflowError::Cancelled),
        Err(error) => Err(WorkflowError::ChildWorkflow {
            workflow_id: workflow_id.to_string(),
            run_id: child_run_id,
            details: error.to_string(),
        }),
    }
}
