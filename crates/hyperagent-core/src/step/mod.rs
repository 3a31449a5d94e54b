//! Step executors — each step kind's side-effectful contract.
//!
//! All executors share the shape: render inputs from a scope snapshot,
//! invoke the matching collaborator, and return a [`StepResult`] whose
//! `raw`/`parsed` land under `steps.<key>` in the scope. State updates and
//! transition routing happen in the engine afterwards.

pub(crate) mod agent;
pub(crate) mod child;
pub(crate) mod cli;
pub(crate) mod transform;

use serde_json::Value;

use crate::document::{Step, StepKind};
use crate::engine::RunContext;
use crate::error::WorkflowError;

/// Outcome of one step execution.
#[derive(Debug, Clone)]
pub struct StepResult {
    /// Step kind label (`agent`, `cli`, `workflow`, `transform`).
    pub kind: &'static str,
    pub key: String,
    /// Raw textual output: the last reply part, stdout, the child outcome,
    /// or the canonical JSON of a transform.
    pub raw: String,
    pub parsed: Value,
    /// Rendered arguments, bound as `args` in the step scope (cli only).
    pub args: Option<Value>,
    /// Captured bytes, kept out of the JSON scope so `stdinFrom` can pipe
    /// them bit-for-bit.
    pub stdout_buffer: Option<Vec<u8>>,
    pub stderr_buffer: Option<Vec<u8>>,
}

impl StepResult {
    pub(crate) fn new(kind: &'static str, key: &str, raw: String, parsed: Value) -> Self {
        Self {
            kind,
            key: key.to_string(),
            raw,
            parsed,
            args: None,
            stdout_buffer: None,
            stderr_buffer: None,
        }
    }
}

/// Dispatch a step to its executor.
pub(crate) async fn execute(
    ctx: &RunContext,
    step: &Step,
) -> Result<StepResult, WorkflowError> {
    tracing::debug!(
        "[Step] Run {} executing {} step '{}'",
        ctx.run_id,
        step.kind.name(),
        step.key
    );
    match &step.kind {
        StepKind::Agent { role, prompt } => agent::execute(ctx, &step.key, role, prompt).await,
        StepKind::Cli {
            command,
            args,
            args_object,
            args_schema,
            cwd,
            stdin_from,
            capture,
        } => {
            cli::execute(
                ctx,
                &step.key,
                command,
                args.as_deref(),
                args_object.as_ref(),
                args_schema.as_ref(),
                cwd.as_deref(),
                stdin_from.as_deref(),
                *capture,
            )
            .await
        }
        StepKind::Workflow {
            workflow_id,
            input,
            input_schema,
        } => {
            child::execute(ctx, &step.key, workflow_id, input.as_ref(), input_schema.as_ref())
                .await
        }
        StepKind::Transform {
            template,
            input,
            input_schema,
        } => {
            transform::execute(ctx, &step.key, template, input.as_ref(), input_schema.as_ref())
                .await
        }
    }
}
