//! Round loop and flow state machine.
//!
//! A run moves through `PreRun → Bootstrap? → RoundStart → Step(k)* →
//! Terminated`. Steps execute strictly sequentially; after each one the
//! engine applies `stateUpdates`, evaluates `transitions` then `exits`
//! (first match wins, transitions shadow exits), and either advances,
//! jumps, or terminates with a labeled outcome. Exhausting `maxRounds`
//! terminates with the round's `defaultOutcome`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::condition;
use crate::document::{Step, WorkflowDocument};
use crate::error::WorkflowError;
use crate::harness::{RoundRecord, RunResult, StreamCallback, StreamEvent};
use crate::process::{ProcessRunner, StdinValue};
use crate::provenance::{LogRecord, ProvenanceEntry, ProvenanceSink};
use crate::registry::WorkflowRegistry;
use crate::scope;
use crate::session::SessionManager;
use crate::step::{self, StepResult};
use crate::template;

/// Everything one run owns. Children get their own context; collaborators
/// are shared through `Arc`s.
pub(crate) struct RunContext {
    pub run_id: String,
    /// Prefix for provenance log roles; defaults to the document id.
    pub label: String,
    pub document: WorkflowDocument,
    pub session_dir: PathBuf,
    pub model: Option<String>,
    pub max_rounds: u32,
    pub user: Value,
    pub state: BTreeMap<String, String>,
    pub steps: BTreeMap<String, StepResult>,
    pub round: u32,
    pub rounds: Vec<RoundRecord>,
    pub sessions: SessionManager,
    pub runner: Arc<dyn ProcessRunner>,
    pub provenance: Arc<dyn ProvenanceSink>,
    pub registry: Option<Arc<dyn WorkflowRegistry>>,
    pub on_stream: Option<StreamCallback>,
    pub cancel: CancellationToken,
    pub log_cap: usize,
}

impl RunContext {
    /// Snapshot of the run-global scope.
    pub fn scope(&self) -> Value {
        let mut steps = Map::new();
        for (key, result) in &self.steps {
            steps.insert(
                key.clone(),
                json!({ "raw": &result.raw, "parsed": &result.parsed }),
            );
        }
        json!({
            "user": &self.user,
            "run": { "id": &self.run_id },
            "round": self.round,
            "maxRounds": self.max_rounds,
            "state": &self.state,
            "steps": steps,
        })
    }

    /// Scope extended with the current step's `parsed` and `args`.
    pub fn step_scope(&self, result: &StepResult) -> Value {
        let mut obj = self
            .scope()
            .as_object()
            .cloned()
            .unwrap_or_default();
        obj.insert("parsed".to_string(), result.parsed.clone());
        if let Some(args) = &result.args {
            obj.insert("args".to_string(), args.clone());
        }
        Value::Object(obj)
    }

    /// Resolve a `stdinFrom` path. Captured byte buffers win over the JSON
    /// scope so piped bytes stay bit-for-bit; string values pass as UTF-8,
    /// anything else as canonical JSON.
    pub fn resolve_stdin(&self, path: &str) -> Result<StdinValue, WorkflowError> {
        let segments: Vec<&str> = path.split('.').collect();
        if let ["steps", step_key, "parsed", buffer_key] = segments.as_slice() {
            if let Some(record) = self.steps.get(*step_key) {
                let buffer = match *buffer_key {
                    "stdoutBuffer" => record.stdout_buffer.as_ref(),
                    "stderrBuffer" => record.stderr_buffer.as_ref(),
                    _ => None,
                };
                if let Some(bytes) = buffer {
                    return Ok(StdinValue::Bytes(bytes.clone()));
                }
            }
        }

        let scope = self.scope();
        match scope::lookup(&scope, path) {
            Some(Value::String(s)) => Ok(StdinValue::Text(s.clone())),
            Some(other) => Ok(StdinValue::Text(other.to_string())),
            None => Err(WorkflowError::Template(format!(
                "stdinFrom path '{path}' is undefined"
            ))),
        }
    }

    /// Append a log entry to this run's provenance record.
    pub async fn log(
        &self,
        role: impl Into<String>,
        payload: Value,
    ) -> Result<(), WorkflowError> {
        self.provenance
            .append(&self.run_id, ProvenanceEntry::Log(LogRecord::new(role, payload)))
            .await
    }
}

struct TerminalOutcome {
    outcome: String,
    reason: String,
}

enum Flow {
    Advance,
    Jump(String),
    Terminate(TerminalOutcome),
}

/// Boxed entry point, so `workflow` steps can recurse into the engine.
pub(crate) fn run_boxed(
    ctx: RunContext,
) -> Pin<Box<dyn std::future::Future<Output = Result<RunResult, WorkflowError>> + Send>> {
    Box::pin(run(ctx))
}

/// Drive a run to termination, finalizing provenance either way.
pub(crate) async fn run(mut ctx: RunContext) -> Result<RunResult, WorkflowError> {
    ctx.provenance.open(&ctx.run_id, &ctx.document.id).await?;
    tracing::info!(
        "[Engine] Run {} of workflow '{}' started",
        ctx.run_id,
        ctx.document.id
    );

    match drive(&mut ctx).await {
        Ok(terminal) => {
            let result = RunResult {
                outcome: terminal.outcome,
                reason: terminal.reason,
                rounds: ctx.rounds.clone(),
                run_id: ctx.run_id.clone(),
            };
            ctx.provenance.finalize(&ctx.run_id, &result).await?;
            tracing::info!("[Engine] Run {} terminated: {}", ctx.run_id, result.outcome);
            Ok(result)
        }
        Err(error) => {
            let terminal = RunResult {
                outcome: format!("error:{}", error.class()),
                reason: error.to_string(),
                rounds: ctx.rounds.clone(),
                run_id: ctx.run_id.clone(),
            };
            if let Err(sink_error) = ctx.provenance.finalize(&ctx.run_id, &terminal).await {
                tracing::warn!(
                    "[Engine] Failed to finalize provenance for {}: {}",
                    ctx.run_id,
                    sink_error
                );
            }
            tracing::warn!("[Engine] Run {} failed: {}", ctx.run_id, error);
            Err(error)
        }
    }
}

async fn drive(ctx: &mut RunContext) -> Result<TerminalOutcome, WorkflowError> {
    if let Some(bootstrap) = ctx.document.flow.bootstrap.clone() {
        if let Flow::Terminate(terminal) = run_step(ctx, &bootstrap, true).await? {
            return Ok(terminal);
        }
    }

    let round_spec = ctx.document.flow.round.clone();
    while ctx.round < ctx.max_rounds {
        if ctx.cancel.is_cancelled() {
            return Err(WorkflowError::Cancelled);
        }
        ctx.round += 1;
        ctx.rounds.push(RoundRecord {
            round: ctx.round,
            steps: Vec::new(),
        });
        tracing::debug!(
            "[Engine] Run {} round {}/{}",
            ctx.run_id,
            ctx.round,
            ctx.max_rounds
        );

        let mut cursor = match &round_spec.start {
            Some(key) => index_of(&round_spec.steps, key),
            None => Some(0),
        };
        while let Some(index) = cursor {
            if ctx.cancel.is_cancelled() {
                return Err(WorkflowError::Cancelled);
            }
            let current = round_spec.steps[index].clone();
            match run_step(ctx, &current, false).await? {
                Flow::Terminate(terminal) => return Ok(terminal),
                Flow::Jump(key) => cursor = index_of(&round_spec.steps, &key),
                Flow::Advance => {
                    cursor = (index + 1 < round_spec.steps.len()).then_some(index + 1)
                }
            }
        }
    }

    let scope = ctx.scope();
    Ok(TerminalOutcome {
        outcome: round_spec.default_outcome.outcome.clone(),
        reason: template::render(&round_spec.default_outcome.reason, &scope)?,
    })
}

/// Execute one step and route: record the result, apply state updates,
/// then let transitions and exits decide what happens next. Bootstrap
/// steps only honor `stateUpdates` and `exits`.
async fn run_step(
    ctx: &mut RunContext,
    step: &Step,
    bootstrap: bool,
) -> Result<Flow, WorkflowError> {
    let result = step::execute(ctx, step).await?;

    ctx.steps.insert(step.key.clone(), result.clone());
    if !bootstrap {
        if let Some(record) = ctx.rounds.last_mut() {
            record.steps.push(step.key.clone());
        }
    }

    if let Some(on_stream) = &ctx.on_stream {
        on_stream(StreamEvent {
            step: step.key.clone(),
            round: ctx.round,
            parts: vec![result.raw.clone()],
            parsed_summary: crate::provenance::truncate_text(
                &scope::to_display_string(&result.parsed),
                200,
            ),
        });
    }

    apply_state_updates(ctx, &step.state_updates, &result)?;

    let scope_now = ctx.step_scope(&result);
    let mut fired = false;

    if !bootstrap {
        for transition in &step.transitions {
            if !condition::evaluate(&transition.condition, &scope_now) {
                continue;
            }
            fired = true;
            apply_state_updates(ctx, &transition.state_updates, &result)?;
            if let Some(outcome) = &transition.outcome {
                let scope_after = ctx.step_scope(&result);
                return Ok(Flow::Terminate(TerminalOutcome {
                    outcome: outcome.clone(),
                    reason: render_reason(transition.reason.as_deref(), &scope_after)?,
                }));
            }
            if let Some(next) = &transition.next {
                return Ok(Flow::Jump(next.clone()));
            }
            break;
        }
    }

    if !fired {
        for exit in &step.exits {
            if !condition::evaluate(&exit.condition, &scope_now) {
                continue;
            }
            apply_state_updates(ctx, &exit.state_updates, &result)?;
            let scope_after = ctx.step_scope(&result);
            return Ok(Flow::Terminate(TerminalOutcome {
                // Validation guarantees exits carry an outcome.
                outcome: exit.outcome.clone().unwrap_or_default(),
                reason: render_reason(exit.reason.as_deref(), &scope_after)?,
            }));
        }
    }

    if bootstrap {
        return Ok(Flow::Advance);
    }
    match &step.next {
        Some(next) => Ok(Flow::Jump(next.clone())),
        None => Ok(Flow::Advance),
    }
}

fn apply_state_updates(
    ctx: &mut RunContext,
    updates: &BTreeMap<String, String>,
    result: &StepResult,
) -> Result<(), WorkflowError> {
    if updates.is_empty() {
        return Ok(());
    }
    let scope = ctx.step_scope(result);
    for (key, template_string) in updates {
        let rendered = template::render(template_string, &scope)?;
        ctx.state.insert(key.clone(), rendered);
    }
    Ok(())
}

fn render_reason(reason: Option<&str>, scope: &Value) -> Result<String, WorkflowError> {
    match reason {
        Some(template_string) => template::render(template_string, scope),
        None => Ok(String::new()),
    }
}

fn index_of(steps: &[Step], key: &str) -> Option<usize> {
    steps.iter().position(|s| s.key == key)
}
