//! Run harness — the public entry point.
//!
//! [`run_workflow`] validates the document and the user inputs, seeds the
//! state bag, wires the collaborators, and starts the flow engine on its
//! own task. The returned [`RunHandle`] exposes the run id synchronously,
//! an awaitable terminal result, and cooperative cancellation.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use hyperagent_core::{run_workflow, RunOptions, WorkflowDocument};
//! # async fn demo(provider: Arc<dyn hyperagent_core::SessionProvider>) {
//! let document = WorkflowDocument::from_file("review-loop.yaml").unwrap();
//! let handle = run_workflow(
//!     document,
//!     RunOptions::new("/work/project", provider)
//!         .with_user(serde_json::json!({ "goal": "fix the flaky test" })),
//! )
//! .unwrap();
//! println!("run {}", handle.run_id());
//! let result = handle.result().await.unwrap();
//! println!("outcome: {}", result.outcome);
//! # }
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::document::{validate_document, WorkflowDocument};
use crate::engine::{self, RunContext};
use crate::error::WorkflowError;
use crate::parser::compile;
use crate::process::{ProcessRunner, TokioProcessRunner};
use crate::provenance::{FileProvenanceSink, ProvenanceSink, DEFAULT_LOG_CAP};
use crate::registry::WorkflowRegistry;
use crate::session::{SessionManager, SessionProvider};
use crate::template;

/// Terminal result of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// Workflow-declared label, or `error:<class>` in the provenance
    /// terminal record of a failed run.
    pub outcome: String,
    #[serde(default)]
    pub reason: String,
    pub rounds: Vec<RoundRecord>,
    pub run_id: String,
}

/// One executed round: its number and the step keys that ran, in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundRecord {
    pub round: u32,
    pub steps: Vec<String>,
}

/// Emitted after every step completion.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub step: String,
    pub round: u32,
    pub parts: Vec<String>,
    pub parsed_summary: String,
}

pub type StreamCallback = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// Options for [`run_workflow`]. Unknown concerns stay out: anything the
/// orchestrator does not recognize is simply not forwarded to
/// collaborators.
pub struct RunOptions {
    pub user: Value,
    pub session_dir: PathBuf,
    pub session_provider: Arc<dyn SessionProvider>,
    pub model: Option<String>,
    pub max_rounds: Option<u32>,
    pub on_stream: Option<StreamCallback>,
    pub workflows: Option<Arc<dyn WorkflowRegistry>>,
    pub process_runner: Option<Arc<dyn ProcessRunner>>,
    pub provenance: Option<Arc<dyn ProvenanceSink>>,
    pub workflow_label: Option<String>,
    pub log_cap: Option<usize>,
}

impl RunOptions {
    pub fn new(session_dir: impl Into<PathBuf>, provider: Arc<dyn SessionProvider>) -> Self {
        Self {
            user: json!({}),
            session_dir: session_dir.into(),
            session_provider: provider,
            model: None,
            max_rounds: None,
            on_stream: None,
            workflows: None,
            process_runner: None,
            provenance: None,
            workflow_label: None,
            log_cap: None,
        }
    }

    pub fn with_user(mut self, user: Value) -> Self {
        self.user = user;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = Some(max_rounds);
        self
    }

    pub fn with_stream(mut self, callback: StreamCallback) -> Self {
        self.on_stream = Some(callback);
        self
    }

    pub fn with_workflows(mut self, registry: Arc<dyn WorkflowRegistry>) -> Self {
        self.workflows = Some(registry);
        self
    }

    pub fn with_process_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.process_runner = Some(runner);
        self
    }

    pub fn with_provenance(mut self, sink: Arc<dyn ProvenanceSink>) -> Self {
        self.provenance = Some(sink);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.workflow_label = Some(label.into());
        self
    }

    pub fn with_log_cap(mut self, cap: usize) -> Self {
        self.log_cap = Some(cap);
        self
    }
}

/// A live run. Dropping the handle does not stop the run; call
/// [`cancel`](Self::cancel) for that.
pub struct RunHandle {
    run_id: String,
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<Result<RunResult, WorkflowError>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Signal the active collaborator and reject the result with
    /// [`WorkflowError::Cancelled`].
    pub fn cancel(&self) {
        tracing::info!("[Harness] Cancelling run {}", self.run_id);
        self.cancel.cancel();
    }

    /// Await the terminal result.
    pub async fn result(self) -> Result<RunResult, WorkflowError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(WorkflowError::Cancelled),
            Err(e) => Err(WorkflowError::Internal(format!("run task failed: {e}"))),
        }
    }
}

/// Start a run. Must be called within a tokio runtime; the engine runs on
/// a spawned task and the handle returns immediately.
pub fn run_workflow(
    document: WorkflowDocument,
    options: RunOptions,
) -> Result<RunHandle, WorkflowError> {
    validate_document(&document)?;
    let user = coerce_user_inputs(&document, &options.user)?;

    let run_id = uuid::Uuid::new_v4().to_string();
    let state = seed_initial_state(&document, &user, &run_id)?;
    let cancel = CancellationToken::new();

    let provenance: Arc<dyn ProvenanceSink> = options
        .provenance
        .unwrap_or_else(|| Arc::new(FileProvenanceSink::new(&options.session_dir)));
    let runner: Arc<dyn ProcessRunner> = options
        .process_runner
        .unwrap_or_else(|| Arc::new(TokioProcessRunner::new()));
    let sessions = SessionManager::new(
        options.session_provider.clone(),
        options.session_dir.clone(),
        run_id.clone(),
        &document.sessions,
    );

    let ctx = RunContext {
        run_id: run_id.clone(),
        label: options
            .workflow_label
            .unwrap_or_else(|| document.id.clone()),
        model: options.model.or_else(|| document.model.clone()),
        max_rounds: options.max_rounds.unwrap_or(document.flow.round.max_rounds),
        document,
        session_dir: options.session_dir,
        user,
        state,
        steps: BTreeMap::new(),
        round: 0,
        rounds: Vec::new(),
        sessions,
        runner,
        provenance,
        registry: options.workflows,
        on_stream: options.on_stream,
        cancel: cancel.clone(),
        log_cap: options.log_cap.unwrap_or(DEFAULT_LOG_CAP),
    };

    let join = tokio::spawn(engine::run(ctx));
    Ok(RunHandle {
        run_id,
        cancel,
        join,
    })
}

/// Validate run inputs against the document's `user` schemas, producing
/// the coerced input object. Undeclared keys pass through untouched.
pub(crate) fn coerce_user_inputs(
    document: &WorkflowDocument,
    user: &Value,
) -> Result<Value, WorkflowError> {
    let incoming: Map<String, Value> = match user {
        Value::Null => Map::new(),
        Value::Object(map) => map.clone(),
        other => {
            return Err(WorkflowError::InputValidation {
                workflow_id: document.id.clone(),
                details: format!("expected an object, got {other}"),
            })
        }
    };

    let mut out = Map::new();
    let mut issues = Vec::new();
    for (key, schema) in &document.user {
        match compile(schema).validate(incoming.get(key)) {
            Ok(value) => {
                out.insert(key.clone(), value);
            }
            Err(issue) => issues.push(format!(
                "{key}{}: {}",
                issue.path.trim_start_matches('$'),
                issue.message
            )),
        }
    }
    for (key, value) in &incoming {
        if !document.user.contains_key(key) {
            out.insert(key.clone(), value.clone());
        }
    }

    if !issues.is_empty() {
        return Err(WorkflowError::InputValidation {
            workflow_id: document.id.clone(),
            details: issues.join("; "),
        });
    }
    Ok(Value::Object(out))
}

/// Render `state.initial` once over `{user, run, round: 0}`.
pub(crate) fn seed_initial_state(
    document: &WorkflowDocument,
    user: &Value,
    run_id: &str,
) -> Result<BTreeMap<String, String>, WorkflowError> {
    let scope = json!({ "user": user, "run": { "id": run_id }, "round": 0 });
    document
        .state
        .initial
        .iter()
        .map(|(key, template_string)| {
            Ok((key.clone(), template::render(template_string, &scope)?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document(user_spec: Value) -> WorkflowDocument {
        WorkflowDocument::from_json(
            &json!({
                "id": "inputs.v1",
                "user": user_spec,
                "state": { "initial": { "goal": "{{user.goal}}", "attempts": "0" } },
                "flow": {
                    "round": {
                        "maxRounds": 1,
                        "defaultOutcome": { "outcome": "done" },
                        "steps": [{ "key": "only", "type": "transform", "template": {} }]
                    }
                }
            })
            .to_string(),
        )
        .unwrap()
    }

    #[test]
    fn test_coerce_user_inputs_applies_defaults() {
        let doc = document(json!({
            "goal": { "type": "string" },
            "retries": { "type": "number", "integer": true, "default": 2 }
        }));
        let user = coerce_user_inputs(&doc, &json!({ "goal": "ship", "extra": true })).unwrap();
        assert_eq!(user, json!({ "goal": "ship", "retries": 2, "extra": true }));
    }

    #[test]
    fn test_invalid_inputs_rejected_with_workflow_id() {
        let doc = document(json!({ "goal": { "type": "string" } }));
        let err = coerce_user_inputs(&doc, &json!({ "goal": 123 })).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Invalid user inputs for workflow inputs.v1"));
        assert!(message.contains("goal"));
    }

    #[test]
    fn test_seed_initial_state_renders_once() {
        let doc = document(json!({ "goal": { "type": "string" } }));
        let state =
            seed_initial_state(&doc, &json!({ "goal": "ship" }), "run-a").unwrap();
        assert_eq!(state.get("goal").map(String::as_str), Some("ship"));
        assert_eq!(state.get("attempts").map(String::as_str), Some("0"));
    }
}
