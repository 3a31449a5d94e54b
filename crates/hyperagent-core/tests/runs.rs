//! End-to-end runs against a scripted session provider and real
//! subprocesses, under a temporary session directory.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use hyperagent_core::{
    run_workflow, InMemoryWorkflowRegistry, PromptReply, RunOptions, RunRecord, SessionHandle,
    SessionProvider, StreamEvent, ToolPermissions, WorkflowDocument, WorkflowError,
};

/// Deterministic provider: replies are scripted per role and consumed in
/// order; exhausted scripts fall back to `{}`.
struct StubProvider {
    replies: Mutex<HashMap<String, VecDeque<String>>>,
    registered: Mutex<Vec<String>>,
}

impl StubProvider {
    fn new(scripts: &[(&str, &[&str])]) -> Arc<Self> {
        let replies = scripts
            .iter()
            .map(|(role, lines)| {
                (
                    role.to_string(),
                    lines.iter().map(|s| s.to_string()).collect(),
                )
            })
            .collect();
        Arc::new(Self {
            replies: Mutex::new(replies),
            registered: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl SessionProvider for StubProvider {
    async fn create_session(
        &self,
        _dir: &Path,
        name: Option<&str>,
    ) -> Result<SessionHandle, WorkflowError> {
        Ok(SessionHandle {
            id: format!("session-for-{}", name.unwrap_or("anonymous")),
            name: name.map(|s| s.to_string()),
        })
    }

    async fn list_sessions(&self, _dir: &Path) -> Result<Vec<SessionHandle>, WorkflowError> {
        Ok(Vec::new())
    }

    async fn prompt(
        &self,
        session: &SessionHandle,
        _parts: &[String],
        _model: Option<&str>,
        _agent_name: Option<&str>,
        _cancel: &CancellationToken,
    ) -> Result<PromptReply, WorkflowError> {
        // Session names end in `.<role>`; that suffix selects the script.
        let role = session
            .name
            .as_deref()
            .and_then(|n| n.rsplit('.').next())
            .unwrap_or("")
            .to_string();
        let text = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&role)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| "{}".to_string());
        Ok(PromptReply {
            parts: vec![text],
            message_id: Some("message-1".to_string()),
        })
    }

    async fn message_diff(
        &self,
        _session: &SessionHandle,
        _message_id: &str,
    ) -> Result<Value, WorkflowError> {
        Ok(json!({ "files": [] }))
    }

    async fn register_agent_definition(
        &self,
        _dir: &Path,
        name: &str,
        _model: Option<&str>,
        _system_prompt: &str,
        _tools: &ToolPermissions,
    ) -> Result<(), WorkflowError> {
        self.registered.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn invalidate(&self, _dir: &Path) {}
}

fn collect_events() -> (Arc<Mutex<Vec<StreamEvent>>>, hyperagent_core::StreamCallback) {
    let events: Arc<Mutex<Vec<StreamEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let callback: hyperagent_core::StreamCallback =
        Arc::new(move |event| sink.lock().unwrap().push(event));
    (events, callback)
}

fn document(spec: Value) -> WorkflowDocument {
    WorkflowDocument::from_json(&spec.to_string()).unwrap()
}

fn read_record(session_dir: &Path, run_id: &str) -> RunRecord {
    let path = session_dir.join(".hyperagent").join(format!("{run_id}.json"));
    let content = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("missing provenance record {}: {e}", path.display()));
    serde_json::from_str(&content).unwrap()
}

#[tokio::test]
async fn test_single_agent_run_completes() {
    let dir = tempfile::tempdir().unwrap();
    let provider = StubProvider::new(&[("agent", &[r#"{"status":"ok"}"#])]);
    let (events, callback) = collect_events();

    let doc = document(json!({
        "id": "solo.v1",
        "sessions": { "roles": [{ "role": "agent" }] },
        "parsers": { "freeform": { "type": "unknown" } },
        "roles": { "agent": { "systemPrompt": "Reply with status JSON.", "parser": "freeform" } },
        "flow": {
            "round": {
                "maxRounds": 1,
                "defaultOutcome": { "outcome": "max-rounds" },
                "steps": [{
                    "key": "agent",
                    "type": "agent",
                    "role": "agent",
                    "prompt": ["Go."],
                    "exits": [{ "condition": "always", "outcome": "completed" }]
                }]
            }
        }
    }));

    let handle = run_workflow(
        doc,
        RunOptions::new(dir.path(), provider).with_stream(callback),
    )
    .unwrap();
    let run_id = handle.run_id().to_string();
    let result = handle.result().await.unwrap();

    assert_eq!(result.outcome, "completed");
    assert_eq!(result.rounds.len(), 1);
    assert_eq!(result.rounds[0].steps, vec!["agent"]);
    assert_eq!(result.run_id, run_id);

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].step, "agent");
    assert_eq!(events[0].parts, vec![r#"{"status":"ok"}"#]);

    let record = read_record(dir.path(), &run_id);
    assert_eq!(record.workflow_id, "solo.v1");
    assert_eq!(record.agents.len(), 1);
    assert_eq!(record.agents[0].role, "agent");
    assert!(record.log.iter().any(|entry| entry.role == "user"));
    assert!(record.log.iter().any(|entry| entry.role == "solo.v1.agent"));
    assert!(record.finished_at.is_some());
    assert_eq!(record.result.unwrap().outcome, "completed");
}

#[tokio::test]
async fn test_verifier_loop_approves_on_third_round() {
    let dir = tempfile::tempdir().unwrap();
    let provider = StubProvider::new(&[
        ("worker", &["did the work", "reworked it", "final polish"]),
        (
            "verifier",
            &[
                r#"{"status":"instruct","critique":"tighten the tests"}"#,
                r#"{"status":"instruct","critique":"fix the lint"}"#,
                r#"{"status":"approve"}"#,
            ],
        ),
    ]);

    let doc = document(json!({
        "id": "review-loop.v1",
        "sessions": { "roles": [{ "role": "worker" }, { "role": "verifier" }] },
        "parsers": {
            "freeform": { "type": "unknown" },
            "verdict": {
                "type": "object",
                "properties": {
                    "status": { "type": "string", "enum": ["instruct", "approve", "fail"] },
                    "critique": { "type": "string", "default": "" }
                },
                "required": ["status"]
            }
        },
        "roles": {
            "worker": { "systemPrompt": "Do the work.", "parser": "freeform" },
            "verifier": { "systemPrompt": "Verify the work.", "parser": "verdict" }
        },
        "state": { "initial": { "latestCritique": "" } },
        "flow": {
            "round": {
                "maxRounds": 5,
                "defaultOutcome": { "outcome": "max-rounds", "reason": "no approval" },
                "steps": [
                    {
                        "key": "work",
                        "type": "agent",
                        "role": "worker",
                        "prompt": ["Address: {{state.latestCritique||\"initial pass\"}}"]
                    },
                    {
                        "key": "verify",
                        "type": "agent",
                        "role": "verifier",
                        "prompt": ["Check the latest work."],
                        "transitions": [
                            {
                                "condition": { "field": "parsed.status", "equals": "approve" },
                                "outcome": "approved",
                                "reason": "{{state.latestCritique}}"
                            },
                            {
                                "condition": { "field": "parsed.status", "equals": "instruct" },
                                "stateUpdates": { "latestCritique": "{{parsed.critique}}" }
                            },
                            {
                                "condition": { "field": "parsed.status", "equals": "fail" },
                                "outcome": "failed"
                            }
                        ]
                    }
                ]
            }
        }
    }));

    let handle = run_workflow(doc, RunOptions::new(dir.path(), provider)).unwrap();
    let result = handle.result().await.unwrap();

    assert_eq!(result.outcome, "approved");
    assert_eq!(result.rounds.len(), 3);
    // The reason template reads the state bag, which still holds the last
    // critique written in round two.
    assert_eq!(result.reason, "fix the lint");
    for record in &result.rounds {
        assert_eq!(record.steps, vec!["work", "verify"]);
    }
}

#[tokio::test]
async fn test_cli_write_then_append() {
    let dir = tempfile::tempdir().unwrap();
    let provider = StubProvider::new(&[("agent", &[r#"{"ok":true}"#])]);

    let doc = document(json!({
        "id": "cli-pipeline.v1",
        "sessions": { "roles": [{ "role": "agent" }] },
        "parsers": { "freeform": { "type": "unknown" } },
        "roles": { "agent": { "systemPrompt": "Confirm.", "parser": "freeform" } },
        "flow": {
            "round": {
                "maxRounds": 1,
                "defaultOutcome": { "outcome": "max-rounds" },
                "steps": [
                    {
                        "key": "write",
                        "type": "cli",
                        "command": "sh",
                        "args": ["-c", "printf 'hello from cli\\n' > cli-output.txt"]
                    },
                    {
                        "key": "append",
                        "type": "cli",
                        "command": "sh",
                        "args": ["-c", "printf 'cli step 2\\n' >> cli-output.txt"]
                    },
                    {
                        "key": "confirm",
                        "type": "agent",
                        "role": "agent",
                        "prompt": ["Did both steps succeed?"],
                        "exits": [{
                            "condition": { "field": "parsed.ok", "equals": true },
                            "outcome": "completed"
                        }]
                    }
                ]
            }
        }
    }));

    let handle = run_workflow(doc, RunOptions::new(dir.path(), provider)).unwrap();
    let run_id = handle.run_id().to_string();
    let result = handle.result().await.unwrap();

    assert_eq!(result.outcome, "completed");
    let contents = std::fs::read_to_string(dir.path().join("cli-output.txt")).unwrap();
    assert_eq!(contents, "hello from cli\ncli step 2\n");

    let record = read_record(dir.path(), &run_id);
    for step in ["write", "append"] {
        let entry = record
            .log
            .iter()
            .find(|e| e.role == format!("cli-pipeline.v1.cli.{step}"))
            .unwrap_or_else(|| panic!("no cli log entry for {step}"));
        assert_eq!(entry.payload["exitCode"], json!(0));
    }
}

#[tokio::test]
async fn test_binary_pipeline_bit_for_bit() {
    let dir = tempfile::tempdir().unwrap();
    let provider = StubProvider::new(&[]);
    let (events, callback) = collect_events();

    let doc = document(json!({
        "id": "binary.v1",
        "flow": {
            "round": {
                "maxRounds": 1,
                "defaultOutcome": { "outcome": "max-rounds" },
                "steps": [
                    {
                        "key": "emit",
                        "type": "cli",
                        "command": "printf",
                        "args": ["%b", "\\x00\\x01\\x02\\x03\\x04"],
                        "capture": "buffer"
                    },
                    {
                        "key": "hex",
                        "type": "cli",
                        "command": "sh",
                        "args": ["-c", "od -An -v -tx1 | tr -d ' \\n'"],
                        "stdinFrom": "steps.emit.parsed.stdoutBuffer",
                        "capture": "both",
                        "exits": [{
                            "condition": { "all": [
                                { "field": "parsed.stdout", "equals": "0001020304" },
                                { "field": "steps.emit.parsed.stdoutBuffer", "equals": "AAECAwQ=" }
                            ]},
                            "outcome": "bytes-ok"
                        }]
                    }
                ]
            }
        }
    }));

    let handle = run_workflow(
        doc,
        RunOptions::new(dir.path(), provider).with_stream(callback),
    )
    .unwrap();
    let result = handle.result().await.unwrap();

    assert_eq!(result.outcome, "bytes-ok");
    let events = events.lock().unwrap();
    let emit = events.iter().find(|e| e.step == "emit").unwrap();
    assert!(emit.parsed_summary.contains("AAECAwQ="));
}

fn referenced_cli_document() -> WorkflowDocument {
    document(json!({
        "id": "referenced-cli.v1",
        "user": {
            "filename": { "type": "string" },
            "content": { "type": "string" }
        },
        "flow": {
            "round": {
                "maxRounds": 1,
                "defaultOutcome": { "outcome": "incomplete" },
                "steps": [{
                    "key": "emit",
                    "type": "cli",
                    "command": "sh",
                    "args": ["-c", "printf %s \"$0\" > \"$1\"", "{{user.content}}", "{{user.filename}}"],
                    "exits": [{
                        "condition": { "field": "parsed.exitCode", "equals": 0 },
                        "outcome": "written"
                    }]
                }]
            }
        }
    }))
}

fn parent_document() -> WorkflowDocument {
    document(json!({
        "id": "parent.v1",
        "user": { "goalFile": { "type": "string" } },
        "flow": {
            "round": {
                "maxRounds": 1,
                "defaultOutcome": { "outcome": "no-child" },
                "steps": [{
                    "key": "delegate",
                    "type": "workflow",
                    "workflowId": "referenced-cli.v1",
                    "input": {
                        "filename": "{{user.goalFile}}",
                        "content": "hello child"
                    },
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "filename": { "type": "string" },
                            "content": { "type": "string" }
                        },
                        "required": ["filename", "content"]
                    },
                    "transitions": [{
                        "condition": { "all": [
                            { "field": "parsed.outcome", "equals": "written" },
                            { "field": "parsed.rounds", "equals": 1 }
                        ]},
                        "outcome": "child-completed"
                    }]
                }]
            }
        }
    }))
}

#[tokio::test]
async fn test_child_workflow_delegation() {
    let dir = tempfile::tempdir().unwrap();
    let provider = StubProvider::new(&[]);
    let mut registry = InMemoryWorkflowRegistry::new();
    registry.register(referenced_cli_document()).unwrap();

    let handle = run_workflow(
        parent_document(),
        RunOptions::new(dir.path(), provider)
            .with_user(json!({ "goalFile": "child-output.txt" }))
            .with_workflows(Arc::new(registry)),
    )
    .unwrap();
    let run_id = handle.run_id().to_string();
    let result = handle.result().await.unwrap();

    assert_eq!(result.outcome, "child-completed");
    let contents = std::fs::read_to_string(dir.path().join("child-output.txt")).unwrap();
    assert_eq!(contents, "hello child");

    // Parent and child each left a provenance record.
    let record = read_record(dir.path(), &run_id);
    let delegation = record
        .log
        .iter()
        .find(|e| e.role == "parent.v1.workflow.delegate")
        .expect("no delegation log entry");
    assert_eq!(delegation.payload["workflowId"], json!("referenced-cli.v1"));
    let entries = std::fs::read_dir(dir.path().join(".hyperagent")).unwrap().count();
    assert_eq!(entries, 2);
}

#[tokio::test]
async fn test_invalid_user_input_rejected_before_any_effect() {
    let dir = tempfile::tempdir().unwrap();
    let provider = StubProvider::new(&[]);
    let mut registry = InMemoryWorkflowRegistry::new();
    registry.register(referenced_cli_document()).unwrap();

    let error = run_workflow(
        parent_document(),
        RunOptions::new(dir.path(), provider)
            .with_user(json!({ "goalFile": 123 }))
            .with_workflows(Arc::new(registry)),
    )
    .err()
    .expect("expected input validation failure");

    assert!(matches!(error, WorkflowError::InputValidation { .. }));
    let message = error.to_string().to_lowercase();
    assert!(message.contains("invalid user input"));
    assert!(message.contains("goalfile"));
    assert!(!dir.path().join(".hyperagent").exists());
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn test_unknown_child_workflow_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let provider = StubProvider::new(&[]);

    let handle = run_workflow(
        parent_document(),
        RunOptions::new(dir.path(), provider)
            .with_user(json!({ "goalFile": "never.txt" }))
            .with_workflows(Arc::new(InMemoryWorkflowRegistry::new())),
    )
    .unwrap();
    let error = handle.result().await.unwrap_err();
    assert!(matches!(error, WorkflowError::UnknownWorkflow(id) if id == "referenced-cli.v1"));
}

#[tokio::test]
async fn test_bootstrap_runs_before_rounds() {
    let dir = tempfile::tempdir().unwrap();
    let provider = StubProvider::new(&[]);

    let doc = document(json!({
        "id": "bootstrap.v1",
        "state": { "initial": { "seeded": "no" } },
        "flow": {
            "bootstrap": {
                "key": "seed",
                "type": "transform",
                "template": { "marker": "ready" },
                "stateUpdates": { "seeded": "{{parsed.marker}}" }
            },
            "round": {
                "maxRounds": 1,
                "defaultOutcome": { "outcome": "max-rounds" },
                "steps": [{
                    "key": "echo",
                    "type": "transform",
                    "template": { "seeded": "{{state.seeded}}" },
                    "exits": [{
                        "condition": { "field": "parsed.seeded", "equals": "ready" },
                        "outcome": "done",
                        "reason": "{{state.seeded}}"
                    }]
                }]
            }
        }
    }));

    let handle = run_workflow(doc, RunOptions::new(dir.path(), provider)).unwrap();
    let result = handle.result().await.unwrap();
    assert_eq!(result.outcome, "done");
    assert_eq!(result.reason, "ready");
    // The bootstrap step is not part of any round.
    assert_eq!(result.rounds.len(), 1);
    assert_eq!(result.rounds[0].steps, vec!["echo"]);
}

#[tokio::test]
async fn test_max_rounds_exhaustion_uses_default_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let provider = StubProvider::new(&[]);

    let doc = document(json!({
        "id": "spin.v1",
        "flow": {
            "round": {
                "maxRounds": 2,
                "defaultOutcome": { "outcome": "max-rounds", "reason": "stopped after {{round}}" },
                "steps": [{ "key": "noop", "type": "transform", "template": { "tick": "{{round}}" } }]
            }
        }
    }));

    let handle = run_workflow(doc, RunOptions::new(dir.path(), provider)).unwrap();
    let result = handle.result().await.unwrap();
    assert_eq!(result.outcome, "max-rounds");
    assert_eq!(result.reason, "stopped after 2");
    assert_eq!(result.rounds.len(), 2);
}

#[tokio::test]
async fn test_cancellation_rejects_the_result() {
    let dir = tempfile::tempdir().unwrap();
    let provider = StubProvider::new(&[]);

    let doc = document(json!({
        "id": "slow.v1",
        "flow": {
            "round": {
                "maxRounds": 1,
                "defaultOutcome": { "outcome": "max-rounds" },
                "steps": [{
                    "key": "stall",
                    "type": "cli",
                    "command": "sleep",
                    "args": ["30"]
                }]
            }
        }
    }));

    let handle = run_workflow(doc, RunOptions::new(dir.path(), provider)).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    handle.cancel();
    let error = handle.result().await.unwrap_err();
    assert!(matches!(error, WorkflowError::Cancelled));
}

#[tokio::test]
async fn test_parse_error_is_fatal_for_strict_parsers() {
    let dir = tempfile::tempdir().unwrap();
    let provider = StubProvider::new(&[("judge", &["not json at all"])]);

    let doc = document(json!({
        "id": "strict.v1",
        "sessions": { "roles": [{ "role": "judge" }] },
        "parsers": {
            "verdict": {
                "type": "object",
                "properties": { "status": { "type": "string" } },
                "required": ["status"]
            }
        },
        "roles": { "judge": { "systemPrompt": "Judge.", "parser": "verdict" } },
        "flow": {
            "round": {
                "maxRounds": 1,
                "defaultOutcome": { "outcome": "max-rounds" },
                "steps": [{
                    "key": "judge",
                    "type": "agent",
                    "role": "judge",
                    "prompt": ["Verdict?"],
                    "exits": [{ "condition": "always", "outcome": "done" }]
                }]
            }
        }
    }));

    let handle = run_workflow(doc, RunOptions::new(dir.path(), provider)).unwrap();
    let run_id = handle.run_id().to_string();
    let error = handle.result().await.unwrap_err();
    assert!(matches!(error, WorkflowError::Parse { .. }));

    // The terminal provenance record names the error class.
    let record = read_record(dir.path(), &run_id);
    assert_eq!(record.result.unwrap().outcome, "error:parse");
}
