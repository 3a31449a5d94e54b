//! Persistent provenance — the append-only per-run audit record.
//!
//! Every run owns one JSON file at `<sessionDir>/.hyperagent/<runId>.json`
//! holding the agents it registered, the ordered log of prompts, replies,
//! CLI invocations and delegations, and the terminal result. The file is
//! rewritten through a temp-file-and-rename so readers never observe a
//! partial record.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::WorkflowError;
use crate::harness::RunResult;

/// Directory under the session dir holding run records.
pub const PROVENANCE_DIR: &str = ".hyperagent";

/// Default truncation cap for stdout/stderr payloads, in characters.
pub const DEFAULT_LOG_CAP: usize = 4096;

/// The complete per-run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: String,
    pub workflow_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub agents: Vec<AgentRecord>,
    #[serde(default)]
    pub log: Vec<LogRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RunResult>,
}

/// A session registered for a role during the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub role: String,
    pub session_id: String,
    pub name: String,
}

/// One log line. `role` is `"user"`, `"<label>.<role>"`,
/// `"<label>.cli.<stepKey>"` or `"<label>.workflow.<stepKey>"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub role: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl LogRecord {
    pub fn new(role: impl Into<String>, payload: Value) -> Self {
        Self {
            role: role.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// An appendable unit.
#[derive(Debug, Clone)]
pub enum ProvenanceEntry {
    Agent(AgentRecord),
    Log(LogRecord),
}

/// Where run records land. The engine appends in temporal order and
/// finalizes exactly once per run.
#[async_trait]
pub trait ProvenanceSink: Send + Sync {
    async fn open(&self, run_id: &str, workflow_id: &str) -> Result<(), WorkflowError>;
    async fn append(&self, run_id: &str, entry: ProvenanceEntry) -> Result<(), WorkflowError>;
    async fn finalize(&self, run_id: &str, result: &RunResult) -> Result<(), WorkflowError>;
}

/// File-backed sink writing one JSON record per run.
pub struct FileProvenanceSink {
    base_dir: PathBuf,
    records: Mutex<HashMap<String, RunRecord>>,
}

impl FileProvenanceSink {
    /// Records land under `<session_dir>/.hyperagent/`.
    pub fn new(session_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: session_dir.as_ref().join(PROVENANCE_DIR),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_path(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(format!("{run_id}.json"))
    }

    async fn persist(&self, record: &RunRecord) -> Result<(), WorkflowError> {
        tokio::fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| {
                WorkflowError::Provenance(format!(
                    "failed to create {}: {e}",
                    self.base_dir.display()
                ))
            })?;

        let path = self.record_path(&record.id);
        let tmp = self.base_dir.join(format!(".{}.json.tmp", record.id));
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| WorkflowError::Provenance(format!("serialization failed: {e}")))?;

        tokio::fs::write(&tmp, &json).await.map_err(|e| {
            WorkflowError::Provenance(format!("failed to write {}: {e}", tmp.display()))
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            WorkflowError::Provenance(format!("failed to replace {}: {e}", path.display()))
        })?;
        Ok(())
    }
}

#[async_trait]
impl ProvenanceSink for FileProvenanceSink {
    async fn open(&self, run_id: &str, workflow_id: &str) -> Result<(), WorkflowError> {
        let record = RunRecord {
            id: run_id.to_string(),
            workflow_id: workflow_id.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            agents: Vec::new(),
            log: Vec::new(),
            result: None,
        };
        self.persist(&record).await?;
        self.records.lock().await.insert(run_id.to_string(), record);
        Ok(())
    }

    async fn append(&self, run_id: &str, entry: ProvenanceEntry) -> Result<(), WorkflowError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(run_id)
            .ok_or_else(|| WorkflowError::Provenance(format!("unknown run '{run_id}'")))?;
        match entry {
            ProvenanceEntry::Agent(agent) => record.agents.push(agent),
            ProvenanceEntry::Log(log) => record.log.push(log),
        }
        let snapshot = record.clone();
        drop(records);
        self.persist(&snapshot).await
    }

    async fn finalize(&self, run_id: &str, result: &RunResult) -> Result<(), WorkflowError> {
        let mut records = self.records.lock().await;
        let mut record = records
            .remove(run_id)
            .ok_or_else(|| WorkflowError::Provenance(format!("unknown run '{run_id}'")))?;
        record.finished_at = Some(Utc::now());
        record.result = Some(result.clone());
        drop(records);
        self.persist(&record).await
    }
}

/// Truncate a payload string to the log cap, marking the cut.
pub fn truncate_text(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    let truncated: String = text.chars().take(cap).collect();
    format!("{truncated}… (truncated)")
}
