//! Workflow registry — resolves child workflow ids for `workflow` steps.

use std::collections::HashMap;

use crate::document::{validate_document, WorkflowDocument};
use crate::error::WorkflowError;

/// Resolves a workflow id to its document.
pub trait WorkflowRegistry: Send + Sync {
    fn resolve(&self, workflow_id: &str) -> Option<WorkflowDocument>;
}

/// Map-backed registry. Documents are validated on registration so a
/// resolved child can never fail structural checks mid-run.
#[derive(Default)]
pub struct InMemoryWorkflowRegistry {
    documents: HashMap<String, WorkflowDocument>,
}

impl InMemoryWorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, document: WorkflowDocument) -> Result<(), WorkflowError> {
        validate_document(&document)?;
        if self.documents.contains_key(&document.id) {
            return Err(WorkflowError::Schema(format!(
                "workflow '{}' is already registered",
                document.id
            )));
        }
        tracing::debug!("[WorkflowRegistry] Registered workflow '{}'", document.id);
        self.documents.insert(document.id.clone(), document);
        Ok(())
    }

    pub fn ids(&self) -> Vec<&str> {
        self.documents.keys().map(|s| s.as_str()).collect()
    }
}

impl WorkflowRegistry for InMemoryWorkflowRegistry {
    fn resolve(&self, workflow_id: &str) -> Option<WorkflowDocument> {
        self.documents.get(workflow_id).cloned()
    }
}
