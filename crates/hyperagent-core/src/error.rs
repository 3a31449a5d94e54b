//! Core error type for the hyperagent orchestrator.
//!
//! One enum covers the whole crate. Non-zero CLI exit codes are *not*
//! errors — they surface as data in the step result so transitions can
//! inspect them.

/// Fatal failures a run can produce. Callers pattern-match on the variant.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Workflow document or schema invalid. Reported at harness start.
    #[error("Schema error: {0}")]
    Schema(String),

    /// Run input failed the document's `user` schema.
    #[error("Invalid user inputs for workflow {workflow_id}: {details}")]
    InputValidation { workflow_id: String, details: String },

    /// Malformed template expression.
    #[error("Template error: {0}")]
    Template(String),

    /// Agent reply could not be parsed against its role parser.
    #[error("Parse error in step '{step}': {details}")]
    Parse { step: String, details: String },

    /// Process spawn or I/O failure (not a non-zero exit).
    #[error("CLI error in step '{step}': {details}")]
    Cli { step: String, details: String },

    /// A `workflow` step referenced an id the registry cannot resolve.
    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// A child workflow failed with an uncaught fatal error.
    #[error("Child workflow '{workflow_id}' failed (run {run_id}): {details}")]
    ChildWorkflow {
        workflow_id: String,
        run_id: String,
        details: String,
    },

    /// Session provider failure (session creation, prompt, diff).
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provenance log could not be written.
    #[error("Provenance error: {0}")]
    Provenance(String),

    /// The run was cancelled through its handle.
    #[error("Run cancelled")]
    Cancelled,

    /// Infrastructure failure (worker panic, join error).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkflowError {
    /// Short class name recorded in the provenance terminal record.
    pub fn class(&self) -> &'static str {
        match self {
            WorkflowError::Schema(_) => "schema",
            WorkflowError::InputValidation { .. } => "input-validation",
            WorkflowError::Template(_) => "template",
            WorkflowError::Parse { .. } => "parse",
            WorkflowError::Cli { .. } => "cli",
            WorkflowError::UnknownWorkflow(_) => "unknown-workflow",
            WorkflowError::ChildWorkflow { .. } => "child-workflow",
            WorkflowError::Provider(_) => "provider",
            WorkflowError::Provenance(_) => "provenance",
            WorkflowError::Cancelled => "cancelled",
            WorkflowError::Internal(_) => "internal",
        }
    }
}
