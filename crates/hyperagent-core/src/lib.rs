//! hyperagent-core — declarative multi-agent workflow orchestration.
//!
//! A workflow document describes a set of roles (LLM personas with system
//! prompts and response parsers), a shared key/value state bag, and a flow
//! of steps: LLM turns in persistent sessions, external command
//! invocations, nested workflows, and pure data transforms. Transitions
//! evaluated over parsed results update state, loop, or terminate the run
//! with a labeled outcome, and every run leaves a complete provenance
//! record on disk.
//!
//! # Architecture
//!
//! ```text
//! workflow.yaml ──► WorkflowDocument ──► run_workflow ──► RunHandle
//!                                            │
//!                                       flow engine ──► provenance file
//!                                            │
//!                        ┌───────────┬───────┴──────┬────────────┐
//!                     agent step  cli step   workflow step  transform
//!                        │           │              │
//!                 SessionProvider ProcessRunner  WorkflowRegistry
//! ```
//!
//! The LLM provider, process spawning, and provenance storage are
//! constructor-injected collaborators; the orchestrator itself is
//! deterministic given deterministic collaborators.

pub mod condition;
pub mod document;
mod engine;
pub mod error;
pub mod harness;
pub mod parser;
pub mod process;
pub mod provenance;
pub mod registry;
pub mod scope;
pub mod session;
pub mod step;
pub mod template;

// Convenience re-exports
pub use condition::{evaluate, Condition, LeafCondition};
pub use document::{
    validate_document, CaptureMode, RoleSpec, Step, StepKind, ToolPermissions, Transition,
    WorkflowDocument,
};
pub use error::WorkflowError;
pub use harness::{
    run_workflow, RoundRecord, RunHandle, RunOptions, RunResult, StreamCallback, StreamEvent,
};
pub use parser::{compile, ParserSchema, ValidationIssue, Validator};
pub use process::{
    ProcessOutput, ProcessRequest, ProcessRunner, StdinValue, TokioProcessRunner,
};
pub use provenance::{
    AgentRecord, FileProvenanceSink, LogRecord, ProvenanceEntry, ProvenanceSink, RunRecord,
};
pub use registry::{InMemoryWorkflowRegistry, WorkflowRegistry};
pub use session::{PromptReply, SessionHandle, SessionManager, SessionProvider};
pub use step::StepResult;
