//! Sessions against the external LLM provider.
//!
//! The orchestrator never talks to a model directly; it consumes the
//! [`SessionProvider`] contract. The [`SessionManager`] resolves one
//! session per role and run: declared sessions render their `nameTemplate`
//! over `{runId}`, existing sessions with that name are reused, and new
//! ones are created after the role definition is registered (the
//! provider's per-directory cache must be invalidated after a definition
//! is written).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::document::{RoleSpec, SessionsSpec, ToolPermissions};
use crate::error::WorkflowError;
use crate::template;

/// A provider-side conversation handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHandle {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One prompt round-trip: the reply's text parts plus the provider's
/// message id (usable with [`SessionProvider::message_diff`]).
#[derive(Debug, Clone, Default)]
pub struct PromptReply {
    pub parts: Vec<String>,
    pub message_id: Option<String>,
}

/// The LLM provider the core consumes. Implementations must be safe for
/// concurrent use across runs.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn create_session(
        &self,
        dir: &Path,
        name: Option<&str>,
    ) -> Result<SessionHandle, WorkflowError>;

    async fn list_sessions(&self, dir: &Path) -> Result<Vec<SessionHandle>, WorkflowError>;

    async fn prompt(
        &self,
        session: &SessionHandle,
        parts: &[String],
        model: Option<&str>,
        agent_name: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<PromptReply, WorkflowError>;

    /// Per-message file diff, for reconstructing what a role touched.
    async fn message_diff(
        &self,
        session: &SessionHandle,
        message_id: &str,
    ) -> Result<Value, WorkflowError>;

    /// Write a role definition the provider will load for `name`.
    async fn register_agent_definition(
        &self,
        dir: &Path,
        name: &str,
        model: Option<&str>,
        system_prompt: &str,
        tools: &ToolPermissions,
    ) -> Result<(), WorkflowError>;

    /// Drop any per-directory caches. Required after
    /// [`register_agent_definition`](Self::register_agent_definition).
    async fn invalidate(&self, dir: &Path);
}

/// Outcome of a session resolution: the handle, plus whether it was
/// freshly created (fresh sessions are recorded in provenance).
pub struct ResolvedSession {
    pub handle: SessionHandle,
    pub name: String,
    pub created: bool,
}

/// Resolves and caches one session per role for a single run.
pub struct SessionManager {
    provider: Arc<dyn SessionProvider>,
    session_dir: PathBuf,
    run_id: String,
    /// role → nameTemplate, from the document's session declarations.
    declared: HashMap<String, Option<String>>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionManager {
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        session_dir: PathBuf,
        run_id: String,
        sessions: &SessionsSpec,
    ) -> Self {
        let declared = sessions
            .roles
            .iter()
            .map(|s| (s.role.clone(), s.name_template.clone()))
            .collect();
        Self {
            provider,
            session_dir,
            run_id,
            declared,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn SessionProvider> {
        &self.provider
    }

    /// Return the session for a role, creating it on first use.
    pub async fn session_for(
        &self,
        role: &str,
        spec: &RoleSpec,
        model: Option<&str>,
    ) -> Result<ResolvedSession, WorkflowError> {
        let name = self.session_name(role)?;

        {
            let cache = self.sessions.lock().await;
            if let Some(handle) = cache.get(role) {
                return Ok(ResolvedSession {
                    handle: handle.clone(),
                    name,
                    created: false,
                });
            }
        }

        let existing = self
            .provider
            .list_sessions(&self.session_dir)
            .await?
            .into_iter()
            .find(|s| s.name.as_deref() == Some(name.as_str()));

        let (handle, created) = match existing {
            Some(handle) => {
                tracing::info!("[SessionManager] Reusing session '{name}' for role '{role}'");
                (handle, false)
            }
            None => {
                self.provider
                    .register_agent_definition(
                        &self.session_dir,
                        &name,
                        model,
                        &spec.system_prompt,
                        &spec.tools,
                    )
                    .await?;
                // The definition just landed on disk; stale caches would
                // hand out a session that never saw it.
                self.provider.invalidate(&self.session_dir).await;
                let handle = self
                    .provider
                    .create_session(&self.session_dir, Some(&name))
                    .await?;
                tracing::info!(
                    "[SessionManager] Created session '{}' ({}) for role '{role}'",
                    name,
                    handle.id
                );
                (handle, true)
            }
        };

        self.sessions
            .lock()
            .await
            .insert(role.to_string(), handle.clone());

        Ok(ResolvedSession {
            handle,
            name,
            created,
        })
    }

    /// The session name for a role: the declared `nameTemplate` rendered
    /// over `{runId}`, or `<runId>.<role>`.
    fn session_name(&self, role: &str) -> Result<String, WorkflowError> {
        match self.declared.get(role) {
            Some(Some(template)) => {
                template::render(template, &json!({ "runId": &self.run_id }))
            }
            _ => Ok(format!("{}.{role}", self.run_id)),
        }
    }
}
