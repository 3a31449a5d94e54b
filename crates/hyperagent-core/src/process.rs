//! Process spawning for cli steps.
//!
//! The orchestrator only consumes the [`ProcessRunner`] contract;
//! [`TokioProcessRunner`] is the default implementation. Stdin is fully
//! written (and closed) while stdout/stderr drain concurrently, so piped
//! byte buffers arrive bit-for-bit. A non-zero exit code is data, not an
//! error; only spawn and I/O failures fail the call.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::document::CaptureMode;
use crate::error::WorkflowError;

/// A fully rendered process invocation.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<StdinValue>,
    pub capture: CaptureMode,
}

/// What gets piped to the child's stdin.
#[derive(Debug, Clone)]
pub enum StdinValue {
    Text(String),
    Bytes(Vec<u8>),
}

impl StdinValue {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            StdinValue::Text(s) => s.into_bytes(),
            StdinValue::Bytes(b) => b,
        }
    }
}

/// Captured output of a finished process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub stdout_buffer: Option<Vec<u8>>,
    pub stderr_buffer: Option<Vec<u8>>,
    pub exit_code: i32,
}

/// Spawns a process and waits for it, honoring the cancellation token.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        request: ProcessRequest,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, WorkflowError>;
}

/// Default runner on top of `tokio::process`.
pub struct TokioProcessRunner {
    /// How long a cancelled child gets before the forced kill.
    grace: Duration,
}

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self {
            grace: Duration::from_secs(5),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

impl Default for TokioProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        request: ProcessRequest,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, WorkflowError> {
        tracing::debug!(
            "[ProcessRunner] Spawning: {} {:?} (cwd: {:?})",
            request.command,
            request.args,
            request.cwd
        );

        let mut command = tokio::process::Command::new(&request.command);
        command
            .args(&request.args)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &request.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| WorkflowError::Cli {
            step: request.command.clone(),
            details: format!("failed to spawn '{}': {e}", request.command),
        })?;

        // Writer and readers run concurrently; dropping stdin after the
        // final write signals EOF to the child.
        let writer = request.stdin.map(|stdin| {
            let mut handle = child.stdin.take().expect("stdin was piped");
            tokio::spawn(async move {
                let bytes = stdin.into_bytes();
                if let Err(e) = handle.write_all(&bytes).await {
                    tracing::debug!("[ProcessRunner] stdin write ended early: {e}");
                }
                let _ = handle.shutdown().await;
            })
        });

        let stdout_task = drain(child.stdout.take());
        let stderr_task = drain(child.stderr.take());

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| WorkflowError::Cli {
                step: request.command.clone(),
                details: format!("wait failed: {e}"),
            })?,
            _ = cancel.cancelled() => {
                tracing::info!("[ProcessRunner] Cancelling '{}'", request.command);
                let _ = child.start_kill();
                if tokio::time::timeout(self.grace, child.wait()).await.is_err() {
                    let _ = child.kill().await;
                }
                return Err(WorkflowError::Cancelled);
            }
        };

        if let Some(writer) = writer {
            let _ = writer.await;
        }
        let stdout_bytes = stdout_task.await.map_err(join_error)??;
        let stderr_bytes = stderr_task.await.map_err(join_error)??;

        let exit_code = status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&stdout_bytes).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_bytes).into_owned();
        let keep_buffers = matches!(request.capture, CaptureMode::Buffer | CaptureMode::Both);

        Ok(ProcessOutput {
            stdout,
            stderr,
            stdout_buffer: keep_buffers.then_some(stdout_bytes),
            stderr_buffer: keep_buffers.then_some(stderr_bytes),
            exit_code,
        })
    }
}

fn drain<R>(pipe: Option<R>) -> tokio::task::JoinHandle<Result<Vec<u8>, WorkflowError>>
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buffer)
                .await
                .map_err(|e| WorkflowError::Cli {
                    step: String::new(),
                    details: format!("output read failed: {e}"),
                })?;
        }
        Ok(buffer)
    })
}

fn join_error(e: tokio::task::JoinError) -> WorkflowError {
    WorkflowError::Internal(format!("output reader task failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: &str, args: &[&str]) -> ProcessRequest {
        ProcessRequest {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: None,
            stdin: None,
            capture: CaptureMode::Text,
        }
    }

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let runner = TokioProcessRunner::new();
        let output = runner
            .run(request("sh", &["-c", "printf hello; exit 3"]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.stdout, "hello");
        assert_eq!(output.exit_code, 3);
        assert!(output.stdout_buffer.is_none());
    }

    #[tokio::test]
    async fn test_stdin_bytes_roundtrip() {
        let runner = TokioProcessRunner::new();
        let mut req = request("cat", &[]);
        req.stdin = Some(StdinValue::Bytes(vec![0, 1, 2, 255]));
        req.capture = CaptureMode::Buffer;
        let output = runner.run(req, &CancellationToken::new()).await.unwrap();
        assert_eq!(output.stdout_buffer.as_deref(), Some(&[0u8, 1, 2, 255][..]));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_cli_error() {
        let runner = TokioProcessRunner::new();
        let err = runner
            .run(request("definitely-not-a-command-xyz", &[]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Cli { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let runner = TokioProcessRunner::new().with_grace(Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });
        let err = runner
            .run(request("sleep", &["30"]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Cancelled));
    }
}
