// CLI process backend
//
// Runs one process per message (`<command> <args...> <message>`) in the agent's
// working directory and streams its stdout line by line.

use async_trait::async_trait;
use ensemble_abstraction::{AgentBackend, BackendConfig, BackendError, ChunkStream, StreamChunk};
use futures::StreamExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{OnceLock, PoisonError, RwLock};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::descriptor::AgentDescriptor;

const DEFAULT_COMMAND: &str = "claude";
const DEFAULT_ARGS: &str = "-p";

/// Backend for Claude-like command-line agents.
#[derive(Debug)]
pub struct CliBackend {
    command: String,
    args: Vec<String>,
    working_dir: RwLock<PathBuf>,
    initialized: OnceLock<()>,
    shut_down: AtomicBool,
}

impl CliBackend {
    /// Reads `command` and `args` (whitespace separated) from the descriptor settings.
    ///
    /// # Errors
    /// Returns `InvalidSetting` if `command` is empty.
    pub fn new(descriptor: &AgentDescriptor) -> Result<Self, BackendError> {
        let command = descriptor
            .settings
            .get("command")
            .map_or(DEFAULT_COMMAND, String::as_str)
            .trim()
            .to_string();
        if command.is_empty() {
            return Err(BackendError::InvalidSetting {
                key: "command".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        let args = descriptor
            .settings
            .get("args")
            .map_or(DEFAULT_ARGS, String::as_str)
            .split_whitespace()
            .map(str::to_string)
            .collect();

        Ok(Self {
            command,
            args,
            working_dir: RwLock::new(descriptor.working_dir.clone()),
            initialized: OnceLock::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    fn spawn(&self, message: &str) -> Result<Child, BackendError> {
        let working_dir = self.working_dir.read().unwrap_or_else(PoisonError::into_inner).clone();
        Command::new(&self.command)
            .args(&self.args)
            .arg(message)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::Transport(format!("failed to spawn '{}': {e}", self.command)))
    }
}

struct CliRun {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    cancel: CancellationToken,
}

impl CliRun {
    async fn next_item(mut self) -> Option<(Result<StreamChunk, BackendError>, Option<Self>)> {
        let line = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                if let Err(e) = self.child.kill().await {
                    warn!(error = %e, "Failed to kill agent process");
                }
                return Some((Err(BackendError::Cancelled), None));
            }
            line = self.lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => Some((Ok(StreamChunk::text(format!("{line}\n"))), Some(self))),
            Ok(None) => {
                let chunk = match self.child.wait().await {
                    Ok(status) if status.success() => StreamChunk::Complete,
                    Ok(status) => StreamChunk::error(
                        "exit_status",
                        format!("agent process exited with {status}"),
                    ),
                    Err(e) => return Some((Err(BackendError::Transport(e.to_string())), None)),
                };
                Some((Ok(chunk), None))
            }
            Err(e) => Some((Err(BackendError::Transport(e.to_string())), None)),
        }
    }
}

#[async_trait]
impl AgentBackend for CliBackend {
    async fn initialize(&self, config: &BackendConfig) -> Result<(), BackendError> {
        let metadata = tokio::fs::metadata(&config.working_dir).await.map_err(|e| {
            BackendError::Initialization(format!(
                "working directory {} is not accessible: {e}",
                config.working_dir.display()
            ))
        })?;
        if !metadata.is_dir() {
            return Err(BackendError::Initialization(format!(
                "{} is not a directory",
                config.working_dir.display()
            )));
        }

        *self.working_dir.write().unwrap_or_else(PoisonError::into_inner) =
            config.working_dir.clone();
        let _ = self.initialized.set(());
        debug!(agent_id = %config.agent_id, command = %self.command, "CLI backend ready");
        Ok(())
    }

    async fn send(&self, message: &str, cancel: CancellationToken) -> Result<ChunkStream, BackendError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BackendError::Transport("backend has been shut down".to_string()));
        }
        if self.initialized.get().is_none() {
            return Err(BackendError::Other("backend not initialized".to_string()));
        }

        let mut child = self.spawn(message)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Transport("agent process has no stdout".to_string()))?;
        let run = CliRun { child, lines: BufReader::new(stdout).lines(), cancel };

        Ok(futures::stream::unfold(Some(run), |state| async move {
            match state {
                Some(run) => run.next_item().await,
                None => None,
            }
        })
        .boxed())
    }

    async fn shutdown(&self) -> Result<(), BackendError> {
        // Processes are per message and die with their stream.
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}
