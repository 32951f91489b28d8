//! Agent handles.
//!
//! An [`AgentHandle`] owns one live backend (a process or a connection) and
//! enforces the lifecycle in [`AgentState`]. Sends are serialized with a
//! fail-fast policy: a second concurrent send observes [`RuntimeError::AgentBusy`]
//! instead of queueing. Callers that want to wait retry with backoff.

use chrono::{DateTime, Utc};
use ensemble_abstraction::{AgentBackend, BackendError, StreamChunk};
use futures::StreamExt;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::descriptor::{AgentDescriptor, AgentKind};
use crate::error::{Result, RuntimeError};
use crate::lifecycle::AgentState;

/// Summary of a completed send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOutcome {
    /// Concatenated text deltas.
    pub text: String,
    /// Number of chunks forwarded.
    pub chunks: usize,
    /// Message of the first response-level error chunk, if any.
    pub error: Option<String>,
}

impl SendOutcome {
    /// Returns `true` if the response carried no error chunk.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Runtime object representing one live agent.
pub struct AgentHandle {
    descriptor: AgentDescriptor,
    backend: Arc<dyn AgentBackend>,
    state: Mutex<AgentState>,
    created_at: DateTime<Utc>,
    /// Cancelled on disposal; parent of every per-call token.
    lifetime: CancellationToken,
}

impl fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.descriptor.id)
            .field("kind", &self.descriptor.kind)
            .field("state", &self.state())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl AgentHandle {
    /// Wraps a backend in an uninitialized handle.
    pub fn new(descriptor: AgentDescriptor, backend: Arc<dyn AgentBackend>) -> Self {
        Self {
            descriptor,
            backend,
            state: Mutex::new(AgentState::Uninitialized),
            created_at: Utc::now(),
            lifetime: CancellationToken::new(),
        }
    }

    /// Returns the agent identifier.
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Returns the agent kind.
    pub fn kind(&self) -> AgentKind {
        self.descriptor.kind
    }

    /// Returns the descriptor the handle was built from.
    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    /// Returns when the handle was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the current state.
    pub fn state(&self) -> AgentState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies a transition if it is valid.
    ///
    /// Returns the previous state, or the current state if the transition was
    /// rejected.
    fn transition(&self, to: AgentState) -> std::result::Result<AgentState, AgentState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let from = *state;
        if !from.can_transition_to(to) {
            error!(agent_id = %self.id(), from = %from, to = %to, "Invalid state transition");
            return Err(from);
        }
        debug!(agent_id = %self.id(), from = %from, to = %to, "State transition");
        *state = to;
        Ok(from)
    }

    fn unavailable(&self, state: AgentState) -> RuntimeError {
        match state {
            AgentState::Busy => RuntimeError::AgentBusy(self.id().to_string()),
            AgentState::ShuttingDown | AgentState::Disposed => {
                RuntimeError::AgentDisposed(self.id().to_string())
            }
            other => RuntimeError::AgentNotReady {
                agent_id: self.id().to_string(),
                state: other.to_string(),
            },
        }
    }

    /// Starts the backend.
    ///
    /// A failure leaves the handle in `Error`; it will not be retried here.
    ///
    /// # Errors
    /// Returns `InitializationFailed` if the backend reports a failure, or the
    /// state error if the handle is not `Uninitialized`.
    pub async fn initialize(&self) -> Result<()> {
        self.transition(AgentState::Initializing).map_err(|state| self.unavailable(state))?;

        match self.backend.initialize(&self.descriptor.backend_config()).await {
            Ok(()) => {
                if self.transition(AgentState::Ready).is_err() {
                    // Disposed while starting up
                    return Err(RuntimeError::AgentDisposed(self.id().to_string()));
                }
                info!(agent_id = %self.id(), kind = %self.kind(), "Agent initialized");
                Ok(())
            }
            Err(e) => {
                let _ = self.transition(AgentState::Error);
                warn!(agent_id = %self.id(), error = %e, "Agent initialization failed");
                Err(RuntimeError::InitializationFailed {
                    agent_id: self.id().to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Moves the handle to `Busy` for the lifetime of the returned lease.
    ///
    /// # Errors
    /// `AgentBusy` if another call holds the handle, `AgentDisposed` after
    /// disposal, `AgentNotReady` otherwise.
    pub fn try_reserve(&self) -> Result<BusyLease<'_>> {
        self.transition(AgentState::Busy).map_err(|state| self.unavailable(state))?;
        Ok(BusyLease { handle: self, failed: false })
    }

    /// Sends a message and forwards every chunk to `on_chunk` in arrival order.
    ///
    /// When `cancel` fires the backend is cancelled, nothing further is
    /// forwarded, and the handle returns to `Ready`.
    ///
    /// # Errors
    /// `Cancelled` on cancellation, `AgentDisposed` if the handle is disposed
    /// mid-call, `Backend` on a transport failure (the handle moves to `Error`),
    /// or any reservation error from [`try_reserve`](Self::try_reserve).
    pub async fn send<F>(
        &self,
        message: &str,
        cancel: &CancellationToken,
        mut on_chunk: F,
    ) -> Result<SendOutcome>
    where
        F: FnMut(StreamChunk) + Send,
    {
        let mut lease = self.try_reserve()?;
        let call_token = self.lifetime.child_token();

        let stream = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                call_token.cancel();
                return Err(self.interrupted());
            }
            result = self.backend.send(message, call_token.clone()) => result,
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                lease.fail();
                warn!(agent_id = %self.id(), error = %e, "Backend rejected message");
                return Err(e.into());
            }
        };

        let mut outcome = SendOutcome::default();
        loop {
            let item = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    call_token.cancel();
                    debug!(agent_id = %self.id(), "Send cancelled");
                    return Err(self.interrupted());
                }
                () = call_token.cancelled() => return Err(self.interrupted()),
                item = stream.next() => item,
            };

            match item {
                None => break,
                Some(Ok(chunk)) => {
                    let terminal = chunk.is_terminal();
                    match &chunk {
                        StreamChunk::TextDelta { text } => outcome.text.push_str(text),
                        StreamChunk::Error { message, .. } if outcome.error.is_none() => {
                            outcome.error = Some(message.clone());
                        }
                        _ => {}
                    }
                    outcome.chunks += 1;
                    on_chunk(chunk);
                    if terminal {
                        break;
                    }
                }
                Some(Err(BackendError::Cancelled)) => return Err(self.interrupted()),
                Some(Err(e)) => {
                    lease.fail();
                    warn!(agent_id = %self.id(), error = %e, "Backend stream failed");
                    return Err(e.into());
                }
            }
        }

        debug!(agent_id = %self.id(), chunks = outcome.chunks, "Send completed");
        Ok(outcome)
    }

    fn interrupted(&self) -> RuntimeError {
        if self.lifetime.is_cancelled() {
            RuntimeError::AgentDisposed(self.id().to_string())
        } else {
            RuntimeError::Cancelled
        }
    }

    /// Shuts the backend down and moves the handle to `Disposed`.
    ///
    /// Idempotent: the backend's shutdown runs at most once. A shutdown
    /// failure is returned for logging, but the handle is `Disposed` either way.
    ///
    /// # Errors
    /// Returns the backend's shutdown error.
    pub async fn dispose(&self) -> std::result::Result<(), BackendError> {
        if self.transition(AgentState::ShuttingDown).is_err() {
            return Ok(());
        }
        self.lifetime.cancel();

        let result = self.backend.shutdown().await;
        let _ = self.transition(AgentState::Disposed);

        match &result {
            Ok(()) => info!(agent_id = %self.id(), "Agent disposed"),
            Err(e) => warn!(agent_id = %self.id(), error = %e, "Agent shutdown reported an error"),
        }
        result
    }
}

/// Keeps a handle `Busy` until dropped.
///
/// On drop the handle returns to `Ready`, or to `Error` if
/// [`fail`](Self::fail) was called. A handle that started shutting down in the
/// meantime is left alone.
#[derive(Debug)]
pub struct BusyLease<'a> {
    handle: &'a AgentHandle,
    failed: bool,
}

impl BusyLease<'_> {
    /// Marks the call as failed at the transport level.
    pub fn fail(&mut self) {
        self.failed = true;
    }
}

impl Drop for BusyLease<'_> {
    fn drop(&mut self) {
        if self.handle.state() != AgentState::Busy {
            return;
        }
        let next = if self.failed { AgentState::Error } else { AgentState::Ready };
        let _ = self.handle.transition(next);
    }
}
