// Error types for the agent runtime

use ensemble_abstraction::BackendError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::descriptor::AgentKind;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Runtime errors
///
/// `Clone` so a single failed creation can be handed to every caller waiting
/// on it.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// No backend builder is registered for the requested kind
    #[error("Unsupported agent kind: {0}")]
    UnsupportedKind(AgentKind),

    /// The backend refused to initialize
    #[error("Agent '{agent_id}' failed to initialize: {reason}")]
    InitializationFailed {
        /// Agent identifier
        agent_id: String,
        /// Reason reported by the backend
        reason: String,
    },

    /// Tool call parameters do not match the declared schema
    #[error("Tool call validation failed: {}", .0.join("; "))]
    ValidationFailed(Vec<String>),

    /// The approval policy or a reviewer denied the call
    #[error("Tool '{tool}' was denied: {reason}")]
    ApprovalDenied {
        /// Tool name
        tool: String,
        /// Denial reason
        reason: String,
    },

    /// No approval decision arrived in time
    #[error("Approval for tool '{tool}' timed out after {}s", waited.as_secs())]
    ApprovalTimedOut {
        /// Tool name
        tool: String,
        /// How long the gate waited
        waited: Duration,
    },

    /// A bounded operation exceeded its wall-clock budget
    #[error("{operation} timed out after {}s", limit.as_secs())]
    ExecutionTimeout {
        /// What timed out
        operation: String,
        /// The configured limit
        limit: Duration,
    },

    /// The agent is already serving another call
    #[error("Agent '{0}' is busy")]
    AgentBusy(String),

    /// The agent has been disposed
    #[error("Agent '{0}' has been disposed")]
    AgentDisposed(String),

    /// The agent is not in a state that accepts work
    #[error("Agent '{agent_id}' is not ready (state: {state})")]
    AgentNotReady {
        /// Agent identifier
        agent_id: String,
        /// Current state name
        state: String,
    },

    /// A plan step failed
    #[error("Plan '{plan_id}' step {step} failed: {reason}")]
    PlanStepFailed {
        /// Plan identifier
        plan_id: String,
        /// Step order index
        step: usize,
        /// Failure reason
        reason: String,
    },

    /// The plan is already executing and can no longer be edited
    #[error("Plan '{0}' is locked for execution")]
    PlanLocked(String),

    /// No descriptor exists for the agent
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// A tool handler reported a failure
    #[error("Tool '{tool}' failed: {reason}")]
    ToolFailed {
        /// Tool name
        tool: String,
        /// Failure reported by the handler
        reason: String,
    },

    /// No pending approval exists for the request
    #[error("No pending approval for request {0}")]
    UnknownApprovalRequest(String),

    /// The operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Backend error
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The runtime no longer accepts requests
    #[error("Runtime is shutting down")]
    ShuttingDown,
}

impl RuntimeError {
    /// Returns the machine-readable kind used in error events.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedKind(_) => ErrorKind::UnsupportedKind,
            Self::InitializationFailed { .. } => ErrorKind::InitializationFailed,
            Self::ValidationFailed(_) => ErrorKind::ValidationFailed,
            Self::ToolFailed { .. } => ErrorKind::ToolFailed,
            Self::ApprovalDenied { .. } => ErrorKind::ApprovalDenied,
            Self::ApprovalTimedOut { .. } => ErrorKind::ApprovalTimedOut,
            Self::ExecutionTimeout { .. } => ErrorKind::ExecutionTimeout,
            Self::AgentBusy(_) | Self::AgentNotReady { .. } => ErrorKind::AgentBusy,
            Self::AgentDisposed(_) => ErrorKind::AgentDisposed,
            Self::PlanStepFailed { .. } => ErrorKind::PlanStepFailed,
            Self::PlanLocked(_) | Self::AgentNotFound(_) | Self::UnknownApprovalRequest(_) => {
                ErrorKind::InvalidRequest
            }
            Self::Cancelled | Self::ShuttingDown => ErrorKind::Cancelled,
            Self::Backend(_) => ErrorKind::Backend,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Returns `true` for conditions a caller may retry with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::AgentBusy(_))
    }
}

/// Machine-readable error classification carried by error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnsupportedKind,
    InitializationFailed,
    ValidationFailed,
    ApprovalDenied,
    ApprovalTimedOut,
    ExecutionTimeout,
    ToolFailed,
    AgentBusy,
    AgentDisposed,
    PlanStepFailed,
    InvalidRequest,
    Cancelled,
    Backend,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UnsupportedKind => "unsupported_kind",
            Self::InitializationFailed => "initialization_failed",
            Self::ValidationFailed => "validation_failed",
            Self::ApprovalDenied => "approval_denied",
            Self::ApprovalTimedOut => "approval_timed_out",
            Self::ExecutionTimeout => "execution_timeout",
            Self::ToolFailed => "tool_failed",
            Self::AgentBusy => "agent_busy",
            Self::AgentDisposed => "agent_disposed",
            Self::PlanStepFailed => "plan_step_failed",
            Self::InvalidRequest => "invalid_request",
            Self::Cancelled => "cancelled",
            Self::Backend => "backend",
            Self::Config => "config",
        };
        f.write_str(name)
    }
}
