//! Agent backend abstraction layer for Ensemble.
//!
//! This module defines the capability interface every agent backend implements
//! (a CLI process, an HTTP provider, ...) and the chunk types a backend streams
//! back while answering a message.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Represents an error reported by an agent backend.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendError {
    /// The backend could not be brought up (missing binary, bad credentials, ...).
    #[error("Initialization Error: {0}")]
    Initialization(String),

    /// The underlying process or connection failed mid-flight.
    #[error("Transport Error: {0}")]
    Transport(String),

    /// A required setting is missing or malformed.
    #[error("Invalid Setting '{key}': {reason}")]
    InvalidSetting {
        /// The settings key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The operation was cancelled through its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// Shutting the backend down failed.
    #[error("Shutdown Error: {0}")]
    Shutdown(String),

    /// Other unexpected errors.
    #[error("Other Backend Error: {0}")]
    Other(String),
}

/// Discriminator carried by every [`StreamChunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    /// Incremental text.
    TextDelta,
    /// The agent asks for a tool to be invoked.
    ToolCall,
    /// Free-form status update.
    Status,
    /// Response-level error.
    Error,
    /// End-of-response marker.
    Complete,
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TextDelta => write!(f, "text_delta"),
            Self::ToolCall => write!(f, "tool_call"),
            Self::Status => write!(f, "status"),
            Self::Error => write!(f, "error"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// A unit of an in-flight response.
///
/// Chunks of one response are delivered in the order the backend produced them;
/// no ordering exists across different responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// A piece of response text.
    TextDelta {
        /// The text fragment.
        text: String,
    },
    /// The agent requested a tool invocation.
    ToolCallRequest {
        /// Backend-assigned call identifier.
        call_id: String,
        /// Name of the tool.
        tool_name: String,
        /// Raw arguments as produced by the agent.
        arguments: serde_json::Value,
    },
    /// A status update (e.g. "thinking", "tool started").
    Status {
        /// Human-readable status message.
        message: String,
    },
    /// The response failed.
    Error {
        /// Machine-readable error kind.
        kind: String,
        /// Error message.
        message: String,
    },
    /// The response is complete.
    Complete,
}

impl StreamChunk {
    /// Convenience constructor for a text delta.
    pub fn text(text: impl Into<String>) -> Self {
        Self::TextDelta { text: text.into() }
    }

    /// Convenience constructor for a status update.
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status { message: message.into() }
    }

    /// Convenience constructor for an error chunk.
    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error { kind: kind.into(), message: message.into() }
    }

    /// Returns the discriminator of this chunk.
    #[must_use]
    pub fn response_type(&self) -> ResponseType {
        match self {
            Self::TextDelta { .. } => ResponseType::TextDelta,
            Self::ToolCallRequest { .. } => ResponseType::ToolCall,
            Self::Status { .. } => ResponseType::Status,
            Self::Error { .. } => ResponseType::Error,
            Self::Complete => ResponseType::Complete,
        }
    }

    /// Returns `true` for chunks that end a response.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// The stream a backend returns for one message.
///
/// An `Err` item is a transport failure; response-level errors travel as
/// [`StreamChunk::Error`].
pub type ChunkStream = BoxStream<'static, Result<StreamChunk, BackendError>>;

/// Configuration handed to a backend when it is initialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Identifier of the agent the backend serves.
    pub agent_id: String,
    /// Working directory for the agent.
    pub working_dir: PathBuf,
    /// Provider-specific settings.
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

impl BackendConfig {
    /// Returns a required setting or an [`BackendError::InvalidSetting`].
    pub fn require(&self, key: &str) -> Result<&str, BackendError> {
        self.settings.get(key).map(String::as_str).ok_or_else(|| BackendError::InvalidSetting {
            key: key.to_string(),
            reason: "missing".to_string(),
        })
    }

    /// Returns an optional setting.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }
}

/// Capability interface implemented by every agent backend.
///
/// Backends must be `Send + Sync`; the runtime guarantees at most one
/// outstanding `send` per backend instance.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Brings the backend up.
    ///
    /// # Errors
    /// Returns a `BackendError` if the backend cannot start.
    async fn initialize(&self, config: &BackendConfig) -> Result<(), BackendError>;

    /// Sends a message and returns the stream of response chunks.
    ///
    /// The backend should stop producing chunks once `cancel` fires.
    ///
    /// # Errors
    /// Returns a `BackendError` if the message cannot be dispatched.
    async fn send(
        &self,
        message: &str,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, BackendError>;

    /// Releases the process or connection owned by the backend.
    ///
    /// # Errors
    /// Returns a `BackendError` if shutdown fails; callers log and move on.
    async fn shutdown(&self) -> Result<(), BackendError>;
}
