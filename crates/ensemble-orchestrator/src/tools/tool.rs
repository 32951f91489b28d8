// Tool abstractions
//
// Tools are actions an agent may ask the runtime to perform on its behalf.
// This module defines the call, schema, result and handler types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;

/// Request to run a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique ID for this tool call
    pub id: String,
    /// Name of the tool to invoke
    pub tool_name: String,
    /// Arguments, keyed by parameter name
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    /// Agent that asked for the call
    pub agent_id: String,
    /// Session the call belongs to
    pub session_id: String,
    /// When the call was created
    pub timestamp: DateTime<Utc>,
}

impl ToolCall {
    /// Creates a call with a generated ID and no parameters.
    pub fn new(
        tool_name: impl Into<String>,
        agent_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            parameters: HashMap::new(),
            agent_id: agent_id.into(),
            session_id: session_id.into(),
            timestamp: Utc::now(),
        }
    }

    /// Overrides the generated ID.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Get argument as string
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.parameters.get(key)?.as_str()
    }

    /// Get argument as i64
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.parameters.get(key)?.as_i64()
    }

    /// Get argument as bool
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.parameters.get(key)?.as_bool()
    }
}

/// JSON kinds a parameter may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl ParamKind {
    /// Checks whether a value has this kind. Integers are also numbers.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        };
        f.write_str(name)
    }
}

/// Declared parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySchema {
    /// Expected kind
    #[serde(rename = "type")]
    pub kind: ParamKind,
    /// Parameter description
    pub description: String,
}

/// Parameter schema of a tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Property definitions
    pub properties: HashMap<String, PropertySchema>,
    /// Required property names
    pub required: Vec<String>,
}

impl ToolSchema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a property to the schema
    #[must_use]
    pub fn add_property(
        mut self,
        name: impl Into<String>,
        kind: ParamKind,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        let name = name.into();
        self.properties
            .insert(name.clone(), PropertySchema { kind, description: description.into() });
        if required {
            self.required.push(name);
        }
        self
    }
}

/// Normalised result of a tool call.
///
/// A successful result never carries an error; the constructors are the only
/// way to build one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolExecutionResult {
    success: bool,
    output: Option<String>,
    error: Option<String>,
    elapsed: Duration,
    metadata: HashMap<String, String>,
}

impl ToolExecutionResult {
    /// Create a successful result
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
            elapsed: Duration::ZERO,
            metadata: HashMap::new(),
        }
    }

    /// Create a failed result, optionally keeping partial output
    pub fn failure(error: impl Into<String>, partial_output: Option<String>) -> Self {
        Self {
            success: false,
            output: partial_output,
            error: Some(error.into()),
            elapsed: Duration::ZERO,
            metadata: HashMap::new(),
        }
    }

    /// The call ran past its time limit
    pub fn timeout() -> Self {
        Self::failure("timeout", None)
    }

    /// The call was cancelled
    pub fn cancelled() -> Self {
        Self::failure("cancelled", None)
    }

    /// Add metadata to the result
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Records the time the call took.
    #[must_use]
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }
}

/// Everything a handler may use while it runs.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Directory the tool operates in
    pub working_dir: PathBuf,
    /// Cancelled on timeout or when the caller cancels
    pub cancel: CancellationToken,
    /// Session the call belongs to
    pub session_id: String,
    /// Agent that asked for the call
    pub agent_id: String,
    /// Contextual data supplied by the runtime
    pub data: HashMap<String, Value>,
    progress: mpsc::UnboundedSender<String>,
}

impl ToolContext {
    /// Creates a context and the receiver its progress reports arrive on.
    pub fn new(
        working_dir: PathBuf,
        cancel: CancellationToken,
        call: &ToolCall,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (progress, receiver) = mpsc::unbounded_channel();
        let context = Self {
            working_dir,
            cancel,
            session_id: call.session_id.clone(),
            agent_id: call.agent_id.clone(),
            data: HashMap::new(),
            progress,
        };
        (context, receiver)
    }

    /// Adds contextual data.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Reports progress. Delivered to the call's stream as a status chunk.
    pub fn report(&self, message: impl Into<String>) {
        let _ = self.progress.send(message.into());
    }
}

/// Handler for tool execution
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the tool
    ///
    /// # Arguments
    /// * `call` - The validated, approved call
    /// * `context` - Working directory, cancellation and progress reporting
    ///
    /// # Returns
    /// The tool output, or an error that becomes a failed result
    async fn execute(&self, call: &ToolCall, context: &ToolContext) -> Result<String>;
}

/// Tool definition
#[derive(Clone)]
pub struct Tool {
    /// Tool name (used in calls)
    pub name: String,
    /// Tool description
    pub description: String,
    /// Parameter schema
    pub schema: ToolSchema,
    /// Handler for executing the tool
    pub handler: Arc<dyn ToolHandler>,
}

impl Tool {
    /// Create a new tool
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: ToolSchema,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self { name: name.into(), description: description.into(), schema, handler }
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("schema", &self.schema)
            .field("handler", &"<handler>")
            .finish()
    }
}
