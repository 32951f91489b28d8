//! Agent runtime and orchestration engine for Ensemble.
//!
//! Hosts agents behind a common backend contract, caches them in a registry,
//! runs tool calls through validation and approval, sequences multi-agent
//! plans, and fans every response out to session and agent subscribers.

pub mod backends;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod factory;
pub mod handle;
pub mod lifecycle;
pub mod orchestration;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod store;
pub mod tools;

pub use config::{Environment, RuntimeConfig};
pub use descriptor::{AgentDescriptor, AgentKind};
pub use error::{ErrorKind, Result, RuntimeError};
pub use factory::{AgentFactory, BuildResult};
pub use handle::{AgentHandle, SendOutcome};
pub use lifecycle::AgentState;
pub use orchestration::{
    FailurePolicy, OrchestrationEngine, OrchestrationPlan, OrchestrationProgress,
    OrchestrationStep, PlanOutcome, PlanStatus, StepStatus,
};
pub use registry::{AgentInfo, AgentRegistry};
pub use router::{ErrorEvent, ResponseRouter, ResponseStream, RouterEvent, StreamId, Subscription};
pub use runtime::{AgentRuntime, RequestId, RuntimeBuilder};
pub use store::{DescriptorStore, InMemoryStore, PlanStore};
pub use tools::{ApprovalDecision, ApprovalPolicy, Tool, ToolCall, ToolExecutionResult, ToolHandler};

// Backend contract, re-exported so backend authors need one dependency
pub use ensemble_abstraction::{AgentBackend, BackendConfig, BackendError, ChunkStream, StreamChunk};
