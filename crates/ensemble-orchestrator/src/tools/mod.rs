//! Tool execution.
//!
//! Agents ask the runtime to run tools on their behalf. Every call passes
//! through the [`ToolPipeline`]: schema validation, an approval policy with an
//! optional human gate, then execution under a timeout.

pub mod approval;
pub mod pipeline;
pub mod registry;
pub mod tool;
pub mod validation;

pub use approval::{
    ApprovalDecision, ApprovalGate, ApprovalPolicy, AutoApprovePolicy, ManualApprovalPolicy,
    PendingApproval, PolicyDecision, RuleBasedPolicy,
};
pub use pipeline::{PipelineConfig, ToolPipeline};
pub use registry::ToolRegistry;
pub use tool::{
    ParamKind, PropertySchema, Tool, ToolCall, ToolContext, ToolExecutionResult, ToolHandler,
    ToolSchema,
};
