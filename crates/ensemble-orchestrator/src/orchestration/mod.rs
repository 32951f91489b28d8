//! Multi-agent plan execution.

pub mod engine;
pub mod plan;
pub mod progress;

pub use engine::{EngineConfig, FailurePolicy, OrchestrationEngine};
pub use plan::{OrchestrationPlan, OrchestrationStep};
pub use progress::{
    OrchestrationProgress, PlanOutcome, PlanStatus, ProgressTracker, StepOutcome, StepRecord,
    StepStatus,
};
