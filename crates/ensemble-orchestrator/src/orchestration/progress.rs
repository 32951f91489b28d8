//! Plan progress and outcomes.
//!
//! [`ProgressTracker`] keeps the per-step record while a plan runs and derives
//! [`OrchestrationProgress`] snapshots from it on demand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use crate::error::ErrorKind;
use crate::orchestration::plan::{OrchestrationPlan, OrchestrationStep};

/// Status of one plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started yet.
    Pending,
    /// Currently executing.
    Running,
    /// Finished without error.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Interrupted by cancellation.
    Cancelled,
    /// Skipped because the plan stopped early.
    NotRun,
}

impl StepStatus {
    /// Returns `true` if the step was started.
    pub fn was_attempted(self) -> bool {
        matches!(self, Self::Running | Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::NotRun => "not_run",
        };
        f.write_str(name)
    }
}

/// Final status of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Every step succeeded.
    Completed,
    /// At least one step failed.
    Failed,
    /// The plan was cancelled.
    Cancelled,
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Record of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Step order
    pub order: usize,
    /// Target agent
    pub agent_id: String,
    /// Status
    pub status: StepStatus,
    /// Text produced by the agent
    pub output: Option<String>,
    /// Failure description
    pub error: Option<String>,
    /// Failure classification
    pub error_kind: Option<ErrorKind>,
    /// Wall-clock time spent on the step
    pub elapsed: Duration,
}

impl StepOutcome {
    fn pending(step: &OrchestrationStep) -> Self {
        Self {
            order: step.order,
            agent_id: step.agent_id.clone(),
            status: StepStatus::Pending,
            output: None,
            error: None,
            error_kind: None,
            elapsed: Duration::ZERO,
        }
    }
}

/// Aggregate result of a plan run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOutcome {
    /// Plan identifier
    pub plan_id: String,
    /// Session the plan reported to
    pub session_id: String,
    /// Final status
    pub status: PlanStatus,
    /// One record per step, in order
    pub steps: Vec<StepOutcome>,
    /// When execution started
    pub started_at: DateTime<Utc>,
    /// When execution finished
    pub finished_at: DateTime<Utc>,
}

impl PlanOutcome {
    /// Number of steps that were started.
    pub fn attempted_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.status.was_attempted()).count()
    }

    /// Number of steps that succeeded.
    pub fn succeeded_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.status == StepStatus::Succeeded).count()
    }

    /// Returns the record for a step order.
    pub fn step(&self, order: usize) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.order == order)
    }
}

/// Progress snapshot published after every step transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationProgress {
    /// Plan identifier
    pub plan_id: String,
    /// Order of the most recently started step
    pub current_step: usize,
    /// Number of steps in the plan
    pub total_steps: usize,
    /// Steps started so far
    pub attempted_steps: usize,
    /// Agent of the most recently started step
    pub current_agent: Option<String>,
    /// Time since the plan started
    pub elapsed: Duration,
    /// Steps that ran to an end (succeeded, failed or cancelled) as a
    /// percentage of all steps; skipped steps do not count
    pub completion_percentage: f64,
}

/// Mutable per-run record.
#[derive(Debug)]
pub struct ProgressTracker {
    plan_id: String,
    session_id: String,
    steps: Vec<StepOutcome>,
    current: Option<usize>,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl ProgressTracker {
    /// Starts tracking a plan. Every step begins `Pending`.
    pub fn new(plan: &OrchestrationPlan) -> Self {
        Self {
            plan_id: plan.id.clone(),
            session_id: plan.session_id.clone(),
            steps: plan.steps().iter().map(StepOutcome::pending).collect(),
            current: None,
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    fn slot(&mut self, order: usize) -> Option<&mut StepOutcome> {
        self.steps.iter_mut().find(|s| s.order == order)
    }

    /// Marks a step as running.
    pub fn start(&mut self, order: usize) {
        self.current = Some(order);
        if let Some(step) = self.slot(order) {
            step.status = StepStatus::Running;
        }
    }

    /// Records the end of a step.
    pub fn finish(&mut self, order: usize, record: StepRecord) {
        if let Some(step) = self.slot(order) {
            step.status = record.status;
            step.output = record.output;
            step.error = record.error;
            step.error_kind = record.error_kind;
            step.elapsed = record.elapsed;
        }
    }

    /// Marks every step that never started as `NotRun`.
    pub fn skip_remaining(&mut self) {
        for step in &mut self.steps {
            if step.status == StepStatus::Pending {
                step.status = StepStatus::NotRun;
            }
        }
    }

    /// Computes a progress snapshot.
    pub fn snapshot(&self) -> OrchestrationProgress {
        let total = self.steps.len();
        let attempted = self.steps.iter().filter(|s| s.status.was_attempted()).count();
        let finished = self
            .steps
            .iter()
            .filter(|s| {
                matches!(s.status, StepStatus::Succeeded | StepStatus::Failed | StepStatus::Cancelled)
            })
            .count();
        let completion_percentage =
            if total == 0 { 100.0 } else { finished as f64 / total as f64 * 100.0 };
        let current_agent = self
            .current
            .and_then(|order| self.steps.iter().find(|s| s.order == order))
            .map(|s| s.agent_id.clone());

        OrchestrationProgress {
            plan_id: self.plan_id.clone(),
            current_step: self.current.unwrap_or(0),
            total_steps: total,
            attempted_steps: attempted,
            current_agent,
            elapsed: self.started.elapsed(),
            completion_percentage,
        }
    }

    /// Closes the record and derives the plan status.
    pub fn into_outcome(mut self, cancelled: bool) -> PlanOutcome {
        self.skip_remaining();
        let status = if cancelled || self.steps.iter().any(|s| s.status == StepStatus::Cancelled) {
            PlanStatus::Cancelled
        } else if self.steps.iter().any(|s| s.status == StepStatus::Failed) {
            PlanStatus::Failed
        } else {
            PlanStatus::Completed
        };

        PlanOutcome {
            plan_id: self.plan_id,
            session_id: self.session_id,
            status,
            steps: self.steps,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

/// What a finished step reports to the tracker.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub status: StepStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub elapsed: Duration,
}

impl StepRecord {
    /// A successful step.
    pub fn succeeded(output: String, elapsed: Duration) -> Self {
        Self { status: StepStatus::Succeeded, output: Some(output), error: None, error_kind: None, elapsed }
    }

    /// A failed step. Partial output is kept.
    pub fn failed(kind: ErrorKind, error: impl Into<String>, output: Option<String>, elapsed: Duration) -> Self {
        Self {
            status: StepStatus::Failed,
            output,
            error: Some(error.into()),
            error_kind: Some(kind),
            elapsed,
        }
    }

    /// A cancelled step.
    pub fn cancelled(elapsed: Duration) -> Self {
        Self {
            status: StepStatus::Cancelled,
            output: None,
            error: Some("cancelled".to_string()),
            error_kind: Some(ErrorKind::Cancelled),
            elapsed,
        }
    }

    /// Returns `true` for a failed step.
    pub fn is_failure(&self) -> bool {
        self.status == StepStatus::Failed
    }
}
