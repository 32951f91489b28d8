// Orchestration plans
//
// A plan is an ordered list of agent tasks for one session. Plans are editable
// until the engine starts executing them; from then on they are sealed.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Result, RuntimeError};

/// One task in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationStep {
    /// Agent that performs the task
    pub agent_id: String,
    /// Message sent to the agent
    pub task: String,
    /// Position in the plan; steps run in ascending order
    #[serde(default)]
    pub order: usize,
    /// Consecutive steps sharing a group may run concurrently
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
}

impl OrchestrationStep {
    /// Creates a step with order 0; the plan assigns the real order.
    pub fn new(agent_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self { agent_id: agent_id.into(), task: task.into(), order: 0, parallel_group: None }
    }

    /// Places the step in a parallel group.
    #[must_use]
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.parallel_group = Some(group.into());
        self
    }
}

/// Ordered multi-agent plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationPlan {
    /// Plan identifier
    #[serde(default = "generate_plan_id")]
    pub id: String,
    /// Session the plan reports to
    pub session_id: String,
    #[serde(default)]
    steps: Vec<OrchestrationStep>,
    /// Shared by clones, so a copy handed to the engine seals the caller's copy too.
    #[serde(skip)]
    locked: Arc<AtomicBool>,
}

fn generate_plan_id() -> String {
    Uuid::new_v4().to_string()
}

impl OrchestrationPlan {
    /// Creates an empty plan with a generated identifier.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            id: generate_plan_id(),
            session_id: session_id.into(),
            steps: Vec::new(),
            locked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Overrides the generated identifier.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Appends a step and returns its order.
    ///
    /// # Errors
    /// Returns `PlanLocked` once execution has started.
    pub fn add_step(&mut self, mut step: OrchestrationStep) -> Result<usize> {
        self.ensure_unlocked()?;
        let order = self.steps.iter().map(|s| s.order + 1).max().unwrap_or(0);
        step.order = order;
        self.steps.push(step);
        Ok(order)
    }

    /// Appends a step for `agent_id`.
    ///
    /// # Errors
    /// Returns `PlanLocked` once execution has started.
    pub fn push(&mut self, agent_id: impl Into<String>, task: impl Into<String>) -> Result<usize> {
        self.add_step(OrchestrationStep::new(agent_id, task))
    }

    /// Removes the step with the given order.
    ///
    /// # Errors
    /// Returns `PlanLocked` once execution has started, or `PlanStepFailed`
    /// if no step has that order.
    pub fn remove_step(&mut self, order: usize) -> Result<OrchestrationStep> {
        self.ensure_unlocked()?;
        let index = self.steps.iter().position(|s| s.order == order).ok_or_else(|| {
            RuntimeError::PlanStepFailed {
                plan_id: self.id.clone(),
                step: order,
                reason: "no such step".to_string(),
            }
        })?;
        Ok(self.steps.remove(index))
    }

    /// Returns the steps sorted by order. Ties keep insertion order.
    pub fn steps(&self) -> Vec<OrchestrationStep> {
        let mut steps = self.steps.clone();
        steps.sort_by_key(|s| s.order);
        steps
    }

    /// Returns the number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns `true` if the plan has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns `true` once execution has started.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Seals the plan.
    ///
    /// # Errors
    /// Returns `PlanLocked` if the plan was already sealed.
    pub(crate) fn lock(&self) -> Result<()> {
        if self.locked.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::PlanLocked(self.id.clone()));
        }
        Ok(())
    }

    /// Checks that every step has its own order.
    ///
    /// # Errors
    /// Returns `Config` naming the first order used twice.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.order) {
                return Err(RuntimeError::Config(format!(
                    "plan {} has more than one step with order {}",
                    self.id, step.order
                )));
            }
        }
        Ok(())
    }

    fn ensure_unlocked(&self) -> Result<()> {
        if self.is_locked() {
            return Err(RuntimeError::PlanLocked(self.id.clone()));
        }
        Ok(())
    }

    /// Parses a plan from TOML.
    ///
    /// ```toml
    /// session_id = "review"
    ///
    /// [[steps]]
    /// agent_id = "coder"
    /// task = "Write the patch"
    /// ```
    ///
    /// Steps without an explicit `order` keep their position in the file.
    ///
    /// # Errors
    /// Returns `Config` if the document is not a valid plan or two steps share
    /// an order.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut plan: Self = toml::from_str(content)
            .map_err(|e| RuntimeError::Config(format!("Failed to parse plan: {e}")))?;
        if plan.steps.iter().all(|s| s.order == 0) {
            for (index, step) in plan.steps.iter_mut().enumerate() {
                step.order = index;
            }
        }
        plan.validate()?;
        Ok(plan)
    }

    /// Loads a plan from a TOML file.
    ///
    /// # Errors
    /// Returns `Config` if the file cannot be read or parsed.
    pub fn load_from_toml(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::Config(format!("Failed to read plan {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }
}
