//! Persistence boundary.
//!
//! The runtime only needs to look up agent descriptors and to hand plans and
//! their outcomes to whatever keeps history. [`InMemoryStore`] implements both
//! contracts for tests and for configurations that list agents inline.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::descriptor::AgentDescriptor;
use crate::error::Result;
use crate::orchestration::{OrchestrationPlan, PlanOutcome};

/// Source of agent descriptors.
#[async_trait]
pub trait DescriptorStore: Send + Sync {
    /// Loads the descriptor for an agent, if one exists.
    async fn load_descriptor(&self, id: &str) -> Result<Option<AgentDescriptor>>;
}

/// Sink for plans and their outcomes.
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Stores a plan definition before it runs.
    async fn save_plan(&self, plan: &OrchestrationPlan) -> Result<()>;

    /// Stores the outcome after the plan finishes.
    async fn save_outcome(&self, outcome: &PlanOutcome) -> Result<()>;
}

/// In-process store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    descriptors: RwLock<HashMap<String, AgentDescriptor>>,
    plans: RwLock<HashMap<String, OrchestrationPlan>>,
    outcomes: RwLock<HashMap<String, PlanOutcome>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with descriptors.
    pub fn with_descriptors(descriptors: impl IntoIterator<Item = AgentDescriptor>) -> Self {
        let map = descriptors.into_iter().map(|d| (d.id.clone(), d)).collect();
        Self { descriptors: RwLock::new(map), ..Self::default() }
    }

    /// Adds or replaces a descriptor.
    pub async fn insert_descriptor(&self, descriptor: AgentDescriptor) {
        self.descriptors.write().await.insert(descriptor.id.clone(), descriptor);
    }

    /// Returns every descriptor, sorted by id.
    pub async fn descriptors(&self) -> Vec<AgentDescriptor> {
        let mut all: Vec<AgentDescriptor> = self.descriptors.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Returns a saved plan.
    pub async fn plan(&self, plan_id: &str) -> Option<OrchestrationPlan> {
        self.plans.read().await.get(plan_id).cloned()
    }

    /// Returns a saved outcome.
    pub async fn outcome(&self, plan_id: &str) -> Option<PlanOutcome> {
        self.outcomes.read().await.get(plan_id).cloned()
    }
}

#[async_trait]
impl DescriptorStore for InMemoryStore {
    async fn load_descriptor(&self, id: &str) -> Result<Option<AgentDescriptor>> {
        Ok(self.descriptors.read().await.get(id).cloned())
    }
}

#[async_trait]
impl PlanStore for InMemoryStore {
    async fn save_plan(&self, plan: &OrchestrationPlan) -> Result<()> {
        debug!(plan_id = %plan.id, steps = plan.len(), "Plan saved");
        self.plans.write().await.insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    async fn save_outcome(&self, outcome: &PlanOutcome) -> Result<()> {
        debug!(plan_id = %outcome.plan_id, status = %outcome.status, "Plan outcome saved");
        self.outcomes.write().await.insert(outcome.plan_id.clone(), outcome.clone());
        Ok(())
    }
}
