// Orchestration engine
//
// Runs plan steps against agents from the registry: sequentially by default,
// with optional fan-out for consecutive steps that share a parallel group.
// Progress goes to the plan's session after every step transition.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, Result, RuntimeError};
use crate::handle::SendOutcome;
use crate::registry::AgentRegistry;
use crate::router::{ErrorEvent, ResponseRouter};
use crate::store::{DescriptorStore, PlanStore};

use super::plan::{OrchestrationPlan, OrchestrationStep};
use super::progress::{PlanOutcome, ProgressTracker, StepRecord, StepStatus};

/// What happens to the remaining steps after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop; remaining steps are recorded as not run.
    #[default]
    AbortRemaining,
    /// Keep going; the plan still ends `Failed`.
    ContinueOnFailure,
}

/// Configuration for the orchestration engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Failure handling
    pub failure_policy: FailurePolicy,
    /// Run consecutive steps of the same parallel group concurrently
    pub parallel_fan_out: bool,
    /// Wall-clock limit for one step's send
    pub step_timeout: Duration,
    /// Extra attempts when the agent is busy with another session
    pub busy_retries: u32,
    /// Delay before the first busy retry; doubles each attempt
    pub busy_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::AbortRemaining,
            parallel_fan_out: false,
            step_timeout: Duration::from_secs(300),
            busy_retries: 3,
            busy_backoff: Duration::from_millis(100),
        }
    }
}

/// Per-execution state shared by the step runners.
struct PlanRun<'a> {
    plan: &'a OrchestrationPlan,
    request_id: &'a str,
    cancel: &'a CancellationToken,
    tracker: Mutex<ProgressTracker>,
}

/// Orchestration engine sequencing plan steps across agents
pub struct OrchestrationEngine {
    registry: Arc<AgentRegistry>,
    descriptors: Arc<dyn DescriptorStore>,
    router: Arc<ResponseRouter>,
    plan_store: Option<Arc<dyn PlanStore>>,
    config: EngineConfig,
}

impl fmt::Debug for OrchestrationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestrationEngine")
            .field("config", &self.config)
            .field("plan_store", &self.plan_store.is_some())
            .finish_non_exhaustive()
    }
}

impl OrchestrationEngine {
    /// Create a new orchestration engine
    pub fn new(
        registry: Arc<AgentRegistry>,
        descriptors: Arc<dyn DescriptorStore>,
        router: Arc<ResponseRouter>,
        config: EngineConfig,
    ) -> Self {
        Self { registry, descriptors, router, plan_store: None, config }
    }

    /// Persists plans and outcomes through `store`.
    #[must_use]
    pub fn with_plan_store(mut self, store: Arc<dyn PlanStore>) -> Self {
        self.plan_store = Some(store);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Executes a plan to completion, failure or cancellation.
    ///
    /// The plan is sealed first. Step failures are recorded in the outcome,
    /// not returned.
    ///
    /// # Errors
    /// Returns `Config` if two steps share an order, or `PlanLocked` if the
    /// plan is already executing.
    pub async fn execute(
        &self,
        plan: &OrchestrationPlan,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PlanOutcome> {
        plan.validate()?;
        plan.lock()?;
        info!(plan_id = %plan.id, session_id = %plan.session_id, steps = plan.len(), "Plan started");

        if let Some(store) = &self.plan_store {
            if let Err(e) = store.save_plan(plan).await {
                warn!(plan_id = %plan.id, error = %e, "Failed to save plan");
            }
        }

        let run = PlanRun {
            plan,
            request_id,
            cancel,
            tracker: Mutex::new(ProgressTracker::new(plan)),
        };

        let mut interrupted = false;
        for batch in self.batches(plan.steps()) {
            if cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            let failed = if batch.len() == 1 {
                self.run_chain(&run, &batch).await
            } else {
                self.run_group(&run, batch).await
            };
            if cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            if failed && self.config.failure_policy == FailurePolicy::AbortRemaining {
                debug!(plan_id = %plan.id, "Aborting remaining steps");
                break;
            }
        }

        let mut tracker = run.tracker.into_inner().unwrap_or_else(PoisonError::into_inner);
        tracker.skip_remaining();
        self.router.publish_progress(&plan.session_id, tracker.snapshot());
        let outcome = tracker.into_outcome(interrupted);

        self.router.publish_plan_finished(&plan.session_id, &plan.id, outcome.status);
        if let Some(store) = &self.plan_store {
            if let Err(e) = store.save_outcome(&outcome).await {
                warn!(plan_id = %plan.id, error = %e, "Failed to save plan outcome");
            }
        }

        info!(
            plan_id = %plan.id,
            status = %outcome.status,
            attempted = outcome.attempted_steps(),
            total = outcome.steps.len(),
            "Plan finished"
        );
        Ok(outcome)
    }

    /// Splits steps into execution batches. Without fan-out every step is
    /// its own batch.
    fn batches(&self, steps: Vec<OrchestrationStep>) -> Vec<Vec<OrchestrationStep>> {
        let mut batches: Vec<Vec<OrchestrationStep>> = Vec::new();
        for step in steps {
            let joins_previous = self.config.parallel_fan_out
                && step.parallel_group.is_some()
                && batches
                    .last()
                    .and_then(|batch| batch.last())
                    .is_some_and(|prev| prev.parallel_group == step.parallel_group);
            if joins_previous {
                if let Some(batch) = batches.last_mut() {
                    batch.push(step);
                    continue;
                }
            }
            batches.push(vec![step]);
        }
        batches
    }

    /// Runs a parallel group. Steps for the same agent form a chain and run
    /// in order; chains run concurrently.
    async fn run_group(&self, run: &PlanRun<'_>, steps: Vec<OrchestrationStep>) -> bool {
        let mut chains: Vec<Vec<OrchestrationStep>> = Vec::new();
        for step in steps {
            match chains.iter_mut().find(|chain| chain[0].agent_id == step.agent_id) {
                Some(chain) => chain.push(step),
                None => chains.push(vec![step]),
            }
        }
        debug!(plan_id = %run.plan.id, chains = chains.len(), "Running parallel group");

        join_all(chains.iter().map(|chain| self.run_chain(run, chain)))
            .await
            .into_iter()
            .any(|failed| failed)
    }

    /// Runs steps one after another. Returns `true` if any step failed.
    async fn run_chain(&self, run: &PlanRun<'_>, chain: &[OrchestrationStep]) -> bool {
        let mut failed = false;
        for step in chain {
            if run.cancel.is_cancelled() {
                break;
            }
            if failed && self.config.failure_policy == FailurePolicy::AbortRemaining {
                break;
            }
            match self.run_step(run, step).await {
                StepStatus::Failed => failed = true,
                StepStatus::Cancelled => break,
                _ => {}
            }
        }
        failed
    }

    async fn run_step(&self, run: &PlanRun<'_>, step: &OrchestrationStep) -> StepStatus {
        let session_id = &run.plan.session_id;
        let progress = {
            let mut tracker = run.tracker.lock().unwrap_or_else(PoisonError::into_inner);
            tracker.start(step.order);
            tracker.snapshot()
        };
        self.router.publish_progress(session_id, progress);
        debug!(plan_id = %run.plan.id, step = step.order, agent_id = %step.agent_id, "Step started");

        let started = Instant::now();
        let result = self.send_step(run, step).await;
        let elapsed = started.elapsed();

        let record = match result {
            Ok(outcome) if outcome.is_success() => StepRecord::succeeded(outcome.text, elapsed),
            Ok(outcome) => StepRecord::failed(
                ErrorKind::Backend,
                outcome.error.unwrap_or_default(),
                Some(outcome.text),
                elapsed,
            ),
            Err(RuntimeError::Cancelled) => StepRecord::cancelled(elapsed),
            Err(e) => StepRecord::failed(e.kind(), e.to_string(), None, elapsed),
        };
        let status = record.status;

        if record.is_failure() {
            let error = RuntimeError::PlanStepFailed {
                plan_id: run.plan.id.clone(),
                step: step.order,
                reason: record.error.clone().unwrap_or_default(),
            };
            warn!(plan_id = %run.plan.id, step = step.order, error = %error, "Step failed");
            self.router.publish_error(session_id, ErrorEvent::from_error(run.request_id, &error));
        }

        let progress = {
            let mut tracker = run.tracker.lock().unwrap_or_else(PoisonError::into_inner);
            tracker.finish(step.order, record);
            tracker.snapshot()
        };
        self.router.publish_progress(session_id, progress);
        status
    }

    async fn send_step(&self, run: &PlanRun<'_>, step: &OrchestrationStep) -> Result<SendOutcome> {
        let handle = tokio::select! {
            biased;
            () = run.cancel.cancelled() => return Err(RuntimeError::Cancelled),
            handle = self.registry.get_or_load(&step.agent_id, &self.descriptors) => handle?,
        };

        let mut stream = self.router.open_stream(
            &run.plan.session_id,
            &step.agent_id,
            format!("{}:{}", run.request_id, step.order),
        );

        let mut attempt = 0;
        loop {
            let send = handle.send(&step.task, run.cancel, |chunk| {
                stream.write(chunk);
            });
            match tokio::time::timeout(self.config.step_timeout, send).await {
                Ok(Err(e)) if e.is_transient() && attempt < self.config.busy_retries => {
                    let delay = self.config.busy_backoff * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    debug!(agent_id = %step.agent_id, attempt, delay = ?delay, "Agent busy; retrying");
                    tokio::select! {
                        biased;
                        () = run.cancel.cancelled() => return Err(RuntimeError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Ok(result) => return result,
                Err(_) => {
                    return Err(RuntimeError::ExecutionTimeout {
                        operation: format!("step {} on agent '{}'", step.order, step.agent_id),
                        limit: self.config.step_timeout,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(parallel_fan_out: bool) -> OrchestrationEngine {
        let factory = Arc::new(crate::factory::AgentFactory::new());
        OrchestrationEngine::new(
            Arc::new(AgentRegistry::new(factory)),
            Arc::new(crate::store::InMemoryStore::new()),
            Arc::new(ResponseRouter::default()),
            EngineConfig { parallel_fan_out, ..EngineConfig::default() },
        )
    }

    fn steps() -> Vec<OrchestrationStep> {
        let mut plan = OrchestrationPlan::new("s1");
        plan.add_step(OrchestrationStep::new("a", "1")).unwrap();
        plan.add_step(OrchestrationStep::new("b", "2").in_group("g")).unwrap();
        plan.add_step(OrchestrationStep::new("c", "3").in_group("g")).unwrap();
        plan.add_step(OrchestrationStep::new("d", "4").in_group("h")).unwrap();
        plan.steps()
    }

    #[test]
    fn test_batches_are_single_steps_without_fan_out() {
        let batches = engine(false).batches(steps());
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_batches_group_consecutive_parallel_steps() {
        let batches = engine(true).batches(steps());
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![1, 2, 1]);
        assert_eq!(batches[1][1].agent_id, "c");
    }

    #[test]
    fn test_failure_policy_serde() {
        let policy: FailurePolicy = serde_json::from_str("\"continue_on_failure\"").unwrap();
        assert_eq!(policy, FailurePolicy::ContinueOnFailure);
        assert_eq!(FailurePolicy::default(), FailurePolicy::AbortRemaining);
    }
}
