//! Integration tests for the orchestration engine.

mod common;

use common::{collect_until, mock_agent, mock_factory, Counters};
use ensemble_orchestrator::orchestration::EngineConfig;
use ensemble_orchestrator::{
    AgentRegistry, FailurePolicy, RuntimeError, InMemoryStore, OrchestrationEngine, OrchestrationPlan,
    OrchestrationStep, PlanStatus, ResponseRouter, RouterEvent, StepStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Fixture {
    engine: OrchestrationEngine,
    router: Arc<ResponseRouter>,
    store: Arc<InMemoryStore>,
    counters: Arc<Counters>,
}

fn fixture(config: EngineConfig) -> Fixture {
    let counters = Arc::new(Counters::default());
    let registry = Arc::new(AgentRegistry::new(Arc::new(mock_factory(&counters))));
    let router = Arc::new(ResponseRouter::new(128));
    let store = Arc::new(InMemoryStore::with_descriptors([
        mock_agent("planner", "reply"),
        mock_agent("coder", "fail"),
        mock_agent("reviewer", "reply"),
        mock_agent("tester", "reply"),
        mock_agent("slow", "hang"),
    ]));
    let engine = OrchestrationEngine::new(registry, store.clone(), Arc::clone(&router), config)
        .with_plan_store(store.clone());
    Fixture { engine, router, store, counters }
}

fn plan(agents: &[&str]) -> OrchestrationPlan {
    let mut plan = OrchestrationPlan::new("s1");
    for agent in agents {
        plan.push(*agent, format!("task for {agent}")).unwrap();
    }
    plan
}

#[tokio::test]
async fn test_continue_on_failure_attempts_every_step() {
    let f = fixture(EngineConfig {
        failure_policy: FailurePolicy::ContinueOnFailure,
        ..EngineConfig::default()
    });
    let plan = plan(&["planner", "coder", "reviewer"]);

    let outcome = f.engine.execute(&plan, "r1", &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.status, PlanStatus::Failed);
    assert_eq!(outcome.attempted_steps(), 3);
    assert_eq!(outcome.succeeded_steps(), 2);
    assert_eq!(outcome.step(2).unwrap().status, StepStatus::Succeeded);
}

#[tokio::test]
async fn test_outcome_is_persisted() {
    let f = fixture(EngineConfig::default());
    let plan = plan(&["planner", "reviewer"]).with_id("plan-7");

    let outcome = f.engine.execute(&plan, "r1", &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.status, PlanStatus::Completed);
    assert_eq!(f.store.plan("plan-7").await.unwrap().len(), 2);
    assert_eq!(f.store.outcome("plan-7").await.unwrap().status, PlanStatus::Completed);
}

#[tokio::test]
async fn test_missing_agent_fails_its_step() {
    let f = fixture(EngineConfig::default());
    let plan = plan(&["planner", "ghost", "reviewer"]);

    let outcome = f.engine.execute(&plan, "r1", &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.status, PlanStatus::Failed);
    assert_eq!(outcome.step(1).unwrap().status, StepStatus::Failed);
    assert_eq!(outcome.step(2).unwrap().status, StepStatus::NotRun);
}

#[tokio::test]
async fn test_parallel_group_runs_every_member() {
    let f = fixture(EngineConfig { parallel_fan_out: true, ..EngineConfig::default() });
    let mut plan = OrchestrationPlan::new("s1");
    plan.push("planner", "plan").unwrap();
    plan.add_step(OrchestrationStep::new("reviewer", "review").in_group("checks")).unwrap();
    plan.add_step(OrchestrationStep::new("tester", "test").in_group("checks")).unwrap();

    let outcome = f.engine.execute(&plan, "r1", &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.status, PlanStatus::Completed);
    assert_eq!(outcome.succeeded_steps(), 3);
}

#[tokio::test]
async fn test_cancel_mid_plan_marks_it_cancelled() {
    let f = fixture(EngineConfig::default());
    let mut session = f.router.subscribe_session("s1");
    let plan = plan(&["planner", "slow", "reviewer"]);
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        async move {
            collect_until(&mut session, |event| {
                matches!(event, RouterEvent::Chunk { stream, .. } if stream.agent_id == "slow")
            })
            .await;
            cancel.cancel();
        }
    };

    let (outcome, ()) = tokio::join!(f.engine.execute(&plan, "r1", &cancel), canceller);
    let outcome = outcome.unwrap();

    assert_eq!(outcome.status, PlanStatus::Cancelled);
    assert_eq!(outcome.step(0).unwrap().status, StepStatus::Succeeded);
    assert_eq!(outcome.step(1).unwrap().status, StepStatus::Cancelled);
    assert_eq!(outcome.step(2).unwrap().status, StepStatus::NotRun);
}

#[tokio::test]
async fn test_step_timeout_fails_the_step() {
    let f = fixture(EngineConfig { step_timeout: Duration::from_millis(50), ..EngineConfig::default() });
    let plan = plan(&["slow"]);

    let outcome = f.engine.execute(&plan, "r1", &CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.status, PlanStatus::Failed);
    let step = outcome.step(0).unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step.error.as_deref().unwrap_or_default().contains("step 0"));
}

#[tokio::test]
async fn test_duplicate_step_orders_are_rejected_before_any_send() {
    let f = fixture(EngineConfig::default());
    let plan: OrchestrationPlan = serde_json::from_value(serde_json::json!({
        "id": "plan-dup",
        "session_id": "s1",
        "steps": [
            { "agent_id": "planner", "task": "plan", "order": 1 },
            { "agent_id": "reviewer", "task": "review", "order": 1 }
        ]
    }))
    .unwrap();

    let err = f.engine.execute(&plan, "r1", &CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, RuntimeError::Config(_)));
    assert_eq!(Counters::get(&f.counters.sends), 0);
    assert!(!plan.is_locked());
    assert!(f.store.plan("plan-dup").await.is_none());
}
