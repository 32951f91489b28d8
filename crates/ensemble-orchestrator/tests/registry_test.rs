//! Integration tests for the agent registry: single-flight creation, failure
//! handling and bulk disposal.

mod common;

use common::{mock_agent, mock_factory, Counters};
use ensemble_orchestrator::{AgentRegistry, AgentState, RuntimeError};
use std::sync::Arc;

fn registry(counters: &Arc<Counters>) -> Arc<AgentRegistry> {
    Arc::new(AgentRegistry::new(Arc::new(mock_factory(counters))))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creation_is_single_flight() {
    let counters = Arc::new(Counters::default());
    let registry = registry(&counters);

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .get_or_create("coder", || async {
                        Ok(mock_agent("coder", "reply").with_setting("init_delay_ms", "50"))
                    })
                    .await
            })
        })
        .collect();

    let handles: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(Counters::get(&counters.builds), 1);
    assert_eq!(Counters::get(&counters.inits), 1);
    assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    assert_eq!(handles[0].state(), AgentState::Ready);
    assert_eq!(registry.count().await, 1);
}

#[tokio::test]
async fn test_failed_initialization_clears_slot_for_retry() {
    let counters = Arc::new(Counters::default());
    let registry = registry(&counters);

    let err = registry
        .get_or_create("flaky", || async { Ok(mock_agent("flaky", "fail_init")) })
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InitializationFailed { .. }));
    assert!(registry.find("flaky").await.is_none());
    // The half-built backend was shut down
    assert_eq!(Counters::get(&counters.shutdowns), 1);

    let handle = registry
        .get_or_create("flaky", || async { Ok(mock_agent("flaky", "reply")) })
        .await
        .unwrap();
    assert_eq!(handle.state(), AgentState::Ready);
    assert_eq!(Counters::get(&counters.builds), 2);
}

#[tokio::test]
async fn test_descriptor_error_reaches_caller() {
    let counters = Arc::new(Counters::default());
    let registry = registry(&counters);

    let err = registry
        .get_or_create("ghost", || async { Err(RuntimeError::AgentNotFound("ghost".to_string())) })
        .await
        .unwrap_err();

    assert!(matches!(err, RuntimeError::AgentNotFound(_)));
    assert_eq!(Counters::get(&counters.builds), 0);
    assert_eq!(registry.count().await, 0);
}

#[tokio::test]
async fn test_dispose_all_disposes_each_handle_once() {
    let counters = Arc::new(Counters::default());
    let registry = registry(&counters);

    let mut handles = Vec::new();
    for (id, mode) in [
        ("a", "reply"),
        ("b", "fail_shutdown"),
        ("c", "reply"),
        ("d", "fail_shutdown"),
        ("e", "reply"),
    ] {
        let handle = registry
            .get_or_create(id, move || async move { Ok(mock_agent(id, mode)) })
            .await
            .unwrap();
        handles.push(handle);
    }

    assert_eq!(registry.dispose_all().await, 5);
    assert_eq!(Counters::get(&counters.shutdowns), 5);
    assert!(handles.iter().all(|h| h.state() == AgentState::Disposed));

    // Disposal is idempotent and the registry stays closed
    for handle in &handles {
        handle.dispose().await.unwrap();
    }
    assert_eq!(Counters::get(&counters.shutdowns), 5);
    assert_eq!(registry.dispose_all().await, 0);

    let err = registry
        .get_or_create("f", || async { Ok(mock_agent("f", "reply")) })
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::AgentDisposed(_)));
}

#[tokio::test]
async fn test_remove_disposes_and_forgets() {
    let counters = Arc::new(Counters::default());
    let registry = registry(&counters);

    let first = registry
        .get_or_create("coder", || async { Ok(mock_agent("coder", "reply")) })
        .await
        .unwrap();
    assert!(registry.remove("coder").await);
    assert_eq!(first.state(), AgentState::Disposed);
    assert!(!registry.remove("coder").await);

    let second = registry
        .get_or_create("coder", || async { Ok(mock_agent("coder", "reply")) })
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(Counters::get(&counters.builds), 2);
}

#[tokio::test]
async fn test_creation_in_flight_during_dispose_all_is_disposed() {
    let counters = Arc::new(Counters::default());
    let registry = registry(&counters);

    let pending = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            registry
                .get_or_create("slow", || async {
                    Ok(mock_agent("slow", "reply").with_setting("init_delay_ms", "100"))
                })
                .await
        })
    };
    while Counters::get(&counters.inits) == 0 {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    assert_eq!(registry.dispose_all().await, 0);
    let err = pending.await.unwrap().unwrap_err();

    assert!(matches!(err, RuntimeError::AgentDisposed(_)));
    assert_eq!(Counters::get(&counters.shutdowns), 1);
    assert_eq!(registry.count().await, 0);
    assert!(registry.find("slow").await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_handle_built_around_dispose_all_is_shut_down() {
    let counters = Arc::new(Counters::default());
    let registry = registry(&counters);

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let id = format!("agent-{i}");
                let descriptor = mock_agent(&id, "reply").with_setting("init_delay_ms", "10");
                registry.get_or_create(&id, || async move { Ok(descriptor) }).await
            })
        })
        .collect();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    registry.dispose_all().await;

    for joined in futures::future::join_all(tasks).await {
        if let Ok(handle) = joined.unwrap() {
            // Anything that made it into the map was swept
            assert_eq!(handle.state(), AgentState::Disposed);
        }
    }

    assert_eq!(registry.count().await, 0);
    assert_eq!(Counters::get(&counters.shutdowns), Counters::get(&counters.inits));
}
