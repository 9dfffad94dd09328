//! End-to-end tests for the resilience runtime.
//!
//! Exercises the orchestrator composition: layered execution, admission
//! control under load, boundary latching and recovery, resource quotas with
//! reclamation, and the emergency shutdown sequence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;

use resilience_core::runtime::resources::ReleaseFn;
use resilience_core::types::config::{BulkheadConfig, ResourceLimits, SweepConfig};
use resilience_core::{
    Config, Error, EventBus, ExecutionOptions, ResilienceOrchestrator, ResourceKind,
    ResourceManager, ResilienceEvent, TimeoutReason,
};

fn orchestrator() -> Arc<ResilienceOrchestrator> {
    ResilienceOrchestrator::new(Config::default())
}

#[tokio::test]
async fn layered_execution_happy_path() {
    let orchestrator = orchestrator();
    let result = orchestrator
        .execute_with_resilience(
            || async { Ok("cached answer") },
            ExecutionOptions {
                timeout: Some(Duration::from_secs(1)),
                error_boundary: Some("knowledge-cache".to_string()),
                bulkhead: Some("knowledge-cache".to_string()),
                priority: 0,
            },
        )
        .await;
    assert_eq!(result.unwrap(), "cached answer");

    let status = orchestrator.system_status();
    let cache = status
        .bulkheads
        .iter()
        .find(|m| m.name == "knowledge-cache")
        .unwrap();
    assert_eq!(cache.success_count, 1);
    assert_eq!(status.active_timeouts, 0);
    assert!(!status.shutdown_in_progress);
}

#[tokio::test]
async fn unknown_names_are_rejected() {
    let orchestrator = orchestrator();
    let err = orchestrator
        .execute_with_resilience(
            || async { Ok(()) },
            ExecutionOptions {
                bulkhead: Some("no-such-workload".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn bulkhead_scenario_two_run_one_queues_one_rejected() {
    // The §8 scenario: {max: 2, queue: 1, timeout: 1s}, four 50ms tasks.
    let orchestrator = orchestrator();
    orchestrator.register_bulkhead(
        "scenario",
        BulkheadConfig {
            max_concurrent: 2,
            queue_size: 1,
            timeout: Duration::from_secs(1),
        },
    );

    let mut handles = Vec::new();
    for _ in 0..4 {
        let orchestrator = orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator
                .execute_with_resilience(
                    || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(())
                    },
                    ExecutionOptions {
                        bulkhead: Some("scenario".to_string()),
                        ..Default::default()
                    },
                )
                .await
        }));
        // Deterministic submission order.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut successes = 0;
    let mut rejections = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => successes += 1,
            Err(Error::BulkheadQueueFull { name }) => {
                assert_eq!(name, "scenario");
                rejections += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(successes, 3);
    assert_eq!(rejections, 1);
}

#[tokio::test]
async fn queueing_delay_does_not_consume_execution_deadline() {
    // One slot, long bulkhead deadline, short caller timeout. The queued
    // task waits ~80ms in admission, then its 60ms execution timeout starts
    // fresh; a 20ms operation still completes.
    let orchestrator = orchestrator();
    orchestrator.register_bulkhead(
        "slots",
        BulkheadConfig {
            max_concurrent: 1,
            queue_size: 4,
            timeout: Duration::from_secs(5),
        },
    );

    let blocker = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .execute_with_resilience(
                    || async {
                        tokio::time::sleep(Duration::from_millis(80)).await;
                        Ok(())
                    },
                    ExecutionOptions {
                        bulkhead: Some("slots".to_string()),
                        ..Default::default()
                    },
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let queued = orchestrator
        .execute_with_resilience(
            || async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok("made it")
            },
            ExecutionOptions {
                timeout: Some(Duration::from_millis(60)),
                bulkhead: Some("slots".to_string()),
                ..Default::default()
            },
        )
        .await;

    assert_eq!(queued.unwrap(), "made it");
    blocker.await.unwrap().unwrap();
    assert_eq!(orchestrator.timeout_manager().active_timeouts(), 0);
}

#[tokio::test]
async fn boundary_breach_fails_fast_and_publishes_event() {
    let orchestrator = orchestrator();
    let mut events = orchestrator.events().subscribe();

    // sandbox-execution boundary latches at 3 errors in 30s.
    for _ in 0..3 {
        let _ = orchestrator
            .execute_with_resilience(
                || async { Err::<(), _>(Error::internal("wasm trap")) },
                ExecutionOptions {
                    error_boundary: Some("sandbox-execution".to_string()),
                    ..Default::default()
                },
            )
            .await;
    }

    let event = events.recv().await.unwrap();
    assert_eq!(
        event,
        ResilienceEvent::BoundaryBreached {
            name: "sandbox-execution".to_string(),
            error_count: 3,
        }
    );

    let attempted = Arc::new(AtomicUsize::new(0));
    let attempted2 = attempted.clone();
    let err = orchestrator
        .execute_with_resilience(
            move || {
                let attempted = attempted2.clone();
                async move {
                    attempted.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            ExecutionOptions {
                error_boundary: Some("sandbox-execution".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::BoundaryBreached { .. }));
    assert_eq!(attempted.load(Ordering::SeqCst), 0);

    // Explicit recovery reopens the path.
    assert!(
        orchestrator
            .error_boundary("sandbox-execution")
            .unwrap()
            .attempt_recovery()
            .await
    );
    orchestrator
        .execute_with_resilience(
            || async { Ok(()) },
            ExecutionOptions {
                error_boundary: Some("sandbox-execution".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn resource_quota_cycle_through_orchestrator() {
    let orchestrator = ResilienceOrchestrator::new(Config {
        limits: ResourceLimits {
            max_wasm_instances: 2,
            ..Default::default()
        },
        ..Default::default()
    });

    let id1 = orchestrator
        .allocate_resource(ResourceKind::WasmInstance, "sandbox", 0, None)
        .await
        .unwrap();
    let _id2 = orchestrator
        .allocate_resource(ResourceKind::WasmInstance, "sandbox", 0, None)
        .await
        .unwrap();

    let err = orchestrator
        .allocate_resource(ResourceKind::WasmInstance, "sandbox", 0, None)
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    orchestrator.release_resource(id1).await.unwrap();
    orchestrator
        .allocate_resource(ResourceKind::WasmInstance, "sandbox", 0, None)
        .await
        .unwrap();

    assert_eq!(orchestrator.release_resources_by_owner("sandbox").await, 2);
    assert_eq!(orchestrator.system_status().resources.total, 0);
}

#[tokio::test]
async fn reclamation_publishes_event() {
    let sweep = SweepConfig {
        stale_after: Duration::from_millis(10),
        ..Default::default()
    };
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let rm = ResourceManager::new(ResourceLimits::default(), sweep).with_events(events);

    rm.allocate(ResourceKind::Agent, "swarm", 0, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let stats = rm.reclaim_stale_pass().await;
    assert_eq!(stats.reclaimed, 1);
    assert_eq!(
        rx.recv().await.unwrap(),
        ResilienceEvent::ResourcesReclaimed { count: 1 }
    );
}

#[tokio::test]
async fn emergency_shutdown_runs_defaults_and_is_idempotent() {
    let orchestrator = orchestrator();
    orchestrator.start();
    let mut events = orchestrator.events().subscribe();

    let released = Arc::new(AtomicUsize::new(0));
    let released2 = released.clone();
    let release: ReleaseFn = Arc::new(move || {
        let released = released2.clone();
        Box::pin(async move {
            released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    });
    orchestrator
        .allocate_resource(ResourceKind::DatabaseConnection, "store", 0, Some(release))
        .await
        .unwrap();

    assert!(orchestrator.initiate_emergency_shutdown("memory pressure").await);
    assert!(!orchestrator.initiate_emergency_shutdown("again").await);

    assert_eq!(
        events.recv().await.unwrap(),
        ResilienceEvent::EmergencyShutdown {
            reason: "memory pressure".to_string(),
        }
    );

    let status = orchestrator.system_status();
    assert!(status.shutdown_in_progress);
    assert_eq!(status.resources.total, 0);
    assert_eq!(status.active_timeouts, 0);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_procedure_failure_does_not_stop_sequence() {
    use resilience_core::runtime::shutdown::EmergencyProcedure;

    let orchestrator = orchestrator();
    let log = Arc::new(Mutex::new(Vec::new()));

    // Custom procedures around the defaults: priority 0 throws, priority 9
    // still runs after the full default list.
    let log2 = log.clone();
    orchestrator
        .shutdown_system()
        .add_procedure(EmergencyProcedure {
            name: "flaky-first".to_string(),
            priority: 0,
            timeout: Duration::from_secs(1),
            action: Arc::new(move || {
                let log = log2.clone();
                Box::pin(async move {
                    log.lock().unwrap().push("flaky-first");
                    Err(Error::internal("broken cleanup"))
                })
            }),
        });
    let log3 = log.clone();
    orchestrator
        .shutdown_system()
        .add_procedure(EmergencyProcedure {
            name: "last".to_string(),
            priority: 9,
            timeout: Duration::from_secs(1),
            action: Arc::new(move || {
                let log = log3.clone();
                Box::pin(async move {
                    log.lock().unwrap().push("last");
                    Ok(())
                })
            }),
        });

    assert!(orchestrator.initiate_emergency_shutdown("test").await);
    assert_eq!(*log.lock().unwrap(), vec!["flaky-first", "last"]);
}

#[tokio::test]
async fn execution_timeout_reports_reason_and_leaks_nothing() {
    let orchestrator = orchestrator();
    let err = orchestrator
        .execute_with_resilience(
            || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
            ExecutionOptions {
                timeout: Some(Duration::from_millis(30)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    match err {
        Error::Timeout { reason, .. } => assert_eq!(reason, TimeoutReason::Execution),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(orchestrator.timeout_manager().active_timeouts(), 0);
}
