//! End-to-end processor behavior against the in-memory datastore.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chrono_core::{
    BackoffStrategyOptions, Chrono, ProcessorEvent, RegisterTaskHandlerOptions,
    ScheduleTaskInput, TaskStatus,
};
use chrono_memory_datastore::MemoryTaskStore;

use common::{collect_until, fast_processor_config, init_tracing, FaultyStore};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn claims_and_completes_a_scheduled_task() {
    init_tracing();
    let mut chrono = Chrono::new(MemoryTaskStore::new());

    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = Arc::clone(&calls);
    chrono
        .register_task_handler(
            RegisterTaskHandlerOptions::builder()
                .kind("send-email")
                .processor(fast_processor_config())
                .build(),
            move |_task| {
                let calls = Arc::clone(&handler_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .unwrap();

    let task = chrono
        .schedule(
            ScheduleTaskInput::builder()
                .kind("send-email")
                .scheduled_at(Utc::now() - chrono::Duration::seconds(1))
                .build(),
        )
        .await
        .unwrap();

    let mut events = chrono.processor_events("send-email").unwrap();
    chrono.start().await.unwrap();

    let seen = collect_until(&mut events, EVENT_TIMEOUT, |event| {
        matches!(event, ProcessorEvent::TaskCompleted { .. })
    })
    .await;
    chrono.stop().await;

    // Claimed strictly precedes the settle event for the same claim.
    assert!(matches!(seen[0], ProcessorEvent::TaskClaimed { .. }));
    assert!(matches!(
        seen.last().unwrap(),
        ProcessorEvent::TaskCompleted { .. }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let stored = chrono.datastore().get(task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert!(stored.completed_at.is_some());
}

#[tokio::test]
async fn failing_handler_retries_with_backoff_then_fails_terminally() {
    init_tracing();
    let mut chrono = Chrono::new(MemoryTaskStore::new());

    let mut config = fast_processor_config();
    config.task_handler_max_retries = 2;
    chrono
        .register_task_handler(
            RegisterTaskHandlerOptions::builder()
                .kind("send-email")
                .processor(config)
                .backoff(BackoffStrategyOptions::Linear {
                    base_delay_ms: 0,
                    increment_ms: 100,
                })
                .build(),
            |_task| async move { Err(anyhow::anyhow!("boom")) },
        )
        .unwrap();

    let task = chrono
        .schedule(ScheduleTaskInput::builder().kind("send-email").build())
        .await
        .unwrap();

    let mut events = chrono.processor_events("send-email").unwrap();
    chrono.start().await.unwrap();

    let seen = collect_until(&mut events, EVENT_TIMEOUT, |event| {
        matches!(event, ProcessorEvent::TaskFailed { .. })
    })
    .await;
    chrono.stop().await;

    // Attempts 0 and 1 are retried; attempt 2 hits the inclusive bound
    // (retry_count >= max_retries) and fails terminally.
    let claims = seen
        .iter()
        .filter(|event| matches!(event, ProcessorEvent::TaskClaimed { .. }))
        .count();
    let retries: Vec<i32> = seen
        .iter()
        .filter_map(|event| match event {
            ProcessorEvent::TaskRetryScheduled { task, .. } => Some(task.retry_count),
            _ => None,
        })
        .collect();
    assert_eq!(claims, 3);
    assert_eq!(retries, vec![1, 2]);

    match seen.last().unwrap() {
        ProcessorEvent::TaskFailed { task, error } => {
            assert_eq!(task.retry_count, 2);
            assert!(error.contains("boom"));
        }
        other => panic!("expected TaskFailed, got {other:?}"),
    }

    let stored = chrono.datastore().get(task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.retry_count, 2);
}

#[tokio::test]
async fn retry_delays_follow_the_backoff_strategy() {
    init_tracing();
    let mut chrono = Chrono::new(MemoryTaskStore::new());

    let mut config = fast_processor_config();
    config.task_handler_max_retries = 2;
    chrono
        .register_task_handler(
            RegisterTaskHandlerOptions::builder()
                .kind("send-email")
                .processor(config)
                .backoff(BackoffStrategyOptions::Linear {
                    base_delay_ms: 0,
                    increment_ms: 100,
                })
                .build(),
            |_task| async move { Err(anyhow::anyhow!("boom")) },
        )
        .unwrap();

    chrono
        .schedule(ScheduleTaskInput::builder().kind("send-email").build())
        .await
        .unwrap();

    let mut events = chrono.processor_events("send-email").unwrap();
    chrono.start().await.unwrap();

    let seen = collect_until(&mut events, EVENT_TIMEOUT, |event| {
        matches!(event, ProcessorEvent::TaskFailed { .. })
    })
    .await;
    chrono.stop().await;

    // Each retry pushes scheduled_at forward by the strategy's delay for
    // that attempt: 0ms for attempt 0, 100ms for attempt 1.
    let scheduled: Vec<_> = seen
        .iter()
        .filter_map(|event| match event {
            ProcessorEvent::TaskRetryScheduled {
                retry_scheduled_at, ..
            } => Some(*retry_scheduled_at),
            _ => None,
        })
        .collect();
    assert_eq!(scheduled.len(), 2);
    assert!(scheduled[1] > scheduled[0]);
}

#[tokio::test]
async fn higher_priority_task_is_executed_first() {
    init_tracing();
    let mut chrono = Chrono::new(MemoryTaskStore::new());
    chrono
        .register_task_handler(
            RegisterTaskHandlerOptions::builder()
                .kind("send-email")
                .processor(fast_processor_config())
                .build(),
            |_task| async move { Ok(()) },
        )
        .unwrap();

    let low = chrono
        .schedule(
            ScheduleTaskInput::builder()
                .kind("send-email")
                .priority(1)
                .build(),
        )
        .await
        .unwrap();
    let high = chrono
        .schedule(
            ScheduleTaskInput::builder()
                .kind("send-email")
                .priority(10)
                .build(),
        )
        .await
        .unwrap();

    let mut events = chrono.processor_events("send-email").unwrap();
    chrono.start().await.unwrap();

    let seen = collect_until(&mut events, EVENT_TIMEOUT, |event| {
        matches!(event, ProcessorEvent::TaskCompleted { task, .. } if task.id == low.id)
    })
    .await;
    chrono.stop().await;

    let claimed: Vec<_> = seen
        .iter()
        .filter_map(|event| match event {
            ProcessorEvent::TaskClaimed { task, .. } => Some(task.id),
            _ => None,
        })
        .collect();
    assert_eq!(claimed, vec![high.id, low.id]);
}

#[tokio::test]
async fn duplicate_idempotency_key_returns_the_first_task() {
    init_tracing();
    let chrono = Chrono::new(MemoryTaskStore::new());

    let first = chrono
        .schedule(
            ScheduleTaskInput::builder()
                .kind("send-email")
                .data(serde_json::json!({ "payload": "a" }))
                .idempotency_key("k")
                .build(),
        )
        .await
        .unwrap();
    let second = chrono
        .schedule(
            ScheduleTaskInput::builder()
                .kind("send-email")
                .data(serde_json::json!({ "payload": "b" }))
                .idempotency_key("k")
                .build(),
        )
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(chrono.datastore().task_count().await, 1);
    let stored = chrono.datastore().get(first.id).await.unwrap();
    assert_eq!(stored.data, serde_json::json!({ "payload": "a" }));
}

#[tokio::test]
async fn slow_handler_times_out_and_fails_with_no_retries() {
    init_tracing();
    let mut chrono = Chrono::new(MemoryTaskStore::new());

    let mut config = fast_processor_config();
    config.task_handler_timeout = Duration::from_millis(50);
    config.task_handler_max_retries = 0;
    chrono
        .register_task_handler(
            RegisterTaskHandlerOptions::builder()
                .kind("send-email")
                .processor(config)
                .build(),
            |_task| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
        )
        .unwrap();

    let task = chrono
        .schedule(ScheduleTaskInput::builder().kind("send-email").build())
        .await
        .unwrap();

    let mut events = chrono.processor_events("send-email").unwrap();
    chrono.start().await.unwrap();

    let seen = collect_until(&mut events, EVENT_TIMEOUT, |event| {
        matches!(event, ProcessorEvent::TaskFailed { .. })
    })
    .await;
    chrono.stop().await;

    match seen.last().unwrap() {
        ProcessorEvent::TaskFailed { error, .. } => {
            assert!(error.contains("timed out"), "unexpected error: {error}");
        }
        other => panic!("expected TaskFailed, got {other:?}"),
    }

    let stored = chrono.datastore().get(task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_runners_drain_five_tasks_without_double_claims() {
    init_tracing();
    let mut chrono = Chrono::new(MemoryTaskStore::new());

    let mut config = fast_processor_config();
    config.max_concurrency = 2;
    chrono
        .register_task_handler(
            RegisterTaskHandlerOptions::builder()
                .kind("send-email")
                .processor(config)
                .build(),
            |_task| async move { Ok(()) },
        )
        .unwrap();

    for _ in 0..5 {
        chrono
            .schedule(ScheduleTaskInput::builder().kind("send-email").build())
            .await
            .unwrap();
    }

    let mut events = chrono.processor_events("send-email").unwrap();
    chrono.start().await.unwrap();

    let mut completed = 0;
    let seen = collect_until(&mut events, EVENT_TIMEOUT, |event| {
        if matches!(event, ProcessorEvent::TaskCompleted { .. }) {
            completed += 1;
        }
        completed == 5
    })
    .await;
    chrono.stop().await;

    let mut claimed_ids = HashSet::new();
    for event in &seen {
        if let ProcessorEvent::TaskClaimed { task, .. } = event {
            assert!(claimed_ids.insert(task.id), "task {} claimed twice", task.id);
        }
    }
    assert_eq!(claimed_ids.len(), 5);

    for task in chrono.datastore().all_tasks().await {
        assert_eq!(task.status, TaskStatus::Completed);
    }
}

#[tokio::test]
async fn completion_failure_is_reported_without_retrying() {
    init_tracing();
    let store = FaultyStore::new(MemoryTaskStore::new());
    store.set_fail_completes(true);
    let mut chrono = Chrono::new(store);

    chrono
        .register_task_handler(
            RegisterTaskHandlerOptions::builder()
                .kind("send-email")
                .processor(fast_processor_config())
                .build(),
            |_task| async move { Ok(()) },
        )
        .unwrap();

    let task = chrono
        .schedule(ScheduleTaskInput::builder().kind("send-email").build())
        .await
        .unwrap();

    let mut events = chrono.processor_events("send-email").unwrap();
    chrono.start().await.unwrap();

    let seen = collect_until(&mut events, EVENT_TIMEOUT, |event| {
        matches!(event, ProcessorEvent::TaskCompletionFailure { .. })
    })
    .await;
    chrono.stop().await;

    match seen.last().unwrap() {
        ProcessorEvent::TaskCompletionFailure { task: failed, error } => {
            assert_eq!(failed.id, task.id);
            assert!(error.contains("injected completion failure"));
        }
        other => panic!("expected TaskCompletionFailure, got {other:?}"),
    }

    // The work was done but the transition was not persisted: the task
    // stays claimed (to expire as stale) and retry_count is untouched.
    let stored = chrono.datastore().inner().get(task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Claimed);
    assert_eq!(stored.retry_count, 0);
}

#[tokio::test]
async fn claim_errors_cool_down_and_recover() {
    init_tracing();
    let store = FaultyStore::new(MemoryTaskStore::new());
    store.fail_next_claims(1);
    let mut chrono = Chrono::new(store);

    chrono
        .register_task_handler(
            RegisterTaskHandlerOptions::builder()
                .kind("send-email")
                .processor(fast_processor_config())
                .build(),
            |_task| async move { Ok(()) },
        )
        .unwrap();

    let task = chrono
        .schedule(ScheduleTaskInput::builder().kind("send-email").build())
        .await
        .unwrap();

    let mut events = chrono.processor_events("send-email").unwrap();
    chrono.start().await.unwrap();

    let seen = collect_until(&mut events, EVENT_TIMEOUT, |event| {
        matches!(event, ProcessorEvent::TaskCompleted { .. })
    })
    .await;
    chrono.stop().await;

    // The injected failure surfaces as an unknown processing error, then a
    // replacement runner completes the task after the cooldown.
    assert!(seen
        .iter()
        .any(|event| matches!(event, ProcessorEvent::UnknownProcessingError { .. })));

    let stored = chrono.datastore().inner().get(task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
}

#[tokio::test]
async fn every_claim_is_settled_by_exactly_one_event() {
    init_tracing();
    let mut chrono = Chrono::new(MemoryTaskStore::new());

    let mut config = fast_processor_config();
    config.task_handler_max_retries = 1;
    chrono
        .register_task_handler(
            RegisterTaskHandlerOptions::builder()
                .kind("send-email")
                .processor(config)
                .build(),
            |task| async move {
                // Fail the first attempt, succeed the retry.
                if task.retry_count == 0 {
                    Err(anyhow::anyhow!("first attempt fails"))
                } else {
                    Ok(())
                }
            },
        )
        .unwrap();

    chrono
        .schedule(ScheduleTaskInput::builder().kind("send-email").build())
        .await
        .unwrap();

    let mut events = chrono.processor_events("send-email").unwrap();
    chrono.start().await.unwrap();

    let seen = collect_until(&mut events, EVENT_TIMEOUT, |event| {
        matches!(event, ProcessorEvent::TaskCompleted { .. })
    })
    .await;
    chrono.stop().await;

    let claims = seen
        .iter()
        .filter(|e| matches!(e, ProcessorEvent::TaskClaimed { .. }))
        .count();
    let settles = seen
        .iter()
        .filter(|e| {
            matches!(
                e,
                ProcessorEvent::TaskCompleted { .. }
                    | ProcessorEvent::TaskRetryScheduled { .. }
                    | ProcessorEvent::TaskFailed { .. }
                    | ProcessorEvent::TaskCompletionFailure { .. }
            )
        })
        .count();
    assert_eq!(claims, settles);
    assert_eq!(claims, 2);
}
