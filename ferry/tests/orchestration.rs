//! End-to-end orchestration scenarios over the in-memory store and the
//! scripted substrate.
//!
//! Covers retry budgets, checkpoint hand-over between attempts, crash
//! recovery, cancellation, pool admission and transient store outages.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ferry::error::FerryError;
use ferry::events::JobEventPayload;
use ferry::job::{
    AttemptStatus, Checkpoint, ConnectionId, FailureKind, JobConfig, JobStatus, NewJob,
    OperationKind,
};
use ferry::persistence::InMemoryJobStore;
use ferry::retry::{BackoffStrategy, RetryConfig, StoreRetryConfig};
use ferry::store::JobStore;
use ferry::substrate::{unit_id_for, ExecutionSubstrate, UnitHandle, UnitSpec};
use ferry_testkit::{
    dispatcher_with, error_trace_line, eventually, fast_config, fast_supervisor_config,
    log_line, record_line, state_line, wait_for_status, wait_for_terminal, FlakyStore,
    ScriptedSubstrate, UnitScript,
};
use serde_json::json;

const WAIT: Duration = Duration::from_secs(5);

fn connector() -> JobConfig {
    JobConfig::new("source-scripted:1.0").with_args(["read"])
}

fn retry_with_max(max: u32) -> RetryConfig {
    RetryConfig::default()
        .with_backoff(BackoffStrategy::Fixed { delay_ms: 10 })
        .with_max_attempts(OperationKind::Sync, max)
}

#[tokio::test]
async fn fails_twice_then_succeeds_within_budget() {
    let store = Arc::new(InMemoryJobStore::new());
    let substrate = ScriptedSubstrate::with_scripts([
        UnitScript::failing([log_line("ERROR", "connection reset")], 1),
        UnitScript::failing(Vec::<String>::new(), 2),
        UnitScript::succeeding([record_line("users", json!({"id": 1}))]),
    ]);
    let dispatcher = dispatcher_with(
        store.clone(),
        substrate.clone(),
        fast_config(4).with_retry(retry_with_max(3)),
    );

    let job_id = dispatcher
        .submit(ConnectionId::new(), OperationKind::Sync, connector())
        .await
        .unwrap();
    let job = wait_for_terminal(store.as_ref(), job_id, WAIT).await;
    assert_eq!(job.status, JobStatus::Succeeded);

    let history: Vec<JobStatus> = dispatcher
        .status_history(job_id)
        .await
        .unwrap()
        .into_iter()
        .map(|change| change.status)
        .collect();
    assert_eq!(
        history,
        vec![
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Running,
            JobStatus::Running,
            JobStatus::Succeeded,
        ]
    );

    let attempts = dispatcher.attempts(job_id).await.unwrap();
    let statuses: Vec<AttemptStatus> = attempts.iter().map(|a| a.status).collect();
    assert_eq!(
        statuses,
        vec![
            AttemptStatus::Failed,
            AttemptStatus::Failed,
            AttemptStatus::Succeeded
        ]
    );
    assert_eq!(attempts[0].output.exit_code, Some(1));
    assert_eq!(attempts[2].output.records_emitted, 1);
}

#[tokio::test]
async fn retry_budget_bounds_attempts_and_numbers_them_densely() {
    let store = Arc::new(InMemoryJobStore::new());
    let substrate = ScriptedSubstrate::new();
    substrate.set_fallback(UnitScript::new().exit(1));
    let dispatcher = dispatcher_with(
        store.clone(),
        substrate.clone(),
        fast_config(4).with_retry(retry_with_max(3)),
    );

    let job_id = dispatcher
        .submit(ConnectionId::new(), OperationKind::Sync, connector())
        .await
        .unwrap();
    let job = wait_for_terminal(store.as_ref(), job_id, WAIT).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job
        .failure_reason
        .as_deref()
        .unwrap_or_default()
        .contains("failed after 3 attempt(s)"));

    let numbers: Vec<u32> = dispatcher
        .attempts(job_id)
        .await
        .unwrap()
        .iter()
        .map(|attempt| attempt.number)
        .collect();
    assert_eq!(numbers, vec![0, 1, 2]);
    assert_eq!(substrate.start_count(), 3);
    assert!(substrate.live_units().is_empty());
}

#[tokio::test]
async fn next_attempt_starts_from_checkpoint_of_crashed_attempt() {
    let store = Arc::new(InMemoryJobStore::new());
    let substrate = ScriptedSubstrate::with_scripts([
        UnitScript::failing([state_line(json!("cursor=100"))], 137),
        UnitScript::succeeding([state_line(json!("cursor=150"))]),
    ]);
    let dispatcher = dispatcher_with(store.clone(), substrate.clone(), fast_config(4));

    let job_id = dispatcher
        .submit(ConnectionId::new(), OperationKind::Sync, connector())
        .await
        .unwrap();
    let job = wait_for_terminal(store.as_ref(), job_id, WAIT).await;
    assert_eq!(job.status, JobStatus::Succeeded);

    let starts = substrate.starts();
    assert_eq!(starts.len(), 2);
    assert_eq!(starts[0].checkpoint, None);
    assert_eq!(starts[1].checkpoint, Some(Checkpoint::new(json!("cursor=100"))));
    assert_eq!(starts[1].attempt_number, 1);

    assert_eq!(
        store.latest_checkpoint(job_id).await.unwrap(),
        Some(Checkpoint::new(json!("cursor=150")))
    );
}

#[tokio::test]
async fn checkpoints_are_persisted_in_order_under_backpressure() {
    const STATES: usize = 300;

    let store = FlakyStore::new(Arc::new(InMemoryJobStore::new()));
    store.fail_operation("record_checkpoint", 3);

    let mut script = UnitScript::new();
    for n in 1..=STATES {
        script = script
            .emit(record_line("events", json!({"n": n})))
            .emit(state_line(json!({"cursor": n})));
    }
    let substrate = ScriptedSubstrate::with_scripts([script]);
    let config = fast_config(4).with_supervisor(fast_supervisor_config().with_event_buffer(1));
    let dispatcher = dispatcher_with(Arc::new(store.clone()), substrate, config);

    let job_id = dispatcher
        .submit(ConnectionId::new(), OperationKind::Sync, connector())
        .await
        .unwrap();
    let job = wait_for_terminal(&store, job_id, WAIT).await;
    assert_eq!(job.status, JobStatus::Succeeded);

    let history = dispatcher.checkpoints(job_id).await.unwrap();
    assert_eq!(history.len(), STATES);
    for (index, record) in history.iter().enumerate() {
        assert_eq!(record.sequence, index as u64 + 1);
        assert_eq!(record.checkpoint, Checkpoint::new(json!({"cursor": index + 1})));
    }

    let attempts = dispatcher.attempts(job_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].output.checkpoints_persisted, STATES as u64);
    assert_eq!(attempts[0].output.records_emitted, STATES as u64);
    assert!(store.injected_failures() >= 3);
}

#[tokio::test]
async fn resume_reconciles_abandoned_attempt_and_starts_exactly_one_more() {
    let store = Arc::new(InMemoryJobStore::new());
    let substrate = ScriptedSubstrate::new();

    // State left behind by an orchestrator that died mid-attempt.
    let job = store
        .create_job(NewJob {
            connection_id: ConnectionId::new(),
            operation: OperationKind::Sync,
            pool: "sync".into(),
            config: connector(),
        })
        .await
        .unwrap();
    let job = store
        .transition_job(job.id, JobStatus::Running, None)
        .await
        .unwrap();
    let attempt = store.create_attempt(job.id).await.unwrap();
    let residual = unit_id_for(job.id, 0);
    store.set_attempt_unit(attempt.id, &residual).await.unwrap();
    substrate.push_script(UnitScript::new().hang());
    substrate
        .start(&UnitSpec::for_attempt(&job, &attempt, None))
        .await
        .unwrap();
    assert_eq!(substrate.live_units(), vec![residual.clone()]);

    substrate.push_script(UnitScript::succeeding([state_line(json!({"cursor": 1}))]));
    let dispatcher = dispatcher_with(store.clone(), substrate.clone(), fast_config(4));
    assert_eq!(dispatcher.resume().await.unwrap(), 1);

    let finished = wait_for_terminal(store.as_ref(), job.id, WAIT).await;
    assert_eq!(finished.status, JobStatus::Succeeded);

    let attempts = store.list_attempts(job.id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].status, AttemptStatus::Failed);
    assert_eq!(attempts[0].output.failure_kind, Some(FailureKind::Abandoned));
    assert_eq!(attempts[1].status, AttemptStatus::Succeeded);
    assert!(substrate.was_destroyed(&residual));
    assert_eq!(substrate.start_count(), 2);
    assert!(substrate.live_units().is_empty());

    // Already terminal: nothing left to pick up.
    assert_eq!(dispatcher.resume().await.unwrap(), 0);
}

#[tokio::test]
async fn cancellation_stops_the_unit_within_one_heartbeat() {
    let store = Arc::new(InMemoryJobStore::new());
    let substrate = ScriptedSubstrate::with_scripts([UnitScript::new()
        .emit(log_line("INFO", "starting"))
        .hang()
        .ignore_terminate()]);
    let config = fast_config(4);
    let heartbeat = Duration::from_millis(config.supervisor.heartbeat_timeout_ms);
    let dispatcher = dispatcher_with(store.clone(), substrate.clone(), config);

    let job_id = dispatcher
        .submit(ConnectionId::new(), OperationKind::Sync, connector())
        .await
        .unwrap();
    eventually(WAIT, || {
        let substrate = substrate.clone();
        async move { (substrate.live_units().len() == 1).then_some(()) }
    })
    .await;

    let requested = Instant::now();
    dispatcher.cancel(job_id).await.unwrap();
    let job = wait_for_status(store.as_ref(), job_id, JobStatus::Cancelled, WAIT).await;
    assert!(requested.elapsed() < heartbeat);
    assert_eq!(job.status, JobStatus::Cancelled);

    let unit = unit_id_for(job_id, 0);
    assert_eq!(substrate.terminations(), vec![unit.clone()]);
    assert!(substrate.was_destroyed(&unit));
    assert!(substrate.live_units().is_empty());

    // No further attempts, and cancelling again is a no-op.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(substrate.start_count(), 1);
    let attempts = dispatcher.attempts(job_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, AttemptStatus::Cancelled);
    dispatcher.cancel(job_id).await.unwrap();
    assert_eq!(
        dispatcher.job(job_id).await.unwrap().status,
        JobStatus::Cancelled
    );
}

#[tokio::test]
async fn pool_admits_up_to_its_limit_and_queues_the_rest_in_order() {
    let store = Arc::new(InMemoryJobStore::new());
    let substrate = ScriptedSubstrate::new();
    substrate.set_fallback(UnitScript::new().hang());
    let dispatcher = dispatcher_with(store.clone(), substrate.clone(), fast_config(2));

    let mut jobs = Vec::new();
    for _ in 0..4 {
        jobs.push(
            dispatcher
                .submit(ConnectionId::new(), OperationKind::Sync, connector())
                .await
                .unwrap(),
        );
    }

    for job_id in &jobs[..2] {
        wait_for_status(store.as_ref(), *job_id, JobStatus::Running, WAIT).await;
    }
    for job_id in &jobs[2..] {
        assert_eq!(
            dispatcher.job(*job_id).await.unwrap().status,
            JobStatus::Pending
        );
        assert!(dispatcher.attempts(*job_id).await.unwrap().is_empty());
    }
    let utilization = dispatcher.pool_utilization("sync");
    assert_eq!((utilization.running, utilization.pending), (2, 2));

    // Freeing a slot admits the head of the queue, not the tail.
    dispatcher.cancel(jobs[0]).await.unwrap();
    wait_for_status(store.as_ref(), jobs[2], JobStatus::Running, WAIT).await;
    assert_eq!(
        dispatcher.job(jobs[3]).await.unwrap().status,
        JobStatus::Pending
    );

    // Cancelling a queued job withdraws it without starting anything.
    let starts_before = substrate.start_count();
    dispatcher.cancel(jobs[3]).await.unwrap();
    assert_eq!(
        dispatcher.job(jobs[3]).await.unwrap().status,
        JobStatus::Cancelled
    );
    assert!(dispatcher.attempts(jobs[3]).await.unwrap().is_empty());
    assert_eq!(substrate.start_count(), starts_before);
    assert_eq!(dispatcher.pool_utilization("sync").pending, 0);

    dispatcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn second_job_for_an_active_connection_is_rejected() {
    let store = Arc::new(InMemoryJobStore::new());
    let substrate = ScriptedSubstrate::new();
    substrate.set_fallback(UnitScript::new().hang());
    let dispatcher = dispatcher_with(store.clone(), substrate, fast_config(4));

    let connection = ConnectionId::new();
    let first = dispatcher
        .submit(connection, OperationKind::Sync, connector())
        .await
        .unwrap();
    let err = dispatcher
        .submit(connection, OperationKind::Reset, connector())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FerryError::AlreadyRunning { job_id, .. } if job_id == first
    ));

    dispatcher.cancel(first).await.unwrap();
    wait_for_terminal(store.as_ref(), first, WAIT).await;
    dispatcher
        .submit(connection, OperationKind::Sync, connector())
        .await
        .unwrap();
    dispatcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn start_failure_is_a_retryable_attempt_failure() {
    let store = Arc::new(InMemoryJobStore::new());
    let substrate = ScriptedSubstrate::with_scripts([
        UnitScript::start_failure("image pull failed"),
        UnitScript::succeeding(Vec::<String>::new()),
    ]);
    let dispatcher = dispatcher_with(store.clone(), substrate.clone(), fast_config(4));

    let job_id = dispatcher
        .submit(ConnectionId::new(), OperationKind::Sync, connector())
        .await
        .unwrap();
    let job = wait_for_terminal(store.as_ref(), job_id, WAIT).await;
    assert_eq!(job.status, JobStatus::Succeeded);

    let attempts = dispatcher.attempts(job_id).await.unwrap();
    assert_eq!(attempts[0].output.failure_kind, Some(FailureKind::StartFailed));
    assert!(attempts[0]
        .output
        .message
        .as_deref()
        .unwrap_or_default()
        .contains("image pull failed"));
    assert!(substrate.was_destroyed(&unit_id_for(job_id, 0)));
}

#[tokio::test]
async fn error_trace_fails_an_attempt_that_exits_cleanly() {
    let store = Arc::new(InMemoryJobStore::new());
    let substrate = ScriptedSubstrate::with_scripts([UnitScript::succeeding([
        record_line("users", json!({"id": 1})),
        error_trace_line("source database unreachable"),
    ])]);
    let dispatcher = dispatcher_with(
        store.clone(),
        substrate,
        fast_config(4).with_retry(retry_with_max(1)),
    );

    let job_id = dispatcher
        .submit(ConnectionId::new(), OperationKind::Sync, connector())
        .await
        .unwrap();
    let job = wait_for_terminal(store.as_ref(), job_id, WAIT).await;
    assert_eq!(job.status, JobStatus::Failed);

    let attempts = dispatcher.attempts(job_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].output.exit_code, Some(0));
    assert_eq!(attempts[0].output.failure_kind, Some(FailureKind::ErrorTrace));
    assert_eq!(
        attempts[0].output.message.as_deref(),
        Some("source database unreachable")
    );
}

#[tokio::test]
async fn silent_unit_fails_when_heartbeat_lapses() {
    let store = Arc::new(InMemoryJobStore::new());
    let substrate = ScriptedSubstrate::with_scripts([UnitScript::new()
        .emit(log_line("INFO", "connected"))
        .hang()]);
    let config = fast_config(4)
        .with_retry(retry_with_max(1))
        .with_supervisor(fast_supervisor_config().with_heartbeat_timeout(100));
    let dispatcher = dispatcher_with(store.clone(), substrate.clone(), config);

    let job_id = dispatcher
        .submit(ConnectionId::new(), OperationKind::Sync, connector())
        .await
        .unwrap();
    let job = wait_for_terminal(store.as_ref(), job_id, WAIT).await;
    assert_eq!(job.status, JobStatus::Failed);

    let attempts = dispatcher.attempts(job_id).await.unwrap();
    assert_eq!(
        attempts[0].output.failure_kind,
        Some(FailureKind::HeartbeatLapsed)
    );
    assert_eq!(substrate.terminations(), vec![unit_id_for(job_id, 0)]);
    assert!(substrate.live_units().is_empty());
}

#[tokio::test]
async fn attempt_deadline_times_out_a_chatty_unit() {
    let store = Arc::new(InMemoryJobStore::new());
    let mut script = UnitScript::new();
    for n in 0..100 {
        script = script
            .emit(log_line("INFO", &format!("still working {n}")))
            .sleep(Duration::from_millis(20));
    }
    let substrate = ScriptedSubstrate::with_scripts([script]);
    let config = fast_config(4)
        .with_retry(retry_with_max(1))
        .with_supervisor(fast_supervisor_config().with_attempt_timeout(200));
    let dispatcher = dispatcher_with(store.clone(), substrate, config);

    let job_id = dispatcher
        .submit(ConnectionId::new(), OperationKind::Sync, connector())
        .await
        .unwrap();
    let job = wait_for_terminal(store.as_ref(), job_id, WAIT).await;
    assert_eq!(job.status, JobStatus::Failed);

    let attempts = dispatcher.attempts(job_id).await.unwrap();
    assert_eq!(attempts[0].output.failure_kind, Some(FailureKind::TimedOut));
}

#[tokio::test]
async fn transient_store_outages_do_not_consume_attempts() {
    let store = FlakyStore::new(Arc::new(InMemoryJobStore::new()));
    store.fail_operation("record_attempt_outcome", 2);
    store.fail_operation("create_attempt", 1);
    let substrate = ScriptedSubstrate::with_scripts([UnitScript::succeeding([state_line(
        json!({"cursor": 7}),
    )])]);
    let dispatcher = dispatcher_with(
        Arc::new(store.clone()),
        substrate,
        fast_config(4).with_retry(retry_with_max(1)),
    );

    let job_id = dispatcher
        .submit(ConnectionId::new(), OperationKind::Sync, connector())
        .await
        .unwrap();
    let job = wait_for_terminal(&store, job_id, WAIT).await;
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(dispatcher.attempts(job_id).await.unwrap().len(), 1);
    assert_eq!(store.injected_failures(), 3);
}

#[tokio::test]
async fn shutdown_leaves_jobs_resumable() {
    let store = Arc::new(InMemoryJobStore::new());
    let first = ScriptedSubstrate::with_scripts([UnitScript::new().hang()]);
    let dispatcher = dispatcher_with(store.clone(), first.clone(), fast_config(4));

    let job_id = dispatcher
        .submit(ConnectionId::new(), OperationKind::Sync, connector())
        .await
        .unwrap();
    eventually(WAIT, || {
        let first = first.clone();
        async move { (first.live_units().len() == 1).then_some(()) }
    })
    .await;

    dispatcher.shutdown().await.unwrap();
    assert!(first.live_units().is_empty());
    assert_eq!(
        store.get_job(job_id).await.unwrap().status,
        JobStatus::Running
    );
    assert!(matches!(
        dispatcher
            .submit(ConnectionId::new(), OperationKind::Sync, connector())
            .await,
        Err(FerryError::ShuttingDown)
    ));

    let second = ScriptedSubstrate::with_scripts([UnitScript::succeeding(Vec::<String>::new())]);
    let restarted = dispatcher_with(store.clone(), second.clone(), fast_config(4));
    assert_eq!(restarted.resume().await.unwrap(), 1);

    let job = wait_for_terminal(store.as_ref(), job_id, WAIT).await;
    assert_eq!(job.status, JobStatus::Succeeded);
    let attempts = store.list_attempts(job_id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].output.failure_kind, Some(FailureKind::Abandoned));
    assert!(second.was_destroyed(&unit_id_for(job_id, 0)));
}

#[tokio::test]
async fn resume_moves_running_jobs_without_capacity_back_to_pending() {
    let store = Arc::new(InMemoryJobStore::new());
    let mut job_ids = Vec::new();
    for _ in 0..2 {
        let job = store
            .create_job(NewJob {
                connection_id: ConnectionId::new(),
                operation: OperationKind::Sync,
                pool: "sync".into(),
                config: connector(),
            })
            .await
            .unwrap();
        store
            .transition_job(job.id, JobStatus::Running, None)
            .await
            .unwrap();
        job_ids.push(job.id);
    }

    let substrate = ScriptedSubstrate::new();
    substrate.set_fallback(UnitScript::new().hang());
    let dispatcher = dispatcher_with(store.clone(), substrate, fast_config(1));
    assert_eq!(dispatcher.resume().await.unwrap(), 2);

    assert_eq!(
        store.get_job(job_ids[1]).await.unwrap().status,
        JobStatus::Pending
    );
    let utilization = dispatcher.pool_utilization("sync");
    assert_eq!((utilization.running, utilization.pending), (1, 1));

    dispatcher.cancel(job_ids[0]).await.unwrap();
    wait_for_status(store.as_ref(), job_ids[1], JobStatus::Running, WAIT).await;
    let history: Vec<JobStatus> = store
        .job_status_history(job_ids[1])
        .await
        .unwrap()
        .iter()
        .map(|change| change.status)
        .collect();
    assert_eq!(
        history,
        vec![
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Pending,
            JobStatus::Running
        ]
    );
    dispatcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn resumed_job_is_queued_only_once_it_is_back_to_pending() {
    let store = FlakyStore::new(Arc::new(InMemoryJobStore::new()));
    let mut job_ids = Vec::new();
    for _ in 0..2 {
        let job = store
            .create_job(NewJob {
                connection_id: ConnectionId::new(),
                operation: OperationKind::Sync,
                pool: "sync".into(),
                config: connector(),
            })
            .await
            .unwrap();
        store
            .transition_job(job.id, JobStatus::Running, None)
            .await
            .unwrap();
        job_ids.push(job.id);
    }
    store.slow_operation("transition_job", Duration::from_millis(300));

    let substrate = ScriptedSubstrate::new();
    substrate.set_fallback(UnitScript::new().hang());
    let dispatcher = dispatcher_with(Arc::new(store.clone()), substrate, fast_config(1));
    let resuming = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.resume().await }
    });

    // The second job is still being moved back to PENDING: not queued yet.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(dispatcher.pool_utilization("sync").pending, 0);
    assert_eq!(
        store.inner().get_job(job_ids[1]).await.unwrap().status,
        JobStatus::Running
    );

    assert_eq!(resuming.await.unwrap().unwrap(), 2);
    assert_eq!(dispatcher.pool_utilization("sync").pending, 1);
    assert_eq!(
        store.inner().get_job(job_ids[1]).await.unwrap().status,
        JobStatus::Pending
    );
    dispatcher.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_during_slot_handover_never_runs_a_second_orchestrator() {
    let store = Arc::new(InMemoryJobStore::new());
    let substrate = ScriptedSubstrate::new();
    substrate.set_fallback(UnitScript::new().sleep(Duration::from_millis(20)));
    let dispatcher = dispatcher_with(store.clone(), substrate, fast_config(1));

    for round in 0..20u64 {
        let first = dispatcher
            .submit(ConnectionId::new(), OperationKind::Sync, connector())
            .await
            .unwrap();
        let queued = dispatcher
            .submit(ConnectionId::new(), OperationKind::Sync, connector())
            .await
            .unwrap();

        // Land the cancel around the moment the first job hands its slot on.
        tokio::time::sleep(Duration::from_millis(10 + round)).await;
        dispatcher.cancel(queued).await.unwrap();

        let job = wait_for_terminal(store.as_ref(), queued, WAIT).await;
        assert_eq!(job.status, JobStatus::Cancelled, "round {round}");
        let attempts = store.list_attempts(queued).await.unwrap();
        assert!(attempts.len() <= 1, "round {round}: {attempts:?}");
        assert!(
            attempts
                .iter()
                .all(|attempt| attempt.output.failure_kind != Some(FailureKind::Abandoned)),
            "round {round}: a live attempt was reconciled as abandoned"
        );
        wait_for_terminal(store.as_ref(), first, WAIT).await;
    }
}

#[tokio::test]
async fn slow_checkpoint_writes_do_not_count_as_unit_silence() {
    let store = FlakyStore::new(Arc::new(InMemoryJobStore::new()));
    store.fail_operation("record_checkpoint", 3);
    let substrate = ScriptedSubstrate::with_scripts([UnitScript::succeeding([
        state_line(json!({"cursor": 1})),
        state_line(json!({"cursor": 2})),
        record_line("users", json!({"id": 1})),
    ])]);
    let supervisor = fast_supervisor_config()
        .with_heartbeat_timeout(100)
        .with_store_retry(StoreRetryConfig {
            max_tries: 5,
            backoff: BackoffStrategy::Fixed { delay_ms: 60 },
        });
    let dispatcher = dispatcher_with(
        Arc::new(store.clone()),
        substrate,
        fast_config(4)
            .with_supervisor(supervisor)
            .with_retry(retry_with_max(1)),
    );

    let job_id = dispatcher
        .submit(ConnectionId::new(), OperationKind::Sync, connector())
        .await
        .unwrap();
    let job = wait_for_terminal(&store, job_id, WAIT).await;
    assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.failure_reason);

    let attempts = dispatcher.attempts(job_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].output.checkpoints_persisted, 2);
    assert_eq!(attempts[0].output.records_emitted, 1);
    assert_eq!(dispatcher.checkpoints(job_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn checkpoints_read_before_the_deadline_are_all_persisted() {
    let store = FlakyStore::new(Arc::new(InMemoryJobStore::new()));
    store.slow_operation("record_checkpoint", Duration::from_millis(100));
    let mut script = UnitScript::new();
    for cursor in 1..=5 {
        script = script.emit(state_line(json!({ "cursor": cursor })));
    }
    let substrate = ScriptedSubstrate::with_scripts([script.hang()]);
    let dispatcher = dispatcher_with(
        Arc::new(store.clone()),
        substrate.clone(),
        fast_config(4)
            .with_supervisor(fast_supervisor_config().with_attempt_timeout(250))
            .with_retry(retry_with_max(1)),
    );

    let job_id = dispatcher
        .submit(ConnectionId::new(), OperationKind::Sync, connector())
        .await
        .unwrap();
    let job = wait_for_terminal(&store, job_id, WAIT).await;
    assert_eq!(job.status, JobStatus::Failed);

    let attempts = dispatcher.attempts(job_id).await.unwrap();
    assert_eq!(attempts[0].output.failure_kind, Some(FailureKind::TimedOut));
    assert_eq!(attempts[0].output.checkpoints_persisted, 5);

    let cursors: Vec<Checkpoint> = dispatcher
        .checkpoints(job_id)
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.checkpoint)
        .collect();
    let expected: Vec<Checkpoint> = (1..=5)
        .map(|cursor| Checkpoint::new(json!({ "cursor": cursor })))
        .collect();
    assert_eq!(cursors, expected);
    assert!(substrate.live_units().is_empty());
}

#[tokio::test]
async fn attempt_created_before_a_lost_reply_is_adopted() {
    let store = FlakyStore::new(Arc::new(InMemoryJobStore::new()));
    store.lose_replies("create_attempt", 1);
    let substrate = ScriptedSubstrate::with_scripts([UnitScript::succeeding([state_line(
        json!({"cursor": 1}),
    )])]);
    let dispatcher = dispatcher_with(
        Arc::new(store.clone()),
        substrate.clone(),
        fast_config(4).with_retry(retry_with_max(1)),
    );

    let job_id = dispatcher
        .submit(ConnectionId::new(), OperationKind::Sync, connector())
        .await
        .unwrap();
    let job = wait_for_terminal(&store, job_id, WAIT).await;
    assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.failure_reason);
    assert_eq!(dispatcher.attempts(job_id).await.unwrap().len(), 1);
    assert_eq!(substrate.start_count(), 1);
    assert_eq!(store.injected_failures(), 1);
}

#[tokio::test]
async fn writes_applied_before_a_lost_reply_are_not_repeated() {
    let store = FlakyStore::new(Arc::new(InMemoryJobStore::new()));
    store.lose_replies("record_checkpoint", 1);
    store.lose_replies("record_attempt_outcome", 1);
    let substrate = ScriptedSubstrate::with_scripts([UnitScript::succeeding([
        state_line(json!({"cursor": 1})),
        state_line(json!({"cursor": 2})),
    ])]);
    let dispatcher = dispatcher_with(
        Arc::new(store.clone()),
        substrate,
        fast_config(4).with_retry(retry_with_max(1)),
    );

    let job_id = dispatcher
        .submit(ConnectionId::new(), OperationKind::Sync, connector())
        .await
        .unwrap();
    let job = wait_for_terminal(&store, job_id, WAIT).await;
    assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.failure_reason);

    let sequences: Vec<u64> = dispatcher
        .checkpoints(job_id)
        .await
        .unwrap()
        .iter()
        .map(|record| record.sequence)
        .collect();
    assert_eq!(sequences, vec![1, 2]);

    let attempts = dispatcher.attempts(job_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, AttemptStatus::Succeeded);
    assert_eq!(attempts[0].output.checkpoints_persisted, 2);
    assert_eq!(store.injected_failures(), 2);
}

#[tokio::test]
async fn destroying_a_unit_twice_matches_destroying_it_once() {
    let substrate = ScriptedSubstrate::with_scripts([UnitScript::new().hang()]);
    let store = InMemoryJobStore::new();
    let job = store
        .create_job(NewJob {
            connection_id: ConnectionId::new(),
            operation: OperationKind::Sync,
            pool: "sync".into(),
            config: connector(),
        })
        .await
        .unwrap();
    let attempt = store.create_attempt(job.id).await.unwrap();
    let spec = UnitSpec::for_attempt(&job, &attempt, None);
    let handle = substrate.start(&spec).await.unwrap();

    substrate.destroy(&handle).await.unwrap();
    let after_once = substrate.live_units();
    substrate.destroy(&handle).await.unwrap();
    assert_eq!(substrate.live_units(), after_once);
    assert!(after_once.is_empty());

    substrate
        .destroy(&UnitHandle::new("never-started"))
        .await
        .unwrap();
}

#[tokio::test]
async fn subscribers_observe_the_job_lifecycle() {
    let store = Arc::new(InMemoryJobStore::new());
    let substrate = ScriptedSubstrate::with_scripts([UnitScript::succeeding([
        log_line("INFO", "reading users"),
        state_line(json!({"cursor": 1})),
    ])]);
    let dispatcher = dispatcher_with(store.clone(), substrate, fast_config(4));
    let mut events = dispatcher.subscribe();

    let job_id = dispatcher
        .submit(ConnectionId::new(), OperationKind::Sync, connector())
        .await
        .unwrap();

    let mut seen = Vec::new();
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            assert_eq!(event.job_id(), job_id);
            let finished = matches!(event.payload, JobEventPayload::JobFinished { .. });
            seen.push(event.payload);
            if finished {
                break;
            }
        }
    })
    .await
    .unwrap();

    assert!(matches!(seen[0], JobEventPayload::Submitted { .. }));
    assert!(seen
        .iter()
        .any(|payload| matches!(payload, JobEventPayload::Admitted { .. })));
    assert!(seen.iter().any(|payload| matches!(
        payload,
        JobEventPayload::AttemptLog { message, .. } if message == "reading users"
    )));
    assert!(seen.iter().any(|payload| matches!(
        payload,
        JobEventPayload::CheckpointPersisted { sequence: 1, .. }
    )));
    assert!(seen.iter().any(|payload| matches!(
        payload,
        JobEventPayload::AttemptFinished {
            status: AttemptStatus::Succeeded,
            ..
        }
    )));
    assert!(matches!(
        seen.last(),
        Some(JobEventPayload::JobFinished {
            status: JobStatus::Succeeded,
            ..
        })
    ));
}
