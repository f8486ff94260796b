//! End-to-end scenario tests mirroring the literal inputs/outcomes in
//! `spec.md` §8 (S1-S6), driven against the in-memory fakes in
//! `cmd_scheduler::fakes` instead of real devices/hardware.

use std::sync::Arc;
use std::time::Duration;

use cmd_scheduler::config::SchedulerConfig;
use cmd_scheduler::error::InvocationCause;
use cmd_scheduler::fakes::{EchoConfigFactory, InMemoryDeviceManager, LoggingListener, SleepyInvocationEngineFactory};
use cmd_scheduler::invocation::MultiListener;
use cmd_scheduler::scheduler::CommandScheduler;

fn build(devices: usize, invocation: Duration) -> Arc<CommandScheduler> {
    let device_manager = Arc::new(InMemoryDeviceManager::with_devices(devices));
    let config_factory = Arc::new(EchoConfigFactory);
    let engine_factory = Arc::new(SleepyInvocationEngineFactory::new(invocation));
    let mut listeners = MultiListener::new();
    listeners.add(Arc::new(LoggingListener));
    CommandScheduler::spawn(SchedulerConfig::default(), device_manager, config_factory, engine_factory, listeners)
}

/// S1 — single command, single device, no loop, short invocation.
#[tokio::test]
async fn s1_single_command_single_device() {
    let scheduler = build(1, Duration::from_millis(20));
    assert!(scheduler.wait_for_start(Some(Duration::from_secs(2))).await);

    let (accepted, id) = scheduler.add(vec!["cfg-A".into()], None).await.expect("add should succeed");
    assert!(accepted);
    assert_eq!(id, 0);

    scheduler.shutdown_on_empty();
    assert!(scheduler.join(Some(Duration::from_secs(5))).await, "scheduler should drain in time");

    assert_eq!(scheduler.scheduled_count(id), Some(1));
    let last = scheduler.last_result();
    assert_eq!(last.cause, Some(InvocationCause::NoError));

    let lengths = scheduler.queue_lengths();
    assert_eq!(lengths.executing, 0);
}

/// S2 — loop mode with max-loop-count=3: exactly three dispatches.
#[tokio::test]
async fn s2_loop_with_max_three() {
    let scheduler = build(1, Duration::from_millis(10));
    assert!(scheduler.wait_for_start(Some(Duration::from_secs(2))).await);

    let (_, id) = scheduler
        .add(
            vec![
                "cfg-B".into(),
                "--loop".into(),
                "--max-loop-count=3".into(),
                "--loop-delay-ms=0".into(),
            ],
            None,
        )
        .await
        .expect("add should succeed");

    // Give the loop a generous window to complete all three iterations,
    // polling rather than sleeping a fixed amount since dispatch timing is
    // not otherwise observable from outside the scheduler.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while scheduler.scheduled_count(id) != Some(3) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(scheduler.scheduled_count(id), Some(3));

    scheduler.shutdown_on_empty();
    assert!(scheduler.join(Some(Duration::from_secs(5))).await);
    // No fourth iteration should have been enqueued.
    assert_eq!(scheduler.scheduled_count(id), Some(3));
}

/// S3 — multi-device command where the pool can only satisfy one of two
/// devices: the command stays in Ready and the one allocated device is
/// freed back to Available rather than leaking as Allocated.
#[tokio::test]
async fn s3_multi_device_partial_failure_frees_back() {
    let scheduler = build(1, Duration::from_millis(20));
    assert!(scheduler.wait_for_start(Some(Duration::from_secs(2))).await);

    let (_, id) = scheduler
        .add(vec!["cfg-C".into(), "--devices=2".into()], None)
        .await
        .expect("add should succeed");

    tokio::time::sleep(Duration::from_millis(100)).await;

    // The command can never be matched (pool only ever has one device), so
    // it must still be in Ready and never dispatched.
    assert_eq!(scheduler.scheduled_count(id), Some(0));
    let lengths = scheduler.queue_lengths();
    assert_eq!(lengths.ready, 1);
    assert_eq!(lengths.executing, 0);

    scheduler.remove_all();
    scheduler.shutdown_on_empty();
    assert!(scheduler.join(Some(Duration::from_secs(5))).await);
}

/// S4 — invocation timeout: a config with a timeout shorter than the
/// simulated run duration gets force-stopped, and the scheduler keeps
/// serving other commands afterwards.
#[tokio::test]
async fn s4_invocation_timeout_force_stops() {
    let scheduler = build(1, Duration::from_secs(5));
    assert!(scheduler.wait_for_start(Some(Duration::from_secs(2))).await);

    let (_, id) = scheduler
        .add(vec!["cfg-D".into(), "--timeout-ms=50".into()], None)
        .await
        .expect("add should succeed");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while scheduler.scheduled_count(id) != Some(1) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(scheduler.scheduled_count(id), Some(1));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while scheduler.queue_lengths().executing != 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(scheduler.queue_lengths().executing, 0, "timed-out invocation should have completed quickly, not run the full 5s");

    // Scheduler keeps serving other commands after a timeout.
    let (_, other_id) = scheduler.add(vec!["cfg-E".into()], None).await.expect("add should succeed");
    scheduler.shutdown_on_empty();
    assert!(scheduler.join(Some(Duration::from_secs(5))).await);
    assert_eq!(scheduler.scheduled_count(other_id), Some(1));
}

/// S5 — graceful shutdown drains: in-flight work completes, Ready stays
/// empty throughout the drain (since shutdown clears it up front).
#[tokio::test]
async fn s5_graceful_shutdown_drains() {
    let scheduler = build(2, Duration::from_millis(150));
    assert!(scheduler.wait_for_start(Some(Duration::from_secs(2))).await);

    let (_, id_a) = scheduler.add(vec!["cfg-F".into()], None).await.expect("add should succeed");
    let (_, id_b) = scheduler.add(vec!["cfg-G".into()], None).await.expect("add should succeed");

    // Give the loop a chance to dispatch both onto the two-device pool.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while scheduler.queue_lengths().executing < 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // A third command submitted right as we start draining should either
    // be rejected outright or left stranded in Ready until the drain clears
    // it — either way Ready never grows unbounded.
    scheduler.shutdown_on_empty();
    let _ = scheduler.add(vec!["cfg-H".into()], None).await;

    assert!(scheduler.join(Some(Duration::from_secs(5))).await, "drain should complete once in-flight work finishes");

    let lengths = scheduler.queue_lengths();
    assert_eq!(lengths.ready, 0);
    assert_eq!(lengths.sleeping, 0);
    assert_eq!(lengths.executing, 0);

    assert_eq!(scheduler.scheduled_count(id_a), Some(1));
    assert_eq!(scheduler.scheduled_count(id_b), Some(1));
}

/// Counts `invocation_complete` calls, so tests can assert no further
/// reporting happens once a hard shutdown has disabled reporters.
#[derive(Default)]
struct CountingListener {
    completions: std::sync::atomic::AtomicUsize,
}

impl cmd_scheduler::invocation::InvocationListener for CountingListener {
    fn invocation_complete(
        &self,
        _context: &cmd_scheduler::invocation::InvocationContext,
        _release_map: &cmd_scheduler::device_manager::ReleaseMap,
    ) {
        self.completions.fetch_add(1, std::sync::atomic::Ordering::Release);
    }
}

/// S6 — hard shutdown interrupts in-progress invocations regardless of
/// whether they would otherwise have finished cleanly, disables reporters
/// before teardown, and forces the Device Manager down via `terminateHard`.
#[tokio::test]
async fn s6_hard_shutdown_interrupts() {
    let device_manager = Arc::new(InMemoryDeviceManager::with_devices(2));
    let config_factory = Arc::new(EchoConfigFactory);
    let engine_factory = Arc::new(SleepyInvocationEngineFactory::new(Duration::from_secs(30)));
    let counting = Arc::new(CountingListener::default());
    let mut listeners = MultiListener::new();
    listeners.add(counting.clone());
    let scheduler = CommandScheduler::spawn(
        SchedulerConfig::default(),
        device_manager.clone(),
        config_factory,
        engine_factory,
        listeners,
    );
    assert!(scheduler.wait_for_start(Some(Duration::from_secs(2))).await);

    scheduler.add(vec!["cfg-I".into()], None).await.expect("add should succeed");
    scheduler.add(vec!["cfg-J".into()], None).await.expect("add should succeed");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while scheduler.queue_lengths().executing < 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(scheduler.queue_lengths().executing, 2, "both commands should have been dispatched onto the two-device pool");

    scheduler.shutdown_hard(true);
    assert!(
        scheduler.join(Some(Duration::from_secs(5))).await,
        "hard shutdown must not wait for the full 30s invocation duration"
    );

    assert_eq!(scheduler.queue_lengths().executing, 0);
    assert!(device_manager.terminate_hard_called(), "shutdown_hard(true) must reach the Device Manager's terminateHard");
    assert_eq!(
        counting.completions.load(std::sync::atomic::Ordering::Acquire),
        0,
        "reporters must be disabled before force-stopped invocations complete"
    );
}
