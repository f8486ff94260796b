//! Verifies the invocation lifecycle actually emits its `tracing` events,
//! capturing subscriber output with `tracing-test` rather than trusting the
//! instrumentation exists just because the source reads that way.

use std::sync::Arc;
use std::time::Duration;

use cmd_scheduler::config::SchedulerConfig;
use cmd_scheduler::fakes::{EchoConfigFactory, InMemoryDeviceManager, LoggingListener, SleepyInvocationEngineFactory};
use cmd_scheduler::invocation::MultiListener;
use cmd_scheduler::scheduler::CommandScheduler;
use tracing_test::traced_test;

fn build(devices: usize, invocation: Duration) -> Arc<CommandScheduler> {
    let device_manager = Arc::new(InMemoryDeviceManager::with_devices(devices));
    let config_factory = Arc::new(EchoConfigFactory);
    let engine_factory = Arc::new(SleepyInvocationEngineFactory::new(invocation));
    let mut listeners = MultiListener::new();
    listeners.add(Arc::new(LoggingListener));
    CommandScheduler::spawn(SchedulerConfig::default(), device_manager, config_factory, engine_factory, listeners)
}

#[tokio::test]
#[traced_test]
async fn invocation_lifecycle_is_logged() {
    let scheduler = build(1, Duration::from_millis(10));
    assert!(scheduler.wait_for_start(Some(Duration::from_secs(2))).await);

    scheduler.add(vec!["cfg-LOG".into()], None).await.expect("add should succeed");

    scheduler.shutdown_on_empty();
    assert!(scheduler.join(Some(Duration::from_secs(5))).await);

    assert!(logs_contain("invocation initiated"));
    assert!(logs_contain("invocation complete"));
}
