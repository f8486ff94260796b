//! In-memory implementations of the collaborator traits.
//!
//! The Device Manager, Config Factory, and Invocation Engine are explicitly
//! out of scope — real deployments inject their own. These
//! fakes exist so the crate is runnable and testable end to end without
//! physical devices, shipping an in-memory stand-in alongside each real
//! trait.

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::command::{DeviceRequirements, RunConfig};
use crate::config_factory::{ConfigFactory, ConfigFactoryError};
use crate::device_manager::{DeviceDescriptor, DeviceManager, DeviceState};
use crate::invocation::{
    ExitInfo, InvocationContext, InvocationEngine, InvocationEngineFactory, InvocationError,
    InvocationListener, Rescheduler,
};
use crate::registry::{CmdFileError, CmdFileParser};

/// A plain, clonable run-config good enough for tests and CLI demos:
/// everything the `RunConfig` trait exposes as a field with a sensible
/// default.
#[derive(Debug, Clone)]
pub struct SimpleRunConfig {
    pub device_count: usize,
    pub pinned_serial: Option<String>,
    pub loop_mode: bool,
    pub max_loop_count: Option<u32>,
    pub loop_delay: Duration,
    pub invocation_timeout: Option<Duration>,
    pub dry_run_or_help: bool,
    pub sandboxed: bool,
    pub battery_cutoff_percent: u8,
}

impl Default for SimpleRunConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            pinned_serial: None,
            loop_mode: false,
            max_loop_count: None,
            loop_delay: Duration::ZERO,
            invocation_timeout: None,
            dry_run_or_help: false,
            sandboxed: false,
            battery_cutoff_percent: 10,
        }
    }
}

impl RunConfig for SimpleRunConfig {
    fn device_requirements(&self) -> DeviceRequirements {
        DeviceRequirements {
            device_count: self.device_count,
            pinned_serial: self.pinned_serial.clone(),
        }
    }
    fn loop_mode(&self) -> bool {
        self.loop_mode
    }
    fn max_loop_count(&self) -> Option<u32> {
        self.max_loop_count
    }
    fn loop_delay(&self) -> Duration {
        self.loop_delay
    }
    fn invocation_timeout(&self) -> Option<Duration> {
        self.invocation_timeout
    }
    fn is_dry_run_or_help(&self) -> bool {
        self.dry_run_or_help
    }
    fn is_sandboxed(&self) -> bool {
        self.sandboxed
    }
    fn battery_cutoff_percent(&self) -> u8 {
        self.battery_cutoff_percent
    }
    fn clone_with_loop_disabled(&self) -> Box<dyn RunConfig> {
        let mut clone = self.clone();
        clone.loop_mode = false;
        Box::new(clone)
    }
    fn clone_box(&self) -> Box<dyn RunConfig> {
        Box::new(self.clone())
    }
}

/// Parses a handful of `--flag` / `--flag=value` tokens out of an argument
/// vector into a `SimpleRunConfig`. Deliberately not a real grammar — the
/// real argument-parsing grammar is deliberately out of scope; this is
/// only enough for demos and tests to express loop/timeout/device-count
/// intent from plain strings.
#[derive(Debug, Default)]
pub struct EchoConfigFactory;

#[async_trait]
impl ConfigFactory for EchoConfigFactory {
    async fn create_config(
        &self,
        argv: &[String],
        _key_store: Option<&str>,
    ) -> Result<Box<dyn RunConfig>, ConfigFactoryError> {
        if argv.is_empty() {
            return Err(ConfigFactoryError("empty argument vector".into()));
        }
        let mut config = SimpleRunConfig::default();
        for arg in argv {
            if arg == "--dry-run" || arg == "--help" {
                config.dry_run_or_help = true;
            } else if arg == "--loop" {
                config.loop_mode = true;
            } else if arg == "--sandboxed" {
                config.sandboxed = true;
            } else if let Some(value) = arg.strip_prefix("--devices=") {
                config.device_count = value
                    .parse()
                    .map_err(|_| ConfigFactoryError(format!("bad --devices value: {value}")))?;
            } else if let Some(value) = arg.strip_prefix("--max-loop-count=") {
                config.max_loop_count = Some(
                    value
                        .parse()
                        .map_err(|_| ConfigFactoryError(format!("bad --max-loop-count value: {value}")))?,
                );
            } else if let Some(value) = arg.strip_prefix("--loop-delay-ms=") {
                let ms: u64 = value
                    .parse()
                    .map_err(|_| ConfigFactoryError(format!("bad --loop-delay-ms value: {value}")))?;
                config.loop_delay = Duration::from_millis(ms);
            } else if let Some(value) = arg.strip_prefix("--timeout-ms=") {
                let ms: u64 = value
                    .parse()
                    .map_err(|_| ConfigFactoryError(format!("bad --timeout-ms value: {value}")))?;
                config.invocation_timeout = Some(Duration::from_millis(ms));
            } else if let Some(value) = arg.strip_prefix("--battery-cutoff=") {
                config.battery_cutoff_percent = value
                    .parse()
                    .map_err(|_| ConfigFactoryError(format!("bad --battery-cutoff value: {value}")))?;
            }
        }
        Ok(Box::new(config))
    }
}

struct DeviceRecord {
    descriptor: DeviceDescriptor,
    state: DeviceState,
    battery_percent: Option<u8>,
    responsive: bool,
}

/// An in-memory device pool: fixed set of real devices plus on-demand stub
/// devices for dry-run/help commands. Good enough to drive the scheduling
/// loop's allocate/free/probe/battery calls without hardware.
pub struct InMemoryDeviceManager {
    devices: Mutex<HashMap<String, DeviceRecord>>,
    monitors: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    first_device_seen: AtomicBool,
    terminate_hard_called: AtomicBool,
}

impl InMemoryDeviceManager {
    /// Builds a pool with `count` real, initially-Available devices named
    /// `device-0`, `device-1`, ...
    pub fn with_devices(count: usize) -> Self {
        let mut devices = HashMap::new();
        for i in 0..count {
            let serial = format!("device-{i}");
            devices.insert(
                serial.clone(),
                DeviceRecord {
                    descriptor: DeviceDescriptor {
                        serial,
                        is_stub: false,
                    },
                    state: DeviceState::Available,
                    battery_percent: None,
                    responsive: true,
                },
            );
        }
        Self {
            devices: Mutex::new(devices),
            monitors: Mutex::new(Vec::new()),
            first_device_seen: AtomicBool::new(count > 0),
            terminate_hard_called: AtomicBool::new(false),
        }
    }

    /// Whether `terminate_hard` has been called yet, for tests asserting
    /// the hard-shutdown path actually reaches the Device Manager.
    pub fn terminate_hard_called(&self) -> bool {
        self.terminate_hard_called.load(Ordering::Acquire)
    }

    /// Sets `serial`'s reported battery level for the next battery-policy
    /// check.
    pub fn set_battery_level(&self, serial: &str, percent: u8) {
        let mut devices = self.devices.lock().expect("device pool lock poisoned");
        if let Some(record) = devices.get_mut(serial) {
            record.battery_percent = Some(percent);
        }
        drop(devices);
        self.fire_monitors();
    }

    /// Marks `serial` as failing its next responsiveness probe.
    pub fn set_responsive(&self, serial: &str, responsive: bool) {
        let mut devices = self.devices.lock().expect("device pool lock poisoned");
        if let Some(record) = devices.get_mut(serial) {
            record.responsive = responsive;
        }
    }

    fn fire_monitors(&self) {
        for callback in self.monitors.lock().expect("monitor lock poisoned").iter() {
            callback();
        }
    }
}

#[async_trait]
impl DeviceManager for InMemoryDeviceManager {
    async fn allocate(
        &self,
        requirements: &DeviceRequirements,
        is_fake: bool,
    ) -> Option<DeviceDescriptor> {
        if is_fake {
            return Some(DeviceDescriptor {
                serial: format!("stub-{}", uuid::Uuid::new_v4()),
                is_stub: true,
            });
        }
        let mut devices = self.devices.lock().expect("device pool lock poisoned");
        if let Some(serial) = &requirements.pinned_serial {
            let record = devices.get_mut(serial)?;
            if record.state != DeviceState::Available {
                return None;
            }
            record.state = DeviceState::Allocated;
            log::info!("allocated pinned device {serial}");
            return Some(record.descriptor.clone());
        }
        let candidate = devices
            .values_mut()
            .find(|record| record.state == DeviceState::Available)?;
        candidate.state = DeviceState::Allocated;
        log::info!("allocated device {}", candidate.descriptor.serial);
        Some(candidate.descriptor.clone())
    }

    async fn free(&self, device: &DeviceDescriptor, release_state: DeviceState) {
        if device.is_stub {
            return;
        }
        let mut devices = self.devices.lock().expect("device pool lock poisoned");
        if let Some(record) = devices.get_mut(&device.serial) {
            record.state = release_state;
        }
        drop(devices);
        log::info!("freed device {} as {release_state:?}", device.serial);
        self.fire_monitors();
    }

    async fn probe_responsive(&self, device: &DeviceDescriptor) -> bool {
        if device.is_stub {
            return true;
        }
        let devices = self.devices.lock().expect("device pool lock poisoned");
        devices.get(&device.serial).map(|r| r.responsive).unwrap_or(false)
    }

    async fn battery_level_percent(&self, device: &DeviceDescriptor) -> Option<u8> {
        let devices = self.devices.lock().expect("device pool lock poisoned");
        devices.get(&device.serial).and_then(|r| r.battery_percent)
    }

    async fn list_all_devices(&self) -> Vec<(DeviceDescriptor, DeviceState)> {
        let devices = self.devices.lock().expect("device pool lock poisoned");
        devices
            .values()
            .map(|r| (r.descriptor.clone(), r.state))
            .collect()
    }

    fn add_device_monitor(&self, callback: Box<dyn Fn() + Send + Sync>) {
        self.monitors.lock().expect("monitor lock poisoned").push(callback);
    }

    async fn terminate(&self) {}

    async fn terminate_hard(&self, reason: &str) {
        log::warn!("device bridge forced down: {reason}");
        self.terminate_hard_called.store(true, Ordering::Release);
    }

    async fn wait_for_first_device_added(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.first_device_seen.load(Ordering::Acquire) {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

/// An invocation engine that sleeps for a configurable duration (simulating
/// real test work) while polling its own stop flags, honoring notify-stop
/// and force-stop cooperatively.
pub struct SleepyInvocationEngine {
    run_duration: Duration,
    poll_interval: Duration,
    notify_stopped: AtomicBool,
    force_stopped: AtomicBool,
    interruptible: AtomicBool,
    last_exit: Mutex<ExitInfo>,
}

impl SleepyInvocationEngine {
    pub fn new(run_duration: Duration) -> Self {
        Self {
            run_duration,
            poll_interval: Duration::from_millis(5),
            notify_stopped: AtomicBool::new(false),
            force_stopped: AtomicBool::new(false),
            interruptible: AtomicBool::new(true),
            last_exit: Mutex::new(ExitInfo::default()),
        }
    }

    /// Builds an engine that reports as not currently interruptible, to
    /// exercise the force-stop grace-window path.
    pub fn uninterruptible(run_duration: Duration) -> Self {
        let engine = Self::new(run_duration);
        engine.interruptible.store(false, Ordering::Release);
        engine
    }
}

#[async_trait]
impl InvocationEngine for SleepyInvocationEngine {
    async fn invoke(
        &self,
        _context: &mut InvocationContext,
        _config: &dyn RunConfig,
        _rescheduler: Rescheduler,
        _listeners: Arc<dyn InvocationListener>,
    ) -> Result<(), InvocationError> {
        let mut elapsed = Duration::ZERO;
        while elapsed < self.run_duration {
            if self.force_stopped.load(Ordering::Acquire) {
                return Err(InvocationError::InvocationCancelled("force-stopped".into()));
            }
            if self.notify_stopped.load(Ordering::Acquire) {
                return Err(InvocationError::InvocationCancelled("notify-stopped".into()));
            }
            // Jitter the poll tick a little so a fleet of simulated
            // invocations doesn't all wake in lockstep.
            let jitter_micros = rand::thread_rng().gen_range(0..self.poll_interval.as_micros() as u64 / 4 + 1);
            let tick = self.poll_interval + Duration::from_micros(jitter_micros);
            tokio::time::sleep(tick).await;
            elapsed += tick;
        }
        Ok(())
    }

    fn notify_invocation_stopped(&self, _reason: &str) {
        self.notify_stopped.store(true, Ordering::Release);
    }

    fn notify_invocation_force_stopped(&self, _reason: &str, _error_id: Option<&str>) {
        self.force_stopped.store(true, Ordering::Release);
    }

    fn is_interruptible(&self) -> bool {
        self.interruptible.load(Ordering::Acquire)
    }

    fn exit_info(&self) -> ExitInfo {
        self.last_exit.lock().expect("exit-info lock poisoned").clone()
    }
}

/// Produces a fresh `SleepyInvocationEngine` per invocation, all sharing the
/// same configured run duration.
pub struct SleepyInvocationEngineFactory {
    run_duration: Duration,
}

impl SleepyInvocationEngineFactory {
    pub fn new(run_duration: Duration) -> Self {
        Self { run_duration }
    }
}

impl InvocationEngineFactory for SleepyInvocationEngineFactory {
    fn create(&self) -> Arc<dyn InvocationEngine> {
        Arc::new(SleepyInvocationEngine::new(self.run_duration))
    }
}

/// A `CmdFileParser` that reads one argument vector per non-empty,
/// non-comment (`#`) line, whitespace-split, with `extra_args` appended to
/// every line.
#[derive(Debug, Default)]
pub struct LineCmdFileParser;

#[async_trait]
impl CmdFileParser for LineCmdFileParser {
    async fn parse(&self, path: &std::path::Path, extra_args: &[String]) -> Result<Vec<Vec<String>>, CmdFileError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CmdFileError(format!("reading {}: {e}", path.display())))?;
        let mut argvs = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut argv: Vec<String> = line.split_whitespace().map(str::to_string).collect();
            argv.extend(extra_args.iter().cloned());
            argvs.push(argv);
        }
        Ok(argvs)
    }
}

/// A listener that logs every lifecycle event via `tracing`, useful as the
/// scheduler's default listener in the CLI binary.
#[derive(Debug, Default)]
pub struct LoggingListener;

impl InvocationListener for LoggingListener {
    fn invocation_initiated(&self, context: &InvocationContext) {
        tracing::info!(invocation_id = context.invocation_id, command_id = context.command_id, "invocation initiated");
    }

    fn invocation_complete(&self, context: &InvocationContext, release_map: &crate::device_manager::ReleaseMap) {
        tracing::info!(
            invocation_id = context.invocation_id,
            command_id = context.command_id,
            ?release_map,
            "invocation complete"
        );
    }

    fn report_event(&self, context: &InvocationContext, event: &str) {
        tracing::debug!(invocation_id = context.invocation_id, event, "report event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_config_factory_parses_flags() {
        let factory = EchoConfigFactory;
        let config = factory
            .create_config(
                &[
                    "cfg-A".to_string(),
                    "--loop".to_string(),
                    "--devices=2".to_string(),
                    "--max-loop-count=3".to_string(),
                ],
                None,
            )
            .await
            .expect("should parse");
        assert!(config.loop_mode());
        assert_eq!(config.device_requirements().device_count, 2);
        assert_eq!(config.max_loop_count(), Some(3));
    }

    #[tokio::test]
    async fn echo_config_factory_rejects_empty_argv() {
        let factory = EchoConfigFactory;
        assert!(factory.create_config(&[], None).await.is_err());
    }

    #[tokio::test]
    async fn device_manager_allocates_and_frees() {
        let manager = InMemoryDeviceManager::with_devices(1);
        let requirements = DeviceRequirements::default();
        let device = manager.allocate(&requirements, false).await.expect("should allocate");
        assert!(manager.allocate(&requirements, false).await.is_none());
        manager.free(&device, DeviceState::Available).await;
        assert!(manager.allocate(&requirements, false).await.is_some());
    }

    #[tokio::test]
    async fn device_manager_pins_to_serial() {
        let manager = InMemoryDeviceManager::with_devices(2);
        let requirements = DeviceRequirements {
            device_count: 1,
            pinned_serial: Some("device-1".to_string()),
        };
        let device = manager.allocate(&requirements, false).await.expect("should allocate");
        assert_eq!(device.serial, "device-1");
    }

    #[tokio::test]
    async fn sleepy_engine_honors_force_stop() {
        let engine = SleepyInvocationEngine::new(Duration::from_secs(10));
        engine.notify_invocation_force_stopped("test", None);
        let mut context = InvocationContext {
            invocation_id: 1,
            command_id: 1,
            devices: Vec::new(),
            attributes: HashMap::new(),
            tags: Vec::new(),
        };
        let config = SimpleRunConfig::default();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let rescheduler = Rescheduler::new(1, tx);
        let listener: Arc<dyn InvocationListener> = Arc::new(LoggingListener);
        let result = engine.invoke(&mut context, &config, rescheduler, listener).await;
        assert!(matches!(result, Err(InvocationError::InvocationCancelled(_))));
    }
}
