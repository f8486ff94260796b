//! Command Registry: owns id assignment and the add/remove surface from
//! `spec.md` §4.1. Operates on the shared `SchedulerState` under the
//! scheduler-wide lock described in §4.2/§5.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::command::{CommandTracker, DeviceRequirements, ExecutableCommand};
use crate::config_factory::ConfigFactory;
use crate::device_manager::DeviceManager;
use crate::error::{SchedulerError, SchedulerResult};
use crate::invocation::{InvocationContext, InvocationListener};
use crate::queues::SchedulerState;
use crate::shutdown::ShutdownController;

/// Raised when a cmdfile cannot be parsed into argument vectors.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CmdFileError(pub String);

/// The out-of-scope collaborator that turns a cmdfile into one argument
/// vector per command, expanding macros/includes.
#[async_trait]
pub trait CmdFileParser: Send + Sync {
    /// Parses `path` (plus any `extra_args` appended to every produced
    /// command) into one argument vector per command the file declares.
    async fn parse(&self, path: &Path, extra_args: &[String]) -> Result<Vec<Vec<String>>, CmdFileError>;
}

/// Owns command id assignment and gates additions against shutdown state.
pub struct CommandRegistry {
    state: Arc<Mutex<SchedulerState>>,
    config_factory: Arc<dyn ConfigFactory>,
    listeners: Arc<dyn InvocationListener>,
    wake: Arc<Notify>,
    shutdown: Arc<ShutdownController>,
}

impl CommandRegistry {
    pub(crate) fn new(
        state: Arc<Mutex<SchedulerState>>,
        config_factory: Arc<dyn ConfigFactory>,
        listeners: Arc<dyn InvocationListener>,
        wake: Arc<Notify>,
        shutdown: Arc<ShutdownController>,
    ) -> Self {
        Self {
            state,
            config_factory,
            listeners,
            wake,
            shutdown,
        }
    }

    /// Materializes a run-config from `argv` and either enqueues it or, for
    /// dry-run/help configs, emits a synthetic no-op reporting cycle
    /// instead.
    pub async fn add(
        &self,
        argv: Vec<String>,
        source_path: Option<PathBuf>,
    ) -> SchedulerResult<(bool, u64)> {
        if self.shutdown.is_draining() {
            return Err(SchedulerError::ShuttingDown);
        }

        let config = self
            .config_factory
            .create_config(&argv, None)
            .await
            .map_err(|e| SchedulerError::Config(e.0))?;

        let id = {
            let state = self.state.lock().expect("scheduler lock poisoned");
            state.next_command_id()
        };
        let tracker = CommandTracker::new(id, argv, source_path);

        if config.is_dry_run_or_help() {
            self.run_synthetic_cycle(id, &tracker);
            return Ok((true, id));
        }

        let command = ExecutableCommand::initial(tracker.clone(), config);
        {
            let mut state = self.state.lock().expect("scheduler lock poisoned");
            state.trackers.insert(id, tracker);
            state.ready.push(command);
        }
        self.wake.notify_one();
        Ok((true, id))
    }

    /// For each currently-known non-stub device, materializes one
    /// `ExecutableCommand` with the device serial pinned into its
    /// requirements, and enqueues all of them.
    pub async fn add_for_all_devices(
        &self,
        argv: Vec<String>,
        source_path: Option<PathBuf>,
        device_manager: &dyn DeviceManager,
    ) -> SchedulerResult<Vec<u64>> {
        if self.shutdown.is_draining() {
            return Err(SchedulerError::ShuttingDown);
        }

        let devices = device_manager.list_all_devices().await;
        let mut ids = Vec::new();
        for (device, _state) in devices.into_iter().filter(|(d, _)| !d.is_stub) {
            let config = self
                .config_factory
                .create_config(&argv, None)
                .await
                .map_err(|e| SchedulerError::Config(e.0))?;
            let pinned = PinnedDeviceConfig::new(config, device.serial.clone());

            let id = {
                let state = self.state.lock().expect("scheduler lock poisoned");
                state.next_command_id()
            };
            let tracker = CommandTracker::new(id, argv.clone(), source_path.clone());
            let command = ExecutableCommand::initial(tracker.clone(), Box::new(pinned));
            {
                let mut state = self.state.lock().expect("scheduler lock poisoned");
                state.trackers.insert(id, tracker);
                state.ready.push(command);
            }
            ids.push(id);
        }
        self.wake.notify_one();
        Ok(ids)
    }

    /// Batch form: parses a cmdfile and funnels each produced argument
    /// vector through `add`. When re-adding for a reload, first removes
    /// every command already sourced from `path` so the swap is atomic
    /// from the matching loop's point of view.
    pub async fn add_file(
        &self,
        path: &Path,
        extra_args: Vec<String>,
        parser: &dyn CmdFileParser,
    ) -> SchedulerResult<Vec<u64>> {
        if self.shutdown.is_draining() {
            return Err(SchedulerError::ShuttingDown);
        }

        let argvs = parser
            .parse(path, &extra_args)
            .await
            .map_err(|e| SchedulerError::Config(e.0))?;

        {
            let mut state = self.state.lock().expect("scheduler lock poisoned");
            let path_buf = path.to_path_buf();
            state.remove_matching(|tracker| tracker.source_path() == Some(&path_buf));
        }

        let mut ids = Vec::with_capacity(argvs.len());
        for argv in argvs {
            let (_, id) = self.add(argv, Some(path.to_path_buf())).await?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Removes matching commands from Ready and Sleeping (never Executing).
    pub fn remove(&self, predicate: impl Fn(&CommandTracker) -> bool) -> usize {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        state.remove_matching(predicate)
    }

    /// Clears Ready and Sleeping entirely.
    pub fn remove_all(&self) {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        state.clear_ready_and_sleeping();
    }

    /// Requests that `config` be queued as a new `ExecutableCommand`
    /// sharing `tracker`'s identity, entering Ready immediately with zero
    /// delay and loop mode forced off.
    pub(crate) fn reschedule(
        &self,
        tracker: Arc<CommandTracker>,
        config: Box<dyn crate::command::RunConfig>,
    ) {
        if self.shutdown.is_draining() {
            return;
        }
        let command = ExecutableCommand::rescheduled(tracker, config);
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        state.ready.push(command);
        drop(state);
        self.wake.notify_one();
    }

    fn run_synthetic_cycle(&self, id: u64, tracker: &Arc<CommandTracker>) {
        let context = InvocationContext {
            invocation_id: 0,
            command_id: id,
            devices: Vec::new(),
            attributes: Default::default(),
            tags: vec!["dry-run".into()],
        };
        self.listeners.invocation_initiated(&context);
        self.listeners
            .invocation_complete(&context, &Default::default());
        tracker.record_dispatch();
    }
}

/// Wraps an opaque `RunConfig` with a device serial pinned into its
/// requirements, used by `addForAllDevices`.
#[derive(Debug)]
struct PinnedDeviceConfig {
    inner: Box<dyn crate::command::RunConfig>,
    serial: String,
}

impl PinnedDeviceConfig {
    fn new(inner: Box<dyn crate::command::RunConfig>, serial: String) -> Self {
        Self { inner, serial }
    }
}

impl crate::command::RunConfig for PinnedDeviceConfig {
    fn device_requirements(&self) -> DeviceRequirements {
        DeviceRequirements {
            device_count: 1,
            pinned_serial: Some(self.serial.clone()),
        }
    }
    fn loop_mode(&self) -> bool {
        self.inner.loop_mode()
    }
    fn max_loop_count(&self) -> Option<u32> {
        self.inner.max_loop_count()
    }
    fn loop_delay(&self) -> std::time::Duration {
        self.inner.loop_delay()
    }
    fn invocation_timeout(&self) -> Option<std::time::Duration> {
        self.inner.invocation_timeout()
    }
    fn is_dry_run_or_help(&self) -> bool {
        self.inner.is_dry_run_or_help()
    }
    fn is_sandboxed(&self) -> bool {
        self.inner.is_sandboxed()
    }
    fn battery_cutoff_percent(&self) -> u8 {
        self.inner.battery_cutoff_percent()
    }
    fn clone_with_loop_disabled(&self) -> Box<dyn crate::command::RunConfig> {
        Box::new(Self {
            inner: self.inner.clone_with_loop_disabled(),
            serial: self.serial.clone(),
        })
    }
    fn clone_box(&self) -> Box<dyn crate::command::RunConfig> {
        Box::new(Self {
            inner: self.inner.clone_box(),
            serial: self.serial.clone(),
        })
    }
}
