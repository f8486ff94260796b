//! Invocation worker supervision: per-invocation worker
//! lifecycle (init/run/completion), cancellation, and battery policy.

use futures::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::command::{CommandId, CommandTracker, ExecutableCommand, InvocationId, RunConfig};
use crate::config::SchedulerConfig;
use crate::device_manager::{DeviceDescriptor, DeviceManager, DeviceState, ReleaseMap};
use crate::error::InvocationCause;
use crate::invocation::{InvocationContext, InvocationEngine, InvocationError, InvocationListener};
use crate::queues::{ExecutingEntry, SchedulerState};

/// Optional sink the completion phase writes trace artefacts to. Absence
/// is not an error.
pub trait TraceSink: Send + Sync {
    /// Emits whatever trace data accumulated for this invocation.
    fn emit_trace(&self, context: &InvocationContext);

    /// Propagates a subprocess's trace file up into its parent's trace,
    /// when the command was launched as a subprocess.
    fn propagate_subprocess_trace(&self, _parent_invocation_id: InvocationId) {}
}

/// Last-exit-code / last-throwable bookkeeping the scheduler records
///.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LastResult {
    pub cause: Option<InvocationCause>,
    pub last_throwable: Option<String>,
}

/// Shared, cloneable dependencies every worker needs. Bundled to keep
/// `run_invocation`'s signature manageable.
pub(crate) struct WorkerDeps {
    pub state: Arc<Mutex<SchedulerState>>,
    pub device_manager: Arc<dyn DeviceManager>,
    pub listeners: Arc<dyn InvocationListener>,
    pub trace_sink: Option<Arc<dyn TraceSink>>,
    pub reschedule_tx: mpsc::UnboundedSender<(CommandId, Box<dyn RunConfig>)>,
    pub last_result: Arc<Mutex<LastResult>>,
    pub wake: Arc<tokio::sync::Notify>,
    pub config: SchedulerConfig,
}

/// What a finished worker reports back to the scheduling loop.
pub(crate) struct WorkerOutcome {
    pub invocation_id: InvocationId,
    pub command_id: CommandId,
    pub elapsed: Duration,
}

/// Runs one invocation end to end: init, run (racing the invocation
/// timeout), and completion (always runs, even if `invoke` panics).
#[tracing::instrument(skip_all, fields(command_id = tracker.id(), invocation_id))]
pub(crate) async fn run_invocation(
    tracker: Arc<CommandTracker>,
    config: Box<dyn RunConfig>,
    invocation_id: InvocationId,
    devices: Vec<DeviceDescriptor>,
    engine: Arc<dyn InvocationEngine>,
    deps: Arc<WorkerDeps>,
) -> WorkerOutcome {
    let command_id = tracker.id();

    let mut context = InvocationContext {
        invocation_id,
        command_id,
        devices,
        attributes: if config.is_sandboxed() {
            HashMap::new()
        } else {
            tracker_attributes(&tracker)
        },
        tags: Vec::new(),
    };

    deps.listeners.invocation_initiated(&context);
    info!("invocation {invocation_id} initiated for command {command_id}");

    let rescheduler = crate::invocation::Rescheduler::new(command_id, deps.reschedule_tx.clone());
    let start = Instant::now();

    let invoke_result = race_with_timeout(&engine, &mut context, config.as_ref(), rescheduler, deps.listeners.clone(), config.invocation_timeout()).await;

    let elapsed = start.elapsed();
    complete(
        &tracker,
        &mut context,
        invoke_result,
        elapsed,
        &engine,
        &deps,
    )
    .await;

    WorkerOutcome {
        invocation_id,
        command_id,
        elapsed,
    }
}

async fn race_with_timeout(
    engine: &Arc<dyn InvocationEngine>,
    context: &mut InvocationContext,
    config: &dyn RunConfig,
    rescheduler: crate::invocation::Rescheduler,
    listeners: Arc<dyn InvocationListener>,
    timeout: Option<Duration>,
) -> Result<(), InvocationError> {
    let invoke_fut = std::panic::AssertUnwindSafe(engine.invoke(context, config, rescheduler, listeners)).catch_unwind();
    tokio::pin!(invoke_fut);

    let sleep_fut = tokio::time::sleep(timeout.unwrap_or(Duration::MAX));
    tokio::pin!(sleep_fut);
    let mut timed_out = false;

    loop {
        tokio::select! {
            res = &mut invoke_fut => {
                return match res {
                    Ok(inner) => inner,
                    Err(_) => Err(InvocationError::Other(anyhow::anyhow!("invocation engine panicked"))),
                };
            }
            _ = &mut sleep_fut, if !timed_out && timeout.is_some() => {
                timed_out = true;
                warn!("invocation timeout elapsed, force-stopping");
                engine.notify_invocation_force_stopped("invocation timeout", Some("timeout"));
            }
        }
    }
}

async fn complete(
    tracker: &Arc<CommandTracker>,
    context: &mut InvocationContext,
    invoke_result: Result<(), InvocationError>,
    elapsed: Duration,
    engine: &Arc<dyn InvocationEngine>,
    deps: &Arc<WorkerDeps>,
) {
    // Detach from the live executing map; the scheduler's dispatch
    // preflight and shutdown teardown only care about what's still live.
    {
        let mut state = deps.state.lock().expect("scheduler lock poisoned");
        state.executing.remove(&context.invocation_id);
    }

    // Stray-task check: this core never spawns helper tasks per
    // invocation, so any nonzero count here would indicate a leak in a
    // future extension of the worker, not expected behavior today.
    let stray = 0usize;
    if stray > 0 {
        warn!(
            "invocation {} for command {} (args {:?}) left {} stray task(s)",
            context.invocation_id, context.command_id, tracker.argv(), stray
        );
    }

    let release_map = build_release_map(context, &invoke_result, deps.device_manager.as_ref()).await;

    let complete_result = std::panic::AssertUnwindSafe(async {
        deps.listeners.invocation_complete(context, &release_map);
    })
    .catch_unwind()
    .await;
    if complete_result.is_err() {
        error!("invocation_complete listener panicked; swallowed");
    }

    if let Some(sink) = &deps.trace_sink {
        sink.emit_trace(context);
    }

    tracker.add_executed_time(elapsed);

    let (cause, throwable) = classify(&invoke_result);
    {
        let mut last = deps.last_result.lock().expect("last-result lock poisoned");
        last.cause = Some(cause);
        last.last_throwable = throwable;
    }

    if matches!(invoke_result, Err(InvocationError::FatalHostError(_))) {
        error!("fatal host error from invocation {}; hard shutdown requested", context.invocation_id);
        // The scheduling loop polls `last_result` each iteration and
        // escalates to `shutdown_hard` when it sees `FatalHost` — see
        // `scheduler.rs`'s iteration body.
    }

    deps.wake.notify_one();
    tracing::debug!(exit_info = ?engine.exit_info(), "invocation exit info");
}

fn classify(result: &Result<(), InvocationError>) -> (InvocationCause, Option<String>) {
    match result {
        Ok(()) => (InvocationCause::NoError, None),
        Err(InvocationError::DeviceUnresponsive(msg)) => {
            (InvocationCause::Unresponsive, Some(msg.clone()))
        }
        Err(InvocationError::DeviceNotAvailable(msg)) => {
            (InvocationCause::Unavailable, Some(msg.clone()))
        }
        Err(InvocationError::FatalHostError(msg)) => {
            (InvocationCause::FatalHost, Some(msg.clone()))
        }
        Err(InvocationError::InvocationCancelled(msg)) => {
            (InvocationCause::ThrowableOther, Some(msg.clone()))
        }
        Err(InvocationError::Other(err)) => (InvocationCause::ThrowableOther, Some(err.to_string())),
    }
}

/// Builds the per-device terminal state handed back to the Device Manager
///.
async fn build_release_map(
    context: &InvocationContext,
    invoke_result: &Result<(), InvocationError>,
    device_manager: &dyn DeviceManager,
) -> ReleaseMap {
    let mut map = ReleaseMap::new();
    let cancelled = matches!(invoke_result, Err(InvocationError::InvocationCancelled(_)));

    for device in &context.devices {
        let mut state = if device.is_stub {
            DeviceState::Available
        } else if device_manager.probe_responsive(device).await {
            DeviceState::Available
        } else {
            DeviceState::Unavailable
        };

        if !cancelled {
            match invoke_result {
                Err(InvocationError::DeviceUnresponsive(serial)) if serial == &device.serial => {
                    state = DeviceState::Unresponsive;
                }
                Err(InvocationError::DeviceNotAvailable(serial)) if serial == &device.serial => {
                    state = DeviceState::Unavailable;
                }
                _ => {}
            }
        }

        map.insert(device.serial.clone(), state);
        device_manager.free(device, state).await;
    }
    map
}

fn tracker_attributes(tracker: &CommandTracker) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    attrs.insert("command_id".into(), tracker.id().to_string());
    attrs
}

/// Degree-of-cancellation mechanics: a cooperative
/// notify-stop never touches the worker's task, while a force-stop asks
/// the engine to abort cooperatively first — aborting the task outright
/// would skip the completion phase entirely (no device release, no
/// executing-map removal), which would violate §7's "device release is
/// guaranteed" propagation policy. The task is only killed via
/// `AbortHandle` as a backstop, and only if it is still in the executing
/// map once its grace window elapses.
pub(crate) fn notify_stop(entry: &ExecutingEntry, reason: &str) {
    entry.engine.notify_invocation_stopped(reason);
}

/// Delivers a force-stop to a live invocation. Returns immediately; the
/// cooperative signal is delivered synchronously, and the backstop abort
/// (if still needed once the grace window elapses) happens on a detached
/// task so the caller (scheduling loop) is never blocked by a stuck
/// invocation.
pub(crate) fn force_stop(
    state: Arc<Mutex<SchedulerState>>,
    device_manager: Arc<dyn DeviceManager>,
    invocation_id: InvocationId,
    engine: &Arc<dyn InvocationEngine>,
    abort_handle: &tokio::task::AbortHandle,
    reason: &str,
    error_id: Option<&str>,
    grace: Duration,
) {
    engine.notify_invocation_force_stopped(reason, error_id);

    // An interruptible engine is expected to honor the cooperative signal
    // promptly on its own; give it one scheduler tick before considering
    // the backstop. A non-interruptible engine gets the full grace window
    // (§5's "allow-interrupt gate", default immediate == zero).
    let effective_grace = if engine.is_interruptible() {
        Duration::ZERO
    } else {
        grace
    };

    let abort_handle = abort_handle.clone();
    tokio::spawn(async move {
        if effective_grace.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(effective_grace).await;
        }
        // Claim the entry atomically: if `complete()` already removed it
        // (the invocation finished or errored cooperatively in time), there
        // is nothing left for the backstop to do. If it is still here, the
        // worker task never reached its own teardown, so the backstop must
        // do that teardown itself before hard-killing the task — otherwise
        // its devices would stay `Allocated` forever.
        let stale = {
            let mut state = state.lock().expect("scheduler lock poisoned");
            state.executing.remove(&invocation_id)
        };
        let Some(entry) = stale else {
            return;
        };
        abort_handle.abort();
        warn!("invocation {invocation_id} did not honor its force-stop ({reason}) within the grace window; aborting task and releasing its devices as Unavailable");
        for device in &entry.devices {
            device_manager.free(device, DeviceState::Unavailable).await;
        }
    });
}
