//! Command identity: `CommandTracker`, `ExecutableCommand`, and the opaque
//! `RunConfig` boundary the out-of-scope Config Factory produces.
//!
//! The invariants these types exist to uphold: a tracker's identity is
//! stable across reschedules, while each executable instance is disposable.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identity of a user-submitted command, assigned once at `add()` time and
/// stable across every dispatch of that command (including loop iterations
/// and reschedules).
pub type CommandId = u64;

/// Identity of one concrete invocation (a dispatched `ExecutableCommand`
/// bound to a device set), assigned at dispatch time.
pub type InvocationId = u64;

/// What a command instance needs from the Device Manager to be dispatched.
///
/// Deliberately thin: the allocation *policy* lives entirely in the
/// out-of-scope Device Manager. This only carries what the scheduler must
/// hand over to ask for devices.
#[derive(Debug, Clone, Default)]
pub struct DeviceRequirements {
    /// Number of devices this command needs allocated.
    pub device_count: usize,
    /// If set, this command is pinned to a specific device serial
    /// (produced by `addForAllDevices`, §4.1).
    pub pinned_serial: Option<String>,
}

/// The opaque, resolved run-config a command instance carries.
///
/// Implementations are supplied by the out-of-scope Config Factory; the
/// scheduler core only ever reads the fields below.
pub trait RunConfig: std::fmt::Debug + Send + Sync {
    /// Devices this command needs.
    fn device_requirements(&self) -> DeviceRequirements;
    /// Whether this command should re-enqueue itself after each
    /// invocation, up to `max_loop_count`.
    fn loop_mode(&self) -> bool;
    /// Maximum number of dispatches for a loop-mode command. `None` means
    /// unbounded.
    fn max_loop_count(&self) -> Option<u32>;
    /// Delay before a loop-mode re-enqueue becomes Ready.
    fn loop_delay(&self) -> Duration;
    /// Per-invocation timeout. `None` means no timeout.
    fn invocation_timeout(&self) -> Option<Duration>;
    /// True if this is a dry-run / help invocation that should emit a
    /// synthetic no-op reporting cycle instead of being enqueued (§4.1).
    fn is_dry_run_or_help(&self) -> bool;
    /// True if the command runs sandboxed (suppresses attribute copy-down
    /// in the worker init phase, §4.4).
    fn is_sandboxed(&self) -> bool;
    /// Battery cutoff percentage (0-100) below which this command's
    /// devices should trigger a force-stop.
    fn battery_cutoff_percent(&self) -> u8;
    /// Returns a clone of this config with `loop_mode` forced off, used
    /// when building a rescheduled (not looped) `ExecutableCommand`.
    fn clone_with_loop_disabled(&self) -> Box<dyn RunConfig>;
    /// Returns a clone of this config, used when building a fresh
    /// loop-iteration `ExecutableCommand`.
    fn clone_box(&self) -> Box<dyn RunConfig>;
}

/// The long-lived identity of a command across repeated dispatches.
///
/// Mutated only under the scheduler lock (`scheduled_count`,
/// `total_executed_time` use atomics so reads from the ready-queue sort
/// comparator never need the lock).
#[derive(Debug)]
pub struct CommandTracker {
    id: CommandId,
    argv: Vec<String>,
    source_path: Option<PathBuf>,
    submitted_at: DateTime<Utc>,
    scheduled_count: AtomicU64,
    total_executed_time_nanos: AtomicU64,
}

impl CommandTracker {
    /// Creates a tracker for a freshly-submitted command.
    pub fn new(id: CommandId, argv: Vec<String>, source_path: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            id,
            argv,
            source_path,
            submitted_at: Utc::now(),
            scheduled_count: AtomicU64::new(0),
            total_executed_time_nanos: AtomicU64::new(0),
        })
    }

    /// This tracker's stable id.
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// The original, immutable argument vector.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// The cmdfile this command was sourced from, if any.
    pub fn source_path(&self) -> Option<&PathBuf> {
        self.source_path.as_ref()
    }

    /// Wall-clock time this tracker's command was first submitted, for
    /// human-facing logging (e.g. the CLI's JSON summary output) — distinct
    /// from the monotonic `Instant` each `ExecutableCommand` carries, which
    /// drives elapsed-time arithmetic rather than display.
    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    /// How many times this tracker has been dispatched to a worker.
    pub fn scheduled_count(&self) -> u64 {
        self.scheduled_count.load(Ordering::Acquire)
    }

    /// Cumulative wall-time this tracker's invocations have executed for.
    pub fn total_executed_time(&self) -> Duration {
        Duration::from_nanos(self.total_executed_time_nanos.load(Ordering::Acquire))
    }

    /// Records one more dispatch.
    pub(crate) fn record_dispatch(&self) {
        self.scheduled_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Adds to the cumulative executed wall-time (§4.4 completion phase).
    pub(crate) fn add_executed_time(&self, elapsed: Duration) {
        self.total_executed_time_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::AcqRel);
    }
}

/// One schedulable occurrence derived from a `CommandTracker`.
///
/// An `ExecutableCommand` is in exactly one of {Sleeping, Ready, Executing}
/// at any observable instant. Which bucket it is in is a property of which
/// collection holds it, not a field on this type.
#[derive(Debug)]
pub struct ExecutableCommand {
    /// Globally unique instance id, distinct from the (shared, stable)
    /// tracker id — needed to find exactly this sleeping instance again
    /// when its delayed-reinsertion timer fires, even if another instance
    /// from the same tracker exists concurrently.
    pub instance_id: u64,
    pub tracker: Arc<CommandTracker>,
    pub config: Box<dyn RunConfig>,
    /// True iff this instance was produced by a nested reschedule rather
    /// than the initial submit or a loop iteration (§4.1).
    pub rescheduled: bool,
    pub created_at: Instant,
    /// Set while this instance sits in the Sleeping collection awaiting a
    /// delayed-reinsertion timer.
    pub pending_sleep: Option<Duration>,
}

fn next_instance_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

impl ExecutableCommand {
    /// Builds the initial instance for a freshly-submitted command.
    pub fn initial(tracker: Arc<CommandTracker>, config: Box<dyn RunConfig>) -> Self {
        Self {
            instance_id: next_instance_id(),
            tracker,
            config,
            rescheduled: false,
            created_at: Instant::now(),
            pending_sleep: None,
        }
    }

    /// Builds the next loop-mode iteration sharing the same tracker.
    pub fn next_loop_iteration(&self, delay: Duration) -> Self {
        Self {
            instance_id: next_instance_id(),
            tracker: self.tracker.clone(),
            config: self.config.clone_box(),
            rescheduled: false,
            created_at: Instant::now(),
            pending_sleep: if delay.is_zero() { None } else { Some(delay) },
        }
    }

    /// Builds a rescheduled instance sharing `tracker`'s identity, loop
    /// forced off, no delay (§4.1's reschedule contract).
    pub fn rescheduled(tracker: Arc<CommandTracker>, config: Box<dyn RunConfig>) -> Self {
        Self {
            instance_id: next_instance_id(),
            tracker,
            config: config.clone_with_loop_disabled(),
            rescheduled: true,
            created_at: Instant::now(),
            pending_sleep: None,
        }
    }

    /// This instance's command id (delegates to its tracker).
    pub fn command_id(&self) -> CommandId {
        self.tracker.id()
    }
}
