//! The Invocation Engine boundary, the invocation context it runs against,
//! and the listener surface workers notify.
//!
//! Test-invocation internals are explicitly out of scope. This module
//! defines the trait the worker calls into, the errors it may throw, and
//! the callback/listener vocabulary around invocation completion.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::command::{CommandId, InvocationId, RunConfig};
use crate::device_manager::{DeviceDescriptor, ReleaseMap};

/// The binding of one `ExecutableCommand` to a concrete device set, owned
/// exclusively by its invocation worker.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub invocation_id: InvocationId,
    pub command_id: CommandId,
    pub devices: Vec<DeviceDescriptor>,
    /// Command-level invocation attributes, copied down from the tracker
    /// unless the config is sandboxed (§4.4 init phase).
    pub attributes: HashMap<String, String>,
    pub tags: Vec<String>,
}

/// Errors the invocation engine may throw from `invoke`.
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    /// A bound device stopped responding mid-invocation.
    #[error("device unresponsive: {0}")]
    DeviceUnresponsive(String),
    /// A bound device became unavailable mid-invocation.
    #[error("device not available: {0}")]
    DeviceNotAvailable(String),
    /// An unrecoverable host-level error; triggers a full hard shutdown
    /// of the scheduler (§4.4).
    #[error("fatal host error: {0}")]
    FatalHostError(String),
    /// The invocation was cancelled by the scheduler (notify-stop or
    /// force-stop). Carries the "InvocationCancelled" marker referenced in
    /// §4.4's release-state rules: devices keep their prior state rather
    /// than being downgraded.
    #[error("invocation cancelled: {0}")]
    InvocationCancelled(String),
    /// Any other engine failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Snapshot of the last exit code / throwable recorded for an invocation,
/// exposed via `InvocationEngine::exit_info`.
#[derive(Debug, Clone, Default)]
pub struct ExitInfo {
    pub exit_code: Option<crate::error::ExitCode>,
    pub last_throwable: Option<String>,
}

/// The callback a running invocation uses to enqueue a derived
/// `ExecutableCommand` sharing its tracker (the "Rescheduler").
#[derive(Clone)]
pub struct Rescheduler {
    command_id: CommandId,
    sender: mpsc::UnboundedSender<(CommandId, Box<dyn RunConfig>)>,
}

impl Rescheduler {
    pub(crate) fn new(
        command_id: CommandId,
        sender: mpsc::UnboundedSender<(CommandId, Box<dyn RunConfig>)>,
    ) -> Self {
        Self { command_id, sender }
    }

    /// Requests that `config` be queued as a new `ExecutableCommand`
    /// sharing this invocation's tracker. Loop mode is forced off on the
    /// reschedule (§4.1). Best-effort: if the scheduler has already shut
    /// down the request is silently dropped.
    pub fn reschedule(&self, config: Box<dyn RunConfig>) {
        let _ = self.sender.send((self.command_id, config));
    }
}

/// Listener surface notified at invocation lifecycle points. All methods
/// default to no-ops so implementations only override what they need,
/// following the same pattern as a single interface with defaults
/// instead of a deep listener hierarchy.
pub trait InvocationListener: Send + Sync {
    /// Called once the worker has built the context, before `invoke`.
    fn invocation_initiated(&self, _context: &InvocationContext) {}

    /// Called with the computed release map, once per invocation, at the
    /// end of the completion phase. Exceptions from this callback are
    /// logged and swallowed by the worker (§4.4, §7) — implementations
    /// should not panic.
    fn invocation_complete(&self, _context: &InvocationContext, _release_map: &ReleaseMap) {}

    /// Catch-all for the invocation engine's own reporting events, which
    /// this crate treats as opaque strings (report serialization is out
    /// of scope, §1).
    fn report_event(&self, _context: &InvocationContext, _event: &str) {}
}

/// Composes multiple listeners behind one handle, fanning every call out
/// to each registered listener in order.
///
/// Carries the "disable reporters" signal from §4.5: once
/// `disable_reporters` has been tripped (by `shutdownHard`), every method
/// becomes a no-op instead of forwarding to the registered listeners, so no
/// listener callback runs once hard-shutdown teardown begins.
pub struct MultiListener {
    listeners: Vec<Arc<dyn InvocationListener>>,
    reporters_enabled: std::sync::atomic::AtomicBool,
}

impl Default for MultiListener {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiListener {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
            reporters_enabled: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn add(&mut self, listener: Arc<dyn InvocationListener>) {
        self.listeners.push(listener);
    }

    /// Trips the reporter-disable signal: every subsequent call to this
    /// listener set's trait methods becomes a no-op. Idempotent.
    pub fn disable_reporters(&self) {
        self.reporters_enabled
            .store(false, std::sync::atomic::Ordering::Release);
    }

    fn reporters_enabled(&self) -> bool {
        self.reporters_enabled.load(std::sync::atomic::Ordering::Acquire)
    }
}

impl InvocationListener for MultiListener {
    fn invocation_initiated(&self, context: &InvocationContext) {
        if !self.reporters_enabled() {
            return;
        }
        for listener in &self.listeners {
            listener.invocation_initiated(context);
        }
    }

    fn invocation_complete(&self, context: &InvocationContext, release_map: &ReleaseMap) {
        if !self.reporters_enabled() {
            return;
        }
        for listener in &self.listeners {
            listener.invocation_complete(context, release_map);
        }
    }

    fn report_event(&self, context: &InvocationContext, event: &str) {
        if !self.reporters_enabled() {
            return;
        }
        for listener in &self.listeners {
            listener.report_event(context, event);
        }
    }
}

/// The out-of-scope collaborator that runs the actual test logic once a
/// device is allocated.
#[async_trait]
pub trait InvocationEngine: Send + Sync {
    /// Runs one invocation to completion (or error). Awaited by the
    /// worker; cancellation is delivered out-of-band via
    /// `notify_invocation_stopped`/`notify_invocation_force_stopped`
    /// rather than by dropping the future, so the engine can perform its
    /// own teardown before returning.
    async fn invoke(
        &self,
        context: &mut InvocationContext,
        config: &dyn RunConfig,
        rescheduler: Rescheduler,
        listeners: Arc<dyn InvocationListener>,
    ) -> Result<(), InvocationError>;

    /// Cooperative stop signal; no thread interruption (§4.4 "Notify-stop").
    fn notify_invocation_stopped(&self, reason: &str);

    /// Asks the invocation to abort. `error_id` optionally tags the cause
    /// for exit-code classification (§4.4 "Force-stop").
    fn notify_invocation_force_stopped(&self, reason: &str, error_id: Option<&str>);

    /// Whether the engine currently allows its worker thread to be
    /// interrupted (the "allow-interrupt" gate, §5 / §9).
    fn is_interruptible(&self) -> bool;

    /// The last recorded exit code / throwable for this invocation.
    fn exit_info(&self) -> ExitInfo;
}

/// Produces a fresh `InvocationEngine` for each dispatched invocation. The
/// engine is stateful (it tracks its own exit info and interrupt gate), so
/// the scheduler asks for a new one per invocation rather than sharing one
/// across the process.
pub trait InvocationEngineFactory: Send + Sync {
    /// Creates a new engine instance for one invocation.
    fn create(&self) -> Arc<dyn InvocationEngine>;
}
