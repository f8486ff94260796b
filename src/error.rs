//! Error types for the command scheduler core.
//!
//! Mirrors the split used throughout the rest of the crate: typed, matchable
//! errors for conditions callers are expected to branch on (`SchedulerError`),
//! and `anyhow::Error` at the boundary with the injected collaborators (the
//! invocation engine in particular can throw effectively anything).

use serde::Serialize;
use thiserror::Error;

/// Convenience alias for results returned by scheduler operations.
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// Errors the scheduler core itself raises or classifies.
///
/// See `SPEC_FULL.md` §7 / §11 for the policy governing which of these are
/// fatal to the scheduling loop (none of them are — every variant here is
/// handled by the caller or logged and absorbed).
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The argument vector could not be turned into a run-config.
    #[error("configuration error: {0}")]
    Config(String),

    /// The scheduler is draining or stopped and refuses new work.
    #[error("scheduler is shutting down")]
    ShuttingDown,

    /// A dispatch attempt found a candidate device already bound to a live
    /// invocation. The command is force-freed and the attempt fails.
    #[error("device {device} already allocated to invocation {invocation_id}")]
    DeviceDoubleAllocation {
        /// Serial of the device that was double-claimed.
        device: String,
        /// Invocation id holding the conflicting allocation.
        invocation_id: u64,
    },

    /// Wraps a `DeviceDoubleAllocation` (or similar dispatch-time assertion
    /// failure) as surfaced back to a caller of the scheduling loop.
    #[error("scheduling error: {0}")]
    Scheduling(String),

    /// No command or executing invocation matched the requested id.
    #[error("no such command or invocation: {0}")]
    NotFound(u64),

    /// Catch-all for errors raised by the injected invocation engine,
    /// device manager, or config factory. These are opaque by design —
    /// the core only needs to classify and propagate them.
    #[error(transparent)]
    Invocation(#[from] anyhow::Error),
}

impl SchedulerError {
    /// Classifies this error into the process-level exit codes, used when
    /// recording `last_exit_code` on the scheduler.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            SchedulerError::Config(_) => ExitCode::ConfigException,
            SchedulerError::ShuttingDown => ExitCode::NoError,
            SchedulerError::DeviceDoubleAllocation { .. } => ExitCode::NoDeviceAllocated,
            SchedulerError::Scheduling(_) => ExitCode::NoDeviceAllocated,
            SchedulerError::NotFound(_) => ExitCode::NoError,
            SchedulerError::Invocation(_) => ExitCode::ThrowableException,
        }
    }
}

/// The five-way classification of an invocation's outcome recorded on the
/// scheduler at completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InvocationCause {
    /// A bound device stopped responding.
    Unresponsive,
    /// A bound device became unavailable.
    Unavailable,
    /// The invocation threw `FatalHostError`.
    FatalHost,
    /// Any other throwable.
    ThrowableOther,
    /// The invocation completed without error.
    NoError,
}

/// Process-level exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// No error.
    NoError = 0,
    /// Argument vector failed to parse into a run-config.
    ConfigException = 1,
    /// No build available for the requested target (collaborator concern;
    /// retained here only so the full exit-code space is representable).
    NoBuild = 2,
    /// An allocated device stopped responding mid-invocation.
    DeviceUnresponsive = 3,
    /// A device became unavailable mid-invocation.
    DeviceUnavailable = 4,
    /// The invocation threw `FatalHostError`.
    FatalHostError = 5,
    /// The invocation threw some other `Throwable`.
    ThrowableException = 6,
    /// Dispatch could not allocate any device for the command.
    NoDeviceAllocated = 7,
    /// Host toolchain version mismatch (collaborator concern, retained for
    /// exit-code completeness).
    WrongJavaVersion = 8,
}
