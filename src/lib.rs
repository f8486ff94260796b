//! # Command Scheduler
//!
//! Core scheduling engine for a test-harness runtime: matches incoming test
//! commands to available devices and drives each match to completion as an
//! invocation running in its own worker.
//!
//! ## Crate structure
//!
//! - **`command`**: Command identity — `CommandTracker`, `ExecutableCommand`,
//!   and the opaque `RunConfig` boundary.
//! - **`queues`**: The three disjoint lifecycle collections (Sleeping, Ready,
//!   Executing) and the scheduler-wide state they live under one lock.
//! - **`registry`**: The add/remove surface (`CommandRegistry`) that owns id
//!   assignment and gates additions against shutdown state.
//! - **`scheduler`**: The scheduling loop and `CommandScheduler`, this
//!   crate's public facade.
//! - **`worker`**: Invocation worker supervision — init/run/completion,
//!   cancellation, and battery policy.
//! - **`shutdown`**: The graceful-drain / hard-stop state machine.
//! - **`device_manager`**, **`config_factory`**, **`invocation`**: thin trait
//!   boundaries for the out-of-scope collaborators (device discovery and
//!   allocation policy, argument-vector parsing, and test-invocation
//!   internals, respectively).
//! - **`config`**: Scheduler-level tunables, loaded via `figment`.
//! - **`error`**: `SchedulerError` and the process-level exit-code mapping.
//! - **`tracing_init`**: Structured-logging bootstrap.
//! - **`fakes`**: In-memory implementations of the collaborator traits, used
//!   by the integration tests and by the `cmd_scheduler` binary's demo
//!   commands in place of real hardware.

pub mod command;
pub mod config;
pub mod config_factory;
pub mod device_manager;
pub mod error;
pub mod fakes;
pub mod invocation;
pub mod queues;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
pub mod tracing_init;
pub mod worker;

pub use command::{CommandId, CommandTracker, DeviceRequirements, ExecutableCommand, InvocationId, RunConfig};
pub use config::SchedulerConfig;
pub use error::{ExitCode, InvocationCause, SchedulerError, SchedulerResult};
pub use scheduler::{CommandScheduler, QueueLengths};
pub use shutdown::ShutdownState;
