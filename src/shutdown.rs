//! The shutdown state machine:
//! `Running -> Quitting -> Killing -> Terminated`.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// The scheduler's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// Normal operation.
    Running = 0,
    /// Draining: no new work admitted, in-flight work runs to completion.
    Quitting = 1,
    /// Forced: every live invocation is being force-stopped.
    Killing = 2,
    /// The scheduling loop has exited and all workers have been joined.
    Terminated = 3,
}

impl ShutdownState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ShutdownState::Running,
            1 => ShutdownState::Quitting,
            2 => ShutdownState::Killing,
            _ => ShutdownState::Terminated,
        }
    }
}

/// Tracks the shutdown state plus the independent flags that interact with
/// it (`stopScheduling`, `shutdownOnEmpty`, `notifyStop`).
pub struct ShutdownController {
    state: AtomicU8,
    stop_scheduling: AtomicBool,
    shutdown_on_empty: AtomicBool,
    notify_stop_workers: AtomicBool,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ShutdownState::Running as u8),
            stop_scheduling: AtomicBool::new(false),
            shutdown_on_empty: AtomicBool::new(false),
            notify_stop_workers: AtomicBool::new(false),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True once no new `ExecutableCommand` may enter Ready except a local
    /// re-shard of an already-executing one.
    pub fn is_draining(&self) -> bool {
        self.stop_scheduling.load(Ordering::Acquire) || self.state() != ShutdownState::Running
    }

    /// Blocks new `add`/loop re-enqueue but lets in-flight work finish.
    /// Transition: Running -> Quitting.
    pub fn stop_scheduling(&self) {
        self.stop_scheduling.store(true, Ordering::Release);
        self.advance_to(ShutdownState::Quitting);
    }

    /// Initiates graceful drain. Transition: Running/Quitting -> Quitting.
    /// Returns whether `notifyStop` should be delivered to live workers.
    pub fn shutdown(&self, notify_stop: bool) -> bool {
        self.notify_stop_workers
            .store(notify_stop, Ordering::Release);
        self.advance_to(ShutdownState::Quitting);
        notify_stop
    }

    /// Sets the flag so the loop exits as soon as all three queues are
    /// empty, without otherwise changing behavior.
    pub fn shutdown_on_empty(&self) {
        self.shutdown_on_empty.store(true, Ordering::Release);
    }

    /// Forces immediate termination. Transition: any -> Killing.
    pub fn shutdown_hard(&self) {
        self.state.store(ShutdownState::Killing as u8, Ordering::Release);
    }

    /// Marks the loop as fully exited and workers joined.
    pub fn mark_terminated(&self) {
        self.state
            .store(ShutdownState::Terminated as u8, Ordering::Release);
    }

    /// Whether the scheduling loop should exit its iteration loop, given
    /// the current emptiness of the three collections.
    pub fn should_exit_loop(&self, all_empty: bool) -> bool {
        match self.state() {
            ShutdownState::Killing | ShutdownState::Terminated => true,
            ShutdownState::Quitting => all_empty,
            ShutdownState::Running => self.shutdown_on_empty.load(Ordering::Acquire) && all_empty,
        }
    }

    fn advance_to(&self, target: ShutdownState) {
        // Never move backwards (e.g. Killing must not regress to Quitting).
        let current = self.state();
        if (current as u8) < (target as u8) {
            self.state.store(target as u8, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_scheduling_advances_to_quitting() {
        let ctl = ShutdownController::new();
        ctl.stop_scheduling();
        assert_eq!(ctl.state(), ShutdownState::Quitting);
        assert!(ctl.is_draining());
    }

    #[test]
    fn shutdown_hard_wins_over_quitting() {
        let ctl = ShutdownController::new();
        ctl.shutdown(true);
        ctl.shutdown_hard();
        assert_eq!(ctl.state(), ShutdownState::Killing);
    }

    #[test]
    fn killing_never_regresses() {
        let ctl = ShutdownController::new();
        ctl.shutdown_hard();
        ctl.stop_scheduling();
        assert_eq!(ctl.state(), ShutdownState::Killing);
    }

    #[test]
    fn exit_loop_respects_shutdown_on_empty() {
        let ctl = ShutdownController::new();
        assert!(!ctl.should_exit_loop(true));
        ctl.shutdown_on_empty();
        assert!(ctl.should_exit_loop(true));
        assert!(!ctl.should_exit_loop(false));
    }
}
