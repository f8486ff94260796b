//! The three disjoint lifecycle collections for `ExecutableCommand`s, and
//! the scheduler-wide state they live under one lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::command::{CommandId, CommandTracker, ExecutableCommand, InvocationId};
use crate::device_manager::DeviceDescriptor;
use crate::invocation::InvocationEngine;

/// What the scheduler keeps about one live invocation, once dispatched.
/// The `ExecutableCommand` itself and its `InvocationContext` are owned by
/// the worker task; this is just enough for the scheduler to do
/// double-allocation preflight checks and route cancellation.
pub struct ExecutingEntry {
    pub invocation_id: InvocationId,
    pub command_id: CommandId,
    pub devices: Vec<DeviceDescriptor>,
    pub engine: Arc<dyn InvocationEngine>,
    pub abort_handle: tokio::task::AbortHandle,
    /// Battery cutoff this invocation's config requested, copied at
    /// dispatch time so the per-iteration battery check
    /// doesn't need to reach back into the worker's owned config.
    pub battery_cutoff_percent: u8,
}

/// All scheduler state guarded by one lock. Re-sorting the ready queue on
/// each match attempt is O(n log n), which is acceptable at this scale.
#[derive(Default)]
pub struct SchedulerState {
    pub sleeping: Vec<ExecutableCommand>,
    pub ready: Vec<ExecutableCommand>,
    pub executing: HashMap<InvocationId, ExecutingEntry>,
    pub trackers: HashMap<CommandId, Arc<CommandTracker>>,
    /// Commands for which a "no matchable device" debug notice has
    /// already been emitted this epoch; cleared once the command matches.
    pub unscheduled_warned: HashSet<CommandId>,
    next_command_id: AtomicU64,
    next_invocation_id: AtomicU64,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next monotonic command id.
    pub fn next_command_id(&self) -> CommandId {
        self.next_command_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates the next monotonic invocation id.
    pub fn next_invocation_id(&self) -> InvocationId {
        self.next_invocation_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sorts `ready` by ascending cumulative executed time, then by
    /// command id as tiebreaker.
    pub fn sort_ready(&mut self) {
        self.ready.sort_by(|a, b| {
            a.tracker
                .total_executed_time()
                .cmp(&b.tracker.total_executed_time())
                .then_with(|| a.command_id().cmp(&b.command_id()))
        });
    }

    /// True iff every collection is empty (used by `shutdownOnEmpty` and
    /// the graceful-drain loop-exit condition).
    pub fn all_empty(&self) -> bool {
        self.sleeping.is_empty() && self.ready.is_empty() && self.executing.is_empty()
    }

    /// Removes every `ExecutableCommand` matching `predicate` from Ready
    /// and Sleeping. Executing commands are never touched here.
    pub fn remove_matching(&mut self, predicate: impl Fn(&CommandTracker) -> bool) -> usize {
        let before = self.ready.len() + self.sleeping.len();
        self.ready.retain(|c| !predicate(&c.tracker));
        self.sleeping.retain(|c| !predicate(&c.tracker));
        before - (self.ready.len() + self.sleeping.len())
    }

    /// Clears Ready and Sleeping entirely (`removeAll`, and the first step
    /// of graceful `shutdown`).
    pub fn clear_ready_and_sleeping(&mut self) {
        self.ready.clear();
        self.sleeping.clear();
    }

    /// Asserts the invariant that no device in `devices` is already bound
    /// to a live invocation. Returns the conflicting serial/invocation on
    /// violation.
    pub fn check_no_double_allocation(
        &self,
        devices: &[DeviceDescriptor],
    ) -> Result<(), (String, InvocationId)> {
        for candidate in devices {
            for entry in self.executing.values() {
                if entry.devices.iter().any(|d| d.serial == candidate.serial) {
                    return Err((candidate.serial.clone(), entry.invocation_id));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{DeviceRequirements, RunConfig};
    use std::time::Duration;

    #[derive(Debug, Clone)]
    struct FakeConfig;
    impl RunConfig for FakeConfig {
        fn device_requirements(&self) -> DeviceRequirements {
            DeviceRequirements::default()
        }
        fn loop_mode(&self) -> bool {
            false
        }
        fn max_loop_count(&self) -> Option<u32> {
            None
        }
        fn loop_delay(&self) -> Duration {
            Duration::ZERO
        }
        fn invocation_timeout(&self) -> Option<Duration> {
            None
        }
        fn is_dry_run_or_help(&self) -> bool {
            false
        }
        fn is_sandboxed(&self) -> bool {
            false
        }
        fn battery_cutoff_percent(&self) -> u8 {
            10
        }
        fn clone_with_loop_disabled(&self) -> Box<dyn RunConfig> {
            Box::new(FakeConfig)
        }
        fn clone_box(&self) -> Box<dyn RunConfig> {
            Box::new(FakeConfig)
        }
    }

    fn command(id: CommandId, exec_nanos: u64) -> ExecutableCommand {
        let tracker = CommandTracker::new(id, vec!["cfg".into()], None);
        tracker.add_executed_time(Duration::from_nanos(exec_nanos));
        ExecutableCommand::initial(tracker, Box::new(FakeConfig))
    }

    #[test]
    fn ready_sorts_by_exec_time_then_id() {
        let mut state = SchedulerState::new();
        state.ready.push(command(2, 100));
        state.ready.push(command(1, 100));
        state.ready.push(command(3, 10));
        state.sort_ready();
        let ids: Vec<_> = state.ready.iter().map(|c| c.command_id()).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn remove_matching_skips_executing() {
        let mut state = SchedulerState::new();
        state.ready.push(command(1, 0));
        state.sleeping.push(command(2, 0));
        let removed = state.remove_matching(|_| true);
        assert_eq!(removed, 2);
        assert!(state.ready.is_empty());
        assert!(state.sleeping.is_empty());
    }
}
