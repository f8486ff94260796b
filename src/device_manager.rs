//! The Device Manager boundary.
//!
//! Device discovery, allocation policy, and health monitoring are explicitly
//! out of scope. This module only defines the trait the core
//! consumes and the small vocabulary (`DeviceState`, `DeviceDescriptor`)
//! both sides need to agree on.

use async_trait::async_trait;

/// Observable state of a device, as reported by the Device Manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Free to allocate.
    Available,
    /// Bound to a live invocation.
    Allocated,
    /// Present but not currently usable (e.g. failed a responsiveness
    /// probe).
    Unavailable,
    /// Known but not responding at all.
    Unresponsive,
}

/// A device as known to the scheduler: just enough identity to allocate,
/// free, and release with a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Stable serial/identifier for this device.
    pub serial: String,
    /// True for placeholder/stub devices used in dry-run or testing
    /// configurations; these never transition to Unavailable on release.
    pub is_stub: bool,
}

/// The per-device terminal state computed at invocation completion and
/// handed back to the Device Manager ("release map").
pub type ReleaseMap = std::collections::HashMap<String, DeviceState>;

/// The out-of-scope collaborator that owns device discovery, allocation,
/// and health. The scheduler core only ever calls through this trait.
#[async_trait]
pub trait DeviceManager: Send + Sync {
    /// Attempts to allocate one device matching `requirements`. Returns
    /// `None` if no device is currently available. `is_fake` requests a
    /// stub device (used for dry-run commands).
    async fn allocate(
        &self,
        requirements: &crate::command::DeviceRequirements,
        is_fake: bool,
    ) -> Option<DeviceDescriptor>;

    /// Releases a device back to the pool with its computed terminal
    /// state.
    async fn free(&self, device: &DeviceDescriptor, release_state: DeviceState);

    /// Probes whether `device`'s shell/control channel is still
    /// responsive. Used by the invocation worker's completion phase to
    /// decide between `Available` and `Unavailable` on release. Stub
    /// devices are never probed by callers.
    async fn probe_responsive(&self, device: &DeviceDescriptor) -> bool;

    /// Current battery level (0-100) for `device`, if it reports one. Used
    /// by the scheduling loop's per-iteration battery policy. Devices with
    /// no battery concept should return `None`.
    async fn battery_level_percent(&self, device: &DeviceDescriptor) -> Option<u8>;

    /// Snapshot of every currently-known device and its state.
    async fn list_all_devices(&self) -> Vec<(DeviceDescriptor, DeviceState)>;

    /// Registers a callback invoked (on a foreign thread/task) whenever a
    /// device's state changes. Callbacks must only signal the scheduler's
    /// wake event — never call back into scheduler containers directly.
    fn add_device_monitor(&self, callback: Box<dyn Fn() + Send + Sync>);

    /// Graceful termination of the device layer.
    async fn terminate(&self);

    /// Forced termination, e.g. during `shutdownHard`.
    async fn terminate_hard(&self, reason: &str);

    /// Blocks (up to `timeout`) until at least one device has ever been
    /// added to the pool. Returns whether one was seen in time.
    async fn wait_for_first_device_added(&self, timeout: std::time::Duration) -> bool;
}
