//! # Sync Points
//!
//! Monotonic hardware counters owned by the kernel. This layer reads, waits on
//! and (for host-produced completions) increments them.

use crate::error::{HostError, HostResult};
use crate::nvhost::device::CtrlDevice;
use crate::nvhost::sysfs;
use crate::utils::{syncpt_reached, timeout_to_ms};
use log::debug;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// "Work is done when sync point `id` reaches `value`."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fence {
    pub id: u32,
    pub value: u32,
}

impl Fence {
    #[must_use]
    pub const fn new(id: u32, value: u32) -> Self {
        Self { id, value }
    }

    /// Whether a sync point reading of `current` satisfies this fence.
    #[must_use]
    pub const fn is_reached_by(&self, current: u32) -> bool {
        syncpt_reached(current, self.value)
    }
}

// ===============================================================================================
// Control Backend
// ===============================================================================================

/// Control-node operations used by the host layer. Errors carry the kernel errno.
pub trait HostControl: Send + Sync {
    fn version(&self) -> io::Result<u32>;
    fn syncpt_read(&self, id: u32) -> io::Result<u32>;
    fn syncpt_max(&self, id: u32) -> io::Result<u32>;
    fn syncpt_incr(&self, id: u32) -> io::Result<()>;
    fn syncpt_wait(&self, id: u32, thresh: u32, timeout_ms: u32) -> io::Result<()>;
    fn syncpt_waitex(&self, id: u32, thresh: u32, timeout_ms: u32) -> io::Result<u32>;
    fn module_mutex(&self, id: u32, lock: bool) -> io::Result<()>;
    fn module_regrdwr(
        &self,
        id: u32,
        offsets: &[u32],
        values: &mut [u32],
        block_size: u32,
        write: bool,
    ) -> io::Result<()>;
}

/// [`HostControl`] over `/dev/nvhost-ctrl`, with sync point maxima from sysfs.
#[derive(Debug, Clone)]
pub struct CtrlBackend {
    device: CtrlDevice,
    syncpt_sysfs_root: PathBuf,
}

impl CtrlBackend {
    #[must_use]
    pub const fn new(device: CtrlDevice, syncpt_sysfs_root: PathBuf) -> Self {
        Self {
            device,
            syncpt_sysfs_root,
        }
    }
}

impl HostControl for CtrlBackend {
    fn version(&self) -> io::Result<u32> {
        self.device.get_version()
    }

    fn syncpt_read(&self, id: u32) -> io::Result<u32> {
        self.device.syncpt_read(id)
    }

    fn syncpt_max(&self, id: u32) -> io::Result<u32> {
        sysfs::read_syncpt_max(&self.syncpt_sysfs_root, id)
    }

    fn syncpt_incr(&self, id: u32) -> io::Result<()> {
        self.device.syncpt_incr(id)
    }

    fn syncpt_wait(&self, id: u32, thresh: u32, timeout_ms: u32) -> io::Result<()> {
        self.device.syncpt_wait(id, thresh, timeout_ms)
    }

    fn syncpt_waitex(&self, id: u32, thresh: u32, timeout_ms: u32) -> io::Result<u32> {
        self.device.syncpt_waitex(id, thresh, timeout_ms)
    }

    fn module_mutex(&self, id: u32, lock: bool) -> io::Result<()> {
        self.device.module_mutex(id, lock)
    }

    fn module_regrdwr(
        &self,
        id: u32,
        offsets: &[u32],
        values: &mut [u32],
        block_size: u32,
        write: bool,
    ) -> io::Result<()> {
        self.device
            .module_regrdwr(id, offsets, values, block_size, write)
    }
}

// ===============================================================================================
// Registry
// ===============================================================================================

/// Process-wide access to the sync point table.
pub struct SyncPointRegistry {
    ctrl: Arc<dyn HostControl>,
    /// Set once the kernel rejects the extended wait; never cleared.
    legacy_wait: AtomicBool,
}

impl std::fmt::Debug for SyncPointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPointRegistry")
            .field("legacy_wait", &self.legacy_wait.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SyncPointRegistry {
    pub fn new(ctrl: Arc<dyn HostControl>) -> Self {
        Self {
            ctrl,
            legacy_wait: AtomicBool::new(false),
        }
    }

    /// The control backend, shared with module mutex and register access.
    #[must_use]
    pub fn control(&self) -> &dyn HostControl {
        self.ctrl.as_ref()
    }

    pub fn read(&self, id: u32) -> HostResult<u32> {
        self.ctrl
            .syncpt_read(id)
            .map_err(|e| HostError::ioctl("syncpt read", e))
    }

    /// Highest value `id` will reach once all queued work completes.
    pub fn read_max(&self, id: u32) -> HostResult<u32> {
        Ok(self.ctrl.syncpt_max(id)?)
    }

    /// Host-side increment, for completions produced by software.
    pub fn increment(&self, id: u32) -> HostResult<()> {
        self.ctrl
            .syncpt_incr(id)
            .map_err(|e| HostError::ioctl("syncpt incr", e))
    }

    /// Blocks until `id` reaches `threshold`. Returns the value observed on wakeup.
    ///
    /// `None` waits forever.
    ///
    /// # Errors
    /// `WaitTimeout` if the timeout elapses first.
    pub fn wait(&self, id: u32, threshold: u32, timeout: Option<Duration>) -> HostResult<u32> {
        let timeout_ms = timeout_to_ms(timeout);
        loop {
            let result = if self.legacy_wait.load(Ordering::Acquire) {
                self.ctrl.syncpt_wait(id, threshold, timeout_ms).map(|()| None)
            } else {
                self.ctrl.syncpt_waitex(id, threshold, timeout_ms).map(Some)
            };

            match result {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => return self.read(id),
                Err(e) => match e.raw_os_error() {
                    Some(libc::EINTR) => {}
                    Some(libc::EAGAIN) => return Err(HostError::WaitTimeout),
                    Some(libc::ENOTTY | libc::EFAULT)
                        if !self.legacy_wait.load(Ordering::Acquire) =>
                    {
                        debug!("syncpt: extended wait unsupported, using legacy wait");
                        self.legacy_wait.store(true, Ordering::Release);
                    }
                    _ => return Err(HostError::ioctl("syncpt wait", e)),
                },
            }
        }
    }

    pub fn wait_fence(&self, fence: Fence, timeout: Option<Duration>) -> HostResult<u32> {
        self.wait(fence.id, fence.value, timeout)
    }

    pub fn is_reached(&self, fence: Fence) -> HostResult<bool> {
        Ok(fence.is_reached_by(self.read(fence.id)?))
    }

    /// Increments the sync point only if that lands exactly on `fence.value`.
    ///
    /// # Errors
    /// `InvalidState` if the counter is not exactly one below the fence.
    pub fn trigger_if_eligible(&self, fence: Fence) -> HostResult<()> {
        let current = self.read(fence.id)?;
        if current.wrapping_add(1) != fence.value {
            return Err(HostError::InvalidState(
                "sync point is not one below the fence value",
            ));
        }
        self.increment(fence.id)
    }
}
