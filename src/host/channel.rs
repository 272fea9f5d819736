//! # Channels
//!
//! A channel is an ordered submission path to one hardware module. Submissions
//! are announced with a header ioctl, their descriptor payload is streamed to
//! the channel node, and a flush kicks them off and reports the sync point
//! value the work will reach.

#![allow(clippy::cast_possible_truncation)]

use crate::error::{HostError, HostResult};
use crate::host::config::HostConfig;
use crate::host::hwctx::Context;
use crate::host::memory::MemHandle;
use crate::host::module::{self, ModuleId, ModuleMutex};
use crate::host::syncpt::{Fence, HostControl};
use crate::nvhost::device::ChannelDevice;
use crate::nvhost::ioctl::{
    CmdBufArgs, NVHOST_CTRL_DEFAULT_VERSION, NVHOST_SUBMIT_VERSION_MAX_SUPPORTED,
    NVHOST_SUBMIT_VERSION_V0, NVHOST_SUBMIT_VERSION_V1, NVHOST_SUBMIT_VERSION_V2, RelocArgs,
    RelocShiftArgs, SubmitHdr, SubmitHdrExt, WaitChkArgs,
};
use crate::utils::{NO_TIMEOUT, nth_set_bit};
use log::{debug, error};
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

// ===============================================================================================
// Channel Backend
// ===============================================================================================

/// Channel-node operations. Errors carry the kernel errno.
pub trait ChannelIo: Send + Sync {
    fn set_nvmap_fd(&self, fd: RawFd) -> io::Result<()>;
    fn submit_ext(&self, hdr: &mut SubmitHdrExt) -> io::Result<()>;
    fn write_stream(&self, bytes: &[u8]) -> io::Result<()>;
    fn flush(&self) -> io::Result<u32>;
    fn null_kickoff(&self) -> io::Result<u32>;
    fn syncpoints(&self) -> io::Result<u32>;
    fn waitbases(&self) -> io::Result<u32>;
    fn modmutexes(&self) -> io::Result<u32>;
    fn timed_out(&self) -> io::Result<u32>;
    fn set_timeout(&self, timeout_ms: u32) -> io::Result<()>;
    fn set_priority(&self, priority: u32) -> io::Result<()>;
    fn clk_rate(&self) -> io::Result<u64>;
    fn set_clk_rate(&self, rate_hz: u64) -> io::Result<()>;
    fn read_3d_reg(&self, offset: u32) -> io::Result<u32>;
}

impl ChannelIo for ChannelDevice {
    fn set_nvmap_fd(&self, fd: RawFd) -> io::Result<()> {
        Self::set_nvmap_fd(self, fd)
    }

    fn submit_ext(&self, hdr: &mut SubmitHdrExt) -> io::Result<()> {
        Self::submit_ext(self, hdr)
    }

    fn write_stream(&self, bytes: &[u8]) -> io::Result<()> {
        Self::write_stream(self, bytes)
    }

    fn flush(&self) -> io::Result<u32> {
        Self::flush(self)
    }

    fn null_kickoff(&self) -> io::Result<u32> {
        Self::null_kickoff(self)
    }

    fn syncpoints(&self) -> io::Result<u32> {
        self.get_syncpoints()
    }

    fn waitbases(&self) -> io::Result<u32> {
        self.get_waitbases()
    }

    fn modmutexes(&self) -> io::Result<u32> {
        self.get_modmutexes()
    }

    fn timed_out(&self) -> io::Result<u32> {
        self.get_timedout()
    }

    fn set_timeout(&self, timeout_ms: u32) -> io::Result<()> {
        Self::set_timeout(self, timeout_ms)
    }

    fn set_priority(&self, priority: u32) -> io::Result<()> {
        Self::set_priority(self, priority)
    }

    fn clk_rate(&self) -> io::Result<u64> {
        self.get_clk_rate()
    }

    fn set_clk_rate(&self, rate_hz: u64) -> io::Result<()> {
        Self::set_clk_rate(self, rate_hz)
    }

    fn read_3d_reg(&self, offset: u32) -> io::Result<u32> {
        Self::read_3d_reg(self, offset)
    }
}

// ===============================================================================================
// Descriptors
// ===============================================================================================

/// `words` command words starting at byte `offset` of `mem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdBuf {
    pub mem: MemHandle,
    pub offset: u32,
    pub words: u32,
}

/// Patch the word at `cmdbuf_offset` of `cmdbuf` with the device address of `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reloc {
    pub cmdbuf: MemHandle,
    pub cmdbuf_offset: u32,
    pub target: MemHandle,
    pub target_offset: u32,
    /// Right shift applied to the patched address.
    pub shift: u32,
}

/// A sync point wait embedded in a command buffer, checked by the kernel before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitCheck {
    pub mem: MemHandle,
    pub offset: u32,
    pub syncpt_id: u32,
    pub threshold: u32,
}

/// Everything submitted atomically by one [`Channel::submit`].
#[derive(Debug, Clone, Default)]
pub struct CommandDescriptor {
    pub cmdbufs: Vec<CmdBuf>,
    pub relocs: Vec<Reloc>,
    pub waitchks: Vec<WaitCheck>,
    pub syncpt_id: u32,
    /// Sync point increments the command buffers are guaranteed to perform.
    pub increments: u32,
    /// Ask the kernel to skip execution and only advance the sync point.
    pub null_kickoff: bool,
}

impl CommandDescriptor {
    #[must_use]
    pub const fn new(syncpt_id: u32) -> Self {
        Self {
            cmdbufs: Vec::new(),
            relocs: Vec::new(),
            waitchks: Vec::new(),
            syncpt_id,
            increments: 0,
            null_kickoff: false,
        }
    }

    #[must_use]
    pub fn with_cmdbuf(mut self, mem: MemHandle, offset: u32, words: u32) -> Self {
        self.cmdbufs.push(CmdBuf { mem, offset, words });
        self
    }

    #[must_use]
    pub const fn with_increments(mut self, increments: u32) -> Self {
        self.increments = increments;
        self
    }

    fn waitchk_mask(&self) -> u32 {
        self.waitchks
            .iter()
            .fold(0, |mask, w| mask | 1u32.checked_shl(w.syncpt_id).unwrap_or(0))
    }
}

fn push_raw<T: Copy>(out: &mut Vec<u8>, value: &T) {
    // The ABI structs are `repr(C)` without padding.
    let bytes = unsafe {
        std::slice::from_raw_parts(std::ptr::from_ref(value).cast::<u8>(), size_of::<T>())
    };
    out.extend_from_slice(bytes);
}

// ===============================================================================================
// Channel
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncptKind {
    Unknown,
    /// The sync point id was handed out by [`Channel::get_module_sync_point`] and is fixed.
    Static,
    /// The kernel assigns the sync point per priority.
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Priority {
    Low = 50,
    Medium = 100,
    High = 150,
}

#[derive(Debug)]
struct ChannelState {
    submit_version: u32,
    syncpt_kind: SyncptKind,
}

pub struct Channel {
    modules: Vec<ModuleId>,
    io: Box<dyn ChannelIo>,
    ctrl: Arc<dyn HostControl>,
    state: Mutex<ChannelState>,
    current_context: Mutex<Weak<Context>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("modules", &self.modules)
            .field("state", &*self.lock_state())
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Opens the channel node serving `modules[0]` and registers the memory manager with it.
    ///
    /// # Errors
    /// `UnsupportedModule` when the module has no channel node, before anything is opened.
    pub fn open(
        modules: &[ModuleId],
        config: &HostConfig,
        ctrl: Arc<dyn HostControl>,
        nvmap_fd: RawFd,
    ) -> HostResult<Self> {
        let &module = modules
            .first()
            .ok_or_else(|| HostError::BadParameter("no module to open".into()))?;
        let node = module
            .device_node()
            .ok_or(HostError::UnsupportedModule(module))?;
        let path = config.channel_node(node);
        if !path.exists() {
            return Err(HostError::UnsupportedModule(module));
        }

        let device = ChannelDevice::open(&path)
            .map_err(|e| HostError::KernelDriverNotFound(format!("{}: {e}", path.display())))?;
        device.set_nvmap_fd(nvmap_fd).map_err(|e| {
            HostError::KernelDriverNotFound(format!("{}: nvmap fd rejected: {e}", path.display()))
        })?;
        debug!("opened channel {} for {module:?}", path.display());

        Self::with_io(modules, Box::new(device), ctrl)
    }

    /// Wraps an already-open channel backend.
    pub fn with_io(
        modules: &[ModuleId],
        io: Box<dyn ChannelIo>,
        ctrl: Arc<dyn HostControl>,
    ) -> HostResult<Self> {
        if modules.is_empty() {
            return Err(HostError::BadParameter("no module to open".into()));
        }
        let version = ctrl
            .version()
            .unwrap_or(NVHOST_CTRL_DEFAULT_VERSION)
            .min(NVHOST_SUBMIT_VERSION_MAX_SUPPORTED);
        Ok(Self {
            modules: modules.to_vec(),
            io,
            ctrl,
            state: Mutex::new(ChannelState {
                submit_version: version,
                syncpt_kind: SyncptKind::Unknown,
            }),
            current_context: Mutex::new(Weak::new()),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn module(&self) -> ModuleId {
        self.modules[0]
    }

    #[must_use]
    pub fn modules(&self) -> &[ModuleId] {
        &self.modules
    }

    #[must_use]
    pub fn submit_version(&self) -> u32 {
        self.lock_state().submit_version
    }

    #[must_use]
    pub fn syncpt_kind(&self) -> SyncptKind {
        self.lock_state().syncpt_kind
    }

    // ===========================================================================================
    // Submission
    // ===========================================================================================

    /// Submits `desc` and returns the sync point value it will reach.
    ///
    /// Either the whole descriptor is accepted or nothing is. An interrupted kickoff replays
    /// the submission from its header.
    pub fn submit(&self, desc: &CommandDescriptor) -> HostResult<u32> {
        let mut state = self.lock_state();
        loop {
            self.announce(desc, &mut state)?;
            let stream = encode_stream(desc, state.submit_version);
            self.io
                .write_stream(&stream)
                .map_err(|e| HostError::ioctl("submit stream", e))?;

            let kicked = if desc.null_kickoff {
                self.io.null_kickoff()
            } else {
                self.io.flush()
            };
            match kicked {
                Ok(value) => return Ok(value),
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => {
                    debug!("channel flush interrupted, replaying submission");
                }
                Err(e) => {
                    error!("channel flush failed on {:?}: {e}", self.module());
                    return Err(HostError::ioctl("channel flush", e));
                }
            }
        }
    }

    /// Submits and returns the completion fence.
    pub fn submit_fence(&self, desc: &CommandDescriptor) -> HostResult<Fence> {
        Ok(Fence::new(desc.syncpt_id, self.submit(desc)?))
    }

    /// Issues the header ioctl, downgrading the submit version as the kernel demands.
    fn announce(&self, desc: &CommandDescriptor, state: &mut ChannelState) -> HostResult<()> {
        loop {
            if state.submit_version == NVHOST_SUBMIT_VERSION_V0 {
                return Ok(());
            }
            let mut hdr = SubmitHdrExt {
                syncpt_id: desc.syncpt_id,
                syncpt_incrs: desc.increments,
                num_cmdbufs: desc.cmdbufs.len() as u32,
                num_relocs: desc.relocs.len() as u32,
                submit_version: state.submit_version,
                num_waitchks: desc.waitchks.len() as u32,
                waitchk_mask: desc.waitchk_mask(),
                pad: [0; 5],
            };
            match self.io.submit_ext(&mut hdr) {
                Ok(()) => return Ok(()),
                Err(e) => match e.raw_os_error() {
                    Some(libc::EINTR) => {}
                    Some(libc::ENOTTY | libc::EFAULT) => {
                        debug!("extended submit unsupported, using legacy submit");
                        state.submit_version = NVHOST_SUBMIT_VERSION_V0;
                    }
                    Some(libc::EINVAL) => {
                        state.submit_version -= 1;
                        debug!("submit version rejected, retrying with {}", state.submit_version);
                    }
                    _ => return Err(HostError::ioctl("channel submit", e)),
                },
            }
        }
    }

    // ===========================================================================================
    // Module Resources
    // ===========================================================================================

    fn module_bit(module: ModuleId, index: u32, mask: u32) -> HostResult<u32> {
        let n = match module {
            ModuleId::Display(_) => index * 2 + module.instance(),
            _ => index,
        };
        nth_set_bit(mask, n).ok_or_else(|| {
            HostError::BadParameter(format!("{module:?} has no resource at index {index}"))
        })
    }

    /// Sync point `index` assigned to `module`. Fixes the channel to static sync points.
    ///
    /// # Errors
    /// `InvalidState` once [`Self::set_priority`] has made the sync point dynamic.
    pub fn get_module_sync_point(&self, module: ModuleId, index: u32) -> HostResult<u32> {
        let mut state = self.lock_state();
        if state.syncpt_kind == SyncptKind::Dynamic {
            return Err(HostError::InvalidState(
                "sync point is assigned dynamically on this channel",
            ));
        }
        let mask = self
            .io
            .syncpoints()
            .map_err(|e| HostError::ioctl("get syncpoints", e))?;
        let id = Self::module_bit(module, index, mask)?;
        state.syncpt_kind = SyncptKind::Static;
        Ok(id)
    }

    pub fn get_module_wait_base(&self, module: ModuleId, index: u32) -> HostResult<u32> {
        let mask = self
            .io
            .waitbases()
            .map_err(|e| HostError::ioctl("get waitbases", e))?;
        Self::module_bit(module, index, mask)
    }

    /// Changes the channel priority and returns the `(sync point, wait base)` now assigned.
    pub fn set_priority(
        &self,
        priority: Priority,
        syncpt_index: u32,
        waitbase_index: u32,
    ) -> HostResult<(u32, u32)> {
        let module = self.module();
        let mut state = self.lock_state();
        if state.syncpt_kind == SyncptKind::Static {
            return Err(HostError::InvalidState(
                "a static sync point was already handed out",
            ));
        }
        self.io
            .set_priority(priority as u32)
            .map_err(|e| HostError::ioctl("set priority", e))?;

        let mask = self
            .io
            .syncpoints()
            .map_err(|e| HostError::ioctl("get syncpoints", e))?;
        let syncpt = Self::module_bit(module, syncpt_index, mask)?;
        state.syncpt_kind = SyncptKind::Dynamic;
        drop(state);

        let base = self.get_module_wait_base(module, waitbase_index)?;
        Ok((syncpt, base))
    }

    pub fn module_mutex_lock(&self, index: usize) -> HostResult<()> {
        let mutex = ModuleMutex::from_index(index)
            .ok_or_else(|| HostError::BadParameter(format!("no module mutex {index}")))?;
        module::lock_module_mutex(self.ctrl.as_ref(), mutex)
    }

    pub fn module_mutex_unlock(&self, index: usize) -> HostResult<()> {
        let mutex = ModuleMutex::from_index(index)
            .ok_or_else(|| HostError::BadParameter(format!("no module mutex {index}")))?;
        module::unlock_module_mutex(self.ctrl.as_ref(), mutex)
    }

    pub fn read_registers(&self, module: ModuleId, offsets: &[u32]) -> HostResult<Vec<u32>> {
        module::read_registers(self.ctrl.as_ref(), module, offsets)
    }

    pub fn write_registers(
        &self,
        module: ModuleId,
        offsets: &[u32],
        values: &[u32],
    ) -> HostResult<()> {
        module::write_registers(self.ctrl.as_ref(), module, offsets, values)
    }

    // ===========================================================================================
    // Channel Settings
    // ===========================================================================================

    /// Per-submission hardware timeout. `None` disables it.
    pub fn set_submit_timeout(&self, timeout_ms: Option<u32>) -> HostResult<()> {
        self.io
            .set_timeout(timeout_ms.unwrap_or(NO_TIMEOUT))
            .map_err(|e| HostError::ioctl("set timeout", e))
    }

    pub fn timed_out(&self) -> HostResult<bool> {
        self.io
            .timed_out()
            .map(|v| v != 0)
            .map_err(|e| HostError::ioctl("get timedout", e))
    }

    pub fn clock_rate_khz(&self) -> HostResult<u32> {
        let hz = self
            .io
            .clk_rate()
            .map_err(|e| HostError::ioctl("get clock rate", e))?;
        Ok((hz / 1000) as u32)
    }

    pub fn set_clock_rate_khz(&self, khz: u32) -> HostResult<()> {
        self.io
            .set_clk_rate(u64::from(khz) * 1000)
            .map_err(|e| HostError::ioctl("set clock rate", e))
    }

    pub fn read_3d_register(&self, offset: u32) -> HostResult<u32> {
        self.io
            .read_3d_reg(offset)
            .map_err(|e| HostError::ioctl("read 3d register", e))
    }

    // ===========================================================================================
    // Context Tracking
    // ===========================================================================================

    /// The context whose state is currently live in the engine, if it still exists.
    pub(crate) fn current_context(&self) -> Option<Arc<Context>> {
        self.current_context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
    }

    pub(crate) fn set_current_context(&self, ctx: &Arc<Context>) {
        *self
            .current_context
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(ctx);
    }
}

/// Serializes the descriptor payload for `version`.
fn encode_stream(desc: &CommandDescriptor, version: u32) -> Vec<u8> {
    let mut out = Vec::new();
    if version == NVHOST_SUBMIT_VERSION_V0 {
        let hdr = SubmitHdr {
            syncpt_id: desc.syncpt_id,
            syncpt_incrs: desc.increments,
            num_cmdbufs: desc.cmdbufs.len() as u32,
            num_relocs: desc.relocs.len() as u32,
        };
        push_raw(&mut out, &hdr);
    }
    for c in &desc.cmdbufs {
        let args = CmdBufArgs {
            mem: c.mem.raw(),
            offset: c.offset,
            words: c.words,
        };
        push_raw(&mut out, &args);
    }
    for r in &desc.relocs {
        let args = RelocArgs {
            cmdbuf_mem: r.cmdbuf.raw(),
            cmdbuf_offset: r.cmdbuf_offset,
            target: r.target.raw(),
            target_offset: r.target_offset,
        };
        push_raw(&mut out, &args);
    }
    if version >= NVHOST_SUBMIT_VERSION_V1 {
        for w in &desc.waitchks {
            let args = WaitChkArgs {
                mem: w.mem.raw(),
                offset: w.offset,
                syncpt_id: w.syncpt_id,
                thresh: w.threshold,
            };
            push_raw(&mut out, &args);
        }
    }
    if version >= NVHOST_SUBMIT_VERSION_V2 {
        for r in &desc.relocs {
            push_raw(&mut out, &RelocShiftArgs { shift: r.shift });
        }
    }
    out
}
