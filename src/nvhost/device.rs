#![allow(clippy::cast_possible_truncation)]

use crate::nvhost::ioctl::{
    ClkRateArgs, CtrlGetVersionArgs, CtrlModuleMutexArgs, CtrlModuleRegRdWrArgs,
    CtrlSyncptIncrArgs, CtrlSyncptReadArgs, CtrlSyncptWaitArgs, CtrlSyncptWaitexArgs,
    GetParamArgs, NVHOST_IOCTL_CHANNEL_FLUSH, NVHOST_IOCTL_CHANNEL_GET_CLK_RATE,
    NVHOST_IOCTL_CHANNEL_GET_MODMUTEXES, NVHOST_IOCTL_CHANNEL_GET_SYNCPOINTS,
    NVHOST_IOCTL_CHANNEL_GET_TIMEDOUT, NVHOST_IOCTL_CHANNEL_GET_WAITBASES,
    NVHOST_IOCTL_CHANNEL_NULL_KICKOFF, NVHOST_IOCTL_CHANNEL_READ_3D_REG,
    NVHOST_IOCTL_CHANNEL_SET_CLK_RATE, NVHOST_IOCTL_CHANNEL_SET_NVMAP_FD,
    NVHOST_IOCTL_CHANNEL_SET_PRIORITY, NVHOST_IOCTL_CHANNEL_SET_TIMEOUT,
    NVHOST_IOCTL_CHANNEL_SUBMIT_EXT, NVHOST_IOCTL_CTRL_GET_VERSION,
    NVHOST_IOCTL_CTRL_MODULE_MUTEX, NVHOST_IOCTL_CTRL_MODULE_REGRDWR,
    NVHOST_IOCTL_CTRL_SYNCPT_INCR, NVHOST_IOCTL_CTRL_SYNCPT_READ, NVHOST_IOCTL_CTRL_SYNCPT_WAIT,
    NVHOST_IOCTL_CTRL_SYNCPT_WAITEX, NVMAP_IOC_ALLOC, NVMAP_IOC_CACHE, NVMAP_IOC_CREATE,
    NVMAP_IOC_FREE, NVMAP_IOC_FROM_ID, NVMAP_IOC_GET_ID, NVMAP_IOC_MMAP, NVMAP_IOC_PARAM,
    NVMAP_IOC_PIN_MULT, NVMAP_IOC_READ, NVMAP_IOC_UNPIN_MULT, NVMAP_IOC_WRITE,
    NvmapAllocHandleArgs, NvmapCacheOpArgs, NvmapCreateHandleArgs, NvmapHandleParamArgs,
    NvmapMapCallerArgs, NvmapPinHandleArgs, NvmapRwHandleArgs, Read3dRegArgs, SetNvmapFdArgs,
    SetPriorityArgs, SetTimeoutArgs, SubmitHdrExt,
};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::RawFd;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;

/// Generic unsafe helper to execute an IOCTL on an open device node.
///
/// # Safety
/// The caller must ensure that `arg` points to valid memory appropriate for the specific `cmd`.
unsafe fn ioctl<T>(file: &File, cmd: u32, arg: &mut T) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), cmd as _, arg as *mut T) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Same as [`ioctl`] for commands that take the argument by value (no payload).
fn ioctl_val(file: &File, cmd: u32, arg: libc::c_ulong) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), cmd as _, arg) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn open_rw(path: &Path) -> io::Result<Arc<File>> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    Ok(Arc::new(file))
}

// ===============================================================================================
// Control Device (/dev/nvhost-ctrl)
// ===============================================================================================

/// A handle to the host1x control node.
///
/// Sync points and module mutexes are global resources; every channel shares this one node.
#[derive(Clone, Debug)]
pub struct CtrlDevice {
    pub file: Arc<File>,
}

impl CtrlDevice {
    /// # Errors
    /// Returns an error if the control node cannot be opened.
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: open_rw(path)?,
        })
    }

    /// Control protocol version. Doubles as the highest submit version the kernel accepts.
    pub fn get_version(&self) -> io::Result<u32> {
        let mut args = CtrlGetVersionArgs::default();
        unsafe {
            ioctl(&self.file, NVHOST_IOCTL_CTRL_GET_VERSION, &mut args)?;
        }
        Ok(args.version)
    }

    pub fn syncpt_read(&self, id: u32) -> io::Result<u32> {
        let mut args = CtrlSyncptReadArgs { id, value: 0 };
        unsafe {
            ioctl(&self.file, NVHOST_IOCTL_CTRL_SYNCPT_READ, &mut args)?;
        }
        Ok(args.value)
    }

    pub fn syncpt_incr(&self, id: u32) -> io::Result<()> {
        let mut args = CtrlSyncptIncrArgs { id };
        unsafe { ioctl(&self.file, NVHOST_IOCTL_CTRL_SYNCPT_INCR, &mut args) }
    }

    /// Legacy wait. Does not report the value the sync point reached.
    pub fn syncpt_wait(&self, id: u32, thresh: u32, timeout_ms: u32) -> io::Result<()> {
        let mut args = CtrlSyncptWaitArgs {
            id,
            thresh,
            timeout: timeout_ms,
        };
        unsafe { ioctl(&self.file, NVHOST_IOCTL_CTRL_SYNCPT_WAIT, &mut args) }
    }

    /// Extended wait. Returns the sync point value observed on wakeup.
    pub fn syncpt_waitex(&self, id: u32, thresh: u32, timeout_ms: u32) -> io::Result<u32> {
        let mut args = CtrlSyncptWaitexArgs {
            id,
            thresh,
            timeout: timeout_ms,
            value: 0,
        };
        unsafe {
            ioctl(&self.file, NVHOST_IOCTL_CTRL_SYNCPT_WAITEX, &mut args)?;
        }
        Ok(args.value)
    }

    pub fn module_mutex(&self, id: u32, lock: bool) -> io::Result<()> {
        let mut args = CtrlModuleMutexArgs {
            id,
            lock: u32::from(lock),
        };
        unsafe { ioctl(&self.file, NVHOST_IOCTL_CTRL_MODULE_MUTEX, &mut args) }
    }

    /// Reads or writes `offsets.len()` register blocks of `block_size` bytes on module `id`.
    ///
    /// `values` must hold `offsets.len() * block_size / 4` words.
    pub fn module_regrdwr(
        &self,
        id: u32,
        offsets: &[u32],
        values: &mut [u32],
        block_size: u32,
        write: bool,
    ) -> io::Result<()> {
        let mut args = CtrlModuleRegRdWrArgs {
            id,
            num_offsets: offsets.len() as u32,
            block_size,
            write: u32::from(write),
            offsets: offsets.as_ptr() as u64,
            values: values.as_mut_ptr() as u64,
        };
        unsafe { ioctl(&self.file, NVHOST_IOCTL_CTRL_MODULE_REGRDWR, &mut args) }
    }
}

impl AsRawFd for CtrlDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

// ===============================================================================================
// Channel Device (/dev/nvhost-<module>)
// ===============================================================================================

/// A handle to one hardware channel node.
#[derive(Clone, Debug)]
pub struct ChannelDevice {
    pub file: Arc<File>,
}

impl ChannelDevice {
    /// # Errors
    /// Returns an error if the channel node cannot be opened.
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: open_rw(path)?,
        })
    }

    fn get_param(&self, cmd: u32) -> io::Result<u32> {
        let mut args = GetParamArgs::default();
        unsafe {
            ioctl(&self.file, cmd, &mut args)?;
        }
        Ok(args.value)
    }

    // ===========================================================================================
    // Submission
    // ===========================================================================================

    /// Registers the memory manager's fd so the channel can resolve handles in relocations.
    pub fn set_nvmap_fd(&self, fd: RawFd) -> io::Result<()> {
        let mut args = SetNvmapFdArgs { fd: fd as u32 };
        unsafe { ioctl(&self.file, NVHOST_IOCTL_CHANNEL_SET_NVMAP_FD, &mut args) }
    }

    /// Opens a submission by announcing its header. The payload follows via [`Self::write_stream`].
    pub fn submit_ext(&self, hdr: &mut SubmitHdrExt) -> io::Result<()> {
        unsafe { ioctl(&self.file, NVHOST_IOCTL_CHANNEL_SUBMIT_EXT, hdr) }
    }

    /// Writes submission payload bytes, retrying short and interrupted writes.
    pub fn write_stream(&self, bytes: &[u8]) -> io::Result<()> {
        (&*self.file).write_all(bytes)
    }

    /// Kicks off the pending submission. Returns the sync point value it will reach.
    pub fn flush(&self) -> io::Result<u32> {
        self.get_param(NVHOST_IOCTL_CHANNEL_FLUSH)
    }

    /// Like [`Self::flush`] but the kernel only bumps the sync point without running anything.
    pub fn null_kickoff(&self) -> io::Result<u32> {
        self.get_param(NVHOST_IOCTL_CHANNEL_NULL_KICKOFF)
    }

    // ===========================================================================================
    // Resource Queries
    // ===========================================================================================

    pub fn get_syncpoints(&self) -> io::Result<u32> {
        self.get_param(NVHOST_IOCTL_CHANNEL_GET_SYNCPOINTS)
    }

    pub fn get_waitbases(&self) -> io::Result<u32> {
        self.get_param(NVHOST_IOCTL_CHANNEL_GET_WAITBASES)
    }

    pub fn get_modmutexes(&self) -> io::Result<u32> {
        self.get_param(NVHOST_IOCTL_CHANNEL_GET_MODMUTEXES)
    }

    pub fn get_timedout(&self) -> io::Result<u32> {
        self.get_param(NVHOST_IOCTL_CHANNEL_GET_TIMEDOUT)
    }

    // ===========================================================================================
    // Channel Settings
    // ===========================================================================================

    pub fn set_timeout(&self, timeout_ms: u32) -> io::Result<()> {
        let mut args = SetTimeoutArgs {
            timeout: timeout_ms,
        };
        unsafe { ioctl(&self.file, NVHOST_IOCTL_CHANNEL_SET_TIMEOUT, &mut args) }
    }

    pub fn set_priority(&self, priority: u32) -> io::Result<()> {
        let mut args = SetPriorityArgs { priority };
        unsafe { ioctl(&self.file, NVHOST_IOCTL_CHANNEL_SET_PRIORITY, &mut args) }
    }

    /// Module clock rate in Hz.
    pub fn get_clk_rate(&self) -> io::Result<u64> {
        let mut args = ClkRateArgs::default();
        unsafe {
            ioctl(&self.file, NVHOST_IOCTL_CHANNEL_GET_CLK_RATE, &mut args)?;
        }
        Ok(args.rate)
    }

    pub fn set_clk_rate(&self, rate_hz: u64) -> io::Result<()> {
        let mut args = ClkRateArgs { rate: rate_hz };
        unsafe { ioctl(&self.file, NVHOST_IOCTL_CHANNEL_SET_CLK_RATE, &mut args) }
    }

    pub fn read_3d_reg(&self, offset: u32) -> io::Result<u32> {
        let mut args = Read3dRegArgs { offset, value: 0 };
        unsafe {
            ioctl(&self.file, NVHOST_IOCTL_CHANNEL_READ_3D_REG, &mut args)?;
        }
        Ok(args.value)
    }
}

impl AsRawFd for ChannelDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

// ===============================================================================================
// Memory Manager Device (/dev/nvmap)
// ===============================================================================================

/// A handle to the nvmap memory manager node.
#[derive(Clone, Debug)]
pub struct NvmapDevice {
    pub file: Arc<File>,
}

impl NvmapDevice {
    /// # Errors
    /// Returns an error if the nvmap node cannot be opened.
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: open_rw(path)?,
        })
    }

    // ===========================================================================================
    // Handle Lifecycle
    // ===========================================================================================

    /// Create an unallocated handle of `size` bytes.
    pub fn create(&self, size: u32) -> io::Result<u32> {
        let mut args = NvmapCreateHandleArgs {
            id_or_size: size,
            handle: 0,
        };
        unsafe {
            ioctl(&self.file, NVMAP_IOC_CREATE, &mut args)?;
        }
        Ok(args.handle)
    }

    /// Duplicate a handle exported by another process under its global `id`.
    pub fn from_id(&self, id: u32) -> io::Result<u32> {
        let mut args = NvmapCreateHandleArgs {
            id_or_size: id,
            handle: 0,
        };
        unsafe {
            ioctl(&self.file, NVMAP_IOC_FROM_ID, &mut args)?;
        }
        Ok(args.handle)
    }

    pub fn get_id(&self, handle: u32) -> io::Result<u32> {
        let mut args = NvmapCreateHandleArgs {
            id_or_size: 0,
            handle,
        };
        unsafe {
            ioctl(&self.file, NVMAP_IOC_GET_ID, &mut args)?;
        }
        Ok(args.id_or_size)
    }

    /// Back `args.handle` with memory from one of the heaps in `args.heap_mask`.
    pub fn alloc(&self, args: &mut NvmapAllocHandleArgs) -> io::Result<()> {
        unsafe { ioctl(&self.file, NVMAP_IOC_ALLOC, args) }
    }

    pub fn free(&self, handle: u32) -> io::Result<()> {
        ioctl_val(&self.file, NVMAP_IOC_FREE, libc::c_ulong::from(handle))
    }

    pub fn param(&self, handle: u32, param: u32) -> io::Result<u64> {
        let mut args = NvmapHandleParamArgs {
            handle,
            param,
            result: 0,
        };
        unsafe {
            ioctl(&self.file, NVMAP_IOC_PARAM, &mut args)?;
        }
        Ok(args.result)
    }

    // ===========================================================================================
    // Pinning
    // ===========================================================================================

    /// Pins `handles`, writing each device address into the matching slot of `addrs`.
    pub fn pin_mult(&self, handles: &[u32], addrs: &mut [u32]) -> io::Result<()> {
        debug_assert_eq!(handles.len(), addrs.len());
        let mut args = NvmapPinHandleArgs {
            count: handles.len() as u32,
            ..Default::default()
        };
        if handles.len() == 1 {
            args.handles = u64::from(handles[0]);
        } else {
            args.handles = handles.as_ptr() as u64;
            args.addr = addrs.as_mut_ptr() as u64;
        }
        unsafe {
            ioctl(&self.file, NVMAP_IOC_PIN_MULT, &mut args)?;
        }
        if let [addr] = addrs {
            *addr = args.addr as u32;
        }
        Ok(())
    }

    pub fn unpin_mult(&self, handles: &[u32]) -> io::Result<()> {
        let mut args = NvmapPinHandleArgs {
            count: handles.len() as u32,
            ..Default::default()
        };
        args.handles = match handles {
            [handle] => u64::from(*handle),
            _ => handles.as_ptr() as u64,
        };
        unsafe { ioctl(&self.file, NVMAP_IOC_UNPIN_MULT, &mut args) }
    }

    // ===========================================================================================
    // CPU Access
    // ===========================================================================================

    /// Binds an existing mapping of the nvmap node at `args.addr` to `args.handle`.
    pub fn mmap(&self, args: &mut NvmapMapCallerArgs) -> io::Result<()> {
        unsafe { ioctl(&self.file, NVMAP_IOC_MMAP, args) }
    }

    pub fn write(&self, handle: u32, offset: u32, src: &[u8]) -> io::Result<()> {
        let mut args = NvmapRwHandleArgs {
            addr: src.as_ptr() as u64,
            handle,
            offset,
            elem_size: src.len() as u32,
            hmem_stride: src.len() as u32,
            user_stride: src.len() as u32,
            count: 1,
        };
        unsafe { ioctl(&self.file, NVMAP_IOC_WRITE, &mut args) }
    }

    pub fn read(&self, handle: u32, offset: u32, dst: &mut [u8]) -> io::Result<()> {
        let mut args = NvmapRwHandleArgs {
            addr: dst.as_mut_ptr() as u64,
            handle,
            offset,
            elem_size: dst.len() as u32,
            hmem_stride: dst.len() as u32,
            user_stride: dst.len() as u32,
            count: 1,
        };
        unsafe { ioctl(&self.file, NVMAP_IOC_READ, &mut args) }
    }

    pub fn cache_op(&self, handle: u32, addr: *const u8, len: u32, op: i32) -> io::Result<()> {
        let mut args = NvmapCacheOpArgs {
            addr: addr as u64,
            handle,
            len,
            op,
            pad: 0,
        };
        unsafe { ioctl(&self.file, NVMAP_IOC_CACHE, &mut args) }
    }
}

impl AsRawFd for NvmapDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
