use crate::utils::{io, ior, iow, iowr};
use std::mem::size_of;

// ===============================================================================================
// nvhost: Constants and Versioning
// ===============================================================================================

pub const NVHOST_IOCTL_MAGIC: u32 = 0x48; // 'H'

pub const NVHOST_SUBMIT_VERSION_V0: u32 = 0x0;
pub const NVHOST_SUBMIT_VERSION_V1: u32 = 0x1;
pub const NVHOST_SUBMIT_VERSION_V2: u32 = 0x2;
pub const NVHOST_SUBMIT_VERSION_MAX_SUPPORTED: u32 = NVHOST_SUBMIT_VERSION_V2;

/// Control protocol version assumed when the kernel does not report one.
pub const NVHOST_CTRL_DEFAULT_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GetParamArgs {
    pub value: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SetNvmapFdArgs {
    pub fd: u32,
}

// ===============================================================================================
// nvhost: Channel Submission
// ===============================================================================================

/// Legacy (version 0) header, written on the channel stream instead of the ioctl.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SubmitHdr {
    pub syncpt_id: u32,
    pub syncpt_incrs: u32,
    pub num_cmdbufs: u32,
    pub num_relocs: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SubmitHdrExt {
    pub syncpt_id: u32,
    pub syncpt_incrs: u32,
    pub num_cmdbufs: u32,
    pub num_relocs: u32,
    pub submit_version: u32,
    pub num_waitchks: u32,
    pub waitchk_mask: u32,
    pub pad: [u32; 5],
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CmdBufArgs {
    pub mem: u32,
    pub offset: u32,
    pub words: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RelocArgs {
    pub cmdbuf_mem: u32,
    pub cmdbuf_offset: u32,
    pub target: u32,
    pub target_offset: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RelocShiftArgs {
    pub shift: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct WaitChkArgs {
    pub mem: u32,
    pub offset: u32,
    pub syncpt_id: u32,
    pub thresh: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct Read3dRegArgs {
    pub offset: u32,
    pub value: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ClkRateArgs {
    pub rate: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SetTimeoutArgs {
    pub timeout: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SetPriorityArgs {
    pub priority: u32,
}

pub const NVHOST_IOCTL_CHANNEL_FLUSH: u32 = ior::<GetParamArgs>(NVHOST_IOCTL_MAGIC, 1);
pub const NVHOST_IOCTL_CHANNEL_GET_SYNCPOINTS: u32 = ior::<GetParamArgs>(NVHOST_IOCTL_MAGIC, 2);
pub const NVHOST_IOCTL_CHANNEL_GET_WAITBASES: u32 = ior::<GetParamArgs>(NVHOST_IOCTL_MAGIC, 3);
pub const NVHOST_IOCTL_CHANNEL_GET_MODMUTEXES: u32 = ior::<GetParamArgs>(NVHOST_IOCTL_MAGIC, 4);
pub const NVHOST_IOCTL_CHANNEL_SET_NVMAP_FD: u32 = iow::<SetNvmapFdArgs>(NVHOST_IOCTL_MAGIC, 5);
pub const NVHOST_IOCTL_CHANNEL_NULL_KICKOFF: u32 = ior::<GetParamArgs>(NVHOST_IOCTL_MAGIC, 6);
pub const NVHOST_IOCTL_CHANNEL_SUBMIT_EXT: u32 = iow::<SubmitHdrExt>(NVHOST_IOCTL_MAGIC, 7);
pub const NVHOST_IOCTL_CHANNEL_READ_3D_REG: u32 = iowr::<Read3dRegArgs>(NVHOST_IOCTL_MAGIC, 8);
pub const NVHOST_IOCTL_CHANNEL_GET_CLK_RATE: u32 = ior::<ClkRateArgs>(NVHOST_IOCTL_MAGIC, 9);
pub const NVHOST_IOCTL_CHANNEL_SET_CLK_RATE: u32 = iow::<ClkRateArgs>(NVHOST_IOCTL_MAGIC, 10);
pub const NVHOST_IOCTL_CHANNEL_SET_TIMEOUT: u32 = iow::<SetTimeoutArgs>(NVHOST_IOCTL_MAGIC, 11);
pub const NVHOST_IOCTL_CHANNEL_GET_TIMEDOUT: u32 = ior::<GetParamArgs>(NVHOST_IOCTL_MAGIC, 12);
pub const NVHOST_IOCTL_CHANNEL_SET_PRIORITY: u32 = iow::<SetPriorityArgs>(NVHOST_IOCTL_MAGIC, 13);

// ===============================================================================================
// nvhost: Control Device (sync points, module mutexes)
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct CtrlSyncptReadArgs {
    pub id: u32,
    pub value: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct CtrlSyncptIncrArgs {
    pub id: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct CtrlSyncptWaitArgs {
    pub id: u32,
    pub thresh: u32,
    pub timeout: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct CtrlSyncptWaitexArgs {
    pub id: u32,
    pub thresh: u32,
    pub timeout: u32,
    pub value: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct CtrlModuleMutexArgs {
    pub id: u32,
    pub lock: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct CtrlModuleRegRdWrArgs {
    pub id: u32,
    pub num_offsets: u32,
    pub block_size: u32,
    pub write: u32,
    pub offsets: u64,
    pub values: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct CtrlGetVersionArgs {
    pub version: u32,
}

pub const NVHOST_IOCTL_CTRL_SYNCPT_READ: u32 = iowr::<CtrlSyncptReadArgs>(NVHOST_IOCTL_MAGIC, 1);
pub const NVHOST_IOCTL_CTRL_SYNCPT_INCR: u32 = iow::<CtrlSyncptIncrArgs>(NVHOST_IOCTL_MAGIC, 2);
pub const NVHOST_IOCTL_CTRL_SYNCPT_WAIT: u32 = iow::<CtrlSyncptWaitArgs>(NVHOST_IOCTL_MAGIC, 3);
pub const NVHOST_IOCTL_CTRL_MODULE_MUTEX: u32 = iowr::<CtrlModuleMutexArgs>(NVHOST_IOCTL_MAGIC, 4);
pub const NVHOST_IOCTL_CTRL_MODULE_REGRDWR: u32 =
    iowr::<CtrlModuleRegRdWrArgs>(NVHOST_IOCTL_MAGIC, 5);
pub const NVHOST_IOCTL_CTRL_SYNCPT_WAITEX: u32 =
    iowr::<CtrlSyncptWaitexArgs>(NVHOST_IOCTL_MAGIC, 6);
pub const NVHOST_IOCTL_CTRL_GET_VERSION: u32 = ior::<CtrlGetVersionArgs>(NVHOST_IOCTL_MAGIC, 7);

// ===============================================================================================
// nvmap: Memory Handles
// ===============================================================================================

pub const NVMAP_IOCTL_MAGIC: u32 = 0x4E; // 'N'

pub const NVMAP_HEAP_SYSMEM: u32 = 1 << 31;
pub const NVMAP_HEAP_IOVMM: u32 = 1 << 30;
pub const NVMAP_HEAP_CARVEOUT_IRAM: u32 = 1 << 29;
pub const NVMAP_HEAP_CARVEOUT_VPR: u32 = 1 << 28;
pub const NVMAP_HEAP_CARVEOUT_GENERIC: u32 = 1 << 0;

pub const NVMAP_HANDLE_UNCACHEABLE: u32 = 0x0;
pub const NVMAP_HANDLE_WRITE_COMBINE: u32 = 0x1;
pub const NVMAP_HANDLE_INNER_CACHEABLE: u32 = 0x2;
pub const NVMAP_HANDLE_CACHEABLE: u32 = 0x3;

pub const NVMAP_HANDLE_PARAM_SIZE: u32 = 1;
pub const NVMAP_HANDLE_PARAM_ALIGNMENT: u32 = 2;
pub const NVMAP_HANDLE_PARAM_BASE: u32 = 3;
pub const NVMAP_HANDLE_PARAM_HEAP: u32 = 4;

pub const NVMAP_CACHE_OP_WB: i32 = 0;
pub const NVMAP_CACHE_OP_INV: i32 = 1;
pub const NVMAP_CACHE_OP_WB_INV: i32 = 2;

/// `id_or_size` carries the byte size for `CREATE` and the global id for `FROM_ID`/`GET_ID`.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct NvmapCreateHandleArgs {
    pub id_or_size: u32,
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct NvmapAllocHandleArgs {
    pub handle: u32,
    pub heap_mask: u32,
    pub flags: u32,
    pub align: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct NvmapMapCallerArgs {
    pub handle: u32,
    pub offset: u32,
    pub length: u32,
    pub flags: u32,
    pub addr: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct NvmapRwHandleArgs {
    pub addr: u64,
    pub handle: u32,
    pub offset: u32,
    pub elem_size: u32,
    pub hmem_stride: u32,
    pub user_stride: u32,
    pub count: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct NvmapHandleParamArgs {
    pub handle: u32,
    pub param: u32,
    pub result: u64,
}

/// For `count == 1` the fields hold the handle and the returned address directly;
/// otherwise they point at user arrays of `count` entries.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct NvmapPinHandleArgs {
    pub handles: u64,
    pub addr: u64,
    pub count: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct NvmapCacheOpArgs {
    pub addr: u64,
    pub handle: u32,
    pub len: u32,
    pub op: i32,
    pub pad: u32,
}

pub const NVMAP_IOC_CREATE: u32 = iowr::<NvmapCreateHandleArgs>(NVMAP_IOCTL_MAGIC, 0);
pub const NVMAP_IOC_FROM_ID: u32 = iowr::<NvmapCreateHandleArgs>(NVMAP_IOCTL_MAGIC, 2);
pub const NVMAP_IOC_ALLOC: u32 = iow::<NvmapAllocHandleArgs>(NVMAP_IOCTL_MAGIC, 3);
pub const NVMAP_IOC_FREE: u32 = io(NVMAP_IOCTL_MAGIC, 4);
pub const NVMAP_IOC_MMAP: u32 = iowr::<NvmapMapCallerArgs>(NVMAP_IOCTL_MAGIC, 5);
pub const NVMAP_IOC_WRITE: u32 = iow::<NvmapRwHandleArgs>(NVMAP_IOCTL_MAGIC, 6);
pub const NVMAP_IOC_READ: u32 = iow::<NvmapRwHandleArgs>(NVMAP_IOCTL_MAGIC, 7);
pub const NVMAP_IOC_PARAM: u32 = iowr::<NvmapHandleParamArgs>(NVMAP_IOCTL_MAGIC, 8);
pub const NVMAP_IOC_PIN_MULT: u32 = iowr::<NvmapPinHandleArgs>(NVMAP_IOCTL_MAGIC, 10);
pub const NVMAP_IOC_UNPIN_MULT: u32 = iow::<NvmapPinHandleArgs>(NVMAP_IOCTL_MAGIC, 11);
pub const NVMAP_IOC_CACHE: u32 = iow::<NvmapCacheOpArgs>(NVMAP_IOCTL_MAGIC, 12);
pub const NVMAP_IOC_GET_ID: u32 = iowr::<NvmapCreateHandleArgs>(NVMAP_IOCTL_MAGIC, 13);

// ===============================================================================================
// Layout checks
// ===============================================================================================

const _: () = assert!(size_of::<SubmitHdr>() == 16);
const _: () = assert!(size_of::<SubmitHdrExt>() == 48);
const _: () = assert!(size_of::<CmdBufArgs>() == 12);
const _: () = assert!(size_of::<RelocArgs>() == 16);
const _: () = assert!(size_of::<WaitChkArgs>() == 16);
const _: () = assert!(size_of::<ClkRateArgs>() == 8);
const _: () = assert!(size_of::<CtrlSyncptWaitexArgs>() == 16);
const _: () = assert!(size_of::<CtrlModuleRegRdWrArgs>() == 32);
const _: () = assert!(size_of::<NvmapMapCallerArgs>() == 24);
const _: () = assert!(size_of::<NvmapRwHandleArgs>() == 32);
const _: () = assert!(size_of::<NvmapHandleParamArgs>() == 16);
const _: () = assert!(size_of::<NvmapPinHandleArgs>() == 24);
const _: () = assert!(size_of::<NvmapCacheOpArgs>() == 24);
