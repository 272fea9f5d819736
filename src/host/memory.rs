//! # Memory Arena
//!
//! Handle-based ownership of physically addressable buffers: creation, heap
//! placement, pinning for device access, CPU mappings, cache maintenance and
//! copy-in/copy-out through the memory manager.

#![allow(clippy::cast_possible_truncation)]

use crate::error::{HostError, HostResult};
use crate::host::config::HostConfig;
use crate::nvhost::device::NvmapDevice;
use crate::nvhost::ioctl::{
    NVMAP_CACHE_OP_INV, NVMAP_CACHE_OP_WB, NVMAP_CACHE_OP_WB_INV, NVMAP_HANDLE_CACHEABLE,
    NVMAP_HANDLE_INNER_CACHEABLE, NVMAP_HANDLE_PARAM_ALIGNMENT, NVMAP_HANDLE_PARAM_BASE,
    NVMAP_HANDLE_PARAM_HEAP, NVMAP_HANDLE_PARAM_SIZE, NVMAP_HANDLE_UNCACHEABLE,
    NVMAP_HANDLE_WRITE_COMBINE, NVMAP_HEAP_CARVEOUT_GENERIC, NVMAP_HEAP_CARVEOUT_IRAM,
    NVMAP_HEAP_CARVEOUT_VPR, NVMAP_HEAP_IOVMM, NVMAP_HEAP_SYSMEM, NvmapAllocHandleArgs,
    NvmapMapCallerArgs,
};
use crate::utils::{align_down, align_up, is_power_of_two, page_size};
use bitflags::bitflags;
use log::{debug, warn};
use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Allocation tag recorded for buffers owned by the host subsystem itself.
pub const MEM_TAG_HOST_MISC: u16 = 0x0400;

const COPY_CHUNK: usize = 8192;

// ===============================================================================================
// Types
// ===============================================================================================

/// Opaque ownership token for a region of device-addressable memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemHandle(u32);

impl MemHandle {
    /// The memory manager's identifier, as placed in submission descriptors.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heap {
    /// Generic physically contiguous carve-out.
    ExternalCarveout,
    /// System memory.
    External,
    /// System memory remapped contiguous through the IOVMM aperture.
    Gart,
    IRam,
    /// Protected video carve-out.
    Vpr,
    /// System memory reserved for camera use.
    Camera,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cacheability {
    WriteBack,
    InnerWriteBack,
    WriteCombined,
    Uncached,
}

bitflags! {
    /// CPU access rights requested for a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemAccess: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl MemAccess {
    #[must_use]
    pub fn prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXECUTE) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// How a handle's pages are reached from the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapStrategy {
    /// Physically contiguous memory mapped through the memory manager's window.
    Physical,
    /// System pages exported as a per-handle shared memory object.
    SharedObject,
}

impl Heap {
    /// How the CPU reaches this heap's pages. `None` for heaps the memory manager does not
    /// map into user space (IOVMM and protected memory).
    #[must_use]
    pub const fn map_strategy(self) -> Option<MapStrategy> {
        match self {
            Self::ExternalCarveout | Self::IRam => Some(MapStrategy::Physical),
            Self::External | Self::Camera => Some(MapStrategy::SharedObject),
            Self::Gart | Self::Vpr => None,
        }
    }

    #[must_use]
    pub const fn heap_mask(self, carveout_to_gart: bool) -> u32 {
        match self {
            Self::ExternalCarveout if carveout_to_gart => NVMAP_HEAP_IOVMM,
            Self::ExternalCarveout => NVMAP_HEAP_CARVEOUT_GENERIC,
            Self::Gart => NVMAP_HEAP_IOVMM,
            Self::IRam => NVMAP_HEAP_CARVEOUT_IRAM,
            Self::Vpr => NVMAP_HEAP_CARVEOUT_VPR,
            Self::External | Self::Camera => NVMAP_HEAP_SYSMEM,
        }
    }

    /// Decodes the heap reported by the memory manager for an existing handle.
    #[must_use]
    pub const fn from_heap_mask(mask: u32) -> Self {
        if mask & NVMAP_HEAP_SYSMEM != 0 {
            Self::External
        } else if mask & NVMAP_HEAP_IOVMM != 0 {
            Self::Gart
        } else if mask & NVMAP_HEAP_CARVEOUT_IRAM != 0 {
            Self::IRam
        } else if mask & NVMAP_HEAP_CARVEOUT_VPR != 0 {
            Self::Vpr
        } else {
            Self::ExternalCarveout
        }
    }
}

impl Cacheability {
    #[must_use]
    pub const fn handle_flags(self) -> u32 {
        match self {
            Self::InnerWriteBack => NVMAP_HANDLE_INNER_CACHEABLE,
            Self::WriteBack => NVMAP_HANDLE_CACHEABLE,
            Self::WriteCombined => NVMAP_HANDLE_WRITE_COMBINE,
            Self::Uncached => NVMAP_HANDLE_UNCACHEABLE,
        }
    }
}

// ===============================================================================================
// Backend
// ===============================================================================================

/// Memory manager operations the arena drives. Errors carry the kernel errno.
pub trait MemoryBackend: Send + Sync {
    fn create(&self, size: u32) -> io::Result<u32>;
    fn from_id(&self, id: u32) -> io::Result<u32>;
    fn id(&self, handle: u32) -> io::Result<u32>;
    fn alloc(&self, handle: u32, heap_mask: u32, flags: u32, align: u32) -> io::Result<()>;
    fn free(&self, handle: u32) -> io::Result<()>;
    fn pin(&self, handles: &[u32], addrs: &mut [u32]) -> io::Result<()>;
    fn unpin(&self, handles: &[u32]) -> io::Result<()>;
    /// Maps `len` bytes starting at the page-aligned `offset`. Returns the page-aligned base.
    fn map(
        &self,
        handle: u32,
        strategy: MapStrategy,
        offset: usize,
        len: usize,
        access: MemAccess,
    ) -> io::Result<NonNull<u8>>;
    fn unmap(&self, base: NonNull<u8>, len: usize) -> io::Result<()>;
    fn read(&self, handle: u32, offset: u32, dst: &mut [u8]) -> io::Result<()>;
    fn write(&self, handle: u32, offset: u32, src: &[u8]) -> io::Result<()>;
    fn cache_op(&self, handle: u32, addr: *const u8, len: u32, op: i32) -> io::Result<()>;
    fn param(&self, handle: u32, param: u32) -> io::Result<u64>;
}

/// [`MemoryBackend`] over the nvmap device node.
#[derive(Debug, Clone)]
pub struct NvmapBackend {
    device: NvmapDevice,
    shm_name_prefix: String,
}

impl NvmapBackend {
    #[must_use]
    pub fn new(device: NvmapDevice, config: &HostConfig) -> Self {
        Self {
            device,
            shm_name_prefix: config.shm_name_prefix.clone(),
        }
    }

    fn map_physical(
        &self,
        handle: u32,
        offset: usize,
        len: usize,
        prot: libc::c_int,
    ) -> io::Result<NonNull<u8>> {
        let fd = self.device.as_raw_fd();
        let addr =
            unsafe { libc::mmap(std::ptr::null_mut(), len, prot, libc::MAP_SHARED, fd, 0) };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let mut args = NvmapMapCallerArgs {
            handle,
            offset: offset as u32,
            length: len as u32,
            flags: 0,
            addr: addr as u64,
        };
        if let Err(e) = self.device.mmap(&mut args) {
            unsafe { libc::munmap(addr, len) };
            return Err(e);
        }
        NonNull::new(addr.cast::<u8>()).ok_or_else(|| io::Error::from(io::ErrorKind::InvalidData))
    }

    fn map_shared_object(
        &self,
        handle: u32,
        offset: usize,
        len: usize,
        prot: libc::c_int,
    ) -> io::Result<NonNull<u8>> {
        let name = CString::new(format!("{}.{handle}", self.shm_name_prefix))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        };
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        if addr == libc::MAP_FAILED {
            return Err(err);
        }
        NonNull::new(addr.cast::<u8>()).ok_or_else(|| io::Error::from(io::ErrorKind::InvalidData))
    }
}

impl MemoryBackend for NvmapBackend {
    fn create(&self, size: u32) -> io::Result<u32> {
        self.device.create(size)
    }

    fn from_id(&self, id: u32) -> io::Result<u32> {
        self.device.from_id(id)
    }

    fn id(&self, handle: u32) -> io::Result<u32> {
        self.device.get_id(handle)
    }

    fn alloc(&self, handle: u32, heap_mask: u32, flags: u32, align: u32) -> io::Result<()> {
        let mut args = NvmapAllocHandleArgs {
            handle,
            heap_mask,
            flags,
            align,
        };
        self.device.alloc(&mut args)
    }

    fn free(&self, handle: u32) -> io::Result<()> {
        self.device.free(handle)
    }

    fn pin(&self, handles: &[u32], addrs: &mut [u32]) -> io::Result<()> {
        self.device.pin_mult(handles, addrs)
    }

    fn unpin(&self, handles: &[u32]) -> io::Result<()> {
        self.device.unpin_mult(handles)
    }

    fn map(
        &self,
        handle: u32,
        strategy: MapStrategy,
        offset: usize,
        len: usize,
        access: MemAccess,
    ) -> io::Result<NonNull<u8>> {
        match strategy {
            MapStrategy::Physical => self.map_physical(handle, offset, len, access.prot()),
            MapStrategy::SharedObject => self.map_shared_object(handle, offset, len, access.prot()),
        }
    }

    fn unmap(&self, base: NonNull<u8>, len: usize) -> io::Result<()> {
        let ret = unsafe { libc::munmap(base.as_ptr().cast(), len) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn read(&self, handle: u32, offset: u32, dst: &mut [u8]) -> io::Result<()> {
        self.device.read(handle, offset, dst)
    }

    fn write(&self, handle: u32, offset: u32, src: &[u8]) -> io::Result<()> {
        self.device.write(handle, offset, src)
    }

    fn cache_op(&self, handle: u32, addr: *const u8, len: u32, op: i32) -> io::Result<()> {
        self.device.cache_op(handle, addr, len, op)
    }

    fn param(&self, handle: u32, param: u32) -> io::Result<u64> {
        self.device.param(handle, param)
    }
}

// ===============================================================================================
// Arena
// ===============================================================================================

#[derive(Debug, Clone)]
struct HandleState {
    size: u32,
    heap: Option<Heap>,
    pins: u32,
    address: Option<u32>,
}

/// Process-wide owner of memory handles.
pub struct MemoryArena {
    backend: Arc<dyn MemoryBackend>,
    handles: Mutex<HashMap<u32, HandleState>>,
    carveout_to_gart: bool,
}

impl std::fmt::Debug for MemoryArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryArena")
            .field("handles", &self.lock().len())
            .field("carveout_to_gart", &self.carveout_to_gart)
            .finish_non_exhaustive()
    }
}

impl MemoryArena {
    pub fn new(backend: Arc<dyn MemoryBackend>, config: &HostConfig) -> Self {
        Self {
            backend,
            handles: Mutex::new(HashMap::new()),
            carveout_to_gart: config.convert_carveout_to_gart,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, HandleState>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_state<R>(
        &self,
        handle: MemHandle,
        f: impl FnOnce(&mut HandleState) -> HostResult<R>,
    ) -> HostResult<R> {
        let mut handles = self.lock();
        let state = handles
            .get_mut(&handle.0)
            .ok_or(HostError::InvalidState("unknown memory handle"))?;
        f(state)
    }

    // ===========================================================================================
    // Lifecycle
    // ===========================================================================================

    /// Creates an unallocated handle for `size` bytes.
    ///
    /// # Errors
    /// `AccessDenied`, `OutOfMemory` or `NotInitialized` depending on the kernel's refusal.
    pub fn create(&self, size: u32) -> HostResult<MemHandle> {
        let raw = self.backend.create(size).map_err(|e| match e.raw_os_error() {
            Some(libc::EPERM) => HostError::AccessDenied,
            Some(libc::ENOMEM) => HostError::OutOfMemory,
            Some(libc::EINVAL) => HostError::NotInitialized,
            _ => HostError::ioctl("nvmap create", e),
        })?;
        self.lock().insert(
            raw,
            HandleState {
                size,
                heap: None,
                pins: 0,
                address: None,
            },
        );
        Ok(MemHandle(raw))
    }

    /// Imports a handle another process exported with [`Self::id`].
    pub fn from_id(&self, id: u32) -> HostResult<MemHandle> {
        let raw = self
            .backend
            .from_id(id)
            .map_err(|e| HostError::ioctl("nvmap from_id", e))?;
        let size = self
            .backend
            .param(raw, NVMAP_HANDLE_PARAM_SIZE)
            .map_err(|e| HostError::ioctl("nvmap param", e))?;
        let heap = self
            .backend
            .param(raw, NVMAP_HANDLE_PARAM_HEAP)
            .ok()
            .map(|mask| Heap::from_heap_mask(mask as u32));
        self.lock().insert(
            raw,
            HandleState {
                size: size as u32,
                heap,
                pins: 0,
                address: None,
            },
        );
        Ok(MemHandle(raw))
    }

    /// Global id under which `handle` can be imported by other processes.
    pub fn id(&self, handle: MemHandle) -> HostResult<u32> {
        self.backend
            .id(handle.0)
            .map_err(|e| HostError::ioctl("nvmap get_id", e))
    }

    /// Places `handle` in the first heap of `heaps` with room for it.
    ///
    /// Only an out-of-memory refusal moves on to the next heap; any other refusal stops the
    /// search. An empty `heaps` list means the generic carve-out.
    ///
    /// # Errors
    /// `InvalidAlignment` before any driver call if `alignment` is not a power of two,
    /// otherwise `OutOfMemory`, `AccessDenied` or `BadParameter`.
    pub fn allocate(
        &self,
        handle: MemHandle,
        heaps: &[Heap],
        alignment: u32,
        cacheability: Cacheability,
        tag: u16,
    ) -> HostResult<()> {
        if !is_power_of_two(alignment) {
            debug_assert!(false, "alignment {alignment:#x} is not a power of two");
            return Err(HostError::InvalidAlignment(alignment));
        }

        let flags = cacheability.handle_flags() | (u32::from(tag) << 16);
        let heaps = if heaps.is_empty() {
            &[Heap::ExternalCarveout][..]
        } else {
            heaps
        };

        let mut last_err = None;
        for &heap in heaps {
            let mask = heap.heap_mask(self.carveout_to_gart);
            match self.backend.alloc(handle.0, mask, flags, alignment) {
                Ok(()) => {
                    // Recorded as placed, so a redirected carve-out reads as IOVMM.
                    return self.with_state(handle, |state| {
                        state.heap = Some(Heap::from_heap_mask(mask));
                        Ok(())
                    });
                }
                Err(e) if e.raw_os_error() == Some(libc::ENOMEM) => {
                    debug!("nvmap: heap {heap:?} exhausted for handle {:#x}", handle.0);
                    last_err = Some(e);
                }
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            }
        }

        Err(match last_err.and_then(|e| e.raw_os_error()) {
            Some(libc::EPERM) => HostError::AccessDenied,
            Some(libc::EINVAL) => {
                HostError::BadParameter(format!("allocation of handle {:#x} rejected", handle.0))
            }
            _ => HostError::OutOfMemory,
        })
    }

    /// Releases `handle`. The handle must not be pinned.
    pub fn free(&self, handle: MemHandle) -> HostResult<()> {
        {
            let mut handles = self.lock();
            match handles.get(&handle.0) {
                None => {
                    debug_assert!(false, "double free of handle {:#x}", handle.0);
                    return Err(HostError::InvalidState("unknown memory handle"));
                }
                Some(state) if state.pins > 0 => {
                    debug_assert!(false, "freeing pinned handle {:#x}", handle.0);
                    return Err(HostError::InvalidState("memory handle is still pinned"));
                }
                Some(_) => {
                    handles.remove(&handle.0);
                }
            }
        }
        self.backend
            .free(handle.0)
            .map_err(|e| HostError::ioctl("nvmap free", e))
    }

    // ===========================================================================================
    // Pinning
    // ===========================================================================================

    /// Pins `handle` and returns its device address, stable until the matching [`Self::unpin`].
    pub fn pin(&self, handle: MemHandle) -> HostResult<u32> {
        let mut addrs = self.pin_many(&[handle])?;
        addrs.pop().ok_or(HostError::InvalidState("pin returned no address"))
    }

    /// Pins every handle with a single driver call.
    pub fn pin_many(&self, handles: &[MemHandle]) -> HostResult<Vec<u32>> {
        let raw: Vec<u32> = handles.iter().map(|h| h.0).collect();
        let mut addrs = vec![0u32; raw.len()];
        self.backend
            .pin(&raw, &mut addrs)
            .map_err(|e| HostError::ioctl("nvmap pin", e))?;

        let mut table = self.lock();
        for (handle, &addr) in raw.iter().zip(&addrs) {
            if let Some(state) = table.get_mut(handle) {
                if let Some(prev) = state.address
                    && prev != addr
                {
                    warn!("nvmap: handle {handle:#x} moved while pinned ({prev:#x} -> {addr:#x})");
                }
                state.pins += 1;
                state.address = Some(addr);
            }
        }
        Ok(addrs)
    }

    pub fn unpin(&self, handle: MemHandle) -> HostResult<()> {
        self.unpin_many(&[handle])
    }

    pub fn unpin_many(&self, handles: &[MemHandle]) -> HostResult<()> {
        {
            // A handle may appear several times; each occurrence needs a pin of its own.
            let mut wanted: HashMap<u32, u32> = HashMap::new();
            for handle in handles {
                *wanted.entry(handle.0).or_default() += 1;
            }
            let table = self.lock();
            for (&raw, &count) in &wanted {
                if table.get(&raw).is_none_or(|s| s.pins < count) {
                    debug_assert!(false, "unpin without pin on handle {raw:#x}");
                    return Err(HostError::InvalidState("unpin without matching pin"));
                }
            }
        }
        let raw: Vec<u32> = handles.iter().map(|h| h.0).collect();
        self.backend
            .unpin(&raw)
            .map_err(|e| HostError::ioctl("nvmap unpin", e))?;

        let mut table = self.lock();
        for handle in &raw {
            if let Some(state) = table.get_mut(handle) {
                state.pins = state.pins.saturating_sub(1);
                if state.pins == 0 {
                    state.address = None;
                }
            }
        }
        Ok(())
    }

    /// Device address of byte `offset` in `handle`. The handle must be pinned.
    pub fn address(&self, handle: MemHandle, offset: u32) -> HostResult<u32> {
        self.with_state(handle, |state| {
            let addr = state
                .address
                .ok_or(HostError::InvalidState("address read from unpinned handle"))?;
            addr.checked_add(offset).ok_or_else(|| {
                HostError::BadParameter(format!(
                    "offset {offset:#x} past the end of device address {addr:#x}"
                ))
            })
        })
    }

    // ===========================================================================================
    // CPU Access
    // ===========================================================================================

    /// Maps `size` bytes at `offset` for CPU access. The pointer honors the in-page offset.
    pub fn map(
        &self,
        handle: MemHandle,
        offset: u32,
        size: u32,
        access: MemAccess,
    ) -> HostResult<NonNull<u8>> {
        let heap = match self.with_state(handle, |state| Ok(state.heap))? {
            Some(heap) => heap,
            None => self.heap(handle)?,
        };

        let strategy = heap.map_strategy().ok_or_else(|| {
            HostError::BadParameter(format!("{heap:?} memory cannot be mapped by the CPU"))
        })?;

        let page = page_size();
        let offset = offset as usize;
        let aligned = align_down(offset, page);
        let in_page = offset - aligned;
        let len = align_up(size as usize + in_page, page);

        let base = self
            .backend
            .map(handle.0, strategy, aligned, len, access)
            .map_err(|e| HostError::ioctl("nvmap mmap", e))?;
        // `in_page < len`, so the result stays inside the mapping.
        Ok(unsafe { base.add(in_page) })
    }

    /// Undoes [`Self::map`] for the same `ptr` and `size`.
    pub fn unmap(&self, ptr: NonNull<u8>, size: u32) -> HostResult<()> {
        let page = page_size();
        let addr = ptr.as_ptr() as usize;
        let in_page = addr - align_down(addr, page);
        let len = align_up(size as usize + in_page, page);
        // `ptr` came from `map`, so the page start is inside the same mapping.
        let base = unsafe { ptr.sub(in_page) };
        self.backend
            .unmap(base, len)
            .map_err(|e| HostError::ioctl("munmap", e))
    }

    /// Writes back and/or invalidates CPU caches for a mapped range. No-op if neither is requested.
    pub fn cache_maint(
        &self,
        handle: MemHandle,
        ptr: NonNull<u8>,
        size: u32,
        writeback: bool,
        invalidate: bool,
    ) -> HostResult<()> {
        let op = match (writeback, invalidate) {
            (true, true) => NVMAP_CACHE_OP_WB_INV,
            (true, false) => NVMAP_CACHE_OP_WB,
            (false, true) => NVMAP_CACHE_OP_INV,
            (false, false) => return Ok(()),
        };
        self.backend
            .cache_op(handle.0, ptr.as_ptr(), size, op)
            .map_err(|e| HostError::ioctl("nvmap cache", e))
    }

    fn check_range(&self, handle: MemHandle, offset: u32, len: usize) -> HostResult<()> {
        self.with_state(handle, |state| {
            let end = u64::from(offset) + len as u64;
            if end > u64::from(state.size) {
                return Err(HostError::BadParameter(format!(
                    "range {offset:#x}+{len:#x} exceeds handle size {:#x}",
                    state.size
                )));
            }
            Ok(())
        })
    }

    pub fn read(&self, handle: MemHandle, offset: u32, dst: &mut [u8]) -> HostResult<()> {
        self.check_range(handle, offset, dst.len())?;
        self.backend
            .read(handle.0, offset, dst)
            .map_err(|e| HostError::ioctl("nvmap read", e))
    }

    pub fn write(&self, handle: MemHandle, offset: u32, src: &[u8]) -> HostResult<()> {
        self.check_range(handle, offset, src.len())?;
        self.backend
            .write(handle.0, offset, src)
            .map_err(|e| HostError::ioctl("nvmap write", e))
    }

    /// Writes command words in native byte order.
    pub fn write_words(&self, handle: MemHandle, word_offset: u32, words: &[u32]) -> HostResult<()> {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_ne_bytes()).collect();
        self.write(handle, word_offset * 4, &bytes)
    }

    pub fn read_word(&self, handle: MemHandle, word_offset: u32) -> HostResult<u32> {
        let mut bytes = [0u8; 4];
        self.read(handle, word_offset * 4, &mut bytes)?;
        Ok(u32::from_ne_bytes(bytes))
    }

    /// Copies `len` bytes between handles through a bounce buffer.
    pub fn copy(
        &self,
        dst: MemHandle,
        mut dst_offset: u32,
        src: MemHandle,
        mut src_offset: u32,
        mut len: u32,
    ) -> HostResult<()> {
        let mut buffer = vec![0u8; COPY_CHUNK];
        while len > 0 {
            let count = (len as usize).min(COPY_CHUNK);
            self.read(src, src_offset, &mut buffer[..count])?;
            self.write(dst, dst_offset, &buffer[..count])?;
            len -= count as u32;
            src_offset += count as u32;
            dst_offset += count as u32;
        }
        Ok(())
    }

    // ===========================================================================================
    // Handle Parameters
    // ===========================================================================================

    fn param(&self, handle: MemHandle, param: u32) -> HostResult<u64> {
        self.backend
            .param(handle.0, param)
            .map_err(|e| HostError::ioctl("nvmap param", e))
    }

    pub fn size(&self, handle: MemHandle) -> HostResult<u32> {
        Ok(self.param(handle, NVMAP_HANDLE_PARAM_SIZE)? as u32)
    }

    pub fn alignment(&self, handle: MemHandle) -> HostResult<u32> {
        Ok(self.param(handle, NVMAP_HANDLE_PARAM_ALIGNMENT)? as u32)
    }

    /// Base address as reported by the memory manager, `None` while it has no device address.
    pub fn base_address(&self, handle: MemHandle, offset: u32) -> HostResult<Option<u32>> {
        let base = self.param(handle, NVMAP_HANDLE_PARAM_BASE)? as u32;
        Ok((base != u32::MAX).then(|| base + offset))
    }

    pub fn heap(&self, handle: MemHandle) -> HostResult<Heap> {
        let mask = self.param(handle, NVMAP_HANDLE_PARAM_HEAP)? as u32;
        Ok(Heap::from_heap_mask(mask))
    }
}

// ===============================================================================================
// Pinned Command Buffers
// ===============================================================================================

/// A RAII-wrapper around a small, pinned command buffer.
///
/// Creation allocates, fills and pins; dropping unpins and frees, logging failures.
#[derive(Debug)]
pub struct PinnedBuffer {
    arena: Arc<MemoryArena>,
    handle: MemHandle,
    address: u32,
    words: u32,
}

impl PinnedBuffer {
    /// Allocates a buffer holding exactly `words`.
    pub fn new(
        arena: &Arc<MemoryArena>,
        words: &[u32],
        cacheability: Cacheability,
    ) -> HostResult<Self> {
        let count = words.len() as u32;
        let handle = arena.create(count.max(1) * 4)?;
        let address = arena
            .allocate(handle, &[], 32, cacheability, MEM_TAG_HOST_MISC)
            .and_then(|()| arena.write_words(handle, 0, words))
            .and_then(|()| arena.pin(handle))
            .inspect_err(|_| {
                if let Err(e) = arena.free(handle) {
                    warn!("nvmap: failed to release handle {:#x}: {e}", handle.raw());
                }
            })?;
        Ok(Self {
            arena: Arc::clone(arena),
            handle,
            address,
            words: count,
        })
    }

    #[must_use]
    pub const fn handle(&self) -> MemHandle {
        self.handle
    }

    #[must_use]
    pub const fn address(&self) -> u32 {
        self.address
    }

    #[must_use]
    pub const fn words(&self) -> u32 {
        self.words
    }

    pub fn write_word(&self, index: u32, value: u32) -> HostResult<()> {
        self.arena.write_words(self.handle, index, &[value])
    }

    pub fn read_word(&self, index: u32) -> HostResult<u32> {
        self.arena.read_word(self.handle, index)
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.arena.unpin(self.handle) {
            warn!("[PinnedBuffer] Failed to unpin {:#x}: {e}", self.handle.raw());
        }
        if let Err(e) = self.arena.free(self.handle) {
            warn!("[PinnedBuffer] Failed to free {:#x}: {e}", self.handle.raw());
        }
    }
}
