//! In-memory stand-ins for the kernel devices, with call counters for tests.

#![allow(clippy::cast_possible_truncation)]

use crate::host::channel::ChannelIo;
use crate::host::memory::{MapStrategy, MemAccess, MemoryBackend};
use crate::host::syncpt::HostControl;
use crate::nvhost::ioctl::{
    NVHOST_SUBMIT_VERSION_MAX_SUPPORTED, NVHOST_SUBMIT_VERSION_V0, NVMAP_HANDLE_PARAM_ALIGNMENT,
    NVMAP_HANDLE_PARAM_BASE, NVMAP_HANDLE_PARAM_HEAP, NVMAP_HANDLE_PARAM_SIZE, SubmitHdrExt,
};
use crate::utils::{NO_TIMEOUT, align_up, page_size, syncpt_reached};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::ptr::NonNull;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

// ===============================================================================================
// Memory
// ===============================================================================================

#[derive(Debug)]
struct SimHandle {
    size: u32,
    /// Anonymous mapping standing in for the physical pages.
    base: usize,
    len: usize,
    heap_mask: u32,
    align: u32,
    pins: u32,
    address: Option<u32>,
    refs: u32,
}

#[derive(Debug, Default)]
struct MemState {
    handles: HashMap<u32, SimHandle>,
    next_handle: u32,
    next_address: u32,
    creates: u32,
    fail_next_create: Option<i32>,
    exhausted: HashSet<u32>,
    denied: HashMap<u32, i32>,
    alloc_attempts: Vec<u32>,
    last_alloc_flags: u32,
    pin_calls: u32,
    unpin_calls: u32,
    last_map_strategy: Option<MapStrategy>,
    cache_ops: Vec<i32>,
}

/// [`MemoryBackend`] keeping every handle in an anonymous mapping.
#[derive(Debug)]
pub struct SimMemory {
    state: Mutex<MemState>,
}

impl Default for SimMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SimMemory {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState {
                next_handle: 0x100,
                next_address: 0x1000_0000,
                ..MemState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn exhaust_heap(&self, mask: u32) {
        self.lock().exhausted.insert(mask);
    }

    pub fn deny_heap(&self, mask: u32, code: i32) {
        self.lock().denied.insert(mask, code);
    }

    pub fn fail_next_create(&self, code: i32) {
        self.lock().fail_next_create = Some(code);
    }

    pub fn alloc_attempts(&self) -> Vec<u32> {
        self.lock().alloc_attempts.clone()
    }

    pub fn last_alloc_flags(&self) -> u32 {
        self.lock().last_alloc_flags
    }

    pub fn creates(&self) -> u32 {
        self.lock().creates
    }

    pub fn pin_calls(&self) -> u32 {
        self.lock().pin_calls
    }

    pub fn unpin_calls(&self) -> u32 {
        self.lock().unpin_calls
    }

    pub fn last_map_strategy(&self) -> Option<MapStrategy> {
        self.lock().last_map_strategy
    }

    pub fn cache_ops(&self) -> Vec<i32> {
        self.lock().cache_ops.clone()
    }

    pub fn live_handles(&self) -> usize {
        self.lock().handles.len()
    }

    pub fn pinned_handles(&self) -> usize {
        self.lock().handles.values().filter(|h| h.pins > 0).count()
    }

    /// Reads `count` words of a raw handle, bypassing any arena.
    pub fn read_words(&self, handle: u32, word_offset: u32, count: u32) -> Vec<u32> {
        let mut bytes = vec![0u8; count as usize * 4];
        self.read(handle, word_offset * 4, &mut bytes).unwrap();
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn with_handle<R>(
        &self,
        handle: u32,
        f: impl FnOnce(&mut SimHandle) -> io::Result<R>,
    ) -> io::Result<R> {
        let mut state = self.lock();
        let h = state.handles.get_mut(&handle).ok_or_else(|| errno(libc::EINVAL))?;
        f(h)
    }
}

impl Drop for SimMemory {
    fn drop(&mut self) {
        for h in self.lock().handles.values() {
            unsafe { libc::munmap(h.base as *mut libc::c_void, h.len) };
        }
    }
}

impl MemoryBackend for SimMemory {
    fn create(&self, size: u32) -> io::Result<u32> {
        let mut state = self.lock();
        if let Some(code) = state.fail_next_create.take() {
            return Err(errno(code));
        }
        let len = align_up((size as usize).max(1), page_size());
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let raw = state.next_handle;
        state.next_handle += 1;
        state.creates += 1;
        state.handles.insert(
            raw,
            SimHandle {
                size,
                base: base as usize,
                len,
                heap_mask: 0,
                align: 0,
                pins: 0,
                address: None,
                refs: 1,
            },
        );
        Ok(raw)
    }

    fn from_id(&self, id: u32) -> io::Result<u32> {
        self.with_handle(id, |h| {
            h.refs += 1;
            Ok(id)
        })
    }

    fn id(&self, handle: u32) -> io::Result<u32> {
        self.with_handle(handle, |_| Ok(handle))
    }

    fn alloc(&self, handle: u32, heap_mask: u32, flags: u32, align: u32) -> io::Result<()> {
        let mut state = self.lock();
        state.alloc_attempts.push(heap_mask);
        state.last_alloc_flags = flags;
        if let Some(&code) = state.denied.get(&heap_mask) {
            return Err(errno(code));
        }
        if state.exhausted.contains(&heap_mask) {
            return Err(errno(libc::ENOMEM));
        }
        let h = state.handles.get_mut(&handle).ok_or_else(|| errno(libc::EINVAL))?;
        h.heap_mask = heap_mask;
        h.align = align;
        Ok(())
    }

    fn free(&self, handle: u32) -> io::Result<()> {
        let mut state = self.lock();
        let h = state.handles.get_mut(&handle).ok_or_else(|| errno(libc::EINVAL))?;
        h.refs -= 1;
        if h.refs == 0
            && let Some(h) = state.handles.remove(&handle)
        {
            unsafe { libc::munmap(h.base as *mut libc::c_void, h.len) };
        }
        Ok(())
    }

    fn pin(&self, handles: &[u32], addrs: &mut [u32]) -> io::Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.pin_calls += 1;
        if handles.iter().any(|h| !state.handles.contains_key(h)) {
            return Err(errno(libc::EINVAL));
        }
        for (raw, addr) in handles.iter().zip(addrs.iter_mut()) {
            let h = state.handles.get_mut(raw).ok_or_else(|| errno(libc::EINVAL))?;
            let assigned = match h.address {
                Some(a) => a,
                None => {
                    let a = state.next_address;
                    state.next_address = a.wrapping_add(h.len as u32);
                    h.address = Some(a);
                    a
                }
            };
            h.pins += 1;
            *addr = assigned;
        }
        Ok(())
    }

    fn unpin(&self, handles: &[u32]) -> io::Result<()> {
        let mut state = self.lock();
        state.unpin_calls += 1;
        for raw in handles {
            let h = state.handles.get_mut(raw).ok_or_else(|| errno(libc::EINVAL))?;
            h.pins = h.pins.saturating_sub(1);
            if h.pins == 0 {
                h.address = None;
            }
        }
        Ok(())
    }

    fn map(
        &self,
        handle: u32,
        strategy: MapStrategy,
        offset: usize,
        len: usize,
        _access: MemAccess,
    ) -> io::Result<NonNull<u8>> {
        self.lock().last_map_strategy = Some(strategy);
        self.with_handle(handle, |h| {
            if offset + len > h.len {
                return Err(errno(libc::EINVAL));
            }
            NonNull::new((h.base + offset) as *mut u8).ok_or_else(|| errno(libc::EFAULT))
        })
    }

    fn unmap(&self, _base: NonNull<u8>, _len: usize) -> io::Result<()> {
        Ok(())
    }

    fn read(&self, handle: u32, offset: u32, dst: &mut [u8]) -> io::Result<()> {
        self.with_handle(handle, |h| {
            if offset as usize + dst.len() > h.size as usize {
                return Err(errno(libc::EINVAL));
            }
            let src = (h.base + offset as usize) as *const u8;
            unsafe { std::ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
            Ok(())
        })
    }

    fn write(&self, handle: u32, offset: u32, src: &[u8]) -> io::Result<()> {
        self.with_handle(handle, |h| {
            if offset as usize + src.len() > h.size as usize {
                return Err(errno(libc::EINVAL));
            }
            let dst = (h.base + offset as usize) as *mut u8;
            unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
            Ok(())
        })
    }

    fn cache_op(&self, handle: u32, _addr: *const u8, _len: u32, op: i32) -> io::Result<()> {
        self.with_handle(handle, |_| Ok(()))?;
        self.lock().cache_ops.push(op);
        Ok(())
    }

    fn param(&self, handle: u32, param: u32) -> io::Result<u64> {
        self.with_handle(handle, |h| match param {
            NVMAP_HANDLE_PARAM_SIZE => Ok(u64::from(h.size)),
            NVMAP_HANDLE_PARAM_ALIGNMENT => Ok(u64::from(h.align)),
            NVMAP_HANDLE_PARAM_BASE => Ok(u64::from(h.address.unwrap_or(u32::MAX))),
            NVMAP_HANDLE_PARAM_HEAP => Ok(u64::from(h.heap_mask)),
            _ => Err(errno(libc::EINVAL)),
        })
    }
}

// ===============================================================================================
// Control
// ===============================================================================================

#[derive(Debug)]
struct CtrlState {
    values: HashMap<u32, u32>,
    max: HashMap<u32, u32>,
    version: u32,
    waitex_disabled: bool,
    waitex_calls: u32,
    wait_calls: u32,
    interrupts: u32,
    wait_failure: Option<i32>,
    busy: HashMap<u32, u32>,
    held: HashSet<u32>,
    lock_attempts: u32,
    registers: HashMap<(u32, u32), u32>,
}

/// [`HostControl`] with sync points that wake blocked waiters when incremented.
#[derive(Debug)]
pub struct SimControl {
    state: Mutex<CtrlState>,
    changed: Condvar,
}

impl Default for SimControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SimControl {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CtrlState {
                values: HashMap::new(),
                max: HashMap::new(),
                version: NVHOST_SUBMIT_VERSION_MAX_SUPPORTED,
                waitex_disabled: false,
                waitex_calls: 0,
                wait_calls: 0,
                interrupts: 0,
                wait_failure: None,
                busy: HashMap::new(),
                held: HashSet::new(),
                lock_attempts: 0,
                registers: HashMap::new(),
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CtrlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets both the current and the maximum value of `id`.
    pub fn set_syncpt(&self, id: u32, value: u32) {
        let mut state = self.lock();
        state.values.insert(id, value);
        state.max.insert(id, value);
        self.changed.notify_all();
    }

    pub fn set_max(&self, id: u32, value: u32) {
        self.lock().max.insert(id, value);
    }

    pub fn syncpt_value(&self, id: u32) -> u32 {
        self.lock().values.get(&id).copied().unwrap_or(0)
    }

    /// Completes `n` increments of queued work without touching the maximum.
    pub fn advance(&self, id: u32, n: u32) {
        let mut state = self.lock();
        let value = state.values.entry(id).or_insert(0);
        *value = value.wrapping_add(n);
        self.changed.notify_all();
    }

    /// Queues `n` increments, completing them at once if `complete`. Returns the new maximum.
    pub fn queue_increments(&self, id: u32, n: u32, complete: bool) -> u32 {
        let mut state = self.lock();
        let max = state.max.entry(id).or_insert(0);
        *max = max.wrapping_add(n);
        let max = *max;
        if complete {
            let value = state.values.entry(id).or_insert(0);
            *value = value.wrapping_add(n);
            self.changed.notify_all();
        }
        max
    }

    pub fn set_version(&self, version: u32) {
        self.lock().version = version;
    }

    pub fn disable_waitex(&self) {
        self.lock().waitex_disabled = true;
    }

    pub fn waitex_calls(&self) -> u32 {
        self.lock().waitex_calls
    }

    pub fn wait_calls(&self) -> u32 {
        self.lock().wait_calls
    }

    pub fn interrupt_next_waits(&self, n: u32) {
        self.lock().interrupts = n;
    }

    pub fn fail_waits(&self, code: i32) {
        self.lock().wait_failure = Some(code);
    }

    pub fn clear_wait_failure(&self) {
        self.lock().wait_failure = None;
    }

    pub fn busy_mutex_for(&self, id: u32, attempts: u32) {
        self.lock().busy.insert(id, attempts);
    }

    pub fn mutex_lock_attempts(&self) -> u32 {
        self.lock().lock_attempts
    }

    pub fn mutex_held(&self, id: u32) -> bool {
        self.lock().held.contains(&id)
    }

    fn block_until(
        &self,
        mut state: MutexGuard<'_, CtrlState>,
        id: u32,
        thresh: u32,
        timeout_ms: u32,
    ) -> io::Result<u32> {
        if state.interrupts > 0 {
            state.interrupts -= 1;
            return Err(errno(libc::EINTR));
        }
        if let Some(code) = state.wait_failure {
            return Err(errno(code));
        }
        let deadline = (timeout_ms != NO_TIMEOUT)
            .then(|| Instant::now() + Duration::from_millis(u64::from(timeout_ms)));
        loop {
            let current = state.values.get(&id).copied().unwrap_or(0);
            if syncpt_reached(current, thresh) {
                return Ok(current);
            }
            state = match deadline {
                None => self
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(errno(libc::EAGAIN));
                    }
                    self.changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

impl HostControl for SimControl {
    fn version(&self) -> io::Result<u32> {
        Ok(self.lock().version)
    }

    fn syncpt_read(&self, id: u32) -> io::Result<u32> {
        Ok(self.syncpt_value(id))
    }

    fn syncpt_max(&self, id: u32) -> io::Result<u32> {
        Ok(self.lock().max.get(&id).copied().unwrap_or(0))
    }

    fn syncpt_incr(&self, id: u32) -> io::Result<()> {
        let mut state = self.lock();
        let old = state.values.get(&id).copied().unwrap_or(0);
        let new = old.wrapping_add(1);
        state.values.insert(id, new);
        let max = state.max.entry(id).or_insert(0);
        if *max == old || !syncpt_reached(*max, new) {
            *max = new;
        }
        self.changed.notify_all();
        Ok(())
    }

    fn syncpt_wait(&self, id: u32, thresh: u32, timeout_ms: u32) -> io::Result<()> {
        let mut state = self.lock();
        state.wait_calls += 1;
        self.block_until(state, id, thresh, timeout_ms).map(drop)
    }

    fn syncpt_waitex(&self, id: u32, thresh: u32, timeout_ms: u32) -> io::Result<u32> {
        let mut state = self.lock();
        state.waitex_calls += 1;
        if state.waitex_disabled {
            return Err(errno(libc::ENOTTY));
        }
        self.block_until(state, id, thresh, timeout_ms)
    }

    fn module_mutex(&self, id: u32, lock: bool) -> io::Result<()> {
        let mut state = self.lock();
        if !lock {
            state.held.remove(&id);
            return Ok(());
        }
        state.lock_attempts += 1;
        if let Some(busy) = state.busy.get_mut(&id)
            && *busy > 0
        {
            *busy -= 1;
            return Err(errno(libc::EBUSY));
        }
        state.held.insert(id);
        Ok(())
    }

    fn module_regrdwr(
        &self,
        id: u32,
        offsets: &[u32],
        values: &mut [u32],
        _block_size: u32,
        write: bool,
    ) -> io::Result<()> {
        let mut state = self.lock();
        for (&offset, value) in offsets.iter().zip(values.iter_mut()) {
            if write {
                state.registers.insert((id, offset), *value);
            } else {
                *value = state.registers.get(&(id, offset)).copied().unwrap_or(0);
            }
        }
        Ok(())
    }
}

// ===============================================================================================
// Channel
// ===============================================================================================

/// A kicked-off submission as the kernel would have received it.
#[derive(Debug, Clone)]
pub struct Submission {
    pub header: SubmitHdrExt,
    pub stream: Vec<u8>,
    pub null_kickoff: bool,
}

fn stream_word(bytes: &[u8], index: usize) -> u32 {
    let at = index * 4;
    u32::from_ne_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

impl Submission {
    /// `(mem, offset, words)` of every command buffer in the stream.
    pub fn cmdbufs(&self) -> Vec<(u32, u32, u32)> {
        let skip = if self.header.submit_version == NVHOST_SUBMIT_VERSION_V0 {
            4
        } else {
            0
        };
        (0..self.header.num_cmdbufs as usize)
            .map(|i| {
                let at = skip + i * 3;
                (
                    stream_word(&self.stream, at),
                    stream_word(&self.stream, at + 1),
                    stream_word(&self.stream, at + 2),
                )
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct ChanState {
    submit_ext_failures: VecDeque<i32>,
    flush_failures: VecDeque<i32>,
    submit_ext_calls: u32,
    flushes: u32,
    header: Option<SubmitHdrExt>,
    stream: Vec<u8>,
    last: Option<Submission>,
    deferred: bool,
    syncpoints: u32,
    waitbases: u32,
    priority: Option<u32>,
    timeout_ms: Option<u32>,
    clock_hz: u64,
    registers_3d: HashMap<u32, u32>,
}

/// [`ChannelIo`] that completes submitted work on a [`SimControl`].
#[derive(Debug, Clone)]
pub struct SimChannel {
    ctrl: Arc<SimControl>,
    state: Arc<Mutex<ChanState>>,
}

impl SimChannel {
    pub fn new(ctrl: Arc<SimControl>) -> Self {
        Self {
            ctrl,
            state: Arc::new(Mutex::new(ChanState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next header ioctls fail with `codes`, in order.
    pub fn fail_submit_ext(&self, codes: &[i32]) {
        self.lock().submit_ext_failures.extend(codes);
    }

    pub fn fail_flush(&self, codes: &[i32]) {
        self.lock().flush_failures.extend(codes);
    }

    /// Leaves kicked-off increments pending until [`SimControl::advance`].
    pub fn defer_completion(&self, deferred: bool) {
        self.lock().deferred = deferred;
    }

    pub fn last_submission(&self) -> Option<Submission> {
        self.lock().last.clone()
    }

    pub fn submit_ext_calls(&self) -> u32 {
        self.lock().submit_ext_calls
    }

    pub fn flushes(&self) -> u32 {
        self.lock().flushes
    }

    pub fn set_syncpoint_mask(&self, mask: u32) {
        self.lock().syncpoints = mask;
    }

    pub fn set_waitbase_mask(&self, mask: u32) {
        self.lock().waitbases = mask;
    }

    pub fn priority(&self) -> Option<u32> {
        self.lock().priority
    }

    pub fn timeout_ms(&self) -> Option<u32> {
        self.lock().timeout_ms
    }

    pub fn clock_hz(&self) -> u64 {
        self.lock().clock_hz
    }

    pub fn set_3d_register(&self, offset: u32, value: u32) {
        self.lock().registers_3d.insert(offset, value);
    }

    fn kick(&self, null_kickoff: bool) -> io::Result<u32> {
        let mut state = self.lock();
        let stream = std::mem::take(&mut state.stream);
        let header = match state.header.take() {
            Some(header) => header,
            None if stream.len() >= 16 => SubmitHdrExt {
                syncpt_id: stream_word(&stream, 0),
                syncpt_incrs: stream_word(&stream, 1),
                num_cmdbufs: stream_word(&stream, 2),
                num_relocs: stream_word(&stream, 3),
                submit_version: NVHOST_SUBMIT_VERSION_V0,
                ..SubmitHdrExt::default()
            },
            None => return Err(errno(libc::EINVAL)),
        };
        let deferred = state.deferred;
        state.last = Some(Submission {
            header,
            stream,
            null_kickoff,
        });
        drop(state);
        Ok(self
            .ctrl
            .queue_increments(header.syncpt_id, header.syncpt_incrs, !deferred))
    }
}

impl ChannelIo for SimChannel {
    fn set_nvmap_fd(&self, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }

    fn submit_ext(&self, hdr: &mut SubmitHdrExt) -> io::Result<()> {
        let mut state = self.lock();
        state.submit_ext_calls += 1;
        if let Some(code) = state.submit_ext_failures.pop_front() {
            return Err(errno(code));
        }
        state.header = Some(*hdr);
        state.stream.clear();
        Ok(())
    }

    fn write_stream(&self, bytes: &[u8]) -> io::Result<()> {
        self.lock().stream.extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&self) -> io::Result<u32> {
        {
            let mut state = self.lock();
            state.flushes += 1;
            if let Some(code) = state.flush_failures.pop_front() {
                state.header = None;
                state.stream.clear();
                return Err(errno(code));
            }
        }
        self.kick(false)
    }

    fn null_kickoff(&self) -> io::Result<u32> {
        self.kick(true)
    }

    fn syncpoints(&self) -> io::Result<u32> {
        Ok(self.lock().syncpoints)
    }

    fn waitbases(&self) -> io::Result<u32> {
        Ok(self.lock().waitbases)
    }

    fn modmutexes(&self) -> io::Result<u32> {
        Ok(0x1ff)
    }

    fn timed_out(&self) -> io::Result<u32> {
        Ok(0)
    }

    fn set_timeout(&self, timeout_ms: u32) -> io::Result<()> {
        self.lock().timeout_ms = Some(timeout_ms);
        Ok(())
    }

    fn set_priority(&self, priority: u32) -> io::Result<()> {
        self.lock().priority = Some(priority);
        Ok(())
    }

    fn clk_rate(&self) -> io::Result<u64> {
        Ok(self.lock().clock_hz)
    }

    fn set_clk_rate(&self, rate_hz: u64) -> io::Result<()> {
        self.lock().clock_hz = rate_hz;
        Ok(())
    }

    fn read_3d_reg(&self, offset: u32) -> io::Result<u32> {
        Ok(self.lock().registers_3d.get(&offset).copied().unwrap_or(0))
    }
}
