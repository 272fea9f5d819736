//! Per-engine shared switch buffers and the contexts that reference them.

#![allow(clippy::cast_possible_truncation)]

use crate::error::{HostError, HostResult};
use crate::host::hwctx::stream::{CommandStreamBuilder, build_exact, op_set_class};
use crate::host::hwctx::{Engine, EngineLayout, SyncIds};
use crate::host::memory::{Cacheability, MemoryArena, PinnedBuffer};
use crate::host::syncpt::{Fence, SyncPointRegistry};
use log::{debug, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// ===============================================================================================
// Shared Buffers
// ===============================================================================================

/// Buffers built once per engine and shared by all of its contexts.
///
/// Read-only after construction.
#[derive(Debug)]
pub struct SharedBuffers {
    save: PinnedBuffer,
    prepare: PinnedBuffer,
    restore_words: u32,
    ids: SyncIds,
}

impl SharedBuffers {
    /// Sequence that reads the live engine state out to the restore buffer of the outgoing context.
    #[must_use]
    pub const fn save(&self) -> &PinnedBuffer {
        &self.save
    }

    /// One-word sequence that puts the channel back in the engine's class.
    #[must_use]
    pub const fn prepare(&self) -> &PinnedBuffer {
        &self.prepare
    }

    #[must_use]
    pub const fn restore_words(&self) -> u32 {
        self.restore_words
    }

    #[must_use]
    pub const fn ids(&self) -> SyncIds {
        self.ids
    }
}

#[derive(Debug, Default)]
struct PoolState {
    shared: Option<Arc<SharedBuffers>>,
    live: usize,
}

// ===============================================================================================
// Engine Pool
// ===============================================================================================

/// Lifecycle owner of one engine's shared buffers.
///
/// `Uninitialized -> Initialized -> contexts alive -> (last context dropped) -> Uninitialized`.
#[derive(Debug)]
pub struct EngineContextPool {
    layout: Box<dyn EngineLayout>,
    arena: Arc<MemoryArena>,
    registry: Arc<SyncPointRegistry>,
    state: Mutex<PoolState>,
}

impl EngineContextPool {
    #[must_use]
    pub fn new(
        layout: Box<dyn EngineLayout>,
        arena: Arc<MemoryArena>,
        registry: Arc<SyncPointRegistry>,
    ) -> Self {
        Self {
            layout,
            arena,
            registry,
            state: Mutex::new(PoolState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn engine(&self) -> Engine {
        self.layout.engine()
    }

    #[must_use]
    pub fn layout(&self) -> &dyn EngineLayout {
        self.layout.as_ref()
    }

    #[must_use]
    pub fn live_contexts(&self) -> usize {
        self.lock().live
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.lock().shared.is_some()
    }

    /// Builds the shared save and prepare buffers unless they already exist.
    ///
    /// # Errors
    /// `MalformedDescriptor` for an unencodable register table, `InvalidState` if the engine
    /// was already initialized against different sync ids, or the arena's allocation errors.
    pub fn init(&self, ids: SyncIds) -> HostResult<Arc<SharedBuffers>> {
        let mut state = self.lock();
        self.init_locked(&mut state, ids)
    }

    fn init_locked(&self, state: &mut PoolState, ids: SyncIds) -> HostResult<Arc<SharedBuffers>> {
        if let Some(shared) = &state.shared {
            if shared.ids != ids {
                return Err(HostError::InvalidState(
                    "engine switch buffers were built for other sync ids",
                ));
            }
            return Ok(Arc::clone(shared));
        }

        self.layout.validate()?;
        let save_words = build_exact(|b| self.layout.build_save(b, ids))?;
        let mut sizing = CommandStreamBuilder::counting();
        self.layout.build_restore(&mut sizing, ids)?;

        let save = PinnedBuffer::new(&self.arena, &save_words, Cacheability::WriteCombined)?;
        let prepare = PinnedBuffer::new(
            &self.arena,
            &[op_set_class(self.engine().class(), 0, 0)],
            Cacheability::WriteCombined,
        )?;
        debug!(
            "{:?}: switch buffers ready (save {} words, restore {} words)",
            self.engine(),
            save.words(),
            sizing.len()
        );

        let shared = Arc::new(SharedBuffers {
            save,
            prepare,
            restore_words: sizing.len() as u32,
            ids,
        });
        state.shared = Some(Arc::clone(&shared));
        Ok(shared)
    }

    /// Creates a context, initializing the engine on first use.
    ///
    /// A failure leaves nothing allocated: partial buffers are released, and so are the shared
    /// buffers when no other context holds them.
    pub fn alloc_context(self: &Arc<Self>, ids: SyncIds) -> HostResult<Arc<Context>> {
        let mut state = self.lock();
        let shared = self.init_locked(&mut state, ids)?;

        match self.context_buffers(ids) {
            Ok((restore, set_address, workaround)) => {
                state.live += 1;
                Ok(Arc::new(Context {
                    pool: Arc::clone(self),
                    shared,
                    restore,
                    set_address,
                    workaround,
                    state: Mutex::new(ContextState::default()),
                }))
            }
            Err(e) => {
                if state.live == 0 {
                    state.shared = None;
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn context_buffers(
        &self,
        ids: SyncIds,
    ) -> HostResult<(PinnedBuffer, Option<PinnedBuffer>, Option<PinnedBuffer>)> {
        let words = build_exact(|b| self.layout.build_restore(b, ids))?;
        let restore = PinnedBuffer::new(&self.arena, &words, Cacheability::WriteCombined)?;

        let set_address = if self.layout.queueless() {
            let words = self.layout.set_address(restore.address());
            Some(PinnedBuffer::new(&self.arena, &words, Cacheability::WriteCombined)?)
        } else {
            None
        };

        let workaround = match self.layout.workaround_words() {
            0 => None,
            n => Some(PinnedBuffer::new(
                &self.arena,
                &vec![0; n as usize],
                Cacheability::WriteCombined,
            )?),
        };

        Ok((restore, set_address, workaround))
    }

    fn release(&self) {
        let mut state = self.lock();
        debug_assert!(state.live > 0, "context count underflow");
        state.live = state.live.saturating_sub(1);
        if state.live == 0 {
            debug!("{:?}: last context gone, releasing switch buffers", self.engine());
            state.shared = None;
        }
    }
}

// ===============================================================================================
// Context
// ===============================================================================================

#[derive(Debug, Default)]
struct ContextState {
    /// The restore buffer holds a complete saved state.
    valid: bool,
    /// Reached once the last save into the restore buffer has finished.
    save_fence: Option<Fence>,
    /// Host-wait sequence referenced by the in-flight save.
    in_flight: Option<PinnedBuffer>,
}

/// One client's saved state for an engine.
///
/// Dropping the last reference releases the private buffers and, for the last context of the
/// engine, the shared ones. An outstanding save is waited for first, since the engine may still
/// be writing into the restore buffer.
#[derive(Debug)]
pub struct Context {
    pool: Arc<EngineContextPool>,
    shared: Arc<SharedBuffers>,
    restore: PinnedBuffer,
    set_address: Option<PinnedBuffer>,
    workaround: Option<PinnedBuffer>,
    state: Mutex<ContextState>,
}

impl Context {
    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn engine(&self) -> Engine {
        self.pool.engine()
    }

    #[must_use]
    pub fn ids(&self) -> SyncIds {
        self.shared.ids
    }

    #[must_use]
    pub fn shared(&self) -> &SharedBuffers {
        &self.shared
    }

    #[must_use]
    pub const fn restore(&self) -> &PinnedBuffer {
        &self.restore
    }

    #[must_use]
    pub const fn set_address(&self) -> Option<&PinnedBuffer> {
        self.set_address.as_ref()
    }

    #[must_use]
    pub const fn workaround(&self) -> Option<&PinnedBuffer> {
        self.workaround.as_ref()
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.lock().valid
    }

    #[must_use]
    pub fn save_fence(&self) -> Option<Fence> {
        self.lock().save_fence
    }

    /// Records a save into this context, keeping `in_flight` alive until the next one.
    ///
    /// Returns the buffer of the previous save so the caller can retire it.
    pub(crate) fn mark_saved(
        &self,
        fence: Fence,
        in_flight: Option<PinnedBuffer>,
    ) -> (Option<Fence>, Option<PinnedBuffer>) {
        let mut state = self.lock();
        state.valid = true;
        let previous = state.save_fence.replace(fence);
        let retired = std::mem::replace(&mut state.in_flight, in_flight);
        (previous, retired)
    }

    /// Takes the save bookkeeping out before the context is released.
    pub(crate) fn take_save(&self) -> (Option<Fence>, Option<PinnedBuffer>) {
        let mut state = self.lock();
        (state.save_fence.take(), state.in_flight.take())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let (fence, in_flight) = self.take_save();
        if let Some(fence) = fence
            && let Err(e) = self.pool.registry.wait_fence(fence, None)
        {
            warn!(
                "{:?} context dropped before save {}:{} completed: {e}",
                self.engine(),
                fence.id,
                fence.value
            );
        }
        drop(in_flight);
        self.pool.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::config::HostConfig;
    use crate::host::hwctx::gr3d::{Gr3dLayout, Tegra30};
    use crate::host::hwctx::mpe::MpeLayout;
    use crate::host::sim::{SimControl, SimMemory};
    use crate::nvhost::ioctl::NVMAP_HEAP_CARVEOUT_GENERIC;
    use std::sync::Barrier;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    const IDS: SyncIds = SyncIds {
        syncpt: 22,
        waitbase: 3,
    };

    fn pool_with_control(
        layout: Box<dyn EngineLayout>,
    ) -> (Arc<SimMemory>, Arc<SimControl>, Arc<EngineContextPool>) {
        let sim = Arc::new(SimMemory::new());
        let ctrl = Arc::new(SimControl::new());
        let arena = Arc::new(MemoryArena::new(sim.clone(), &HostConfig::default()));
        let registry = Arc::new(SyncPointRegistry::new(ctrl.clone()));
        let pool = Arc::new(EngineContextPool::new(layout, arena, registry));
        (sim, ctrl, pool)
    }

    fn pool(layout: Box<dyn EngineLayout>) -> (Arc<SimMemory>, Arc<EngineContextPool>) {
        let (sim, _ctrl, pool) = pool_with_control(layout);
        (sim, pool)
    }

    fn mpe_pool() -> (Arc<SimMemory>, Arc<EngineContextPool>) {
        pool(Box::new(MpeLayout::default()))
    }

    #[test]
    fn concurrent_init_builds_shared_buffers_once() {
        let (sim, pool) = mpe_pool();
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let pool = pool.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    pool.init(IDS).unwrap()
                })
            })
            .collect();
        let shared: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(Arc::ptr_eq(&shared[0], &shared[1]));
        assert_eq!(sim.creates(), 2);
    }

    #[test]
    fn prepare_buffer_is_one_set_class() {
        let (_sim, pool) = mpe_pool();
        let shared = pool.init(IDS).unwrap();
        assert_eq!(shared.prepare().words(), 1);
        assert_eq!(
            shared.prepare().read_word(0).unwrap(),
            op_set_class(Engine::Mpe.class(), 0, 0)
        );
    }

    #[test]
    fn reinit_with_other_ids_is_refused() {
        let (_sim, pool) = mpe_pool();
        pool.init(IDS).unwrap();
        let other = SyncIds {
            syncpt: 23,
            waitbase: 3,
        };
        assert!(matches!(pool.init(other), Err(HostError::InvalidState(_))));
    }

    #[test]
    fn shared_buffers_outlive_all_but_the_last_context() {
        let (sim, pool) = mpe_pool();
        let a = pool.alloc_context(IDS).unwrap();
        let b = pool.alloc_context(IDS).unwrap();
        assert_eq!(pool.live_contexts(), 2);
        assert!(Arc::ptr_eq(&a.shared, &b.shared));

        drop(a);
        assert!(pool.is_initialized());
        assert_eq!(pool.live_contexts(), 1);
        // save + prepare + restore + workaround of b
        assert_eq!(sim.live_handles(), 4);

        drop(b);
        assert!(!pool.is_initialized());
        assert_eq!(sim.live_handles(), 0);
        assert_eq!(sim.pinned_handles(), 0);
    }

    #[test]
    fn alloc_then_free_leaves_counter_unchanged() {
        let (sim, pool) = mpe_pool();
        let keeper = pool.alloc_context(IDS).unwrap();
        let before = pool.live_contexts();
        let ctx = pool.alloc_context(IDS).unwrap();
        drop(ctx);
        assert_eq!(pool.live_contexts(), before);
        drop(keeper);

        let ctx = pool.alloc_context(IDS).unwrap();
        drop(ctx);
        assert_eq!(pool.live_contexts(), 0);
        assert_eq!(sim.live_handles(), 0);
    }

    #[test]
    fn restore_buffer_matches_sized_layout() {
        let (_sim, pool) = mpe_pool();
        let ctx = pool.alloc_context(IDS).unwrap();
        assert_eq!(ctx.restore().words(), ctx.shared().restore_words());
        assert!(ctx.set_address().is_none());
        let workaround = ctx.workaround().unwrap();
        assert_eq!(workaround.words(), 7);
        assert_eq!(workaround.read_word(6).unwrap(), 0);
        assert!(!ctx.is_valid());
    }

    #[test]
    fn queueless_context_points_at_its_restore_buffer() {
        let (_sim, pool) = pool(Box::new(Gr3dLayout::new(Box::new(Tegra30), true)));
        let ctx = pool.alloc_context(IDS).unwrap();
        let set_address = ctx.set_address().unwrap();
        assert_eq!(set_address.words(), 3);
        assert_eq!(
            set_address.read_word(2).unwrap(),
            ctx.restore().address() + 20
        );
        assert!(ctx.workaround().is_none());
    }

    #[test]
    fn failed_first_alloc_releases_everything() {
        let (sim, pool) = mpe_pool();
        pool.init(IDS).unwrap();
        sim.exhaust_heap(NVMAP_HEAP_CARVEOUT_GENERIC);
        assert!(matches!(
            pool.alloc_context(IDS),
            Err(HostError::OutOfMemory)
        ));
        assert!(!pool.is_initialized());
        assert_eq!(pool.live_contexts(), 0);
        assert_eq!(sim.live_handles(), 0);
    }

    #[test]
    fn failed_alloc_keeps_buffers_of_live_contexts() {
        let (sim, pool) = mpe_pool();
        let ctx = pool.alloc_context(IDS).unwrap();
        sim.exhaust_heap(NVMAP_HEAP_CARVEOUT_GENERIC);
        assert!(pool.alloc_context(IDS).is_err());
        assert!(pool.is_initialized());
        assert_eq!(pool.live_contexts(), 1);
        drop(ctx);
        assert_eq!(sim.live_handles(), 0);
    }

    #[test]
    fn mark_saved_retires_previous_save() {
        let (_sim, pool) = mpe_pool();
        let ctx = pool.alloc_context(IDS).unwrap();
        let (prev, retired) = ctx.mark_saved(Fence::new(22, 5), None);
        assert!(prev.is_none() && retired.is_none());
        assert!(ctx.is_valid());
        let (prev, _) = ctx.mark_saved(Fence::new(22, 9), None);
        assert_eq!(prev, Some(Fence::new(22, 5)));
        assert_eq!(ctx.take_save().0, Some(Fence::new(22, 9)));
        assert_eq!(ctx.save_fence(), None);
    }

    #[test]
    fn drop_waits_for_outstanding_save() {
        let (sim, ctrl, pool) = pool_with_control(Box::new(MpeLayout::default()));
        ctrl.set_syncpt(22, 100);
        let ctx = pool.alloc_context(IDS).unwrap();
        let host_wait = PinnedBuffer::new(&pool.arena, &[0; 13], Cacheability::Uncached).unwrap();
        ctx.mark_saved(Fence::new(22, 101), Some(host_wait));

        let (tx, rx) = mpsc::channel();
        let dropper = thread::spawn(move || {
            drop(ctx);
            tx.send(()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(pool.live_contexts(), 1);
        assert!(sim.live_handles() > 0);

        ctrl.advance(22, 1);
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        dropper.join().unwrap();
        assert_eq!(pool.live_contexts(), 0);
        assert_eq!(sim.live_handles(), 0);
    }

    #[test]
    fn drop_releases_even_if_save_wait_fails() {
        let (sim, ctrl, pool) = pool_with_control(Box::new(MpeLayout::default()));
        ctrl.set_syncpt(22, 100);
        let ctx = pool.alloc_context(IDS).unwrap();
        ctx.mark_saved(Fence::new(22, 101), None);
        ctrl.fail_waits(libc::EIO);
        drop(ctx);
        assert_eq!(pool.live_contexts(), 0);
        assert_eq!(sim.live_handles(), 0);
    }
}
