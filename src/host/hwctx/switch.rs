//! The switch decision taken on every context-carrying submission.
//!
//! A submission names the context it runs in. If another context is live in
//! the engine, its state is saved first; if the incoming context was saved
//! before, its restore sequence runs ahead of the payload. All of it goes to
//! the kernel as one descriptor.

use crate::error::{HostError, HostResult};
use crate::host::channel::{Channel, CmdBuf, CommandDescriptor};
use crate::host::config::HostConfig;
use crate::host::hwctx::gr3d::{self, Gr3dLayout};
use crate::host::hwctx::mpe::MpeLayout;
use crate::host::hwctx::pool::{Context, EngineContextPool};
use crate::host::hwctx::stream::{
    CLASS_HOST1X, REG_INCR_SYNCPT_BASE, REG_WAIT_SYNCPT, SYNCPT_COND_OP_DONE, build_exact,
    incr_syncpt_base, op_set_class, wait_syncpt,
};
use crate::host::hwctx::{Engine, EngineLayout, SyncIds};
use crate::host::memory::{Cacheability, MemoryArena, PinnedBuffer};
use crate::host::syncpt::{Fence, SyncPointRegistry};
use log::{debug, warn};
use std::sync::Arc;
use std::thread;

/// Words of the host-wait sequence executed before the shared save sequence.
const HOST_WAIT_PRE_WORDS: u32 = 7;
/// Words executed after it.
const HOST_WAIT_POST_WORDS: u32 = 6;

/// Class id written over a freed restore buffer so stale submissions fault visibly.
const POISON_CLASS: u32 = 0x333;

/// Host-wait sequence bracketing a save that starts with the sync point at `base`.
///
/// The first part lets the engine drain and waits for it; the second waits for the save to
/// complete and advances the wait base past the save's increments.
fn host_wait_words(class: u32, ids: SyncIds, base: u32, increments: u32) -> HostResult<Vec<u32>> {
    build_exact(|b| {
        b.emit_set_class(class)
            .emit_syncpt_incr(SYNCPT_COND_OP_DONE, ids.syncpt)
            .emit_set_class(CLASS_HOST1X)
            .emit_write(REG_WAIT_SYNCPT, wait_syncpt(ids.syncpt, base.wrapping_add(1)))
            .emit_set_class(class);
        b.emit_set_class(CLASS_HOST1X)
            .emit_write(
                REG_WAIT_SYNCPT,
                wait_syncpt(ids.syncpt, base.wrapping_add(increments)),
            )
            .emit_write(
                REG_INCR_SYNCPT_BASE,
                incr_syncpt_base(ids.waitbase, increments),
            )
            .emit_set_class(class);
        Ok(())
    })
}

const fn cmdbuf(buffer: &PinnedBuffer) -> CmdBuf {
    CmdBuf {
        mem: buffer.handle(),
        offset: 0,
        words: buffer.words(),
    }
}

/// A save queued into the outgoing context by the current submission.
struct PendingSave {
    context: Arc<Context>,
    increments: u32,
    host_wait: Option<PinnedBuffer>,
    host_completes: bool,
}

/// Performs the last increment of the save ending at `fence` once the engine is one short of it.
fn complete_save(registry: &SyncPointRegistry, fence: Fence) {
    let drained = Fence::new(fence.id, fence.value.wrapping_sub(1));
    let result = registry
        .wait_fence(drained, None)
        .and_then(|_| registry.trigger_if_eligible(fence));
    if let Err(e) = result {
        warn!("save ending at {}:{} not completed: {e}", fence.id, fence.value);
    }
}

/// Multiplexes the 3D and encoder engines across client contexts.
#[derive(Debug)]
pub struct ContextSwitcher {
    gr3d: Arc<EngineContextPool>,
    mpe: Arc<EngineContextPool>,
    arena: Arc<MemoryArena>,
    registry: Arc<SyncPointRegistry>,
}

impl ContextSwitcher {
    /// Switcher whose 3D layout follows the configured chip family and save mode.
    #[must_use]
    pub fn new(
        config: &HostConfig,
        arena: Arc<MemoryArena>,
        registry: Arc<SyncPointRegistry>,
    ) -> Self {
        let gr3d = Gr3dLayout::new(gr3d::generation(config.chip), config.queueless);
        Self::with_layouts(Box::new(gr3d), Box::new(MpeLayout::default()), arena, registry)
    }

    #[must_use]
    pub fn with_layouts(
        gr3d: Box<dyn EngineLayout>,
        mpe: Box<dyn EngineLayout>,
        arena: Arc<MemoryArena>,
        registry: Arc<SyncPointRegistry>,
    ) -> Self {
        debug_assert_eq!(gr3d.engine(), Engine::Gr3d);
        debug_assert_eq!(mpe.engine(), Engine::Mpe);
        Self {
            gr3d: Arc::new(EngineContextPool::new(
                gr3d,
                Arc::clone(&arena),
                Arc::clone(&registry),
            )),
            mpe: Arc::new(EngineContextPool::new(
                mpe,
                Arc::clone(&arena),
                Arc::clone(&registry),
            )),
            arena,
            registry,
        }
    }

    #[must_use]
    pub const fn pool(&self, engine: Engine) -> &Arc<EngineContextPool> {
        match engine {
            Engine::Gr3d => &self.gr3d,
            Engine::Mpe => &self.mpe,
        }
    }

    /// Builds the engine's shared buffers ahead of the first context.
    pub fn init(&self, engine: Engine, ids: SyncIds) -> HostResult<()> {
        self.pool(engine).init(ids).map(drop)
    }

    pub fn alloc_context(&self, engine: Engine, ids: SyncIds) -> HostResult<Arc<Context>> {
        self.pool(engine).alloc_context(ids)
    }

    /// Releases a context once the hardware is done saving into it.
    ///
    /// The buffers go away with the last reference; other holders keep them alive.
    ///
    /// # Errors
    /// The wait error if the outstanding save could not be waited for. The context is
    /// released regardless.
    pub fn free_context(&self, ctx: Arc<Context>) -> HostResult<()> {
        let (fence, in_flight) = ctx.take_save();
        let waited = match fence {
            Some(fence) => self.registry.wait_fence(fence, None).map(drop),
            None => Ok(()),
        };
        if let Err(e) = &waited {
            warn!("{:?} context released without its save completing: {e}", ctx.engine());
        }
        drop(in_flight);

        match Arc::into_inner(ctx) {
            Some(ctx) => {
                if cfg!(debug_assertions)
                    && let Err(e) = ctx.restore().write_word(0, op_set_class(POISON_CLASS, 0, 0))
                {
                    debug!("could not poison restore buffer: {e}");
                }
            }
            None => debug!("context still referenced elsewhere, deferring release"),
        }
        waited
    }

    /// Submits `desc` with `ctx` resident in the engine and returns the completion fence.
    ///
    /// Without a context the descriptor goes out unchanged and the live context stays live.
    ///
    /// # Errors
    /// `BadParameter` if the context belongs to another sync point or engine than the
    /// submission, or the wait error if the outgoing context's previous save could not be
    /// waited for. Nothing is submitted on error.
    pub fn submit(
        &self,
        channel: &Channel,
        desc: &CommandDescriptor,
        ctx: Option<&Arc<Context>>,
    ) -> HostResult<Fence> {
        let Some(ctx) = ctx else {
            return channel.submit_fence(desc);
        };
        if ctx.ids().syncpt != desc.syncpt_id {
            return Err(HostError::BadParameter(format!(
                "context uses sync point {} but submission increments {}",
                ctx.ids().syncpt,
                desc.syncpt_id
            )));
        }

        let mut cmdbufs = Vec::with_capacity(desc.cmdbufs.len() + 5);
        let mut extra = 0;
        let mut pending = None;

        match channel.current_context() {
            Some(last) if Arc::ptr_eq(&last, ctx) => {
                cmdbufs.push(cmdbuf(ctx.shared().prepare()));
            }
            Some(last) => {
                if last.engine() != ctx.engine() {
                    return Err(HostError::BadParameter(format!(
                        "{:?} context submitted on a channel running {:?}",
                        ctx.engine(),
                        last.engine()
                    )));
                }
                let save = self.queue_save(&last, desc.syncpt_id, &mut cmdbufs)?;
                extra += save.increments;
                pending = Some(save);
            }
            None => {}
        }

        if ctx.is_valid() {
            cmdbufs.push(cmdbuf(ctx.restore()));
            extra += 1;
        }
        cmdbufs.extend_from_slice(&desc.cmdbufs);

        let combined = CommandDescriptor {
            cmdbufs,
            increments: desc.increments + extra,
            ..desc.clone()
        };
        let value = channel.submit(&combined)?;

        // Past this point the submission is live, so nothing below may fail.
        if let Some(save) = pending {
            let start = value.wrapping_sub(combined.increments);
            let fence = Fence::new(desc.syncpt_id, start.wrapping_add(save.increments));
            // Any retired host-wait buffer belongs to a save already waited for in queue_save.
            let (_, retired) = save.context.mark_saved(fence, save.host_wait);
            drop(retired);
            if save.host_completes {
                self.spawn_save_completion(fence);
            }
        }
        channel.set_current_context(ctx);
        Ok(Fence::new(desc.syncpt_id, value))
    }

    /// Appends the save of `last` and reports the increments it performs.
    fn queue_save(
        &self,
        last: &Arc<Context>,
        syncpt: u32,
        cmdbufs: &mut Vec<CmdBuf>,
    ) -> HostResult<PendingSave> {
        let engine = last.engine();
        let increments = engine.save_increments();
        let save = last.shared().save();
        let layout = self.pool(engine).layout();
        let host_completes = layout.host_completes_save();

        if layout.queueless() {
            let set_address = last
                .set_address()
                .ok_or(HostError::InvalidState("queueless context has no set-address buffer"))?;
            cmdbufs.push(cmdbuf(set_address));
            cmdbufs.push(cmdbuf(save));
            return Ok(PendingSave {
                context: Arc::clone(last),
                increments,
                host_wait: None,
                host_completes,
            });
        }

        // This save replaces the host-wait buffer of the previous one, which must have run.
        if let Some(previous) = last.save_fence() {
            self.registry.wait_fence(previous, None)?;
        }

        let base = self.registry.read_max(syncpt)?;
        let words = host_wait_words(engine.class(), last.ids(), base, increments)?;
        let host_wait = PinnedBuffer::new(&self.arena, &words, Cacheability::Uncached)?;

        if let Some(workaround) = last.workaround() {
            cmdbufs.push(cmdbuf(workaround));
        }
        cmdbufs.push(CmdBuf {
            mem: host_wait.handle(),
            offset: 0,
            words: HOST_WAIT_PRE_WORDS,
        });
        cmdbufs.push(cmdbuf(save));
        cmdbufs.push(CmdBuf {
            mem: host_wait.handle(),
            offset: HOST_WAIT_PRE_WORDS * 4,
            words: HOST_WAIT_POST_WORDS,
        });

        Ok(PendingSave {
            context: Arc::clone(last),
            increments,
            host_wait: Some(host_wait),
            host_completes,
        })
    }

    fn spawn_save_completion(&self, fence: Fence) {
        if matches!(self.registry.is_reached(fence), Ok(true)) {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let spawned = thread::Builder::new()
            .name("context-save".into())
            .spawn(move || complete_save(&registry, fence));
        if let Err(e) = spawned {
            warn!("save completion thread not spawned, completing inline: {e}");
            complete_save(&self.registry, fence);
        }
    }
}
