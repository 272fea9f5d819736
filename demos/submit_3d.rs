use nvhost_rs::HostResult;
use nvhost_rs::host::channel::CommandDescriptor;
use nvhost_rs::host::context;
use nvhost_rs::host::hwctx::stream::{CLASS_GR3D, SYNCPT_COND_OP_DONE, build_exact};
use nvhost_rs::host::hwctx::{Engine, SyncIds};
use nvhost_rs::host::memory::{Cacheability, PinnedBuffer};
use nvhost_rs::host::module::ModuleId;
use std::time::Duration;

fn main() -> HostResult<()> {
    println!("--- 3D Submission With Context Switching ---");

    let host = context::acquire()?;
    let channel = host.open_channel(&[ModuleId::Gr3d])?;
    let ids = SyncIds {
        syncpt: channel.get_module_sync_point(ModuleId::Gr3d, 0)?,
        waitbase: channel.get_module_wait_base(ModuleId::Gr3d, 0)?,
    };
    println!("sync point {}, wait base {}", ids.syncpt, ids.waitbase);

    // Two clients sharing the engine.
    let first = host.switcher().alloc_context(Engine::Gr3d, ids)?;
    let second = host.switcher().alloc_context(Engine::Gr3d, ids)?;

    let words = build_exact(|b| {
        b.emit_set_class(CLASS_GR3D)
            .emit_syncpt_incr(SYNCPT_COND_OP_DONE, ids.syncpt);
        Ok(())
    })?;
    let cmdbuf = PinnedBuffer::new(host.arena(), &words, Cacheability::WriteCombined)?;
    let desc = CommandDescriptor::new(ids.syncpt)
        .with_cmdbuf(cmdbuf.handle(), 0, cmdbuf.words())
        .with_increments(1);

    for (round, ctx) in [&first, &second, &first].into_iter().enumerate() {
        let fence = host.switcher().submit(&channel, &desc, Some(ctx))?;
        let value = host
            .fences()
            .wait_blocking(fence, Some(Duration::from_secs(1)))?;
        println!("round {round}: fence {}:{} reached at {value}", fence.id, fence.value);
    }

    host.switcher().free_context(first)?;
    host.switcher().free_context(second)?;
    drop(cmdbuf);
    drop(channel);
    drop(host);
    context::release();
    Ok(())
}
