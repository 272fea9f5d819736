use nvhost_rs::HostResult;
use nvhost_rs::host::channel::CommandDescriptor;
use nvhost_rs::host::context;
use nvhost_rs::host::fence::Semaphore;
use nvhost_rs::host::module::ModuleId;
use std::sync::Arc;
use std::time::Duration;

fn main() -> HostResult<()> {
    println!("--- Asynchronous Fence Notification ---");

    let host = context::acquire()?;
    let channel = host.open_channel(&[ModuleId::Gr3d])?;
    let syncpt = channel.get_module_sync_point(ModuleId::Gr3d, 0)?;

    // A null kickoff lets the kernel complete the increments without touching the engine.
    let mut desc = CommandDescriptor::new(syncpt).with_increments(1);
    desc.null_kickoff = true;
    let fence = channel.submit_fence(&desc)?;
    println!("submitted, fence {}:{}", fence.id, fence.value);

    let done = Arc::new(Semaphore::new(0));
    if host.fences().notify_async(fence, done.clone())? {
        println!("fence already reached");
    } else if done.wait_timeout(Duration::from_secs(1)) {
        println!("notified, sync point now {}", host.syncpoints().read(syncpt)?);
    } else {
        eprintln!("timed out waiting for notification");
    }

    drop(channel);
    drop(host);
    context::release();
    Ok(())
}
