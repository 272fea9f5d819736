use nvhost_rs::HostResult;
use nvhost_rs::host::context;
use nvhost_rs::nvhost::sysfs;

// Tegra2/3 host1x exposes 32 sync points.
const NUM_SYNCPTS: u32 = 32;

fn main() -> HostResult<()> {
    println!("--- host1x Sync Points ---");

    let host = match context::acquire() {
        Ok(host) => host,
        Err(e) => {
            eprintln!("Error opening host1x (is the nvhost driver loaded?): {e}");
            return Err(e);
        }
    };

    let root = &host.config().syncpt_sysfs_root;
    println!("{:>4} {:>12} {:>12} {:>12}", "id", "value", "max", "sysfs min");
    for id in 0..NUM_SYNCPTS {
        let value = host.syncpoints().read(id)?;
        let max = host.syncpoints().read_max(id)?;
        let min = sysfs::read_syncpt_min(root, id)
            .map_or_else(|_| "-".to_string(), |v| v.to_string());
        let marker = if max != value { " (pending)" } else { "" };
        println!("{id:>4} {value:>12} {max:>12} {min:>12}{marker}");
    }

    drop(host);
    context::release();
    Ok(())
}
