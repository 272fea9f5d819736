use std::fs;
use std::io;
use std::path::Path;

pub const SYNCPT_SYSFS_PATH: &str = "/sys/bus/nvhost/devices/host1x/syncpt";

fn read_u32(path: &Path) -> io::Result<u32> {
    let content = fs::read_to_string(path)?;
    content.trim().parse::<u32>().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to parse {}", path.display()),
        )
    })
}

/// Reads the highest value sync point `id` is expected to reach once queued work drains.
pub fn read_syncpt_max(root: &Path, id: u32) -> io::Result<u32> {
    read_u32(&root.join(id.to_string()).join("max"))
}

/// Reads the current (minimum) value of sync point `id` as exported by sysfs.
pub fn read_syncpt_min(root: &Path, id: u32) -> io::Result<u32> {
    read_u32(&root.join(id.to_string()).join("min"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nvhost-sysfs-{tag}-{}", std::process::id()));
        fs::create_dir_all(dir.join("22")).unwrap();
        dir
    }

    #[test]
    fn reads_max_and_min() {
        let root = scratch_root("ok");
        fs::write(root.join("22").join("max"), "1042\n").unwrap();
        fs::write(root.join("22").join("min"), "1040\n").unwrap();
        assert_eq!(read_syncpt_max(&root, 22).unwrap(), 1042);
        assert_eq!(read_syncpt_min(&root, 22).unwrap(), 1040);
        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn garbage_is_invalid_data() {
        let root = scratch_root("bad");
        fs::write(root.join("22").join("max"), "nope").unwrap();
        let err = read_syncpt_max(&root, 22).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(
            read_syncpt_max(&root, 7).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
        fs::remove_dir_all(root).unwrap();
    }
}
