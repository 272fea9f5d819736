use crate::nvhost::sysfs::SYNCPT_SYSFS_PATH;
use std::env;
use std::path::PathBuf;

/// Chip family driving the generation-specific words of the 3D context switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChipFamily {
    #[default]
    Tegra20,
    Tegra30,
}

/// Runtime configuration for the host subsystem.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Channel nodes are `<device_prefix><module>`, e.g. `/dev/nvhost-gr3d`.
    pub device_prefix: String,
    pub ctrl_node: PathBuf,
    pub nvmap_node: PathBuf,
    pub syncpt_sysfs_root: PathBuf,
    /// Redirect external carve-out requests to the IOVMM heap.
    pub convert_carveout_to_gart: bool,
    pub fence_workers: usize,
    /// Short-lived waiters allowed on top of the workers while all of them are blocked.
    pub fence_overflow: usize,
    /// Prefix of the per-handle shared memory objects backing system-heap mappings.
    pub shm_name_prefix: String,
    pub chip: ChipFamily,
    /// Use the self-synchronizing context save sequence instead of host waits.
    pub queueless: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            device_prefix: "/dev/nvhost-".to_string(),
            ctrl_node: PathBuf::from("/dev/nvhost-ctrl"),
            nvmap_node: PathBuf::from("/dev/nvmap"),
            syncpt_sysfs_root: PathBuf::from(SYNCPT_SYSFS_PATH),
            convert_carveout_to_gart: false,
            fence_workers: 4,
            fence_overflow: 64,
            shm_name_prefix: "/nvmap".to_string(),
            chip: ChipFamily::Tegra20,
            queueless: false,
        }
    }
}

impl HostConfig {
    /// Defaults overridden by `CONVERT_CARVEOUT_TO_GART` and `NVHOST_DEVICE_PREFIX`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if env::var_os("CONVERT_CARVEOUT_TO_GART").is_some() {
            config.convert_carveout_to_gart = true;
        }
        if let Ok(prefix) = env::var("NVHOST_DEVICE_PREFIX") {
            config.device_prefix = prefix;
        }
        config
    }

    /// Full path of the channel node named `node`.
    #[must_use]
    pub fn channel_node(&self, node: &str) -> PathBuf {
        PathBuf::from(format!("{}{node}", self.device_prefix))
    }

    #[must_use]
    pub const fn with_fence_pool(mut self, workers: usize, overflow: usize) -> Self {
        self.fence_workers = workers;
        self.fence_overflow = overflow;
        self
    }

    #[must_use]
    pub const fn with_carveout_to_gart(mut self, convert: bool) -> Self {
        self.convert_carveout_to_gart = convert;
        self
    }

    #[must_use]
    pub const fn with_chip(mut self, chip: ChipFamily, queueless: bool) -> Self {
        self.chip = chip;
        self.queueless = queueless;
        self
    }

    #[must_use]
    pub fn with_syncpt_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.syncpt_sysfs_root = root.into();
        self
    }
}
