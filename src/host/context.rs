use crate::error::{HostError, HostResult};
use crate::host::channel::Channel;
use crate::host::config::HostConfig;
use crate::host::fence::FenceWaiter;
use crate::host::hwctx::switch::ContextSwitcher;
use crate::host::memory::{MemoryArena, MemoryBackend, NvmapBackend};
use crate::host::module::ModuleId;
use crate::host::syncpt::{CtrlBackend, HostControl, SyncPointRegistry};
use crate::nvhost::device::{CtrlDevice, NvmapDevice};
use log::{debug, info};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, PoisonError};

// ===============================================================================================
// Host Structure
// ===============================================================================================

/// Everything a process needs to talk to the host1x driver: the control node, the memory
/// manager, sync point bookkeeping, the fence waiter pool and the context switcher.
pub struct Host {
    config: HostConfig,
    ctrl: Arc<dyn HostControl>,
    /// Kept open for as long as channels may be registered against it.
    nvmap_fd: RawFd,
    arena: Arc<MemoryArena>,
    registry: Arc<SyncPointRegistry>,
    fences: FenceWaiter,
    switcher: ContextSwitcher,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("config", &self.config)
            .field("nvmap_fd", &self.nvmap_fd)
            .field("arena", &self.arena)
            .field("fences", &self.fences)
            .field("switcher", &self.switcher)
            .finish_non_exhaustive()
    }
}

impl Host {
    /// Opens the control and nvmap nodes named by `config`.
    ///
    /// # Errors
    /// `KernelDriverNotFound` if either node cannot be opened.
    pub fn open(config: HostConfig) -> HostResult<Self> {
        let ctrl = CtrlDevice::open(&config.ctrl_node).map_err(|e| {
            HostError::KernelDriverNotFound(format!("{}: {e}", config.ctrl_node.display()))
        })?;
        let nvmap = NvmapDevice::open(&config.nvmap_node).map_err(|e| {
            HostError::KernelDriverNotFound(format!("{}: {e}", config.nvmap_node.display()))
        })?;

        let nvmap_fd = nvmap.as_raw_fd();
        let control = CtrlBackend::new(ctrl, config.syncpt_sysfs_root.clone());
        let memory = NvmapBackend::new(nvmap, &config);
        let host = Self::with_backends(config, Arc::new(control), Arc::new(memory), nvmap_fd)?;
        info!(
            "host1x driver opened ({} / {})",
            host.config.ctrl_node.display(),
            host.config.nvmap_node.display()
        );
        Ok(host)
    }

    /// Assembles a host around already-open backends.
    ///
    /// `nvmap_fd` is handed to every channel opened through [`Host::open_channel`] and must stay
    /// valid for the lifetime of the memory backend.
    ///
    /// # Errors
    /// Fails if the fence waiter threads cannot be spawned.
    pub fn with_backends(
        config: HostConfig,
        ctrl: Arc<dyn HostControl>,
        memory: Arc<dyn MemoryBackend>,
        nvmap_fd: RawFd,
    ) -> HostResult<Self> {
        let arena = Arc::new(MemoryArena::new(memory, &config));
        let registry = Arc::new(SyncPointRegistry::new(Arc::clone(&ctrl)));
        let fences = FenceWaiter::new(
            Arc::clone(&registry),
            config.fence_workers,
            config.fence_overflow,
        )?;
        let switcher = ContextSwitcher::new(&config, Arc::clone(&arena), Arc::clone(&registry));
        Ok(Self {
            config,
            ctrl,
            nvmap_fd,
            arena,
            registry,
            fences,
            switcher,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &HostConfig {
        &self.config
    }

    #[must_use]
    pub fn arena(&self) -> &Arc<MemoryArena> {
        &self.arena
    }

    #[must_use]
    pub fn syncpoints(&self) -> &Arc<SyncPointRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn fences(&self) -> &FenceWaiter {
        &self.fences
    }

    #[must_use]
    pub const fn switcher(&self) -> &ContextSwitcher {
        &self.switcher
    }

    /// Opens a channel for `modules`, the first of which selects the device node.
    ///
    /// # Errors
    /// See [`Channel::open`].
    pub fn open_channel(&self, modules: &[ModuleId]) -> HostResult<Channel> {
        Channel::open(modules, &self.config, Arc::clone(&self.ctrl), self.nvmap_fd)
    }
}

// ===============================================================================================
// Global Singleton Management
// ===============================================================================================

static GLOBAL_HOST: Mutex<Option<Arc<Host>>> = Mutex::new(None);

fn acquire_or_init(init: impl FnOnce() -> HostResult<Host>) -> HostResult<Arc<Host>> {
    let mut guard = GLOBAL_HOST.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(host) = guard.as_ref() {
        return Ok(Arc::clone(host));
    }
    let host = Arc::new(init()?);
    *guard = Some(Arc::clone(&host));
    Ok(host)
}

/// Returns the process-wide host, opening it with [`HostConfig::from_env`] on first use.
///
/// # Errors
/// `KernelDriverNotFound` if the driver nodes are missing.
pub fn acquire() -> HostResult<Arc<Host>> {
    acquire_or_init(|| Host::open(HostConfig::from_env()))
}

/// Like [`acquire`], but opens with `config`. Ignored when the host is already open.
///
/// # Errors
/// `KernelDriverNotFound` if the driver nodes are missing.
pub fn acquire_with(config: HostConfig) -> HostResult<Arc<Host>> {
    acquire_or_init(|| Host::open(config))
}

/// Drops the global reference. The driver nodes close once every outstanding `Arc<Host>` is gone.
pub fn release() {
    if GLOBAL_HOST
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .is_some()
    {
        debug!("global host released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::hwctx::{Engine, SyncIds};
    use crate::host::sim::{SimControl, SimMemory};
    use std::path::PathBuf;

    fn sim_host() -> (Arc<SimControl>, HostResult<Host>) {
        let ctrl = Arc::new(SimControl::new());
        let host = Host::with_backends(
            HostConfig::default().with_fence_pool(1, 4),
            ctrl.clone(),
            Arc::new(SimMemory::new()),
            -1,
        );
        (ctrl, host)
    }

    #[test]
    fn missing_driver_is_reported() {
        let config = HostConfig {
            ctrl_node: PathBuf::from("/nonexistent/nvhost-ctrl"),
            ..HostConfig::default()
        };
        let err = Host::open(config).unwrap_err();
        assert!(matches!(err, HostError::KernelDriverNotFound(_)));
    }

    #[test]
    fn singleton_is_shared_until_released() {
        let first = acquire_or_init(|| sim_host().1).unwrap();
        let second = acquire_or_init(|| panic!("host opened twice")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        release();
        let third = acquire_or_init(|| sim_host().1).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        release();
    }

    #[test]
    fn components_share_one_registry() {
        let (ctrl, host) = sim_host();
        let host = host.unwrap();
        ctrl.set_syncpt(5, 40);
        assert_eq!(host.syncpoints().read(5).unwrap(), 40);

        let ids = SyncIds {
            syncpt: 5,
            waitbase: 1,
        };
        let ctx = host.switcher().alloc_context(Engine::Mpe, ids).unwrap();
        assert_eq!(host.switcher().pool(Engine::Mpe).live_contexts(), 1);
        host.switcher().free_context(ctx).unwrap();
        assert_eq!(host.switcher().pool(Engine::Mpe).live_contexts(), 0);
    }

    #[test]
    fn channel_without_node_is_unsupported() {
        let (_ctrl, host) = sim_host();
        let host = host.unwrap();
        let err = host.open_channel(&[ModuleId::Vde]).unwrap_err();
        assert!(matches!(err, HostError::UnsupportedModule(ModuleId::Vde)));
    }
}
