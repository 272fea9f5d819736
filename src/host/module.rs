//! Hardware module identities, their channel device nodes, module mutexes and
//! direct register access through the control node.

use crate::error::{HostError, HostResult};
use crate::host::syncpt::HostControl;
use log::debug;
use std::thread;
use std::time::Duration;

/// Hardware units behind the host1x bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleId {
    Host1x,
    /// Display controller, instance 0 or 1.
    Display(u8),
    Gr2d,
    Gr3d,
    Isp,
    Vi,
    Mpe,
    Dsi,
    /// Video decoder. Driven outside host1x channels.
    Vde,
    Hdmi,
}

impl ModuleId {
    /// Name of the channel node serving this module, if it has one.
    #[must_use]
    pub const fn device_node(self) -> Option<&'static str> {
        match self {
            Self::Display(_) => Some("display"),
            Self::Gr2d => Some("gr2d"),
            Self::Gr3d => Some("gr3d"),
            Self::Isp => Some("isp"),
            Self::Vi => Some("vi"),
            Self::Mpe => Some("mpe"),
            Self::Dsi => Some("dsi"),
            Self::Host1x | Self::Vde | Self::Hdmi => None,
        }
    }

    /// Module index understood by the register read/write request.
    #[must_use]
    pub const fn regrdwr_index(self) -> Option<u32> {
        match self {
            Self::Display(0) => Some(0),
            Self::Display(1) => Some(1),
            Self::Vi => Some(2),
            Self::Isp => Some(3),
            Self::Mpe => Some(4),
            _ => None,
        }
    }

    /// Instance number for multi-instance modules, 0 otherwise.
    #[must_use]
    pub const fn instance(self) -> u32 {
        match self {
            Self::Display(i) => i as u32,
            _ => 0,
        }
    }
}

/// Hardware mutexes guarding engines that are not separately channelized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ModuleMutex {
    Gr2dFull = 1,
    Gr2dSimple = 2,
    Gr2dSbA = 3,
    Gr2dSbB = 4,
    Gr3d = 5,
    DisplayA = 6,
    DisplayB = 7,
    Vi = 8,
    Dsi = 9,
}

impl ModuleMutex {
    pub const ALL: [Self; 9] = [
        Self::Gr2dFull,
        Self::Gr2dSimple,
        Self::Gr2dSbA,
        Self::Gr2dSbB,
        Self::Gr3d,
        Self::DisplayA,
        Self::DisplayB,
        Self::Vi,
        Self::Dsi,
    ];

    /// Global mutex id passed to the control node.
    #[must_use]
    pub const fn id(self) -> u32 {
        self as u32
    }

    /// Looks up the mutex at `index` of the static table.
    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

const MUTEX_RETRY_DELAY: Duration = Duration::from_micros(100);

/// Acquires `mutex`, spinning while the hardware reports it busy.
pub fn lock_module_mutex(ctrl: &dyn HostControl, mutex: ModuleMutex) -> HostResult<()> {
    loop {
        match ctrl.module_mutex(mutex.id(), true) {
            Ok(()) => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                debug!("module mutex {mutex:?} busy, retrying");
                thread::sleep(MUTEX_RETRY_DELAY);
            }
            Err(e) => return Err(HostError::ioctl("module mutex lock", e)),
        }
    }
}

pub fn unlock_module_mutex(ctrl: &dyn HostControl, mutex: ModuleMutex) -> HostResult<()> {
    ctrl.module_mutex(mutex.id(), false)
        .map_err(|e| HostError::ioctl("module mutex unlock", e))
}

fn regrdwr_index(module: ModuleId) -> HostResult<u32> {
    module
        .regrdwr_index()
        .ok_or(HostError::UnsupportedModule(module))
}

/// Reads one 32-bit register per entry of `offsets`.
pub fn read_registers(
    ctrl: &dyn HostControl,
    module: ModuleId,
    offsets: &[u32],
) -> HostResult<Vec<u32>> {
    let id = regrdwr_index(module)?;
    let mut values = vec![0u32; offsets.len()];
    ctrl.module_regrdwr(id, offsets, &mut values, 4, false)
        .map_err(|e| HostError::ioctl("module regrdwr", e))?;
    Ok(values)
}

pub fn write_registers(
    ctrl: &dyn HostControl,
    module: ModuleId,
    offsets: &[u32],
    values: &[u32],
) -> HostResult<()> {
    if offsets.len() != values.len() {
        return Err(HostError::BadParameter(format!(
            "{} offsets but {} values",
            offsets.len(),
            values.len()
        )));
    }
    let id = regrdwr_index(module)?;
    let mut values = values.to_vec();
    ctrl.module_regrdwr(id, offsets, &mut values, 4, true)
        .map_err(|e| HostError::ioctl("module regrdwr", e))
}
