//! # Hardware Context Switching
//!
//! Engines shared by several clients keep one client's register and RAM state
//! live at a time. Each engine gets a shared save sequence and a one-word
//! prepare sequence; each client context gets a private restore sequence that
//! the hardware fills in while saving.
//!
//! - [`stream`]: command word encoding and the sizing builder.
//! - [`regs`]: register group descriptors.
//! - [`gr3d`] and [`mpe`]: per-engine save/restore layouts.
//! - [`pool`]: per-engine shared buffers and context lifetime.
//! - [`switch`]: the switch decision made on every submission.

pub mod gr3d;
pub mod mpe;
pub mod pool;
pub mod regs;
pub mod stream;
pub mod switch;

pub use pool::{Context, EngineContextPool};
pub use switch::ContextSwitcher;

use crate::error::HostResult;
use crate::host::hwctx::regs::RegisterGroup;
use crate::host::hwctx::stream::{
    CommandStreamBuilder, IndirectDir, REG_INDDATA, incr_syncpt_base, REG_INCR_SYNCPT_BASE,
    CLASS_GR3D, CLASS_HOST1X, CLASS_MPE,
};
use crate::host::module::ModuleId;
use std::fmt;

/// Filler for direct register slots in a save sequence.
pub(crate) const SAVE_DIRECT_FILL: u32 = 0x77;
/// Filler for indirect register file slots in a save sequence.
pub(crate) const SAVE_INDIRECT_FILL: u32 = 0x88;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Gr3d,
    Mpe,
}

impl Engine {
    #[must_use]
    pub const fn class(self) -> u32 {
        match self {
            Self::Gr3d => CLASS_GR3D,
            Self::Mpe => CLASS_MPE,
        }
    }

    #[must_use]
    pub const fn module(self) -> ModuleId {
        match self {
            Self::Gr3d => ModuleId::Gr3d,
            Self::Mpe => ModuleId::Mpe,
        }
    }

    /// Sync point increments performed by switching a context out.
    #[must_use]
    pub const fn save_increments(self) -> u32 {
        match self {
            Self::Gr3d => 3,
            Self::Mpe => 2,
        }
    }
}

/// Sync point and wait base the engine's switch sequences are built against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncIds {
    pub syncpt: u32,
    pub waitbase: u32,
}

/// Save/restore sequence generator for one engine.
pub trait EngineLayout: Send + Sync + fmt::Debug {
    fn engine(&self) -> Engine;

    /// Checks the register tables can be encoded.
    fn validate(&self) -> HostResult<()>;

    fn build_save(&self, b: &mut CommandStreamBuilder, ids: SyncIds) -> HostResult<()>;

    fn build_restore(&self, b: &mut CommandStreamBuilder, ids: SyncIds) -> HostResult<()>;

    /// Whether saving needs a per-context buffer pointing the engine at the restore buffer.
    fn queueless(&self) -> bool {
        false
    }

    /// Words of that per-context buffer, for a restore buffer at `restore_address`.
    fn set_address(&self, _restore_address: u32) -> Vec<u32> {
        Vec::new()
    }

    /// Whether the last save increment is left to the host, to be performed once the
    /// sync point sits one below the save fence.
    fn host_completes_save(&self) -> bool {
        false
    }

    /// Size of the zeroed per-context workaround buffer submitted ahead of a save.
    fn workaround_words(&self) -> u32 {
        0
    }
}

/// Reads a directly addressed group back through the host's indirect port.
pub(crate) fn save_direct(b: &mut CommandStreamBuilder, module: u32, group: &RegisterGroup) {
    b.emit_indoff(0, true, module, group.offset, IndirectDir::Read)
        .emit_nonincr(REG_INDDATA, group.count)
        .fill(SAVE_DIRECT_FILL, group.count);
}

/// Restore header shared by all engines: bump the wait base, then return to `class`.
pub(crate) fn restore_header(b: &mut CommandStreamBuilder, class: u32, ids: SyncIds) {
    b.emit_set_class(CLASS_HOST1X)
        .emit_write(REG_INCR_SYNCPT_BASE, incr_syncpt_base(ids.waitbase, 1))
        .emit_set_class(class);
}
