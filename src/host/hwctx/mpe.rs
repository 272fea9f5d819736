//! Video encoder (MPE) context layout.
//!
//! Besides its registers, the encoder keeps rate-control and intra-refresh
//! state in two internal RAMs that are read back one word at a time.

use crate::error::{HostError, HostResult};
use crate::host::hwctx::regs::{self, Access, RegisterGroup};
use crate::host::hwctx::stream::{
    CLASS_HOST1X, CLASS_MPE, CommandStreamBuilder, IndirectDir, MODULE_MPE, REG_INDDATA,
    SYNCPT_COND_OP_DONE,
};
use crate::host::hwctx::{Engine, EngineLayout, SyncIds, restore_header, save_direct};

const RAM_READ_FILL: u32 = 0x99;

/// Zeroed words submitted ahead of every MPE save.
pub const WORKAROUND_WORDS: u32 = 7;

pub static MPE_REGISTERS: &[RegisterGroup] = &[
    RegisterGroup::direct(0x124, 1),
    RegisterGroup::direct(0x123, 1),
    RegisterGroup::direct(0x103, 1),
    RegisterGroup::direct(0x074, 1),
    RegisterGroup::direct(0x021, 1),
    RegisterGroup::direct(0x020, 1),
    RegisterGroup::direct(0x024, 2),
    RegisterGroup::direct(0x0e6, 1),
    RegisterGroup::direct(0x3fc, 1),
    RegisterGroup::direct(0x3d0, 1),
    RegisterGroup::direct(0x3d4, 1),
    RegisterGroup::direct(0x013, 1),
    RegisterGroup::direct(0x022, 1),
    RegisterGroup::direct(0x030, 4),
    RegisterGroup::direct(0x023, 1),
    RegisterGroup::direct(0x070, 3),
    RegisterGroup::direct(0x0a0, 9),
    RegisterGroup::direct(0x071, 1),
    RegisterGroup::direct(0x100, 3),
    RegisterGroup::direct(0x104, 2),
    RegisterGroup::direct(0x108, 9),
    RegisterGroup::direct(0x112, 2),
    RegisterGroup::direct(0x114, 1),
    RegisterGroup::direct(0x110, 1),
    RegisterGroup::direct(0x125, 2),
    RegisterGroup::direct(0x138, 1),
    RegisterGroup::direct(0x140, 1),
    RegisterGroup::direct(0x130, 1),
    RegisterGroup::direct(0x0e4, 1),
    // Frame counters: reset on restore, never read back.
    RegisterGroup::direct(0x0b0, 1).restore_only(),
    RegisterGroup::direct(0x0b4, 1).restore_only(),
];

/// An internal RAM read through a command/data register pair and loaded through another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RamBlock {
    pub read_cmd: u32,
    pub read_data: u32,
    pub load_cmd: u32,
    pub load_data: u32,
    pub words: u32,
}

pub const RC_RAM: RamBlock = RamBlock {
    read_cmd: 0x128,
    read_data: 0x129,
    load_cmd: 0x115,
    load_data: 0x116,
    words: 692,
};

pub const IRFR_RAM: RamBlock = RamBlock {
    read_cmd: 0xcd,
    read_data: 0xce,
    load_cmd: 0xc5,
    load_data: 0xc6,
    words: 408,
};

#[derive(Debug)]
pub struct MpeLayout {
    registers: &'static [RegisterGroup],
    rams: [RamBlock; 2],
}

impl Default for MpeLayout {
    fn default() -> Self {
        Self {
            registers: MPE_REGISTERS,
            rams: [RC_RAM, IRFR_RAM],
        }
    }
}

impl MpeLayout {
    fn save_ram(b: &mut CommandStreamBuilder, ram: &RamBlock) {
        b.emit_set_class(CLASS_HOST1X)
            .emit_indoff(0xf, false, MODULE_MPE, ram.read_cmd, IndirectDir::Write)
            .emit_write(REG_INDDATA, ram.words);
        for _ in 0..ram.words {
            // Each read must be followed by a write for the RAM to advance.
            b.emit_indoff(0, false, MODULE_MPE, ram.read_data, IndirectDir::Read)
                .emit_write(REG_INDDATA, RAM_READ_FILL)
                .emit_indoff(0xf, false, MODULE_MPE, ram.read_data, IndirectDir::Write)
                .emit_write(REG_INDDATA, RAM_READ_FILL);
        }
        b.emit_set_class(CLASS_MPE);
    }

    fn restore_ram(b: &mut CommandStreamBuilder, ram: &RamBlock) {
        b.emit_write(ram.load_cmd, 0);
        for _ in 0..ram.words {
            b.emit_write(ram.load_data, 0);
        }
    }
}

impl EngineLayout for MpeLayout {
    fn engine(&self) -> Engine {
        Engine::Mpe
    }

    fn validate(&self) -> HostResult<()> {
        regs::validate(self.registers)?;
        if self
            .registers
            .iter()
            .any(|g| matches!(g.access, Access::Indirect { .. }))
        {
            return Err(HostError::MalformedDescriptor(
                "MPE has no indirect register files".into(),
            ));
        }
        Ok(())
    }

    fn build_save(&self, b: &mut CommandStreamBuilder, ids: SyncIds) -> HostResult<()> {
        b.emit_set_class(CLASS_HOST1X);
        for group in self.registers.iter().filter(|g| g.is_saved()) {
            save_direct(b, MODULE_MPE, group);
        }
        b.emit_set_class(CLASS_MPE);
        for ram in &self.rams {
            Self::save_ram(b, ram);
        }
        b.emit_syncpt_incr(SYNCPT_COND_OP_DONE, ids.syncpt);
        Ok(())
    }

    fn build_restore(&self, b: &mut CommandStreamBuilder, ids: SyncIds) -> HostResult<()> {
        restore_header(b, CLASS_MPE, ids);
        for group in self.registers.iter().filter(|g| g.is_restored()) {
            b.emit_incr(group.offset, group.count).fill(0, group.count);
        }
        for ram in &self.rams {
            Self::restore_ram(b, ram);
        }
        b.emit_syncpt_incr(SYNCPT_COND_OP_DONE, ids.syncpt);
        Ok(())
    }

    fn workaround_words(&self) -> u32 {
        WORKAROUND_WORDS
    }
}
