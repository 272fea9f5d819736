//! 3D engine context layout.
//!
//! The save sequence reads every register group back through the host's
//! indirect port. In queueless mode the engine itself writes the restore
//! stream to memory, so the sequence also synchronizes against the wait base
//! instead of relying on host waits around it.

use crate::error::HostResult;
use crate::host::config::ChipFamily;
use crate::host::hwctx::regs::{self, Access, RegisterGroup};
use crate::host::hwctx::stream::{
    CLASS_GR3D, CLASS_HOST1X, CommandStreamBuilder, IndirectDir, MODULE_GR3D, REG_INCR_SYNCPT,
    REG_INCR_SYNCPT_BASE, REG_INDDATA, REG_WAIT_SYNCPT_BASE, SYNCPT_COND_IMMEDIATE,
    SYNCPT_COND_OP_DONE, incr_syncpt, incr_syncpt_base, op_incr, op_nonincr, op_set_class,
    wait_syncpt_base,
};
use crate::host::hwctx::{
    Engine, EngineLayout, SAVE_INDIRECT_FILL, SyncIds, restore_header, save_direct,
};
use std::fmt;

pub const PSEQ_QUAD_ID: u32 = 0x545;
pub const DW_MEMORY_OUTPUT_ADDRESS: u32 = 0x904;
pub const DW_MEMORY_OUTPUT_DATA: u32 = 0x905;
pub const GLOBAL_MEMORY_OUTPUT_READS: u32 = 0xe40;
pub const QRAST_DEBUG: u32 = 0xc18;

/// `READ_DEST` field of `GLOBAL_MEMORY_OUTPUT_READS`, already in position.
const READ_DEST_MEMORY: u32 = 1;
const QRAST_READBACK_FILL: u32 = 0x66;

/// Words ahead of the first register slot in a restore buffer.
pub const RESTORE_HEADER_WORDS: u32 = 5;

pub static GR3D_REGISTERS: &[RegisterGroup] = &[
    RegisterGroup::direct(0xe00, 4),
    RegisterGroup::direct(0xe05, 30),
    RegisterGroup::direct(0xe25, 2),
    RegisterGroup::direct(0xe28, 2),
    RegisterGroup::direct(0x001, 2),
    RegisterGroup::direct(0x00c, 10),
    RegisterGroup::direct(0x100, 34),
    RegisterGroup::direct(0x124, 2),
    RegisterGroup::direct(0x200, 5),
    RegisterGroup::indirect(0x205, 1024),
    RegisterGroup::indirect(0x207, 1024),
    RegisterGroup::direct(0x209, 1),
    RegisterGroup::direct(0x300, 64),
    RegisterGroup::direct(0x343, 25),
    RegisterGroup::direct(0x363, 2),
    RegisterGroup::direct(0x400, 16),
    RegisterGroup::direct(0x411, 1),
    RegisterGroup::direct(0x500, 4),
    RegisterGroup::direct(0x520, 32),
    RegisterGroup::indirect(0x540, 64),
    RegisterGroup::indirect(0x600, 16),
    RegisterGroup::indirect(0x603, 128),
    RegisterGroup::direct(0x608, 4),
    RegisterGroup::direct(0x60e, 1),
    RegisterGroup::indirect(0x700, 64),
    RegisterGroup::direct(0x710, 50),
    RegisterGroup::indirect(0x800, 16),
    RegisterGroup::indirect(0x803, 512),
    RegisterGroup::indirect(0x805, 64),
    RegisterGroup::direct(0x820, 32),
    RegisterGroup::indirect(0x900, 64),
    RegisterGroup::direct(0x902, 2),
    RegisterGroup::direct(0xa02, 10),
    RegisterGroup::direct(0xe04, 1),
];

// ===============================================================================================
// Chip Generations
// ===============================================================================================

/// Generation-specific words of the 3D switch sequences.
///
/// Everything here is a property of one chip family; none of it is derived
/// from the other family.
pub trait Gr3dGeneration: Send + Sync + fmt::Debug {
    fn family(&self) -> ChipFamily;

    /// Register the queueless set-address buffer points at the restore buffer.
    fn output_address_register(&self) -> u32;

    /// Host-class words emitted once before the register groups.
    fn emit_qrast_readback(&self, _b: &mut CommandStreamBuilder) {}

    /// Queueless start, entered and left in 3D class. Performs the first increment.
    fn emit_queueless_preamble(&self, b: &mut CommandStreamBuilder, ids: SyncIds);

    /// Queueless end, entered in 3D class and left in host class.
    fn emit_queueless_tail(&self, b: &mut CommandStreamBuilder, ids: SyncIds);

    /// Whether the queueless save performs all three increments itself. Otherwise the
    /// last one is left to the host once the register reads have drained.
    fn queueless_self_completes(&self) -> bool;

    /// Queueless words that make the engine write a direct group's restore opcode.
    fn emit_direct_capture(&self, _b: &mut CommandStreamBuilder, _group: &RegisterGroup) {}

    /// Queueless words that make the engine write an indirect group's restore opcodes.
    fn emit_indirect_capture(
        &self,
        _b: &mut CommandStreamBuilder,
        _group: &RegisterGroup,
        _data: u32,
    ) {
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Tegra20;

impl Gr3dGeneration for Tegra20 {
    fn family(&self) -> ChipFamily {
        ChipFamily::Tegra20
    }

    fn output_address_register(&self) -> u32 {
        QRAST_DEBUG
    }

    fn emit_qrast_readback(&self, b: &mut CommandStreamBuilder) {
        b.emit_indoff(0, true, MODULE_GR3D, QRAST_DEBUG, IndirectDir::Read)
            .emit_imm(REG_INDDATA, QRAST_READBACK_FILL);
    }

    fn emit_queueless_preamble(&self, b: &mut CommandStreamBuilder, ids: SyncIds) {
        b.emit_syncpt_incr(SYNCPT_COND_OP_DONE, ids.syncpt)
            .emit_set_class(CLASS_HOST1X)
            .emit_write(
                REG_WAIT_SYNCPT_BASE,
                wait_syncpt_base(ids.syncpt, ids.waitbase, 1),
            )
            .emit_set_class(CLASS_GR3D);
    }

    fn emit_queueless_tail(&self, b: &mut CommandStreamBuilder, ids: SyncIds) {
        b.emit_set_class(CLASS_HOST1X).emit_write(
            REG_WAIT_SYNCPT_BASE,
            wait_syncpt_base(ids.syncpt, ids.waitbase, 3),
        );
    }

    fn queueless_self_completes(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Tegra30;

impl Gr3dGeneration for Tegra30 {
    fn family(&self) -> ChipFamily {
        ChipFamily::Tegra30
    }

    fn output_address_register(&self) -> u32 {
        DW_MEMORY_OUTPUT_ADDRESS
    }

    fn emit_queueless_preamble(&self, b: &mut CommandStreamBuilder, ids: SyncIds) {
        b.emit_write(GLOBAL_MEMORY_OUTPUT_READS, READ_DEST_MEMORY)
            .emit_syncpt_incr(SYNCPT_COND_OP_DONE, ids.syncpt);
    }

    fn emit_queueless_tail(&self, b: &mut CommandStreamBuilder, ids: SyncIds) {
        // Written to memory, not executed: lands after the last captured group.
        b.emit_nonincr(DW_MEMORY_OUTPUT_DATA, 2)
            .push(op_nonincr(REG_INCR_SYNCPT, 1))
            .push(incr_syncpt(SYNCPT_COND_OP_DONE, ids.syncpt))
            .emit_set_class(CLASS_HOST1X)
            .emit_syncpt_incr(SYNCPT_COND_IMMEDIATE, ids.syncpt);
    }

    fn queueless_self_completes(&self) -> bool {
        true
    }

    fn emit_direct_capture(&self, b: &mut CommandStreamBuilder, group: &RegisterGroup) {
        b.emit_set_class_masked(CLASS_GR3D, DW_MEMORY_OUTPUT_DATA, 1)
            .emit_incr(group.offset, group.count)
            .emit_set_class(CLASS_HOST1X);
    }

    fn emit_indirect_capture(&self, b: &mut CommandStreamBuilder, group: &RegisterGroup, data: u32) {
        b.emit_set_class(CLASS_GR3D)
            .emit_nonincr(DW_MEMORY_OUTPUT_DATA, 3)
            .push(op_incr(group.offset, 1))
            .push(0)
            .push(op_nonincr(data, group.count))
            .emit_set_class(CLASS_HOST1X);
    }
}

/// Strategy for `family`.
#[must_use]
pub fn generation(family: ChipFamily) -> Box<dyn Gr3dGeneration> {
    match family {
        ChipFamily::Tegra20 => Box::new(Tegra20),
        ChipFamily::Tegra30 => Box::new(Tegra30),
    }
}

// ===============================================================================================
// Layout
// ===============================================================================================

#[derive(Debug)]
pub struct Gr3dLayout {
    generation: Box<dyn Gr3dGeneration>,
    queueless: bool,
    registers: &'static [RegisterGroup],
}

impl Gr3dLayout {
    #[must_use]
    pub fn new(generation: Box<dyn Gr3dGeneration>, queueless: bool) -> Self {
        Self::with_registers(generation, queueless, GR3D_REGISTERS)
    }

    #[must_use]
    pub fn with_registers(
        generation: Box<dyn Gr3dGeneration>,
        queueless: bool,
        registers: &'static [RegisterGroup],
    ) -> Self {
        Self {
            generation,
            queueless,
            registers,
        }
    }

    fn save_indirect(&self, b: &mut CommandStreamBuilder, group: &RegisterGroup, data: u32) {
        if self.queueless {
            self.generation.emit_indirect_capture(b, group, data);
        }
        // Rewind the register file, then stream it out of the data port.
        b.emit_indoff(0xf, true, MODULE_GR3D, group.offset, IndirectDir::Write)
            .emit_write(REG_INDDATA, 0)
            .emit_indoff(0, false, MODULE_GR3D, data, IndirectDir::Read)
            .emit_nonincr(REG_INDDATA, group.count)
            .fill(SAVE_INDIRECT_FILL, group.count);
    }
}

impl EngineLayout for Gr3dLayout {
    fn engine(&self) -> Engine {
        Engine::Gr3d
    }

    fn validate(&self) -> HostResult<()> {
        regs::validate(self.registers)
    }

    fn build_save(&self, b: &mut CommandStreamBuilder, ids: SyncIds) -> HostResult<()> {
        if self.queueless {
            b.emit_set_class(CLASS_GR3D);
            self.generation.emit_queueless_preamble(b, ids);
        }
        // The pipe is already idle here.
        b.emit_syncpt_incr(SYNCPT_COND_IMMEDIATE, ids.syncpt)
            .emit_set_class(CLASS_HOST1X);
        self.generation.emit_qrast_readback(b);

        for group in self.registers.iter().filter(|g| g.is_saved()) {
            match group.access {
                Access::Direct => {
                    if self.queueless {
                        self.generation.emit_direct_capture(b, group);
                    }
                    save_direct(b, MODULE_GR3D, group);
                }
                Access::Indirect { data } => self.save_indirect(b, group, data),
            }
        }
        b.emit_set_class(CLASS_GR3D);

        if self.queueless {
            self.generation.emit_queueless_tail(b, ids);
            b.emit_write(REG_INCR_SYNCPT_BASE, incr_syncpt_base(ids.waitbase, 3))
                .emit_set_class(CLASS_GR3D);
        }
        Ok(())
    }

    fn build_restore(&self, b: &mut CommandStreamBuilder, ids: SyncIds) -> HostResult<()> {
        restore_header(b, CLASS_GR3D, ids);
        b.emit_imm(PSEQ_QUAD_ID, 0);

        for group in self.registers.iter().filter(|g| g.is_restored()) {
            match group.access {
                Access::Direct => {
                    b.emit_incr(group.offset, group.count).fill(0, group.count);
                }
                Access::Indirect { data } => {
                    b.emit_incr(group.offset, 1)
                        .push(0)
                        .emit_nonincr(data, group.count)
                        .fill(0, group.count);
                }
            }
        }

        b.emit_syncpt_incr(SYNCPT_COND_OP_DONE, ids.syncpt);
        Ok(())
    }

    fn queueless(&self) -> bool {
        self.queueless
    }

    fn host_completes_save(&self) -> bool {
        !(self.queueless && self.generation.queueless_self_completes())
    }

    fn set_address(&self, restore_address: u32) -> Vec<u32> {
        vec![
            op_set_class(CLASS_GR3D, 0, 0),
            op_nonincr(self.generation.output_address_register(), 1),
            restore_address + RESTORE_HEADER_WORDS * 4,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HostError;
    use crate::host::hwctx::stream::{REG_INDOFF, build_exact, op_imm};

    const IDS: SyncIds = SyncIds {
        syncpt: 22,
        waitbase: 3,
    };

    static SMALL: &[RegisterGroup] = &[
        RegisterGroup::direct(0x100, 2),
        RegisterGroup::indirect(0x205, 3),
    ];

    fn save(layout: &Gr3dLayout) -> Vec<u32> {
        build_exact(|b| layout.build_save(b, IDS)).unwrap()
    }

    fn restore(layout: &Gr3dLayout) -> Vec<u32> {
        build_exact(|b| layout.build_restore(b, IDS)).unwrap()
    }

    fn gr3d() -> u32 {
        op_set_class(CLASS_GR3D, 0, 0)
    }

    fn host() -> u32 {
        op_set_class(CLASS_HOST1X, 0, 0)
    }

    /// Host-class read-back of `SMALL`, identical for every generation and mode.
    fn small_reads() -> (Vec<u32>, Vec<u32>) {
        let direct = vec![
            op_nonincr(REG_INDOFF, 1),
            (1 << 27) | (6 << 18) | (0x100 << 2) | 1,
            op_nonincr(REG_INDDATA, 2),
            0x77,
            0x77,
        ];
        let indirect = vec![
            op_nonincr(REG_INDOFF, 1),
            (0xf << 28) | (1 << 27) | (6 << 18) | (0x205 << 2),
            op_nonincr(REG_INDDATA, 1),
            0,
            op_nonincr(REG_INDOFF, 1),
            (6 << 18) | (0x206 << 2) | 1,
            op_nonincr(REG_INDDATA, 3),
            0x88,
            0x88,
            0x88,
        ];
        (direct, indirect)
    }

    fn qrast_readback() -> [u32; 3] {
        [
            op_nonincr(REG_INDOFF, 1),
            (1 << 27) | (6 << 18) | (QRAST_DEBUG << 2) | 1,
            op_imm(REG_INDDATA, 0x66),
        ]
    }

    #[test]
    fn tegra20_save_sequence() {
        let words = save(&Gr3dLayout::with_registers(Box::new(Tegra20), false, SMALL));
        let (direct, indirect) = small_reads();
        let mut expected = vec![op_nonincr(0, 1), 22, host()];
        expected.extend(qrast_readback());
        expected.extend(direct);
        expected.extend(indirect);
        expected.push(gr3d());
        assert_eq!(words, expected);
    }

    #[test]
    fn tegra30_save_sequence() {
        let words = save(&Gr3dLayout::with_registers(Box::new(Tegra30), false, SMALL));
        let (direct, indirect) = small_reads();
        let mut expected = vec![op_nonincr(0, 1), 22, host()];
        expected.extend(direct);
        expected.extend(indirect);
        expected.push(gr3d());
        assert_eq!(words, expected);
    }

    #[test]
    fn tegra20_queueless_save_sequence() {
        let words = save(&Gr3dLayout::with_registers(Box::new(Tegra20), true, SMALL));
        let (direct, indirect) = small_reads();
        let mut expected = vec![
            gr3d(),
            op_nonincr(0, 1),
            0x116,
            host(),
            op_nonincr(REG_WAIT_SYNCPT_BASE, 1),
            0x1603_0001,
            gr3d(),
            op_nonincr(0, 1),
            22,
            host(),
        ];
        expected.extend(qrast_readback());
        expected.extend(direct);
        expected.extend(indirect);
        expected.extend([
            gr3d(),
            host(),
            op_nonincr(REG_WAIT_SYNCPT_BASE, 1),
            0x1603_0003,
            op_nonincr(REG_INCR_SYNCPT_BASE, 1),
            0x0300_0003,
            gr3d(),
        ]);
        assert_eq!(words, expected);
    }

    #[test]
    fn tegra30_queueless_save_sequence() {
        let words = save(&Gr3dLayout::with_registers(Box::new(Tegra30), true, SMALL));
        let (direct, indirect) = small_reads();
        let mut expected = vec![
            gr3d(),
            op_nonincr(GLOBAL_MEMORY_OUTPUT_READS, 1),
            1,
            op_nonincr(0, 1),
            0x116,
            op_nonincr(0, 1),
            22,
            host(),
            op_set_class(CLASS_GR3D, DW_MEMORY_OUTPUT_DATA, 1),
            op_incr(0x100, 2),
            host(),
        ];
        expected.extend(direct);
        expected.extend([
            gr3d(),
            op_nonincr(DW_MEMORY_OUTPUT_DATA, 3),
            op_incr(0x205, 1),
            0,
            op_nonincr(0x206, 3),
            host(),
        ]);
        expected.extend(indirect);
        expected.extend([
            gr3d(),
            op_nonincr(DW_MEMORY_OUTPUT_DATA, 2),
            op_nonincr(0, 1),
            0x116,
            host(),
            op_nonincr(0, 1),
            22,
            op_nonincr(REG_INCR_SYNCPT_BASE, 1),
            0x0300_0003,
            gr3d(),
        ]);
        assert_eq!(words, expected);
    }

    #[test]
    fn only_tegra30_queueless_completes_its_own_save() {
        for (family, queueless, host_completes) in [
            (ChipFamily::Tegra20, false, true),
            (ChipFamily::Tegra20, true, true),
            (ChipFamily::Tegra30, false, true),
            (ChipFamily::Tegra30, true, false),
        ] {
            let layout = Gr3dLayout::new(generation(family), queueless);
            assert_eq!(layout.host_completes_save(), host_completes, "{family:?} {queueless}");
        }
    }

    #[test]
    fn restore_layout() {
        let layout = Gr3dLayout::with_registers(Box::new(Tegra20), false, SMALL);
        let words = restore(&layout);
        assert_eq!(
            &words[..5],
            &[
                op_set_class(CLASS_HOST1X, 0, 0),
                op_nonincr(REG_INCR_SYNCPT_BASE, 1),
                0x0300_0001,
                op_set_class(CLASS_GR3D, 0, 0),
                op_imm(PSEQ_QUAD_ID, 0),
            ]
        );
        assert_eq!(words[5], op_incr(0x100, 2));
        assert_eq!(&words[8..11], &[op_incr(0x205, 1), 0, op_nonincr(0x206, 3)]);
        assert_eq!(&words[14..], &[op_nonincr(0, 1), 0x116]);
        assert_eq!(words.len(), 5 + 3 + 6 + 2);
    }

    #[test]
    fn full_table_sizes() {
        let layout = Gr3dLayout::new(Box::new(Tegra20), false);
        layout.validate().unwrap();
        let direct: u32 = GR3D_REGISTERS
            .iter()
            .filter(|g| g.access == Access::Direct)
            .map(|g| g.count + 3)
            .sum();
        let indirect: u32 = GR3D_REGISTERS
            .iter()
            .filter(|g| g.access != Access::Direct)
            .map(|g| g.count + 7)
            .sum();
        assert_eq!(save(&layout).len() as u32, 3 + 3 + direct + indirect + 1);
    }

    #[test]
    fn set_address_targets_first_slot() {
        let t30 = Gr3dLayout::new(Box::new(Tegra30), true);
        assert_eq!(
            t30.set_address(0x1000),
            vec![
                op_set_class(CLASS_GR3D, 0, 0),
                op_nonincr(DW_MEMORY_OUTPUT_ADDRESS, 1),
                0x1014
            ]
        );
        let t20 = Gr3dLayout::new(Box::new(Tegra20), true);
        assert_eq!(t20.set_address(0)[1], op_nonincr(QRAST_DEBUG, 1));
    }

    #[test]
    fn malformed_table_is_rejected() {
        static BAD: &[RegisterGroup] = &[RegisterGroup::direct(0x100, 0)];
        let layout = Gr3dLayout::with_registers(Box::new(Tegra20), false, BAD);
        assert!(matches!(
            layout.validate(),
            Err(HostError::MalformedDescriptor(_))
        ));
    }
}
