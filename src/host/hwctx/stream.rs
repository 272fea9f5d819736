//! Host1x command stream encoding.
//!
//! [`CommandStreamBuilder`] either records words or only counts them, so the
//! same emission code sizes a buffer and then fills it.

#![allow(clippy::cast_possible_truncation)]

use crate::error::{HostError, HostResult};

// ===============================================================================================
// Classes And Host Registers
// ===============================================================================================

pub const CLASS_HOST1X: u32 = 0x01;
pub const CLASS_MPE: u32 = 0x20;
pub const CLASS_GR3D: u32 = 0x60;

/// Register 0 of every class increments a sync point.
pub const REG_INCR_SYNCPT: u32 = 0x00;
pub const REG_WAIT_SYNCPT: u32 = 0x08;
pub const REG_WAIT_SYNCPT_BASE: u32 = 0x09;
pub const REG_INCR_SYNCPT_BASE: u32 = 0x0c;
pub const REG_INDOFF: u32 = 0x2d;
pub const REG_INDDATA: u32 = 0x2e;

/// Sync point increment conditions.
pub const SYNCPT_COND_IMMEDIATE: u32 = 0;
pub const SYNCPT_COND_OP_DONE: u32 = 1;

/// Module ids used by indirect register access.
pub const MODULE_MPE: u32 = 1;
pub const MODULE_GR3D: u32 = 6;

/// Largest count an INCR/NONINCR opcode can carry.
pub const MAX_OPCODE_COUNT: u32 = 0xffff;
/// Largest register offset an opcode can address.
pub const MAX_OPCODE_OFFSET: u32 = 0xfff;

// ===============================================================================================
// Opcodes
// ===============================================================================================

#[must_use]
pub const fn op_set_class(class: u32, offset: u32, mask: u32) -> u32 {
    (offset << 16) | (class << 6) | mask
}

#[must_use]
pub const fn op_incr(offset: u32, count: u32) -> u32 {
    (1 << 28) | (offset << 16) | count
}

#[must_use]
pub const fn op_nonincr(offset: u32, count: u32) -> u32 {
    (2 << 28) | (offset << 16) | count
}

#[must_use]
pub const fn op_imm(offset: u32, value: u32) -> u32 {
    (4 << 28) | (offset << 16) | value
}

// ===============================================================================================
// Host Register Values
// ===============================================================================================

#[must_use]
pub const fn incr_syncpt(cond: u32, id: u32) -> u32 {
    (cond << 8) | id
}

#[must_use]
pub const fn wait_syncpt(id: u32, threshold: u32) -> u32 {
    (id << 24) | (threshold & 0x00ff_ffff)
}

#[must_use]
pub const fn wait_syncpt_base(id: u32, base: u32, offset: u32) -> u32 {
    (id << 24) | (base << 16) | offset
}

#[must_use]
pub const fn incr_syncpt_base(base: u32, offset: u32) -> u32 {
    (base << 24) | offset
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndirectDir {
    Read,
    Write,
}

/// INDOFF value selecting `offset` of `module` for indirect access.
#[must_use]
pub const fn indoff(byte_enables: u32, autoinc: bool, module: u32, offset: u32, dir: IndirectDir) -> u32 {
    let rwn = match dir {
        IndirectDir::Read => 1,
        IndirectDir::Write => 0,
    };
    (byte_enables << 28) | ((autoinc as u32) << 27) | (module << 18) | (offset << 2) | rwn
}

// ===============================================================================================
// Builder
// ===============================================================================================

#[derive(Debug)]
enum Sink {
    Count,
    Emit { words: Vec<u32>, capacity: usize },
}

/// Writer for a flat command word stream.
#[derive(Debug)]
pub struct CommandStreamBuilder {
    sink: Sink,
    len: usize,
}

impl CommandStreamBuilder {
    /// A dry-run builder that only tracks the length.
    #[must_use]
    pub const fn counting() -> Self {
        Self {
            sink: Sink::Count,
            len: 0,
        }
    }

    /// A builder expected to produce exactly `capacity` words.
    #[must_use]
    pub fn emitting(capacity: usize) -> Self {
        Self {
            sink: Sink::Emit {
                words: Vec::with_capacity(capacity),
                capacity,
            },
            len: 0,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, word: u32) -> &mut Self {
        if let Sink::Emit { words, .. } = &mut self.sink {
            words.push(word);
        }
        self.len += 1;
        self
    }

    pub fn extend(&mut self, src: &[u32]) -> &mut Self {
        if let Sink::Emit { words, .. } = &mut self.sink {
            words.extend_from_slice(src);
        }
        self.len += src.len();
        self
    }

    /// Appends `count` copies of `word`.
    pub fn fill(&mut self, word: u32, count: u32) -> &mut Self {
        if let Sink::Emit { words, .. } = &mut self.sink {
            words.resize(words.len() + count as usize, word);
        }
        self.len += count as usize;
        self
    }

    pub fn emit_set_class(&mut self, class: u32) -> &mut Self {
        self.push(op_set_class(class, 0, 0))
    }

    pub fn emit_set_class_masked(&mut self, class: u32, offset: u32, mask: u32) -> &mut Self {
        self.push(op_set_class(class, offset, mask))
    }

    pub fn emit_incr(&mut self, offset: u32, count: u32) -> &mut Self {
        self.push(op_incr(offset, count))
    }

    pub fn emit_nonincr(&mut self, offset: u32, count: u32) -> &mut Self {
        self.push(op_nonincr(offset, count))
    }

    pub fn emit_imm(&mut self, offset: u32, value: u32) -> &mut Self {
        self.push(op_imm(offset, value))
    }

    /// Single-register write: `NONINCR(offset, 1), value`.
    pub fn emit_write(&mut self, offset: u32, value: u32) -> &mut Self {
        self.emit_nonincr(offset, 1).push(value)
    }

    /// Sync point increment through register 0 of the current class.
    pub fn emit_syncpt_incr(&mut self, cond: u32, id: u32) -> &mut Self {
        self.emit_write(REG_INCR_SYNCPT, incr_syncpt(cond, id))
    }

    /// Selects a register for indirect access through the host class.
    pub fn emit_indoff(
        &mut self,
        byte_enables: u32,
        autoinc: bool,
        module: u32,
        offset: u32,
        dir: IndirectDir,
    ) -> &mut Self {
        self.emit_write(REG_INDOFF, indoff(byte_enables, autoinc, module, offset, dir))
    }

    /// Consumes the builder and returns the words.
    ///
    /// # Errors
    /// `MalformedDescriptor` if an emitting builder did not produce exactly its capacity.
    pub fn finish(self) -> HostResult<Vec<u32>> {
        match self.sink {
            Sink::Count => Ok(Vec::new()),
            Sink::Emit { words, capacity } if words.len() == capacity => Ok(words),
            Sink::Emit { words, capacity } => Err(HostError::MalformedDescriptor(format!(
                "command stream sized for {capacity} words produced {}",
                words.len()
            ))),
        }
    }
}

/// Sizes `build` by a dry run, then emits it for real.
pub fn build_exact(
    mut build: impl FnMut(&mut CommandStreamBuilder) -> HostResult<()>,
) -> HostResult<Vec<u32>> {
    let mut dry = CommandStreamBuilder::counting();
    build(&mut dry)?;
    let mut real = CommandStreamBuilder::emitting(dry.len());
    build(&mut real)?;
    real.finish()
}
