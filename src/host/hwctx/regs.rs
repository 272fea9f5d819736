//! Register descriptor tables consumed by the context save/restore builders.

use crate::error::{HostError, HostResult};
use crate::host::hwctx::stream::{MAX_OPCODE_COUNT, MAX_OPCODE_OFFSET};

/// How a register group is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// `count` consecutive registers starting at the group offset.
    Direct,
    /// A register file behind an address register (the group offset) and a data port.
    Indirect { data: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Both,
    SaveOnly,
    RestoreOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterGroup {
    pub offset: u32,
    pub count: u32,
    pub access: Access,
    pub direction: Direction,
}

impl RegisterGroup {
    #[must_use]
    pub const fn direct(offset: u32, count: u32) -> Self {
        Self {
            offset,
            count,
            access: Access::Direct,
            direction: Direction::Both,
        }
    }

    /// Indirect group whose data port sits right after the address register.
    #[must_use]
    pub const fn indirect(offset: u32, count: u32) -> Self {
        Self {
            offset,
            count,
            access: Access::Indirect { data: offset + 1 },
            direction: Direction::Both,
        }
    }

    #[must_use]
    pub const fn restore_only(mut self) -> Self {
        self.direction = Direction::RestoreOnly;
        self
    }

    #[must_use]
    pub const fn save_only(mut self) -> Self {
        self.direction = Direction::SaveOnly;
        self
    }

    #[must_use]
    pub const fn is_saved(&self) -> bool {
        !matches!(self.direction, Direction::RestoreOnly)
    }

    #[must_use]
    pub const fn is_restored(&self) -> bool {
        !matches!(self.direction, Direction::SaveOnly)
    }
}

/// Rejects tables whose entries cannot be encoded into command opcodes.
pub fn validate(table: &[RegisterGroup]) -> HostResult<()> {
    for (i, group) in table.iter().enumerate() {
        let malformed = |what: &str| {
            Err(HostError::MalformedDescriptor(format!(
                "register group {i} at {:#x}: {what}",
                group.offset
            )))
        };
        if group.count == 0 {
            return malformed("empty group");
        }
        if group.count > MAX_OPCODE_COUNT {
            return malformed("count does not fit an opcode");
        }
        if group.offset > MAX_OPCODE_OFFSET {
            return malformed("offset does not fit an opcode");
        }
        if let Access::Direct = group.access
            && group.offset + group.count - 1 > MAX_OPCODE_OFFSET
        {
            return malformed("group runs past the register space");
        }
        if let Access::Indirect { data } = group.access {
            if data == group.offset {
                return malformed("data port aliases the address register");
            }
            if data > MAX_OPCODE_OFFSET {
                return malformed("data port does not fit an opcode");
            }
        }
    }
    Ok(())
}
