//! Addresses of the harness code labels.
//!
//! Table opcodes carry a label's megapage offset. The dispatcher combines it
//! with the megapage of its own `pc`, so only the low 22 bits of a label
//! identify a behaviour.

use std::collections::HashMap;

use super::table::TestOp;
use crate::error::HarnessError;

pub const MEGAPAGE_OFFSET_MASK: u32 = 0x3F_FFFF;

const HANDLER_OFFSET: u32 = 0x100;
const SETUP_OFFSET: u32 = 0x400;
const OPS_OFFSET: u32 = 0x2000;
const OP_STRIDE: u32 = 0x200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeLayout {
    pub trap_handler: u32,
    pub test_setup: u32,
    pub test_loop: u32,
    ops: [u32; TestOp::COUNT],
}

impl CodeLayout {
    /// Default placement of the harness code at the start of DRAM.
    pub fn relative_to(base: u32) -> Self {
        let setup = base.wrapping_add(SETUP_OFFSET);
        let mut ops = [0; TestOp::COUNT];
        for op in TestOp::ALL {
            ops[op.index()] = base
                .wrapping_add(OPS_OFFSET)
                .wrapping_add(OP_STRIDE * op.index() as u32);
        }
        Self {
            trap_handler: base.wrapping_add(HANDLER_OFFSET),
            test_setup: setup,
            test_loop: setup.wrapping_add(8),
            ops,
        }
    }

    /// Label addresses taken from a test image's symbol table.
    pub fn from_symbols(symbols: &HashMap<String, u64>) -> Result<Self, HarnessError> {
        let lookup = |name: &str| {
            symbols
                .get(name)
                .map(|&addr| addr as u32)
                .ok_or_else(|| HarnessError::MissingSymbol(name.to_string()))
        };
        let mut ops = [0; TestOp::COUNT];
        for op in TestOp::ALL {
            ops[op.index()] = lookup(op.label())?;
        }
        Ok(Self {
            trap_handler: lookup("machine_trap_handler")?,
            test_setup: lookup("test_setup")?,
            test_loop: lookup("test_loop")?,
            ops,
        })
    }

    pub fn address_of(&self, op: TestOp) -> u32 {
        self.ops[op.index()]
    }

    /// Behaviour whose label sits at `offset` within its megapage.
    pub fn op_at_offset(&self, offset: u32) -> Option<TestOp> {
        let offset = offset & MEGAPAGE_OFFSET_MASK;
        TestOp::ALL
            .into_iter()
            .find(|&op| self.address_of(op) & MEGAPAGE_OFFSET_MASK == offset)
    }

    /// Absolute jump target for `opcode` as seen from code at `pc`.
    pub fn jump_target(opcode: u32, pc: u32) -> u32 {
        (opcode & MEGAPAGE_OFFSET_MASK) | (pc & !MEGAPAGE_OFFSET_MASK)
    }
}
