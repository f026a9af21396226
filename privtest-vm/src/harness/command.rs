//! Trap-response command passed from the dispatcher to the trap handler.
//!
//! The command travels in argument registers so externally generated tables
//! keep working: `a0` carries the action, `a1` the target page base (zero
//! keeps the current page) and `a2` the page class of the current mapping.

use crate::cpu::Hart;
use crate::cpu::types::Mode;

pub const RA: usize = 1;
pub const SP: usize = 2;
pub const T0: usize = 5;
pub const T2: usize = 7;
pub const A0: usize = 10;
pub const A1: usize = 11;
pub const A2: usize = 12;
pub const T3: usize = 28;
pub const T4: usize = 29;
pub const T5: usize = 30;

/// Value preloaded into `t2` so a skipped load or call is visible.
pub const SENTINEL: u32 = 0xBAD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    HaltOk,
    HaltFail,
    EnterMachine,
    EnterSupervisor,
    EnterUser,
    None,
}

impl Action {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Action::HaltOk,
            1 => Action::HaltFail,
            2 => Action::EnterMachine,
            3 => Action::EnterSupervisor,
            4 => Action::EnterUser,
            _ => Action::None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Action::HaltOk => 0,
            Action::HaltFail => 1,
            Action::EnterMachine => 2,
            Action::EnterSupervisor => 3,
            Action::EnterUser => 4,
            Action::None => 5,
        }
    }

    /// Privilege mode an `mret` should land in, if this action changes mode.
    pub fn target_mode(self) -> Option<Mode> {
        match self {
            Action::EnterMachine => Some(Mode::Machine),
            Action::EnterSupervisor => Some(Mode::Supervisor),
            Action::EnterUser => Some(Mode::User),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageClass {
    Kilopage,
    Megapage,
}

impl PageClass {
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(PageClass::Kilopage),
            1 => Some(PageClass::Megapage),
            _ => None,
        }
    }

    /// Number of page-offset bits.
    pub fn offset_bits(self) -> u32 {
        match self {
            PageClass::Kilopage => 12,
            PageClass::Megapage => 22,
        }
    }

    pub fn offset_mask(self) -> u32 {
        (1 << self.offset_bits()) - 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapCommand {
    pub action: u32,
    pub target_vpn: u32,
    pub page_class: u32,
}

impl TrapCommand {
    pub fn read(hart: &Hart) -> Self {
        Self {
            action: hart.read_reg(A0),
            target_vpn: hart.read_reg(A1),
            page_class: hart.read_reg(A2),
        }
    }

    pub fn write(&self, hart: &mut Hart) {
        hart.write_reg(A0, self.action);
        hart.write_reg(A1, self.target_vpn);
        hart.write_reg(A2, self.page_class);
    }

    /// Drop the redirect fields so a stale target is never replayed.
    pub fn clear_redirect(hart: &mut Hart) {
        hart.write_reg(A1, 0);
        hart.write_reg(A2, 0);
    }

    pub fn action(&self) -> Action {
        Action::from_code(self.action)
    }
}
