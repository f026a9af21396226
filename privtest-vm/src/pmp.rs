//! Physical memory protection for an RV32 hart.
//!
//! Four `pmpcfg` registers pack one configuration byte per entry, and each
//! `pmpaddr` register holds bits 33:2 of a physical address. Writes are
//! legalised on the way in (WARL), so a readback shows exactly what the
//! hardware kept.

use crate::csr::Mode;
use crate::mmu::AccessType;

/// Architectural maximum for RV32 with four `pmpcfg` registers.
pub const MAX_PMP_ENTRIES: usize = 16;
pub const PMPCFG_COUNT: usize = MAX_PMP_ENTRIES / 4;

pub const PMP_R: u8 = 1 << 0;
pub const PMP_W: u8 = 1 << 1;
pub const PMP_X: u8 = 1 << 2;
pub const PMP_A_MASK: u8 = 0b11 << 3;
pub const PMP_L: u8 = 1 << 7;

/// Bits of a configuration byte that survive a write. Bits 6:5 are reserved
/// and always read as zero.
pub const PMP_CFG_LEGAL_MASK: u8 = PMP_L | PMP_A_MASK | PMP_X | PMP_W | PMP_R;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMatching {
    Off,
    Tor,
    Na4,
    Napot,
}

impl AddressMatching {
    fn from_cfg(cfg: u8) -> Self {
        match (cfg & PMP_A_MASK) >> 3 {
            0 => AddressMatching::Off,
            1 => AddressMatching::Tor,
            2 => AddressMatching::Na4,
            _ => AddressMatching::Napot,
        }
    }
}

/// Legalise one configuration byte.
///
/// R=0/W=1 is a reserved combination; it is stored with W cleared.
pub fn legalize_cfg(byte: u8) -> u8 {
    let mut cfg = byte & PMP_CFG_LEGAL_MASK;
    if cfg & PMP_W != 0 && cfg & PMP_R == 0 {
        cfg &= !PMP_W;
    }
    cfg
}

pub struct Pmp {
    cfg: [u8; MAX_PMP_ENTRIES],
    addr: [u32; MAX_PMP_ENTRIES],
    entries: usize,
}

impl Pmp {
    /// Create a PMP unit with `entries` implemented entries. Registers of
    /// unimplemented entries read as zero and ignore writes.
    pub fn new(entries: usize) -> Self {
        Self {
            cfg: [0; MAX_PMP_ENTRIES],
            addr: [0; MAX_PMP_ENTRIES],
            entries: entries.min(MAX_PMP_ENTRIES),
        }
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    fn locked(&self, idx: usize) -> bool {
        idx < self.entries && self.cfg[idx] & PMP_L != 0
    }

    /// Read `pmpcfg{reg}`.
    pub fn read_cfg(&self, reg: usize) -> u32 {
        if reg >= PMPCFG_COUNT {
            return 0;
        }
        (0..4).fold(0u32, |acc, byte| {
            acc | (u32::from(self.cfg[reg * 4 + byte]) << (8 * byte))
        })
    }

    /// Write `pmpcfg{reg}`. Locked and unimplemented entries keep their value.
    pub fn write_cfg(&mut self, reg: usize, val: u32) {
        if reg >= PMPCFG_COUNT {
            return;
        }
        for byte in 0..4 {
            let idx = reg * 4 + byte;
            if idx >= self.entries || self.locked(idx) {
                continue;
            }
            self.cfg[idx] = legalize_cfg((val >> (8 * byte)) as u8);
        }
    }

    pub fn read_addr(&self, idx: usize) -> u32 {
        if idx >= self.entries {
            return 0;
        }
        self.addr[idx]
    }

    /// Write `pmpaddr{idx}`. The register is also locked when the next entry
    /// is a locked TOR entry, since it forms that entry's lower bound.
    pub fn write_addr(&mut self, idx: usize, val: u32) {
        if idx >= self.entries || self.locked(idx) {
            return;
        }
        let next = idx + 1;
        if self.locked(next) && AddressMatching::from_cfg(self.cfg[next]) == AddressMatching::Tor {
            return;
        }
        self.addr[idx] = val;
    }

    /// Byte range `[lo, hi)` covered by entry `idx`, or `None` when off.
    fn range(&self, idx: usize) -> Option<(u64, u64)> {
        let cfg = self.cfg[idx];
        let addr = u64::from(self.addr[idx]);
        match AddressMatching::from_cfg(cfg) {
            AddressMatching::Off => None,
            AddressMatching::Tor => {
                let lo = if idx == 0 { 0 } else { u64::from(self.addr[idx - 1]) << 2 };
                Some((lo, addr << 2))
            }
            AddressMatching::Na4 => Some((addr << 2, (addr << 2) + 4)),
            AddressMatching::Napot => {
                let ones = self.addr[idx].trailing_ones();
                // Region size is 2^(ones + 3) bytes.
                let size = 1u64 << (ones + 3);
                let base = (addr & !((1u64 << ones) - 1)) << 2;
                Some((base, base + size))
            }
        }
    }

    /// Check an access of `size` bytes at physical address `pa`.
    ///
    /// The lowest-numbered entry that overlaps the access decides; it must
    /// cover every byte. M-mode is only constrained by locked entries, and
    /// S/U-mode accesses that match nothing fail whenever PMP is implemented.
    pub fn check(&self, pa: u64, size: u32, access: AccessType, mode: Mode) -> bool {
        let end = pa + u64::from(size);
        for idx in 0..self.entries {
            let Some((lo, hi)) = self.range(idx) else {
                continue;
            };
            let overlaps = pa < hi && end > lo;
            if !overlaps {
                continue;
            }
            if pa < lo || end > hi {
                // Partial match always fails.
                return false;
            }
            let cfg = self.cfg[idx];
            if mode == Mode::Machine && cfg & PMP_L == 0 {
                return true;
            }
            let bit = match access {
                AccessType::Instruction => PMP_X,
                AccessType::Load => PMP_R,
                AccessType::Store => PMP_W,
            };
            return cfg & bit != 0;
        }
        mode == Mode::Machine || self.entries == 0
    }
}

impl Default for Pmp {
    fn default() -> Self {
        Self::new(MAX_PMP_ENTRIES)
    }
}
