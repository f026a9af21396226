use std::collections::HashMap;
use std::ops::{Index, IndexMut};

use super::types::Trap;
use crate::pmp::{PMPCFG_COUNT, Pmp};

pub use super::types::Mode;

/// `sstatus` is a restricted view of `mstatus`: SIE, SPIE, SPP, FS, SUM, MXR.
const SSTATUS_MASK: u32 = (1 << 1) | (1 << 5) | (1 << 8) | (3 << 13) | (1 << 18) | (1 << 19);

/// Compact CSR storage with privilege-aware access helpers. The PMP
/// registers are routed to their own WARL unit.
pub struct CsrFile {
    storage: [u32; 4096],
    pub pmp: Pmp,
}

impl CsrFile {
    pub fn new(pmp_entries: usize) -> Self {
        Self {
            storage: [0; 4096],
            pmp: Pmp::new(pmp_entries),
        }
    }

    pub fn export(&self) -> HashMap<u16, u32> {
        let mut map = HashMap::new();
        for (idx, &val) in self.storage.iter().enumerate() {
            if val != 0 {
                map.insert(idx as u16, val);
            }
        }
        // PMP state lives outside `storage`; fold it in so a snapshot keeps it.
        for reg in 0..PMPCFG_COUNT {
            let val = self.pmp.read_cfg(reg);
            if val != 0 {
                map.insert(CSR_PMPCFG0 + reg as u16, val);
            }
        }
        for idx in 0..self.pmp.entries() {
            let val = self.pmp.read_addr(idx);
            if val != 0 {
                map.insert(CSR_PMPADDR0 + idx as u16, val);
            }
        }
        map
    }

    pub fn import(&mut self, map: &HashMap<u16, u32>) {
        self.storage = [0u32; 4096];
        self.pmp = Pmp::new(self.pmp.entries());
        // Addresses first: a locked TOR cfg would otherwise block them.
        let mut addrs: Vec<_> = map.iter().filter(|(a, _)| is_pmpaddr(**a)).collect();
        addrs.sort();
        for (&addr, &val) in addrs {
            self.pmp.write_addr((addr - CSR_PMPADDR0) as usize, val);
        }
        for (&addr, &val) in map.iter() {
            let idx = addr as usize;
            if is_pmpcfg(addr) {
                self.pmp.write_cfg((addr - CSR_PMPCFG0) as usize, val);
            } else if is_pmpaddr(addr) {
                continue;
            } else if idx < self.storage.len() {
                self.storage[idx] = val;
            }
        }
    }

    pub fn read(&self, addr: u16, mode: Mode) -> Result<u32, Trap> {
        check_privilege(addr, mode)?;

        match addr {
            CSR_SSTATUS => Ok(self.storage[CSR_MSTATUS as usize] & SSTATUS_MASK),
            a if is_pmpcfg(a) => Ok(self.pmp.read_cfg((a - CSR_PMPCFG0) as usize)),
            a if is_pmpaddr(a) => Ok(self.pmp.read_addr((a - CSR_PMPADDR0) as usize)),
            _ => Ok(self.storage[addr as usize]),
        }
    }

    pub fn write(&mut self, addr: u16, val: u32, mode: Mode) -> Result<(), Trap> {
        let read_only = (addr >> 10) & 0x3 == 0x3;
        if read_only {
            return Err(Trap::IllegalInstruction(u32::from(addr)));
        }
        check_privilege(addr, mode)?;

        match addr {
            CSR_SSTATUS => {
                let mstatus = self.storage[CSR_MSTATUS as usize];
                self.storage[CSR_MSTATUS as usize] = (mstatus & !SSTATUS_MASK) | (val & SSTATUS_MASK);
            }
            CSR_MSTATUS => {
                // MPP is WARL; the reserved encoding 0b10 is coerced to M.
                let mpp = Mode::from_mpp(val >> MSTATUS_MPP_SHIFT).to_mpp();
                self.storage[CSR_MSTATUS as usize] =
                    (val & !MSTATUS_MPP_MASK) | (mpp << MSTATUS_MPP_SHIFT);
            }
            CSR_MISA => {}
            a if is_pmpcfg(a) => self.pmp.write_cfg((a - CSR_PMPCFG0) as usize, val),
            a if is_pmpaddr(a) => self.pmp.write_addr((a - CSR_PMPADDR0) as usize, val),
            _ => {
                self.storage[addr as usize] = val;
            }
        }

        Ok(())
    }
}

fn check_privilege(addr: u16, mode: Mode) -> Result<(), Trap> {
    let required_priv = (addr >> 8) & 0x3;
    if mode.privilege_level() < required_priv {
        return Err(Trap::IllegalInstruction(u32::from(addr)));
    }
    Ok(())
}

fn is_pmpcfg(addr: u16) -> bool {
    (CSR_PMPCFG0..CSR_PMPCFG0 + PMPCFG_COUNT as u16).contains(&addr)
}

fn is_pmpaddr(addr: u16) -> bool {
    (CSR_PMPADDR0..=CSR_PMPADDR15).contains(&addr)
}

impl Default for CsrFile {
    fn default() -> Self {
        Self::new(crate::pmp::MAX_PMP_ENTRIES)
    }
}

impl Index<usize> for CsrFile {
    type Output = u32;

    fn index(&self, index: usize) -> &Self::Output {
        &self.storage[index]
    }
}

impl IndexMut<usize> for CsrFile {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.storage[index]
    }
}

// Common CSR addresses used by the privileged architecture.
pub const CSR_SSTATUS: u16 = 0x100;
pub const CSR_SATP: u16 = 0x180;

pub const CSR_MSTATUS: u16 = 0x300;
pub const CSR_MISA: u16 = 0x301;
pub const CSR_MIE: u16 = 0x304;
pub const CSR_MTVEC: u16 = 0x305;
pub const CSR_MSCRATCH: u16 = 0x340;
pub const CSR_MEPC: u16 = 0x341;
pub const CSR_MCAUSE: u16 = 0x342;
pub const CSR_MTVAL: u16 = 0x343;
pub const CSR_MIP: u16 = 0x344;

pub const CSR_PMPCFG0: u16 = 0x3A0;
pub const CSR_PMPADDR0: u16 = 0x3B0;
pub const CSR_PMPADDR15: u16 = 0x3BF;

pub const CSR_MHARTID: u16 = 0xF14;

/// RV32 with the I, S and U extensions.
pub const MISA_RV32ISU: u32 = 0x4014_0100;

pub const MSTATUS_MIE: u32 = 1 << 3;
pub const MSTATUS_MPIE: u32 = 1 << 7;
pub const MSTATUS_MPP_SHIFT: u32 = 11;
pub const MSTATUS_MPP_MASK: u32 = 0b11 << MSTATUS_MPP_SHIFT;
pub const MSTATUS_SUM: u32 = 1 << 18;
pub const MSTATUS_MXR: u32 = 1 << 19;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privilege_bounds() {
        let mut csrs = CsrFile::default();
        assert_eq!(
            csrs.read(CSR_MSTATUS, Mode::Supervisor),
            Err(Trap::IllegalInstruction(u32::from(CSR_MSTATUS)))
        );
        assert!(csrs.write(CSR_SATP, 1, Mode::User).is_err());
        assert!(csrs.write(CSR_SATP, 1, Mode::Supervisor).is_ok());
        assert_eq!(csrs.read(CSR_SATP, Mode::Machine), Ok(1));
    }

    #[test]
    fn test_read_only_csr_write_is_illegal() {
        let mut csrs = CsrFile::default();
        assert!(csrs.write(CSR_MHARTID, 5, Mode::Machine).is_err());
        assert_eq!(csrs.read(CSR_MHARTID, Mode::Machine), Ok(0));
    }

    #[test]
    fn test_sstatus_is_masked_view() {
        let mut csrs = CsrFile::default();
        csrs.write(CSR_MSTATUS, MSTATUS_MIE | MSTATUS_SUM, Mode::Machine).unwrap();
        assert_eq!(csrs.read(CSR_SSTATUS, Mode::Supervisor), Ok(MSTATUS_SUM));
        csrs.write(CSR_SSTATUS, MSTATUS_MXR | MSTATUS_MIE, Mode::Supervisor).unwrap();
        assert_eq!(csrs.read(CSR_MSTATUS, Mode::Machine), Ok(MSTATUS_MIE | MSTATUS_MXR));
    }

    #[test]
    fn test_mpp_reserved_encoding_reads_as_machine() {
        let mut csrs = CsrFile::default();
        csrs.write(CSR_MSTATUS, 0b10 << MSTATUS_MPP_SHIFT, Mode::Machine).unwrap();
        assert_eq!(csrs.read(CSR_MSTATUS, Mode::Machine), Ok(MSTATUS_MPP_MASK));
    }

    #[test]
    fn test_pmp_routing_and_export() {
        let mut csrs = CsrFile::default();
        csrs.write(CSR_PMPADDR0, u32::MAX, Mode::Machine).unwrap();
        csrs.write(CSR_PMPCFG0, 0xFF, Mode::Machine).unwrap();
        assert_eq!(csrs.read(CSR_PMPCFG0, Mode::Machine), Ok(0x9F));
        let map = csrs.export();

        let mut restored = CsrFile::default();
        restored.import(&map);
        assert_eq!(restored.read(CSR_PMPADDR0, Mode::Machine), Ok(u32::MAX));
        assert_eq!(restored.read(CSR_PMPCFG0, Mode::Machine), Ok(0x9F));
    }
}
