use crate::Trap;
use crate::dram::{Dram, MemoryError};

/// Physical address bus seen by the hart, the page walker and the harness.
///
/// Physical addresses are 34 bits on Sv32, so they travel as `u64`. Fault
/// payloads carry the low 32 bits.
pub trait Bus {
    fn read8(&self, addr: u64) -> Result<u8, Trap>;
    fn read16(&self, addr: u64) -> Result<u16, Trap>;
    fn read32(&self, addr: u64) -> Result<u32, Trap>;

    fn write8(&mut self, addr: u64, val: u8) -> Result<(), Trap>;
    fn write16(&mut self, addr: u64, val: u16) -> Result<(), Trap>;
    fn write32(&mut self, addr: u64, val: u32) -> Result<(), Trap>;

    /// Generic load helper used by the MMU for page-table walks.
    fn load(&self, addr: u64, size: u64) -> Result<u64, Trap> {
        match size {
            1 => self.read8(addr).map(u64::from),
            2 => self.read16(addr).map(u64::from),
            4 => self.read32(addr).map(u64::from),
            _ => Err(Trap::Fatal(format!("Unsupported bus load size: {}", size))),
        }
    }

    /// Generic store helper used by the MMU for page-table A/D updates.
    fn store(&mut self, addr: u64, size: u64, value: u64) -> Result<(), Trap> {
        match size {
            1 => self.write8(addr, value as u8),
            2 => self.write16(addr, value as u16),
            4 => self.write32(addr, value as u32),
            _ => Err(Trap::Fatal(format!("Unsupported bus store size: {}", size))),
        }
    }

    fn fetch_u32(&self, addr: u64) -> Result<u32, Trap> {
        if addr % 4 != 0 {
            return Err(Trap::InstructionAddressMisaligned(addr as u32));
        }
        // Map LoadAccessFault to InstructionAccessFault for fetch
        self.read32(addr).map_err(|e| match e {
            Trap::LoadAccessFault(a) => Trap::InstructionAccessFault(a),
            Trap::LoadAddressMisaligned(a) => Trap::InstructionAddressMisaligned(a),
            _ => e,
        })
    }
}

/// DRAM-only system bus. Anything outside DRAM is an access fault.
pub struct SystemBus {
    pub dram: Dram,
}

impl SystemBus {
    pub fn new(dram_base: u64, dram_size: usize) -> Self {
        Self {
            dram: Dram::new(dram_base, dram_size),
        }
    }

    /// Copy `data` into DRAM at physical address `addr`.
    pub fn load_image(&mut self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        let off = self.dram.offset(addr).ok_or(MemoryError::OutOfBounds(addr))?;
        self.dram.load(data, off as u64)
    }

    /// Read `count` consecutive words starting at physical address `addr`.
    pub fn read_words(&self, addr: u64, count: usize) -> Result<Vec<u32>, Trap> {
        (0..count as u64).map(|i| self.read32(addr + i * 4)).collect()
    }

    fn load_fault(err: MemoryError, addr: u64) -> Trap {
        match err {
            MemoryError::OutOfBounds(_) => Trap::LoadAccessFault(addr as u32),
            MemoryError::InvalidAlignment(_) => Trap::LoadAddressMisaligned(addr as u32),
        }
    }

    fn store_fault(err: MemoryError, addr: u64) -> Trap {
        match err {
            MemoryError::OutOfBounds(_) => Trap::StoreAccessFault(addr as u32),
            MemoryError::InvalidAlignment(_) => Trap::StoreAddressMisaligned(addr as u32),
        }
    }
}

impl Bus for SystemBus {
    fn read8(&self, addr: u64) -> Result<u8, Trap> {
        let off = self.dram.offset(addr).ok_or(Trap::LoadAccessFault(addr as u32))?;
        self.dram.read8(off as u64).map_err(|e| Self::load_fault(e, addr))
    }

    fn read16(&self, addr: u64) -> Result<u16, Trap> {
        let off = self.dram.offset(addr).ok_or(Trap::LoadAccessFault(addr as u32))?;
        self.dram.read16(off as u64).map_err(|e| Self::load_fault(e, addr))
    }

    fn read32(&self, addr: u64) -> Result<u32, Trap> {
        let off = self.dram.offset(addr).ok_or(Trap::LoadAccessFault(addr as u32))?;
        self.dram.read32(off as u64).map_err(|e| Self::load_fault(e, addr))
    }

    fn write8(&mut self, addr: u64, val: u8) -> Result<(), Trap> {
        let off = self.dram.offset(addr).ok_or(Trap::StoreAccessFault(addr as u32))?;
        self.dram.write8(off as u64, val).map_err(|e| Self::store_fault(e, addr))
    }

    fn write16(&mut self, addr: u64, val: u16) -> Result<(), Trap> {
        let off = self.dram.offset(addr).ok_or(Trap::StoreAccessFault(addr as u32))?;
        self.dram.write16(off as u64, val).map_err(|e| Self::store_fault(e, addr))
    }

    fn write32(&mut self, addr: u64, val: u32) -> Result<(), Trap> {
        let off = self.dram.offset(addr).ok_or(Trap::StoreAccessFault(addr as u32))?;
        self.dram.write32(off as u64, val).map_err(|e| Self::store_fault(e, addr))
    }
}
