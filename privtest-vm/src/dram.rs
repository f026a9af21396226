use thiserror::Error;

/// Base physical address of DRAM on the reference memory map.
pub const DRAM_BASE: u64 = 0x8000_0000;

/// Device-local memory access errors.
///
/// These are mapped into architectural traps (`Trap`) by the system bus.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Out-of-bounds memory access at {0:#x}")]
    OutOfBounds(u64),

    #[error("Invalid or misaligned access at {0:#x}")]
    InvalidAlignment(u64),
}

/// Flat little-endian DRAM backing store.
///
/// Offsets passed to the `read_*`/`write_*` helpers are **offsets from
/// `base`**, not full physical addresses; use [`Dram::offset`] to convert.
pub struct Dram {
    pub base: u64,
    data: Vec<u8>,
}

impl Dram {
    /// Create a new DRAM image of `size` bytes, zero-initialised.
    pub fn new(base: u64, size: usize) -> Self {
        Self {
            base,
            data: vec![0; size],
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Translate a physical address into a DRAM offset, if it falls inside.
    #[inline(always)]
    pub fn offset(&self, addr: u64) -> Option<usize> {
        let off = addr.checked_sub(self.base)?;
        if off < self.data.len() as u64 {
            Some(off as usize)
        } else {
            None
        }
    }

    /// Load data into DRAM at the given offset.
    pub fn load(&mut self, data: &[u8], offset: u64) -> Result<(), MemoryError> {
        self.write_bytes(offset, data)
    }

    fn range(&self, offset: u64, len: usize) -> Result<std::ops::Range<usize>, MemoryError> {
        let start = usize::try_from(offset).map_err(|_| MemoryError::OutOfBounds(offset))?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(MemoryError::OutOfBounds(offset))?;
        Ok(start..end)
    }

    pub fn read_bytes(&self, offset: u64, len: usize) -> Result<&[u8], MemoryError> {
        let range = self.range(offset, len)?;
        Ok(&self.data[range])
    }

    pub fn write_bytes(&mut self, offset: u64, bytes: &[u8]) -> Result<(), MemoryError> {
        let range = self.range(offset, bytes.len())?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read8(&self, offset: u64) -> Result<u8, MemoryError> {
        Ok(self.read_bytes(offset, 1)?[0])
    }

    pub fn read16(&self, offset: u64) -> Result<u16, MemoryError> {
        if offset % 2 != 0 {
            return Err(MemoryError::InvalidAlignment(offset));
        }
        let b = self.read_bytes(offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read32(&self, offset: u64) -> Result<u32, MemoryError> {
        if offset % 4 != 0 {
            return Err(MemoryError::InvalidAlignment(offset));
        }
        let b = self.read_bytes(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn write8(&mut self, offset: u64, val: u8) -> Result<(), MemoryError> {
        self.write_bytes(offset, &[val])
    }

    pub fn write16(&mut self, offset: u64, val: u16) -> Result<(), MemoryError> {
        if offset % 2 != 0 {
            return Err(MemoryError::InvalidAlignment(offset));
        }
        self.write_bytes(offset, &val.to_le_bytes())
    }

    pub fn write32(&mut self, offset: u64, val: u32) -> Result<(), MemoryError> {
        if offset % 4 != 0 {
            return Err(MemoryError::InvalidAlignment(offset));
        }
        self.write_bytes(offset, &val.to_le_bytes())
    }

    /// Fill `count` consecutive words starting at `offset` with `val`.
    pub fn fill_words(&mut self, offset: u64, count: usize, val: u32) -> Result<(), MemoryError> {
        let range = self.range(offset, count * 4)?;
        for chunk in self.data[range].chunks_exact_mut(4) {
            chunk.copy_from_slice(&val.to_le_bytes());
        }
        Ok(())
    }

    /// Clear all of DRAM to zero.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }
}
