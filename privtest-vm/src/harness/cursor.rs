/// Append cursor into the result buffer.
///
/// The dispatcher writes through `virt` in whatever address-translation
/// context is live; the trap handler writes through `phys`. Both only ever
/// move together through [`ResultCursor::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultCursor {
    virt: u32,
    phys: u64,
    base: u64,
    capacity: u64,
}

impl ResultCursor {
    /// Cursor at the start of a buffer of `capacity` bytes.
    pub fn new(virt: u32, phys: u64, capacity: u64) -> Self {
        Self {
            virt,
            phys,
            base: phys,
            capacity,
        }
    }

    pub fn virt(&self) -> u32 {
        self.virt
    }

    pub fn phys(&self) -> u64 {
        self.phys
    }

    /// Number of bytes appended since the cursor was created.
    pub fn written(&self) -> u64 {
        self.phys - self.base
    }

    /// No room left for another word.
    pub fn is_full(&self) -> bool {
        self.written() + 4 > self.capacity
    }

    pub fn advance(&mut self, bytes: u32) {
        self.virt = self.virt.wrapping_add(bytes);
        self.phys += u64::from(bytes);
    }

    /// Move the virtual address into the page `target`, keeping the offset
    /// bits selected by `offset_mask`. The physical address is unaffected.
    pub fn rebase_virtual(&mut self, target: u32, offset_mask: u32) {
        self.virt = rebase(self.virt, target, offset_mask);
    }
}

/// Keep the low `offset_mask` bits of `addr` and take the rest from `target`.
pub fn rebase(addr: u32, target: u32, offset_mask: u32) -> u32 {
    (target & !offset_mask) | (addr & offset_mask)
}
