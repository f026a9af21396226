use crate::Trap;
use crate::bus::Bus;
use crate::csr::Mode;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessType {
    Instruction,
    Load,
    Store,
}

pub const PAGE_SIZE: u64 = 4096;
const PTE_SIZE: u64 = 4;
const LEVELS: usize = 2;

/// satp.MODE (bit 31) value selecting Sv32.
pub const SATP_MODE_SV32: u32 = 1;
pub const SATP_MODE_SHIFT: u32 = 31;
const SATP_ASID_SHIFT: u32 = 22;
const SATP_ASID_MASK: u32 = 0x1FF;
const SATP_PPN_MASK: u32 = 0x3F_FFFF;

/// TLB size (power of 2 for fast modulo)
const TLB_SIZE: usize = 64;
const TLB_MASK: usize = TLB_SIZE - 1;

/// Permission bit masks for packed perm field
pub const PERM_R: u8 = 1 << 0;
pub const PERM_W: u8 = 1 << 1;
pub const PERM_X: u8 = 1 << 2;
pub const PERM_U: u8 = 1 << 3;
pub const PERM_A: u8 = 1 << 4;
pub const PERM_D: u8 = 1 << 5;
pub const PERM_G: u8 = 1 << 6; // Global mapping bit

// PTE bits
pub const PTE_V: u32 = 1 << 0;
pub const PTE_R: u32 = 1 << 1;
pub const PTE_W: u32 = 1 << 2;
pub const PTE_X: u32 = 1 << 3;
pub const PTE_U: u32 = 1 << 4;
pub const PTE_G: u32 = 1 << 5;
pub const PTE_A: u32 = 1 << 6;
pub const PTE_D: u32 = 1 << 7;
pub const PTE_PPN_SHIFT: u32 = 10;

#[derive(Clone, Copy, Debug)]
pub struct TlbEntry {
    /// Virtual page number (va[31:12])
    pub vpn: u32,
    /// Physical page number of the 4 KiB page (22 bits)
    pub ppn: u64,
    pub asid: u16,
    /// Packed permission bits (R/W/X/U/A/D/G)
    pub perm: u8,
    /// Page level (0 = kilopage, 1 = megapage)
    pub level: u8,
    pub valid: bool,
}

impl TlbEntry {
    pub const EMPTY: Self = Self {
        vpn: 0,
        ppn: 0,
        asid: 0,
        perm: 0,
        level: 0,
        valid: false,
    };

    #[inline(always)]
    pub const fn r(&self) -> bool {
        self.perm & PERM_R != 0
    }

    #[inline(always)]
    pub const fn w(&self) -> bool {
        self.perm & PERM_W != 0
    }

    #[inline(always)]
    pub const fn x(&self) -> bool {
        self.perm & PERM_X != 0
    }

    #[inline(always)]
    pub const fn u(&self) -> bool {
        self.perm & PERM_U != 0
    }

    #[inline(always)]
    pub const fn a(&self) -> bool {
        self.perm & PERM_A != 0
    }

    #[inline(always)]
    pub const fn d(&self) -> bool {
        self.perm & PERM_D != 0
    }

    #[inline(always)]
    pub const fn global(&self) -> bool {
        self.perm & PERM_G != 0
    }
}

impl Default for TlbEntry {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Direct-mapped TLB for Sv32 translations.
pub struct Tlb {
    entries: [TlbEntry; TLB_SIZE],
}

impl Tlb {
    pub fn new() -> Self {
        Self {
            entries: [TlbEntry::EMPTY; TLB_SIZE],
        }
    }

    /// Flush every entry, global mappings included (SFENCE.VMA x0, x0).
    pub fn flush(&mut self) {
        for entry in &mut self.entries {
            entry.valid = false;
        }
    }

    /// Number of live entries; used by tests and trace logging.
    pub fn occupancy(&self) -> usize {
        self.entries.iter().filter(|e| e.valid).count()
    }

    #[inline(always)]
    pub fn lookup(&self, vpn: u32, asid: u16) -> Option<&TlbEntry> {
        let entry = &self.entries[(vpn as usize) & TLB_MASK];
        // Hit if: valid AND VPN matches AND (entry is global OR ASID matches).
        if entry.valid && entry.vpn == vpn && (entry.global() || entry.asid == asid) {
            Some(entry)
        } else {
            None
        }
    }

    /// Insert a TLB entry. Overwrites any existing entry at the same index.
    #[inline(always)]
    pub fn insert(&mut self, entry: TlbEntry) {
        self.entries[(entry.vpn as usize) & TLB_MASK] = entry;
    }
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}

/// Compose a satp value for `mode` (0 = Bare, 1 = Sv32) and root `ppn`.
pub fn satp_value(mode: u32, ppn: u32) -> u32 {
    (mode << SATP_MODE_SHIFT) | (ppn & SATP_PPN_MASK)
}

/// Sv32 translation + A/D bit updates.
///
/// `addr` is a virtual address. Returns the translated physical address or a
/// `Trap` corresponding to the appropriate page/access fault.
pub fn translate(
    bus: &mut dyn Bus,
    tlb: &mut Tlb,
    mode: Mode,
    satp: u32,
    mstatus: u32,
    addr: u32,
    access_type: AccessType,
) -> Result<u64, Trap> {
    // No translation in Machine mode (MPRV is not modelled).
    if mode == Mode::Machine || satp >> SATP_MODE_SHIFT != SATP_MODE_SV32 {
        return Ok(u64::from(addr));
    }

    let asid = ((satp >> SATP_ASID_SHIFT) & SATP_ASID_MASK) as u16;
    let vpn_full = addr >> 12;
    let offset = u64::from(addr & 0xFFF);

    if let Some(entry) = tlb.lookup(vpn_full, asid) {
        if check_permission_tlb(mode, mstatus, entry, access_type)
            && !(access_type == AccessType::Store && !entry.d())
        {
            return Ok((entry.ppn << 12) | offset);
        }
        // Permission failures on a hit are re-checked by a fresh walk so a
        // dirty-bit update can still happen.
    }

    let vpn = [(addr >> 12) & 0x3FF, (addr >> 22) & 0x3FF];
    let root_ppn = u64::from(satp & SATP_PPN_MASK);
    let mut a = root_ppn * PAGE_SIZE;

    for i in (0..LEVELS).rev() {
        let pte_addr = a + u64::from(vpn[i]) * PTE_SIZE;

        let pte = match bus.load(pte_addr, 4) {
            Ok(val) => val as u32,
            Err(_) => return Err(access_fault(access_type, addr)),
        };

        let v = pte & PTE_V;
        let r = pte & PTE_R;
        let w = pte & PTE_W;
        let x = pte & PTE_X;

        // Invalid or malformed.
        if v == 0 || (r == 0 && w != 0) {
            return Err(page_fault(access_type, addr));
        }

        let ppn = u64::from(pte >> PTE_PPN_SHIFT);

        // Pointer to next level if R=X=0.
        if r == 0 && x == 0 {
            if i == 0 {
                return Err(page_fault(access_type, addr));
            }
            a = ppn * PAGE_SIZE;
            continue;
        }

        let mut perm: u8 = 0;
        if r != 0 {
            perm |= PERM_R;
        }
        if w != 0 {
            perm |= PERM_W;
        }
        if x != 0 {
            perm |= PERM_X;
        }
        if pte & PTE_U != 0 {
            perm |= PERM_U;
        }
        if pte & PTE_G != 0 {
            perm |= PERM_G;
        }
        if pte & PTE_A != 0 {
            perm |= PERM_A;
        }
        if pte & PTE_D != 0 {
            perm |= PERM_D;
        }

        let mut entry = TlbEntry {
            vpn: vpn_full,
            ppn,
            asid,
            perm,
            level: i as u8,
            valid: true,
        };

        if !check_permission_tlb(mode, mstatus, &entry, access_type) {
            return Err(page_fault(access_type, addr));
        }

        // A misaligned megapage has nonzero PPN[0].
        if i == 1 && ppn & 0x3FF != 0 {
            return Err(page_fault(access_type, addr));
        }

        let mut new_pte = pte;
        if !entry.a() {
            new_pte |= PTE_A;
            entry.perm |= PERM_A;
        }
        if access_type == AccessType::Store && !entry.d() {
            new_pte |= PTE_D;
            entry.perm |= PERM_D;
        }
        if new_pte != pte && bus.store(pte_addr, 4, u64::from(new_pte)).is_err() {
            return Err(access_fault(access_type, addr));
        }

        // Superpages take PPN[0] from the virtual address.
        let result_ppn = if i == 1 {
            (ppn & !0x3FF) | u64::from(vpn[0])
        } else {
            ppn
        };
        entry.ppn = result_ppn;
        tlb.insert(entry);

        let pa = (result_ppn << 12) | offset;
        if log::log_enabled!(log::Level::Trace) {
            log::trace!(
                "sv32: va=0x{:08x} -> pa=0x{:09x} level={} perm={:#04x}",
                addr,
                pa,
                i,
                entry.perm
            );
        }
        return Ok(pa);
    }

    Err(page_fault(access_type, addr))
}

#[inline(always)]
fn check_permission_tlb(
    mode: Mode,
    mstatus: u32,
    entry: &TlbEntry,
    access_type: AccessType,
) -> bool {
    let mxr = (mstatus >> 19) & 1;
    let sum = (mstatus >> 18) & 1;

    match mode {
        Mode::Supervisor => {
            if entry.u() {
                if access_type == AccessType::Instruction {
                    return false;
                }
                if sum == 0 {
                    return false;
                }
            }
        }
        Mode::User => {
            if !entry.u() {
                return false;
            }
        }
        Mode::Machine => {}
    }

    match access_type {
        AccessType::Instruction => entry.x(),
        AccessType::Store => entry.w(),
        AccessType::Load => entry.r() || (mxr == 1 && entry.x()),
    }
}

#[inline]
fn page_fault(access_type: AccessType, addr: u32) -> Trap {
    match access_type {
        AccessType::Instruction => Trap::InstructionPageFault(addr),
        AccessType::Load => Trap::LoadPageFault(addr),
        AccessType::Store => Trap::StorePageFault(addr),
    }
}

#[inline]
pub fn access_fault(access_type: AccessType, addr: u32) -> Trap {
    match access_type {
        AccessType::Instruction => Trap::InstructionAccessFault(addr),
        AccessType::Load => Trap::LoadAccessFault(addr),
        AccessType::Store => Trap::StoreAccessFault(addr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SystemBus;

    const BASE: u64 = 0x8000_0000;
    const ROOT_PPN: u32 = 0x8000D;
    const LEAF_PPN: u32 = 0x8000E;

    fn pte(ppn: u32, flags: u32) -> u32 {
        (ppn << PTE_PPN_SHIFT) | flags
    }

    fn make_bus() -> SystemBus {
        SystemBus::new(BASE, 1024 * 1024)
    }

    fn root_slot(va: u32) -> u64 {
        (u64::from(ROOT_PPN) << 12) + u64::from(va >> 22) * 4
    }

    fn leaf_slot(va: u32) -> u64 {
        (u64::from(LEAF_PPN) << 12) + u64::from((va >> 12) & 0x3FF) * 4
    }

    fn sv32() -> u32 {
        satp_value(SATP_MODE_SV32, ROOT_PPN)
    }

    #[test]
    fn test_bare_and_machine_are_identity() {
        let mut bus = make_bus();
        let mut tlb = Tlb::new();
        let pa = translate(&mut bus, &mut tlb, Mode::Supervisor, 0, 0, 0x1234, AccessType::Load);
        assert_eq!(pa, Ok(0x1234));
        let pa = translate(&mut bus, &mut tlb, Mode::Machine, sv32(), 0, 0x1234, AccessType::Load);
        assert_eq!(pa, Ok(0x1234));
    }

    #[test]
    fn test_megapage_translation_keeps_22_bit_offset() {
        let mut bus = make_bus();
        let mut tlb = Tlb::new();
        let rwx = PTE_V | PTE_R | PTE_W | PTE_X | PTE_A | PTE_D;
        bus.write32(root_slot(0x0040_0000), pte(0x80000, rwx)).unwrap();
        let pa = translate(
            &mut bus,
            &mut tlb,
            Mode::Supervisor,
            sv32(),
            0,
            0x0041_2344,
            AccessType::Load,
        )
        .unwrap();
        assert_eq!(pa, 0x8001_2344);
    }

    #[test]
    fn test_misaligned_megapage_faults() {
        let mut bus = make_bus();
        let mut tlb = Tlb::new();
        bus.write32(root_slot(0), pte(0x80001, PTE_V | PTE_R | PTE_A)).unwrap();
        let res = translate(&mut bus, &mut tlb, Mode::Supervisor, sv32(), 0, 0x10, AccessType::Load);
        assert_eq!(res, Err(Trap::LoadPageFault(0x10)));
    }

    #[test]
    fn test_kilopage_walk_sets_accessed_and_dirty() {
        let mut bus = make_bus();
        let mut tlb = Tlb::new();
        let va = 0x0000_3008;
        bus.write32(root_slot(va), pte(LEAF_PPN, PTE_V)).unwrap();
        bus.write32(leaf_slot(va), pte(0x80020, PTE_V | PTE_R | PTE_W)).unwrap();
        let pa = translate(&mut bus, &mut tlb, Mode::Supervisor, sv32(), 0, va, AccessType::Store).unwrap();
        assert_eq!(pa, 0x8002_0008);
        let updated = bus.read32(leaf_slot(va)).unwrap();
        assert_eq!(updated & (PTE_A | PTE_D), PTE_A | PTE_D);
        assert_eq!(tlb.occupancy(), 1);
    }

    #[test]
    fn test_user_page_rules() {
        let mut bus = make_bus();
        let mut tlb = Tlb::new();
        let flags = PTE_V | PTE_R | PTE_X | PTE_U | PTE_A | PTE_D;
        bus.write32(root_slot(0), pte(0x80000, flags)).unwrap();
        // S-mode may never execute user pages.
        let res = translate(&mut bus, &mut tlb, Mode::Supervisor, sv32(), 1 << 18, 0x100, AccessType::Instruction);
        assert_eq!(res, Err(Trap::InstructionPageFault(0x100)));
        // S-mode loads from user pages need SUM.
        let res = translate(&mut bus, &mut tlb, Mode::Supervisor, sv32(), 0, 0x100, AccessType::Load);
        assert_eq!(res, Err(Trap::LoadPageFault(0x100)));
        let res = translate(&mut bus, &mut tlb, Mode::Supervisor, sv32(), 1 << 18, 0x100, AccessType::Load);
        assert_eq!(res, Ok(0x8000_0100));
        let res = translate(&mut bus, &mut tlb, Mode::User, sv32(), 0, 0x100, AccessType::Instruction);
        assert_eq!(res, Ok(0x8000_0100));
    }

    #[test]
    fn test_mxr_makes_executable_readable() {
        let mut bus = make_bus();
        let mut tlb = Tlb::new();
        bus.write32(root_slot(0), pte(0x80000, PTE_V | PTE_X | PTE_A)).unwrap();
        let res = translate(&mut bus, &mut tlb, Mode::Supervisor, sv32(), 0, 0x40, AccessType::Load);
        assert_eq!(res, Err(Trap::LoadPageFault(0x40)));
        let res = translate(&mut bus, &mut tlb, Mode::Supervisor, sv32(), 1 << 19, 0x40, AccessType::Load);
        assert_eq!(res, Ok(0x8000_0040));
    }

    #[test]
    fn test_flush_drops_global_entries() {
        let mut bus = make_bus();
        let mut tlb = Tlb::new();
        bus.write32(root_slot(0), pte(0x80000, PTE_V | PTE_R | PTE_G | PTE_A)).unwrap();
        translate(&mut bus, &mut tlb, Mode::Supervisor, sv32(), 0, 0x0, AccessType::Load).unwrap();
        assert_eq!(tlb.occupancy(), 1);
        tlb.flush();
        assert_eq!(tlb.occupancy(), 0);
    }

    #[test]
    fn test_walk_outside_dram_is_access_fault() {
        let mut bus = make_bus();
        let mut tlb = Tlb::new();
        let satp = satp_value(SATP_MODE_SV32, 0x10);
        let res = translate(&mut bus, &mut tlb, Mode::User, satp, 0, 0x2000, AccessType::Store);
        assert_eq!(res, Err(Trap::StoreAccessFault(0x2000)));
    }
}
