use crate::bus::Bus;
use crate::mmu::{self, AccessType as MmuAccessType, Tlb};
use crate::pmp::Pmp;
use std::collections::HashMap;

use super::csr::{
    CSR_MCAUSE, CSR_MEPC, CSR_MIE, CSR_MIP, CSR_MISA, CSR_MSTATUS, CSR_MTVAL, CSR_MTVEC,
    CSR_SATP, CsrFile, MISA_RV32ISU, MSTATUS_MIE, MSTATUS_MPIE, MSTATUS_MPP_MASK,
    MSTATUS_MPP_SHIFT,
};
use super::decoder::Op;
use super::types::{Mode, Trap, Width};

/// Cached decode result keyed by physical address.
type DecodeCacheEntry = (u64, Op);

/// Cache size (power of 2 for fast modulo)
const DECODE_CACHE_SIZE: usize = 256;
const DECODE_CACHE_MASK: usize = DECODE_CACHE_SIZE - 1;

pub const MIP_SSIP: u32 = 1 << 1;
pub const MIP_MSIP: u32 = 1 << 3;
pub const MIP_STIP: u32 = 1 << 5;
pub const MIP_MTIP: u32 = 1 << 7;
pub const MIP_SEIP: u32 = 1 << 9;
pub const MIP_MEIP: u32 = 1 << 11;

/// A single RV32 hart: integer registers, privilege state and translation
/// caches. Memory lives behind the `Bus` passed to each access.
pub struct Hart {
    pub regs: [u32; 32],
    pub pc: u32,
    /// CSR storage (12-bit CSR address space) plus the PMP unit.
    pub(crate) csrs: CsrFile,
    /// Current privilege mode (Machine/Supervisor/User).
    pub mode: Mode,
    /// Per-hart TLB for Sv32 translation.
    pub tlb: Tlb,
    /// Instruction decode cache.
    /// Key: pa & DECODE_CACHE_MASK
    /// Value: Some((full_pa, decoded_op)) or None
    decode_cache: [Option<DecodeCacheEntry>; DECODE_CACHE_SIZE],
}

impl Hart {
    /// Create a hart in Machine mode at `pc` with `pmp_entries` PMP entries.
    pub fn new(pc: u32, pmp_entries: usize) -> Self {
        let mut csrs = CsrFile::new(pmp_entries);
        csrs[CSR_MISA as usize] = MISA_RV32ISU;

        Self {
            regs: [0; 32],
            pc,
            csrs,
            mode: Mode::Machine,
            tlb: Tlb::new(),
            decode_cache: [None; DECODE_CACHE_SIZE],
        }
    }

    /// Export the current CSR image into a compact map suitable for
    /// serialization in snapshots.
    pub fn export_csrs(&self) -> HashMap<u16, u32> {
        self.csrs.export()
    }

    /// Restore CSRs from a previously exported map.
    ///
    /// Any CSR not present in the map is reset to 0. Translation and decode
    /// caches are dropped since they may no longer match.
    pub fn import_csrs(&mut self, map: &HashMap<u16, u32>) {
        self.csrs.import(map);
        self.tlb.flush();
        self.invalidate_decode_cache();
    }

    pub fn pmp(&self) -> &Pmp {
        &self.csrs.pmp
    }

    /// Look up an instruction in the decode cache.
    #[inline]
    pub(super) fn decode_cache_lookup(&self, pa: u64) -> Option<Op> {
        let idx = (pa >> 2) as usize & DECODE_CACHE_MASK;
        match self.decode_cache[idx] {
            Some((cached_pa, op)) if cached_pa == pa => Some(op),
            _ => None,
        }
    }

    #[inline]
    pub(super) fn decode_cache_insert(&mut self, pa: u64, op: Op) {
        let idx = (pa >> 2) as usize & DECODE_CACHE_MASK;
        self.decode_cache[idx] = Some((pa, op));
    }

    /// Invalidate entire decode cache.
    pub fn invalidate_decode_cache(&mut self) {
        self.decode_cache = [None; DECODE_CACHE_SIZE];
    }

    pub fn read_reg(&self, reg: usize) -> u32 {
        if reg == 0 { 0 } else { self.regs[reg] }
    }

    pub fn write_reg(&mut self, reg: usize, val: u32) {
        if reg != 0 {
            self.regs[reg] = val;
        }
    }

    pub fn read_csr(&self, addr: u16) -> Result<u32, Trap> {
        self.csrs.read(addr, self.mode)
    }

    /// `csrrw` with `rd = x0`. Cached translations survive a satp write
    /// until the next `sfence_vma`.
    pub fn write_csr(&mut self, addr: u16, val: u32) -> Result<(), Trap> {
        self.csrs.write(addr, val, self.mode)
    }

    /// `csrrs` with `rd = x0`.
    pub fn set_csr_bits(&mut self, addr: u16, mask: u32) -> Result<(), Trap> {
        let old = self.read_csr(addr)?;
        self.write_csr(addr, old | mask)
    }

    /// `csrrc` with `rd = x0`.
    pub fn clear_csr_bits(&mut self, addr: u16, mask: u32) -> Result<(), Trap> {
        let old = self.read_csr(addr)?;
        self.write_csr(addr, old & !mask)
    }

    /// Machine trap entry. Returns the `mcause` value written, or `None` for
    /// host-only errors that bypass architectural trap entry.
    pub fn enter_trap(&mut self, trap: &Trap, pc: u32) -> Option<u32> {
        let (is_interrupt, cause, tval) = trap.cause_tval()?;
        let mcause = trap.mcause()?;

        // Save faulting PC and tval.
        self.csrs[CSR_MEPC as usize] = pc;
        self.csrs[CSR_MTVAL as usize] = tval;
        self.csrs[CSR_MCAUSE as usize] = mcause;

        // Update mstatus: MPP, MPIE, clear MIE
        let mut mstatus = self.csrs[CSR_MSTATUS as usize];
        let mie = (mstatus >> 3) & 1;
        // MPIE <= MIE, MIE <= 0
        mstatus = (mstatus & !MSTATUS_MPIE) | (mie << 7);
        mstatus &= !MSTATUS_MIE;
        // MPP <= current mode.
        mstatus = (mstatus & !MSTATUS_MPP_MASK) | (self.mode.to_mpp() << MSTATUS_MPP_SHIFT);
        self.csrs[CSR_MSTATUS as usize] = mstatus;
        self.mode = Mode::Machine;

        // Set PC to mtvec (vectored if interrupt and mode==1)
        let mtvec = self.csrs[CSR_MTVEC as usize];
        let base = mtvec & !0b11;
        let vectored = mtvec & 0b11 == 1;
        self.pc = if is_interrupt && vectored {
            base.wrapping_add(4 * cause)
        } else {
            base
        };

        if log::log_enabled!(log::Level::Trace) {
            log::trace!(
                "trap entry: mcause=0x{:08x} mepc=0x{:08x} mtval=0x{:08x} mstatus=0x{:08x}",
                mcause,
                pc,
                tval,
                mstatus
            );
        }
        Some(mcause)
    }

    /// `mret`: mode := MPP, MIE := MPIE, MPIE := 1, MPP := U, pc := mepc.
    pub fn mret(&mut self) -> Result<(), Trap> {
        if self.mode != Mode::Machine {
            return Err(Trap::IllegalInstruction(0x3020_0073));
        }
        let mut mstatus = self.csrs[CSR_MSTATUS as usize];
        let mpp = Mode::from_mpp((mstatus & MSTATUS_MPP_MASK) >> MSTATUS_MPP_SHIFT);
        let mpie = (mstatus >> 7) & 1;
        mstatus = (mstatus & !MSTATUS_MIE) | (mpie << 3);
        mstatus |= MSTATUS_MPIE;
        mstatus &= !MSTATUS_MPP_MASK;
        self.csrs[CSR_MSTATUS as usize] = mstatus;
        self.mode = mpp;
        self.pc = self.csrs[CSR_MEPC as usize];
        Ok(())
    }

    /// Translate a virtual address to a physical address using the MMU.
    pub fn translate(
        &mut self,
        bus: &mut dyn Bus,
        vaddr: u32,
        access: MmuAccessType,
    ) -> Result<u64, Trap> {
        let satp = self.csrs[CSR_SATP as usize];
        let mstatus = self.csrs[CSR_MSTATUS as usize];
        mmu::translate(bus, &mut self.tlb, self.mode, satp, mstatus, vaddr, access)
    }

    /// Translate and PMP-check an access of `size` bytes.
    fn resolve(
        &mut self,
        bus: &mut dyn Bus,
        vaddr: u32,
        size: u32,
        access: MmuAccessType,
    ) -> Result<u64, Trap> {
        let pa = self.translate(bus, vaddr, access)?;
        if !self.csrs.pmp.check(pa, size, access, self.mode) {
            if log::log_enabled!(log::Level::Trace) {
                log::trace!("pmp: {:?} denied at pa=0x{:09x} mode={:?}", access, pa, self.mode);
            }
            return Err(mmu::access_fault(access, vaddr));
        }
        Ok(pa)
    }

    /// Load `width` bytes from `vaddr`, sign-extended to 32 bits.
    pub fn load(&mut self, bus: &mut dyn Bus, vaddr: u32, width: Width) -> Result<u32, Trap> {
        if vaddr % width.bytes() != 0 {
            return Err(Trap::LoadAddressMisaligned(vaddr));
        }
        let pa = self.resolve(bus, vaddr, width.bytes(), MmuAccessType::Load)?;
        let remap = |_| Trap::LoadAccessFault(vaddr);
        let val = match width {
            Width::Byte => bus.read8(pa).map_err(remap)? as i8 as i32 as u32,
            Width::Half => bus.read16(pa).map_err(remap)? as i16 as i32 as u32,
            Width::Word => bus.read32(pa).map_err(remap)?,
        };
        Ok(val)
    }

    /// Store the low `width` bytes of `val` at `vaddr`.
    pub fn store(
        &mut self,
        bus: &mut dyn Bus,
        vaddr: u32,
        width: Width,
        val: u32,
    ) -> Result<(), Trap> {
        if vaddr % width.bytes() != 0 {
            return Err(Trap::StoreAddressMisaligned(vaddr));
        }
        let pa = self.resolve(bus, vaddr, width.bytes(), MmuAccessType::Store)?;
        let remap = |_| Trap::StoreAccessFault(vaddr);
        match width {
            Width::Byte => bus.write8(pa, val as u8).map_err(remap),
            Width::Half => bus.write16(pa, val as u16).map_err(remap),
            Width::Word => bus.write32(pa, val).map_err(remap),
        }
    }

    /// Fetch and decode the instruction at `vaddr`. Decodes are served from
    /// the cache until `fence_i`, so stale code stays visible until then.
    pub fn fetch(&mut self, bus: &mut dyn Bus, vaddr: u32) -> Result<Op, Trap> {
        if vaddr % 4 != 0 {
            return Err(Trap::InstructionAddressMisaligned(vaddr));
        }
        let pa = self.resolve(bus, vaddr, 4, MmuAccessType::Instruction)?;
        if let Some(op) = self.decode_cache_lookup(pa) {
            return Ok(op);
        }
        let raw = bus
            .fetch_u32(pa)
            .map_err(|_| Trap::InstructionAccessFault(vaddr))?;
        let op = super::decoder::decode(raw)?;
        self.decode_cache_insert(pa, op);
        Ok(op)
    }

    /// `sfence.vma x0, x0`: flush every translation, global ones included.
    pub fn sfence_vma(&mut self) -> Result<(), Trap> {
        if self.mode == Mode::User {
            return Err(Trap::IllegalInstruction(0x1200_0073));
        }
        self.tlb.flush();
        self.invalidate_decode_cache();
        Ok(())
    }

    /// `fence.i`: make prior stores visible to instruction fetch.
    pub fn fence_i(&mut self) {
        self.invalidate_decode_cache();
    }

    /// Raise `mip` bits on behalf of an interrupt source.
    pub fn raise_interrupt(&mut self, bits: u32) {
        self.csrs[CSR_MIP as usize] |= bits;
    }

    /// Acknowledge a taken interrupt by clearing its pending bit.
    pub fn acknowledge_interrupt(&mut self, trap: &Trap) {
        if let Some((true, cause, _)) = trap.cause_tval() {
            self.csrs[CSR_MIP as usize] &= !(1 << cause);
        }
    }

    pub fn check_pending_interrupt(&self) -> Option<Trap> {
        let mstatus = self.csrs[CSR_MSTATUS as usize];
        let pending = self.csrs[CSR_MIP as usize] & self.csrs[CSR_MIE as usize];

        // Machine mode global enable:
        // Enabled if (currently in Machine and MIE==1) OR (currently below Machine).
        let enabled = match self.mode {
            Mode::Machine => mstatus & MSTATUS_MIE != 0,
            _ => true,
        };
        if !enabled || pending == 0 {
            return None;
        }

        // Standard priority: MEI, MSI, MTI, SEI, SSI, STI.
        if pending & MIP_MEIP != 0 {
            Some(Trap::MachineExternalInterrupt)
        } else if pending & MIP_MSIP != 0 {
            Some(Trap::MachineSoftwareInterrupt)
        } else if pending & MIP_MTIP != 0 {
            Some(Trap::MachineTimerInterrupt)
        } else if pending & MIP_SEIP != 0 {
            Some(Trap::SupervisorExternalInterrupt)
        } else if pending & MIP_SSIP != 0 {
            Some(Trap::SupervisorSoftwareInterrupt)
        } else if pending & MIP_STIP != 0 {
            Some(Trap::SupervisorTimerInterrupt)
        } else {
            None
        }
    }
}
