//! Test-case dispatcher: walks the `{address, value, opcode}` table and runs
//! one behaviour per record.
//!
//! Each behaviour is modelled instruction by instruction at its link-time
//! offset from the behaviour's label, so traps see the same `mepc` the
//! assembled harness would produce. A `li` wider than 12 bits occupies two
//! slots (`lui`/`addi`).

use super::command::{A0, A1, A2, RA, SENTINEL, T0, T2, T3, T4, T5};
use super::cursor::rebase;
use super::layout::{CodeLayout, MEGAPAGE_OFFSET_MASK};
use super::table::{RECORD_BYTES, TestOp};
use super::{Flow, HaltReason, Harness};
use crate::Trap;
use crate::cpu::csr::{
    CSR_MTVEC, CSR_PMPADDR0, CSR_PMPCFG0, CSR_SATP, CSR_SSTATUS, MSTATUS_MXR, MSTATUS_SUM,
};
use crate::cpu::types::{INSTRUCTION_BYTES, Width};
use crate::mmu::{SATP_MODE_SV32, satp_value};
use crate::pmp::{MAX_PMP_ENTRIES, PMPCFG_COUNT};

const MXR_SUM_SHIFT: u32 = 18;
const MXR_SUM_MASK: u32 = MSTATUS_MXR | MSTATUS_SUM;

/// Bytes per selector arm in `write_pmpcfg_0` (li, bne, csrw, csrr).
const PMPCFG_ARM_BYTES: u32 = 16;
/// Bytes per selector arm in `write_pmpaddr_0` (li, bne, csrw, csrr, j).
const PMPADDR_ARM_BYTES: u32 = 20;

/// Action code the halt sequence places in `a0`.
const HALT_ACTION: u32 = 2;

impl Harness {
    /// Fetch the next record and run its behaviour. `Err` carries the halt.
    pub(super) fn dispatch_next(&mut self) -> Flow<()> {
        let test_loop = self.layout.test_loop;
        let loop_pc = self.pc_of(test_loop);
        self.hart.pc = loop_pc;
        if let Some(irq) = self.hart.check_pending_interrupt() {
            self.take_trap(irq, loop_pc)?;
            self.resync(test_loop);
        }

        for (i, reg) in [T3, T4, T5].into_iter().enumerate() {
            let offset = 4 * i as u32;
            let link = test_loop.wrapping_add(offset);
            let cursor = self.hart.read_reg(T0).wrapping_add(offset);
            if let Some(word) = self.exec(link, |h, bus| h.load(bus, cursor, Width::Word))? {
                self.hart.write_reg(reg, word);
            }
        }
        let t0 = self.hart.read_reg(T0);
        self.hart.write_reg(T0, t0.wrapping_add(RECORD_BYTES));

        // auipc/srli/slli: page bits of the dispatcher's own pc. The mask
        // load before it is a lui/addi pair.
        let auipc_pc = self.pc_of(test_loop.wrapping_add(28));
        self.hart.write_reg(T2, auipc_pc & !MEGAPAGE_OFFSET_MASK);
        let target = CodeLayout::jump_target(self.hart.read_reg(T5), auipc_pc);
        self.hart.write_reg(T5, target);

        let Some(op) = self.layout.op_at_offset(target) else {
            return Err(HaltReason::Fatal(format!(
                "undefined dispatch target 0x{:08x}",
                target
            )));
        };
        self.bias = target.wrapping_sub(self.layout.address_of(op));

        let (address, value) = (self.hart.read_reg(T3), self.hart.read_reg(T4));
        log::debug!(
            "record #{}: {} address=0x{:08x} value=0x{:08x} mode={:?}",
            self.cases_run,
            op.label(),
            address,
            value,
            self.hart.mode
        );

        let base = self.layout.address_of(op);
        match op {
            TestOp::Write32 => self.write_test(base, Width::Word),
            TestOp::Write16 => self.write_test(base, Width::Half),
            TestOp::Write08 => self.write_test(base, Width::Byte),
            TestOp::Read32 => self.read_test(base, Width::Word),
            TestOp::Read16 => self.read_test(base, Width::Half),
            TestOp::Read08 => self.read_test(base, Width::Byte),
            TestOp::Executable => self.executable_test(base),
            TestOp::Terminate => self.terminate_test(base),
            TestOp::GotoBaremetal => self.goto_satp(base, 0),
            TestOp::GotoSv32 => self.goto_satp(base, SATP_MODE_SV32),
            TestOp::WriteMxrSum => self.write_mxr_sum(base),
            TestOp::GotoMMode => self.goto_mode(base, 2),
            TestOp::GotoSMode => self.goto_mode(base, 3),
            TestOp::GotoUMode => self.goto_mode(base, 4),
            TestOp::WritePmpcfg => self.write_pmpcfg(base),
            TestOp::WritePmpaddr => self.write_pmpaddr(base),
        }
    }

    /// `sw t2, 0(cursor)`. The cursor advances whether or not the store
    /// faulted; a faulting store has its cause recorded instead.
    fn append_result(&mut self, link: u32, value: u32) -> Flow<()> {
        self.ensure_result_room()?;
        let virt = self.cursor.virt();
        self.exec(link, |h, bus| h.store(bus, virt, Width::Word, value))?;
        self.cursor.advance(4);
        Ok(())
    }

    fn write_test(&mut self, base: u32, width: Width) -> Flow<()> {
        let (address, value) = (self.hart.read_reg(T3), self.hart.read_reg(T4));
        self.exec(base, |h, bus| h.store(bus, address, width, value))?;
        Ok(())
    }

    fn read_test(&mut self, base: u32, width: Width) -> Flow<()> {
        self.hart.write_reg(T2, SENTINEL);
        let address = self.hart.read_reg(T3);
        if let Some(val) = self.exec(base + 8, |h, bus| h.load(bus, address, width))? {
            self.hart.write_reg(T2, val);
        }
        let result = self.hart.read_reg(T2);
        self.append_result(base + 12, result)
    }

    /// `fence.i; li t2, 0xBAD; jalr t3; sw t2`: call guest code at the
    /// record address and record what it leaves in `t2`.
    fn executable_test(&mut self, base: u32) -> Flow<()> {
        self.hart.fence_i();
        self.hart.write_reg(T2, SENTINEL);

        let entry = self.hart.read_reg(T3);
        let mut ret = self.pc_of(base + 16);
        let jalr = self.exec(base + 12, |h, _| {
            if entry % INSTRUCTION_BYTES != 0 {
                return Err(Trap::InstructionAddressMisaligned(entry));
            }
            h.write_reg(RA, ret);
            Ok(())
        })?;

        if jalr.is_some() {
            self.hart.pc = entry;
            self.trap.last_rebase = None;
            let mut steps = 0;
            while self.hart.pc != ret {
                if steps >= self.config.max_exec_steps {
                    return Err(HaltReason::Fatal(format!(
                        "guest code at 0x{:08x} did not return within {} steps",
                        entry, self.config.max_exec_steps
                    )));
                }
                steps += 1;
                let pc = self.hart.pc;
                if let Err(trap) = self.hart.step(&mut self.bus) {
                    self.take_trap(trap, pc)?;
                    if let Some((target, mask)) = self.trap.last_rebase.take() {
                        ret = rebase(ret, target, mask);
                    }
                }
            }
            log::debug!("executable_test: guest returned after {} steps", steps);
            self.resync(base + 16);
        }

        let result = self.hart.read_reg(T2);
        self.append_result(base + 16, result)
    }

    /// `li a0, 2; ecall; csrw mtvec, <saved>`: the only clean exit.
    fn terminate_test(&mut self, base: u32) -> Flow<()> {
        self.hart.write_reg(A0, HALT_ACTION);
        self.exec(base + 4, |h, _| Err::<(), _>(Trap::ecall_from(h.mode)))?;
        let cause = self.trap.last_cause.unwrap_or_default();
        let mode = self.trap.entered_from;

        let saved = self.trap.saved_mtvec;
        self.exec(base + 8, |h, _| h.write_csr(CSR_MTVEC, saved))?;
        Err(HaltReason::Completed { cause, mode })
    }

    /// `li a0, action; mv a1, t3; mv a2, t4; ecall`.
    fn goto_mode(&mut self, base: u32, action: u32) -> Flow<()> {
        self.hart.write_reg(A0, action);
        let (target_vpn, page_class) = (self.hart.read_reg(T3), self.hart.read_reg(T4));
        self.hart.write_reg(A1, target_vpn);
        self.hart.write_reg(A2, page_class);
        self.exec(base + 12, |h, _| Err::<(), _>(Trap::ecall_from(h.mode)))?;
        Ok(())
    }

    /// Point `satp` at the fixed root table with `mode`, then flush every
    /// cached translation.
    fn goto_satp(&mut self, base: u32, mode: u32) -> Flow<()> {
        let root = self.config.root_ppn;
        let satp = satp_value(mode, root);
        self.hart.write_reg(T2, satp);
        self.hart.write_reg(T3, root);
        self.exec(base + 20, |h, _| h.write_csr(CSR_SATP, satp))?;
        self.exec(base + 24, |h, _| h.sfence_vma())?;
        log::debug!("satp=0x{:08x}", satp);
        Ok(())
    }

    /// Clear then set `sstatus.{MXR,SUM}` from the low two bits of the value.
    fn write_mxr_sum(&mut self, base: u32) -> Flow<()> {
        let value = self.hart.read_reg(T4);
        let clear = (!value << MXR_SUM_SHIFT) & MXR_SUM_MASK;
        let set = (value << MXR_SUM_SHIFT) & MXR_SUM_MASK;
        self.hart.write_reg(T5, MXR_SUM_MASK);
        self.hart.write_reg(T2, clear);
        self.hart.write_reg(T4, set);
        self.exec(base + 20, |h, _| h.clear_csr_bits(CSR_SSTATUS, clear))?;
        self.exec(base + 24, |h, _| h.set_csr_bits(CSR_SSTATUS, set))?;
        Ok(())
    }

    /// Write `pmpcfg[sel]` and record the readback. Every compare arm runs,
    /// so an unknown selector records the stale `t5`.
    fn write_pmpcfg(&mut self, base: u32) -> Flow<()> {
        let (sel, value) = (self.hart.read_reg(T3), self.hart.read_reg(T4));
        if (sel as usize) < PMPCFG_COUNT {
            let arm = base + PMPCFG_ARM_BYTES * sel;
            let csr = CSR_PMPCFG0 + sel as u16;
            self.exec(arm + 8, |h, _| h.write_csr(csr, value))?;
            if let Some(readback) = self.exec(arm + 12, |h, _| h.read_csr(csr))? {
                self.hart.write_reg(T5, readback);
            }
        }
        self.hart.write_reg(T2, PMPCFG_COUNT as u32 - 1);
        let end = base + PMPCFG_ARM_BYTES * PMPCFG_COUNT as u32;
        let readback = self.hart.read_reg(T5);
        self.append_result(end, readback)
    }

    /// Write `pmpaddr[sel]` and record the readback; the matching arm jumps
    /// straight to the end.
    fn write_pmpaddr(&mut self, base: u32) -> Flow<()> {
        let (sel, value) = (self.hart.read_reg(T3), self.hart.read_reg(T4));
        if (sel as usize) < MAX_PMP_ENTRIES {
            let arm = base + PMPADDR_ARM_BYTES * sel;
            let csr = CSR_PMPADDR0 + sel as u16;
            self.exec(arm + 8, |h, _| h.write_csr(csr, value))?;
            if let Some(readback) = self.exec(arm + 12, |h, _| h.read_csr(csr))? {
                self.hart.write_reg(T5, readback);
            }
            self.hart.write_reg(T2, sel);
        } else {
            self.hart.write_reg(T2, MAX_PMP_ENTRIES as u32 - 1);
        }
        let end = base + PMPADDR_ARM_BYTES * MAX_PMP_ENTRIES as u32;
        let readback = self.hart.read_reg(T5);
        self.append_result(end, readback)
    }
}
