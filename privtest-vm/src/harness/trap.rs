//! Machine-mode trap classifier and responder.
//!
//! Every trap is recorded in the result buffer through the physical cursor.
//! Interrupts then return transparently; exceptions go through
//! [`VECTOR_TABLE`], indexed by the 4-bit cause code.

use super::command::{Action, PageClass, RA, T0, TrapCommand};
use super::cursor::rebase;
use super::{Flow, HaltReason, Harness};
use crate::Trap;
use crate::bus::Bus;
use crate::cpu::csr::{CSR_MEPC, CSR_MSTATUS, CSR_MTVEC, MSTATUS_MPP_MASK, MSTATUS_MPP_SHIFT};
use crate::cpu::types::{INSTRUCTION_BYTES, INTERRUPT_BIT, Mode};

/// Handler entries run to completion and never nest.
const MAX_TRAP_DEPTH: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Unexpected cause: halt with the cause as the last recorded word.
    FailFast,
    /// Fetch fault: resume at the saved link register.
    InstrFault,
    /// Access fault: resume after the faulting instruction.
    AccessFault,
    /// Privilege-change protocol.
    Ecall,
    /// Resume after the faulting instruction.
    TrapReturn,
}

pub const VECTOR_TABLE: [Response; 16] = [
    Response::FailFast,    // 0: instruction address misaligned
    Response::InstrFault,  // 1: instruction access fault
    Response::FailFast,    // 2: illegal instruction
    Response::FailFast,    // 3: breakpoint
    Response::FailFast,    // 4: load address misaligned
    Response::AccessFault, // 5: load access fault
    Response::FailFast,    // 6: store address misaligned
    Response::AccessFault, // 7: store access fault
    Response::Ecall,       // 8: ecall from U-mode
    Response::Ecall,       // 9: ecall from S-mode
    Response::FailFast,    // 10: reserved
    Response::Ecall,       // 11: ecall from M-mode
    Response::InstrFault,  // 12: instruction page fault
    Response::TrapReturn,  // 13: load page fault
    Response::FailFast,    // 14: reserved
    Response::TrapReturn,  // 15: store page fault
];

/// Response for a synchronous `mcause`. Causes past the table fail fast.
pub fn classify(mcause: u32) -> Response {
    VECTOR_TABLE
        .get(mcause as usize)
        .copied()
        .unwrap_or(Response::FailFast)
}

/// Scratch registers saved on handler entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapFrame {
    pub ra: u32,
    pub t0: u32,
}

#[derive(Debug, Clone)]
pub struct TrapState {
    frames: Vec<TrapFrame>,
    /// Trap vector found at boot, restored exactly once at halt.
    pub saved_mtvec: u32,
    /// Privilege mode the most recent trap was taken from.
    pub entered_from: Mode,
    pub last_cause: Option<u32>,
    /// Page base and offset mask of the last redirected return.
    pub last_rebase: Option<(u32, u32)>,
    pub traps_taken: usize,
}

impl TrapState {
    pub fn new() -> Self {
        Self {
            frames: Vec::with_capacity(MAX_TRAP_DEPTH),
            saved_mtvec: 0,
            entered_from: Mode::Machine,
            last_cause: None,
            last_rebase: None,
            traps_taken: 0,
        }
    }
}

impl Default for TrapState {
    fn default() -> Self {
        Self::new()
    }
}

fn handler_fault(trap: Trap) -> HaltReason {
    HaltReason::Fatal(format!("trap inside the trap handler: {}", trap))
}

impl Harness {
    /// Deliver `trap` raised by the instruction at `pc` and run the
    /// responder to completion.
    pub(super) fn take_trap(&mut self, trap: Trap, pc: u32) -> Flow<()> {
        let from = self.hart.mode;
        let Some(mcause) = self.hart.enter_trap(&trap, pc) else {
            return Err(HaltReason::Fatal(trap.to_string()));
        };
        if mcause & INTERRUPT_BIT != 0 {
            self.hart.acknowledge_interrupt(&trap);
        }
        if self.hart.pc != self.layout.trap_handler {
            return Err(HaltReason::Fatal(format!(
                "{} at 0x{:08x} vectored to 0x{:08x}, not the harness handler",
                trap, pc, self.hart.pc
            )));
        }

        self.trap.entered_from = from;
        self.trap.last_cause = Some(mcause);
        self.trap.traps_taken += 1;
        log::debug!(
            "trap #{}: {} mcause=0x{:x} mepc=0x{:08x} from {:?}",
            self.trap.traps_taken,
            trap,
            mcause,
            pc,
            from
        );
        self.respond(mcause)
    }

    fn respond(&mut self, mcause: u32) -> Flow<()> {
        if self.trap.frames.len() >= MAX_TRAP_DEPTH {
            return Err(HaltReason::Fatal("nested trap in handler".into()));
        }
        self.trap.frames.push(TrapFrame {
            ra: self.hart.read_reg(RA),
            t0: self.hart.read_reg(T0),
        });

        self.record_cause(mcause)?;

        if mcause & INTERRUPT_BIT != 0 {
            // Unlike `trap_return`: resume at `mepc` itself and ignore any
            // redirect. The interrupted instruction has not executed yet.
            let mepc = self.hart.read_csr(CSR_MEPC).map_err(handler_fault)?;
            return self.finish_return(mepc);
        }

        match classify(mcause) {
            Response::FailFast => self.fail_fast(mcause),
            Response::InstrFault => {
                let ra = self.frame()?.ra;
                self.finish_return(ra)
            }
            Response::AccessFault | Response::TrapReturn => self.trap_return(),
            Response::Ecall => self.ecall(),
        }
    }

    /// Append `mcause` through the physical cursor.
    fn record_cause(&mut self, mcause: u32) -> Flow<()> {
        self.ensure_result_room()?;
        self.bus
            .write32(self.cursor.phys(), mcause)
            .map_err(handler_fault)?;
        self.cursor.advance(4);
        Ok(())
    }

    fn frame(&mut self) -> Flow<&mut TrapFrame> {
        self.trap
            .frames
            .last_mut()
            .ok_or_else(|| HaltReason::Fatal("trap frame missing".into()))
    }

    /// Restore the scratch registers saved on entry.
    fn pop_frame(&mut self) -> Flow<()> {
        let frame = self
            .trap
            .frames
            .pop()
            .ok_or_else(|| HaltReason::Fatal("trap frame missing".into()))?;
        self.hart.write_reg(RA, frame.ra);
        self.hart.write_reg(T0, frame.t0);
        Ok(())
    }

    /// Privilege-change protocol: set `mstatus.MPP` from the command, then
    /// take the redirected return.
    fn ecall(&mut self) -> Flow<()> {
        let cmd = TrapCommand::read(&self.hart);
        let Some(mode) = cmd.action().target_mode() else {
            return self.fail_malformed(cmd);
        };
        let bits = match cmd.action() {
            Action::EnterMachine => MSTATUS_MPP_MASK,
            _ => mode.to_mpp() << MSTATUS_MPP_SHIFT,
        };
        self.hart
            .clear_csr_bits(CSR_MSTATUS, MSTATUS_MPP_MASK)
            .and_then(|_| self.hart.set_csr_bits(CSR_MSTATUS, bits))
            .map_err(handler_fault)?;
        log::debug!("ecall: next mode {:?}", mode);
        self.trap_return()
    }

    /// Return to `mepc + 4`, rebasing live pointers into the target page
    /// when the command names one.
    fn trap_return(&mut self) -> Flow<()> {
        let mepc = self.hart.read_csr(CSR_MEPC).map_err(handler_fault)?;
        let mut ret = mepc.wrapping_add(INSTRUCTION_BYTES);

        let cmd = TrapCommand::read(&self.hart);
        if cmd.target_vpn != 0 {
            let Some(class) = PageClass::from_index(cmd.page_class) else {
                return self.fail_malformed(cmd);
            };
            let target = cmd.target_vpn;
            let mask = class.offset_mask();
            let frame = self.frame()?;
            frame.ra = rebase(frame.ra, target, mask);
            frame.t0 = rebase(frame.t0, target, mask);
            self.cursor.rebase_virtual(target, mask);
            ret = rebase(ret, target, mask);
            TrapCommand::clear_redirect(&mut self.hart);
            self.trap.last_rebase = Some((target, mask));
            log::debug!(
                "redirect: return 0x{:08x} rebased into 0x{:08x} ({:?})",
                mepc.wrapping_add(INSTRUCTION_BYTES),
                ret,
                class
            );
        }
        self.finish_return(ret)
    }

    fn finish_return(&mut self, ret: u32) -> Flow<()> {
        self.hart.write_csr(CSR_MEPC, ret).map_err(handler_fault)?;
        self.pop_frame()?;
        self.hart.mret().map_err(handler_fault)
    }

    fn fail_fast(&mut self, mcause: u32) -> Flow<()> {
        self.pop_frame()?;
        let mode = self.trap.entered_from;
        self.terminate(HaltReason::UnexpectedTrap {
            cause: mcause,
            mode,
        })
    }

    fn fail_malformed(&mut self, cmd: TrapCommand) -> Flow<()> {
        self.pop_frame()?;
        self.terminate(HaltReason::MalformedCommand {
            action: cmd.action,
            page_class: cmd.page_class,
        })
    }

    /// Restore the boot-time trap vector and halt with `reason`.
    pub(super) fn terminate(&mut self, reason: HaltReason) -> Flow<()> {
        self.hart
            .write_csr(CSR_MTVEC, self.trap.saved_mtvec)
            .map_err(handler_fault)?;
        Err(reason)
    }
}
