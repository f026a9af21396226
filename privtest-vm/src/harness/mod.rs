//! Privilege test harness: a machine-mode trap responder and a table-driven
//! test dispatcher running against a modelled RV32 hart.
//!
//! The harness code itself is Rust, but every instruction it models has an
//! address. `bias` maps the link-time address of a harness instruction to the
//! virtual address it currently runs at, so trap return addresses and page
//! rebasing see the same addresses real code would.

pub mod command;
pub mod cursor;
pub mod dispatch;
pub mod layout;
pub mod table;
pub mod trap;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Trap;
use crate::bus::{Bus, SystemBus};
use crate::cpu::Hart;
use crate::cpu::csr::CSR_MTVEC;
use crate::cpu::types::{INSTRUCTION_BYTES, Mode};
use crate::dram::DRAM_BASE;
use crate::error::HarnessError;
use crate::snapshot::{HartSnapshot, MemRegionSnapshot, Snapshot};

use command::{A0, A1, A2, RA, SP, T0};
use cursor::ResultCursor;
use layout::CodeLayout;
use table::{TestCase, encode_table};
use trap::TrapState;

/// Fill pattern of an untouched result buffer.
pub const RESULT_FILL: u32 = 0xDEAD_BEEF;
pub const RESULT_WORDS: usize = 1024;

/// Why a run stopped. Halts are values, never panics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaltReason {
    /// `terminate_test` ran; `cause` is the halt ecall's `mcause`.
    Completed { cause: u32, mode: Mode },
    /// A cause the trap vector table does not expect.
    UnexpectedTrap { cause: u32, mode: Mode },
    /// Unsupported ecall action or page class in the trap command.
    MalformedCommand { action: u32, page_class: u32 },
    /// Framework error: undefined dispatch target, runaway table, trap
    /// inside the handler.
    Fatal(String),
}

impl HaltReason {
    pub fn is_clean(&self) -> bool {
        matches!(self, HaltReason::Completed { .. })
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::Completed { cause, mode } => {
                write!(f, "completed (mcause=0x{:x} from {:?})", cause, mode)
            }
            HaltReason::UnexpectedTrap { cause, mode } => {
                write!(f, "unexpected trap (mcause=0x{:x} from {:?})", cause, mode)
            }
            HaltReason::MalformedCommand { action, page_class } => write!(
                f,
                "malformed trap command (action={}, page_class={})",
                action, page_class
            ),
            HaltReason::Fatal(msg) => write!(f, "fatal: {}", msg),
        }
    }
}

/// Control flow inside the harness: `Err` carries the halt.
pub type Flow<T> = Result<T, HaltReason>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub halt: HaltReason,
    pub results: Vec<u32>,
    pub cases_run: usize,
}

/// Memory map and limits of a harness run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    pub dram_base: u64,
    pub dram_size: usize,
    pub results_base: u64,
    pub results_words: usize,
    pub stack_top: u64,
    pub table_base: u64,
    /// Root page-table PPN used by `goto_sv32`/`goto_baremetal`.
    pub root_ppn: u32,
    pub pmp_entries: usize,
    /// Runaway guard on the number of dispatched records.
    pub max_test_cases: usize,
    /// Step limit for code run by `executable_test`.
    pub max_exec_steps: usize,
}

impl HarnessConfig {
    pub fn for_dram(dram_base: u64, dram_size: usize) -> Self {
        Self {
            dram_base,
            dram_size,
            results_base: dram_base + 0x4000,
            results_words: RESULT_WORDS,
            stack_top: dram_base + 0x6000,
            table_base: dram_base + 0x8000,
            root_ppn: ((dram_base + 0xD000) >> 12) as u32,
            pmp_entries: crate::pmp::MAX_PMP_ENTRIES,
            max_test_cases: 4096,
            max_exec_steps: 10_000,
        }
    }

    /// Take the result buffer, stack and table from a test image.
    pub fn apply_symbols(&mut self, symbols: &HashMap<String, u64>) -> Result<(), HarnessError> {
        let lookup = |name: &str| {
            symbols
                .get(name)
                .copied()
                .ok_or_else(|| HarnessError::MissingSymbol(name.to_string()))
        };
        self.results_base = lookup("test_1_res")?;
        self.stack_top = lookup("top_of_stack")?;
        self.table_base = lookup("test_cases")?;
        Ok(())
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::for_dram(DRAM_BASE, 4 * 1024 * 1024)
    }
}

pub struct Harness {
    pub hart: Hart,
    pub bus: SystemBus,
    pub layout: CodeLayout,
    pub config: HarnessConfig,
    cursor: ResultCursor,
    trap: TrapState,
    /// Current virtual address minus link address of harness code.
    bias: u32,
    halted: Option<HaltReason>,
    cases_run: usize,
}

impl Harness {
    pub fn new(config: HarnessConfig, layout: CodeLayout) -> Result<Self, HarnessError> {
        let bus = SystemBus::new(config.dram_base, config.dram_size);
        let results_end = config.results_base + (config.results_words as u64) * 4;
        for (what, addr) in [
            ("result buffer", config.results_base),
            ("result buffer end", results_end.saturating_sub(1)),
            ("test-case table", config.table_base),
            ("stack", config.stack_top.saturating_sub(4)),
        ] {
            if bus.dram.offset(addr).is_none() {
                return Err(HarnessError::RegionOutOfRange { what, addr });
            }
        }

        Ok(Self {
            hart: Hart::new(layout.test_setup, config.pmp_entries),
            bus,
            cursor: ResultCursor::new(
                config.results_base as u32,
                config.results_base,
                config.results_words as u64 * 4,
            ),
            trap: TrapState::new(),
            bias: 0,
            halted: None,
            cases_run: 0,
            layout,
            config,
        })
    }

    /// Harness with the default code layout at the start of DRAM.
    pub fn with_default_layout(config: HarnessConfig) -> Result<Self, HarnessError> {
        let layout = CodeLayout::relative_to(config.dram_base as u32);
        Self::new(config, layout)
    }

    /// Write `cases` into the test-case table region.
    pub fn load_table(&mut self, cases: &[TestCase]) -> Result<(), HarnessError> {
        let words = encode_table(cases, &self.layout);
        self.load_table_words(&words)
    }

    /// Write raw table words, opcodes included, into the table region.
    pub fn load_table_words(&mut self, words: &[u32]) -> Result<(), HarnessError> {
        for (i, word) in words.iter().enumerate() {
            self.bus.write32(self.config.table_base + 4 * i as u64, *word)?;
        }
        Ok(())
    }

    /// Boot: fill the result buffer, set up the stack, install the trap
    /// handler (keeping the previous vector) and point `t0` at the table.
    pub fn boot(&mut self) -> Result<(), HarnessError> {
        let offset = self
            .bus
            .dram
            .offset(self.config.results_base)
            .ok_or(HarnessError::RegionOutOfRange {
                what: "result buffer",
                addr: self.config.results_base,
            })?;
        self.bus
            .dram
            .fill_words(offset as u64, self.config.results_words, RESULT_FILL)?;
        self.cursor = ResultCursor::new(
            self.config.results_base as u32,
            self.config.results_base,
            self.config.results_words as u64 * 4,
        );

        self.hart.mode = Mode::Machine;
        self.hart.write_reg(SP, self.config.stack_top as u32);
        self.hart.write_reg(RA, self.layout.trap_handler);
        self.trap = TrapState::new();
        self.trap.saved_mtvec = self.hart.read_csr(CSR_MTVEC)?;
        self.hart.write_csr(CSR_MTVEC, self.layout.trap_handler)?;
        for reg in [A0, A1, A2] {
            self.hart.write_reg(reg, 0);
        }

        // test_setup: la t0, test_cases
        self.hart.write_reg(T0, self.config.table_base as u32);
        self.bias = 0;
        self.hart.pc = self.layout.test_loop;
        self.halted = None;
        self.cases_run = 0;

        log::info!(
            "boot: handler=0x{:08x} table=0x{:08x} results=0x{:08x} saved mtvec=0x{:08x}",
            self.layout.trap_handler,
            self.config.table_base,
            self.config.results_base,
            self.trap.saved_mtvec
        );
        Ok(())
    }

    /// Run the dispatcher until the table halts the hart.
    pub fn run(&mut self) -> Result<RunOutcome, HarnessError> {
        let halt = match &self.halted {
            Some(halt) => halt.clone(),
            None => {
                let halt = loop {
                    if self.cases_run >= self.config.max_test_cases {
                        break HaltReason::Fatal(format!(
                            "no terminate_test within {} records",
                            self.config.max_test_cases
                        ));
                    }
                    self.cases_run += 1;
                    if let Err(halt) = self.dispatch_next() {
                        break halt;
                    }
                };
                if halt.is_clean() {
                    log::info!("halt: {} after {} records", halt, self.cases_run);
                } else {
                    log::warn!("halt: {} after {} records", halt, self.cases_run);
                }
                self.halted = Some(halt.clone());
                halt
            }
        };

        Ok(RunOutcome {
            halt,
            results: self.results()?,
            cases_run: self.cases_run,
        })
    }

    /// Words appended to the result buffer so far.
    pub fn results(&self) -> Result<Vec<u32>, HarnessError> {
        let count = (self.cursor.written() / 4) as usize;
        Ok(self.bus.read_words(self.config.results_base, count)?)
    }

    pub fn cursor(&self) -> ResultCursor {
        self.cursor
    }

    pub fn halted(&self) -> Option<&HaltReason> {
        self.halted.as_ref()
    }

    /// Raise `mip` bits; pending enabled interrupts are taken at the next
    /// record boundary.
    pub fn inject_interrupt(&mut self, bits: u32) {
        self.hart.raise_interrupt(bits);
    }

    /// Hart state plus the hashed result buffer.
    pub fn snapshot(&self) -> Result<Snapshot, HarnessError> {
        let len = self.config.results_words * 4;
        let offset = self
            .bus
            .dram
            .offset(self.config.results_base)
            .ok_or(HarnessError::RegionOutOfRange {
                what: "result buffer",
                addr: self.config.results_base,
            })?;
        let bytes = self.bus.dram.read_bytes(offset as u64, len)?;
        Ok(Snapshot::new(
            HartSnapshot::capture(&self.hart),
            vec![MemRegionSnapshot::capture(self.config.results_base, bytes, true)],
        ))
    }

    /// Halt before a word would land past the end of the result buffer.
    fn ensure_result_room(&self) -> Flow<()> {
        if self.cursor.is_full() {
            log::warn!("result buffer full at 0x{:08x}", self.cursor.phys());
            return Err(HaltReason::Fatal(format!(
                "result buffer full after {} words",
                self.config.results_words
            )));
        }
        Ok(())
    }

    /// Address a harness instruction linked at `link` currently runs at.
    fn pc_of(&self, link: u32) -> u32 {
        link.wrapping_add(self.bias)
    }

    /// Re-derive `bias` after a trap returned to the instruction linked at
    /// `link`.
    fn resync(&mut self, link: u32) {
        self.bias = self.hart.pc.wrapping_sub(link);
    }

    /// Execute one modelled harness instruction. A trap is delivered to the
    /// responder; `None` means the instruction trapped and execution resumed
    /// after it.
    fn exec<T>(
        &mut self,
        link: u32,
        f: impl FnOnce(&mut Hart, &mut dyn Bus) -> Result<T, Trap>,
    ) -> Flow<Option<T>> {
        let pc = self.pc_of(link);
        self.hart.pc = pc;
        match f(&mut self.hart, &mut self.bus) {
            Ok(val) => {
                self.hart.pc = pc.wrapping_add(INSTRUCTION_BYTES);
                Ok(Some(val))
            }
            Err(trap) => {
                self.take_trap(trap, pc)?;
                self.resync(link.wrapping_add(INSTRUCTION_BYTES));
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::csr::{
        CSR_MEPC, CSR_MIE, CSR_MSTATUS, CSR_MTVEC, MSTATUS_MIE, MSTATUS_MPP_MASK, MSTATUS_MXR,
        MSTATUS_SUM,
    };
    use crate::cpu::core::MIP_MTIP;
    use crate::harness::command::SENTINEL;
    use crate::harness::layout::MEGAPAGE_OFFSET_MASK;
    use crate::harness::table::{TestCase, TestOp};
    use crate::mmu::PTE_V;

    // --- Helpers ---------------------------------------------------------------

    const SCRATCH: u32 = 0x1000;

    /// Harness at physical 0 with 64 KiB of DRAM and no translation set up.
    fn bare_harness(pmp_entries: usize) -> Harness {
        let mut config = HarnessConfig::for_dram(0, 64 * 1024);
        config.pmp_entries = pmp_entries;
        Harness::with_default_layout(config).unwrap()
    }

    fn run_cases(harness: &mut Harness, cases: &[TestCase]) -> RunOutcome {
        harness.load_table(cases).unwrap();
        harness.boot().unwrap();
        harness.run().unwrap()
    }

    fn case(address: u32, value: u32, op: TestOp) -> TestCase {
        TestCase::new(address, value, op)
    }

    fn terminate() -> TestCase {
        case(0, 0, TestOp::Terminate)
    }

    /// Store guest instructions at `addr` through the table.
    fn code(addr: u32, insns: &[u32]) -> Vec<TestCase> {
        insns
            .iter()
            .enumerate()
            .map(|(i, &insn)| case(addr + 4 * i as u32, insn, TestOp::Write32))
            .collect()
    }

    const LI_T2_0X111: u32 = 0x1110_0393; // addi x7, x0, 0x111
    const LI_T2_0X222: u32 = 0x2220_0393; // addi x7, x0, 0x222
    const RET: u32 = 0x0000_8067; // jalr x0, 0(x1)
    const EBREAK: u32 = 0x0010_0073;
    const ECALL: u32 = 0x0000_0073;
    const LI_A0_7: u32 = 0x0070_0513; // addi x10, x0, 7

    /// Identity megapage at 0x8000_0000 plus an alias at 0x0040_0000, both
    /// supervisor RWX with A/D preset.
    const MEGAPAGE_RWX: u32 = (0x80000 << 10) | 0xCF;
    const ALIAS_BASE: u32 = 0x0040_0000;

    /// Harness on the default memory map with an Sv32 root table in place.
    fn sv32_harness() -> Harness {
        let mut harness = Harness::with_default_layout(HarnessConfig::default()).unwrap();
        let root = u64::from(harness.config.root_ppn) << 12;
        assert_eq!(root, 0x8000_D000);
        harness
            .bus
            .write32(root + 4 * (0x8000_0000u64 >> 22), MEGAPAGE_RWX)
            .unwrap();
        harness
            .bus
            .write32(root + 4 * u64::from(ALIAS_BASE >> 22), MEGAPAGE_RWX)
            .unwrap();
        harness
    }

    /// PMP open to S/U, then paging on and a drop to supervisor mode.
    fn sv32_prologue() -> Vec<TestCase> {
        vec![
            case(0, 0xFFFF_FFFF, TestOp::WritePmpaddr),
            case(0, 0x1F, TestOp::WritePmpcfg),
            case(0, 0, TestOp::GotoSv32),
            case(0, 0, TestOp::GotoSMode),
        ]
    }

    // --- End-to-end ------------------------------------------------------------

    #[test]
    fn test_write_read_terminate() {
        let mut harness = bare_harness(16);
        let outcome = run_cases(
            &mut harness,
            &[
                case(SCRATCH, 0xCAFE_BABE, TestOp::Write32),
                case(SCRATCH, 0, TestOp::Read32),
                terminate(),
            ],
        );
        assert_eq!(outcome.results, vec![0xCAFE_BABE, 0xB]);
        assert_eq!(
            outcome.halt,
            HaltReason::Completed {
                cause: 0xB,
                mode: Mode::Machine
            }
        );
        assert!(outcome.halt.is_clean());
        assert_eq!(outcome.cases_run, 3);
        // Boot-time vector restored.
        assert_eq!(harness.hart.read_csr(CSR_MTVEC), Ok(0));
    }

    #[test]
    fn test_result_buffer_prefill_survives_past_cursor() {
        let mut harness = bare_harness(16);
        run_cases(&mut harness, &[terminate()]);
        let results_base = harness.config.results_base;
        let words = harness.bus.read_words(results_base, 3).unwrap();
        assert_eq!(words, vec![0xB, RESULT_FILL, RESULT_FILL]);
    }

    #[test]
    fn test_narrow_reads_sign_extend() {
        let mut harness = bare_harness(16);
        let outcome = run_cases(
            &mut harness,
            &[
                case(SCRATCH, 0x1234_80F0, TestOp::Write32),
                case(SCRATCH, 0, TestOp::Read16),
                case(SCRATCH, 0, TestOp::Read08),
                case(SCRATCH + 2, 0x7F, TestOp::Write08),
                case(SCRATCH + 2, 0, TestOp::Read16),
                terminate(),
            ],
        );
        assert_eq!(outcome.results, vec![0xFFFF_80F0, 0xFFFF_FFF0, 0x127F, 0xB]);
    }

    #[test]
    fn test_access_faults_resume_after_instruction() {
        let mut harness = bare_harness(16);
        let outcome = run_cases(
            &mut harness,
            &[
                case(0x0010_0000, 0, TestOp::Read32),
                case(0x0010_0000, 1, TestOp::Write32),
                case(SCRATCH + 1, 0, TestOp::Read32),
                terminate(),
            ],
        );
        // Load access fault, store access fault, misaligned load fails fast.
        assert_eq!(outcome.results, vec![0x5, SENTINEL, 0x7, 0x4]);
        assert_eq!(
            outcome.halt,
            HaltReason::UnexpectedTrap {
                cause: 4,
                mode: Mode::Machine
            }
        );
        assert_eq!(harness.hart.read_csr(CSR_MTVEC), Ok(0));
    }

    #[test]
    fn test_fault_returns_follow_instruction_offsets() {
        // li t2, 0xBAD is a lui/addi pair: the load sits at +8, its store at +12.
        let mut harness = bare_harness(16);
        harness.config.max_test_cases = 1;
        let outcome = run_cases(&mut harness, &[case(0x0010_0000, 0, TestOp::Read32)]);
        assert_eq!(outcome.results, vec![0x5, SENTINEL]);
        let read = harness.layout.address_of(TestOp::Read32);
        assert_eq!(harness.hart.read_csr(CSR_MEPC), Ok(read + 12));

        // jalr at +12 links to the store at +16.
        let mut harness = bare_harness(16);
        harness.config.max_test_cases = 1;
        let outcome = run_cases(&mut harness, &[case(0x0010_0000, 0, TestOp::Executable)]);
        assert_eq!(outcome.results, vec![0x1, SENTINEL]);
        let exec = harness.layout.address_of(TestOp::Executable);
        assert_eq!(harness.hart.read_csr(CSR_MEPC), Ok(exec + 16));
    }

    // --- executable_test -------------------------------------------------------

    #[test]
    fn test_executable_runs_fresh_code() {
        let mut harness = bare_harness(16);
        let mut cases = code(SCRATCH, &[LI_T2_0X111, RET]);
        cases.push(case(SCRATCH, 0x111, TestOp::Executable));
        cases.extend(code(SCRATCH, &[LI_T2_0X222]));
        cases.push(case(SCRATCH, 0x222, TestOp::Executable));
        cases.push(terminate());
        let outcome = run_cases(&mut harness, &cases);
        assert_eq!(outcome.results, vec![0x111, 0x222, 0xB]);
    }

    #[test]
    fn test_executable_fetch_fault_resumes_at_link() {
        let mut harness = bare_harness(16);
        let outcome = run_cases(
            &mut harness,
            &[case(0x0010_0000, 0x111, TestOp::Executable), terminate()],
        );
        assert_eq!(outcome.results, vec![0x1, SENTINEL, 0xB]);
        assert!(outcome.halt.is_clean());
    }

    #[test]
    fn test_breakpoint_fails_fast() {
        let mut harness = bare_harness(16);
        let mut cases = code(SCRATCH, &[EBREAK]);
        cases.push(case(SCRATCH, 0, TestOp::Executable));
        cases.push(case(SCRATCH, 0, TestOp::Read32));
        cases.push(terminate());
        let outcome = run_cases(&mut harness, &cases);
        assert_eq!(outcome.results.last(), Some(&0x3));
        assert_eq!(outcome.results, vec![0x3]);
        assert_eq!(
            outcome.halt,
            HaltReason::UnexpectedTrap {
                cause: 3,
                mode: Mode::Machine
            }
        );
        assert!(!outcome.halt.is_clean());
    }

    #[test]
    fn test_illegal_instruction_fails_fast() {
        let mut harness = bare_harness(16);
        let mut cases = code(SCRATCH, &[0xFFFF_FFFF]);
        cases.push(case(SCRATCH, 0, TestOp::Executable));
        cases.push(terminate());
        let outcome = run_cases(&mut harness, &cases);
        assert_eq!(outcome.results, vec![0x2]);
    }

    #[test]
    fn test_runaway_guest_code_is_fatal() {
        let mut harness = bare_harness(16);
        harness.config.max_exec_steps = 32;
        // jal x0, 0: spin forever.
        let mut cases = code(SCRATCH, &[0x0000_006F]);
        cases.push(case(SCRATCH, 0, TestOp::Executable));
        let outcome = run_cases(&mut harness, &cases);
        assert!(matches!(outcome.halt, HaltReason::Fatal(_)));
    }

    // --- Trap commands ---------------------------------------------------------

    #[test]
    fn test_unsupported_ecall_action_is_malformed() {
        let mut harness = bare_harness(16);
        let mut cases = code(SCRATCH, &[LI_A0_7, ECALL]);
        cases.push(case(SCRATCH, 0, TestOp::Executable));
        cases.push(terminate());
        let outcome = run_cases(&mut harness, &cases);
        assert_eq!(outcome.results, vec![0xB]);
        assert_eq!(
            outcome.halt,
            HaltReason::MalformedCommand {
                action: 7,
                page_class: 0
            }
        );
    }

    #[test]
    fn test_unknown_page_class_is_malformed() {
        let mut harness = bare_harness(16);
        let outcome = run_cases(
            &mut harness,
            &[case(ALIAS_BASE, 5, TestOp::GotoMMode), terminate()],
        );
        assert_eq!(outcome.results, vec![0xB]);
        assert_eq!(
            outcome.halt,
            HaltReason::MalformedCommand {
                action: 2,
                page_class: 5
            }
        );
    }

    #[test]
    fn test_user_mode_round_trip() {
        let mut harness = bare_harness(0);
        let outcome = run_cases(
            &mut harness,
            &[
                case(0, 0, TestOp::GotoUMode),
                case(SCRATCH, 0x55, TestOp::Write32),
                case(SCRATCH, 0, TestOp::Read32),
                terminate(),
            ],
        );
        assert_eq!(outcome.results, vec![0xB, 0x55, 0x8]);
        assert_eq!(
            outcome.halt,
            HaltReason::Completed {
                cause: 0x8,
                mode: Mode::User
            }
        );
        assert_eq!(harness.hart.mode, Mode::Machine);
    }

    #[test]
    fn test_mode_change_is_deterministic() {
        let mut via_supervisor = bare_harness(0);
        let a = run_cases(
            &mut via_supervisor,
            &[
                case(0, 0, TestOp::GotoSMode),
                case(0, 0, TestOp::GotoMMode),
                terminate(),
            ],
        );
        let mut direct = bare_harness(0);
        let b = run_cases(&mut direct, &[case(0, 0, TestOp::GotoMMode), terminate()]);

        assert_eq!(a.results, vec![0xB, 0x9, 0xB]);
        assert_eq!(b.results, vec![0xB, 0xB]);

        let (snap_a, snap_b) = (via_supervisor.snapshot().unwrap(), direct.snapshot().unwrap());
        assert_eq!(snap_a.hart.mode, snap_b.hart.mode);
        assert_eq!(
            snap_a.hart.csrs.get(&CSR_MSTATUS),
            snap_b.hart.csrs.get(&CSR_MSTATUS)
        );
        let mstatus = via_supervisor.hart.read_csr(CSR_MSTATUS).unwrap();
        assert_eq!(mstatus & MSTATUS_MPP_MASK, 0);
    }

    #[test]
    fn test_supervisor_cannot_touch_machine_csrs() {
        let mut harness = bare_harness(0);
        let outcome = run_cases(
            &mut harness,
            &[
                case(0, 0, TestOp::GotoSMode),
                case(0, 0x1F, TestOp::WritePmpcfg),
                terminate(),
            ],
        );
        // csrw pmpcfg0 from S is an illegal instruction.
        assert_eq!(outcome.results, vec![0xB, 0x2]);
        assert_eq!(
            outcome.halt,
            HaltReason::UnexpectedTrap {
                cause: 2,
                mode: Mode::Supervisor
            }
        );
    }

    // --- CSR behaviours --------------------------------------------------------

    #[test]
    fn test_pmp_write_then_readback() {
        let mut harness = bare_harness(16);
        let outcome = run_cases(
            &mut harness,
            &[
                case(0, 0x7F, TestOp::WritePmpcfg),
                case(3, 0x1234, TestOp::WritePmpaddr),
                case(15, 0xFFFF_FFFF, TestOp::WritePmpaddr),
                case(7, 0x1, TestOp::WritePmpcfg),
                case(16, 0x5, TestOp::WritePmpaddr),
                terminate(),
            ],
        );
        let layout = harness.layout.clone();
        assert_eq!(
            outcome.results,
            vec![
                // Bits 5 and 6 are reserved and read as zero.
                0x1F,
                0x1234,
                0xFFFF_FFFF,
                // Unknown selectors write nothing and record the stale jump target.
                layout.address_of(TestOp::WritePmpcfg),
                layout.address_of(TestOp::WritePmpaddr),
                0xB,
            ]
        );
    }

    #[test]
    fn test_unimplemented_pmp_entries_read_zero() {
        let mut harness = bare_harness(4);
        let outcome = run_cases(
            &mut harness,
            &[
                case(8, 0x55, TestOp::WritePmpaddr),
                case(2, 0x0F0F_0F0F, TestOp::WritePmpcfg),
                terminate(),
            ],
        );
        assert_eq!(outcome.results, vec![0, 0, 0xB]);
    }

    #[test]
    fn test_write_mxr_sum_uses_low_two_bits() {
        let mut harness = bare_harness(16);
        run_cases(&mut harness, &[case(0, 0xFF, TestOp::WriteMxrSum), terminate()]);
        let mstatus = harness.hart.read_csr(CSR_MSTATUS).unwrap();
        assert_eq!(mstatus & (MSTATUS_MXR | MSTATUS_SUM), MSTATUS_MXR | MSTATUS_SUM);
        assert_eq!(mstatus & !(MSTATUS_MXR | MSTATUS_SUM) & 0xFFF0_0000, 0);

        let mut harness = bare_harness(16);
        run_cases(
            &mut harness,
            &[
                case(0, 3, TestOp::WriteMxrSum),
                case(0, 1, TestOp::WriteMxrSum),
                terminate(),
            ],
        );
        let mstatus = harness.hart.read_csr(CSR_MSTATUS).unwrap();
        assert_eq!(mstatus & (MSTATUS_MXR | MSTATUS_SUM), MSTATUS_SUM);
    }

    // --- Sv32 ------------------------------------------------------------------

    #[test]
    fn test_supervisor_sv32_reads() {
        let mut harness = sv32_harness();
        let mut cases = sv32_prologue();
        cases.extend([
            case(0x8000_1000, 0x1234_5678, TestOp::Write32),
            case(0x8000_1000, 0, TestOp::Read32),
            case(ALIAS_BASE | 0x1000, 0, TestOp::Read32),
            terminate(),
        ]);
        let outcome = run_cases(&mut harness, &cases);
        assert_eq!(
            outcome.results,
            vec![0xFFFF_FFFF, 0x1F, 0xB, 0x1234_5678, 0x1234_5678, 0x9]
        );
        assert_eq!(
            outcome.halt,
            HaltReason::Completed {
                cause: 0x9,
                mode: Mode::Supervisor
            }
        );
        assert!(harness.hart.tlb.occupancy() > 0);
    }

    #[test]
    fn test_sv32_page_faults() {
        let mut harness = sv32_harness();
        let mut cases = sv32_prologue();
        cases.extend([
            // Nothing maps 0x00C0_0000.
            case(0x00C0_1000, 0, TestOp::Read32),
            case(0x00C0_1000, 0, TestOp::Executable),
            case(0x00C0_1000, 9, TestOp::Write32),
            terminate(),
        ]);
        let outcome = run_cases(&mut harness, &cases);
        assert_eq!(
            outcome.results[2..],
            [0xB, 0xD, SENTINEL, 0xC, SENTINEL, 0xF, 0x9]
        );
    }

    #[test]
    fn test_megapage_redirect_rebases_live_pointers() {
        let mut harness = sv32_harness();
        let mut cases = sv32_prologue();
        cases.pop();
        cases.extend([
            // Drop to S and continue in the alias megapage.
            case(ALIAS_BASE, 1, TestOp::GotoSMode),
            case(0x8000_2000, 0xA5A5_0001, TestOp::Write32),
            case(ALIAS_BASE | 0x2000, 0, TestOp::Read32),
            terminate(),
        ]);
        let outcome = run_cases(&mut harness, &cases);
        assert_eq!(outcome.results, vec![0xFFFF_FFFF, 0x1F, 0xB, 0xA5A5_0001, 0x9]);

        // The halt ecall was issued from the alias view.
        harness.hart.mode = Mode::Machine;
        let mepc = harness.hart.read_csr(CSR_MEPC).unwrap();
        assert_eq!(mepc & !MEGAPAGE_OFFSET_MASK, ALIAS_BASE);
        let terminate_link = harness.layout.address_of(TestOp::Terminate) + 4;
        assert_eq!(mepc & MEGAPAGE_OFFSET_MASK, terminate_link & MEGAPAGE_OFFSET_MASK);

        // Both cursor views still name the same word.
        let cursor = harness.cursor();
        assert_eq!(cursor.virt() & !MEGAPAGE_OFFSET_MASK, ALIAS_BASE);
        assert_eq!(
            u64::from(cursor.virt() & MEGAPAGE_OFFSET_MASK),
            cursor.phys() & u64::from(MEGAPAGE_OFFSET_MASK)
        );
        assert_eq!(cursor.written(), 5 * 4);
        // The redirect fields were consumed.
        assert_eq!(harness.hart.read_reg(command::A1), 0);
        assert_eq!(harness.hart.read_reg(command::A2), 0);
    }

    /// Second-level table behind the kilopage window at `KILO_TARGET`.
    const L0_TABLE: u64 = 0x8000_E000;
    const KILO_TARGET: u32 = 0x00C0_4000;

    #[test]
    fn test_kilopage_redirect_moves_every_pointer_into_one_page() {
        let mut config = HarnessConfig::default();
        // Result buffer and table share the physical page behind KILO_TARGET.
        config.results_base = 0x8000_8000;
        config.results_words = 64;
        config.table_base = 0x8000_8400;
        let mut harness = Harness::with_default_layout(config).unwrap();
        let root = u64::from(harness.config.root_ppn) << 12;
        harness
            .bus
            .write32(root + 4 * (0x8000_0000u64 >> 22), MEGAPAGE_RWX)
            .unwrap();
        harness
            .bus
            .write32(
                root + 4 * u64::from(KILO_TARGET >> 22),
                (((L0_TABLE >> 12) as u32) << 10) | PTE_V,
            )
            .unwrap();
        harness
            .bus
            .write32(
                L0_TABLE + 4 * u64::from((KILO_TARGET >> 12) & 0x3FF),
                (0x80008 << 10) | 0xCF,
            )
            .unwrap();

        let mut cases = sv32_prologue();
        cases.pop();
        cases.extend([
            // Page class 0: only the low 12 bits survive the rebase.
            case(KILO_TARGET, 0, TestOp::GotoSMode),
            case(KILO_TARGET | 0x100, 0x5A5A_0003, TestOp::Write32),
            case(KILO_TARGET | 0x100, 0, TestOp::Read32),
            terminate(),
        ]);
        let outcome = run_cases(&mut harness, &cases);
        assert_eq!(outcome.results, vec![0xFFFF_FFFF, 0x1F, 0xB, 0x5A5A_0003, 0x9]);
        assert_eq!(
            outcome.halt,
            HaltReason::Completed {
                cause: 0x9,
                mode: Mode::Supervisor
            }
        );
        assert_eq!(harness.bus.read32(0x8000_8100), Ok(0x5A5A_0003));

        // Result cursor and table cursor both moved into the target page.
        let cursor = harness.cursor();
        assert_eq!(cursor.virt(), KILO_TARGET | 0x14);
        assert_eq!(cursor.phys(), 0x8000_8014);
        assert_eq!(harness.hart.read_reg(T0), KILO_TARGET | 0x454);

        // Dispatch carried on in the target's megapage.
        harness.hart.mode = Mode::Machine;
        let mepc = harness.hart.read_csr(CSR_MEPC).unwrap();
        assert_eq!(mepc & !MEGAPAGE_OFFSET_MASK, KILO_TARGET & !MEGAPAGE_OFFSET_MASK);
    }

    #[test]
    fn test_baremetal_flushes_translations() {
        let mut harness = sv32_harness();
        let mut cases = sv32_prologue();
        cases.extend([
            case(0x8000_1000, 0, TestOp::Read32),
            case(0, 0, TestOp::GotoMMode),
            case(0, 0, TestOp::GotoBaremetal),
            terminate(),
        ]);
        let outcome = run_cases(&mut harness, &cases);
        assert!(outcome.halt.is_clean());
        assert_eq!(harness.hart.tlb.occupancy(), 0);
        assert_eq!(harness.hart.read_csr(crate::csr::CSR_SATP), Ok(0x8000D));
    }

    // --- Framework halts -------------------------------------------------------

    #[test]
    fn test_undefined_dispatch_target_is_fatal() {
        let mut harness = bare_harness(16);
        let handler = harness.layout.trap_handler;
        harness.load_table_words(&[0, 0, handler]).unwrap();
        harness.boot().unwrap();
        let outcome = harness.run().unwrap();
        assert!(matches!(outcome.halt, HaltReason::Fatal(ref msg) if msg.contains("undefined")));
        assert!(outcome.results.is_empty());
    }

    #[test]
    fn test_runaway_table_is_fatal() {
        let mut harness = bare_harness(16);
        harness.config.max_test_cases = 3;
        let cases = vec![case(SCRATCH, 1, TestOp::Write32); 5];
        let outcome = run_cases(&mut harness, &cases);
        assert!(matches!(outcome.halt, HaltReason::Fatal(_)));
        assert_eq!(outcome.cases_run, 3);
        // A halted harness reports the same outcome again.
        assert_eq!(harness.run().unwrap(), outcome);
    }

    #[test]
    fn test_regions_must_fit_in_dram() {
        let mut config = HarnessConfig::for_dram(0, 16 * 1024);
        config.pmp_entries = 16;
        assert!(matches!(
            Harness::with_default_layout(config),
            Err(HarnessError::RegionOutOfRange { .. })
        ));
    }

    #[test]
    fn test_full_result_buffer_is_fatal() {
        let mut harness = bare_harness(16);
        harness.config.results_words = 2;
        let outcome = run_cases(
            &mut harness,
            &[
                case(SCRATCH, 7, TestOp::Write32),
                case(SCRATCH, 0, TestOp::Read32),
                case(SCRATCH, 0, TestOp::Read32),
                case(SCRATCH, 0, TestOp::Read32),
                terminate(),
            ],
        );
        assert_eq!(outcome.results, vec![7, 7]);
        assert!(matches!(outcome.halt, HaltReason::Fatal(ref msg) if msg.contains("full")));
        // Nothing lands past the buffer.
        let past = harness.config.results_base + 8;
        assert_eq!(harness.bus.read32(past), Ok(0));
    }

    // --- Interrupts ------------------------------------------------------------

    #[test]
    fn test_interrupt_returns_transparently() {
        let mut harness = bare_harness(16);
        harness
            .load_table(&[
                case(SCRATCH, 5, TestOp::Write32),
                case(SCRATCH, 0, TestOp::Read32),
                terminate(),
            ])
            .unwrap();
        harness.boot().unwrap();
        harness.hart.write_csr(CSR_MIE, MIP_MTIP).unwrap();
        harness.hart.set_csr_bits(CSR_MSTATUS, MSTATUS_MIE).unwrap();
        harness.inject_interrupt(MIP_MTIP);

        let outcome = harness.run().unwrap();
        assert_eq!(outcome.results, vec![0x8000_0007, 5, 0xB]);
        assert!(outcome.halt.is_clean());
        // Edge-acknowledged: taken once.
        assert_eq!(harness.hart.check_pending_interrupt(), None);
    }

    #[test]
    fn test_masked_interrupt_is_not_taken() {
        let mut harness = bare_harness(16);
        harness.load_table(&[terminate()]).unwrap();
        harness.boot().unwrap();
        harness.hart.write_csr(CSR_MIE, MIP_MTIP).unwrap();
        harness.inject_interrupt(MIP_MTIP);
        let outcome = harness.run().unwrap();
        assert_eq!(outcome.results, vec![0xB]);
    }
}
