//! RV32 privilege-test harness.
//!
//! A modelled RV32 hart (CSRs, Sv32, PMP, trap entry and `mret`) driven by a
//! machine-mode trap responder and a table-driven micro-test dispatcher. The
//! result buffer it leaves behind is the conformance signature.

pub mod bus;
pub mod cpu;
pub mod dram;
pub mod error;
pub mod harness;
pub mod loader;
pub mod mmu;
pub mod pmp;
pub mod snapshot;

pub use cpu::csr;
pub use cpu::{Hart, Mode, Trap, Width};
pub use error::HarnessError;
pub use harness::{Harness, HarnessConfig, HaltReason, RunOutcome};
