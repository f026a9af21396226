use thiserror::Error;

use crate::Trap;
use crate::dram::MemoryError;

/// Host-side failures: loading images and vectors, configuring the harness,
/// and encoding snapshots. Architectural faults stay `Trap` values.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ELF parse error: {0}")]
    Elf(#[from] goblin::error::Error),

    #[error("Segment 0x{addr:x}+0x{len:x} out of DRAM range")]
    SegmentOutOfRange { addr: u64, len: u64 },

    #[error("Missing symbol `{0}` in test image")]
    MissingSymbol(String),

    #[error("{what} at 0x{addr:x} does not fit in DRAM")]
    RegionOutOfRange { what: &'static str, addr: u64 },

    #[error("Vector file line {line}: {reason}")]
    MalformedVector { line: usize, reason: String },

    #[error("Unknown test label `{0}`")]
    UnknownLabel(String),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Bus fault: {0}")]
    Bus(#[from] Trap),

    #[error("Snapshot encoding error: {0}")]
    Snapshot(#[from] bincode::Error),

    #[error("Snapshot check failed: {0}")]
    SnapshotMismatch(String),
}
