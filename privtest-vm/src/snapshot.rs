use crate::cpu::Hart;
use crate::csr::Mode;
use crate::error::HarnessError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Version identifier for snapshot compatibility checks.
pub const SNAPSHOT_VERSION: &str = "1.0";

/// Harness snapshot: hart state plus hashed memory regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: String,
    pub hart: HartSnapshot,
    pub memory: Vec<MemRegionSnapshot>,
}

impl Snapshot {
    pub fn new(hart: HartSnapshot, memory: Vec<MemRegionSnapshot>) -> Self {
        Self {
            version: SNAPSHOT_VERSION.to_string(),
            hart,
            memory,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, HarnessError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HarnessError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Check the version and the hash of every region that carries data.
    pub fn verify(&self) -> Result<(), HarnessError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(HarnessError::SnapshotMismatch(format!(
                "version {} (expected {})",
                self.version, SNAPSHOT_VERSION
            )));
        }
        for region in &self.memory {
            let Some(data) = &region.data else {
                continue;
            };
            if data.len() as u64 != region.size || digest_hex(data) != region.hash {
                return Err(HarnessError::SnapshotMismatch(format!(
                    "region 0x{:08x} does not match its hash",
                    region.base
                )));
            }
        }
        Ok(())
    }
}

/// Serializable hart state. Only non-zero CSRs are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HartSnapshot {
    pub pc: u32,
    pub mode: Mode,
    pub regs: [u32; 32],
    pub csrs: HashMap<u16, u32>,
}

impl HartSnapshot {
    pub fn capture(hart: &Hart) -> Self {
        Self {
            pc: hart.pc,
            mode: hart.mode,
            regs: hart.regs,
            csrs: hart.export_csrs(),
        }
    }

    /// Restore into `hart`. Translation and decode caches are dropped.
    pub fn restore(&self, hart: &mut Hart) {
        hart.pc = self.pc;
        hart.mode = self.mode;
        hart.regs = self.regs;
        hart.regs[0] = 0;
        hart.import_csrs(&self.csrs);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemRegionSnapshot {
    pub base: u64,
    pub size: u64,
    /// Hex SHA-256 of the region contents.
    pub hash: String,
    pub data: Option<Vec<u8>>,
}

impl MemRegionSnapshot {
    /// Hash `bytes`, keeping a copy of the contents when `keep_data` is set.
    pub fn capture(base: u64, bytes: &[u8], keep_data: bool) -> Self {
        Self {
            base,
            size: bytes.len() as u64,
            hash: digest_hex(bytes),
            data: keep_data.then(|| bytes.to_vec()),
        }
    }
}

/// Hex SHA-256 digest of `bytes`.
pub fn digest_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hex SHA-256 digest of `words` in little-endian byte order.
pub fn digest_words(words: &[u32]) -> String {
    let mut hasher = Sha256::new();
    for word in words {
        hasher.update(word.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}
