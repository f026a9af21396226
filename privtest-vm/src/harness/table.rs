//! Test-case records and the generator's textual table format.

use super::layout::CodeLayout;
use crate::error::HarnessError;

/// Size of one `{address, value, opcode}` record in bytes.
pub const RECORD_BYTES: u32 = 12;

/// Test behaviours reachable from the dispatcher, named by their labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestOp {
    Write32,
    Write16,
    Write08,
    Read32,
    Read16,
    Read08,
    Executable,
    Terminate,
    GotoBaremetal,
    GotoSv32,
    WriteMxrSum,
    GotoMMode,
    GotoSMode,
    GotoUMode,
    WritePmpcfg,
    WritePmpaddr,
}

impl TestOp {
    pub const COUNT: usize = 16;

    pub const ALL: [TestOp; TestOp::COUNT] = [
        TestOp::Write32,
        TestOp::Write16,
        TestOp::Write08,
        TestOp::Read32,
        TestOp::Read16,
        TestOp::Read08,
        TestOp::Executable,
        TestOp::Terminate,
        TestOp::GotoBaremetal,
        TestOp::GotoSv32,
        TestOp::WriteMxrSum,
        TestOp::GotoMMode,
        TestOp::GotoSMode,
        TestOp::GotoUMode,
        TestOp::WritePmpcfg,
        TestOp::WritePmpaddr,
    ];

    pub fn label(self) -> &'static str {
        match self {
            TestOp::Write32 => "write32_test",
            TestOp::Write16 => "write16_test",
            TestOp::Write08 => "write08_test",
            TestOp::Read32 => "read32_test",
            TestOp::Read16 => "read16_test",
            TestOp::Read08 => "read08_test",
            TestOp::Executable => "executable_test",
            TestOp::Terminate => "terminate_test",
            TestOp::GotoBaremetal => "goto_baremetal",
            TestOp::GotoSv32 => "goto_sv32",
            TestOp::WriteMxrSum => "write_mxr_sum",
            TestOp::GotoMMode => "goto_m_mode",
            TestOp::GotoSMode => "goto_s_mode",
            TestOp::GotoUMode => "goto_u_mode",
            TestOp::WritePmpcfg => "write_pmpcfg_0",
            TestOp::WritePmpaddr => "write_pmpaddr_0",
        }
    }

    pub fn from_label(label: &str) -> Option<TestOp> {
        TestOp::ALL.into_iter().find(|op| op.label() == label)
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestCase {
    pub address: u32,
    pub value: u32,
    pub op: TestOp,
}

impl TestCase {
    pub fn new(address: u32, value: u32, op: TestOp) -> Self {
        Self { address, value, op }
    }

    /// The three table words, with the opcode holding the label address.
    pub fn encode(&self, layout: &CodeLayout) -> [u32; 3] {
        [self.address, self.value, layout.address_of(self.op)]
    }
}

/// Encode `cases` into the flat word table the dispatcher walks.
pub fn encode_table(cases: &[TestCase], layout: &CodeLayout) -> Vec<u32> {
    cases.iter().flat_map(|case| case.encode(layout)).collect()
}

fn parse_number(text: &str) -> Option<u32> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(&hex.replace('_', ""), 16).ok()
    } else {
        text.parse::<u32>().ok()
    }
}

/// Parse `.4byte address, value, label` lines.
///
/// `#` and `//` start comments; label definitions and other directives are
/// skipped.
pub fn parse_vectors(text: &str) -> Result<Vec<TestCase>, HarnessError> {
    let mut cases = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.split("//").next().unwrap_or("");
        let line = line.split('#').next().unwrap_or("").trim();
        let Some(rest) = line.strip_prefix(".4byte") else {
            continue;
        };

        let fields: Vec<&str> = rest.split(',').map(str::trim).collect();
        let &[address, value, label] = fields.as_slice() else {
            return Err(HarnessError::MalformedVector {
                line: line_no,
                reason: format!("expected 3 fields, found {}", fields.len()),
            });
        };
        let malformed = |field: &str| HarnessError::MalformedVector {
            line: line_no,
            reason: format!("bad number `{}`", field),
        };
        let address = parse_number(address).ok_or_else(|| malformed(address))?;
        let value = parse_number(value).ok_or_else(|| malformed(value))?;
        let op = TestOp::from_label(label).ok_or_else(|| HarnessError::UnknownLabel(label.to_string()))?;
        cases.push(TestCase::new(address, value, op));
    }
    Ok(cases)
}
