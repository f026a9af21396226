use crate::Trap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register(u8);

impl Register {
    pub const X0: Register = Register(0);

    pub fn from_u32(v: u32) -> Self {
        Register((v & 0x1F) as u8)
    }

    pub fn to_usize(self) -> usize {
        self.0 as usize
    }
}

/// RV32I subset executed by the hart interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Lui {
        rd: Register,
        imm: i32,
    },
    Auipc {
        rd: Register,
        imm: i32,
    },
    Jal {
        rd: Register,
        imm: i32,
    },
    Jalr {
        rd: Register,
        rs1: Register,
        imm: i32,
    },
    OpImm {
        rd: Register,
        rs1: Register,
        imm: i32,
        funct3: u32,
        funct7: u32,
    }, // I-type ALU (ADDI etc)
    Op {
        rd: Register,
        rs1: Register,
        rs2: Register,
        funct3: u32,
        funct7: u32,
    }, // R-type ALU
    Ecall,
    Ebreak,
}

pub fn decode(insn: u32) -> Result<Op, Trap> {
    let opcode = insn & 0x7F;
    let rd = Register::from_u32(insn >> 7);
    let funct3 = (insn >> 12) & 0x7;
    let rs1 = Register::from_u32(insn >> 15);
    let rs2 = Register::from_u32(insn >> 20);
    let funct7 = (insn >> 25) & 0x7F;

    let imm_i = (insn as i32) >> 20;
    // U-type: imm[31:12]
    let imm_u = (insn & 0xFFFF_F000) as i32;
    // J-type: imm[20|10:1|11|19:12]
    let imm_j = {
        let bit31 = (insn >> 31) & 1;
        let bit30_21 = (insn >> 21) & 0x3FF;
        let bit20 = (insn >> 20) & 1;
        let bit19_12 = (insn >> 12) & 0xFF;
        let val = (bit31 << 20) | (bit19_12 << 12) | (bit20 << 11) | (bit30_21 << 1);
        ((val as i32) << 11) >> 11
    };

    match opcode {
        0x37 => Ok(Op::Lui { rd, imm: imm_u }),
        0x17 => Ok(Op::Auipc { rd, imm: imm_u }),
        0x6F => Ok(Op::Jal { rd, imm: imm_j }),
        0x67 if funct3 == 0 => Ok(Op::Jalr {
            rd,
            rs1,
            imm: imm_i,
        }),
        0x13 => Ok(Op::OpImm {
            rd,
            rs1,
            imm: imm_i,
            funct3,
            funct7,
        }),
        0x33 => Ok(Op::Op {
            rd,
            rs1,
            rs2,
            funct3,
            funct7,
        }),
        0x73 if insn == 0x0000_0073 => Ok(Op::Ecall),
        0x73 if insn == 0x0010_0073 => Ok(Op::Ebreak),
        _ => Err(Trap::IllegalInstruction(insn)),
    }
}
