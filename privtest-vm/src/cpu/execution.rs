use super::core::Hart;
use super::decoder::Op;
use super::types::INSTRUCTION_BYTES;
use crate::Trap;
use crate::bus::Bus;

impl Hart {
    /// Execute one instruction at `pc`.
    ///
    /// On success `pc` has moved to the next instruction. On a trap `pc` is
    /// left at the faulting instruction and the trap is returned; the caller
    /// owns trap entry.
    pub fn step(&mut self, bus: &mut dyn Bus) -> Result<(), Trap> {
        let pc = self.pc;
        let op = self.fetch(bus, pc)?;
        let mut next_pc = pc.wrapping_add(INSTRUCTION_BYTES);

        match op {
            Op::Lui { rd, imm } => {
                self.write_reg(rd.to_usize(), imm as u32);
            }
            Op::Auipc { rd, imm } => {
                self.write_reg(rd.to_usize(), pc.wrapping_add(imm as u32));
            }
            Op::Jal { rd, imm } => {
                let target = pc.wrapping_add(imm as u32);
                if target % INSTRUCTION_BYTES != 0 {
                    return Err(Trap::InstructionAddressMisaligned(target));
                }
                self.write_reg(rd.to_usize(), next_pc);
                next_pc = target;
            }
            Op::Jalr { rd, rs1, imm } => {
                let target = self.read_reg(rs1.to_usize()).wrapping_add(imm as u32) & !1;
                if target % INSTRUCTION_BYTES != 0 {
                    return Err(Trap::InstructionAddressMisaligned(target));
                }
                self.write_reg(rd.to_usize(), next_pc);
                next_pc = target;
            }
            Op::OpImm {
                rd,
                rs1,
                imm,
                funct3,
                funct7,
            } => {
                let val1 = self.read_reg(rs1.to_usize());
                let shamt = (imm as u32) & 0x1F;
                let res = match (funct3, funct7) {
                    (0, _) => val1.wrapping_add(imm as u32), // ADDI
                    (2, _) => ((val1 as i32) < imm) as u32,  // SLTI
                    (3, _) => (val1 < imm as u32) as u32,    // SLTIU
                    (4, _) => val1 ^ (imm as u32),           // XORI
                    (6, _) => val1 | (imm as u32),           // ORI
                    (7, _) => val1 & (imm as u32),           // ANDI
                    (1, 0x00) => val1 << shamt,              // SLLI
                    (5, 0x00) => val1 >> shamt,              // SRLI
                    (5, 0x20) => ((val1 as i32) >> shamt) as u32, // SRAI
                    _ => return Err(self.illegal(bus, pc)),
                };
                self.write_reg(rd.to_usize(), res);
            }
            Op::Op {
                rd,
                rs1,
                rs2,
                funct3,
                funct7,
            } => {
                let val1 = self.read_reg(rs1.to_usize());
                let val2 = self.read_reg(rs2.to_usize());
                let shamt = val2 & 0x1F;
                let res = match (funct3, funct7) {
                    (0, 0x00) => val1.wrapping_add(val2),
                    (0, 0x20) => val1.wrapping_sub(val2),
                    (1, 0x00) => val1 << shamt,
                    (2, 0x00) => ((val1 as i32) < (val2 as i32)) as u32,
                    (3, 0x00) => (val1 < val2) as u32,
                    (4, 0x00) => val1 ^ val2,
                    (5, 0x00) => val1 >> shamt,
                    (5, 0x20) => ((val1 as i32) >> shamt) as u32,
                    (6, 0x00) => val1 | val2,
                    (7, 0x00) => val1 & val2,
                    _ => return Err(self.illegal(bus, pc)),
                };
                self.write_reg(rd.to_usize(), res);
            }
            Op::Ecall => return Err(Trap::ecall_from(self.mode)),
            Op::Ebreak => return Err(Trap::Breakpoint),
        }

        self.pc = next_pc;
        Ok(())
    }

    /// Illegal-instruction trap carrying the raw encoding as `mtval`.
    fn illegal(&mut self, bus: &mut dyn Bus, pc: u32) -> Trap {
        let raw = self
            .translate(bus, pc, crate::mmu::AccessType::Instruction)
            .and_then(|pa| bus.read32(pa))
            .unwrap_or(0);
        Trap::IllegalInstruction(raw)
    }
}
