use serde::{Deserialize, Serialize};

use super::error::EmuError;
use super::opcodes::{AddrMode, Mnemonic, decode};
use super::{
    FLAG_BREAK, FLAG_CARRY, FLAG_DECIMAL, FLAG_INTERRUPT, FLAG_NEGATIVE, FLAG_OVERFLOW,
    FLAG_UNUSED, FLAG_ZERO, Nes,
};

pub(crate) const NMI_VECTOR: u16 = 0xFFFA;
pub(crate) const RESET_VECTOR: u16 = 0xFFFC;
pub(crate) const IRQ_VECTOR: u16 = 0xFFFE;

/// An interrupt input sampled at the end of every bus cycle. `pending` is
/// the value seen this cycle and `active` the one from the cycle before,
/// which is what the CPU polls after an instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayedFlag {
    pub pending: bool,
    pub active: bool,
}

impl DelayedFlag {
    pub fn clock(&mut self, value: bool) {
        self.active = self.pending;
        self.pending = value;
    }
}

impl Nes {
    /// Power-on and reset share the same seven cycles: two reads at PC,
    /// three suppressed stack pushes, then the vector fetch.
    pub(crate) fn run_reset_sequence(&mut self) {
        self.dummy_read(self.pc);
        self.dummy_read(self.pc);
        for _ in 0..3 {
            self.dummy_read(0x0100 | self.sp as u16);
            self.sp = self.sp.wrapping_sub(1);
        }
        self.set_flag(FLAG_INTERRUPT, true);
        self.pc = self.read_u16(RESET_VECTOR);
    }

    pub(crate) fn execute_instruction(&mut self) {
        let opcode_pc = self.pc;
        let opcode = self.fetch_byte();
        let decoded = decode(opcode);
        let mode = decoded.mode;

        match decoded.mnemonic {
            Mnemonic::Lda => {
                let value = self.read_operand(mode);
                self.a = value;
                self.update_zn(value);
            }
            Mnemonic::Ldx => {
                let value = self.read_operand(mode);
                self.x = value;
                self.update_zn(value);
            }
            Mnemonic::Ldy => {
                let value = self.read_operand(mode);
                self.y = value;
                self.update_zn(value);
            }
            Mnemonic::Lax => {
                let value = self.read_operand(mode);
                self.a = value;
                self.x = value;
                self.update_zn(value);
            }
            Mnemonic::Sta => self.store(mode, self.a),
            Mnemonic::Stx => self.store(mode, self.x),
            Mnemonic::Sty => self.store(mode, self.y),
            Mnemonic::Sax => self.store(mode, self.a & self.x),

            Mnemonic::Adc => {
                let value = self.read_operand(mode);
                self.adc(value);
            }
            Mnemonic::Sbc => {
                let value = self.read_operand(mode);
                self.sbc(value);
            }
            Mnemonic::And => {
                let value = self.read_operand(mode);
                self.and(value);
            }
            Mnemonic::Ora => {
                let value = self.read_operand(mode);
                self.ora(value);
            }
            Mnemonic::Eor => {
                let value = self.read_operand(mode);
                self.eor(value);
            }
            Mnemonic::Cmp => {
                let value = self.read_operand(mode);
                self.compare(self.a, value);
            }
            Mnemonic::Cpx => {
                let value = self.read_operand(mode);
                self.compare(self.x, value);
            }
            Mnemonic::Cpy => {
                let value = self.read_operand(mode);
                self.compare(self.y, value);
            }
            Mnemonic::Bit => {
                let value = self.read_operand(mode);
                self.bit(value);
            }

            Mnemonic::Asl => {
                self.rmw(mode, RmwOp::Asl);
            }
            Mnemonic::Lsr => {
                self.rmw(mode, RmwOp::Lsr);
            }
            Mnemonic::Rol => {
                self.rmw(mode, RmwOp::Rol);
            }
            Mnemonic::Ror => {
                self.rmw(mode, RmwOp::Ror);
            }
            Mnemonic::Inc => {
                self.rmw(mode, RmwOp::Inc);
            }
            Mnemonic::Dec => {
                self.rmw(mode, RmwOp::Dec);
            }
            Mnemonic::Slo => {
                let value = self.rmw(mode, RmwOp::Asl);
                self.ora(value);
            }
            Mnemonic::Rla => {
                let value = self.rmw(mode, RmwOp::Rol);
                self.and(value);
            }
            Mnemonic::Sre => {
                let value = self.rmw(mode, RmwOp::Lsr);
                self.eor(value);
            }
            Mnemonic::Rra => {
                let value = self.rmw(mode, RmwOp::Ror);
                self.adc(value);
            }
            Mnemonic::Dcp => {
                let value = self.rmw(mode, RmwOp::Dec);
                self.compare(self.a, value);
            }
            Mnemonic::Isc => {
                let value = self.rmw(mode, RmwOp::Inc);
                self.sbc(value);
            }

            Mnemonic::Inx => self.implied(|cpu| {
                cpu.x = cpu.x.wrapping_add(1);
                cpu.update_zn(cpu.x);
            }),
            Mnemonic::Iny => self.implied(|cpu| {
                cpu.y = cpu.y.wrapping_add(1);
                cpu.update_zn(cpu.y);
            }),
            Mnemonic::Dex => self.implied(|cpu| {
                cpu.x = cpu.x.wrapping_sub(1);
                cpu.update_zn(cpu.x);
            }),
            Mnemonic::Dey => self.implied(|cpu| {
                cpu.y = cpu.y.wrapping_sub(1);
                cpu.update_zn(cpu.y);
            }),
            Mnemonic::Tax => self.implied(|cpu| {
                cpu.x = cpu.a;
                cpu.update_zn(cpu.x);
            }),
            Mnemonic::Tay => self.implied(|cpu| {
                cpu.y = cpu.a;
                cpu.update_zn(cpu.y);
            }),
            Mnemonic::Txa => self.implied(|cpu| {
                cpu.a = cpu.x;
                cpu.update_zn(cpu.a);
            }),
            Mnemonic::Tya => self.implied(|cpu| {
                cpu.a = cpu.y;
                cpu.update_zn(cpu.a);
            }),
            Mnemonic::Tsx => self.implied(|cpu| {
                cpu.x = cpu.sp;
                cpu.update_zn(cpu.x);
            }),
            Mnemonic::Txs => self.implied(|cpu| cpu.sp = cpu.x),
            Mnemonic::Clc => self.implied(|cpu| cpu.set_flag(FLAG_CARRY, false)),
            Mnemonic::Sec => self.implied(|cpu| cpu.set_flag(FLAG_CARRY, true)),
            Mnemonic::Cli => self.implied(|cpu| cpu.set_flag(FLAG_INTERRUPT, false)),
            Mnemonic::Sei => self.implied(|cpu| cpu.set_flag(FLAG_INTERRUPT, true)),
            Mnemonic::Clv => self.implied(|cpu| cpu.set_flag(FLAG_OVERFLOW, false)),
            Mnemonic::Cld => self.implied(|cpu| cpu.set_flag(FLAG_DECIMAL, false)),
            Mnemonic::Sed => self.implied(|cpu| cpu.set_flag(FLAG_DECIMAL, true)),
            Mnemonic::Nop => {
                if mode == AddrMode::Imp {
                    self.dummy_read(self.pc);
                } else {
                    self.read_operand(mode);
                }
            }

            Mnemonic::Bpl => self.branch(!self.get_flag(FLAG_NEGATIVE)),
            Mnemonic::Bmi => self.branch(self.get_flag(FLAG_NEGATIVE)),
            Mnemonic::Bvc => self.branch(!self.get_flag(FLAG_OVERFLOW)),
            Mnemonic::Bvs => self.branch(self.get_flag(FLAG_OVERFLOW)),
            Mnemonic::Bcc => self.branch(!self.get_flag(FLAG_CARRY)),
            Mnemonic::Bcs => self.branch(self.get_flag(FLAG_CARRY)),
            Mnemonic::Bne => self.branch(!self.get_flag(FLAG_ZERO)),
            Mnemonic::Beq => self.branch(self.get_flag(FLAG_ZERO)),

            Mnemonic::Jmp => {
                self.pc = if mode == AddrMode::Ind {
                    let ptr = self.fetch_word();
                    self.read_u16_wrapped(ptr)
                } else {
                    self.fetch_word()
                };
            }
            Mnemonic::Jsr => {
                let lo = self.fetch_byte();
                self.dummy_read(0x0100 | self.sp as u16);
                self.push_u16(self.pc);
                let hi = self.fetch_byte();
                self.pc = u16::from_le_bytes([lo, hi]);
            }
            Mnemonic::Rts => {
                self.dummy_read(self.pc);
                self.dummy_read(0x0100 | self.sp as u16);
                self.pc = self.pop_u16();
                self.dummy_read(self.pc);
                self.pc = self.pc.wrapping_add(1);
            }
            Mnemonic::Rti => {
                self.dummy_read(self.pc);
                self.dummy_read(0x0100 | self.sp as u16);
                let status = self.pop();
                self.p = (status & !FLAG_BREAK) | FLAG_UNUSED;
                self.pc = self.pop_u16();
            }
            Mnemonic::Brk => self.brk(),
            Mnemonic::Pha => {
                self.dummy_read(self.pc);
                self.push(self.a);
            }
            Mnemonic::Php => {
                self.dummy_read(self.pc);
                self.push(self.p | FLAG_BREAK | FLAG_UNUSED);
            }
            Mnemonic::Pla => {
                self.dummy_read(self.pc);
                self.dummy_read(0x0100 | self.sp as u16);
                self.a = self.pop();
                self.update_zn(self.a);
            }
            Mnemonic::Plp => {
                self.dummy_read(self.pc);
                self.dummy_read(0x0100 | self.sp as u16);
                let status = self.pop();
                self.p = (status & !FLAG_BREAK) | FLAG_UNUSED;
            }

            Mnemonic::Anc => {
                let value = self.read_operand(mode);
                self.and(value);
                self.set_flag(FLAG_CARRY, self.get_flag(FLAG_NEGATIVE));
            }
            Mnemonic::Alr => {
                let value = self.read_operand(mode);
                self.and(value);
                self.a = self.lsr(self.a);
            }
            Mnemonic::Arr => {
                let value = self.read_operand(mode);
                let carry = if self.get_flag(FLAG_CARRY) { 0x80 } else { 0 };
                self.a = ((self.a & value) >> 1) | carry;
                self.update_zn(self.a);
                self.set_flag(FLAG_CARRY, (self.a & 0x40) != 0);
                self.set_flag(
                    FLAG_OVERFLOW,
                    (((self.a >> 6) ^ (self.a >> 5)) & 0x01) != 0,
                );
            }
            Mnemonic::Axs => {
                let value = self.read_operand(mode);
                let masked = self.a & self.x;
                self.set_flag(FLAG_CARRY, masked >= value);
                self.x = masked.wrapping_sub(value);
                self.update_zn(self.x);
            }
            Mnemonic::Xaa => {
                let value = self.read_operand(mode);
                self.a = (self.a | 0xEE) & self.x & value;
                self.update_zn(self.a);
            }
            Mnemonic::Lxa => {
                let value = self.read_operand(mode);
                self.a = value;
                self.x = value;
                self.update_zn(value);
            }
            Mnemonic::Las => {
                let value = self.read_operand(mode) & self.sp;
                self.a = value;
                self.x = value;
                self.sp = value;
                self.update_zn(value);
            }
            Mnemonic::Sha => self.unstable_store(mode, self.a & self.x),
            Mnemonic::Shx => self.unstable_store(mode, self.x),
            Mnemonic::Shy => self.unstable_store(mode, self.y),
            Mnemonic::Tas => {
                self.sp = self.a & self.x;
                self.unstable_store(mode, self.sp);
            }

            Mnemonic::Kil => {
                self.pc = opcode_pc;
                self.raise_fault(EmuError::CpuJam {
                    opcode,
                    pc: opcode_pc,
                });
            }
        }
    }

    /// Runs the seven-cycle NMI/IRQ entry. The vector is picked after PC is
    /// pushed, so an NMI arriving in time takes over an IRQ sequence.
    pub(crate) fn service_interrupt(&mut self) {
        self.dummy_read(self.pc);
        self.dummy_read(self.pc);
        self.push_u16(self.pc);

        let nmi = self.nmi.pending;
        let vector = if nmi {
            self.nmi.pending = false;
            NMI_VECTOR
        } else {
            IRQ_VECTOR
        };
        self.push((self.p & !FLAG_BREAK) | FLAG_UNUSED);
        self.set_flag(FLAG_INTERRUPT, true);
        self.pc = self.read_u16(vector);

        if nmi {
            self.nmi_serviced_count = self.nmi_serviced_count.wrapping_add(1);
        } else {
            self.irq_serviced_count = self.irq_serviced_count.wrapping_add(1);
            self.push_debug_event(format!("IRQ serviced -> PC=${:04X}", self.pc));
        }
    }

    fn brk(&mut self) {
        self.fetch_byte();
        self.push_u16(self.pc);
        let vector = if self.nmi.pending {
            self.nmi.pending = false;
            NMI_VECTOR
        } else {
            IRQ_VECTOR
        };
        self.push(self.p | FLAG_BREAK | FLAG_UNUSED);
        self.set_flag(FLAG_INTERRUPT, true);
        self.pc = self.read_u16(vector);
        // The hijacked NMI must not fire again right after the handler's first instruction.
        self.nmi.active = false;
    }

    fn implied(&mut self, op: impl FnOnce(&mut Self)) {
        self.dummy_read(self.pc);
        op(self);
    }

    fn read_operand(&mut self, mode: AddrMode) -> u8 {
        if mode == AddrMode::Imm {
            return self.fetch_byte();
        }
        let (addr, _) = self.effective_address(mode);
        self.cpu_read(addr)
    }

    fn store(&mut self, mode: AddrMode, value: u8) {
        let (addr, _) = self.effective_address(mode);
        self.cpu_write(addr, value);
    }

    /// SHA/SHX/SHY/TAS: the stored value is ANDed with the base high byte
    /// plus one, and a page-crossing index lands on that value's page.
    fn unstable_store(&mut self, mode: AddrMode, value: u8) {
        let (addr, base) = self.effective_address(mode);
        let hi = (base >> 8) as u8;
        let result = value & hi.wrapping_add(1);
        let target = if (base ^ addr) & 0xFF00 != 0 {
            ((result as u16) << 8) | (addr & 0x00FF)
        } else {
            addr
        };
        self.cpu_write(target, result);
    }

    /// Returns the effective address together with the un-indexed base,
    /// performing the addressing mode's bus cycles.
    fn effective_address(&mut self, mode: AddrMode) -> (u16, u16) {
        match mode {
            AddrMode::Zp => {
                let addr = self.fetch_byte() as u16;
                (addr, addr)
            }
            AddrMode::ZpX | AddrMode::ZpY => {
                let base = self.fetch_byte();
                self.dummy_read(base as u16);
                let index = if mode == AddrMode::ZpX { self.x } else { self.y };
                (base.wrapping_add(index) as u16, base as u16)
            }
            AddrMode::Abs => {
                let addr = self.fetch_word();
                (addr, addr)
            }
            AddrMode::AbsX | AddrMode::AbsY | AddrMode::AbsXW | AddrMode::AbsYW => {
                let base = self.fetch_word();
                let index = match mode {
                    AddrMode::AbsX | AddrMode::AbsXW => self.x,
                    _ => self.y,
                };
                let addr = base.wrapping_add(index as u16);
                let always = matches!(mode, AddrMode::AbsXW | AddrMode::AbsYW);
                self.index_penalty(base, addr, always);
                (addr, base)
            }
            AddrMode::IndX => {
                let zp = self.fetch_byte();
                self.dummy_read(zp as u16);
                let addr = self.read_zp_u16(zp.wrapping_add(self.x));
                (addr, addr)
            }
            AddrMode::IndY | AddrMode::IndYW => {
                let zp = self.fetch_byte();
                let base = self.read_zp_u16(zp);
                let addr = base.wrapping_add(self.y as u16);
                self.index_penalty(base, addr, mode == AddrMode::IndYW);
                (addr, base)
            }
            AddrMode::Ind => {
                let ptr = self.fetch_word();
                let addr = self.read_u16_wrapped(ptr);
                (addr, ptr)
            }
            AddrMode::Imp | AddrMode::Acc | AddrMode::Imm | AddrMode::Rel => (self.pc, self.pc),
        }
    }

    /// The extra cycle of indexed modes reads the address with the
    /// un-carried high byte.
    fn index_penalty(&mut self, base: u16, addr: u16, always: bool) {
        if always || (base & 0xFF00) != (addr & 0xFF00) {
            self.dummy_read((base & 0xFF00) | (addr & 0x00FF));
        }
    }

    fn read_zp_u16(&mut self, addr: u8) -> u16 {
        let lo = self.cpu_read(addr as u16);
        let hi = self.cpu_read(addr.wrapping_add(1) as u16);
        u16::from_le_bytes([lo, hi])
    }

    fn rmw(&mut self, mode: AddrMode, op: RmwOp) -> u8 {
        if mode == AddrMode::Acc {
            self.dummy_read(self.pc);
            let result = self.apply_rmw(op, self.a);
            self.a = result;
            return result;
        }
        let (addr, _) = self.effective_address(mode);
        let value = self.cpu_read(addr);
        self.cpu_write(addr, value);
        let result = self.apply_rmw(op, value);
        self.cpu_write(addr, result);
        result
    }

    fn apply_rmw(&mut self, op: RmwOp, value: u8) -> u8 {
        match op {
            RmwOp::Asl => self.asl(value),
            RmwOp::Rol => self.rol(value),
            RmwOp::Lsr => self.lsr(value),
            RmwOp::Ror => self.ror(value),
            RmwOp::Dec => {
                let result = value.wrapping_sub(1);
                self.update_zn(result);
                result
            }
            RmwOp::Inc => {
                let result = value.wrapping_add(1);
                self.update_zn(result);
                result
            }
        }
    }

    fn branch(&mut self, condition: bool) {
        let offset = self.fetch_byte() as i8;
        if !condition {
            return;
        }
        // An IRQ first seen during a taken branch's operand cycle waits one
        // more instruction unless the branch crosses a page.
        if self.irq.pending && !self.irq.active {
            self.irq.pending = false;
        }
        let old_pc = self.pc;
        self.dummy_read(old_pc);
        let new_pc = old_pc.wrapping_add(offset as i16 as u16);
        if (old_pc & 0xFF00) != (new_pc & 0xFF00) {
            self.dummy_read((old_pc & 0xFF00) | (new_pc & 0x00FF));
        }
        self.pc = new_pc;
    }

    fn ora(&mut self, value: u8) {
        self.a |= value;
        self.update_zn(self.a);
    }

    fn and(&mut self, value: u8) {
        self.a &= value;
        self.update_zn(self.a);
    }

    fn eor(&mut self, value: u8) {
        self.a ^= value;
        self.update_zn(self.a);
    }

    fn bit(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, (self.a & value) == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
        self.set_flag(FLAG_OVERFLOW, (value & 0x40) != 0);
    }

    fn compare(&mut self, register: u8, value: u8) {
        let result = register.wrapping_sub(value);
        self.set_flag(FLAG_CARRY, register >= value);
        self.update_zn(result);
    }

    fn adc(&mut self, value: u8) {
        let carry_in = u16::from(self.get_flag(FLAG_CARRY));
        let result = self.a as u16 + value as u16 + carry_in;
        let out = result as u8;

        self.set_flag(FLAG_CARRY, result > 0xFF);
        self.set_flag(FLAG_OVERFLOW, ((self.a ^ out) & (value ^ out) & 0x80) != 0);

        self.a = out;
        self.update_zn(self.a);
    }

    fn sbc(&mut self, value: u8) {
        self.adc(value ^ 0xFF);
    }

    fn asl(&mut self, value: u8) -> u8 {
        self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
        let result = value << 1;
        self.update_zn(result);
        result
    }

    fn lsr(&mut self, value: u8) -> u8 {
        self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
        let result = value >> 1;
        self.update_zn(result);
        result
    }

    fn rol(&mut self, value: u8) -> u8 {
        let carry_in = u8::from(self.get_flag(FLAG_CARRY));
        self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
        let result = (value << 1) | carry_in;
        self.update_zn(result);
        result
    }

    fn ror(&mut self, value: u8) -> u8 {
        let carry_in = if self.get_flag(FLAG_CARRY) { 0x80 } else { 0 };
        self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
        let result = (value >> 1) | carry_in;
        self.update_zn(result);
        result
    }
}

#[derive(Clone, Copy)]
enum RmwOp {
    Asl,
    Rol,
    Lsr,
    Ror,
    Dec,
    Inc,
}
