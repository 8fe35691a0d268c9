use super::Nes;
use super::opcodes::{AddrMode, Mnemonic, decode};

impl Nes {
    /// Formats the instruction at PC in the nestest.log layout. Only peeks
    /// memory, so tracing never disturbs the machine.
    pub(crate) fn trace_line(&self) -> String {
        let pc = self.pc;
        let opcode = self.peek_mem(pc);
        let decoded = decode(opcode);
        let len = decoded.mode.operand_len();

        let mut bytes = format!("{opcode:02X}");
        for offset in 1..=len {
            bytes.push_str(&format!(" {:02X}", self.peek_mem(pc.wrapping_add(offset))));
        }
        let marker = if decoded.illegal { '*' } else { ' ' };
        let disassembly = self.disassemble(pc, decoded.mnemonic, decoded.mode);

        format!(
            "{:04X}  {:<9}{}{:<32}A:{:02X} X:{:02X} Y:{:02X} P:{:02X} SP:{:02X} PPU:{:>3},{:>3} CYC:{}",
            pc,
            bytes,
            marker,
            disassembly,
            self.a,
            self.x,
            self.y,
            self.p,
            self.sp,
            self.ppu.scanline(),
            self.ppu.dot(),
            self.cycles
        )
    }

    fn disassemble(&self, pc: u16, mnemonic: Mnemonic, mode: AddrMode) -> String {
        let name = mnemonic.name();
        let byte = self.peek_mem(pc.wrapping_add(1));
        let word = u16::from_le_bytes([byte, self.peek_mem(pc.wrapping_add(2))]);
        let jump = matches!(mnemonic, Mnemonic::Jmp | Mnemonic::Jsr);

        match mode {
            AddrMode::Imp => name.to_string(),
            AddrMode::Acc => format!("{name} A"),
            AddrMode::Imm => format!("{name} #${byte:02X}"),
            AddrMode::Zp => format!("{name} ${byte:02X} = {:02X}", self.peek_mem(byte as u16)),
            AddrMode::ZpX | AddrMode::ZpY => {
                let (index, reg) = if mode == AddrMode::ZpX {
                    (self.x, 'X')
                } else {
                    (self.y, 'Y')
                };
                let addr = byte.wrapping_add(index);
                format!(
                    "{name} ${byte:02X},{reg} @ {addr:02X} = {:02X}",
                    self.peek_mem(addr as u16)
                )
            }
            AddrMode::Abs if jump => format!("{name} ${word:04X}"),
            AddrMode::Abs => format!("{name} ${word:04X} = {:02X}", self.peek_mem(word)),
            AddrMode::AbsX | AddrMode::AbsXW | AddrMode::AbsY | AddrMode::AbsYW => {
                let (index, reg) = if matches!(mode, AddrMode::AbsX | AddrMode::AbsXW) {
                    (self.x, 'X')
                } else {
                    (self.y, 'Y')
                };
                let addr = word.wrapping_add(index as u16);
                format!(
                    "{name} ${word:04X},{reg} @ {addr:04X} = {:02X}",
                    self.peek_mem(addr)
                )
            }
            AddrMode::Ind => {
                let target = self.peek_u16_wrapped(word);
                format!("{name} (${word:04X}) = {target:04X}")
            }
            AddrMode::IndX => {
                let ptr = byte.wrapping_add(self.x);
                let addr = self.peek_zp_u16(ptr);
                format!(
                    "{name} (${byte:02X},X) @ {ptr:02X} = {addr:04X} = {:02X}",
                    self.peek_mem(addr)
                )
            }
            AddrMode::IndY | AddrMode::IndYW => {
                let base = self.peek_zp_u16(byte);
                let addr = base.wrapping_add(self.y as u16);
                format!(
                    "{name} (${byte:02X}),Y = {base:04X} @ {addr:04X} = {:02X}",
                    self.peek_mem(addr)
                )
            }
            AddrMode::Rel => {
                let target = pc.wrapping_add(2).wrapping_add(byte as i8 as i16 as u16);
                format!("{name} ${target:04X}")
            }
        }
    }

    fn peek_zp_u16(&self, addr: u8) -> u16 {
        u16::from_le_bytes([
            self.peek_mem(addr as u16),
            self.peek_mem(addr.wrapping_add(1) as u16),
        ])
    }

    fn peek_u16_wrapped(&self, addr: u16) -> u16 {
        let hi_addr = (addr & 0xFF00) | (addr.wrapping_add(1) & 0x00FF);
        u16::from_le_bytes([self.peek_mem(addr), self.peek_mem(hi_addr)])
    }
}

#[cfg(test)]
mod tests {
    use crate::nes::tests::machine;

    #[test]
    fn first_line_matches_nestest_layout() {
        let nes = machine(&[0x4C, 0xF5, 0xC5]);
        assert_eq!(
            nes.trace_line(),
            "8000  4C F5 C5  JMP $C5F5                       A:00 X:00 Y:00 P:24 SP:FD PPU:  0, 21 CYC:7"
        );
    }

    #[test]
    fn illegal_opcodes_carry_a_star() {
        let mut nes = machine(&[0x04, 0xA9]);
        nes.poke_mem(0x00A9, 0x00);
        let line = nes.trace_line();
        assert!(line.starts_with("8000  04 A9    *NOP $A9 = 00"), "{line}");
    }

    #[test]
    fn indirect_modes_show_pointer_and_value() {
        let mut nes = machine(&[0xB1, 0x89, 0xA1, 0x80]);
        nes.poke_mem(0x0089, 0x00);
        nes.poke_mem(0x008A, 0x03);
        nes.poke_mem(0x0300, 0x89);
        let line = nes.trace_line();
        assert!(
            line.contains("LDA ($89),Y = 0300 @ 0300 = 89"),
            "{line}"
        );
    }

    #[test]
    fn relative_branches_print_their_target() {
        let nes = machine(&[0xD0, 0xFE]);
        assert!(nes.trace_line().contains("BNE $8000"));
    }

    #[test]
    fn tracing_collects_one_line_per_instruction() {
        let mut nes = machine(&[0xEA, 0xEA, 0xEA]);
        nes.set_trace_logging(true);
        for _ in 0..3 {
            nes.step().unwrap();
        }
        let lines = nes.take_trace();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("8001  EA        NOP"));
        assert!(nes.take_trace().is_empty());
    }
}
