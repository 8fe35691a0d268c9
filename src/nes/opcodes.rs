/// How an instruction locates its operand. The `W` variants are the
/// store/read-modify-write forms of the indexed modes: they always spend the
/// extra cycle on a dummy read instead of only when the index crosses a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrMode {
    Imp,
    Acc,
    Imm,
    Zp,
    ZpX,
    ZpY,
    Abs,
    AbsX,
    AbsY,
    AbsXW,
    AbsYW,
    Ind,
    IndX,
    IndY,
    IndYW,
    Rel,
}

impl AddrMode {
    /// Bytes following the opcode.
    pub fn operand_len(self) -> u16 {
        match self {
            Self::Imp | Self::Acc => 0,
            Self::Imm | Self::Zp | Self::ZpX | Self::ZpY => 1,
            Self::IndX | Self::IndY | Self::IndYW | Self::Rel => 1,
            Self::Abs | Self::AbsX | Self::AbsY | Self::AbsXW | Self::AbsYW | Self::Ind => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mnemonic {
    Adc,
    And,
    Asl,
    Bcc,
    Bcs,
    Beq,
    Bit,
    Bmi,
    Bne,
    Bpl,
    Brk,
    Bvc,
    Bvs,
    Clc,
    Cld,
    Cli,
    Clv,
    Cmp,
    Cpx,
    Cpy,
    Dec,
    Dex,
    Dey,
    Eor,
    Inc,
    Inx,
    Iny,
    Jmp,
    Jsr,
    Lda,
    Ldx,
    Ldy,
    Lsr,
    Nop,
    Ora,
    Pha,
    Php,
    Pla,
    Plp,
    Rol,
    Ror,
    Rti,
    Rts,
    Sbc,
    Sec,
    Sed,
    Sei,
    Sta,
    Stx,
    Sty,
    Tax,
    Tay,
    Tsx,
    Txa,
    Txs,
    Tya,
    // Undocumented.
    Alr,
    Anc,
    Arr,
    Axs,
    Dcp,
    Isc,
    Kil,
    Las,
    Lax,
    Lxa,
    Rla,
    Rra,
    Sax,
    Sha,
    Shx,
    Shy,
    Slo,
    Sre,
    Tas,
    Xaa,
}

impl Mnemonic {
    pub fn name(self) -> &'static str {
        match self {
            Self::Adc => "ADC",
            Self::And => "AND",
            Self::Asl => "ASL",
            Self::Bcc => "BCC",
            Self::Bcs => "BCS",
            Self::Beq => "BEQ",
            Self::Bit => "BIT",
            Self::Bmi => "BMI",
            Self::Bne => "BNE",
            Self::Bpl => "BPL",
            Self::Brk => "BRK",
            Self::Bvc => "BVC",
            Self::Bvs => "BVS",
            Self::Clc => "CLC",
            Self::Cld => "CLD",
            Self::Cli => "CLI",
            Self::Clv => "CLV",
            Self::Cmp => "CMP",
            Self::Cpx => "CPX",
            Self::Cpy => "CPY",
            Self::Dec => "DEC",
            Self::Dex => "DEX",
            Self::Dey => "DEY",
            Self::Eor => "EOR",
            Self::Inc => "INC",
            Self::Inx => "INX",
            Self::Iny => "INY",
            Self::Jmp => "JMP",
            Self::Jsr => "JSR",
            Self::Lda => "LDA",
            Self::Ldx => "LDX",
            Self::Ldy => "LDY",
            Self::Lsr => "LSR",
            Self::Nop => "NOP",
            Self::Ora => "ORA",
            Self::Pha => "PHA",
            Self::Php => "PHP",
            Self::Pla => "PLA",
            Self::Plp => "PLP",
            Self::Rol => "ROL",
            Self::Ror => "ROR",
            Self::Rti => "RTI",
            Self::Rts => "RTS",
            Self::Sbc => "SBC",
            Self::Sec => "SEC",
            Self::Sed => "SED",
            Self::Sei => "SEI",
            Self::Sta => "STA",
            Self::Stx => "STX",
            Self::Sty => "STY",
            Self::Tax => "TAX",
            Self::Tay => "TAY",
            Self::Tsx => "TSX",
            Self::Txa => "TXA",
            Self::Txs => "TXS",
            Self::Tya => "TYA",
            Self::Alr => "ALR",
            Self::Anc => "ANC",
            Self::Arr => "ARR",
            Self::Axs => "AXS",
            Self::Dcp => "DCP",
            // nestest spelling
            Self::Isc => "ISB",
            Self::Kil => "KIL",
            Self::Las => "LAS",
            Self::Lax => "LAX",
            Self::Lxa => "LXA",
            Self::Rla => "RLA",
            Self::Rra => "RRA",
            Self::Sax => "SAX",
            Self::Sha => "SHA",
            Self::Shx => "SHX",
            Self::Shy => "SHY",
            Self::Slo => "SLO",
            Self::Sre => "SRE",
            Self::Tas => "TAS",
            Self::Xaa => "XAA",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcode {
    pub mnemonic: Mnemonic,
    pub mode: AddrMode,
    pub illegal: bool,
}

const fn op(mnemonic: Mnemonic, mode: AddrMode) -> Opcode {
    Opcode {
        mnemonic,
        mode,
        illegal: false,
    }
}

const fn un(mnemonic: Mnemonic, mode: AddrMode) -> Opcode {
    Opcode {
        mnemonic,
        mode,
        illegal: true,
    }
}

pub fn decode(opcode: u8) -> Opcode {
    OPCODES[opcode as usize]
}

#[rustfmt::skip]
static OPCODES: [Opcode; 256] = {
    use AddrMode::*;
    use Mnemonic::*;
    [
        // 0x00
        op(Brk, Imp), op(Ora, IndX), un(Kil, Imp), un(Slo, IndX),
        un(Nop, Zp), op(Ora, Zp), op(Asl, Zp), un(Slo, Zp),
        op(Php, Imp), op(Ora, Imm), op(Asl, Acc), un(Anc, Imm),
        un(Nop, Abs), op(Ora, Abs), op(Asl, Abs), un(Slo, Abs),
        // 0x10
        op(Bpl, Rel), op(Ora, IndY), un(Kil, Imp), un(Slo, IndYW),
        un(Nop, ZpX), op(Ora, ZpX), op(Asl, ZpX), un(Slo, ZpX),
        op(Clc, Imp), op(Ora, AbsY), un(Nop, Imp), un(Slo, AbsYW),
        un(Nop, AbsX), op(Ora, AbsX), op(Asl, AbsXW), un(Slo, AbsXW),
        // 0x20
        op(Jsr, Abs), op(And, IndX), un(Kil, Imp), un(Rla, IndX),
        op(Bit, Zp), op(And, Zp), op(Rol, Zp), un(Rla, Zp),
        op(Plp, Imp), op(And, Imm), op(Rol, Acc), un(Anc, Imm),
        op(Bit, Abs), op(And, Abs), op(Rol, Abs), un(Rla, Abs),
        // 0x30
        op(Bmi, Rel), op(And, IndY), un(Kil, Imp), un(Rla, IndYW),
        un(Nop, ZpX), op(And, ZpX), op(Rol, ZpX), un(Rla, ZpX),
        op(Sec, Imp), op(And, AbsY), un(Nop, Imp), un(Rla, AbsYW),
        un(Nop, AbsX), op(And, AbsX), op(Rol, AbsXW), un(Rla, AbsXW),
        // 0x40
        op(Rti, Imp), op(Eor, IndX), un(Kil, Imp), un(Sre, IndX),
        un(Nop, Zp), op(Eor, Zp), op(Lsr, Zp), un(Sre, Zp),
        op(Pha, Imp), op(Eor, Imm), op(Lsr, Acc), un(Alr, Imm),
        op(Jmp, Abs), op(Eor, Abs), op(Lsr, Abs), un(Sre, Abs),
        // 0x50
        op(Bvc, Rel), op(Eor, IndY), un(Kil, Imp), un(Sre, IndYW),
        un(Nop, ZpX), op(Eor, ZpX), op(Lsr, ZpX), un(Sre, ZpX),
        op(Cli, Imp), op(Eor, AbsY), un(Nop, Imp), un(Sre, AbsYW),
        un(Nop, AbsX), op(Eor, AbsX), op(Lsr, AbsXW), un(Sre, AbsXW),
        // 0x60
        op(Rts, Imp), op(Adc, IndX), un(Kil, Imp), un(Rra, IndX),
        un(Nop, Zp), op(Adc, Zp), op(Ror, Zp), un(Rra, Zp),
        op(Pla, Imp), op(Adc, Imm), op(Ror, Acc), un(Arr, Imm),
        op(Jmp, Ind), op(Adc, Abs), op(Ror, Abs), un(Rra, Abs),
        // 0x70
        op(Bvs, Rel), op(Adc, IndY), un(Kil, Imp), un(Rra, IndYW),
        un(Nop, ZpX), op(Adc, ZpX), op(Ror, ZpX), un(Rra, ZpX),
        op(Sei, Imp), op(Adc, AbsY), un(Nop, Imp), un(Rra, AbsYW),
        un(Nop, AbsX), op(Adc, AbsX), op(Ror, AbsXW), un(Rra, AbsXW),
        // 0x80
        un(Nop, Imm), op(Sta, IndX), un(Nop, Imm), un(Sax, IndX),
        op(Sty, Zp), op(Sta, Zp), op(Stx, Zp), un(Sax, Zp),
        op(Dey, Imp), un(Nop, Imm), op(Txa, Imp), un(Xaa, Imm),
        op(Sty, Abs), op(Sta, Abs), op(Stx, Abs), un(Sax, Abs),
        // 0x90
        op(Bcc, Rel), op(Sta, IndYW), un(Kil, Imp), un(Sha, IndYW),
        op(Sty, ZpX), op(Sta, ZpX), op(Stx, ZpY), un(Sax, ZpY),
        op(Tya, Imp), op(Sta, AbsYW), op(Txs, Imp), un(Tas, AbsYW),
        un(Shy, AbsXW), op(Sta, AbsXW), un(Shx, AbsYW), un(Sha, AbsYW),
        // 0xA0
        op(Ldy, Imm), op(Lda, IndX), op(Ldx, Imm), un(Lax, IndX),
        op(Ldy, Zp), op(Lda, Zp), op(Ldx, Zp), un(Lax, Zp),
        op(Tay, Imp), op(Lda, Imm), op(Tax, Imp), un(Lxa, Imm),
        op(Ldy, Abs), op(Lda, Abs), op(Ldx, Abs), un(Lax, Abs),
        // 0xB0
        op(Bcs, Rel), op(Lda, IndY), un(Kil, Imp), un(Lax, IndY),
        op(Ldy, ZpX), op(Lda, ZpX), op(Ldx, ZpY), un(Lax, ZpY),
        op(Clv, Imp), op(Lda, AbsY), op(Tsx, Imp), un(Las, AbsY),
        op(Ldy, AbsX), op(Lda, AbsX), op(Ldx, AbsY), un(Lax, AbsY),
        // 0xC0
        op(Cpy, Imm), op(Cmp, IndX), un(Nop, Imm), un(Dcp, IndX),
        op(Cpy, Zp), op(Cmp, Zp), op(Dec, Zp), un(Dcp, Zp),
        op(Iny, Imp), op(Cmp, Imm), op(Dex, Imp), un(Axs, Imm),
        op(Cpy, Abs), op(Cmp, Abs), op(Dec, Abs), un(Dcp, Abs),
        // 0xD0
        op(Bne, Rel), op(Cmp, IndY), un(Kil, Imp), un(Dcp, IndYW),
        un(Nop, ZpX), op(Cmp, ZpX), op(Dec, ZpX), un(Dcp, ZpX),
        op(Cld, Imp), op(Cmp, AbsY), un(Nop, Imp), un(Dcp, AbsYW),
        un(Nop, AbsX), op(Cmp, AbsX), op(Dec, AbsXW), un(Dcp, AbsXW),
        // 0xE0
        op(Cpx, Imm), op(Sbc, IndX), un(Nop, Imm), un(Isc, IndX),
        op(Cpx, Zp), op(Sbc, Zp), op(Inc, Zp), un(Isc, Zp),
        op(Inx, Imp), op(Sbc, Imm), op(Nop, Imp), un(Sbc, Imm),
        op(Cpx, Abs), op(Sbc, Abs), op(Inc, Abs), un(Isc, Abs),
        // 0xF0
        op(Beq, Rel), op(Sbc, IndY), un(Kil, Imp), un(Isc, IndYW),
        un(Nop, ZpX), op(Sbc, ZpX), op(Inc, ZpX), un(Isc, ZpX),
        op(Sed, Imp), op(Sbc, AbsY), un(Nop, Imp), un(Isc, AbsYW),
        un(Nop, AbsX), op(Sbc, AbsX), op(Inc, AbsXW), un(Isc, AbsXW),
    ]
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn official_opcode_count_matches_the_documented_set() {
        let official = (0..=255u8).filter(|&code| !decode(code).illegal).count();
        assert_eq!(official, 151);
    }

    #[test]
    fn jam_opcodes_sit_in_the_x2_column() {
        let jams: Vec<u8> = (0..=255u8)
            .filter(|&code| decode(code).mnemonic == Mnemonic::Kil)
            .collect();
        assert_eq!(
            jams,
            vec![0x02, 0x12, 0x22, 0x32, 0x42, 0x52, 0x62, 0x72, 0x92, 0xB2, 0xD2, 0xF2]
        );
    }

    #[test]
    fn stores_and_rmw_always_take_the_fixed_cost_modes() {
        assert_eq!(decode(0x9D).mode, AddrMode::AbsXW);
        assert_eq!(decode(0x91).mode, AddrMode::IndYW);
        assert_eq!(decode(0xFE).mode, AddrMode::AbsXW);
        assert_eq!(decode(0xBD).mode, AddrMode::AbsX);
        assert_eq!(decode(0xB1).mode, AddrMode::IndY);
    }

    #[test]
    fn alternate_sbc_is_flagged_illegal() {
        let alt = decode(0xEB);
        assert_eq!(alt.mnemonic, Mnemonic::Sbc);
        assert!(alt.illegal);
        assert!(!decode(0xE9).illegal);
        assert!(!decode(0xEA).illegal);
        assert_eq!(decode(0xE7).mnemonic.name(), "ISB");
    }
}
