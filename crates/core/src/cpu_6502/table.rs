//! Opcode decode tables for the 6502 core.
//!
//! Two parallel 256-entry lookup tables indexed by the opcode byte: the
//! `(operation, addressing mode)` pair and the base cycle count. Unofficial
//! opcodes decode to [`INVALID`] and are rejected by the CPU at fetch time.

use serde::{Deserialize, Serialize};

/// The 56 documented 6502 operations, plus the `Invalid` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Invalid,
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
}

impl Operation {
    /// Operations that always take the slow indexed path on hardware, so they
    /// never pay the page-crossing penalty: stores and read-modify-write.
    pub fn always_writes(self) -> bool {
        matches!(
            self,
            Operation::Sta
                | Operation::Stx
                | Operation::Sty
                | Operation::Asl
                | Operation::Lsr
                | Operation::Rol
                | Operation::Ror
                | Operation::Inc
                | Operation::Dec
        )
    }

    /// Conditional branch operations.
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Operation::Bcc
                | Operation::Bcs
                | Operation::Beq
                | Operation::Bne
                | Operation::Bmi
                | Operation::Bpl
                | Operation::Bvc
                | Operation::Bvs
        )
    }

    /// Upper-case assembler mnemonic, `"???"` for the sentinel.
    pub fn mnemonic(self) -> &'static str {
        use Operation::*;
        match self {
            Invalid => "???",
            Adc => "ADC",
            And => "AND",
            Asl => "ASL",
            Bcc => "BCC",
            Bcs => "BCS",
            Beq => "BEQ",
            Bit => "BIT",
            Bmi => "BMI",
            Bne => "BNE",
            Bpl => "BPL",
            Brk => "BRK",
            Bvc => "BVC",
            Bvs => "BVS",
            Clc => "CLC",
            Cld => "CLD",
            Cli => "CLI",
            Clv => "CLV",
            Cmp => "CMP",
            Cpx => "CPX",
            Cpy => "CPY",
            Dec => "DEC",
            Dex => "DEX",
            Dey => "DEY",
            Eor => "EOR",
            Inc => "INC",
            Inx => "INX",
            Iny => "INY",
            Jmp => "JMP",
            Jsr => "JSR",
            Lda => "LDA",
            Ldx => "LDX",
            Ldy => "LDY",
            Lsr => "LSR",
            Nop => "NOP",
            Ora => "ORA",
            Pha => "PHA",
            Php => "PHP",
            Pla => "PLA",
            Plp => "PLP",
            Rol => "ROL",
            Ror => "ROR",
            Rti => "RTI",
            Rts => "RTS",
            Sbc => "SBC",
            Sec => "SEC",
            Sed => "SED",
            Sei => "SEI",
            Sta => "STA",
            Stx => "STX",
            Sty => "STY",
            Tax => "TAX",
            Tay => "TAY",
            Tsx => "TSX",
            Txa => "TXA",
            Txs => "TXS",
            Tya => "TYA",
        }
    }
}

/// The 13 6502 addressing modes, plus the `Invalid` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressingMode {
    Invalid,
    /// `ASL A`
    Accumulator,
    /// `LDA $1234`
    Absolute,
    /// `LDA $1234,X`
    AbsoluteX,
    /// `LDA $1234,Y`
    AbsoluteY,
    /// `LDA #$12`
    Immediate,
    /// `CLC`
    Implied,
    /// `JMP ($1234)`
    Indirect,
    /// `LDA ($12,X)`
    IndirectX,
    /// `LDA ($12),Y`
    IndirectY,
    /// `BNE label`
    Relative,
    /// `LDA $12`
    ZeroPage,
    /// `LDA $12,X`
    ZeroPageX,
    /// `LDX $12,Y`
    ZeroPageY,
}

/// A decoded opcode: what to do and where the operand lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Operation,
    pub mode: AddressingMode,
}

impl Instruction {
    const fn new(op: Operation, mode: AddressingMode) -> Self {
        Self { op, mode }
    }

    /// True for table slots with no documented instruction.
    pub fn is_invalid(&self) -> bool {
        self.op == Operation::Invalid
    }
}

/// Table entry for unofficial opcodes.
pub const INVALID: Instruction = Instruction::new(Operation::Invalid, AddressingMode::Invalid);

/// Look up an opcode in both tables at once.
#[inline]
pub fn lookup(opcode: u8) -> (Instruction, u8) {
    (INSTRUCTIONS[opcode as usize], CYCLES[opcode as usize])
}

const __: Instruction = INVALID;

macro_rules! ins {
    ($op:ident, $mode:ident) => {
        Instruction::new(Operation::$op, AddressingMode::$mode)
    };
}

/// Opcode -> (operation, addressing mode).
#[rustfmt::skip]
pub static INSTRUCTIONS: [Instruction; 256] = [
    // 0x00
    ins!(Brk, Implied), ins!(Ora, IndirectX), __, __,
    __, ins!(Ora, ZeroPage), ins!(Asl, ZeroPage), __,
    ins!(Php, Implied), ins!(Ora, Immediate), ins!(Asl, Accumulator), __,
    __, ins!(Ora, Absolute), ins!(Asl, Absolute), __,
    // 0x10
    ins!(Bpl, Relative), ins!(Ora, IndirectY), __, __,
    __, ins!(Ora, ZeroPageX), ins!(Asl, ZeroPageX), __,
    ins!(Clc, Implied), ins!(Ora, AbsoluteY), __, __,
    __, ins!(Ora, AbsoluteX), ins!(Asl, AbsoluteX), __,
    // 0x20
    ins!(Jsr, Absolute), ins!(And, IndirectX), __, __,
    ins!(Bit, ZeroPage), ins!(And, ZeroPage), ins!(Rol, ZeroPage), __,
    ins!(Plp, Implied), ins!(And, Immediate), ins!(Rol, Accumulator), __,
    ins!(Bit, Absolute), ins!(And, Absolute), ins!(Rol, Absolute), __,
    // 0x30
    ins!(Bmi, Relative), ins!(And, IndirectY), __, __,
    __, ins!(And, ZeroPageX), ins!(Rol, ZeroPageX), __,
    ins!(Sec, Implied), ins!(And, AbsoluteY), __, __,
    __, ins!(And, AbsoluteX), ins!(Rol, AbsoluteX), __,
    // 0x40
    ins!(Rti, Implied), ins!(Eor, IndirectX), __, __,
    __, ins!(Eor, ZeroPage), ins!(Lsr, ZeroPage), __,
    ins!(Pha, Implied), ins!(Eor, Immediate), ins!(Lsr, Accumulator), __,
    ins!(Jmp, Absolute), ins!(Eor, Absolute), ins!(Lsr, Absolute), __,
    // 0x50
    ins!(Bvc, Relative), ins!(Eor, IndirectY), __, __,
    __, ins!(Eor, ZeroPageX), ins!(Lsr, ZeroPageX), __,
    ins!(Cli, Implied), ins!(Eor, AbsoluteY), __, __,
    __, ins!(Eor, AbsoluteX), ins!(Lsr, AbsoluteX), __,
    // 0x60
    ins!(Rts, Implied), ins!(Adc, IndirectX), __, __,
    __, ins!(Adc, ZeroPage), ins!(Ror, ZeroPage), __,
    ins!(Pla, Implied), ins!(Adc, Immediate), ins!(Ror, Accumulator), __,
    ins!(Jmp, Indirect), ins!(Adc, Absolute), ins!(Ror, Absolute), __,
    // 0x70
    ins!(Bvs, Relative), ins!(Adc, IndirectY), __, __,
    __, ins!(Adc, ZeroPageX), ins!(Ror, ZeroPageX), __,
    ins!(Sei, Implied), ins!(Adc, AbsoluteY), __, __,
    __, ins!(Adc, AbsoluteX), ins!(Ror, AbsoluteX), __,
    // 0x80
    __, ins!(Sta, IndirectX), __, __,
    ins!(Sty, ZeroPage), ins!(Sta, ZeroPage), ins!(Stx, ZeroPage), __,
    ins!(Dey, Implied), __, ins!(Txa, Implied), __,
    ins!(Sty, Absolute), ins!(Sta, Absolute), ins!(Stx, Absolute), __,
    // 0x90
    ins!(Bcc, Relative), ins!(Sta, IndirectY), __, __,
    ins!(Sty, ZeroPageX), ins!(Sta, ZeroPageX), ins!(Stx, ZeroPageY), __,
    ins!(Tya, Implied), ins!(Sta, AbsoluteY), ins!(Txs, Implied), __,
    __, ins!(Sta, AbsoluteX), __, __,
    // 0xA0
    ins!(Ldy, Immediate), ins!(Lda, IndirectX), ins!(Ldx, Immediate), __,
    ins!(Ldy, ZeroPage), ins!(Lda, ZeroPage), ins!(Ldx, ZeroPage), __,
    ins!(Tay, Implied), ins!(Lda, Immediate), ins!(Tax, Implied), __,
    ins!(Ldy, Absolute), ins!(Lda, Absolute), ins!(Ldx, Absolute), __,
    // 0xB0
    ins!(Bcs, Relative), ins!(Lda, IndirectY), __, __,
    ins!(Ldy, ZeroPageX), ins!(Lda, ZeroPageX), ins!(Ldx, ZeroPageY), __,
    ins!(Clv, Implied), ins!(Lda, AbsoluteY), ins!(Tsx, Implied), __,
    ins!(Ldy, AbsoluteX), ins!(Lda, AbsoluteX), ins!(Ldx, AbsoluteY), __,
    // 0xC0
    ins!(Cpy, Immediate), ins!(Cmp, IndirectX), __, __,
    ins!(Cpy, ZeroPage), ins!(Cmp, ZeroPage), ins!(Dec, ZeroPage), __,
    ins!(Iny, Implied), ins!(Cmp, Immediate), ins!(Dex, Implied), __,
    ins!(Cpy, Absolute), ins!(Cmp, Absolute), ins!(Dec, Absolute), __,
    // 0xD0
    ins!(Bne, Relative), ins!(Cmp, IndirectY), __, __,
    __, ins!(Cmp, ZeroPageX), ins!(Dec, ZeroPageX), __,
    ins!(Cld, Implied), ins!(Cmp, AbsoluteY), __, __,
    __, ins!(Cmp, AbsoluteX), ins!(Dec, AbsoluteX), __,
    // 0xE0
    ins!(Cpx, Immediate), ins!(Sbc, IndirectX), __, __,
    ins!(Cpx, ZeroPage), ins!(Sbc, ZeroPage), ins!(Inc, ZeroPage), __,
    ins!(Inx, Implied), ins!(Sbc, Immediate), ins!(Nop, Implied), __,
    ins!(Cpx, Absolute), ins!(Sbc, Absolute), ins!(Inc, Absolute), __,
    // 0xF0
    ins!(Beq, Relative), ins!(Sbc, IndirectY), __, __,
    __, ins!(Sbc, ZeroPageX), ins!(Inc, ZeroPageX), __,
    ins!(Sed, Implied), ins!(Sbc, AbsoluteY), __, __,
    __, ins!(Sbc, AbsoluteX), ins!(Inc, AbsoluteX), __,
];

/// Opcode -> base cycle count, before page-crossing and branch penalties.
#[rustfmt::skip]
pub static CYCLES: [u8; 256] = [
    //  0  1  2  3  4  5  6  7  8  9  A  B  C  D  E  F
        7, 6, 0, 8, 3, 3, 5, 5, 3, 2, 2, 2, 4, 4, 6, 6, // 0
        2, 5, 0, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // 1
        6, 6, 0, 8, 3, 3, 5, 5, 4, 2, 2, 2, 4, 4, 6, 6, // 2
        2, 5, 0, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // 3
        6, 6, 0, 8, 3, 3, 5, 5, 3, 2, 2, 2, 3, 4, 6, 6, // 4
        2, 5, 0, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // 5
        6, 6, 0, 8, 3, 3, 5, 5, 4, 2, 2, 2, 5, 4, 6, 6, // 6
        2, 5, 0, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // 7
        2, 6, 2, 6, 3, 3, 3, 3, 2, 2, 2, 2, 4, 4, 4, 4, // 8
        2, 6, 0, 6, 4, 4, 4, 4, 2, 5, 2, 5, 5, 5, 5, 5, // 9
        2, 6, 2, 6, 3, 3, 3, 3, 2, 2, 2, 2, 4, 4, 4, 4, // A
        2, 5, 0, 5, 4, 4, 4, 4, 2, 4, 2, 4, 4, 4, 4, 4, // B
        2, 6, 2, 8, 3, 3, 5, 5, 2, 2, 2, 2, 4, 4, 6, 6, // C
        2, 5, 0, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // D
        2, 6, 2, 8, 3, 3, 5, 5, 2, 2, 2, 2, 4, 4, 6, 6, // E
        2, 5, 0, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // F
];
