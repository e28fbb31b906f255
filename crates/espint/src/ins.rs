//! Instruction words and their decoding.
use bitos::{
    bitos,
    integer::{u2, u5},
};
use strum::{FromRepr, VariantArray};

/// Literal operands selected by `mem` codes 1 through 4.
pub const LITERALS: [i32; 4] = [0x10, 0x400, 0x10000, 0x40_0000];

/// Shift amounts selected by the two shift bits.
pub const SHIFTS: [u8; 4] = [7, 6, 5, 3];

/// A raw program word.
#[bitos(32)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ins {
    #[bits(0..8)]
    pub coef: u8,
    #[bits(8..10)]
    pub shift_bits: u2,
    #[bits(10..18)]
    pub mem: u8,
    #[bits(18..23)]
    pub op_index: u5,
    /// Control bits sampled by the ERAM controller every cycle, regardless of the opcode.
    #[bits(23..28)]
    pub eram_ctrl: u5,
}

/// The operation category of an instruction, valued as the opcode field times four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, VariantArray)]
#[repr(u8)]
pub enum Opcode {
    Mac = 0x00,
    ClrMac = 0x04,
    /// `iram = A = sat(A)`, clear A.
    StoreA = 0x08,
    /// `iram = A = sat(B)`, clear A.
    StoreB = 0x0C,
    MacB = 0x10,
    ClrMacB = 0x14,
    StoreAIntoB = 0x18,
    StoreBIntoB = 0x1C,
    ReadGram = 0x20,
    ClrReadGram = 0x24,
    Unknown28 = 0x28,
    Unknown2C = 0x2C,
    MulCoef = 0x30,
    Control = 0x34,
    StoreGramA = 0x38,
    StoreGramB = 0x3C,
    StoreRaw = 0x40,
    ClrStoreRaw = 0x44,
    StoreRect = 0x48,
    ClrStoreRect = 0x4C,
    SetCondition = 0x50,
    Unknown54 = 0x54,
    /// `iram = A = sat(A)` without clearing.
    StoreKeep = 0x58,
    StoreBKeepIntoB = 0x5C,
    Interp = 0x60,
    ClrInterp = 0x64,
    InterpStorePos = 0x68,
    ClrInterpStorePos = 0x6C,
    InterpAlt = 0x70,
    ClrInterpAlt = 0x74,
    InterpStoreNeg = 0x78,
    ClrInterpStoreNeg = 0x7C,
}

/// One of the two accumulators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Acc {
    A = 0,
    B = 1,
}

impl Acc {
    #[inline(always)]
    pub fn select(b: bool) -> Self {
        if b { Self::B } else { Self::A }
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Condition of a jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JumpCond {
    Zero,
    Negative,
    Positive,
    Always,
}

/// Sub-operation of the control category (op 0x34).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlOp {
    /// `mulcoeffs[index] = sat(source)`
    WriteMulCoef { index: u8, source: Acc },
    Jump(JumpCond),
    IntPins,
    DoublePrecision,
    WriteVarOffset,
    WriteHost,
    WriteLatch,
    /// `A = readLatch`, stored to `iram[dest]`.
    ReadLatch { dest: u8 },
    /// Undefined sub-code. Behaves like a plain MAC.
    Unsupported,
}

/// A fully decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub word: u32,
    pub opcode: Opcode,
    pub mem: u8,
    pub shift_bits: u8,
    pub coef: u8,
    pub eram_ctrl: u8,
    /// Accumulator the MAC writes to.
    pub acc: Acc,
    /// Whether the accumulator is cleared before accumulating.
    pub clear: bool,
    /// Shift applied to the product.
    pub shift: u8,
}

impl Instruction {
    /// Literal value of operand A, if `mem` selects one.
    #[inline(always)]
    pub fn literal(&self) -> Option<i32> {
        matches!(self.mem, 1..=4).then(|| LITERALS[self.mem as usize - 1])
    }

    /// Whether the opcode, mem, shift and coef fields are all zero.
    #[inline(always)]
    pub fn is_nop(&self) -> bool {
        self.word & 0x7F_FFFF == 0
    }

    /// Returns the control sub-operation of an op 0x34 instruction.
    pub fn control(&self) -> Option<ControlOp> {
        if self.opcode != Opcode::Control {
            return None;
        }

        let mem = self.mem;
        let op = match mem {
            0xA0..0xB0 => ControlOp::WriteMulCoef {
                index: (mem >> 1) & 7,
                source: Acc::select(mem & 1 != 0),
            },
            0xC0.. => match mem & 0xF {
                0x0 => ControlOp::Jump(JumpCond::Zero),
                0x1 => ControlOp::Jump(JumpCond::Negative),
                0x2 => ControlOp::Jump(JumpCond::Positive),
                0x3 => ControlOp::Jump(JumpCond::Always),
                0x4 => ControlOp::IntPins,
                0x6 => ControlOp::DoublePrecision,
                0x7 => ControlOp::WriteVarOffset,
                0xA => ControlOp::WriteHost,
                0xB => ControlOp::WriteLatch,
                0xC..=0xF => ControlOp::ReadLatch { dest: mem | 0xF0 },
                _ => ControlOp::Unsupported,
            },
            _ => ControlOp::Unsupported,
        };

        Some(op)
    }

    /// Whether this instruction has no defined behavior besides the plain MAC.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::Unknown28 | Opcode::Unknown2C | Opcode::Unknown54
        ) || self.control() == Some(ControlOp::Unsupported)
    }

    /// Whether this instruction is a jump.
    pub fn is_jump(&self) -> bool {
        matches!(self.control(), Some(ControlOp::Jump(_)))
    }
}

/// Decodes a raw program word. Total: every word decodes to something.
pub fn decode(word: u32) -> Instruction {
    let ins = Ins::from_bits(word);
    let opcode = Opcode::from_repr(ins.op_index().value() << 2)
        .expect("every 5 bit opcode index has a variant");

    let mem = ins.mem();
    let shift_bits = ins.shift_bits().value();
    let coef = ins.coef();

    let mut acc = Acc::A;
    let mut clear = false;
    let mut shift = SHIFTS[shift_bits as usize];

    match opcode {
        Opcode::ClrMac
        | Opcode::StoreA
        | Opcode::StoreB
        | Opcode::ClrStoreRaw
        | Opcode::ClrStoreRect
        | Opcode::SetCondition
        | Opcode::ClrInterp
        | Opcode::ClrInterpStorePos
        | Opcode::ClrInterpAlt
        | Opcode::ClrInterpStoreNeg => clear = true,
        Opcode::MacB => acc = Acc::B,
        Opcode::ClrMacB | Opcode::StoreAIntoB | Opcode::StoreBIntoB => {
            acc = Acc::B;
            clear = true;
        }
        Opcode::StoreBKeepIntoB => acc = Acc::B,
        Opcode::ReadGram | Opcode::ClrReadGram => {
            acc = Acc::select(shift_bits & 2 != 0);
            shift = if shift_bits & 1 != 0 { 6 } else { 7 };
            clear = opcode == Opcode::ClrReadGram;
        }
        Opcode::MulCoef => {
            acc = Acc::select(coef & 2 != 0);
            clear = coef & 1 == 0;
        }
        Opcode::Control if mem >= 0xC0 => {
            acc = Acc::select(mem & 0x20 != 0);
            clear = mem & 0x10 != 0;
        }
        _ => (),
    }

    Instruction {
        word,
        opcode,
        mem,
        shift_bits,
        coef,
        eram_ctrl: ins.eram_ctrl().value(),
        acc,
        clear,
        shift,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn word(op: u8, mem: u8, shift: u8, coef: u8) -> u32 {
        ((op as u32) << 16) | ((mem as u32) << 10) | ((shift as u32) << 8) | coef as u32
    }

    #[test]
    fn fields() {
        let ins = decode(word(0x10, 2, 1, 0x7F) | (0x1B << 23));
        assert_eq!(ins.opcode, Opcode::MacB);
        assert_eq!(ins.mem, 2);
        assert_eq!(ins.shift, 6);
        assert_eq!(ins.coef, 0x7F);
        assert_eq!(ins.eram_ctrl, 0x1B);
        assert_eq!(ins.acc, Acc::B);
        assert!(!ins.clear);
        assert_eq!(ins.literal(), Some(0x400));
    }

    #[test]
    fn every_opcode_decodes() {
        for op in Opcode::VARIANTS {
            let ins = decode(word(*op as u8, 0x20, 0, 0));
            assert_eq!(ins.opcode, *op);
        }
    }

    #[test]
    fn shift_table() {
        let shifts: Vec<u8> = (0..4).map(|s| decode(word(0, 5, s, 1)).shift).collect();
        assert_eq!(shifts, [7, 6, 5, 3]);

        // interpolation picks its own shift
        assert_eq!(decode(word(0x20, 5, 0, 1)).shift, 7);
        assert_eq!(decode(word(0x20, 5, 1, 1)).shift, 6);
        assert_eq!(decode(word(0x20, 5, 2, 1)).acc, Acc::B);
    }

    #[test]
    fn nop_ignores_eram_bits() {
        assert!(decode(0).is_nop());
        assert!(decode(0x1F << 23).is_nop());
        assert!(!decode(word(0, 0, 0, 1)).is_nop());
    }

    #[test]
    fn unsupported() {
        assert!(decode(word(0x28, 5, 0, 0)).is_unsupported());
        assert!(decode(word(0x54, 5, 0, 0)).is_unsupported());
        assert!(decode(word(0x34, 0x10, 0, 0)).is_unsupported());
        assert!(decode(word(0x34, 0xC5, 0, 0)).is_unsupported());
        assert!(!decode(word(0x34, 0xCA, 0, 0)).is_unsupported());
    }

    #[test]
    fn control_decoding() {
        let ins = decode(word(0x34, 0xA3, 0, 0));
        assert_eq!(
            ins.control(),
            Some(ControlOp::WriteMulCoef {
                index: 1,
                source: Acc::B
            })
        );

        let ins = decode(word(0x34, 0xF1, 0, 0));
        assert_eq!(ins.control(), Some(ControlOp::Jump(JumpCond::Negative)));
        assert_eq!(ins.acc, Acc::B);
        assert!(ins.clear);
        assert!(ins.is_jump());

        let ins = decode(word(0x34, 0xCD, 0, 0));
        assert_eq!(ins.control(), Some(ControlOp::ReadLatch { dest: 0xFD }));
    }

    #[test]
    fn mulcoef_flags() {
        let ins = decode(word(0x30, 5, 0, 0b0000_0011));
        assert_eq!(ins.acc, Acc::B);
        assert!(!ins.clear);

        let ins = decode(word(0x30, 5, 0, 0b0000_0000));
        assert_eq!(ins.acc, Acc::A);
        assert!(ins.clear);
    }
}
