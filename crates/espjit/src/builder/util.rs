use super::SampleBuilder;
use crate::state::MEMFLAGS;
use cranelift::{
    codegen::ir,
    prelude::{FunctionBuilder, InstBuilder, IntCC},
};
use espint::{Core, Shared, acc::Accumulator};
use util::offset_of;

/// Trait for transforming values into an IR value in a function.
pub trait IntoIrValue {
    fn into_value(self, bd: &mut FunctionBuilder<'_>) -> ir::Value;
}

impl IntoIrValue for ir::Value {
    fn into_value(self, _: &mut FunctionBuilder<'_>) -> ir::Value {
        self
    }
}

impl IntoIrValue for bool {
    fn into_value(self, bd: &mut FunctionBuilder<'_>) -> ir::Value {
        bd.ins().iconst(ir::types::I8, self as i64)
    }
}

impl IntoIrValue for u8 {
    fn into_value(self, bd: &mut FunctionBuilder<'_>) -> ir::Value {
        bd.ins().iconst(ir::types::I8, self as u64 as i64)
    }
}

impl IntoIrValue for i32 {
    fn into_value(self, bd: &mut FunctionBuilder<'_>) -> ir::Value {
        bd.ins().iconst(ir::types::I32, self as u32 as i64)
    }
}

impl IntoIrValue for u32 {
    fn into_value(self, bd: &mut FunctionBuilder<'_>) -> ir::Value {
        bd.ins().iconst(ir::types::I32, self as u64 as i64)
    }
}

/// A memory location: a base pointer plus a constant offset.
#[derive(Debug, Clone, Copy)]
pub struct Address {
    pub base: ir::Value,
    pub offset: i32,
}

impl SampleBuilder<'_> {
    /// Creates an IR value from the given `value`.
    pub fn ir_value(&mut self, value: impl IntoIrValue) -> ir::Value {
        value.into_value(&mut self.bd)
    }

    /// Sign extends the low `bits` bits of `value` (must be an I32).
    pub fn sign_extend(&mut self, value: ir::Value, bits: u8) -> ir::Value {
        let shift = 32 - bits as i64;
        let shifted = self.bd.ins().ishl_imm(value, shift);
        self.bd.ins().sshr_imm(shifted, shift)
    }

    /// Clamps `value` to the signed 24 bit range.
    pub fn saturate24(&mut self, value: ir::Value) -> ir::Value {
        let min = self.ir_value(-0x80_0000i32);
        let max = self.ir_value(0x7F_FFFFi32);
        let value = self.bd.ins().smax(value, min);
        self.bd.ins().smin(value, max)
    }

    /// Selects `then` if `value` is non-negative, `otherwise` if it is negative.
    pub fn select_sign(
        &mut self,
        value: ir::Value,
        then: impl IntoIrValue,
        otherwise: impl IntoIrValue,
    ) -> ir::Value {
        let then = self.ir_value(then);
        let otherwise = self.ir_value(otherwise);
        let positive = self
            .bd
            .ins()
            .icmp_imm(IntCC::SignedGreaterThanOrEqual, value, 0);

        self.bd.ins().select(positive, then, otherwise)
    }

    /// The lossy compression applied to values written to ERAM.
    pub fn crunch(&mut self, value: ir::Value) -> ir::Value {
        let shifted = self.bd.ins().sshr_imm(value, 1);
        let sign = self.bd.ins().band_imm(shifted, 0x40_0000);
        let sign = self.bd.ins().imul_imm(sign, 3);

        let differs = |this: &mut Self, shift: i64| {
            let shifted = this.bd.ins().ishl_imm(value, shift);
            let top = this.bd.ins().band_imm(shifted, 0xC0_0000);
            this.bd.ins().icmp(IntCC::NotEqual, top, sign)
        };

        let at1 = differs(self, 1);
        let at3 = differs(self, 3);
        let at5 = differs(self, 5);

        let mask_at1 = self.ir_value(0xFFFF_FC00u32);
        let mask_at3 = self.ir_value(0xFFFF_FF00u32);
        let mask_at5 = self.ir_value(0xFFFF_FFC0u32);
        let mask_rest = self.ir_value(0xFFFF_FFF0u32);

        let mask = self.bd.ins().select(at5, mask_at5, mask_rest);
        let mask = self.bd.ins().select(at3, mask_at3, mask);
        let mask = self.bd.ins().select(at1, mask_at1, mask);

        self.bd.ins().band(value, mask)
    }

    /// Turns an I32 byte offset into a pointer sized one.
    pub fn to_ptr(&mut self, offset: ir::Value) -> ir::Value {
        if self.ptr_type == ir::types::I32 {
            offset
        } else {
            self.bd.ins().uextend(self.ptr_type, offset)
        }
    }

    /// Byte offset of the circular word `index + iram_pos` (must be an I32).
    pub fn circular_offset(&mut self, core: usize, index: impl IntoIrValue) -> ir::Value {
        let pos = self.pos[core];
        let index = self.ir_value(index);
        let index = self.bd.ins().iadd(index, pos);
        let index = self.bd.ins().band_imm(index, 0xFF);
        let offset = self.bd.ins().ishl_imm(index, 2);

        self.to_ptr(offset)
    }

    /// Address of the IRAM word at byte offset `offset`.
    pub fn iram(&mut self, core: usize, offset: ir::Value) -> Address {
        let base = self.bd.ins().iadd(self.ptrs.cores[core], offset);
        Address {
            base,
            offset: offset_of!(Core, iram) as i32,
        }
    }

    /// Address of the GRAM word at byte offset `offset`.
    pub fn gram(&mut self, offset: ir::Value) -> Address {
        let base = self.bd.ins().iadd(self.ptrs.shared, offset);
        Address {
            base,
            offset: offset_of!(Shared, gram) as i32,
        }
    }

    /// Address of a coefficient bank entry.
    pub fn mulcoeff(&self, index: u8) -> Address {
        Address {
            base: self.ptrs.shared,
            offset: (offset_of!(Shared, mulcoeffs) + index as usize * 4) as i32,
        }
    }

    /// Address of an accumulator field, `field` being its offset inside [`Accumulator`].
    pub fn accumulator(&self, core: usize, acc: usize, field: usize) -> Address {
        Address {
            base: self.ptrs.cores[core],
            offset: (offset_of!(Core, acc) + acc * size_of::<Accumulator>() + field) as i32,
        }
    }

    pub fn load(&mut self, ty: ir::Type, addr: Address) -> ir::Value {
        self.bd.ins().load(ty, MEMFLAGS, addr.base, addr.offset)
    }

    pub fn store(&mut self, value: ir::Value, addr: Address) {
        self.bd.ins().store(MEMFLAGS, value, addr.base, addr.offset);
    }
}
