use super::{SampleBuilder, util::Address};
use crate::{
    analysis::Access,
    pool::PoolError,
    state::{CoefTables, MEMFLAGS, MEMFLAGS_READONLY, StateVar},
};
use cranelift::{codegen::ir, prelude::InstBuilder};
use espint::{
    Core,
    core::{SKIP_NEGATIVE, SKIP_POSITIVE},
    ins::{Acc, ControlOp, Instruction, Opcode, decode},
};
use std::mem::offset_of;

/// Operands of the multiplier, after the category specific part of an instruction.
struct Operands {
    a: ir::Value,
    b: ir::Value,
    /// Whether `b` still needs to be sign extended from 8 bits.
    b_wide: bool,
}

impl SampleBuilder<'_> {
    /// Value read through the pipeline by this instruction.
    fn pipe(&mut self, core: usize, access: &Access) -> Result<ir::Value, PoolError> {
        let acc = access
            .saves
            .expect("pipeline reads only happen in instructions that save an accumulator");
        let source = access
            .read
            .expect("instructions that save an accumulator always have a read source");

        self.source(core, acc, source)
    }

    fn saturated_pipe(&mut self, core: usize, access: &Access) -> Result<ir::Value, PoolError> {
        let value = self.pipe(core, access)?;
        Ok(self.saturate24(value))
    }

    /// Emits a coefficient multiply (op 0x30): operand B comes from the coefficient bank.
    fn mul_coef(
        &mut self,
        core: usize,
        ins: &Instruction,
        access: &Access,
        iram: Address,
        ops: &mut Operands,
    ) -> Result<(), PoolError> {
        let coef = ins.coef;
        let weird = coef & 0x1C == 0x1C;

        if coef & 4 != 0 {
            let mut a = self.saturated_pipe(core, access)?;
            if weird {
                a = self.select_sign(a, 0x7F_FFFFi32, 0xFF80_0000u32);
            }

            self.store(a, iram);
            ops.a = a;
        }

        let mut b = match coef >> 5 {
            6 => {
                let offset = self.get(StateVar::VarOffset)?;
                let shifted = self.bd.ins().ishl_imm(offset, 11);
                self.bd.ins().band_imm(shifted, 0x7F_FFFF)
            }
            7 => {
                let addr = self.mulcoeff(5);
                self.load(ir::types::I32, addr)
            }
            i => {
                let addr = self.mulcoeff(i);
                self.load(ir::types::I32, addr)
            }
        };

        if coef & 8 != 0 && !weird {
            b = self.bd.ins().ineg(b);
        }

        if coef & 16 != 0 && !weird {
            let not = self.bd.ins().bnot(b);
            let positive = self.bd.ins().band_imm(not, 0x7F_FFFF);
            let low = self.bd.ins().band_imm(b, 0x7F_FFFF);
            let negative = self.bd.ins().bnot(low);
            b = self.select_sign(b, positive, negative);
        }

        self.set(StateVar::LastB(core as u8), b)?;
        ops.b = self.bd.ins().sshr_imm(b, 16);
        ops.b_wide = true;

        Ok(())
    }

    /// Emits a control instruction (op 0x34).
    fn control(
        &mut self,
        core: usize,
        ins: &Instruction,
        access: &Access,
        ops: &mut Operands,
    ) -> Result<(), PoolError> {
        let op = ins.control().unwrap_or(ControlOp::Unsupported);
        match op {
            ControlOp::WriteMulCoef { index, .. } => {
                let value = self.saturated_pipe(core, access)?;
                let addr = self.mulcoeff(index);
                self.store(value, addr);
            }
            ControlOp::Jump(_) => unreachable!("jumps are rejected by the analysis"),
            ControlOp::IntPins | ControlOp::Unsupported => (),
            ControlOp::DoublePrecision => {
                let last_a = self.get(StateVar::LastA(core as u8))?;
                ops.a = self.bd.ins().sshr_imm(last_a, 7);

                let carry = |this: &mut Self| -> Result<ir::Value, PoolError> {
                    let last_b = this.get(StateVar::LastB(core as u8))?;
                    let shifted = this.bd.ins().sshr_imm(last_b, 9);
                    Ok(this.bd.ins().band_imm(shifted, 0x7F))
                };

                match self.last_mul_coef[core] {
                    Some(true) => ops.b = carry(self)?,
                    Some(false) => (),
                    None => {
                        let carried = carry(self)?;
                        let flag = self.bd.ins().uload8(
                            ir::types::I32,
                            MEMFLAGS,
                            self.ptrs.cores[core],
                            offset_of!(Core, last_mul_coef) as i32,
                        );
                        ops.b = self.bd.ins().select(flag, carried, ops.b);
                    }
                }
            }
            ControlOp::WriteVarOffset => {
                let value = self.pipe(core, access)?;
                self.set(StateVar::VarOffset, value)?;
            }
            ControlOp::WriteHost => {
                let value = self.saturated_pipe(core, access)?;
                self.bd.ins().store(
                    MEMFLAGS,
                    value,
                    self.ptrs.shared,
                    offset_of!(espint::Shared, readback) as i32,
                );
            }
            ControlOp::WriteLatch => {
                let value = self.saturated_pipe(core, access)?;
                self.set(StateVar::WriteLatch, value)?;
            }
            ControlOp::ReadLatch { dest } => {
                let value = self.get(StateVar::ReadLatch)?;
                let offset = self.circular_offset(core, dest as u32);
                let addr = self.iram(core, offset);
                self.store(value, addr);
                ops.a = value;
            }
        }

        Ok(())
    }

    /// Emits the instruction of `core` at `pc`.
    pub(super) fn instruction(&mut self, core: usize, pc: usize) -> Result<(), PoolError> {
        let access = self.input.analysis.cores[core].accesses[pc];
        if access.zero {
            if access.skip_live {
                let skip = self.get(StateVar::Skipfield(core as u8))?;
                let skip = self.bd.ins().ushr_imm(skip, 1);
                self.set(StateVar::Skipfield(core as u8), skip)?;
            }

            return Ok(());
        }

        let ins = decode(self.input.words[core][pc]);
        let mempos = self.circular_offset(core, ins.mem as u32);
        let iram = self.iram(core, mempos);

        let a = match ins.literal() {
            Some(value) => self.ir_value(value),
            None => self.load(ir::types::I32, iram),
        };

        let b = if ins.opcode == Opcode::MulCoef {
            self.ir_value(0i32)
        } else {
            self.bd.ins().sload8(
                ir::types::I32,
                MEMFLAGS_READONLY,
                self.ptrs.tables,
                CoefTables::coef_offset(core, pc),
            )
        };

        let mut ops = Operands {
            a,
            b,
            b_wide: false,
        };

        let mut condition = false;
        match ins.opcode {
            Opcode::Mac | Opcode::ClrMac | Opcode::MacB | Opcode::ClrMacB => (),
            Opcode::StoreA
            | Opcode::StoreAIntoB
            | Opcode::StoreKeep
            | Opcode::StoreB
            | Opcode::StoreBIntoB
            | Opcode::StoreBKeepIntoB => {
                ops.a = self.saturated_pipe(core, &access)?;
                self.store(ops.a, iram);
            }
            Opcode::ReadGram | Opcode::ClrReadGram => {
                let addr = self.gram(mempos);
                ops.a = self.load(ir::types::I32, addr);
            }
            Opcode::Unknown28 | Opcode::Unknown2C | Opcode::Unknown54 => (),
            Opcode::MulCoef => self.mul_coef(core, &ins, &access, iram, &mut ops)?,
            Opcode::Control => self.control(core, &ins, &access, &mut ops)?,
            Opcode::StoreGramA | Opcode::StoreGramB => {
                ops.a = self.saturated_pipe(core, &access)?;
                let addr = self.gram(mempos);
                self.store(ops.a, addr);
            }
            Opcode::StoreRaw | Opcode::ClrStoreRaw => {
                let value = self.pipe(core, &access)?;
                ops.a = self.sign_extend(value, 24);
                self.store(ops.a, iram);
            }
            Opcode::StoreRect | Opcode::ClrStoreRect => {
                let value = self.saturated_pipe(core, &access)?;
                let zero = self.ir_value(0i32);
                ops.a = self.bd.ins().smax(value, zero);
                self.store(ops.a, iram);
            }
            Opcode::SetCondition => condition = true,
            Opcode::Interp | Opcode::ClrInterp | Opcode::InterpAlt | Opcode::ClrInterpAlt => {
                let not = self.bd.ins().bnot(ops.a);
                ops.a = self.bd.ins().band_imm(not, 0x7F_FFFF);
            }
            Opcode::InterpStorePos | Opcode::ClrInterpStorePos => {
                let value = self.saturated_pipe(core, &access)?;
                self.store(value, iram);
                let not = self.bd.ins().bnot(value);
                let mangled = self.select_sign(value, not, value);
                ops.a = self.bd.ins().band_imm(mangled, 0x7F_FFFF);
            }
            Opcode::InterpStoreNeg | Opcode::ClrInterpStoreNeg => {
                let value = self.saturated_pipe(core, &access)?;
                self.store(value, iram);
                let not = self.bd.ins().bnot(value);
                let mangled = self.select_sign(value, value, not);
                ops.a = self.bd.ins().band_imm(mangled, 0x7F_FFFF);
            }
        }

        self.multiply_accumulate(core, pc, &ins, &access, ops, condition)
    }

    /// Emits the common tail of an instruction: skipping, the MAC itself and the skip field.
    fn multiply_accumulate(
        &mut self,
        core: usize,
        pc: usize,
        ins: &Instruction,
        access: &Access,
        ops: Operands,
        condition: bool,
    ) -> Result<(), PoolError> {
        let skip_var = StateVar::Skipfield(core as u8);

        // multiplier operands are latched for the rest of the instruction
        let a_latch = self.state.temp(&mut self.bd)?;
        let b_latch = self.state.temp(&mut self.bd)?;
        self.bd.def_var(a_latch, ops.a);
        self.bd.def_var(b_latch, ops.b);

        let mut a = self.bd.use_var(a_latch);

        let skip = if access.skip_live {
            let skip = self.get(skip_var)?;
            let bit = self.bd.ins().band_imm(skip, 1);
            let zero = self.ir_value(0i32);
            a = self.bd.ins().select(bit, zero, a);
            self.bd.def_var(a_latch, a);
            Some(skip)
        } else {
            None
        };

        let mut result = None;
        if let Some(dest) = access.dest {
            let acc = access.writes.unwrap_or(Acc::A);

            let a = self.bd.use_var(a_latch);
            let b = self.bd.use_var(b_latch);
            let a24 = self.sign_extend(a, 24);
            let b8 = if ops.b_wide {
                self.sign_extend(b, 8)
            } else {
                b
            };

            let a64 = self.bd.ins().sextend(ir::types::I64, a24);
            let b64 = self.bd.ins().sextend(ir::types::I64, b8);
            let shift = self.bd.ins().uload8(
                ir::types::I64,
                MEMFLAGS_READONLY,
                self.ptrs.tables,
                CoefTables::shift_offset(core, pc),
            );

            let product = self.bd.ins().imul(a64, b64);
            let product = self.bd.ins().sshr(product, shift);
            let product = self.bd.ins().ireduce(ir::types::I32, product);

            let sum = match access.src {
                Some(source) => {
                    let prev = self.source(core, acc, source)?;
                    self.bd.ins().iadd(prev, product)
                }
                None => product,
            };

            let value = self.sign_extend(sum, 30);
            self.set(
                StateVar::Slot {
                    core: core as u8,
                    index: dest,
                },
                value,
            )?;

            result = Some(value);
        }

        if skip.is_some() || condition {
            let shifted = match skip {
                Some(skip) => self.bd.ins().ushr_imm(skip, 1),
                None => self.ir_value(0i32),
            };

            let updated = if condition {
                let value = result.expect("set-condition results are always observed");
                let bits = self.select_sign(value, SKIP_POSITIVE, SKIP_NEGATIVE);
                self.bd.ins().bor(shifted, bits)
            } else {
                shifted
            };

            self.set(skip_var, updated)?;
        }

        let a = self.bd.use_var(a_latch);
        self.set(StateVar::LastA(core as u8), a)?;
        self.last_mul_coef[core] = Some(ins.opcode == Opcode::MulCoef);

        Ok(())
    }
}
