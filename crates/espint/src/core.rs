use crate::{
    Shared,
    acc::Accumulator,
    ins::{Acc, ControlOp, JumpCond, Opcode, decode},
};
use util::sign_extend;

/// Amount of program words executed by a core.
pub const PRAM_LEN: usize = 768;
/// Amount of words in IRAM and GRAM.
pub const IRAM_LEN: usize = 0x100;
pub const IRAM_MASK: u32 = IRAM_LEN as u32 - 1;

/// Bits ORed into the skip field by a set-condition instruction when its result is negative.
pub const SKIP_NEGATIVE: u32 = 0x3C0;
/// Bits ORed into the skip field by a set-condition instruction otherwise.
pub const SKIP_POSITIVE: u32 = 0x30;

/// A jump waiting for the program counter to reach `at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingJump {
    pub at: u16,
    pub to: u16,
}

/// State of a single ESP core.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct Core {
    pub iram: [i32; IRAM_LEN],
    pub acc: [Accumulator; 2],
    /// Operand A of the previous executed instruction.
    pub last_a: i32,
    /// Operand B of the last coefficient multiply, before its final shift.
    pub last_b: i32,
    pub skipfield: u32,
    /// Whether the previous executed instruction was a coefficient multiply.
    pub last_mul_coef: bool,
    pub pc: u16,
    pub iram_pos: u32,
    pub jump: Option<PendingJump>,
}

impl Default for Core {
    fn default() -> Self {
        Self {
            iram: [0; IRAM_LEN],
            acc: [Accumulator::default(); 2],
            last_a: 0,
            last_b: 0,
            skipfield: 0,
            last_mul_coef: false,
            pc: 0,
            iram_pos: 0,
            jump: None,
        }
    }
}

impl Core {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    #[inline(always)]
    pub fn iram_index(&self, offset: u32) -> usize {
        (offset.wrapping_add(self.iram_pos) & IRAM_MASK) as usize
    }

    pub fn read_iram(&self, offset: u8) -> i32 {
        self.iram[self.iram_index(offset as u32)]
    }

    pub fn write_iram(&mut self, offset: u8, value: i32) {
        let index = self.iram_index(offset as u32);
        self.iram[index] = value;
    }

    /// Starts a new sample: rewinds the program counter and moves the circular position back.
    pub fn sync(&mut self) {
        self.pc = 0;
        self.iram_pos = self.iram_pos.wrapping_sub(1) & IRAM_MASK;
    }

    fn store_pipelines(&mut self) {
        self.acc[0].store_pipeline();
        self.acc[1].store_pipeline();
    }

    fn jump_to(&mut self, target: u8) {
        if self.jump.is_some() {
            tracing::warn!("overlapping jump at pc {}", self.pc);
        }

        self.jump = Some(PendingJump {
            at: self.pc + 2,
            to: target as u16,
        });
    }

    /// Executes one cycle. `pram` is this core's program.
    pub fn step(&mut self, pram: &[u32], shared: &mut Shared) {
        if self.pc as usize >= PRAM_LEN {
            return;
        }

        if let Some(jump) = self.jump
            && jump.at == self.pc
        {
            self.pc = jump.to;
            self.jump = None;
        }

        let word = pram[self.pc as usize];
        self.pc += 1;

        if word == 0 {
            self.skipfield >>= 1;
            self.store_pipelines();
            return;
        }

        let ins = decode(word);
        let mempos = self.iram_index(ins.mem as u32);

        let acc = ins.acc;
        let mut set_condition = false;
        let mut a = ins.literal().unwrap_or(self.iram[mempos]);
        let mut b = ins.coef as i32;

        let [pipe_a, pipe_b] = self.acc;
        match ins.opcode {
            Opcode::Mac | Opcode::ClrMac | Opcode::MacB | Opcode::ClrMacB => (),
            Opcode::StoreA | Opcode::StoreAIntoB | Opcode::StoreKeep => {
                a = pipe_a.saturated24();
                self.iram[mempos] = a;
            }
            Opcode::StoreB | Opcode::StoreBIntoB | Opcode::StoreBKeepIntoB => {
                a = pipe_b.saturated24();
                self.iram[mempos] = a;
            }
            Opcode::ReadGram | Opcode::ClrReadGram => a = shared.gram[mempos],
            Opcode::Unknown28 | Opcode::Unknown2C | Opcode::Unknown54 => {
                tracing::warn!("unsupported opcode {:?} at pc {}", ins.opcode, self.pc - 1);
            }
            Opcode::MulCoef => {
                let coef = ins.coef;
                let weird = coef & 0x1C == 0x1C;
                let pipe = if acc == Acc::B { pipe_b } else { pipe_a };

                if coef & 4 != 0 {
                    a = pipe.saturated24();
                    if weird {
                        a = if a >= 0 { 0x7F_FFFF } else { 0xFF80_0000u32 as i32 };
                    }

                    self.iram[mempos] = a;
                }

                b = match coef >> 5 {
                    6 => (shared.eram.data.var_offset << 11) & 0x7F_FFFF,
                    7 => shared.mulcoeffs[5],
                    i => shared.mulcoeffs[i as usize],
                };

                if coef & 8 != 0 && !weird {
                    b = b.wrapping_neg();
                }

                if coef & 16 != 0 && !weird {
                    b = if b >= 0 { !b & 0x7F_FFFF } else { !(b & 0x7F_FFFF) };
                }

                self.last_b = b;
                b >>= 16;
            }
            Opcode::Control => {
                let op = ins.control().unwrap_or(ControlOp::Unsupported);
                let pipe = self.acc[acc.index()];

                match op {
                    ControlOp::WriteMulCoef { index, source } => {
                        let value = self.acc[source.index()].saturated24();
                        shared.mulcoeffs[index as usize] = value;
                    }
                    ControlOp::Jump(cond) => {
                        let value = pipe.full();
                        let taken = match cond {
                            JumpCond::Zero => value == 0,
                            JumpCond::Negative => value < 0,
                            JumpCond::Positive => value > 0,
                            JumpCond::Always => true,
                        };

                        if taken {
                            self.jump_to(ins.coef);
                        }
                    }
                    ControlOp::IntPins => (),
                    ControlOp::DoublePrecision => {
                        a = self.last_a >> 7;
                        if self.last_mul_coef {
                            b = (self.last_b >> 9) & 0x7F;
                        }
                    }
                    ControlOp::WriteVarOffset => shared.eram.data.var_offset = pipe.full(),
                    ControlOp::WriteHost => shared.readback = pipe.saturated24() as u32,
                    ControlOp::WriteLatch => shared.eram.data.write_latch = pipe.saturated24(),
                    ControlOp::ReadLatch { dest } => {
                        a = shared.eram.data.read_latch;
                        self.write_iram(dest, a);
                    }
                    ControlOp::Unsupported => {
                        tracing::warn!(
                            "unsupported control code {:#04X} at pc {}",
                            ins.mem,
                            self.pc - 1
                        );
                    }
                }
            }
            Opcode::StoreGramA => {
                a = pipe_a.saturated24();
                shared.gram[mempos] = a;
            }
            Opcode::StoreGramB => {
                a = pipe_b.saturated24();
                shared.gram[mempos] = a;
            }
            Opcode::StoreRaw | Opcode::ClrStoreRaw => {
                a = pipe_a.raw24();
                self.iram[mempos] = a;
            }
            Opcode::StoreRect | Opcode::ClrStoreRect => {
                a = pipe_a.saturated24().max(0);
                self.iram[mempos] = a;
            }
            Opcode::SetCondition => set_condition = true,
            Opcode::Interp | Opcode::ClrInterp | Opcode::InterpAlt | Opcode::ClrInterpAlt => {
                a = !a & 0x7F_FFFF;
            }
            Opcode::InterpStorePos | Opcode::ClrInterpStorePos => {
                a = pipe_a.saturated24();
                self.iram[mempos] = a;
                if a >= 0 {
                    a = !a;
                }
                a &= 0x7F_FFFF;
            }
            Opcode::InterpStoreNeg | Opcode::ClrInterpStoreNeg => {
                a = pipe_a.saturated24();
                self.iram[mempos] = a;
                if a < 0 {
                    a = !a;
                }
                a &= 0x7F_FFFF;
            }
        }

        if self.skipfield & 1 != 0 {
            a = 0;
        }

        let target = &mut self.acc[acc.index()];
        if ins.clear {
            target.assign(0);
        }

        let product = (sign_extend::<24>(a) as i64 * sign_extend::<8>(b) as i64) >> ins.shift;
        target.accumulate(product as i32);

        self.skipfield >>= 1;
        if set_condition {
            self.skipfield |= if target.raw < 0 {
                SKIP_NEGATIVE
            } else {
                SKIP_POSITIVE
            };
        }

        self.last_a = a;
        self.last_mul_coef = ins.opcode == Opcode::MulCoef;
        self.store_pipelines();
    }
}
