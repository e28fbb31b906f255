//! Logical state variables of compiled code and their homes in memory.
use crate::{analysis::SLOTS, pool::PoolError};
use cranelift::{
    codegen::ir,
    frontend::{FunctionBuilder, Variable},
    prelude::InstBuilder,
};
use espint::{CORES, Core, PRAM_LEN, Program, Shared, acc::Accumulator, decode, eram::EramData};
use static_assertions::{assert_eq_size, const_assert_eq};
use util::offset_of;

pub const MEMFLAGS: ir::MemFlags = ir::MemFlags::new().with_notrap();
/// Flags for loads from [`CoefTables`], which only change between calls.
pub const MEMFLAGS_READONLY: ir::MemFlags = ir::MemFlags::new()
    .with_notrap()
    .with_can_move()
    .with_readonly();

// compiled code accesses these as plain 32 bit words
assert_eq_size!(Accumulator, [i32; 5]);
assert_eq_size!(EramData, [i32; 6]);
const_assert_eq!(size_of::<bool>(), 1);

/// Scratch memory of compiled code. Slots live here while spilled.
#[derive(Debug, Clone, Default)]
#[repr(C)]
pub struct Frame {
    pub slots: [[i32; SLOTS]; CORES],
}

/// Coefficient and shift of every instruction. Compiled code reads these at runtime so that
/// coefficient-only edits can be applied without recompiling.
#[derive(Clone)]
#[repr(C)]
pub struct CoefTables {
    pub coef: [[i8; PRAM_LEN]; CORES],
    pub shift: [[u8; PRAM_LEN]; CORES],
}

impl CoefTables {
    pub fn new(program: &Program) -> Box<Self> {
        let mut tables = Box::new(Self {
            coef: [[0; PRAM_LEN]; CORES],
            shift: [[0; PRAM_LEN]; CORES],
        });

        for core in 0..CORES {
            for (index, &word) in program.core(core)[..PRAM_LEN].iter().enumerate() {
                tables.update(core, index, word);
            }
        }

        tables
    }

    /// Updates the entries of an instruction.
    pub fn update(&mut self, core: usize, index: usize, word: u32) {
        let ins = decode(word);
        self.coef[core][index] = ins.coef as i8;
        self.shift[core][index] = ins.shift;
    }

    pub fn coef_offset(core: usize, index: usize) -> i32 {
        (offset_of!(CoefTables, coef) + core * PRAM_LEN + index) as i32
    }

    pub fn shift_offset(core: usize, index: usize) -> i32 {
        (offset_of!(CoefTables, shift) + core * PRAM_LEN + index) as i32
    }
}

/// Memory region a state variable lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Base {
    Core(usize),
    Shared,
    Frame,
}

/// A 32 bit value of the machine state which compiled code keeps in a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateVar {
    /// Rotating accumulator slot.
    Slot { core: u8, index: u8 },
    Skipfield(u8),
    LastA(u8),
    LastB(u8),
    IramPos(u8),
    EramPos,
    ReadLatch,
    WriteLatch,
    WriteLatchNext,
    VarOffset,
    EffectiveAddr,
}

impl StateVar {
    /// Where this variable lives in memory.
    pub fn location(self) -> (Base, i32) {
        let core = |c: u8| Base::Core(c as usize);
        let (base, offset) = match self {
            Self::Slot { core, index } => (
                Base::Frame,
                offset_of!(Frame, slots) + (core as usize * SLOTS + index as usize) * 4,
            ),
            Self::Skipfield(c) => (core(c), offset_of!(Core, skipfield)),
            Self::LastA(c) => (core(c), offset_of!(Core, last_a)),
            Self::LastB(c) => (core(c), offset_of!(Core, last_b)),
            Self::IramPos(c) => (core(c), offset_of!(Core, iram_pos)),
            Self::EramPos => (Base::Shared, offset_of!(Shared, eram.data.pos)),
            Self::ReadLatch => (Base::Shared, offset_of!(Shared, eram.data.read_latch)),
            Self::WriteLatch => (Base::Shared, offset_of!(Shared, eram.data.write_latch)),
            Self::WriteLatchNext => (Base::Shared, offset_of!(Shared, eram.data.write_latch_next)),
            Self::VarOffset => (Base::Shared, offset_of!(Shared, eram.data.var_offset)),
            Self::EffectiveAddr => (Base::Shared, offset_of!(Shared, eram.data.effective_addr)),
        };

        (base, offset as i32)
    }

    /// Scratch variables only live for the duration of a call and are never written back.
    pub fn is_scratch(self) -> bool {
        matches!(self, Self::Slot { .. })
    }
}

/// Pointer parameters of a compiled sample function.
#[derive(Debug, Clone, Copy)]
pub struct Pointers {
    pub cores: [ir::Value; CORES],
    pub shared: ir::Value,
    pub eram: ir::Value,
    pub tables: ir::Value,
    pub frame: ir::Value,
}

impl Pointers {
    pub fn base(&self, base: Base) -> ir::Value {
        match base {
            Base::Core(core) => self.cores[core],
            Base::Shared => self.shared,
            Base::Frame => self.frame,
        }
    }

    /// Loads the memory value of `var`.
    pub fn load(&self, bd: &mut FunctionBuilder<'_>, var: StateVar) -> ir::Value {
        let (base, offset) = var.location();
        bd.ins()
            .load(ir::types::I32, MEMFLAGS, self.base(base), offset)
    }

    /// Stores `value` as the memory value of `var`.
    pub fn store(&self, bd: &mut FunctionBuilder<'_>, var: StateVar, value: ir::Value) {
        let (base, offset) = var.location();
        bd.ins().store(MEMFLAGS, value, self.base(base), offset);
    }
}

/// How emitted code reaches the state variables.
pub trait StateAccess {
    /// Returns the current value of `var`.
    fn get(&mut self, bd: &mut FunctionBuilder<'_>, var: StateVar) -> Result<ir::Value, PoolError>;

    /// Defines a new value for `var`.
    fn set(
        &mut self,
        bd: &mut FunctionBuilder<'_>,
        var: StateVar,
        value: ir::Value,
    ) -> Result<(), PoolError>;

    /// A temporary variable, valid until the end of the current instruction.
    fn temp(&mut self, bd: &mut FunctionBuilder<'_>) -> Result<Variable, PoolError>;

    /// Ends the current instruction, releasing its temporaries and pins.
    fn end_instruction(&mut self);

    /// Writes every modified non-scratch variable back to memory.
    fn flush(&mut self, bd: &mut FunctionBuilder<'_>);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn locations_are_distinct() {
        let vars = [
            StateVar::Slot { core: 1, index: 5 },
            StateVar::Skipfield(0),
            StateVar::Skipfield(1),
            StateVar::LastA(0),
            StateVar::LastB(0),
            StateVar::IramPos(1),
            StateVar::EramPos,
            StateVar::ReadLatch,
            StateVar::WriteLatch,
            StateVar::WriteLatchNext,
            StateVar::VarOffset,
            StateVar::EffectiveAddr,
        ];

        for (i, a) in vars.iter().enumerate() {
            for b in &vars[i + 1..] {
                assert_ne!(a.location(), b.location(), "{a:?} and {b:?}");
            }
        }

        assert_eq!(
            StateVar::Slot { core: 1, index: 5 }.location(),
            (Base::Frame, (SLOTS as i32 + 5) * 4)
        );
    }

    #[test]
    fn tables_follow_program() {
        let mut program = Program::default();
        program.set_word(0x400 + 3, (0x10 << 16) | (3 << 8) | 0xF0);
        let mut tables = CoefTables::new(&program);

        assert_eq!(tables.coef[1][3], -0x10);
        assert_eq!(tables.shift[1][3], 3);
        assert_eq!(tables.shift[0][0], 7);

        tables.update(0, 0, 0x7F);
        assert_eq!(tables.coef[0][0], 0x7F);
    }
}
