//! Emission of sample functions.
//!
//! A sample function executes a whole sample of both cores as a single straight-line block. Every
//! cycle emits the ERAM events scheduled for it, then core 1's instruction, then core 0's.
mod eram;
mod mac;
mod util;

use crate::{
    analysis::{Analysis, Source},
    backend::StateKind,
    pool::PoolError,
    schedule::Schedule,
    state::{MEMFLAGS, Pointers, StateAccess, StateVar},
};
use cranelift::{codegen::ir, frontend, prelude::InstBuilder};
use espint::{CORES, Core, acc::Accumulator, ins::Acc};
use std::mem::offset_of;

/// Everything a sample function is built from.
pub struct Input<'a> {
    pub analysis: &'a Analysis,
    /// Program words of each core, at least `analysis.cycles` long.
    pub words: [&'a [u32]; CORES],
    pub schedule: &'a Schedule,
    /// Mask applied to ERAM addresses.
    pub eram_mask: u32,
}

pub struct SampleBuilder<'ctx> {
    bd: frontend::FunctionBuilder<'ctx>,
    state: Box<dyn StateAccess>,
    ptrs: Pointers,
    ptr_type: ir::Type,
    input: Input<'ctx>,
    /// IRAM position of each core.
    pos: [ir::Value; CORES],
    /// Whether the previous executed instruction of each core was a coefficient multiply, when
    /// known at compile time.
    last_mul_coef: [Option<bool>; CORES],
}

impl<'ctx> SampleBuilder<'ctx> {
    pub fn new(
        mut bd: frontend::FunctionBuilder<'ctx>,
        ptr_type: ir::Type,
        kind: StateKind,
        input: Input<'ctx>,
    ) -> Self {
        let entry_bb = bd.create_block();
        bd.append_block_params_for_function_params(entry_bb);
        bd.switch_to_block(entry_bb);
        bd.seal_block(entry_bb);

        // core 0, core 1, shared, eram, tables, frame
        let params = bd.block_params(entry_bb);
        let ptrs = Pointers {
            cores: [params[0], params[1]],
            shared: params[2],
            eram: params[3],
            tables: params[4],
            frame: params[5],
        };

        let state = kind.create(&mut bd, ptrs);
        let pos = std::array::from_fn(|core| ptrs.load(&mut bd, StateVar::IramPos(core as u8)));

        Self {
            bd,
            state,
            ptrs,
            ptr_type,
            input,
            pos,
            last_mul_coef: [None; CORES],
        }
    }

    fn get(&mut self, var: StateVar) -> Result<ir::Value, PoolError> {
        self.state.get(&mut self.bd, var)
    }

    fn set(&mut self, var: StateVar, value: ir::Value) -> Result<(), PoolError> {
        self.state.set(&mut self.bd, var, value)
    }

    /// Current value of an accumulator, as described by `source`.
    fn source(&mut self, core: usize, acc: Acc, source: Source) -> Result<ir::Value, PoolError> {
        match source {
            Source::Slot(index) => self.get(StateVar::Slot {
                core: core as u8,
                index,
            }),
            Source::EntryRaw => {
                let addr = self.accumulator(core, acc.index(), offset_of!(Accumulator, raw));
                Ok(self.load(ir::types::I32, addr))
            }
            Source::EntryHist(k) => {
                let field = offset_of!(Accumulator, hist) + k as usize * 4;
                let addr = self.accumulator(core, acc.index(), field);
                Ok(self.load(ir::types::I32, addr))
            }
        }
    }

    /// Writes the accumulators and the pipeline state of `core` back to memory.
    fn epilogue(&mut self, core: usize) -> Result<(), PoolError> {
        let cycles = self.input.analysis.cycles;
        let exits = self.input.analysis.cores[core].exit;

        for (index, exit) in exits.iter().enumerate() {
            let acc = if index == 0 { Acc::A } else { Acc::B };

            // every value is computed before anything is stored, since entry values live in
            // the same memory
            let raw = self.source(core, acc, exit.raw)?;
            let mut window = [raw; 3];
            for (value, source) in window.iter_mut().zip(exit.window) {
                *value = self.source(core, acc, source)?;
            }

            let addr = self.accumulator(core, index, offset_of!(Accumulator, raw));
            self.store(raw, addr);
            for (k, value) in window.into_iter().enumerate() {
                let slot = (cycles + k) % 3;
                let field = offset_of!(Accumulator, hist) + slot * 4;
                let addr = self.accumulator(core, index, field);
                self.store(value, addr);
            }

            let head = self.ir_value((cycles % 3) as u32);
            let addr = self.accumulator(core, index, offset_of!(Accumulator, head));
            self.store(head, addr);

            self.state.end_instruction();
        }

        if let Some(last) = self.last_mul_coef[core] {
            let value = self.ir_value(last);
            self.bd.ins().store(
                MEMFLAGS,
                value,
                self.ptrs.cores[core],
                offset_of!(Core, last_mul_coef) as i32,
            );
        }

        Ok(())
    }

    /// Builds the whole function.
    pub fn build(mut self) -> Result<(), PoolError> {
        let cycles = self.input.analysis.cycles;
        for pc in 0..cycles {
            self.bd.set_srcloc(ir::SourceLoc::new(pc as u32));

            if let Some(&tick) = self.input.schedule.tick(pc) {
                self.eram_tick(tick)?;
                self.state.end_instruction();
            }

            for core in [1, 0] {
                self.instruction(core, pc)?;
                self.state.end_instruction();
            }
        }

        self.epilogue(0)?;
        self.epilogue(1)?;

        self.state.flush(&mut self.bd);
        self.bd.ins().return_(&[]);
        self.bd.finalize();

        Ok(())
    }
}
