use super::{SampleBuilder, util::Address};
use crate::{pool::PoolError, state::StateVar};
use cranelift::{
    codegen::ir,
    prelude::{InstBuilder, IntCC},
};
use espint::eram::{Commit, HIGH_BANK_THRESHOLD, Latch, Tick};

impl SampleBuilder<'_> {
    /// Address of the ERAM word selected by the effective address.
    fn eram_word(&mut self) -> Result<Address, PoolError> {
        let addr = self.get(StateVar::EffectiveAddr)?;
        let index = self.bd.ins().band_imm(addr, self.input.eram_mask as i64);
        let offset = self.bd.ins().ishl_imm(index, 2);
        let offset = self.to_ptr(offset);

        Ok(Address {
            base: self.bd.ins().iadd(self.ptrs.eram, offset),
            offset: 0,
        })
    }

    fn eram_commit(&mut self, commit: Commit) -> Result<(), PoolError> {
        let word = self.eram_word()?;
        match commit {
            Commit::Write => {
                let latch = self.get(StateVar::WriteLatchNext)?;
                let value = self.crunch(latch);
                self.store(value, word);
            }
            Commit::Read => {
                let value = self.load(ir::types::I32, word);
                let value = self.sign_extend(value, 24);
                self.set(StateVar::ReadLatch, value)?;
            }
        }

        Ok(())
    }

    fn eram_latch(&mut self, latch: Latch) -> Result<(), PoolError> {
        let write_latch = self.get(StateVar::WriteLatch)?;
        self.set(StateVar::WriteLatchNext, write_latch)?;

        let pos = self.get(StateVar::EramPos)?;
        let mut addr = self.bd.ins().iadd_imm(pos, latch.offset as i64);
        if latch.var_offset {
            let var_offset = self.get(StateVar::VarOffset)?;
            let words = self.bd.ins().sshr_imm(var_offset, 12);
            addr = self.bd.ins().iadd(addr, words);
        }

        if latch.high_offset {
            let low = self.bd.ins().icmp_imm(
                IntCC::UnsignedLessThanOrEqual,
                pos,
                HIGH_BANK_THRESHOLD as i64,
            );
            let low_bank = self.ir_value(0x4_0000u32);
            let high_bank = self.ir_value(0xC_0000u32);
            let bank = self.bd.ins().select(low, low_bank, high_bank);
            addr = self.bd.ins().iadd(addr, bank);
        }

        self.set(StateVar::EffectiveAddr, addr)
    }

    /// Emits the data side of the controller events of a cycle.
    pub(super) fn eram_tick(&mut self, tick: Tick) -> Result<(), PoolError> {
        if let Some(commit) = tick.commit {
            self.eram_commit(commit)?;
        }

        if let Some(latch) = tick.latch {
            self.eram_latch(latch)?;
        }

        Ok(())
    }
}
