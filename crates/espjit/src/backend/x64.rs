use crate::{
    pool::{PoolError, RegHandle, RegisterPool},
    state::{Pointers, StateAccess, StateVar},
};
use cranelift::{
    codegen::ir,
    frontend::{FunctionBuilder, Variable},
};
use tinyvec::ArrayVec;

/// State access through the register pool. Every register touched by an instruction stays pinned
/// until the instruction ends.
pub struct PooledState {
    pool: RegisterPool,
    pinned: ArrayVec<[Option<RegHandle>; 32]>,
}

impl PooledState {
    pub fn new(bd: &mut FunctionBuilder<'_>, ptrs: Pointers) -> Self {
        Self {
            pool: RegisterPool::new(bd, ptrs),
            pinned: ArrayVec::new(),
        }
    }

    fn pin(&mut self, handle: RegHandle) {
        self.pool.pin(handle);
        self.pinned.push(Some(handle));
    }
}

impl StateAccess for PooledState {
    fn get(&mut self, bd: &mut FunctionBuilder<'_>, var: StateVar) -> Result<ir::Value, PoolError> {
        let handle = self.pool.acquire(bd, var, true, false)?;
        self.pin(handle);

        Ok(self.pool.read(bd, handle))
    }

    fn set(
        &mut self,
        bd: &mut FunctionBuilder<'_>,
        var: StateVar,
        value: ir::Value,
    ) -> Result<(), PoolError> {
        let handle = self.pool.acquire(bd, var, false, true)?;
        self.pin(handle);
        self.pool.write(bd, handle, value);

        Ok(())
    }

    fn temp(&mut self, bd: &mut FunctionBuilder<'_>) -> Result<Variable, PoolError> {
        self.pool.temp(bd)
    }

    fn end_instruction(&mut self) {
        for handle in self.pinned.drain(..).flatten() {
            self.pool.unpin(handle);
        }

        self.pool.release_temps();
    }

    fn flush(&mut self, bd: &mut FunctionBuilder<'_>) {
        let written = self.pool.flush(bd);
        let stats = self.pool.stats();
        tracing::debug!(
            "register pool: {written} registers written back, {} loads, {} spills, {} evictions",
            stats.loads,
            stats.spills,
            stats.evictions
        );
    }
}
