//! A register pool: a fixed bank of cranelift variables acting as machine registers, mapped to
//! state variables in least recently used order.
//!
//! Binding a state variable to a register loads it from memory on demand, and evicting a modified
//! register spills it back. This keeps the amount of simultaneously live state values bounded,
//! which matters on targets with few registers.
use crate::state::{Pointers, StateVar};
use cranelift::{codegen::ir, frontend::FunctionBuilder};
use easyerr::Error;
use rustc_hash::FxHashMap;

/// Amount of registers in the pool.
pub const REGISTERS: usize = 10;
/// Amount of temporaries available to a single instruction.
pub const TEMPS: usize = 16;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no register can be evicted, {pinned} registers are pinned")]
    Exhausted { pinned: usize },
    #[error("instruction needs more than {TEMPS} temporaries")]
    TempsExhausted,
}

/// Handle to a register of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegHandle(u8);

impl RegHandle {
    #[inline(always)]
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy)]
struct Register {
    var: cranelift::frontend::Variable,
    bound: Option<StateVar>,
    /// Whether the register holds the value of the bound variable.
    loaded: bool,
    /// Whether the register holds a value not yet written to memory.
    dirty: bool,
    pins: u16,
    last_use: u64,
}

/// Counters of pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub loads: u32,
    pub spills: u32,
    pub evictions: u32,
}

pub struct RegisterPool {
    ptrs: Pointers,
    regs: Vec<Register>,
    bindings: FxHashMap<StateVar, RegHandle>,
    clock: u64,
    temps: Vec<cranelift::frontend::Variable>,
    temps_used: usize,
    stats: PoolStats,
}

impl RegisterPool {
    pub fn new(bd: &mut FunctionBuilder<'_>, ptrs: Pointers) -> Self {
        let regs = (0..REGISTERS)
            .map(|_| Register {
                var: bd.declare_var(ir::types::I32),
                bound: None,
                loaded: false,
                dirty: false,
                pins: 0,
                last_use: 0,
            })
            .collect();

        Self {
            ptrs,
            regs,
            bindings: FxHashMap::default(),
            clock: 0,
            temps: Vec::with_capacity(TEMPS),
            temps_used: 0,
            stats: PoolStats::default(),
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// The register a variable is bound to, if any.
    pub fn binding(&self, var: StateVar) -> Option<RegHandle> {
        self.bindings.get(&var).copied()
    }

    fn spill(&mut self, bd: &mut FunctionBuilder<'_>, index: usize) {
        let reg = &mut self.regs[index];
        let (Some(var), true) = (reg.bound, reg.dirty) else {
            return;
        };

        let value = bd.use_var(reg.var);
        self.ptrs.store(bd, var, value);
        reg.dirty = false;
        self.stats.spills += 1;
    }

    fn evict(&mut self, bd: &mut FunctionBuilder<'_>) -> Result<usize, PoolError> {
        let victim = self
            .regs
            .iter()
            .enumerate()
            .filter(|(_, r)| r.pins == 0)
            .min_by_key(|(_, r)| r.last_use)
            .map(|(i, _)| i)
            .ok_or(PoolError::Exhausted {
                pinned: self.regs.len(),
            })?;

        self.spill(bd, victim);

        let reg = &mut self.regs[victim];
        if let Some(var) = reg.bound.take() {
            self.bindings.remove(&var);
        }

        reg.loaded = false;
        self.stats.evictions += 1;

        Ok(victim)
    }

    /// Binds `var` to a register and returns it. The register is loaded from memory when `read`
    /// is set and it does not hold the value yet, and marked as modified when `write` is set.
    pub fn acquire(
        &mut self,
        bd: &mut FunctionBuilder<'_>,
        var: StateVar,
        read: bool,
        write: bool,
    ) -> Result<RegHandle, PoolError> {
        self.clock += 1;

        let index = match self.bindings.get(&var) {
            Some(handle) => handle.index(),
            None => {
                let index = match self.regs.iter().position(|r| r.bound.is_none()) {
                    Some(free) => free,
                    None => self.evict(bd)?,
                };

                let reg = &mut self.regs[index];
                reg.bound = Some(var);
                reg.loaded = false;
                reg.dirty = false;
                self.bindings.insert(var, RegHandle(index as u8));

                index
            }
        };

        let reg = &mut self.regs[index];
        reg.last_use = self.clock;

        if read && !reg.loaded {
            let value = self.ptrs.load(bd, var);
            bd.def_var(reg.var, value);
            reg.loaded = true;
            self.stats.loads += 1;
        }

        if write {
            reg.loaded = true;
            reg.dirty = true;
        }

        Ok(RegHandle(index as u8))
    }

    /// Reads the value held by a register.
    pub fn read(&self, bd: &mut FunctionBuilder<'_>, handle: RegHandle) -> ir::Value {
        bd.use_var(self.regs[handle.index()].var)
    }

    /// Writes a value to a register. The register must have been acquired for writing.
    pub fn write(&self, bd: &mut FunctionBuilder<'_>, handle: RegHandle, value: ir::Value) {
        debug_assert!(self.regs[handle.index()].dirty);
        bd.def_var(self.regs[handle.index()].var, value);
    }

    pub fn pin(&mut self, handle: RegHandle) {
        self.regs[handle.index()].pins += 1;
    }

    pub fn unpin(&mut self, handle: RegHandle) {
        let reg = &mut self.regs[handle.index()];
        debug_assert!(reg.pins > 0);
        reg.pins = reg.pins.saturating_sub(1);
    }

    /// Runs `f` with `handle` pinned, so that it cannot be evicted in the meantime.
    pub fn pinned<R>(&mut self, handle: RegHandle, f: impl FnOnce(&mut Self) -> R) -> R {
        self.pin(handle);
        let result = f(self);
        self.unpin(handle);

        result
    }

    /// Returns an anonymous temporary, valid until [`Self::release_temps`].
    pub fn temp(
        &mut self,
        bd: &mut FunctionBuilder<'_>,
    ) -> Result<cranelift::frontend::Variable, PoolError> {
        if self.temps_used == TEMPS {
            return Err(PoolError::TempsExhausted);
        }

        if self.temps.len() == self.temps_used {
            self.temps.push(bd.declare_var(ir::types::I32));
        }

        self.temps_used += 1;
        Ok(self.temps[self.temps_used - 1])
    }

    pub fn release_temps(&mut self) {
        self.temps_used = 0;
    }

    /// Writes every modified register back to memory, except scratch variables. Returns how
    /// many registers were written.
    pub fn flush(&mut self, bd: &mut FunctionBuilder<'_>) -> usize {
        let mut written = 0;
        for reg in &mut self.regs {
            let Some(var) = reg.bound else {
                continue;
            };

            if reg.dirty && !var.is_scratch() {
                let value = bd.use_var(reg.var);
                self.ptrs.store(bd, var, value);
                written += 1;
            }

            reg.dirty = false;
        }

        written
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use cranelift::{
        codegen::ir::{AbiParam, Function, Signature},
        frontend::FunctionBuilderContext,
        prelude::{InstBuilder, isa::CallConv},
    };

    fn with_pool(f: impl FnOnce(&mut FunctionBuilder<'_>, &mut RegisterPool)) {
        let mut func = Function::new();
        func.signature = Signature {
            params: vec![AbiParam::new(ir::types::I64); 6],
            returns: vec![],
            call_conv: CallConv::SystemV,
        };

        let mut ctx = FunctionBuilderContext::new();
        let mut bd = FunctionBuilder::new(&mut func, &mut ctx);
        let entry = bd.create_block();
        bd.append_block_params_for_function_params(entry);
        bd.switch_to_block(entry);
        bd.seal_block(entry);

        let params = bd.block_params(entry).to_vec();
        let ptrs = Pointers {
            cores: [params[0], params[1]],
            shared: params[2],
            eram: params[3],
            tables: params[4],
            frame: params[5],
        };

        let mut pool = RegisterPool::new(&mut bd, ptrs);
        f(&mut bd, &mut pool);

        pool.flush(&mut bd);
        bd.ins().return_(&[]);
        bd.finalize();
    }

    fn slot(index: u8) -> StateVar {
        StateVar::Slot {
            core: index / 6,
            index: index % 6,
        }
    }

    #[test]
    fn rebinding_returns_same_register() {
        with_pool(|bd, pool| {
            let a = pool.acquire(bd, StateVar::LastA(0), true, false).unwrap();
            let b = pool.acquire(bd, StateVar::LastA(0), true, true).unwrap();
            assert_eq!(a, b);
            assert_eq!(pool.stats().loads, 1);
        });
    }

    #[test]
    fn evicts_least_recently_used() {
        with_pool(|bd, pool| {
            for i in 0..REGISTERS as u8 {
                let handle = pool.acquire(bd, slot(i), false, true).unwrap();
                let value = bd.ins().iconst(ir::types::I32, i as i64);
                pool.write(bd, handle, value);
            }

            // touch slot 0 so that slot 1 becomes the oldest
            pool.acquire(bd, slot(0), true, false).unwrap();
            pool.acquire(bd, slot(10), false, true).unwrap();

            assert!(pool.binding(slot(1)).is_none());
            assert!(pool.binding(slot(0)).is_some());
            assert_eq!(pool.stats().spills, 1);
            assert_eq!(pool.stats().evictions, 1);

            // reading it back reloads from memory
            pool.acquire(bd, slot(1), true, false).unwrap();
            assert_eq!(pool.stats().loads, 1);
        });
    }

    #[test]
    fn pinned_registers_are_not_evicted() {
        with_pool(|bd, pool| {
            let first = pool.acquire(bd, slot(0), false, true).unwrap();
            let value = bd.ins().iconst(ir::types::I32, 1);
            pool.write(bd, first, value);

            for i in 1..REGISTERS as u8 {
                pool.acquire(bd, slot(i), true, false).unwrap();
            }

            pool.pinned(first, |pool| {
                pool.acquire(bd, slot(11), true, false).unwrap();
            });

            assert_eq!(pool.binding(slot(0)), Some(first));
            assert!(pool.binding(slot(1)).is_none());
        });
    }

    #[test]
    fn exhaustion_is_an_error() {
        with_pool(|bd, pool| {
            for i in 0..REGISTERS as u8 {
                let handle = pool.acquire(bd, slot(i), true, false).unwrap();
                pool.pin(handle);
            }

            let err = pool.acquire(bd, StateVar::EramPos, true, false).unwrap_err();
            assert!(matches!(err, PoolError::Exhausted { pinned: REGISTERS }));

            let handle = pool.binding(slot(3)).unwrap();
            pool.unpin(handle);
            pool.acquire(bd, StateVar::EramPos, true, false).unwrap();
            assert!(pool.binding(slot(3)).is_none());
        });
    }

    #[test]
    fn temporaries_are_bounded() {
        with_pool(|bd, pool| {
            for _ in 0..TEMPS {
                pool.temp(bd).unwrap();
            }

            assert!(matches!(pool.temp(bd), Err(PoolError::TempsExhausted)));
            pool.release_temps();
            pool.temp(bd).unwrap();
        });
    }

    #[test]
    fn flush_skips_scratch() {
        with_pool(|bd, pool| {
            let value = bd.ins().iconst(ir::types::I32, 5);
            for var in [slot(0), StateVar::Skipfield(1), StateVar::VarOffset] {
                let handle = pool.acquire(bd, var, false, true).unwrap();
                pool.write(bd, handle, value);
            }

            pool.acquire(bd, StateVar::IramPos(0), true, false).unwrap();
            assert_eq!(pool.flush(bd), 2);
            assert_eq!(pool.flush(bd), 0);
        });
    }
}
