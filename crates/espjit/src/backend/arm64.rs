use crate::{
    pool::PoolError,
    state::{Pointers, StateAccess, StateVar},
};
use cranelift::{
    codegen::ir,
    frontend::{FunctionBuilder, Variable},
};
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;

struct VarState {
    var: Variable,
    modified: bool,
}

/// State access with a dedicated variable per state variable, loaded on first use and written
/// back once at the end of the sample.
pub struct PinnedState {
    ptrs: Pointers,
    vars: FxHashMap<StateVar, VarState>,
    temps: Vec<Variable>,
    temps_used: usize,
}

impl PinnedState {
    pub fn new(ptrs: Pointers) -> Self {
        Self {
            ptrs,
            vars: FxHashMap::default(),
            temps: Vec::new(),
            temps_used: 0,
        }
    }
}

impl StateAccess for PinnedState {
    fn get(&mut self, bd: &mut FunctionBuilder<'_>, var: StateVar) -> Result<ir::Value, PoolError> {
        let state = match self.vars.entry(var) {
            Entry::Occupied(o) => o.into_mut(),
            Entry::Vacant(v) => {
                let loaded = self.ptrs.load(bd, var);
                let state = bd.declare_var(ir::types::I32);
                bd.def_var(state, loaded);
                v.insert(VarState {
                    var: state,
                    modified: false,
                })
            }
        };

        Ok(bd.use_var(state.var))
    }

    fn set(
        &mut self,
        bd: &mut FunctionBuilder<'_>,
        var: StateVar,
        value: ir::Value,
    ) -> Result<(), PoolError> {
        let state = match self.vars.entry(var) {
            Entry::Occupied(o) => {
                let state = o.into_mut();
                state.modified = true;

                state.var
            }
            Entry::Vacant(v) => {
                let state = bd.declare_var(ir::types::I32);
                v.insert(VarState {
                    var: state,
                    modified: true,
                });

                state
            }
        };

        bd.def_var(state, value);
        Ok(())
    }

    fn temp(&mut self, bd: &mut FunctionBuilder<'_>) -> Result<Variable, PoolError> {
        if self.temps_used == self.temps.len() {
            self.temps.push(bd.declare_var(ir::types::I32));
        }

        self.temps_used += 1;
        Ok(self.temps[self.temps_used - 1])
    }

    fn end_instruction(&mut self) {
        self.temps_used = 0;
    }

    fn flush(&mut self, bd: &mut FunctionBuilder<'_>) {
        for (var, state) in &self.vars {
            if !state.modified || var.is_scratch() {
                continue;
            }

            let value = bd.use_var(state.var);
            self.ptrs.store(bd, *var, value);
        }
    }
}
