use crate::{
    Target,
    state::{CoefTables, Frame},
};
use espint::{Core, Esp, Shared, eram::Control};
use jitalloc::{Allocation, Exec};

// core 0, core 1, shared, eram, tables, frame
pub type SampleFn = unsafe extern "C" fn(
    *mut Core,
    *mut Core,
    *mut Shared,
    *mut i32,
    *const CoefTables,
    *mut Frame,
);

/// A compiled sample function, together with the data it reads at runtime.
pub struct CompiledSample {
    pub(crate) code: Allocation<Exec>,
    pub(crate) target: Target,
    pub(crate) cycles: usize,
    /// ERAM control state at the start of every sample this function can run.
    pub(crate) entry: Control,
    /// ERAM control state after running this function.
    pub(crate) exit: Control,
    pub(crate) eram_enabled: bool,
    pub(crate) tables: Box<CoefTables>,
    pub(crate) frame: Box<Frame>,
    #[cfg(debug_assertions)]
    pub(crate) clir: String,
}

impl std::fmt::Debug for CompiledSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledSample")
            .field("target", &self.target)
            .field("cycles", &self.cycles)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl CompiledSample {
    /// Size of the machine code, in bytes.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn cycles(&self) -> usize {
        self.cycles
    }

    /// The cranelift IR this function was compiled from.
    #[cfg(debug_assertions)]
    pub fn clir(&self) -> &str {
        &self.clir
    }

    /// Whether this function can execute the next sample of `esp`.
    pub fn can_run(&self, esp: &Esp) -> bool {
        Some(self.target) == Target::host()
            && esp.at_sample_start()
            && esp.config().cycles_per_sample as usize == self.cycles
            && (!self.eram_enabled || esp.shared.eram.control == self.entry)
    }

    /// Updates the coefficient and shift of an instruction without recompiling.
    pub fn update_coefficient(&mut self, core: usize, index: usize, word: u32) {
        self.tables.update(core, index, word);
    }

    fn as_ptr(&self) -> SampleFn {
        // SAFETY: the allocation holds code compiled with the sample signature, which matches
        // `SampleFn`.
        unsafe { std::mem::transmute(self.code.as_ptr().cast::<u8>()) }
    }

    /// Runs the cycles of a sample, leaving the cores at the end of it. Returns `false` without
    /// doing anything if this function can't run the sample.
    pub fn run(&mut self, esp: &mut Esp) -> bool {
        if !self.can_run(esp) {
            return false;
        }

        for core in &mut esp.cores {
            core.acc[0].normalize();
            core.acc[1].normalize();
        }

        let eram = esp.shared.eram.memory_ptr();
        let shared = std::ptr::from_mut(&mut esp.shared);
        let [core0, core1] = &mut esp.cores;
        let (core0, core1) = (std::ptr::from_mut(core0), std::ptr::from_mut(core1));

        let func = self.as_ptr();
        // SAFETY: the function only accesses the state it was compiled for through these
        // pointers, and the guard above ensured that state matches
        unsafe {
            func(
                core0,
                core1,
                shared,
                eram,
                &raw const *self.tables,
                &raw mut *self.frame,
            )
        };

        if self.eram_enabled {
            esp.shared.eram.control = self.exit;
        }

        for core in &mut esp.cores {
            core.pc = self.cycles as u16;
        }

        true
    }
}
