//! Keeps a compiled sample function in sync with the program of an [`Esp`], falling back to the
//! interpreter whenever the function can't be used.
use crate::{CompiledSample, Compiler, Target, analysis::coefficient_only};
use espint::{CORES, Config, Edit, EditKind, Esp, Program};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, VariantArray};

/// Which backend executes samples.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    VariantArray,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Native code for the host if supported, the interpreter otherwise.
    #[default]
    Auto,
    Interpreter,
    X64,
    Arm64,
}

/// A backend choice, resolved against the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    Interpreter,
    Native(Target),
}

impl BackendKind {
    pub fn resolve(self) -> Strategy {
        let target = match self {
            Self::Auto => return Target::host().map_or(Strategy::Interpreter, Strategy::Native),
            Self::Interpreter => return Strategy::Interpreter,
            Self::X64 => Target::X64,
            Self::Arm64 => Target::Arm64,
        };

        if Target::host() == Some(target) {
            Strategy::Native(target)
        } else {
            tracing::warn!("{target} code can't run on this machine, using the interpreter");
            Strategy::Interpreter
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub backend: BackendKind,
    /// Samples a core must stay untouched before it is recompiled.
    pub debounce: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            debounce: 3,
        }
    }
}

pub struct Orchestrator {
    esp: Esp,
    settings: Settings,
    strategy: Strategy,
    compiler: Option<Compiler>,
    compiled: Option<CompiledSample>,
    /// Samples left until each core is recompiled.
    dirty: [Option<u8>; CORES],
    /// Whether the last compilation failed, leaving a function for an older program installed.
    stale: bool,
    recompiles: u64,
}

impl Orchestrator {
    pub fn new(config: Config, settings: Settings) -> Self {
        let mut strategy = settings.backend.resolve();
        let compiler = match strategy {
            Strategy::Interpreter => None,
            Strategy::Native(target) => match Compiler::for_target(target) {
                Ok(compiler) => Some(compiler),
                Err(err) => {
                    tracing::error!("failed to create a {target} compiler: {err}");
                    strategy = Strategy::Interpreter;
                    None
                }
            },
        };

        tracing::info!("executing samples with {strategy:?}");

        let mut orchestrator = Self {
            esp: Esp::new(config),
            settings,
            strategy,
            compiler,
            compiled: None,
            dirty: [None; CORES],
            stale: false,
            recompiles: 0,
        };

        orchestrator.invalidate();
        orchestrator
    }

    #[inline(always)]
    pub fn esp(&self) -> &Esp {
        &self.esp
    }

    /// Mutable access to the device. Program changes made through it are not tracked, see
    /// [`Self::invalidate`].
    #[inline(always)]
    pub fn esp_mut(&mut self) -> &mut Esp {
        &mut self.esp
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn compiled(&self) -> Option<&CompiledSample> {
        self.compiled.as_ref()
    }

    /// Amount of compilations attempted so far.
    pub fn recompile_count(&self) -> u64 {
        self.recompiles
    }

    fn mark_dirty(&mut self, core: usize) {
        if self.compiler.is_some() {
            self.dirty[core] = Some(self.settings.debounce.max(1));
        }
    }

    /// Marks both cores as changed.
    pub fn invalidate(&mut self) {
        for core in 0..CORES {
            self.mark_dirty(core);
        }
    }

    fn apply(&mut self, edit: Option<Edit>) -> Option<Edit> {
        let edit = edit?;
        for changed in &edit.words {
            let Some((core, index)) = changed.location() else {
                continue;
            };

            let fast = edit.kind == EditKind::Coefficient
                && self.dirty[core].is_none()
                && coefficient_only(changed.old, changed.new);

            match self.compiled.as_mut() {
                Some(compiled) if fast => compiled.update_coefficient(core, index, changed.new),
                _ => self.mark_dirty(core),
            }
        }

        Some(edit)
    }

    /// Replaces the whole program memory.
    pub fn load_program(&mut self, program: Program) {
        self.esp.program = program;
        self.invalidate();
    }

    pub fn write_program_word(
        &mut self,
        core: usize,
        index: usize,
        bytes: [u8; 4],
    ) -> Option<Edit> {
        let edit = self.esp.write_program_word(core, index, bytes);
        self.apply(edit)
    }

    pub fn write_program_byte(&mut self, address: u16, value: u8) -> Option<Edit> {
        let edit = self.esp.write_program_byte(address, value);
        self.apply(edit)
    }

    /// Replaces the coefficient of an instruction, patching the compiled function in place when
    /// possible.
    pub fn write_coefficient(&mut self, core: usize, index: usize, coef: u8) -> Option<Edit> {
        let edit = self.esp.write_coefficient(core, index, coef);
        self.apply(edit)
    }

    pub fn write_uc(&mut self, address: u32, value: u8) -> Option<Edit> {
        let edit = self.esp.write_uc(address, value);
        self.apply(edit)
    }

    pub fn read_uc(&self, address: u32) -> u8 {
        self.esp.read_uc(address)
    }

    pub fn read_host_register(&self) -> u32 {
        self.esp.read_host_register()
    }

    pub fn step_cycle(&mut self) {
        self.esp.step_cycle();
    }

    pub fn step_core(&mut self, core: usize) {
        self.esp.step_core(core);
    }

    pub fn step_sample(&mut self) {
        self.esp.step_sample();
    }

    pub fn reset(&mut self) {
        self.esp.reset();
        self.invalidate();
    }

    fn recompile(&mut self) {
        let Some(compiler) = self.compiler.as_mut() else {
            return;
        };

        self.recompiles += 1;
        match compiler.compile(&self.esp) {
            Ok(sample) => {
                let len = sample.len();
                if let Some(old) = self.compiled.replace(sample) {
                    compiler.release(old);
                }

                self.stale = false;
                tracing::info!(
                    "installed sample function #{} ({len} bytes)",
                    compiler.compiled_count()
                );
            }
            Err(err) => {
                self.stale = true;
                tracing::error!("compilation failed, staying on the interpreter: {err}");
            }
        }
    }

    /// Advances the debounce counters, recompiling once a dirty core settles.
    pub fn tick(&mut self) {
        let mut due = false;
        for counter in &mut self.dirty {
            let Some(left) = counter else {
                continue;
            };

            *left = left.saturating_sub(1);
            if *left == 0 {
                *counter = None;
                due = true;
            }
        }

        if due {
            self.recompile();
        }
    }

    /// Whether the next sample would run compiled code.
    pub fn uses_compiled(&self) -> bool {
        self.dirty.iter().all(Option::is_none)
            && !self.stale
            && self.compiled.as_ref().is_some_and(|c| c.can_run(&self.esp))
    }

    /// Processes a whole sample: its cycles, the sample step and a debounce tick.
    pub fn process_sample(&mut self) {
        let clean = self.dirty.iter().all(Option::is_none) && !self.stale;
        let ran = clean
            && self
                .compiled
                .as_mut()
                .is_some_and(|compiled| compiled.run(&mut self.esp));

        if !ran {
            for _ in 0..self.esp.config().cycles_per_sample {
                self.esp.step_cycle();
            }
        }

        self.esp.step_sample();
        self.tick();
    }
}
