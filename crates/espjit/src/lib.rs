//! A JIT for ESP programs. Each compiled function runs a whole sample of both cores, with the
//! accumulator pipelines replaced by rotating slots found through static analysis.
pub mod analysis;
pub mod backend;
mod builder;
pub mod function;
pub mod orchestrator;
pub mod pool;
pub mod schedule;
pub mod state;

use crate::{
    analysis::AnalysisError,
    backend::StateKind,
    builder::{Input, SampleBuilder},
    pool::PoolError,
    schedule::Schedule,
    state::{CoefTables, Frame},
};
use cranelift::{
    codegen::{self, ir},
    frontend, native,
    prelude::{Configurable, isa::TargetIsa},
};
use easyerr::{Error, ResultExt};
use espint::Esp;
use jitalloc::{Allocator, Exec};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{Display, EnumString, VariantArray};

pub use function::CompiledSample;
pub use orchestrator::{BackendKind, Orchestrator, Settings, Strategy};

/// A native code target.
#[derive(
    Debug,
    Clone,
    Copy,
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
pub enum Target {
    X64,
    Arm64,
}

impl Target {
    /// The target matching the host machine, if it is supported.
    pub fn host() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(Self::X64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Self::Arm64)
        } else {
            None
        }
    }

    fn triple(self) -> &'static str {
        match self {
            Self::X64 => "x86_64-unknown-linux-gnu",
            Self::Arm64 => "aarch64-unknown-linux-gnu",
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Analysis { source: AnalysisError },
    #[error(transparent)]
    Pool { source: PoolError },
    #[error(transparent)]
    Codegen { source: codegen::CodegenError },
    #[error("target {f0} is not supported by this build")]
    UnsupportedTarget(Target),
}

/// Compiles programs into sample functions for a single target.
pub struct Compiler {
    target: Target,
    isa: Arc<dyn TargetIsa>,
    code_ctx: codegen::Context,
    func_ctx: frontend::FunctionBuilderContext,
    allocator: Allocator<Exec>,
    compiled_count: u64,
}

impl Compiler {
    /// Creates a compiler for the host machine.
    pub fn new() -> Result<Self, BuildError> {
        match Target::host() {
            Some(target) => Self::for_target(target),
            None => Err(BuildError::UnsupportedTarget(Target::X64)),
        }
    }

    /// Creates a compiler for `target`. Code for a target other than the host can be compiled,
    /// but not run.
    pub fn for_target(target: Target) -> Result<Self, BuildError> {
        let verifier = if cfg!(debug_assertions) {
            "true"
        } else {
            "false"
        };

        let mut codegen = codegen::settings::builder();
        codegen.set("preserve_frame_pointers", "true").unwrap();
        codegen.set("use_colocated_libcalls", "false").unwrap();
        codegen.set("stack_switch_model", "basic").unwrap();
        codegen.set("unwind_info", "true").unwrap();
        codegen.set("is_pic", "false").unwrap();

        // affect runtime performance
        codegen.set("opt_level", "speed").unwrap();
        codegen.set("enable_verifier", verifier).unwrap();
        codegen.set("enable_alias_analysis", "true").unwrap();
        codegen.set("regalloc_algorithm", "backtracking").unwrap();
        codegen.set("regalloc_checker", "false").unwrap();
        codegen.set("enable_pinned_reg", "false").unwrap();
        codegen
            .set("enable_heap_access_spectre_mitigation", "false")
            .unwrap();
        codegen
            .set("enable_table_access_spectre_mitigation", "false")
            .unwrap();

        let isa_builder = if Target::host() == Some(target) {
            native::builder().map_err(|msg| {
                tracing::error!("host machine is not supported: {msg}");
                BuildError::UnsupportedTarget(target)
            })?
        } else {
            codegen::isa::lookup_by_name(target.triple())
                .map_err(|_| BuildError::UnsupportedTarget(target))?
        };

        let flags = codegen::settings::Flags::new(codegen);
        let isa = isa_builder.finish(flags).context(BuildCtx::Codegen)?;

        Ok(Self {
            target,
            isa,
            code_ctx: codegen::Context::new(),
            func_ctx: frontend::FunctionBuilderContext::new(),
            allocator: Allocator::new(),
            compiled_count: 0,
        })
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// Amount of functions compiled so far.
    pub fn compiled_count(&self) -> u64 {
        self.compiled_count
    }

    fn sample_signature(&self) -> ir::Signature {
        let ptr = self.isa.pointer_type();
        ir::Signature {
            // core 0, core 1, shared, eram, tables, frame
            params: vec![ir::AbiParam::new(ptr); 6],
            returns: vec![],
            call_conv: self.isa.default_call_conv(),
        }
    }

    /// Compiles a sample function for the current program and configuration of `esp`.
    pub fn compile(&mut self, esp: &Esp) -> Result<CompiledSample, BuildError> {
        let cycles = esp.config().cycles_per_sample as usize;
        let analysis = analysis::analyze(&esp.program, cycles).context(BuildCtx::Analysis)?;

        let eram = &esp.shared.eram;
        let schedule = if eram.enabled() {
            schedule::schedule(esp.pram(1), analysis.cycles, eram.control)
        } else {
            Schedule::disabled(eram.control)
        };

        let mut func = ir::Function::new();
        func.signature = self.sample_signature();

        let func_builder = frontend::FunctionBuilder::new(&mut func, &mut self.func_ctx);
        let input = Input {
            analysis: &analysis,
            words: [esp.pram(0), esp.pram(1)],
            schedule: &schedule,
            eram_mask: eram.mask(),
        };

        let builder = SampleBuilder::new(
            func_builder,
            self.isa.pointer_type(),
            StateKind::for_target(self.target),
            input,
        );
        builder.build().context(BuildCtx::Pool)?;

        #[cfg(debug_assertions)]
        let clir = func.display().to_string();

        self.code_ctx.clear();
        self.code_ctx.func = func;
        let compiled = self
            .code_ctx
            .compile(&*self.isa, &mut Default::default())
            .map_err(|e| e.inner)
            .context(BuildCtx::Codegen)?;

        let code = self.allocator.allocate(64, compiled.code_buffer());
        self.compiled_count += 1;

        tracing::debug!(
            "compiled {} cycles for {} into {} bytes ({} eram events)",
            analysis.cycles,
            self.target,
            code.len(),
            schedule.events()
        );

        Ok(CompiledSample {
            code,
            target: self.target,
            cycles: analysis.cycles,
            entry: schedule.entry,
            exit: schedule.exit,
            eram_enabled: eram.enabled(),
            tables: CoefTables::new(&esp.program),
            frame: Box::new(Frame::default()),
            #[cfg(debug_assertions)]
            clir,
        })
    }

    /// Returns the memory of a compiled function to the allocator.
    pub fn release(&mut self, sample: CompiledSample) {
        // SAFETY: the function is owned, so nothing can be running it
        unsafe { self.allocator.release(sample.code) };
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use espint::Config;

    fn word(op: u8, mem: u8, shift: u8, coef: u8) -> u32 {
        ((op as u32) << 16) | ((mem as u32) << 10) | ((shift as u32) << 8) | coef as u32
    }

    #[test]
    fn compiles_for_both_targets() {
        let mut esp = Esp::new(Config::default());
        esp.write_program_word(0, 0, word(0x10, 2, 1, 0x7F).to_le_bytes());
        esp.write_program_word(1, 4, word(0x50, 0x20, 0, 3).to_le_bytes());

        for target in Target::VARIANTS {
            let mut compiler = Compiler::for_target(*target).unwrap();
            let sample = compiler.compile(&esp).unwrap();

            assert!(sample.len() > 0);
            assert_eq!(sample.cycles(), 768);
            assert_eq!(sample.target(), *target);
            assert_eq!(compiler.compiled_count(), 1);

            compiler.release(sample);
        }
    }

    #[cfg(debug_assertions)]
    #[test]
    fn coefficient_loads_are_readonly() {
        let mut esp = Esp::new(Config::default());
        esp.write_program_word(0, 0, word(0x10, 2, 1, 0x7F).to_le_bytes());

        let mut compiler = Compiler::for_target(Target::X64).unwrap();
        let sample = compiler.compile(&esp).unwrap();
        let readonly = sample
            .clir()
            .lines()
            .filter(|line| line.contains("load") && line.contains("readonly"))
            .count();

        // coefficient and shift of the only MAC
        assert_eq!(readonly, 2);
        compiler.release(sample);
    }

    #[test]
    fn jumps_fail_to_compile() {
        let mut esp = Esp::new(Config::default());
        esp.write_program_word(0, 9, word(0x34, 0xC3, 0, 0).to_le_bytes());

        let mut compiler = Compiler::for_target(Target::X64).unwrap();
        let err = compiler.compile(&esp).unwrap_err();
        assert!(matches!(err, BuildError::Analysis { .. }));
    }

    #[test]
    fn compiled_code_matches_interpreter() {
        let Ok(mut compiler) = Compiler::new() else {
            return;
        };

        let config = Config {
            eram_bits: 12,
            cycles_per_sample: 768,
        };

        let mut interpreted = Esp::new(config);
        interpreted.write_program_word(0, 0, word(0x10, 2, 1, 0x7F).to_le_bytes());
        let mut jitted = interpreted.clone();

        let mut sample = compiler.compile(&jitted).unwrap();
        assert!(sample.run(&mut jitted));
        jitted.step_sample();
        interpreted.run_sample();

        let expected = (0x400 * 127) >> 6;
        assert_eq!(interpreted.cores[0].acc[1].raw, expected);
        assert_eq!(jitted.cores[0].acc[1].raw, expected);
        assert_eq!(jitted.cores, interpreted.cores);
    }
}
