mod image;

use clap::{Args as ClapArgs, Parser, Subcommand};
use espint::{Config, Esp, IRAM_LEN, Program};
use espjit::{BackendKind, Orchestrator, Settings, analysis};
use eyre_pretty::{Context, Result, bail};
use image::Image;
use nanorand::{Rng, WyRand};
use std::path::PathBuf;

#[derive(Debug, ClapArgs)]
struct RunOptions {
    /// Path to the program image
    #[arg(short, long)]
    input: PathBuf,
    /// Amount of samples to run
    #[arg(short, long, default_value_t = 1)]
    samples: u64,
    /// Cycles executed in each sample
    #[arg(long, default_value_t = 768)]
    cycles: u16,
    /// Address bits of the external memory, zero disables it
    #[arg(long, default_value_t = 19)]
    eram_bits: u8,
    /// Seed used to fill IRAM and GRAM with random values
    #[arg(long)]
    seed: Option<u64>,
}

impl RunOptions {
    fn config(&self) -> Config {
        Config {
            eram_bits: self.eram_bits,
            cycles_per_sample: self.cycles,
        }
    }

    fn orchestrator(&self, program: Program, backend: BackendKind) -> Orchestrator {
        let settings = Settings {
            backend,
            ..Default::default()
        };

        let mut orchestrator = Orchestrator::new(self.config(), settings);
        orchestrator.load_program(program);
        if let Some(seed) = self.seed {
            randomize(orchestrator.esp_mut(), seed);
        }

        orchestrator
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Disassemble a program image
    Disasm {
        /// Path to the program image
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Show how the accumulator pipelines of a program map to slots
    Analyze {
        /// Path to the program image
        #[arg(short, long)]
        input: PathBuf,
        /// Cycles executed in each sample
        #[arg(long, default_value_t = 768)]
        cycles: u16,
    },
    /// Run a program and print the final state
    Run {
        #[command(flatten)]
        options: RunOptions,
        /// Backend used to execute samples
        #[arg(short, long, default_value_t = BackendKind::Auto)]
        backend: BackendKind,
        /// Path to write the external memory to after running
        #[arg(long)]
        dump_eram: Option<PathBuf>,
    },
    /// Run a program on the interpreter and on native code, reporting where they diverge
    Compare {
        #[command(flatten)]
        options: RunOptions,
    },
}

/// A CLI to inspect and run programs of the ESP DSP.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Action to take
    #[command(subcommand)]
    command: Command,
}

fn setup_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or(EnvFilter::new("esptool=info,espint=info,espjit=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn sign_extend24(value: u32) -> i32 {
    ((value << 8) as i32) >> 8
}

fn randomize(esp: &mut Esp, seed: u64) {
    let mut rng = WyRand::new_seed(seed);
    for core in &mut esp.cores {
        for value in &mut core.iram {
            *value = sign_extend24(rng.generate());
        }
    }

    for value in &mut esp.shared.gram {
        *value = sign_extend24(rng.generate());
    }
}

fn print_state(esp: &Esp) {
    for (index, core) in esp.cores.iter().enumerate() {
        for (acc, name) in core.acc.iter().zip(["A", "B"]) {
            println!(
                "core {index} acc {name}: {:08X} pipeline {:08X?}",
                acc.raw,
                acc.window()
            );
        }

        println!(
            "core {index} last a {:06X} iram pos {:02X}",
            core.last_a & 0xFF_FFFF,
            core.iram_pos as usize % IRAM_LEN
        );
    }

    println!("host readback: {:08X}", esp.read_host_register());
    println!("coefficients: {:06X?}", esp.shared.mulcoeffs);
}

fn run(options: RunOptions, backend: BackendKind, dump_eram: Option<PathBuf>) -> Result<()> {
    let image = Image::open(&options.input)?;
    let mut orchestrator = options.orchestrator(image.program(), backend);

    let mut compiled = 0;
    for _ in 0..options.samples {
        compiled += orchestrator.uses_compiled() as u64;
        orchestrator.process_sample();
    }

    tracing::info!(
        "ran {} samples ({compiled} compiled) with {:?}, {} compilations",
        options.samples,
        orchestrator.strategy(),
        orchestrator.recompile_count()
    );

    print_state(orchestrator.esp());

    if let Some(path) = dump_eram {
        let memory = orchestrator.esp().shared.eram.memory_bytes();
        std::fs::write(&path, memory).context("writing external memory")?;
        tracing::info!("wrote {} bytes of external memory", memory.len());
    }

    Ok(())
}

fn compare(options: RunOptions) -> Result<()> {
    let image = Image::open(&options.input)?;
    let program = image.program();

    let mut reference = options.orchestrator(program.clone(), BackendKind::Interpreter);
    let mut native = options.orchestrator(program, BackendKind::Auto);
    if native.strategy() == espjit::Strategy::Interpreter {
        bail!("native code is not supported on this machine");
    }

    for sample in 0..options.samples {
        reference.process_sample();
        native.process_sample();

        let (a, b) = (reference.esp(), native.esp());
        if a.cores != b.cores || a.shared != b.shared {
            println!("diverged at sample {sample}");
            println!("-- interpreter --");
            print_state(a);
            println!("-- native --");
            print_state(b);

            bail!("backends diverged");
        }
    }

    println!(
        "identical after {} samples ({} compilations)",
        options.samples,
        native.recompile_count()
    );

    Ok(())
}

fn main() -> Result<()> {
    eyre_pretty::install()?;
    setup_tracing();

    let args = Args::parse();
    match args.command {
        Command::Disasm { input } => {
            let image = Image::open(&input)?;
            print!("{}", espint::disasm::listing(&image.program()));

            Ok(())
        }
        Command::Analyze { input, cycles } => {
            let image = Image::open(&input)?;
            let analysis = analysis::analyze(&image.program(), cycles as usize)
                .context("analyzing program")?;
            print!("{}", analysis.listing());

            Ok(())
        }
        Command::Run {
            options,
            backend,
            dump_eram,
        } => run(options, backend, dump_eram),
        Command::Compare { options } => compare(options),
    }
}
