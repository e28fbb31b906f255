use espint::{
    CORES, Config, Esp, IRAM_LEN, PRAM_LEN, decode,
    ins::ControlOp,
};
use espjit::{Compiler, Target};
use libtest_mimic::{Arguments, Failed, Trial};
use nanorand::{Rng, WyRand};
use std::fmt::Write;

const SEEDS: u64 = 16;
const CASES: usize = 6;
const SAMPLES: usize = 4;

fn sign_extend(value: u32, bits: u32) -> i32 {
    ((value << (32 - bits)) as i32) >> (32 - bits)
}

fn random_word(rng: &mut WyRand, core: usize) -> u32 {
    loop {
        let word = match rng.generate_range(0..8u32) {
            0 => 0,
            1 => rng.generate::<u32>() & 0x7F_FF00,
            _ => rng.generate::<u32>() & 0x7F_FFFF,
        };

        let eram = if core == 1 && rng.generate_range(0..4u32) == 0 {
            (rng.generate::<u32>() & 0x1F) << 23
        } else {
            0
        };

        let word = word | eram;
        if !matches!(decode(word).control(), Some(ControlOp::Jump(_))) {
            return word;
        }
    }
}

fn random_esp(rng: &mut WyRand, eram: bool) -> Esp {
    let cycles_per_sample = if rng.generate::<bool>() {
        768
    } else {
        rng.generate_range(3..=768u16)
    };

    let eram_bits = if eram {
        rng.generate_range(10..=14u8)
    } else {
        0
    };

    let mut esp = Esp::new(Config {
        eram_bits,
        cycles_per_sample,
    });

    for core in 0..CORES {
        for index in 0..PRAM_LEN {
            let word = random_word(rng, core);
            esp.write_program_word(core, index, word.to_le_bytes());
        }
    }

    for core in &mut esp.cores {
        for value in &mut core.iram {
            *value = sign_extend(rng.generate(), 24);
        }

        for acc in &mut core.acc {
            acc.raw = sign_extend(rng.generate(), 30);
            for value in &mut acc.hist {
                *value = sign_extend(rng.generate(), 30);
            }
            acc.head = rng.generate_range(0..3u32);
        }

        core.iram_pos = rng.generate_range(0..IRAM_LEN as u32);
    }

    for value in &mut esp.shared.gram {
        *value = sign_extend(rng.generate(), 24);
    }

    for value in &mut esp.shared.mulcoeffs {
        *value = sign_extend(rng.generate(), 24);
    }

    for value in esp.shared.eram.memory_mut() {
        *value = sign_extend(rng.generate(), 24);
    }

    esp
}

/// Names of the parts of the state which differ between `jitted` and `interpreted`.
fn divergences(jitted: &Esp, interpreted: &Esp) -> Vec<String> {
    let mut out = vec![];
    for (index, (j, i)) in jitted.cores.iter().zip(&interpreted.cores).enumerate() {
        for (acc, name) in ["A", "B"].into_iter().enumerate() {
            if j.acc[acc] != i.acc[acc] {
                out.push(format!(
                    "core{index}.acc{name}(v={:08X} {:08X?}, e={:08X} {:08X?})",
                    j.acc[acc].raw,
                    j.acc[acc].window(),
                    i.acc[acc].raw,
                    i.acc[acc].window()
                ));
            }
        }

        if let Some(offset) = (0..IRAM_LEN).find(|&k| j.iram[k] != i.iram[k]) {
            out.push(format!(
                "core{index}.iram[{offset:02X}](v={:08X}, e={:08X})",
                j.iram[offset], i.iram[offset]
            ));
        }

        let scalars = [
            ("last_a", j.last_a as u32, i.last_a as u32),
            ("last_b", j.last_b as u32, i.last_b as u32),
            ("skipfield", j.skipfield, i.skipfield),
            ("last_mul_coef", j.last_mul_coef as u32, i.last_mul_coef as u32),
            ("iram_pos", j.iram_pos, i.iram_pos),
            ("pc", j.pc as u32, i.pc as u32),
        ];

        for (name, v, e) in scalars {
            if v != e {
                out.push(format!("core{index}.{name}(v={v:08X}, e={e:08X})"));
            }
        }
    }

    let (j, i) = (&jitted.shared, &interpreted.shared);
    if let Some(offset) = (0..IRAM_LEN).find(|&k| j.gram[k] != i.gram[k]) {
        out.push(format!(
            "gram[{offset:02X}](v={:08X}, e={:08X})",
            j.gram[offset], i.gram[offset]
        ));
    }

    if j.mulcoeffs != i.mulcoeffs {
        out.push(format!(
            "mulcoeffs(v={:08X?}, e={:08X?})",
            j.mulcoeffs, i.mulcoeffs
        ));
    }

    if j.readback != i.readback {
        out.push(format!(
            "readback(v={:08X}, e={:08X})",
            j.readback, i.readback
        ));
    }

    if j.eram.control != i.eram.control {
        out.push(format!(
            "eram.control(v={:?}, e={:?})",
            j.eram.control, i.eram.control
        ));
    }

    if j.eram.data != i.eram.data {
        out.push(format!("eram.data(v={:?}, e={:?})", j.eram.data, i.eram.data));
    }

    let (jm, im) = (j.eram.memory(), i.eram.memory());
    if let Some(offset) = (0..jm.len()).find(|&k| jm[k] != im[k]) {
        out.push(format!(
            "eram[{offset:04X}](v={:08X}, e={:08X})",
            jm[offset], im[offset]
        ));
    }

    out
}

struct FailedCase {
    config: Config,
    sample: usize,
    compiled: usize,
    divergences: Vec<String>,
}

fn run_case(compiler: &mut Compiler, mut jitted: Esp) -> Result<usize, FailedCase> {
    let mut interpreted = jitted.clone();
    let config = *jitted.config();
    let mut function = compiler.compile(&jitted).map_err(|err| FailedCase {
        config,
        sample: 0,
        compiled: 0,
        divergences: vec![format!("compilation failed: {err}")],
    })?;

    let mut compiled = 0;
    let mut result = Ok(());
    for sample in 0..SAMPLES {
        if function.run(&mut jitted) {
            compiled += 1;
        } else {
            for _ in 0..config.cycles_per_sample {
                jitted.step_cycle();
            }
        }
        jitted.step_sample();
        interpreted.run_sample();

        let divergences = divergences(&jitted, &interpreted);
        if !divergences.is_empty() {
            result = Err(FailedCase {
                config,
                sample,
                compiled,
                divergences,
            });
            break;
        }
    }

    compiler.release(function);
    result.map(|()| compiled * config.cycles_per_sample as usize)
}

fn run_seed(seed: u64, quiet: bool) -> Result<(), Failed> {
    let Ok(mut compiler) = Compiler::new() else {
        return Ok(());
    };

    let mut rng = WyRand::new_seed(seed);
    let mut failures = vec![];
    let mut cycles = 0;

    for i in 0..CASES {
        // cases without ERAM always run compiled from the first sample
        let esp = random_esp(&mut rng, i % 2 == 1);
        match run_case(&mut compiler, esp) {
            Ok(count) => cycles += count,
            Err(failure) => failures.push(format!(
                "Case {i} failed at sample {} ({} compiled, {:?}): {}",
                failure.sample,
                failure.compiled,
                failure.config,
                failure.divergences.join(", ")
            )),
        }
    }

    if !failures.is_empty() {
        let mut msg = format!(
            "Failed a total of {} cases (out of {CASES})",
            failures.len()
        );

        if !quiet {
            msg.push_str("\r\n\r\n");
            for failure in &failures {
                writeln!(&mut msg, "{failure}").unwrap();
            }
        }

        return Err(Failed::from(msg));
    }

    if cycles == 0 {
        return Err(Failed::from("no sample ran compiled code"));
    }

    Ok(())
}

/// Code for the target other than the host can't run, but it must still compile.
fn compile_foreign(target: Target) -> Result<(), Failed> {
    let mut compiler = Compiler::for_target(target).map_err(|e| Failed::from(e.to_string()))?;
    let mut rng = WyRand::new_seed(0x4553_5000);

    for i in 0..CASES {
        let esp = random_esp(&mut rng, i % 2 == 1);
        let mut function = compiler
            .compile(&esp)
            .map_err(|e| Failed::from(format!("Case {i} failed to compile: {e}")))?;

        if function.run(&mut esp.clone()) {
            return Err(Failed::from(format!("Case {i} ran {target} code")));
        }

        compiler.release(function);
    }

    Ok(())
}

fn catch(f: impl FnOnce() -> Result<(), Failed> + std::panic::UnwindSafe) -> Result<(), Failed> {
    match std::panic::catch_unwind(f) {
        Ok(r) => r,
        Err(e) => {
            let mut msg = "<unknown panic>".to_owned();
            if let Some(s) = e.downcast_ref::<String>() {
                msg = s.clone();
            } else if let Some(s) = e.downcast_ref::<&'static str>() {
                msg = (*s).to_owned();
            }

            Err(Failed::from(msg))
        }
    }
}

fn main() {
    let args = Arguments::from_args();
    let quiet = args.quiet || std::env::var("QUIET").is_ok();

    let mut tests = vec![];
    for seed in 0..SEEDS {
        tests.push(Trial::test(format!("seed_{seed:02}"), move || {
            catch(move || run_seed(seed, quiet))
        }));
    }

    for target in [Target::X64, Target::Arm64] {
        if Target::host() != Some(target) {
            tests.push(Trial::test(format!("compile_{target}"), move || {
                catch(move || compile_foreign(target))
            }));
        }
    }

    std::panic::set_hook(Box::new(move |_| ()));
    libtest_mimic::run(&args, tests).exit();
}
