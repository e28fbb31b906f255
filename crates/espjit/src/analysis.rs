//! Static analysis of the programs of both cores.
//!
//! The analysis finds, for every instruction, which accumulator it writes and which it reads
//! through the pipeline, whether its MAC result can ever be observed and which of the rotating
//! slots holds each accumulator value. Slots replace the simulated pipeline: a delayed read
//! becomes a read of the slot written by the instruction three cycles earlier.
use easyerr::Error;
use espint::{
    CORES, PRAM_LEN, Program,
    acc::PIPELINE_DEPTH,
    decode,
    ins::{Acc, ControlOp, Instruction, Opcode},
};
use std::fmt::{self, Write};

/// Rotating slots per accumulator. Accumulator B uses the slots after the ones of A.
pub const SLOTS_PER_ACC: u8 = 3;
/// Total slots per core.
pub const SLOTS: usize = 2 * SLOTS_PER_ACC as usize;
/// Cycles after a set-condition during which its skip bits can still zero an operand.
pub const SKIP_WINDOW: usize = 10;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("core {core} has a jump at pc {pc}")]
    UnsupportedJump { core: usize, pc: u16 },
}

/// Where an accumulator value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Slot(u8),
    /// The accumulator as it was at the start of the sample.
    EntryRaw,
    /// Entry `k` of the pipeline window at the start of the sample, oldest first.
    EntryHist(u8),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Slot(slot) => write!(f, "s{slot}"),
            Source::EntryRaw => f.write_str("raw"),
            Source::EntryHist(k) => write!(f, "hist{k}"),
        }
    }
}

/// Analysis results of a single instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Access {
    /// The whole word is zero.
    pub zero: bool,
    /// Accumulator written by the MAC. `None` when the MAC has no effect.
    pub writes: Option<Acc>,
    /// Accumulator read through the pipeline.
    pub saves: Option<Acc>,
    pub clear: bool,
    /// Whether this is a set-condition instruction.
    pub condition: bool,
    /// Whether the written value is observed.
    pub used: bool,
    /// Whether the MAC can be skipped entirely.
    pub nomac: bool,
    /// Whether the skip field may be non-zero when this instruction executes.
    pub skip_live: bool,
    /// Value accumulated onto, `None` when clearing.
    pub src: Option<Source>,
    /// Slot written by the MAC.
    pub dest: Option<u8>,
    /// Value returned by the pipeline read.
    pub read: Option<Source>,
}

/// Values of an accumulator once the sample is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    pub raw: Source,
    /// Pipeline window, oldest first.
    pub window: [Source; PIPELINE_DEPTH],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreAnalysis {
    pub accesses: Vec<Access>,
    pub exit: [Exit; 2],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    pub cycles: usize,
    pub cores: [CoreAnalysis; CORES],
}

/// Accumulator read through the pipeline by an instruction, if any.
pub fn saved_acc(ins: &Instruction) -> Option<Acc> {
    match ins.opcode {
        Opcode::StoreA
        | Opcode::StoreAIntoB
        | Opcode::StoreKeep
        | Opcode::StoreGramA
        | Opcode::StoreRaw
        | Opcode::ClrStoreRaw
        | Opcode::StoreRect
        | Opcode::ClrStoreRect
        | Opcode::InterpStorePos
        | Opcode::ClrInterpStorePos
        | Opcode::InterpStoreNeg
        | Opcode::ClrInterpStoreNeg => Some(Acc::A),
        Opcode::StoreB | Opcode::StoreBIntoB | Opcode::StoreBKeepIntoB | Opcode::StoreGramB => {
            Some(Acc::B)
        }
        Opcode::MulCoef => (ins.coef & 4 != 0).then_some(ins.acc),
        Opcode::Control => match ins.control()? {
            ControlOp::WriteMulCoef { source, .. } => Some(source),
            ControlOp::Jump(_)
            | ControlOp::WriteVarOffset
            | ControlOp::WriteHost
            | ControlOp::WriteLatch => Some(ins.acc),
            _ => None,
        },
        _ => None,
    }
}

/// Whether replacing `old` with `new` leaves the analysis and the emitted code unchanged, so that
/// only the coefficient and shift tables need to be updated.
pub fn coefficient_only(old: u32, new: u32) -> bool {
    let (old, new) = (decode(old), decode(new));
    if old.is_nop()
        || new.is_nop()
        || old.opcode != new.opcode
        || old.mem != new.mem
        || old.word >> 23 != new.word >> 23
    {
        return false;
    }

    match old.opcode {
        Opcode::MulCoef => false,
        Opcode::ReadGram | Opcode::ClrReadGram => old.shift_bits & 2 == new.shift_bits & 2,
        _ => true,
    }
}

/// Latest writer at or before `limit`.
fn latest_writer(writers: &[usize], limit: isize) -> Option<usize> {
    let count = writers.partition_point(|&w| w as isize <= limit);
    count.checked_sub(1).map(|i| writers[i])
}

fn resolve(accesses: &[Access], writer: Option<usize>, pc: usize) -> Source {
    match writer {
        Some(w) => Source::Slot(accesses[w].dest.expect("observed writers always have a slot")),
        None if pc < PIPELINE_DEPTH => Source::EntryHist(pc as u8),
        None => Source::EntryRaw,
    }
}

fn analyze_core(core: usize, words: &[u32]) -> Result<CoreAnalysis, AnalysisError> {
    let cycles = words.len();
    let depth = PIPELINE_DEPTH as isize;

    // classification
    let mut accesses = Vec::with_capacity(cycles);
    let mut writers: [Vec<usize>; 2] = [vec![], vec![]];
    for (pc, &word) in words.iter().enumerate() {
        let ins = decode(word);
        if ins.is_jump() {
            return Err(AnalysisError::UnsupportedJump {
                core,
                pc: pc as u16,
            });
        }

        let writes = (!ins.is_nop()).then_some(ins.acc);
        let condition = ins.opcode == Opcode::SetCondition;
        if let Some(acc) = writes {
            writers[acc.index()].push(pc);
        }

        accesses.push(Access {
            zero: word == 0,
            writes,
            saves: saved_acc(&ins),
            clear: writes.is_some() && ins.clear,
            condition,
            used: condition,
            ..Default::default()
        });
    }

    // liveness
    let mut reads_from = vec![None; cycles];
    for pc in 0..cycles {
        if let Some(acc) = accesses[pc].saves {
            let writer = latest_writer(&writers[acc.index()], pc as isize - depth);
            if let Some(w) = writer {
                accesses[w].used = true;
            }

            reads_from[pc] = writer;
        }
    }

    let mut exit_reads = [[None; PIPELINE_DEPTH]; 2];
    for (acc, list) in writers.iter().enumerate() {
        for (k, read) in exit_reads[acc].iter_mut().enumerate() {
            *read = latest_writer(list, (cycles + k) as isize - depth);
            if let Some(w) = *read {
                accesses[w].used = true;
            }
        }

        if let Some(&last) = list.last() {
            accesses[last].used = true;
        }
    }

    // dead MACs: overwritten by a clear before anything observes them
    for list in &writers {
        let mut killed = false;
        for &w in list.iter().rev() {
            let access = &mut accesses[w];
            access.nomac = !access.used && killed;
            killed = access.clear || (!access.used && killed);
        }
    }

    // renaming
    let mut next = [0u8; 2];
    let mut last = [Source::EntryRaw; 2];
    for pc in 0..cycles {
        if accesses[pc].saves.is_some() {
            accesses[pc].read = Some(resolve(&accesses, reads_from[pc], pc));
        }

        let access = &mut accesses[pc];
        let Some(acc) = access.writes else {
            continue;
        };

        if access.nomac {
            continue;
        }

        let i = acc.index();
        let slot = next[i] + i as u8 * SLOTS_PER_ACC;
        access.src = (!access.clear).then_some(last[i]);
        access.dest = Some(slot);
        last[i] = Source::Slot(slot);

        if access.used {
            next[i] = (next[i] + 1) % SLOTS_PER_ACC;
        }
    }

    let exit = std::array::from_fn(|acc| Exit {
        raw: last[acc],
        window: std::array::from_fn(|k| resolve(&accesses, exit_reads[acc][k], cycles + k)),
    });

    // skip windows
    let mut live_until = SKIP_WINDOW;
    for (pc, access) in accesses.iter_mut().enumerate() {
        access.skip_live = pc < live_until;
        if access.condition {
            live_until = live_until.max(pc + 1 + SKIP_WINDOW);
        }
    }

    Ok(CoreAnalysis { accesses, exit })
}

/// Analyzes the first `cycles` words of the program of each core.
pub fn analyze(program: &Program, cycles: usize) -> Result<Analysis, AnalysisError> {
    let cycles = cycles.clamp(PIPELINE_DEPTH, PRAM_LEN);
    let core0 = analyze_core(0, &program.core(0)[..cycles])?;
    let core1 = analyze_core(1, &program.core(1)[..cycles])?;

    tracing::debug!(
        "analyzed {cycles} cycles: {} dead MACs",
        core0
            .accesses
            .iter()
            .chain(&core1.accesses)
            .filter(|a| a.nomac)
            .count()
    );

    Ok(Analysis {
        cycles,
        cores: [core0, core1],
    })
}

fn optional<T: fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_owned(), |v| v.to_string())
}

impl Analysis {
    /// A text listing of the slot assignment of every non-zero instruction.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for (core, analysis) in self.cores.iter().enumerate() {
            let _ = writeln!(out, "core {core}");
            for (pc, access) in analysis.accesses.iter().enumerate() {
                if access.zero {
                    continue;
                }

                let acc = match access.writes {
                    Some(Acc::A) => 'A',
                    Some(Acc::B) => 'B',
                    None => '-',
                };

                let _ = writeln!(
                    out,
                    "{pc:03x}: {acc} src {:<6} dest {:<3} read {:<6}{}{}",
                    optional(access.src),
                    optional(access.dest.map(Source::Slot)),
                    optional(access.read),
                    if access.nomac { " nomac" } else { "" },
                    if access.skip_live { " skip" } else { "" },
                );
            }

            for (acc, exit) in analysis.exit.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "exit {}: raw {} window {} {} {}",
                    if acc == 0 { 'A' } else { 'B' },
                    exit.raw,
                    exit.window[0],
                    exit.window[1],
                    exit.window[2],
                );
            }
        }

        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn word(op: u8, mem: u8, shift: u8, coef: u8) -> u32 {
        ((op as u32) << 16) | ((mem as u32) << 10) | ((shift as u32) << 8) | coef as u32
    }

    fn program(core0: &[(usize, u32)]) -> Program {
        let mut program = Program::default();
        for &(pc, w) in core0 {
            program.set_word(pc, w);
        }

        program
    }

    #[test]
    fn overwritten_mac_is_dead() {
        let program = program(&[(0, word(0x10, 2, 0, 1)), (1, word(0x14, 2, 0, 1))]);
        let analysis = analyze(&program, 768).unwrap();
        let accesses = &analysis.cores[0].accesses;

        assert!(accesses[0].nomac);
        assert!(!accesses[1].nomac);
        assert!(accesses[1].used);
        assert_eq!(accesses[1].dest, Some(3));
        assert_eq!(analysis.cores[0].exit[1].raw, Source::Slot(3));
    }

    #[test]
    fn observed_mac_is_kept() {
        // pc 3 stores A as written at pc 0
        let program = program(&[
            (0, word(0x04, 2, 0, 1)),
            (3, word(0x58, 0x20, 0, 0)),
            (5, word(0x04, 2, 0, 1)),
        ]);
        let analysis = analyze(&program, 768).unwrap();
        let accesses = &analysis.cores[0].accesses;

        assert!(accesses[0].used);
        assert_eq!(accesses[0].dest, Some(0));
        assert_eq!(accesses[3].read, Some(Source::Slot(0)));
        // pc 3 is overwritten by the clear at pc 5
        assert!(accesses[3].nomac);
        assert_eq!(accesses[3].dest, None);
        assert_eq!(accesses[5].dest, Some(1));
    }

    #[test]
    fn reads_without_writer_use_entry_state() {
        let program = program(&[(1, word(0x58, 0x20, 0, 0)), (6, word(0x0C, 0x21, 0, 0))]);
        let analysis = analyze(&program, 768).unwrap();
        let accesses = &analysis.cores[0].accesses;

        assert_eq!(accesses[1].read, Some(Source::EntryHist(1)));
        assert_eq!(accesses[6].read, Some(Source::EntryRaw));
    }

    #[test]
    fn slots_rotate() {
        let mut words = vec![];
        for pc in 0..3 {
            words.push((pc, word(0x14, 2, 0, pc as u8 + 1)));
        }
        for pc in 3..6 {
            words.push((pc, word(0x0C, 0x20 + pc as u8, 0, 0)));
        }

        let analysis = analyze(&program(&words), 768).unwrap();
        let accesses = &analysis.cores[0].accesses;

        for pc in 0..3 {
            assert_eq!(accesses[pc].dest, Some(3 + pc as u8), "pc {pc}");
            assert_eq!(accesses[pc + 3].read, Some(Source::Slot(3 + pc as u8)));
        }

        // the stores clear A and only the last one survives
        assert!(accesses[3].nomac);
        assert!(accesses[4].nomac);
        assert!(!accesses[5].nomac);
        assert_eq!(accesses[5].dest, Some(0));
        assert_eq!(analysis.cores[0].exit[1].window, [Source::Slot(5); 3]);
    }

    #[test]
    fn exit_window_crosses_sample_boundary() {
        let program = program(&[(766, word(0x04, 2, 0, 1))]);
        let analysis = analyze(&program, 768).unwrap();
        let exit = analysis.cores[0].exit[0];

        assert_eq!(exit.raw, Source::Slot(0));
        assert_eq!(
            exit.window,
            [Source::EntryRaw, Source::Slot(0), Source::Slot(0)]
        );
    }

    #[test]
    fn skip_windows() {
        let program = program(&[(20, word(0x50, 0, 0, 0))]);
        let analysis = analyze(&program, 768).unwrap();
        let accesses = &analysis.cores[0].accesses;

        assert!(accesses[9].skip_live);
        assert!(!accesses[10].skip_live);
        assert!(!accesses[20].skip_live);
        assert!(accesses[21].skip_live);
        assert!(accesses[30].skip_live);
        assert!(!accesses[31].skip_live);
    }

    #[test]
    fn jumps_are_rejected() {
        let mut program = Program::default();
        program.set_word(0x400 + 7, word(0x34, 0xC3, 0, 0));

        let err = analyze(&program, 768).unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::UnsupportedJump { core: 1, pc: 7 }
        ));
    }

    #[test]
    fn coefficient_edits() {
        let mac = word(0x00, 5, 0, 0x10);
        assert!(coefficient_only(mac, word(0x00, 5, 3, 0x7F)));
        assert!(!coefficient_only(mac, word(0x00, 6, 0, 0x10)));
        assert!(!coefficient_only(mac, 0));
        assert!(!coefficient_only(word(0x30, 5, 0, 0), word(0x30, 5, 0, 1)));
        assert!(coefficient_only(word(0x20, 5, 2, 0), word(0x20, 5, 3, 9)));
        assert!(!coefficient_only(word(0x20, 5, 0, 0), word(0x20, 5, 2, 0)));
        assert!(!coefficient_only(mac, mac | (1 << 23)));
    }
}
