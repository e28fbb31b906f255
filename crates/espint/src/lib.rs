//! Interpreter for the ESP, a pipelined fixed-point DSP with two cores sharing GRAM, a
//! coefficient bank and an external memory controller.
pub mod acc;
pub mod core;
pub mod disasm;
pub mod eram;
pub mod ins;

use crate::eram::Eram;
use serde::{Deserialize, Serialize};
use tinyvec::ArrayVec;
use util::boxed_array;

pub use crate::core::{Core, IRAM_LEN, PRAM_LEN};
pub use acc::Accumulator;
pub use ins::{Instruction, decode};

/// Size of the program memory, in bytes.
pub const PROGRAM_BYTES: usize = 0x4000;
/// Size of the program memory, in words.
pub const PROGRAM_WORDS: usize = PROGRAM_BYTES / 4;
/// Index of the first program word of each core.
pub const CORE_BASE: [usize; 2] = [0x000, 0x400];
/// Amount of cores.
pub const CORES: usize = 2;

/// Microcontroller address which selects the interface mode.
pub const UC_MODE_ADDRESS: u32 = 0x2003;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Size of ERAM as a power of two. Zero disables the ERAM controller.
    pub eram_bits: u8,
    /// Cycles executed by each core per sample.
    pub cycles_per_sample: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            eram_bits: 19,
            cycles_per_sample: PRAM_LEN as u16,
        }
    }
}

impl Config {
    /// Returns this config with every field clamped to its supported range.
    pub fn validated(self) -> Self {
        Self {
            eram_bits: self.eram_bits.min(24),
            cycles_per_sample: self.cycles_per_sample.clamp(3, PRAM_LEN as u16),
        }
    }
}

/// State shared by both cores.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct Shared {
    pub gram: [i32; IRAM_LEN],
    pub mulcoeffs: [i32; 8],
    /// The host readback bank, as a little endian word.
    pub readback: u32,
    pub eram: Eram,
}

impl Shared {
    pub fn new(eram_bits: u8) -> Self {
        Self {
            gram: [0; IRAM_LEN],
            mulcoeffs: [0; 8],
            readback: 0,
            eram: Eram::new(eram_bits),
        }
    }

    pub fn reset(&mut self) {
        self.gram = [0; IRAM_LEN];
        self.mulcoeffs = [0; 8];
        self.readback = 0;
        self.eram.reset();
    }
}

/// The program memory, holding the programs of both cores.
#[derive(Clone, PartialEq, Eq)]
pub struct Program {
    words: Box<[u32; PROGRAM_WORDS]>,
}

impl Default for Program {
    fn default() -> Self {
        Self {
            words: boxed_array(0),
        }
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program").finish_non_exhaustive()
    }
}

impl Program {
    /// Builds a program memory from a little endian byte image. Missing bytes are zero.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut program = Self::default();
        for (word, chunk) in program.words.iter_mut().zip(bytes.chunks(4)) {
            let mut le = [0; 4];
            le[..chunk.len()].copy_from_slice(chunk);
            *word = u32::from_le_bytes(le);
        }

        program
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[inline(always)]
    pub fn words(&self) -> &[u32; PROGRAM_WORDS] {
        &self.words
    }

    /// The view of the program memory seen by `core`, starting at its first word.
    #[inline(always)]
    pub fn core(&self, core: usize) -> &[u32] {
        &self.words[CORE_BASE[core]..]
    }

    #[inline(always)]
    pub fn word(&self, index: usize) -> u32 {
        self.words[index % PROGRAM_WORDS]
    }

    #[inline(always)]
    pub fn byte(&self, address: usize) -> u8 {
        self.word(address >> 2).to_le_bytes()[address & 3]
    }

    /// Writes a word, returning the previous value.
    #[inline(always)]
    pub fn set_word(&mut self, index: usize, value: u32) -> u32 {
        std::mem::replace(&mut self.words[index % PROGRAM_WORDS], value)
    }
}

/// How a write to the program memory affects compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    /// Anything may have changed.
    Structural,
    /// Only coefficient and shift fields changed.
    Coefficient,
}

/// A word of the program memory which changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangedWord {
    pub index: usize,
    pub old: u32,
    pub new: u32,
}

impl ChangedWord {
    /// The core whose program contains this word, along with the index in that program.
    pub fn location(&self) -> Option<(usize, usize)> {
        let core = (self.index >= CORE_BASE[1]) as usize;
        let offset = self.index - CORE_BASE[core];
        (offset < PRAM_LEN).then_some((core, offset))
    }
}

/// A change to the program memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub kind: EditKind,
    pub words: ArrayVec<[ChangedWord; 5]>,
}

impl Edit {
    fn new(kind: EditKind) -> Self {
        Self {
            kind,
            words: ArrayVec::new(),
        }
    }

    fn into_option(self) -> Option<Self> {
        (!self.words.is_empty()).then_some(self)
    }
}

/// Staging state of the microcontroller byte interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct UcInterface {
    staging: [u8; 4],
    mode: u8,
}

/// The ESP: two cores, their shared state and the program memory.
#[derive(Debug, Clone)]
pub struct Esp {
    config: Config,
    pub program: Program,
    pub cores: [Core; CORES],
    pub shared: Shared,
    uc: UcInterface,
}

impl Esp {
    pub fn new(config: Config) -> Self {
        let config = config.validated();
        Self {
            config,
            program: Program::default(),
            cores: [Core::default(), Core::default()],
            shared: Shared::new(config.eram_bits),
            uc: UcInterface::default(),
        }
    }

    #[inline(always)]
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn reset(&mut self) {
        self.program = Program::default();
        for core in &mut self.cores {
            core.reset();
        }
        self.shared.reset();
    }

    /// The program executed by `core`.
    #[inline(always)]
    pub fn pram(&self, core: usize) -> &[u32] {
        &self.program.core(core)[..PRAM_LEN]
    }

    /// Executes one cycle of a single core, ticking the ERAM controller first for core 1.
    pub fn step_core(&mut self, core: usize) {
        if core == 1 && self.shared.eram.enabled() {
            let core1 = &self.cores[1];
            let word = self.program.core(1)[core1.pc as usize];
            let ctrl = ins::Ins::from_bits(word).eram_ctrl().value();
            self.shared.eram.tick_cycle(ctrl, core1.pc);
        }

        let pram = self.program.core(core);
        self.cores[core].step(pram, &mut self.shared);
    }

    /// Executes one cycle of both cores: ERAM, then core 1, then core 0.
    pub fn step_cycle(&mut self) {
        self.step_core(1);
        self.step_core(0);
    }

    /// Starts a new sample on both cores and moves the ERAM position back.
    pub fn step_sample(&mut self) {
        self.cores[0].sync();
        self.cores[1].sync();
        if self.shared.eram.enabled() {
            self.shared.eram.tick_sample();
        }
    }

    /// Runs a whole sample: the configured amount of cycles followed by a sample step.
    pub fn run_sample(&mut self) {
        for _ in 0..self.config.cycles_per_sample {
            self.step_cycle();
        }

        self.step_sample();
    }

    /// Whether both cores sit at the start of a sample with no pending jumps.
    pub fn at_sample_start(&self) -> bool {
        self.cores.iter().all(|c| c.pc == 0 && c.jump.is_none())
    }

    pub fn read_host_register(&self) -> u32 {
        self.shared.readback
    }

    pub fn read_gram(&self, offset: u8) -> i32 {
        self.shared.gram[self.cores[0].iram_index(offset as u32)]
    }

    pub fn write_gram(&mut self, offset: u8, value: i32) {
        let index = self.cores[0].iram_index(offset as u32);
        self.shared.gram[index] = value;
    }

    pub fn read_iram(&self, core: usize, offset: u8) -> i32 {
        self.cores[core].read_iram(offset)
    }

    pub fn write_iram(&mut self, core: usize, offset: u8, value: i32) {
        self.cores[core].write_iram(offset, value);
    }

    /// Writes a whole program word of `core`.
    pub fn write_program_word(
        &mut self,
        core: usize,
        index: usize,
        bytes: [u8; 4],
    ) -> Option<Edit> {
        let mut edit = Edit::new(EditKind::Structural);
        self.set_word(&mut edit, CORE_BASE[core] + index, u32::from_le_bytes(bytes));
        edit.into_option()
    }

    /// Writes a single byte of the program memory. Bytes are staged until the last byte of a word
    /// is written, at which point the whole word is committed.
    pub fn write_program_byte(&mut self, address: u16, value: u8) -> Option<Edit> {
        let address = address as u32 & (PROGRAM_BYTES as u32 - 1);
        self.uc.staging[(address & 3) as usize] = value;
        if address & 3 != 3 {
            return None;
        }

        let mut edit = Edit::new(EditKind::Structural);
        let word = u32::from_le_bytes(self.uc.staging);
        self.set_word(&mut edit, (address >> 2) as usize, word);
        edit.into_option()
    }

    /// Replaces the coefficient field of a program word of `core`.
    pub fn write_coefficient(&mut self, core: usize, index: usize, coef: u8) -> Option<Edit> {
        let mut edit = Edit::new(EditKind::Coefficient);
        let index = CORE_BASE[core] + index;
        let word = (self.program.word(index) & !0xFF) | coef as u32;
        self.set_word(&mut edit, index, word);
        edit.into_option()
    }

    fn set_word(&mut self, edit: &mut Edit, index: usize, value: u32) {
        if index >= PROGRAM_WORDS {
            return;
        }

        let old = self.program.set_word(index, value);
        if old != value {
            edit.words.push(ChangedWord {
                index,
                old,
                new: value,
            });
        }
    }

    fn patch_word(&mut self, edit: &mut Edit, index: usize, clear: u32, set: u32) {
        if index >= PROGRAM_WORDS {
            return;
        }

        let value = (self.program.word(index) & !clear) | (set & clear);
        self.set_word(edit, index, value);
    }

    /// Handles a byte written by the microcontroller.
    pub fn write_uc(&mut self, address: u32, value: u8) -> Option<Edit> {
        let address = address & 0x3FFF;
        self.uc.staging[(address & 3) as usize] = value;

        if address == UC_MODE_ADDRESS {
            self.uc.mode = value;
            return None;
        }

        if address & 3 != 3 {
            return None;
        }

        let index = (address >> 2) as usize;
        let [w0, w1, w2, w3] = self.uc.staging.map(|b| b as u32);
        match self.uc.mode {
            0x54 => {
                let mut edit = Edit::new(EditKind::Structural);
                self.set_word(&mut edit, index, u32::from_le_bytes(self.uc.staging));
                edit.into_option()
            }
            0x55 => {
                let mut edit = Edit::new(EditKind::Coefficient);
                self.patch_word(&mut edit, index, 0x3FF, w0 | ((w1 & 3) << 8));
                self.patch_word(
                    &mut edit,
                    index + 1,
                    0x3FF,
                    ((w1 >> 2) & 0x3F) | ((w2 & 0xF) << 6),
                );
                edit.into_option()
            }
            0x56 => {
                let mut edit = Edit::new(EditKind::Structural);
                self.patch_word(&mut edit, index, 0x0F80_0000, ((w0 >> 3) & 0x1F) << 23);
                self.patch_word(&mut edit, index + 1, 0x0F80_0000, (w1 & 0x1F) << 23);
                self.patch_word(
                    &mut edit,
                    index + 2,
                    0x0F80_0000,
                    (((w1 >> 5) & 7) << 23) | ((w2 & 3) << 26),
                );
                self.patch_word(&mut edit, index + 3, 0x0F80_0000, ((w2 >> 2) & 0x1F) << 23);
                self.patch_word(
                    &mut edit,
                    index + 4,
                    0x0F80_0000,
                    (((w2 >> 7) & 1) << 23) | ((w3 & 0xF) << 24),
                );
                edit.into_option()
            }
            0x57 => {
                let base = (address & !3) as usize;
                let bytes = std::array::from_fn(|i| self.program.byte(base + i));
                self.shared.readback = u32::from_le_bytes(bytes);
                None
            }
            mode => {
                tracing::debug!("unknown interface mode {mode:#04X} write at {address:#06X}");
                None
            }
        }
    }

    /// Reads a byte of the host readback bank.
    pub fn read_uc(&self, address: u32) -> u8 {
        self.shared.readback.to_le_bytes()[(address & 3) as usize]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn word(op: u8, mem: u8, shift: u8, coef: u8) -> u32 {
        ((op as u32) << 16) | ((mem as u32) << 10) | ((shift as u32) << 8) | coef as u32
    }

    fn small() -> Esp {
        Esp::new(Config {
            eram_bits: 12,
            cycles_per_sample: 768,
        })
    }

    #[test]
    fn single_mac_into_b() {
        let mut esp = small();
        esp.write_program_word(0, 0, word(0x10, 2, 1, 0x7F).to_le_bytes());
        esp.run_sample();

        let expected = (0x400 * 127) >> 6;
        assert_eq!(esp.cores[0].acc[1].raw, expected);
        assert_eq!(esp.cores[0].acc[0].raw, 0);
        assert_eq!(esp.cores[0].acc[1].window(), [expected; 3]);
    }

    #[test]
    fn pipeline_delay_is_observed_by_stores() {
        let mut esp = small();
        // pc 0: A = 0x10 * 0x40 >> 7, pc 1..=3: store A to iram[0x10 + pc]
        esp.write_program_word(0, 0, word(0x04, 1, 0, 0x40).to_le_bytes());
        for pc in 1..=3u8 {
            esp.write_program_word(0, pc as usize, word(0x58, 0x10 + pc, 0, 0).to_le_bytes());
        }

        for _ in 0..4 {
            esp.step_cycle();
        }

        let core = &esp.cores[0];
        assert_eq!(core.iram[0x11], 0);
        assert_eq!(core.iram[0x12], 0);
        assert_eq!(core.iram[0x13], 8);
    }

    #[test]
    fn set_condition_skips() {
        // positive result: the 5th and 6th instructions after the condition are skipped
        let mut esp = small();
        esp.write_program_word(0, 3, word(0x50, 0, 0, 0).to_le_bytes());
        for pc in 8..=10 {
            esp.write_program_word(0, pc, word(0x10, 4, 3, 0x01).to_le_bytes());
        }
        esp.run_sample();

        assert_eq!(esp.cores[0].skipfield, 0);
        assert_eq!(esp.cores[0].acc[1].raw, 0x40_0000 >> 3);

        // negative result: the 7th to 10th instructions are skipped
        let mut esp = small();
        esp.write_program_word(0, 3, word(0x50, 4, 3, 0xFF).to_le_bytes());
        for pc in 9..=14 {
            esp.write_program_word(0, pc, word(0x10, 4, 3, 0x01).to_le_bytes());
        }
        esp.run_sample();

        assert!(esp.cores[0].acc[0].raw < 0);
        assert_eq!(esp.cores[0].acc[1].raw, 2 * (0x40_0000 >> 3));
    }

    #[test]
    fn host_register_and_uc_readback() {
        let mut esp = small();
        esp.write_program_word(0, 0, word(0x04, 2, 0, 0x10).to_le_bytes());
        esp.write_program_word(0, 3, word(0x34, 0xCA, 0, 0).to_le_bytes());
        esp.run_sample();

        let expected = (0x400 * 0x10) >> 7;
        assert_eq!(esp.read_host_register(), expected as u32);
        assert_eq!(esp.read_uc(0), expected as u8);
        assert_eq!(esp.read_uc(1), (expected >> 8) as u8);
    }

    #[test]
    fn uc_word_commit_only_on_last_byte() {
        let mut esp = small();
        assert!(esp.write_uc(UC_MODE_ADDRESS, 0x54).is_none());

        let bytes = 0x1234_5678u32.to_le_bytes();
        for (i, b) in bytes.iter().enumerate().take(3) {
            assert!(esp.write_uc(0x10 + i as u32, *b).is_none());
        }

        let edit = esp.write_uc(0x13, bytes[3]).unwrap();
        assert_eq!(edit.kind, EditKind::Structural);
        assert_eq!(edit.words.len(), 1);
        assert_eq!(edit.words[0].index, 4);
        assert_eq!(edit.words[0].location(), Some((0, 4)));
        assert_eq!(esp.program.word(4), 0x1234_5678);

        // rewriting the same word changes nothing
        esp.write_uc(UC_MODE_ADDRESS, 0x54);
        for (i, b) in bytes.iter().enumerate() {
            assert!(esp.write_uc(0x10 + i as u32, *b).is_none());
        }
    }

    #[test]
    fn uc_coefficient_patch() {
        let mut esp = small();
        esp.write_program_word(1, 0, word(0x10, 5, 0, 0).to_le_bytes());
        esp.write_program_word(1, 1, word(0x10, 6, 0, 0).to_le_bytes());

        esp.write_uc(UC_MODE_ADDRESS, 0x55);
        let base = (CORE_BASE[1] * 4) as u32;
        esp.write_uc(base, 0xAB);
        esp.write_uc(base + 1, 0b1111_1110);
        esp.write_uc(base + 2, 0x0C);
        let edit = esp.write_uc(base + 3, 0).unwrap();

        assert_eq!(edit.kind, EditKind::Coefficient);
        let w0 = decode(esp.pram(1)[0]);
        let w1 = decode(esp.pram(1)[1]);
        assert_eq!(w0.coef, 0xAB);
        assert_eq!(w0.shift_bits, 2);
        assert_eq!(w0.mem, 5);
        assert_eq!(w1.coef, 0x3F);
        assert_eq!(w1.shift_bits, 3);
        assert_eq!(w1.mem, 6);
    }

    #[test]
    fn uc_eram_control_patch() {
        let mut esp = small();
        esp.write_uc(UC_MODE_ADDRESS, 0x56);
        for (i, b) in [0xF8u8, 0xFF, 0xFF, 0x0F].iter().enumerate() {
            esp.write_uc(0x20 + i as u32, *b);
        }

        for i in 0..5 {
            let ins = decode(esp.program.word(8 + i));
            assert_ne!(ins.eram_ctrl, 0, "word {i}");
            assert_eq!(ins.word & 0x7F_FFFF, 0);
        }
    }

    #[test]
    fn uc_program_readback() {
        let mut esp = small();
        esp.write_program_word(0, 2, 0xCAFE_BABEu32.to_le_bytes());
        esp.write_uc(UC_MODE_ADDRESS, 0x57);
        esp.write_uc(0x0B, 0);
        assert_eq!(esp.read_host_register(), 0xCAFE_BABE);
        assert_eq!(esp.read_uc(3), 0xCA);
    }

    #[test]
    fn circular_addressing() {
        let mut esp = small();
        esp.write_iram(0, 5, 77);
        esp.step_sample();
        assert_eq!(esp.read_iram(0, 6), 77);
        assert_eq!(esp.cores[0].iram_pos, 0xFF);
    }

    #[test]
    fn eram_roundtrip_through_program() {
        let mut esp = small();
        esp.shared.eram.data.write_latch = 0x0012_3457;
        // core 1 starts a write transaction at pc 0 with immediate 3, then a read at pc 20
        esp.write_program_word(1, 0, ((0x10u32 << 23) | 1).to_le_bytes());
        esp.write_program_word(1, 1, ((3u32 << 23) | 1).to_le_bytes());
        esp.write_program_word(1, 20, ((0x08u32 << 23) | 1).to_le_bytes());
        esp.write_program_word(1, 21, ((3u32 << 23) | 1).to_le_bytes());
        // store the read latch into iram at pc 40
        esp.write_program_word(1, 40, word(0x34, 0xC0 | 0xC, 0, 0).to_le_bytes());
        esp.run_sample();

        let value = eram::crunch(0x0012_3457);
        assert_eq!(esp.shared.eram.memory()[3], value);
        assert_eq!(esp.shared.eram.data.read_latch, value);
        assert_eq!(esp.cores[1].iram[0xFC], value);
    }

    #[test]
    fn jumps() {
        let mut esp = small();
        esp.write_program_word(0, 0, word(0x34, 0xC3, 0, 10).to_le_bytes());
        esp.write_program_word(0, 2, word(0x10, 2, 0, 1).to_le_bytes());
        esp.write_program_word(0, 3, word(0x10, 4, 3, 0x7F).to_le_bytes());
        esp.write_program_word(0, 10, word(0x10, 1, 0, 0x40).to_le_bytes());

        for _ in 0..4 {
            esp.step_cycle();
        }

        // pc 0 jumps, pcs 1 and 2 execute, then execution continues at 10
        assert_eq!(esp.cores[0].pc, 11);
        assert_eq!(esp.cores[0].acc[1].raw, (0x400 >> 7) + ((0x10 * 0x40) >> 7));
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn hardware_diagnostics_are_warnings() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let mut esp = small();
            esp.write_program_word(0, 0, word(0x28, 5, 0, 1).to_le_bytes());
            esp.write_program_word(0, 1, word(0x34, 0x10, 0, 0).to_le_bytes());
            esp.write_program_word(1, 0, ((0x19u32 << 23) | 1).to_le_bytes());
            esp.run_sample();
        });

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("WARN"));
        assert!(logs.contains("unsupported opcode"));
        assert!(logs.contains("unsupported control code"));
        assert!(logs.contains("odd mode"));
    }
}
