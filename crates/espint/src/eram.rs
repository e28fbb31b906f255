//! External memory (ERAM) controller.
//!
//! Transactions are started by the control bits of core 1's program words, accumulate an
//! immediate offset over the following four cycles, get promoted to the current transaction on
//! the fifth and commit ten cycles after their start.
use util::sign_extend;
use zerocopy::IntoBytes;

/// Mask applied to the circular position.
pub const POS_MASK: u32 = (1 << 19) - 1;
/// Cycles between the start of a transaction and its commit.
pub const COMMIT_STAGE: u16 = 10;
/// Stage at which an accumulating transaction becomes the current one.
pub const PROMOTE_STAGE: i32 = 5;
/// Transaction mode which writes to memory. Every other mode reads.
pub const MODE_WRITE: u8 = 0x10;
/// Transaction mode which adds the variable offset to the address.
pub const MODE_VAR_OFFSET: u8 = 0x18;
/// Positions above this threshold use the upper high bank.
pub const HIGH_BANK_THRESHOLD: u32 = 0x4000;

/// The lossy compression applied to values written to ERAM.
pub fn crunch(x: i32) -> i32 {
    let b = ((x >> 1) & 0x40_0000) * 3;
    let mask = if ((x << 1) & 0xC0_0000) != b {
        0xFFFF_FC00u32
    } else if ((x << 3) & 0xC0_0000) != b {
        0xFFFF_FF00
    } else if ((x << 5) & 0xC0_0000) != b {
        0xFFFF_FFC0
    } else {
        0xFFFF_FFF0
    };

    x & mask as i32
}

/// Whether a committed transaction writes or reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Commit {
    Write,
    Read,
}

/// Address computation of a transaction being promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Latch {
    /// Immediate added to the position.
    pub offset: u32,
    /// Whether `varOffset >> 12` is added to the address.
    pub var_offset: bool,
    /// Whether the high bank adjustment applies.
    pub high_offset: bool,
}

impl Latch {
    /// Computes the effective address of this latch.
    #[inline]
    pub fn address(&self, pos: u32, var_offset: i32) -> u32 {
        let mut addr = pos.wrapping_add(self.offset);
        if self.var_offset {
            addr = addr.wrapping_add((var_offset >> 12) as u32);
        }

        if self.high_offset {
            addr = addr.wrapping_add(if pos <= HIGH_BANK_THRESHOLD {
                0x4_0000
            } else {
                0xC_0000
            });
        }

        addr
    }
}

/// Events produced by a single controller cycle, in the order they must be applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Tick {
    pub commit: Option<Commit>,
    pub latch: Option<Latch>,
    /// Set when a transaction started with an unexpected mode.
    pub odd_mode: Option<u8>,
    /// Set when a transaction was promoted while another one was still current.
    pub reentrant: bool,
}

impl Tick {
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.commit.is_none() && self.latch.is_none()
    }
}

/// The control state of the controller. It only depends on the control bits of the program and
/// the program counter, never on data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Control {
    pub next_active: bool,
    pub next_mode: u8,
    pub next_start: u16,
    pub next_imm: u32,
    pub current_active: bool,
    pub current_mode: u8,
    pub commit_pc: u16,
    pub high_offset: bool,
}

impl Control {
    /// Advances the control state by one cycle.
    pub fn tick(&mut self, ctrl: u8, pc: u16) -> Tick {
        let mut tick = Tick::default();
        let mut stage = pc as i32 - self.next_start as i32;

        if !self.next_active && (ctrl & 0x18) != 0 {
            self.next_active = true;
            self.next_mode = ctrl;
            self.next_start = pc;
            self.next_imm = 0;
            stage = 0;

            if ctrl & 7 != 0 {
                tick.odd_mode = Some(ctrl);
            }
        } else if self.next_active && stage > 0 && stage <= 4 {
            self.next_imm = self
                .next_imm
                .wrapping_add((ctrl as u32) << ((stage - 1) * 5));
        }

        if self.current_active && pc == self.commit_pc {
            tick.commit = Some(if self.current_mode == MODE_WRITE {
                Commit::Write
            } else {
                Commit::Read
            });
            self.current_active = false;
        }

        if self.next_active && stage == PROMOTE_STAGE {
            tick.reentrant = self.current_active;

            self.current_active = true;
            self.current_mode = self.next_mode;
            self.commit_pc = self.next_start.wrapping_add(COMMIT_STAGE);
            self.next_active = false;

            let var_offset = self.next_mode == MODE_VAR_OFFSET;
            if var_offset {
                self.high_offset = self.next_imm & 0x100 != 0;
            }

            tick.latch = Some(Latch {
                offset: if var_offset {
                    (self.next_imm >> 1) & 1
                } else {
                    self.next_imm
                },
                var_offset,
                high_offset: self.high_offset,
            });
        }

        tick
    }
}

/// The data side of the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[repr(C)]
pub struct EramData {
    pub pos: u32,
    pub effective_addr: u32,
    pub read_latch: i32,
    pub write_latch: i32,
    pub write_latch_next: i32,
    pub var_offset: i32,
}

/// The ERAM controller together with its memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eram {
    pub control: Control,
    pub data: EramData,
    memory: Box<[i32]>,
    bits: u8,
}

impl Eram {
    /// Creates a controller backed by `1 << bits` words. Zero bits disables ticking.
    pub fn new(bits: u8) -> Self {
        Self {
            control: Control::default(),
            data: EramData::default(),
            memory: vec![0; 1 << bits].into_boxed_slice(),
            bits,
        }
    }

    #[inline(always)]
    pub fn enabled(&self) -> bool {
        self.bits != 0
    }

    #[inline(always)]
    pub fn mask(&self) -> u32 {
        (1u32 << self.bits) - 1
    }

    pub fn memory(&self) -> &[i32] {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut [i32] {
        &mut self.memory
    }

    /// The memory contents as native endian bytes.
    pub fn memory_bytes(&self) -> &[u8] {
        self.memory.as_bytes()
    }

    /// Raw pointer to the first word of memory, for compiled code.
    pub fn memory_ptr(&mut self) -> *mut i32 {
        self.memory.as_mut_ptr()
    }

    /// Applies the data side of a commit.
    #[inline]
    pub fn commit(&mut self, commit: Commit) {
        let index = (self.data.effective_addr & self.mask()) as usize;
        match commit {
            Commit::Write => self.memory[index] = crunch(self.data.write_latch_next),
            Commit::Read => self.data.read_latch = sign_extend::<24>(self.memory[index]),
        }
    }

    /// Applies the data side of a promotion.
    #[inline]
    pub fn latch(&mut self, latch: Latch) {
        self.data.write_latch_next = self.data.write_latch;
        self.data.effective_addr = latch.address(self.data.pos, self.data.var_offset);
    }

    /// Advances the controller by one cycle, given the control bits of core 1's current word.
    pub fn tick_cycle(&mut self, ctrl: u8, pc: u16) {
        let tick = self.control.tick(ctrl, pc);
        if let Some(mode) = tick.odd_mode {
            tracing::warn!("eram transaction started with odd mode {mode:#04X} at pc {pc}");
        }

        if let Some(commit) = tick.commit {
            self.commit(commit);
        }

        if let Some(latch) = tick.latch {
            if tick.reentrant {
                tracing::warn!("re-entrant eram transaction promoted at pc {pc}");
            }

            self.latch(latch);
        }
    }

    /// Moves the circular position back by one word.
    #[inline]
    pub fn tick_sample(&mut self) {
        self.data.pos = self.data.pos.wrapping_sub(1) & POS_MASK;
    }

    pub fn reset(&mut self) {
        self.control = Control::default();
        self.data = EramData::default();
        self.memory.fill(0);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nanorand::Rng;

    #[test]
    fn crunch_is_idempotent() {
        let mut rng = nanorand::WyRand::new_seed(0xE5A);
        for _ in 0..100_000 {
            let value = rng.generate::<u32>() as i32;
            let once = crunch(value);
            assert_eq!(crunch(once), once, "value {value:#010X}");
        }
    }

    #[test]
    fn crunch_precision() {
        // small magnitudes keep the most bits
        assert_eq!(crunch(0x0000_1234), 0x0000_1230);
        assert_eq!(crunch(-0x1234), -0x1234 & !0xF);
        // large magnitudes lose the low ten bits
        assert_eq!(crunch(0x0040_1234), 0x0040_1000);
    }

    /// Runs the controller for `cycles` cycles with a single transaction start at `start`.
    fn run_transaction(
        eram: &mut Eram,
        start: u16,
        mode: u8,
        imm: [u8; 4],
        cycles: u16,
    ) -> Option<u16> {
        let mut committed = None;
        for pc in 0..cycles {
            let ctrl = match pc.checked_sub(start) {
                Some(0) => mode,
                Some(s @ 1..=4) => imm[s as usize - 1],
                _ => 0,
            };

            let tick = eram.control.tick(ctrl, pc);
            if let Some(commit) = tick.commit {
                eram.commit(commit);
                committed = Some(pc);
            }
            if let Some(latch) = tick.latch {
                eram.latch(latch);
            }
        }

        committed
    }

    #[test]
    fn commit_timing() {
        let mut rng = nanorand::WyRand::new_seed(0x10);
        for _ in 0..1000 {
            let mut eram = Eram::new(12);
            let start = rng.generate_range(0u16..700);
            let mode = if rng.generate_range(0u8..2) == 0 { 0x10 } else { 0x08 };

            let committed = run_transaction(&mut eram, start, mode, [0; 4], 768);
            assert_eq!(committed, Some(start + COMMIT_STAGE));
        }
    }

    #[test]
    fn write_then_read_returns_crunched() {
        let mut eram = Eram::new(12);
        eram.data.pos = 0x100;
        eram.data.write_latch = 0x0012_3457;

        run_transaction(&mut eram, 0, MODE_WRITE, [3, 0, 0, 0], 20);
        assert_eq!(eram.data.effective_addr, 0x103);
        assert_eq!(eram.memory()[0x103], crunch(0x0012_3457));

        run_transaction(&mut eram, 0, 0x08, [3, 0, 0, 0], 20);
        assert_eq!(eram.data.read_latch, crunch(0x0012_3457));
    }

    #[test]
    fn immediate_accumulates_five_bit_nibbles() {
        let mut eram = Eram::new(19);
        run_transaction(&mut eram, 4, 0x08, [1, 2, 3, 4], 12);
        let expected = 1 | (2 << 5) | (3 << 10) | (4 << 15);
        assert_eq!(eram.data.effective_addr, expected);
    }

    #[test]
    fn var_offset_and_high_bank() {
        let mut eram = Eram::new(19);
        eram.data.pos = 0x10;
        eram.data.var_offset = 5 << 12;

        // imm = 0x102: high bank flag set, bit 1 selects +1
        run_transaction(&mut eram, 0, MODE_VAR_OFFSET, [2, 8, 0, 0], 8);
        assert!(eram.control.high_offset);
        assert_eq!(eram.data.effective_addr, 0x10 + 5 + 1 + 0x4_0000);

        let mut eram = Eram::new(19);
        eram.data.pos = 0x4001;
        run_transaction(&mut eram, 0, MODE_VAR_OFFSET, [0, 8, 0, 0], 8);
        assert_eq!(eram.data.effective_addr, 0x4001 + 0xC_0000);
    }

    #[test]
    fn reentrant_transaction_is_flagged() {
        let mut control = Control::default();

        // promoted at 765, commit pc 770 is never reached within the sample
        let mut reentrant = false;
        for pc in 0..768u16 {
            let ctrl = if pc == 760 { 0x08 } else { 0 };
            reentrant |= control.tick(ctrl, pc).reentrant;
        }
        assert!(!reentrant);
        assert!(control.current_active);

        for pc in 0..768u16 {
            let ctrl = if pc == 0 { 0x08 } else { 0 };
            reentrant |= control.tick(ctrl, pc).reentrant;
        }
        assert!(reentrant);
    }

    #[test]
    fn memory_bytes_view() {
        let mut eram = Eram::new(4);
        eram.memory_mut()[1] = 0x0102_0304;
        assert_eq!(eram.memory_bytes().len(), 16 * 4);
        assert_eq!(&eram.memory_bytes()[4..8], &0x0102_0304i32.to_ne_bytes());
    }

    #[test]
    fn position_wraps() {
        let mut eram = Eram::new(4);
        eram.tick_sample();
        assert_eq!(eram.data.pos, POS_MASK);
    }
}
