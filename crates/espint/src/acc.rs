use util::{saturate24, sign_extend};

/// Pipeline depth of an accumulator: delayed reads see the value from this many cycles ago.
pub const PIPELINE_DEPTH: usize = 3;

/// An accumulator together with its delay pipeline.
///
/// The value being accumulated is `raw`, always sign extended from 30 bits. Every cycle the raw
/// value is pushed into `hist`, and delayed reads return the oldest entry.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Accumulator {
    pub raw: i32,
    pub hist: [i32; PIPELINE_DEPTH],
    pub head: u32,
}

impl Accumulator {
    #[inline(always)]
    pub fn assign(&mut self, value: i32) {
        self.raw = sign_extend::<30>(value);
    }

    #[inline(always)]
    pub fn accumulate(&mut self, value: i32) {
        self.raw = sign_extend::<30>(self.raw.wrapping_add(value));
    }

    /// The delayed value, as stored three cycles ago.
    #[inline(always)]
    pub fn full(&self) -> i32 {
        self.hist[self.head as usize]
    }

    #[inline(always)]
    pub fn saturated24(&self) -> i32 {
        saturate24(self.full())
    }

    #[inline(always)]
    pub fn raw24(&self) -> i32 {
        sign_extend::<24>(self.full())
    }

    #[inline(always)]
    pub fn store_pipeline(&mut self) {
        self.hist[self.head as usize] = self.raw;
        self.head = (self.head + 1) % PIPELINE_DEPTH as u32;
    }

    /// The pipeline contents, oldest first.
    pub fn window(&self) -> [i32; PIPELINE_DEPTH] {
        std::array::from_fn(|i| self.hist[(self.head as usize + i) % PIPELINE_DEPTH])
    }

    /// Rotates the history so that `head` is zero, without changing what is observed.
    pub fn normalize(&mut self) {
        self.hist = self.window();
        self.head = 0;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl PartialEq for Accumulator {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw && self.window() == other.window()
    }
}

impl Eq for Accumulator {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sign_extends_to_30_bits() {
        let mut acc = Accumulator::default();
        acc.assign(0x2000_0000);
        assert_eq!(acc.raw, -0x2000_0000);

        acc.assign(0x1FFF_FFFF);
        acc.accumulate(1);
        assert_eq!(acc.raw, -0x2000_0000);
    }

    #[test]
    fn delayed_by_three_cycles() {
        let mut acc = Accumulator::default();
        let mut seen = vec![];
        for i in 1..=10 {
            seen.push(acc.full());
            acc.assign(i * 100);
            acc.store_pipeline();
        }

        // cycle n observes the value assigned at cycle n - 3
        assert_eq!(seen, [0, 0, 0, 100, 200, 300, 400, 500, 600, 700]);
    }

    #[test]
    fn delay_holds_across_idle_cycles() {
        let mut acc = Accumulator::default();
        acc.assign(42);
        acc.store_pipeline();
        acc.store_pipeline();
        acc.store_pipeline();
        assert_eq!(acc.full(), 42);

        acc.assign(7);
        acc.store_pipeline();
        assert_eq!(acc.full(), 42);
        acc.store_pipeline();
        acc.store_pipeline();
        assert_eq!(acc.full(), 7);
    }

    #[test]
    fn reads() {
        let mut acc = Accumulator::default();
        acc.assign(0x0180_0000);
        for _ in 0..3 {
            acc.store_pipeline();
        }

        assert_eq!(acc.full(), 0x0180_0000);
        assert_eq!(acc.saturated24(), 0x7F_FFFF);
        assert_eq!(acc.raw24(), -0x80_0000);
    }

    #[test]
    fn normalize_preserves_observations() {
        let mut acc = Accumulator::default();
        for v in [1, 2, 3, 4] {
            acc.assign(v);
            acc.store_pipeline();
        }

        let before = acc;
        acc.normalize();
        assert_eq!(acc.head, 0);
        assert_eq!(acc, before);
        assert_eq!(acc.window(), [2, 3, 4]);
    }
}
