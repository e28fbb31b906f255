//! Compile time schedule of ERAM controller events.
//!
//! The control side of the controller only depends on core 1's control bits and the program
//! counter, so the events of a whole sample can be computed ahead of time. Only the data side is
//! emitted as code.
use espint::{
    PRAM_LEN,
    eram::{Control, Tick},
    ins::Ins,
};

/// Maximum amount of samples simulated while looking for a stable entry state.
const MAX_ITERATIONS: usize = 4;

/// The controller events of a sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    /// Control state the schedule was computed from.
    pub entry: Control,
    /// Control state once the sample is over.
    pub exit: Control,
    /// Events of every cycle. Empty when the controller is disabled.
    pub ticks: Vec<Tick>,
    /// Whether `exit` equals `entry`, i.e. the schedule holds for every following sample.
    pub converged: bool,
}

impl Schedule {
    /// A schedule without any events.
    pub fn disabled(control: Control) -> Self {
        Self {
            entry: control,
            exit: control,
            ticks: Vec::new(),
            converged: true,
        }
    }

    #[inline(always)]
    pub fn tick(&self, pc: usize) -> Option<&Tick> {
        self.ticks.get(pc).filter(|t| !t.is_empty())
    }

    /// Amount of cycles with events.
    pub fn events(&self) -> usize {
        self.ticks.iter().filter(|t| !t.is_empty()).count()
    }
}

fn simulate(pram: &[u32], cycles: usize, entry: Control) -> (Vec<Tick>, Control) {
    let mut control = entry;
    let ticks = pram[..cycles]
        .iter()
        .enumerate()
        .map(|(pc, &word)| {
            let ctrl = Ins::from_bits(word).eram_ctrl().value();
            control.tick(ctrl, pc as u16)
        })
        .collect();

    (ticks, control)
}

/// Computes the schedule of core 1's program `pram`, starting from the live control state.
pub fn schedule(pram: &[u32], cycles: usize, live: Control) -> Schedule {
    let cycles = cycles.min(PRAM_LEN);

    let mut entry = live;
    let mut result = None;
    for _ in 0..MAX_ITERATIONS {
        let (ticks, exit) = simulate(pram, cycles, entry);
        let converged = exit == entry;
        let schedule = Schedule {
            entry,
            exit,
            ticks,
            converged,
        };

        if converged {
            result = Some(schedule);
            break;
        }

        entry = exit;
        result = Some(schedule);
    }

    let schedule = result.unwrap_or_else(|| Schedule::disabled(live));
    for (pc, tick) in schedule.ticks.iter().enumerate() {
        if let Some(mode) = tick.odd_mode {
            tracing::warn!("eram transaction started with odd mode {mode:#04X} at pc {pc}");
        }

        if tick.reentrant {
            tracing::warn!("re-entrant eram transaction promoted at pc {pc}");
        }
    }

    if !schedule.converged {
        tracing::debug!(
            "eram control did not settle after {MAX_ITERATIONS} samples, compiled code will only run from {:?}",
            schedule.entry
        );
    }

    schedule
}

#[cfg(test)]
mod test {
    use super::*;
    use espint::eram::{Commit, MODE_WRITE};

    fn pram(bits: &[(usize, u8)]) -> Vec<u32> {
        let mut pram = vec![0; PRAM_LEN];
        for &(pc, ctrl) in bits {
            pram[pc] = (ctrl as u32) << 23;
        }

        pram
    }

    #[test]
    fn events_match_controller() {
        let pram = pram(&[(10, MODE_WRITE), (11, 3), (100, 0x08), (101, 3)]);
        let schedule = schedule(&pram, PRAM_LEN, Control::default());

        assert!(schedule.converged);
        assert_eq!(schedule.events(), 4);
        assert!(schedule.tick(15).unwrap().latch.is_some());
        assert_eq!(schedule.tick(20).unwrap().commit, Some(Commit::Write));
        assert!(schedule.tick(105).unwrap().latch.is_some());
        assert_eq!(schedule.tick(110).unwrap().commit, Some(Commit::Read));
        assert!(schedule.tick(16).is_none());
    }

    #[test]
    fn settles_on_stable_entry() {
        // a transaction promoted at the end of a sample stays current into the next one
        let pram = pram(&[(760, 0x08)]);
        let live = Control::default();
        let schedule = schedule(&pram, PRAM_LEN, live);

        assert!(schedule.converged);
        assert_ne!(schedule.entry, live);
        assert!(schedule.entry.current_active);
    }

    #[test]
    fn shorter_samples() {
        let pram = pram(&[(10, 0x08)]);
        let schedule = schedule(&pram, 12, Control::default());

        assert_eq!(schedule.ticks.len(), 12);
        assert_eq!(schedule.events(), 0);
        // the transaction never gets promoted and keeps waiting
        assert!(schedule.converged);
        assert!(schedule.entry.next_active);
    }
}
