//! Phase timing against a single monotonic clock.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, Result};
use crate::phase::Phase;

/// Number of timed phases per trial.
pub const PHASES: usize = Phase::TIMED.len();

/// Records the end of each phase, as elapsed time since the trial clock started.
///
/// Time spent in [`PhaseTimer::untimed()`] is not counted toward any phase.
#[derive(Clone, Debug)]
pub struct PhaseTimer {
    start: Instant,
    excluded: Duration,
    boundaries: Vec<Duration>,
}

impl PhaseTimer {
    /// Start the trial clock.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
            excluded: Duration::ZERO,
            boundaries: Vec::with_capacity(PHASES),
        }
    }

    /// Timed time since the clock started.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed().saturating_sub(self.excluded)
    }

    /// Run `f` with the clock stopped.
    pub fn untimed<T>(&mut self, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.excluded += start.elapsed();

        out
    }

    /// Mark the end of `phase`, which must be the next timed phase.
    pub fn mark(&mut self, phase: Phase) -> Result<Duration> {
        let elapsed = self.elapsed();

        match Phase::TIMED.get(self.boundaries.len()) {
            Some(&expected) if expected == phase => {},
            _ => {
                let msg = format!("marked {phase:?} after {} boundaries", self.boundaries.len());
                return Err(Error::Internal(msg));
            },
        }

        debug!(?phase, ?elapsed, "phase boundary");
        self.boundaries.push(elapsed);

        Ok(elapsed)
    }

    /// Stop the clock, producing timings for all phases.
    pub fn finish(self) -> Result<PhaseTiming> {
        let marked = self.boundaries.len();
        let mut boundaries = [Duration::ZERO; PHASES];

        if marked != PHASES {
            let msg = format!("finished timer with {marked} of {PHASES} boundaries");
            return Err(Error::Internal(msg));
        }

        boundaries.copy_from_slice(&self.boundaries);

        Ok(PhaseTiming::new(boundaries))
    }
}

/// Cumulative phase boundaries of one trial.
///
/// Boundaries are kept at full precision, and only truncated to whole milliseconds
/// when a row is produced. Per-phase durations are differences of consecutive
/// truncated boundaries, so each row sums exactly to its total.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PhaseTiming {
    boundaries: [Duration; PHASES],
}

impl PhaseTiming {
    pub fn new(boundaries: [Duration; PHASES]) -> Self {
        Self { boundaries }
    }

    /// Elapsed time since the clock started, at the end of each phase.
    pub fn boundaries(&self) -> &[Duration; PHASES] {
        &self.boundaries
    }

    /// Untruncated duration of a timed phase.
    pub fn phase(&self, phase: Phase) -> Option<Duration> {
        let i = Phase::TIMED.iter().position(|&p| p == phase)?;
        let prev = if i == 0 { Duration::ZERO } else { self.boundaries[i - 1] };

        Some(self.boundaries[i].saturating_sub(prev))
    }

    pub fn total(&self) -> Duration {
        self.boundaries[PHASES - 1]
    }

    /// Per-phase durations in whole milliseconds, in log column order.
    pub fn phase_millis(&self) -> [u64; PHASES] {
        let mut millis = [0; PHASES];
        let mut prev = 0;

        for (i, boundary) in self.boundaries.iter().enumerate() {
            let cumulative = truncated_millis(*boundary);
            millis[i] = cumulative.saturating_sub(prev);
            prev = cumulative;
        }

        millis
    }

    pub fn total_millis(&self) -> u64 {
        truncated_millis(self.total())
    }

    /// The seven log columns: each phase, then the total.
    pub fn row(&self) -> [u64; PHASES + 1] {
        let mut row = [0; PHASES + 1];
        row[..PHASES].copy_from_slice(&self.phase_millis());
        row[PHASES] = self.total_millis();
        row
    }
}

fn truncated_millis(duration: Duration) -> u64 {
    // 2^64 ms is over 500 million years.
    duration.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn micros(us: &[u64; PHASES]) -> PhaseTiming {
        let mut boundaries = [Duration::ZERO; PHASES];
        for (b, us) in boundaries.iter_mut().zip(us) {
            *b = Duration::from_micros(*us);
        }
        PhaseTiming::new(boundaries)
    }

    #[test]
    fn test_row_from_cumulative_boundaries() {
        let timing = micros(&[2_900, 40_100, 95_999, 96_000, 101_500, 3_000_700]);

        assert_eq!(timing.row(), [2, 38, 55, 1, 5, 2899, 3000]);
    }

    #[test]
    fn test_row_sums_to_total() {
        let timing = micros(&[999, 1_998, 2_997, 3_996, 4_995, 5_994]);
        let row = timing.row();

        let sum: u64 = row[..PHASES].iter().sum();
        assert_eq!(sum, row[PHASES]);
        assert_eq!(row[PHASES], 5);
    }

    #[test]
    fn test_untruncated_phase() {
        let timing = micros(&[1_500, 3_250, 3_250, 4_000, 9_000, 9_001]);

        assert_eq!(timing.phase(Phase::Attached), Some(Duration::from_micros(1_500)));
        assert_eq!(timing.phase(Phase::Stepping), Some(Duration::from_micros(1_750)));
        assert_eq!(timing.phase(Phase::Breakpointing), Some(Duration::ZERO));
        assert_eq!(timing.phase(Phase::Terminated), None);
        assert_eq!(timing.total(), Duration::from_micros(9_001));
    }

    #[test]
    fn test_timer_marks_in_order() -> Result<()> {
        let mut timer = PhaseTimer::start();

        for phase in Phase::TIMED.iter() {
            timer.mark(*phase)?;
        }

        let timing = timer.finish()?;
        let boundaries = timing.boundaries();

        for pair in boundaries.windows(2) {
            assert!(pair[0] <= pair[1]);
        }

        Ok(())
    }

    #[test]
    fn test_timer_rejects_out_of_order_mark() {
        let mut timer = PhaseTimer::start();

        assert!(timer.mark(Phase::Stepping).is_err());
        assert!(timer.mark(Phase::Attached).is_ok());
        assert!(timer.mark(Phase::Attached).is_err());
    }

    #[test]
    fn test_untimed_work_not_counted() -> Result<()> {
        let mut timer = PhaseTimer::start();
        timer.mark(Phase::Attached)?;

        let out = timer.untimed(|| {
            std::thread::sleep(Duration::from_millis(200));
            42
        });
        assert_eq!(out, 42);

        let elapsed = timer.mark(Phase::Stepping)?;
        assert!(elapsed < Duration::from_millis(200), "counted untimed work: {elapsed:?}");

        Ok(())
    }

    #[test]
    fn test_unfinished_timer() {
        let mut timer = PhaseTimer::start();
        timer.mark(Phase::Attached).unwrap();

        assert!(timer.finish().is_err());
    }
}
