//! Frame pacing for the audio send loop.
//!
//! Packets go out on an absolute 20ms grid. Each frame's encode and send time is
//! averaged over the current play session, and the pacer wakes that much
//! before the deadline so the send itself lands on the grid.

use crate::constants::{PACER_SPIN_WINDOW, TIMESTEP_LENGTH};
use spin_sleep::SpinSleeper;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub(crate) struct Pacer {
    deadline: Instant,
    frames: u32,
    total_work: Duration,
    sleeper: SpinSleeper,
}

impl Pacer {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            deadline: now + TIMESTEP_LENGTH,
            frames: 0,
            total_work: Duration::ZERO,
            sleeper: SpinSleeper::new(
                u32::try_from(PACER_SPIN_WINDOW.as_nanos()).unwrap_or(u32::MAX),
            ),
        }
    }

    /// Starts a new play session: the grid restarts from `now` and the work
    /// average is forgotten.
    pub(crate) fn reset(&mut self, now: Instant) {
        self.deadline = now + TIMESTEP_LENGTH;
        self.frames = 0;
        self.total_work = Duration::ZERO;
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }

    pub(crate) fn average_work(&self) -> Duration {
        if self.frames == 0 {
            Duration::ZERO
        } else {
            self.total_work / self.frames
        }
    }

    /// When work on the next frame should start.
    pub(crate) fn target(&self) -> Instant {
        self.deadline
            .checked_sub(self.average_work())
            .unwrap_or(self.deadline)
    }

    /// Time left to sleep from `now` before the next frame.
    pub(crate) fn remaining(&self, now: Instant) -> Duration {
        self.target().saturating_duration_since(now)
    }

    /// Records how long one frame's encode and send took.
    pub(crate) fn record_work(&mut self, work: Duration) {
        self.frames = self.frames.saturating_add(1);
        self.total_work = self.total_work.saturating_add(work);
    }

    /// Moves to the next slot on the grid.
    ///
    /// A loop which has fallen more than a frame behind restarts the grid at
    /// `now` rather than sending a burst to catch up.
    pub(crate) fn advance(&mut self, now: Instant) {
        self.deadline += TIMESTEP_LENGTH;

        if self.deadline + TIMESTEP_LENGTH < now {
            self.deadline = now + TIMESTEP_LENGTH;
        }
    }

    /// Sleeps coarsely, then spins through the final window, until [`Self::target`].
    pub(crate) fn wait(&self) {
        let remaining = self.remaining(Instant::now());
        if !remaining.is_zero() {
            self.sleeper.sleep(remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn first_deadline_is_one_frame_out() {
        let now = Instant::now();
        let pacer = Pacer::new(now);
        assert_eq!(pacer.deadline(), now + TIMESTEP_LENGTH);
        assert_eq!(pacer.remaining(now), TIMESTEP_LENGTH);
    }

    #[test]
    fn grid_is_absolute() {
        let start = Instant::now();
        let mut pacer = Pacer::new(start);

        // Waking late does not push later frames back.
        pacer.advance(start + 23 * MS);
        assert_eq!(pacer.deadline(), start + 2 * TIMESTEP_LENGTH);
        pacer.advance(start + 41 * MS);
        assert_eq!(pacer.deadline(), start + 3 * TIMESTEP_LENGTH);
    }

    #[test]
    fn work_average_pulls_target_forward() {
        let start = Instant::now();
        let mut pacer = Pacer::new(start);

        pacer.record_work(2 * MS);
        pacer.record_work(4 * MS);
        assert_eq!(pacer.average_work(), 3 * MS);
        assert_eq!(pacer.target(), start + TIMESTEP_LENGTH - 3 * MS);
        assert_eq!(pacer.remaining(start + 10 * MS), 7 * MS);
        assert_eq!(pacer.remaining(start + 30 * MS), Duration::ZERO);
    }

    #[test]
    fn stalled_loop_resyncs_instead_of_bursting() {
        let start = Instant::now();
        let mut pacer = Pacer::new(start);

        let late = start + 200 * MS;
        pacer.advance(late);
        assert_eq!(pacer.deadline(), late + TIMESTEP_LENGTH);
    }

    #[test]
    fn reset_forgets_work() {
        let start = Instant::now();
        let mut pacer = Pacer::new(start);
        pacer.record_work(5 * MS);

        let later = start + 500 * MS;
        pacer.reset(later);
        assert_eq!(pacer.average_work(), Duration::ZERO);
        assert_eq!(pacer.deadline(), later + TIMESTEP_LENGTH);
    }
}
