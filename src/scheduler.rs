use std::time::Duration;

/// Fixed-interval lane measured against time elapsed since session start.
#[derive(Debug, Clone)]
pub struct Scheduler {
    every: Duration,
    next_due: Duration,
}

impl Scheduler {
    /// First run is due immediately.
    pub fn new(every: Duration) -> Result<Self, String> {
        Self::starting_at(every, Duration::ZERO)
    }

    /// First run is due after one full interval.
    pub fn delayed(every: Duration) -> Result<Self, String> {
        Self::starting_at(every, every)
    }

    fn starting_at(every: Duration, first_due: Duration) -> Result<Self, String> {
        if every.is_zero() {
            return Err("interval must be greater than 0".to_string());
        }
        Ok(Self {
            every,
            next_due: first_due,
        })
    }

    pub fn is_due(&self, elapsed: Duration) -> bool {
        elapsed >= self.next_due
    }

    pub fn time_until_due(&self, elapsed: Duration) -> Duration {
        self.next_due.saturating_sub(elapsed)
    }

    /// Advances to the first slot strictly after `elapsed`. Slots missed while a run overran are
    /// skipped rather than replayed, so the lane is never due again immediately.
    pub fn mark_run(&mut self, elapsed: Duration) {
        self.next_due = self.next_due.saturating_add(self.every);
        if self.next_due <= elapsed {
            let behind = elapsed - self.next_due;
            let missed = behind.as_nanos() / self.every.as_nanos() + 1;
            let missed = u32::try_from(missed).unwrap_or(u32::MAX);
            self.next_due = self.next_due.saturating_add(self.every.saturating_mul(missed));
        }
    }

    /// Align the next due time to "now" (elapsed since session start).
    ///
    /// Used when resuming after a pause so the monitor does not issue a burst of ticks
    /// for missed intervals.
    pub fn align_next_due(&mut self, elapsed: Duration) {
        self.next_due = elapsed;
    }

    /// Pushes the next slot back by `by`, keeping the remaining wait intact across a pause.
    pub fn postpone(&mut self, by: Duration) {
        self.next_due = self.next_due.saturating_add(by);
    }
}

/// Optional overall session length.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionLimit {
    pub run_for: Option<Duration>,
}

impl SessionLimit {
    pub fn is_finished(&self, elapsed: Duration) -> bool {
        self.run_for.is_some_and(|limit| elapsed >= limit)
    }

    pub fn remaining(&self, elapsed: Duration) -> Option<Duration> {
        self.run_for.map(|limit| limit.saturating_sub(elapsed))
    }
}

#[cfg(test)]
mod tests {
    use super::{Scheduler, SessionLimit};
    use std::time::Duration;

    #[test]
    fn rejects_zero_interval() {
        assert!(Scheduler::new(Duration::ZERO).is_err());
        assert!(Scheduler::delayed(Duration::ZERO).is_err());
    }

    #[test]
    fn runs_immediately_then_on_interval() {
        let mut lane = Scheduler::new(Duration::from_secs(2)).expect("valid lane");

        assert!(lane.is_due(Duration::ZERO));
        lane.mark_run(Duration::ZERO);

        assert!(!lane.is_due(Duration::from_millis(1500)));
        assert_eq!(
            lane.time_until_due(Duration::from_millis(1500)),
            Duration::from_millis(500)
        );
        assert!(lane.is_due(Duration::from_secs(2)));
    }

    #[test]
    fn delayed_lane_waits_one_interval() {
        let lane = Scheduler::delayed(Duration::from_secs(25 * 60)).expect("valid lane");
        assert!(!lane.is_due(Duration::from_secs(60)));
        assert!(lane.is_due(Duration::from_secs(25 * 60)));
    }

    #[test]
    fn late_ticks_do_not_burst() {
        let mut lane = Scheduler::new(Duration::from_secs(2)).expect("valid lane");
        lane.mark_run(Duration::from_secs(11));
        assert!(!lane.is_due(Duration::from_secs(11)));
        assert!(lane.is_due(Duration::from_secs(12)));
        lane.mark_run(Duration::from_secs(12));
        assert!(!lane.is_due(Duration::from_secs(13)));
        assert!(lane.is_due(Duration::from_secs(14)));
    }

    #[test]
    fn overrunning_run_is_never_due_immediately() {
        let mut lane = Scheduler::new(Duration::from_millis(100)).expect("valid lane");
        let mut elapsed = Duration::ZERO;
        for _ in 0..50 {
            assert!(lane.is_due(elapsed));
            elapsed += Duration::from_millis(150);
            lane.mark_run(elapsed);
            assert!(!lane.is_due(elapsed));
            assert!(lane.time_until_due(elapsed) > Duration::ZERO);
            elapsed += lane.time_until_due(elapsed);
        }
    }

    #[test]
    fn align_and_postpone_after_pause() {
        let mut capture = Scheduler::new(Duration::from_secs(2)).expect("valid lane");
        capture.mark_run(Duration::ZERO);
        capture.align_next_due(Duration::from_secs(30));
        assert!(capture.is_due(Duration::from_secs(30)));
        assert!(!capture.is_due(Duration::from_secs(29)));

        let mut reminder = Scheduler::delayed(Duration::from_secs(60)).expect("valid lane");
        reminder.postpone(Duration::from_secs(30));
        assert!(!reminder.is_due(Duration::from_secs(80)));
        assert!(reminder.is_due(Duration::from_secs(90)));
    }

    #[test]
    fn session_limit_is_optional() {
        let unlimited = SessionLimit::default();
        assert!(!unlimited.is_finished(Duration::from_secs(86_400)));
        assert_eq!(unlimited.remaining(Duration::ZERO), None);

        let limited = SessionLimit {
            run_for: Some(Duration::from_secs(5)),
        };
        assert!(!limited.is_finished(Duration::from_secs(4)));
        assert!(limited.is_finished(Duration::from_secs(5)));
        assert_eq!(limited.remaining(Duration::from_secs(7)), Some(Duration::ZERO));
    }
}
