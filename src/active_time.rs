use chrono::{DateTime, Utc};

use crate::store::ActiveTimeState;

/// Outcome of a single activity observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObservedIncrement {
    /// Seconds newly accrued into the cumulative total by this observation.
    pub accrued_seconds: u64,
    /// Counter delta to forward to the metric sink: cumulative total minus
    /// the last value already reported in this process lifetime.
    pub counter_delta: u64,
}

/// Converts a once-per-poll "is anything active right now" sample into a
/// monotonically growing duration. Time accrues only between two consecutive
/// active observations, by the wall-clock gap between them; an isolated
/// active sample adds nothing.
///
/// The cumulative total is durable; the reported-seconds watermark is not.
/// On restart the watermark starts at the persisted cumulative value, so
/// history accrued by earlier process lifetimes is never re-emitted.
#[derive(Debug)]
pub struct ActiveTimeAccumulator {
    state: ActiveTimeState,
    was_active_last_poll: bool,
    reported_seconds: u64,
}

impl ActiveTimeAccumulator {
    pub fn from_state(state: ActiveTimeState) -> Self {
        let reported_seconds = state.cumulative_seconds;
        Self {
            state,
            was_active_last_poll: false,
            reported_seconds,
        }
    }

    pub fn observe(&mut self, active_now: bool, now: DateTime<Utc>) -> ObservedIncrement {
        let mut accrued_seconds = 0u64;

        if active_now
            && self.was_active_last_poll
            && let Some(last) = self.state.last_observation_at
        {
            let gap_ms = now.signed_duration_since(last).num_milliseconds();
            let rounded = (gap_ms as f64 / 1_000.0).round();
            if rounded > 0.0 {
                accrued_seconds = rounded as u64;
                self.state.cumulative_seconds += accrued_seconds;
            }
        }

        self.was_active_last_poll = active_now;
        self.state.last_observation_at = Some(now);

        let counter_delta = self.state.cumulative_seconds - self.reported_seconds;
        self.reported_seconds = self.state.cumulative_seconds;

        ObservedIncrement {
            accrued_seconds,
            counter_delta,
        }
    }

    pub fn state(&self) -> &ActiveTimeState {
        &self.state
    }

    pub fn cumulative_seconds(&self) -> u64 {
        self.state.cumulative_seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_770_000_000 + secs, 0).single().expect("timestamp")
    }

    #[test]
    fn accrues_only_between_consecutive_active_polls() {
        let mut acc = ActiveTimeAccumulator::from_state(ActiveTimeState::default());

        assert_eq!(acc.observe(true, at(0)).accrued_seconds, 0);
        assert_eq!(acc.observe(true, at(10)).accrued_seconds, 10);
        assert_eq!(acc.observe(false, at(15)).accrued_seconds, 0);
        assert_eq!(acc.observe(true, at(20)).accrued_seconds, 0);
        assert_eq!(acc.observe(true, at(30)).accrued_seconds, 10);

        assert_eq!(acc.cumulative_seconds(), 20);
    }

    #[test]
    fn lone_active_sample_adds_nothing() {
        let mut acc = ActiveTimeAccumulator::from_state(ActiveTimeState::default());
        let inc = acc.observe(true, at(0));
        assert_eq!(inc.accrued_seconds, 0);
        assert_eq!(inc.counter_delta, 0);
        assert_eq!(acc.cumulative_seconds(), 0);
    }

    #[test]
    fn clock_regression_accrues_nothing_but_advances_observation() {
        let mut acc = ActiveTimeAccumulator::from_state(ActiveTimeState::default());
        acc.observe(true, at(100));
        let inc = acc.observe(true, at(40));
        assert_eq!(inc.accrued_seconds, 0);
        assert_eq!(acc.state().last_observation_at, Some(at(40)));

        // The regressed timestamp is the new reference point.
        assert_eq!(acc.observe(true, at(50)).accrued_seconds, 10);
    }

    #[test]
    fn restart_does_not_re_report_persisted_seconds() {
        let persisted = ActiveTimeState {
            cumulative_seconds: 100,
            last_observation_at: Some(at(0)),
        };
        let mut acc = ActiveTimeAccumulator::from_state(persisted);

        // First observation after restart: no accrual (previous-poll flag is
        // process-local) and, critically, no counter delta for the 100s that
        // an earlier process lifetime already reported.
        let inc = acc.observe(true, at(600));
        assert_eq!(inc.accrued_seconds, 0);
        assert_eq!(inc.counter_delta, 0);
        assert_eq!(acc.cumulative_seconds(), 100);

        // Fresh accrual is reported exactly once.
        let inc = acc.observe(true, at(610));
        assert_eq!(inc.accrued_seconds, 10);
        assert_eq!(inc.counter_delta, 10);
        assert_eq!(acc.cumulative_seconds(), 110);
    }

    #[test]
    fn counter_delta_tracks_cumulative_growth() {
        let mut acc = ActiveTimeAccumulator::from_state(ActiveTimeState::default());
        acc.observe(true, at(0));
        assert_eq!(acc.observe(true, at(7)).counter_delta, 7);
        assert_eq!(acc.observe(true, at(12)).counter_delta, 5);
        assert_eq!(acc.observe(false, at(20)).counter_delta, 0);
    }

    #[test]
    fn sub_second_gaps_round_to_nearest() {
        let mut acc = ActiveTimeAccumulator::from_state(ActiveTimeState::default());
        let start = at(0);
        acc.observe(true, start);
        let inc = acc.observe(true, start + chrono::Duration::milliseconds(400));
        assert_eq!(inc.accrued_seconds, 0);
        let inc = acc.observe(true, start + chrono::Duration::milliseconds(2_000));
        assert_eq!(inc.accrued_seconds, 2);
    }
}
