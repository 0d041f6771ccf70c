// Late reschedule policy - decides when a metric is collected next
//
// Pure timing arithmetic over an entry's trigger history. Nothing in here
// reads a clock; callers pass the instants in, which keeps every decision
// reproducible in tests.
//
// # Late collections
// A collection is late when it is still running at the moment its next
// nominal trigger would fire. Catching up by firing once per missed slot
// would only pile more work onto a collector that is already too slow, so
// all missed slots are skipped and the next trigger is pushed one penalty
// beyond the slot that follows them.

use std::time::Duration;
use tokio::time::Instant;

use crate::schedule::{EntryState, ScheduleEntry};

/// Rescheduling rules applied when a collection settles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LateReschedulePolicy {
    /// Whole intervals added on top of the next slot for a late collection
    pub penalty_intervals: u32,

    /// Extra time added after the penalty intervals
    pub penalty_buffer: Duration,
}

impl Default for LateReschedulePolicy {
    fn default() -> Self {
        LateReschedulePolicy {
            penalty_intervals: 1,
            penalty_buffer: Duration::from_secs(1),
        }
    }
}

impl LateReschedulePolicy {
    pub fn new(penalty_intervals: u32, penalty_buffer: Duration) -> Self {
        LateReschedulePolicy {
            penalty_intervals,
            penalty_buffer,
        }
    }

    /// Returns true if the entry is collecting and its next nominal trigger
    /// has already arrived
    pub fn is_late(&self, entry: &ScheduleEntry, now: Instant) -> bool {
        matches!(entry.state, EntryState::InProgress | EntryState::Late)
            && self.late_at(entry).is_some_and(|deadline| now >= deadline)
    }

    /// The instant from which an outstanding collection counts as late
    pub fn late_at(&self, entry: &ScheduleEntry) -> Option<Instant> {
        entry
            .last_trigger
            .and_then(|last| last.checked_add(entry.interval))
    }

    /// Delay added beyond the next slot for a late collection
    pub fn penalty(&self, interval: Duration) -> Duration {
        interval
            .saturating_mul(self.penalty_intervals)
            .saturating_add(self.penalty_buffer)
    }

    /// Computes the next trigger for an entry whose collection settled at
    /// `completion`
    ///
    /// # Returns
    /// * On time: `last_trigger + interval`
    /// * Late: with `k` nominal slots missed, the anchor is the slot before
    ///   the last missed one (`last_trigger + (k - 1) * interval`) and the
    ///   next trigger is `anchor + interval + penalty`
    ///
    /// The result is never earlier than `completion`. A trigger too far out
    /// to be represented falls back to `completion + interval`.
    pub fn next_trigger_after_completion(
        &self,
        entry: &ScheduleEntry,
        completion: Instant,
    ) -> Instant {
        let Some(last) = entry.last_trigger else {
            return completion;
        };
        let interval = entry.interval;
        let missed = missed_slots(completion.saturating_duration_since(last), interval);

        // anchor + interval == last + missed * interval
        let offset = if missed == 0 {
            interval
        } else {
            interval
                .saturating_mul(missed)
                .saturating_add(self.penalty(interval))
        };

        last.checked_add(offset)
            .or_else(|| completion.checked_add(interval))
            .unwrap_or(completion)
            .max(completion)
    }
}

/// Number of nominal slots that passed while a collection was running
fn missed_slots(elapsed: Duration, interval: Duration) -> u32 {
    if interval.is_zero() {
        return 0;
    }
    let slots = elapsed.as_nanos() / interval.as_nanos();
    u32::try_from(slots).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ScheduleKey;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    /// An entry triggered at `t0 + triggered` that is still collecting
    fn collecting(t0: Instant, interval: u64, triggered: u64) -> ScheduleEntry {
        let mut entry = ScheduleEntry::new(
            ScheduleKey::new("server", "metric1"),
            "platform",
            secs(interval),
            true,
            t0,
        );
        entry.state = EntryState::InProgress;
        entry.last_trigger = Some(t0 + secs(triggered));
        entry
    }

    #[test]
    fn test_on_time_completion_keeps_cadence() {
        let t0 = Instant::now();
        let policy = LateReschedulePolicy::default();
        let entry = collecting(t0, 30, 0);

        assert!(!policy.is_late(&entry, t0 + secs(10)));
        assert_eq!(
            policy.next_trigger_after_completion(&entry, t0 + secs(10)),
            t0 + secs(30)
        );
    }

    #[test]
    fn test_slow_collection_is_pushed_past_next_slot() {
        // interval 30s, collector needs 91s: slots 30, 60 and 90 are
        // skipped and the next collection happens at 121
        let t0 = Instant::now();
        let policy = LateReschedulePolicy::default();
        let entry = collecting(t0, 30, 0);

        assert!(!policy.is_late(&entry, t0 + secs(29)));
        assert!(policy.is_late(&entry, t0 + secs(30)));

        let next = policy.next_trigger_after_completion(&entry, t0 + secs(91));
        assert_eq!(next, t0 + secs(121));
        assert_ne!(next, t0 + secs(60));
        assert_ne!(next, t0 + secs(120));
    }

    #[test]
    fn test_single_missed_slot_uses_full_penalty() {
        let t0 = Instant::now();
        let policy = LateReschedulePolicy::default();
        let entry = collecting(t0, 30, 0);

        // last + interval + (interval + 1s)
        let next = policy.next_trigger_after_completion(&entry, t0 + secs(45));
        assert_eq!(next, t0 + secs(61));

        // exactly at the next slot already counts as late
        let next = policy.next_trigger_after_completion(&entry, t0 + secs(30));
        assert_eq!(next, t0 + secs(61));
    }

    #[test]
    fn test_idle_entry_is_never_late() {
        let t0 = Instant::now();
        let policy = LateReschedulePolicy::default();
        let mut entry = collecting(t0, 30, 0);
        entry.state = EntryState::Idle;

        assert!(!policy.is_late(&entry, t0 + secs(300)));
    }

    #[test]
    fn test_next_trigger_always_moves_forward() {
        let t0 = Instant::now();
        let policy = LateReschedulePolicy::default();

        for interval in [1, 7, 30, 35, 600] {
            let entry = collecting(t0, interval, 5);
            let last = t0 + secs(5);
            for runtime_ms in (0..3_000_000).step_by(12_345) {
                let completion = last + Duration::from_millis(runtime_ms);
                let next = policy.next_trigger_after_completion(&entry, completion);
                assert!(next > last, "interval {interval}s, runtime {runtime_ms}ms");
                assert!(next >= completion, "interval {interval}s, runtime {runtime_ms}ms");
            }
        }
    }

    #[test]
    fn test_penalty_is_configurable() {
        let t0 = Instant::now();
        let entry = collecting(t0, 30, 0);

        let policy = LateReschedulePolicy::new(0, secs(5));
        assert_eq!(
            policy.next_trigger_after_completion(&entry, t0 + secs(91)),
            t0 + secs(95)
        );

        let policy = LateReschedulePolicy::new(2, secs(1));
        assert_eq!(
            policy.next_trigger_after_completion(&entry, t0 + secs(91)),
            t0 + secs(151)
        );

        // without any penalty the result is clamped to the completion time
        let policy = LateReschedulePolicy::new(0, Duration::ZERO);
        assert_eq!(
            policy.next_trigger_after_completion(&entry, t0 + secs(91)),
            t0 + secs(91)
        );
    }

    #[test]
    fn test_huge_interval_does_not_overflow() {
        let t0 = Instant::now();
        let policy = LateReschedulePolicy::new(u32::MAX, Duration::MAX);
        let mut entry = collecting(t0, 30, 0);
        entry.interval = Duration::from_secs(u64::MAX);

        assert!(policy.late_at(&entry).is_none());
        assert!(!policy.is_late(&entry, t0 + secs(3600)));
        assert_eq!(policy.penalty(entry.interval), Duration::MAX);
        assert_eq!(
            policy.next_trigger_after_completion(&entry, t0 + secs(5)),
            t0 + secs(5)
        );

        // missed slots with a penalty that cannot be represented
        let entry = collecting(t0, 30, 0);
        assert_eq!(
            policy.next_trigger_after_completion(&entry, t0 + secs(91)),
            t0 + secs(121)
        );
    }

    #[test]
    fn test_never_triggered_entry_is_due_at_completion() {
        let t0 = Instant::now();
        let policy = LateReschedulePolicy::default();
        let mut entry = collecting(t0, 30, 0);
        entry.last_trigger = None;

        assert_eq!(policy.next_trigger_after_completion(&entry, t0), t0);
        assert!(policy.late_at(&entry).is_none());
    }
}
