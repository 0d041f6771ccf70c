// Schedule module - the recurring collection state of one resource metric
//
// A ScheduleEntry exists for every (resource, metric) pair the inventory has
// committed. Entries are owned by the scheduler's table and are only ever
// handed out as immutable snapshots.

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Errors raised by the scheduler when applying inventory changes or
/// detecting a corrupted entry
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    /// A definition from the inventory was rejected and never inserted
    #[error("invalid schedule for '{target}': {reason}")]
    Configuration { target: String, reason: String },

    /// A second trigger was about to be dispatched for an entry that is
    /// still in flight. The entry is quarantined.
    #[error("scheduling invariant violated for '{key}': {detail}")]
    InvariantViolation { key: ScheduleKey, detail: String },

    #[error("scheduler is not running")]
    Stopped,
}

impl ScheduleError {
    pub fn configuration(target: impl fmt::Display, reason: impl Into<String>) -> Self {
        ScheduleError::Configuration {
            target: target.to_string(),
            reason: reason.into(),
        }
    }
}

/// Unique key of a schedule entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScheduleKey {
    pub resource_id: String,
    pub metric_name: String,
}

impl ScheduleKey {
    pub fn new(resource_id: impl Into<String>, metric_name: impl Into<String>) -> Self {
        ScheduleKey {
            resource_id: resource_id.into(),
            metric_name: metric_name.into(),
        }
    }
}

impl fmt::Display for ScheduleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_id, self.metric_name)
    }
}

/// Lifecycle state of a schedule entry
///
/// ```text
/// Idle -> Queued -> InProgress -> Idle
///                        |
///                        +-> Late -> Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Waiting in the due queue (or parked, if disabled)
    Idle,
    /// Popped from the due queue and handed to the worker pool
    Queued,
    /// A worker is collecting
    InProgress,
    /// Still collecting after the next nominal trigger has passed
    Late,
}

impl EntryState {
    /// True while a trigger for the entry is outstanding
    pub fn is_in_flight(self) -> bool {
        !matches!(self, EntryState::Idle)
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryState::Idle => "idle",
            EntryState::Queued => "queued",
            EntryState::InProgress => "in_progress",
            EntryState::Late => "late",
        };
        f.write_str(name)
    }
}

/// Recurring collection state for one resource metric
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub key: ScheduleKey,

    /// Selects the collector that reads this metric
    pub resource_type: String,

    /// Nominal collection period
    pub interval: Duration,

    pub enabled: bool,
    pub state: EntryState,

    /// Nominal time of the most recently dispatched trigger
    pub last_trigger: Option<Instant>,

    /// When the most recent collection finished, successfully or not
    pub last_completion: Option<Instant>,

    /// When the entry becomes due; meaningful only while it sits in the queue
    pub next_trigger: Instant,

    /// Consecutive late completions
    pub late_streak: u32,

    /// Sequence number of the outstanding trigger
    pub in_flight: Option<u64>,

    /// The outstanding trigger's outcome has already been forwarded
    pub outcome_reported: bool,

    /// The pool gave up waiting but the collection body is still running
    pub timed_out: bool,

    /// Drop the entry once its outstanding collection settles
    pub pending_removal: bool,

    /// Disabled after an invariant violation
    pub quarantined: bool,
}

impl ScheduleEntry {
    pub fn new(
        key: ScheduleKey,
        resource_type: impl Into<String>,
        interval: Duration,
        enabled: bool,
        first_trigger: Instant,
    ) -> Self {
        ScheduleEntry {
            key,
            resource_type: resource_type.into(),
            interval,
            enabled,
            state: EntryState::Idle,
            last_trigger: None,
            last_completion: None,
            next_trigger: first_trigger,
            late_streak: 0,
            in_flight: None,
            outcome_reported: false,
            timed_out: false,
            pending_removal: false,
            quarantined: false,
        }
    }

    /// Whether the outstanding trigger carries the given sequence number
    pub fn owns_trigger(&self, trigger_seq: u64) -> bool {
        self.in_flight == Some(trigger_seq)
    }

    /// `queued` tells whether the entry currently sits in the due queue
    pub fn snapshot(&self, queued: bool) -> EntrySnapshot {
        EntrySnapshot {
            key: self.key.clone(),
            resource_type: self.resource_type.clone(),
            interval: self.interval,
            enabled: self.enabled,
            state: self.state,
            last_trigger: self.last_trigger,
            last_completion: self.last_completion,
            next_trigger: queued.then_some(self.next_trigger),
            late_streak: self.late_streak,
            timed_out: self.timed_out,
            pending_removal: self.pending_removal,
            quarantined: self.quarantined,
        }
    }
}

/// Read-only view of an entry for diagnostics
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
    pub key: ScheduleKey,
    pub resource_type: String,
    pub interval: Duration,
    pub enabled: bool,
    pub state: EntryState,
    pub last_trigger: Option<Instant>,
    pub last_completion: Option<Instant>,
    /// Set only while the entry waits in the due queue
    pub next_trigger: Option<Instant>,
    pub late_streak: u32,
    pub timed_out: bool,
    pub pending_removal: bool,
    pub quarantined: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        let key = ScheduleKey::new("host-1", "Memory");
        assert_eq!(key.to_string(), "host-1/Memory");
    }

    #[test]
    fn test_new_entry_is_idle() {
        let now = Instant::now();
        let entry = ScheduleEntry::new(
            ScheduleKey::new("host-1", "Memory"),
            "platform",
            Duration::from_secs(30),
            true,
            now,
        );

        assert_eq!(entry.state, EntryState::Idle);
        assert!(!entry.state.is_in_flight());
        assert!(entry.last_trigger.is_none());
        assert!(entry.last_completion.is_none());
        assert!(!entry.owns_trigger(0));
    }

    #[test]
    fn test_in_flight_states() {
        assert!(EntryState::Queued.is_in_flight());
        assert!(EntryState::InProgress.is_in_flight());
        assert!(EntryState::Late.is_in_flight());
        assert_eq!(EntryState::InProgress.to_string(), "in_progress");
    }
}
