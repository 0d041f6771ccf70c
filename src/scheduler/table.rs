// Schedule table - the entry map, the due queue and every state transition
//
// Synchronous and clock-free: each operation takes the current instant as an
// argument. The scheduler task owns the only instance, which is what keeps a
// single mutation path for all entries.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::due_queue::DueQueue;
use crate::inventory::MetricDefinition;
use crate::metrics::MeasurementValue;
use crate::policy::LateReschedulePolicy;
use crate::pool::CollectionTicket;
use crate::schedule::{EntrySnapshot, EntryState, ScheduleEntry, ScheduleError, ScheduleKey};
use crate::sink::{CollectionFailure, Report};

use chrono::{DateTime, Utc};

/// Longest accepted interval or initial delay
pub const MAX_SCHEDULE_DELAY: Duration = Duration::from_secs(31 * 24 * 60 * 60);

/// Cumulative scheduling counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub late_completions: u64,
    pub rejected_submissions: u64,
    pub quarantined: u64,
}

pub struct ScheduleTable {
    entries: HashMap<ScheduleKey, ScheduleEntry>,
    queue: DueQueue,
    in_flight: HashSet<ScheduleKey>,
    policy: LateReschedulePolicy,
    min_interval: Duration,
    next_seq: u64,
    stats: SchedulerStats,
}

impl ScheduleTable {
    pub fn new(policy: LateReschedulePolicy, min_interval: Duration) -> Self {
        ScheduleTable {
            entries: HashMap::new(),
            queue: DueQueue::new(),
            in_flight: HashSet::new(),
            policy,
            min_interval,
            next_seq: 0,
            stats: SchedulerStats::default(),
        }
    }

    fn validate_interval(&self, key: &ScheduleKey, interval: Duration) -> Result<(), ScheduleError> {
        if interval.is_zero() {
            return Err(ScheduleError::configuration(key, "interval must be positive"));
        }
        if interval < self.min_interval {
            return Err(ScheduleError::configuration(
                key,
                format!(
                    "interval {}ms is below the minimum of {}ms",
                    interval.as_millis(),
                    self.min_interval.as_millis()
                ),
            ));
        }
        if interval > MAX_SCHEDULE_DELAY {
            return Err(ScheduleError::configuration(
                key,
                format!(
                    "interval {}s exceeds the maximum of {}s",
                    interval.as_secs(),
                    MAX_SCHEDULE_DELAY.as_secs()
                ),
            ));
        }
        Ok(())
    }

    /// Adds a metric schedule, or updates it if the entry already exists
    pub fn upsert(
        &mut self,
        resource_id: &str,
        resource_type: &str,
        metric: &MetricDefinition,
        now: Instant,
    ) -> Result<(), ScheduleError> {
        let key = ScheduleKey::new(resource_id, metric.metric_name.as_str());
        if metric.metric_name.is_empty() {
            return Err(ScheduleError::configuration(resource_id, "metric name is empty"));
        }
        self.validate_interval(&key, metric.interval)?;
        let initial_delay = metric.initial_delay.unwrap_or(Duration::ZERO);
        if initial_delay > MAX_SCHEDULE_DELAY {
            return Err(ScheduleError::configuration(
                &key,
                format!(
                    "initial delay {}s exceeds the maximum of {}s",
                    initial_delay.as_secs(),
                    MAX_SCHEDULE_DELAY.as_secs()
                ),
            ));
        }

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.resource_type = resource_type.to_string();
            entry.pending_removal = false;
            return self.change_schedule(&key, metric.interval, metric.enabled, now);
        }

        let first_trigger = now + initial_delay;
        let entry = ScheduleEntry::new(
            key.clone(),
            resource_type,
            metric.interval,
            metric.enabled,
            first_trigger,
        );
        if entry.enabled {
            self.queue.insert(key.clone(), first_trigger);
        }

        info!(
            resource = %key.resource_id,
            metric = %key.metric_name,
            interval_ms = metric.interval.as_millis() as u64,
            enabled = metric.enabled,
            "Schedule added"
        );
        self.entries.insert(key, entry);
        Ok(())
    }

    /// Changes interval and enablement of an existing entry
    pub fn change_schedule(
        &mut self,
        key: &ScheduleKey,
        interval: Duration,
        enabled: bool,
        now: Instant,
    ) -> Result<(), ScheduleError> {
        self.validate_interval(key, interval)?;
        let Some(entry) = self.entries.get_mut(key) else {
            return Err(ScheduleError::configuration(key, "no such schedule"));
        };

        let interval_changed = entry.interval != interval;
        let was_enabled = entry.enabled && !entry.quarantined;
        entry.interval = interval;
        entry.enabled = enabled;
        if enabled {
            entry.quarantined = false;
        }

        // in-flight entries pick the change up when they settle
        if entry.state.is_in_flight() {
            return Ok(());
        }

        match (was_enabled, enabled) {
            (false, true) => {
                entry.next_trigger = now;
                self.queue.insert(key.clone(), now);
                info!(key = %key, "Schedule enabled");
            }
            (true, false) => {
                self.queue.remove(key);
                info!(key = %key, "Schedule disabled");
            }
            (true, true) if interval_changed => {
                let next = entry
                    .last_trigger
                    .and_then(|last| last.checked_add(interval))
                    .map_or(now, |next| next.max(now));
                entry.next_trigger = next;
                self.queue.remove(key);
                self.queue.insert(key.clone(), next);
                debug!(key = %key, interval_ms = interval.as_millis() as u64, "Schedule interval changed");
            }
            _ => {}
        }
        Ok(())
    }

    /// Removes one entry. In-flight entries are dropped when they settle.
    ///
    /// # Returns
    /// `true` if the entry existed
    pub fn remove(&mut self, key: &ScheduleKey) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };

        if entry.state.is_in_flight() {
            entry.pending_removal = true;
            entry.enabled = false;
            debug!(key = %key, "Removal deferred until the collection settles");
        } else {
            self.queue.remove(key);
            self.entries.remove(key);
            info!(key = %key, "Schedule removed");
        }
        true
    }

    /// Removes every entry of a resource, returning how many there were
    pub fn remove_resource(&mut self, resource_id: &str) -> usize {
        let keys: Vec<ScheduleKey> = self
            .entries
            .keys()
            .filter(|key| key.resource_id == resource_id)
            .cloned()
            .collect();

        keys.iter().filter(|key| self.remove(key)).count()
    }

    /// Pops every due entry and turns it into a ticket
    pub fn take_due(&mut self, now: Instant) -> Vec<CollectionTicket> {
        let mut tickets = Vec::new();

        for (key, due) in self.queue.pop_due_before(now) {
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };

            if entry.state.is_in_flight() || entry.in_flight.is_some() {
                let detail = format!(
                    "entry was due while {} with trigger {:?} outstanding",
                    entry.state, entry.in_flight
                );
                self.quarantine(&key, detail);
                continue;
            }
            if !entry.enabled {
                continue;
            }

            let seq = self.next_seq;
            self.next_seq += 1;

            entry.state = EntryState::Queued;
            entry.last_trigger = Some(due);
            entry.in_flight = Some(seq);
            entry.outcome_reported = false;
            entry.timed_out = false;
            self.in_flight.insert(key.clone());
            self.stats.dispatched += 1;

            tickets.push(CollectionTicket {
                key,
                resource_type: entry.resource_type.clone(),
                trigger_seq: seq,
                triggered_at: due,
            });
        }

        tickets
    }

    /// A worker picked the ticket up
    pub fn mark_started(&mut self, ticket: &CollectionTicket) {
        match self.entries.get_mut(&ticket.key) {
            Some(entry) if entry.owns_trigger(ticket.trigger_seq) => {
                if entry.state == EntryState::Queued {
                    entry.state = EntryState::InProgress;
                }
            }
            _ => debug!(key = %ticket.key, seq = ticket.trigger_seq, "Ignoring start of a stale trigger"),
        }
    }

    /// Flags running collections whose next nominal trigger has passed
    pub fn mark_late(&mut self, now: Instant) -> Vec<ScheduleKey> {
        let mut newly_late = Vec::new();

        for key in &self.in_flight {
            let Some(entry) = self.entries.get_mut(key) else {
                continue;
            };
            if entry.state == EntryState::InProgress && self.policy.is_late(entry, now) {
                entry.state = EntryState::Late;
                warn!(
                    resource = %key.resource_id,
                    metric = %key.metric_name,
                    interval_ms = entry.interval.as_millis() as u64,
                    late_streak = entry.late_streak,
                    "Collection is late; skipping its next trigger"
                );
                newly_late.push(key.clone());
            }
        }

        newly_late
    }

    /// Earliest instant at which a running collection turns late
    pub fn next_late_check(&self) -> Option<Instant> {
        self.in_flight
            .iter()
            .filter_map(|key| self.entries.get(key))
            .filter(|entry| entry.state == EntryState::InProgress)
            .filter_map(|entry| self.policy.late_at(entry))
            .min()
    }

    /// Records the outcome of a collection.
    ///
    /// A settled completion returns the entry to the queue. An unsettled
    /// one (timed out, body still running) keeps the entry in flight until
    /// `release`.
    ///
    /// # Returns
    /// The report to forward, or `None` for stale and duplicate deliveries
    pub fn complete(
        &mut self,
        ticket: &CollectionTicket,
        outcome: Result<MeasurementValue, CollectionFailure>,
        finished_at: Instant,
        collected_at: DateTime<Utc>,
        settled: bool,
    ) -> Option<Report> {
        let entry = match self.entries.get_mut(&ticket.key) {
            Some(entry) if entry.owns_trigger(ticket.trigger_seq) => entry,
            _ => {
                debug!(key = %ticket.key, seq = ticket.trigger_seq, "Ignoring completion of a stale trigger");
                return None;
            }
        };
        if entry.outcome_reported {
            debug!(key = %ticket.key, seq = ticket.trigger_seq, "Ignoring duplicate completion");
            return None;
        }
        entry.outcome_reported = true;
        if entry.state == EntryState::Queued {
            entry.state = EntryState::InProgress;
        }

        match &outcome {
            Ok(_) => self.stats.succeeded += 1,
            Err(CollectionFailure::Timeout(_)) => {
                self.stats.failed += 1;
                self.stats.timed_out += 1;
            }
            Err(CollectionFailure::Error(_)) => self.stats.failed += 1,
        }

        if settled {
            self.settle(&ticket.key, finished_at);
        } else {
            entry.timed_out = true;
        }

        Some(Report::from_outcome(ticket.key.clone(), outcome, collected_at))
    }

    /// A timed-out collection body returned; the entry may be scheduled again
    pub fn release(&mut self, ticket: &CollectionTicket, finished_at: Instant) {
        match self.entries.get(&ticket.key) {
            Some(entry) if entry.owns_trigger(ticket.trigger_seq) && entry.timed_out => {
                self.settle(&ticket.key, finished_at);
            }
            _ => debug!(key = %ticket.key, seq = ticket.trigger_seq, "Ignoring release of a stale trigger"),
        }
    }

    /// Gives up on a queued ticket whose entry was disabled or removed
    /// before any worker picked it up
    ///
    /// # Returns
    /// `true` if the ticket was withdrawn and must not be submitted
    pub fn withdraw_if_cancelled(&mut self, ticket: &CollectionTicket) -> bool {
        let Some(entry) = self.entries.get_mut(&ticket.key) else {
            return true;
        };
        if !entry.owns_trigger(ticket.trigger_seq) {
            return true;
        }
        if entry.state != EntryState::Queued || (entry.enabled && !entry.pending_removal) {
            return false;
        }

        entry.state = EntryState::Idle;
        entry.in_flight = None;
        self.in_flight.remove(&ticket.key);
        if entry.pending_removal {
            self.entries.remove(&ticket.key);
        }
        debug!(key = %ticket.key, "Queued trigger withdrawn");
        true
    }

    /// Ends the outstanding trigger and computes the next one
    fn settle(&mut self, key: &ScheduleKey, finished_at: Instant) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };

        let late = self.policy.is_late(entry, finished_at);
        let next = self.policy.next_trigger_after_completion(entry, finished_at);

        entry.last_completion = Some(finished_at);
        if late {
            entry.late_streak += 1;
            self.stats.late_completions += 1;
        } else {
            entry.late_streak = 0;
        }
        entry.state = EntryState::Idle;
        entry.in_flight = None;
        entry.timed_out = false;
        self.in_flight.remove(key);

        if entry.pending_removal {
            self.entries.remove(key);
            info!(key = %key, "Schedule removed after its last collection");
            return;
        }
        if !entry.enabled {
            debug!(key = %key, "Schedule disabled; not rescheduling");
            return;
        }

        if late {
            info!(
                resource = %key.resource_id,
                metric = %key.metric_name,
                late_streak = entry.late_streak,
                delay_ms = next.saturating_duration_since(finished_at).as_millis() as u64,
                "Late collection finished; next trigger pushed back"
            );
        }
        entry.next_trigger = next;
        self.queue.insert(key.clone(), next);
    }

    /// Disables an entry after an invariant violation. The scheduler keeps
    /// running; the entry stays resident until re-enabled or removed.
    fn quarantine(&mut self, key: &ScheduleKey, detail: String) {
        let violation = ScheduleError::InvariantViolation {
            key: key.clone(),
            detail,
        };
        error!("{}; entry quarantined", violation);

        if let Some(entry) = self.entries.get_mut(key) {
            entry.enabled = false;
            entry.quarantined = true;
        }
        self.queue.remove(key);
        self.stats.quarantined += 1;
    }

    pub fn note_rejected_submission(&mut self) {
        self.stats.rejected_submissions += 1;
    }

    pub fn next_due(&mut self) -> Option<Instant> {
        self.queue.next_due()
    }

    #[cfg(test)]
    pub fn entry(&self, key: &ScheduleKey) -> Option<EntrySnapshot> {
        self.entries
            .get(key)
            .map(|entry| entry.snapshot(self.queue.contains(key)))
    }

    /// Snapshots of all entries, ordered by key
    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        let mut entries: Vec<EntrySnapshot> = self
            .entries
            .values()
            .map(|entry| entry.snapshot(self.queue.contains(&entry.key)))
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }
}
