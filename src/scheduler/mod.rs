// Scheduler module - the measurement collection control loop
//
// # Architecture
// - A single Tokio task owns the ScheduleTable; nothing else can reach
//   entry state, so there is one mutation path and no locking
// - Inventory updates and diagnostics arrive as commands from any number of
//   SchedulerHandle clones
// - Worker progress arrives as WorkerEvents from the CollectionWorkerPool
// - Finished measurements leave as Reports for the reporter task
//
// Between messages the loop sleeps until the earliest of: the next due
// entry, the next running collection turning late, or a retry of tickets
// the pool's backlog refused.

mod table;

pub use table::SchedulerStats;

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::inventory::{MetricDefinition, ResourceDefinition};
use crate::metrics::CollectorRegistry;
use crate::policy::LateReschedulePolicy;
use crate::pool::{CollectionTicket, CollectionWorkerPool, PoolConfig, SubmitError, WorkerEvent};
use crate::schedule::{EntrySnapshot, EntryState, ScheduleError, ScheduleKey};
use crate::sink::{CollectionFailure, Report, ReportSender};
use table::ScheduleTable;

/// How long the loop sleeps when nothing at all is scheduled
const IDLE_PARK: Duration = Duration::from_secs(3600);

/// Capacity of the command channel
const COMMAND_BUFFER: usize = 256;

/// Scheduler tuning
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub pool: PoolConfig,
    pub policy: LateReschedulePolicy,

    /// Shortest accepted collection interval
    pub min_interval: Duration,

    /// Retry delay for tickets refused by a full backlog
    pub dispatch_retry: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            pool: PoolConfig::default(),
            policy: LateReschedulePolicy::default(),
            min_interval: Duration::from_secs(30),
            dispatch_retry: Duration::from_millis(250),
        }
    }
}

/// Result of committing a resource: metrics scheduled and metrics refused
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitOutcome {
    /// Names of the metrics that were scheduled
    pub accepted: Vec<String>,
    pub rejected: Vec<ScheduleError>,
}

/// Point-in-time view of the scheduler for diagnostics
#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    pub entries: Vec<EntrySnapshot>,
    pub queue_depth: usize,
    pub in_flight: usize,
    /// Tickets waiting for room in the pool's backlog
    pub awaiting_pool: usize,
    pub workers: usize,
    pub active_workers: usize,
    pub pool_backlog: usize,
    pub stats: SchedulerStats,
}

impl SchedulerSnapshot {
    pub fn entry(&self, key: &ScheduleKey) -> Option<&EntrySnapshot> {
        self.entries.iter().find(|entry| &entry.key == key)
    }

    pub fn late_entries(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.state == EntryState::Late)
            .count()
    }
}

enum Command {
    CommitResource {
        resource: ResourceDefinition,
        reply: oneshot::Sender<Result<CommitOutcome, ScheduleError>>,
    },
    ChangeSchedule {
        key: ScheduleKey,
        interval: Duration,
        enabled: bool,
        reply: oneshot::Sender<Result<(), ScheduleError>>,
    },
    RemoveMetric {
        key: ScheduleKey,
        reply: oneshot::Sender<bool>,
    },
    RemoveResource {
        resource_id: String,
        reply: oneshot::Sender<usize>,
    },
    Snapshot {
        reply: oneshot::Sender<SchedulerSnapshot>,
    },
    Shutdown,
}

/// Cloneable entry point into a running scheduler.
///
/// This is the inventory-facing interface: resources and metric schedules
/// are committed, changed and removed through it, and diagnostics are read
/// through it.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ScheduleError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ScheduleError::Stopped)?;
        response.await.map_err(|_| ScheduleError::Stopped)
    }

    /// Schedules (or updates) every metric of a committed resource
    pub async fn resource_committed(
        &self,
        resource: ResourceDefinition,
    ) -> Result<CommitOutcome, ScheduleError> {
        self.request(|reply| Command::CommitResource { resource, reply })
            .await?
    }

    pub async fn metric_schedule_changed(
        &self,
        resource_id: &str,
        metric_name: &str,
        interval: Duration,
        enabled: bool,
    ) -> Result<(), ScheduleError> {
        let key = ScheduleKey::new(resource_id, metric_name);
        self.request(|reply| Command::ChangeSchedule {
            key,
            interval,
            enabled,
            reply,
        })
        .await?
    }

    pub async fn metric_removed(
        &self,
        resource_id: &str,
        metric_name: &str,
    ) -> Result<bool, ScheduleError> {
        let key = ScheduleKey::new(resource_id, metric_name);
        self.request(|reply| Command::RemoveMetric { key, reply }).await
    }

    /// Removes all schedules of a resource, returning how many existed
    pub async fn resource_removed(&self, resource_id: &str) -> Result<usize, ScheduleError> {
        let resource_id = resource_id.to_string();
        self.request(|reply| Command::RemoveResource { resource_id, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<SchedulerSnapshot, ScheduleError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Asks the control loop to stop. Returns immediately.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

/// The collection scheduler. Lives inside its own task; see `spawn`.
pub struct MeasurementScheduler {
    table: ScheduleTable,
    registry: CollectorRegistry,
    pool: CollectionWorkerPool,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    commands: mpsc::Receiver<Command>,
    reports: ReportSender,

    /// Tickets refused by the pool, oldest first
    awaiting_pool: VecDeque<CollectionTicket>,
    dispatch_retry: Duration,
}

impl MeasurementScheduler {
    /// Starts the scheduler task with an empty schedule.
    ///
    /// # Arguments
    /// * `config` - Pool sizing, late policy and interval floor
    /// * `registry` - Collectors by resource type
    /// * `reports` - Where finished measurements are queued
    ///
    /// # Returns
    /// A handle for inventory updates and the task's join handle. The task
    /// runs until `SchedulerHandle::shutdown` is called or every handle is
    /// dropped.
    pub fn spawn(
        config: SchedulerConfig,
        registry: CollectorRegistry,
        reports: ReportSender,
    ) -> (SchedulerHandle, JoinHandle<()>) {
        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, events) = mpsc::unbounded_channel();

        info!(
            workers = config.pool.workers,
            backlog = config.pool.backlog,
            timeout_ms = config.pool.collection_timeout.as_millis() as u64,
            min_interval_ms = config.min_interval.as_millis() as u64,
            "Starting measurement scheduler"
        );

        let scheduler = MeasurementScheduler {
            table: ScheduleTable::new(config.policy, config.min_interval),
            registry,
            pool: CollectionWorkerPool::start(config.pool, event_tx),
            events,
            commands,
            reports,
            awaiting_pool: VecDeque::new(),
            dispatch_retry: config.dispatch_retry,
        };

        let task = tokio::spawn(scheduler.run());
        (SchedulerHandle { commands: command_tx }, task)
    }

    async fn run(mut self) {
        loop {
            let now = Instant::now();
            self.table.mark_late(now);
            self.dispatch(now);
            let wake = self.next_wake(now);

            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                _ = sleep_until(wake) => {}
            }
        }

        self.pool.shutdown();
        info!(
            entries = self.table.len(),
            in_flight = self.table.in_flight_count(),
            "Measurement scheduler stopped"
        );
    }

    fn next_wake(&mut self, now: Instant) -> Instant {
        let retry = (!self.awaiting_pool.is_empty())
            .then(|| now.checked_add(self.dispatch_retry))
            .flatten();

        [self.table.next_due(), self.table.next_late_check(), retry]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(now + IDLE_PARK)
    }

    /// Hands due entries to the pool. Tickets refused earlier go first, so
    /// equally due entries keep their order.
    fn dispatch(&mut self, now: Instant) {
        let due = self.table.take_due(now);
        if !due.is_empty() {
            debug!("Dispatching {} due collection(s)", due.len());
        }
        self.awaiting_pool.extend(due);

        while let Some(ticket) = self.awaiting_pool.pop_front() {
            if self.table.withdraw_if_cancelled(&ticket) {
                continue;
            }

            let Some(collector) = self.registry.get(&ticket.resource_type) else {
                self.fail_unroutable(ticket);
                continue;
            };

            match self.pool.submit(ticket, collector) {
                Ok(()) => {}
                Err(SubmitError::Saturated(ticket)) => {
                    self.table.note_rejected_submission();
                    self.awaiting_pool.push_front(ticket);
                    break;
                }
                Err(e @ SubmitError::Closed(_)) => {
                    error!("Cannot dispatch collection: {}", e);
                    self.awaiting_pool.push_front(e.into_ticket());
                    break;
                }
            }
        }
    }

    /// A ticket whose resource type has no collector fails right away
    fn fail_unroutable(&mut self, ticket: CollectionTicket) {
        let failure = CollectionFailure::Error(format!(
            "no collector for resource type '{}'",
            ticket.resource_type
        ));
        let now = Instant::now();
        if let Some(report) =
            self.table
                .complete(&ticket, Err(failure), now, chrono::Utc::now(), true)
        {
            self.forward(report);
        }
    }

    fn handle_command(&mut self, command: Command) {
        let now = Instant::now();

        match command {
            Command::CommitResource { resource, reply } => {
                let _ = reply.send(self.commit_resource(resource, now));
            }
            Command::ChangeSchedule {
                key,
                interval,
                enabled,
                reply,
            } => {
                let result = self.table.change_schedule(&key, interval, enabled, now);
                if let Err(e) = &result {
                    warn!("Schedule change rejected: {}", e);
                }
                let _ = reply.send(result);
            }
            Command::RemoveMetric { key, reply } => {
                let _ = reply.send(self.table.remove(&key));
            }
            Command::RemoveResource { resource_id, reply } => {
                let removed = self.table.remove_resource(&resource_id);
                info!(resource = %resource_id, removed, "Resource removed from schedule");
                let _ = reply.send(removed);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => {}
        }
    }

    fn commit_resource(
        &mut self,
        resource: ResourceDefinition,
        now: Instant,
    ) -> Result<CommitOutcome, ScheduleError> {
        let Some(collector) = self.registry.get(&resource.resource_type) else {
            let e = ScheduleError::configuration(
                &resource.resource_id,
                format!(
                    "unknown resource type '{}' (known: {})",
                    resource.resource_type,
                    self.registry.resource_types().join(", ")
                ),
            );
            warn!("Resource rejected: {}", e);
            return Err(e);
        };

        let mut outcome = CommitOutcome::default();
        for metric in &resource.metrics {
            match self.commit_metric(&resource, metric, collector.supports(&metric.metric_name), now) {
                Ok(()) => outcome.accepted.push(metric.metric_name.clone()),
                Err(e) => {
                    warn!("Metric schedule rejected: {}", e);
                    outcome.rejected.push(e);
                }
            }
        }

        info!(
            resource = %resource.resource_id,
            resource_type = %resource.resource_type,
            accepted = outcome.accepted.len(),
            rejected = outcome.rejected.len(),
            "Resource committed"
        );
        Ok(outcome)
    }

    fn commit_metric(
        &mut self,
        resource: &ResourceDefinition,
        metric: &MetricDefinition,
        supported: bool,
        now: Instant,
    ) -> Result<(), ScheduleError> {
        if !supported {
            return Err(ScheduleError::configuration(
                ScheduleKey::new(resource.resource_id.as_str(), metric.metric_name.as_str()),
                format!("not supported by the '{}' collector", resource.resource_type),
            ));
        }
        self.table
            .upsert(&resource.resource_id, &resource.resource_type, metric, now)
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Started { ticket, .. } => self.table.mark_started(&ticket),
            WorkerEvent::Completed {
                ticket,
                outcome,
                finished_at,
                collected_at,
                settled,
                ..
            } => {
                if let Some(report) =
                    self.table
                        .complete(&ticket, outcome, finished_at, collected_at, settled)
                {
                    self.forward(report);
                }
            }
            WorkerEvent::Released {
                ticket,
                finished_at,
            } => self.table.release(&ticket, finished_at),
        }
    }

    fn forward(&self, report: Report) {
        if self.reports.send(report).is_err() {
            warn!("Result reporter is gone; measurement dropped");
        }
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            entries: self.table.snapshot(),
            queue_depth: self.table.queue_depth(),
            in_flight: self.table.in_flight_count(),
            awaiting_pool: self.awaiting_pool.len(),
            workers: self.pool.workers(),
            active_workers: self.pool.active(),
            pool_backlog: self.pool.backlog_len(),
            stats: self.table.stats().clone(),
        }
    }
}
