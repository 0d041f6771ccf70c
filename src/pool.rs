// Collection worker pool - bounded concurrent execution of collectors
//
// # Architecture
// - `submit` only places a job on a bounded backlog channel and returns
// - A feeder task takes jobs off the backlog, waits for one of `workers`
//   semaphore permits and spawns the job
// - Every job reports back to the scheduler over the event channel; the
//   pool never touches scheduling state
//
// A job that outlives the collection timeout gives its permit back and is
// reported as failed, but its collection body keeps running. A `Released`
// event follows once the body actually returns.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::metrics::{Collector, MeasurementValue};
use crate::schedule::ScheduleKey;
use crate::sink::CollectionFailure;

/// Pool sizing and deadlines
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Maximum number of collections running at once
    pub workers: usize,

    /// Jobs accepted beyond the running ones before `submit` refuses
    pub backlog: usize,

    /// How long a single collection may run before it is reported as failed
    pub collection_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            workers: num_cpus::get().max(2),
            backlog: 64,
            collection_timeout: Duration::from_secs(120),
        }
    }
}

/// Immutable description of one dispatched trigger
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionTicket {
    pub key: ScheduleKey,
    pub resource_type: String,

    /// Distinguishes this trigger from earlier and later ones of the entry
    pub trigger_seq: u64,

    /// Nominal trigger time
    pub triggered_at: Instant,
}

/// Progress reported by the pool
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A worker picked the job up
    Started {
        ticket: CollectionTicket,
        at: Instant,
    },

    /// Sent exactly once per submitted job
    Completed {
        ticket: CollectionTicket,
        outcome: Result<MeasurementValue, CollectionFailure>,
        started_at: Instant,
        finished_at: Instant,
        collected_at: DateTime<Utc>,
        /// False when the job timed out and its body is still running
        settled: bool,
    },

    /// A timed-out collection body has finally returned
    Released {
        ticket: CollectionTicket,
        finished_at: Instant,
    },
}

/// Why a job was not accepted. The ticket is handed back to the caller.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("collection backlog is full")]
    Saturated(CollectionTicket),

    #[error("collection pool is shut down")]
    Closed(CollectionTicket),
}

impl SubmitError {
    pub fn into_ticket(self) -> CollectionTicket {
        match self {
            SubmitError::Saturated(ticket) | SubmitError::Closed(ticket) => ticket,
        }
    }
}

struct Job {
    ticket: CollectionTicket,
    collector: Arc<dyn Collector>,
}

/// Bounded pool of collection workers
pub struct CollectionWorkerPool {
    backlog: mpsc::Sender<Job>,
    permits: Arc<Semaphore>,
    workers: usize,
    feeder: JoinHandle<()>,
}

impl CollectionWorkerPool {
    /// Starts the pool. Must be called inside a Tokio runtime.
    pub fn start(config: PoolConfig, events: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        let workers = config.workers.max(1);
        let (backlog, jobs) = mpsc::channel(config.backlog.max(1));
        let permits = Arc::new(Semaphore::new(workers));

        let feeder = tokio::spawn(Self::feed(
            jobs,
            Arc::clone(&permits),
            events,
            config.collection_timeout,
        ));

        CollectionWorkerPool {
            backlog,
            permits,
            workers,
            feeder,
        }
    }

    /// Hands a job to the pool without waiting
    pub fn submit(
        &self,
        ticket: CollectionTicket,
        collector: Arc<dyn Collector>,
    ) -> Result<(), SubmitError> {
        use mpsc::error::TrySendError;

        self.backlog
            .try_send(Job { ticket, collector })
            .map_err(|e| match e {
                TrySendError::Full(job) => SubmitError::Saturated(job.ticket),
                TrySendError::Closed(job) => SubmitError::Closed(job.ticket),
            })
    }

    /// Collections currently holding a worker slot
    pub fn active(&self) -> usize {
        self.workers - self.permits.available_permits()
    }

    /// Jobs accepted but not yet started
    pub fn backlog_len(&self) -> usize {
        self.backlog.max_capacity() - self.backlog.capacity()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Stops accepting work. Running collections are left to finish on
    /// their own; their events are discarded.
    pub fn shutdown(&self) {
        self.permits.close();
        self.feeder.abort();
    }

    async fn feed(
        mut jobs: mpsc::Receiver<Job>,
        permits: Arc<Semaphore>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        timeout: Duration,
    ) {
        while let Some(job) = jobs.recv().await {
            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            tokio::spawn(run_job(job, permit, events.clone(), timeout));
        }
        debug!("Collection pool feeder stopped");
    }
}

impl Drop for CollectionWorkerPool {
    fn drop(&mut self) {
        self.feeder.abort();
    }
}

async fn run_job(
    job: Job,
    permit: OwnedSemaphorePermit,
    events: mpsc::UnboundedSender<WorkerEvent>,
    timeout: Duration,
) {
    let Job { ticket, collector } = job;
    let started_at = Instant::now();

    let _ = events.send(WorkerEvent::Started {
        ticket: ticket.clone(),
        at: started_at,
    });

    // The body runs as its own task so it can outlive the timeout
    let key = ticket.key.clone();
    let mut body = tokio::spawn(async move {
        collector
            .collect(&key.resource_id, &key.metric_name)
            .await
    });

    match tokio::time::timeout(timeout, &mut body).await {
        Ok(joined) => {
            let outcome = match joined {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(CollectionFailure::Error(e.to_string())),
                Err(e) => {
                    error!(key = %ticket.key, "Collector task failed: {}", e);
                    Err(CollectionFailure::Error(format!("collector aborted: {e}")))
                }
            };
            drop(permit);

            let _ = events.send(WorkerEvent::Completed {
                ticket,
                outcome,
                started_at,
                finished_at: Instant::now(),
                collected_at: Utc::now(),
                settled: true,
            });
        }
        Err(_) => {
            warn!(
                key = %ticket.key,
                timeout_ms = timeout.as_millis() as u64,
                "Collection exceeded its deadline; abandoning it"
            );
            drop(permit);

            let _ = events.send(WorkerEvent::Completed {
                ticket: ticket.clone(),
                outcome: Err(CollectionFailure::Timeout(timeout)),
                started_at,
                finished_at: Instant::now(),
                collected_at: Utc::now(),
                settled: false,
            });

            let _ = body.await;
            debug!(key = %ticket.key, "Abandoned collection returned");
            let _ = events.send(WorkerEvent::Released {
                ticket,
                finished_at: Instant::now(),
            });
        }
    }
}
