// Result sink module - where finished measurements go
//
// The scheduler never awaits a sink. Outcomes are queued as Reports on an
// unbounded channel and a reporter task forwards them in order, so a slow
// database never holds up the control loop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::MeasurementValue;
use crate::schedule::ScheduleKey;

/// Why a collection produced no value
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollectionFailure {
    /// The pool stopped waiting for the collector
    #[error("collection timed out after {0:?}")]
    Timeout(Duration),

    /// The collector reported a failure
    #[error("{0}")]
    Error(String),
}

impl CollectionFailure {
    /// Stable name of the failure kind
    pub fn kind(&self) -> &'static str {
        match self {
            CollectionFailure::Timeout(_) => "timeout",
            CollectionFailure::Error(_) => "error",
        }
    }
}

/// Receives measurement outcomes.
///
/// Delivery is at least once: after a restart the same measurement may be
/// reported again, so implementations must tolerate duplicates. Sinks
/// handle their own I/O errors; nothing is returned to the scheduler.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn report_success(
        &self,
        key: &ScheduleKey,
        value: &MeasurementValue,
        collected_at: DateTime<Utc>,
    );

    async fn report_failure(
        &self,
        key: &ScheduleKey,
        failure: &CollectionFailure,
        collected_at: DateTime<Utc>,
    );
}

/// Outcome of one collection, queued for the sink
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    Success {
        key: ScheduleKey,
        value: MeasurementValue,
        collected_at: DateTime<Utc>,
    },
    Failure {
        key: ScheduleKey,
        failure: CollectionFailure,
        collected_at: DateTime<Utc>,
    },
}

impl Report {
    pub fn from_outcome(
        key: ScheduleKey,
        outcome: Result<MeasurementValue, CollectionFailure>,
        collected_at: DateTime<Utc>,
    ) -> Self {
        match outcome {
            Ok(value) => Report::Success {
                key,
                value,
                collected_at,
            },
            Err(failure) => Report::Failure {
                key,
                failure,
                collected_at,
            },
        }
    }

    #[cfg(test)]
    pub fn key(&self) -> &ScheduleKey {
        match self {
            Report::Success { key, .. } | Report::Failure { key, .. } => key,
        }
    }

    #[cfg(test)]
    pub fn is_success(&self) -> bool {
        matches!(self, Report::Success { .. })
    }

    async fn deliver(&self, sink: &dyn ResultSink) {
        match self {
            Report::Success {
                key,
                value,
                collected_at,
            } => sink.report_success(key, value, *collected_at).await,
            Report::Failure {
                key,
                failure,
                collected_at,
            } => sink.report_failure(key, failure, *collected_at).await,
        }
    }
}

pub type ReportSender = mpsc::UnboundedSender<Report>;

/// Starts the task that forwards reports to `sink`.
///
/// The task ends once every sender is dropped and the queue is drained,
/// returning the number of reports delivered.
pub fn spawn_reporter(sink: Arc<dyn ResultSink>) -> (ReportSender, JoinHandle<u64>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Report>();

    let handle = tokio::spawn(async move {
        let mut delivered = 0u64;
        while let Some(report) = rx.recv().await {
            report.deliver(sink.as_ref()).await;
            delivered += 1;
        }
        debug!("Reporter drained after {} report(s)", delivered);
        delivered
    });

    (tx, handle)
}

/// Sink that only logs outcomes. Used when no database is configured.
pub struct LoggingSink;

#[async_trait]
impl ResultSink for LoggingSink {
    async fn report_success(
        &self,
        key: &ScheduleKey,
        value: &MeasurementValue,
        collected_at: DateTime<Utc>,
    ) {
        info!(
            resource = %key.resource_id,
            metric = %key.metric_name,
            collected_at = %collected_at.to_rfc3339(),
            "Measurement: {}",
            value.summary()
        );
    }

    async fn report_failure(
        &self,
        key: &ScheduleKey,
        failure: &CollectionFailure,
        collected_at: DateTime<Utc>,
    ) {
        warn!(
            resource = %key.resource_id,
            metric = %key.metric_name,
            kind = failure.kind(),
            collected_at = %collected_at.to_rfc3339(),
            "Measurement failed: {}",
            failure
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;

    #[test]
    fn test_failure_kinds() {
        assert_eq!(CollectionFailure::Timeout(Duration::from_secs(5)).kind(), "timeout");
        assert_eq!(CollectionFailure::Error("refused".into()).kind(), "error");
    }

    #[tokio::test]
    async fn test_reporter_forwards_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, handle) = spawn_reporter(sink.clone());
        let key = ScheduleKey::new("db-1", "Connections");

        tx.send(Report::from_outcome(
            key.clone(),
            Ok(MeasurementValue::Numeric(12.0)),
            Utc::now(),
        ))
        .unwrap();
        tx.send(Report::from_outcome(
            key.clone(),
            Err(CollectionFailure::Error("refused".into())),
            Utc::now(),
        ))
        .unwrap();
        drop(tx);

        assert_eq!(handle.await.unwrap(), 2);

        let reports = sink.reports();
        assert_eq!(reports.len(), 2);
        assert!(reports[0].is_success());
        assert!(!reports[1].is_success());
        assert_eq!(reports[1].key(), &key);
    }
}
