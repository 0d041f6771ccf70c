// Test doubles shared by the unit tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::metrics::{CollectError, Collector, MeasurementValue};
use crate::schedule::ScheduleKey;
use crate::sink::{CollectionFailure, Report, ResultSink};

/// Sink that keeps every report in memory
#[derive(Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<Report>>,
}

impl RecordingSink {
    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn report_success(
        &self,
        key: &ScheduleKey,
        value: &MeasurementValue,
        collected_at: DateTime<Utc>,
    ) {
        self.reports.lock().unwrap().push(Report::Success {
            key: key.clone(),
            value: value.clone(),
            collected_at,
        });
    }

    async fn report_failure(
        &self,
        key: &ScheduleKey,
        failure: &CollectionFailure,
        collected_at: DateTime<Utc>,
    ) {
        self.reports.lock().unwrap().push(Report::Failure {
            key: key.clone(),
            failure: failure.clone(),
            collected_at,
        });
    }
}

#[derive(Default)]
struct Activity {
    starts: HashMap<ScheduleKey, Vec<Instant>>,
    running: HashMap<ScheduleKey, usize>,
    active: usize,
    max_active: usize,
    max_per_key: usize,
}

/// Collector for resource type "scripted" that sleeps, then answers.
///
/// Records when each collection started and how many ran at once, overall
/// and per schedule key.
pub struct ScriptedCollector {
    delay: Duration,
    delays: HashMap<String, Duration>,
    unsupported: HashSet<String>,
    failing: bool,
    activity: Mutex<Activity>,
}

impl ScriptedCollector {
    pub fn new(delay: Duration) -> Self {
        ScriptedCollector {
            delay,
            delays: HashMap::new(),
            unsupported: HashSet::new(),
            failing: false,
            activity: Mutex::new(Activity::default()),
        }
    }

    /// Every collection fails after `delay`
    pub fn failing(delay: Duration) -> Self {
        ScriptedCollector {
            failing: true,
            ..Self::new(delay)
        }
    }

    pub fn with_metric_delay(mut self, metric_name: &str, delay: Duration) -> Self {
        self.delays.insert(metric_name.to_string(), delay);
        self
    }

    pub fn without_metric(mut self, metric_name: &str) -> Self {
        self.unsupported.insert(metric_name.to_string());
        self
    }

    /// Start instants of a key, oldest first
    pub fn starts(&self, key: &ScheduleKey) -> Vec<Instant> {
        let activity = self.activity.lock().unwrap();
        activity.starts.get(key).cloned().unwrap_or_default()
    }

    pub fn max_active(&self) -> usize {
        self.activity.lock().unwrap().max_active
    }

    pub fn max_per_key(&self) -> usize {
        self.activity.lock().unwrap().max_per_key
    }
}

#[async_trait]
impl Collector for ScriptedCollector {
    fn resource_type(&self) -> &str {
        "scripted"
    }

    fn supports(&self, metric_name: &str) -> bool {
        !self.unsupported.contains(metric_name)
    }

    async fn collect(
        &self,
        resource_id: &str,
        metric_name: &str,
    ) -> Result<MeasurementValue, CollectError> {
        let key = ScheduleKey::new(resource_id, metric_name);
        {
            let mut activity = self.activity.lock().unwrap();
            activity
                .starts
                .entry(key.clone())
                .or_default()
                .push(Instant::now());
            activity.active += 1;
            activity.max_active = activity.max_active.max(activity.active);
            let running = activity.running.entry(key.clone()).or_default();
            *running += 1;
            let running = *running;
            activity.max_per_key = activity.max_per_key.max(running);
        }

        let delay = self.delays.get(metric_name).copied().unwrap_or(self.delay);
        tokio::time::sleep(delay).await;

        {
            let mut activity = self.activity.lock().unwrap();
            activity.active -= 1;
            if let Some(running) = activity.running.get_mut(&key) {
                *running -= 1;
            }
        }

        if self.failing {
            Err(CollectError::Failed(format!("{resource_id}/{metric_name} refused")))
        } else {
            Ok(MeasurementValue::Numeric(delay.as_secs_f64()))
        }
    }
}
