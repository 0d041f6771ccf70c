// Inventory module - which resources and metrics the agent must collect
//
// The settings document is the inventory authority in a standalone agent.
// Every time it is (re)loaded, the new definitions are compared with the
// ones applied last time and only the differences are pushed into the
// scheduler.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::MonitoringSettings;
use crate::schedule::ScheduleError;
use crate::scheduler::SchedulerHandle;

/// Schedule definition of one metric on a resource
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDefinition {
    pub metric_name: String,
    pub interval: Duration,
    pub enabled: bool,

    /// Delay before the first collection; collect immediately when unset
    pub initial_delay: Option<Duration>,
}

/// A committed resource and the metrics scheduled on it
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDefinition {
    pub resource_id: String,
    pub resource_type: String,
    pub metrics: Vec<MetricDefinition>,
}

/// One inventory notification for the scheduler
#[derive(Debug, Clone, PartialEq)]
pub enum InventoryChange {
    ResourceCommitted(ResourceDefinition),
    MetricScheduleChanged {
        resource_id: String,
        metric_name: String,
        interval: Duration,
        enabled: bool,
    },
    MetricRemoved {
        resource_id: String,
        metric_name: String,
    },
    ResourceRemoved(String),
}

/// Builds resource definitions from a settings document
pub fn definitions_from_settings(settings: &MonitoringSettings) -> Vec<ResourceDefinition> {
    settings
        .resource_settings()
        .into_iter()
        .map(|resource| {
            let metrics = resource
                .metrics
                .iter()
                .map(|(name, metric)| MetricDefinition {
                    metric_name: name.clone(),
                    interval: Duration::from_secs(metric.interval),
                    enabled: metric.enabled,
                    initial_delay: metric.initial_delay_secs.map(Duration::from_secs),
                })
                .collect();

            ResourceDefinition {
                resource_id: resource.resource_id,
                resource_type: resource.resource_type,
                metrics,
            }
        })
        .collect()
}

/// Changes that turn `previous` into `current`
///
/// # Rules
/// - New resources, and resources whose type changed, are committed whole
///   (the latter after being removed)
/// - Metrics added to a known resource are committed with that resource
/// - Interval or enablement changes become schedule changes
/// - Metrics and resources that disappeared are removed
pub fn diff(previous: &[ResourceDefinition], current: &[ResourceDefinition]) -> Vec<InventoryChange> {
    let before: BTreeMap<&str, &ResourceDefinition> = previous
        .iter()
        .map(|r| (r.resource_id.as_str(), r))
        .collect();
    let after: BTreeMap<&str, &ResourceDefinition> = current
        .iter()
        .map(|r| (r.resource_id.as_str(), r))
        .collect();

    let mut changes = Vec::new();

    for (id, old) in &before {
        let replaced = after
            .get(id)
            .is_some_and(|new| new.resource_type != old.resource_type);
        if !after.contains_key(id) || replaced {
            changes.push(InventoryChange::ResourceRemoved(id.to_string()));
        }
    }

    for (id, new) in &after {
        let old = match before.get(id) {
            Some(old) if old.resource_type == new.resource_type => old,
            _ => {
                changes.push(InventoryChange::ResourceCommitted((*new).clone()));
                continue;
            }
        };

        let old_metrics: BTreeMap<&str, &MetricDefinition> = old
            .metrics
            .iter()
            .map(|m| (m.metric_name.as_str(), m))
            .collect();
        let new_names: HashSet<&str> = new.metrics.iter().map(|m| m.metric_name.as_str()).collect();

        let mut added = Vec::new();
        for metric in &new.metrics {
            match old_metrics.get(metric.metric_name.as_str()) {
                None => added.push(metric.clone()),
                Some(prev) if prev.interval != metric.interval || prev.enabled != metric.enabled => {
                    changes.push(InventoryChange::MetricScheduleChanged {
                        resource_id: id.to_string(),
                        metric_name: metric.metric_name.clone(),
                        interval: metric.interval,
                        enabled: metric.enabled,
                    });
                }
                Some(_) => {}
            }
        }
        if !added.is_empty() {
            changes.push(InventoryChange::ResourceCommitted(ResourceDefinition {
                resource_id: id.to_string(),
                resource_type: new.resource_type.clone(),
                metrics: added,
            }));
        }

        for name in old_metrics.keys().filter(|name| !new_names.contains(*name)) {
            changes.push(InventoryChange::MetricRemoved {
                resource_id: id.to_string(),
                metric_name: name.to_string(),
            });
        }
    }

    changes
}

/// Keeps the scheduler in step with the settings document
pub struct InventorySync {
    scheduler: SchedulerHandle,

    /// What the scheduler has accepted so far
    applied: Vec<ResourceDefinition>,
}

impl InventorySync {
    pub fn new(scheduler: SchedulerHandle) -> Self {
        InventorySync {
            scheduler,
            applied: Vec::new(),
        }
    }

    /// Pushes the difference between the accepted inventory and `current`
    /// into the scheduler.
    ///
    /// Only accepted changes are recorded. Rejected metrics are committed
    /// again on the next sync, and a resource whose metrics were only partly
    /// accepted is still removed once it leaves the inventory.
    ///
    /// # Returns
    /// Number of changes the scheduler accepted
    pub async fn apply(&mut self, current: Vec<ResourceDefinition>) -> usize {
        let changes = diff(&self.applied, &current);
        if changes.is_empty() {
            return 0;
        }
        info!("Applying {} inventory change(s)", changes.len());

        let mut accepted = 0;
        for change in changes {
            let resource_id = match &change {
                InventoryChange::ResourceCommitted(r) => r.resource_id.clone(),
                InventoryChange::MetricScheduleChanged { resource_id, .. }
                | InventoryChange::MetricRemoved { resource_id, .. } => resource_id.clone(),
                InventoryChange::ResourceRemoved(id) => id.clone(),
            };

            match self.push(change).await {
                Ok(()) => accepted += 1,
                Err(e) => warn!(resource = %resource_id, "Inventory change rejected: {}", e),
            }
        }
        accepted
    }

    async fn push(&mut self, change: InventoryChange) -> Result<(), ScheduleError> {
        match change {
            InventoryChange::ResourceCommitted(resource) => {
                let outcome = self.scheduler.resource_committed(resource.clone()).await?;
                self.record_committed(resource, &outcome.accepted);
                match outcome.rejected.into_iter().next() {
                    Some(first) => Err(first),
                    None => Ok(()),
                }
            }
            InventoryChange::MetricScheduleChanged {
                resource_id,
                metric_name,
                interval,
                enabled,
            } => {
                self.scheduler
                    .metric_schedule_changed(&resource_id, &metric_name, interval, enabled)
                    .await?;
                if let Some(metric) = self
                    .applied_resource(&resource_id)
                    .and_then(|r| r.metrics.iter_mut().find(|m| m.metric_name == metric_name))
                {
                    metric.interval = interval;
                    metric.enabled = enabled;
                }
                Ok(())
            }
            InventoryChange::MetricRemoved {
                resource_id,
                metric_name,
            } => {
                self.scheduler
                    .metric_removed(&resource_id, &metric_name)
                    .await?;
                if let Some(resource) = self.applied_resource(&resource_id) {
                    resource.metrics.retain(|m| m.metric_name != metric_name);
                }
                Ok(())
            }
            InventoryChange::ResourceRemoved(resource_id) => {
                self.scheduler.resource_removed(&resource_id).await?;
                self.applied.retain(|r| r.resource_id != resource_id);
                Ok(())
            }
        }
    }

    fn applied_resource(&mut self, resource_id: &str) -> Option<&mut ResourceDefinition> {
        self.applied
            .iter_mut()
            .find(|r| r.resource_id == resource_id)
    }

    /// Records the metrics of a commit that the scheduler took
    fn record_committed(&mut self, resource: ResourceDefinition, accepted: &[String]) {
        let index = match self
            .applied
            .iter()
            .position(|r| r.resource_id == resource.resource_id)
        {
            Some(index) => index,
            None => {
                self.applied.push(ResourceDefinition {
                    resource_id: resource.resource_id.clone(),
                    resource_type: resource.resource_type.clone(),
                    metrics: Vec::new(),
                });
                self.applied.len() - 1
            }
        };

        let applied = &mut self.applied[index];
        applied.resource_type = resource.resource_type;
        for metric in resource.metrics {
            if !accepted.contains(&metric.metric_name) {
                continue;
            }
            match applied
                .metrics
                .iter_mut()
                .find(|m| m.metric_name == metric.metric_name)
            {
                Some(existing) => *existing = metric,
                None => applied.metrics.push(metric),
            }
        }
    }

    #[cfg(test)]
    pub fn applied(&self) -> &[ResourceDefinition] {
        &self.applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CollectorRegistry;
    use crate::policy::LateReschedulePolicy;
    use crate::pool::PoolConfig;
    use crate::scheduler::{MeasurementScheduler, SchedulerConfig};
    use crate::sink::spawn_reporter;
    use crate::testing::{RecordingSink, ScriptedCollector};
    use std::sync::Arc;

    fn metric(name: &str, interval: u64, enabled: bool) -> MetricDefinition {
        MetricDefinition {
            metric_name: name.to_string(),
            interval: Duration::from_secs(interval),
            enabled,
            initial_delay: None,
        }
    }

    fn resource(id: &str, kind: &str, metrics: Vec<MetricDefinition>) -> ResourceDefinition {
        ResourceDefinition {
            resource_id: id.to_string(),
            resource_type: kind.to_string(),
            metrics,
        }
    }

    #[test]
    fn test_first_sync_commits_everything() {
        let current = vec![
            resource("host", "platform", vec![metric("Memory", 30, true)]),
            resource("docker", "docker", vec![metric("DockerStats", 60, true)]),
        ];

        let changes = diff(&[], &current);
        assert_eq!(changes.len(), 2);
        assert!(changes
            .iter()
            .all(|c| matches!(c, InventoryChange::ResourceCommitted(_))));
    }

    #[test]
    fn test_unchanged_inventory_yields_nothing() {
        let current = vec![resource("host", "platform", vec![metric("Memory", 30, true)])];
        assert!(diff(&current, &current).is_empty());
    }

    #[test]
    fn test_metric_level_changes() {
        let previous = vec![resource(
            "host",
            "platform",
            vec![
                metric("Memory", 30, true),
                metric("DiskSpace", 300, true),
                metric("LoadAverage", 30, true),
            ],
        )];
        let current = vec![resource(
            "host",
            "platform",
            vec![
                metric("Memory", 60, true),
                metric("DiskSpace", 300, false),
                metric("Swap", 30, true),
            ],
        )];

        let changes = diff(&previous, &current);

        assert!(changes.contains(&InventoryChange::MetricScheduleChanged {
            resource_id: "host".into(),
            metric_name: "Memory".into(),
            interval: Duration::from_secs(60),
            enabled: true,
        }));
        assert!(changes.contains(&InventoryChange::MetricScheduleChanged {
            resource_id: "host".into(),
            metric_name: "DiskSpace".into(),
            interval: Duration::from_secs(300),
            enabled: false,
        }));
        assert!(changes.contains(&InventoryChange::ResourceCommitted(resource(
            "host",
            "platform",
            vec![metric("Swap", 30, true)]
        ))));
        assert!(changes.contains(&InventoryChange::MetricRemoved {
            resource_id: "host".into(),
            metric_name: "LoadAverage".into(),
        }));
        assert_eq!(changes.len(), 4);
    }

    #[test]
    fn test_removed_and_retyped_resources() {
        let previous = vec![
            resource("a", "platform", vec![metric("Memory", 30, true)]),
            resource("b", "platform", vec![metric("Memory", 30, true)]),
        ];
        let current = vec![resource("b", "docker", vec![metric("DockerStats", 30, true)])];

        let changes = diff(&previous, &current);

        assert_eq!(
            changes,
            vec![
                InventoryChange::ResourceRemoved("a".into()),
                InventoryChange::ResourceRemoved("b".into()),
                InventoryChange::ResourceCommitted(current[0].clone()),
            ]
        );
    }

    fn start() -> SchedulerHandle {
        let mut registry = CollectorRegistry::new();
        registry.register(Arc::new(
            ScriptedCollector::new(Duration::from_secs(1)).without_metric("Bogus"),
        ));
        let (reports, _reporter) = spawn_reporter(Arc::new(RecordingSink::default()));
        let config = SchedulerConfig {
            pool: PoolConfig {
                workers: 2,
                backlog: 4,
                collection_timeout: Duration::from_secs(60),
            },
            policy: LateReschedulePolicy::default(),
            min_interval: Duration::from_secs(1),
            dispatch_retry: Duration::from_millis(250),
        };
        let (handle, _task) = MeasurementScheduler::spawn(config, registry, reports);
        handle
    }

    #[tokio::test(start_paused = true)]
    async fn test_partly_rejected_resource_is_removed_later() {
        let scheduler = start();
        let mut inventory = InventorySync::new(scheduler.clone());

        let current = vec![resource(
            "x",
            "scripted",
            vec![metric("Memory", 30, true), metric("Bogus", 30, true)],
        )];
        assert_eq!(inventory.apply(current.clone()).await, 0);
        assert_eq!(scheduler.snapshot().await.unwrap().entries.len(), 1);
        assert_eq!(
            inventory.applied(),
            &[resource("x", "scripted", vec![metric("Memory", 30, true)])]
        );

        // the rejected metric is retried, the accepted one left alone
        assert_eq!(inventory.apply(current).await, 0);
        assert_eq!(scheduler.snapshot().await.unwrap().entries.len(), 1);

        assert_eq!(inventory.apply(vec![]).await, 1);
        // the first collection is still running and settles after 1s
        tokio::time::sleep(Duration::from_secs(2)).await;
        let snapshot = scheduler.snapshot().await.unwrap();
        assert!(snapshot.entries.is_empty());
        assert!(inventory.applied().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_schedule_change_keeps_accepted_definition() {
        let scheduler = start();
        let mut inventory = InventorySync::new(scheduler.clone());

        let accepted = vec![resource("x", "scripted", vec![metric("Memory", 30, true)])];
        assert_eq!(inventory.apply(accepted.clone()).await, 1);

        // a zero interval is refused; the 30s schedule stays in force
        let refused = vec![resource("x", "scripted", vec![metric("Memory", 0, true)])];
        assert_eq!(inventory.apply(refused).await, 0);
        assert_eq!(inventory.applied(), accepted.as_slice());

        let snapshot = scheduler.snapshot().await.unwrap();
        assert_eq!(snapshot.entries[0].interval, Duration::from_secs(30));

        let disabled = vec![resource("x", "scripted", vec![metric("Memory", 30, false)])];
        assert_eq!(inventory.apply(disabled.clone()).await, 1);
        assert_eq!(inventory.applied(), disabled.as_slice());
    }
}
