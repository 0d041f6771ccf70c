// Metrics module - the collector plugin seam
//
// A Collector reads metrics for one resource type. The scheduler never calls
// collectors directly; it resolves them through the CollectorRegistry and
// hands them to the worker pool together with the trigger being served.

use async_trait::async_trait;
use bson::{Bson, Document};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub mod docker;
pub mod platform;

/// Failure reported by a collector for a single read
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollectError {
    /// The managed resource could not be reached
    #[error("resource unavailable: {0}")]
    Unavailable(String),

    #[error("unsupported metric '{0}'")]
    UnsupportedMetric(String),

    #[error("collection failed: {0}")]
    Failed(String),
}

/// A single collected measurement
#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementValue {
    Numeric(f64),
    /// Slowly changing string property (version, state, ...)
    Trait(String),
    /// Structured measurement with several fields
    Document(Document),
}

impl MeasurementValue {
    pub fn to_bson(&self) -> Bson {
        match self {
            MeasurementValue::Numeric(value) => Bson::Double(*value),
            MeasurementValue::Trait(value) => Bson::String(value.clone()),
            MeasurementValue::Document(doc) => Bson::Document(doc.clone()),
        }
    }

    /// Short form for log lines
    pub fn summary(&self) -> String {
        match self {
            MeasurementValue::Numeric(value) => format!("{value:.2}"),
            MeasurementValue::Trait(value) => value.clone(),
            MeasurementValue::Document(doc) => format!("document with {} field(s)", doc.len()),
        }
    }
}

/// Reads metrics for one resource type.
///
/// Implementations must be safe to call concurrently for different
/// resources; the scheduler guarantees a single outstanding call per
/// (resource, metric) pair.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Resource type this collector serves (e.g. "platform", "docker")
    fn resource_type(&self) -> &str;

    /// Whether `metric_name` can be collected at all. Checked when the
    /// inventory commits a schedule, so unknown metrics are rejected early.
    fn supports(&self, _metric_name: &str) -> bool {
        true
    }

    async fn collect(
        &self,
        resource_id: &str,
        metric_name: &str,
    ) -> Result<MeasurementValue, CollectError>;
}

/// Collectors keyed by resource type
#[derive(Default, Clone)]
pub struct CollectorRegistry {
    collectors: HashMap<String, Arc<dyn Collector>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a collector, replacing any previous one for the same type
    pub fn register(&mut self, collector: Arc<dyn Collector>) {
        self.collectors
            .insert(collector.resource_type().to_string(), collector);
    }

    pub fn get(&self, resource_type: &str) -> Option<Arc<dyn Collector>> {
        self.collectors.get(resource_type).cloned()
    }

    pub fn resource_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.collectors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }
}

/// Registry with every built-in collector.
///
/// To add a resource type, implement `Collector` in a new module and
/// register it here.
pub fn create_default_registry() -> CollectorRegistry {
    let mut registry = CollectorRegistry::new();

    // Load average, memory and disk space of the local machine
    registry.register(Arc::new(platform::PlatformCollector::new()));

    // Container statistics from the local Docker daemon
    registry.register(Arc::new(docker::DockerCollector::new()));

    registry
}
