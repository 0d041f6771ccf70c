// Configuration module - handles settings retrieval and scheduler tuning
//
// This module is responsible for:
// 1. Connecting to MongoDB and fetching the node's MonitoringSettings document
// 2. Alternatively reading the same document from a local JSON file
// 3. Filling in scheduler defaults for everything the document leaves out
// 4. Mapping the legacy per-node `metric_settings` format onto resources

use mongodb::{Client, Collection, Database};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::metrics::docker::{ALL_CONTAINERS, CONTAINER_COUNT, DOCKER_STATS};
use crate::policy::LateReschedulePolicy;
use crate::pool::PoolConfig;
use crate::scheduler::SchedulerConfig;

/// Collection used when a metric does not name one
pub const DEFAULT_COLLECTION: &str = "measurements";

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("MongoDB connection failed: {0}")]
    MongoConnectionError(#[from] mongodb::error::Error),

    #[error("Settings document not found for key: {0}")]
    SettingsNotFound(String),

    #[error("Cannot read settings file {path}: {source}")]
    FileError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings format: {0}")]
    InvalidSettings(String),
}

/// Main configuration structure
///
/// This structure represents a document in the MonitoringSettings collection
/// (or a JSON settings file of the same shape). Each node has its own
/// document identified by the key.
///
/// # Example Document
/// ```json
/// {
///   "key": "1111-1111",
///   "scheduler": { "workers": 4, "collection_timeout_secs": 60 },
///   "resources": [
///     {
///       "resource_id": "web-1",
///       "resource_type": "platform",
///       "metrics": {
///         "Memory": { "interval": 30, "collection": "memory_metrics" },
///         "DiskSpace": { "interval": 300, "enabled": false }
///       }
///     }
///   ],
///   "metric_settings": {
///     "LoadAverage": { "timeout": 30, "collection": "load_average_metrics" },
///     "DockerStats": { "timeout": 60, "collection": "docker_metrics" }
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSettings {
    /// Unique identifier for this configuration (e.g., "1111-1111")
    /// Also used as the node identifier in measurement documents
    pub key: String,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// Resources and the metrics scheduled on them
    #[serde(default)]
    pub resources: Vec<ResourceSettings>,

    /// Legacy per-node format: metric name to settings, collected on this host
    #[serde(default)]
    pub metric_settings: HashMap<String, MetricSettings>,
}

/// Scheduler tuning. Every field is optional in the document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Concurrent collections; defaults to the number of CPUs (at least 2)
    pub workers: Option<usize>,
    pub backlog: usize,

    /// Per-collection timeout, at least 1s
    pub collection_timeout_secs: u64,
    pub min_interval_secs: u64,
    pub late_penalty_intervals: u32,
    pub late_penalty_buffer_ms: u64,
    pub dispatch_retry_ms: u64,

    /// Settings reload period, 0 disables reloading
    pub inventory_refresh_secs: u64,

    /// Status log period, 0 disables the status line
    pub status_log_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            workers: None,
            backlog: 64,
            collection_timeout_secs: 120,
            min_interval_secs: 30,
            late_penalty_intervals: 1,
            late_penalty_buffer_ms: 1000,
            dispatch_retry_ms: 250,
            inventory_refresh_secs: 300,
            status_log_secs: 60,
        }
    }
}

impl SchedulerSettings {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            pool: PoolConfig {
                workers: self
                    .workers
                    .map_or_else(|| num_cpus::get().max(2), |workers| workers.max(1)),
                backlog: self.backlog.max(1),
                collection_timeout: Duration::from_secs(self.collection_timeout_secs.max(1)),
            },
            policy: LateReschedulePolicy::new(
                self.late_penalty_intervals,
                Duration::from_millis(self.late_penalty_buffer_ms),
            ),
            min_interval: Duration::from_secs(self.min_interval_secs),
            dispatch_retry: Duration::from_millis(self.dispatch_retry_ms.max(1)),
        }
    }

    pub fn inventory_refresh(&self) -> Option<Duration> {
        (self.inventory_refresh_secs > 0).then(|| Duration::from_secs(self.inventory_refresh_secs))
    }

    pub fn status_log_interval(&self) -> Option<Duration> {
        (self.status_log_secs > 0).then(|| Duration::from_secs(self.status_log_secs))
    }
}

/// One managed resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSettings {
    pub resource_id: String,
    pub resource_type: String,

    /// Metric name to its schedule
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricSettings>,
}

/// Settings for an individual metric
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSettings {
    /// Collection interval in seconds
    /// `timeout` is the name the legacy format used for it
    #[serde(alias = "timeout")]
    pub interval: u64,

    /// Name of the MongoDB collection where this metric's data is stored
    #[serde(default = "default_collection")]
    pub collection: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Delay before the first collection after the metric is scheduled
    #[serde(default)]
    pub initial_delay_secs: Option<u64>,
}

fn default_collection() -> String {
    DEFAULT_COLLECTION.to_string()
}

fn default_enabled() -> bool {
    true
}

impl MonitoringSettings {
    /// All resources, including the ones derived from `metric_settings`
    ///
    /// Legacy metrics land on a `platform` resource named after the node key,
    /// except container metrics, which go to a `docker` resource covering all
    /// containers. Explicit resources with the same id take precedence.
    pub fn resource_settings(&self) -> Vec<ResourceSettings> {
        let mut resources = self.resources.clone();

        let mut platform = BTreeMap::new();
        let mut docker = BTreeMap::new();
        for (name, metric) in &self.metric_settings {
            if name == DOCKER_STATS || name == CONTAINER_COUNT {
                docker.insert(name.clone(), metric.clone());
            } else {
                platform.insert(name.clone(), metric.clone());
            }
        }

        for (resource_id, resource_type, metrics) in [
            (self.key.as_str(), "platform", platform),
            (ALL_CONTAINERS, "docker", docker),
        ] {
            if metrics.is_empty() {
                continue;
            }
            if resources.iter().any(|r| r.resource_id == resource_id) {
                warn!(
                    "Legacy metric_settings ignored for '{}': resource is defined explicitly",
                    resource_id
                );
                continue;
            }
            resources.push(ResourceSettings {
                resource_id: resource_id.to_string(),
                resource_type: resource_type.to_string(),
                metrics,
            });
        }

        resources
    }

    /// Metric name to the collection its measurements are stored in
    pub fn collection_routes(&self) -> HashMap<String, String> {
        self.resource_settings()
            .into_iter()
            .flat_map(|resource| resource.metrics.into_iter())
            .map(|(name, metric)| (name, metric.collection))
            .collect()
    }

    fn log_summary(&self) {
        let resources = self.resource_settings();
        info!(
            "Settings contain {} resource(s) with {} metric schedule(s)",
            resources.len(),
            resources.iter().map(|r| r.metrics.len()).sum::<usize>()
        );

        // Log each metric's configuration for visibility
        for resource in &resources {
            for (metric_name, metric) in &resource.metrics {
                info!(
                    "  {}/{} ({}) - Collection: '{}', Interval: {}s{}",
                    resource.resource_id,
                    metric_name,
                    resource.resource_type,
                    metric.collection,
                    metric.interval,
                    if metric.enabled { "" } else { ", disabled" }
                );
            }
        }
    }
}

/// Reads a settings document from a JSON file
///
/// # Arguments
/// * `path` - Path of the JSON file
///
/// # Returns
/// * `Ok(MonitoringSettings)` - Successfully parsed settings
/// * `Err(ConfigError)` - File unreadable or not a settings document
pub fn load_settings_from_file(path: &Path) -> Result<MonitoringSettings, ConfigError> {
    info!("Loading monitoring settings from file: {}", path.display());

    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::FileError {
        path: path.display().to_string(),
        source,
    })?;
    let settings: MonitoringSettings =
        serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidSettings(e.to_string()))?;

    settings.log_summary();
    Ok(settings)
}

/// Configuration manager for the measurement agent
///
/// Handles MongoDB connection and settings retrieval.
pub struct ConfigManager {
    /// MongoDB client instance
    client: Client,

    /// Database name where MonitoringSettings collection resides
    database_name: String,
}

impl ConfigManager {
    /// Creates a new ConfigManager and establishes MongoDB connection
    ///
    /// # Arguments
    /// * `connection_string` - MongoDB connection URI (e.g., "mongodb://localhost:27017")
    /// * `database_name` - Name of the database to use (optional, defaults to "monitoring")
    ///
    /// # Returns
    /// * `Ok(ConfigManager)` - Successfully connected to MongoDB
    /// * `Err(ConfigError)` - Connection failed
    pub async fn new(
        connection_string: &str,
        database_name: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let client = Client::with_uri_str(connection_string).await?;

        // Verify connection by listing databases (lightweight operation)
        match client.list_database_names(None, None).await {
            Ok(_) => info!("Successfully connected to MongoDB"),
            Err(e) => {
                warn!("MongoDB connection verification failed: {}", e);
                return Err(ConfigError::MongoConnectionError(e));
            }
        }

        let database_name = database_name.unwrap_or("monitoring").to_string();

        Ok(ConfigManager {
            client,
            database_name,
        })
    }

    fn get_database(&self) -> Database {
        self.client.database(&self.database_name)
    }

    /// Fetches monitoring settings from MongoDB for a specific key
    ///
    /// # Arguments
    /// * `key` - The configuration key (e.g., "1111-1111")
    ///
    /// # Returns
    /// * `Ok(MonitoringSettings)` - Successfully loaded settings
    /// * `Err(ConfigError)` - Settings not found or invalid
    ///
    /// # MongoDB Query
    /// Executes: `db.MonitoringSettings.findOne({ key: "<key>" })`
    pub async fn load_settings(&self, key: &str) -> Result<MonitoringSettings, ConfigError> {
        info!("Loading monitoring settings for key: {}", key);

        let collection: Collection<MonitoringSettings> =
            self.get_database().collection("MonitoringSettings");
        let filter = mongodb::bson::doc! { "key": key };

        match collection.find_one(filter, None).await? {
            Some(settings) => {
                settings.log_summary();
                Ok(settings)
            }
            None => {
                warn!("No settings found for key: {}", key);
                Err(ConfigError::SettingsNotFound(key.to_string()))
            }
        }
    }

    /// Returns a reference to the MongoDB client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Where the settings document is (re)loaded from
pub enum SettingsSource {
    Mongo { manager: ConfigManager, key: String },
    File(PathBuf),
}

impl SettingsSource {
    pub async fn load(&self) -> Result<MonitoringSettings, ConfigError> {
        match self {
            SettingsSource::Mongo { manager, key } => manager.load_settings(key).await,
            SettingsSource::File(path) => load_settings_from_file(path),
        }
    }
}
