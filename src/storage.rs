// Storage module - persists measurement reports to MongoDB
//
// This module is responsible for:
// 1. Turning each report into one MongoDB document
// 2. Routing the document to the collection configured for its metric
// 3. Handling insert errors without ever failing the caller

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use mongodb::{Client, Collection};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::config::DEFAULT_COLLECTION;
use crate::metrics::MeasurementValue;
use crate::schedule::ScheduleKey;
use crate::sink::{CollectionFailure, ResultSink};

/// Errors that can occur during measurement storage
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("MongoDB operation failed: {0}")]
    InsertError(#[from] mongodb::error::Error),
}

/// Builds the stored form of one measurement outcome
///
/// Document measurements are flattened into the top level, the way the
/// agent has always stored them; scalar measurements go under `value`.
/// Failures carry `status` (`timeout` or `error`) and the error message.
pub fn measurement_document(
    node: &str,
    key: &ScheduleKey,
    outcome: Result<&MeasurementValue, &CollectionFailure>,
    collected_at: DateTime<Utc>,
) -> Document {
    let mut document = doc! {
        "node": node,
        "resource": key.resource_id.as_str(),
        "metric": key.metric_name.as_str(),
        "timestamp": bson::DateTime::from_chrono(collected_at),
    };

    match outcome {
        Ok(MeasurementValue::Document(fields)) => {
            document.insert("status", "ok");
            for (name, value) in fields {
                // identity fields are never overwritten by measurement data
                if !document.contains_key(name) {
                    document.insert(name.clone(), value.clone());
                }
            }
        }
        Ok(value) => {
            document.insert("status", "ok");
            document.insert("value", value.to_bson());
        }
        Err(failure) => {
            document.insert("status", failure.kind());
            document.insert("error", failure.to_string());
            if let CollectionFailure::Timeout(timeout) = failure {
                document.insert("timeout_ms", Bson::Int64(timeout.as_millis() as i64));
            }
        }
    }

    document
}

/// Result sink writing to MongoDB
///
/// Each metric is stored in the collection named by its settings; metrics
/// without a route go to the default collection.
pub struct MongoResultSink {
    /// MongoDB client for database operations
    client: Client,

    /// Database name where measurements are stored
    database_name: String,

    /// Node identifier written into every document
    node: String,

    /// Metric name to collection name
    routes: RwLock<HashMap<String, String>>,
}

impl MongoResultSink {
    /// Creates a new MongoResultSink
    ///
    /// # Arguments
    /// * `client` - MongoDB client (shared with the ConfigManager)
    /// * `database_name` - Name of the database where measurements will be stored
    /// * `node` - Node identifier (the settings key)
    /// * `routes` - Metric name to collection name
    pub fn new(
        client: &Client,
        database_name: &str,
        node: &str,
        routes: HashMap<String, String>,
    ) -> Self {
        MongoResultSink {
            client: client.clone(),
            database_name: database_name.to_string(),
            node: node.to_string(),
            routes: RwLock::new(routes),
        }
    }

    /// Replaces the metric routes after a settings reload
    pub async fn update_routes(&self, routes: HashMap<String, String>) {
        *self.routes.write().await = routes;
    }

    async fn collection_for(&self, metric_name: &str) -> String {
        self.routes
            .read()
            .await
            .get(metric_name)
            .cloned()
            .unwrap_or_else(|| DEFAULT_COLLECTION.to_string())
    }

    /// Every collection measurements can be routed to, deduplicated
    pub async fn collections(&self) -> Vec<String> {
        let routes = self.routes.read().await;
        let mut names: BTreeSet<String> = routes.values().cloned().collect();
        names.insert(DEFAULT_COLLECTION.to_string());
        names.into_iter().collect()
    }

    /// Stores a document in the specified collection
    ///
    /// # Arguments
    /// * `collection_name` - Name of the collection to store the document in
    /// * `document` - BSON document containing the measurement
    ///
    /// # Returns
    /// * `Ok(())` - Successfully stored the measurement
    /// * `Err(StorageError)` - Failed to store (network error, auth error, etc.)
    pub async fn store_metric(
        &self,
        collection_name: &str,
        document: Document,
    ) -> Result<(), StorageError> {
        let db = self.client.database(&self.database_name);
        let collection: Collection<Document> = db.collection(collection_name);

        match collection.insert_one(document, None).await {
            Ok(result) => {
                debug!(
                    "Stored measurement with id: {:?} in collection '{}'",
                    result.inserted_id, collection_name
                );
                Ok(())
            }
            Err(e) => Err(StorageError::InsertError(e)),
        }
    }

    /// Stores a document with a single retry on failure
    ///
    /// # Note
    /// This method never returns an error - it logs failures and continues.
    /// A failure storing one measurement does not affect any other.
    pub async fn store_metric_safe(&self, key: &ScheduleKey, document: Document) {
        const MAX_RETRIES: u32 = 1;

        let collection_name = self.collection_for(&key.metric_name).await;

        for attempt in 0..=MAX_RETRIES {
            match self.store_metric(&collection_name, document.clone()).await {
                Ok(()) => {
                    if attempt > 0 {
                        info!("Stored {} after {} retry(ies)", key, attempt);
                    }
                    return;
                }
                Err(e) if attempt < MAX_RETRIES => {
                    error!(
                        "Failed to store {} in '{}' (attempt {}): {}. Retrying...",
                        key,
                        collection_name,
                        attempt + 1,
                        e
                    );
                    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
                }
                Err(e) => {
                    error!(
                        "Failed to store {} in '{}' after {} attempts: {}. Giving up.",
                        key,
                        collection_name,
                        attempt + 1,
                        e
                    );
                }
            }
        }
    }

    /// Creates the lookup index for a measurement collection
    ///
    /// # Index
    /// - `resource` + `metric` + `timestamp` (descending) - For querying one
    ///   schedule's history, most recent first
    ///
    /// # Arguments
    /// * `collection_name` - Collection to create indexes on
    pub async fn create_indexes(&self, collection_name: &str) -> Result<(), StorageError> {
        use mongodb::options::IndexOptions;
        use mongodb::IndexModel;

        info!("Creating indexes for collection '{}'", collection_name);

        let db = self.client.database(&self.database_name);
        let collection: Collection<Document> = db.collection(collection_name);

        let index = IndexModel::builder()
            .keys(doc! {
                "resource": 1,
                "metric": 1,
                "timestamp": -1
            })
            .options(
                IndexOptions::builder()
                    .name("resource_metric_timestamp_idx".to_string())
                    .build(),
            )
            .build();

        collection.create_index(index, None).await?;
        info!("Created indexes for collection '{}'", collection_name);
        Ok(())
    }
}

#[async_trait]
impl ResultSink for MongoResultSink {
    async fn report_success(
        &self,
        key: &ScheduleKey,
        value: &MeasurementValue,
        collected_at: DateTime<Utc>,
    ) {
        let document = measurement_document(&self.node, key, Ok(value), collected_at);
        self.store_metric_safe(key, document).await;
    }

    async fn report_failure(
        &self,
        key: &ScheduleKey,
        failure: &CollectionFailure,
        collected_at: DateTime<Utc>,
    ) {
        let document = measurement_document(&self.node, key, Err(failure), collected_at);
        self.store_metric_safe(key, document).await;
    }
}
