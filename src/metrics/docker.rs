// Docker collector
//
// Reads container statistics from the local Docker daemon. The daemon
// connection is established on first use, so an agent without Docker still
// starts; each collection then fails with `Unavailable` and the scheduler
// keeps retrying at the metric's normal cadence.

use async_trait::async_trait;
use bollard::container::{ListContainersOptions, Stats, StatsOptions};
use bollard::Docker;
use bson::{doc, Document};
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::{CollectError, Collector, MeasurementValue};

pub const DOCKER_STATS: &str = "DockerStats";
pub const CONTAINER_COUNT: &str = "ContainerCount";

/// Resource id meaning "every running container"
pub const ALL_CONTAINERS: &str = "*";

/// Docker container stats collector
///
/// # Metrics
/// - `DockerStats`: CPU, memory, network and block I/O per container. A
///   resource id other than `*` restricts the document to containers whose
///   name or id starts with it.
/// - `ContainerCount`: number of running containers
///
/// # Requirements
/// The agent needs access to the Docker socket
/// (unix:///var/run/docker.sock, or DOCKER_HOST).
pub struct DockerCollector {
    docker: OnceCell<Docker>,
}

impl DockerCollector {
    pub fn new() -> Self {
        DockerCollector {
            docker: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&Docker, CollectError> {
        self.docker
            .get_or_try_init(|| async {
                Docker::connect_with_socket_defaults()
                    .or_else(|_| Docker::connect_with_local_defaults())
                    .map_err(|e| CollectError::Unavailable(format!("docker daemon: {e}")))
            })
            .await
    }

    fn bytes_to_mb(bytes: u64) -> f64 {
        bytes as f64 / (1024.0 * 1024.0)
    }

    /// cpu_percent = (cpu_delta / system_cpu_delta) * online_cpus * 100
    fn cpu_percent(stats: &Stats) -> f64 {
        let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
            - stats.precpu_stats.cpu_usage.total_usage as f64;
        let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
            - stats.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;

        if system_delta <= 0.0 || cpu_delta <= 0.0 {
            return 0.0;
        }

        let online_cpus = stats
            .cpu_stats
            .online_cpus
            .unwrap_or_else(|| num_cpus::get() as u64) as f64;

        (cpu_delta / system_delta) * online_cpus * 100.0
    }

    fn container_document(id: &str, name: &str, stats: &Stats) -> Document {
        let memory_used = stats.memory_stats.usage.unwrap_or(0);
        let memory_limit = stats.memory_stats.limit.unwrap_or(0);

        let (network_rx, network_tx) = stats
            .networks
            .as_ref()
            .map(|networks| {
                networks
                    .values()
                    .fold((0u64, 0u64), |(rx, tx), net| (rx + net.rx_bytes, tx + net.tx_bytes))
            })
            .unwrap_or((0, 0));

        let (block_read, block_write) = stats
            .blkio_stats
            .io_service_bytes_recursive
            .as_ref()
            .map(|io| {
                io.iter()
                    .fold((0u64, 0u64), |(read, write), stat| match stat.op.as_str() {
                        "read" | "Read" => (read + stat.value, write),
                        "write" | "Write" => (read, write + stat.value),
                        _ => (read, write),
                    })
            })
            .unwrap_or((0, 0));

        let memory_percent = if memory_limit > 0 {
            (memory_used as f64 / memory_limit as f64) * 100.0
        } else {
            0.0
        };

        doc! {
            "id": &id[..12.min(id.len())],
            "name": name,
            "cpu_percent": Self::cpu_percent(stats),
            "memory_used_mb": Self::bytes_to_mb(memory_used),
            "memory_limit_mb": Self::bytes_to_mb(memory_limit),
            "memory_percent": memory_percent,
            "network_rx_mb": Self::bytes_to_mb(network_rx),
            "network_tx_mb": Self::bytes_to_mb(network_tx),
            "block_read_mb": Self::bytes_to_mb(block_read),
            "block_write_mb": Self::bytes_to_mb(block_write),
        }
    }

    /// Running containers as (id, name), filtered by the resource id
    async fn containers(
        &self,
        docker: &Docker,
        resource_id: &str,
    ) -> Result<Vec<(String, String)>, CollectError> {
        let options = ListContainersOptions::<String> {
            filters: HashMap::from([("status".to_string(), vec!["running".to_string()])]),
            ..Default::default()
        };

        let containers = docker
            .list_containers(Some(options))
            .await
            .map_err(|e| CollectError::Unavailable(format!("list containers: {e}")))?;

        Ok(containers
            .into_iter()
            .map(|c| {
                let id = c.id.unwrap_or_default();
                let name = c
                    .names
                    .and_then(|names| names.first().map(|n| n.trim_start_matches('/').to_string()))
                    .unwrap_or_else(|| "unknown".to_string());
                (id, name)
            })
            .filter(|(id, name)| {
                resource_id == ALL_CONTAINERS
                    || name.starts_with(resource_id)
                    || id.starts_with(resource_id)
            })
            .collect())
    }

    async fn docker_stats(
        &self,
        docker: &Docker,
        resource_id: &str,
    ) -> Result<Document, CollectError> {
        let containers = self.containers(docker, resource_id).await?;
        let mut documents = Vec::with_capacity(containers.len());

        for (id, name) in containers {
            let options = StatsOptions {
                stream: false,
                ..Default::default()
            };

            let mut stream = docker.stats(&id, Some(options));
            match stream.next().await {
                Some(Ok(stats)) => documents.push(Self::container_document(&id, &name, &stats)),
                Some(Err(e)) => warn!("Failed to get stats for container {}: {}", name, e),
                None => debug!("No stats returned for container {}", name),
            }
        }

        debug!("Collected stats for {} container(s)", documents.len());
        Ok(doc! { "containers": documents })
    }
}

#[async_trait]
impl Collector for DockerCollector {
    fn resource_type(&self) -> &str {
        "docker"
    }

    fn supports(&self, metric_name: &str) -> bool {
        matches!(metric_name, DOCKER_STATS | CONTAINER_COUNT)
    }

    async fn collect(
        &self,
        resource_id: &str,
        metric_name: &str,
    ) -> Result<MeasurementValue, CollectError> {
        let docker = self.client().await?;

        match metric_name {
            DOCKER_STATS => self
                .docker_stats(docker, resource_id)
                .await
                .map(MeasurementValue::Document),
            CONTAINER_COUNT => {
                let count = self.containers(docker, resource_id).await?.len();
                Ok(MeasurementValue::Numeric(count as f64))
            }
            other => Err(CollectError::UnsupportedMetric(other.to_string())),
        }
    }
}

impl Default for DockerCollector {
    fn default() -> Self {
        Self::new()
    }
}
