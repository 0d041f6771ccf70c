// Platform collector
//
// Reads operating system metrics of the machine the agent runs on. The
// resource id is informational only; every platform resource describes the
// local host.

use async_trait::async_trait;
use bson::{doc, Document};
use sysinfo::{Disks, System};
use tracing::debug;

use super::{CollectError, Collector, MeasurementValue};

pub const LOAD_AVERAGE: &str = "LoadAverage";
pub const MEMORY: &str = "Memory";
pub const DISK_SPACE: &str = "DiskSpace";

const SUPPORTED: [&str; 3] = [LOAD_AVERAGE, MEMORY, DISK_SPACE];

/// Operating system metrics collector
///
/// # Metrics
/// - `LoadAverage`: 1, 5 and 15 minute load averages plus the CPU count
///   for context. Always 0.0 on Windows.
/// - `Memory`: RAM and swap totals, usage and percentages
/// - `DiskSpace`: one entry per mounted filesystem
pub struct PlatformCollector;

impl PlatformCollector {
    pub fn new() -> Self {
        PlatformCollector
    }

    fn bytes_to_mb(bytes: u64) -> i64 {
        (bytes / (1024 * 1024)) as i64
    }

    fn bytes_to_gb(bytes: u64) -> f64 {
        bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }

    fn percentage(used: u64, total: u64) -> f64 {
        if total == 0 {
            0.0
        } else {
            (used as f64 / total as f64) * 100.0
        }
    }

    fn load_average() -> Document {
        let load = System::load_average();
        let cpu_count = num_cpus::get();

        debug!(
            "Load average: 1min={:.2}, 5min={:.2}, 15min={:.2} (CPUs: {})",
            load.one, load.five, load.fifteen, cpu_count
        );

        doc! {
            "load_1min": load.one,
            "load_5min": load.five,
            "load_15min": load.fifteen,
            "cpu_cores": cpu_count as i32,
        }
    }

    fn memory() -> Document {
        let mut sys = System::new();
        sys.refresh_memory();

        let (total, used) = (sys.total_memory(), sys.used_memory());
        let (swap_total, swap_used) = (sys.total_swap(), sys.used_swap());

        doc! {
            "total_mb": Self::bytes_to_mb(total),
            "used_mb": Self::bytes_to_mb(used),
            // free plus reclaimable cache
            "available_mb": Self::bytes_to_mb(sys.available_memory()),
            "free_mb": Self::bytes_to_mb(sys.free_memory()),
            "used_percent": Self::percentage(used, total),
            "swap_total_mb": Self::bytes_to_mb(swap_total),
            "swap_used_mb": Self::bytes_to_mb(swap_used),
            "swap_free_mb": Self::bytes_to_mb(sys.free_swap()),
            "swap_used_percent": Self::percentage(swap_used, swap_total),
        }
    }

    fn disk_space() -> Document {
        let disks = Disks::new_with_refreshed_list();

        let entries: Vec<Document> = disks
            .list()
            .iter()
            .map(|disk| {
                let total = disk.total_space();
                let available = disk.available_space();
                let used = total.saturating_sub(available);

                doc! {
                    "mount_point": disk.mount_point().to_string_lossy().to_string(),
                    "filesystem": disk.file_system().to_string_lossy().to_string(),
                    "total_gb": Self::bytes_to_gb(total),
                    "used_gb": Self::bytes_to_gb(used),
                    "available_gb": Self::bytes_to_gb(available),
                    "used_percent": Self::percentage(used, total),
                }
            })
            .collect();

        debug!("Collected information for {} disk(s)", entries.len());

        doc! { "disks": entries }
    }
}

#[async_trait]
impl Collector for PlatformCollector {
    fn resource_type(&self) -> &str {
        "platform"
    }

    fn supports(&self, metric_name: &str) -> bool {
        SUPPORTED.contains(&metric_name)
    }

    async fn collect(
        &self,
        resource_id: &str,
        metric_name: &str,
    ) -> Result<MeasurementValue, CollectError> {
        debug!(resource = resource_id, metric = metric_name, "Reading platform metric");

        let doc = match metric_name {
            LOAD_AVERAGE => Self::load_average(),
            MEMORY => Self::memory(),
            DISK_SPACE => Self::disk_space(),
            other => return Err(CollectError::UnsupportedMetric(other.to_string())),
        };

        Ok(MeasurementValue::Document(doc))
    }
}

impl Default for PlatformCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage() {
        assert_eq!(PlatformCollector::percentage(50, 200), 25.0);
        assert_eq!(PlatformCollector::percentage(1, 0), 0.0);
    }

    #[test]
    fn test_supported_metrics() {
        let collector = PlatformCollector::new();
        assert!(collector.supports("Memory"));
        assert!(!collector.supports("DockerStats"));
    }

    #[tokio::test]
    async fn test_collect_memory() {
        let collector = PlatformCollector::new();
        let value = collector.collect("localhost", MEMORY).await.unwrap();

        match value {
            MeasurementValue::Document(doc) => {
                assert!(doc.contains_key("total_mb"));
                assert!(doc.contains_key("swap_used_percent"));
            }
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_metric_fails() {
        let collector = PlatformCollector::new();
        let err = collector.collect("localhost", "Entropy").await.unwrap_err();
        assert_eq!(err, CollectError::UnsupportedMetric("Entropy".into()));
    }
}
