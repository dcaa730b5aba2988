// Relay Statistics
//
// Message counter and uptime, combined on demand with live connection counts
// and persisted aggregates.

use farmrelay_storage::StorageStatistics;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Process-lifetime counters. Connection counts are read from the registry
/// at report time, never cached here.
#[derive(Debug)]
pub struct StatsAggregator {
    total_messages: AtomicU64,
    started_at: Instant,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            total_messages: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Count one accepted reading, returning the new total
    pub fn record_message(&self) -> u64 {
        self.total_messages.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn report(
        &self,
        device_connections: usize,
        dashboard_connections: usize,
        storage: Option<StorageStatistics>,
    ) -> RelayStatistics {
        RelayStatistics {
            total_messages: self.total_messages(),
            device_connections,
            dashboard_connections,
            uptime_secs: self.uptime().as_secs(),
            storage,
        }
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics payload sent to dashboards.
///
/// Persisted aggregates are merged at the top level when storage answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatistics {
    pub total_messages: u64,
    pub device_connections: usize,
    pub dashboard_connections: usize,
    pub uptime_secs: u64,
    #[serde(flatten)]
    pub storage: Option<StorageStatistics>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counter_starts_at_zero() {
        let stats = StatsAggregator::new();
        assert_eq!(stats.total_messages(), 0);
        assert_eq!(stats.record_message(), 1);
        assert_eq!(stats.record_message(), 2);
        assert_eq!(stats.total_messages(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let stats = Arc::new(StatsAggregator::new());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let stats = Arc::clone(&stats);
            tasks.push(tokio::spawn(async move {
                for _ in 0..250 {
                    stats.record_message();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(stats.total_messages(), 2000);
    }

    #[test]
    fn test_report_merges_storage_fields() {
        let stats = StatsAggregator::new();
        let storage = StorageStatistics {
            total_records: 10,
            total_devices: 2,
            records_today: 4,
            records_last_hour: 1,
            timestamp: "2026-03-01T08:30:00.000Z".to_string(),
        };

        let value = serde_json::to_value(stats.report(3, 1, Some(storage))).unwrap();
        assert_eq!(value["device_connections"], 3);
        assert_eq!(value["dashboard_connections"], 1);
        assert_eq!(value["total_records"], 10);
        assert_eq!(value["records_last_hour"], 1);

        let bare = serde_json::to_value(stats.report(0, 0, None)).unwrap();
        assert!(bare.get("total_records").is_none());
        assert_eq!(bare["total_messages"], 0);
    }
}
