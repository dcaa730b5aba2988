// Data Retention
//
// Periodically deletes readings older than the configured window.

use chrono::Utc;
use farmrelay_storage::StorageGateway;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Run one sweep, returning how many readings were removed
pub async fn prune_expired(storage: &dyn StorageGateway, retention_days: u32) -> usize {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    match storage.prune_before(cutoff).await {
        Ok(0) => 0,
        Ok(removed) => {
            tracing::info!("Retention sweep removed {} readings", removed);
            removed
        }
        Err(e) => {
            tracing::warn!("Retention sweep failed: {}", e);
            0
        }
    }
}

/// Spawn the sweep loop. `retention_days == 0` keeps everything.
pub fn spawn_retention_task(
    storage: Arc<dyn StorageGateway>,
    retention_days: u32,
) -> Option<JoinHandle<()>> {
    if retention_days == 0 {
        tracing::info!("Data retention disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            prune_expired(storage.as_ref(), retention_days).await;
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use farmrelay_core::{SensorPayload, SensorReading};
    use farmrelay_storage::SqliteStorage;

    #[tokio::test]
    async fn test_prune_expired_keeps_recent() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let old = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        storage
            .save_reading(&SensorReading::stamp("DEV001", SensorPayload::default(), old))
            .await
            .unwrap();
        storage
            .save_reading(&SensorReading::stamp_now("DEV001", SensorPayload::default()))
            .await
            .unwrap();

        assert_eq!(prune_expired(&storage, 30).await, 1);
        assert_eq!(storage.recent_readings(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_days_disables_task() {
        let storage: Arc<dyn StorageGateway> = Arc::new(SqliteStorage::open_in_memory().unwrap());
        assert!(spawn_retention_task(storage, 0).is_none());
    }
}
