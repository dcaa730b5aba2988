//! farmrelay_storage
//! Persistence gateway for sensor readings and the device registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use farmrelay_core::{RelayError, SensorReading};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod sqlite;

pub use sqlite::SqliteStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("database connection lock poisoned")]
    Poisoned,
}

impl From<StorageError> for RelayError {
    fn from(err: StorageError) -> Self {
        RelayError::storage("call", err.to_string())
    }
}

/// A persisted reading as returned by queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredReading {
    pub id: i64,
    #[serde(flatten)]
    pub reading: SensorReading,
    pub created_at: String,
}

/// Device registry row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: i64,
    pub device_id: String,
    pub cow_id: Option<String>,
    pub status: String,
    pub last_seen: Option<String>,
    pub firmware_version: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Aggregate counts over stored readings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStatistics {
    pub total_records: u64,
    pub total_devices: u64,
    pub records_today: u64,
    pub records_last_hour: u64,
    pub timestamp: String,
}

/// Storage gateway consumed by the relay core
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Persist one reading. Registers the device if it is new and updates
    /// its last-seen timestamp. Absent sensor fields are stored as NULL.
    async fn save_reading(&self, reading: &SensorReading) -> Result<(), StorageError>;

    /// Register a device if it does not exist yet
    async fn register_device(
        &self,
        device_id: &str,
        cow_id: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Most recent readings across all devices, newest first
    async fn recent_readings(&self, limit: usize) -> Result<Vec<StoredReading>, StorageError>;

    /// Most recent readings for one device, newest first
    async fn device_readings(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredReading>, StorageError>;

    /// All registered devices ordered by device ID
    async fn devices(&self) -> Result<Vec<DeviceRecord>, StorageError>;

    async fn statistics(&self) -> Result<StorageStatistics, StorageError>;

    /// Delete readings older than `cutoff`, returning how many were removed
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError>;
}
