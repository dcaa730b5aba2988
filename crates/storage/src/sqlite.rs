// SQLite Storage
//
// One rusqlite connection behind a mutex. Every call runs on the blocking
// pool so the async connection loops never wait on disk IO directly.

use crate::{DeviceRecord, StorageError, StorageGateway, StorageStatistics, StoredReading};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use farmrelay_core::reading::format_timestamp;
use farmrelay_core::{SensorPayload, SensorReading};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sensor_data (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    imu_x INTEGER,
    imu_y INTEGER,
    imu_z INTEGER,
    suhu_kaki INTEGER,
    vbatt_kaki INTEGER,
    suhu_leher INTEGER,
    vbatt_leher INTEGER,
    latitude INTEGER,
    longitude INTEGER,
    spo2 INTEGER,
    heart_rate INTEGER,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS devices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT UNIQUE NOT NULL,
    cow_id TEXT,
    status TEXT DEFAULT 'active',
    last_seen TEXT,
    firmware_version TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_sensor_device_timestamp
    ON sensor_data(device_id, timestamp DESC);

CREATE INDEX IF NOT EXISTS idx_sensor_timestamp
    ON sensor_data(timestamp DESC);
"#;

const READING_COLUMNS: &str = "id, device_id, timestamp, imu_x, imu_y, imu_z, \
     suhu_kaki, vbatt_kaki, suhu_leher, vbatt_leher, latitude, longitude, spo2, heart_rate, \
     created_at";

#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) a database file and ensure the schema exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path.as_ref())?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        tracing::debug!("Database tables created/verified");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StorageError::Poisoned)?;
            f(&mut guard)
        })
        .await?
    }
}

fn reading_from_row(row: &Row<'_>) -> rusqlite::Result<StoredReading> {
    Ok(StoredReading {
        id: row.get(0)?,
        reading: SensorReading {
            device_id: row.get(1)?,
            timestamp: row.get(2)?,
            payload: SensorPayload {
                imu_x: row.get(3)?,
                imu_y: row.get(4)?,
                imu_z: row.get(5)?,
                leg_temperature: row.get(6)?,
                leg_battery: row.get(7)?,
                neck_temperature: row.get(8)?,
                neck_battery: row.get(9)?,
                latitude: row.get(10)?,
                longitude: row.get(11)?,
                spo2: row.get(12)?,
                heart_rate: row.get(13)?,
            },
        },
        created_at: row.get(14)?,
    })
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<DeviceRecord> {
    Ok(DeviceRecord {
        id: row.get(0)?,
        device_id: row.get(1)?,
        cow_id: row.get(2)?,
        status: row.get(3)?,
        last_seen: row.get(4)?,
        firmware_version: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn count(conn: &Connection, sql: &str, cutoff: Option<&str>) -> Result<u64, StorageError> {
    let n: i64 = match cutoff {
        Some(cutoff) => conn.query_row(sql, params![cutoff], |row| row.get(0))?,
        None => conn.query_row(sql, [], |row| row.get(0))?,
    };
    Ok(n.max(0) as u64)
}

#[async_trait]
impl StorageGateway for SqliteStorage {
    async fn save_reading(&self, reading: &SensorReading) -> Result<(), StorageError> {
        let reading = reading.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO devices (device_id, status) VALUES (?1, 'active')",
                params![reading.device_id],
            )?;
            let p = &reading.payload;
            tx.execute(
                "INSERT INTO sensor_data (
                    device_id, timestamp, imu_x, imu_y, imu_z,
                    suhu_kaki, vbatt_kaki, suhu_leher, vbatt_leher,
                    latitude, longitude, spo2, heart_rate
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    reading.device_id,
                    reading.timestamp,
                    p.imu_x,
                    p.imu_y,
                    p.imu_z,
                    p.leg_temperature,
                    p.leg_battery,
                    p.neck_temperature,
                    p.neck_battery,
                    p.latitude,
                    p.longitude,
                    p.spo2,
                    p.heart_rate,
                ],
            )?;
            tx.execute(
                "UPDATE devices SET last_seen = ?1, updated_at = CURRENT_TIMESTAMP
                 WHERE device_id = ?2",
                params![reading.timestamp, reading.device_id],
            )?;
            tx.commit()?;
            tracing::debug!("Saved sensor data for device {}", reading.device_id);
            Ok(())
        })
        .await
    }

    async fn register_device(
        &self,
        device_id: &str,
        cow_id: Option<&str>,
    ) -> Result<(), StorageError> {
        let device_id = device_id.to_string();
        let cow_id = cow_id.map(str::to_string);
        self.call(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO devices (device_id, cow_id, status)
                 VALUES (?1, ?2, 'active')",
                params![device_id, cow_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn recent_readings(&self, limit: usize) -> Result<Vec<StoredReading>, StorageError> {
        self.call(move |conn| {
            let sql = format!(
                "SELECT {READING_COLUMNS} FROM sensor_data
                 ORDER BY timestamp DESC, id DESC LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![limit as i64], reading_from_row)?;
            let collected = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(collected)
        })
        .await
    }

    async fn device_readings(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredReading>, StorageError> {
        let device_id = device_id.to_string();
        self.call(move |conn| {
            let sql = format!(
                "SELECT {READING_COLUMNS} FROM sensor_data WHERE device_id = ?1
                 ORDER BY timestamp DESC, id DESC LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![device_id, limit as i64], reading_from_row)?;
            let collected = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(collected)
        })
        .await
    }

    async fn devices(&self) -> Result<Vec<DeviceRecord>, StorageError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, device_id, cow_id, status, last_seen, firmware_version,
                        created_at, updated_at
                 FROM devices ORDER BY device_id",
            )?;
            let rows = stmt.query_map([], device_from_row)?;
            let collected = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(collected)
        })
        .await
    }

    async fn statistics(&self) -> Result<StorageStatistics, StorageError> {
        let now = Utc::now();
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc())
            .unwrap_or(now);
        let today = format_timestamp(midnight);
        let last_hour = format_timestamp(now - Duration::hours(1));
        let timestamp = format_timestamp(now);

        self.call(move |conn| {
            Ok(StorageStatistics {
                total_records: count(conn, "SELECT COUNT(*) FROM sensor_data", None)?,
                total_devices: count(conn, "SELECT COUNT(*) FROM devices", None)?,
                records_today: count(
                    conn,
                    "SELECT COUNT(*) FROM sensor_data WHERE timestamp >= ?1",
                    Some(&today),
                )?,
                records_last_hour: count(
                    conn,
                    "SELECT COUNT(*) FROM sensor_data WHERE timestamp >= ?1",
                    Some(&last_hour),
                )?,
                timestamp,
            })
        })
        .await
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let cutoff = format_timestamp(cutoff);
        self.call(move |conn| {
            let removed = conn.execute(
                "DELETE FROM sensor_data WHERE timestamp < ?1",
                params![cutoff],
            )?;
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rusqlite::OptionalExtension;

    async fn lookup_device(
        storage: &SqliteStorage,
        device_id: &str,
    ) -> Result<Option<DeviceRecord>, StorageError> {
        let device_id = device_id.to_string();
        storage
            .call(move |conn| {
                let record = conn
                    .query_row(
                        "SELECT id, device_id, cow_id, status, last_seen, firmware_version,
                                created_at, updated_at
                         FROM devices WHERE device_id = ?1",
                        params![device_id],
                        device_from_row,
                    )
                    .optional()?;
                Ok(record)
            })
            .await
    }

    fn reading(device_id: &str, minute: u32, heart_rate: Option<i64>) -> SensorReading {
        let at = Utc.with_ymd_and_hms(2020, 3, 1, 8, minute, 0).unwrap();
        SensorReading::stamp(
            device_id,
            SensorPayload {
                heart_rate,
                ..SensorPayload::default()
            },
            at,
        )
    }

    #[tokio::test]
    async fn test_save_registers_device_and_last_seen() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.save_reading(&reading("DEV001", 1, Some(70))).await.unwrap();
        storage.save_reading(&reading("DEV001", 2, Some(71))).await.unwrap();

        let devices = storage.devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].status, "active");
        assert_eq!(
            devices[0].last_seen.as_deref(),
            Some("2020-03-01T08:02:00.000Z")
        );
    }

    #[tokio::test]
    async fn test_absent_fields_persist_as_null() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.save_reading(&reading("DEV001", 1, None)).await.unwrap();

        let rows = storage.device_readings("DEV001", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].reading.payload, SensorPayload::default());
    }

    #[tokio::test]
    async fn test_device_readings_newest_first_with_limit() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.save_reading(&reading("DEV001", 1, Some(60))).await.unwrap();
        storage.save_reading(&reading("DEV002", 2, Some(80))).await.unwrap();
        storage.save_reading(&reading("DEV001", 3, Some(65))).await.unwrap();

        let rows = storage.device_readings("DEV001", 1).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].reading.payload.heart_rate, Some(65));

        let recent = storage.recent_readings(10).await.unwrap();
        let rates: Vec<_> = recent.iter().map(|r| r.reading.payload.heart_rate).collect();
        assert_eq!(rates, vec![Some(65), Some(80), Some(60)]);
    }

    #[tokio::test]
    async fn test_same_timestamp_orders_by_insertion() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.save_reading(&reading("DEV001", 5, Some(1))).await.unwrap();
        storage.save_reading(&reading("DEV001", 5, Some(2))).await.unwrap();

        let rows = storage.device_readings("DEV001", 1).await.unwrap();
        assert_eq!(rows[0].reading.payload.heart_rate, Some(2));
    }

    #[tokio::test]
    async fn test_register_device_is_idempotent() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.register_device("DEV009", Some("COW-9")).await.unwrap();
        storage.register_device("DEV009", None).await.unwrap();

        let record = lookup_device(&storage, "DEV009").await.unwrap().unwrap();
        assert_eq!(record.cow_id.as_deref(), Some("COW-9"));
        assert!(lookup_device(&storage, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_statistics_and_prune() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.save_reading(&reading("DEV001", 1, Some(70))).await.unwrap();
        storage
            .save_reading(&SensorReading::stamp_now("DEV002", SensorPayload::default()))
            .await
            .unwrap();

        let stats = storage.statistics().await.unwrap();
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.total_devices, 2);
        assert_eq!(stats.records_last_hour, 1);
        assert!(stats.records_today >= 1);

        let cutoff = Utc::now() - Duration::days(1);
        assert_eq!(storage.prune_before(cutoff).await.unwrap(), 1);
        assert_eq!(storage.statistics().await.unwrap().total_records, 1);
    }
}
