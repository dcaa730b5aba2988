// Relay WebSocket Protocol
//
// Wire envelopes for both connection populations:
// - Device -> server: a flat object of sensor fields (see `SensorPayload`)
// - Server -> device: `DeviceAck` after every frame
// - Server -> dashboard: `DashboardEvent`, tagged by `type`
// - Dashboard -> server: `DashboardCommand`, tagged by `type`

use crate::stats::RelayStatistics;
use farmrelay_core::{now_timestamp, SensorReading};
use farmrelay_storage::{DeviceRecord, StoredReading};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Default number of readings returned by `get_device_data`
pub const DEFAULT_QUERY_LIMIT: usize = 100;
/// Upper bound on any caller-supplied query limit
pub const MAX_QUERY_LIMIT: usize = 1000;

pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_QUERY_LIMIT).min(MAX_QUERY_LIMIT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Ok,
    Error,
}

/// Acknowledgment sent to a device for each inbound frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAck {
    pub status: AckStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl DeviceAck {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Ok,
            message: message.into(),
            timestamp: Some(now_timestamp()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Error,
            message: message.into(),
            timestamp: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == AckStatus::Ok
    }
}

/// Snapshot sent to a dashboard immediately after it connects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialData {
    pub sensor_readings: Vec<StoredReading>,
    pub devices: Vec<DeviceRecord>,
    pub statistics: RelayStatistics,
    pub connected_devices: Vec<String>,
}

/// Event frame from server to dashboard
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardEvent {
    /// A freshly accepted reading
    SensorData { data: SensorReading },

    DeviceConnected { device_id: String, timestamp: String },

    DeviceDisconnected { device_id: String, timestamp: String },

    InitialData { data: InitialData },

    /// Reply to `get_stats`
    Statistics { data: RelayStatistics },

    /// Reply to `get_device_data`
    DeviceData {
        device_id: String,
        data: Vec<StoredReading>,
    },

    /// Reply to `ping`
    Pong { timestamp: String },
}

impl DashboardEvent {
    pub fn device_connected(device_id: impl Into<String>) -> Self {
        Self::DeviceConnected {
            device_id: device_id.into(),
            timestamp: now_timestamp(),
        }
    }

    pub fn device_disconnected(device_id: impl Into<String>) -> Self {
        Self::DeviceDisconnected {
            device_id: device_id.into(),
            timestamp: now_timestamp(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: now_timestamp(),
        }
    }

    /// Wire tag, used for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SensorData { .. } => "sensor_data",
            Self::DeviceConnected { .. } => "device_connected",
            Self::DeviceDisconnected { .. } => "device_disconnected",
            Self::InitialData { .. } => "initial_data",
            Self::Statistics { .. } => "statistics",
            Self::DeviceData { .. } => "device_data",
            Self::Pong { .. } => "pong",
        }
    }
}

/// Command frame from dashboard to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardCommand {
    Ping,

    GetStats,

    GetDeviceData {
        device_id: String,
        #[serde(default)]
        limit: Option<usize>,
    },

    /// Forward `command` verbatim to one device
    SendCommandToDevice {
        device_id: String,
        #[serde(default)]
        command: JsonValue,
    },

    /// Any kind this relay does not know; ignored
    #[serde(other)]
    Unknown,
}
