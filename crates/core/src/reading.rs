//! Sensor reading value object and its wire decoding
//!
//! Wire keys match the collar firmware (`suhu_*` = temperature, `vbatt_*` =
//! battery voltage, `kaki` = leg unit, `leher` = neck unit). Every numeric
//! field is optional: `None` means "not reported" and is persisted as NULL.
//! Fractional values are rounded to the nearest integer.

use crate::error::RelayError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

/// Format a UTC instant the way every relay timestamp is written.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current server time as an ISO-8601 string
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

fn whole_number<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(number) = Option::<serde_json::Number>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if let Some(value) = number.as_i64() {
        return Ok(Some(value));
    }
    match number.as_f64() {
        Some(value) if value.is_finite() && value.abs() < i64::MAX as f64 => {
            Ok(Some(value.round() as i64))
        }
        _ => Err(D::Error::custom(format!("number out of range: {}", number))),
    }
}

/// Sensor fields as sent by a device.
///
/// Any `device_id` or `timestamp` keys in the inbound object are ignored;
/// both are stamped by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorPayload {
    #[serde(default, deserialize_with = "whole_number", skip_serializing_if = "Option::is_none")]
    pub imu_x: Option<i64>,
    #[serde(default, deserialize_with = "whole_number", skip_serializing_if = "Option::is_none")]
    pub imu_y: Option<i64>,
    #[serde(default, deserialize_with = "whole_number", skip_serializing_if = "Option::is_none")]
    pub imu_z: Option<i64>,

    /// Leg unit temperature (°C × 100)
    #[serde(rename = "suhu_kaki", default, deserialize_with = "whole_number", skip_serializing_if = "Option::is_none")]
    pub leg_temperature: Option<i64>,
    /// Leg unit battery (mV)
    #[serde(rename = "vbatt_kaki", default, deserialize_with = "whole_number", skip_serializing_if = "Option::is_none")]
    pub leg_battery: Option<i64>,
    /// Neck unit temperature (°C × 100)
    #[serde(rename = "suhu_leher", default, deserialize_with = "whole_number", skip_serializing_if = "Option::is_none")]
    pub neck_temperature: Option<i64>,
    /// Neck unit battery (mV)
    #[serde(rename = "vbatt_leher", default, deserialize_with = "whole_number", skip_serializing_if = "Option::is_none")]
    pub neck_battery: Option<i64>,

    /// Degrees × 1e7
    #[serde(default, deserialize_with = "whole_number", skip_serializing_if = "Option::is_none")]
    pub latitude: Option<i64>,
    /// Degrees × 1e7
    #[serde(default, deserialize_with = "whole_number", skip_serializing_if = "Option::is_none")]
    pub longitude: Option<i64>,

    /// Blood oxygen saturation (%)
    #[serde(default, deserialize_with = "whole_number", skip_serializing_if = "Option::is_none")]
    pub spo2: Option<i64>,
    /// Beats per minute
    #[serde(default, deserialize_with = "whole_number", skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<i64>,
}

impl SensorPayload {
    /// Decode a device frame. Only a JSON object with numeric (or null)
    /// sensor fields is accepted.
    pub fn from_json(text: &str) -> Result<Self, RelayError> {
        let value: JsonValue = serde_json::from_str(text)
            .map_err(|e| RelayError::malformed(format!("invalid JSON: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: JsonValue) -> Result<Self, RelayError> {
        if !value.is_object() {
            return Err(RelayError::malformed("expected a JSON object"));
        }
        serde_json::from_value(value)
            .map_err(|e| RelayError::malformed(format!("invalid sensor payload: {}", e)))
    }
}

/// An accepted reading, stamped with its device and server time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorReading {
    pub device_id: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub payload: SensorPayload,
}

impl SensorReading {
    /// Stamp a payload with the connection's device ID and the given time.
    pub fn stamp(device_id: impl Into<String>, payload: SensorPayload, at: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: format_timestamp(at),
            payload,
        }
    }

    /// Stamp with the current server time
    pub fn stamp_now(device_id: impl Into<String>, payload: SensorPayload) -> Self {
        Self::stamp(device_id, payload, Utc::now())
    }
}
