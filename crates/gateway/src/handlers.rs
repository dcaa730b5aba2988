// Relay Handlers
//
// Per-frame logic for both connection kinds. The ingest path is shared by
// device frames and the HTTP `POST /api/data` endpoint.

use crate::protocol::{clamp_limit, DashboardCommand, DashboardEvent, DeviceAck};
use crate::registry::SessionRegistry;
use farmrelay_core::{RelayError, SensorPayload, SensorReading};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct RelayHandlers {
    registry: Arc<SessionRegistry>,
}

impl RelayHandlers {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Persist a stamped reading, count it and fan it out.
    ///
    /// Nothing is counted or broadcast unless the write succeeded.
    pub async fn ingest(&self, reading: SensorReading) -> Result<SensorReading, RelayError> {
        self.registry
            .storage()
            .save_reading(&reading)
            .await
            .map_err(|e| RelayError::storage("save_reading", e.to_string()))?;

        let total = self.registry.stats().record_message();
        debug!("Accepted reading #{} from {}", total, reading.device_id);

        self.registry
            .broadcast_to_dashboards(&DashboardEvent::SensorData {
                data: reading.clone(),
            })
            .await;
        Ok(reading)
    }

    /// Handle one text frame from a device and produce its acknowledgment
    pub async fn device_frame(&self, device_id: &str, text: &str) -> DeviceAck {
        let payload = match SensorPayload::from_json(text) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Malformed frame from {}: {}", device_id, e);
                return DeviceAck::error("Invalid JSON format");
            }
        };

        match self.ingest(SensorReading::stamp_now(device_id, payload)).await {
            Ok(_) => DeviceAck::ok("Data received"),
            Err(e) => {
                error!("Failed to persist reading from {}: {}", device_id, e);
                DeviceAck::error("Failed to save data")
            }
        }
    }

    /// Handle one text frame from a dashboard. Returns the reply, if any.
    ///
    /// Malformed frames are logged and produce no reply.
    pub async fn dashboard_frame(&self, text: &str) -> Option<DashboardEvent> {
        match serde_json::from_str::<DashboardCommand>(text) {
            Ok(command) => self.handle_command(command).await,
            Err(e) => {
                warn!("Ignoring malformed dashboard frame: {}", e);
                None
            }
        }
    }

    pub async fn handle_command(&self, command: DashboardCommand) -> Option<DashboardEvent> {
        match command {
            DashboardCommand::Ping => Some(DashboardEvent::pong()),
            DashboardCommand::GetStats => Some(self.get_stats().await),
            DashboardCommand::GetDeviceData { device_id, limit } => {
                Some(self.get_device_data(device_id, limit).await)
            }
            DashboardCommand::SendCommandToDevice { device_id, command } => {
                self.send_command_to_device(&device_id, &command).await;
                None
            }
            DashboardCommand::Unknown => {
                debug!("Ignoring unknown dashboard command");
                None
            }
        }
    }

    pub async fn get_stats(&self) -> DashboardEvent {
        DashboardEvent::Statistics {
            data: self.registry.full_statistics().await,
        }
    }

    /// Recent readings for one device, newest first. A storage failure
    /// yields an empty list.
    pub async fn get_device_data(&self, device_id: String, limit: Option<usize>) -> DashboardEvent {
        let limit = clamp_limit(limit);
        let data = match self.registry.storage().device_readings(&device_id, limit).await {
            Ok(rows) => rows,
            Err(e) => {
                error!("Failed to load readings for {}: {}", device_id, e);
                Vec::new()
            }
        };
        DashboardEvent::DeviceData { device_id, data }
    }

    /// Forward a command payload verbatim. Returns whether it was queued.
    pub async fn send_command_to_device(&self, device_id: &str, command: &JsonValue) -> bool {
        let text = match serde_json::to_string(command) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode command for {}: {}", device_id, e);
                return false;
            }
        };

        let sent = self.registry.send_to_device(device_id, Arc::from(text)).await;
        if sent {
            info!("Forwarded command to device {}", device_id);
        } else {
            warn!("Command for {} dropped: device not connected", device_id);
        }
        sent
    }
}
