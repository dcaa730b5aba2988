// Session Registry
//
// Authoritative membership for both populations: at most one device session
// per device ID (last connect wins) and a set of dashboard sessions.

use crate::protocol::{DashboardEvent, InitialData};
use crate::session::{DashboardSession, DeliveryError, DeviceSession, SessionId};
use crate::stats::{RelayStatistics, StatsAggregator};
use farmrelay_storage::StorageGateway;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub struct SessionRegistry {
    devices: RwLock<HashMap<String, DeviceSession>>,
    pub(crate) dashboards: RwLock<HashMap<SessionId, DashboardSession>>,
    storage: Arc<dyn StorageGateway>,
    stats: StatsAggregator,
    snapshot_limit: usize,
}

impl SessionRegistry {
    pub fn new(storage: Arc<dyn StorageGateway>, snapshot_limit: usize) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            dashboards: RwLock::new(HashMap::new()),
            storage,
            stats: StatsAggregator::new(),
            snapshot_limit,
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageGateway> {
        &self.storage
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    /// Make `session` the live session for its device ID.
    ///
    /// A previous session under the same ID is evicted and told to close;
    /// its own cleanup later finds it no longer registered and does nothing.
    pub async fn register_device(&self, session: DeviceSession) {
        let device_id = session.device_id().to_string();
        let displaced = {
            let mut devices = self.devices.write().await;
            devices.insert(device_id.clone(), session)
        };

        if let Some(old) = displaced {
            info!(
                "Device {} reconnected, closing previous session {}",
                device_id,
                old.id()
            );
            old.close();
        } else {
            info!("Device connected: {}", device_id);
        }

        self.broadcast_to_dashboards(&DashboardEvent::device_connected(device_id))
            .await;
    }

    /// Remove `session` if it is still the registered one for its device ID.
    ///
    /// Returns true when something was removed; `device_disconnected` is only
    /// broadcast in that case.
    pub async fn unregister_device(&self, session: &DeviceSession) -> bool {
        let removed = {
            let mut devices = self.devices.write().await;
            match devices.get(session.device_id()) {
                Some(current) if current.id() == session.id() => {
                    devices.remove(session.device_id());
                    true
                }
                _ => false,
            }
        };

        if removed {
            info!("Device disconnected: {}", session.device_id());
            self.broadcast_to_dashboards(&DashboardEvent::device_disconnected(
                session.device_id(),
            ))
            .await;
        } else {
            debug!(
                "Session {} for {} already replaced, skipping unregister",
                session.id(),
                session.device_id()
            );
        }
        removed
    }

    /// Send the initial snapshot and join the dashboard set.
    ///
    /// The snapshot is queued under the same lock that inserts the session,
    /// so it precedes every broadcast the dashboard will see.
    pub async fn register_dashboard(&self, session: DashboardSession) -> Result<(), DeliveryError> {
        let snapshot = DashboardEvent::InitialData {
            data: self.initial_snapshot().await,
        };
        let text: Arc<str> = match serde_json::to_string(&snapshot) {
            Ok(text) => Arc::from(text),
            Err(e) => {
                warn!("Failed to encode initial snapshot: {}", e);
                return Err(DeliveryError::Closed);
            }
        };

        let mut dashboards = self.dashboards.write().await;
        session.deliver(text)?;
        info!("Dashboard connected: {}", session.id());
        dashboards.insert(session.id(), session);
        Ok(())
    }

    pub async fn unregister_dashboard(&self, id: SessionId) -> bool {
        let removed = {
            let mut dashboards = self.dashboards.write().await;
            dashboards.remove(&id)
        };
        match removed {
            Some(session) => {
                session.close();
                info!("Dashboard disconnected: {}", id);
                true
            }
            None => false,
        }
    }

    /// Queue a frame for one device. An unknown ID or a failed delivery
    /// returns false; a failed delivery also removes the session.
    pub async fn send_to_device(&self, device_id: &str, text: Arc<str>) -> bool {
        let session = match self.device_session(device_id).await {
            Some(session) => session,
            None => {
                debug!("No live session for device {}", device_id);
                return false;
            }
        };

        match session.deliver(text) {
            Ok(()) => true,
            Err(e) => {
                warn!("Delivery to device {} failed: {}", device_id, e);
                session.close();
                self.unregister_device(&session).await;
                false
            }
        }
    }

    pub async fn device_session(&self, device_id: &str) -> Option<DeviceSession> {
        let devices = self.devices.read().await;
        devices.get(device_id).cloned()
    }

    /// Live device IDs, sorted
    pub async fn connected_device_ids(&self) -> Vec<String> {
        let devices = self.devices.read().await;
        let mut ids: Vec<String> = devices.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn dashboard_count(&self) -> usize {
        self.dashboards.read().await.len()
    }

    /// Counters plus live connection counts, without touching storage
    pub async fn relay_statistics(&self) -> RelayStatistics {
        let devices = self.device_count().await;
        let dashboards = self.dashboard_count().await;
        self.stats.report(devices, dashboards, None)
    }

    /// Relay statistics merged with persisted aggregates. A storage failure
    /// is logged and the persisted part omitted.
    pub async fn full_statistics(&self) -> RelayStatistics {
        let storage = match self.storage.statistics().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!("Failed to read storage statistics: {}", e);
                None
            }
        };
        let devices = self.device_count().await;
        let dashboards = self.dashboard_count().await;
        self.stats.report(devices, dashboards, storage)
    }

    async fn initial_snapshot(&self) -> InitialData {
        let sensor_readings = self
            .storage
            .recent_readings(self.snapshot_limit)
            .await
            .unwrap_or_else(|e| {
                warn!("Snapshot: failed to read recent readings: {}", e);
                Vec::new()
            });
        let devices = self.storage.devices().await.unwrap_or_else(|e| {
            warn!("Snapshot: failed to read device registry: {}", e);
            Vec::new()
        });

        InitialData {
            sensor_readings,
            devices,
            statistics: self.full_statistics().await,
            connected_devices: self.connected_device_ids().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmrelay_storage::SqliteStorage;
    use serde_json::Value as JsonValue;
    use tokio::sync::mpsc;

    fn registry() -> Arc<SessionRegistry> {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        Arc::new(SessionRegistry::new(storage, 100))
    }

    fn next_json(rx: &mut mpsc::Receiver<Arc<str>>) -> JsonValue {
        let text = rx.try_recv().expect("expected a queued frame");
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn test_register_device_replaces_previous() {
        let registry = registry();
        let (first, _rx1) = DeviceSession::open("DEV001", 8);
        let (second, _rx2) = DeviceSession::open("DEV001", 8);

        registry.register_device(first.clone()).await;
        registry.register_device(second.clone()).await;

        assert_eq!(registry.device_count().await, 1);
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(
            registry.device_session("DEV001").await.unwrap().id(),
            second.id()
        );
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_replacement() {
        let registry = registry();
        let (dash, mut dash_rx) = DashboardSession::open(16);
        registry.register_dashboard(dash).await.unwrap();
        assert_eq!(next_json(&mut dash_rx)["type"], "initial_data");

        let (first, _rx1) = DeviceSession::open("DEV001", 8);
        let (second, _rx2) = DeviceSession::open("DEV001", 8);
        registry.register_device(first.clone()).await;
        registry.register_device(second.clone()).await;
        assert_eq!(next_json(&mut dash_rx)["type"], "device_connected");
        assert_eq!(next_json(&mut dash_rx)["type"], "device_connected");

        assert!(!registry.unregister_device(&first).await);
        assert_eq!(registry.connected_device_ids().await, vec!["DEV001"]);
        assert!(dash_rx.try_recv().is_err(), "stale cleanup must not announce");

        assert!(registry.unregister_device(&second).await);
        let event = next_json(&mut dash_rx);
        assert_eq!(event["type"], "device_disconnected");
        assert_eq!(event["device_id"], "DEV001");
        assert_eq!(registry.device_count().await, 0);
    }

    #[tokio::test]
    async fn test_connect_storm_leaves_one_session() {
        let registry = registry();
        let mut sessions = Vec::new();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let (session, rx) = DeviceSession::open("DEV001", 8);
            sessions.push((session.clone(), rx));
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry.register_device(session).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.device_count().await, 1);
        let live = registry.device_session("DEV001").await.unwrap();
        let open: Vec<_> = sessions.iter().filter(|(s, _)| !s.is_closed()).collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].0.id(), live.id());

        for (session, _) in &sessions {
            registry.unregister_device(session).await;
        }
        assert_eq!(registry.device_count().await, 0);
    }

    #[tokio::test]
    async fn test_dashboard_snapshot_lists_connected_devices() {
        let registry = registry();
        let (device, _device_rx) = DeviceSession::open("DEV007", 8);
        registry.register_device(device).await;

        let (dash, mut rx) = DashboardSession::open(16);
        registry.register_dashboard(dash.clone()).await.unwrap();

        let snapshot = next_json(&mut rx);
        assert_eq!(snapshot["type"], "initial_data");
        assert_eq!(snapshot["data"]["connected_devices"], serde_json::json!(["DEV007"]));
        assert_eq!(snapshot["data"]["statistics"]["device_connections"], 1);
        assert!(snapshot["data"]["sensor_readings"].as_array().unwrap().is_empty());
        assert_eq!(registry.dashboard_count().await, 1);

        assert!(registry.unregister_dashboard(dash.id()).await);
        assert!(!registry.unregister_dashboard(dash.id()).await);
        assert!(dash.is_closed());
    }

    #[tokio::test]
    async fn test_send_to_unknown_device() {
        let registry = registry();
        assert!(!registry.send_to_device("NOPE", Arc::from("{}")).await);
    }

    #[tokio::test]
    async fn test_send_to_device_failure_unregisters() {
        let registry = registry();
        let (device, rx) = DeviceSession::open("DEV001", 8);
        registry.register_device(device).await;
        drop(rx);

        assert!(!registry.send_to_device("DEV001", Arc::from("{}")).await);
        assert_eq!(registry.device_count().await, 0);
    }
}
