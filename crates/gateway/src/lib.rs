// FarmRelay Gateway - real-time telemetry relay
//
// Devices stream sensor readings over WebSocket; every accepted reading is
// persisted and fanned out to all connected dashboards. A small HTTP API
// serves queries over the same state.

pub mod api;
pub mod broadcast;
pub mod connection;
pub mod handlers;
pub mod protocol;
pub mod registry;
pub mod retention;
pub mod server;
pub mod session;
pub mod stats;

pub use api::{build_router, serve_api};
pub use broadcast::BroadcastReport;
pub use connection::{serve_dashboard, serve_device, ConnectionOptions};
pub use handlers::RelayHandlers;
pub use protocol::*;
pub use registry::SessionRegistry;
pub use retention::spawn_retention_task;
pub use server::{GatewayConfig, GatewayServer};
pub use session::{DashboardSession, DeliveryError, DeviceSession, SessionId};
pub use stats::{RelayStatistics, StatsAggregator};
