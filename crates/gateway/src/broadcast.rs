// Dashboard Broadcast
//
// Fan an event out to every dashboard. The frame is encoded once, the
// recipient set is snapshotted under a read lock, and sessions that fail
// delivery are removed after the pass.

use crate::protocol::DashboardEvent;
use crate::registry::SessionRegistry;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of one broadcast pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub pruned: usize,
}

impl SessionRegistry {
    pub async fn broadcast_to_dashboards(&self, event: &DashboardEvent) -> BroadcastReport {
        let text: Arc<str> = match serde_json::to_string(event) {
            Ok(text) => Arc::from(text),
            Err(e) => {
                warn!("Failed to encode {} event: {}", event.kind(), e);
                return BroadcastReport::default();
            }
        };

        let recipients: Vec<_> = {
            let dashboards = self.dashboards.read().await;
            dashboards.values().cloned().collect()
        };

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for session in &recipients {
            match session.deliver(Arc::clone(&text)) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Dropping dashboard {}: {}", session.id(), e);
                    failed.push(session.id());
                }
            }
        }

        for id in failed {
            if self.unregister_dashboard(id).await {
                report.pruned += 1;
            }
        }

        debug!(
            "Broadcast {} to {} dashboards ({} pruned)",
            event.kind(),
            report.delivered,
            report.pruned
        );
        report
    }
}
