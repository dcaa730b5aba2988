// Relay Sessions
//
// A session is the relay's handle on one live connection: who it is plus a
// bounded outbound queue drained by that connection's writer task. Sending
// never blocks the caller; a full or closed queue is a delivery failure.

use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

pub type SessionId = Uuid;

/// Why a frame could not be queued for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The peer is not draining its queue fast enough
    Full,
    /// The session has been closed or its writer is gone
    Closed,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Full => write!(f, "outbound queue full"),
            DeliveryError::Closed => write!(f, "session closed"),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Sending half shared by every clone of a session
#[derive(Debug, Clone)]
struct Outlet {
    tx: mpsc::Sender<Arc<str>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Outlet {
    fn open(capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        (
            Self {
                tx,
                shutdown: Arc::new(shutdown),
            },
            rx,
        )
    }

    fn deliver(&self, text: Arc<str>) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        self.tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    fn close(&self) {
        self.shutdown.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.shutdown.borrow() || self.tx.is_closed()
    }

    async fn closed(&self) {
        let mut signal = self.shutdown.subscribe();
        tokio::select! {
            _ = self.tx.closed() => {}
            _ = signal.wait_for(|closed| *closed) => {}
        }
    }
}

/// Live connection from one field device
#[derive(Debug, Clone)]
pub struct DeviceSession {
    id: SessionId,
    device_id: String,
    outlet: Outlet,
}

impl DeviceSession {
    /// Create a session and the receiving end its writer task drains
    pub fn open(
        device_id: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (outlet, rx) = Outlet::open(capacity);
        let session = Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            outlet,
        };
        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn deliver(&self, text: Arc<str>) -> Result<(), DeliveryError> {
        self.outlet.deliver(text)
    }

    /// Ask the connection to shut down. Idempotent.
    pub fn close(&self) {
        self.outlet.close()
    }

    pub fn is_closed(&self) -> bool {
        self.outlet.is_closed()
    }

    /// Resolves once the session is closed or its writer has gone away
    pub async fn closed(&self) {
        self.outlet.closed().await
    }

    /// Shutdown signal for the writer task
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.outlet.shutdown.subscribe()
    }
}

/// Live connection from one observer client
#[derive(Debug, Clone)]
pub struct DashboardSession {
    id: SessionId,
    outlet: Outlet,
}

impl DashboardSession {
    pub fn open(capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (outlet, rx) = Outlet::open(capacity);
        let session = Self {
            id: Uuid::new_v4(),
            outlet,
        };
        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn deliver(&self, text: Arc<str>) -> Result<(), DeliveryError> {
        self.outlet.deliver(text)
    }

    pub fn close(&self) {
        self.outlet.close()
    }

    pub fn is_closed(&self) -> bool {
        self.outlet.is_closed()
    }

    pub async fn closed(&self) {
        self.outlet.closed().await
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.outlet.shutdown.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_deliver_reaches_receiver() {
        let (session, mut rx) = DeviceSession::open("DEV001", 4);
        session.deliver(Arc::from("hello")).unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_full_queue_is_delivery_failure() {
        let (session, _rx) = DashboardSession::open(1);
        session.deliver(Arc::from("one")).unwrap();
        assert_eq!(session.deliver(Arc::from("two")), Err(DeliveryError::Full));
    }

    #[tokio::test]
    async fn test_close_rejects_and_wakes_waiters() {
        let (session, _rx) = DeviceSession::open("DEV001", 4);
        let waiter = session.clone();
        let handle = tokio::spawn(async move { waiter.closed().await });

        session.close();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("closed() should resolve")
            .unwrap();
        assert!(session.is_closed());
        assert_eq!(session.deliver(Arc::from("late")), Err(DeliveryError::Closed));
    }

    #[tokio::test]
    async fn test_dropped_receiver_closes_session() {
        let (session, rx) = DashboardSession::open(4);
        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), session.closed())
            .await
            .expect("closed() should resolve");
        assert_eq!(session.deliver(Arc::from("x")), Err(DeliveryError::Closed));
    }

    #[test]
    fn test_sessions_get_distinct_ids() {
        let (a, _) = DeviceSession::open("DEV001", 1);
        let (b, _) = DeviceSession::open("DEV001", 1);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.device_id(), b.device_id());
    }
}
