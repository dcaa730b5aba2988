// Connection Lifecycles
//
// Reader loops for device and dashboard connections. Each loop is driven by
// an inbound message stream; replies go out through the session queue.
// Cleanup runs after the loop task finishes, including when it panics.

use crate::handlers::RelayHandlers;
use crate::protocol::DeviceAck;
use crate::session::{DashboardSession, DeviceSession};
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionOptions {
    /// Close a connection that sends nothing for this long
    pub idle_timeout: Option<Duration>,
}

enum Frame {
    Text(String),
    /// Binary frame that is not UTF-8
    Invalid,
    Skip,
    End(String),
}

async fn recv_frame<S>(inbound: &mut S, idle_timeout: Option<Duration>) -> Frame
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let next = match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, inbound.next()).await {
            Ok(next) => next,
            Err(_) => return Frame::End(format!("idle for {}s", limit.as_secs())),
        },
        None => inbound.next().await,
    };

    match next {
        None => Frame::End("stream ended".to_string()),
        Some(Err(e)) => Frame::End(format!("transport error: {}", e)),
        Some(Ok(Message::Text(text))) => Frame::Text(text.to_string()),
        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Frame::Text(text),
            Err(_) => Frame::Invalid,
        },
        Some(Ok(Message::Close(_))) => Frame::End("peer closed".to_string()),
        // ping/pong are answered by the protocol layer
        Some(Ok(_)) => Frame::Skip,
    }
}

fn encode<T: Serialize>(value: &T) -> Option<Arc<str>> {
    match serde_json::to_string(value) {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            error!("Failed to encode reply: {}", e);
            None
        }
    }
}

/// Run a device connection from registration to cleanup
pub async fn serve_device<S>(
    handlers: Arc<RelayHandlers>,
    session: DeviceSession,
    inbound: S,
    options: ConnectionOptions,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin + Send + 'static,
{
    let registry = Arc::clone(handlers.registry());
    registry.register_device(session.clone()).await;

    let reader = tokio::spawn(device_loop(handlers, session.clone(), inbound, options));
    if let Err(e) = reader.await {
        error!("Device {} reader task failed: {}", session.device_id(), e);
    }

    session.close();
    registry.unregister_device(&session).await;
}

async fn device_loop<S>(
    handlers: Arc<RelayHandlers>,
    session: DeviceSession,
    mut inbound: S,
    options: ConnectionOptions,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = session.closed() => {
                debug!("Device session {} closed", session.id());
                break;
            }
            frame = recv_frame(&mut inbound, options.idle_timeout) => frame,
        };

        let ack = match frame {
            Frame::Text(text) => handlers.device_frame(session.device_id(), &text).await,
            Frame::Invalid => {
                warn!("Non UTF-8 frame from {}", session.device_id());
                DeviceAck::error("Invalid JSON format")
            }
            Frame::Skip => continue,
            Frame::End(reason) => {
                info!("Device {} connection ended: {}", session.device_id(), reason);
                break;
            }
        };

        let Some(reply) = encode(&ack) else { continue };
        if let Err(e) = session.deliver(reply) {
            warn!("Could not acknowledge {}: {}", session.device_id(), e);
            break;
        }
    }
}

/// Run a dashboard connection from snapshot to cleanup
pub async fn serve_dashboard<S>(
    handlers: Arc<RelayHandlers>,
    session: DashboardSession,
    inbound: S,
    options: ConnectionOptions,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin + Send + 'static,
{
    let registry = Arc::clone(handlers.registry());
    if let Err(e) = registry.register_dashboard(session.clone()).await {
        warn!("Dashboard {} rejected: {}", session.id(), e);
        session.close();
        return;
    }

    let reader = tokio::spawn(dashboard_loop(handlers, session.clone(), inbound, options));
    if let Err(e) = reader.await {
        error!("Dashboard {} reader task failed: {}", session.id(), e);
    }

    session.close();
    registry.unregister_dashboard(session.id()).await;
}

async fn dashboard_loop<S>(
    handlers: Arc<RelayHandlers>,
    session: DashboardSession,
    mut inbound: S,
    options: ConnectionOptions,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = session.closed() => {
                debug!("Dashboard session {} closed", session.id());
                break;
            }
            frame = recv_frame(&mut inbound, options.idle_timeout) => frame,
        };

        let text = match frame {
            Frame::Text(text) => text,
            Frame::Invalid => {
                warn!("Ignoring non UTF-8 frame from dashboard {}", session.id());
                continue;
            }
            Frame::Skip => continue,
            Frame::End(reason) => {
                info!("Dashboard {} connection ended: {}", session.id(), reason);
                break;
            }
        };

        let Some(reply) = handlers.dashboard_frame(&text).await else {
            continue;
        };
        let Some(reply) = encode(&reply) else { continue };
        if let Err(e) = session.deliver(reply) {
            warn!("Could not reply to dashboard {}: {}", session.id(), e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use farmrelay_storage::SqliteStorage;
    use serde_json::Value as JsonValue;
    use tokio::sync::mpsc;

    fn handlers() -> Arc<RelayHandlers> {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        Arc::new(RelayHandlers::new(Arc::new(SessionRegistry::new(storage, 100))))
    }

    fn scripted(frames: Vec<&str>) -> impl Stream<Item = Result<Message, WsError>> + Unpin + Send + 'static {
        let messages: Vec<_> = frames
            .into_iter()
            .map(|f| Ok(Message::Text(f.to_string().into())))
            .collect();
        futures_util::stream::iter(messages)
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<str>>) -> Vec<JsonValue> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_device_session_acks_and_cleans_up() {
        let handlers = handlers();
        let (dash, mut dash_rx) = DashboardSession::open(64);
        handlers.registry().register_dashboard(dash).await.unwrap();

        let (device, mut device_rx) = DeviceSession::open("DEV001", 64);
        let inbound = scripted(vec!["{oops", r#"{"heart_rate": 72}"#]);
        serve_device(Arc::clone(&handlers), device, inbound, ConnectionOptions::default()).await;

        let acks = drain(&mut device_rx);
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[0]["status"], "error");
        assert_eq!(acks[1]["status"], "ok");

        let kinds: Vec<_> = drain(&mut dash_rx)
            .into_iter()
            .map(|e| e["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            kinds,
            vec!["initial_data", "device_connected", "sensor_data", "device_disconnected"]
        );
        assert_eq!(handlers.registry().device_count().await, 0);
    }

    #[tokio::test]
    async fn test_readings_fan_out_in_order_to_every_dashboard() {
        let handlers = handlers();
        let (first, mut first_rx) = DashboardSession::open(64);
        let (second, mut second_rx) = DashboardSession::open(64);
        handlers.registry().register_dashboard(first).await.unwrap();
        handlers.registry().register_dashboard(second).await.unwrap();

        let rates: [i64; 6] = [61, 62, 63, 64, 65, 66];
        let frames: Vec<String> = rates
            .iter()
            .map(|rate| format!(r#"{{"heart_rate": {}}}"#, rate))
            .collect();
        let (device, mut device_rx) = DeviceSession::open("DEV001", 64);
        let inbound = scripted(frames.iter().map(String::as_str).collect());
        serve_device(Arc::clone(&handlers), device, inbound, ConnectionOptions::default()).await;

        let acks = drain(&mut device_rx);
        assert_eq!(acks.len(), rates.len());
        assert!(acks.iter().all(|ack| ack["status"] == "ok"));

        for rx in [&mut first_rx, &mut second_rx] {
            let seen: Vec<i64> = drain(rx)
                .into_iter()
                .filter(|e| e["type"] == "sensor_data")
                .map(|e| e["data"]["heart_rate"].as_i64().unwrap())
                .collect();
            assert_eq!(seen, rates);
        }

        let rows = handlers
            .registry()
            .storage()
            .device_readings("DEV001", 100)
            .await
            .unwrap();
        assert_eq!(rows.len(), rates.len());
        assert_eq!(handlers.registry().stats().total_messages(), rates.len() as u64);
    }

    #[tokio::test]
    async fn test_binary_frames_must_be_utf8() {
        let handlers = handlers();
        let (device, mut device_rx) = DeviceSession::open("DEV001", 8);
        let inbound = futures_util::stream::iter(vec![
            Ok(Message::Binary(vec![0xff, 0xfe, b'{', b'}'].into())),
            Ok(Message::Binary(br#"{"spo2": 97}"#.to_vec().into())),
        ]);
        serve_device(Arc::clone(&handlers), device, inbound, ConnectionOptions::default()).await;

        let acks = drain(&mut device_rx);
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[0]["status"], "error");
        assert_eq!(acks[1]["status"], "ok");
        assert_eq!(handlers.registry().stats().total_messages(), 1);
    }

    #[tokio::test]
    async fn test_dashboard_session_replies_in_order() {
        let handlers = handlers();
        let (dash, mut rx) = DashboardSession::open(64);
        let inbound = scripted(vec![
            r#"{"type":"ping"}"#,
            "not json",
            r#"{"type":"unknown_thing"}"#,
            r#"{"type":"get_stats"}"#,
        ]);
        serve_dashboard(Arc::clone(&handlers), dash, inbound, ConnectionOptions::default()).await;

        let kinds: Vec<_> = drain(&mut rx)
            .into_iter()
            .map(|e| e["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(kinds, vec!["initial_data", "pong", "statistics"]);
        assert_eq!(handlers.registry().dashboard_count().await, 0);
    }

    #[tokio::test]
    async fn test_idle_timeout_ends_connection() {
        let handlers = handlers();
        let (device, _rx) = DeviceSession::open("DEV001", 8);
        let inbound = futures_util::stream::pending::<Result<Message, WsError>>();
        let options = ConnectionOptions {
            idle_timeout: Some(Duration::from_millis(50)),
        };

        tokio::time::timeout(
            Duration::from_secs(2),
            serve_device(Arc::clone(&handlers), device, inbound, options),
        )
        .await
        .expect("idle connection should be closed");
        assert_eq!(handlers.registry().device_count().await, 0);
    }

    #[tokio::test]
    async fn test_replaced_device_loop_exits() {
        let handlers = handlers();
        let (first, _rx1) = DeviceSession::open("DEV001", 8);
        let pending = futures_util::stream::pending::<Result<Message, WsError>>();
        let task = tokio::spawn(serve_device(
            Arc::clone(&handlers),
            first,
            pending,
            ConnectionOptions::default(),
        ));

        while handlers.registry().device_count().await == 0 {
            tokio::task::yield_now().await;
        }
        let (second, _rx2) = DeviceSession::open("DEV001", 8);
        let second_id = second.id();
        handlers.registry().register_device(second).await;

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("evicted session should exit")
            .unwrap();
        let live = handlers.registry().device_session("DEV001").await.unwrap();
        assert_eq!(live.id(), second_id);
    }
}
