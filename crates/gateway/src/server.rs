use crate::connection::{serve_dashboard, serve_device, ConnectionOptions};
use crate::handlers::RelayHandlers;
use crate::session::{DashboardSession, DeviceSession};
use anyhow::{Context, Result};
use farmrelay_core::ServerConfig;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// WebSocket listener settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub outbound_buffer: usize,
    pub heartbeat_interval: Option<Duration>,
    pub idle_timeout: Option<Duration>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for GatewayConfig {
    fn from(config: &ServerConfig) -> Self {
        let secs = |s: u64| (s > 0).then(|| Duration::from_secs(s));
        Self {
            outbound_buffer: config.outbound_buffer,
            heartbeat_interval: secs(config.heartbeat_interval_secs),
            idle_timeout: secs(config.idle_timeout_secs),
        }
    }
}

const MAX_DEVICE_ID_LENGTH: usize = 128;

pub fn validate_device_id(device_id: &str) -> Result<(), String> {
    if device_id.trim().is_empty() {
        return Err("Invalid device id: cannot be empty".to_string());
    }
    if device_id.len() > MAX_DEVICE_ID_LENGTH {
        return Err(format!(
            "Invalid device id: too long (max {})",
            MAX_DEVICE_ID_LENGTH
        ));
    }
    if device_id == "." || device_id.contains("..") {
        return Err("Invalid device id: path traversal sequence is not allowed".to_string());
    }
    if !device_id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | ':'))
    {
        return Err("Invalid device id: contains unsupported characters".to_string());
    }
    Ok(())
}

/// Which population a handshake path belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Device(String),
    Dashboard,
}

impl Route {
    pub fn parse(path: &str) -> Result<Self, (StatusCode, String)> {
        let path = path.trim_end_matches('/');
        if path == "/ws/dashboard" {
            return Ok(Route::Dashboard);
        }

        let device_id = path
            .strip_prefix("/ws/device/")
            .or_else(|| path.strip_prefix("/ws/esp32/"))
            .ok_or_else(|| (StatusCode::NOT_FOUND, format!("No route for {}", path)))?;
        validate_device_id(device_id).map_err(|reason| (StatusCode::BAD_REQUEST, reason))?;
        Ok(Route::Device(device_id.to_string()))
    }
}

fn reject(status: StatusCode, reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = status;
    response
}

/// WebSocket gateway for devices and dashboards
pub struct GatewayServer {
    config: GatewayConfig,
    handlers: Arc<RelayHandlers>,
    listener: TcpListener,
}

impl GatewayServer {
    pub async fn bind(
        addr: &str,
        config: GatewayConfig,
        handlers: Arc<RelayHandlers>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind WebSocket listener on {}", addr))?;
        Ok(Self {
            config,
            handlers,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!("Gateway server listening on {}", self.local_addr()?);

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let handlers = Arc::clone(&self.handlers);
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, handlers, config).await {
                            tracing::warn!("Connection from {} failed: {:#}", addr, e);
                        }
                    });
                }
                Err(e) => tracing::error!("Accept failed: {}", e),
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handlers: Arc<RelayHandlers>,
    config: GatewayConfig,
) -> Result<()> {
    let mut route = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        match Route::parse(req.uri().path()) {
            Ok(parsed) => {
                route = Some(parsed);
                Ok(resp)
            }
            Err((status, reason)) => {
                tracing::warn!("Rejecting handshake from {}: {}", addr, reason);
                Err(reject(status, reason))
            }
        }
    })
    .await
    .context("WebSocket handshake failed")?;

    let route = route.context("Handshake completed without a route")?;
    let (ws_sender, ws_receiver) = ws_stream.split();
    let options = ConnectionOptions {
        idle_timeout: config.idle_timeout,
    };

    match route {
        Route::Device(device_id) => {
            tracing::debug!("Device {} handshake from {}", device_id, addr);
            let (session, outbound) = DeviceSession::open(device_id, config.outbound_buffer);
            let writer = tokio::spawn(write_outbound(
                ws_sender,
                outbound,
                session.shutdown_signal(),
                config.heartbeat_interval,
            ));
            serve_device(handlers, session.clone(), ws_receiver, options).await;
            session.close();
            if let Err(e) = writer.await {
                tracing::error!("Device {} writer task failed: {}", session.device_id(), e);
            }
        }
        Route::Dashboard => {
            tracing::debug!("Dashboard handshake from {}", addr);
            let (session, outbound) = DashboardSession::open(config.outbound_buffer);
            let writer = tokio::spawn(write_outbound(
                ws_sender,
                outbound,
                session.shutdown_signal(),
                config.heartbeat_interval,
            ));
            serve_dashboard(handlers, session.clone(), ws_receiver, options).await;
            session.close();
            if let Err(e) = writer.await {
                tracing::error!("Dashboard {} writer task failed: {}", session.id(), e);
            }
        }
    }

    tracing::debug!("Connection from {} closed", addr);
    Ok(())
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Drain a session queue into the socket, pinging on a fixed interval
async fn write_outbound(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<Arc<str>>,
    mut shutdown: watch::Receiver<bool>,
    heartbeat: Option<Duration>,
) {
    let mut ticker = heartbeat.map(|period| tokio::time::interval_at(Instant::now() + period, period));

    loop {
        tokio::select! {
            _ = async { let _ = shutdown.wait_for(|closed| *closed).await; } => break,
            next = outbound.recv() => {
                let Some(text) = next else { break };
                if let Err(e) = sink.send(Message::Text(text.to_string().into())).await {
                    tracing::debug!("Write failed: {}", e);
                    return;
                }
            }
            _ = tick(&mut ticker) => {
                if let Err(e) = sink.send(Message::Ping(Default::default())).await {
                    tracing::debug!("Heartbeat failed: {}", e);
                    return;
                }
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
