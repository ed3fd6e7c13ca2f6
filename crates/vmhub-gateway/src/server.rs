//! WebSocket server
//!
//! Accepts connections, decodes [`ClientMessage`]s and hands them to the
//! [`SessionGateway`]. Messages from one connection are processed one at a
//! time in arrival order.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use vmhub_core::ViewModelTypes;
use vmhub_observability::create_connection_span;
use vmhub_pipeline::Pipeline;

use crate::connection::{ConnectionHandle, ConnectionPool};
use crate::gateway::{GatewayOptions, InboundContext, SessionGateway};
use crate::protocol::{ClientMessage, GatewayEvent, CAPACITY_EXCEEDED, INVALID_MESSAGE};
use crate::resolver::IdentityResolver;
use crate::transport::{Transport, TransportError};

/// WebSocket server configuration
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Bind address (e.g., "127.0.0.1:18790")
    pub bind: String,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:18790".to_string(),
            max_connections: 1000,
            heartbeat_interval_secs: 30,
        }
    }
}

/// The WebSocket front end
#[derive(Clone)]
pub struct WsServer {
    config: WsConfig,
    gateway: SessionGateway,
    pool: Arc<ConnectionPool>,
    resolver: Arc<dyn IdentityResolver>,
}

impl std::fmt::Debug for WsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsServer")
            .field("config", &self.config)
            .field("gateway", &self.gateway)
            .field("connections", &self.pool.count())
            .finish()
    }
}

impl WsServer {
    pub fn new(
        config: WsConfig,
        gateway: SessionGateway,
        pool: Arc<ConnectionPool>,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self {
            config,
            gateway,
            pool,
            resolver,
        }
    }

    /// Wire a gateway that pushes through this server's connection pool.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(
        config: WsConfig,
        types: ViewModelTypes,
        pipeline: Pipeline,
        options: GatewayOptions,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(
            config.max_connections,
            config.heartbeat_interval_secs,
        ));
        let transport: Arc<dyn Transport> = pool.clone();
        let gateway = SessionGateway::new(types, pipeline, transport, options);
        Self::new(config, gateway, pool, resolver)
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    pub fn gateway(&self) -> &SessionGateway {
        &self.gateway
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Bind the configured address and serve forever
    pub async fn run(&self) -> Result<(), GatewayError> {
        let addr: SocketAddr = self.config.bind.parse()?;
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GatewayError> {
        info!("vmhub listening on ws://{}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            debug!("New connection from {}", peer_addr);

            if self.pool.is_full() {
                warn!("Connection pool full, rejecting {}", peer_addr);
                let _ = self.reject_connection(stream, "Server at capacity").await;
                continue;
            }

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                    error!("Connection error for {}: {}", peer_addr, e);
                }
            });
        }
    }

    /// Reject a connection with an error message
    async fn reject_connection(&self, stream: TcpStream, reason: &str) -> Result<(), GatewayError> {
        let ws_stream = accept_async(stream).await?;
        let (mut sender, _) = ws_stream.split();
        let json = serde_json::to_string(&GatewayEvent::error(CAPACITY_EXCEEDED, reason))?;
        sender.send(Message::Text(json)).await?;
        sender.close().await?;
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), GatewayError> {
        let ws_stream = accept_async(stream).await?;
        let (mut sender, mut receiver) = ws_stream.split();
        let connection_id = Uuid::new_v4().to_string();
        let span = create_connection_span(&connection_id, addr);

        let (tx, mut rx) = mpsc::unbounded_channel::<GatewayEvent>();
        let handle = ConnectionHandle::new(connection_id.clone(), addr, tx);
        self.pool.add(handle.clone());
        info!(parent: &span, "Connection opened");

        let (work_tx, work_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let worker = tokio::spawn(
            process_messages(
                self.gateway.clone(),
                handle.clone(),
                Arc::clone(&self.resolver),
                work_rx,
            )
            .instrument(span.clone()),
        );

        let heartbeat_interval = self.pool.heartbeat_interval();
        let heartbeat_timeout = self.pool.heartbeat_timeout();
        let mut heartbeat = interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        async {
            loop {
                tokio::select! {
                    Some(event) = rx.recv() => {
                        match serde_json::to_string(&event) {
                            Ok(json) => {
                                if let Err(e) = sender.send(Message::Text(json)).await {
                                    error!("Failed to send: {}", e);
                                    break;
                                }
                            }
                            Err(e) => error!("Failed to serialize event: {}", e),
                        }
                    }

                    msg = receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                handle.touch().await;
                                match serde_json::from_str::<ClientMessage>(&text) {
                                    Ok(ClientMessage::Ping { timestamp }) => {
                                        let _ = handle.send(GatewayEvent::Pong { timestamp });
                                    }
                                    Ok(message) => {
                                        if work_tx.send(message).is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        warn!("Invalid message: {}", e);
                                        let _ = handle.send(GatewayEvent::error(
                                            INVALID_MESSAGE,
                                            format!("Failed to parse message: {}", e),
                                        ));
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                handle.touch().await;
                                if sender.send(Message::Pong(data)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Pong(_))) => handle.touch().await,
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Connection closed by client");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!("WebSocket error: {}", e);
                                break;
                            }
                        }
                    }

                    _ = heartbeat.tick() => {
                        if handle.time_since_seen().await > heartbeat_timeout {
                            warn!("Heartbeat timeout");
                            break;
                        }
                        if sender.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        .instrument(span.clone())
        .await;

        // queued messages still run; their pushes find no connection
        self.pool.remove(&connection_id);
        drop(work_tx);
        if let Err(e) = worker.await {
            error!(parent: &span, "Message worker failed: {}", e);
        }

        let identity = self.resolver.resolve(&handle);
        self.gateway
            .disconnect(InboundContext::new(connection_id, identity))
            .instrument(span.clone())
            .await;
        let _ = sender.close().await;
        info!(parent: &span, "Connection closed");

        Ok(())
    }
}

async fn process_messages(
    gateway: SessionGateway,
    handle: ConnectionHandle,
    resolver: Arc<dyn IdentityResolver>,
    mut rx: mpsc::UnboundedReceiver<ClientMessage>,
) {
    while let Some(message) = rx.recv().await {
        let ctx = InboundContext::new(handle.id(), resolver.resolve(&handle));
        // failures are already reported to the client
        match message {
            ClientMessage::RequestVm { vm_id, arg, headers } => {
                let _ = gateway.request_vm(ctx.with_headers(headers), vm_id, arg).await;
            }
            ClientMessage::UpdateVm {
                vm_id,
                changes,
                headers,
            } => {
                let _ = gateway
                    .update_vm(ctx.with_headers(headers), vm_id, changes)
                    .await;
            }
            ClientMessage::DisposeVm { vm_id, headers } => {
                gateway.dispose_vm(ctx.with_headers(headers), vm_id).await;
            }
            ClientMessage::Ping { .. } => {}
        }
    }
}

/// WebSocket server errors
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
