//! WebSocket connection management
//!
//! Tracks live connections and their outbound queues. The pool is also the
//! [`Transport`] the session gateway pushes through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::protocol::GatewayEvent;
use crate::transport::{Transport, TransportError};

/// Handle to a WebSocket connection for sending messages
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Connection ID
    pub id: String,
    /// Client address
    pub addr: SocketAddr,
    /// When the connection was accepted
    pub connected_at: DateTime<Utc>,
    /// Channel for sending events to the connection
    sender: mpsc::UnboundedSender<GatewayEvent>,
    /// Last sign of life from the client
    last_seen: Arc<RwLock<Instant>>,
}

impl ConnectionHandle {
    pub fn new(id: String, addr: SocketAddr, sender: mpsc::UnboundedSender<GatewayEvent>) -> Self {
        Self {
            id,
            addr,
            connected_at: Utc::now(),
            sender,
            last_seen: Arc::new(RwLock::new(Instant::now())),
        }
    }

    /// Queue an event for this connection
    pub fn send(&self, event: GatewayEvent) -> Result<(), TransportError> {
        self.sender.send(event).map_err(|_| TransportError::Closed)
    }

    /// Record client activity for the heartbeat
    pub async fn touch(&self) {
        *self.last_seen.write().await = Instant::now();
    }

    pub async fn time_since_seen(&self) -> Duration {
        self.last_seen.read().await.elapsed()
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Longest heartbeat interval a pool will use
const MAX_HEARTBEAT_INTERVAL: u64 = 24 * 60 * 60;

/// Manages all WebSocket connections
#[derive(Debug)]
pub struct ConnectionPool {
    connections: DashMap<String, ConnectionHandle>,
    max_connections: usize,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
}

impl ConnectionPool {
    /// `heartbeat_interval_secs` is clamped to `1..=86400`
    pub fn new(max_connections: usize, heartbeat_interval_secs: u64) -> Self {
        let secs = heartbeat_interval_secs.clamp(1, MAX_HEARTBEAT_INTERVAL);
        Self {
            connections: DashMap::new(),
            max_connections,
            heartbeat_interval: Duration::from_secs(secs),
            heartbeat_timeout: Duration::from_secs(secs.saturating_mul(3)),
        }
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_full(&self) -> bool {
        self.count() >= self.max_connections
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// A client silent for this long is dropped
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    pub fn add(&self, handle: ConnectionHandle) {
        debug!(connection_id = %handle.id, addr = %handle.addr, "Connection added to pool");
        self.connections.insert(handle.id.clone(), handle);
    }

    pub fn remove(&self, connection_id: &str) -> Option<ConnectionHandle> {
        self.connections.remove(connection_id).map(|(_, handle)| handle)
    }

    pub fn get(&self, connection_id: &str) -> Option<ConnectionHandle> {
        self.connections
            .get(connection_id)
            .map(|entry| entry.value().clone())
    }

    /// Send an event to a specific connection
    pub fn send_to(&self, connection_id: &str, event: GatewayEvent) -> Result<(), TransportError> {
        match self.connections.get(connection_id) {
            Some(handle) => handle.send(event),
            None => Err(TransportError::NotFound(connection_id.to_string())),
        }
    }

    pub fn list_connections(&self) -> Vec<String> {
        self.connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

#[async_trait]
impl Transport for ConnectionPool {
    async fn send(&self, connection_id: &str, vm_id: &str, data: String) -> Result<(), TransportError> {
        self.send_to(
            connection_id,
            GatewayEvent::ResponseVm {
                vm_id: vm_id.to_string(),
                data,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_pool_routes_to_connection() {
        let pool = ConnectionPool::new(2, 30);
        let (tx, mut rx) = mpsc::unbounded_channel();
        pool.add(ConnectionHandle::new("c1".to_string(), addr(), tx));

        Transport::send(&pool, "c1", "Counter", "{}".to_string())
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            GatewayEvent::ResponseVm {
                vm_id: "Counter".to_string(),
                data: "{}".to_string(),
            }
        );

        let err = pool.send_to("missing", GatewayEvent::Pong { timestamp: 0 }).unwrap_err();
        assert!(matches!(err, TransportError::NotFound(_)));
    }

    #[test]
    fn test_capacity() {
        let pool = ConnectionPool::new(1, 30);
        assert!(!pool.is_full());
        let (tx, _rx) = mpsc::unbounded_channel();
        pool.add(ConnectionHandle::new("c1".to_string(), addr(), tx));
        assert!(pool.is_full());
        assert_eq!(pool.heartbeat_timeout(), Duration::from_secs(90));

        pool.remove("c1");
        assert_eq!(pool.count(), 0);
    }

    #[test]
    fn test_heartbeat_interval_is_clamped() {
        let pool = ConnectionPool::new(1, u64::MAX);
        assert_eq!(pool.heartbeat_interval(), Duration::from_secs(MAX_HEARTBEAT_INTERVAL));
        assert_eq!(
            pool.heartbeat_timeout(),
            Duration::from_secs(MAX_HEARTBEAT_INTERVAL * 3)
        );

        let pool = ConnectionPool::new(1, 0);
        assert_eq!(pool.heartbeat_interval(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new("c1".to_string(), addr(), tx);
        drop(rx);
        assert!(matches!(
            handle.send(GatewayEvent::Pong { timestamp: 1 }),
            Err(TransportError::Closed)
        ));
    }
}
