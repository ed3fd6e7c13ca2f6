//! The send primitive the gateway needs from a transport

use async_trait::async_trait;
use tokio::sync::mpsc;

use vmhub_core::Response;

/// Transport-related errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,
    #[error("Connection not found: {0}")]
    NotFound(String),
}

/// Per-connection send primitive
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, connection_id: &str, vm_id: &str, data: String) -> Result<(), TransportError>;
}

/// Transport that hands every response to a channel.
///
/// Handy for embedding the gateway behind a custom transport loop, and in
/// tests.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Response>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Response>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, connection_id: &str, vm_id: &str, data: String) -> Result<(), TransportError> {
        self.tx
            .send(Response::new(connection_id, vm_id, data))
            .map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_transport() {
        let (transport, mut rx) = ChannelTransport::new();
        transport.send("c1", "Counter", "{}".to_string()).await.unwrap();

        let response = rx.recv().await.unwrap();
        assert_eq!(response, Response::new("c1", "Counter", "{}"));

        drop(rx);
        assert!(matches!(
            transport.send("c1", "Counter", "{}".to_string()).await,
            Err(TransportError::Closed)
        ));
    }
}
