//! vmhub gateway
//!
//! [`SessionGateway`] is what a transport calls for every inbound message
//! and disconnect: it resolves the connection's registry, runs the call
//! through the interceptor pipeline and sends pushes and error responses
//! back through a [`Transport`]. [`WsServer`] is a ready-made WebSocket
//! transport speaking the JSON protocol in [`protocol`].

pub mod connection;
pub mod gateway;
pub mod protocol;
pub mod resolver;
pub mod server;
pub mod transport;

pub use connection::{ConnectionHandle, ConnectionPool};
pub use gateway::{GatewayOptions, InboundContext, SessionGateway};
pub use protocol::{ClientMessage, GatewayEvent};
pub use resolver::{AnonymousResolver, IdentityResolver};
pub use server::{GatewayError, WsConfig, WsServer};
pub use transport::{ChannelTransport, Transport, TransportError};
