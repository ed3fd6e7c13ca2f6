//! Ambient identity for inbound WebSocket messages

use vmhub_core::Identity;

use crate::connection::ConnectionHandle;

/// Resolves the identity a message is processed under.
///
/// Called once per inbound message, so a resolver may return different
/// identities over a connection's lifetime.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, connection: &ConnectionHandle) -> Identity;
}

/// Treats every caller as anonymous
#[derive(Debug, Default, Clone)]
pub struct AnonymousResolver;

impl IdentityResolver for AnonymousResolver {
    fn resolve(&self, _connection: &ConnectionHandle) -> Identity {
        Identity::anonymous()
    }
}
