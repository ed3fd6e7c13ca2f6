//! Error taxonomy reported back to clients.

use serde_json::{json, Value};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HubError>;

/// Errors raised while handling a protocol call.
///
/// Every variant maps to a wire kind name via [`HubError::kind`], which is
/// what clients see in the `ExceptionType` field of an error response.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("View model not found: {vm_id}")]
    NotFound { vm_id: String },

    #[error("Failed to instantiate view model '{vm_id}': {message}")]
    Instantiation { vm_id: String, message: String },

    #[error("Unauthorized: {0}")]
    Authorization(String),

    #[error("Failed to update '{path}' on view model '{vm_id}': {message}")]
    Update {
        vm_id: String,
        path: String,
        message: String,
    },

    /// Produced by an exception translator; `kind` is reported verbatim
    #[error("{message}")]
    Translated { kind: String, message: String },

    #[error("Interceptor '{name}' failed: {message}")]
    Interceptor { name: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HubError {
    pub const TRANSLATED_KIND: &'static str = "TranslatedError";

    pub fn not_found(vm_id: impl Into<String>) -> Self {
        Self::NotFound {
            vm_id: vm_id.into(),
        }
    }

    pub fn instantiation(vm_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Instantiation {
            vm_id: vm_id.into(),
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Authorization(message.into())
    }

    pub fn update(
        vm_id: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Update {
            vm_id: vm_id.into(),
            path: path.into(),
            message: message.into(),
        }
    }

    /// A translated error reported as `TranslatedError`
    pub fn translated(message: impl Into<String>) -> Self {
        Self::translated_as(Self::TRANSLATED_KIND, message)
    }

    /// A translated error reported under a custom kind name
    pub fn translated_as(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Translated {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn interceptor(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Interceptor {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Wire kind name
    pub fn kind(&self) -> &str {
        match self {
            Self::NotFound { .. } => "VMNotFoundError",
            Self::Instantiation { .. } => "VMInstantiationError",
            Self::Authorization(_) => "AuthorizationError",
            Self::Update { .. } => "VMUpdateError",
            Self::Translated { kind, .. } => kind,
            Self::Interceptor { .. } => "InterceptorError",
            Self::Serialization(_) => "SerializationError",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Whether the error belongs to the client-facing taxonomy.
    ///
    /// Interceptor, serialization and internal failures are not; they are
    /// candidates for masking by an exception translator.
    pub fn is_public(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::Instantiation { .. }
                | Self::Authorization(_)
                | Self::Update { .. }
                | Self::Translated { .. }
        )
    }

    /// `{"ExceptionType": <kind>, "Message": <text>}`
    pub fn to_payload(&self) -> Value {
        json!({
            "ExceptionType": self.kind(),
            "Message": self.to_string(),
        })
    }

    /// Serialized error payload, used as response data
    pub fn to_wire(&self) -> String {
        self.to_payload().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(HubError::not_found("Counter").kind(), "VMNotFoundError");
        assert_eq!(
            HubError::instantiation("Counter", "boom").kind(),
            "VMInstantiationError"
        );
        assert_eq!(HubError::unauthorized("no").kind(), "AuthorizationError");
        assert_eq!(HubError::translated("hidden").kind(), "TranslatedError");
        assert_eq!(
            HubError::translated_as("QuotaError", "slow down").kind(),
            "QuotaError"
        );
        assert_eq!(HubError::internal("x").kind(), "InternalError");
    }

    #[test]
    fn test_wire_payload() {
        let wire = HubError::not_found("Counter").to_wire();
        assert_eq!(
            wire,
            r#"{"ExceptionType":"VMNotFoundError","Message":"View model not found: Counter"}"#
        );
    }

    #[test]
    fn test_public_taxonomy() {
        assert!(HubError::not_found("a").is_public());
        assert!(HubError::unauthorized("a").is_public());
        assert!(!HubError::internal("a").is_public());
        assert!(!HubError::interceptor("audit", "a").is_public());
    }
}
