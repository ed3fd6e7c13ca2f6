//! Caller identity attached to a single protocol call.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// The principal a call is made on behalf of.
///
/// Resolved by the transport for every inbound message and carried by value
/// through the pipeline, so two calls never share one. The core does not
/// interpret subjects, roles or claims; filters and interceptors do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Subject name, `None` for anonymous callers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Role names granted to the subject
    #[serde(default)]
    pub roles: BTreeSet<String>,
    /// Free-form claims
    #[serde(default)]
    pub claims: Map<String, Value>,
}

impl Identity {
    /// An identity with no subject, roles or claims
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// An identity for a named subject
    pub fn user(subject: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
            ..Self::default()
        }
    }

    /// Add a role
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// Add a claim
    pub fn with_claim(mut self, key: impl Into<String>, value: Value) -> Self {
        self.claims.insert(key.into(), value);
        self
    }

    pub fn is_anonymous(&self) -> bool {
        self.subject.is_none()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn claim(&self, key: &str) -> Option<&Value> {
        self.claims.get(key)
    }

    /// Subject name for logging, `anonymous` when absent
    pub fn display_name(&self) -> &str {
        self.subject.as_deref().unwrap_or("anonymous")
    }
}
