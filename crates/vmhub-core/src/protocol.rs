//! Protocol records
//!
//! [`PendingCall`] is the mutable record every interceptor sees; [`Response`]
//! is what ends up on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{HubError, Result};
use crate::identity::Identity;

/// Property path -> new value, applied in insertion order
pub type ChangeSet = Map<String, Value>;

/// Key inside a request argument whose object value is applied as initial
/// property values once the view model exists
pub const VM_ARG_KEY: &str = "$vmArg";

/// Separates the type tag from an instance name in a view-model id
pub const INSTANCE_SEPARATOR: char = '$';

/// The protocol operation a call belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Request,
    Update,
    Dispose,
    Response,
    Disconnect,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request_vm",
            Self::Update => "update_vm",
            Self::Dispose => "dispose_vm",
            Self::Response => "response_vm",
            Self::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A call in flight through the interceptor pipeline.
///
/// Interceptors may rewrite `vm_id`, `payload` and `identity` before the
/// registry sees them.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub kind: CallKind,
    pub connection_id: String,
    pub vm_id: String,
    /// Request argument, update change set, or serialized response data
    pub payload: Option<Value>,
    pub identity: Identity,
    /// Opaque headers sent alongside the message
    pub headers: Option<Value>,
}

impl PendingCall {
    fn new(
        kind: CallKind,
        connection_id: impl Into<String>,
        vm_id: impl Into<String>,
        payload: Option<Value>,
        identity: Identity,
    ) -> Self {
        Self {
            kind,
            connection_id: connection_id.into(),
            vm_id: vm_id.into(),
            payload,
            identity,
            headers: None,
        }
    }

    pub fn request(
        connection_id: impl Into<String>,
        vm_id: impl Into<String>,
        arg: Option<Value>,
        identity: Identity,
    ) -> Self {
        Self::new(CallKind::Request, connection_id, vm_id, arg, identity)
    }

    pub fn update(
        connection_id: impl Into<String>,
        vm_id: impl Into<String>,
        changes: ChangeSet,
        identity: Identity,
    ) -> Self {
        Self::new(
            CallKind::Update,
            connection_id,
            vm_id,
            Some(Value::Object(changes)),
            identity,
        )
    }

    pub fn dispose(
        connection_id: impl Into<String>,
        vm_id: impl Into<String>,
        identity: Identity,
    ) -> Self {
        Self::new(CallKind::Dispose, connection_id, vm_id, None, identity)
    }

    pub fn response(response: Response, identity: Identity) -> Self {
        Self::new(
            CallKind::Response,
            response.connection_id,
            response.vm_id,
            Some(Value::String(response.data)),
            identity,
        )
    }

    pub fn disconnect(connection_id: impl Into<String>, identity: Identity) -> Self {
        Self::new(CallKind::Disconnect, connection_id, "", None, identity)
    }

    pub fn with_headers(mut self, headers: Option<Value>) -> Self {
        self.headers = headers;
        self
    }

    /// Look up a header by name
    pub fn header(&self, name: &str) -> Option<&Value> {
        self.headers.as_ref().and_then(|headers| headers.get(name))
    }

    /// Take the payload as a change set; a missing payload is an empty set
    pub fn take_changes(&mut self) -> Result<ChangeSet> {
        match self.payload.take() {
            None | Some(Value::Null) => Ok(ChangeSet::new()),
            Some(Value::Object(changes)) => Ok(changes),
            Some(other) => Err(HubError::update(
                self.vm_id.clone(),
                "",
                format!("changes must be a JSON object, got {}", json_type(&other)),
            )),
        }
    }

    /// Take the payload as response data
    pub fn take_response_data(&mut self) -> Option<String> {
        match self.payload.take()? {
            Value::String(data) => Some(data),
            other => Some(other.to_string()),
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Outbound push of view-model state to one connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub connection_id: String,
    pub vm_id: String,
    /// Serialized payload
    pub data: String,
}

impl Response {
    pub fn new(
        connection_id: impl Into<String>,
        vm_id: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            vm_id: vm_id.into(),
            data: data.into(),
        }
    }

    pub fn from_value(
        connection_id: impl Into<String>,
        vm_id: impl Into<String>,
        value: &Value,
    ) -> Self {
        Self::new(connection_id, vm_id, value.to_string())
    }

    /// Error response carrying `{"ExceptionType", "Message"}`
    pub fn error(
        connection_id: impl Into<String>,
        vm_id: impl Into<String>,
        error: &HubError,
    ) -> Self {
        Self::new(connection_id, vm_id, error.to_wire())
    }

    /// Parse the payload back into JSON
    pub fn data_value(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// A view-model id split into its type tag and optional instance name.
///
/// `Counter` selects type `Counter`; `Counter$left` selects the same type
/// but is a distinct instance within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmId<'a> {
    raw: &'a str,
    type_name: &'a str,
    instance: Option<&'a str>,
}

impl<'a> VmId<'a> {
    pub fn parse(raw: &'a str) -> Self {
        match raw.split_once(INSTANCE_SEPARATOR) {
            Some((type_name, instance)) => Self {
                raw,
                type_name,
                instance: Some(instance),
            },
            None => Self {
                raw,
                type_name: raw,
                instance: None,
            },
        }
    }

    pub fn as_str(&self) -> &'a str {
        self.raw
    }

    pub fn type_name(&self) -> &'a str {
        self.type_name
    }

    pub fn instance(&self) -> Option<&'a str> {
        self.instance
    }
}

impl fmt::Display for VmId<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_vm_id_parse() {
        let plain = VmId::parse("Counter");
        assert_eq!(plain.type_name(), "Counter");
        assert_eq!(plain.instance(), None);

        let qualified = VmId::parse("Counter$left");
        assert_eq!(qualified.type_name(), "Counter");
        assert_eq!(qualified.instance(), Some("left"));
        assert_eq!(qualified.to_string(), "Counter$left");
    }

    #[test]
    fn test_take_changes_preserves_order() {
        let mut changes = ChangeSet::new();
        changes.insert("b".to_string(), json!(1));
        changes.insert("a".to_string(), json!(2));
        let mut call = PendingCall::update("c1", "Counter", changes, Identity::anonymous());

        let taken = call.take_changes().unwrap();
        let keys: Vec<&str> = taken.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert!(call.payload.is_none());
    }

    #[test]
    fn test_take_changes_rejects_non_object() {
        let mut call = PendingCall::request("c1", "Counter", Some(json!([1, 2])), Identity::anonymous());
        let err = call.take_changes().unwrap_err();
        assert_eq!(err.kind(), "VMUpdateError");
    }

    #[test]
    fn test_response_call_round() {
        let response = Response::new("c1", "Counter", r#"{"count":0}"#);
        let mut call = PendingCall::response(response, Identity::anonymous());
        assert_eq!(call.kind, CallKind::Response);
        assert_eq!(call.take_response_data().as_deref(), Some(r#"{"count":0}"#));
    }

    #[test]
    fn test_header_lookup() {
        let call = PendingCall::dispose("c1", "Counter", Identity::anonymous())
            .with_headers(Some(json!({"trace": "abc"})));
        assert_eq!(call.header("trace"), Some(&json!("abc")));
        assert_eq!(call.header("missing"), None);
    }

    #[test]
    fn test_error_response_payload() {
        let response = Response::error("c1", "Counter", &HubError::not_found("Counter"));
        let value = response.data_value().unwrap();
        assert_eq!(value["ExceptionType"], "VMNotFoundError");
    }
}
