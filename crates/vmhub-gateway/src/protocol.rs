//! WebSocket protocol definitions
//!
//! Every frame is a JSON text message tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use vmhub_core::ChangeSet;

/// Error code sent before closing a connection the server has no room for
pub const CAPACITY_EXCEEDED: &str = "CAPACITY_EXCEEDED";

/// Error code for frames that are not valid client messages
pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask for a view model's full state
    RequestVm {
        vm_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arg: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<Value>,
    },
    /// Apply property-path updates
    UpdateVm {
        vm_id: String,
        #[serde(default)]
        changes: ChangeSet,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<Value>,
    },
    /// Release a view model
    DisposeVm {
        vm_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<Value>,
    },
    /// Heartbeat ping
    Ping {
        /// Client timestamp
        timestamp: i64,
    },
}

/// Events sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// View-model state, delta, or a serialized error for `vm_id`
    ResponseVm {
        vm_id: String,
        /// Serialized payload
        data: String,
    },
    /// Transport-level error
    Error { code: String, message: String },
    /// Heartbeat pong
    Pong {
        /// Original timestamp
        timestamp: i64,
    },
}

impl GatewayEvent {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request_without_optionals() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"request_vm","vm_id":"Counter"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::RequestVm {
                vm_id: "Counter".to_string(),
                arg: None,
                headers: None,
            }
        );
    }

    #[test]
    fn test_parse_update_keeps_change_order() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"update_vm","vm_id":"Form","changes":{"z":1,"a":2},"headers":{"trace":"t"}}"#,
        )
        .unwrap();
        let ClientMessage::UpdateVm { changes, headers, .. } = msg else {
            panic!("expected update_vm");
        };
        let keys: Vec<&String> = changes.keys().collect();
        assert_eq!(keys, vec!["z", "a"]);
        assert_eq!(headers, Some(json!({"trace": "t"})));
    }

    #[test]
    fn test_response_event_shape() {
        let event = GatewayEvent::ResponseVm {
            vm_id: "Counter".to_string(),
            data: r#"{"count":0}"#.to_string(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "response_vm", "vm_id": "Counter", "data": "{\"count\":0}"})
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"explode"}"#).is_err());
    }
}
