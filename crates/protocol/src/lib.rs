//! Host ↔ extension message protocol.
//!
//! Every interaction between the host and a sandboxed extension is a JSON
//! message of the shape `{id?, type, action, payload?}`:
//!
//! - `request`: either side asks the other to perform `action`
//! - `response`: answer to a request, correlated by `id`
//! - `event`: fire-and-forget push from host to extension

use serde::{Deserialize, Serialize};

// ── Constants ────────────────────────────────────────────────────────────────

/// Inbound messages larger than this (serialized) are dropped unread.
pub const MAX_PAYLOAD_BYTES: usize = 1_048_576; // 1 MB

// ── Message ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Event,
}

/// A single protocol message, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ExtensionMessage {
    pub fn request(
        id: impl Into<String>,
        action: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Some(id.into()),
            kind: MessageType::Request,
            action: action.into(),
            payload: Some(payload),
        }
    }

    pub fn response(
        id: impl Into<String>,
        action: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Some(id.into()),
            kind: MessageType::Response,
            action: action.into(),
            payload: Some(payload),
        }
    }

    /// A response carrying the standard `{error}` payload.
    pub fn error_response(
        id: impl Into<String>,
        action: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::response(id, action, ErrorPayload::new(message).into_value())
    }

    pub fn event(action: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: None,
            kind: MessageType::Event,
            action: action.into(),
            payload: Some(payload),
        }
    }

    /// Payload, or `null` when absent.
    pub fn payload_or_null(&self) -> serde_json::Value {
        self.payload.clone().unwrap_or(serde_json::Value::Null)
    }
}

// ── Error shape ──────────────────────────────────────────────────────────────

/// The only failure payload a response ever carries.
///
/// Responses with this shape are delivered to the requester like any other
/// payload; callers inspect it with [`ErrorPayload::from_value`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }

    pub fn into_value(self) -> serde_json::Value {
        serde_json::json!({ "error": self.error })
    }

    /// Returns the error message if `value` is an `{error: string}` object.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        value
            .as_object()
            .and_then(|obj| obj.get("error"))
            .and_then(|e| e.as_str())
            .map(Self::new)
    }
}

// ── Lifecycle events ─────────────────────────────────────────────────────────

/// Reserved host → extension lifecycle actions, sent as `event` messages.
pub mod lifecycle {
    use serde::{Deserialize, Serialize};

    /// Sent right after the bridge attaches: declared capabilities + context.
    pub const INIT: &str = "lifecycle:init";
    /// Sent once the context is attached to the host surface.
    pub const MOUNTED: &str = "lifecycle:mounted";
    /// Host-side context (selection, route, theme, ...) changed.
    pub const CONTEXT_CHANGED: &str = "lifecycle:context-changed";
    /// Sent before the bridge detaches and the context is destroyed.
    pub const UNLOADING: &str = "lifecycle:unloading";

    pub const ALL: &[&str] = &[INIT, MOUNTED, CONTEXT_CHANGED, UNLOADING];

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct InitPayload {
        pub extension_id: String,
        pub capabilities: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub context: Option<serde_json::Value>,
    }

    pub fn is_lifecycle_action(action: &str) -> bool {
        ALL.contains(&action)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn request_wire_shape() {
        let msg = ExtensionMessage::request("r1", "data:query", json!({"q": 1}));
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v,
            json!({"id": "r1", "type": "request", "action": "data:query", "payload": {"q": 1}})
        );
    }

    #[test]
    fn event_omits_id() {
        let v = serde_json::to_value(ExtensionMessage::event(lifecycle::MOUNTED, json!({}))).unwrap();
        assert!(v.get("id").is_none());
        assert_eq!(v["type"], "event");
    }

    #[test]
    fn parses_message_without_payload() {
        let msg: ExtensionMessage =
            serde_json::from_value(json!({"type": "response", "id": "x", "action": "a"})).unwrap();
        assert_eq!(msg.kind, MessageType::Response);
        assert_eq!(msg.payload_or_null(), serde_json::Value::Null);
    }

    #[test]
    fn rejects_unknown_type() {
        let parsed =
            serde_json::from_value::<ExtensionMessage>(json!({"type": "shout", "action": "a"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn error_payload_detection() {
        let msg = ExtensionMessage::error_response("1", "storage:set", "permission denied");
        let payload = msg.payload.unwrap();
        assert_eq!(
            ErrorPayload::from_value(&payload),
            Some(ErrorPayload::new("permission denied"))
        );
        assert_eq!(ErrorPayload::from_value(&json!({"error": 5})), None);
        assert_eq!(ErrorPayload::from_value(&json!(["error"])), None);
    }

    #[test]
    fn init_payload_is_camel_case() {
        let init = lifecycle::InitPayload {
            extension_id: "demo".into(),
            capabilities: vec!["data:query".into()],
            context: None,
        };
        let v = serde_json::to_value(init).unwrap();
        assert_eq!(v, json!({"extensionId": "demo", "capabilities": ["data:query"]}));
        assert!(lifecycle::is_lifecycle_action("lifecycle:init"));
        assert!(!lifecycle::is_lifecycle_action("data:query"));
    }
}
