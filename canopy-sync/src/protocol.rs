//! JSON wire protocol between the server and this runtime.
//!
//! Every frame is a JSON object tagged by `type`:
//! ```text
//! inbound   render_full           { rev, tree }
//!           render_patch          { rev, ops[] }
//!           render_patch_compact  { rev, ops[] }   node fields may be $def / $ref
//!           render_patch_z        { rev, ops }     base64(deflate(JSON))
//!           error                 { message, traceback? }
//!           runtime_event         { ... }           passed through untouched
//! outbound  widget_event          { id, value, noRerun? }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Inbound message type tags.
pub mod kind {
    pub const RENDER_FULL: &str = "render_full";
    pub const RENDER_PATCH: &str = "render_patch";
    pub const RENDER_PATCH_COMPACT: &str = "render_patch_compact";
    pub const RENDER_PATCH_Z: &str = "render_patch_z";
    pub const ERROR: &str = "error";
    pub const RUNTIME_EVENT: &str = "runtime_event";

    pub const ALL: [&str; 6] = [
        RENDER_FULL,
        RENDER_PATCH,
        RENDER_PATCH_COMPACT,
        RENDER_PATCH_Z,
        ERROR,
        RUNTIME_EVENT,
    ];
}

/// A server-to-client frame, before any op decoding.
///
/// Node payloads and ops stay as raw JSON here; the decoder owns the
/// intern table and turns them into tree types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    RenderFull {
        #[serde(default)]
        rev: u64,
        tree: Value,
    },
    RenderPatch {
        #[serde(default)]
        rev: u64,
        ops: Vec<Value>,
    },
    RenderPatchCompact {
        #[serde(default)]
        rev: u64,
        ops: Vec<Value>,
    },
    RenderPatchZ {
        #[serde(default)]
        rev: u64,
        /// base64 of a deflate stream holding the JSON of a patch payload
        ops: String,
    },
    Error(ApplicationError),
    RuntimeEvent(Map<String, Value>),
}

/// A script-level failure reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

/// A client-to-server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    WidgetEvent {
        id: String,
        value: Value,
        #[serde(
            rename = "noRerun",
            default,
            skip_serializing_if = "std::ops::Not::not"
        )]
        no_rerun: bool,
    },
}

impl OutboundMessage {
    /// Create a widget event.
    pub fn widget_event(id: impl Into<String>, value: Value, no_rerun: bool) -> Self {
        Self::WidgetEvent {
            id: id.into(),
            value,
            no_rerun,
        }
    }

    /// Id of the widget this event belongs to.
    pub fn widget_id(&self) -> &str {
        match self {
            Self::WidgetEvent { id, .. } => id,
        }
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Serialization)
    }

    /// Parse a text frame (used by servers and test harnesses).
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Deserialization)
    }
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(serde_json::Error),
    #[error("Deserialization error: {0}")]
    Deserialization(serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_full_parses() {
        let msg: InboundMessage = serde_json::from_value(json!({
            "type": "render_full",
            "rev": 3,
            "tree": { "type": "app", "id": "root" }
        }))
        .unwrap();
        match msg {
            InboundMessage::RenderFull { rev, tree } => {
                assert_eq!(rev, 3);
                assert_eq!(tree["id"], "root");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_rev_defaults_to_zero() {
        let msg: InboundMessage =
            serde_json::from_value(json!({ "type": "render_patch", "ops": [] })).unwrap();
        assert_eq!(msg, InboundMessage::RenderPatch { rev: 0, ops: vec![] });
    }

    #[test]
    fn test_error_without_traceback() {
        let msg: InboundMessage =
            serde_json::from_value(json!({ "type": "error", "message": "boom" })).unwrap();
        assert_eq!(
            msg,
            InboundMessage::Error(ApplicationError {
                message: "boom".into(),
                traceback: None,
            })
        );
    }

    #[test]
    fn test_runtime_event_passthrough() {
        let msg: InboundMessage = serde_json::from_value(json!({
            "type": "runtime_event",
            "name": "toast",
            "payload": { "text": "saved" }
        }))
        .unwrap();
        match msg {
            InboundMessage::RuntimeEvent(fields) => {
                assert_eq!(fields["name"], "toast");
                assert_eq!(fields["payload"]["text"], "saved");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_widget_event_encoding() {
        let plain = OutboundMessage::widget_event("slider", json!(42), false);
        let encoded: Value = serde_json::from_str(&plain.encode().unwrap()).unwrap();
        assert_eq!(encoded, json!({ "type": "widget_event", "id": "slider", "value": 42 }));

        let quiet = OutboundMessage::widget_event("slider", json!(42), true);
        let encoded: Value = serde_json::from_str(&quiet.encode().unwrap()).unwrap();
        assert_eq!(encoded["noRerun"], true);
    }

    #[test]
    fn test_widget_event_decode() {
        let msg = OutboundMessage::decode(r#"{"type":"widget_event","id":"b","value":true}"#).unwrap();
        assert_eq!(msg.widget_id(), "b");
        assert!(OutboundMessage::decode("not json").is_err());
    }
}
