// src/live_query/protocol.rs

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent from the client to the live-query server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// First frame on every connection. The server answers `connected`.
    Connect {
        application_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        master_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        javascript_key: Option<String>,
    },

    Subscribe {
        request_id: u64,
        /// `{className, where, keys?}`
        query: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
    },

    Unsubscribe { request_id: u64 },
}

/// Frames sent from the live-query server to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Connected {
        #[serde(default)]
        client_id: Option<String>,
    },

    Subscribed { request_id: u64 },

    Unsubscribed { request_id: u64 },

    Create {
        request_id: u64,
        object: Value,
        #[serde(default)]
        original: Option<Value>,
    },

    Enter {
        request_id: u64,
        object: Value,
        #[serde(default)]
        original: Option<Value>,
    },

    Update {
        request_id: u64,
        object: Value,
        #[serde(default)]
        original: Option<Value>,
    },

    Leave {
        request_id: u64,
        object: Value,
        #[serde(default)]
        original: Option<Value>,
    },

    Delete {
        request_id: u64,
        object: Value,
        #[serde(default)]
        original: Option<Value>,
    },

    Error {
        #[serde(default)]
        code: Option<i64>,
        #[serde(default)]
        error: Option<String>,
        /// Whether the client may reconnect after this error
        #[serde(default = "default_reconnect")]
        reconnect: bool,
        #[serde(default)]
        request_id: Option<u64>,
    },
}

fn default_reconnect() -> bool {
    true
}

/// Kind of an entity mutation event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Enter,
    Update,
    Leave,
    Delete,
}

/// An entity mutation frame, split out of [`ServerMessage`].
#[derive(Debug, Clone, PartialEq)]
pub struct EventFrame {
    pub request_id: u64,
    pub kind: EventKind,
    pub object: Value,
    pub original: Option<Value>,
}

impl ServerMessage {
    /// Returns the frame as a mutation event, or gives it back unchanged.
    pub fn into_event(self) -> Result<EventFrame, ServerMessage> {
        let (kind, request_id, object, original) = match self {
            ServerMessage::Create {
                request_id,
                object,
                original,
            } => (EventKind::Create, request_id, object, original),
            ServerMessage::Enter {
                request_id,
                object,
                original,
            } => (EventKind::Enter, request_id, object, original),
            ServerMessage::Update {
                request_id,
                object,
                original,
            } => (EventKind::Update, request_id, object, original),
            ServerMessage::Leave {
                request_id,
                object,
                original,
            } => (EventKind::Leave, request_id, object, original),
            ServerMessage::Delete {
                request_id,
                object,
                original,
            } => (EventKind::Delete, request_id, object, original),
            other => return Err(other),
        };
        Ok(EventFrame {
            request_id,
            kind,
            object,
            original,
        })
    }
}
