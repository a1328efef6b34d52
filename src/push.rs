//! Deep-link payloads from push notifications.

use serde::Deserialize;

use crate::model::RoomKind;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPush {
    push_type: String,
    #[serde(default)]
    chat_id: Option<String>,
    #[serde(default)]
    sender_name: Option<String>,
    #[serde(default)]
    chat_type: Option<String>,
}

/// A chat notification: which room to open when tapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPayload {
    pub room_id: String,
    pub sender_name: Option<String>,
    /// `None` when the sender omitted it or used a type we don't know.
    pub room_kind: Option<RoomKind>,
}

impl PushPayload {
    /// `None` for non-chat pushes and malformed payloads.
    pub fn from_json(raw: &str) -> Option<Self> {
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value) => Self::from_value(value),
            Err(e) => {
                log::debug!("[push] ignoring unparseable payload: {e}");
                None
            }
        }
    }

    pub fn from_value(value: serde_json::Value) -> Option<Self> {
        let raw: RawPush = serde_json::from_value(value).ok()?;
        if raw.push_type != "chat" {
            return None;
        }
        let room_id = raw.chat_id.filter(|id| !id.is_empty())?;
        let room_kind = raw
            .chat_type
            .and_then(|t| serde_json::from_value(serde_json::Value::String(t)).ok());
        Some(PushPayload {
            room_id,
            sender_name: raw.sender_name,
            room_kind,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
