//! Domain types shared by every component: messages, rooms, pages, drafts.
//!
//! Everything here is in the local (normalized) representation. Remote payload
//! shapes live in `remote` and are converted at the boundary.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ─── Message ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
        }
    }

    /// Image and file messages carry an uploaded attachment URL.
    pub fn needs_attachment(&self) -> bool {
        matches!(self, MessageKind::Image | MessageKind::File)
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "file" => Ok(MessageKind::File),
            other => Err(format!("unknown message type '{other}'")),
        }
    }
}

/// Delivery state of a message.
///
/// `Pending -> Success | Failed`, `Failed -> Pending` (manual retry).
/// `Success` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Success,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Success => "success",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        matches!(
            (self, next),
            (MessageStatus::Pending, MessageStatus::Success)
                | (MessageStatus::Pending, MessageStatus::Failed)
                | (MessageStatus::Failed, MessageStatus::Pending)
        )
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "success" => Ok(MessageStatus::Success),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(format!("unknown message status '{other}'")),
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub text: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub image_url: Option<String>,
    /// Normalized unix milliseconds.
    pub created_at: i64,
    /// Server-assigned per-room sequence; `None` until confirmed.
    pub seq: Option<i64>,
    pub status: Option<MessageStatus>,
    pub sender_name: Option<String>,
    #[serde(rename = "senderPicURL")]
    pub sender_pic_url: Option<String>,
}

impl Message {
    pub fn is_pending(&self) -> bool {
        self.status == Some(MessageStatus::Pending)
    }

    /// Missing status means a confirmed record written before status tracking.
    pub fn effective_status(&self) -> MessageStatus {
        self.status.unwrap_or(MessageStatus::Success)
    }
}

// ─── Room ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RoomKind,
    pub members: Vec<String>,
    #[serde(default)]
    pub last_seq: i64,
    #[serde(default)]
    pub last_read_seqs: HashMap<String, i64>,
    #[serde(default)]
    pub last_message: Option<Message>,
}

impl Room {
    pub fn last_read_seq(&self, user_id: &str) -> i64 {
        self.last_read_seqs.get(user_id).copied().unwrap_or(0)
    }
}

// ─── Page ────────────────────────────────────────────────────────────────────

/// One page of history, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub data: Vec<Message>,
    /// Oldest `createdAt` in `data`; exclusive upper bound for the next page.
    pub cursor: Option<i64>,
    pub is_last_page: bool,
    /// Set when the remote fetch failed and only cached rows are returned.
    pub degraded: bool,
}

impl Page {
    pub fn from_rows(data: Vec<Message>, limit: u32) -> Self {
        let cursor = data.iter().map(|m| m.created_at).min();
        let is_last_page = data.len() < limit as usize;
        Page {
            data,
            cursor,
            is_last_page,
            degraded: false,
        }
    }
}

// ─── Drafts ──────────────────────────────────────────────────────────────────

/// A local file the user picked for an image/file message.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentSource {
    pub path: String,
    pub name: String,
    pub mime_type: String,
}

/// What the composer hands to the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub kind: MessageKind,
    pub text: Option<String>,
    pub attachment: Option<AttachmentSource>,
}

impl Draft {
    pub fn text(text: impl Into<String>) -> Self {
        Draft {
            kind: MessageKind::Text,
            text: Some(text.into()),
            attachment: None,
        }
    }

    pub fn image(attachment: AttachmentSource) -> Self {
        Draft {
            kind: MessageKind::Image,
            text: None,
            attachment: Some(attachment),
        }
    }

    pub fn file(attachment: AttachmentSource) -> Self {
        Draft {
            kind: MessageKind::File,
            text: None,
            attachment: Some(attachment),
        }
    }
}

/// A draft whose attachment (if any) is already uploaded; this is what goes
/// over the wire. `id` is the client-generated idempotency key the remote
/// write must honor as the document id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub text: Option<String>,
    pub image_url: Option<String>,
    pub created_at: i64,
}

impl OutgoingMessage {
    pub fn to_provisional(&self) -> Message {
        Message {
            id: self.id.clone(),
            room_id: self.room_id.clone(),
            sender_id: self.sender_id.clone(),
            text: self.text.clone(),
            kind: self.kind,
            image_url: self.image_url.clone(),
            created_at: self.created_at,
            seq: None,
            status: Some(MessageStatus::Pending),
            sender_name: None,
            sender_pic_url: None,
        }
    }
}

/// New 32-char hex id for a provisional message.
pub fn new_message_id() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
