//! Boundary to the remote document store.
//!
//! `RemoteStore` is the transport (implemented by the host app over whatever
//! SDK it uses). `SyncClient` wraps it with timeouts and turns change feeds
//! into `Subscription` handles. Neither ever touches the local cache: the
//! reconciliation engine is the only writer of local state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::model::{Message, MessageKind, MessageStatus, OutgoingMessage, Room, RoomKind};
use crate::timestamp::{to_millis_or, RemoteTimestamp};

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    #[error("remote fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SendError {
    #[error("message text is empty")]
    EmptyText,
    #[error("{0} message has no attachment")]
    MissingAttachment(&'static str),
    #[error("attachment upload failed: {0}")]
    Upload(String),
    #[error("remote write timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote rejected write: {0}")]
    Rejected(String),
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    #[error("no outgoing message {0}")]
    UnknownMessage(String),
    #[error("message {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: MessageStatus,
        to: MessageStatus,
    },
    #[error("room view closed")]
    Closed,
}

// ─── Wire shapes ─────────────────────────────────────────────────────────────

fn default_kind() -> MessageKind {
    MessageKind::Text
}

/// A message record as the remote store returns it. `createdAt` may be in any
/// of the shapes `RemoteTimestamp` covers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMessage {
    pub id: String,
    /// Sub-records are addressed by room, so the body may omit it.
    #[serde(default)]
    pub room_id: Option<String>,
    pub sender_id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: MessageKind,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<RemoteTimestamp>,
    #[serde(default)]
    pub seq: Option<i64>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(rename = "senderPicURL", default)]
    pub sender_pic_url: Option<String>,
}

impl RemoteMessage {
    /// Local form of a confirmed record. `now` stands in for an unresolved
    /// server timestamp.
    pub fn normalize(&self, room_id: &str, now: i64) -> Message {
        Message {
            id: self.id.clone(),
            room_id: self.room_id.clone().unwrap_or_else(|| room_id.to_string()),
            sender_id: self.sender_id.clone(),
            text: self.text.clone(),
            kind: self.kind,
            image_url: self.image_url.clone(),
            created_at: to_millis_or(self.created_at.as_ref(), now),
            seq: self.seq.filter(|s| *s > 0),
            status: Some(MessageStatus::Success),
            sender_name: self.sender_name.clone(),
            sender_pic_url: self.sender_pic_url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRoom {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RoomKind,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub last_seq: i64,
    #[serde(default)]
    pub last_read_seqs: HashMap<String, i64>,
    #[serde(default)]
    pub last_message: Option<RemoteMessage>,
}

impl RemoteRoom {
    pub fn normalize(&self, now: i64) -> Room {
        Room {
            id: self.id.clone(),
            kind: self.kind,
            members: self.members.clone(),
            last_seq: self.last_seq.max(0),
            last_read_seqs: self.last_read_seqs.clone(),
            last_message: self.last_message.as_ref().map(|m| m.normalize(&self.id, now)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemotePage {
    /// Newest first, strictly older than the requested cursor.
    pub data: Vec<RemoteMessage>,
    pub cursor: Option<i64>,
    pub is_last_page: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangeDelta {
    pub kind: ChangeKind,
    pub message: RemoteMessage,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RoomDelta {
    pub kind: ChangeKind,
    pub room: RemoteRoom,
}

/// Lower bound of a live feed: only records newer than this are pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watermark {
    Seq(i64),
    CreatedAt(i64),
}

pub type ChangeStream<T> = BoxStream<'static, Vec<T>>;

// ─── Transport trait ─────────────────────────────────────────────────────────

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch_page(
        &self,
        room_id: &str,
        before: Option<i64>,
        page_size: u32,
    ) -> Result<RemotePage, FetchError>;

    async fn subscribe_messages(
        &self,
        room_id: &str,
        after: Watermark,
    ) -> Result<ChangeStream<ChangeDelta>, FetchError>;

    /// Must store the record under `message.id`.
    async fn send(&self, room_id: &str, message: &OutgoingMessage) -> Result<RemoteMessage, SendError>;

    async fn fetch_room(&self, room_id: &str) -> Result<RemoteRoom, FetchError>;

    /// Rooms `user_id` is a member of.
    async fn subscribe_rooms(&self, user_id: &str) -> Result<ChangeStream<RoomDelta>, FetchError>;

    /// `lastReadSeqs[user_id] = max(existing, seq)` on the room document.
    async fn commit_last_read(&self, room_id: &str, user_id: &str, seq: i64) -> Result<(), SendError>;
}

// ─── Subscriptions ───────────────────────────────────────────────────────────

#[async_trait]
pub trait BatchHandler<T>: Send + Sync + 'static {
    async fn on_batch(&self, batch: Vec<T>);
}

/// Live feed handle. Cancelled explicitly with [`Subscription::cancel`] or
/// when dropped by its owner.
pub struct Subscription {
    cancelled: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    fn spawn<T: Send + 'static>(mut stream: ChangeStream<T>, handler: Arc<dyn BatchHandler<T>>) -> Self {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let task = tokio::spawn(async move {
            while let Some(batch) = stream.next().await {
                if flag.load(Ordering::Acquire) {
                    break;
                }
                handler.on_batch(batch).await;
            }
        });
        Subscription {
            cancelled,
            task: Some(task),
        }
    }

    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ─── Client ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SyncClient {
    remote: Arc<dyn RemoteStore>,
    fetch_timeout: Duration,
    send_timeout: Duration,
    write_timeout: Duration,
}

impl SyncClient {
    pub fn new(remote: Arc<dyn RemoteStore>, config: &SyncConfig) -> Self {
        SyncClient {
            remote,
            fetch_timeout: config.fetch_timeout(),
            send_timeout: config.send_timeout(),
            write_timeout: config.write_timeout(),
        }
    }

    pub async fn fetch_page(
        &self,
        room_id: &str,
        before: Option<i64>,
        page_size: u32,
    ) -> Result<RemotePage, FetchError> {
        tokio::time::timeout(self.fetch_timeout, self.remote.fetch_page(room_id, before, page_size))
            .await
            .map_err(|_| FetchError::Timeout(self.fetch_timeout))?
    }

    pub async fn fetch_room(&self, room_id: &str) -> Result<RemoteRoom, FetchError> {
        tokio::time::timeout(self.fetch_timeout, self.remote.fetch_room(room_id))
            .await
            .map_err(|_| FetchError::Timeout(self.fetch_timeout))?
    }

    pub async fn send(&self, room_id: &str, message: &OutgoingMessage) -> Result<RemoteMessage, SendError> {
        tokio::time::timeout(self.send_timeout, self.remote.send(room_id, message))
            .await
            .map_err(|_| SendError::Timeout(self.send_timeout))?
    }

    pub async fn commit_last_read(&self, room_id: &str, user_id: &str, seq: i64) -> Result<(), SendError> {
        tokio::time::timeout(self.write_timeout, self.remote.commit_last_read(room_id, user_id, seq))
            .await
            .map_err(|_| SendError::Timeout(self.write_timeout))?
    }

    pub async fn subscribe(
        &self,
        room_id: &str,
        after: Watermark,
        handler: Arc<dyn BatchHandler<ChangeDelta>>,
    ) -> Result<Subscription, FetchError> {
        let stream = tokio::time::timeout(self.fetch_timeout, self.remote.subscribe_messages(room_id, after))
            .await
            .map_err(|_| FetchError::Timeout(self.fetch_timeout))??;
        log::debug!("[remote] subscribed to room {room_id} after {after:?}");
        Ok(Subscription::spawn(stream, handler))
    }

    pub async fn subscribe_rooms(
        &self,
        user_id: &str,
        handler: Arc<dyn BatchHandler<RoomDelta>>,
    ) -> Result<Subscription, FetchError> {
        let stream = tokio::time::timeout(self.fetch_timeout, self.remote.subscribe_rooms(user_id))
            .await
            .map_err(|_| FetchError::Timeout(self.fetch_timeout))??;
        Ok(Subscription::spawn(stream, handler))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
