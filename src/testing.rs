//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::migrate::MigrationManager;
use crate::model::{AttachmentSource, Message, MessageKind, MessageStatus, OutgoingMessage, RoomKind};
use crate::outbox::{AttachmentUploader, UploadError, UploadedAttachment};
use crate::remote::{
    ChangeDelta, ChangeKind, ChangeStream, FetchError, RemoteMessage, RemotePage, RemoteRoom, RemoteStore,
    RoomDelta, SendError, Watermark,
};
use crate::timestamp::RemoteTimestamp;

pub async fn fresh_store() -> crate::store::LocalStore {
    let store = crate::store::LocalStore::open_in_memory().await.unwrap();
    MigrationManager::new(&store).migrate_to_latest().await.unwrap();
    store
}

pub fn msg(room_id: &str, id: &str, created_at: i64, seq: Option<i64>) -> Message {
    Message {
        id: id.into(),
        room_id: room_id.into(),
        sender_id: "u1".into(),
        text: Some(format!("text {id}")),
        kind: MessageKind::Text,
        image_url: None,
        created_at,
        seq,
        status: Some(MessageStatus::Success),
        sender_name: None,
        sender_pic_url: None,
    }
}

pub fn remote_msg(room_id: &str, id: &str, created_at: i64, seq: i64) -> RemoteMessage {
    RemoteMessage {
        id: id.into(),
        room_id: Some(room_id.into()),
        sender_id: "u2".into(),
        text: Some(format!("text {id}")),
        kind: MessageKind::Text,
        image_url: None,
        created_at: Some(RemoteTimestamp::Millis(created_at)),
        seq: Some(seq),
        sender_name: Some("Other".into()),
        sender_pic_url: None,
    }
}

pub fn added(room_id: &str, id: &str, created_at: i64, seq: i64) -> ChangeDelta {
    ChangeDelta {
        kind: ChangeKind::Added,
        message: remote_msg(room_id, id, created_at, seq),
    }
}

pub fn remote_room(id: &str, last_seq: i64, read: &[(&str, i64)]) -> RemoteRoom {
    RemoteRoom {
        id: id.into(),
        kind: RoomKind::Group,
        members: vec!["u1".into(), "u2".into()],
        last_seq,
        last_read_seqs: read.iter().map(|(u, s)| (u.to_string(), *s)).collect(),
        last_message: None,
    }
}

fn channel_stream<T: Send + 'static>(mut rx: mpsc::UnboundedReceiver<Vec<T>>) -> ChangeStream<T> {
    futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()
}

// ─── Remote ──────────────────────────────────────────────────────────────────

/// Scriptable remote: history is a per-room map ordered by `createdAt`,
/// feeds are channels the test pushes into.
#[derive(Default)]
pub struct MemoryRemote {
    history: Mutex<HashMap<String, BTreeMap<(i64, String), RemoteMessage>>>,
    rooms: Mutex<HashMap<String, RemoteRoom>>,
    feeds: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<ChangeDelta>>>>>,
    room_feeds: Mutex<Vec<mpsc::UnboundedSender<Vec<RoomDelta>>>>,
    fetch_error: Mutex<Option<FetchError>>,
    fetch_delay: Mutex<Option<Duration>>,
    send_results: Mutex<VecDeque<Result<(), SendError>>>,
    send_gate: Mutex<Option<Arc<Notify>>>,
    pub fetch_calls: Mutex<Vec<(String, Option<i64>)>>,
    pub sent: Mutex<Vec<OutgoingMessage>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, room_id: &str, messages: Vec<RemoteMessage>) {
        let mut history = self.history.lock().await;
        let room = history.entry(room_id.to_string()).or_default();
        for m in messages {
            let at = match m.created_at {
                Some(RemoteTimestamp::Millis(ms)) => ms,
                _ => 0,
            };
            room.insert((at, m.id.clone()), m);
        }
    }

    pub async fn set_room(&self, room: RemoteRoom) {
        self.rooms.lock().await.insert(room.id.clone(), room);
    }

    pub async fn room(&self, room_id: &str) -> Option<RemoteRoom> {
        self.rooms.lock().await.get(room_id).cloned()
    }

    pub async fn fail_fetches(&self, err: Option<FetchError>) {
        *self.fetch_error.lock().await = err;
    }

    pub async fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().await = Some(delay);
    }

    pub async fn queue_send_result(&self, result: Result<(), SendError>) {
        self.send_results.lock().await.push_back(result);
    }

    /// Sends block until the returned `Notify` is signalled once per send.
    pub async fn hold_sends(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.send_gate.lock().await = Some(gate.clone());
        gate
    }

    pub async fn push(&self, room_id: &str, batch: Vec<ChangeDelta>) {
        if let Some(senders) = self.feeds.lock().await.get_mut(room_id) {
            senders.retain(|tx| tx.send(batch.clone()).is_ok());
        }
    }

    pub async fn push_rooms(&self, batch: Vec<RoomDelta>) {
        self.room_feeds
            .lock()
            .await
            .retain(|tx| tx.send(batch.clone()).is_ok());
    }

    pub async fn subscriber_count(&self, room_id: &str) -> usize {
        let mut feeds = self.feeds.lock().await;
        match feeds.get_mut(room_id) {
            Some(senders) => {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            }
            None => 0,
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch_page(
        &self,
        room_id: &str,
        before: Option<i64>,
        page_size: u32,
    ) -> Result<RemotePage, FetchError> {
        self.fetch_calls.lock().await.push((room_id.to_string(), before));
        let delay = *self.fetch_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.fetch_error.lock().await.clone() {
            return Err(err);
        }

        let history = self.history.lock().await;
        let Some(room) = history.get(room_id) else {
            return Ok(RemotePage {
                data: vec![],
                cursor: None,
                is_last_page: true,
            });
        };
        let older: Vec<_> = room
            .iter()
            .rev()
            .filter(|((at, _), _)| before.map_or(true, |b| *at < b))
            .collect();
        let data: Vec<RemoteMessage> = older
            .iter()
            .take(page_size as usize)
            .map(|(_, m)| (*m).clone())
            .collect();
        let cursor = older.iter().take(page_size as usize).last().map(|((at, _), _)| *at);
        Ok(RemotePage {
            is_last_page: older.len() <= page_size as usize,
            data,
            cursor,
        })
    }

    async fn subscribe_messages(
        &self,
        room_id: &str,
        _after: Watermark,
    ) -> Result<ChangeStream<ChangeDelta>, FetchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds
            .lock()
            .await
            .entry(room_id.to_string())
            .or_default()
            .push(tx);
        Ok(channel_stream(rx))
    }

    async fn send(&self, room_id: &str, message: &OutgoingMessage) -> Result<RemoteMessage, SendError> {
        let gate = self.send_gate.lock().await.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.sent.lock().await.push(message.clone());
        if let Some(Err(e)) = self.send_results.lock().await.pop_front() {
            return Err(e);
        }
        Ok(RemoteMessage {
            id: message.id.clone(),
            room_id: Some(room_id.to_string()),
            sender_id: message.sender_id.clone(),
            text: message.text.clone(),
            kind: message.kind,
            image_url: message.image_url.clone(),
            created_at: Some(RemoteTimestamp::Sentinel { sv: "timestamp".into() }),
            seq: None,
            sender_name: None,
            sender_pic_url: None,
        })
    }

    async fn fetch_room(&self, room_id: &str) -> Result<RemoteRoom, FetchError> {
        self.rooms
            .lock()
            .await
            .get(room_id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(room_id.to_string()))
    }

    async fn subscribe_rooms(&self, _user_id: &str) -> Result<ChangeStream<RoomDelta>, FetchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.room_feeds.lock().await.push(tx);
        Ok(channel_stream(rx))
    }

    async fn commit_last_read(&self, room_id: &str, user_id: &str, seq: i64) -> Result<(), SendError> {
        let mut rooms = self.rooms.lock().await;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| SendError::Rejected(format!("no room {room_id}")))?;
        let entry = room.last_read_seqs.entry(user_id.to_string()).or_insert(0);
        *entry = (*entry).max(seq);
        Ok(())
    }
}

// ─── Uploader ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryUploader {
    pub fail: Mutex<bool>,
    pub uploads: Mutex<Vec<AttachmentSource>>,
}

#[async_trait]
impl AttachmentUploader for MemoryUploader {
    async fn upload(&self, source: &AttachmentSource) -> Result<UploadedAttachment, UploadError> {
        if *self.fail.lock().await {
            return Err(UploadError("storage quota exceeded".into()));
        }
        self.uploads.lock().await.push(source.clone());
        Ok(UploadedAttachment {
            url: format!("https://files.example/{}", source.name),
            name: source.name.clone(),
        })
    }
}
