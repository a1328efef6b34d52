//! Unread accounting: per-room counts, read-position commits, and the
//! tab-level badge total.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};

use crate::model::Room;
use crate::reconcile::RoomView;
use crate::remote::{BatchHandler, ChangeKind, FetchError, RoomDelta, SendError, Subscription, SyncClient};

fn unread(last_seq: i64, read_seq: i64) -> i64 {
    (last_seq - read_seq).max(0)
}

/// `max(0, lastSeq - lastReadSeqs[user])`.
pub fn unread_count(room: &Room, user_id: &str) -> i64 {
    unread(room.last_seq, room.last_read_seq(user_id))
}

/// Raise the recorded read position for `user_id` to `seq`. Returns false
/// (leaving the room untouched) if that would not move it forward.
pub fn advance_read_position(room: &mut Room, user_id: &str, seq: i64) -> bool {
    if seq <= room.last_read_seq(user_id) {
        return false;
    }
    room.last_read_seqs.insert(user_id.to_string(), seq);
    true
}

/// The position to commit when a room loses focus, if any.
pub fn read_position_to_commit(room: &Room, user_id: &str, max_loaded_seq: i64) -> Option<i64> {
    (max_loaded_seq > room.last_read_seq(user_id)).then_some(max_loaded_seq)
}

/// Commit `seq` as `user_id`'s read position for the room `view` shows.
///
/// Skips the network when the room is known and already at or past `seq`.
/// Returns whether a write was made.
pub async fn commit_last_read(
    client: &SyncClient,
    view: &RoomView,
    user_id: &str,
    seq: i64,
) -> Result<bool, SendError> {
    if seq <= 0 {
        return Ok(false);
    }
    if let Some(room) = view.room().await {
        if seq <= room.last_read_seq(user_id) {
            return Ok(false);
        }
    }
    client.commit_last_read(view.room_id(), user_id, seq).await?;
    view.update_room(|room| {
        advance_read_position(room, user_id, seq);
    })
    .await;
    log::debug!("[unread] {user_id} read {} up to {seq}", view.room_id());
    Ok(true)
}

// ─── Badge ───────────────────────────────────────────────────────────────────

/// Per-room unread counts and their running sum. Each delta adjusts the
/// total by that room's difference; nothing is rescanned.
#[derive(Debug, Clone, Default)]
pub struct UnreadLedger {
    user_id: String,
    per_room: HashMap<String, i64>,
    total: i64,
}

impl UnreadLedger {
    pub fn new(user_id: &str) -> Self {
        UnreadLedger {
            user_id: user_id.to_string(),
            ..Default::default()
        }
    }

    pub fn apply(&mut self, delta: &RoomDelta) -> i64 {
        let id = delta.room.id.clone();
        let previous = match delta.kind {
            ChangeKind::Removed => self.per_room.remove(&id).unwrap_or(0),
            ChangeKind::Added | ChangeKind::Modified => {
                let read = delta.room.last_read_seqs.get(&self.user_id).copied().unwrap_or(0);
                let next = unread(delta.room.last_seq, read);
                let previous = self.per_room.insert(id, next).unwrap_or(0);
                self.total += next;
                previous
            }
        };
        self.total -= previous;
        self.total
    }

    pub fn total(&self) -> i64 {
        self.total
    }

    pub fn room(&self, room_id: &str) -> i64 {
        self.per_room.get(room_id).copied().unwrap_or(0)
    }
}

struct BadgeFeed {
    ledger: Mutex<UnreadLedger>,
    badge: watch::Sender<i64>,
}

#[async_trait]
impl BatchHandler<RoomDelta> for BadgeFeed {
    async fn on_batch(&self, batch: Vec<RoomDelta>) {
        let mut ledger = self.ledger.lock().await;
        for delta in &batch {
            ledger.apply(delta);
        }
        self.badge.send_replace(ledger.total());
    }
}

/// Live tab badge for one user, fed by the room feed.
pub struct UnreadTracker {
    feed: Arc<BadgeFeed>,
    subscription: Subscription,
}

impl UnreadTracker {
    pub async fn start(client: &SyncClient, user_id: &str) -> Result<Self, FetchError> {
        let (badge, _) = watch::channel(0);
        let feed = Arc::new(BadgeFeed {
            ledger: Mutex::new(UnreadLedger::new(user_id)),
            badge,
        });
        let subscription = client.subscribe_rooms(user_id, feed.clone()).await?;
        log::info!("[unread] tracking rooms for {user_id}");
        Ok(UnreadTracker { feed, subscription })
    }

    pub fn badge(&self) -> watch::Receiver<i64> {
        self.feed.badge.subscribe()
    }

    pub async fn total(&self) -> i64 {
        self.feed.ledger.lock().await.total()
    }

    pub async fn room_count(&self, room_id: &str) -> i64 {
        self.feed.ledger.lock().await.room(room_id)
    }

    pub fn stop(&mut self) {
        self.subscription.cancel();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
