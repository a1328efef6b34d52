//! Reconciliation of cached, fetched, and pushed messages.
//!
//! The local cache is what the UI reads. Remote rows reach the screen only
//! after they have been written through to the cache: a page load re-reads
//! the cache after inserting the fetched rows, and a live batch is upserted
//! before it is merged into the in-memory view.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::model::{Message, MessageStatus, Page, Room};
use crate::remote::{BatchHandler, ChangeDelta, ChangeKind, SendError, SyncClient, Watermark};
use crate::store::LocalStore;
use crate::timestamp::now_millis;

/// Merge `incoming` into `existing`, keyed by id. On collision the incoming
/// record replaces the existing one in place; the result is sorted by
/// `createdAt` descending.
///
/// Records with equal `createdAt` keep their relative insertion order
/// (existing first, then new incoming ids). That order is an artefact of the
/// stable sort, not something callers should rely on.
pub fn merge(existing: &[Message], incoming: &[Message]) -> Vec<Message> {
    let mut merged: Vec<Message> = Vec::with_capacity(existing.len() + incoming.len());
    let mut index: HashMap<String, usize> = HashMap::with_capacity(existing.len() + incoming.len());

    for m in existing.iter().chain(incoming.iter()) {
        match index.get(&m.id) {
            Some(&i) => merged[i] = m.clone(),
            None => {
                index.insert(m.id.clone(), merged.len());
                merged.push(m.clone());
            }
        }
    }

    merged.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    merged
}

// ─── In-memory view ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ViewState {
    messages: Vec<Message>,
    /// Oldest `createdAt` loaded so far.
    cursor: Option<i64>,
    exhausted: bool,
    room: Option<Room>,
    /// Ids the live feed removed; a page read earlier must not bring them back.
    removed: HashSet<String>,
}

/// The paged, merged message list one open room shows. Once closed, no
/// callback may mutate it.
#[derive(Clone)]
pub struct RoomView {
    room_id: String,
    state: Arc<Mutex<ViewState>>,
    closed: Arc<AtomicBool>,
}

impl RoomView {
    pub fn new(room_id: &str) -> Self {
        RoomView {
            room_id: room_id.to_string(),
            state: Arc::new(Mutex::new(ViewState::default())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.state.lock().await.messages.clone()
    }

    pub async fn get(&self, id: &str) -> Option<Message> {
        self.state
            .lock()
            .await
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    /// Returns false (and does nothing) once the view is closed.
    pub async fn merge_in(&self, incoming: &[Message]) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut state = self.state.lock().await;
        for m in incoming {
            state.removed.remove(&m.id);
        }
        state.messages = merge(&state.messages, incoming);
        if let Some(room) = state.room.as_mut() {
            mirror_into_room(room, incoming);
        }
        true
    }

    pub async fn remove(&self, ids: &[String]) {
        if self.is_closed() || ids.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        state.messages.retain(|m| !ids.contains(&m.id));
        state.removed.extend(ids.iter().cloned());
    }

    /// Move message `id` to `next`, enforcing the delivery state machine.
    pub async fn transition(&self, id: &str, next: MessageStatus) -> Result<Message, SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        let mut state = self.state.lock().await;
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| SendError::UnknownMessage(id.to_string()))?;
        let current = message.effective_status();
        if !current.can_transition_to(next) {
            return Err(SendError::InvalidTransition {
                id: id.to_string(),
                from: current,
                to: next,
            });
        }
        message.status = Some(next);
        Ok(message.clone())
    }

    pub async fn max_seq(&self) -> i64 {
        self.state
            .lock()
            .await
            .messages
            .iter()
            .filter_map(|m| m.seq)
            .max()
            .unwrap_or(0)
    }

    pub async fn room(&self) -> Option<Room> {
        self.state.lock().await.room.clone()
    }

    pub async fn set_room(&self, room: Room) {
        if self.is_closed() {
            return;
        }
        self.state.lock().await.room = Some(room);
    }

    pub async fn update_room<F: FnOnce(&mut Room)>(&self, f: F) {
        if self.is_closed() {
            return;
        }
        if let Some(room) = self.state.lock().await.room.as_mut() {
            f(room);
        }
    }

    pub(crate) async fn paging(&self) -> (Option<i64>, bool) {
        let state = self.state.lock().await;
        (state.cursor, state.exhausted)
    }

    /// Fold a loaded page into the view. The page is a snapshot that may
    /// predate live batches already applied, so entries the view holds win and
    /// ids the feed removed stay removed. The cursor only moves backwards.
    pub(crate) async fn apply_page(&self, page: &Page) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut state = self.state.lock().await;
        let rows: Vec<Message> = page
            .data
            .iter()
            .filter(|m| !state.removed.contains(&m.id))
            .cloned()
            .collect();
        state.messages = merge(&rows, &state.messages);
        if let Some(c) = page.cursor {
            state.cursor = Some(state.cursor.map_or(c, |old| old.min(c)));
        }
        state.exhausted = page.is_last_page;
        true
    }
}

/// Keep `lastSeq`/`lastMessage` in step with accepted records.
fn mirror_into_room(room: &mut Room, incoming: &[Message]) {
    let newest = incoming
        .iter()
        .filter(|m| m.seq.is_some())
        .max_by_key(|m| (m.seq, m.created_at));
    if let Some(newest) = newest {
        let seq = newest.seq.unwrap_or(0);
        if seq >= room.last_seq {
            room.last_seq = seq;
            room.last_message = Some(newest.clone());
        }
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub upserted: usize,
    pub removed: usize,
    /// False when the view had been torn down and was left untouched.
    pub applied_to_view: bool,
}

#[derive(Clone)]
pub struct Reconciler {
    store: LocalStore,
    client: SyncClient,
    page_size: u32,
}

impl Reconciler {
    pub fn new(store: LocalStore, client: SyncClient, page_size: u32) -> Self {
        Reconciler {
            store,
            client,
            page_size,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// One bounded local → remote → local round trip. Never fails: cache
    /// errors yield an empty page and fetch errors a degraded cached page.
    pub async fn load_page(&self, room_id: &str, cursor: Option<i64>) -> Page {
        let limit = self.page_size;

        let local = match self.store.query_page(room_id, cursor, limit).await {
            Ok(rows) => rows,
            Err(e) => {
                log::error!("[reconcile] cache read failed for {room_id}: {e}");
                Vec::new()
            }
        };
        if local.len() >= limit as usize {
            return Page::from_rows(local, limit);
        }

        let fetched = match self.client.fetch_page(room_id, cursor, limit).await {
            Ok(page) => page,
            Err(e) => {
                log::warn!("[reconcile] fetch failed for {room_id}, serving cache only: {e}");
                return degraded(local, cursor, limit);
            }
        };

        let now = now_millis();
        let rows: Vec<Message> = fetched
            .data
            .iter()
            .map(|m| m.normalize(room_id, now))
            .collect();
        if let Err(e) = self.store.upsert_many(room_id, &rows).await {
            log::error!("[reconcile] cache write failed for {room_id}: {e}");
            return degraded(local, cursor, limit);
        }

        let canonical = match self.store.query_page(room_id, cursor, limit).await {
            Ok(rows) => rows,
            Err(e) => {
                log::error!("[reconcile] cache re-read failed for {room_id}: {e}");
                return degraded(local, cursor, limit);
            }
        };
        let mut page = Page::from_rows(canonical, limit);
        page.is_last_page = page.is_last_page && fetched.is_last_page;
        // Nothing fetched belonged here: step past it rather than refetch it.
        page.cursor = page.cursor.or(fetched.cursor).or(cursor);
        log::debug!(
            "[reconcile] {room_id}: {} cached + {} fetched -> {} rows",
            local.len(),
            rows.len(),
            page.data.len()
        );
        page
    }

    /// Write a live batch through to the cache, then fold it into `view`.
    pub async fn apply_batch(&self, view: &RoomView, batch: Vec<ChangeDelta>) -> BatchOutcome {
        let room_id = view.room_id().to_string();
        let now = now_millis();

        let mut upserts = Vec::new();
        let mut removed = Vec::new();
        for delta in batch {
            match delta.kind {
                ChangeKind::Added | ChangeKind::Modified => {
                    upserts.push(delta.message.normalize(&room_id, now));
                }
                ChangeKind::Removed => removed.push(delta.message.id),
            }
        }
        upserts.retain(|m| {
            let same_room = m.room_id == room_id;
            if !same_room {
                log::warn!("[reconcile] dropping {} pushed into {room_id} for {}", m.id, m.room_id);
            }
            same_room
        });

        if let Err(e) = self.store.upsert_many(&room_id, &upserts).await {
            log::error!("[reconcile] live write-through failed for {room_id}: {e}");
        }
        for id in &removed {
            if let Err(e) = self.store.delete_by_id(&room_id, id).await {
                log::error!("[reconcile] delete of {id} failed for {room_id}: {e}");
            }
        }

        if view.is_closed() {
            return BatchOutcome {
                upserted: upserts.len(),
                removed: removed.len(),
                applied_to_view: false,
            };
        }
        let applied = view.merge_in(&upserts).await;
        view.remove(&removed).await;

        BatchOutcome {
            upserted: upserts.len(),
            removed: removed.len(),
            applied_to_view: applied,
        }
    }

    /// Where a new live feed for `room_id` should start.
    pub async fn watermark(&self, room_id: &str) -> Watermark {
        match self.store.max_local_seq(room_id).await {
            Ok(seq) if seq > 0 => return Watermark::Seq(seq),
            Ok(_) => {}
            Err(e) => log::warn!("[reconcile] max seq unavailable for {room_id}: {e}"),
        }
        match self.store.latest_created_at(room_id).await {
            Ok(Some(at)) => Watermark::CreatedAt(at),
            Ok(None) => Watermark::CreatedAt(now_millis()),
            Err(e) => {
                log::warn!("[reconcile] latest createdAt unavailable for {room_id}: {e}");
                Watermark::CreatedAt(now_millis())
            }
        }
    }
}

fn degraded(local: Vec<Message>, cursor: Option<i64>, limit: u32) -> Page {
    let mut page = Page::from_rows(local, limit);
    page.cursor = page.cursor.or(cursor);
    page.is_last_page = false;
    page.degraded = true;
    page
}

/// Feed handler binding one room's live batches to its view.
pub(crate) struct RoomFeed {
    pub(crate) reconciler: Reconciler,
    pub(crate) view: RoomView,
}

#[async_trait]
impl BatchHandler<ChangeDelta> for RoomFeed {
    async fn on_batch(&self, batch: Vec<ChangeDelta>) {
        let outcome = self.reconciler.apply_batch(&self.view, batch).await;
        log::debug!("[reconcile] {}: live batch {outcome:?}", self.view.room_id());
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
