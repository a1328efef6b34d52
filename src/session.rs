//! One open room: its view, its live feed, and the read position committed
//! when it loses focus.

use std::sync::Arc;

use crate::model::{Draft, Message, Page, Room};
use crate::outbox::Outbox;
use crate::reconcile::{Reconciler, RoomFeed, RoomView};
use crate::remote::{SendError, Subscription, SyncClient};
use crate::timestamp::now_millis;
use crate::unread::{commit_last_read, read_position_to_commit, unread_count};

pub struct RoomSession {
    user_id: String,
    view: RoomView,
    reconciler: Reconciler,
    client: SyncClient,
    outbox: Outbox,
    subscription: Option<Subscription>,
}

impl RoomSession {
    /// Load room metadata, start the live feed from the local watermark, and
    /// load the first page. A room whose metadata or feed is unavailable still
    /// opens on cached history.
    pub async fn open(
        room_id: &str,
        user_id: &str,
        reconciler: Reconciler,
        client: SyncClient,
        outbox: Outbox,
    ) -> Self {
        let view = RoomView::new(room_id);

        match client.fetch_room(room_id).await {
            Ok(room) => view.set_room(room.normalize(now_millis())).await,
            Err(e) => log::warn!("[session] room {room_id} metadata unavailable: {e}"),
        }

        let watermark = reconciler.watermark(room_id).await;
        let feed = Arc::new(RoomFeed {
            reconciler: reconciler.clone(),
            view: view.clone(),
        });
        let subscription = match client.subscribe(room_id, watermark, feed).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                log::warn!("[session] live feed for {room_id} unavailable: {e}");
                None
            }
        };

        let session = RoomSession {
            user_id: user_id.to_string(),
            view,
            reconciler,
            client,
            outbox,
            subscription,
        };
        session.load_older().await;
        session
    }

    pub fn room_id(&self) -> &str {
        self.view.room_id()
    }

    pub fn view(&self) -> &RoomView {
        &self.view
    }

    pub fn is_live(&self) -> bool {
        self.subscription.as_ref().is_some_and(|s| !s.is_cancelled())
    }

    /// Load the next older page. `None` once history is exhausted or the
    /// session is closed; a load that finishes after close is discarded.
    pub async fn load_older(&self) -> Option<Page> {
        if self.view.is_closed() {
            return None;
        }
        let (cursor, exhausted) = self.view.paging().await;
        if exhausted {
            return None;
        }
        let page = self.reconciler.load_page(self.room_id(), cursor).await;
        if !self.view.apply_page(&page).await {
            log::debug!("[session] {} closed during page load", self.room_id());
            return None;
        }
        Some(page)
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.view.messages().await
    }

    pub async fn room(&self) -> Option<Room> {
        self.view.room().await
    }

    pub async fn unread_count(&self) -> i64 {
        self.view
            .room()
            .await
            .map_or(0, |room| unread_count(&room, &self.user_id))
    }

    pub async fn send(&self, draft: Draft) -> Result<Message, SendError> {
        self.outbox.send(&self.view, draft).await
    }

    pub async fn retry(&self, message_id: &str) -> Result<Message, SendError> {
        self.outbox.retry(&self.view, message_id).await
    }

    /// Mark everything up to the room's latest seq as read.
    pub async fn read_all(&self) -> Result<bool, SendError> {
        let loaded = self.view.max_seq().await;
        let last = self.view.room().await.map_or(0, |r| r.last_seq);
        commit_last_read(&self.client, &self.view, &self.user_id, loaded.max(last)).await
    }

    /// Stop the feed, detach the view, and commit the read position if the
    /// loaded history is ahead of it. Returns the committed seq.
    pub async fn close(mut self) -> Result<Option<i64>, SendError> {
        if let Some(mut sub) = self.subscription.take() {
            sub.cancel();
        }
        let max_loaded = self.view.max_seq().await;
        let pending = match self.view.room().await {
            Some(room) => read_position_to_commit(&room, &self.user_id, max_loaded),
            None => (max_loaded > 0).then_some(max_loaded),
        };
        self.view.close();

        let Some(seq) = pending else {
            return Ok(None);
        };
        match commit_last_read(&self.client, &self.view, &self.user_id, seq).await {
            Ok(true) => Ok(Some(seq)),
            Ok(false) => Ok(None),
            Err(e) => {
                log::warn!("[session] read position for {} not committed: {e}", self.room_id());
                Err(e)
            }
        }
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        if let Some(mut sub) = self.subscription.take() {
            sub.cancel();
        }
        self.view.close();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
