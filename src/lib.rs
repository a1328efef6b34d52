//! Offline-first message sync.
//!
//! `SyncCore` is the process-wide context: it owns the one local cache handle
//! and the remote client, and hands out per-room sessions. Everything the UI
//! shows is read from the cache; remote pages and live deltas are written
//! through it first.

pub mod config;
pub mod migrate;
pub mod model;
pub mod outbox;
pub mod push;
pub mod reconcile;
pub mod remote;
pub mod session;
pub mod store;
pub mod timestamp;
pub mod unread;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use thiserror::Error;

pub use config::{ConfigError, SyncConfig};
pub use migrate::{MigrationError, MigrationManager, MigrationOutcome, LATEST_VERSION};
pub use model::{AttachmentSource, Draft, Message, MessageKind, MessageStatus, Page, Room, RoomKind};
pub use outbox::{AttachmentUploader, Outbox, UploadError, UploadedAttachment};
pub use push::PushPayload;
pub use reconcile::{merge, Reconciler, RoomView};
pub use remote::{
    ChangeDelta, ChangeKind, ChangeStream, FetchError, RemoteMessage, RemotePage, RemoteRoom, RemoteStore, RoomDelta,
    SendError, Subscription, SyncClient, Watermark,
};
pub use session::RoomSession;
pub use store::{LocalStore, LocalStoreError};
pub use unread::{unread_count, UnreadLedger, UnreadTracker};

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("local store: {0}")]
    Store(#[from] LocalStoreError),
    #[error("migration: {0}")]
    Migration(#[from] MigrationError),
    #[error("remote: {0}")]
    Fetch(#[from] FetchError),
}

// ─── Context ─────────────────────────────────────────────────────────────────

pub struct SyncCore {
    config: SyncConfig,
    user_id: String,
    store: LocalStore,
    client: SyncClient,
    reconciler: Reconciler,
    outbox: Outbox,
}

impl SyncCore {
    /// Open the cache (file-backed when `db_path` is set, otherwise in
    /// memory) and bring its schema up to date. A store that cannot be
    /// migrated is reset rather than left unusable.
    pub async fn open(
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        uploader: Arc<dyn AttachmentUploader>,
        user_id: &str,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let store = match &config.db_path {
            Some(path) => LocalStore::open(path).await?,
            None => LocalStore::open_in_memory().await?,
        };

        let migrations = MigrationManager::new(&store);
        match migrations.migrate_to_latest().await {
            Ok(outcome) => log::info!("[core] cache ready ({outcome:?})"),
            Err(e) => {
                log::error!("[core] cache migration failed, resetting: {e}");
                migrations.reset().await?;
            }
        }

        let client = SyncClient::new(remote, &config);
        let reconciler = Reconciler::new(store.clone(), client.clone(), config.page_size);
        let outbox = Outbox::new(client.clone(), uploader, user_id);

        Ok(SyncCore {
            config,
            user_id: user_id.to_string(),
            store,
            client,
            reconciler,
            outbox,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn client(&self) -> &SyncClient {
        &self.client
    }

    pub async fn open_room(&self, room_id: &str) -> RoomSession {
        RoomSession::open(
            room_id,
            &self.user_id,
            self.reconciler.clone(),
            self.client.clone(),
            self.outbox.clone(),
        )
        .await
    }

    /// Start the tab-level unread badge for the current user.
    pub async fn watch_unread(&self) -> Result<UnreadTracker, CoreError> {
        Ok(UnreadTracker::start(&self.client, &self.user_id).await?)
    }

    /// User-triggered: drop all cached messages and recreate the schema.
    pub async fn reset_cache(&self) -> Result<(), CoreError> {
        MigrationManager::new(&self.store).reset().await?;
        Ok(())
    }

    pub async fn close(self) {
        self.store.close().await;
        log::info!("[core] closed");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
