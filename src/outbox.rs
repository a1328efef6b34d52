//! Optimistic sends.
//!
//! A send shows a provisional `pending` message in the room view before the
//! network round trip. The provisional record is never written to the cache:
//! its id is a client-generated idempotency key that the remote write stores
//! the document under, so the confirmed copy arrives over the live feed with
//! the same id and replaces the pending entry through the ordinary merge.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::model::{new_message_id, AttachmentSource, Draft, Message, MessageKind, MessageStatus, OutgoingMessage};
use crate::reconcile::RoomView;
use crate::remote::{SendError, SyncClient};
use crate::timestamp::now_millis;

#[derive(Debug, Clone, Error, PartialEq)]
#[error("{0}")]
pub struct UploadError(pub String);

#[derive(Debug, Clone, PartialEq)]
pub struct UploadedAttachment {
    pub url: String,
    pub name: String,
}

#[async_trait]
pub trait AttachmentUploader: Send + Sync {
    async fn upload(&self, source: &AttachmentSource) -> Result<UploadedAttachment, UploadError>;
}

#[derive(Clone)]
pub struct Outbox {
    client: SyncClient,
    uploader: Arc<dyn AttachmentUploader>,
    user_id: String,
    /// Wire payloads of messages not yet confirmed, kept for retry.
    unconfirmed: Arc<Mutex<HashMap<String, OutgoingMessage>>>,
}

impl Outbox {
    pub fn new(client: SyncClient, uploader: Arc<dyn AttachmentUploader>, user_id: &str) -> Self {
        Outbox {
            client,
            uploader,
            user_id: user_id.to_string(),
            unconfirmed: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Validate the draft and resolve its attachment. Nothing is shown or
    /// sent if this fails.
    pub async fn prepare(&self, room_id: &str, draft: Draft) -> Result<OutgoingMessage, SendError> {
        let text = draft
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        let (text, image_url) = match draft.kind {
            MessageKind::Text => (Some(text.ok_or(SendError::EmptyText)?), None),
            kind => {
                let source = draft
                    .attachment
                    .as_ref()
                    .ok_or(SendError::MissingAttachment(kind.as_str()))?;
                let uploaded = self
                    .uploader
                    .upload(source)
                    .await
                    .map_err(|e| SendError::Upload(e.0))?;
                let text = match kind {
                    MessageKind::File => Some(uploaded.name),
                    _ => text,
                };
                (text, Some(uploaded.url))
            }
        };

        Ok(OutgoingMessage {
            id: new_message_id(),
            room_id: room_id.to_string(),
            sender_id: self.user_id.clone(),
            kind: draft.kind,
            text,
            image_url,
            created_at: now_millis(),
        })
    }

    /// Show a pending message in `view`, then perform the authoritative write.
    /// On failure the entry turns `failed` and the error is returned for the
    /// retry affordance.
    pub async fn send(&self, view: &RoomView, draft: Draft) -> Result<Message, SendError> {
        let outgoing = self.prepare(view.room_id(), draft).await?;
        if !view.merge_in(&[outgoing.to_provisional()]).await {
            return Err(SendError::Closed);
        }
        self.unconfirmed
            .lock()
            .await
            .insert(outgoing.id.clone(), outgoing.clone());
        log::debug!("[outbox] {} pending in {}", outgoing.id, outgoing.room_id);
        self.dispatch(view, outgoing).await
    }

    /// Re-send a `failed` message under the same id.
    pub async fn retry(&self, view: &RoomView, id: &str) -> Result<Message, SendError> {
        let outgoing = self
            .unconfirmed
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SendError::UnknownMessage(id.to_string()))?;
        view.transition(id, MessageStatus::Pending).await?;
        log::debug!("[outbox] retrying {id}");
        self.dispatch(view, outgoing).await
    }

    async fn dispatch(&self, view: &RoomView, outgoing: OutgoingMessage) -> Result<Message, SendError> {
        match self.client.send(&outgoing.room_id, &outgoing).await {
            Ok(ack) => {
                if ack.id != outgoing.id {
                    log::warn!(
                        "[outbox] remote stored {} under {}; the live feed will show a separate record",
                        outgoing.id,
                        ack.id
                    );
                }
                self.unconfirmed.lock().await.remove(&outgoing.id);
                // Confirmation arrives over the live feed.
                Ok(view.get(&outgoing.id).await.unwrap_or_else(|| outgoing.to_provisional()))
            }
            Err(e) => {
                log::warn!("[outbox] send of {} failed: {e}", outgoing.id);
                if !view.is_closed() {
                    if let Err(t) = view.transition(&outgoing.id, MessageStatus::Failed).await {
                        // Already confirmed by the feed; the feed's copy stands.
                        log::debug!("[outbox] not marking {} failed: {t}", outgoing.id);
                    }
                }
                Err(e)
            }
        }
    }

    pub async fn unconfirmed_count(&self) -> usize {
        self.unconfirmed.lock().await.len()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
