//! Local message cache over SQLite.
//!
//! One `LocalStore` is opened at startup and cloned into every component that
//! needs it. Reads take the schema gate shared; migrations take it exclusively,
//! so queries issued mid-migration queue instead of seeing a half-built table.
//! Writes for a room additionally go through that room's write lock, so two
//! `upsert_many` calls for the same room never interleave their statements.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::model::{Message, MessageKind, MessageStatus};

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LocalStoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("corrupt row {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

// ─── Schema ──────────────────────────────────────────────────────────────────

pub(crate) const MESSAGES_TABLE: &str = "messages";

const MESSAGE_COLUMNS: &str =
    "id, roomId, text, senderId, createdAt, type, imageUrl, senderPicURL, senderName, seq, status";

/// How long a writer waits for another handle on the same file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const VERSION_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS schema_version (
    id      INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL
)";

// ─── Handle ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    schema_gate: Arc<RwLock<()>>,
    room_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl LocalStore {
    /// Open (or create) the cache database file.
    pub async fn open(path: &Path) -> Result<Self, LocalStoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::with_pool(pool).await
    }

    /// Private in-memory database on a single pinned connection.
    pub async fn open_in_memory() -> Result<Self, LocalStoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, LocalStoreError> {
        sqlx::query(VERSION_TABLE_DDL).execute(&pool).await?;
        Ok(LocalStore {
            pool,
            schema_gate: Arc::new(RwLock::new(())),
            room_locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn version_table_ddl() -> &'static str {
        VERSION_TABLE_DDL
    }

    /// Held for the whole of a migration or reset.
    pub(crate) async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.schema_gate.write().await
    }

    pub(crate) async fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.schema_gate.read().await
    }

    /// Locks nobody holds or waits on (only the map's reference is left) are
    /// pruned, so the map stays as small as the set of rooms being written.
    async fn room_lock(&self, room_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.room_locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    /// Insert-or-replace by `id`. Rows belonging to another room are skipped.
    pub async fn upsert_many(&self, room_id: &str, messages: &[Message]) -> Result<(), LocalStoreError> {
        if messages.is_empty() {
            return Ok(());
        }
        let lock = self.room_lock(room_id).await;
        let _room = lock.lock().await;
        let _schema = self.shared().await;

        let mut tx = self.pool.begin().await?;
        for m in messages {
            if m.room_id != room_id {
                log::warn!(
                    "[store] skipping message {} for room {} while writing room {}",
                    m.id,
                    m.room_id,
                    room_id
                );
                continue;
            }
            insert_or_replace(&mut tx, m).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_by_id(&self, room_id: &str, id: &str) -> Result<(), LocalStoreError> {
        let lock = self.room_lock(room_id).await;
        let _room = lock.lock().await;
        let _schema = self.shared().await;

        sqlx::query("DELETE FROM messages WHERE roomId = ? AND id = ?")
            .bind(room_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_room(&self, room_id: &str) -> Result<(), LocalStoreError> {
        let lock = self.room_lock(room_id).await;
        let _room = lock.lock().await;
        let _schema = self.shared().await;

        sqlx::query("DELETE FROM messages WHERE roomId = ?")
            .bind(room_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_all(&self) -> Result<(), LocalStoreError> {
        let _schema = self.shared().await;
        sqlx::query("DELETE FROM messages").execute(&self.pool).await?;
        Ok(())
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    /// Newest-first page of at most `limit` rows strictly older than `cursor`.
    ///
    /// If the last row's `createdAt` is shared by rows that did not fit, those
    /// rows are appended too, so the next page's strict `<` bound skips nothing.
    /// Rows with identical `createdAt` are ordered by `seq` and otherwise in
    /// no guaranteed order.
    pub async fn query_page(
        &self,
        room_id: &str,
        cursor: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Message>, LocalStoreError> {
        let _schema = self.shared().await;
        let mut tx = self.pool.begin().await?;

        let rows = match cursor {
            Some(before) => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE roomId = ? AND createdAt < ?
                     ORDER BY createdAt DESC, seq DESC LIMIT ?"
                ))
                .bind(room_id)
                .bind(before)
                .bind(limit as i64)
                .fetch_all(&mut *tx)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE roomId = ?
                     ORDER BY createdAt DESC, seq DESC LIMIT ?"
                ))
                .bind(room_id)
                .bind(limit as i64)
                .fetch_all(&mut *tx)
                .await?
            }
        };
        let mut page = rows.iter().map(row_to_message).collect::<Result<Vec<_>, _>>()?;

        if page.len() == limit as usize && limit > 0 {
            let boundary = page[page.len() - 1].created_at;
            let ties = sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE roomId = ? AND createdAt = ?
                 ORDER BY seq DESC"
            ))
            .bind(room_id)
            .bind(boundary)
            .fetch_all(&mut *tx)
            .await?;
            let seen: HashSet<String> = page.iter().map(|m| m.id.clone()).collect();
            for row in &ties {
                let m = row_to_message(row)?;
                if !seen.contains(&m.id) {
                    page.push(m);
                }
            }
        }

        tx.commit().await?;
        Ok(page)
    }

    /// Rows with `seq > after_seq`, oldest first.
    pub async fn query_by_seq(&self, room_id: &str, after_seq: i64) -> Result<Vec<Message>, LocalStoreError> {
        let _schema = self.shared().await;
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE roomId = ? AND seq > ?
             ORDER BY seq ASC"
        ))
        .bind(room_id)
        .bind(after_seq)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    pub async fn get(&self, room_id: &str, id: &str) -> Result<Option<Message>, LocalStoreError> {
        let _schema = self.shared().await;
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE roomId = ? AND id = ?"
        ))
        .bind(room_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_message).transpose()
    }

    pub async fn latest_created_at(&self, room_id: &str) -> Result<Option<i64>, LocalStoreError> {
        let _schema = self.shared().await;
        let latest = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(createdAt) FROM messages WHERE roomId = ?",
        )
        .bind(room_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(latest)
    }

    /// 0 when the room has no sequenced rows.
    pub async fn max_local_seq(&self, room_id: &str) -> Result<i64, LocalStoreError> {
        let _schema = self.shared().await;
        let max = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(seq), 0) FROM messages WHERE roomId = ?",
        )
        .bind(room_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(max)
    }

    pub async fn count(&self, room_id: &str) -> Result<i64, LocalStoreError> {
        let _schema = self.shared().await;
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE roomId = ?")
            .bind(room_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

// ─── Row helpers ─────────────────────────────────────────────────────────────

async fn insert_or_replace(tx: &mut Transaction<'_, Sqlite>, m: &Message) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "INSERT OR REPLACE INTO messages ({MESSAGE_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(&m.id)
    .bind(&m.room_id)
    .bind(&m.text)
    .bind(&m.sender_id)
    .bind(m.created_at)
    .bind(m.kind.as_str())
    .bind(&m.image_url)
    .bind(&m.sender_pic_url)
    .bind(&m.sender_name)
    .bind(m.seq.unwrap_or(0))
    .bind(m.effective_status().as_str())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn row_to_message(r: &SqliteRow) -> Result<Message, LocalStoreError> {
    let id: String = r.try_get("id")?;
    let kind: String = r.try_get("type")?;
    let kind = MessageKind::from_str(&kind).map_err(|reason| LocalStoreError::Corrupt {
        id: id.clone(),
        reason,
    })?;
    let status = r
        .try_get::<Option<String>, _>("status")?
        .map(|s| MessageStatus::from_str(&s))
        .transpose()
        .map_err(|reason| LocalStoreError::Corrupt {
            id: id.clone(),
            reason,
        })?;
    let seq: Option<i64> = r.try_get("seq")?;

    Ok(Message {
        room_id: r.try_get("roomId")?,
        sender_id: r.try_get("senderId")?,
        text: r.try_get("text")?,
        kind,
        image_url: r.try_get("imageUrl")?,
        created_at: r.try_get("createdAt")?,
        seq: seq.filter(|s| *s > 0),
        status,
        sender_name: r.try_get("senderName")?,
        sender_pic_url: r.try_get("senderPicURL")?,
        id,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fresh_store, msg};

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn writes_for_one_room_wait_for_its_lock() {
        let store = fresh_store().await;
        let lock = store.room_lock("r1").await;
        let held = lock.lock().await;

        let blocked = tokio::spawn({
            let store = store.clone();
            async move { store.upsert_many("r1", &[msg("r1", "a", 10, Some(1))]).await }
        });
        let other_room = tokio::spawn({
            let store = store.clone();
            async move { store.upsert_many("r2", &[msg("r2", "b", 10, Some(1))]).await }
        });
        settle().await;

        assert!(other_room.is_finished());
        assert!(!blocked.is_finished());
        assert_eq!(store.count("r1").await.unwrap(), 0);

        drop(held);
        blocked.await.unwrap().unwrap();
        other_room.await.unwrap().unwrap();
        assert_eq!(store.count("r1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_upserts_for_one_room_all_land() {
        let store = fresh_store().await;
        let tasks: Vec<_> = (0..8i64)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let batch: Vec<_> = (0..5i64)
                        .map(|j| msg("r1", &format!("m{}", (i + j) % 10), i * 100 + j, Some(i * 10 + j + 1)))
                        .collect();
                    store.upsert_many("r1", &batch).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(store.count("r1").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn queries_wait_while_schema_is_exclusive() {
        let store = fresh_store().await;
        store.upsert_many("r1", &[msg("r1", "a", 10, Some(1))]).await.unwrap();

        let gate = store.exclusive().await;
        let query = tokio::spawn({
            let store = store.clone();
            async move { store.query_page("r1", None, 10).await }
        });
        let write = tokio::spawn({
            let store = store.clone();
            async move { store.upsert_many("r1", &[msg("r1", "b", 20, Some(2))]).await }
        });
        settle().await;
        assert!(!query.is_finished());
        assert!(!write.is_finished());

        drop(gate);
        assert!(!query.await.unwrap().unwrap().is_empty());
        write.await.unwrap().unwrap();
        assert_eq!(store.count("r1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn idle_room_locks_are_pruned() {
        let store = fresh_store().await;
        for room in ["r1", "r2", "r3"] {
            store.upsert_many(room, &[msg(room, "a", 10, Some(1))]).await.unwrap();
        }
        assert_eq!(store.room_locks.lock().await.len(), 1);

        let busy = store.room_lock("r1").await;
        store.upsert_many("r4", &[msg("r4", "a", 10, Some(1))]).await.unwrap();
        let rooms = store.room_locks.lock().await;
        assert!(rooms.contains_key("r1"));
        assert!(rooms.contains_key("r4"));
        assert_eq!(rooms.len(), 2);
        drop(busy);
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = fresh_store().await;
        let batch = vec![msg("r1", "a", 10, Some(1)), msg("r1", "b", 20, Some(2))];

        store.upsert_many("r1", &batch).await.unwrap();
        let once = store.query_page("r1", None, 50).await.unwrap();
        store.upsert_many("r1", &batch).await.unwrap();
        let twice = store.query_page("r1", None, 50).await.unwrap();

        assert_eq!(once, twice);
        assert_eq!(store.count("r1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn upsert_handles_empty_and_duplicate_ids() {
        let store = fresh_store().await;
        store.upsert_many("r1", &[]).await.unwrap();
        assert_eq!(store.count("r1").await.unwrap(), 0);

        let mut newer = msg("r1", "a", 10, Some(1));
        newer.text = Some("edited".into());
        store
            .upsert_many("r1", &[msg("r1", "a", 10, Some(1)), newer])
            .await
            .unwrap();

        let rows = store.query_page("r1", None, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text.as_deref(), Some("edited"));
    }

    #[tokio::test]
    async fn upsert_skips_rows_from_other_rooms() {
        let store = fresh_store().await;
        store
            .upsert_many("r1", &[msg("r1", "a", 10, None), msg("r2", "x", 11, None)])
            .await
            .unwrap();
        assert_eq!(store.count("r1").await.unwrap(), 1);
        assert_eq!(store.count("r2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn query_page_orders_and_bounds_by_cursor() {
        let store = fresh_store().await;
        let rows: Vec<_> = (1..=5).map(|i| msg("r1", &format!("m{i}"), i * 100, Some(i))).collect();
        store.upsert_many("r1", &rows).await.unwrap();

        let first = store.query_page("r1", None, 2).await.unwrap();
        assert_eq!(first.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), ["m5", "m4"]);

        let second = store.query_page("r1", Some(400), 2).await.unwrap();
        assert_eq!(second.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), ["m3", "m2"]);
    }

    #[tokio::test]
    async fn query_page_includes_rows_tied_at_the_boundary() {
        let store = fresh_store().await;
        store
            .upsert_many(
                "r1",
                &[
                    msg("r1", "a", 300, Some(3)),
                    msg("r1", "b", 200, Some(2)),
                    msg("r1", "c", 200, Some(1)),
                    msg("r1", "d", 100, None),
                ],
            )
            .await
            .unwrap();

        let page = store.query_page("r1", None, 2).await.unwrap();
        let ids: Vec<_> = page.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);

        let next = store.query_page("r1", Some(200), 2).await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, "d");
    }

    #[tokio::test]
    async fn seq_queries_and_watermarks() {
        let store = fresh_store().await;
        assert_eq!(store.max_local_seq("r1").await.unwrap(), 0);
        assert_eq!(store.latest_created_at("r1").await.unwrap(), None);

        store
            .upsert_many(
                "r1",
                &[msg("r1", "a", 10, Some(1)), msg("r1", "b", 30, Some(3)), msg("r1", "c", 20, Some(2))],
            )
            .await
            .unwrap();

        assert_eq!(store.max_local_seq("r1").await.unwrap(), 3);
        assert_eq!(store.latest_created_at("r1").await.unwrap(), Some(30));

        let after = store.query_by_seq("r1", 1).await.unwrap();
        assert_eq!(after.iter().map(|m| m.seq).collect::<Vec<_>>(), [Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn deletes_and_clears() {
        let store = fresh_store().await;
        store
            .upsert_many("r1", &[msg("r1", "a", 10, None), msg("r1", "b", 20, None)])
            .await
            .unwrap();
        store.upsert_many("r2", &[msg("r2", "c", 10, None)]).await.unwrap();

        store.delete_by_id("r1", "a").await.unwrap();
        assert!(store.get("r1", "a").await.unwrap().is_none());
        assert!(store.get("r1", "b").await.unwrap().is_some());

        store.clear_room("r1").await.unwrap();
        assert_eq!(store.count("r1").await.unwrap(), 0);
        assert_eq!(store.count("r2").await.unwrap(), 1);

        store.clear_all().await.unwrap();
        assert_eq!(store.count("r2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unsequenced_rows_read_back_without_seq() {
        let store = fresh_store().await;
        store.upsert_many("r1", &[msg("r1", "a", 10, None)]).await.unwrap();
        let m = store.get("r1", "a").await.unwrap().unwrap();
        assert_eq!(m.seq, None);
        assert_eq!(m.status, Some(MessageStatus::Success));
    }
}
