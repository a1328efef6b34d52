//! Schema versioning for the local message cache.
//!
//! Migrations are keyed by the version they produce. A fresh install never
//! walks the chain: it creates the table at the latest shape and stamps the
//! version directly, since the incremental steps are ALTERs against a table
//! that would not exist yet. Every pass reads the stored version inside the
//! same transaction that writes it, so a second pass (or a second process)
//! finds nothing left to do.

use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection};
use thiserror::Error;

use crate::store::{LocalStore, MESSAGES_TABLE};

pub const LATEST_VERSION: i64 = 3;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration to v{version} failed: {source}")]
    Step { version: i64, source: sqlx::Error },
    #[error("schema version {found} is newer than supported v{latest}")]
    NewerThanSupported { found: i64, latest: i64 },
    #[error("store already initialised at v{0}")]
    AlreadyInitialised(i64),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// One schema step; applied atomically together with the rest of its pass.
#[derive(Debug)]
pub struct Migration {
    pub version: i64,
    pub statements: &'static [&'static str],
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        statements: &[
            "CREATE TABLE messages (
                id           TEXT PRIMARY KEY,
                roomId       TEXT NOT NULL,
                text         TEXT,
                senderId     TEXT NOT NULL,
                createdAt    INTEGER NOT NULL,
                type         TEXT NOT NULL,
                imageUrl     TEXT,
                senderPicURL TEXT,
                senderName   TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_messages_room_created ON messages (roomId, createdAt DESC)",
        ],
    },
    Migration {
        version: 2,
        statements: &[
            "ALTER TABLE messages ADD COLUMN seq INTEGER DEFAULT 0",
            "CREATE INDEX IF NOT EXISTS idx_messages_room_seq ON messages (roomId, seq DESC)",
        ],
    },
    Migration {
        version: 3,
        statements: &["ALTER TABLE messages ADD COLUMN status TEXT DEFAULT 'success'"],
    },
];

/// The table as it looks after the last migration.
const FRESH_SCHEMA: &[&str] = &[
    "CREATE TABLE messages (
        id           TEXT PRIMARY KEY,
        roomId       TEXT NOT NULL,
        text         TEXT,
        senderId     TEXT NOT NULL,
        createdAt    INTEGER NOT NULL,
        type         TEXT NOT NULL,
        imageUrl     TEXT,
        senderPicURL TEXT,
        senderName   TEXT,
        seq          INTEGER DEFAULT 0,
        status       TEXT DEFAULT 'success'
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_room_created ON messages (roomId, createdAt DESC)",
    "CREATE INDEX IF NOT EXISTS idx_messages_room_seq ON messages (roomId, seq DESC)",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Empty store: table created at the latest shape.
    CreatedFresh,
    /// Applied every step from `from + 1` through `LATEST_VERSION`.
    Upgraded { from: i64 },
    UpToDate,
}

pub struct MigrationManager {
    store: LocalStore,
}

impl MigrationManager {
    pub fn new(store: &LocalStore) -> Self {
        MigrationManager {
            store: store.clone(),
        }
    }

    pub async fn current_version(&self) -> Result<i64, MigrationError> {
        let _schema = self.store.shared().await;
        let mut conn = self.store.pool().acquire().await?;
        Ok(read_version(&mut conn).await?)
    }

    /// Bring the store to `LATEST_VERSION`. On an empty store this takes the
    /// fresh-install path instead of the chain.
    pub async fn migrate_to_latest(&self) -> Result<MigrationOutcome, MigrationError> {
        let _exclusive = self.store.exclusive().await;
        let mut conn = begin_immediate(&self.store).await?;
        let result = upgrade(&mut conn).await;
        let outcome = finish(&mut conn, result).await?;

        match outcome {
            MigrationOutcome::CreatedFresh => {
                log::info!("[migrate] created fresh cache schema at v{LATEST_VERSION}")
            }
            MigrationOutcome::Upgraded { from } => {
                log::info!("[migrate] upgraded cache schema v{from} -> v{LATEST_VERSION}")
            }
            MigrationOutcome::UpToDate => {}
        }
        Ok(outcome)
    }

    /// Create the table at the latest shape on an empty store.
    pub async fn create_fresh_at_latest(&self) -> Result<(), MigrationError> {
        let _exclusive = self.store.exclusive().await;
        let mut conn = begin_immediate(&self.store).await?;
        let result = async {
            let current = read_version(&mut conn).await?;
            if current != 0 {
                return Err(MigrationError::AlreadyInitialised(current));
            }
            create_fresh(&mut conn).await
        }
        .await;
        finish(&mut conn, result).await
    }

    /// Drop everything and recreate at the latest version. This is the
    /// user-triggered cache reset and the recovery path for failed migrations.
    pub async fn reset(&self) -> Result<(), MigrationError> {
        let _exclusive = self.store.exclusive().await;
        let mut conn = begin_immediate(&self.store).await?;
        let result = async {
            sqlx::query("DROP TABLE IF EXISTS messages").execute(&mut *conn).await?;
            sqlx::query("DROP TABLE IF EXISTS schema_version").execute(&mut *conn).await?;
            sqlx::query(LocalStore::version_table_ddl()).execute(&mut *conn).await?;
            create_fresh(&mut conn).await
        }
        .await;
        finish(&mut conn, result).await?;

        log::warn!("[migrate] cache reset to v{LATEST_VERSION}");
        Ok(())
    }
}

// ─── Transactions ────────────────────────────────────────────────────────────

/// Take the database write lock before the version is read, so a pass from
/// another handle on the same file waits on the busy timeout instead of
/// failing to upgrade a read lock.
async fn begin_immediate(store: &LocalStore) -> Result<PoolConnection<Sqlite>, sqlx::Error> {
    let mut conn = store.pool().acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(conn)
}

async fn finish<T>(
    conn: &mut SqliteConnection,
    result: Result<T, MigrationError>,
) -> Result<T, MigrationError> {
    match result {
        Ok(value) => {
            sqlx::query("COMMIT").execute(&mut *conn).await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                log::warn!("[migrate] rollback failed: {rollback}");
            }
            Err(e)
        }
    }
}

async fn upgrade(conn: &mut SqliteConnection) -> Result<MigrationOutcome, MigrationError> {
    let current = read_version(conn).await?;
    if current == 0 {
        create_fresh(conn).await?;
        return Ok(MigrationOutcome::CreatedFresh);
    }
    if current > LATEST_VERSION {
        return Err(MigrationError::NewerThanSupported {
            found: current,
            latest: LATEST_VERSION,
        });
    }
    if current == LATEST_VERSION {
        return Ok(MigrationOutcome::UpToDate);
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        for sql in migration.statements {
            sqlx::query(sql)
                .execute(&mut *conn)
                .await
                .map_err(|source| MigrationError::Step {
                    version: migration.version,
                    source,
                })?;
        }
        log::debug!("[migrate] applied v{}", migration.version);
    }
    stamp_version(conn, LATEST_VERSION).await?;
    Ok(MigrationOutcome::Upgraded { from: current })
}

async fn read_version(conn: &mut SqliteConnection) -> Result<i64, sqlx::Error> {
    let version = sqlx::query_scalar::<_, i64>("SELECT version FROM schema_version WHERE id = 1")
        .fetch_optional(&mut *conn)
        .await?;
    Ok(version.unwrap_or(0))
}

async fn stamp_version(conn: &mut SqliteConnection, version: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO schema_version (id, version) VALUES (1, ?)
         ON CONFLICT(id) DO UPDATE SET version = excluded.version",
    )
    .bind(version)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn create_fresh(conn: &mut SqliteConnection) -> Result<(), MigrationError> {
    // Unversioned leftovers have an unknown shape; it is only a cache.
    let leftover = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
    )
    .bind(MESSAGES_TABLE)
    .fetch_one(&mut *conn)
    .await?;
    if leftover > 0 {
        log::warn!("[migrate] dropping unversioned messages table");
        sqlx::query("DROP TABLE messages").execute(&mut *conn).await?;
    }

    for sql in FRESH_SCHEMA {
        sqlx::query(sql)
            .execute(&mut *conn)
            .await
            .map_err(|source| MigrationError::Step {
                version: LATEST_VERSION,
                source,
            })?;
    }
    stamp_version(conn, LATEST_VERSION).await?;
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
