// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The relational mirror.
//!
//! A SQLite database holding the rows the rest of the application reads.
//! Only the collection handlers write to it, each inside one transaction.
//!
//! # Tables
//!
//! ```text
//! actors       did (pk) ─┐ stub rows, never deleted
//! communities  uri (uq) ─┼─ member_count, post_count
//! posts        uri (uq) ─┼─ community_id → communities.id
//!                        │  reply_parent_uri / reply_root_uri (remote refs)
//!                        │  counted_parent_id → posts.id
//!                        │  vote_count, comment_count
//! votes        uri (uq) ─┘ (actor_did, subject_uri) indexed
//!                          subject_post_id → posts.id
//! cursors      feed_id (pk)
//! ```
//!
//! `counted_parent_id` and `subject_post_id` record which row received a
//! counter adjustment, so deletes and vote reverts only undo what was done.

mod rows;

pub use rows::{ActorRow, CommunityRow, MirrorCounts, PostRow, VoteRow};

use crate::config::MirrorConfig;
use crate::error::{Result, SyncError};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS actors (
        did TEXT PRIMARY KEY,
        handle TEXT,
        display_name TEXT,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS communities (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uri TEXT NOT NULL UNIQUE,
        actor_did TEXT NOT NULL,
        rkey TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT,
        content_hash TEXT,
        member_count INTEGER NOT NULL DEFAULT 0,
        post_count INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS posts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uri TEXT NOT NULL UNIQUE,
        actor_did TEXT NOT NULL,
        rkey TEXT NOT NULL,
        community_id INTEGER NOT NULL,
        title TEXT,
        text TEXT NOT NULL,
        embed TEXT,
        tags TEXT NOT NULL DEFAULT '[]',
        reply_parent_uri TEXT,
        reply_root_uri TEXT,
        counted_parent_id INTEGER,
        content_hash TEXT NOT NULL,
        vote_count INTEGER NOT NULL DEFAULT 0,
        comment_count INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS posts_community_idx ON posts (community_id)",
    "CREATE INDEX IF NOT EXISTS posts_reply_parent_idx ON posts (reply_parent_uri)",
    r#"
    CREATE TABLE IF NOT EXISTS votes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uri TEXT NOT NULL UNIQUE,
        actor_did TEXT NOT NULL,
        subject_uri TEXT NOT NULL,
        subject_post_id INTEGER,
        direction TEXT NOT NULL CHECK (direction IN ('up', 'down')),
        content_hash TEXT,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS votes_actor_subject_idx ON votes (actor_did, subject_uri)",
];

const POST_COLUMNS: &str = "id, uri, actor_did, rkey, community_id, title, text, embed, tags, \
     reply_parent_uri, reply_root_uri, counted_parent_id, content_hash, vote_count, comment_count";

const VOTE_COLUMNS: &str = "id, uri, actor_did, subject_uri, subject_post_id, direction";

/// Handle to the mirror database.
#[derive(Clone)]
pub struct Mirror {
    pool: SqlitePool,
    path: String,
}

impl Mirror {
    /// Open (creating if needed) a file-backed mirror in WAL mode.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(&MirrorConfig {
            sqlite_path: path.as_ref().to_string_lossy().to_string(),
            wal_mode: true,
        })
        .await
    }

    pub async fn open_with(config: &MirrorConfig) -> Result<Self> {
        if config.sqlite_path == ":memory:" {
            return Self::open_in_memory().await;
        }

        let path_str = config.sqlite_path.clone();
        info!(path = %path_str, wal = config.wal_mode, "Opening mirror database");

        let journal = if config.wal_mode {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| SyncError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Self::init(pool, path_str).await
    }

    /// Open a private in-memory mirror.
    ///
    /// Pinned to a single connection that is never recycled; each SQLite
    /// memory connection is its own database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| SyncError::Config(format!("Invalid SQLite path: {}", e)))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::init(pool, ":memory:".to_string()).await
    }

    async fn init(pool: SqlitePool, path: String) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool, path })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!(path = %self.path, "Mirror database closed");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn actor(&self, did: &str) -> Result<Option<ActorRow>> {
        let row = sqlx::query_as::<_, ActorRow>(
            "SELECT did, handle, display_name, created_at FROM actors WHERE did = ?",
        )
        .bind(did)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn community_by_uri(&self, uri: &str) -> Result<Option<CommunityRow>> {
        let row = sqlx::query_as::<_, CommunityRow>(
            "SELECT id, uri, actor_did, rkey, name, description, content_hash, member_count, post_count \
             FROM communities WHERE uri = ?",
        )
        .bind(uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn post_by_uri(&self, uri: &str) -> Result<Option<PostRow>> {
        let row = sqlx::query_as::<_, PostRow>(&format!(
            "SELECT {} FROM posts WHERE uri = ?",
            POST_COLUMNS
        ))
        .bind(uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn vote_by_uri(&self, uri: &str) -> Result<Option<VoteRow>> {
        let row = sqlx::query_as::<_, VoteRow>(&format!(
            "SELECT {} FROM votes WHERE uri = ?",
            VOTE_COLUMNS
        ))
        .bind(uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// All vote rows one actor holds on one subject. At most one after any
    /// sequence of vote creates.
    pub async fn votes_by_actor_on(&self, actor_did: &str, subject_uri: &str) -> Result<Vec<VoteRow>> {
        let rows = sqlx::query_as::<_, VoteRow>(&format!(
            "SELECT {} FROM votes WHERE actor_did = ? AND subject_uri = ? ORDER BY id",
            VOTE_COLUMNS
        ))
        .bind(actor_did)
        .bind(subject_uri)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Posts in a community, oldest first.
    pub async fn posts_in_community(&self, community_id: i64) -> Result<Vec<PostRow>> {
        let rows = sqlx::query_as::<_, PostRow>(&format!(
            "SELECT {} FROM posts WHERE community_id = ? ORDER BY id",
            POST_COLUMNS
        ))
        .bind(community_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn counts(&self) -> Result<MirrorCounts> {
        let (actors, communities, posts, votes): (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM actors), (SELECT COUNT(*) FROM communities), \
             (SELECT COUNT(*) FROM posts), (SELECT COUNT(*) FROM votes)",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(MirrorCounts {
            actors,
            communities,
            posts,
            votes,
        })
    }
}
