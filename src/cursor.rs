// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cursor persistence for feed positions.
//!
//! The cursor is the `time_us` of the last envelope the worker finished
//! with. It lives in the `cursors` table of the mirror database, keyed by
//! feed id, so a restart resumes where the previous process stopped.
//!
//! # Debounced Writes
//!
//! - `set()` updates the in-memory cache immediately and marks the feed dirty
//! - `flush_dirty()` persists all dirty cursors in one pass
//! - The coordinator calls `flush_dirty()` periodically and on shutdown
//!
//! A crash between `set()` and `flush_dirty()` loses at most one flush
//! interval of progress. On restart those envelopes are delivered again,
//! which every collection handler tolerates.
//!
//! ## Cursor Semantics
//!
//! ```text
//! handle envelope 1234 → commit mirror tx → set cursor 1234 → (flush)
//!                        (crash here = 1234 redelivered, replay-safe)
//! ```
//!
//! Cursors only move forward: a `set()` with an older position is ignored.

use crate::error::{Result, SyncError};
use crate::resilience::execute_with_retry;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// How the resume position treats an envelope stamped exactly at the cursor.
///
/// Envelopes strictly older than the cursor are never admitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeBoundary {
    /// Replay envelopes whose `time_us` equals the cursor. Several events
    /// can share a microsecond, so this is the at-least-once choice.
    #[default]
    Inclusive,
    /// Skip envelopes whose `time_us` equals the cursor.
    Exclusive,
}

impl ResumeBoundary {
    /// Whether an envelope at `time_us` should be processed after resuming
    /// from `cursor`.
    pub fn admits(self, time_us: i64, cursor: Option<i64>) -> bool {
        match cursor {
            None => true,
            Some(c) => match self {
                ResumeBoundary::Inclusive => time_us >= c,
                ResumeBoundary::Exclusive => time_us > c,
            },
        }
    }
}

/// Persistent cursor storage backed by SQLite.
///
/// Supports debounced writes: updates go to cache immediately,
/// and are flushed to disk periodically via `flush_dirty()`.
pub struct CursorStore {
    pool: SqlitePool,
    /// In-memory cache for fast reads
    cache: Arc<RwLock<HashMap<String, i64>>>,
    /// Feed ids with dirty (not yet persisted) cursors
    dirty: Arc<RwLock<HashSet<String>>>,
}

impl CursorStore {
    /// Open the cursor table on an existing pool and load saved positions.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cursors (
                feed_id TEXT PRIMARY KEY,
                time_us INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT feed_id, time_us FROM cursors")
            .fetch_all(&pool)
            .await?;

        let mut cache = HashMap::new();
        for (feed_id, time_us) in rows {
            debug!(feed_id = %feed_id, time_us, "Loaded cursor from disk");
            cache.insert(feed_id, time_us);
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored cursors from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            dirty: Arc::new(RwLock::new(HashSet::new())),
        })
    }

    /// Get the cursor for a feed. `None` on first run.
    pub async fn get(&self, feed_id: &str) -> Option<i64> {
        self.cache.read().await.get(feed_id).copied()
    }

    /// Advance the cursor for a feed (debounced).
    ///
    /// Returns `false` and leaves the cursor alone if `time_us` is not
    /// newer than the current position.
    pub async fn set(&self, feed_id: &str, time_us: i64) -> bool {
        {
            let mut cache = self.cache.write().await;
            if let Some(&current) = cache.get(feed_id) {
                if current >= time_us {
                    return false;
                }
            }
            cache.insert(feed_id.to_string(), time_us);
        }

        self.dirty.write().await.insert(feed_id.to_string());
        crate::metrics::set_cursor_position(time_us);
        true
    }

    /// Flush all dirty cursors to disk.
    ///
    /// Returns the number of cursors flushed.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let dirty_feeds: Vec<String> = {
            let mut dirty = self.dirty.write().await;
            dirty.drain().collect()
        };

        if dirty_feeds.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let snapshot: Vec<(String, i64)> = {
            let cache = self.cache.read().await;
            dirty_feeds
                .iter()
                .filter_map(|f| cache.get(f).map(|t| (f.clone(), *t)))
                .collect()
        };
        let pool = &self.pool;

        let mut flushed = 0;
        let mut errors = 0;

        for (feed_id, time_us) in &snapshot {
            let result = execute_with_retry("cursor_flush", || async {
                sqlx::query(
                    r#"
                    INSERT INTO cursors (feed_id, time_us, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(feed_id) DO UPDATE SET
                        time_us = MAX(cursors.time_us, excluded.time_us),
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(feed_id.as_str())
                .bind(*time_us)
                .bind(now)
                .execute(pool)
                .await
            })
            .await;

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(feed_id = %feed_id, error = %e, "Failed to flush cursor");
                    // Retry on the next flush
                    self.dirty.write().await.insert(feed_id.clone());
                }
            }
        }

        if flushed > 0 {
            debug!(flushed, errors, "Flushed dirty cursors");
        }
        crate::metrics::record_cursor_flush(flushed, errors);

        if errors > 0 {
            return Err(SyncError::Internal(format!(
                "Failed to flush {} cursors",
                errors
            )));
        }

        Ok(flushed)
    }

    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("cursor_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Flush any dirty cursors and checkpoint the WAL.
    ///
    /// The pool belongs to the mirror and stays open.
    pub async fn close(&self) {
        if self.has_dirty().await {
            match self.flush_dirty().await {
                Ok(count) if count > 0 => info!(count, "Flushed dirty cursors on close"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to flush dirty cursors on close"),
            }
        }

        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        info!("Cursor store closed");
    }
}
