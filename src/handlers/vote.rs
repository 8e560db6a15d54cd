// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Vote records.
//!
//! One vote per (actor, subject). A new vote from the same actor on the
//! same subject first reverts and removes the old one, then applies itself,
//! so re-voting either way converges to the latest direction.
//!
//! Each vote row remembers the local post id that received its effect
//! (`subject_post_id`). Reverting only touches that row, and only while it
//! still exists.

use super::{ensure_actor_exists, now_millis, CollectionHandler, HandleOutcome, SkipReason};
use crate::envelope::{Envelope, Operation};
use crate::error::Result;
use crate::mirror::Mirror;
use crate::records::{VoteDirection, VoteRecord};
use futures::future::BoxFuture;
use sqlx::SqliteConnection;
use tracing::{debug, warn};

pub struct VoteHandler;

impl CollectionHandler for VoteHandler {
    fn kind(&self) -> &'static str {
        "vote"
    }

    fn handle<'a>(
        &'a self,
        mirror: &'a Mirror,
        envelope: &'a Envelope,
    ) -> BoxFuture<'a, Result<HandleOutcome>> {
        Box::pin(async move {
            match envelope.operation {
                Operation::Create => create(mirror, envelope).await,
                Operation::Delete => delete(mirror, envelope).await,
                Operation::Update => {
                    warn!(uri = %envelope.record_uri(), "Votes are immutable, ignoring update");
                    Ok(HandleOutcome::Skipped(SkipReason::UnsupportedOperation))
                }
            }
        })
    }
}

/// Undo a stored vote's effect on its subject.
async fn revert(
    conn: &mut SqliteConnection,
    subject_post_id: Option<i64>,
    direction: &str,
) -> Result<()> {
    let (Some(post_id), Some(direction)) = (subject_post_id, VoteDirection::parse(direction)) else {
        return Ok(());
    };
    sqlx::query("UPDATE posts SET vote_count = vote_count - ? WHERE id = ?")
        .bind(direction.delta())
        .bind(post_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn create(mirror: &Mirror, envelope: &Envelope) -> Result<HandleOutcome> {
    let uri = envelope.record_uri();
    let Some(body) = envelope.record.as_ref() else {
        warn!(uri = %uri, "Vote create without record, skipping");
        return Ok(HandleOutcome::Skipped(SkipReason::MissingRecord));
    };
    let record: VoteRecord = match serde_json::from_value(body.clone()) {
        Ok(r) => r,
        Err(e) => {
            warn!(uri = %uri, error = %e, "Invalid vote record, skipping");
            return Ok(HandleOutcome::Skipped(SkipReason::InvalidRecord));
        }
    };
    let subject_uri = record.subject.uri();

    let mut tx = mirror.pool().begin().await?;
    ensure_actor_exists(&mut *tx, &envelope.actor_id).await?;

    let subject: Option<(i64,)> = sqlx::query_as("SELECT id FROM posts WHERE uri = ?")
        .bind(subject_uri)
        .fetch_optional(&mut *tx)
        .await?;
    let Some((subject_post_id,)) = subject else {
        tx.commit().await?;
        debug!(uri = %uri, subject = %subject_uri, "Vote subject not mirrored, dropping");
        return Ok(HandleOutcome::Skipped(SkipReason::UnresolvedSubject));
    };

    let previous: Vec<(i64, Option<i64>, String)> = sqlx::query_as(
        "SELECT id, subject_post_id, direction FROM votes WHERE actor_did = ? AND subject_uri = ?",
    )
    .bind(&envelope.actor_id)
    .bind(subject_uri)
    .fetch_all(&mut *tx)
    .await?;

    for (old_id, old_post_id, old_direction) in &previous {
        revert(&mut *tx, *old_post_id, old_direction).await?;
        sqlx::query("DELETE FROM votes WHERE id = ?")
            .bind(*old_id)
            .execute(&mut *tx)
            .await?;
    }

    let inserted = sqlx::query(
        r#"
        INSERT INTO votes (uri, actor_did, subject_uri, subject_post_id, direction, content_hash, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(uri) DO NOTHING
        "#,
    )
    .bind(&uri)
    .bind(&envelope.actor_id)
    .bind(subject_uri)
    .bind(subject_post_id)
    .bind(record.direction.as_str())
    .bind(&envelope.content_hash)
    .bind(now_millis())
    .execute(&mut *tx)
    .await?
    .rows_affected()
        == 1;

    if inserted {
        sqlx::query("UPDATE posts SET vote_count = vote_count + ? WHERE id = ?")
            .bind(record.direction.delta())
            .bind(subject_post_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;

    debug!(
        uri = %uri,
        subject = %subject_uri,
        direction = record.direction.as_str(),
        replaced = previous.len(),
        "Vote recorded"
    );
    if inserted {
        Ok(HandleOutcome::Applied)
    } else {
        Ok(HandleOutcome::Duplicate)
    }
}

async fn delete(mirror: &Mirror, envelope: &Envelope) -> Result<HandleOutcome> {
    let uri = envelope.record_uri();
    let mut tx = mirror.pool().begin().await?;

    let existing: Option<(i64, Option<i64>, String)> =
        sqlx::query_as("SELECT id, subject_post_id, direction FROM votes WHERE uri = ?")
            .bind(&uri)
            .fetch_optional(&mut *tx)
            .await?;

    let Some((id, subject_post_id, direction)) = existing else {
        debug!(uri = %uri, "Delete for vote that is not mirrored, ignoring");
        return Ok(HandleOutcome::Ignored);
    };

    revert(&mut *tx, subject_post_id, &direction).await?;
    sqlx::query("DELETE FROM votes WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    debug!(uri = %uri, "Vote deleted");
    Ok(HandleOutcome::Applied)
}
