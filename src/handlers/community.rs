// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Community records: upsert on create/update, retain on delete.

use super::{ensure_actor_exists, now_millis, CollectionHandler, HandleOutcome, SkipReason};
use crate::envelope::{Envelope, Operation};
use crate::error::Result;
use crate::mirror::Mirror;
use crate::records::CommunityRecord;
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

pub struct CommunityHandler;

impl CollectionHandler for CommunityHandler {
    fn kind(&self) -> &'static str {
        "community"
    }

    fn handle<'a>(
        &'a self,
        mirror: &'a Mirror,
        envelope: &'a Envelope,
    ) -> BoxFuture<'a, Result<HandleOutcome>> {
        Box::pin(async move {
            match envelope.operation {
                Operation::Create | Operation::Update => upsert(mirror, envelope).await,
                Operation::Delete => {
                    info!(uri = %envelope.record_uri(), "Community deleted upstream, retaining mirror row");
                    Ok(HandleOutcome::Ignored)
                }
            }
        })
    }
}

async fn upsert(mirror: &Mirror, envelope: &Envelope) -> Result<HandleOutcome> {
    let uri = envelope.record_uri();
    let Some(body) = envelope.record.as_ref() else {
        warn!(uri = %uri, "Community event without record, skipping");
        return Ok(HandleOutcome::Skipped(SkipReason::MissingRecord));
    };
    let record: CommunityRecord = match serde_json::from_value(body.clone()) {
        Ok(r) => r,
        Err(e) => {
            warn!(uri = %uri, error = %e, "Invalid community record, skipping");
            return Ok(HandleOutcome::Skipped(SkipReason::InvalidRecord));
        }
    };

    let mut tx = mirror.pool().begin().await?;
    ensure_actor_exists(&mut *tx, &envelope.actor_id).await?;

    let now = now_millis();
    // member_count and post_count stay out of the update set.
    sqlx::query(
        r#"
        INSERT INTO communities (uri, actor_did, rkey, name, description, content_hash, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(uri) DO UPDATE SET
            name = excluded.name,
            description = excluded.description,
            content_hash = excluded.content_hash,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&uri)
    .bind(&envelope.actor_id)
    .bind(&envelope.record_key)
    .bind(&record.name)
    .bind(&record.description)
    .bind(&envelope.content_hash)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    debug!(uri = %uri, name = %record.name, op = %envelope.operation, "Community upserted");
    Ok(HandleOutcome::Applied)
}
