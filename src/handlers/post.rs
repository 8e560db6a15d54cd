// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Post records and the counters they drive.
//!
//! | Event | Row | Counter |
//! |-------|-----|---------|
//! | create, top-level | insert if new | community `post_count` +1 if inserted |
//! | create, reply | insert if new | parent `comment_count` +1 if inserted and parent mirrored |
//! | update | overwrite title/text/embed/tags | none |
//! | delete | read, adjust, then delete | undo whichever increment the row received |
//!
//! A post whose community is not mirrored is dropped. A reply whose parent
//! is not mirrored is still stored; it just never counts toward that parent,
//! even if the parent shows up later.

use super::{ensure_actor_exists, now_millis, CollectionHandler, HandleOutcome, SkipReason};
use crate::envelope::{Envelope, Operation};
use crate::error::Result;
use crate::mirror::Mirror;
use crate::records::PostRecord;
use futures::future::BoxFuture;
use sqlx::SqliteConnection;
use tracing::{debug, warn};

pub struct PostHandler;

impl CollectionHandler for PostHandler {
    fn kind(&self) -> &'static str {
        "post"
    }

    fn handle<'a>(
        &'a self,
        mirror: &'a Mirror,
        envelope: &'a Envelope,
    ) -> BoxFuture<'a, Result<HandleOutcome>> {
        Box::pin(async move {
            match envelope.operation {
                Operation::Create => create(mirror, envelope).await,
                Operation::Update => update(mirror, envelope).await,
                Operation::Delete => delete(mirror, envelope).await,
            }
        })
    }
}

/// Pull the typed record out of a create/update envelope.
fn decode(envelope: &Envelope, uri: &str) -> std::result::Result<PostRecord, HandleOutcome> {
    let (Some(body), Some(_)) = (envelope.record.as_ref(), envelope.content_hash.as_ref()) else {
        warn!(uri = %uri, op = %envelope.operation, "Post event without record or content hash, skipping");
        return Err(HandleOutcome::Skipped(SkipReason::MissingRecord));
    };
    serde_json::from_value(body.clone()).map_err(|e| {
        warn!(uri = %uri, error = %e, "Invalid post record, skipping");
        HandleOutcome::Skipped(SkipReason::InvalidRecord)
    })
}

async fn resolve_community(conn: &mut SqliteConnection, community_uri: &str) -> Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM communities WHERE uri = ?")
        .bind(community_uri)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|(id,)| id))
}

async fn create(mirror: &Mirror, envelope: &Envelope) -> Result<HandleOutcome> {
    let uri = envelope.record_uri();
    let record = match decode(envelope, &uri) {
        Ok(r) => r,
        Err(outcome) => return Ok(outcome),
    };

    let mut tx = mirror.pool().begin().await?;
    ensure_actor_exists(&mut *tx, &envelope.actor_id).await?;

    let Some(community_id) = resolve_community(&mut *tx, record.community.uri()).await? else {
        tx.commit().await?;
        warn!(uri = %uri, community = %record.community.uri(), "Post references unknown community, dropping");
        return Ok(HandleOutcome::Skipped(SkipReason::UnresolvedCommunity));
    };

    let parent_uri = record.reply.as_ref().map(|r| r.parent.uri().to_string());
    let root_uri = record.reply.as_ref().map(|r| r.root.uri().to_string());

    let parent_id: Option<i64> = match &parent_uri {
        Some(parent) => sqlx::query_as::<_, (i64,)>("SELECT id FROM posts WHERE uri = ?")
            .bind(parent)
            .fetch_optional(&mut *tx)
            .await?
            .map(|(id,)| id),
        None => None,
    };

    let embed = record.embed.as_ref().map(|e| e.to_string());
    let tags = serde_json::to_string(&record.tags).unwrap_or_else(|_| "[]".to_string());
    let now = now_millis();

    let inserted = sqlx::query(
        r#"
        INSERT INTO posts (
            uri, actor_did, rkey, community_id, title, text, embed, tags,
            reply_parent_uri, reply_root_uri, counted_parent_id, content_hash,
            created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(uri) DO NOTHING
        "#,
    )
    .bind(&uri)
    .bind(&envelope.actor_id)
    .bind(&envelope.record_key)
    .bind(community_id)
    .bind(&record.title)
    .bind(&record.text)
    .bind(&embed)
    .bind(&tags)
    .bind(&parent_uri)
    .bind(&root_uri)
    .bind(parent_id)
    .bind(&envelope.content_hash)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .rows_affected()
        == 1;

    if !inserted {
        tx.commit().await?;
        debug!(uri = %uri, "Post already mirrored, no counter change");
        return Ok(HandleOutcome::Duplicate);
    }

    match (&parent_uri, parent_id) {
        (None, _) => {
            sqlx::query("UPDATE communities SET post_count = post_count + 1 WHERE id = ?")
                .bind(community_id)
                .execute(&mut *tx)
                .await?;
        }
        (Some(_), Some(pid)) => {
            sqlx::query("UPDATE posts SET comment_count = comment_count + 1 WHERE id = ?")
                .bind(pid)
                .execute(&mut *tx)
                .await?;
        }
        (Some(parent), None) => {
            debug!(uri = %uri, parent = %parent, "Reply parent not mirrored, comment count unchanged");
        }
    }

    tx.commit().await?;
    debug!(uri = %uri, community_id, reply = parent_uri.is_some(), "Post created");
    Ok(HandleOutcome::Applied)
}

async fn update(mirror: &Mirror, envelope: &Envelope) -> Result<HandleOutcome> {
    let uri = envelope.record_uri();
    let record = match decode(envelope, &uri) {
        Ok(r) => r,
        Err(outcome) => return Ok(outcome),
    };

    let mut tx = mirror.pool().begin().await?;
    ensure_actor_exists(&mut *tx, &envelope.actor_id).await?;

    if resolve_community(&mut *tx, record.community.uri()).await?.is_none() {
        tx.commit().await?;
        warn!(uri = %uri, community = %record.community.uri(), "Post update references unknown community, dropping");
        return Ok(HandleOutcome::Skipped(SkipReason::UnresolvedCommunity));
    }

    let embed = record.embed.as_ref().map(|e| e.to_string());
    let tags = serde_json::to_string(&record.tags).unwrap_or_else(|_| "[]".to_string());

    let updated = sqlx::query(
        r#"
        UPDATE posts
        SET title = ?, text = ?, embed = ?, tags = ?, content_hash = ?, updated_at = ?
        WHERE uri = ?
        "#,
    )
    .bind(&record.title)
    .bind(&record.text)
    .bind(&embed)
    .bind(&tags)
    .bind(&envelope.content_hash)
    .bind(now_millis())
    .bind(&uri)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    tx.commit().await?;

    if updated == 0 {
        debug!(uri = %uri, "Update for post that is not mirrored, ignoring");
        return Ok(HandleOutcome::Ignored);
    }
    debug!(uri = %uri, "Post updated");
    Ok(HandleOutcome::Applied)
}

async fn delete(mirror: &Mirror, envelope: &Envelope) -> Result<HandleOutcome> {
    let uri = envelope.record_uri();
    let mut tx = mirror.pool().begin().await?;

    let existing: Option<(i64, i64, Option<String>, Option<i64>)> = sqlx::query_as(
        "SELECT id, community_id, reply_root_uri, counted_parent_id FROM posts WHERE uri = ?",
    )
    .bind(&uri)
    .fetch_optional(&mut *tx)
    .await?;

    let Some((id, community_id, reply_root_uri, counted_parent_id)) = existing else {
        debug!(uri = %uri, "Delete for post that is not mirrored, ignoring");
        return Ok(HandleOutcome::Ignored);
    };

    if reply_root_uri.is_some() {
        if let Some(parent_id) = counted_parent_id {
            sqlx::query("UPDATE posts SET comment_count = comment_count - 1 WHERE id = ?")
                .bind(parent_id)
                .execute(&mut *tx)
                .await?;
        }
    } else {
        sqlx::query("UPDATE communities SET post_count = post_count - 1 WHERE id = ?")
            .bind(community_id)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query("DELETE FROM posts WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    debug!(uri = %uri, "Post deleted");
    Ok(HandleOutcome::Applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::CommunityHandler;
    use serde_json::{json, Value};

    const COMMUNITY_URI: &str = "at://did:plc:owner/app.commons.community/c1";

    fn envelope(op: Operation, actor: &str, rkey: &str, record: Option<Value>) -> Envelope {
        Envelope {
            actor_id: actor.into(),
            operation: op,
            collection: "app.commons.post".into(),
            record_key: rkey.into(),
            content_hash: record.as_ref().map(|_| format!("bafy{}", rkey)),
            record,
            time_us: 1,
        }
    }

    fn top_level(rkey: &str) -> Envelope {
        envelope(
            Operation::Create,
            "did:plc:alice",
            rkey,
            Some(json!({"title": "t", "text": "body", "community": COMMUNITY_URI})),
        )
    }

    fn reply(rkey: &str, parent_uri: &str) -> Envelope {
        envelope(
            Operation::Create,
            "did:plc:bob",
            rkey,
            Some(json!({
                "text": "reply",
                "community": COMMUNITY_URI,
                "reply": {"parent": parent_uri, "root": parent_uri}
            })),
        )
    }

    async fn mirror_with_community() -> Mirror {
        let mirror = Mirror::open_in_memory().await.unwrap();
        let community = Envelope {
            actor_id: "did:plc:owner".into(),
            operation: Operation::Create,
            collection: "app.commons.community".into(),
            record_key: "c1".into(),
            record: Some(json!({"name": "c1"})),
            content_hash: Some("bafyc1".into()),
            time_us: 1,
        };
        CommunityHandler.handle(&mirror, &community).await.unwrap();
        mirror
    }

    async fn post_count(mirror: &Mirror) -> i64 {
        mirror.community_by_uri(COMMUNITY_URI).await.unwrap().unwrap().post_count
    }

    #[tokio::test]
    async fn test_duplicate_create_counts_once() {
        let mirror = mirror_with_community().await;
        let p1 = top_level("p1");

        assert_eq!(PostHandler.handle(&mirror, &p1).await.unwrap(), HandleOutcome::Applied);
        assert_eq!(PostHandler.handle(&mirror, &p1).await.unwrap(), HandleOutcome::Duplicate);

        assert_eq!(post_count(&mirror).await, 1);
        assert_eq!(mirror.counts().await.unwrap().posts, 1);
    }

    #[tokio::test]
    async fn test_unknown_community_drops_post() {
        let mirror = Mirror::open_in_memory().await.unwrap();
        let outcome = PostHandler.handle(&mirror, &top_level("p1")).await.unwrap();
        assert_eq!(outcome, HandleOutcome::Skipped(SkipReason::UnresolvedCommunity));
        assert_eq!(mirror.counts().await.unwrap().posts, 0);
        // The actor is provisioned before the community lookup.
        assert!(mirror.actor("did:plc:alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_content_hash_is_skipped() {
        let mirror = mirror_with_community().await;
        let mut p1 = top_level("p1");
        p1.content_hash = None;
        assert_eq!(
            PostHandler.handle(&mirror, &p1).await.unwrap(),
            HandleOutcome::Skipped(SkipReason::MissingRecord)
        );
    }

    #[tokio::test]
    async fn test_reply_increments_parent_not_community() {
        let mirror = mirror_with_community().await;
        let p1 = top_level("p1");
        PostHandler.handle(&mirror, &p1).await.unwrap();

        let r1 = reply("r1", &p1.record_uri());
        assert_eq!(PostHandler.handle(&mirror, &r1).await.unwrap(), HandleOutcome::Applied);
        PostHandler.handle(&mirror, &r1).await.unwrap();

        let parent = mirror.post_by_uri(&p1.record_uri()).await.unwrap().unwrap();
        assert_eq!(parent.comment_count, 1);
        assert_eq!(post_count(&mirror).await, 1);

        let stored = mirror.post_by_uri(&r1.record_uri()).await.unwrap().unwrap();
        assert!(stored.is_reply());
        assert_eq!(stored.counted_parent_id, Some(parent.id));
    }

    #[tokio::test]
    async fn test_reply_before_parent_is_stored_without_increment() {
        let mirror = mirror_with_community().await;
        let p1 = top_level("p1");
        let r1 = reply("r1", &p1.record_uri());

        assert_eq!(PostHandler.handle(&mirror, &r1).await.unwrap(), HandleOutcome::Applied);
        PostHandler.handle(&mirror, &p1).await.unwrap();

        let parent = mirror.post_by_uri(&p1.record_uri()).await.unwrap().unwrap();
        assert_eq!(parent.comment_count, 0);

        // Deleting the uncounted reply must not push the parent negative.
        let del = envelope(Operation::Delete, "did:plc:bob", "r1", None);
        PostHandler.handle(&mirror, &del).await.unwrap();
        let parent = mirror.post_by_uri(&p1.record_uri()).await.unwrap().unwrap();
        assert_eq!(parent.comment_count, 0);
    }

    #[tokio::test]
    async fn test_delete_reply_decrements_parent() {
        let mirror = mirror_with_community().await;
        let p1 = top_level("p1");
        PostHandler.handle(&mirror, &p1).await.unwrap();
        PostHandler.handle(&mirror, &reply("r1", &p1.record_uri())).await.unwrap();

        let del = envelope(Operation::Delete, "did:plc:bob", "r1", None);
        assert_eq!(PostHandler.handle(&mirror, &del).await.unwrap(), HandleOutcome::Applied);

        let parent = mirror.post_by_uri(&p1.record_uri()).await.unwrap().unwrap();
        assert_eq!(parent.comment_count, 0);
        assert_eq!(post_count(&mirror).await, 1);
    }

    #[tokio::test]
    async fn test_delete_top_level_and_replay_delete() {
        let mirror = mirror_with_community().await;
        PostHandler.handle(&mirror, &top_level("p1")).await.unwrap();

        let del = envelope(Operation::Delete, "did:plc:alice", "p1", None);
        assert_eq!(PostHandler.handle(&mirror, &del).await.unwrap(), HandleOutcome::Applied);
        assert_eq!(PostHandler.handle(&mirror, &del).await.unwrap(), HandleOutcome::Ignored);
        assert_eq!(post_count(&mirror).await, 0);
    }

    #[tokio::test]
    async fn test_update_overwrites_content_not_counters() {
        let mirror = mirror_with_community().await;
        let p1 = top_level("p1");
        PostHandler.handle(&mirror, &p1).await.unwrap();
        sqlx::query("UPDATE posts SET vote_count = 4, comment_count = 2 WHERE uri = ?")
            .bind(p1.record_uri())
            .execute(mirror.pool())
            .await
            .unwrap();

        let upd = envelope(
            Operation::Update,
            "did:plc:alice",
            "p1",
            Some(json!({
                "title": "edited",
                "text": "new body",
                "community": COMMUNITY_URI,
                "tags": ["a", "b"],
                "embed": {"url": "https://example.com"}
            })),
        );
        assert_eq!(PostHandler.handle(&mirror, &upd).await.unwrap(), HandleOutcome::Applied);

        let row = mirror.post_by_uri(&p1.record_uri()).await.unwrap().unwrap();
        assert_eq!(row.title.as_deref(), Some("edited"));
        assert_eq!(row.text, "new body");
        assert_eq!(row.tag_list(), vec!["a".to_string(), "b".to_string()]);
        assert!(row.embed.is_some());
        assert_eq!(row.vote_count, 4);
        assert_eq!(row.comment_count, 2);
        assert_eq!(post_count(&mirror).await, 1);
    }

    #[tokio::test]
    async fn test_update_of_unknown_post_is_ignored() {
        let mirror = mirror_with_community().await;
        let mut upd = top_level("ghost");
        upd.operation = Operation::Update;
        assert_eq!(PostHandler.handle(&mirror, &upd).await.unwrap(), HandleOutcome::Ignored);
        assert_eq!(mirror.counts().await.unwrap().posts, 0);
    }
}
