// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collection handlers and the router that dispatches to them.
//!
//! Each mirrored collection has one [`CollectionHandler`]. A handler turns
//! an [`Envelope`] into mirror writes inside a single SQLite transaction
//! and reports what happened as a [`HandleOutcome`].
//!
//! Outcomes cover everything that is not a database failure: duplicates,
//! missing dependencies and unsupported operations are all `Ok`. Only an
//! `Err` is subject to the worker's write failure policy.

pub mod actor;
pub mod community;
pub mod post;
pub mod vote;

pub use actor::ensure_actor_exists;
pub use community::CommunityHandler;
pub use post::PostHandler;
pub use vote::VoteHandler;

use crate::config::CollectionConfig;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::mirror::Mirror;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Why an envelope was accepted but not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Create/update without a record body or content hash.
    MissingRecord,
    /// Record body did not match the collection's schema.
    InvalidRecord,
    /// Post's community is not mirrored.
    UnresolvedCommunity,
    /// Vote's subject post is not mirrored.
    UnresolvedSubject,
    /// Operation the collection does not support (vote update).
    UnsupportedOperation,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MissingRecord => "missing_record",
            SkipReason::InvalidRecord => "invalid_record",
            SkipReason::UnresolvedCommunity => "unresolved_community",
            SkipReason::UnresolvedSubject => "unresolved_subject",
            SkipReason::UnsupportedOperation => "unsupported_operation",
        }
    }
}

/// Result of handling one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The mirror changed.
    Applied,
    /// A create for a record that is already mirrored. Nothing changed.
    Duplicate,
    /// Nothing to do (delete or update of an unknown record, community delete).
    Ignored,
    /// No handler is registered for the collection.
    Unrouted,
    /// Dropped with a log line.
    Skipped(SkipReason),
}

impl HandleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandleOutcome::Applied => "applied",
            HandleOutcome::Duplicate => "duplicate",
            HandleOutcome::Ignored => "ignored",
            HandleOutcome::Unrouted => "unrouted",
            HandleOutcome::Skipped(reason) => reason.as_str(),
        }
    }
}

/// Mirrors one record collection.
pub trait CollectionHandler: Send + Sync {
    /// Short label for logs and metrics ("post", "vote", ...).
    fn kind(&self) -> &'static str;

    fn handle<'a>(
        &'a self,
        mirror: &'a Mirror,
        envelope: &'a Envelope,
    ) -> BoxFuture<'a, Result<HandleOutcome>>;
}

/// Static `collection → handler` map.
#[derive(Default, Clone)]
pub struct Router {
    handlers: HashMap<String, Arc<dyn CollectionHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard community/post/vote routing for the given collection names.
    pub fn from_collections(collections: &CollectionConfig) -> Self {
        let mut router = Self::new();
        router.register(&collections.community, Arc::new(CommunityHandler));
        router.register(&collections.post, Arc::new(PostHandler));
        router.register(&collections.vote, Arc::new(VoteHandler));
        router
    }

    pub fn register(&mut self, collection: impl Into<String>, handler: Arc<dyn CollectionHandler>) {
        self.handlers.insert(collection.into(), handler);
    }

    pub fn handler_for(&self, collection: &str) -> Option<&Arc<dyn CollectionHandler>> {
        self.handlers.get(collection)
    }

    /// Route an envelope to its handler. Unknown collections are a no-op.
    pub async fn dispatch(&self, mirror: &Mirror, envelope: &Envelope) -> Result<HandleOutcome> {
        match self.handlers.get(&envelope.collection) {
            Some(handler) => handler.handle(mirror, envelope).await,
            None => {
                debug!(collection = %envelope.collection, "No handler for collection, dropping");
                Ok(HandleOutcome::Unrouted)
            }
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Operation;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(HandleOutcome::Applied.as_str(), "applied");
        assert_eq!(
            HandleOutcome::Skipped(SkipReason::UnresolvedCommunity).as_str(),
            "unresolved_community"
        );
    }

    #[test]
    fn test_router_registers_three_collections() {
        let collections = CollectionConfig::default();
        let router = Router::from_collections(&collections);
        assert_eq!(router.handler_for(&collections.community).unwrap().kind(), "community");
        assert_eq!(router.handler_for(&collections.post).unwrap().kind(), "post");
        assert_eq!(router.handler_for(&collections.vote).unwrap().kind(), "vote");
        assert!(router.handler_for("app.bsky.feed.like").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_unknown_collection_is_noop() {
        let mirror = Mirror::open_in_memory().await.unwrap();
        let router = Router::from_collections(&CollectionConfig::default());
        let envelope = Envelope {
            actor_id: "did:plc:a".into(),
            operation: Operation::Create,
            collection: "app.bsky.feed.like".into(),
            record_key: "k".into(),
            record: Some(serde_json::json!({})),
            content_hash: Some("bafy".into()),
            time_us: 1,
        };

        let outcome = router.dispatch(&mirror, &envelope).await.unwrap();
        assert_eq!(outcome, HandleOutcome::Unrouted);
        assert_eq!(mirror.counts().await.unwrap().actors, 0);
    }
}
