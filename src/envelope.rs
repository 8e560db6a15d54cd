// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Feed frame parsing.
//!
//! Jetstream sends one JSON object per WebSocket message. Commit frames
//! carry a record mutation and become an [`Envelope`]; identity and account
//! frames are well-formed but carry nothing to mirror.
//!
//! ```text
//! {"did":"did:plc:abc","time_us":1725911162329308,"kind":"commit",
//!  "commit":{"operation":"create","collection":"app.commons.post",
//!            "rkey":"3l3qo2vuowo2b","record":{...},"cid":"bafyrei..."}}
//! ```

use crate::error::{Result, SyncError};
use serde::Deserialize;
use serde_json::Value;

/// Scheme used when rendering record URIs.
pub const RECORD_URI_SCHEME: &str = "at://";

/// Record mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Parse from the wire value. Returns `None` for anything unknown.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one logical record across its create/update/delete lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordRef {
    pub actor_id: String,
    pub collection: String,
    pub record_key: String,
}

impl RecordRef {
    pub fn new(
        actor_id: impl Into<String>,
        collection: impl Into<String>,
        record_key: impl Into<String>,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            collection: collection.into(),
            record_key: record_key.into(),
        }
    }

    /// `at://{actor}/{collection}/{rkey}`
    pub fn uri(&self) -> String {
        format!(
            "{}{}/{}/{}",
            RECORD_URI_SCHEME, self.actor_id, self.collection, self.record_key
        )
    }

    /// Split a record URI back into its parts.
    ///
    /// Returns `None` unless the URI has the record scheme and exactly three
    /// non-empty path segments.
    pub fn parse(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix(RECORD_URI_SCHEME)?;
        let mut parts = rest.split('/');
        let actor_id = parts.next().filter(|s| !s.is_empty())?;
        let collection = parts.next().filter(|s| !s.is_empty())?;
        let record_key = parts.next().filter(|s| !s.is_empty())?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(actor_id, collection, record_key))
    }
}

impl std::fmt::Display for RecordRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.uri())
    }
}

/// A decoded record mutation from the feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Opaque actor identifier (a DID).
    pub actor_id: String,
    pub operation: Operation,
    pub collection: String,
    pub record_key: String,
    /// Record body. Absent on deletes.
    pub record: Option<Value>,
    /// Content identifier of the record body. Absent on deletes.
    pub content_hash: Option<String>,
    /// Feed position in microseconds since the epoch.
    pub time_us: i64,
}

impl Envelope {
    pub fn record_ref(&self) -> RecordRef {
        RecordRef::new(&self.actor_id, &self.collection, &self.record_key)
    }

    pub fn record_uri(&self) -> String {
        self.record_ref().uri()
    }
}

#[derive(Deserialize)]
struct WireFrame {
    did: String,
    time_us: i64,
    kind: String,
    #[serde(default)]
    commit: Option<WireCommit>,
}

#[derive(Deserialize)]
struct WireCommit {
    operation: String,
    collection: String,
    rkey: String,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    cid: Option<String>,
}

/// Decode one feed frame.
///
/// Returns `Ok(None)` for well-formed frames that carry no commit
/// (`identity`, `account`). Anything else that can't become an envelope is
/// an [`SyncError::EnvelopeParse`].
pub fn parse_frame(text: &str) -> Result<Option<Envelope>> {
    let frame: WireFrame = serde_json::from_str(text)?;

    if frame.did.is_empty() {
        return Err(SyncError::EnvelopeParse("empty did".into()));
    }
    if frame.time_us < 0 {
        return Err(SyncError::EnvelopeParse(format!(
            "negative time_us {}",
            frame.time_us
        )));
    }

    if frame.kind != "commit" {
        return Ok(None);
    }

    let commit = frame
        .commit
        .ok_or_else(|| SyncError::EnvelopeParse("commit frame without commit body".into()))?;

    let operation = Operation::parse(&commit.operation).ok_or_else(|| {
        SyncError::EnvelopeParse(format!("unknown operation '{}'", commit.operation))
    })?;

    if commit.collection.is_empty() || commit.rkey.is_empty() {
        return Err(SyncError::EnvelopeParse("empty collection or rkey".into()));
    }
    if [&frame.did, &commit.collection, &commit.rkey]
        .iter()
        .any(|part| part.contains('/'))
    {
        return Err(SyncError::EnvelopeParse("path separator in record reference".into()));
    }

    Ok(Some(Envelope {
        actor_id: frame.did,
        operation,
        collection: commit.collection,
        record_key: commit.rkey,
        record: commit.record.filter(|r| !r.is_null()),
        content_hash: commit.cid.filter(|c| !c.is_empty()),
        time_us: frame.time_us,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const POST_CREATE: &str = r#"{
        "did": "did:plc:alice",
        "time_us": 1725911162329308,
        "kind": "commit",
        "commit": {
            "rev": "3l3qo2vutsw2b",
            "operation": "create",
            "collection": "app.commons.post",
            "rkey": "3l3qo2vuowo2b",
            "record": {"text": "hello", "community": "at://did:plc:bob/app.commons.community/c1"},
            "cid": "bafyreiabc"
        }
    }"#;

    #[test]
    fn test_parse_commit_create() {
        let env = parse_frame(POST_CREATE).unwrap().unwrap();
        assert_eq!(env.actor_id, "did:plc:alice");
        assert_eq!(env.operation, Operation::Create);
        assert_eq!(env.collection, "app.commons.post");
        assert_eq!(env.record_key, "3l3qo2vuowo2b");
        assert_eq!(env.content_hash.as_deref(), Some("bafyreiabc"));
        assert_eq!(env.time_us, 1725911162329308);
        assert!(env.record.is_some());
        assert_eq!(
            env.record_uri(),
            "at://did:plc:alice/app.commons.post/3l3qo2vuowo2b"
        );
    }

    #[test]
    fn test_parse_delete_has_no_record() {
        let frame = r#"{"did":"did:plc:a","time_us":10,"kind":"commit",
            "commit":{"operation":"delete","collection":"app.commons.vote","rkey":"v1"}}"#;
        let env = parse_frame(frame).unwrap().unwrap();
        assert_eq!(env.operation, Operation::Delete);
        assert!(env.record.is_none());
        assert!(env.content_hash.is_none());
    }

    #[test]
    fn test_parse_identity_frame_yields_nothing() {
        let frame = r#"{"did":"did:plc:a","time_us":10,"kind":"identity",
            "identity":{"did":"did:plc:a","handle":"a.example","seq":1}}"#;
        assert!(parse_frame(frame).unwrap().is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_frame("not json").is_err());
        assert!(parse_frame("{}").is_err());
        assert!(parse_frame("[1,2,3]").is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_operation() {
        let frame = r#"{"did":"did:plc:a","time_us":1,"kind":"commit",
            "commit":{"operation":"upsert","collection":"c","rkey":"k"}}"#;
        let err = parse_frame(frame).unwrap_err();
        assert!(err.to_string().contains("upsert"));
    }

    #[test]
    fn test_parse_rejects_commit_without_body() {
        let frame = r#"{"did":"did:plc:a","time_us":1,"kind":"commit"}"#;
        assert!(parse_frame(frame).is_err());
    }

    #[test]
    fn test_parse_rejects_empty_fields() {
        let empty_rkey = r#"{"did":"did:plc:a","time_us":1,"kind":"commit",
            "commit":{"operation":"create","collection":"c","rkey":""}}"#;
        assert!(parse_frame(empty_rkey).is_err());

        let empty_did = r#"{"did":"","time_us":1,"kind":"commit",
            "commit":{"operation":"create","collection":"c","rkey":"k"}}"#;
        assert!(parse_frame(empty_did).is_err());
    }

    #[test]
    fn test_parse_rejects_negative_time() {
        let frame = r#"{"did":"did:plc:a","time_us":-5,"kind":"commit",
            "commit":{"operation":"create","collection":"c","rkey":"k"}}"#;
        assert!(parse_frame(frame).is_err());
    }

    #[test]
    fn test_null_record_is_none() {
        let frame = r#"{"did":"did:plc:a","time_us":1,"kind":"commit",
            "commit":{"operation":"create","collection":"c","rkey":"k","record":null,"cid":""}}"#;
        let env = parse_frame(frame).unwrap().unwrap();
        assert!(env.record.is_none());
        assert!(env.content_hash.is_none());
    }

    #[test]
    fn test_record_ref_parse_inverts_uri() {
        let r = RecordRef::new("did:plc:a", "app.commons.post", "p1");
        assert_eq!(RecordRef::parse(&r.uri()), Some(r.clone()));
        assert_eq!(r.to_string(), "at://did:plc:a/app.commons.post/p1");
    }

    #[test]
    fn test_record_ref_parse_rejects_malformed() {
        assert!(RecordRef::parse("https://did:plc:a/c/k").is_none());
        assert!(RecordRef::parse("at://did:plc:a/c").is_none());
        assert!(RecordRef::parse("at://did:plc:a/c/k/extra").is_none());
        assert!(RecordRef::parse("at:///c/k").is_none());
    }

    #[test]
    fn test_operation_roundtrip() {
        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            assert_eq!(Operation::parse(op.as_str()), Some(op));
        }
        assert_eq!(Operation::parse("CREATE"), None);
    }
}
