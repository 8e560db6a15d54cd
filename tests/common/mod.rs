// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities.
//!
//! This module provides:
//! - A scripted [`Transport`] that replays canned sessions
//! - Jetstream frame builders for each collection
//! - Helpers for waiting on the engine

#![allow(dead_code)]

use firehose_mirror::error::{Result, SyncError};
use firehose_mirror::stream::{FeedConnection, FrameStream, Transport};
use firehose_mirror::{parse_frame, Envelope, SyncEngine};
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

pub const COMMUNITY: &str = "app.commons.community";
pub const POST: &str = "app.commons.post";
pub const VOTE: &str = "app.commons.vote";

// =============================================================================
// Scripted transport
// =============================================================================

/// What one connect attempt yields.
pub enum Session {
    /// Connect fails with this message.
    Refuse(String),
    /// Frames, then the feed closes the connection.
    Frames(Vec<String>),
    /// Frames, then the connection stays open and idle.
    FramesThenHang(Vec<String>),
}

/// Transport that plays back [`Session`]s in order and records every URL it
/// was asked to connect to. Once the script runs out, connects are refused.
pub struct MockTransport {
    sessions: Mutex<VecDeque<Session>>,
    urls: Mutex<Vec<String>>,
    closes: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new(sessions: Vec<Session>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(sessions.into()),
            urls: Mutex::new(Vec::new()),
            closes: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Single open session carrying `frames`.
    pub fn streaming(frames: Vec<String>) -> Arc<Self> {
        Self::new(vec![Session::FramesThenHang(frames)])
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.urls.lock().unwrap().len()
    }

    /// Sessions the client closed itself.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn open(&self, frames: BoxStream<'static, Result<String>>) -> FrameStream {
        Box::new(MockConnection {
            frames,
            closes: Arc::clone(&self.closes),
        })
    }
}

impl Transport for MockTransport {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<FrameStream>> {
        Box::pin(async move {
            self.urls.lock().unwrap().push(url.to_string());
            let next = self.sessions.lock().unwrap().pop_front();
            match next {
                None => Err(SyncError::transport(url, "script exhausted")),
                Some(Session::Refuse(msg)) => Err(SyncError::transport(url, msg)),
                Some(Session::Frames(frames)) => {
                    Ok(self.open(stream::iter(frames.into_iter().map(Ok)).boxed()))
                }
                Some(Session::FramesThenHang(frames)) => Ok(self.open(
                    stream::iter(frames.into_iter().map(Ok))
                        .chain(stream::pending())
                        .boxed(),
                )),
            }
        })
    }
}

struct MockConnection {
    frames: BoxStream<'static, Result<String>>,
    closes: Arc<AtomicUsize>,
}

impl Stream for MockConnection {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.frames.poll_next_unpin(cx)
    }
}

impl FeedConnection for MockConnection {
    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

// =============================================================================
// Frame builders
// =============================================================================

pub fn uri(actor: &str, collection: &str, rkey: &str) -> String {
    format!("at://{actor}/{collection}/{rkey}")
}

fn commit(actor: &str, time_us: i64, op: &str, collection: &str, rkey: &str, record: Option<Value>) -> String {
    let mut commit = json!({
        "rev": format!("rev{time_us}"),
        "operation": op,
        "collection": collection,
        "rkey": rkey,
    });
    if let Some(record) = record {
        commit["record"] = record;
        commit["cid"] = json!(format!("bafy{rkey}{time_us}"));
    }
    json!({
        "did": actor,
        "time_us": time_us,
        "kind": "commit",
        "commit": commit,
    })
    .to_string()
}

pub fn community_frame(actor: &str, rkey: &str, name: &str, time_us: i64) -> String {
    commit(actor, time_us, "create", COMMUNITY, rkey, Some(json!({
        "$type": COMMUNITY,
        "name": name,
        "description": format!("{name} community"),
    })))
}

pub fn post_frame(actor: &str, rkey: &str, community_uri: &str, time_us: i64) -> String {
    commit(actor, time_us, "create", POST, rkey, Some(json!({
        "$type": POST,
        "title": format!("post {rkey}"),
        "text": "body",
        "community": community_uri,
    })))
}

pub fn post_update_frame(actor: &str, rkey: &str, community_uri: &str, title: &str, time_us: i64) -> String {
    commit(actor, time_us, "update", POST, rkey, Some(json!({
        "$type": POST,
        "title": title,
        "text": "edited",
        "community": community_uri,
    })))
}

pub fn reply_frame(actor: &str, rkey: &str, community_uri: &str, parent_uri: &str, time_us: i64) -> String {
    commit(actor, time_us, "create", POST, rkey, Some(json!({
        "$type": POST,
        "text": "a reply",
        "community": community_uri,
        "reply": {
            "parent": {"uri": parent_uri, "cid": "bafyparent"},
            "root": {"uri": parent_uri, "cid": "bafyparent"},
        },
    })))
}

pub fn vote_frame(actor: &str, rkey: &str, subject_uri: &str, direction: &str, time_us: i64) -> String {
    commit(actor, time_us, "create", VOTE, rkey, Some(json!({
        "$type": VOTE,
        "subject": {"uri": subject_uri, "cid": "bafysubject"},
        "direction": direction,
    })))
}

pub fn delete_frame(actor: &str, collection: &str, rkey: &str, time_us: i64) -> String {
    commit(actor, time_us, "delete", collection, rkey, None)
}

pub fn identity_frame(actor: &str, time_us: i64) -> String {
    json!({
        "did": actor,
        "time_us": time_us,
        "kind": "identity",
        "identity": {"did": actor, "handle": "someone.test", "seq": 1, "time": "2024-09-09T19:46:02.102Z"},
    })
    .to_string()
}

/// Decode a frame built above.
pub fn envelope(frame: &str) -> Envelope {
    parse_frame(frame).unwrap().unwrap()
}

// =============================================================================
// Engine helpers
// =============================================================================

/// Poll until the engine's handled cursor reaches `target`.
pub async fn wait_for_cursor<T: Transport>(engine: &SyncEngine<T>, target: i64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if engine.cursor().await.is_some_and(|c| c >= target) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "cursor never reached {target}, at {:?}",
            engine.cursor().await
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
