// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Firehose Mirror
//!
//! Subscribes to a Jetstream-style firehose and mirrors community, post and
//! vote records into a local SQLite database, keeping denormalized counters
//! (posts per community, comments per post, vote score per post) consistent.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                             firehose-mirror                               │
//! │                                                                           │
//! │  ┌──────────────┐   ┌──────────────┐   bounded   ┌──────────────────────┐ │
//! │  │ StreamClient │──►│ parse_frame  │───queue────►│ Worker (single)      │ │
//! │  │ (WebSocket)  │   │ + filter     │             │ Router → Handler     │ │
//! │  └──────────────┘   └──────────────┘             └──────────────────────┘ │
//! │         ▲ cursor=                                    │            │       │
//! │         │                                            ▼            ▼       │
//! │  ┌─────────────┐                          ┌──────────────┐ ┌────────────┐ │
//! │  │ CursorStore │◄──────── set(time_us) ───│   Mirror     │ │ counters   │ │
//! │  │ (SQLite)    │                          │ (SQLite)     │ │ (same tx)  │ │
//! │  └─────────────┘                          └──────────────┘ └────────────┘ │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering
//!
//! All envelopes pass through one worker, in arrival order, so a vote never
//! races the post it targets and a reply never races its parent. Each
//! handler commits its row change and counter change in one transaction.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use firehose_mirror::{Mirror, SyncConfig, SyncEngine, WebSocketTransport};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> firehose_mirror::Result<()> {
//!     let config = SyncConfig::load(None)?;
//!     let mirror = Arc::new(Mirror::open_with(&config.mirror).await?);
//!
//!     let mut engine = SyncEngine::new(config, mirror, Arc::new(WebSocketTransport));
//!     engine.start().await?;
//!
//!     // Engine runs until shutdown signal
//!     let _cursor = engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod mirror;
pub mod records;
pub mod resilience;
pub mod stream;

// Re-exports for convenience
pub use config::{
    CollectionConfig, FeedConfig, HandlingConfig, MirrorConfig, ReconnectConfig, SyncConfig,
    WriteFailurePolicy,
};
pub use coordinator::{EngineState, SyncEngine};
pub use cursor::{CursorStore, ResumeBoundary};
pub use envelope::{parse_frame, Envelope, Operation, RecordRef};
pub use error::{Result, SyncError};
pub use handlers::{CollectionHandler, HandleOutcome, Router, SkipReason};
pub use mirror::Mirror;
pub use stream::{
    ClientSettings, ClientState, FeedConnection, FrameStream, StreamClient, Transport,
    WebSocketTransport,
};
