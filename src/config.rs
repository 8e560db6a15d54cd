//! Configuration for the firehose mirror.
//!
//! Everything the engine needs is in [`SyncConfig`]. It can be built in
//! code, or loaded from an optional TOML/JSON file overlaid with
//! `FIREHOSE_*` environment variables via [`SyncConfig::load`].
//!
//! # Quick Start
//!
//! ```rust
//! use firehose_mirror::config::SyncConfig;
//!
//! let mut config = SyncConfig::for_testing();
//! config.feed.endpoint = "wss://jetstream2.us-east.bsky.network/subscribe".into();
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! SyncConfig
//! ├── feed: FeedConfig               # endpoint, queue, resume boundary
//! ├── collections: CollectionConfig  # the three mirrored collection names
//! ├── reconnect: ReconnectConfig     # backoff schedule and retry budget
//! ├── mirror: MirrorConfig           # SQLite path
//! ├── cursor: CursorConfig           # flush interval
//! ├── handling: HandlingConfig       # write failure policy, drain timeout
//! └── log: LogConfig                 # level and output format
//! ```
//!
//! # TOML Example
//!
//! ```toml
//! [feed]
//! endpoint = "wss://jetstream2.us-east.bsky.network/subscribe"
//! resume_boundary = "inclusive"
//!
//! [reconnect]
//! max_attempts = 12
//! base_delay = "500ms"
//! max_delay = "2m"
//!
//! [mirror]
//! sqlite_path = "/var/lib/firehose/mirror.db"
//!
//! [handling]
//! on_write_failure = "halt"
//! ```
//!
//! The same keys can be set from the environment, e.g.
//! `FIREHOSE_FEED__ENDPOINT` or `FIREHOSE_HANDLING__ON_WRITE_FAILURE=halt`.

use crate::cursor::ResumeBoundary;
use crate::error::{Result, SyncError};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to [`SyncEngine::new()`](crate::SyncEngine::new).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub collections: CollectionConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub mirror: MirrorConfig,

    #[serde(default)]
    pub cursor: CursorConfig,

    #[serde(default)]
    pub handling: HandlingConfig,

    #[serde(default)]
    pub log: LogConfig,
}

impl SyncConfig {
    /// Create a config for tests: in-memory mirror, fast reconnects.
    pub fn for_testing() -> Self {
        Self {
            feed: FeedConfig {
                endpoint: "ws://127.0.0.1:6008/subscribe".to_string(),
                queue_capacity: 16,
                ..Default::default()
            },
            reconnect: ReconnectConfig {
                max_attempts: 3,
                base_delay: "5ms".to_string(),
                max_delay: "50ms".to_string(),
                connect_timeout: "500ms".to_string(),
            },
            mirror: MirrorConfig::in_memory(),
            cursor: CursorConfig {
                flush_interval: "50ms".to_string(),
            },
            handling: HandlingConfig {
                drain_timeout: "2s".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Load configuration from an optional file plus the environment.
    ///
    /// A `.env` file in the working directory is honoured if present.
    /// Environment variables win over the file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config: SyncConfig = builder
            .add_source(
                config::Environment::with_prefix("FIREHOSE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SyncError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let endpoint = self.feed.endpoint.trim();
        ensure(
            endpoint.starts_with("ws://") || endpoint.starts_with("wss://"),
            format!("feed.endpoint must be a ws:// or wss:// URL, got '{}'", self.feed.endpoint),
        )?;
        ensure(!self.feed.feed_id.is_empty(), "feed.feed_id must not be empty")?;
        ensure(self.feed.queue_capacity > 0, "feed.queue_capacity must be > 0")?;
        ensure(self.reconnect.max_attempts > 0, "reconnect.max_attempts must be > 0")?;

        let durations = [
            ("reconnect.base_delay", &self.reconnect.base_delay),
            ("reconnect.max_delay", &self.reconnect.max_delay),
            ("reconnect.connect_timeout", &self.reconnect.connect_timeout),
            ("cursor.flush_interval", &self.cursor.flush_interval),
            ("handling.drain_timeout", &self.handling.drain_timeout),
        ];
        for (key, value) in durations {
            ensure(
                humantime::parse_duration(value).is_ok(),
                format!("{key} is not a duration: '{value}'"),
            )?;
        }

        let [a, b, c] = self.collections.names();
        ensure(!a.is_empty() && !b.is_empty() && !c.is_empty(), "collection names must not be empty")?;
        ensure(a != b && b != c && a != c, "collection names must be distinct")
    }
}

fn ensure(ok: bool, message: impl Into<String>) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(SyncError::Config(message.into()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Feed connection
// ═══════════════════════════════════════════════════════════════════════════════

/// Where to subscribe and how to treat the resume position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Jetstream subscribe endpoint (`ws://` or `wss://`).
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Key for this feed's row in the cursor table.
    #[serde(default = "default_feed_id")]
    pub feed_id: String,

    /// Bound on envelopes waiting for the worker.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Whether an envelope stamped exactly at the resume cursor is replayed.
    #[serde(default)]
    pub resume_boundary: ResumeBoundary,

    /// Overrides the persisted cursor when set (microseconds since epoch).
    #[serde(default)]
    pub start_cursor: Option<i64>,
}

fn default_endpoint() -> String {
    "wss://jetstream2.us-east.bsky.network/subscribe".to_string()
}

fn default_feed_id() -> String {
    "jetstream".to_string()
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            feed_id: default_feed_id(),
            queue_capacity: default_queue_capacity(),
            resume_boundary: ResumeBoundary::default(),
            start_cursor: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Collections
// ═══════════════════════════════════════════════════════════════════════════════

/// NSIDs of the three mirrored record collections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    #[serde(default = "default_community_collection")]
    pub community: String,

    #[serde(default = "default_post_collection")]
    pub post: String,

    #[serde(default = "default_vote_collection")]
    pub vote: String,
}

fn default_community_collection() -> String {
    "app.commons.community".to_string()
}

fn default_post_collection() -> String {
    "app.commons.post".to_string()
}

fn default_vote_collection() -> String {
    "app.commons.vote".to_string()
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            community: default_community_collection(),
            post: default_post_collection(),
            vote: default_vote_collection(),
        }
    }
}

impl CollectionConfig {
    /// The subscription filter, in a stable order.
    pub fn names(&self) -> [&str; 3] {
        [&self.community, &self.post, &self.vote]
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Reconnect
// ═══════════════════════════════════════════════════════════════════════════════

/// Backoff schedule for the feed connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Consecutive failures before the process gives up and exits non-zero.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Delay before the first retry (humantime, e.g. "1s").
    #[serde(default = "default_base_delay")]
    pub base_delay: String,

    /// Ceiling for the doubled delay (humantime).
    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    /// Timeout for a single connect attempt (humantime).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,
}

fn default_max_attempts() -> usize {
    10
}

fn default_base_delay() -> String {
    "1s".to_string()
}

fn default_max_delay() -> String {
    "60s".to_string()
}

fn default_connect_timeout() -> String {
    "10s".to_string()
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl ReconnectConfig {
    /// Build the backoff schedule. Unparseable durations fall back to defaults.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: parse_or(&self.base_delay, Duration::from_secs(1)),
            max_delay: parse_or(&self.max_delay, Duration::from_secs(60)),
            backoff_factor: 2.0,
            connection_timeout: parse_or(&self.connect_timeout, Duration::from_secs(10)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Mirror and cursor
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite mirror location. The cursor table lives in the same database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Path to the SQLite database, or `:memory:`.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_sqlite_path() -> String {
    "firehose_mirror.db".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            wal_mode: true,
        }
    }
}

impl MirrorConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

/// Cursor checkpointing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    /// How often dirty cursors are written to SQLite (humantime).
    #[serde(default = "default_flush_interval")]
    pub flush_interval: String,
}

fn default_flush_interval() -> String {
    "5s".to_string()
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            flush_interval: default_flush_interval(),
        }
    }
}

impl CursorConfig {
    pub fn flush_interval_duration(&self) -> Duration {
        parse_or(&self.flush_interval, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handling
// ═══════════════════════════════════════════════════════════════════════════════

/// What the worker does when a mirror write fails for one envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteFailurePolicy {
    /// Log the failure and advance the cursor past the envelope.
    ///
    /// The record is lost from the mirror, but the stream never stalls.
    #[default]
    Skip,

    /// Log the failure, leave the cursor behind the envelope and stop the
    /// engine. The process exits non-zero and replays from the cursor.
    Halt,
}

impl std::fmt::Display for WriteFailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteFailurePolicy::Skip => write!(f, "skip"),
            WriteFailurePolicy::Halt => write!(f, "halt"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlingConfig {
    #[serde(default)]
    pub on_write_failure: WriteFailurePolicy,

    /// How long shutdown waits for queued envelopes to drain (humantime).
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
}

fn default_drain_timeout() -> String {
    "10s".to_string()
}

impl Default for HandlingConfig {
    fn default() -> Self {
        Self {
            on_write_failure: WriteFailurePolicy::default(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl HandlingConfig {
    pub fn drain_timeout_duration(&self) -> Duration {
        parse_or(&self.drain_timeout, Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Logging
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `firehose_mirror=debug,sqlx=warn`.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
