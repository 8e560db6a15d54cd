// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The single mirror writer.
//!
//! Every envelope, whatever its collection, passes through one worker that
//! handles it to completion before taking the next. This is what keeps
//! counter updates for related records (a post and its votes, a reply and
//! its parent) in arrival order.
//!
//! # Cursor
//!
//! The cursor only moves after an envelope is finished: applied, a no-op,
//! skipped with a log line, or failed under [`WriteFailurePolicy::Skip`].
//! Under [`WriteFailurePolicy::Halt`] a failed envelope leaves the cursor
//! where it was and the worker stops, so a restart replays it.

use crate::config::WriteFailurePolicy;
use crate::cursor::CursorStore;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::handlers::{HandleOutcome, Router};
use crate::metrics;
use crate::mirror::Mirror;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Instrument};

/// Attempts per envelope when SQLite reports busy/locked.
const BUSY_RETRY_ATTEMPTS: u32 = 3;
const BUSY_RETRY_BASE_DELAY_MS: u64 = 20;

pub(super) struct Worker {
    pub mirror: Arc<Mirror>,
    pub router: Router,
    pub cursor: Arc<CursorStore>,
    pub feed_id: String,
    pub policy: WriteFailurePolicy,
}

impl Worker {
    /// Drain `queue` until every sender is gone.
    ///
    /// Returns early with the write error under the halt policy.
    pub async fn run(self, queue: &mut mpsc::Receiver<Envelope>) -> Result<()> {
        let span = tracing::info_span!("worker", feed_id = %self.feed_id);
        async move {
            info!(policy = %self.policy, "Starting mirror worker");
            let mut processed: u64 = 0;

            while let Some(envelope) = queue.recv().await {
                metrics::set_queue_depth(queue.len());
                self.process(&envelope).await?;
                processed += 1;
            }

            info!(processed, "Mirror worker drained");
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn process(&self, envelope: &Envelope) -> Result<()> {
        let kind = self
            .router
            .handler_for(&envelope.collection)
            .map(|h| h.kind())
            .unwrap_or("unrouted");
        let started = Instant::now();

        match self.dispatch(kind, envelope).await {
            Ok(outcome) => {
                metrics::record_envelope_handled(kind, outcome.as_str(), started.elapsed());
                match outcome {
                    HandleOutcome::Skipped(reason) => debug!(
                        kind,
                        op = %envelope.operation,
                        uri = %envelope.record_uri(),
                        reason = reason.as_str(),
                        "Envelope skipped"
                    ),
                    _ => debug!(
                        kind,
                        op = %envelope.operation,
                        uri = %envelope.record_uri(),
                        outcome = outcome.as_str(),
                        "Envelope handled"
                    ),
                }
            }
            Err(e) => {
                metrics::record_handler_error(kind, &self.policy.to_string());
                match self.policy {
                    WriteFailurePolicy::Skip => {
                        error!(
                            kind,
                            op = %envelope.operation,
                            uri = %envelope.record_uri(),
                            time_us = envelope.time_us,
                            error = %e,
                            "Mirror write failed, skipping event"
                        );
                    }
                    WriteFailurePolicy::Halt => {
                        error!(
                            kind,
                            op = %envelope.operation,
                            uri = %envelope.record_uri(),
                            time_us = envelope.time_us,
                            error = %e,
                            "Mirror write failed, halting"
                        );
                        return Err(e);
                    }
                }
            }
        }

        self.cursor.set(&self.feed_id, envelope.time_us).await;
        Ok(())
    }

    /// Run the handler, retrying while SQLite is busy.
    ///
    /// Each handler runs in its own transaction, so a retried attempt starts
    /// from a clean slate.
    async fn dispatch(&self, kind: &str, envelope: &Envelope) -> Result<HandleOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.router.dispatch(&self.mirror, envelope).await {
                Err(e) if e.is_retryable() && attempt < BUSY_RETRY_ATTEMPTS => {
                    let delay = Duration::from_millis(BUSY_RETRY_BASE_DELAY_MS * u64::from(attempt));
                    warn!(kind, attempt, error = %e, "Mirror busy, retrying envelope");
                    metrics::record_sqlite_retry(kind);
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}
