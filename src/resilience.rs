// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: reconnect backoff and SQLite busy retries.
//!
//! - [`RetryConfig`]: exponential backoff schedule for the feed connection
//! - [`execute_with_retry`]: retries SQLite operations that hit
//!   `SQLITE_BUSY`/`SQLITE_LOCKED`

use std::time::Duration;
use tracing::{debug, warn};

/// Reconnect behaviour for the feed connection.
///
/// The delay before retry `n` (1-indexed) is
/// `initial_delay * backoff_factor^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Consecutive failures tolerated before the client gives up.
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual connection attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_millis(500),
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    ///
    /// ```text
    /// Attempt  Delay (1s base, factor 2, 60s cap)
    /// -------  -----
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// ...
    /// 7+       60s
    /// ```
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }
}

// =============================================================================
// SQLite busy retry
// =============================================================================

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
pub fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6. sqlx reports extended codes
            // (e.g. 517 SQLITE_BUSY_SNAPSHOT); the low byte is the primary code.
            if let Some(code) = db_err.code().and_then(|c| c.parse::<i32>().ok()) {
                if matches!(code & 0xff, 5 | 6) {
                    return true;
                }
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
pub async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_sqlite_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}
