// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tracing subscriber setup for the binary.

use crate::config::{LogConfig, LogFormat};
use crate::error::{Result, SyncError};
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = match config.format {
        LogFormat::Json => fmt()
            .with_env_filter(filter)
            .json()
            .with_target(false)
            .try_init(),
        LogFormat::Compact => fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init(),
    };

    installed.map_err(|e| SyncError::Config(format!("failed to install tracing subscriber: {e}")))
}
