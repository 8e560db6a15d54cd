// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine state types.
//!
//! Defines the state machine for the sync engine lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Connecting
//!    │                              │
//!    │ shutdown()                   │ (tasks spawned)
//!    ↓                              ↓
//! Stopped                       Running
//!    ↑                              │
//!    │                    shutdown()│
//!    │                              ↓
//!    └────────────────── ShuttingDown
//!
//! Connecting / Running ── (fatal error) ──→ Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `SyncEngine::new()`. Nothing is running.
//! - **Connecting**: `start()` called, opening the cursor store and spawning tasks.
//! - **Running**: The stream client is subscribed (or reconnecting) and the
//!   worker is applying envelopes.
//! - **ShuttingDown**: `shutdown()` called. Draining the queue.
//! - **Stopped**: Graceful shutdown complete, cursor persisted.
//! - **Failed**: Reconnects exhausted, or a write failed under the halt policy.

/// State of the sync engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`start()`](super::SyncEngine::start) to begin mirroring.
    Created,

    /// Starting up.
    Connecting,

    /// Running and mirroring.
    Running,

    /// Shutting down gracefully.
    ///
    /// Queued envelopes are being drained and the cursor persisted.
    ShuttingDown,

    /// Stopped.
    Stopped,

    /// Unrecoverable error.
    ///
    /// [`wait_for_exit()`](super::SyncEngine::wait_for_exit) returns the cause.
    Failed,
}

impl EngineState {
    /// True once the engine can no longer process events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Stopped | EngineState::Failed)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Connecting => write!(f, "Connecting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}
