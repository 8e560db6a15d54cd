// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine coordinator.
//!
//! The main orchestrator that ties together:
//! - The feed subscription via [`crate::stream::StreamClient`]
//! - The single mirror writer ([`worker`])
//! - Cursor persistence via [`crate::cursor::CursorStore`]
//!
//! # Architecture
//!
//! The coordinator manages the full sync lifecycle:
//! 1. Loads the resume cursor (config override, else the stored position)
//! 2. Spawns the stream client, which feeds a bounded queue
//! 3. Spawns one worker that drains the queue through the handler router
//! 4. Spawns a task that flushes the debounced cursor on an interval
//! 5. Handles graceful shutdown: drain the queue, persist the cursor
//!
//! Fatal conditions (reconnects exhausted, a write failure under the halt
//! policy) surface through [`SyncEngine::wait_for_exit`].

mod types;
mod worker;

pub use types::EngineState;

use crate::config::SyncConfig;
use crate::cursor::CursorStore;
use crate::envelope::Envelope;
use crate::error::{Result, SyncError};
use crate::handlers::Router;
use crate::metrics;
use crate::mirror::Mirror;
use crate::stream::{ClientSettings, ClientState, StreamClient, Transport, WebSocketTransport};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use worker::Worker;

/// The firehose sync engine.
///
/// Mirrors community, post and vote records from one feed into a [`Mirror`].
///
/// ```rust,ignore
/// let mirror = Arc::new(Mirror::open_with(&config.mirror).await?);
/// let mut engine = SyncEngine::new(config, mirror, Arc::new(WebSocketTransport));
/// engine.start().await?;
///
/// tokio::select! {
///     result = engine.wait_for_exit() => result?,
///     _ = tokio::signal::ctrl_c() => {}
/// }
/// let cursor = engine.shutdown().await;
/// ```
pub struct SyncEngine<T: Transport = WebSocketTransport> {
    config: SyncConfig,

    mirror: Arc<Mirror>,

    transport: Arc<T>,

    router: Router,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,

    state_rx: watch::Receiver<EngineState>,

    shutdown_tx: watch::Sender<bool>,

    shutdown_rx: watch::Receiver<bool>,

    /// Set by `start()`
    cursor_store: Option<Arc<CursorStore>>,

    client_state: Option<watch::Receiver<ClientState>>,

    /// Fatal errors from the client and worker tasks. Closes once both exit.
    fatal_rx: Option<mpsc::Receiver<SyncError>>,

    client_handle: Option<JoinHandle<Option<i64>>>,
    worker_handle: Option<JoinHandle<()>>,
    flush_handle: Option<JoinHandle<()>>,

    /// Cursor captured at shutdown
    final_cursor: Option<i64>,
}

impl<T: Transport> SyncEngine<T> {
    /// Create a new engine in the `Created` state.
    ///
    /// Call [`start()`](Self::start) to subscribe and begin mirroring.
    pub fn new(config: SyncConfig, mirror: Arc<Mirror>, transport: Arc<T>) -> Self {
        let router = Router::from_collections(&config.collections);
        Self::with_router(config, mirror, transport, router)
    }

    /// Create an engine with a custom collection router.
    pub fn with_router(
        config: SyncConfig,
        mirror: Arc<Mirror>,
        transport: Arc<T>,
        router: Router,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            mirror,
            transport,
            router,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            cursor_store: None,
            client_state: None,
            fatal_rx: None,
            client_handle: None,
            worker_handle: None,
            flush_handle: None,
            final_cursor: None,
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Stream client state, once started.
    pub fn client_state(&self) -> Option<ClientState> {
        self.client_state.as_ref().map(|rx| *rx.borrow())
    }

    pub fn mirror(&self) -> &Arc<Mirror> {
        &self.mirror
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Time of the last fully handled event for this feed.
    pub async fn cursor(&self) -> Option<i64> {
        match &self.cursor_store {
            Some(store) => store.get(&self.config.feed.feed_id).await,
            None => self.final_cursor,
        }
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Start the engine.
    ///
    /// 1. Opens the cursor table on the mirror's database
    /// 2. Resolves the resume cursor
    /// 3. Spawns the stream client, worker and cursor flush tasks
    ///
    /// Returns once the tasks are spawned; connecting happens in the
    /// background.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(SyncError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        let feed_id = self.config.feed.feed_id.clone();
        info!(
            feed_id = %feed_id,
            endpoint = %self.config.feed.endpoint,
            mirror = %self.mirror.path(),
            "Starting sync engine"
        );
        self.set_state(EngineState::Connecting);

        let cursor_store = match CursorStore::new(self.mirror.pool().clone()).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, "Failed to open cursor store");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };

        let stored = cursor_store.get(&feed_id).await;
        let resume = match (self.config.feed.start_cursor, stored) {
            (Some(start), _) => {
                info!(start_cursor = start, stored = ?stored, "Using configured start cursor");
                Some(start)
            }
            (None, Some(stored)) => {
                info!(cursor = stored, "Resuming from stored cursor");
                Some(stored)
            }
            (None, None) => {
                info!("No stored cursor, starting from live tail");
                None
            }
        };

        let (queue_tx, queue_rx) = mpsc::channel(self.config.feed.queue_capacity.max(1));
        let (fatal_tx, fatal_rx) = mpsc::channel(2);

        let client = StreamClient::new(
            Arc::clone(&self.transport),
            ClientSettings {
                endpoint: self.config.feed.endpoint.clone(),
                collections: self
                    .config
                    .collections
                    .names()
                    .iter()
                    .map(|c| c.to_string())
                    .collect(),
                retry: self.config.reconnect.retry_config(),
                boundary: self.config.feed.resume_boundary,
            },
            self.shutdown_rx.clone(),
        );
        self.client_state = Some(client.state_receiver());
        self.client_handle = Some(spawn_client(client, resume, queue_tx, fatal_tx.clone()));

        let worker = Worker {
            mirror: Arc::clone(&self.mirror),
            router: self.router.clone(),
            cursor: Arc::clone(&cursor_store),
            feed_id,
            policy: self.config.handling.on_write_failure,
        };
        self.worker_handle = Some(spawn_worker(worker, queue_rx, fatal_tx));

        self.flush_handle = Some(spawn_cursor_flush_task(
            Arc::clone(&cursor_store),
            self.config.cursor.flush_interval_duration(),
            self.shutdown_rx.clone(),
        ));

        self.cursor_store = Some(cursor_store);
        self.fatal_rx = Some(fatal_rx);

        self.set_state(EngineState::Running);
        info!(cursor = ?resume, "Sync engine running");
        Ok(())
    }

    /// Wait until the engine stops on its own.
    ///
    /// Returns the first fatal error, or `Ok(())` once both tasks have
    /// exited cleanly (which only happens after [`shutdown()`](Self::shutdown)).
    pub async fn wait_for_exit(&mut self) -> Result<()> {
        let Some(fatal_rx) = self.fatal_rx.as_mut() else {
            return Err(SyncError::InvalidState {
                expected: "Running".to_string(),
                actual: self.state().to_string(),
            });
        };

        match fatal_rx.recv().await {
            Some(e) => {
                error!(error = %e, "Sync engine failed");
                self.set_state(EngineState::Failed);
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Shut the engine down gracefully and return the last cursor.
    ///
    /// Shutdown sequence:
    /// 1. Signal the stream client to close
    /// 2. Let the worker drain the queue (bounded by `drain_timeout`)
    /// 3. Flush and checkpoint the cursor store
    ///
    /// Events still queued when the drain timeout fires are abandoned and
    /// the cursor stays at the last finished event. Calling this more than
    /// once is harmless.
    pub async fn shutdown(&mut self) -> Option<i64> {
        let state = self.state();
        if state == EngineState::Stopped {
            return self.final_cursor;
        }
        if state == EngineState::Created {
            self.set_state(EngineState::Stopped);
            return None;
        }

        info!("Shutting down sync engine");
        if state != EngineState::Failed {
            self.set_state(EngineState::ShuttingDown);
        }
        let _ = self.shutdown_tx.send(true);

        let drain_timeout = self.config.handling.drain_timeout_duration();

        if let Some(mut handle) = self.client_handle.take() {
            match tokio::time::timeout(drain_timeout, &mut handle).await {
                Ok(Ok(cursor)) => debug!(cursor = ?cursor, "Stream client stopped"),
                Ok(Err(e)) => warn!(error = %e, "Stream client panicked during shutdown"),
                Err(_) => {
                    warn!("Stream client did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        if let Some(mut handle) = self.worker_handle.take() {
            match tokio::time::timeout(drain_timeout, &mut handle).await {
                Ok(Ok(())) => debug!("Worker drained"),
                Ok(Err(e)) => warn!(error = %e, "Worker panicked during shutdown"),
                Err(_) => {
                    warn!(
                        timeout = ?drain_timeout,
                        "Worker did not drain in time, abandoning queued events"
                    );
                    handle.abort();
                }
            }
        }

        if let Some(handle) = self.flush_handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Cursor flush task panicked");
            }
        }

        if let Some(store) = self.cursor_store.take() {
            self.final_cursor = store.get(&self.config.feed.feed_id).await;
            store.close().await;
        }

        if self.state() != EngineState::Failed {
            self.set_state(EngineState::Stopped);
        }
        info!(cursor = ?self.final_cursor, "Sync engine stopped");
        self.final_cursor
    }
}

fn spawn_client<T: Transport>(
    client: StreamClient<T>,
    resume: Option<i64>,
    queue: mpsc::Sender<Envelope>,
    fatal_tx: mpsc::Sender<SyncError>,
) -> JoinHandle<Option<i64>> {
    tokio::spawn(async move {
        match client.run(resume, queue).await {
            Ok(cursor) => cursor,
            // The worker went away first; it reports its own error.
            Err(SyncError::Shutdown) => {
                debug!("Queue closed, stream client stopping");
                None
            }
            Err(e) => {
                let _ = fatal_tx.send(e).await;
                None
            }
        }
    })
}

fn spawn_worker(
    worker: Worker,
    mut queue: mpsc::Receiver<Envelope>,
    fatal_tx: mpsc::Sender<SyncError>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = worker.run(&mut queue).await {
            let _ = fatal_tx.send(e).await;
        }
        // Dropping the queue here releases a client blocked on a full queue.
        drop(queue);
    })
}

/// Periodically flushes the debounced cursor.
fn spawn_cursor_flush_task(
    cursor_store: Arc<CursorStore>,
    flush_interval: std::time::Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(flush_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = cursor_store.flush_dirty().await {
                        warn!(error = %e, "Failed to flush cursor");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Cursor flush task stopping");
                        break;
                    }
                }
            }
        }
    })
}
