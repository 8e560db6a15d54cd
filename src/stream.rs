// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Firehose subscription client.
//!
//! Holds one long-lived subscription to the feed, decodes each frame into an
//! [`Envelope`] and hands it to a bounded queue. The client owns reconnection:
//!
//! ```text
//! Disconnected ──► Connecting ──► Streaming
//!                      ▲              │ close / error
//!                      │              ▼
//!                      └──────── Reconnecting ──► (ReconnectExhausted)
//!
//! any state ── shutdown ──► Closed
//! ```
//!
//! # Resumption
//!
//! Every connect carries the highest `time_us` handed to the queue so far as
//! the `cursor` query parameter. Events the feed replays from before that
//! point are dropped according to the configured [`ResumeBoundary`].
//!
//! # Backpressure
//!
//! The queue is bounded. When the worker falls behind, `send` blocks and the
//! client stops reading from the socket until there is room again.

use crate::cursor::ResumeBoundary;
use crate::envelope::{parse_frame, Envelope};
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::resilience::RetryConfig;
use futures::future::BoxFuture;
use futures::{ready, Stream, StreamExt};
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn, Instrument};

/// One open feed session: text frames as read off the wire, plus a clean
/// close handshake.
pub trait FeedConnection: Stream<Item = Result<String>> + Send + Unpin {
    /// Tell the feed we are leaving.
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

pub type FrameStream = Box<dyn FeedConnection>;

/// Opens a feed session for a subscribe URL.
///
/// The WebSocket implementation is used in production; tests substitute a
/// scripted transport.
pub trait Transport: Send + Sync + 'static {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<FrameStream>>;
}

/// Transport over a real WebSocket connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl Transport for WebSocketTransport {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<FrameStream>> {
        Box::pin(async move {
            let (socket, response) = tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| SyncError::transport(url, e.to_string()))?;
            debug!(status = %response.status(), "WebSocket handshake complete");

            Ok(Box::new(WebSocketConnection {
                socket,
                endpoint: url.to_string(),
            }) as FrameStream)
        })
    }
}

struct WebSocketConnection {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    endpoint: String,
}

impl Stream for WebSocketConnection {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let message = match ready!(self.socket.poll_next_unpin(cx)) {
                Some(message) => message,
                None => return Poll::Ready(None),
            };
            let frame = match message {
                Ok(Message::Text(text)) => Ok(text.as_str().to_owned()),
                Ok(Message::Binary(bytes)) => String::from_utf8(bytes.to_vec())
                    .map_err(|e| SyncError::EnvelopeParse(format!("binary frame: {e}"))),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Feed sent close frame");
                    continue;
                }
                // Ping/pong are answered by tungstenite.
                Ok(_) => continue,
                Err(e) => Err(SyncError::transport(&self.endpoint, e.to_string())),
            };
            return Poll::Ready(Some(frame));
        }
    }
}

impl FeedConnection for WebSocketConnection {
    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.socket
                .close(None)
                .await
                .map_err(|e| SyncError::transport(&self.endpoint, e.to_string()))
        })
    }
}

/// Connection state of a [`StreamClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
    /// Terminal, after shutdown.
    Closed,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Streaming => write!(f, "Streaming"),
            Self::Reconnecting => write!(f, "Reconnecting"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Settings for one [`StreamClient`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Base subscribe endpoint (`ws://` or `wss://`).
    pub endpoint: String,
    /// Collections requested from the feed and accepted locally.
    pub collections: Vec<String>,
    pub retry: RetryConfig,
    pub boundary: ResumeBoundary,
}

/// Build the subscribe URL for `endpoint`.
///
/// `wantedCollections` is repeated once per collection; `cursor` is only
/// present when resuming.
pub fn subscribe_url(endpoint: &str, collections: &[String], cursor: Option<i64>) -> String {
    let mut url = endpoint.to_string();
    let mut sep = if url.contains('?') { '&' } else { '?' };
    for collection in collections {
        url.push(sep);
        url.push_str("wantedCollections=");
        url.push_str(collection);
        sep = '&';
    }
    if let Some(cursor) = cursor {
        url.push(sep);
        url.push_str("cursor=");
        url.push_str(&cursor.to_string());
    }
    url
}

/// How a streaming session ended.
enum SessionEnd {
    Shutdown,
    Closed,
    Failed(SyncError),
}

/// Resolves once shutdown has been signalled (or the sender is gone).
async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Subscription client for the firehose.
pub struct StreamClient<T: Transport> {
    transport: Arc<T>,
    settings: ClientSettings,
    filter: HashSet<String>,
    state_tx: watch::Sender<ClientState>,
    shutdown_rx: watch::Receiver<bool>,
    /// Highest `time_us` handed to the queue.
    cursor: Option<i64>,
}

impl<T: Transport> StreamClient<T> {
    pub fn new(
        transport: Arc<T>,
        settings: ClientSettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let filter = settings.collections.iter().cloned().collect();
        let (state_tx, _) = watch::channel(ClientState::Disconnected);
        Self {
            transport,
            settings,
            filter,
            state_tx,
            shutdown_rx,
            cursor: None,
        }
    }

    pub fn state(&self) -> ClientState {
        *self.state_tx.borrow()
    }

    /// Subscribe to state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ClientState> {
        self.state_tx.subscribe()
    }

    pub fn cursor(&self) -> Option<i64> {
        self.cursor
    }

    /// URL the next connect will use.
    pub fn subscribe_url(&self) -> String {
        subscribe_url(&self.settings.endpoint, &self.settings.collections, self.cursor)
    }

    fn set_state(&self, state: ClientState) {
        self.state_tx.send_replace(state);
        metrics::set_client_state(&state.to_string());
    }

    /// Stream envelopes into `sink` until shutdown.
    ///
    /// Returns the last enqueued `time_us` on shutdown, or
    /// [`SyncError::ReconnectExhausted`] once `max_attempts` consecutive
    /// connects or sessions have failed. A session that delivers at least
    /// one frame resets the attempt count.
    pub async fn run(self, resume: Option<i64>, sink: mpsc::Sender<Envelope>) -> Result<Option<i64>> {
        let span = tracing::info_span!("stream_client", endpoint = %self.settings.endpoint);
        self.run_inner(resume, sink).instrument(span).await
    }

    async fn run_inner(mut self, resume: Option<i64>, sink: mpsc::Sender<Envelope>) -> Result<Option<i64>> {
        self.cursor = resume;
        let mut attempt: usize = 0;

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            self.set_state(ClientState::Connecting);
            let resume_from = self.cursor;
            let url = self.subscribe_url();
            info!(url = %url, attempt, "Connecting to feed");

            let timeout = self.settings.retry.connection_timeout;
            let connected = tokio::select! {
                biased;

                _ = shutdown_signalled(&mut self.shutdown_rx) => break,

                result = tokio::time::timeout(timeout, self.transport.connect(&url)) => match result {
                    Ok(inner) => inner,
                    Err(_) => Err(SyncError::transport(
                        &self.settings.endpoint,
                        format!("connect timed out after {timeout:?}"),
                    )),
                },
            };

            let last_error = match connected {
                Ok(frames) => {
                    metrics::record_connection(true);
                    self.set_state(ClientState::Streaming);
                    info!(cursor = ?resume_from, "Streaming from feed");

                    let (end, received) = self.pump(frames, resume_from, &sink).await?;
                    // Only a session that carried traffic counts as recovered.
                    if received > 0 {
                        attempt = 0;
                    }
                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Closed => {
                            warn!(cursor = ?self.cursor, received, "Feed closed the connection");
                            "connection closed by feed".to_string()
                        }
                        SessionEnd::Failed(e) => {
                            warn!(error = %e, cursor = ?self.cursor, received, "Feed connection failed");
                            e.to_string()
                        }
                    }
                }
                Err(e) => {
                    metrics::record_connection(false);
                    warn!(error = %e, attempt, "Connect to feed failed");
                    e.to_string()
                }
            };
            self.set_state(ClientState::Disconnected);

            attempt += 1;
            if attempt >= self.settings.retry.max_attempts {
                error!(attempts = attempt, last_error = %last_error, "Reconnect budget exhausted");
                return Err(SyncError::ReconnectExhausted {
                    attempts: attempt,
                    last_error,
                });
            }

            let delay = self.settings.retry.delay_for_attempt(attempt);
            self.set_state(ClientState::Reconnecting);
            metrics::record_reconnect(attempt, delay);
            info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");

            tokio::select! {
                biased;
                _ = shutdown_signalled(&mut self.shutdown_rx) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ClientState::Closed);
        info!(cursor = ?self.cursor, "Stream client closed");
        Ok(self.cursor)
    }

    /// Read one session's frames until it ends.
    ///
    /// Also returns how many frames the session delivered.
    async fn pump(
        &mut self,
        mut frames: FrameStream,
        resume_from: Option<i64>,
        sink: &mpsc::Sender<Envelope>,
    ) -> Result<(SessionEnd, u64)> {
        let mut received = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut self.shutdown_rx) => {
                    self.close_session(&mut frames).await;
                    return Ok((SessionEnd::Shutdown, received));
                }
                next = frames.next() => next,
            };

            match next {
                None => return Ok((SessionEnd::Closed, received)),
                Some(Err(SyncError::EnvelopeParse(msg))) => {
                    received += 1;
                    warn!(error = %msg, "Dropping undecodable frame");
                    metrics::record_envelope_dropped("malformed");
                }
                Some(Err(e)) => return Ok((SessionEnd::Failed(e), received)),
                Some(Ok(text)) => {
                    received += 1;
                    if let Err(e) = self.on_frame(&text, resume_from, sink).await {
                        self.close_session(&mut frames).await;
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Close handshake, bounded by the connect timeout.
    async fn close_session(&self, frames: &mut FrameStream) {
        let timeout = self.settings.retry.connection_timeout;
        match tokio::time::timeout(timeout, frames.close()).await {
            Ok(Ok(())) => debug!("Feed connection closed"),
            Ok(Err(e)) => debug!(error = %e, "Feed close handshake failed"),
            Err(_) => debug!(?timeout, "Feed close handshake timed out"),
        }
    }

    async fn on_frame(
        &mut self,
        text: &str,
        resume_from: Option<i64>,
        sink: &mpsc::Sender<Envelope>,
    ) -> Result<()> {
        metrics::record_frame_received();

        let envelope = match parse_frame(text) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                trace!("Skipping non-commit frame");
                metrics::record_envelope_dropped("non_commit");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, frame_len = text.len(), "Dropping malformed frame");
                metrics::record_envelope_dropped("malformed");
                return Ok(());
            }
        };

        if !self.filter.contains(&envelope.collection) {
            trace!(collection = %envelope.collection, "Dropping unrequested collection");
            metrics::record_envelope_dropped("filtered");
            return Ok(());
        }

        if !self.settings.boundary.admits(envelope.time_us, resume_from) {
            debug!(
                time_us = envelope.time_us,
                cursor = ?resume_from,
                "Dropping replayed event before resume cursor"
            );
            metrics::record_envelope_dropped("before_cursor");
            return Ok(());
        }

        let time_us = envelope.time_us;
        let collection = envelope.collection.clone();
        // Blocks while the queue is full.
        sink.send(envelope).await.map_err(|_| SyncError::Shutdown)?;
        metrics::record_envelope_enqueued(&collection);
        metrics::set_queue_depth(sink.max_capacity() - sink.capacity());

        self.cursor = Some(self.cursor.map_or(time_us, |c| c.max(time_us)));
        Ok(())
    }
}
