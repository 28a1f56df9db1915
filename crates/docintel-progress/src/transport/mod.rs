//! Live event connections bound to one correlation id.
//!
//! A [`StreamTransport`] opens one connection per call and hands back a
//! [`TransportHandle`]. The handle delivers decoded frames and failures in
//! arrival order and owns the reader task. The transport never retries on
//! its own; reconnecting is the caller's decision.

pub mod sse;

use crate::error::TransportError;
use async_trait::async_trait;
use docintel_abstraction::{CorrelationId, MessageResponse, StageEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub use sse::{SseDecoder, SseFrame, SseTransport, decode_frame};

/// Capacity of the per-connection event channel.
pub const EVENT_BUFFER: usize = 64;

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    /// A stage notification.
    Update(StageEvent),
    /// An incremental fragment of answer text.
    Token(String),
    /// Terminal marker, optionally carrying the assistant message.
    Complete(Option<MessageResponse>),
}

/// What a handle yields.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A decoded frame.
    Event(RawEvent),
    /// The connection failed to open, dropped, or delivered garbage.
    Error(TransportError),
}

/// Opens live event connections.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Opens a connection for `correlation_id` in `session_id`.
    ///
    /// Resolves once the connection attempt has been made. A failed attempt
    /// is delivered as the first event of the returned handle.
    async fn open(&self, session_id: &str, correlation_id: &CorrelationId) -> TransportHandle;
}

/// One open connection. Releasing it is idempotent and also happens on drop.
#[derive(Debug)]
pub struct TransportHandle {
    events: mpsc::Receiver<TransportEvent>,
    reader: Option<JoinHandle<()>>,
    closed: bool,
}

impl TransportHandle {
    /// Wraps an event channel and the task feeding it.
    #[must_use]
    pub fn new(events: mpsc::Receiver<TransportEvent>, reader: Option<JoinHandle<()>>) -> Self {
        Self { events, reader, closed: false }
    }

    /// A handle whose only event is `error`.
    #[must_use]
    pub fn failed(error: TransportError) -> Self {
        let (tx, rx) = mpsc::channel(1);
        // Capacity is 1 and the receiver is alive, so this cannot fail.
        let _ = tx.try_send(TransportEvent::Error(error));
        Self::new(rx, None)
    }

    /// Waits for the next event. Returns `None` once closed or exhausted.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        if self.closed {
            return None;
        }
        self.events.recv().await
    }

    /// Releases the connection.
    ///
    /// Returns `true` only for the call that actually released it.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.events.close();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        debug!("Transport connection released");
        true
    }

    /// True once `close` has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.close();
    }
}
