//! Progress tracking for DocIntel chat questions.
//!
//! Asking a question is a long-running backend operation. This crate listens
//! to the live stage stream for the ask, folds whatever arrives into a
//! monotonic [`SessionProgress`], recovers from stream drops, and polls the
//! session history when the stream cannot be used at all.

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod poller;
pub mod reconciler;
pub mod transport;

use std::sync::Arc;

pub use backend::HttpChatBackend;
pub use config::{ClientConfig, ConfigLoader, ProgressConfig};
pub use coordinator::{
    AskHandle, AskOutcome, AskState, AskUpdate, FnSink, ProgressSink, RequestCoordinator,
};
pub use docintel_abstraction::{
    Answer, ChatBackend, ClientError, CorrelationId, SessionProgress, Stage, StageEvent,
};
pub use error::{ConfigError, CoordinatorError, ReconcileError, TransportError};
pub use poller::{FallbackPoller, PollEvent, PollerHandle};
pub use reconciler::{ProgressReconciler, reconcile};
pub use transport::{RawEvent, SseTransport, StreamTransport, TransportEvent, TransportHandle};

/// Builds a coordinator that talks HTTP to the backend described by `config`.
///
/// # Errors
/// Returns `ClientError::Request` if the HTTP client cannot be built.
pub fn http_coordinator(config: &ClientConfig) -> Result<RequestCoordinator, ClientError> {
    let backend = HttpChatBackend::from_config(config)?;
    let transport = SseTransport::from_config(config)?;
    Ok(RequestCoordinator::new(Arc::new(backend), Arc::new(transport), config.progress.clone()))
}
