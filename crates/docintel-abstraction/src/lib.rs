//! Shared types for the DocIntel chat client.
//!
//! This crate defines the processing stage model, the chat REST resources and
//! the `ChatBackend` trait that the progress crate drives.

pub mod message;
pub mod stage;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use message::{
    Answer, CORRELATION_ID_HEADER, ChatHistory, Citation, CorrelationId, MessageResponse,
    SendMessageRequest,
};
pub use stage::{SessionProgress, Stage, StageEvent};

/// Represents an error that can occur when talking to the chat REST API.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientError {
    /// The request could not be sent or the connection failed.
    #[error("Request Error: {0}")]
    Request(String),

    /// The backend answered with a non-success status.
    #[error("Backend returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// The session or message does not exist.
    #[error("Not Found: {0}")]
    NotFound(String),

    /// The response body could not be decoded.
    #[error("Serialization Error: {0}")]
    Serialization(String),

    /// Other unexpected errors.
    #[error("Client Error: {0}")]
    Other(String),
}

impl ClientError {
    /// Returns true if the backend has no record of the requested resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// The chat REST collaborator.
///
/// Implementations must be `Send + Sync` so one backend can serve many
/// concurrent asks.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Sends a question to a session and waits for the assistant message.
    ///
    /// # Arguments
    /// * `session_id` - The chat session
    /// * `request` - Question text and correlation id
    async fn send_message(
        &self,
        session_id: &str,
        request: &SendMessageRequest,
    ) -> Result<MessageResponse, ClientError>;

    /// Fetches the full message history of a session.
    ///
    /// # Arguments
    /// * `session_id` - The chat session
    async fn chat_history(&self, session_id: &str) -> Result<ChatHistory, ClientError>;
}
