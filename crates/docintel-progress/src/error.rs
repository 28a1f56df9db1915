// Error types for progress tracking

use docintel_abstraction::Stage;
use thiserror::Error;

/// Failures reported by a `StreamTransport`.
///
/// These never cross the coordinator boundary; they drive the reconnect
/// and fallback policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("Failed to connect to event stream: {0}")]
    Connect(String),

    /// The backend has no stream for this correlation id.
    #[error("Event stream not found for correlation id {0}")]
    StreamNotFound(String),

    /// The stream endpoint answered with an unexpected status.
    #[error("Event stream returned status {0}")]
    Status(u16),

    /// A frame could not be decoded.
    #[error("Failed to decode stream frame: {0}")]
    Decode(String),

    /// The server closed the stream.
    #[error("Event stream closed by server")]
    Closed,

    /// Reading the response body failed.
    #[error("Event stream read error: {0}")]
    Io(String),
}

impl TransportError {
    /// Returns true for failures that reconnecting cannot fix.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(self, Self::StreamNotFound(_))
    }
}

/// Rejection raised by the progress reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// An event arrived after the progress reached a terminal stage.
    #[error("Progress already terminal at stage '{stage}'; got event for '{incoming}'")]
    AlreadyTerminal {
        /// The terminal stage already reached.
        stage: Stage,
        /// The stage of the rejected event.
        incoming: Stage,
    },
}

/// Errors returned by the request coordinator before an ask starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    /// Another ask is still in flight for the same session.
    #[error("An ask is already in flight for session '{session_id}'")]
    AskInFlight {
        /// The busy session.
        session_id: String,
    },
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the file.
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("Failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error.
    #[error("Invalid configuration: {0}")]
    Validation(String),
}
