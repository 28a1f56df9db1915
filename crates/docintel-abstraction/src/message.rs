//! Chat REST resources exchanged with the backend.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Header carrying the correlation id on the ask request and the stream subscription.
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

/// Client-generated token binding an event stream to the ask that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A citation pointing into a source document chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// The citation marker (e.g. "[1]").
    pub citation_id: String,
    /// Chunk the citation refers to.
    pub chunk_id: String,
    /// Source document id.
    pub document_id: String,
    /// Source document display name.
    pub document_name: String,
    /// Page in the source document, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<i64>,
    /// Region of the page the snippet came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<Map<String, Value>>,
    /// Snippet of the cited text.
    pub text_snippet: String,
    /// Relevance score assigned by retrieval.
    #[serde(default)]
    pub relevance_score: f64,
    /// False for retrieved chunks that the answer did not cite.
    #[serde(default = "default_true")]
    pub is_cited: bool,
}

const fn default_true() -> bool {
    true
}

/// A chat message as returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    /// Message id.
    pub message_id: String,
    /// Owning session.
    pub session_id: String,
    /// "user" or "assistant".
    pub role: String,
    /// Message text.
    pub content: String,
    /// ISO-8601 creation time as sent by the backend.
    #[serde(default)]
    pub created_at: String,
    /// Citations and additional sources.
    #[serde(default)]
    pub citations: Vec<Citation>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl MessageResponse {
    /// Returns true for assistant messages.
    #[must_use]
    pub fn is_assistant(&self) -> bool {
        self.role == "assistant"
    }

    /// Returns true for user messages.
    #[must_use]
    pub fn is_user(&self) -> bool {
        self.role == "user"
    }
}

/// The message history of one chat session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatHistory {
    /// Session id.
    pub session_id: String,
    /// Session title.
    #[serde(default)]
    pub title: String,
    /// Messages in creation order.
    #[serde(default)]
    pub messages: Vec<MessageResponse>,
    /// Session metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ChatHistory {
    /// Locates the answer to `question`.
    ///
    /// Finds the newest user message whose text equals `question` (ignoring
    /// surrounding whitespace) and returns the first assistant message that
    /// follows it. There is no status field; the match is the only signal.
    #[must_use]
    pub fn find_answer(&self, question: &str) -> Option<&MessageResponse> {
        let question = question.trim();
        let asked_at = self
            .messages
            .iter()
            .rposition(|message| message.is_user() && message.content.trim() == question)?;
        self.messages[asked_at + 1..].iter().find(|message| message.is_assistant())
    }
}

/// Body of `POST /sessions/{id}/messages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    /// The question text.
    pub content: String,
    /// Correlation id, also sent as the `X-Correlation-ID` header.
    pub correlation_id: CorrelationId,
    /// Ask the backend to publish stage updates.
    pub stream_processing: bool,
    /// Let the backend use previous messages as context.
    pub include_history: bool,
    /// Force retrieval on or off; `None` lets the backend decide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_retrieval: Option<bool>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl SendMessageRequest {
    /// Creates a streaming request for `content`.
    pub fn new(content: impl Into<String>, correlation_id: CorrelationId) -> Self {
        Self {
            content: content.into(),
            correlation_id,
            stream_processing: true,
            include_history: true,
            use_retrieval: None,
            metadata: None,
        }
    }
}

/// The terminal artifact of an ask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    /// Id of the assistant message.
    pub message_id: String,
    /// Answer text.
    pub content: String,
    /// Citations backing the answer.
    pub citations: Vec<Citation>,
    /// Sub-queries the backend used.
    pub sub_queries: Vec<String>,
}

impl Answer {
    /// Builds an answer from the assistant message and the reconciled sub-queries.
    #[must_use]
    pub fn from_message(message: MessageResponse, sub_queries: Vec<String>) -> Self {
        Self {
            message_id: message.message_id,
            content: message.content,
            citations: message.citations,
            sub_queries,
        }
    }
}
