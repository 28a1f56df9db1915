//! Server-Sent Events transport over `reqwest`.
//!
//! The backend publishes one JSON payload per SSE frame on
//! `GET /sessions/{id}/stream/{correlation_id}`:
//!
//! ```text
//! data: {"type":"processing_update","stage":"retrieving_documents",
//!        "message":"Found 8 chunks","details":{"chunkCount":8}}
//!
//! data: {"type":"keepalive"}
//!
//! ```
//!
//! Keep-alives never leave this module. A payload that fails to decode is a
//! protocol error and ends the connection.

use super::{EVENT_BUFFER, RawEvent, StreamTransport, TransportEvent, TransportHandle};
use crate::config::ClientConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use docintel_abstraction::{
    CORRELATION_ID_HEADER, ClientError, CorrelationId, MessageResponse, Stage, StageEvent,
};
use futures::StreamExt;
use reqwest::{Client, StatusCode, header};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Connect timeout for stream subscriptions. There is no read timeout:
/// the stream lives as long as the ask.
const STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One dispatched SSE frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// The `event:` field, if any.
    pub event: Option<String>,
    /// All `data:` lines joined with `\n`.
    pub data: String,
}

/// Incremental SSE frame splitter.
///
/// Bytes are buffered until a full line is available, so multi-byte
/// characters split across chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    pending: SseFrame,
    has_data: bool,
}

impl SseDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns the frames it completed.
    ///
    /// Frames without any `data:` line (comment-only keep-alives) are not
    /// dispatched.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>, TransportError> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8(line)
                .map_err(|e| TransportError::Decode(format!("invalid UTF-8 in frame: {}", e)))?;

            if line.is_empty() {
                if let Some(frame) = self.take_frame() {
                    frames.push(frame);
                }
            } else {
                self.field(&line);
            }
        }

        Ok(frames)
    }

    /// Flushes a trailing frame that was not terminated by a blank line.
    pub fn finish(&mut self) -> Result<Option<SseFrame>, TransportError> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8(rest)
                .map_err(|e| TransportError::Decode(format!("invalid UTF-8 in frame: {}", e)))?;
            let line = line.trim_end_matches('\r');
            if !line.is_empty() {
                self.field(line);
            }
        }
        Ok(self.take_frame())
    }

    fn field(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match name {
            "data" => {
                if self.has_data {
                    self.pending.data.push('\n');
                }
                self.pending.data.push_str(value);
                self.has_data = true;
            }
            "event" => self.pending.event = Some(value.to_string()),
            _ => trace!(name = %name, "Ignoring SSE field"),
        }
    }

    fn take_frame(&mut self) -> Option<SseFrame> {
        let frame = std::mem::take(&mut self.pending);
        std::mem::take(&mut self.has_data).then_some(frame)
    }
}

/// Stage update as published by the backend.
#[derive(Debug, Deserialize)]
struct WireUpdate {
    stage: Stage,
    #[serde(default)]
    message: String,
    #[serde(default)]
    finished: bool,
    #[serde(default, alias = "details")]
    detail: Map<String, Value>,
    #[serde(default, rename = "subQueries", alias = "sub_queries")]
    sub_queries: Option<Vec<String>>,
}

impl WireUpdate {
    fn into_stage_event(self) -> StageEvent {
        let sub_queries = self.sub_queries.or_else(|| {
            self.detail
                .get("subQueries")
                .and_then(|value| serde_json::from_value::<Vec<String>>(value.clone()).ok())
        });

        // The backend reports pipeline errors as a `complete` update flagged with `error: true`.
        let backend_error = self.stage == Stage::Complete
            && self.detail.get("error").and_then(Value::as_bool).unwrap_or(false);

        let mut event = StageEvent {
            stage: self.stage,
            human_message: self.message,
            finished: self.finished,
            detail: self.detail,
            sub_queries,
        };
        if backend_error {
            event.stage = Stage::Failed;
            event.finished = true;
            event
                .detail
                .insert("error_message".to_string(), Value::String(event.human_message.clone()));
        }
        event
    }
}

/// Decodes one frame.
///
/// Returns `Ok(None)` for keep-alives. The JSON `type` field selects the
/// event kind; without one the SSE `event:` name is used, then `update`.
pub fn decode_frame(frame: &SseFrame) -> Result<Option<RawEvent>, TransportError> {
    let data = frame.data.trim();
    if data.is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(data)
        .map_err(|e| TransportError::Decode(format!("invalid JSON payload: {}", e)))?;
    let Value::Object(object) = value else {
        return Err(TransportError::Decode(format!("expected a JSON object, got: {}", data)));
    };

    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .or(frame.event.as_deref())
        .unwrap_or("update")
        .to_string();

    match kind.as_str() {
        "keepalive" | "ping" => Ok(None),
        "update" | "processing_update" => {
            let update: WireUpdate = serde_json::from_value(Value::Object(object))
                .map_err(|e| TransportError::Decode(format!("invalid update: {}", e)))?;
            Ok(Some(RawEvent::Update(update.into_stage_event())))
        }
        "token" => {
            let token = ["content", "token", "text"]
                .iter()
                .find_map(|key| object.get(*key).and_then(Value::as_str))
                .ok_or_else(|| TransportError::Decode("token frame without text".to_string()))?;
            Ok(Some(RawEvent::Token(token.to_string())))
        }
        "complete" => {
            let answer = match object.get("answer").or_else(|| object.get("message")) {
                Some(value @ Value::Object(_)) => Some(
                    serde_json::from_value::<MessageResponse>(value.clone())
                        .map_err(|e| TransportError::Decode(format!("invalid answer: {}", e)))?,
                ),
                _ => None,
            };
            Ok(Some(RawEvent::Complete(answer)))
        }
        other => Err(TransportError::Decode(format!("unknown event type '{}'", other))),
    }
}

/// SSE implementation of [`StreamTransport`].
#[derive(Debug, Clone)]
pub struct SseTransport {
    /// Chat API root.
    base_url: String,
    /// HTTP client for subscriptions.
    client: Client,
}

impl SseTransport {
    /// Creates a transport for the chat API rooted at `base_url`.
    ///
    /// # Errors
    /// Returns `ClientError::Request` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let client = Client::builder()
            .connect_timeout(STREAM_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ClientError::Request(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(base_url, client))
    }

    /// Creates a transport from client configuration.
    ///
    /// # Errors
    /// Returns `ClientError::Request` if the HTTP client cannot be built.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        Self::new(config.base_url.clone())
    }

    /// Creates a transport with an existing HTTP client.
    #[must_use]
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        Self { base_url: base_url.into(), client }
    }

    fn stream_url(&self, session_id: &str, correlation_id: &CorrelationId) -> String {
        format!(
            "{}/sessions/{}/stream/{}",
            self.base_url.trim_end_matches('/'),
            session_id,
            correlation_id
        )
    }
}

#[async_trait]
impl StreamTransport for SseTransport {
    async fn open(&self, session_id: &str, correlation_id: &CorrelationId) -> TransportHandle {
        let url = self.stream_url(session_id, correlation_id);
        debug!(url = %url, correlation_id = %correlation_id, "Opening event stream");

        let response = match self
            .client
            .get(&url)
            .header(header::ACCEPT, "text/event-stream")
            .header(CORRELATION_ID_HEADER, correlation_id.as_str())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(correlation_id = %correlation_id, error = %e, "Event stream connect failed");
                return TransportHandle::failed(TransportError::Connect(e.to_string()));
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            warn!(correlation_id = %correlation_id, "Backend has no stream for correlation id");
            return TransportHandle::failed(TransportError::StreamNotFound(
                correlation_id.to_string(),
            ));
        }
        if !status.is_success() {
            warn!(correlation_id = %correlation_id, status = %status, "Event stream rejected");
            return TransportHandle::failed(TransportError::Status(status.as_u16()));
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let reader = tokio::spawn(read_events(response, tx));
        TransportHandle::new(rx, Some(reader))
    }
}

/// Pumps the response body through the decoder until it ends or fails.
async fn read_events(response: reqwest::Response, tx: mpsc::Sender<TransportEvent>) {
    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();

    while let Some(chunk) = body.next().await {
        let frames = match chunk {
            Ok(bytes) => decoder.push(&bytes),
            Err(e) => Err(TransportError::Io(e.to_string())),
        };
        let frames = match frames {
            Ok(frames) => frames,
            Err(error) => {
                let _ = tx.send(TransportEvent::Error(error)).await;
                return;
            }
        };
        if !forward(&frames, &tx).await {
            return;
        }
    }

    match decoder.finish() {
        Ok(Some(frame)) => {
            if !forward(std::slice::from_ref(&frame), &tx).await {
                return;
            }
        }
        Ok(None) => {}
        Err(error) => {
            let _ = tx.send(TransportEvent::Error(error)).await;
            return;
        }
    }

    debug!("Event stream ended by server");
    let _ = tx.send(TransportEvent::Error(TransportError::Closed)).await;
}

/// Decodes and forwards frames. Returns false once the connection is done.
async fn forward(frames: &[SseFrame], tx: &mpsc::Sender<TransportEvent>) -> bool {
    for frame in frames {
        match decode_frame(frame) {
            Ok(Some(event)) => {
                if tx.send(TransportEvent::Event(event)).await.is_err() {
                    return false;
                }
            }
            Ok(None) => trace!("Swallowed keep-alive frame"),
            Err(error) => {
                warn!(error = %error, "Dropping connection after undecodable frame");
                let _ = tx.send(TransportEvent::Error(error)).await;
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(input: &[u8]) -> Vec<SseFrame> {
        SseDecoder::new().push(input).unwrap()
    }

    fn decode(data: &str) -> Result<Option<RawEvent>, TransportError> {
        decode_frame(&SseFrame { event: None, data: data.to_string() })
    }

    #[test]
    fn test_decoder_splits_frames() {
        let out = frames(b"data: one\n\ndata: two\n\n");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].data, "one");
        assert_eq!(out[1].data, "two");
    }

    #[test]
    fn test_decoder_handles_crlf_and_multiline_data() {
        let out = frames(b"event: update\r\ndata: {\"a\":\r\ndata: 1}\r\n\r\n");
        let expected =
            SseFrame { event: Some("update".to_string()), data: "{\"a\":\n1}".to_string() };
        assert_eq!(out, vec![expected]);
    }

    #[test]
    fn test_decoder_swallows_comment_frames() {
        assert!(frames(b": keep-alive\n\n").is_empty());
    }

    #[test]
    fn test_decoder_joins_chunks_split_mid_character() {
        let text = "data: {\"message\":\"caf\u{e9}\"}\n\n".as_bytes();
        let split = text.iter().position(|b| *b == 0xc3).unwrap() + 1;
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&text[..split]).unwrap().is_empty());
        let out = decoder.push(&text[split..]).unwrap();
        assert_eq!(out[0].data, "{\"message\":\"caf\u{e9}\"}");
    }

    #[test]
    fn test_decoder_finish_flushes_unterminated_frame() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: tail").unwrap().is_empty());
        assert_eq!(decoder.finish().unwrap().unwrap().data, "tail");
        assert!(decoder.finish().unwrap().is_none());
    }

    #[test]
    fn test_decode_backend_update() {
        let event = decode(concat!(
            r#"{"type":"processing_update","stage":"splitting_query","#,
            r#""message":"Breaking down your question into 2 sub-queries","#,
            r#""details":{"isComplex":true,"subQueries":["revenue Q3","drivers"]}}"#,
        ))
        .unwrap()
        .unwrap();
        let RawEvent::Update(event) = event else { panic!("expected update") };
        assert_eq!(event.stage, Stage::Splitting);
        assert!(!event.finished);
        assert_eq!(event.sub_queries, Some(vec!["revenue Q3".to_string(), "drivers".to_string()]));
    }

    #[test]
    fn test_decode_short_form_update() {
        let event = decode(concat!(
            r#"{"type":"update","stage":"retrieving","message":"r","finished":true,"#,
            r#""detail":{},"subQueries":["x"]}"#,
        ))
        .unwrap()
        .unwrap();
        let expected =
            StageEvent::finished(Stage::Retrieving, "r").with_sub_queries(vec!["x".to_string()]);
        assert_eq!(event, RawEvent::Update(expected));
    }

    #[test]
    fn test_decode_backend_error_as_failed() {
        let event = decode(concat!(
            r#"{"type":"processing_update","stage":"complete","#,
            r#""message":"Error: model unavailable","details":{"error":true}}"#,
        ))
        .unwrap()
        .unwrap();
        let RawEvent::Update(event) = event else { panic!("expected update") };
        assert_eq!(event.stage, Stage::Failed);
        assert!(event.finished);
        assert_eq!(event.detail["error_message"], "Error: model unavailable");
    }

    #[test]
    fn test_decode_keepalives() {
        assert_eq!(decode("").unwrap(), None);
        assert_eq!(decode("   ").unwrap(), None);
        assert_eq!(decode(r#"{"type":"keepalive"}"#).unwrap(), None);
    }

    #[test]
    fn test_decode_token_and_complete() {
        assert_eq!(
            decode(r#"{"type":"token","content":"Rev"}"#).unwrap(),
            Some(RawEvent::Token("Rev".to_string()))
        );
        assert_eq!(decode(r#"{"type":"complete"}"#).unwrap(), Some(RawEvent::Complete(None)));

        let event = decode(concat!(
            r#"{"type":"complete","answer":{"message_id":"m1","session_id":"s1","#,
            r#""role":"assistant","content":"done"}}"#,
        ))
        .unwrap();
        let Some(RawEvent::Complete(Some(message))) = event else { panic!("expected answer") };
        assert_eq!(message.content, "done");
    }

    #[test]
    fn test_decode_uses_sse_event_name() {
        let frame =
            SseFrame { event: Some("token".to_string()), data: r#"{"text":"hi"}"#.to_string() };
        assert_eq!(decode_frame(&frame).unwrap(), Some(RawEvent::Token("hi".to_string())));
    }

    #[test]
    fn test_decode_failures_are_errors() {
        assert!(matches!(decode("{not json"), Err(TransportError::Decode(_))));
        assert!(matches!(decode("[1,2]"), Err(TransportError::Decode(_))));
        let unknown_stage = decode(r#"{"type":"update","stage":"thinking"}"#);
        assert!(matches!(unknown_stage, Err(TransportError::Decode(_))));
        assert!(matches!(decode(r#"{"type":"mystery"}"#), Err(TransportError::Decode(_))));
    }

    #[test]
    fn test_stream_url() {
        let transport = SseTransport::new("http://localhost:8000/api/chat/").unwrap();
        assert_eq!(
            transport.stream_url("s1", &CorrelationId::from("c1")),
            "http://localhost:8000/api/chat/sessions/s1/stream/c1"
        );
    }

    #[test]
    fn test_from_config_uses_base_url() {
        let config = ClientConfig {
            base_url: "https://docs.example.com/api/chat".to_string(),
            ..Default::default()
        };
        let transport = SseTransport::from_config(&config).unwrap();
        assert_eq!(
            transport.stream_url("s1", &CorrelationId::from("c1")),
            "https://docs.example.com/api/chat/sessions/s1/stream/c1"
        );
    }
}
