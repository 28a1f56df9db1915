//! REST implementation of [`ChatBackend`] on top of reqwest.

use crate::config::{ClientConfig, DEFAULT_REQUEST_TIMEOUT};
use async_trait::async_trait;
use docintel_abstraction::{
    CORRELATION_ID_HEADER, ChatBackend, ChatHistory, ClientError, MessageResponse,
    SendMessageRequest,
};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, error};

/// Longest response body kept in a `ClientError::Status`.
const MAX_ERROR_BODY: usize = 1024;

/// Talks to `{base_url}/sessions/...`.
#[derive(Debug, Clone)]
pub struct HttpChatBackend {
    base_url: String,
    client: Client,
}

impl HttpChatBackend {
    /// Creates a backend for the chat API rooted at `base_url`.
    ///
    /// # Errors
    /// Returns `ClientError::Request` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Creates a backend from client configuration.
    ///
    /// # Errors
    /// Returns `ClientError::Request` if the HTTP client cannot be built.
    pub fn from_config(config: &ClientConfig) -> Result<Self, ClientError> {
        Self::with_timeout(config.base_url.clone(), config.request_timeout)
    }

    fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            ClientError::Request(format!("Failed to create HTTP client: {}", e))
        })?;
        Ok(Self::with_client(base_url, client))
    }

    /// Creates a backend with an existing HTTP client.
    #[must_use]
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        Self { base_url: base_url.into(), client }
    }

    fn messages_url(&self, session_id: &str) -> String {
        format!("{}/sessions/{}/messages", self.base_url.trim_end_matches('/'), session_id)
    }

    async fn decode<T: DeserializeOwned>(url: &str, response: Response) -> Result<T, ClientError> {
        let status = response.status();
        let body = response.text().await.map_err(|e| {
            ClientError::Request(format!("Failed to read response body: {}", e))
        })?;

        if status == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            error!(status = %status, url = %url, "Chat API returned error status");
            let mut body = body;
            if body.len() > MAX_ERROR_BODY {
                let mut end = MAX_ERROR_BODY;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
            }
            return Err(ClientError::Status { status: status.as_u16(), body });
        }

        serde_json::from_str(&body).map_err(|e| {
            error!(error = %e, url = %url, "Failed to parse chat API response");
            ClientError::Serialization(format!("Failed to parse response: {}", e))
        })
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn send_message(
        &self,
        session_id: &str,
        request: &SendMessageRequest,
    ) -> Result<MessageResponse, ClientError> {
        let url = self.messages_url(session_id);
        debug!(
            session_id = %session_id,
            correlation_id = %request.correlation_id,
            content_len = request.content.len(),
            "Sending question"
        );

        let response = self
            .client
            .post(&url)
            .header(CORRELATION_ID_HEADER, request.correlation_id.as_str())
            .json(request)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, url = %url, "Failed to send question");
                ClientError::Request(format!("Network error: {}", e))
            })?;

        Self::decode(&url, response).await
    }

    async fn chat_history(&self, session_id: &str) -> Result<ChatHistory, ClientError> {
        let url = self.messages_url(session_id);
        debug!(session_id = %session_id, "Fetching chat history");

        let response = self.client.get(&url).send().await.map_err(|e| {
            error!(error = %e, url = %url, "Failed to fetch chat history");
            ClientError::Request(format!("Network error: {}", e))
        })?;

        Self::decode(&url, response).await
    }
}
