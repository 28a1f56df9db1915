//! Status polling used when the live stream cannot be trusted.
//!
//! The poller cannot know the real stage, so it reports a best guess to keep
//! the UI moving and guarantees a terminal event within a fixed number of
//! status checks.

use crate::config::ProgressConfig;
use docintel_abstraction::{ChatBackend, MessageResponse, Stage, StageEvent};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Capacity of the poller event channel.
const POLL_BUFFER: usize = 8;

/// What a poller yields.
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    /// A synthetic stage event; `Failed` once the cap is exhausted.
    Progress(StageEvent),
    /// The answer was found in the session history.
    Answered {
        /// Synthetic `complete` event.
        event: StageEvent,
        /// The matching assistant message.
        message: MessageResponse,
    },
}

impl PollEvent {
    /// The stage event carried by this poll result.
    #[must_use]
    pub fn stage_event(&self) -> &StageEvent {
        match self {
            Self::Progress(event) | Self::Answered { event, .. } => event,
        }
    }
}

/// Polls `GET /sessions/{id}/messages` until the answer shows up.
#[derive(Clone)]
pub struct FallbackPoller {
    backend: Arc<dyn ChatBackend>,
    config: ProgressConfig,
}

impl std::fmt::Debug for FallbackPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackPoller").field("config", &self.config).finish_non_exhaustive()
    }
}

impl FallbackPoller {
    /// Creates a poller.
    #[must_use]
    pub fn new(backend: Arc<dyn ChatBackend>, config: ProgressConfig) -> Self {
        Self { backend, config }
    }

    /// Starts polling in a background task.
    ///
    /// # Arguments
    /// * `session_id` - Session the question was asked in
    /// * `question` - The submitted question text
    #[must_use]
    pub fn start(&self, session_id: String, question: String) -> PollerHandle {
        let (tx, rx) = mpsc::channel(POLL_BUFFER);
        let poller = self.clone();
        let task = tokio::spawn(async move { poller.run(&session_id, &question, &tx).await });
        PollerHandle { events: rx, task: Some(task) }
    }

    /// Runs the poll loop, sending every result to `tx`.
    ///
    /// Always ends with either `PollEvent::Answered` or a `Failed` progress
    /// event, unless the receiver goes away first.
    pub async fn run(&self, session_id: &str, question: &str, tx: &mpsc::Sender<PollEvent>) {
        let cap = self.config.max_poll_attempts.max(1);
        debug!(
            session_id = %session_id,
            initial_delay_ms = self.config.fallback_initial_delay.as_millis() as u64,
            cap,
            "Starting fallback polling"
        );
        time::sleep(self.config.fallback_initial_delay).await;

        for attempt in 1..=cap {
            match self.backend.chat_history(session_id).await {
                Ok(history) => {
                    if let Some(message) = history.find_answer(question) {
                        info!(session_id = %session_id, attempt, "Fallback poll found the answer");
                        let event = StageEvent::finished(Stage::Complete, Stage::Complete.label());
                        let answered = PollEvent::Answered { event, message: message.clone() };
                        let _ = tx.send(answered).await;
                        return;
                    }
                    debug!(session_id = %session_id, attempt, "No answer in history yet");
                }
                Err(e) => {
                    warn!(session_id = %session_id, attempt, error = %e, "Status poll failed");
                }
            }

            if attempt == cap {
                break;
            }

            let event = StageEvent::new(
                Stage::Retrieving,
                format!("Still working on your question (check {} of {})", attempt, cap),
            )
            .with_detail("fallback", Value::Bool(true));
            if tx.send(PollEvent::Progress(event)).await.is_err() {
                return;
            }
            time::sleep(self.config.poll_interval).await;
        }

        warn!(session_id = %session_id, cap, "Fallback polling exhausted");
        let event = StageEvent::failed(format!("no answer after {} status checks", cap))
            .with_detail("fallback", Value::Bool(true));
        let _ = tx.send(PollEvent::Progress(event)).await;
    }
}

/// A running poller. Closing or dropping it cancels any pending poll timer.
#[derive(Debug)]
pub struct PollerHandle {
    events: mpsc::Receiver<PollEvent>,
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Waits for the next poll result. Returns `None` once closed or finished.
    pub async fn next_event(&mut self) -> Option<PollEvent> {
        self.events.recv().await
    }

    /// Stops polling. Idempotent.
    pub fn close(&mut self) {
        self.events.close();
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Fallback poller stopped");
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use docintel_abstraction::{ChatHistory, ClientError, SendMessageRequest};
    use serde_json::Map;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const QUESTION: &str = "What is the Q3 revenue?";

    fn message(id: &str, role: &str, content: &str) -> MessageResponse {
        MessageResponse {
            message_id: id.to_string(),
            session_id: "s1".to_string(),
            role: role.to_string(),
            content: content.to_string(),
            created_at: String::new(),
            citations: Vec::new(),
            metadata: Map::new(),
        }
    }

    /// Serves scripted histories, repeating the last one.
    struct ScriptedHistory {
        histories: Mutex<Vec<Result<Vec<MessageResponse>, ClientError>>>,
        calls: AtomicU32,
    }

    impl ScriptedHistory {
        fn new(histories: Vec<Result<Vec<MessageResponse>, ClientError>>) -> Arc<Self> {
            Arc::new(Self { histories: Mutex::new(histories), calls: AtomicU32::new(0) })
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedHistory {
        async fn send_message(
            &self,
            _session_id: &str,
            _request: &SendMessageRequest,
        ) -> Result<MessageResponse, ClientError> {
            Err(ClientError::Other("not used".to_string()))
        }

        async fn chat_history(&self, session_id: &str) -> Result<ChatHistory, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut histories = self.histories.lock().unwrap();
            let next = if histories.len() > 1 { histories.remove(0) } else { histories[0].clone() };
            next.map(|messages| ChatHistory {
                session_id: session_id.to_string(),
                title: String::new(),
                messages,
                metadata: Map::new(),
            })
        }
    }

    fn config(cap: u32) -> ProgressConfig {
        ProgressConfig {
            fallback_initial_delay: Duration::from_secs(2),
            poll_interval: Duration::from_secs(2),
            max_poll_attempts: cap,
            ..ProgressConfig::default()
        }
    }

    async fn collect(mut handle: PollerHandle) -> Vec<PollEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.next_event().await {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_stops_at_cap_with_failed() {
        let backend = ScriptedHistory::new(vec![Ok(vec![message("1", "user", QUESTION)])]);
        let poller = FallbackPoller::new(backend.clone(), config(3));

        let events = collect(poller.start("s1".to_string(), QUESTION.to_string())).await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(events.len(), 3);
        assert!(events[..2].iter().all(|e| e.stage_event().stage == Stage::Retrieving));
        let last = events.last().unwrap().stage_event();
        assert_eq!(last.stage, Stage::Failed);
        assert_eq!(last.detail["error"], "no answer after 3 status checks");
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_finds_answer_on_second_check() {
        let backend = ScriptedHistory::new(vec![
            Ok(vec![message("1", "user", QUESTION)]),
            Ok(vec![message("1", "user", QUESTION), message("2", "assistant", "Revenue was $10M")]),
        ]);
        let poller = FallbackPoller::new(backend.clone(), config(5));

        let events = collect(poller.start("s1".to_string(), QUESTION.to_string())).await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(events.len(), 2);
        let PollEvent::Answered { event, message } = &events[1] else {
            panic!("expected answer, got {:?}", events[1]);
        };
        assert_eq!(event.stage, Stage::Complete);
        assert_eq!(message.content, "Revenue was $10M");
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_errors_count_towards_cap() {
        let backend = ScriptedHistory::new(vec![Err(ClientError::Request("refused".to_string()))]);
        let poller = FallbackPoller::new(backend.clone(), config(2));

        let events = collect(poller.start("s1".to_string(), QUESTION.to_string())).await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(events.last().unwrap().stage_event().stage, Stage::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_waits_initial_delay() {
        let backend = ScriptedHistory::new(vec![Ok(Vec::new())]);
        let poller = FallbackPoller::new(backend.clone(), config(5));
        let started = time::Instant::now();

        let mut handle = poller.start("s1".to_string(), QUESTION.to_string());
        handle.next_event().await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_polls() {
        let backend = ScriptedHistory::new(vec![Ok(Vec::new())]);
        let poller = FallbackPoller::new(backend.clone(), config(30));

        let mut handle = poller.start("s1".to_string(), QUESTION.to_string());
        handle.next_event().await.unwrap();
        handle.close();
        handle.close();
        time::sleep(Duration::from_secs(60)).await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert!(handle.next_event().await.is_none());
    }
}
