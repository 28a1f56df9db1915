//! Orchestration of one "ask a question" operation.
//!
//! The coordinator subscribes to the event stream before sending the
//! question, folds stage events into a [`SessionProgress`], reconnects with
//! bounded backoff when the stream drops, and switches to status polling for
//! good once reconnecting is pointless. Every ask ends in `complete`,
//! `failed` or an explicit caller cancellation; nothing is returned as an
//! error once the ask has started.

use crate::config::ProgressConfig;
use crate::error::{CoordinatorError, TransportError};
use crate::poller::{FallbackPoller, PollEvent, PollerHandle};
use crate::reconciler::ProgressReconciler;
use crate::transport::{RawEvent, StreamTransport, TransportEvent, TransportHandle};
use docintel_abstraction::{
    Answer, ChatBackend, ClientError, CorrelationId, MessageResponse, SendMessageRequest,
    SessionProgress, Stage, StageEvent,
};
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// State of one ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AskState {
    /// Nothing has happened yet.
    Idle,
    /// A stream connection is being opened.
    Connecting,
    /// The stream is delivering events.
    Streaming,
    /// Waiting out the backoff before reopening the stream.
    Reconnecting,
    /// Polling the session history; streaming is abandoned for this ask.
    FallingBack,
    /// A terminal stage was reached.
    Terminal,
    /// The caller cancelled the ask.
    Cancelled,
}

impl AskState {
    /// Checks if the ask can move to the given state.
    #[must_use]
    #[allow(clippy::match_same_arms)] // Each arm represents a distinct transition rule
    pub const fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            // Cancellation is allowed from every live state
            (Self::Terminal | Self::Cancelled, _) => false,
            (_, Self::Cancelled) => true,
            (Self::Idle, Self::Connecting) => true,
            (Self::Connecting, Self::Streaming | Self::Reconnecting | Self::FallingBack) => true,
            (Self::Streaming, Self::Reconnecting | Self::FallingBack) => true,
            (Self::Reconnecting, Self::Connecting | Self::FallingBack) => true,
            // Any started ask may end, whichever source produced the terminal event
            (
                Self::Connecting | Self::Streaming | Self::Reconnecting | Self::FallingBack,
                Self::Terminal,
            ) => true,
            _ => false,
        }
    }

    /// True for `Terminal` and `Cancelled`.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Terminal | Self::Cancelled)
    }
}

/// Receives the progress of one ask.
pub trait ProgressSink: Send {
    /// Called with every new progress value.
    fn on_progress(&mut self, progress: &SessionProgress);

    /// Called with answer text fragments, untouched.
    fn on_token(&mut self, _token: &str) {}

    /// Called once with the answer, after the terminal progress.
    fn on_answer(&mut self, _answer: &Answer) {}
}

/// Everything an ask can report, for channel-based consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum AskUpdate {
    /// A new progress value.
    Progress(SessionProgress),
    /// An answer text fragment.
    Token(String),
    /// The answer.
    Answer(Answer),
}

impl ProgressSink for mpsc::UnboundedSender<AskUpdate> {
    fn on_progress(&mut self, progress: &SessionProgress) {
        let _ = self.send(AskUpdate::Progress(progress.clone()));
    }

    fn on_token(&mut self, token: &str) {
        let _ = self.send(AskUpdate::Token(token.to_string()));
    }

    fn on_answer(&mut self, answer: &Answer) {
        let _ = self.send(AskUpdate::Answer(answer.clone()));
    }
}

/// Adapts a closure into a [`ProgressSink`] that only observes progress.
pub struct FnSink<F>(pub F);

impl<F> ProgressSink for FnSink<F>
where
    F: FnMut(&SessionProgress) + Send,
{
    fn on_progress(&mut self, progress: &SessionProgress) {
        (self.0)(progress);
    }
}

/// Result of one ask.
#[derive(Debug, Clone, PartialEq)]
pub struct AskOutcome {
    /// The correlation id used for this ask.
    pub correlation_id: CorrelationId,
    /// Final progress; `None` if cancelled before any event.
    pub progress: Option<SessionProgress>,
    /// The answer, when one could be obtained.
    pub answer: Option<Answer>,
    /// Every state entered, in order, starting with `Idle`.
    pub transitions: Vec<AskState>,
    /// Reconnect attempts made.
    pub reconnects: u32,
    /// True if the caller cancelled the ask.
    pub cancelled: bool,
}

impl AskOutcome {
    /// The last state entered.
    #[must_use]
    pub fn final_state(&self) -> AskState {
        self.transitions.last().copied().unwrap_or(AskState::Idle)
    }

    /// True if the ask ended in `complete`.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.progress.as_ref().is_some_and(|p| p.terminal && p.current_stage == Stage::Complete)
    }
}

/// A running ask started with [`RequestCoordinator::spawn_ask`].
#[derive(Debug)]
pub struct AskHandle {
    cancel: CancellationToken,
    task: JoinHandle<AskOutcome>,
}

impl AskHandle {
    /// Cancels the ask. The sink is not called again afterwards.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token that cancels this ask, for use from another task.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the ask to finish.
    pub async fn join(self) -> Result<AskOutcome, JoinError> {
        self.task.await
    }
}

/// Per-session "ask in flight" registry entry, released on drop.
struct InFlightGuard {
    registry: Arc<Mutex<HashSet<String>>>,
    session_id: String,
}

impl InFlightGuard {
    fn acquire(
        registry: &Arc<Mutex<HashSet<String>>>,
        session_id: &str,
    ) -> Result<Self, CoordinatorError> {
        let mut sessions = registry.lock().unwrap_or_else(PoisonError::into_inner);
        if !sessions.insert(session_id.to_string()) {
            return Err(CoordinatorError::AskInFlight { session_id: session_id.to_string() });
        }
        Ok(Self { registry: Arc::clone(registry), session_id: session_id.to_string() })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.session_id);
    }
}

/// Orchestrates asks against one backend.
pub struct RequestCoordinator {
    backend: Arc<dyn ChatBackend>,
    transport: Arc<dyn StreamTransport>,
    config: ProgressConfig,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl std::fmt::Debug for RequestCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoordinator").field("config", &self.config).finish_non_exhaustive()
    }
}

impl RequestCoordinator {
    /// Creates a coordinator.
    ///
    /// # Arguments
    /// * `backend` - REST collaborator for the ask request and status polls
    /// * `transport` - Live event stream factory
    /// * `config` - Timing policy
    #[must_use]
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        transport: Arc<dyn StreamTransport>,
        config: ProgressConfig,
    ) -> Self {
        Self { backend, transport, config, in_flight: Arc::new(Mutex::new(HashSet::new())) }
    }

    /// The timing policy in use.
    #[must_use]
    pub fn config(&self) -> &ProgressConfig {
        &self.config
    }

    /// True while an ask is running for `session_id`.
    #[must_use]
    pub fn is_in_flight(&self, session_id: &str) -> bool {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).contains(session_id)
    }

    /// Asks `question` in `session_id` and drives it to the end.
    ///
    /// # Errors
    /// Returns `CoordinatorError::AskInFlight` if another ask is running for
    /// the session. Nothing else is reported as an error; failures end in a
    /// `failed` progress.
    pub async fn ask<S>(
        &self,
        session_id: &str,
        question: &str,
        sink: &mut S,
    ) -> Result<AskOutcome, CoordinatorError>
    where
        S: ProgressSink + ?Sized,
    {
        let guard = InFlightGuard::acquire(&self.in_flight, session_id)?;
        let outcome = self.drive(session_id, question, sink, CancellationToken::new()).await;
        drop(guard);
        Ok(outcome)
    }

    /// Starts an ask in a background task.
    ///
    /// # Errors
    /// Returns `CoordinatorError::AskInFlight` if another ask is running for
    /// the session.
    pub fn spawn_ask<S>(
        self: &Arc<Self>,
        session_id: impl Into<String>,
        question: impl Into<String>,
        mut sink: S,
    ) -> Result<AskHandle, CoordinatorError>
    where
        S: ProgressSink + 'static,
    {
        let session_id = session_id.into();
        let question = question.into();
        let guard = InFlightGuard::acquire(&self.in_flight, &session_id)?;
        let cancel = CancellationToken::new();
        let coordinator = Arc::clone(self);
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let _guard = guard;
            coordinator.drive(&session_id, &question, &mut sink, token).await
        });

        Ok(AskHandle { cancel, task })
    }

    async fn drive<S>(
        &self,
        session_id: &str,
        question: &str,
        sink: &mut S,
        cancel: CancellationToken,
    ) -> AskOutcome
    where
        S: ProgressSink + ?Sized,
    {
        let run = AskRun {
            coordinator: self,
            session_id,
            question,
            correlation_id: CorrelationId::generate(),
            cancel,
            state: AskState::Idle,
            transitions: vec![AskState::Idle],
            reconciler: ProgressReconciler::new(),
            last_delivered: None,
            answer_message: None,
            consecutive_failures: 0,
            reconnects: 0,
        };
        run.execute(sink).await
    }
}

/// Where stage events currently come from.
enum Source {
    Stream(TransportHandle),
    Backoff(Pin<Box<Sleep>>),
    Polling(PollerHandle),
    Idle,
}

impl Source {
    async fn next_step(&mut self) -> Step {
        match self {
            Self::Stream(handle) => Step::Transport(handle.next_event().await),
            Self::Backoff(sleep) => {
                sleep.as_mut().await;
                Step::BackoffElapsed
            }
            Self::Polling(poller) => Step::Poll(poller.next_event().await),
            Self::Idle => std::future::pending().await,
        }
    }

    fn close(&mut self) {
        match std::mem::replace(self, Self::Idle) {
            Self::Stream(mut handle) => {
                handle.close();
            }
            Self::Polling(mut poller) => poller.close(),
            Self::Backoff(_) | Self::Idle => {}
        }
    }
}

/// One wake-up of the ask loop.
enum Step {
    Cancelled,
    AskSettled(Result<MessageResponse, ClientError>),
    GraceElapsed,
    Transport(Option<TransportEvent>),
    BackoffElapsed,
    Poll(Option<PollEvent>),
}

async fn sleep_opt(sleep: &mut Option<Pin<Box<Sleep>>>) {
    match sleep {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Mutable state of one ask.
struct AskRun<'a> {
    coordinator: &'a RequestCoordinator,
    session_id: &'a str,
    question: &'a str,
    correlation_id: CorrelationId,
    cancel: CancellationToken,
    state: AskState,
    transitions: Vec<AskState>,
    reconciler: ProgressReconciler,
    last_delivered: Option<SessionProgress>,
    answer_message: Option<MessageResponse>,
    consecutive_failures: u32,
    reconnects: u32,
}

impl AskRun<'_> {
    async fn execute<S>(mut self, sink: &mut S) -> AskOutcome
    where
        S: ProgressSink + ?Sized,
    {
        let backend = Arc::clone(&self.coordinator.backend);
        let config = self.coordinator.config.clone();
        let session_id = self.session_id;

        info!(
            session_id = %session_id,
            correlation_id = %self.correlation_id,
            "Starting ask"
        );

        // Subscribe first so no stage event can be published before we listen.
        if !self.transition(AskState::Connecting) {
            self.transition(AskState::Cancelled);
            return self.into_outcome(None);
        }
        let Some(handle) = self.open_stream().await else {
            self.transition(AskState::Cancelled);
            return self.into_outcome(None);
        };
        let mut source = Source::Stream(handle);

        let request = SendMessageRequest::new(self.question, self.correlation_id.clone());
        let mut ask_request = backend.send_message(session_id, &request);
        let mut ask_settled = false;
        let mut grace: Option<Pin<Box<Sleep>>> = None;

        loop {
            let step = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Step::Cancelled,
                result = &mut ask_request, if !ask_settled => Step::AskSettled(result),
                () = sleep_opt(&mut grace) => Step::GraceElapsed,
                step = source.next_step() => step,
            };

            let terminal = match step {
                Step::Cancelled => {
                    source.close();
                    self.transition(AskState::Cancelled);
                    return self.into_outcome(None);
                }
                Step::AskSettled(result) => {
                    ask_settled = true;
                    match result {
                        Ok(message) => {
                            debug!(session_id = %session_id, "Ask request returned the answer");
                            self.answer_message = Some(message);
                            if matches!(source, Source::Stream(_)) {
                                grace = Some(Box::pin(time::sleep(config.answer_grace)));
                                None
                            } else {
                                Some(answer_ready())
                            }
                        }
                        Err(e) => {
                            warn!(session_id = %session_id, error = %e, "Backend rejected the ask");
                            Some(StageEvent::failed(e.to_string()))
                        }
                    }
                }
                Step::GraceElapsed => {
                    debug!(session_id = %session_id, "Stream lagged behind the answer; completing");
                    grace = None;
                    Some(answer_ready())
                }
                Step::Transport(Some(TransportEvent::Event(event))) => {
                    self.consecutive_failures = 0;
                    if self.state == AskState::Connecting && !self.transition(AskState::Streaming) {
                        continue;
                    }
                    match event {
                        RawEvent::Update(event) => {
                            if event.stage.is_terminal() {
                                Some(event)
                            } else {
                                self.fold(&event, sink);
                                None
                            }
                        }
                        RawEvent::Token(token) => {
                            if !self.cancel.is_cancelled() {
                                sink.on_token(&token);
                            }
                            None
                        }
                        RawEvent::Complete(message) => {
                            if message.is_some() {
                                self.answer_message = message;
                            }
                            Some(answer_ready())
                        }
                    }
                }
                Step::Transport(failure) => {
                    let error = match failure {
                        Some(TransportEvent::Error(error)) => error,
                        _ => TransportError::Closed,
                    };
                    source.close();
                    if self.answer_message.is_some() {
                        Some(answer_ready())
                    } else {
                        self.handle_transport_failure(&error, &mut source);
                        None
                    }
                }
                Step::BackoffElapsed => {
                    if !self.transition(AskState::Connecting) {
                        continue;
                    }
                    match self.open_stream().await {
                        Some(handle) => source = Source::Stream(handle),
                        None => continue,
                    }
                    None
                }
                Step::Poll(Some(PollEvent::Answered { event, message })) => {
                    self.answer_message = Some(message);
                    Some(event)
                }
                Step::Poll(Some(PollEvent::Progress(event))) => {
                    if event.stage.is_terminal() {
                        Some(event)
                    } else {
                        self.fold(&event, sink);
                        None
                    }
                }
                Step::Poll(None) => {
                    Some(StageEvent::failed("fallback poller stopped unexpectedly"))
                }
            };

            if let Some(event) = terminal {
                source.close();
                self.fold(&event, sink);
                self.transition(AskState::Terminal);
                break;
            }
        }

        if self.is_complete() && self.answer_message.is_none() {
            self.answer_message = self
                .await_answer(&config, &mut ask_request, ask_settled)
                .await;
        }

        let answer = self.answer_message.take().map(|message| {
            let sub_queries = self
                .reconciler
                .progress()
                .map(|p| p.sub_queries.clone())
                .unwrap_or_default();
            Answer::from_message(message, sub_queries)
        });
        if let Some(answer) = &answer {
            if !self.cancel.is_cancelled() {
                sink.on_answer(answer);
            }
        }

        let outcome = self.into_outcome(answer);
        info!(
            session_id = %session_id,
            correlation_id = %outcome.correlation_id,
            stage = ?outcome.progress.as_ref().map(|p| p.current_stage),
            reconnects = outcome.reconnects,
            "Ask finished"
        );
        outcome
    }

    /// Opens the stream, giving up early if the ask is cancelled.
    /// Opens the stream, bounded by `stream_open_timeout`.
    ///
    /// A timed-out open is handed back as a failed connection so the usual
    /// reconnect policy applies. `None` means the ask was cancelled.
    async fn open_stream(&self) -> Option<TransportHandle> {
        let transport = &self.coordinator.transport;
        let limit = self.coordinator.config.stream_open_timeout;
        let open = time::timeout(limit, transport.open(self.session_id, &self.correlation_id));
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            opened = open => Some(opened.unwrap_or_else(|_| {
                warn!(
                    session_id = %self.session_id,
                    timeout_ms = limit.as_millis() as u64,
                    "Stream open timed out"
                );
                TransportHandle::failed(TransportError::Connect(format!(
                    "stream open timed out after {}ms",
                    limit.as_millis()
                )))
            })),
        }
    }

    fn handle_transport_failure(&mut self, error: &TransportError, source: &mut Source) {
        let config = &self.coordinator.config;

        if error.is_structural() {
            warn!(
                correlation_id = %self.correlation_id,
                error = %error,
                "Stream unknown to backend; falling back to polling"
            );
            self.start_fallback(source);
            return;
        }

        if self.consecutive_failures >= config.max_reconnect_attempts {
            warn!(
                correlation_id = %self.correlation_id,
                attempts = self.consecutive_failures,
                error = %error,
                "Reconnect budget exhausted; falling back to polling"
            );
            self.start_fallback(source);
            return;
        }

        self.consecutive_failures += 1;
        self.reconnects += 1;
        let delay = config.backoff_delay(self.consecutive_failures);
        warn!(
            correlation_id = %self.correlation_id,
            attempt = self.consecutive_failures,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Event stream failed; reconnecting"
        );
        if self.transition(AskState::Reconnecting) {
            *source = Source::Backoff(Box::pin(time::sleep(delay)));
        }
    }

    fn start_fallback(&mut self, source: &mut Source) {
        source.close();
        if !self.transition(AskState::FallingBack) {
            return;
        }
        let poller = FallbackPoller::new(
            Arc::clone(&self.coordinator.backend),
            self.coordinator.config.clone(),
        );
        let handle = poller.start(self.session_id.to_string(), self.question.to_string());
        *source = Source::Polling(handle);
    }

    /// Waits for the answer after the stream reported completion without one.
    async fn await_answer<F>(
        &self,
        config: &ProgressConfig,
        ask_request: &mut F,
        ask_settled: bool,
    ) -> Option<MessageResponse>
    where
        F: std::future::Future<Output = Result<MessageResponse, ClientError>> + Unpin,
    {
        if !ask_settled {
            let waited = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return None,
                result = time::timeout(config.answer_timeout, ask_request) => result,
            };
            match waited {
                Ok(Ok(message)) => return Some(message),
                Ok(Err(e)) => debug!(error = %e, "Ask request failed after completion"),
                Err(_) => debug!("Timed out waiting for the ask response"),
            }
        }

        if self.cancel.is_cancelled() {
            return None;
        }
        match self.coordinator.backend.chat_history(self.session_id).await {
            Ok(history) => history.find_answer(self.question).cloned(),
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "Answer lookup failed");
                None
            }
        }
    }

    /// Folds one event and delivers the result if it changed.
    fn fold<S>(&mut self, event: &StageEvent, sink: &mut S)
    where
        S: ProgressSink + ?Sized,
    {
        if self.cancel.is_cancelled() {
            return;
        }
        match self.reconciler.apply(event) {
            Ok(progress) => {
                if self.last_delivered.as_ref() != Some(progress) {
                    sink.on_progress(progress);
                    self.last_delivered = Some(progress.clone());
                }
            }
            Err(e) => warn!(error = %e, "Ignoring event for finished ask"),
        }
    }

    /// Moves to `to`, refusing once cancelled or when the table forbids it.
    fn transition(&mut self, to: AskState) -> bool {
        if self.cancel.is_cancelled() && to != AskState::Cancelled {
            return false;
        }
        if !self.state.can_transition_to(to) {
            warn!(from = ?self.state, to = ?to, "Invalid ask state transition");
            return false;
        }
        debug!(
            correlation_id = %self.correlation_id,
            from = ?self.state,
            to = ?to,
            "Ask state transition"
        );
        self.state = to;
        self.transitions.push(to);
        true
    }

    fn is_complete(&self) -> bool {
        self.reconciler
            .progress()
            .is_some_and(|p| p.terminal && p.current_stage == Stage::Complete)
    }

    fn into_outcome(self, answer: Option<Answer>) -> AskOutcome {
        AskOutcome {
            cancelled: self.state == AskState::Cancelled,
            correlation_id: self.correlation_id,
            progress: self.reconciler.into_progress(),
            answer,
            transitions: self.transitions,
            reconnects: self.reconnects,
        }
    }
}

fn answer_ready() -> StageEvent {
    StageEvent::finished(Stage::Complete, Stage::Complete.label())
}
