//! Stream consumer.
//!
//! One spawned task per stream reads the relay's response, routes content
//! and reasoning into two [`UpdateCoalescer`]s, and reports flushed updates
//! to a [`StreamObserver`]. The deadline timers and the coalescer tickers
//! run as separate tasks; everything stops through the session's
//! cancellation token. Every exit path final-flushes both channels, so text
//! already received is never dropped.

use bytes::Bytes;
use chatrelay_core::{
    ClientConfig, ErrorKind, RelayError, SessionId, SessionState, StreamSession,
};
use chatrelay_relay::{classify_transport, parse_retry_after, ChatRequest, ErrorResponse};
use chatrelay_streaming::{
    DeadlineHandle, DeadlineManager, EventParser, FrameStream, StreamEvent, UpdateCoalescer,
};
use futures::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::observer::StreamObserver;
use crate::outcome::ConsumerOutcome;

/// Consumes relay streams.
#[derive(Debug, Clone)]
pub struct StreamConsumer {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
}

impl StreamConsumer {
    /// Create a consumer for the configured endpoint.
    pub fn new(config: ClientConfig) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RelayError::configuration(format!("http client: {e}")))?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    /// Client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send `request` to the endpoint and consume the response.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(&self, request: ChatRequest, observer: Arc<dyn StreamObserver>) -> ConsumerHandle {
        let session = StreamSession::new(&request.model);
        let deadline = self.arm(&session);
        let handle_parts = (session.id().clone(), session.cancellation_token());
        let consumer = self.clone();

        let task = tokio::spawn(async move {
            consumer.run(session, deadline, request, observer).await
        });

        ConsumerHandle::new(handle_parts, task)
    }

    /// Consume an already-open byte stream for `model`.
    ///
    /// The session starts in `Streaming`.
    pub fn consume<S, E>(
        &self,
        model: &str,
        body: S,
        observer: Arc<dyn StreamObserver>,
    ) -> ConsumerHandle
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let mut session = StreamSession::new(model);
        let deadline = self.arm(&session);
        let handle_parts = (session.id().clone(), session.cancellation_token());
        let flush_interval = self.config.flush_interval_duration();

        let task = tokio::spawn(async move {
            transition(&mut session, &*observer, StreamSession::begin_streaming);
            read_body(session, deadline, body, observer, flush_interval).await
        });

        ConsumerHandle::new(handle_parts, task)
    }

    fn arm(&self, session: &StreamSession) -> DeadlineHandle {
        DeadlineManager::start_for(
            self.config.deadlines.for_model(session.model()),
            session.cancellation_token(),
        )
    }

    async fn run(
        self,
        mut session: StreamSession,
        deadline: DeadlineHandle,
        request: ChatRequest,
        observer: Arc<dyn StreamObserver>,
    ) -> ConsumerOutcome {
        let opened = tokio::select! {
            biased;
            _ = deadline.cancelled() => Err(cancel_reason(&deadline)),
            opened = self.open(&request) => opened,
        };

        match opened {
            Ok(response) => {
                transition(&mut session, &*observer, StreamSession::begin_streaming);
                read_body(
                    session,
                    deadline,
                    response.bytes_stream(),
                    observer,
                    self.config.flush_interval_duration(),
                )
                .await
            }
            Err(error) => {
                settle_failure(&mut session, &*observer, &error, &deadline);
                tracing::warn!(session = %session.id(), error = %error, "stream open failed");
                ConsumerOutcome {
                    session_id: session.id().clone(),
                    state: session.state(),
                    content: String::new(),
                    thinking: String::new(),
                    error: Some(error),
                    incomplete: true,
                }
            }
        }
    }

    async fn open(&self, request: &ChatRequest) -> Result<reqwest::Response, RelayError> {
        let mut builder = self
            .http
            .post(self.config.endpoint.clone())
            .header(ACCEPT, "text/event-stream")
            .json(request);
        if let Some(token) = &self.config.auth_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(classify_transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(error_from_response(status.as_u16(), &body, retry_after))
    }
}

/// Classify a non-success response, preferring the kind the relay reported.
fn error_from_response(status: u16, body: &str, retry_after: Option<Duration>) -> RelayError {
    let by_status = RelayError::from_status(status, body, retry_after);
    let reported = serde_json::from_str::<ErrorResponse>(body)
        .ok()
        .and_then(|response| {
            let kind = serde_json::from_value::<ErrorKind>(response.error.kind.into()).ok()?;
            Some((kind, response.error.message))
        });

    match reported {
        Some((kind, message)) if kind != by_status.kind() => RelayError::remote(kind, message),
        _ => by_status,
    }
}

async fn read_body<S, E>(
    mut session: StreamSession,
    deadline: DeadlineHandle,
    body: S,
    observer: Arc<dyn StreamObserver>,
    flush_interval: Duration,
) -> ConsumerOutcome
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: Display,
{
    let content = {
        let observer = Arc::clone(&observer);
        UpdateCoalescer::new(move |update| observer.on_content(&update))
    };
    let thinking = {
        let observer = Arc::clone(&observer);
        UpdateCoalescer::new(move |update| observer.on_thinking(&update))
    };
    let tickers_stop = CancellationToken::new();
    let tickers = [
        content.spawn_ticker(flush_interval, tickers_stop.clone()),
        thinking.spawn_ticker(flush_interval, tickers_stop.clone()),
    ];

    let mut parser = EventParser::new();
    let mut lines = FrameStream::new(Box::pin(body));

    let result = loop {
        let next = tokio::select! {
            biased;
            _ = deadline.cancelled() => break Err(cancel_reason(&deadline)),
            next = lines.next() => next,
        };

        let line = match next {
            Some(Ok(line)) => line,
            Some(Err(e)) => break Err(RelayError::connection(e.to_string())),
            None => break Ok(()),
        };

        let event = match parser.parse(&line) {
            None | Some(StreamEvent::ParseError { .. }) => continue,
            Some(StreamEvent::Error { kind, message }) => {
                break Err(RelayError::remote(kind, message));
            }
            Some(event) => event,
        };

        if !deadline.on_byte_received() {
            break Err(cancel_reason(&deadline));
        }

        match event {
            StreamEvent::ContentDelta { text } => content.on_delta(&text),
            StreamEvent::ThinkingStarted => observer.on_thinking_started(),
            StreamEvent::ThinkingDelta { text, .. } => thinking.on_delta(&text),
            StreamEvent::ThinkingComplete { accumulated } => {
                thinking.flush();
                observer.on_thinking_complete(&accumulated);
            }
            StreamEvent::Done => break Ok(()),
            StreamEvent::ParseError { .. } | StreamEvent::Error { .. } => {}
        }
    };

    // Stop the tickers before the final flush so no flush races it.
    tickers_stop.cancel();
    for ticker in tickers {
        if let Err(e) = ticker.await {
            tracing::debug!(error = %e, "coalescer ticker ended abnormally");
        }
    }
    content.final_flush();
    thinking.final_flush();

    let error = match result {
        Ok(()) => {
            deadline.complete();
            transition(&mut session, &*observer, StreamSession::complete);
            None
        }
        Err(error) => {
            settle_failure(&mut session, &*observer, &error, &deadline);
            tracing::warn!(
                session = %session.id(),
                error = %error,
                chars = content.full_text().len(),
                "stream aborted"
            );
            Some(error)
        }
    };

    let state = session.state();
    ConsumerOutcome {
        session_id: session.id().clone(),
        state,
        content: content.full_text(),
        thinking: thinking.full_text(),
        error,
        incomplete: state != SessionState::Completed,
    }
}

fn cancel_reason(deadline: &DeadlineHandle) -> RelayError {
    deadline.timeout_error().unwrap_or(RelayError::UserCancelled)
}

fn transition<F, T>(session: &mut StreamSession, observer: &dyn StreamObserver, apply: F)
where
    F: FnOnce(&mut StreamSession) -> Result<(), T>,
    T: Display,
{
    match apply(session) {
        Ok(()) => observer.on_state(session.state()),
        Err(e) => tracing::warn!(error = %e, "unexpected session state"),
    }
}

fn settle_failure(
    session: &mut StreamSession,
    observer: &dyn StreamObserver,
    error: &RelayError,
    deadline: &DeadlineHandle,
) {
    if error.is_user_cancelled() {
        transition(session, observer, |s| s.cancel(true));
    } else if deadline.expired().is_some() {
        transition(session, observer, |s| s.cancel(false));
    } else {
        let kind = error.kind();
        transition(session, observer, |s| s.fail(kind));
    }
}

/// Control of a running consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    session_id: SessionId,
    cancel: CancellationToken,
    task: JoinHandle<ConsumerOutcome>,
}

impl ConsumerHandle {
    fn new(
        (session_id, cancel): (SessionId, CancellationToken),
        task: JoinHandle<ConsumerOutcome>,
    ) -> Self {
        Self {
            session_id,
            cancel,
            task,
        }
    }

    /// Client-side session ID.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Stop the stream. Partial text is kept.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the consumer has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the outcome.
    pub async fn join(self) -> ConsumerOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(session = %self.session_id, error = %e, "consumer task failed");
                ConsumerOutcome {
                    session_id: self.session_id,
                    state: SessionState::Failed {
                        kind: ErrorKind::UnknownFailure,
                    },
                    content: String::new(),
                    thinking: String::new(),
                    error: Some(RelayError::connection(e.to_string())),
                    incomplete: true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_core::{DeadlineConfig, DeadlineTable};
    use chatrelay_relay::ChatMessage;
    use chatrelay_streaming::ChannelUpdate;
    use futures::stream;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    type Chunk = Result<Bytes, std::io::Error>;

    #[derive(Default)]
    struct Recorder {
        content: Mutex<Vec<ChannelUpdate>>,
        thinking: Mutex<Vec<ChannelUpdate>>,
        started: Mutex<usize>,
        completed: Mutex<Vec<String>>,
        states: Mutex<Vec<SessionState>>,
    }

    impl StreamObserver for Recorder {
        fn on_content(&self, update: &ChannelUpdate) {
            self.content.lock().push(update.clone());
        }
        fn on_thinking(&self, update: &ChannelUpdate) {
            self.thinking.lock().push(update.clone());
        }
        fn on_thinking_started(&self) {
            *self.started.lock() += 1;
        }
        fn on_thinking_complete(&self, accumulated: &str) {
            self.completed.lock().push(accumulated.to_string());
        }
        fn on_state(&self, state: SessionState) {
            self.states.lock().push(state);
        }
    }

    impl Recorder {
        fn content_text(&self) -> String {
            self.content.lock().iter().map(|u| u.delta.as_str()).collect()
        }
    }

    fn consumer(deadlines: DeadlineConfig) -> StreamConsumer {
        let config = ClientConfig::new("http://127.0.0.1:1/v1/chat/stream")
            .unwrap()
            .deadlines(DeadlineTable::new(deadlines))
            .flush_interval(Duration::from_millis(50));
        StreamConsumer::new(config).unwrap()
    }

    fn relayed(events: &[StreamEvent]) -> Vec<Chunk> {
        events
            .iter()
            .filter_map(StreamEvent::encode_frame)
            .map(|frame| Ok(Bytes::from(frame)))
            .collect()
    }

    fn scenario() -> Vec<StreamEvent> {
        vec![
            StreamEvent::content("He"),
            StreamEvent::content("llo "),
            StreamEvent::ThinkingStarted,
            StreamEvent::thinking_delta("ana", "ana"),
            StreamEvent::thinking_delta("lysis", "analysis"),
            StreamEvent::thinking_complete("analysis"),
            StreamEvent::content(" world"),
            StreamEvent::Done,
        ]
    }

    #[tokio::test]
    async fn test_consume_routes_channels() {
        let recorder = Arc::new(Recorder::default());
        let outcome = consumer(DeadlineConfig::new(5_000, 10_000))
            .consume("m", stream::iter(relayed(&scenario())), recorder.clone())
            .join()
            .await;

        assert_eq!(outcome.state, SessionState::Completed);
        assert!(!outcome.incomplete);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.content, "Hello  world");
        assert_eq!(outcome.thinking, "analysis");

        assert_eq!(recorder.content_text(), "Hello  world");
        assert_eq!(*recorder.started.lock(), 1);
        assert_eq!(*recorder.completed.lock(), vec!["analysis".to_string()]);
        let thinking: String = recorder.thinking.lock().iter().map(|u| u.delta.as_str()).collect();
        assert_eq!(thinking, "analysis");
        assert_eq!(
            *recorder.states.lock(),
            vec![SessionState::Streaming, SessionState::Completed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_flush_delivers_everything() {
        let config = ClientConfig::new("http://127.0.0.1:1/")
            .unwrap()
            .flush_interval(Duration::from_secs(3_600));
        let recorder = Arc::new(Recorder::default());
        let deltas: Vec<_> = (0..100).map(|i| StreamEvent::content(format!("{i},"))).collect();

        let outcome = StreamConsumer::new(config)
            .unwrap()
            .consume("m", stream::iter(relayed(&deltas)), recorder.clone())
            .join()
            .await;

        let expected: String = (0..100).map(|i| format!("{i},")).collect();
        assert_eq!(recorder.content.lock().len(), 1);
        assert_eq!(recorder.content_text(), expected);
        assert_eq!(outcome.content, expected);
        assert_eq!(outcome.state, SessionState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_stop_keeps_partial_content() {
        let recorder = Arc::new(Recorder::default());
        let body = stream::iter(relayed(&[StreamEvent::content("partial")]))
            .chain(stream::pending::<Chunk>());

        let handle = consumer(DeadlineConfig::new(5_000, 10_000)).consume("m", body, recorder.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
        let outcome = handle.join().await;

        assert_eq!(
            outcome.state,
            SessionState::Cancelled {
                user_initiated: true
            }
        );
        assert!(outcome.incomplete);
        assert!(outcome.error.as_ref().unwrap().is_user_cancelled());
        assert_eq!(outcome.content, "partial");
        assert_eq!(recorder.content_text(), "partial");
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_token_deadline() {
        let recorder = Arc::new(Recorder::default());
        let outcome = consumer(DeadlineConfig::new(50, 1_000))
            .consume("m", stream::pending::<Chunk>(), recorder.clone())
            .join()
            .await;

        assert_eq!(
            outcome.state,
            SessionState::Cancelled {
                user_initiated: false
            }
        );
        assert_eq!(
            outcome.error.map(|e| e.kind()),
            Some(ErrorKind::FirstTokenTimeout)
        );
        assert!(outcome.incomplete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_deadline_under_steady_progress() {
        let recorder = Arc::new(Recorder::default());
        let body = stream::iter(0..20).then(|i| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, std::io::Error>(Bytes::from(
                StreamEvent::content(format!("t{i} ")).encode_frame().unwrap(),
            ))
        });

        let outcome = consumer(DeadlineConfig::new(50, 100))
            .consume("m", body, recorder.clone())
            .join()
            .await;

        assert_eq!(
            outcome.error.as_ref().map(RelayError::kind),
            Some(ErrorKind::GatewayTimeout)
        );
        assert!(outcome.suggests_fallback());
        assert!(outcome.content.starts_with("t0 t1 "));
        assert_eq!(recorder.content_text(), outcome.content);
    }

    #[tokio::test]
    async fn test_in_band_error_keeps_partial_content() {
        let recorder = Arc::new(Recorder::default());
        let events = [
            StreamEvent::content("partial"),
            StreamEvent::error(ErrorKind::UpstreamUnavailable, "provider down"),
        ];

        let outcome = consumer(DeadlineConfig::new(5_000, 10_000))
            .consume("m", stream::iter(relayed(&events)), recorder.clone())
            .join()
            .await;

        assert_eq!(
            outcome.state,
            SessionState::Failed {
                kind: ErrorKind::UpstreamUnavailable
            }
        );
        assert_eq!(outcome.content, "partial");
        assert!(outcome.incomplete);
        assert!(outcome.suggests_fallback());
    }

    #[tokio::test]
    async fn test_start_against_endpoint() {
        let server = MockServer::start().await;
        let body: String = scenario().iter().filter_map(StreamEvent::encode_frame).collect();
        Mock::given(method("POST"))
            .and(path("/v1/chat/stream"))
            .and(header("authorization", "Bearer t0k"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(body)
                    .insert_header("content-type", "text/event-stream"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let config = ClientConfig::new(&format!("{}/v1/chat/stream", server.uri()))
            .unwrap()
            .auth_token("t0k");
        let recorder = Arc::new(Recorder::default());
        let outcome = StreamConsumer::new(config)
            .unwrap()
            .start(
                ChatRequest::new("m", vec![ChatMessage::user("hi")]),
                recorder.clone(),
            )
            .join()
            .await;

        assert_eq!(outcome.state, SessionState::Completed);
        assert_eq!(outcome.content, "Hello  world");
        assert_eq!(outcome.thinking, "analysis");
    }

    #[tokio::test]
    async fn test_rate_limited_never_streams() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": {"kind": "rate_limited", "message": "busy", "fallback": true}
            })))
            .mount(&server)
            .await;

        let config = ClientConfig::new(&server.uri()).unwrap();
        let recorder = Arc::new(Recorder::default());
        let outcome = StreamConsumer::new(config)
            .unwrap()
            .start(
                ChatRequest::new("m", vec![ChatMessage::user("hi")]),
                recorder.clone(),
            )
            .join()
            .await;

        assert_eq!(
            outcome.state,
            SessionState::Failed {
                kind: ErrorKind::RateLimited
            }
        );
        assert!(outcome.suggests_fallback());
        assert!(!recorder.states.lock().contains(&SessionState::Streaming));
        assert!(recorder.content.lock().is_empty());
    }

    #[test]
    fn test_error_from_response_prefers_reported_kind() {
        let body = r#"{"error":{"kind":"first_token_timeout","message":"no token"}}"#;
        let error = error_from_response(504, body, None);
        assert_eq!(error.kind(), ErrorKind::FirstTokenTimeout);

        let error = error_from_response(429, "busy", Some(Duration::from_secs(2)));
        assert!(matches!(error, RelayError::RateLimited { retry_after: Some(_) }));

        let error = error_from_response(401, r#"{"error":{"kind":"unauthorized","message":"no"}}"#, None);
        assert_eq!(error.kind(), ErrorKind::UnknownFailure);
    }
}
