//! Relay endpoint orchestration.
//!
//! [`Relay::open`] runs the connecting phase inline so that failures before
//! the first byte map onto the relay's own HTTP status. Once the upstream
//! answers with a success status, the session moves to `Streaming` and the
//! rest runs in a spawned task that feeds a [`RelayStream`].

use bytes::Bytes;
use chatrelay_core::{RelayConfig, RelayError, SessionId, SessionState, StreamSession};
use chatrelay_streaming::{DeadlineHandle, DeadlineManager, StreamEvent, ThinkingDemux};
use futures::Stream;
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::collaborators::{CollaboratorError, Collaborators, Transcript, UsageRecord};
use crate::error::EndpointError;
use crate::pipeline::{
    cancel_reason, PipelineEnd, RelayPipeline, RelayedText, ABORT_SEND_TIMEOUT,
};
use crate::registry::SessionRegistry;
use crate::request::ChatRequest;
use crate::upstream::UpstreamClient;

/// A streaming relay endpoint.
#[derive(Debug, Clone)]
pub struct Relay {
    config: Arc<RelayConfig>,
    upstream: UpstreamClient,
    collaborators: Collaborators,
    registry: SessionRegistry,
}

impl Relay {
    /// Create a relay with permissive collaborators.
    ///
    /// Fails on an invalid configuration, such as empty thinking markers.
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        config.validate()?;
        let upstream = UpstreamClient::new(&config)?;
        Ok(Self {
            config: Arc::new(config),
            upstream,
            collaborators: Collaborators::default(),
            registry: SessionRegistry::default(),
        })
    }

    /// Replace the collaborators.
    #[must_use]
    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    /// Relay configuration.
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Session registry.
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Verify the caller, open the upstream, and start relaying.
    ///
    /// Errors returned here happened before any byte was streamed.
    pub async fn open(
        &self,
        token: Option<String>,
        request: ChatRequest,
    ) -> Result<RelayStream, EndpointError> {
        request.validate()?;

        let user = self
            .collaborators
            .identity
            .verify(token)
            .await
            .map_err(|e| match e {
                CollaboratorError::Rejected(reason) => EndpointError::Unauthorized(reason),
                other => EndpointError::Collaborator(other),
            })?;
        if !self.collaborators.credits.check(&user, &request.model).await? {
            return Err(EndpointError::InsufficientCredits(request.model));
        }

        let mut session = StreamSession::new(&request.model);
        self.registry.register(&session);
        let deadline = DeadlineManager::start_for(
            self.config.deadlines.for_model(&request.model),
            session.cancellation_token(),
        );
        tracing::debug!(
            session = %session.id(),
            model = %request.model,
            user = %user,
            "opening upstream"
        );

        let upstream_request = request.to_upstream();
        let opened = tokio::select! {
            biased;
            _ = deadline.cancelled() => Err(cancel_reason(&deadline)),
            opened = self.upstream.open(&upstream_request) => opened,
        };
        let body = match opened {
            Ok(body) => body,
            Err(error) => {
                settle_failure(&mut session, &error, &deadline);
                self.registry.record(&session);
                tracing::warn!(session = %session.id(), error = %error, "upstream open failed");
                return Err(error.into());
            }
        };

        Ok(self.start_streaming(session, deadline, user, request, body))
    }

    /// Relay an already-open body. The session must be `Connecting`.
    fn start_streaming<S, E>(
        &self,
        mut session: StreamSession,
        deadline: DeadlineHandle,
        user: String,
        request: ChatRequest,
        body: S,
    ) -> RelayStream
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if let Err(e) = session.begin_streaming() {
            tracing::warn!(error = %e, "unexpected session state");
        }
        self.registry.record(&session);

        let session_id = session.id().clone();
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let demux = if request.extract_thinking {
            ThinkingDemux::new(self.config.thinking_tags.clone())
        } else {
            ThinkingDemux::passthrough()
        };

        let task = tokio::spawn(run_session(
            self.clone(),
            session,
            deadline,
            user,
            request,
            RelayPipeline::new(demux),
            body,
            tx,
        ));

        RelayStream {
            session_id,
            events: rx,
            task,
        }
    }

    async fn after_completion(
        &self,
        session: &StreamSession,
        user: String,
        request: ChatRequest,
        relayed: RelayedText,
    ) {
        let usage = UsageRecord {
            session_id: session.id().clone(),
            user: user.clone(),
            model: request.model.clone(),
            prompt_chars: request.prompt_chars(),
            completion_chars: relayed.chars(),
        };
        if let Err(e) = self.collaborators.credits.debit(&usage).await {
            tracing::warn!(session = %session.id(), error = %e, "credit debit failed");
        }

        let transcript = Transcript {
            session_id: session.id().clone(),
            user,
            model: request.model,
            created_at: session.created_at(),
            messages: request.messages,
            content: relayed.content,
            thinking: relayed.thinking,
        };
        if let Err(e) = self.collaborators.transcripts.persist(&transcript).await {
            tracing::warn!(session = %session.id(), error = %e, "transcript persist failed");
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_session<S, E>(
    relay: Relay,
    mut session: StreamSession,
    deadline: DeadlineHandle,
    user: String,
    request: ChatRequest,
    mut pipeline: RelayPipeline,
    body: S,
    tx: mpsc::Sender<StreamEvent>,
) -> SessionState
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: Display + Send,
{
    let result = pipeline.run(body, &deadline, &tx).await;

    match result {
        Ok(PipelineEnd::Done | PipelineEnd::Closed) => {
            deadline.complete();
            if let Err(e) = session.complete() {
                tracing::warn!(error = %e, "unexpected session state");
            }
            relay.registry.record(&session);
            tracing::debug!(
                session = %session.id(),
                events = pipeline.events_sent(),
                elapsed_ms = session.elapsed().as_millis() as u64,
                "relay completed"
            );
            relay
                .after_completion(&session, user, request, pipeline.into_relayed())
                .await;
        }
        Ok(PipelineEnd::ClientGone) => {
            deadline.cancel();
            if let Err(e) = session.cancel(true) {
                tracing::warn!(error = %e, "unexpected session state");
            }
            relay.registry.record(&session);
            tracing::debug!(session = %session.id(), "client went away, upstream dropped");
        }
        Err(error) => {
            let in_band = StreamEvent::error(error.kind(), error.to_string());
            if tokio::time::timeout(ABORT_SEND_TIMEOUT, tx.send(in_band))
                .await
                .map_or(true, |sent| sent.is_err())
            {
                tracing::debug!(session = %session.id(), "in-band error not delivered");
            }
            settle_failure(&mut session, &error, &deadline);
            relay.registry.record(&session);
            tracing::warn!(
                session = %session.id(),
                error = %error,
                relayed_chars = pipeline.relayed().chars(),
                "relay aborted"
            );
        }
    }

    session.state()
}

/// Move the session into the terminal state matching `error`.
fn settle_failure(session: &mut StreamSession, error: &RelayError, deadline: &DeadlineHandle) {
    let settled = if error.is_user_cancelled() {
        session.cancel(true)
    } else if deadline.expired().is_some() {
        session.cancel(false)
    } else {
        session.fail(error.kind())
    };
    if let Err(e) = settled {
        tracing::warn!(error = %e, "unexpected session state");
    }
}

/// Events of one relayed session.
#[derive(Debug)]
pub struct RelayStream {
    session_id: SessionId,
    events: mpsc::Receiver<StreamEvent>,
    task: JoinHandle<SessionState>,
}

impl RelayStream {
    /// The session's ID.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Receive the next event. `None` once the session has ended.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Split into the event stream and the session's final state.
    ///
    /// Dropping the event stream cancels the session.
    pub fn into_parts(self) -> (ReceiverStream<StreamEvent>, JoinHandle<SessionState>) {
        (ReceiverStream::new(self.events), self.task)
    }

    /// Receive every event, then the final state.
    pub async fn collect(mut self) -> (Vec<StreamEvent>, SessionState) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let state = self
            .task
            .await
            .unwrap_or(SessionState::Failed {
                kind: chatrelay_core::ErrorKind::UnknownFailure,
            });
        (events, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryTranscripts, MockCreditLedger, MockIdentityVerifier};
    use crate::request::ChatMessage;
    use chatrelay_core::{DeadlineConfig, DeadlineTable, ErrorKind};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse_body(deltas: &[&str]) -> String {
        let mut body: String = deltas
            .iter()
            .map(|d| StreamEvent::content(*d).encode_frame().unwrap())
            .collect();
        body.push_str("data: [DONE]\n\n");
        body
    }

    async fn upstream(status: u16, body: String) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(status)
                    .set_body_string(body)
                    .insert_header("content-type", "text/event-stream"),
            )
            .mount(&server)
            .await;
        server
    }

    fn relay(server: &MockServer) -> Relay {
        let config = RelayConfig::new(&format!("{}/v1/chat/completions", server.uri())).unwrap();
        Relay::new(config).unwrap()
    }

    fn request() -> ChatRequest {
        ChatRequest::new("m", vec![ChatMessage::user("hi")])
    }

    #[tokio::test]
    async fn test_relays_and_demultiplexes() {
        let server = upstream(200, sse_body(&["He", "llo <thi", "nking>ana", "lysis</thinking> world"])).await;
        let transcripts = InMemoryTranscripts::new();
        let relay = relay(&server)
            .with_collaborators(Collaborators::default().transcripts(Arc::new(transcripts.clone())));

        let stream = relay.open(None, request()).await.unwrap();
        let id = stream.session_id().clone();
        let (events, state) = stream.collect().await;

        assert_eq!(state, SessionState::Completed);
        assert_eq!(events.first(), Some(&StreamEvent::content("He")));
        assert_eq!(events.last(), Some(&StreamEvent::Done));
        assert!(events.contains(&StreamEvent::thinking_complete("analysis")));

        let record = relay.registry().get(&id).unwrap();
        assert_eq!(
            record.history,
            vec![
                SessionState::Connecting,
                SessionState::Streaming,
                SessionState::Completed
            ]
        );

        let stored = transcripts.all().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "Hello  world");
        assert_eq!(stored[0].thinking, "analysis");
    }

    #[tokio::test]
    async fn test_rate_limit_fails_without_streaming() {
        let server = upstream(429, "slow down".into()).await;
        let relay = relay(&server);

        let error = relay.open(None, request()).await.unwrap_err();
        assert_eq!(error.http_status(), 429);
        assert!(error.suggests_fallback());

        let records = relay.registry().snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].state,
            SessionState::Failed {
                kind: ErrorKind::RateLimited
            }
        );
        assert!(!records[0].history.contains(&SessionState::Streaming));
    }

    #[tokio::test]
    async fn test_extraction_can_be_disabled() {
        let server = upstream(200, sse_body(&["<thinking>x</thinking>y"])).await;
        let relay = relay(&server);

        let (events, _) = relay
            .open(None, request().extract_thinking(false))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(
            events,
            vec![
                StreamEvent::content("<thinking>x</thinking>y"),
                StreamEvent::Done
            ]
        );
    }

    #[test]
    fn test_empty_thinking_markers_are_rejected() {
        let config = RelayConfig::new("http://127.0.0.1:1/v1/chat/completions")
            .unwrap()
            .thinking_tags(chatrelay_core::ThinkingTags::new("", ""));
        let error = Relay::new(config).err().unwrap();
        assert!(matches!(error, RelayError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_unauthorized_caller() {
        let server = upstream(200, sse_body(&["x"])).await;
        let mut identity = MockIdentityVerifier::new();
        identity
            .expect_verify()
            .returning(|_| Err(CollaboratorError::Rejected("expired".into())));
        let relay = relay(&server)
            .with_collaborators(Collaborators::default().identity(Arc::new(identity)));

        let error = relay.open(Some("t".into()), request()).await.unwrap_err();
        assert_eq!(error.http_status(), 401);
        assert!(relay.registry().snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_credit_check_and_debit() {
        let server = upstream(200, sse_body(&["abc"])).await;
        let mut credits = MockCreditLedger::new();
        credits
            .expect_check()
            .withf(|user, model| user == "anonymous" && model == "m")
            .times(1)
            .returning(|_, _| Ok(true));
        credits
            .expect_debit()
            .withf(|usage| usage.completion_chars == 3 && usage.prompt_chars == 2)
            .times(1)
            .returning(|_| Ok(()));
        let relay = relay(&server)
            .with_collaborators(Collaborators::default().credits(Arc::new(credits)));

        let (_, state) = relay.open(None, request()).await.unwrap().collect().await;
        assert_eq!(state, SessionState::Completed);
    }

    #[tokio::test]
    async fn test_insufficient_credits() {
        let server = upstream(200, sse_body(&["x"])).await;
        let mut credits = MockCreditLedger::new();
        credits.expect_check().returning(|_, _| Ok(false));
        credits.expect_debit().never();
        let relay = relay(&server)
            .with_collaborators(Collaborators::default().credits(Arc::new(credits)));

        let error = relay.open(None, request()).await.unwrap_err();
        assert_eq!(error.http_status(), 402);
    }

    #[tokio::test]
    async fn test_first_token_deadline_reports_in_band() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(sse_body(&["late"]))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        let config = RelayConfig::new(&format!("{}/v1/chat/completions", server.uri()))
            .unwrap()
            .deadlines(DeadlineTable::new(DeadlineConfig::new(50, 1_000)));
        let relay = Relay::new(config).unwrap();

        // The delay applies to headers, so the deadline fires while connecting.
        let error = relay.open(None, request()).await.unwrap_err();
        assert_eq!(error.code(), "first_token_timeout");

        let records = relay.registry().snapshot();
        assert_eq!(
            records[0].state,
            SessionState::Cancelled {
                user_initiated: false
            }
        );
    }

    #[tokio::test]
    async fn test_dropping_the_stream_cancels_the_session() {
        let relay = Relay::new(RelayConfig::new("http://127.0.0.1:1/").unwrap()).unwrap();
        let session = StreamSession::new("m");
        relay.registry.register(&session);
        let deadline = DeadlineManager::start_for(DeadlineConfig::new(5_000, 10_000), session.cancellation_token());

        let body = futures::stream::pending::<Result<Bytes, std::io::Error>>();
        let stream = relay.start_streaming(session, deadline, "u".into(), request(), body);
        let (events, task) = stream.into_parts();
        drop(events);

        assert_eq!(
            task.await.unwrap(),
            SessionState::Cancelled {
                user_initiated: true
            }
        );
    }

    #[tokio::test]
    async fn test_remote_stop_through_registry() {
        let relay = Relay::new(RelayConfig::new("http://127.0.0.1:1/").unwrap()).unwrap();
        let session = StreamSession::new("m");
        let id = session.id().clone();
        relay.registry.register(&session);
        let deadline = DeadlineManager::start_for(DeadlineConfig::new(5_000, 10_000), session.cancellation_token());

        let body = futures::stream::pending::<Result<Bytes, std::io::Error>>();
        let stream = relay.start_streaming(session, deadline, "u".into(), request(), body);
        assert!(relay.registry().cancel(&id));

        let (events, state) = stream.collect().await;
        assert_eq!(
            events,
            vec![StreamEvent::error(
                ErrorKind::UserCancelled,
                RelayError::UserCancelled.to_string()
            )]
        );
        assert_eq!(
            state,
            SessionState::Cancelled {
                user_initiated: true
            }
        );
    }
}
