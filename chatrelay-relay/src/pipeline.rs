//! The relay's per-session read loop.
//!
//! Upstream bytes are framed, parsed, demultiplexed, and forwarded as
//! [`StreamEvent`]s into a bounded channel. Every await point also waits on
//! the session's cancellation, so a stalled upstream read or a full channel
//! cannot outlive a deadline or a stop request.

use bytes::Bytes;
use chatrelay_core::RelayError;
use chatrelay_streaming::{
    DeadlineHandle, EventParser, FrameStream, StreamEvent, ThinkingDemux,
};
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;

/// Bound on delivering the final events of an aborted session.
pub(crate) const ABORT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// How a pipeline run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEnd {
    /// The upstream sent the end sentinel.
    Done,
    /// The upstream closed the body without the sentinel.
    Closed,
    /// The receiving side went away.
    ClientGone,
}

/// Text relayed so far, by channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayedText {
    /// Answer text.
    pub content: String,
    /// Reasoning text, all blocks concatenated.
    pub thinking: String,
}

impl RelayedText {
    /// Total characters relayed on both channels.
    #[must_use]
    pub fn chars(&self) -> usize {
        self.content.chars().count() + self.thinking.chars().count()
    }
}

/// Framing, parsing and demultiplexing state for one session.
#[derive(Debug)]
pub struct RelayPipeline {
    parser: EventParser,
    demux: ThinkingDemux,
    relayed: RelayedText,
    events_sent: usize,
}

impl RelayPipeline {
    /// Create a pipeline with the given demultiplexer.
    #[must_use]
    pub fn new(demux: ThinkingDemux) -> Self {
        Self {
            parser: EventParser::new(),
            demux,
            relayed: RelayedText::default(),
            events_sent: 0,
        }
    }

    /// Text relayed so far.
    #[must_use]
    pub fn relayed(&self) -> &RelayedText {
        &self.relayed
    }

    /// Consume the pipeline, keeping the relayed text.
    #[must_use]
    pub fn into_relayed(self) -> RelayedText {
        self.relayed
    }

    /// Events forwarded to the channel so far.
    #[must_use]
    pub fn events_sent(&self) -> usize {
        self.events_sent
    }

    /// Undecodable upstream lines skipped so far.
    #[must_use]
    pub fn malformed_frames(&self) -> u64 {
        self.parser.malformed_frames()
    }

    /// Drive `body` to completion.
    ///
    /// Returns an error when the session is cancelled (deadline or stop),
    /// when the body read fails, or when the upstream reports an error
    /// in-band. The body is dropped on return, which closes the connection.
    /// On an error the demultiplexer is still finished: a held marker
    /// fragment and an open reasoning block are forwarded before returning.
    pub async fn run<S, E>(
        &mut self,
        body: S,
        deadline: &DeadlineHandle,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<PipelineEnd, RelayError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Display,
    {
        let result = self.read(body, deadline, tx).await;
        if result.is_err() {
            self.finish_aborted(tx).await;
        }
        result
    }

    async fn read<S, E>(
        &mut self,
        body: S,
        deadline: &DeadlineHandle,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<PipelineEnd, RelayError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Display,
    {
        let mut lines = FrameStream::new(Box::pin(body));

        loop {
            let next = tokio::select! {
                biased;
                _ = deadline.cancelled() => return Err(cancel_reason(deadline)),
                _ = tx.closed() => return Ok(PipelineEnd::ClientGone),
                next = lines.next() => next,
            };

            let line = match next {
                Some(Ok(line)) => line,
                Some(Err(e)) => return Err(RelayError::connection(e.to_string())),
                None => {
                    tracing::debug!("upstream closed without end sentinel");
                    for event in self.demux.finish() {
                        if !self.send(event, deadline, tx).await? {
                            return Ok(PipelineEnd::ClientGone);
                        }
                    }
                    return Ok(PipelineEnd::Closed);
                }
            };

            let event = match self.parser.parse(&line) {
                None | Some(StreamEvent::ParseError { .. }) => continue,
                Some(StreamEvent::Error { kind, message }) => {
                    return Err(RelayError::remote(kind, message));
                }
                Some(event) => event,
            };

            if !deadline.on_byte_received() {
                return Err(cancel_reason(deadline));
            }

            let done = event == StreamEvent::Done;
            for out in self.demux.process_event(event) {
                if !self.send(out, deadline, tx).await? {
                    return Ok(PipelineEnd::ClientGone);
                }
            }
            if done {
                return Ok(PipelineEnd::Done);
            }
        }
    }

    /// Best-effort delivery of whatever the demultiplexer still holds. The
    /// session is already cancelled, so each send is bounded by a timeout
    /// instead of the deadline.
    async fn finish_aborted(&mut self, tx: &mpsc::Sender<StreamEvent>) {
        for event in self.demux.finish() {
            self.record(&event);
            match tokio::time::timeout(ABORT_SEND_TIMEOUT, tx.send(event)).await {
                Ok(Ok(())) => self.events_sent += 1,
                _ => {
                    tracing::debug!("held text not delivered after abort");
                    break;
                }
            }
        }
    }

    fn record(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::ContentDelta { text } => self.relayed.content.push_str(text),
            StreamEvent::ThinkingComplete { accumulated } => {
                self.relayed.thinking.push_str(accumulated)
            }
            _ => {}
        }
    }

    /// Forward one event. Returns `false` if the receiver is gone.
    async fn send(
        &mut self,
        event: StreamEvent,
        deadline: &DeadlineHandle,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<bool, RelayError> {
        self.record(&event);

        tokio::select! {
            biased;
            _ = deadline.cancelled() => Err(cancel_reason(deadline)),
            sent = tx.send(event) => {
                if sent.is_ok() {
                    self.events_sent += 1;
                }
                Ok(sent.is_ok())
            }
        }
    }
}

/// The error for a cancelled session: the elapsed deadline, else a stop.
pub(crate) fn cancel_reason(deadline: &DeadlineHandle) -> RelayError {
    deadline.timeout_error().unwrap_or(RelayError::UserCancelled)
}
