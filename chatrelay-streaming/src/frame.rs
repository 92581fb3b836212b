//! Line framing for text event streams.
//!
//! Network reads do not respect line boundaries. [`FrameReader`] buffers the
//! partial tail of each read and hands out complete protocol lines only.
//! The same reader is used on the relay's upstream side and on the client's
//! downstream side.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use pin_project_lite::pin_project;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

const MAX_LINE_SIZE: usize = 10 * 1024 * 1024;

/// Marker that introduces a data line.
pub const DATA_MARKER: &str = "data:";

/// Classification of a protocol line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// Empty line (event separator).
    Blank,
    /// Line starting with `:`.
    Comment,
    /// Line starting with `data:`.
    Data,
    /// Anything else (`event:`, `id:`, garbage).
    Unrecognized,
}

/// One newline-delimited line, without its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolLine {
    kind: LineKind,
    text: String,
}

impl ProtocolLine {
    /// Classify a line.
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let kind = if text.is_empty() {
            LineKind::Blank
        } else if text.starts_with(':') {
            LineKind::Comment
        } else if text.starts_with(DATA_MARKER) {
            LineKind::Data
        } else {
            LineKind::Unrecognized
        };
        Self { kind, text }
    }

    /// The line's classification.
    #[must_use]
    pub fn kind(&self) -> LineKind {
        self.kind
    }

    /// The full line text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The payload after the data marker, trimmed. `None` for non-data lines.
    #[must_use]
    pub fn data_payload(&self) -> Option<&str> {
        match self.kind {
            LineKind::Data => self.text.strip_prefix(DATA_MARKER).map(str::trim),
            _ => None,
        }
    }

    /// Whether the line is dropped before reaching the parser.
    #[must_use]
    pub fn is_noise(&self) -> bool {
        matches!(self.kind, LineKind::Blank | LineKind::Comment)
    }
}

/// Incremental line splitter.
///
/// Input is buffered as bytes and decoded one complete line at a time, so a
/// multi-byte character split across two reads is reassembled intact.
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
    /// Leading bytes of `buffer` already known to hold no newline.
    scanned: usize,
}

impl FrameReader {
    /// Create an empty reader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every line completed by this chunk.
    ///
    /// Blank and comment lines are dropped. One trailing `\r` is trimmed per
    /// line.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ProtocolLine> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut search_from = self.scanned;
        while let Some(offset) = self.buffer[search_from..].iter().position(|&b| b == b'\n') {
            let end = search_from + offset;
            let raw = &self.buffer[start..end];
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);

            let line = ProtocolLine::new(String::from_utf8_lossy(raw));
            if !line.is_noise() {
                lines.push(line);
            }
            start = end + 1;
            search_from = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > MAX_LINE_SIZE {
            tracing::warn!(
                bytes = self.buffer.len(),
                "discarding oversized unterminated line"
            );
            self.buffer.clear();
            self.scanned = 0;
        }

        lines
    }

    /// Feed a string chunk.
    pub fn feed_str(&mut self, chunk: &str) -> Vec<ProtocolLine> {
        self.feed(chunk.as_bytes())
    }

    /// End of stream. Unterminated trailing text is discarded.
    pub fn finish(&mut self) {
        if !self.buffer.is_empty() {
            tracing::debug!(
                bytes = self.buffer.len(),
                "discarding unterminated trailing text at end of stream"
            );
            self.buffer.clear();
            self.scanned = 0;
        }
    }

    /// Bytes waiting for a newline.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

pin_project! {
    /// Stream adapter that frames a byte stream into protocol lines.
    pub struct FrameStream<S> {
        #[pin]
        inner: S,
        reader: FrameReader,
        lines: VecDeque<ProtocolLine>,
        finished: bool,
    }
}

impl<S, E> FrameStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    /// Create a new framed stream.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            reader: FrameReader::new(),
            lines: VecDeque::new(),
            finished: false,
        }
    }
}

impl<S, E> Stream for FrameStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<ProtocolLine, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(line) = this.lines.pop_front() {
                return Poll::Ready(Some(Ok(line)));
            }

            if *this.finished {
                return Poll::Ready(None);
            }

            match this.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.lines.extend(this.reader.feed(&bytes));
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    *this.finished = true;
                    this.reader.finish();
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use pretty_assertions::assert_eq;

    fn texts(lines: &[ProtocolLine]) -> Vec<&str> {
        lines.iter().map(ProtocolLine::text).collect()
    }

    #[test]
    fn test_complete_lines() {
        let mut reader = FrameReader::new();
        let lines = reader.feed_str("data: one\ndata: two\n");
        assert_eq!(texts(&lines), vec!["data: one", "data: two"]);
        assert_eq!(reader.pending_len(), 0);
    }

    #[test]
    fn test_partial_line_across_chunks() {
        let mut reader = FrameReader::new();
        assert!(reader.feed_str("data: {\"choices\":[{\"del").is_empty());
        let lines = reader.feed_str("ta\":{}}]}\n");
        assert_eq!(texts(&lines), vec!["data: {\"choices\":[{\"delta\":{}}]}"]);
    }

    #[test]
    fn test_crlf_trims_one_carriage_return() {
        let mut reader = FrameReader::new();
        let lines = reader.feed_str("data: a\r\ndata: b\r\r\n");
        assert_eq!(texts(&lines), vec!["data: a", "data: b\r"]);
    }

    #[test]
    fn test_crlf_split_between_chunks() {
        let mut reader = FrameReader::new();
        assert!(reader.feed_str("data: a\r").is_empty());
        let lines = reader.feed_str("\n");
        assert_eq!(texts(&lines), vec!["data: a"]);
    }

    #[test]
    fn test_blank_and_comment_lines_dropped() {
        let mut reader = FrameReader::new();
        let lines = reader.feed_str(": keep-alive\n\r\n\ndata: x\n\nevent: ping\n");
        assert_eq!(texts(&lines), vec!["data: x", "event: ping"]);
        assert_eq!(lines[1].kind(), LineKind::Unrecognized);
    }

    #[test]
    fn test_multibyte_char_split_across_reads() {
        let text = "data: héllo\n".as_bytes();
        // Split inside the two-byte 'é'.
        let split = text.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut reader = FrameReader::new();
        assert!(reader.feed(&text[..split]).is_empty());
        let lines = reader.feed(&text[split..]);
        assert_eq!(lines[0].data_payload(), Some("héllo"));
    }

    #[test]
    fn test_long_line_in_small_chunks_scans_each_byte_once() {
        let mut reader = FrameReader::new();
        assert_eq!(texts(&reader.feed_str("data: one\ndata: ")), vec!["data: one"]);
        assert_eq!(reader.scanned, "data: ".len());

        let body = "x".repeat(4096);
        for piece in body.as_bytes().chunks(3) {
            assert!(reader.feed(piece).is_empty());
            assert_eq!(reader.scanned, reader.pending_len());
        }

        let expected = format!("data: {body}");
        let lines = reader.feed_str("\ndata: two\ndata: th");
        assert_eq!(texts(&lines), vec![expected.as_str(), "data: two"]);
        assert_eq!(reader.scanned, "data: th".len());

        reader.finish();
        assert_eq!(reader.scanned, 0);
        assert_eq!(texts(&reader.feed_str("data: four\n")), vec!["data: four"]);
    }

    #[test]
    fn test_finish_discards_unterminated_tail() {
        let mut reader = FrameReader::new();
        reader.feed_str("data: complete\ndata: trunc");
        assert!(reader.pending_len() > 0);
        reader.finish();
        assert_eq!(reader.pending_len(), 0);
    }

    #[test]
    fn test_data_payload() {
        assert_eq!(ProtocolLine::new("data:  [DONE] ").data_payload(), Some("[DONE]"));
        assert_eq!(ProtocolLine::new("data:x").data_payload(), Some("x"));
        assert_eq!(ProtocolLine::new("event: x").data_payload(), None);
    }

    #[tokio::test]
    async fn test_frame_stream() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: he")),
            Ok(Bytes::from_static(b"llo\n\n: ping\ndata: wor")),
            Ok(Bytes::from_static(b"ld\ndata: lost")),
        ];
        let lines: Vec<_> = FrameStream::new(stream::iter(chunks))
            .map(|r| r.unwrap().text().to_string())
            .collect()
            .await;

        assert_eq!(lines, vec!["data: hello", "data: world"]);
    }

    #[tokio::test]
    async fn test_frame_stream_propagates_errors() {
        let chunks: Vec<Result<Bytes, &str>> = vec![Ok(Bytes::from_static(b"data: a\n")), Err("reset")];
        let mut framed = FrameStream::new(stream::iter(chunks));

        assert!(framed.next().await.unwrap().is_ok());
        assert_eq!(framed.next().await.unwrap().unwrap_err(), "reset");
    }
}
