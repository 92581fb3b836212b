//! Rate-limited delivery of incremental text.
//!
//! Tokens can arrive far faster than a display can usefully repaint.
//! [`UpdateCoalescer`] records every delta immediately but only hands it to
//! the consumer when flushed, either by a periodic ticker or explicitly.
//! Nothing is lost: [`UpdateCoalescer::final_flush`] emits whatever is still
//! pending, and the concatenation of all emitted deltas equals the input.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const MIN_TICK: Duration = Duration::from_millis(1);

/// One flushed update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpdate {
    /// Text received since the previous flush.
    pub delta: String,
    /// All text received so far.
    pub full: String,
}

type EmitFn = Box<dyn FnMut(ChannelUpdate) + Send>;

#[derive(Debug, Default)]
struct CoalescerBuffer {
    pending_text: String,
    full_text: String,
    last_flush: Option<Instant>,
    flushes: u64,
}

struct Inner {
    buffer: CoalescerBuffer,
    emit: EmitFn,
}

impl Inner {
    fn flush(&mut self) -> bool {
        if self.buffer.pending_text.is_empty() {
            return false;
        }
        let update = ChannelUpdate {
            delta: std::mem::take(&mut self.buffer.pending_text),
            full: self.buffer.full_text.clone(),
        };
        self.buffer.last_flush = Some(Instant::now());
        self.buffer.flushes += 1;
        (self.emit)(update);
        true
    }
}

/// Buffers deltas and emits them in batches.
///
/// Cloning yields another handle to the same buffer, so a ticker task and
/// the reader loop can share one coalescer. The emit callback runs under the
/// buffer lock and must not call back into the coalescer.
#[derive(Clone)]
pub struct UpdateCoalescer {
    inner: Arc<Mutex<Inner>>,
}

impl UpdateCoalescer {
    /// Create a coalescer that reports flushed updates to `emit`.
    pub fn new(emit: impl FnMut(ChannelUpdate) + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                buffer: CoalescerBuffer::default(),
                emit: Box::new(emit),
            })),
        }
    }

    /// Record a delta. Nothing is emitted until the next flush.
    pub fn on_delta(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        inner.buffer.pending_text.push_str(text);
        inner.buffer.full_text.push_str(text);
    }

    /// Emit pending text, if any. Returns whether an update was emitted.
    pub fn flush(&self) -> bool {
        self.inner.lock().flush()
    }

    /// Emit whatever is still pending. Called on every exit path.
    pub fn final_flush(&self) -> bool {
        let mut inner = self.inner.lock();
        let flushed = inner.flush();
        tracing::trace!(
            flushes = inner.buffer.flushes,
            chars = inner.buffer.full_text.len(),
            "final flush"
        );
        flushed
    }

    /// All text received so far, flushed or not.
    #[must_use]
    pub fn full_text(&self) -> String {
        self.inner.lock().buffer.full_text.clone()
    }

    /// Bytes recorded but not yet emitted.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.lock().buffer.pending_text.len()
    }

    /// When the last update was emitted.
    #[must_use]
    pub fn last_flush(&self) -> Option<Instant> {
        self.inner.lock().buffer.last_flush
    }

    /// Flush every `interval` until `cancel` fires.
    ///
    /// The ticker does not final-flush on cancellation; the owner does that
    /// once the reader loop has stopped feeding deltas. A zero interval is
    /// raised to one millisecond.
    pub fn spawn_ticker(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = interval.max(MIN_TICK);
        let coalescer = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        coalescer.flush();
                    }
                }
            }
        })
    }
}

impl fmt::Debug for UpdateCoalescer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("UpdateCoalescer")
            .field("buffer", &inner.buffer)
            .finish_non_exhaustive()
    }
}
