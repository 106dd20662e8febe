//! Read streams over synchronized stanzas.
//!
//! - [`StanzaStream`]: one stream, from a start position through catch-up
//!   into live pushes
//! - [`MergeStream`]: several inputs interleaved by `synced_at`
//! - [`CheckpointStream`]: persists consumer progress as events pass through
//!
//! All of them are lazy `futures::Stream`s: nothing is fetched until polled.

mod checkpoint;
mod merge;
mod stanza;

pub use checkpoint::{CheckpointSink, CheckpointStream, CheckpointTable};
pub use merge::{MergeHandle, MergeStream};
pub use stanza::StanzaStream;
pub(crate) use stanza::ReaderContext;

use crate::error::{Result, SyncError};
use crate::types::{Seq, SeqStart, Stanza, StanzaType, StreamName};
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::Notify;

/// Options for [`crate::SyncEngine::create_read_stream`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Only emit stanzas of this type (others still advance the position).
    pub stanza_type: Option<StanzaType>,

    /// Stream to read (None = aggregate feed over all subscriptions).
    pub stream: Option<StreamName>,

    /// Start position. Takes precedence over a stored checkpoint.
    pub seq_start: Option<SeqStart>,

    /// Last seq to deliver (inclusive); the stream ends once it is reached.
    pub seq_limit: Option<Seq>,

    /// Consumer key whose stored checkpoint gives the start position.
    pub checkpoint_key: Option<String>,

    /// Emit [`StreamEvent::Batch`] instead of single stanzas.
    pub batch_mode: bool,

    /// Fetch and batch size (None = engine default).
    pub batch_size: Option<usize>,

    /// Write the checkpoint after every emission. Needs `checkpoint_key`.
    pub auto_commit: bool,
}

impl ReadOptions {
    /// Read one stream.
    pub fn stream(stream: StreamName) -> Self {
        Self {
            stream: Some(stream),
            ..Default::default()
        }
    }

    /// Read every followed stream, merged by arrival.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn from_seq(mut self, seq: u64) -> Self {
        self.seq_start = Some(SeqStart::At(Seq(seq)));
        self
    }

    pub fn last(mut self, count: u64) -> Self {
        self.seq_start = Some(SeqStart::Last(count));
        self
    }

    pub fn from_now(mut self) -> Self {
        self.seq_start = Some(SeqStart::Now);
        self
    }

    pub fn until_seq(mut self, seq: u64) -> Self {
        self.seq_limit = Some(Seq(seq));
        self
    }

    pub fn of_type(mut self, stanza_type: StanzaType) -> Self {
        self.stanza_type = Some(stanza_type);
        self
    }

    pub fn with_checkpoint(mut self, key: impl Into<String>) -> Self {
        self.checkpoint_key = Some(key.into());
        self
    }

    pub fn batched(mut self, size: usize) -> Self {
        self.batch_mode = true;
        self.batch_size = Some(size);
        self
    }

    pub fn auto_commit(mut self) -> Self {
        self.auto_commit = true;
        self
    }

    /// Reject option combinations that cannot be served.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(SyncError::InvalidArgument(msg.to_string()));

        if self.batch_size == Some(0) {
            return invalid("batch_size must be positive");
        }
        if self.auto_commit && self.checkpoint_key.is_none() {
            return invalid("auto_commit requires a checkpoint_key");
        }
        if matches!(&self.checkpoint_key, Some(key) if key.is_empty()) {
            return invalid("checkpoint_key must not be empty");
        }
        if self.stream.is_none() {
            if self.batch_mode {
                return invalid("batch mode needs a single stream");
            }
            if self.seq_limit.is_some() {
                return invalid("seq_limit needs a single stream");
            }
        }
        if let (Some(SeqStart::At(start)), Some(limit)) = (self.seq_start, self.seq_limit) {
            if start > limit {
                return invalid("seq_start is past seq_limit");
            }
        }
        Ok(())
    }
}

/// Items produced by read streams.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Stanza(Stanza),
    Batch(Vec<Stanza>),
    /// The backlog has been delivered; what follows is live.
    CaughtUp,
}

impl StreamEvent {
    /// Stanzas carried by this event.
    pub fn stanzas(&self) -> &[Stanza] {
        match self {
            StreamEvent::Stanza(stanza) => std::slice::from_ref(stanza),
            StreamEvent::Batch(stanzas) => stanzas,
            StreamEvent::CaughtUp => &[],
        }
    }

    /// Highest seq per stream among the carried stanzas.
    pub fn positions(&self) -> Vec<(StreamName, Seq)> {
        let mut positions: Vec<(StreamName, Seq)> = Vec::new();
        for stanza in self.stanzas() {
            match positions.iter_mut().find(|(stream, _)| *stream == stanza.stream) {
                Some((_, seq)) => *seq = (*seq).max(stanza.seq),
                None => positions.push((stanza.stream.clone(), stanza.seq)),
            }
        }
        positions
    }
}

/// Shared close flag with wakeup.
#[derive(Clone, Debug, Default)]
pub(crate) struct CloseSignal {
    inner: Arc<CloseInner>,
}

#[derive(Debug, Default)]
struct CloseInner {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseSignal {
    pub(crate) fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Resolves once closed.
    pub(crate) async fn closed(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// Doubling retry delay.
#[derive(Clone, Debug)]
pub(crate) struct Backoff {
    first: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(first: Duration, max: Duration) -> Self {
        Self {
            first,
            max: max.max(first),
            current: first,
        }
    }

    /// The delay to wait now; the next one doubles.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.first;
    }
}

/// The stream returned by [`crate::SyncEngine::create_read_stream`].
pub enum ReadStream {
    Single(StanzaStream),
    Merged(MergeStream<StanzaStream>),
}

impl ReadStream {
    /// Stop the stream. Idempotent; pending results are discarded.
    pub fn close(&mut self) {
        match self {
            ReadStream::Single(stream) => stream.close(),
            ReadStream::Merged(stream) => stream.close(),
        }
    }
}

impl Stream for ReadStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        match self.get_mut() {
            ReadStream::Single(stream) => Pin::new(stream).poll_next(cx),
            ReadStream::Merged(stream) => Pin::new(stream).poll_next(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;

    fn stanza(stream: &str, seq: u64) -> Stanza {
        Stanza {
            stanza_type: StanzaType::Message,
            stream: StreamName::new(stream).unwrap(),
            seq: Seq(seq),
            prev_seq: Seq(seq - 1),
            updated_at: Timestamp(0),
            synced_at: Timestamp(0),
            payload: serde_json::Value::Null,
            signature: String::new(),
        }
    }

    #[test]
    fn test_validate_rejects_bad_combinations() {
        let friend = StreamName::new("friend").unwrap();

        assert!(ReadOptions::stream(friend.clone()).validate().is_ok());
        assert!(ReadOptions::stream(friend.clone()).batched(0).validate().is_err());
        assert!(ReadOptions::stream(friend.clone()).auto_commit().validate().is_err());
        assert!(ReadOptions::stream(friend.clone())
            .from_seq(5)
            .until_seq(2)
            .validate()
            .is_err());
        assert!(ReadOptions::all().batched(10).validate().is_err());
        assert!(ReadOptions::all().with_checkpoint("k").auto_commit().validate().is_ok());
    }

    #[test]
    fn test_positions_keep_highest_per_stream() {
        let event = StreamEvent::Batch(vec![stanza("a", 1), stanza("b", 4), stanza("a", 2)]);
        assert_eq!(
            event.positions(),
            vec![
                (StreamName::new("a").unwrap(), Seq(2)),
                (StreamName::new("b").unwrap(), Seq(4)),
            ]
        );
        assert!(StreamEvent::CaughtUp.positions().is_empty());
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_close_signal_wakes_waiter() {
        let signal = CloseSignal::default();
        let waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.closed().await });

        signal.close();
        signal.close();
        task.await.unwrap();
        assert!(signal.is_closed());
    }
}
