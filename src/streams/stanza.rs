//! Single-stream reader.
//!
//! A [`StanzaStream`] walks a small state machine:
//!
//! ```text
//! LoadingCheckpoint ─┬─> WaitingForSeqStart ──> CatchingUp <──> Live
//!                    ├─> CatchingUp
//!                    └─> WaitingForFirstPush ──────────────────> Live
//! ```
//!
//! Any state can move to `Closed`. The live receiver is subscribed when the
//! stream is opened, so pushes arriving during catch-up are buffered and
//! either discarded as already delivered or emitted once live.

use super::{Backoff, CheckpointTable, CloseSignal, ReadOptions, StreamEvent};
use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::fetcher::{LiveEvent, StanzaFetcher};
use crate::types::{Seq, SeqStart, Stanza, StanzaType, StreamName};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

/// What every reader needs from the engine.
#[derive(Clone)]
pub(crate) struct ReaderContext {
    pub(crate) fetcher: Arc<StanzaFetcher>,
    pub(crate) checkpoints: CheckpointTable,
    pub(crate) batch_size: usize,
    pub(crate) retry_delay: Duration,
    pub(crate) max_retry_delay: Duration,
    /// Fired when the owning engine closes; ends every reader.
    pub(crate) shutdown: CloseSignal,
}

impl ReaderContext {
    pub(crate) fn new(
        fetcher: Arc<StanzaFetcher>,
        checkpoints: CheckpointTable,
        shutdown: CloseSignal,
        config: &EngineConfig,
    ) -> Self {
        Self {
            fetcher,
            checkpoints,
            shutdown,
            batch_size: config.batch_size.max(1),
            retry_delay: config.retry_delay(),
            max_retry_delay: config.max_retry_delay(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReadState {
    LoadingCheckpoint,
    WaitingForSeqStart(u64),
    WaitingForFirstPush,
    CatchingUp,
    Live,
    Closed,
}

/// Ordered stanzas of one stream: backlog first, then live pushes.
pub struct StanzaStream {
    stream: StreamName,
    events: BoxStream<'static, StreamEvent>,
    close: CloseSignal,
    shutdown: CloseSignal,
}

impl StanzaStream {
    /// Open a reader. `fallback` is the start used when neither `seq_start`
    /// nor a stored checkpoint gives one.
    pub(crate) fn open(
        ctx: ReaderContext,
        stream: StreamName,
        options: &ReadOptions,
        fallback: SeqStart,
    ) -> Self {
        let close = CloseSignal::default();
        let shutdown = ctx.shutdown.clone();
        let reader = Reader {
            live: ctx.fetcher.subscribe_live(),
            backoff: Backoff::new(ctx.retry_delay, ctx.max_retry_delay),
            batch_size: options.batch_size.unwrap_or(ctx.batch_size),
            stream: stream.clone(),
            state: ReadState::LoadingCheckpoint,
            position: Seq::ZERO,
            seq_start: options.seq_start,
            fallback,
            seq_limit: options.seq_limit,
            stanza_type: options.stanza_type,
            checkpoint_key: options.checkpoint_key.clone(),
            batch_mode: options.batch_mode,
            auto_commit: options.auto_commit,
            caught_up: false,
            pending: VecDeque::new(),
            close: close.clone(),
            ctx,
        };

        let events = stream::unfold(reader, |mut reader| async move {
            let event = reader.next_event().await?;
            Some((event, reader))
        })
        .fuse()
        .boxed();

        Self {
            stream,
            events,
            close,
            shutdown,
        }
    }

    pub fn stream_name(&self) -> &StreamName {
        &self.stream
    }

    /// Stop reading. Idempotent; a fetch in flight completes but its result
    /// is not emitted.
    pub fn close(&self) {
        self.close.close();
    }

    /// Closed directly or by the engine shutting down.
    pub fn is_closed(&self) -> bool {
        self.close.is_closed() || self.shutdown.is_closed()
    }
}

impl Stream for StanzaStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        if self.is_closed() {
            return Poll::Ready(None);
        }
        self.events.poll_next_unpin(cx)
    }
}

struct Reader {
    ctx: ReaderContext,
    stream: StreamName,
    live: broadcast::Receiver<LiveEvent>,
    state: ReadState,
    /// Last seq consumed (emitted or filtered out).
    position: Seq,
    seq_start: Option<SeqStart>,
    fallback: SeqStart,
    seq_limit: Option<Seq>,
    stanza_type: Option<StanzaType>,
    checkpoint_key: Option<String>,
    batch_mode: bool,
    batch_size: usize,
    auto_commit: bool,
    caught_up: bool,
    pending: VecDeque<StreamEvent>,
    backoff: Backoff,
    close: CloseSignal,
}

impl Reader {
    async fn next_event(&mut self) -> Option<StreamEvent> {
        let close = self.close.clone();
        let shutdown = self.ctx.shutdown.clone();
        let event = tokio::select! {
            biased;
            _ = close.closed() => None,
            _ = shutdown.closed() => None,
            event = self.step() => event,
        };
        if event.is_none() {
            self.set_state(ReadState::Closed);
        }
        event
    }

    async fn step(&mut self) -> Option<StreamEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                self.commit(&event).await;
                return Some(event);
            }
            if self.limit_reached() {
                debug!(stream = %self.stream, seq = %self.position, "seq limit reached");
                return None;
            }

            match self.state {
                ReadState::LoadingCheckpoint => self.load_start().await,
                ReadState::WaitingForSeqStart(count) => self.resolve_relative_start(count).await,
                ReadState::CatchingUp => self.catch_up().await,
                ReadState::WaitingForFirstPush | ReadState::Live => self.wait_live().await,
                ReadState::Closed => return None,
            }
        }
    }

    fn set_state(&mut self, state: ReadState) {
        if self.state != state {
            debug!(stream = %self.stream, from = ?self.state, to = ?state, "read state");
            self.state = state;
        }
    }

    fn limit_reached(&self) -> bool {
        matches!(self.state, ReadState::CatchingUp | ReadState::Live)
            && self.seq_limit.map_or(false, |limit| self.position >= limit)
    }

    fn mark_caught_up(&mut self) {
        if !self.caught_up {
            self.caught_up = true;
            self.pending.push_back(StreamEvent::CaughtUp);
        }
    }

    async fn retry_later(&mut self) {
        tokio::time::sleep(self.backoff.next_delay()).await;
    }

    async fn load_start(&mut self) {
        let key = self.checkpoint_key.clone();
        let start = match (self.seq_start, key) {
            (Some(start), _) => start,
            (None, Some(key)) => match self.ctx.checkpoints.load(&key, &self.stream).await {
                Ok(Some(seq)) => SeqStart::At(seq.next()),
                Ok(None) => self.fallback,
                Err(e) => {
                    warn!(stream = %self.stream, error = %e, "failed to load checkpoint, retrying");
                    self.retry_later().await;
                    return;
                }
            },
            (None, None) => self.fallback,
        };

        match start {
            SeqStart::At(seq) => {
                self.position = seq.prev().unwrap_or(Seq::ZERO);
                self.set_state(ReadState::CatchingUp);
            }
            SeqStart::Last(count) => self.set_state(ReadState::WaitingForSeqStart(count)),
            SeqStart::Now => {
                self.set_state(ReadState::WaitingForFirstPush);
                self.mark_caught_up();
            }
        }
    }

    async fn resolve_relative_start(&mut self, count: u64) {
        let limit = usize::try_from(count.max(1)).unwrap_or(usize::MAX);
        let recent = self
            .ctx
            .fetcher
            .fetch_most_recent_stanzas(&self.stream, limit)
            .await;
        match recent {
            Ok(recent) => {
                self.backoff.reset();
                self.position = match (count, recent.first(), recent.last()) {
                    (0, _, Some(last)) => last.seq,
                    (_, Some(first), _) => first.prev_seq,
                    _ => Seq::ZERO,
                };
                self.set_state(ReadState::CatchingUp);
            }
            Err(SyncError::NotFound(_)) => {
                self.position = Seq::ZERO;
                self.set_state(ReadState::CatchingUp);
            }
            Err(e) => {
                warn!(stream = %self.stream, error = %e, "failed to resolve start, retrying");
                self.retry_later().await;
            }
        }
    }

    async fn catch_up(&mut self) {
        let from = self.position.next();
        let fetched = self
            .ctx
            .fetcher
            .fetch_stanzas(&self.stream, from, self.batch_size)
            .await;
        match fetched {
            Ok(batch) => {
                if batch.stanzas.is_empty() && batch.gap_pending {
                    warn!(stream = %self.stream, %from, "gap could not be filled, retrying");
                    self.retry_later().await;
                    return;
                }
                self.backoff.reset();
                let more = batch.gap_pending
                    || batch.resync_to.is_some()
                    || batch.stanzas.len() == self.batch_size;
                self.deliver(batch.stanzas);
                if let Some(boundary) = batch.resync_to.filter(|seq| *seq > self.position) {
                    warn!(
                        stream = %self.stream,
                        from = %self.position,
                        to = %boundary,
                        "resyncing past stanzas that failed verification"
                    );
                    self.position = boundary;
                }
                if !more {
                    self.set_state(ReadState::Live);
                    self.mark_caught_up();
                }
            }
            Err(SyncError::NotFound(_)) => {
                debug!(stream = %self.stream, "stream unknown upstream, nothing to catch up");
                self.set_state(ReadState::Live);
                self.mark_caught_up();
            }
            Err(e) => {
                if e.is_transient() {
                    debug!(stream = %self.stream, %from, error = %e, "catch-up fetch failed, retrying");
                } else {
                    warn!(stream = %self.stream, %from, error = %e, "catch-up fetch failed, retrying");
                }
                self.retry_later().await;
            }
        }
    }

    async fn wait_live(&mut self) {
        let received = self.live.recv().await;
        match received {
            Ok(LiveEvent::Stanza(stanza)) => {
                if stanza.stream != self.stream {
                    return;
                }
                if self.state == ReadState::WaitingForFirstPush {
                    self.position = stanza.prev_seq;
                    self.set_state(ReadState::Live);
                    self.deliver(vec![stanza]);
                } else if stanza.seq <= self.position {
                    // Already delivered by catch-up.
                } else if stanza.follows(self.position) {
                    self.deliver(vec![stanza]);
                } else {
                    debug!(
                        stream = %self.stream,
                        position = %self.position,
                        seq = %stanza.seq,
                        "gap in live stanzas"
                    );
                    self.set_state(ReadState::CatchingUp);
                }
            }
            Ok(LiveEvent::Resync) => {
                if self.state == ReadState::Live {
                    self.set_state(ReadState::CatchingUp);
                }
            }
            Err(RecvError::Lagged(missed)) => {
                warn!(stream = %self.stream, missed, "live receiver lagged");
                if self.state == ReadState::Live {
                    self.set_state(ReadState::CatchingUp);
                }
            }
            Err(RecvError::Closed) => self.set_state(ReadState::Closed),
        }
    }

    /// Consume stanzas in order: advance the position, filter, queue events.
    fn deliver(&mut self, stanzas: Vec<Stanza>) {
        let mut emitted = Vec::new();
        for stanza in stanzas {
            if self.seq_limit.map_or(false, |limit| stanza.seq > limit) {
                break;
            }
            self.position = stanza.seq;
            if self.stanza_type.map_or(true, |t| t == stanza.stanza_type) {
                emitted.push(stanza);
            }
        }

        if self.batch_mode {
            for chunk in emitted.chunks(self.batch_size) {
                self.pending.push_back(StreamEvent::Batch(chunk.to_vec()));
            }
        } else {
            self.pending
                .extend(emitted.into_iter().map(StreamEvent::Stanza));
        }
    }

    async fn commit(&self, event: &StreamEvent) {
        let Some(key) = self.checkpoint_key.as_deref().filter(|_| self.auto_commit) else {
            return;
        };
        for (stream, seq) in event.positions() {
            if let Err(e) = self.ctx.checkpoints.record(key, &stream, seq).await {
                warn!(%stream, %seq, error = %e, "auto-commit failed");
            }
        }
    }
}
