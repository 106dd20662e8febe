//! Consumer checkpoints.
//!
//! A checkpoint is the last seq a consumer (identified by a key) has
//! processed on a stream. The [`CheckpointTable`] serializes updates per
//! (key, stream) and only ever moves a checkpoint forward, so replays and
//! duplicate deliveries never write.

use super::StreamEvent;
use crate::chain::{Chain, ErrorSink};
use crate::error::Result;
use crate::storage::Storage;
use crate::types::{Seq, StreamName};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, warn};

type CheckpointKey = (String, StreamName);

/// Recorded checkpoints, loaded from storage on first use.
#[derive(Clone)]
pub struct CheckpointTable {
    chain: Chain<CheckpointKey, Option<Seq>>,
    storage: Arc<dyn Storage>,
}

impl CheckpointTable {
    pub fn new(storage: Arc<dyn Storage>, sink: ErrorSink) -> Self {
        let loader = Arc::clone(&storage);
        let chain = Chain::new(
            "checkpoint",
            move |(key, stream): CheckpointKey| {
                let storage = Arc::clone(&loader);
                async move { storage.get_checkpoint(&key, &stream).await }
            },
            sink,
        );
        Self { chain, storage }
    }

    /// The recorded checkpoint, after pending updates.
    pub async fn load(&self, key: &str, stream: &StreamName) -> Result<Option<Seq>> {
        self.chain.get((key.to_string(), stream.clone())).await
    }

    /// Persist `seq` if it is past the recorded checkpoint. Resolves to
    /// whether a write happened.
    pub fn record(
        &self,
        key: &str,
        stream: &StreamName,
        seq: Seq,
    ) -> impl Future<Output = Result<bool>> + Send + 'static {
        let storage = Arc::clone(&self.storage);
        let id = (key.to_string(), stream.clone());

        self.chain.next_with(id.clone(), move |recorded| async move {
            if recorded.map_or(false, |recorded| seq <= recorded) {
                return Ok((recorded, false));
            }
            let (key, stream) = id;
            storage.set_checkpoint(&key, &stream, seq).await?;
            debug!(%key, %stream, %seq, "checkpoint");
            Ok((Some(seq), true))
        })
    }
}

/// Checkpoint writer bound to one consumer key.
#[derive(Clone)]
pub struct CheckpointSink {
    key: String,
    table: CheckpointTable,
}

impl CheckpointSink {
    pub(crate) fn new(key: String, table: CheckpointTable) -> Self {
        Self { key, table }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Record the last stanza per stream of `event`. Every position is
    /// attempted; the first failure is returned.
    pub async fn record(&self, event: &StreamEvent) -> Result<()> {
        let mut first_error = None;
        for (stream, seq) in event.positions() {
            if let Err(e) = self.table.record(&self.key, &stream, seq).await {
                warn!(key = %self.key, %stream, %seq, error = %e, "failed to persist checkpoint");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// The recorded checkpoint of this key for `stream`.
    pub async fn checkpoint(&self, stream: &StreamName) -> Result<Option<Seq>> {
        self.table.load(&self.key, stream).await
    }

    /// Pass `input` through, recording checkpoints as events go by.
    pub fn pipe<S>(&self, input: S) -> CheckpointStream
    where
        S: Stream<Item = StreamEvent> + Send + 'static,
    {
        let state = (input.boxed(), self.clone(), VecDeque::new());
        let events = stream::unfold(state, |(mut input, sink, mut pending)| async move {
            loop {
                if let Some(item) = pending.pop_front() {
                    return Some((item, (input, sink, pending)));
                }
                let event = input.next().await?;
                for (stream, seq) in event.positions() {
                    if let Err(e) = sink.table.record(&sink.key, &stream, seq).await {
                        warn!(key = %sink.key, %stream, %seq, error = %e, "failed to persist checkpoint");
                        pending.push_back(Err(e));
                    }
                }
                pending.push_back(Ok(event));
            }
        })
        .fuse()
        .boxed();

        CheckpointStream {
            events,
            closed: false,
        }
    }
}

/// Events of the piped stream; a failed checkpoint write shows up as an
/// `Err` item ahead of the event it belonged to.
pub struct CheckpointStream {
    events: BoxStream<'static, Result<StreamEvent>>,
    closed: bool,
}

impl CheckpointStream {
    /// Stop the stream and drop its input. Idempotent.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.events = stream::empty().boxed();
        }
    }
}

impl Stream for CheckpointStream {
    type Item = Result<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closed {
            return Poll::Ready(None);
        }
        self.events.poll_next_unpin(cx)
    }
}
