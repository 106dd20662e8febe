//! Arrival-ordered merge of several read streams.
//!
//! Each input gets a bounded buffer and a caught-up flag. The merge emits
//! the buffered stanza with the smallest `synced_at` (ties go to the input
//! added first), but only while every input either has something buffered
//! or has caught up: an input still fetching its backlog could produce an
//! older stanza, so the merge waits for it.

use super::StreamEvent;
use crate::error::{Result, SyncError};
use crate::types::{Stanza, StreamName};
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

enum Control<S> {
    Add(StreamName, S),
    Remove(StreamName),
    Close,
}

struct Input<S> {
    key: StreamName,
    stream: S,
    buffer: VecDeque<Stanza>,
    caught_up: bool,
    finished: bool,
}

impl<S> Input<S>
where
    S: Stream<Item = StreamEvent> + Unpin,
{
    /// Poll until the buffer is full or the input has nothing ready.
    fn fill(&mut self, cap: usize, cx: &mut Context<'_>) {
        while !self.finished && self.buffer.len() < cap {
            match self.stream.poll_next_unpin(cx) {
                Poll::Ready(Some(StreamEvent::Stanza(stanza))) => self.buffer.push_back(stanza),
                Poll::Ready(Some(StreamEvent::Batch(stanzas))) => self.buffer.extend(stanzas),
                Poll::Ready(Some(StreamEvent::CaughtUp)) => self.caught_up = true,
                Poll::Ready(None) => {
                    self.finished = true;
                    self.caught_up = true;
                }
                Poll::Pending => break,
            }
        }
    }

    fn blocks(&self) -> bool {
        self.buffer.is_empty() && !self.caught_up
    }
}

/// Interleaves inputs by `synced_at`.
pub struct MergeStream<S> {
    inputs: Vec<Input<S>>,
    buffer_cap: usize,
    control_tx: mpsc::UnboundedSender<Control<S>>,
    control: mpsc::UnboundedReceiver<Control<S>>,
    caught_up_sent: bool,
    closed: bool,
}

impl<S> MergeStream<S>
where
    S: Stream<Item = StreamEvent> + Unpin,
{
    /// An empty merge; `buffer_cap` bounds each input's buffer.
    pub fn new(buffer_cap: usize) -> Self {
        let (control_tx, control) = mpsc::unbounded_channel();
        Self {
            inputs: Vec::new(),
            buffer_cap: buffer_cap.max(1),
            control_tx,
            control,
            caught_up_sent: false,
            closed: false,
        }
    }

    /// Add an input. A key already present is ignored.
    pub fn add(&mut self, key: StreamName, stream: S) {
        if self.closed {
            return;
        }
        if self.inputs.iter().any(|input| input.key == key) {
            debug!(stream = %key, "merge input already present");
            return;
        }
        self.inputs.push(Input {
            key,
            stream,
            buffer: VecDeque::new(),
            caught_up: false,
            finished: false,
        });
    }

    /// Drop an input and whatever it had buffered.
    pub fn remove(&mut self, key: &StreamName) {
        self.inputs.retain(|input| &input.key != key);
    }

    /// A handle for changing the inputs from elsewhere.
    pub fn handle(&self) -> MergeHandle<S> {
        MergeHandle {
            tx: self.control_tx.clone(),
        }
    }

    /// Keys of the current inputs, in tie-break order.
    pub fn keys(&self) -> Vec<StreamName> {
        self.inputs.iter().map(|input| input.key.clone()).collect()
    }

    /// End the merge and drop every input. Idempotent.
    pub fn close(&mut self) {
        self.closed = true;
        self.inputs.clear();
        self.control.close();
    }

    fn apply(&mut self, control: Control<S>) {
        match control {
            Control::Add(key, stream) => self.add(key, stream),
            Control::Remove(key) => self.remove(&key),
            Control::Close => self.close(),
        }
    }
}

impl<S> Stream for MergeStream<S>
where
    S: Stream<Item = StreamEvent> + Unpin,
{
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        let this = &mut *self;

        while !this.closed {
            match this.control.poll_recv(cx) {
                Poll::Ready(Some(control)) => this.apply(control),
                Poll::Ready(None) | Poll::Pending => break,
            }
        }
        if this.closed {
            return Poll::Ready(None);
        }

        let cap = this.buffer_cap;
        for input in &mut this.inputs {
            input.fill(cap, cx);
        }
        this.inputs
            .retain(|input| !(input.finished && input.buffer.is_empty()));

        if this.inputs.iter().any(Input::blocks) {
            return Poll::Pending;
        }

        let earliest = this
            .inputs
            .iter()
            .enumerate()
            .filter_map(|(idx, input)| input.buffer.front().map(|s| (s.synced_at, idx)))
            .min();
        if let Some((_, idx)) = earliest {
            if let Some(stanza) = this.inputs[idx].buffer.pop_front() {
                return Poll::Ready(Some(StreamEvent::Stanza(stanza)));
            }
        }

        if !this.caught_up_sent {
            this.caught_up_sent = true;
            return Poll::Ready(Some(StreamEvent::CaughtUp));
        }
        Poll::Pending
    }
}

/// Changes a [`MergeStream`]'s inputs from any task.
pub struct MergeHandle<S> {
    tx: mpsc::UnboundedSender<Control<S>>,
}

impl<S> Clone for MergeHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S> MergeHandle<S> {
    pub fn add(&self, key: StreamName, stream: S) -> Result<()> {
        self.send(Control::Add(key, stream))
    }

    pub fn remove(&self, key: StreamName) -> Result<()> {
        self.send(Control::Remove(key))
    }

    /// Close the merge. Closing an already closed merge is a no-op.
    pub fn close(&self) {
        let _ = self.tx.send(Control::Close);
    }

    /// True once the merge has been closed or dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, control: Control<S>) -> Result<()> {
        self.tx.send(control).map_err(|_| SyncError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Seq, StanzaType, Timestamp};
    use futures::channel::mpsc as chan;
    use futures::stream::{self, BoxStream};
    use futures::FutureExt;

    type Input = BoxStream<'static, StreamEvent>;

    fn name(s: &str) -> StreamName {
        StreamName::new(s).unwrap()
    }

    fn stanza(stream: &str, seq: u64, synced_at: i64) -> StreamEvent {
        StreamEvent::Stanza(Stanza {
            stanza_type: StanzaType::Message,
            stream: name(stream),
            seq: Seq(seq),
            prev_seq: Seq(seq - 1),
            updated_at: Timestamp(0),
            synced_at: Timestamp(synced_at),
            payload: serde_json::Value::Null,
            signature: String::new(),
        })
    }

    fn finished(events: Vec<StreamEvent>) -> Input {
        stream::iter(events).boxed()
    }

    fn order(events: &[StreamEvent]) -> Vec<(String, i64)> {
        events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Stanza(s) => Some((s.stream.to_string(), s.synced_at.0)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_merges_by_synced_at() {
        let mut merge: MergeStream<Input> = MergeStream::new(16);
        merge.add(name("a"), finished(vec![stanza("a", 1, 1), stanza("a", 2, 4)]));
        merge.add(name("b"), finished(vec![stanza("b", 1, 2), stanza("b", 2, 5)]));
        merge.add(name("c"), finished(vec![stanza("c", 1, 3)]));

        let events: Vec<_> = merge.by_ref().take(6).collect().await;
        assert_eq!(
            order(&events),
            vec![
                ("a".into(), 1),
                ("b".into(), 2),
                ("c".into(), 3),
                ("a".into(), 4),
                ("b".into(), 5),
            ]
        );
        assert_eq!(events[5], StreamEvent::CaughtUp);
        assert!(merge.keys().is_empty());
    }

    #[tokio::test]
    async fn test_waits_for_input_still_catching_up() {
        let (tx, rx) = chan::unbounded();
        let mut merge: MergeStream<Input> = MergeStream::new(16);
        merge.add(name("fast"), finished(vec![stanza("fast", 1, 2)]));
        merge.add(name("slow"), rx.boxed());

        // "slow" has neither data nor a caught-up marker yet.
        assert!(merge.next().now_or_never().is_none());

        tx.unbounded_send(stanza("slow", 1, 1)).unwrap();
        tx.unbounded_send(StreamEvent::CaughtUp).unwrap();

        let events: Vec<_> = merge.by_ref().take(3).collect().await;
        assert_eq!(order(&events), vec![("slow".into(), 1), ("fast".into(), 2)]);
        assert_eq!(events[2], StreamEvent::CaughtUp);
    }

    #[tokio::test]
    async fn test_ties_follow_input_order() {
        let mut merge: MergeStream<Input> = MergeStream::new(16);
        merge.add(name("first"), finished(vec![stanza("first", 1, 7)]));
        merge.add(name("second"), finished(vec![stanza("second", 1, 7)]));

        let events: Vec<_> = merge.take(2).collect().await;
        assert_eq!(order(&events), vec![("first".into(), 7), ("second".into(), 7)]);
    }

    #[tokio::test]
    async fn test_small_buffer_keeps_order() {
        let mut merge: MergeStream<Input> = MergeStream::new(1);
        merge.add(
            name("a"),
            finished((1..=4).map(|i| stanza("a", i, i as i64 * 2)).collect()),
        );
        merge.add(
            name("b"),
            finished((1..=4).map(|i| stanza("b", i, i as i64 * 2 + 1)).collect()),
        );

        let events: Vec<_> = merge.take(8).collect().await;
        let times: Vec<i64> = order(&events).into_iter().map(|(_, t)| t).collect();
        assert_eq!(times, vec![2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn test_handle_changes_inputs() {
        let (tx_a, rx_a) = chan::unbounded();
        let mut merge: MergeStream<Input> = MergeStream::new(16);
        merge.add(name("a"), rx_a.boxed());
        let handle = merge.handle();

        tx_a.unbounded_send(StreamEvent::CaughtUp).unwrap();
        assert_eq!(merge.next().await, Some(StreamEvent::CaughtUp));

        handle
            .add(name("b"), finished(vec![stanza("b", 1, 1), StreamEvent::CaughtUp]))
            .unwrap();
        let next = merge.next().await.unwrap();
        assert_eq!(order(&[next]), vec![("b".into(), 1)]);

        handle.remove(name("a")).unwrap();
        tx_a.unbounded_send(stanza("a", 1, 2)).unwrap();
        assert!(merge.next().now_or_never().is_none());
        assert!(merge.keys().is_empty());

        handle.close();
        assert_eq!(merge.next().await, None);
        assert!(handle.is_closed());
        assert!(matches!(
            handle.add(name("c"), finished(vec![])),
            Err(SyncError::Closed)
        ));
    }
}
