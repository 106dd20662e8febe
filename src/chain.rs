//! Per-key serialized values.
//!
//! A [`Chain`] maps keys to values where every mutation on the same key runs
//! one at a time, in the order it was submitted. Operations on different keys
//! run independently. The first operation on a key lazily initializes its
//! value through the chain's initializer (for example, loading a checkpoint
//! from storage).
//!
//! Each key with pending work has a queue drained by a single driver task.
//! An operation may schedule further operations on its own key; they are
//! queued behind it. Awaiting such a nested operation from inside the outer
//! one never completes, since the queue cannot advance until the outer
//! operation returns.
//!
//! # Example
//!
//! ```ignore
//! let marks: Chain<StreamName, Seq> =
//!     Chain::new("marks", |_stream| async { Ok(Seq(0)) }, ErrorSink::default());
//!
//! // Serialized read-modify-write, no lock held across the await.
//! let seq = marks
//!     .next(stream.clone(), move |current| async move { Ok(current.max(Seq(7))) })
//!     .await?;
//! ```

use crate::error::{Result, SyncError};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::warn;

/// A queued operation. Receives the current value (or the initializer's
/// failure) and yields the replacement, or `None` to keep the current one.
type Job<V> = Box<dyn FnOnce(Result<V>) -> BoxFuture<'static, Option<V>> + Send>;

type Init<K, V> = Arc<dyn Fn(K) -> BoxFuture<'static, Result<V>> + Send + Sync>;

/// Destination for failures caught inside chain operations.
#[derive(Clone)]
pub struct ErrorSink(Arc<dyn Fn(&str, &SyncError) + Send + Sync>);

impl ErrorSink {
    pub fn new(report: impl Fn(&str, &SyncError) + Send + Sync + 'static) -> Self {
        Self(Arc::new(report))
    }

    /// Sink that logs through `tracing`.
    pub fn tracing() -> Self {
        Self::new(|context, error| {
            warn!(context, %error, "chained operation failed");
        })
    }

    pub fn report(&self, context: &str, error: &SyncError) {
        (self.0)(context, error)
    }
}

impl Default for ErrorSink {
    fn default() -> Self {
        Self::tracing()
    }
}

impl fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorSink")
    }
}

struct Slot<V> {
    value: Option<V>,
    queue: VecDeque<Job<V>>,
    running: bool,
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Self {
            value: None,
            queue: VecDeque::new(),
            running: false,
        }
    }
}

struct Inner<K, V> {
    name: &'static str,
    slots: Mutex<HashMap<K, Slot<V>>>,
    init: Init<K, V>,
    sink: ErrorSink,
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    /// Drain the queue for `key` until it is empty.
    async fn drive(self: Arc<Self>, key: K) {
        loop {
            let (job, current) = {
                let mut slots = self.slots.lock();
                let Some(slot) = slots.get_mut(&key) else {
                    return;
                };
                match slot.queue.pop_front() {
                    Some(job) => (job, slot.value.clone()),
                    None => {
                        slot.running = false;
                        return;
                    }
                }
            };

            let current = match current {
                Some(value) => Ok(value),
                None => {
                    let init = AssertUnwindSafe(async { (self.init)(key.clone()).await })
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            warn!(chain = self.name, key = ?key, "initializer panicked");
                            Err(SyncError::Closed)
                        });
                    match init {
                        Ok(value) => {
                            self.store(&key, value.clone());
                            Ok(value)
                        }
                        Err(e) => {
                            self.sink
                                .report(&format!("{}[{:?}] init", self.name, key), &e);
                            Err(e)
                        }
                    }
                }
            };

            // A panicking job drops its reply sender; the key keeps draining.
            match AssertUnwindSafe(job(current)).catch_unwind().await {
                Ok(Some(next)) => self.store(&key, next),
                Ok(None) => {}
                Err(_) => warn!(chain = self.name, key = ?key, "chained operation panicked"),
            }
        }
    }

    fn store(&self, key: &K, value: V) {
        if let Some(slot) = self.slots.lock().get_mut(key) {
            slot.value = Some(value);
        }
    }
}

/// Map of per-key values with serialized asynchronous mutation.
///
/// Cloning a chain yields another handle to the same table. Scheduling
/// operations requires a running tokio runtime.
pub struct Chain<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for Chain<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Chain<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    /// Create a chain. `init` computes a key's value on first use.
    pub fn new<F, Fut>(name: &'static str, init: F, sink: ErrorSink) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let init: Init<K, V> = Arc::new(move |key| Box::pin(init(key)));
        Self {
            inner: Arc::new(Inner {
                name,
                slots: Mutex::new(HashMap::new()),
                init,
                sink,
            }),
        }
    }

    /// Schedule `op` on `key`; resolves to the value it produced.
    ///
    /// The operation is queued before this returns, so call order is
    /// execution order even if the returned future is polled later.
    pub fn next<F, Fut>(&self, key: K, op: F) -> impl Future<Output = Result<V>> + Send + 'static
    where
        F: FnOnce(V) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        self.next_with(key, move |value| {
            let fut = op(value);
            async move {
                let next = fut.await?;
                Ok((next.clone(), next))
            }
        })
    }

    /// Like [`Chain::next`], but `op` also yields an output for the caller.
    pub fn next_with<R, F, Fut>(
        &self,
        key: K,
        op: F,
    ) -> impl Future<Output = Result<R>> + Send + 'static
    where
        R: Send + 'static,
        F: FnOnce(V) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(V, R)>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let sink = self.inner.sink.clone();
        let context = format!("{}[{:?}]", self.inner.name, key);

        let job: Job<V> = Box::new(move |current| {
            Box::pin(async move {
                let value = match current {
                    Ok(value) => value,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return None;
                    }
                };
                match op(value).await {
                    Ok((next, output)) => {
                        let _ = tx.send(Ok(output));
                        Some(next)
                    }
                    Err(e) => {
                        sink.report(&context, &e);
                        let _ = tx.send(Err(e));
                        None
                    }
                }
            })
        });

        self.enqueue(key, job);
        async move { rx.await.unwrap_or(Err(SyncError::Closed)) }
    }

    /// The value after every operation queued so far on `key`.
    pub fn get(&self, key: K) -> impl Future<Output = Result<V>> + Send + 'static {
        self.next_with(key, |value| async move {
            let output = value.clone();
            Ok((value, output))
        })
    }

    /// The last settled value, without waiting for queued operations.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.inner
            .slots
            .lock()
            .get(key)
            .and_then(|slot| slot.value.clone())
    }

    /// Keys that currently hold a value.
    pub fn keys(&self) -> Vec<K> {
        self.inner
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn enqueue(&self, key: K, job: Job<V>) {
        let start = {
            let mut slots = self.inner.slots.lock();
            let slot = slots.entry(key.clone()).or_default();
            slot.queue.push_back(job);
            !std::mem::replace(&mut slot.running, true)
        };

        if start {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(inner.drive(key));
        }
    }
}

impl<K, V> fmt::Debug for Chain<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}
