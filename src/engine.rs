//! The sync engine: owns the fetcher, the checkpoint table and the push
//! router, and hands out read streams.
//!
//! ```ignore
//! let engine = SyncEngine::start(config, transport, storage, auth).await?;
//! engine.follow(Subscription::new(friend.clone(), "interchange.example")).await?;
//!
//! let mut stream = engine.create_read_stream(ReadOptions::stream(friend).from_seq(1))?;
//! while let Some(event) = stream.next().await {
//!     // ...
//! }
//! ```

use crate::auth::Authenticator;
use crate::chain::ErrorSink;
use crate::config::EngineConfig;
use crate::error::{Result, SyncError};
use crate::fetcher::{HighWaterMark, StanzaFetcher};
use crate::storage::Storage;
use crate::streams::{
    CheckpointSink, CheckpointTable, CloseSignal, MergeHandle, MergeStream, ReadOptions,
    ReadStream, ReaderContext, StanzaStream,
};
use crate::transport::{Transport, TransportEvent};
use crate::types::{Seq, SeqStart, StanzaType, StreamName, Subscription};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// An open aggregate feed; new subscriptions are added to it.
struct Feed {
    options: ReadOptions,
    handle: MergeHandle<StanzaStream>,
}

/// Client-side synchronization engine.
pub struct SyncEngine {
    config: EngineConfig,
    storage: Arc<dyn Storage>,
    fetcher: Arc<StanzaFetcher>,
    checkpoints: CheckpointTable,
    subscriptions: RwLock<BTreeMap<StreamName, Subscription>>,
    feeds: Mutex<Vec<Feed>>,
    router: Mutex<Option<JoinHandle<()>>>,
    /// Shared by every reader this engine opens.
    shutdown: CloseSignal,
    closed: AtomicBool,
}

impl SyncEngine {
    /// Load subscriptions, register for pushes and start routing them.
    pub async fn start(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
        auth: Arc<dyn Authenticator>,
    ) -> Result<Arc<Self>> {
        let subscriptions = storage
            .list_subscriptions()
            .await?
            .into_iter()
            .map(|sub| (sub.stream.clone(), sub))
            .collect::<BTreeMap<_, _>>();

        let fetcher = Arc::new(StanzaFetcher::new(
            Arc::clone(&storage),
            Arc::clone(&transport),
            auth,
            config.live_capacity,
            ErrorSink::tracing(),
        ));
        let checkpoints = CheckpointTable::new(Arc::clone(&storage), ErrorSink::tracing());

        // Subscribe before asking for pushes so none slip past the router.
        let events = transport.events();
        transport.subscribe_types(&StanzaType::ALL).await?;

        let span = info_span!("push_router");
        let router = tokio::spawn(route_pushes(Arc::clone(&fetcher), events).instrument(span));

        info!(subscriptions = subscriptions.len(), "sync engine started");

        Ok(Arc::new(Self {
            config,
            storage,
            fetcher,
            checkpoints,
            subscriptions: RwLock::new(subscriptions),
            feeds: Mutex::new(Vec::new()),
            router: Mutex::new(Some(router)),
            shutdown: CloseSignal::default(),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Follow a stream. Open aggregate feeds start reading it.
    pub async fn follow(&self, subscription: Subscription) -> Result<()> {
        self.check_open()?;
        self.storage.put_subscription(&subscription).await?;

        let stream = subscription.stream.clone();
        let added = self
            .subscriptions
            .write()
            .insert(stream.clone(), subscription)
            .is_none();
        if added {
            debug!(%stream, "following");
            self.for_each_feed(|feed| {
                let input = self.open_feed_input(&stream, &feed.options);
                feed.handle.add(stream.clone(), input)
            });
        }
        Ok(())
    }

    /// Stop following a stream. Its stored stanzas and checkpoints stay.
    pub async fn unfollow(&self, stream: &StreamName) -> Result<()> {
        self.check_open()?;
        self.storage.delete_subscription(stream).await?;

        if self.subscriptions.write().remove(stream).is_some() {
            debug!(%stream, "unfollowed");
            self.for_each_feed(|feed| feed.handle.remove(stream.clone()));
        }
        Ok(())
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.read().values().cloned().collect()
    }

    /// Open a read stream over one stream, or over every subscription when
    /// `options.stream` is unset.
    pub fn create_read_stream(&self, options: ReadOptions) -> Result<ReadStream> {
        self.check_open()?;
        options.validate()?;

        if let Some(stream) = options.stream.clone() {
            return Ok(ReadStream::Single(StanzaStream::open(
                self.reader_context(),
                stream,
                &options,
                SeqStart::Now,
            )));
        }

        let mut merge = MergeStream::new(self.config.merge_buffer);
        // Held until the feed is registered so a concurrent follow either
        // lands in this loop or finds the feed.
        let subscriptions = self.subscriptions.read();
        for stream in subscriptions.keys() {
            merge.add(stream.clone(), self.open_feed_input(stream, &options));
        }
        let mut feeds = self.feeds.lock();
        feeds.retain(|feed| !feed.handle.is_closed());
        feeds.push(Feed {
            handle: merge.handle(),
            options,
        });
        drop(feeds);
        drop(subscriptions);
        Ok(ReadStream::Merged(merge))
    }

    /// A checkpoint writer for consumer `key`.
    pub fn create_checkpoint_stream(&self, key: impl Into<String>) -> Result<CheckpointSink> {
        self.check_open()?;
        let key = key.into();
        if key.is_empty() {
            return Err(SyncError::InvalidArgument("checkpoint key must not be empty".into()));
        }
        Ok(CheckpointSink::new(key, self.checkpoints.clone()))
    }

    pub async fn high_water_mark(&self, stream: &StreamName) -> Result<HighWaterMark> {
        self.fetcher.high_water_mark(stream).await
    }

    pub fn fetcher(&self) -> &Arc<StanzaFetcher> {
        &self.fetcher
    }

    /// Stop routing pushes and end every read stream. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(router) = self.router.lock().take() {
            router.abort();
        }
        self.shutdown.close();
        for feed in self.feeds.lock().drain(..) {
            feed.handle.close();
        }
        info!("sync engine closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(SyncError::Closed)
        } else {
            Ok(())
        }
    }

    fn reader_context(&self) -> ReaderContext {
        ReaderContext::new(
            Arc::clone(&self.fetcher),
            self.checkpoints.clone(),
            self.shutdown.clone(),
            &self.config,
        )
    }

    /// Aggregate inputs without a start backfill from the beginning.
    fn open_feed_input(&self, stream: &StreamName, options: &ReadOptions) -> StanzaStream {
        StanzaStream::open(
            self.reader_context(),
            stream.clone(),
            options,
            SeqStart::At(Seq(1)),
        )
    }

    /// Apply `op` to every open feed, forgetting feeds whose merge is gone.
    fn for_each_feed(&self, op: impl Fn(&Feed) -> Result<()>) {
        self.feeds
            .lock()
            .retain(|feed| !feed.handle.is_closed() && op(feed).is_ok());
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(router) = self.router.get_mut().take() {
            router.abort();
        }
        self.shutdown.close();
    }
}

/// Route transport events into the fetcher until the transport goes away.
async fn route_pushes(fetcher: Arc<StanzaFetcher>, mut events: broadcast::Receiver<TransportEvent>) {
    loop {
        let event = events.recv().await;
        match event {
            Ok(TransportEvent::Stanza(stanza)) => {
                // Queued in arrival order; completion is not awaited so one
                // slow stream never holds up another.
                tokio::spawn(fetcher.accept_push(stanza));
            }
            Ok(TransportEvent::Reconnected) => {
                info!("transport reconnected, resyncing");
                fetcher.invalidate_high_water_marks().await;
            }
            Ok(TransportEvent::Disconnected) => warn!("transport disconnected"),
            Ok(TransportEvent::Connected) => debug!("transport connected"),
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "push router lagged, resyncing");
                fetcher.invalidate_high_water_marks().await;
            }
            Err(RecvError::Closed) => {
                debug!("transport event channel closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::DigestAuthenticator;
    use crate::storage::MemoryStorage;
    use crate::transport::MemoryInterchange;

    async fn engine() -> Arc<SyncEngine> {
        let interchange = MemoryInterchange::new();
        SyncEngine::start(
            EngineConfig::default(),
            interchange.client(),
            Arc::new(MemoryStorage::new()),
            Arc::new(DigestAuthenticator),
        )
        .await
        .unwrap()
    }

    impl SyncEngine {
        fn feed_count(&self) -> usize {
            self.feeds.lock().len()
        }
    }

    #[tokio::test]
    async fn test_dropped_feeds_are_pruned_on_open() {
        let engine = engine().await;

        for _ in 0..16 {
            let feed = engine.create_read_stream(ReadOptions::all()).unwrap();
            drop(feed);
        }
        assert_eq!(engine.feed_count(), 1);

        let mut kept = engine.create_read_stream(ReadOptions::all()).unwrap();
        let _other = engine.create_read_stream(ReadOptions::all()).unwrap();
        assert_eq!(engine.feed_count(), 2);

        kept.close();
        let _third = engine.create_read_stream(ReadOptions::all()).unwrap();
        assert_eq!(engine.feed_count(), 2);
    }

    #[tokio::test]
    async fn test_close_fires_reader_shutdown() {
        let engine = engine().await;
        let ctx = engine.reader_context();
        assert!(!ctx.shutdown.is_closed());

        engine.close();
        assert!(ctx.shutdown.is_closed());
    }
}
