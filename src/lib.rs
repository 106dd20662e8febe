//! # Stanza Sync
//!
//! Client-side synchronization of append-only stanza streams with remote
//! interchanges.
//!
//! ## Core Concepts
//!
//! - **Stanzas**: Signed entries of a stream, numbered by `seq` and linked
//!   through `prev_seq`
//! - **Fetcher**: Serves gap-free runs from local storage, backfilling from
//!   the network, and tracks per-stream high-water marks
//! - **Read streams**: Catch up from a checkpoint, then follow live pushes;
//!   several streams merge by arrival time
//! - **Checkpoints**: Per-consumer progress that only moves forward
//!
//! ## Example
//!
//! ```ignore
//! use stanza_sync::{
//!     DigestAuthenticator, EngineConfig, MemoryInterchange, MemoryStorage, ReadOptions,
//!     StreamName, SyncEngine,
//! };
//!
//! let interchange = MemoryInterchange::new();
//! let engine = SyncEngine::start(
//!     EngineConfig::default(),
//!     interchange.client(),
//!     Arc::new(MemoryStorage::new()),
//!     Arc::new(DigestAuthenticator),
//! )
//! .await?;
//!
//! let friend = StreamName::new("friend")?;
//! let stream = engine.create_read_stream(
//!     ReadOptions::stream(friend).with_checkpoint("timeline"),
//! )?;
//! let mut events = engine.create_checkpoint_stream("timeline")?.pipe(stream);
//! while let Some(event) = events.next().await {
//!     // ...
//! }
//! ```

pub mod auth;
pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod storage;
pub mod streams;
pub mod transport;
pub mod types;

// Re-exports
pub use auth::{Authenticator, DigestAuthenticator, TrustAll};
pub use chain::{Chain, ErrorSink};
pub use config::EngineConfig;
pub use engine::SyncEngine;
pub use error::{Result, SyncError};
pub use fetcher::{contiguous_prefix, FetchBatch, HighWaterMark, LiveEvent, StanzaFetcher};
pub use storage::{FileStorage, FileStorageConfig, MemoryStorage, StanzaQuery, Storage};
pub use streams::{
    CheckpointSink, CheckpointStream, CheckpointTable, MergeHandle, MergeStream, ReadOptions,
    ReadStream, StanzaStream, StreamEvent,
};
pub use transport::{
    MemoryInterchange, MemoryTransport, Method, RangeReply, RangeRequest, Transport,
    TransportEvent,
};
pub use types::{Seq, SeqStart, Stanza, StanzaInput, StanzaType, StreamName, Subscription, Timestamp};
