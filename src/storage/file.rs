//! File-backed storage.
//!
//! Layout of a storage directory:
//!
//! ```text
//! <path>/MANIFEST     magic + format version
//! <path>/LOCK         exclusive advisory lock held while open
//! <path>/sync.log     append-only entry log
//! ```
//!
//! Each log entry is framed as `len: u32 | rmp-serde bytes | crc32: u32`.
//! On open the log is replayed into in-memory indexes; a torn or corrupt
//! tail (from a crash mid-append) is truncated. Stanza bodies stay on disk
//! and are read back by offset through an LRU cache.

use super::{StanzaQuery, Storage};
use crate::error::{Result, SyncError};
use crate::types::{Seq, Stanza, StanzaType, StreamName, Subscription};
use async_trait::async_trait;
use fs2::FileExt;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Magic bytes for the storage manifest.
const STORE_MAGIC: &[u8; 4] = b"STZ\0";

/// Current storage format version.
const STORE_VERSION: u8 = 1;

/// Magic bytes at the head of the entry log.
const LOG_MAGIC: &[u8; 4] = b"SLG\0";

const LOG_VERSION: u8 = 1;

const LOG_HEADER_SIZE: u64 = 5;

/// Upper bound for a single entry; anything larger is treated as corruption.
const MAX_ENTRY_SIZE: usize = 16 * 1024 * 1024;

/// File storage configuration.
#[derive(Clone, Debug)]
pub struct FileStorageConfig {
    /// Directory holding the storage files.
    pub path: PathBuf,

    /// Decoded stanzas kept in memory.
    pub stanza_cache_size: usize,

    /// Whether to create the storage if it doesn't exist.
    pub create_if_missing: bool,

    /// fsync every N appends (0 and 1 both mean every append).
    pub sync_interval: u64,
}

impl Default for FileStorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./stanza-sync"),
            stanza_cache_size: 1000,
            create_if_missing: true,
            sync_interval: 1,
        }
    }
}

/// Entries of the storage log.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum LogEntry {
    Stanza(Stanza),
    Checkpoint {
        key: String,
        stream: StreamName,
        seq: Seq,
    },
    HighWaterMark {
        stream: StreamName,
        seq: Seq,
    },
    Subscribe(Subscription),
    Unsubscribe {
        stream: StreamName,
    },
}

/// Where a stanza lives in the log.
#[derive(Clone, Copy, Debug)]
struct StanzaLocation {
    offset: u64,
    stanza_type: StanzaType,
}

#[derive(Default)]
struct Indexes {
    stanzas: BTreeMap<(StreamName, Seq), StanzaLocation>,
    checkpoints: HashMap<(String, StreamName), Seq>,
    high_water_marks: HashMap<StreamName, Seq>,
    subscriptions: BTreeMap<StreamName, Subscription>,
}

impl Indexes {
    fn apply(&mut self, offset: u64, entry: LogEntry) {
        match entry {
            LogEntry::Stanza(stanza) => {
                self.stanzas.insert(
                    (stanza.stream, stanza.seq),
                    StanzaLocation {
                        offset,
                        stanza_type: stanza.stanza_type,
                    },
                );
            }
            LogEntry::Checkpoint { key, stream, seq } => {
                self.checkpoints.insert((key, stream), seq);
            }
            LogEntry::HighWaterMark { stream, seq } => {
                let mark = self.high_water_marks.entry(stream).or_default();
                *mark = (*mark).max(seq);
            }
            LogEntry::Subscribe(subscription) => {
                self.subscriptions
                    .insert(subscription.stream.clone(), subscription);
            }
            LogEntry::Unsubscribe { stream } => {
                self.subscriptions.remove(&stream);
            }
        }
    }
}

struct LogFile {
    file: File,
    /// Offset where the next entry is appended.
    end: u64,
    writes_since_sync: u64,
}

/// Open log state shared with blocking tasks.
struct FileInner {
    config: FileStorageConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    log: Mutex<LogFile>,

    indexes: Mutex<Indexes>,

    /// Decoded stanzas by log offset.
    cache: Mutex<LruCache<u64, Stanza>>,
}

/// Durable storage backed by an append-only log.
///
/// Log reads, appends and fsyncs run on tokio's blocking pool; index-only
/// lookups are answered in place.
pub struct FileStorage {
    inner: Arc<FileInner>,
}

impl FileStorage {
    /// Open existing storage or create a new one.
    pub fn open_or_create(config: FileStorageConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(SyncError::NotInitialized)
        }
    }

    /// Create new storage.
    pub fn create(config: FileStorageConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        write_manifest(&config.path)?;
        let lock_file = acquire_lock(&config.path)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(config.path.join("sync.log"))?;
        file.write_all(LOG_MAGIC)?;
        file.write_all(&[LOG_VERSION])?;
        file.sync_all()?;

        Ok(Self::assemble(
            config,
            lock_file,
            file,
            LOG_HEADER_SIZE,
            Indexes::default(),
        ))
    }

    /// Open existing storage, replaying its log.
    pub fn open(config: FileStorageConfig) -> Result<Self> {
        verify_manifest(&config.path)?;
        let lock_file = acquire_lock(&config.path)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(config.path.join("sync.log"))?;
        verify_log_header(&mut file)?;

        let (indexes, end) = replay(&mut file)?;
        let len = file.metadata()?.len();
        if end < len {
            warn!(
                path = %config.path.display(),
                dropped_bytes = len - end,
                "truncating torn tail of storage log"
            );
            file.set_len(end)?;
            file.sync_all()?;
        }
        debug!(
            path = %config.path.display(),
            stanzas = indexes.stanzas.len(),
            "opened file storage"
        );

        Ok(Self::assemble(config, lock_file, file, end, indexes))
    }

    fn assemble(
        config: FileStorageConfig,
        lock_file: File,
        file: File,
        end: u64,
        indexes: Indexes,
    ) -> Self {
        let cache_size = NonZeroUsize::new(config.stanza_cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(FileInner {
                config,
                _lock_file: lock_file,
                log: Mutex::new(LogFile {
                    file,
                    end,
                    writes_since_sync: 0,
                }),
                indexes: Mutex::new(indexes),
                cache: Mutex::new(LruCache::new(cache_size)),
            }),
        }
    }

    /// Storage directory.
    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    /// Number of stored stanzas.
    pub fn stanza_count(&self) -> usize {
        self.inner.indexes.lock().stanzas.len()
    }

    /// Force pending writes to disk. Blocks the calling thread.
    pub fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    /// Run `op` against the log on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&FileInner) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| SyncError::Storage(format!("storage task failed: {}", e)))?
    }
}

impl FileInner {
    fn sync(&self) -> Result<()> {
        let mut log = self.log.lock();
        log.file.sync_all()?;
        log.writes_since_sync = 0;
        Ok(())
    }

    /// Append an entry; returns its offset.
    fn append(&self, entry: &LogEntry) -> Result<u64> {
        let encoded = rmp_serde::to_vec(entry)?;
        let mut log = self.log.lock();
        let offset = log.end;

        let mut frame = Vec::with_capacity(encoded.len() + 8);
        frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        frame.extend_from_slice(&encoded);
        frame.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());

        log.file.seek(SeekFrom::Start(offset))?;
        if let Err(e) = log.file.write_all(&frame) {
            // Drop whatever part of the frame made it out.
            let _ = log.file.set_len(offset);
            return Err(e.into());
        }
        log.end = offset + frame.len() as u64;

        log.writes_since_sync += 1;
        if log.writes_since_sync >= self.config.sync_interval.max(1) {
            log.file.sync_all()?;
            log.writes_since_sync = 0;
        }

        Ok(offset)
    }

    /// Append an entry and fold it into the indexes.
    fn record(&self, entry: LogEntry) -> Result<()> {
        let offset = self.append(&entry)?;
        self.indexes.lock().apply(offset, entry);
        Ok(())
    }

    fn read_stanza(&self, offset: u64) -> Result<Stanza> {
        if let Some(stanza) = self.cache.lock().get(&offset).cloned() {
            return Ok(stanza);
        }

        let entry = {
            let mut log = self.log.lock();
            log.file.seek(SeekFrom::Start(offset))?;
            read_entry(&mut log.file)?
        };

        match entry {
            LogEntry::Stanza(stanza) => {
                self.cache.lock().put(offset, stanza.clone());
                Ok(stanza)
            }
            other => Err(SyncError::Corruption(format!(
                "expected stanza at offset {}, found {:?}",
                offset, other
            ))),
        }
    }

    fn list_stanzas(&self, query: &StanzaQuery) -> Result<Vec<Stanza>> {
        let offsets: Vec<u64> = {
            let indexes = self.indexes.lock();
            query
                .select(&indexes.stanzas, |loc| loc.stanza_type)
                .into_iter()
                .map(|loc| loc.offset)
                .collect()
        };

        offsets
            .into_iter()
            .map(|offset| self.read_stanza(offset))
            .collect()
    }

    fn insert_stanza(&self, stanza: Stanza) -> Result<()> {
        let key = (stanza.stream.clone(), stanza.seq);
        if self.indexes.lock().stanzas.contains_key(&key) {
            return Ok(());
        }

        let stanza_type = stanza.stanza_type;
        let entry = LogEntry::Stanza(stanza);
        let offset = self.append(&entry)?;
        self.indexes
            .lock()
            .stanzas
            .insert(key, StanzaLocation { offset, stanza_type });
        if let LogEntry::Stanza(stanza) = entry {
            self.cache.lock().put(offset, stanza);
        }
        Ok(())
    }
}

impl Drop for FileInner {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

/// Replay all entries after the header. Returns the indexes and the end
/// of the last intact entry.
fn replay(file: &mut File) -> Result<(Indexes, u64)> {
    file.seek(SeekFrom::Start(LOG_HEADER_SIZE))?;
    let mut reader = BufReader::new(&mut *file);
    let mut indexes = Indexes::default();
    let mut offset = LOG_HEADER_SIZE;

    loop {
        match read_entry(&mut reader) {
            Ok(entry) => {
                let next = reader.stream_position()?;
                indexes.apply(offset, entry);
                offset = next;
            }
            Err(SyncError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e @ (SyncError::Corruption(_) | SyncError::ChecksumMismatch { .. })) => {
                warn!(offset, error = %e, "stopping log replay at damaged entry");
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok((indexes, offset))
}

fn read_entry(reader: &mut impl Read) -> Result<LogEntry> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_ENTRY_SIZE {
        return Err(SyncError::Corruption("log entry too large".into()));
    }

    let mut encoded = vec![0u8; len];
    reader.read_exact(&mut encoded)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let stored = u32::from_le_bytes(checksum_bytes);
    let computed = crc32fast::hash(&encoded);
    if stored != computed {
        return Err(SyncError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    rmp_serde::from_slice(&encoded)
        .map_err(|e| SyncError::Corruption(format!("undecodable log entry: {}", e)))
}

fn write_manifest(path: &Path) -> Result<()> {
    let mut file = File::create(path.join("MANIFEST"))?;
    file.write_all(STORE_MAGIC)?;
    file.write_all(&[STORE_VERSION])?;
    file.sync_all()?;
    Ok(())
}

fn verify_manifest(path: &Path) -> Result<()> {
    let mut file = File::open(path.join("MANIFEST"))?;

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != STORE_MAGIC {
        return Err(SyncError::InvalidFormat("Invalid storage magic".into()));
    }

    let mut version = [0u8; 1];
    file.read_exact(&mut version)?;
    if version[0] != STORE_VERSION {
        return Err(SyncError::InvalidFormat(format!(
            "Unsupported storage version: {}",
            version[0]
        )));
    }

    Ok(())
}

fn verify_log_header(file: &mut File) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != LOG_MAGIC {
        return Err(SyncError::InvalidFormat("Invalid log magic".into()));
    }

    let mut version = [0u8; 1];
    file.read_exact(&mut version)?;
    if version[0] != LOG_VERSION {
        return Err(SyncError::InvalidFormat(format!(
            "Unsupported log version: {}",
            version[0]
        )));
    }

    Ok(())
}

fn acquire_lock(path: &Path) -> Result<File> {
    let lock_file = File::create(path.join("LOCK"))?;
    lock_file
        .try_lock_exclusive()
        .map_err(|_| SyncError::Locked)?;
    Ok(lock_file)
}

#[async_trait]
impl Storage for FileStorage {
    async fn list_stanzas(&self, query: &StanzaQuery) -> Result<Vec<Stanza>> {
        let query = query.clone();
        self.blocking(move |inner| inner.list_stanzas(&query)).await
    }

    async fn insert_stanza(&self, stanza: &Stanza) -> Result<()> {
        let stanza = stanza.clone();
        self.blocking(move |inner| inner.insert_stanza(stanza)).await
    }

    async fn get_checkpoint(&self, key: &str, stream: &StreamName) -> Result<Option<Seq>> {
        Ok(self
            .inner
            .indexes
            .lock()
            .checkpoints
            .get(&(key.to_string(), stream.clone()))
            .copied())
    }

    async fn set_checkpoint(&self, key: &str, stream: &StreamName, seq: Seq) -> Result<()> {
        let entry = LogEntry::Checkpoint {
            key: key.to_string(),
            stream: stream.clone(),
            seq,
        };
        self.blocking(move |inner| inner.record(entry)).await
    }

    async fn get_high_water_mark(&self, stream: &StreamName) -> Result<Option<Seq>> {
        Ok(self.inner.indexes.lock().high_water_marks.get(stream).copied())
    }

    async fn set_high_water_mark(&self, stream: &StreamName, seq: Seq) -> Result<()> {
        let current = self.inner.indexes.lock().high_water_marks.get(stream).copied();
        if current.map_or(false, |current| current >= seq) {
            return Ok(());
        }

        let entry = LogEntry::HighWaterMark {
            stream: stream.clone(),
            seq,
        };
        self.blocking(move |inner| inner.record(entry)).await
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        Ok(self.inner.indexes.lock().subscriptions.values().cloned().collect())
    }

    async fn put_subscription(&self, subscription: &Subscription) -> Result<()> {
        let entry = LogEntry::Subscribe(subscription.clone());
        self.blocking(move |inner| inner.record(entry)).await
    }

    async fn delete_subscription(&self, stream: &StreamName) -> Result<()> {
        if !self.inner.indexes.lock().subscriptions.contains_key(stream) {
            return Ok(());
        }
        let entry = LogEntry::Unsubscribe {
            stream: stream.clone(),
        };
        self.blocking(move |inner| inner.record(entry)).await
    }
}
