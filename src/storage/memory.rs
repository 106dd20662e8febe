//! In-memory storage.

use super::{StanzaQuery, Storage};
use crate::error::{Result, SyncError};
use crate::types::{Seq, Stanza, StreamName, Subscription};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Default)]
struct MemoryState {
    stanzas: BTreeMap<(StreamName, Seq), Stanza>,
    checkpoints: HashMap<(String, StreamName), Seq>,
    high_water_marks: HashMap<StreamName, Seq>,
    subscriptions: BTreeMap<StreamName, Subscription>,
}

/// Storage held entirely in memory.
///
/// Writes can be made to fail on demand, and checkpoint writes are counted,
/// which makes this the storage of choice for exercising failure paths.
#[derive(Default)]
pub struct MemoryStorage {
    state: RwLock<MemoryState>,
    fail_writes: AtomicBool,
    checkpoint_writes: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `SyncError::Storage` (or stop doing so).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `set_checkpoint` calls.
    pub fn checkpoint_writes(&self) -> u64 {
        self.checkpoint_writes.load(Ordering::SeqCst)
    }

    /// Number of stored stanzas.
    pub fn stanza_count(&self) -> usize {
        self.state.read().stanzas.len()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(SyncError::Storage("writes disabled".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn list_stanzas(&self, query: &StanzaQuery) -> Result<Vec<Stanza>> {
        let state = self.state.read();
        Ok(query
            .select(&state.stanzas, |s| s.stanza_type)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn insert_stanza(&self, stanza: &Stanza) -> Result<()> {
        self.check_writable()?;
        self.state
            .write()
            .stanzas
            .entry((stanza.stream.clone(), stanza.seq))
            .or_insert_with(|| stanza.clone());
        Ok(())
    }

    async fn get_checkpoint(&self, key: &str, stream: &StreamName) -> Result<Option<Seq>> {
        Ok(self
            .state
            .read()
            .checkpoints
            .get(&(key.to_string(), stream.clone()))
            .copied())
    }

    async fn set_checkpoint(&self, key: &str, stream: &StreamName, seq: Seq) -> Result<()> {
        self.check_writable()?;
        self.state
            .write()
            .checkpoints
            .insert((key.to_string(), stream.clone()), seq);
        self.checkpoint_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_high_water_mark(&self, stream: &StreamName) -> Result<Option<Seq>> {
        Ok(self.state.read().high_water_marks.get(stream).copied())
    }

    async fn set_high_water_mark(&self, stream: &StreamName, seq: Seq) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.write();
        let mark = state.high_water_marks.entry(stream.clone()).or_default();
        *mark = (*mark).max(seq);
        Ok(())
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        Ok(self.state.read().subscriptions.values().cloned().collect())
    }

    async fn put_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.check_writable()?;
        self.state
            .write()
            .subscriptions
            .insert(subscription.stream.clone(), subscription.clone());
        Ok(())
    }

    async fn delete_subscription(&self, stream: &StreamName) -> Result<()> {
        self.check_writable()?;
        self.state.write().subscriptions.remove(stream);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StanzaType, Timestamp};

    fn stanza(stream: &StreamName, seq: u64) -> Stanza {
        Stanza {
            stanza_type: StanzaType::Message,
            stream: stream.clone(),
            seq: Seq(seq),
            prev_seq: Seq(seq - 1),
            updated_at: Timestamp(seq as i64),
            synced_at: Timestamp(seq as i64),
            payload: serde_json::json!({ "n": seq }),
            signature: String::new(),
        }
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let storage = MemoryStorage::new();
        let stream = StreamName::new("friend").unwrap();

        storage.insert_stanza(&stanza(&stream, 1)).await.unwrap();
        let mut changed = stanza(&stream, 1);
        changed.payload = serde_json::json!({ "n": "other" });
        storage.insert_stanza(&changed).await.unwrap();

        let listed = storage
            .list_stanzas(&StanzaQuery::stream(stream))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].payload["n"], 1);
    }

    #[tokio::test]
    async fn test_failed_writes_leave_state_untouched() {
        let storage = MemoryStorage::new();
        let stream = StreamName::new("friend").unwrap();

        storage.set_checkpoint("k", &stream, Seq(2)).await.unwrap();
        storage.set_fail_writes(true);
        assert!(storage.set_checkpoint("k", &stream, Seq(3)).await.is_err());
        assert!(storage.insert_stanza(&stanza(&stream, 1)).await.is_err());

        assert_eq!(storage.get_checkpoint("k", &stream).await.unwrap(), Some(Seq(2)));
        assert_eq!(storage.checkpoint_writes(), 1);
        assert_eq!(storage.stanza_count(), 0);
    }

    #[tokio::test]
    async fn test_high_water_mark_never_decreases() {
        let storage = MemoryStorage::new();
        let stream = StreamName::new("friend").unwrap();

        storage.set_high_water_mark(&stream, Seq(5)).await.unwrap();
        storage.set_high_water_mark(&stream, Seq(3)).await.unwrap();
        assert_eq!(storage.get_high_water_mark(&stream).await.unwrap(), Some(Seq(5)));
    }
}
