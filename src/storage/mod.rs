//! Local storage for stanzas, checkpoints and subscriptions.
//!
//! The engine only talks to storage through the [`Storage`] trait. Two
//! implementations ship with the crate:
//! - [`MemoryStorage`]: everything in memory, for tests and ephemeral clients
//! - [`FileStorage`]: an append-only, checksummed log replayed on open

mod file;
mod memory;

pub use file::{FileStorage, FileStorageConfig};
pub use memory::MemoryStorage;

use crate::error::Result;
use crate::types::{Seq, Stanza, StanzaType, StreamName, Subscription};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Selection of stored stanzas.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StanzaQuery {
    /// Restrict to one stream (None = all streams, ordered by stream then seq).
    pub stream: Option<StreamName>,

    /// Restrict to one stanza type.
    pub stanza_type: Option<StanzaType>,

    /// Lowest seq to return (inclusive).
    pub seq_start: Option<Seq>,

    /// Highest seq to return (inclusive).
    pub seq_limit: Option<Seq>,

    /// Max stanzas to return.
    pub limit: Option<usize>,

    /// Return highest seq first.
    pub reverse: bool,
}

impl StanzaQuery {
    /// All stanzas of one stream.
    pub fn stream(stream: StreamName) -> Self {
        Self {
            stream: Some(stream),
            ..Default::default()
        }
    }

    pub fn from_seq(mut self, seq: Seq) -> Self {
        self.seq_start = Some(seq);
        self
    }

    pub fn until_seq(mut self, seq: Seq) -> Self {
        self.seq_limit = Some(seq);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn of_type(mut self, stanza_type: StanzaType) -> Self {
        self.stanza_type = Some(stanza_type);
        self
    }

    fn matches(&self, seq: Seq, stanza_type: StanzaType) -> bool {
        self.seq_start.map_or(true, |start| seq >= start)
            && self.seq_limit.map_or(true, |limit| seq <= limit)
            && self.stanza_type.map_or(true, |t| t == stanza_type)
    }

    /// Apply this query to a map keyed by (stream, seq).
    pub(crate) fn select<'a, T>(
        &self,
        map: &'a BTreeMap<(StreamName, Seq), T>,
        type_of: impl Fn(&T) -> StanzaType,
    ) -> Vec<&'a T> {
        let limit = self.limit.unwrap_or(usize::MAX);
        if limit == 0 {
            return Vec::new();
        }

        let entries: Box<dyn DoubleEndedIterator<Item = (&'a (StreamName, Seq), &'a T)> + 'a> =
            match &self.stream {
                Some(stream) => {
                    let start = self.seq_start.unwrap_or(Seq::ZERO);
                    let end = self.seq_limit.unwrap_or(Seq(u64::MAX));
                    if start > end {
                        return Vec::new();
                    }
                    Box::new(map.range((stream.clone(), start)..=(stream.clone(), end)))
                }
                None => Box::new(map.iter()),
            };

        let matching = |((_, seq), value): &(&'a (StreamName, Seq), &'a T)| {
            self.matches(*seq, type_of(value))
        };

        if self.reverse {
            entries.rev().filter(matching).take(limit).map(|(_, v)| v).collect()
        } else {
            entries.filter(matching).take(limit).map(|(_, v)| v).collect()
        }
    }
}

/// Durable local state consumed by the sync engine.
///
/// Implementations must make `insert_stanza` idempotent per (stream, seq).
#[async_trait]
pub trait Storage: Send + Sync {
    /// List stanzas matching `query`.
    async fn list_stanzas(&self, query: &StanzaQuery) -> Result<Vec<Stanza>>;

    /// Store a stanza. Storing an already-present (stream, seq) is a no-op.
    async fn insert_stanza(&self, stanza: &Stanza) -> Result<()>;

    /// Read a consumer's checkpoint for a stream.
    async fn get_checkpoint(&self, key: &str, stream: &StreamName) -> Result<Option<Seq>>;

    /// Record a consumer's checkpoint for a stream.
    async fn set_checkpoint(&self, key: &str, stream: &StreamName, seq: Seq) -> Result<()>;

    /// Read the persisted high-water mark for a stream.
    async fn get_high_water_mark(&self, _stream: &StreamName) -> Result<Option<Seq>> {
        Ok(None)
    }

    /// Persist the high-water mark for a stream.
    async fn set_high_water_mark(&self, _stream: &StreamName, _seq: Seq) -> Result<()> {
        Ok(())
    }

    /// All persisted subscriptions.
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        Ok(Vec::new())
    }

    /// Persist a subscription (replacing any for the same stream).
    async fn put_subscription(&self, _subscription: &Subscription) -> Result<()> {
        Ok(())
    }

    /// Forget a subscription.
    async fn delete_subscription(&self, _stream: &StreamName) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> BTreeMap<(StreamName, Seq), StanzaType> {
        let a = StreamName::new("a").unwrap();
        let b = StreamName::new("b").unwrap();
        let mut map = BTreeMap::new();
        for seq in 1..=5 {
            let t = if seq % 2 == 0 {
                StanzaType::Vote
            } else {
                StanzaType::Message
            };
            map.insert((a.clone(), Seq(seq)), t);
            map.insert((b.clone(), Seq(seq)), t);
        }
        map
    }

    #[test]
    fn test_select_range_and_limit() {
        let map = map();
        let query = StanzaQuery::stream(StreamName::new("a").unwrap())
            .from_seq(Seq(2))
            .until_seq(Seq(4));
        assert_eq!(query.select(&map, |t| *t).len(), 3);

        let limited = query.clone().limit(2);
        assert_eq!(limited.select(&map, |t| *t).len(), 2);
    }

    #[test]
    fn test_select_type_and_reverse() {
        let map = map();
        let votes = StanzaQuery::stream(StreamName::new("b").unwrap()).of_type(StanzaType::Vote);
        assert_eq!(votes.select(&map, |t| *t).len(), 2);

        let all = StanzaQuery::default().reverse().limit(3);
        assert_eq!(all.select(&map, |t| *t).len(), 3);
    }

    #[test]
    fn test_select_inverted_range_is_empty() {
        let map = map();
        let query = StanzaQuery::stream(StreamName::new("a").unwrap())
            .from_seq(Seq(4))
            .until_seq(Seq(2));
        assert!(query.select(&map, |t| *t).is_empty());
    }
}
