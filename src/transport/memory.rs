//! In-process interchange and transport.
//!
//! [`MemoryInterchange`] plays the server: it assigns seqs, links them with
//! `prev_seq`, stamps `synced_at`, signs stanzas with the digest scheme and
//! pushes them to connected clients. [`MemoryTransport`] is one client's
//! connection to it, with knobs for disconnects, latency and failures.

use super::{
    parse_stanzas_url, Method, RangeReply, RangeRequest, Transport, TransportEvent,
};
use crate::auth::DigestAuthenticator;
use crate::error::{Result, SyncError};
use crate::types::{Seq, Stanza, StanzaInput, StanzaType, StreamName, Timestamp};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

/// Capacity of each client's event channel.
const EVENT_CHANNEL_CAP: usize = 1024;

#[derive(Default)]
struct InterchangeState {
    streams: HashMap<StreamName, Vec<Stanza>>,
    /// Source of `synced_at` values; strictly increasing.
    clock: i64,
    latency: HashMap<StreamName, Duration>,
    clients: Vec<Weak<MemoryTransport>>,
}

impl InterchangeState {
    fn live_clients(&mut self) -> Vec<Arc<MemoryTransport>> {
        self.clients.retain(|client| client.strong_count() > 0);
        self.clients.iter().filter_map(Weak::upgrade).collect()
    }
}

/// An interchange living in this process.
#[derive(Clone, Default)]
pub struct MemoryInterchange {
    state: Arc<Mutex<InterchangeState>>,
}

impl MemoryInterchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connected client transport.
    pub fn client(&self) -> Arc<MemoryTransport> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        let client = Arc::new(MemoryTransport {
            interchange: self.clone(),
            events,
            connected: AtomicBool::new(true),
            fail_requests: AtomicBool::new(false),
            requests: AtomicU64::new(0),
            types: Mutex::new(None),
        });
        self.state.lock().clients.push(Arc::downgrade(&client));
        client
    }

    /// Append a stanza to its stream and push it to connected clients.
    pub fn post(&self, input: StanzaInput) -> Stanza {
        self.post_inner(input, None)
    }

    /// Like [`MemoryInterchange::post`], but with an explicit seq, leaving a
    /// hole in the numbering that `prev_seq` bridges.
    pub fn post_at(&self, input: StanzaInput, seq: Seq) -> Stanza {
        self.post_inner(input, Some(seq))
    }

    fn post_inner(&self, input: StanzaInput, seq: Option<Seq>) -> Stanza {
        let (stanza, clients) = {
            let mut state = self.state.lock();
            state.clock += 1;
            let synced_at = Timestamp(state.clock);

            let log = state.streams.entry(input.stream.clone()).or_default();
            let prev_seq = log.last().map(|s| s.seq).unwrap_or(Seq::ZERO);
            let seq = seq.filter(|seq| *seq > prev_seq).unwrap_or(prev_seq.next());

            let mut stanza = Stanza {
                stanza_type: input.stanza_type,
                stream: input.stream,
                seq,
                prev_seq,
                updated_at: input.updated_at,
                synced_at,
                payload: input.payload,
                signature: String::new(),
            };
            if let Err(e) = DigestAuthenticator::sign(&mut stanza) {
                warn!(error = %e, "failed to sign stanza");
            }
            log.push(stanza.clone());

            (stanza, state.live_clients())
        };

        for client in clients {
            client.push(&stanza);
        }
        stanza
    }

    /// Register an empty stream so fetches on it succeed before any post.
    pub fn create_stream(&self, stream: &StreamName) {
        self.state.lock().streams.entry(stream.clone()).or_default();
    }

    /// Push a stanza to connected clients without storing it (duplicates,
    /// reordering, forged stanzas).
    pub fn push_raw(&self, stanza: Stanza) {
        let clients = self.state.lock().live_clients();
        for client in clients {
            client.push(&stanza);
        }
    }

    /// Delay replies to fetches on `stream`.
    pub fn set_latency(&self, stream: &StreamName, latency: Duration) {
        self.state.lock().latency.insert(stream.clone(), latency);
    }

    /// All stanzas posted to a stream.
    pub fn stanzas(&self, stream: &StreamName) -> Vec<Stanza> {
        self.state
            .lock()
            .streams
            .get(stream)
            .cloned()
            .unwrap_or_default()
    }

    fn latency(&self, stream: &StreamName) -> Option<Duration> {
        self.state.lock().latency.get(stream).copied()
    }

    fn range(&self, stream: &StreamName, request: &RangeRequest) -> Result<Vec<Stanza>> {
        let state = self.state.lock();
        let log = state
            .streams
            .get(stream)
            .ok_or_else(|| SyncError::NotFound(stream.to_string()))?;

        let stanzas = if request.reverse {
            log.iter().rev().take(request.limit).cloned().collect()
        } else {
            let start = request.seq_start.unwrap_or(Seq(1));
            log.iter()
                .filter(|s| s.seq >= start)
                .take(request.limit)
                .cloned()
                .collect()
        };
        Ok(stanzas)
    }
}

/// A client connection to a [`MemoryInterchange`].
pub struct MemoryTransport {
    interchange: MemoryInterchange,
    events: broadcast::Sender<TransportEvent>,
    connected: AtomicBool,
    fail_requests: AtomicBool,
    requests: AtomicU64,
    /// Types this client asked pushes for (None = all).
    types: Mutex<Option<HashSet<StanzaType>>>,
}

impl MemoryTransport {
    /// Drop the connection: requests fail and pushes are lost until reconnect.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Disconnected);
        }
    }

    pub fn reconnect(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Reconnected);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Make requests fail with a transport error while connected.
    pub fn set_fail_requests(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::SeqCst);
    }

    /// Requests issued so far, including failed ones.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    fn push(&self, stanza: &Stanza) {
        if !self.is_connected() {
            return;
        }
        let wanted = self
            .types
            .lock()
            .as_ref()
            .map_or(true, |types| types.contains(&stanza.stanza_type));
        if wanted {
            let _ = self.events.send(TransportEvent::Stanza(stanza.clone()));
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn request(
        &self,
        method: Method,
        url: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() {
            return Err(SyncError::Transport("not connected".into()));
        }
        if method != Method::Get {
            return Err(SyncError::Transport(format!("unsupported method {:?}", method)));
        }
        let stream = parse_stanzas_url(url)
            .ok_or_else(|| SyncError::NotFound(url.to_string()))?;
        let request: RangeRequest = serde_json::from_value(payload)
            .map_err(|e| SyncError::Transport(format!("bad request payload: {}", e)))?;

        if let Some(latency) = self.interchange.latency(&stream) {
            tokio::time::sleep(latency).await;
        }
        // Checked after the delay so a drop during the request fails it.
        if !self.is_connected() || self.fail_requests.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("request failed".into()));
        }

        let reply = RangeReply {
            stanzas: self.interchange.range(&stream, &request)?,
        };
        Ok(serde_json::to_value(reply)?)
    }

    async fn subscribe_types(&self, types: &[StanzaType]) -> Result<()> {
        *self.types.lock() = Some(types.iter().copied().collect());
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::stanzas_url;

    fn friend() -> StreamName {
        StreamName::new("friend").unwrap()
    }

    #[tokio::test]
    async fn test_post_links_and_pushes() {
        let interchange = MemoryInterchange::new();
        let client = interchange.client();
        let mut events = client.events();

        let first = interchange.post(StanzaInput::message(friend(), serde_json::json!("a")));
        let second = interchange.post_at(
            StanzaInput::message(friend(), serde_json::json!("b")),
            Seq(5),
        );

        assert_eq!((first.seq, first.prev_seq), (Seq(1), Seq(0)));
        assert_eq!((second.seq, second.prev_seq), (Seq(5), Seq(1)));
        assert!(second.synced_at > first.synced_at);

        match events.recv().await.unwrap() {
            TransportEvent::Stanza(s) => assert_eq!(s.seq, Seq(1)),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_range_and_reverse_requests() {
        let interchange = MemoryInterchange::new();
        let client = interchange.client();
        for i in 0..5 {
            interchange.post(StanzaInput::message(friend(), serde_json::json!(i)));
        }

        let forward = client
            .request(
                Method::Get,
                &stanzas_url(&friend()),
                serde_json::json!({ "seqStart": 3, "limit": 10 }),
            )
            .await
            .unwrap();
        let forward: RangeReply = serde_json::from_value(forward).unwrap();
        assert_eq!(forward.stanzas.len(), 3);

        let newest = client
            .request(
                Method::Get,
                &stanzas_url(&friend()),
                serde_json::json!({ "limit": 2, "reverse": true }),
            )
            .await
            .unwrap();
        let newest: RangeReply = serde_json::from_value(newest).unwrap();
        assert_eq!(newest.stanzas[0].seq, Seq(5));
        assert_eq!(newest.stanzas[1].seq, Seq(4));
    }

    #[tokio::test]
    async fn test_disconnected_client_fails_and_misses_pushes() {
        let interchange = MemoryInterchange::new();
        let client = interchange.client();
        let mut events = client.events();

        client.disconnect();
        interchange.post(StanzaInput::message(friend(), serde_json::json!("missed")));

        let result = client
            .request(
                Method::Get,
                &stanzas_url(&friend()),
                serde_json::json!({ "seqStart": 1, "limit": 10 }),
            )
            .await;
        assert!(matches!(result, Err(SyncError::Transport(_))));

        client.reconnect();
        assert!(matches!(events.recv().await.unwrap(), TransportEvent::Disconnected));
        assert!(matches!(events.recv().await.unwrap(), TransportEvent::Reconnected));
    }

    #[tokio::test]
    async fn test_unknown_stream_is_not_found() {
        let interchange = MemoryInterchange::new();
        let client = interchange.client();

        let result = client
            .request(
                Method::Get,
                &stanzas_url(&StreamName::new("nobody").unwrap()),
                serde_json::json!({ "seqStart": 1, "limit": 10 }),
            )
            .await;
        assert!(matches!(result, Err(SyncError::NotFound(_))));
    }
}
