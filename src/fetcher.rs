//! Contiguous stanza runs from local storage, backfilled from the network.
//!
//! The fetcher answers "stanzas of stream S from seq N" with a run that is
//! verified gap-free: each stanza either directly follows the previous seq
//! or names, through `prev_seq`, a predecessor already covered. Local
//! storage is consulted first; a gap, an empty result, or a short run that
//! the high-water mark says can be extended falls back to a network range
//! fetch whose results are written back to storage.
//!
//! All network fills and push writes for one stream are serialized through
//! that stream's high-water-mark [`Chain`], so two gap fetches for the same
//! stream never run at once.

use crate::auth::Authenticator;
use crate::chain::{Chain, ErrorSink};
use crate::error::{Result, SyncError};
use crate::storage::{StanzaQuery, Storage};
use crate::transport::{stanzas_url, Method, RangeReply, RangeRequest, Transport};
use crate::types::{Seq, Stanza, StreamName};
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Highest seq believed to exist upstream for a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HighWaterMark {
    /// Never decreases.
    pub seq: Seq,
    /// Whether the network has vouched for `seq` since the last reconnect.
    /// Unconfirmed marks never short-circuit a network fetch.
    pub confirmed: bool,
}

/// Result of [`StanzaFetcher::fetch_stanzas`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FetchBatch {
    /// Verified contiguous run starting at the requested seq.
    pub stanzas: Vec<Stanza>,
    /// A gap cut the run short; more data exists past it and the caller
    /// should fetch again from the end of this run.
    pub gap_pending: bool,
    /// The network served the missing stanzas but none passed
    /// verification. Readers continue after this seq instead of waiting
    /// for the hole to fill.
    pub resync_to: Option<Seq>,
}

/// Events on the fetcher's live channel.
#[derive(Clone, Debug)]
pub enum LiveEvent {
    /// An authenticated, persisted push.
    Stanza(Stanza),
    /// Pushes may have been lost (reconnect); readers should backfill.
    Resync,
}

/// Length of the gap-free prefix of `stanzas` following `after`, and the
/// seq it ends at.
pub fn contiguous_prefix(stanzas: &[Stanza], after: Seq) -> (usize, Seq) {
    let mut expected = after;
    for (i, stanza) in stanzas.iter().enumerate() {
        if !stanza.follows(expected) {
            return (i, expected);
        }
        expected = stanza.seq;
    }
    (stanzas.len(), expected)
}

/// Resolves stanza ranges and tracks per-stream high-water marks.
pub struct StanzaFetcher {
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    auth: Arc<dyn Authenticator>,
    marks: Chain<StreamName, HighWaterMark>,
    live: broadcast::Sender<LiveEvent>,
}

impl StanzaFetcher {
    pub fn new(
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        auth: Arc<dyn Authenticator>,
        live_capacity: usize,
        sink: ErrorSink,
    ) -> Self {
        let loader = Arc::clone(&storage);
        let marks = Chain::new(
            "high_water_mark",
            move |stream: StreamName| {
                let storage = Arc::clone(&loader);
                async move {
                    let seq = storage.get_high_water_mark(&stream).await?;
                    Ok(HighWaterMark {
                        seq: seq.unwrap_or_default(),
                        confirmed: false,
                    })
                }
            },
            sink,
        );
        let (live, _) = broadcast::channel(live_capacity.max(1));

        Self {
            storage,
            transport,
            auth,
            marks,
            live,
        }
    }

    /// Receiver for pushes accepted after this call.
    pub fn subscribe_live(&self) -> broadcast::Receiver<LiveEvent> {
        self.live.subscribe()
    }

    /// A gap-free run of at most `limit` stanzas starting at `seq_start`.
    pub async fn fetch_stanzas(
        &self,
        stream: &StreamName,
        seq_start: Seq,
        limit: usize,
    ) -> Result<FetchBatch> {
        let after = seq_start
            .prev()
            .ok_or_else(|| SyncError::InvalidArgument("seq_start must be at least 1".into()))?;
        if limit == 0 {
            return Ok(FetchBatch::default());
        }

        let mut local = self.list_local(stream, seq_start, limit).await?;
        let (verified, last) = contiguous_prefix(&local, after);
        if verified == limit {
            return Ok(FetchBatch {
                stanzas: local,
                ..Default::default()
            });
        }
        if verified == local.len() {
            if let Some(mark) = self.marks.peek(stream) {
                if mark.confirmed && mark.seq <= last {
                    return Ok(FetchBatch {
                        stanzas: local,
                        ..Default::default()
                    });
                }
            }
        } else {
            local.truncate(verified);
            debug!(
                %stream,
                expected_after = %last,
                "gap in local stanzas, filling from network"
            );
        }

        self.fill_from_network(stream.clone(), seq_start, limit).await
    }

    /// Fetch the range past the verified local prefix from the network,
    /// inside the stream's high-water-mark chain.
    fn fill_from_network(
        &self,
        stream: StreamName,
        seq_start: Seq,
        limit: usize,
    ) -> impl Future<Output = Result<FetchBatch>> + Send + 'static {
        let storage = Arc::clone(&self.storage);
        let transport = Arc::clone(&self.transport);
        let auth = Arc::clone(&self.auth);
        let after = Seq(seq_start.0 - 1);

        self.marks.next_with(stream.clone(), move |mark| async move {
            // Another fill may have covered the range while this one queued.
            let mut local = storage
                .list_stanzas(&StanzaQuery::stream(stream.clone()).from_seq(seq_start).limit(limit))
                .await?;
            let (verified, last) = contiguous_prefix(&local, after);
            if verified == limit
                || (verified == local.len() && mark.confirmed && mark.seq <= last)
            {
                local.truncate(verified);
                return Ok((mark, FetchBatch { stanzas: local, ..Default::default() }));
            }
            local.truncate(verified);

            let request = RangeRequest {
                seq_start: Some(last.next()),
                limit: limit - verified,
                reverse: false,
            };
            let reply = request_range(&*transport, &*auth, &stream, &request).await?;
            let RangeFill { stanzas: fetched, received, rejected } = reply;
            let fetched: Vec<Stanza> = fetched.into_iter().filter(|s| s.seq > last).collect();

            for stanza in &fetched {
                storage.insert_stanza(stanza).await?;
            }

            let mut next = mark;
            if let Some(top) = fetched.iter().map(|s| s.seq).max() {
                if top > mark.seq {
                    storage.set_high_water_mark(&stream, top).await?;
                    next.seq = top;
                }
            }
            // A full reply may have been cut off by the limit.
            next.confirmed = received < request.limit || (mark.confirmed && next.seq == mark.seq);

            local.extend(fetched);
            let (verified, end) = contiguous_prefix(&local, after);
            let mut gap_pending = false;
            let mut resync_to = None;
            if let Some(after_gap) = local.get(verified) {
                let gap = SyncError::Consistency {
                    stream: stream.clone(),
                    expected: end,
                    got: after_gap.seq,
                };
                // The hole was served and then dropped; refetching cannot fill it.
                if rejected.iter().any(|seq| *seq > end && *seq < after_gap.seq) {
                    warn!(
                        error = %gap,
                        resync_to = %after_gap.prev_seq,
                        "skipping unverifiable stanzas"
                    );
                    resync_to = Some(after_gap.prev_seq);
                } else {
                    warn!(error = %gap, "network reply still has a gap");
                    gap_pending = true;
                }
            }
            local.truncate(verified);

            Ok((
                next,
                FetchBatch {
                    stanzas: local,
                    gap_pending,
                    resync_to,
                },
            ))
        })
    }

    /// The newest `limit` stanzas of a stream, oldest first. Seeds and
    /// confirms the high-water mark.
    pub async fn fetch_most_recent_stanzas(
        &self,
        stream: &StreamName,
        limit: usize,
    ) -> Result<Vec<Stanza>> {
        let storage = Arc::clone(&self.storage);
        let transport = Arc::clone(&self.transport);
        let auth = Arc::clone(&self.auth);
        let key = stream.clone();

        self.marks
            .next_with(stream.clone(), move |mark| async move {
                let request = RangeRequest {
                    seq_start: None,
                    limit,
                    reverse: true,
                };
                let mut fetched = request_range(&*transport, &*auth, &key, &request).await?.stanzas;
                fetched.sort_by_key(|s| s.seq);

                for stanza in &fetched {
                    storage.insert_stanza(stanza).await?;
                }

                let mut next = HighWaterMark {
                    seq: mark.seq,
                    confirmed: true,
                };
                if let Some(top) = fetched.last().map(|s| s.seq) {
                    if top > mark.seq {
                        storage.set_high_water_mark(&key, top).await?;
                        next.seq = top;
                    }
                }
                Ok((next, fetched))
            })
            .await
    }

    /// Current high-water mark (after queued updates settle).
    pub async fn high_water_mark(&self, stream: &StreamName) -> Result<HighWaterMark> {
        self.marks.get(stream.clone()).await
    }

    /// Last settled high-water mark, if the stream has been touched.
    pub fn peek_high_water_mark(&self, stream: &StreamName) -> Option<HighWaterMark> {
        self.marks.peek(stream)
    }

    /// Serially update a stream's high-water mark. The result never goes
    /// below the current seq.
    pub fn queue_with_high_water_mark<F, Fut>(
        &self,
        stream: &StreamName,
        op: F,
    ) -> impl Future<Output = Result<HighWaterMark>> + Send + 'static
    where
        F: FnOnce(HighWaterMark) -> Fut + Send + 'static,
        Fut: Future<Output = Result<HighWaterMark>> + Send + 'static,
    {
        self.marks.next(stream.clone(), move |mark| async move {
            let next = op(mark).await?;
            Ok(HighWaterMark {
                seq: next.seq.max(mark.seq),
                confirmed: next.confirmed,
            })
        })
    }

    /// Accept a pushed stanza: authenticate, persist, advance the mark and
    /// publish it to live readers, in per-stream order.
    pub fn accept_push(&self, stanza: Stanza) -> impl Future<Output = Result<()>> + Send + 'static {
        let verified = self.auth.verify(&stanza);
        let storage = Arc::clone(&self.storage);
        let live = self.live.clone();
        let stream = stanza.stream.clone();

        let write = verified.map(|()| {
            self.marks.next(stream.clone(), move |mark| async move {
                storage.insert_stanza(&stanza).await?;
                let mut next = mark;
                if stanza.seq > mark.seq {
                    storage.set_high_water_mark(&stanza.stream, stanza.seq).await?;
                    next.seq = stanza.seq;
                }
                let _ = live.send(LiveEvent::Stanza(stanza));
                Ok(next)
            })
        });

        async move {
            match write {
                Ok(write) => write.await.map(|_| ()),
                Err(e) => {
                    warn!(%stream, error = %e, "dropping unauthenticated push");
                    Err(e)
                }
            }
        }
    }

    /// Mark every known high-water mark unconfirmed and tell live readers to
    /// backfill. Called when the transport reconnects.
    pub async fn invalidate_high_water_marks(&self) {
        let pending = self.marks.keys().into_iter().map(|stream| {
            self.marks.next(stream, |mark| async move {
                Ok(HighWaterMark {
                    confirmed: false,
                    ..mark
                })
            })
        });
        for result in join_all(pending).await {
            if let Err(e) = result {
                warn!(error = %e, "failed to invalidate high-water mark");
            }
        }
        let _ = self.live.send(LiveEvent::Resync);
    }

    async fn list_local(
        &self,
        stream: &StreamName,
        seq_start: Seq,
        limit: usize,
    ) -> Result<Vec<Stanza>> {
        self.storage
            .list_stanzas(&StanzaQuery::stream(stream.clone()).from_seq(seq_start).limit(limit))
            .await
    }
}

/// A range reply after filtering.
struct RangeFill {
    /// Authentic stanzas of the requested stream.
    stanzas: Vec<Stanza>,
    /// Stanzas in the reply before filtering.
    received: usize,
    /// Seqs of the requested stream that failed verification.
    rejected: Vec<Seq>,
}

/// Issue a range request and keep only authentic stanzas of `stream`.
async fn request_range(
    transport: &dyn Transport,
    auth: &dyn Authenticator,
    stream: &StreamName,
    request: &RangeRequest,
) -> Result<RangeFill> {
    let reply = transport
        .request(Method::Get, &stanzas_url(stream), serde_json::to_value(request)?)
        .await?;
    let reply: RangeReply = serde_json::from_value(reply)
        .map_err(|e| SyncError::Transport(format!("malformed range reply: {}", e)))?;

    let received = reply.stanzas.len();
    let mut rejected = Vec::new();
    let stanzas = reply
        .stanzas
        .into_iter()
        .filter(|stanza| {
            if &stanza.stream != stream {
                warn!(%stream, other = %stanza.stream, "dropping stanza for another stream");
                return false;
            }
            match auth.verify(stanza) {
                Ok(()) => true,
                Err(e) => {
                    warn!(%stream, seq = %stanza.seq, error = %e, "dropping unauthenticated stanza");
                    rejected.push(stanza.seq);
                    false
                }
            }
        })
        .collect();
    Ok(RangeFill {
        stanzas,
        received,
        rejected,
    })
}
