//! Transport to interchanges.
//!
//! The engine needs two things from the network: request/response calls for
//! backfill, and a live event channel carrying pushed stanzas plus
//! connection lifecycle changes.
//!
//! Range fetches use the URL `streams/<stream>/stanzas` with a
//! [`RangeRequest`] JSON payload and expect a [`RangeReply`] back.

mod memory;

pub use memory::{MemoryInterchange, MemoryTransport};

use crate::error::Result;
use crate::types::{Seq, Stanza, StanzaType, StreamName};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Request method.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

/// Events from the live side of a transport.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    /// Connection restored after a drop; pushes may have been missed.
    Reconnected,
    /// A pushed stanza (not yet authenticated).
    Stanza(Stanza),
}

/// Connection to one or more interchanges.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a request and wait for its reply.
    async fn request(
        &self,
        method: Method,
        url: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value>;

    /// Ask for live pushes of these stanza types.
    async fn subscribe_types(&self, types: &[StanzaType]) -> Result<()>;

    /// Receiver for live events. Each call returns an independent receiver.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Payload of a range fetch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeRequest {
    /// First seq wanted (ignored for reverse fetches).
    pub seq_start: Option<Seq>,
    pub limit: usize,
    /// Newest first, starting from the end of the stream.
    #[serde(default)]
    pub reverse: bool,
}

/// Reply to a range fetch.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RangeReply {
    pub stanzas: Vec<Stanza>,
}

/// URL for range fetches on a stream.
pub fn stanzas_url(stream: &StreamName) -> String {
    format!("streams/{}/stanzas", stream)
}

/// Inverse of [`stanzas_url`].
pub fn parse_stanzas_url(url: &str) -> Option<StreamName> {
    let name = url.strip_prefix("streams/")?.strip_suffix("/stanzas")?;
    StreamName::new(name).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stanzas_url_round_trip() {
        let stream = StreamName::new("alice/posts").unwrap();
        let url = stanzas_url(&stream);
        assert_eq!(url, "streams/alice/posts/stanzas");
        assert_eq!(parse_stanzas_url(&url), Some(stream));
        assert_eq!(parse_stanzas_url("users/alice"), None);
    }

    #[test]
    fn test_range_request_wire_names() {
        let request = RangeRequest {
            seq_start: Some(Seq(4)),
            limit: 10,
            reverse: false,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["seqStart"], 4);
        assert_eq!(value["limit"], 10);
    }
}
