//! Core types for stanza synchronization.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Position of a stanza within its stream (assigned by the owning interchange).
///
/// `Seq(0)` never names a stanza; it is the "nothing yet" position used by
/// checkpoints and as the `prev_seq` of a stream's first stanza.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Seq(pub u64);

impl fmt::Debug for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Seq {
    pub const ZERO: Seq = Seq(0);

    pub fn next(self) -> Self {
        Seq(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Seq(self.0 - 1))
        } else {
            None
        }
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Kinds of stanza carried by the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StanzaType {
    Message,
    UserStatus,
    UserProfile,
    Vote,
}

impl StanzaType {
    pub const ALL: [StanzaType; 4] = [
        StanzaType::Message,
        StanzaType::UserStatus,
        StanzaType::UserProfile,
        StanzaType::Vote,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StanzaType::Message => "MESSAGE",
            StanzaType::UserStatus => "USER_STATUS",
            StanzaType::UserProfile => "USER_PROFILE",
            StanzaType::Vote => "VOTE",
        }
    }
}

impl fmt::Display for StanzaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stream identifier: `<nickname>[/<substream>]`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamName(String);

impl StreamName {
    /// Parse and validate a stream name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let mut parts = name.splitn(2, '/');
        let nickname = parts.next().unwrap_or_default();
        if !Self::valid_part(nickname) {
            return Err(SyncError::InvalidArgument(format!(
                "invalid stream name: {:?}",
                name
            )));
        }
        if let Some(sub) = parts.next() {
            if !Self::valid_part(sub) {
                return Err(SyncError::InvalidArgument(format!(
                    "invalid substream in stream name: {:?}",
                    name
                )));
            }
        }
        Ok(StreamName(name))
    }

    fn valid_part(part: &str) -> bool {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    }

    /// The owning user's nickname.
    pub fn nickname(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    /// The substream, if any.
    pub fn substream(&self) -> Option<&str> {
        self.0.split_once('/').map(|(_, sub)| sub)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamName({})", self.0)
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StreamName {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        StreamName::new(s)
    }
}

impl TryFrom<String> for StreamName {
    type Error = SyncError;

    fn try_from(s: String) -> Result<Self> {
        StreamName::new(s)
    }
}

impl TryFrom<&str> for StreamName {
    type Error = SyncError;

    fn try_from(s: &str) -> Result<Self> {
        StreamName::new(s)
    }
}

impl From<StreamName> for String {
    fn from(name: StreamName) -> Self {
        name.0
    }
}

/// The atomic unit of the network.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stanza {
    #[serde(rename = "type")]
    pub stanza_type: StanzaType,

    /// Owning stream.
    pub stream: StreamName,

    /// Position in the stream.
    pub seq: Seq,

    /// The seq immediately preceding this one in the same stream.
    pub prev_seq: Seq,

    /// Author-supplied logical timestamp.
    pub updated_at: Timestamp,

    /// Server-assigned arrival timestamp; the merge ordering key.
    pub synced_at: Timestamp,

    /// Type-specific content.
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Hex-encoded signature over the unsigned body.
    #[serde(default)]
    pub signature: String,
}

impl Stanza {
    /// True if this stanza directly follows `checkpoint` with no gap.
    pub fn follows(&self, checkpoint: Seq) -> bool {
        self.seq > checkpoint && (self.seq == checkpoint.next() || self.prev_seq <= checkpoint)
    }
}

/// Input for posting a stanza to an interchange (before seq/synced_at assigned).
#[derive(Clone, Debug)]
pub struct StanzaInput {
    pub stanza_type: StanzaType,
    pub stream: StreamName,
    pub updated_at: Timestamp,
    pub payload: serde_json::Value,
}

impl StanzaInput {
    /// A message with a JSON payload.
    pub fn message(stream: StreamName, payload: serde_json::Value) -> Self {
        Self {
            stanza_type: StanzaType::Message,
            stream,
            updated_at: Timestamp::now(),
            payload,
        }
    }

    pub fn with_type(mut self, stanza_type: StanzaType) -> Self {
        self.stanza_type = stanza_type;
        self
    }
}

/// A followed stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub stream: StreamName,

    /// Location of the interchange hosting the stream.
    pub interchange: String,

    /// Session reference on that interchange, if one is established.
    pub session: Option<String>,
}

impl Subscription {
    pub fn new(stream: StreamName, interchange: impl Into<String>) -> Self {
        Self {
            stream,
            interchange: interchange.into(),
            session: None,
        }
    }
}

/// Where a read stream starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeqStart {
    /// Deliver from this seq (inclusive).
    At(Seq),
    /// Deliver the last `n` stanzas, then continue live.
    Last(u64),
    /// Deliver only stanzas that arrive after the stream is opened.
    Now,
}
