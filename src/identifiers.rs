//! # Core Identifier Types
//!
//! This module defines the identifier newtypes used throughout the crate:
//!
//! - [`StreamPartId`]: a stream partition — the unit of mesh membership
//! - [`NodeId`]: an opaque peer identity
//! - [`TrackerId`]: an opaque tracker identity
//! - [`ProxyDirection`]: the role of a one-way proxy connection
//!
//! ## Identifier Model
//!
//! A stream is sharded into numbered partitions; every membership, proxy and
//! propagation decision is keyed by the `(stream, partition)` pair, never by
//! the stream alone. `NodeId` is opaque here: it is derived from a
//! cryptographic address by an external identity layer, and this crate only
//! requires it to be hashable, ordered and printable.
//!
//! ## Textual Form
//!
//! `StreamPartId` round-trips through the `"stream::partition"` form, e.g.
//! `"feed::0"`. Stream ids may themselves contain `::`; parsing splits on the
//! last occurrence.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum length of a stream id string.
/// SECURITY: Bounds identifier size in wire messages and map keys.
pub const MAX_STREAM_ID_LENGTH: usize = 256;

// ============================================================================
// StreamPartId
// ============================================================================

/// A stream partition: the unit of mesh membership and propagation.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamPartId {
    stream_id: String,
    partition: u32,
}

impl StreamPartId {
    pub fn new(stream_id: impl Into<String>, partition: u32) -> Self {
        Self {
            stream_id: stream_id.into(),
            partition,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }
}

impl fmt::Display for StreamPartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.stream_id, self.partition)
    }
}

/// Error parsing a `"stream::partition"` string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamPartParseError {
    /// No `::` separator found.
    MissingSeparator,
    /// The partition suffix is not a valid number.
    InvalidPartition,
    /// The stream id is empty or exceeds `MAX_STREAM_ID_LENGTH`.
    InvalidStreamId,
}

impl fmt::Display for StreamPartParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamPartParseError::MissingSeparator => {
                write!(f, "missing '::' separator in stream partition id")
            }
            StreamPartParseError::InvalidPartition => {
                write!(f, "partition suffix is not a valid u32")
            }
            StreamPartParseError::InvalidStreamId => {
                write!(f, "stream id is empty or too long")
            }
        }
    }
}

impl std::error::Error for StreamPartParseError {}

impl FromStr for StreamPartId {
    type Err = StreamPartParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (stream_id, partition) = s
            .rsplit_once("::")
            .ok_or(StreamPartParseError::MissingSeparator)?;
        if stream_id.is_empty() || stream_id.len() > MAX_STREAM_ID_LENGTH {
            return Err(StreamPartParseError::InvalidStreamId);
        }
        let partition = partition
            .parse::<u32>()
            .map_err(|_| StreamPartParseError::InvalidPartition)?;
        Ok(Self::new(stream_id, partition))
    }
}

// ============================================================================
// NodeId / TrackerId
// ============================================================================

/// Opaque peer identity.
///
/// Derived from a cryptographic address by the identity layer; treated here
/// as an ordinary hashable key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque tracker identity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackerId(String);

impl TrackerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TrackerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TrackerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ============================================================================
// ProxyDirection
// ============================================================================

/// Data-flow role of a one-way proxy connection, as recorded by each side.
///
/// | Direction | Data flow | Peer recorded as |
/// |-----------|-----------|------------------|
/// | `Publish` | peer → self | inbound-only neighbor |
/// | `Subscribe` | self → peer | outbound-only neighbor |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProxyDirection {
    Publish,
    Subscribe,
}

impl fmt::Display for ProxyDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyDirection::Publish => f.write_str("publish"),
            ProxyDirection::Subscribe => f.write_str("subscribe"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_part_display_round_trip() {
        let sp = StreamPartId::new("feed", 0);
        assert_eq!(sp.to_string(), "feed::0");
        assert_eq!("feed::0".parse::<StreamPartId>().unwrap(), sp);
    }

    #[test]
    fn stream_part_parse_splits_on_last_separator() {
        let sp: StreamPartId = "a::b::3".parse().unwrap();
        assert_eq!(sp.stream_id(), "a::b");
        assert_eq!(sp.partition(), 3);
    }

    #[test]
    fn stream_part_parse_rejects_malformed() {
        assert_eq!(
            "nopartition".parse::<StreamPartId>(),
            Err(StreamPartParseError::MissingSeparator)
        );
        assert_eq!(
            "feed::x".parse::<StreamPartId>(),
            Err(StreamPartParseError::InvalidPartition)
        );
        assert_eq!(
            "::1".parse::<StreamPartId>(),
            Err(StreamPartParseError::InvalidStreamId)
        );
    }

    #[test]
    fn node_id_ordering_and_display() {
        let a = NodeId::from("a");
        let b = NodeId::from("b");
        assert!(a < b);
        assert_eq!(a.to_string(), "a");
    }

    #[test]
    fn direction_display() {
        assert_eq!(ProxyDirection::Publish.to_string(), "publish");
        assert_eq!(ProxyDirection::Subscribe.to_string(), "subscribe");
    }
}
