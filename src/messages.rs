//! # Wire Protocol Messages
//!
//! Serializable message types exchanged node-to-node: stream data messages
//! and the proxy negotiation messages (request, response, leave). Messages
//! are serialized with bincode under a size limit to prevent memory
//! exhaustion from hostile frames.
//!
//! ## Message Types
//!
//! | Message | Role |
//! |---------|------|
//! | `StreamMessage` | A data message for one stream partition |
//! | `ProxyConnectionRequest` | Ask a peer for a one-way connection |
//! | `ProxyConnectionResponse` | Accept/reject reply to the above |
//! | `UnsubscribeRequest` | Peer-initiated leave for a one-way connection |
//!
//! ## Message IDs
//!
//! Data messages are identified by a 32-byte [`MessageId`] computed as
//! `blake3(stream_part || source || seqno || data)`. This gives
//! content-addressing and cheap propagation deduplication.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identifiers::{NodeId, ProxyDirection, StreamPartId};

/// Maximum payload size of a stream message (64 KiB).
/// SECURITY: Prevents memory exhaustion from oversized messages.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum buffer size for deserialization.
/// Slightly larger than `MAX_MESSAGE_SIZE` to allow for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_MESSAGE_SIZE as u64) + 4096;

/// Content-derived identifier of a stream message.
pub type MessageId = [u8; 32];

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
/// SECURITY: Use this instead of raw `bincode::deserialize`.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_message(message: &NodeToNodeRequest) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(message)
}

pub fn deserialize_message(data: &[u8]) -> Result<NodeToNodeRequest, bincode::Error> {
    bincode_options().deserialize(data)
}

// ============================================================================
// Data messages
// ============================================================================

/// A data message flowing through one stream partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub stream_part: StreamPartId,
    /// Publisher of the message (not the previous hop).
    pub source: NodeId,
    /// Publisher-local sequence number; disambiguates identical payloads.
    pub seqno: u64,
    pub data: Vec<u8>,
}

impl StreamMessage {
    pub fn new(stream_part: StreamPartId, source: NodeId, seqno: u64, data: Vec<u8>) -> Self {
        Self {
            stream_part,
            source,
            seqno,
            data,
        }
    }

    /// Content-derived message id:
    /// `blake3(stream_part || source || seqno || data)`.
    pub fn id(&self) -> MessageId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.stream_part.to_string().as_bytes());
        hasher.update(self.source.as_str().as_bytes());
        hasher.update(&self.seqno.to_le_bytes());
        hasher.update(&self.data);
        *hasher.finalize().as_bytes()
    }
}

// ============================================================================
// Proxy negotiation messages
// ============================================================================

/// Sent node-to-node to request a one-way proxy connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConnectionRequest {
    pub stream_part: StreamPartId,
    pub direction: ProxyDirection,
    /// Identity of the end-user/application that requested this proxy,
    /// used to group and revoke connections.
    pub user_id: String,
}

/// Reply to a [`ProxyConnectionRequest`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConnectionResponse {
    pub stream_part: StreamPartId,
    pub direction: ProxyDirection,
    pub accepted: bool,
}

/// Peer-initiated leave notification for a one-way connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub stream_part: StreamPartId,
}

/// Envelope for inbound node-to-node dispatch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeToNodeRequest {
    Data(StreamMessage),
    ProxyConnectionRequest(ProxyConnectionRequest),
    ProxyConnectionResponse(ProxyConnectionResponse),
    Unsubscribe(UnsubscribeRequest),
}
