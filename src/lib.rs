//! # Trellis - Stream Overlay Networking Library
//!
//! Trellis implements the overlay layer of a decentralized pub/sub streaming
//! network. Streams are split into partitions, and each partition forms its
//! own overlay of neighboring nodes:
//!
//! - **Membership**: per-partition neighbor tables with full-mesh and one-way
//!   relations
//! - **Propagation**: content-hash deduplication and neighbor fan-out for
//!   stream messages
//! - **Proxy connections**: one-way publish/subscribe relationships to
//!   specific peers instead of full mesh membership
//! - **Trackers**: rendezvous coordinators, including ref-counted
//!   signalling-only sessions used during proxy negotiation
//!
//! ## Architecture
//!
//! The node uses the **Actor Pattern** for safe concurrent state:
//! - [`Node`] is a cheap-to-clone handle communicating over async channels
//! - A private actor owns all mutable state and processes commands
//!   sequentially, so proxy negotiations never interleave mid-step
//! - Data forwarding runs in detached tasks so slow peers cannot stall the
//!   control core
//!
//! The physical transport and the tracker protocol are collaborator traits
//! ([`NodeToNode`], [`TrackerConnector`]); the overlay logic is transport
//! agnostic.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `identifiers` | Stream partition, node and tracker identifiers |
//! | `membership` | Per-partition neighbor tables (`StreamPartManager`) |
//! | `propagation` | Dedup cache and forwarding decisions |
//! | `proxy` | One-way proxy connection state machine |
//! | `tracker` | Tracker assignment and signalling sessions |
//! | `protocols` | Collaborator trait definitions |
//! | `messages` | Serialization types for the wire protocol |

mod identifiers;
mod membership;
mod messages;
mod node;
mod propagation;
mod protocols;
mod proxy;
mod tracker;

pub use identifiers::{
    NodeId, ProxyDirection, StreamPartId, StreamPartParseError, TrackerId, MAX_STREAM_ID_LENGTH,
};
pub use membership::{MembershipError, MembershipEvent, StreamPartManager};
pub use messages::{
    deserialize_message, serialize_message, MessageId, NodeToNodeRequest, ProxyConnectionRequest,
    ProxyConnectionResponse, StreamMessage, UnsubscribeRequest, MAX_MESSAGE_SIZE,
};
pub use node::{Node, NodeConfig, NodeEvent, DEFAULT_NODE_CONNECT_TIMEOUT};
pub use propagation::{Propagation, PropagationDecision};
pub use protocols::{NodeToNode, TrackerConnector};
pub use proxy::{ProxyConnectionError, ProxyConnectionState, DEFAULT_RECONNECTION_INTERVAL};
pub use tracker::{TrackerInfo, TrackerManager};
