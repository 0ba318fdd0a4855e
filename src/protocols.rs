//! Collaborator trait contracts for the overlay layer.
//!
//! The physical transport (connection establishment, framing, RPC plumbing)
//! and the tracker's own protocol are external collaborators. This module
//! defines the traits the overlay consumes from them.
//!
//! ## Contracts
//!
//! | Trait | Collaborator | Purpose |
//! |-------|--------------|---------|
//! | [`NodeToNode`] | transport layer | negotiation RPCs and data forwarding by peer identity |
//! | [`TrackerConnector`] | tracker client | open/close signalling sessions to a tracker |
//!
//! Traits are defined separately from any implementation so the membership,
//! propagation and proxy machinery can be driven by mocks in tests and by the
//! real transport in production without a circular dependency.

use anyhow::Result;
use async_trait::async_trait;

use crate::identifiers::{NodeId, ProxyDirection, StreamPartId, TrackerId};
use crate::messages::StreamMessage;

/// Node-to-node negotiation and data transport, addressed by peer identity.
///
/// `connect_to_node` performs signaling through the given tracker and must
/// resolve once a usable connection to the target exists. The caller applies
/// its own timeout; implementations need not bound the attempt themselves.
#[async_trait]
pub trait NodeToNode: Send + Sync + 'static {
    /// Establish a connection to `target`, signaling through `tracker_id`.
    ///
    /// `is_offering` selects which side initiates the underlying handshake
    /// when the transport needs a deterministic offerer.
    async fn connect_to_node(
        &self,
        target: &NodeId,
        tracker_id: &TrackerId,
        is_offering: bool,
    ) -> Result<()>;

    /// Send a proxy-connection request to `target`.
    async fn request_proxy_connection(
        &self,
        target: &NodeId,
        stream_part: &StreamPartId,
        direction: ProxyDirection,
        user_id: &str,
    ) -> Result<()>;

    /// Reply to a proxy-connection request with accept/reject.
    async fn respond_to_proxy_connection_request(
        &self,
        target: &NodeId,
        stream_part: &StreamPartId,
        direction: ProxyDirection,
        accepted: bool,
    ) -> Result<()>;

    /// Notify `target` that we are leaving the stream partition.
    async fn leave_stream_on_node(&self, target: &NodeId, stream_part: &StreamPartId)
        -> Result<()>;

    /// Forward a data message to `target`.
    async fn send_data(&self, target: &NodeId, message: &StreamMessage) -> Result<()>;
}

/// Tracker session transport consumed by the tracker manager.
#[async_trait]
pub trait TrackerConnector: Send + Sync + 'static {
    /// Open a connection to the tracker at `address`.
    async fn connect(&self, tracker_id: &TrackerId, address: &str) -> Result<()>;

    /// Close the connection to the tracker.
    async fn disconnect(&self, tracker_id: &TrackerId) -> Result<()>;
}
