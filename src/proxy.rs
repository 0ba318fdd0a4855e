//! # Proxy Connection Manager
//!
//! The [`ProxyStreamConnectionManager`] orchestrates one-way proxy
//! connections: lightweight unidirectional data relationships to specific
//! peers, used instead of joining a partition's full mesh.
//!
//! ## State Machine
//!
//! One record exists per `(partition, peer)` pair, regardless of direction —
//! a peer can never be an inbound and an outbound proxy for the same
//! partition at once.
//!
//! ```text
//!   open / accept          response ok            handshake lost
//!  ───────────────▶ Negotiating ─────▶ Accepted ◀─────────────▶ Renegotiating
//!                        │                │                          │
//!                 reject/failure     close/leave              close/leave
//!                        ▼                ▼                          ▼
//!                    (removed)        (removed)                  (removed)
//! ```
//!
//! ## Connect-and-Negotiate
//!
//! Opening (and re-opening) a connection performs three awaited steps:
//! acquire a signalling-only tracker session for the partition, connect to
//! the target peer under a bounded timeout, then send the
//! proxy-connection-request RPC. The tracker session is released whether the
//! handshake succeeds or fails.
//!
//! ## Reconnection
//!
//! A lost established connection is retried on a fixed interval with no
//! attempt cap (the proxy peer is assumed eventually reachable). At most one
//! retry timer exists per connection; it is an abortable spawned task,
//! cancelled on success, on explicit close, and on [`stop`].
//!
//! [`stop`]: ProxyStreamConnectionManager::stop

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::identifiers::{NodeId, ProxyDirection, StreamPartId};
use crate::membership::StreamPartManager;
use crate::messages::{ProxyConnectionRequest, ProxyConnectionResponse, UnsubscribeRequest};
use crate::node::NodeEvent;
use crate::propagation::Propagation;
use crate::protocols::{NodeToNode, TrackerConnector};
use crate::tracker::TrackerManager;

/// Fixed delay between reconnection attempts.
pub const DEFAULT_RECONNECTION_INTERVAL: Duration = Duration::from_secs(10);

/// Key delivered on the retry channel when a reconnection timer fires.
pub type RetryKey = (NodeId, StreamPartId);

// ============================================================================
// Connection records and errors
// ============================================================================

/// Lifecycle state of a proxy connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyConnectionState {
    Negotiating,
    Accepted,
    Renegotiating,
}

/// One `(partition, peer)` proxy connection record.
///
/// Exclusively owned by the manager; the membership table independently
/// records the resulting one-way neighbor relation.
#[derive(Debug)]
struct ProxyConnection {
    state: ProxyConnectionState,
    direction: ProxyDirection,
    user_id: String,
    /// Scheduled retry, present only while awaiting reconnection.
    reconnection_timer: Option<JoinHandle<()>>,
}

impl ProxyConnection {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.reconnection_timer.take() {
            timer.abort();
        }
    }
}

impl Drop for ProxyConnection {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

/// Failures of proxy connection operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxyConnectionError {
    /// The partition already has full-mesh membership.
    TopologyConflict {
        stream_part: StreamPartId,
        direction: ProxyDirection,
    },
    /// A one-way relation to the peer already exists for the partition.
    OnewayConnectionExists {
        stream_part: StreamPartId,
        node: NodeId,
    },
    /// A connection record for the peer already exists.
    ConnectionAlreadyExists {
        stream_part: StreamPartId,
        node: NodeId,
    },
    /// Peer connection did not complete within the configured bound.
    HandshakeTimeout {
        stream_part: StreamPartId,
        node: NodeId,
    },
    /// Close requested for a connection that does not match recorded state.
    NoMatchingConnection {
        stream_part: StreamPartId,
        node: NodeId,
        direction: ProxyDirection,
    },
}

impl fmt::Display for ProxyConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyConnectionError::TopologyConflict {
                stream_part,
                direction,
            } => write!(
                f,
                "could not open a proxy {direction} connection for {stream_part}, \
                 bidirectional stream membership already exists"
            ),
            ProxyConnectionError::OnewayConnectionExists { stream_part, node } => write!(
                f,
                "could not open a proxy connection for {stream_part}, \
                 a one-way connection to {node} already exists"
            ),
            ProxyConnectionError::ConnectionAlreadyExists { stream_part, node } => write!(
                f,
                "could not open a proxy connection for {stream_part}, \
                 a connection record for {node} already exists"
            ),
            ProxyConnectionError::HandshakeTimeout { stream_part, node } => write!(
                f,
                "connection to {node} for {stream_part} timed out during handshake"
            ),
            ProxyConnectionError::NoMatchingConnection {
                stream_part,
                node,
                direction,
            } => write!(
                f,
                "a proxy {direction} connection for {stream_part} on node {node} does not exist"
            ),
        }
    }
}

impl std::error::Error for ProxyConnectionError {}

// ============================================================================
// ProxyStreamConnectionManager
// ============================================================================

/// Orchestrates opening, accepting, reconnecting and closing one-way proxy
/// connections. Owns the connection records; mutates the membership table and
/// propagation engine through explicit collaborator references so all state
/// changes stay inside the single control core.
pub struct ProxyStreamConnectionManager<N: NodeToNode> {
    transport: Arc<N>,
    node_connect_timeout: Duration,
    accept_proxy_connections: bool,
    reconnection_interval: Duration,
    /// Two-level index: partition → peer → record.
    connections: HashMap<StreamPartId, HashMap<NodeId, ProxyConnection>>,
    events: mpsc::UnboundedSender<NodeEvent>,
    /// Fired reconnection timers land here; the control core drains it.
    retry_tx: mpsc::UnboundedSender<RetryKey>,
}

impl<N: NodeToNode> ProxyStreamConnectionManager<N> {
    pub fn new(
        transport: Arc<N>,
        node_connect_timeout: Duration,
        accept_proxy_connections: bool,
        reconnection_interval: Duration,
        events: mpsc::UnboundedSender<NodeEvent>,
        retry_tx: mpsc::UnboundedSender<RetryKey>,
    ) -> Self {
        Self {
            transport,
            node_connect_timeout,
            accept_proxy_connections,
            reconnection_interval,
            connections: HashMap::new(),
            events,
            retry_tx,
        }
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    fn add_connection(
        &mut self,
        stream_part: &StreamPartId,
        node: &NodeId,
        direction: ProxyDirection,
        user_id: &str,
    ) {
        self.connections.entry(stream_part.clone()).or_default().insert(
            node.clone(),
            ProxyConnection {
                state: ProxyConnectionState::Negotiating,
                direction,
                user_id: user_id.to_string(),
                reconnection_timer: None,
            },
        );
    }

    /// Remove the record and the membership relation; tear the partition down
    /// when it is behind-proxy and nothing at all remains for it.
    fn remove_connection(
        &mut self,
        streams: &mut StreamPartManager,
        stream_part: &StreamPartId,
        node: &NodeId,
    ) {
        if let Some(records) = self.connections.get_mut(stream_part) {
            if let Some(mut conn) = records.remove(node) {
                conn.cancel_timer();
            }
            if records.is_empty() {
                self.connections.remove(stream_part);
            }
        }

        streams.remove_node_from_stream_part(stream_part, node);
        if streams.list_all_nodes(stream_part).is_empty()
            && !self.connections.contains_key(stream_part)
            && streams.is_behind_proxy(stream_part)
        {
            streams.remove_stream_part(stream_part);
        }
    }

    fn has_connection(&self, stream_part: &StreamPartId, node: &NodeId) -> bool {
        self.connections
            .get(stream_part)
            .map(|records| records.contains_key(node))
            .unwrap_or(false)
    }

    /// Lifecycle state of the `(partition, peer)` record, if any.
    pub fn connection_state(
        &self,
        stream_part: &StreamPartId,
        node: &NodeId,
    ) -> Option<ProxyConnectionState> {
        self.connections
            .get(stream_part)?
            .get(node)
            .map(|conn| conn.state)
    }

    /// Peers whose proxy connections for the partition were requested by
    /// `user_id`, for grouped revocation.
    pub fn node_ids_for_user_id(&self, stream_part: &StreamPartId, user_id: &str) -> Vec<NodeId> {
        self.connections
            .get(stream_part)
            .map(|records| {
                records
                    .iter()
                    .filter(|(_, conn)| conn.user_id == user_id)
                    .map(|(node, _)| node.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True if any recorded connection for the partition has the direction.
    pub fn is_proxied_stream_part(
        &self,
        stream_part: &StreamPartId,
        direction: ProxyDirection,
    ) -> bool {
        self.connections
            .get(stream_part)
            .map(|records| records.values().any(|conn| conn.direction == direction))
            .unwrap_or(false)
    }

    /// Partitions holding a proxy record to `node`.
    pub fn stream_parts_with_connection(&self, node: &NodeId) -> Vec<StreamPartId> {
        self.connections
            .iter()
            .filter(|(_, records)| records.contains_key(node))
            .map(|(sp, _)| sp.clone())
            .collect()
    }

    /// Number of live reconnection timers (test observability).
    pub fn pending_reconnect_timers(&self) -> usize {
        self.connections
            .values()
            .flat_map(|records| records.values())
            .filter(|conn| conn.reconnection_timer.is_some())
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.values().map(|records| records.len()).sum()
    }

    // ========================================================================
    // Opening
    // ========================================================================

    /// Open a one-way proxy connection to `target` for the partition.
    ///
    /// Topology conflicts and an existing one-way relation reject the request
    /// (rejection event plus error, no state mutation). Handshake failures
    /// after the record is registered remove it again and surface only as a
    /// [`NodeEvent::ProxyConnectionRejected`]; the call itself still returns
    /// `Ok`. The signalling tracker session is released on every path.
    pub async fn open_proxy_connection<C: TrackerConnector>(
        &mut self,
        streams: &mut StreamPartManager,
        trackers: &mut TrackerManager<C>,
        stream_part: &StreamPartId,
        target: &NodeId,
        direction: ProxyDirection,
        user_id: &str,
    ) -> Result<()> {
        let tracker_id = trackers.get_tracker_id(stream_part)?;

        if !streams.is_set_up(stream_part) {
            streams.set_up_stream_part(stream_part, true);
        } else if !streams.is_behind_proxy(stream_part) {
            let err = ProxyConnectionError::TopologyConflict {
                stream_part: stream_part.clone(),
                direction,
            };
            warn!(%stream_part, %target, "{err}");
            self.emit(NodeEvent::ProxyConnectionRejected {
                node: target.clone(),
                stream_part: stream_part.clone(),
                direction,
                reason: err.to_string(),
            });
            return Err(err.into());
        } else if streams.has_oneway_connection(stream_part, target) {
            let err = ProxyConnectionError::OnewayConnectionExists {
                stream_part: stream_part.clone(),
                node: target.clone(),
            };
            warn!(%stream_part, %target, "{err}");
            self.emit(NodeEvent::ProxyConnectionRejected {
                node: target.clone(),
                stream_part: stream_part.clone(),
                direction,
                reason: err.to_string(),
            });
            return Err(err.into());
        } else if self.has_connection(stream_part, target) {
            let err = ProxyConnectionError::ConnectionAlreadyExists {
                stream_part: stream_part.clone(),
                node: target.clone(),
            };
            warn!(%stream_part, %target, "{err}");
            return Err(err.into());
        }

        self.add_connection(stream_part, target, direction, user_id);
        let result = self
            .connect_and_negotiate(trackers, stream_part, target, direction, user_id)
            .await;
        trackers
            .disconnect_from_signalling_only_tracker(&tracker_id)
            .await;

        if let Err(err) = result {
            warn!(
                %stream_part, %target, %direction, error = %err,
                "failed to create proxy connection"
            );
            self.remove_connection(streams, stream_part, target);
            self.emit(NodeEvent::ProxyConnectionRejected {
                node: target.clone(),
                stream_part: stream_part.clone(),
                direction,
                reason: err.to_string(),
            });
        }
        Ok(())
    }

    /// The three awaited handshake steps: tracker session, peer connection
    /// under the configured timeout, proxy-connection-request RPC.
    async fn connect_and_negotiate<C: TrackerConnector>(
        &self,
        trackers: &mut TrackerManager<C>,
        stream_part: &StreamPartId,
        target: &NodeId,
        direction: ProxyDirection,
        user_id: &str,
    ) -> Result<()> {
        let tracker = trackers.tracker_for(stream_part)?.clone();
        trackers
            .connect_to_signalling_only_tracker(&tracker.id, &tracker.address)
            .await?;

        match timeout(
            self.node_connect_timeout,
            self.transport.connect_to_node(target, &tracker.id, false),
        )
        .await
        {
            Ok(connected) => connected.context("node connection failed")?,
            Err(_) => {
                return Err(ProxyConnectionError::HandshakeTimeout {
                    stream_part: stream_part.clone(),
                    node: target.clone(),
                }
                .into())
            }
        }

        self.transport
            .request_proxy_connection(target, stream_part, direction, user_id)
            .await
    }

    // ========================================================================
    // Inbound negotiation
    // ========================================================================

    /// Handle a peer's proxy-connection request. Always replies accept/reject.
    pub async fn process_proxy_connection_request(
        &mut self,
        streams: &mut StreamPartManager,
        propagation: &mut Propagation,
        request: &ProxyConnectionRequest,
        from: &NodeId,
    ) -> Result<()> {
        let stream_part = &request.stream_part;
        // Further acceptance conditions (allow-lists, connection caps) would
        // slot in here.
        let mut accepted = streams.is_set_up(stream_part) && self.accept_proxy_connections;
        if accepted {
            let registered = match request.direction {
                ProxyDirection::Publish => {
                    // The peer publishes to us: inbound-only relation.
                    streams.add_in_only_neighbor(stream_part, from.clone())
                }
                ProxyDirection::Subscribe => {
                    streams.add_out_only_neighbor(stream_part, from.clone())
                }
            };
            match registered {
                Ok(()) => {
                    self.add_connection(stream_part, from, request.direction, &request.user_id);
                    if request.direction == ProxyDirection::Subscribe {
                        propagation.on_neighbor_joined(from, stream_part);
                    }
                }
                Err(err) => {
                    warn!(%stream_part, %from, error = %err, "rejecting conflicting proxy request");
                    accepted = false;
                }
            }
        }
        self.transport
            .respond_to_proxy_connection_request(from, stream_part, request.direction, accepted)
            .await
    }

    /// Handle the peer's accept/reject reply to our request.
    pub fn process_proxy_connection_response(
        &mut self,
        streams: &mut StreamPartManager,
        propagation: &mut Propagation,
        response: &ProxyConnectionResponse,
        from: &NodeId,
    ) -> Result<()> {
        let stream_part = &response.stream_part;
        if !self.has_connection(stream_part, from) {
            warn!(%stream_part, %from, "response for unknown proxy connection ignored");
            return Ok(());
        }

        if response.accepted {
            if let Some(conn) = self
                .connections
                .get_mut(stream_part)
                .and_then(|records| records.get_mut(from))
            {
                conn.state = ProxyConnectionState::Accepted;
            }
            // Same direction mapping as the acceptor side: the direction
            // names the local data-flow role, not who initiated.
            match response.direction {
                ProxyDirection::Publish => {
                    streams.add_in_only_neighbor(stream_part, from.clone())?;
                }
                ProxyDirection::Subscribe => {
                    streams.add_out_only_neighbor(stream_part, from.clone())?;
                    propagation.on_neighbor_joined(from, stream_part);
                }
            }
            self.emit(NodeEvent::ProxyConnectionAccepted {
                node: from.clone(),
                stream_part: stream_part.clone(),
                direction: response.direction,
            });
        } else {
            self.remove_connection(streams, stream_part, from);
            self.emit(NodeEvent::ProxyConnectionRejected {
                node: from.clone(),
                stream_part: stream_part.clone(),
                direction: response.direction,
                reason: format!(
                    "target node {from} rejected proxy {} connection for {stream_part}",
                    response.direction
                ),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Reconnection
    // ========================================================================

    /// Re-run the handshake for an established connection that lost its peer.
    ///
    /// No-op without a record. On failure, schedules exactly one retry after
    /// the fixed reconnection interval; attempts are unbounded and only end
    /// when the connection is closed.
    pub async fn reconnect<C: TrackerConnector>(
        &mut self,
        trackers: &mut TrackerManager<C>,
        target: &NodeId,
        stream_part: &StreamPartId,
    ) {
        let (direction, user_id) = match self
            .connections
            .get_mut(stream_part)
            .and_then(|records| records.get_mut(target))
        {
            Some(conn) => {
                conn.state = ProxyConnectionState::Renegotiating;
                (conn.direction, conn.user_id.clone())
            }
            None => {
                trace!(%target, %stream_part, "no proxy connection to reconnect");
                return;
            }
        };

        let tracker_id = match trackers.get_tracker_id(stream_part) {
            Ok(id) => id,
            Err(err) => {
                warn!(%stream_part, error = %err, "cannot resolve tracker for reconnection");
                return;
            }
        };
        let result = self
            .connect_and_negotiate(trackers, stream_part, target, direction, &user_id)
            .await;
        trackers
            .disconnect_from_signalling_only_tracker(&tracker_id)
            .await;

        let conn = match self
            .connections
            .get_mut(stream_part)
            .and_then(|records| records.get_mut(target))
        {
            Some(conn) => conn,
            // Closed while the handshake was in flight; the attempt is
            // redundant and there is nothing to clean up.
            None => return,
        };
        match result {
            Ok(()) => {
                trace!(%target, %stream_part, "proxy stream reconnection succeeded");
                conn.state = ProxyConnectionState::Accepted;
                conn.cancel_timer();
            }
            Err(err) => {
                warn!(%target, %stream_part, error = %err, "proxy reconnection attempt failed");
                conn.cancel_timer();
                let retry_tx = self.retry_tx.clone();
                let target = target.clone();
                let stream_part = stream_part.clone();
                let delay = self.reconnection_interval;
                conn.reconnection_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = retry_tx.send((target, stream_part));
                }));
            }
        }
    }

    // ========================================================================
    // Closing
    // ========================================================================

    /// Close a proxy connection we hold, notifying the peer with a leave RPC.
    ///
    /// The recorded relation and direction must match, otherwise this is an
    /// inconsistent-state fault and fails loudly.
    pub async fn close_proxy_connection(
        &mut self,
        streams: &mut StreamPartManager,
        stream_part: &StreamPartId,
        target: &NodeId,
        direction: ProxyDirection,
    ) -> Result<()> {
        let recorded_direction = self
            .connections
            .get(stream_part)
            .and_then(|records| records.get(target))
            .map(|conn| conn.direction);
        let matches = streams.is_set_up(stream_part)
            && streams.has_oneway_connection(stream_part, target)
            && recorded_direction == Some(direction);
        if !matches {
            let err = ProxyConnectionError::NoMatchingConnection {
                stream_part: stream_part.clone(),
                node: target.clone(),
                direction,
            };
            warn!("{err}");
            return Err(err.into());
        }

        self.remove_connection(streams, stream_part, target);
        self.transport
            .leave_stream_on_node(target, stream_part)
            .await
            .context("failed to notify peer of leave")?;
        self.emit(NodeEvent::OneWayConnectionClosed {
            node: target.clone(),
            stream_part: stream_part.clone(),
        });
        Ok(())
    }

    /// Peer-initiated teardown: mirror the close bookkeeping without sending
    /// a leave RPC back.
    pub fn process_leave_request(
        &mut self,
        streams: &mut StreamPartManager,
        message: &UnsubscribeRequest,
        from: &NodeId,
    ) {
        let stream_part = &message.stream_part;
        if streams.is_set_up(stream_part) && streams.has_in_only_connection(stream_part, from) {
            self.remove_connection(streams, stream_part, from);
            self.emit(NodeEvent::OneWayConnectionClosed {
                node: from.clone(),
                stream_part: stream_part.clone(),
            });
        }
        if streams.is_set_up(stream_part) && streams.has_out_only_connection(stream_part, from) {
            self.remove_connection(streams, stream_part, from);
            self.emit(NodeEvent::OneWayConnectionClosed {
                node: from.clone(),
                stream_part: stream_part.clone(),
            });
            info!(%from, %stream_part, "proxy node closed one-way stream connection");
        }
    }

    /// Drop every record for the partition, cancelling timers. Used when the
    /// partition itself is unsubscribed.
    pub fn on_stream_part_removed(&mut self, stream_part: &StreamPartId) {
        if let Some(mut records) = self.connections.remove(stream_part) {
            for conn in records.values_mut() {
                conn.cancel_timer();
            }
        }
    }

    /// Cancel every pending reconnection timer and clear all records.
    /// Safe to call repeatedly.
    pub fn stop(&mut self) {
        for records in self.connections.values_mut() {
            for conn in records.values_mut() {
                conn.cancel_timer();
            }
        }
        self.connections.clear();
        debug!("proxy connection manager stopped");
    }
}
