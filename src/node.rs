//! # Node
//!
//! The [`Node`] is the overlay-layer orchestrator: it owns the membership
//! table, the propagation engine, the tracker manager and the proxy
//! connection manager, and wires inbound protocol messages to them.
//!
//! ## Actor Model
//!
//! All mutable state lives in a private actor task; the cheaply clonable
//! [`Node`] handle sends commands over a channel and awaits replies. Fired
//! reconnection timers land on a second channel drained by the same task, so
//! every state transition happens on one control core and negotiations never
//! interleave mid-step.
//!
//! Data forwarding is the one concern pushed off the control core: send RPCs
//! to propagation targets run in detached tasks so a slow peer cannot stall
//! command processing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::identifiers::{NodeId, ProxyDirection, StreamPartId};
use crate::membership::{MembershipEvent, StreamPartManager};
use crate::messages::{NodeToNodeRequest, StreamMessage};
use crate::propagation::{Propagation, DEFAULT_DEDUP_CACHE_SIZE, DEFAULT_DEDUP_TTL};
use crate::protocols::{NodeToNode, TrackerConnector};
use crate::proxy::{
    ProxyConnectionState, ProxyStreamConnectionManager, RetryKey, DEFAULT_RECONNECTION_INTERVAL,
};
use crate::tracker::{TrackerInfo, TrackerManager};

/// Upper bound on peer connection establishment during a proxy handshake.
pub const DEFAULT_NODE_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Command channel depth; queries and mutations share the channel.
const COMMAND_BUFFER: usize = 64;

// ============================================================================
// Configuration and events
// ============================================================================

/// Node configuration.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Trackers available for partition-to-tracker assignment.
    pub trackers: Vec<TrackerInfo>,
    /// Bound on `connect_to_node` during proxy negotiation.
    pub node_connect_timeout: Duration,
    /// Whether inbound proxy-connection requests may be accepted.
    pub accept_proxy_connections: bool,
    /// Fixed delay between proxy reconnection attempts.
    pub reconnection_interval: Duration,
    /// Capacity of the dedup cache, in message ids.
    pub dedup_cache_size: usize,
    /// Age after which a dedup entry no longer suppresses redelivery.
    pub dedup_ttl: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            trackers: Vec::new(),
            node_connect_timeout: DEFAULT_NODE_CONNECT_TIMEOUT,
            accept_proxy_connections: false,
            reconnection_interval: DEFAULT_RECONNECTION_INTERVAL,
            dedup_cache_size: DEFAULT_DEDUP_CACHE_SIZE,
            dedup_ttl: DEFAULT_DEDUP_TTL,
        }
    }
}

/// Events surfaced to the embedding application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    /// A proxy connection we requested was accepted and is now live.
    ProxyConnectionAccepted {
        node: NodeId,
        stream_part: StreamPartId,
        direction: ProxyDirection,
    },
    /// A proxy connection attempt was refused or failed to negotiate.
    ProxyConnectionRejected {
        node: NodeId,
        stream_part: StreamPartId,
        direction: ProxyDirection,
        reason: String,
    },
    /// A one-way connection was torn down, by either side.
    OneWayConnectionClosed {
        node: NodeId,
        stream_part: StreamPartId,
    },
    /// A message was seen for the first time (published locally or received).
    UnseenMessage(StreamMessage),
}

// ============================================================================
// Commands
// ============================================================================

enum Command {
    Subscribe {
        stream_part: StreamPartId,
        reply: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        stream_part: StreamPartId,
        reply: oneshot::Sender<Result<()>>,
    },
    Publish {
        message: StreamMessage,
        reply: oneshot::Sender<Result<()>>,
    },
    OpenProxyConnection {
        stream_part: StreamPartId,
        target: NodeId,
        direction: ProxyDirection,
        user_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    CloseProxyConnection {
        stream_part: StreamPartId,
        target: NodeId,
        direction: ProxyDirection,
        reply: oneshot::Sender<Result<()>>,
    },
    HandleMessage {
        from: NodeId,
        request: NodeToNodeRequest,
        reply: oneshot::Sender<Result<()>>,
    },
    NodeDisconnected {
        node: NodeId,
        reply: oneshot::Sender<()>,
    },
    AddFullNeighbor {
        stream_part: StreamPartId,
        node: NodeId,
        reply: oneshot::Sender<Result<()>>,
    },
    Neighbors {
        stream_part: StreamPartId,
        reply: oneshot::Sender<Vec<NodeId>>,
    },
    StreamParts {
        reply: oneshot::Sender<Vec<StreamPartId>>,
    },
    IsSetUp {
        stream_part: StreamPartId,
        reply: oneshot::Sender<bool>,
    },
    IsProxiedStreamPart {
        stream_part: StreamPartId,
        direction: ProxyDirection,
        reply: oneshot::Sender<bool>,
    },
    ProxyConnectionState {
        stream_part: StreamPartId,
        node: NodeId,
        reply: oneshot::Sender<Option<ProxyConnectionState>>,
    },
    PendingReconnectTimers {
        reply: oneshot::Sender<usize>,
    },
    SubscribeMembershipChanges {
        reply: oneshot::Sender<mpsc::UnboundedReceiver<MembershipEvent>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// Public handle
// ============================================================================

/// Handle to a running node actor. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    cmd_tx: mpsc::Sender<Command>,
}

impl Node {
    /// Spawn the node actor. Returns the handle and the event stream.
    pub fn spawn<N: NodeToNode, C: TrackerConnector>(
        config: NodeConfig,
        transport: Arc<N>,
        connector: Arc<C>,
    ) -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();

        let actor = NodeActor {
            transport: Arc::clone(&transport),
            streams: StreamPartManager::new(),
            propagation: Propagation::new(config.dedup_cache_size, config.dedup_ttl),
            trackers: TrackerManager::new(connector, config.trackers),
            proxy: ProxyStreamConnectionManager::new(
                transport,
                config.node_connect_timeout,
                config.accept_proxy_connections,
                config.reconnection_interval,
                event_tx.clone(),
                retry_tx,
            ),
            events: event_tx,
        };
        tokio::spawn(actor.run(cmd_rx, retry_rx));
        (Self { cmd_tx }, event_rx)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| anyhow!("node actor stopped"))?;
        rx.await.map_err(|_| anyhow!("node actor stopped"))
    }

    /// Join a stream partition as a full mesh member.
    ///
    /// Fails if the partition is already set up behind a proxy.
    pub async fn subscribe(&self, stream_part: &StreamPartId) -> Result<()> {
        let stream_part = stream_part.clone();
        self.request(|reply| Command::Subscribe { stream_part, reply })
            .await?
    }

    /// Leave a stream partition, notifying every known peer for it.
    pub async fn unsubscribe(&self, stream_part: &StreamPartId) -> Result<()> {
        let stream_part = stream_part.clone();
        self.request(|reply| Command::Unsubscribe { stream_part, reply })
            .await?
    }

    /// Publish a message, deduplicate it and forward it to neighbors.
    ///
    /// Fails on a partition proxied in the publish direction: there the node
    /// is the inbound side and only receives.
    pub async fn publish(&self, message: StreamMessage) -> Result<()> {
        self.request(|reply| Command::Publish { message, reply })
            .await?
    }

    /// Open a one-way proxy connection to `target` for the partition.
    pub async fn open_proxy_connection(
        &self,
        stream_part: &StreamPartId,
        target: &NodeId,
        direction: ProxyDirection,
        user_id: &str,
    ) -> Result<()> {
        let stream_part = stream_part.clone();
        let target = target.clone();
        let user_id = user_id.to_string();
        self.request(|reply| Command::OpenProxyConnection {
            stream_part,
            target,
            direction,
            user_id,
            reply,
        })
        .await?
    }

    /// Close a previously opened proxy connection.
    pub async fn close_proxy_connection(
        &self,
        stream_part: &StreamPartId,
        target: &NodeId,
        direction: ProxyDirection,
    ) -> Result<()> {
        let stream_part = stream_part.clone();
        let target = target.clone();
        self.request(|reply| Command::CloseProxyConnection {
            stream_part,
            target,
            direction,
            reply,
        })
        .await?
    }

    /// Dispatch an inbound protocol message from `from`.
    pub async fn handle_message(&self, from: &NodeId, request: NodeToNodeRequest) -> Result<()> {
        let from = from.clone();
        self.request(|reply| Command::HandleMessage {
            from,
            request,
            reply,
        })
        .await?
    }

    /// Notify the node that the underlying connection to a peer dropped.
    /// Starts reconnection for every proxy connection involving the peer.
    pub async fn on_node_disconnected(&self, node: &NodeId) -> Result<()> {
        let node = node.clone();
        self.request(|reply| Command::NodeDisconnected { node, reply })
            .await
    }

    /// Record a tracker-assigned full mesh neighbor for a partition.
    pub async fn add_full_neighbor(
        &self,
        stream_part: &StreamPartId,
        node: &NodeId,
    ) -> Result<()> {
        let stream_part = stream_part.clone();
        let node = node.clone();
        self.request(|reply| Command::AddFullNeighbor {
            stream_part,
            node,
            reply,
        })
        .await?
    }

    /// Full mesh neighbors of a partition.
    pub async fn neighbors(&self, stream_part: &StreamPartId) -> Result<Vec<NodeId>> {
        let stream_part = stream_part.clone();
        self.request(|reply| Command::Neighbors { stream_part, reply })
            .await
    }

    /// All locally set-up stream partitions.
    pub async fn stream_parts(&self) -> Result<Vec<StreamPartId>> {
        self.request(|reply| Command::StreamParts { reply }).await
    }

    pub async fn is_set_up(&self, stream_part: &StreamPartId) -> Result<bool> {
        let stream_part = stream_part.clone();
        self.request(|reply| Command::IsSetUp { stream_part, reply })
            .await
    }

    /// True if the partition has any proxy connection with the direction.
    pub async fn is_proxied_stream_part(
        &self,
        stream_part: &StreamPartId,
        direction: ProxyDirection,
    ) -> Result<bool> {
        let stream_part = stream_part.clone();
        self.request(|reply| Command::IsProxiedStreamPart {
            stream_part,
            direction,
            reply,
        })
        .await
    }

    /// Lifecycle state of a proxy connection record, if one exists.
    pub async fn proxy_connection_state(
        &self,
        stream_part: &StreamPartId,
        node: &NodeId,
    ) -> Result<Option<ProxyConnectionState>> {
        let stream_part = stream_part.clone();
        let node = node.clone();
        self.request(|reply| Command::ProxyConnectionState {
            stream_part,
            node,
            reply,
        })
        .await
    }

    /// Number of scheduled proxy reconnection timers.
    pub async fn pending_reconnect_timers(&self) -> Result<usize> {
        self.request(|reply| Command::PendingReconnectTimers { reply })
            .await
    }

    /// Subscribe to membership change notifications.
    pub async fn subscribe_membership_changes(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<MembershipEvent>> {
        self.request(|reply| Command::SubscribeMembershipChanges { reply })
            .await
    }

    /// Stop the actor, cancelling all reconnection timers. Idempotent; calls
    /// after shutdown return without error.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop { reply: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

struct NodeActor<N: NodeToNode, C: TrackerConnector> {
    transport: Arc<N>,
    streams: StreamPartManager,
    propagation: Propagation,
    trackers: TrackerManager<C>,
    proxy: ProxyStreamConnectionManager<N>,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl<N: NodeToNode, C: TrackerConnector> NodeActor<N, C> {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut retry_rx: mpsc::UnboundedReceiver<RetryKey>,
    ) {
        debug!("node actor started");
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Stop { reply }) => {
                        self.proxy.stop();
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some((node, stream_part)) = retry_rx.recv() => {
                    self.proxy
                        .reconnect(&mut self.trackers, &node, &stream_part)
                        .await;
                }
            }
        }
        self.proxy.stop();
        debug!("node actor stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe { stream_part, reply } => {
                let _ = reply.send(self.subscribe(&stream_part));
            }
            Command::Unsubscribe { stream_part, reply } => {
                let _ = reply.send(self.unsubscribe(&stream_part));
            }
            Command::Publish { message, reply } => {
                let _ = reply.send(self.publish(message));
            }
            Command::OpenProxyConnection {
                stream_part,
                target,
                direction,
                user_id,
                reply,
            } => {
                let result = self
                    .proxy
                    .open_proxy_connection(
                        &mut self.streams,
                        &mut self.trackers,
                        &stream_part,
                        &target,
                        direction,
                        &user_id,
                    )
                    .await;
                let _ = reply.send(result);
            }
            Command::CloseProxyConnection {
                stream_part,
                target,
                direction,
                reply,
            } => {
                let result = self
                    .proxy
                    .close_proxy_connection(&mut self.streams, &stream_part, &target, direction)
                    .await;
                let _ = reply.send(result);
            }
            Command::HandleMessage {
                from,
                request,
                reply,
            } => {
                let result = self.handle_message(&from, request).await;
                let _ = reply.send(result);
            }
            Command::NodeDisconnected { node, reply } => {
                self.on_node_disconnected(&node).await;
                let _ = reply.send(());
            }
            Command::AddFullNeighbor {
                stream_part,
                node,
                reply,
            } => {
                let result = self
                    .streams
                    .add_neighbor(&stream_part, node.clone())
                    .map(|()| self.propagation.on_neighbor_joined(&node, &stream_part))
                    .map_err(Into::into);
                let _ = reply.send(result);
            }
            Command::Neighbors { stream_part, reply } => {
                let _ = reply.send(self.streams.list_neighbors(&stream_part));
            }
            Command::StreamParts { reply } => {
                let _ = reply.send(self.streams.stream_parts());
            }
            Command::IsSetUp { stream_part, reply } => {
                let _ = reply.send(self.streams.is_set_up(&stream_part));
            }
            Command::IsProxiedStreamPart {
                stream_part,
                direction,
                reply,
            } => {
                let _ = reply.send(self.proxy.is_proxied_stream_part(&stream_part, direction));
            }
            Command::ProxyConnectionState {
                stream_part,
                node,
                reply,
            } => {
                let _ = reply.send(self.proxy.connection_state(&stream_part, &node));
            }
            Command::PendingReconnectTimers { reply } => {
                let _ = reply.send(self.proxy.pending_reconnect_timers());
            }
            Command::SubscribeMembershipChanges { reply } => {
                let _ = reply.send(self.streams.subscribe_changes());
            }
            Command::Stop { reply } => {
                // Handled in the run loop; unreachable here but kept total.
                let _ = reply.send(());
            }
        }
    }

    fn subscribe(&mut self, stream_part: &StreamPartId) -> Result<()> {
        if self.streams.is_behind_proxy(stream_part) {
            bail!("{stream_part} is already set up behind a proxy connection");
        }
        self.streams.set_up_stream_part(stream_part, false);
        info!(%stream_part, "subscribed to stream partition");
        Ok(())
    }

    fn unsubscribe(&mut self, stream_part: &StreamPartId) -> Result<()> {
        if !self.streams.is_set_up(stream_part) {
            return Ok(());
        }
        let peers = self.streams.list_all_nodes(stream_part);
        self.proxy.on_stream_part_removed(stream_part);
        self.streams.remove_stream_part(stream_part);

        // Best-effort leave notifications off the control core.
        let transport = Arc::clone(&self.transport);
        let stream_part = stream_part.clone();
        tokio::spawn(async move {
            for peer in peers {
                if let Err(e) = transport.leave_stream_on_node(&peer, &stream_part).await {
                    warn!(%peer, %stream_part, error = %e, "leave notification failed");
                }
            }
        });
        Ok(())
    }

    fn publish(&mut self, message: StreamMessage) -> Result<()> {
        let stream_part = message.stream_part.clone();
        if self
            .proxy
            .is_proxied_stream_part(&stream_part, ProxyDirection::Publish)
        {
            bail!("cannot publish to {stream_part}, the node is the inbound side of a publish proxy");
        }
        if !self.streams.is_set_up(&stream_part) {
            self.streams.set_up_stream_part(&stream_part, false);
        }
        self.ingest_message(message, None);
        Ok(())
    }

    /// Dedup, surface and forward a message, whether published locally or
    /// received from `source`.
    fn ingest_message(&mut self, message: StreamMessage, source: Option<&NodeId>) {
        let decision = self.propagation.feed_message(&self.streams, &message, source);
        if !decision.first_seen {
            trace!(stream_part = %message.stream_part, seqno = message.seqno, "duplicate message dropped");
            return;
        }
        let _ = self.events.send(NodeEvent::UnseenMessage(message.clone()));
        if decision.targets.is_empty() {
            return;
        }
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            for target in decision.targets {
                if let Err(e) = transport.send_data(&target, &message).await {
                    warn!(%target, error = %e, "data forward failed");
                }
            }
        });
    }

    async fn handle_message(&mut self, from: &NodeId, request: NodeToNodeRequest) -> Result<()> {
        match request {
            NodeToNodeRequest::Data(message) => {
                if !self.streams.is_set_up(&message.stream_part) {
                    self.streams.set_up_stream_part(&message.stream_part, false);
                }
                self.ingest_message(message, Some(from));
                Ok(())
            }
            NodeToNodeRequest::ProxyConnectionRequest(request) => {
                self.proxy
                    .process_proxy_connection_request(
                        &mut self.streams,
                        &mut self.propagation,
                        &request,
                        from,
                    )
                    .await
            }
            NodeToNodeRequest::ProxyConnectionResponse(response) => self
                .proxy
                .process_proxy_connection_response(
                    &mut self.streams,
                    &mut self.propagation,
                    &response,
                    from,
                ),
            NodeToNodeRequest::Unsubscribe(request) => {
                // One-way relations go through proxy bookkeeping; plain mesh
                // neighbors are simply dropped from the partition.
                if self.streams.has_oneway_connection(&request.stream_part, from) {
                    self.proxy
                        .process_leave_request(&mut self.streams, &request, from);
                } else {
                    self.streams
                        .remove_node_from_stream_part(&request.stream_part, from);
                }
                Ok(())
            }
        }
    }

    async fn on_node_disconnected(&mut self, node: &NodeId) {
        let parts = self.proxy.stream_parts_with_connection(node);
        if parts.is_empty() {
            return;
        }
        info!(%node, partitions = parts.len(), "proxy peer disconnected, reconnecting");
        for stream_part in parts {
            self.proxy
                .reconnect(&mut self.trackers, node, &stream_part)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::time::{timeout, Duration};

    use super::*;
    use crate::identifiers::TrackerId;

    struct NullTransport;

    #[async_trait]
    impl NodeToNode for NullTransport {
        async fn connect_to_node(
            &self,
            _target: &NodeId,
            _tracker_id: &TrackerId,
            _is_offering: bool,
        ) -> Result<()> {
            Ok(())
        }

        async fn request_proxy_connection(
            &self,
            _target: &NodeId,
            _stream_part: &StreamPartId,
            _direction: ProxyDirection,
            _user_id: &str,
        ) -> Result<()> {
            Ok(())
        }

        async fn respond_to_proxy_connection_request(
            &self,
            _target: &NodeId,
            _stream_part: &StreamPartId,
            _direction: ProxyDirection,
            _accepted: bool,
        ) -> Result<()> {
            Ok(())
        }

        async fn leave_stream_on_node(
            &self,
            _target: &NodeId,
            _stream_part: &StreamPartId,
        ) -> Result<()> {
            Ok(())
        }

        async fn send_data(&self, _target: &NodeId, _message: &StreamMessage) -> Result<()> {
            Ok(())
        }
    }

    struct NullConnector;

    #[async_trait]
    impl TrackerConnector for NullConnector {
        async fn connect(&self, _tracker_id: &TrackerId, _address: &str) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self, _tracker_id: &TrackerId) -> Result<()> {
            Ok(())
        }
    }

    fn spawn_node() -> (Node, mpsc::UnboundedReceiver<NodeEvent>) {
        let config = NodeConfig {
            trackers: vec![TrackerInfo::new("t0", "wss://t0")],
            ..NodeConfig::default()
        };
        Node::spawn(config, Arc::new(NullTransport), Arc::new(NullConnector))
    }

    fn part() -> StreamPartId {
        StreamPartId::new("feed", 0)
    }

    #[tokio::test]
    async fn subscribe_then_query() {
        let (node, _events) = spawn_node();
        node.subscribe(&part()).await.unwrap();
        assert!(node.is_set_up(&part()).await.unwrap());
        assert_eq!(node.stream_parts().await.unwrap(), vec![part()]);
        node.stop().await;
    }

    #[tokio::test]
    async fn publish_surfaces_own_message_once() {
        let (node, mut events) = spawn_node();
        node.subscribe(&part()).await.unwrap();

        let message = StreamMessage::new(part(), NodeId::from("self"), 1, b"hello".to_vec());
        node.publish(message.clone()).await.unwrap();
        node.publish(message.clone()).await.unwrap();

        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event within deadline")
            .expect("event stream open");
        assert_eq!(event, NodeEvent::UnseenMessage(message));
        // The duplicate must not produce a second event.
        assert!(events.try_recv().is_err());
        node.stop().await;
    }

    #[tokio::test]
    async fn inbound_data_auto_subscribes() {
        let (node, mut events) = spawn_node();
        let message = StreamMessage::new(part(), NodeId::from("origin"), 7, b"x".to_vec());
        node.handle_message(&NodeId::from("peer"), NodeToNodeRequest::Data(message.clone()))
            .await
            .unwrap();

        assert!(node.is_set_up(&part()).await.unwrap());
        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event within deadline")
            .expect("event stream open");
        assert_eq!(event, NodeEvent::UnseenMessage(message));
        node.stop().await;
    }

    #[tokio::test]
    async fn subscribe_conflicts_with_proxied_partition() {
        let (node, _events) = spawn_node();
        node.open_proxy_connection(
            &part(),
            &NodeId::from("proxy-peer"),
            ProxyDirection::Subscribe,
            "user1",
        )
        .await
        .unwrap();

        assert!(node.subscribe(&part()).await.is_err());
        node.stop().await;
    }

    #[tokio::test]
    async fn publish_fails_on_publish_proxied_partition() {
        let (node, _events) = spawn_node();
        node.open_proxy_connection(
            &part(),
            &NodeId::from("proxy-peer"),
            ProxyDirection::Publish,
            "user1",
        )
        .await
        .unwrap();

        let message = StreamMessage::new(part(), NodeId::from("self"), 1, b"x".to_vec());
        assert!(node.publish(message).await.is_err());
        node.stop().await;
    }

    #[tokio::test]
    async fn unsubscribe_of_unknown_partition_is_a_noop() {
        let (node, _events) = spawn_node();
        node.unsubscribe(&part()).await.unwrap();
        node.stop().await;
    }

    #[tokio::test]
    async fn stop_twice_is_silent() {
        let (node, _events) = spawn_node();
        node.stop().await;
        node.stop().await;
        // The handle degrades gracefully after shutdown.
        assert!(node.is_set_up(&part()).await.is_err());
    }

    #[tokio::test]
    async fn membership_changes_are_observable() {
        let (node, _events) = spawn_node();
        let mut changes = node.subscribe_membership_changes().await.unwrap();
        node.subscribe(&part()).await.unwrap();
        node.add_full_neighbor(&part(), &NodeId::from("peer"))
            .await
            .unwrap();

        let first = timeout(Duration::from_secs(1), changes.recv())
            .await
            .expect("change within deadline")
            .expect("change stream open");
        assert_eq!(first, MembershipEvent::StreamPartAdded(part()));
        let second = timeout(Duration::from_secs(1), changes.recv())
            .await
            .expect("change within deadline")
            .expect("change stream open");
        assert_eq!(
            second,
            MembershipEvent::NeighborAdded {
                stream_part: part(),
                node: NodeId::from("peer"),
            }
        );
        node.stop().await;
    }
}
