//! # Stream Partition Membership
//!
//! The [`StreamPartManager`] is the authoritative in-memory record of, per
//! stream partition, which peers are full (bidirectional) neighbors and which
//! are one-way inbound/outbound proxy neighbors, and whether the partition is
//! "behind proxy" (no full-mesh membership at all).
//!
//! ## Neighbor Sets
//!
//! | Set | Data flow | Populated by |
//! |-----|-----------|--------------|
//! | full | both directions | tracker-assisted mesh formation |
//! | in-only | peer → self | accepted PUBLISH proxies |
//! | out-only | self → peer | accepted SUBSCRIBE proxies |
//!
//! ## Invariants
//!
//! - A node is never simultaneously a full neighbor and a one-way neighbor
//!   for the same partition.
//! - A node is never in both one-way sets at once; adding one direction while
//!   the opposite exists is an inconsistent-state fault and is returned as a
//!   loud error rather than silently ignored.
//! - A partition that is not set up has no neighbor sets at all: `is_set_up`
//!   is simply entry existence.
//!
//! ## Change Notifications
//!
//! Registered listeners receive exactly one [`MembershipEvent`] per actual
//! state change, delivered in mutation order over unbounded channels. No-op
//! calls (idempotent set-up, duplicate adds, removing an absent node) emit
//! nothing. Closed receivers are pruned on the next send.

use std::collections::{HashMap, HashSet};
use std::fmt;

use tokio::sync::mpsc;
use tracing::trace;

use crate::identifiers::{NodeId, StreamPartId};

// ============================================================================
// Events and errors
// ============================================================================

/// A membership state change, delivered to registered listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipEvent {
    StreamPartAdded(StreamPartId),
    StreamPartRemoved(StreamPartId),
    NeighborAdded {
        stream_part: StreamPartId,
        node: NodeId,
    },
    NeighborRemoved {
        stream_part: StreamPartId,
        node: NodeId,
    },
}

/// Faults indicating a caller or protocol-logic bug.
///
/// These are returned loudly: silently ignoring them would corrupt the
/// membership invariants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipError {
    /// The partition has not been set up.
    NotSetUp(StreamPartId),
    /// Adding a relation that contradicts an existing one for the same peer.
    InconsistentRelation {
        stream_part: StreamPartId,
        node: NodeId,
        existing: &'static str,
    },
}

impl fmt::Display for MembershipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipError::NotSetUp(sp) => {
                write!(f, "stream partition {sp} is not set up")
            }
            MembershipError::InconsistentRelation {
                stream_part,
                node,
                existing,
            } => write!(
                f,
                "node {node} already has a {existing} relation for {stream_part}"
            ),
        }
    }
}

impl std::error::Error for MembershipError {}

// ============================================================================
// StreamPartManager
// ============================================================================

#[derive(Debug, Default)]
struct StreamPartEntry {
    neighbors: HashSet<NodeId>,
    in_only: HashSet<NodeId>,
    out_only: HashSet<NodeId>,
    behind_proxy: bool,
}

impl StreamPartEntry {
    fn contains(&self, node: &NodeId) -> bool {
        self.neighbors.contains(node) || self.in_only.contains(node) || self.out_only.contains(node)
    }

    fn all_nodes(&self) -> Vec<NodeId> {
        self.neighbors
            .iter()
            .chain(self.in_only.iter())
            .chain(self.out_only.iter())
            .cloned()
            .collect()
    }
}

/// Authoritative per-partition membership table.
#[derive(Debug, Default)]
pub struct StreamPartManager {
    streams: HashMap<StreamPartId, StreamPartEntry>,
    listeners: Vec<mpsc::UnboundedSender<MembershipEvent>>,
}

impl StreamPartManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a membership-change listener.
    ///
    /// Every subsequent state change is delivered to the returned receiver in
    /// mutation order.
    pub fn subscribe_changes(&mut self) -> mpsc::UnboundedReceiver<MembershipEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push(tx);
        rx
    }

    fn emit(&mut self, event: MembershipEvent) {
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Create an entry for the partition. Idempotent: re-setting an existing
    /// partition changes nothing and emits nothing.
    pub fn set_up_stream_part(&mut self, stream_part: &StreamPartId, behind_proxy: bool) {
        if self.streams.contains_key(stream_part) {
            return;
        }
        self.streams.insert(
            stream_part.clone(),
            StreamPartEntry {
                behind_proxy,
                ..Default::default()
            },
        );
        trace!(%stream_part, behind_proxy, "stream partition set up");
        self.emit(MembershipEvent::StreamPartAdded(stream_part.clone()));
    }

    /// Remove the partition entry and all its neighbor sets.
    /// Teardown is always safe: removing an absent partition is a no-op.
    pub fn remove_stream_part(&mut self, stream_part: &StreamPartId) {
        if self.streams.remove(stream_part).is_some() {
            trace!(%stream_part, "stream partition removed");
            self.emit(MembershipEvent::StreamPartRemoved(stream_part.clone()));
        }
    }

    pub fn is_set_up(&self, stream_part: &StreamPartId) -> bool {
        self.streams.contains_key(stream_part)
    }

    pub fn is_behind_proxy(&self, stream_part: &StreamPartId) -> bool {
        self.streams
            .get(stream_part)
            .map(|e| e.behind_proxy)
            .unwrap_or(false)
    }

    /// All set-up partitions.
    pub fn stream_parts(&self) -> Vec<StreamPartId> {
        self.streams.keys().cloned().collect()
    }

    /// Add a full bidirectional neighbor.
    pub fn add_neighbor(
        &mut self,
        stream_part: &StreamPartId,
        node: NodeId,
    ) -> Result<(), MembershipError> {
        let entry = self
            .streams
            .get_mut(stream_part)
            .ok_or_else(|| MembershipError::NotSetUp(stream_part.clone()))?;
        if entry.in_only.contains(&node) || entry.out_only.contains(&node) {
            return Err(MembershipError::InconsistentRelation {
                stream_part: stream_part.clone(),
                node,
                existing: "one-way",
            });
        }
        if entry.neighbors.insert(node.clone()) {
            self.emit(MembershipEvent::NeighborAdded {
                stream_part: stream_part.clone(),
                node,
            });
        }
        Ok(())
    }

    /// Add a one-way inbound neighbor (data flows peer → self).
    pub fn add_in_only_neighbor(
        &mut self,
        stream_part: &StreamPartId,
        node: NodeId,
    ) -> Result<(), MembershipError> {
        let entry = self
            .streams
            .get_mut(stream_part)
            .ok_or_else(|| MembershipError::NotSetUp(stream_part.clone()))?;
        if entry.neighbors.contains(&node) {
            return Err(MembershipError::InconsistentRelation {
                stream_part: stream_part.clone(),
                node,
                existing: "full-neighbor",
            });
        }
        if entry.out_only.contains(&node) {
            return Err(MembershipError::InconsistentRelation {
                stream_part: stream_part.clone(),
                node,
                existing: "outbound-only",
            });
        }
        if entry.in_only.insert(node.clone()) {
            self.emit(MembershipEvent::NeighborAdded {
                stream_part: stream_part.clone(),
                node,
            });
        }
        Ok(())
    }

    /// Add a one-way outbound neighbor (data flows self → peer).
    pub fn add_out_only_neighbor(
        &mut self,
        stream_part: &StreamPartId,
        node: NodeId,
    ) -> Result<(), MembershipError> {
        let entry = self
            .streams
            .get_mut(stream_part)
            .ok_or_else(|| MembershipError::NotSetUp(stream_part.clone()))?;
        if entry.neighbors.contains(&node) {
            return Err(MembershipError::InconsistentRelation {
                stream_part: stream_part.clone(),
                node,
                existing: "full-neighbor",
            });
        }
        if entry.in_only.contains(&node) {
            return Err(MembershipError::InconsistentRelation {
                stream_part: stream_part.clone(),
                node,
                existing: "inbound-only",
            });
        }
        if entry.out_only.insert(node.clone()) {
            self.emit(MembershipEvent::NeighborAdded {
                stream_part: stream_part.clone(),
                node,
            });
        }
        Ok(())
    }

    /// Remove a node from every neighbor set of the partition.
    /// Removing an absent node or from an absent partition is a no-op.
    pub fn remove_node_from_stream_part(&mut self, stream_part: &StreamPartId, node: &NodeId) {
        let removed = match self.streams.get_mut(stream_part) {
            Some(entry) => {
                entry.neighbors.remove(node)
                    | entry.in_only.remove(node)
                    | entry.out_only.remove(node)
            }
            None => false,
        };
        if removed {
            self.emit(MembershipEvent::NeighborRemoved {
                stream_part: stream_part.clone(),
                node: node.clone(),
            });
        }
    }

    /// All nodes related to the partition, across all three sets.
    pub fn list_all_nodes(&self, stream_part: &StreamPartId) -> Vec<NodeId> {
        self.streams
            .get(stream_part)
            .map(|e| e.all_nodes())
            .unwrap_or_default()
    }

    /// Full bidirectional neighbors only.
    pub fn list_neighbors(&self, stream_part: &StreamPartId) -> Vec<NodeId> {
        self.streams
            .get(stream_part)
            .map(|e| e.neighbors.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Outbound-only neighbors (targets of proxy publish).
    pub fn list_out_only_neighbors(&self, stream_part: &StreamPartId) -> Vec<NodeId> {
        self.streams
            .get(stream_part)
            .map(|e| e.out_only.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_neighbor(&self, stream_part: &StreamPartId, node: &NodeId) -> bool {
        self.streams
            .get(stream_part)
            .map(|e| e.neighbors.contains(node))
            .unwrap_or(false)
    }

    pub fn has_in_only_connection(&self, stream_part: &StreamPartId, node: &NodeId) -> bool {
        self.streams
            .get(stream_part)
            .map(|e| e.in_only.contains(node))
            .unwrap_or(false)
    }

    pub fn has_out_only_connection(&self, stream_part: &StreamPartId, node: &NodeId) -> bool {
        self.streams
            .get(stream_part)
            .map(|e| e.out_only.contains(node))
            .unwrap_or(false)
    }

    /// True if the node has a one-way relation in either direction.
    pub fn has_oneway_connection(&self, stream_part: &StreamPartId, node: &NodeId) -> bool {
        self.has_in_only_connection(stream_part, node)
            || self.has_out_only_connection(stream_part, node)
    }

    /// True if the node is related to the partition in any way.
    pub fn has_node(&self, stream_part: &StreamPartId, node: &NodeId) -> bool {
        self.streams
            .get(stream_part)
            .map(|e| e.contains(node))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part() -> StreamPartId {
        StreamPartId::new("feed", 0)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<MembershipEvent>) -> Vec<MembershipEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn set_up_is_idempotent_and_emits_once() {
        let mut mgr = StreamPartManager::new();
        let mut rx = mgr.subscribe_changes();

        mgr.set_up_stream_part(&part(), false);
        mgr.set_up_stream_part(&part(), false);

        assert!(mgr.is_set_up(&part()));
        assert_eq!(drain(&mut rx), vec![MembershipEvent::StreamPartAdded(part())]);
    }

    #[test]
    fn teardown_is_always_safe() {
        let mut mgr = StreamPartManager::new();
        let mut rx = mgr.subscribe_changes();

        // Absent partition: silent no-op.
        mgr.remove_stream_part(&part());
        assert!(drain(&mut rx).is_empty());

        mgr.set_up_stream_part(&part(), true);
        mgr.remove_stream_part(&part());
        assert!(!mgr.is_set_up(&part()));
        assert_eq!(
            drain(&mut rx),
            vec![
                MembershipEvent::StreamPartAdded(part()),
                MembershipEvent::StreamPartRemoved(part()),
            ]
        );
    }

    #[test]
    fn torn_down_partition_has_empty_sets() {
        let mut mgr = StreamPartManager::new();
        mgr.set_up_stream_part(&part(), false);
        mgr.add_neighbor(&part(), NodeId::from("a")).unwrap();
        mgr.remove_stream_part(&part());

        assert!(!mgr.is_set_up(&part()));
        assert!(mgr.list_all_nodes(&part()).is_empty());
        assert!(!mgr.has_neighbor(&part(), &NodeId::from("a")));
    }

    #[test]
    fn full_and_oneway_are_mutually_exclusive() {
        let mut mgr = StreamPartManager::new();
        mgr.set_up_stream_part(&part(), false);
        let a = NodeId::from("a");

        mgr.add_neighbor(&part(), a.clone()).unwrap();
        assert!(mgr.add_in_only_neighbor(&part(), a.clone()).is_err());
        assert!(mgr.add_out_only_neighbor(&part(), a.clone()).is_err());

        // The other way around.
        let b = NodeId::from("b");
        mgr.add_in_only_neighbor(&part(), b.clone()).unwrap();
        assert!(mgr.add_neighbor(&part(), b.clone()).is_err());
    }

    #[test]
    fn opposite_oneway_directions_conflict() {
        let mut mgr = StreamPartManager::new();
        mgr.set_up_stream_part(&part(), true);
        let a = NodeId::from("a");

        mgr.add_out_only_neighbor(&part(), a.clone()).unwrap();
        let err = mgr.add_in_only_neighbor(&part(), a.clone()).unwrap_err();
        assert!(matches!(err, MembershipError::InconsistentRelation { .. }));

        // The failed add must not have mutated anything.
        assert!(mgr.has_out_only_connection(&part(), &a));
        assert!(!mgr.has_in_only_connection(&part(), &a));
    }

    #[test]
    fn adding_to_unset_partition_is_loud() {
        let mut mgr = StreamPartManager::new();
        let err = mgr.add_neighbor(&part(), NodeId::from("a")).unwrap_err();
        assert_eq!(err, MembershipError::NotSetUp(part()));
    }

    #[test]
    fn duplicate_adds_emit_nothing() {
        let mut mgr = StreamPartManager::new();
        mgr.set_up_stream_part(&part(), false);
        let mut rx = mgr.subscribe_changes();
        let a = NodeId::from("a");

        mgr.add_neighbor(&part(), a.clone()).unwrap();
        mgr.add_neighbor(&part(), a.clone()).unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![MembershipEvent::NeighborAdded {
                stream_part: part(),
                node: a,
            }]
        );
    }

    #[test]
    fn remove_node_clears_every_set_and_emits_once() {
        let mut mgr = StreamPartManager::new();
        mgr.set_up_stream_part(&part(), true);
        let a = NodeId::from("a");
        mgr.add_out_only_neighbor(&part(), a.clone()).unwrap();
        let mut rx = mgr.subscribe_changes();

        mgr.remove_node_from_stream_part(&part(), &a);
        assert!(!mgr.has_node(&part(), &a));
        assert_eq!(
            drain(&mut rx),
            vec![MembershipEvent::NeighborRemoved {
                stream_part: part(),
                node: a.clone(),
            }]
        );

        // Removing again: silent.
        mgr.remove_node_from_stream_part(&part(), &a);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn oneway_queries() {
        let mut mgr = StreamPartManager::new();
        mgr.set_up_stream_part(&part(), true);
        let a = NodeId::from("a");
        let b = NodeId::from("b");

        mgr.add_in_only_neighbor(&part(), a.clone()).unwrap();
        mgr.add_out_only_neighbor(&part(), b.clone()).unwrap();

        assert!(mgr.has_oneway_connection(&part(), &a));
        assert!(mgr.has_oneway_connection(&part(), &b));
        assert!(mgr.has_in_only_connection(&part(), &a));
        assert!(!mgr.has_in_only_connection(&part(), &b));
        assert_eq!(mgr.list_out_only_neighbors(&part()), vec![b]);
        assert_eq!(mgr.list_all_nodes(&part()).len(), 2);
    }

    #[test]
    fn closed_listener_is_pruned() {
        let mut mgr = StreamPartManager::new();
        let rx = mgr.subscribe_changes();
        drop(rx);
        // Must not panic or error once the receiver is gone.
        mgr.set_up_stream_part(&part(), false);
        assert!(mgr.listeners.is_empty());
    }
}
