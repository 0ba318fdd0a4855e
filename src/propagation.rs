//! # Propagation Engine
//!
//! Given a message accepted for a stream partition, the [`Propagation`]
//! engine decides which neighbors receive it: every full neighbor plus every
//! outbound-only proxy neighbor, minus the peer the message arrived from
//! (no send-back) and minus peers already known to have seen the message id.
//!
//! ## Deduplication
//!
//! A bounded LRU history maps recently handled message ids to the set of
//! peers known to possess them. The first sighting of an id returns
//! `first_seen = true` so the node layer delivers it locally exactly once;
//! later sightings only record the additional sender. Entries expire after a
//! TTL and the oldest entry is evicted when the cache is full.
//!
//! ## Newly Joined Neighbors
//!
//! [`Propagation::on_neighbor_joined`] clears any stale possession state for
//! the peer so it is immediately eligible for subsequent messages. There is
//! no retroactive backfill of already-propagated history: historical delivery
//! is the storage collaborator's responsibility, not the overlay's.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::trace;

use crate::identifiers::{NodeId, StreamPartId};
use crate::membership::StreamPartManager;
use crate::messages::{MessageId, StreamMessage};

/// Default number of message ids remembered for deduplication.
pub const DEFAULT_DEDUP_CACHE_SIZE: usize = 10_000;

/// Default time-to-live of a dedup entry.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(30);

/// Possession record for one message id.
#[derive(Debug)]
struct SeenRecord {
    stream_part: StreamPartId,
    first_seen: Instant,
    seen_by: HashSet<NodeId>,
}

/// Outcome of feeding one message through the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropagationDecision {
    /// True if this message id had not been handled before (deliver locally).
    pub first_seen: bool,
    /// Neighbors to forward the message to, in stable order.
    pub targets: Vec<NodeId>,
}

/// Forward-target computation with bounded dedup history.
#[derive(Debug)]
pub struct Propagation {
    seen: LruCache<MessageId, SeenRecord>,
    ttl: Duration,
}

impl Propagation {
    pub fn new(cache_size: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: LruCache::new(capacity),
            ttl,
        }
    }

    /// Compute forward targets for `message`, updating the dedup history.
    ///
    /// `source` is the previous hop (None for a local publish). Targets and
    /// the source are recorded as possessing the message so repeated
    /// sightings never forward to the same peer twice.
    pub fn feed_message(
        &mut self,
        streams: &StreamPartManager,
        message: &StreamMessage,
        source: Option<&NodeId>,
    ) -> PropagationDecision {
        let id = message.id();
        let now = Instant::now();

        // An expired record counts as never seen.
        if let Some(record) = self.seen.peek(&id) {
            if now.duration_since(record.first_seen) > self.ttl {
                self.seen.pop(&id);
            }
        }

        if let Some(record) = self.seen.get_mut(&id) {
            // Duplicate hop: record the extra possessor, nothing to forward.
            if let Some(source) = source {
                record.seen_by.insert(source.clone());
            }
            trace!(stream_part = %message.stream_part, "duplicate message, not forwarding");
            return PropagationDecision {
                first_seen: false,
                targets: Vec::new(),
            };
        }

        let mut seen_by = HashSet::new();
        if let Some(source) = source {
            seen_by.insert(source.clone());
        }
        let mut targets: Vec<NodeId> = streams
            .list_neighbors(&message.stream_part)
            .into_iter()
            .chain(streams.list_out_only_neighbors(&message.stream_part))
            .filter(|n| !seen_by.contains(n))
            .collect();
        targets.sort();
        targets.dedup();
        seen_by.extend(targets.iter().cloned());

        self.seen.put(
            id,
            SeenRecord {
                stream_part: message.stream_part.clone(),
                first_seen: now,
                seen_by,
            },
        );

        trace!(
            stream_part = %message.stream_part,
            target_count = targets.len(),
            "computed forward targets"
        );
        PropagationDecision {
            first_seen: true,
            targets,
        }
    }

    /// A neighbor joined the partition: drop any stale possession state so it
    /// is eligible for subsequent messages immediately. No backfill of
    /// already-propagated history is performed.
    pub fn on_neighbor_joined(&mut self, node: &NodeId, stream_part: &StreamPartId) {
        for (_, record) in self.seen.iter_mut() {
            if record.stream_part == *stream_part {
                record.seen_by.remove(node);
            }
        }
        trace!(%node, %stream_part, "neighbor joined, marked eligible for propagation");
    }

    /// Number of live dedup entries (test observability).
    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }
}

impl Default for Propagation {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CACHE_SIZE, DEFAULT_DEDUP_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part() -> StreamPartId {
        StreamPartId::new("feed", 0)
    }

    fn message(seqno: u64) -> StreamMessage {
        StreamMessage::new(part(), NodeId::from("publisher"), seqno, b"data".to_vec())
    }

    fn manager_with_neighbors(full: &[&str], out_only: &[&str]) -> StreamPartManager {
        let mut mgr = StreamPartManager::new();
        mgr.set_up_stream_part(&part(), false);
        for n in full {
            mgr.add_neighbor(&part(), NodeId::from(*n)).unwrap();
        }
        for n in out_only {
            mgr.add_out_only_neighbor(&part(), NodeId::from(*n)).unwrap();
        }
        mgr
    }

    #[test]
    fn forwards_to_full_and_out_only_neighbors() {
        let mgr = manager_with_neighbors(&["a", "b"], &["c"]);
        let mut prop = Propagation::default();

        let decision = prop.feed_message(&mgr, &message(1), None);
        assert!(decision.first_seen);
        assert_eq!(
            decision.targets,
            vec![NodeId::from("a"), NodeId::from("b"), NodeId::from("c")]
        );
    }

    #[test]
    fn never_sends_back_to_source() {
        let mgr = manager_with_neighbors(&["a", "b"], &[]);
        let mut prop = Propagation::default();

        let decision = prop.feed_message(&mgr, &message(1), Some(&NodeId::from("a")));
        assert_eq!(decision.targets, vec![NodeId::from("b")]);
    }

    #[test]
    fn duplicate_is_not_forwarded_again() {
        let mgr = manager_with_neighbors(&["a", "b"], &[]);
        let mut prop = Propagation::default();

        let first = prop.feed_message(&mgr, &message(1), Some(&NodeId::from("a")));
        assert!(first.first_seen);
        assert_eq!(first.targets, vec![NodeId::from("b")]);

        // Same message arrives again from b: both hops accounted for, no
        // further forwarding.
        let second = prop.feed_message(&mgr, &message(1), Some(&NodeId::from("b")));
        assert!(!second.first_seen);
        assert!(second.targets.is_empty());
    }

    #[test]
    fn distinct_messages_are_independent() {
        let mgr = manager_with_neighbors(&["a"], &[]);
        let mut prop = Propagation::default();

        assert!(prop.feed_message(&mgr, &message(1), None).first_seen);
        assert!(prop.feed_message(&mgr, &message(2), None).first_seen);
        assert_eq!(prop.seen_len(), 2);
    }

    #[test]
    fn expired_entry_counts_as_unseen() {
        let mgr = manager_with_neighbors(&["a"], &[]);
        let mut prop = Propagation::new(16, Duration::from_millis(0));

        assert!(prop.feed_message(&mgr, &message(1), None).first_seen);
        std::thread::sleep(Duration::from_millis(5));
        assert!(prop.feed_message(&mgr, &message(1), None).first_seen);
    }

    #[test]
    fn cache_is_bounded() {
        let mgr = manager_with_neighbors(&[], &[]);
        let mut prop = Propagation::new(4, Duration::from_secs(60));
        for seqno in 0..100 {
            prop.feed_message(&mgr, &message(seqno), None);
        }
        assert_eq!(prop.seen_len(), 4);
    }

    #[test]
    fn neighbor_joined_clears_stale_possession() {
        let mgr = manager_with_neighbors(&["a"], &[]);
        let mut prop = Propagation::default();
        let msg = message(1);

        // "a" saw the message as the previous hop.
        prop.feed_message(&mgr, &msg, Some(&NodeId::from("a")));
        prop.on_neighbor_joined(&NodeId::from("a"), &part());

        // Duplicate arrivals still don't re-forward, but the stale possession
        // state for "a" is gone.
        let decision = prop.feed_message(&mgr, &msg, Some(&NodeId::from("b")));
        assert!(!decision.first_seen);
    }
}
