//! # Tracker Session Manager
//!
//! The [`TrackerManager`] owns the mapping from stream partitions to the
//! tracker responsible for them and the lifecycle of "signalling-only"
//! tracker sessions: connections opened solely to mediate a proxy
//! negotiation and closed again afterwards.
//!
//! ## Tracker Assignment
//!
//! Partition-to-tracker assignment is deterministic: the blake3 hash of the
//! partition's textual id selects an index into the configured tracker list.
//! Every node with the same tracker list therefore agrees on which tracker
//! mediates a given partition. The tracker's own peer-selection policy is an
//! external concern.
//!
//! ## Reference-Counted Signalling Sessions
//!
//! Several proxy negotiations may need the same tracker at once. Sessions are
//! reference-counted: the first acquire opens the connection through the
//! [`TrackerConnector`] collaborator, later acquires only increment, and the
//! connection is closed when the last holder releases it. Releasing an
//! unknown tracker is a logged no-op, so release can sit on every cleanup
//! path unconditionally.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::identifiers::{StreamPartId, TrackerId};
use crate::protocols::TrackerConnector;

/// One configured tracker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackerInfo {
    pub id: TrackerId,
    pub address: String,
}

impl TrackerInfo {
    pub fn new(id: impl Into<TrackerId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

/// Tracker registry plus ref-counted signalling-only sessions.
pub struct TrackerManager<C: TrackerConnector> {
    connector: Arc<C>,
    trackers: Vec<TrackerInfo>,
    signalling_refs: HashMap<TrackerId, usize>,
}

impl<C: TrackerConnector> TrackerManager<C> {
    /// `trackers` must be non-empty and identically ordered on every node.
    pub fn new(connector: Arc<C>, trackers: Vec<TrackerInfo>) -> Self {
        Self {
            connector,
            trackers,
            signalling_refs: HashMap::new(),
        }
    }

    /// The tracker responsible for `stream_part`.
    pub fn tracker_for(&self, stream_part: &StreamPartId) -> Result<&TrackerInfo> {
        if self.trackers.is_empty() {
            anyhow::bail!("no trackers configured");
        }
        let digest = blake3::hash(stream_part.to_string().as_bytes());
        let index = u64::from_le_bytes(
            digest.as_bytes()[..8]
                .try_into()
                .expect("blake3 digest is 32 bytes"),
        ) as usize
            % self.trackers.len();
        Ok(&self.trackers[index])
    }

    pub fn get_tracker_id(&self, stream_part: &StreamPartId) -> Result<TrackerId> {
        Ok(self.tracker_for(stream_part)?.id.clone())
    }

    pub fn get_tracker_address(&self, stream_part: &StreamPartId) -> Result<String> {
        Ok(self.tracker_for(stream_part)?.address.clone())
    }

    /// Acquire a signalling-only session to the tracker.
    ///
    /// Opens the connection on the first acquire; later acquires for the same
    /// tracker only increment the reference count.
    pub async fn connect_to_signalling_only_tracker(
        &mut self,
        tracker_id: &TrackerId,
        address: &str,
    ) -> Result<()> {
        if self.signalling_ref_count(tracker_id) == 0 {
            self.connector
                .connect(tracker_id, address)
                .await
                .with_context(|| format!("failed to connect to signalling tracker {tracker_id}"))?;
            debug!(%tracker_id, %address, "signalling-only tracker connected");
        }
        *self.signalling_refs.entry(tracker_id.clone()).or_insert(0) += 1;
        Ok(())
    }

    /// Release a signalling-only session.
    ///
    /// Disconnects when the last holder releases; earlier releases only
    /// decrement, so concurrent negotiations sharing the tracker never
    /// disconnect it prematurely. Releasing an unheld tracker is a no-op.
    pub async fn disconnect_from_signalling_only_tracker(&mut self, tracker_id: &TrackerId) {
        match self.signalling_refs.get_mut(tracker_id) {
            Some(refs) if *refs > 1 => {
                *refs -= 1;
            }
            Some(_) => {
                self.signalling_refs.remove(tracker_id);
                if let Err(e) = self.connector.disconnect(tracker_id).await {
                    warn!(%tracker_id, error = %e, "signalling tracker disconnect failed");
                } else {
                    debug!(%tracker_id, "signalling-only tracker disconnected");
                }
            }
            None => {
                debug!(%tracker_id, "release of unheld signalling tracker ignored");
            }
        }
    }

    /// Current reference count for a tracker (test observability).
    pub fn signalling_ref_count(&self, tracker_id: &TrackerId) -> usize {
        self.signalling_refs.get(tracker_id).copied().unwrap_or(0)
    }
}
