use bytes::Bytes;

use crate::paxos::cluster::Cluster;
use crate::paxos::error::{PaxosError, PaxosResult};
use crate::paxos::log::Log;
use crate::paxos::{InstanceId, ReplicaId, View};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    // Counted, but no majority yet. "changed" is set if the instance adopted
    // the value carried by the accept.
    Recorded { changed: bool },

    // The accept completed a majority. The instance is now decided.
    Decided,

    // The instance lies past our window.
    OutsideWindow,

    // Nothing to do: stale, compacted or decided already.
    Ignored,
}

// Handles an Accept sent by "sender". A higher-view accept makes us adopt the
// carried value before counting, since a majority for it may form without our
// own vote.
pub fn on_accept(
    log: &mut Log,
    cluster: &Cluster,
    window: usize,
    view: View,
    id: InstanceId,
    value: Bytes,
    sender: ReplicaId,
) -> PaxosResult<AcceptOutcome> {
    if log.is_compacted(id) {
        return Ok(AcceptOutcome::Ignored);
    }
    if !log.is_in_window(id, window) {
        return Ok(AcceptOutcome::OutsideWindow);
    }

    let instance = log.instance_mut(id)?;
    if instance.is_decided() {
        // Lower views may legitimately carry other values. From the decided
        // view on, every accept must carry the decided one.
        if view >= instance.view() && instance.value() != Some(&value) {
            return Err(PaxosError::ConflictingDecision {
                instance: id,
                decided_view: instance.view(),
                view,
            });
        }
        return Ok(AcceptOutcome::Ignored);
    }
    if instance.view() > view {
        return Ok(AcceptOutcome::Ignored);
    }

    let changed = instance.set_value(view, value)?;
    record_accepts(log, cluster, id, &[sender]).map(|decided| {
        if decided {
            AcceptOutcome::Decided
        } else {
            AcceptOutcome::Recorded { changed }
        }
    })
}

// Counts the supplied replicas as having accepted the instance's current value
// and marks the instance decided once a majority did. Returns whether this
// call decided the instance.
pub fn record_accepts(
    log: &mut Log,
    cluster: &Cluster,
    id: InstanceId,
    replicas: &[ReplicaId],
) -> PaxosResult<bool> {
    let instance = log.instance_mut(id)?;
    if instance.is_decided() {
        return Ok(false);
    }
    let mut count = instance.accepts().len();
    for replica in replicas {
        count = instance.record_accept(*replica);
    }
    if cluster.is_majority(count) {
        instance.set_decided()?;
        return Ok(true);
    }
    Ok(false)
}
