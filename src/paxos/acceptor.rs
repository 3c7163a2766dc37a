use bytes::Bytes;

use crate::paxos::error::PaxosResult;
use crate::paxos::log::Log;
use crate::paxos::message::InstanceRecord;
use crate::paxos::{InstanceId, View};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposeOutcome {
    // The value is now held for the proposal's view. "changed" is set if the
    // instance was modified and has to be written to durable storage.
    Accepted { changed: bool },

    // The instance lies past our window. We are behind and need to catch up.
    OutsideWindow,

    // We already moved the instance to a higher view.
    Stale,

    // The instance is decided (or compacted) already and the value matches.
    AlreadyDecided,
}

// Handles a phase 2 proposal. The caller has already checked that the
// proposal's view is the current one, so the promise is honored. Proposing a
// different value for a decided instance is fatal.
pub fn on_propose(
    log: &mut Log,
    window: usize,
    view: View,
    id: InstanceId,
    value: Bytes,
) -> PaxosResult<ProposeOutcome> {
    if log.is_compacted(id) {
        return Ok(ProposeOutcome::AlreadyDecided);
    }
    if !log.is_in_window(id, window) {
        return Ok(ProposeOutcome::OutsideWindow);
    }

    let instance = log.instance_mut(id)?;
    if instance.is_decided() {
        instance.set_value(view, value)?;
        return Ok(ProposeOutcome::AlreadyDecided);
    }
    if instance.view() > view {
        return Ok(ProposeOutcome::Stale);
    }
    let changed = instance.set_value(view, value)?;
    Ok(ProposeOutcome::Accepted { changed })
}

// Returns what we report to a new leader running phase 1 from the supplied
// instance on.
pub fn on_prepare(log: &Log, from: InstanceId) -> Vec<InstanceRecord> {
    log.records_from(from)
}
