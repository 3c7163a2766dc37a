use std::collections::BTreeSet;

use bytes::Bytes;

use crate::paxos::error::{PaxosError, PaxosResult};
use crate::paxos::{InstanceId, ReplicaId, View};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstanceState {
    // Nothing has been proposed for this instance as far as we know.
    Unknown,

    // We hold a value for the instance's view but it isn't decided yet.
    Known,

    // A majority accepted the value. Immutable from now on.
    Decided,
}

impl InstanceState {
    pub fn tag(&self) -> u8 {
        match self {
            InstanceState::Unknown => 0,
            InstanceState::Known => 1,
            InstanceState::Decided => 2,
        }
    }

    pub fn from_tag(tag: u8) -> PaxosResult<Self> {
        match tag {
            0 => Ok(InstanceState::Unknown),
            1 => Ok(InstanceState::Known),
            2 => Ok(InstanceState::Decided),
            other => Err(PaxosError::Malformed(format!(
                "Unknown instance state {}",
                other
            ))),
        }
    }
}

// One position of the replicated log. Moves from unknown to known to decided,
// never backwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusInstance {
    id: InstanceId,
    view: View,
    value: Option<Bytes>,
    state: InstanceState,

    // Replicas known to have accepted (view, value). Cleared whenever the view
    // changes and once decided.
    accepts: BTreeSet<ReplicaId>,
}

impl ConsensusInstance {
    pub fn new(id: InstanceId) -> Self {
        ConsensusInstance {
            id,
            view: 0,
            value: None,
            state: InstanceState::Unknown,
            accepts: BTreeSet::new(),
        }
    }

    // Rebuilds an instance from durable storage.
    pub fn restored(id: InstanceId, view: View, value: Option<Bytes>, decided: bool) -> Self {
        let state = match (&value, decided) {
            (None, _) => InstanceState::Unknown,
            (Some(_), false) => InstanceState::Known,
            (Some(_), true) => InstanceState::Decided,
        };
        ConsensusInstance {
            id,
            view,
            value,
            state,
            accepts: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn is_decided(&self) -> bool {
        self.state == InstanceState::Decided
    }

    pub fn accepts(&self) -> &BTreeSet<ReplicaId> {
        &self.accepts
    }

    // Records that the supplied replica accepted the current (view, value).
    // Returns the number of distinct acceptors so far.
    pub fn record_accept(&mut self, replica: ReplicaId) -> usize {
        self.accepts.insert(replica);
        self.accepts.len()
    }

    // Moves the instance to a higher view. Any acceptances gathered for the old
    // view no longer count.
    pub fn set_view(&mut self, view: View) -> PaxosResult<()> {
        if view < self.view {
            return Err(PaxosError::Invariant(format!(
                "Instance {} view would decrease from {} to {}",
                self.id, self.view, view
            )));
        }
        if self.is_decided() {
            return Err(PaxosError::Invariant(format!(
                "Instance {} is decided, cannot move to view {}",
                self.id, view
            )));
        }
        if view > self.view {
            self.accepts.clear();
            self.view = view;
        }
        Ok(())
    }

    // Adopts the supplied value for the supplied view, as an acceptor does on a
    // proposal. Returns whether anything changed, in which case the caller may
    // need to persist the instance.
    pub fn set_value(&mut self, view: View, value: Bytes) -> PaxosResult<bool> {
        if self.is_decided() {
            if self.value.as_ref() != Some(&value) {
                return Err(PaxosError::ConflictingDecision {
                    instance: self.id,
                    decided_view: self.view,
                    view,
                });
            }
            return Ok(false);
        }
        if view < self.view {
            return Err(PaxosError::Invariant(format!(
                "Instance {} offered value for view {} while at view {}",
                self.id, view, self.view
            )));
        }
        if view == self.view && self.state == InstanceState::Known {
            // At most one value is ever proposed per view and instance.
            if self.value.as_ref() != Some(&value) {
                return Err(PaxosError::Invariant(format!(
                    "Instance {} got two values in view {}",
                    self.id, view
                )));
            }
            return Ok(false);
        }

        self.set_view(view)?;
        self.value = Some(value);
        self.state = InstanceState::Known;
        Ok(true)
    }

    // Marks the currently held value as decided.
    pub fn set_decided(&mut self) -> PaxosResult<()> {
        if self.value.is_none() {
            return Err(PaxosError::Invariant(format!(
                "Instance {} decided without a value",
                self.id
            )));
        }
        self.state = InstanceState::Decided;
        self.accepts.clear();
        Ok(())
    }

    // Installs a decision learned from a peer, without voting. Deciding an
    // already decided instance with a different value is fatal.
    pub fn update_from_decision(&mut self, view: View, value: Bytes) -> PaxosResult<bool> {
        if self.is_decided() {
            if self.value.as_ref() != Some(&value) {
                return Err(PaxosError::ConflictingDecision {
                    instance: self.id,
                    decided_view: self.view,
                    view,
                });
            }
            return Ok(false);
        }
        self.view = view;
        self.value = Some(value);
        self.state = InstanceState::Decided;
        self.accepts.clear();
        Ok(true)
    }

    pub fn size_bytes(&self) -> usize {
        self.value.as_ref().map(|v| v.len()).unwrap_or(0)
    }
}
