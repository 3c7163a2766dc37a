use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::paxos::cluster::Cluster;
use crate::paxos::error::{PaxosError, PaxosResult};
use crate::paxos::instance::InstanceState;
use crate::paxos::log::Log;
use crate::paxos::message::{DecidedRecord, InstanceRecord};
use crate::paxos::request;
use crate::paxos::{InstanceId, ReplicaId, View};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposerState {
    Inactive,

    // Phase 1 is in flight for the current view.
    Preparing,

    // A majority promised. New instances can be proposed.
    Prepared,
}

// What the dispatcher has to do after folding one phase 1 response into the
// proposer.
#[derive(Debug, Default)]
pub struct Phase1Merge {
    // Instances the responder already knows to be decided.
    pub decided: Vec<DecidedRecord>,

    // Set once the response completed a majority.
    pub prepared: bool,
}

// Leader side of the protocol. Holds no consensus state of its own; it only
// remembers what it learned in phase 1 and which proposals are still
// outstanding. The dispatcher owns the log and does all the sending.
pub struct Proposer {
    cluster: Cluster,
    retransmit_timeout: Duration,
    state: ProposerState,
    view: View,

    // Phase 1 covers every instance from here on.
    prepare_from: InstanceId,
    promised: BTreeSet<ReplicaId>,
    phase1_deadline: Option<Instant>,

    // Highest-view value reported for each instance during phase 1.
    recovered: BTreeMap<InstanceId, (View, Bytes)>,

    // Highest compaction point reported during phase 1. Nothing below it may
    // be proposed since those instances are decided somewhere.
    highest_truncation: InstanceId,

    // Values that must be proposed again once prepared, in id order.
    reproposals: BTreeMap<InstanceId, Bytes>,

    // Undecided instances proposed in this view, with their retransmit deadline.
    in_flight: BTreeMap<InstanceId, Instant>,

    // Every instance below this one has been taken care of in this view.
    cursor: InstanceId,
}

impl Proposer {
    pub fn new(cluster: Cluster, retransmit_timeout: Duration) -> Self {
        Proposer {
            cluster,
            retransmit_timeout,
            state: ProposerState::Inactive,
            view: 0,
            prepare_from: 0,
            promised: BTreeSet::new(),
            phase1_deadline: None,
            recovered: BTreeMap::new(),
            highest_truncation: 0,
            reproposals: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            cursor: 0,
        }
    }

    pub fn state(&self) -> ProposerState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != ProposerState::Inactive
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn prepare_from(&self) -> InstanceId {
        self.prepare_from
    }

    pub fn highest_truncation(&self) -> InstanceId {
        self.highest_truncation
    }

    // Starts phase 1 for the supplied view, covering all instances starting at
    // the log's first undecided one.
    pub fn start(
        &mut self,
        view: View,
        first_uncommitted: InstanceId,
        now: Instant,
    ) -> PaxosResult<()> {
        if !self.cluster.is_leader(view) {
            return Err(PaxosError::Invariant(format!(
                "replica {} cannot lead view {}",
                self.cluster.me(),
                view
            )));
        }
        self.stop();
        self.state = ProposerState::Preparing;
        self.view = view;
        self.prepare_from = first_uncommitted;
        self.phase1_deadline = Some(now + self.retransmit_timeout);
        Ok(())
    }

    // Abandons everything in flight. Called when a higher view is observed.
    pub fn stop(&mut self) {
        self.state = ProposerState::Inactive;
        self.promised.clear();
        self.phase1_deadline = None;
        self.recovered.clear();
        self.highest_truncation = 0;
        self.reproposals.clear();
        self.in_flight.clear();
        self.cursor = 0;
    }

    // Folds a phase 1 response into the recovered state. Responses for other
    // views, duplicates, and responses arriving after preparation are ignored.
    pub fn on_phase1_response(
        &mut self,
        sender: ReplicaId,
        view: View,
        lowest_available: InstanceId,
        records: Vec<InstanceRecord>,
    ) -> Phase1Merge {
        let mut merge = Phase1Merge::default();
        if self.state != ProposerState::Preparing || view != self.view {
            return merge;
        }
        if !self.promised.insert(sender) {
            return merge;
        }

        self.highest_truncation = self.highest_truncation.max(lowest_available);
        for record in records {
            if record.id < self.prepare_from {
                continue;
            }
            let value = match record.value {
                Some(value) => value,
                None => continue,
            };
            match record.state {
                InstanceState::Decided => merge.decided.push(DecidedRecord {
                    id: record.id,
                    view: record.view,
                    value,
                }),
                InstanceState::Known => {
                    let replace = match self.recovered.get(&record.id) {
                        Some((existing, _)) => record.view > *existing,
                        None => true,
                    };
                    if replace {
                        self.recovered.insert(record.id, (record.view, value));
                    }
                }
                InstanceState::Unknown => {}
            }
        }

        if self.cluster.is_majority(self.promised.len()) {
            self.state = ProposerState::Prepared;
            self.phase1_deadline = None;
            merge.prepared = true;
        }
        merge
    }

    // Works out which values have to be proposed before any fresh batch, now
    // that a majority has promised. Every undecided instance between the
    // start of phase 1 and the highest instance anybody mentioned is either
    // given the value from the highest view reported, or filled with a no-op.
    pub fn plan_reproposals(&mut self, log: &Log) {
        let start = self.prepare_from.max(self.highest_truncation);
        let end = self
            .recovered
            .keys()
            .next_back()
            .map(|id| id + 1)
            .unwrap_or(0)
            .max(log.next_id());

        let recovered = std::mem::take(&mut self.recovered);
        for id in start..end {
            if log.state_of(id) == InstanceState::Decided {
                continue;
            }
            let value = match recovered.get(&id) {
                Some((_, value)) => value.clone(),
                None => request::noop(),
            };
            self.reproposals.insert(id, value);
        }
        self.cursor = end;
    }

    // Instances may appear past everything phase 1 covered, e.g., when catch-up
    // delivers decisions with holes in between. Holes no one will fill are
    // filled with no-ops, which is safe since every acceptor in the majority
    // promised to report everything past the start of phase 1.
    pub fn fill_gaps(&mut self, log: &Log) {
        if self.state != ProposerState::Prepared {
            return;
        }
        while self.cursor < log.next_id() {
            let id = self.cursor;
            if log.state_of(id) != InstanceState::Decided && !self.in_flight.contains_key(&id) {
                self.reproposals.entry(id).or_insert_with(request::noop);
            }
            self.cursor += 1;
        }
    }

    // Returns the next value that has to be proposed again, skipping any that
    // got decided in the meantime. Does not remove it.
    pub fn next_reproposal(&mut self, log: &Log) -> Option<(InstanceId, Bytes)> {
        while let Some((id, value)) = self.reproposals.first_key_value() {
            if log.state_of(*id) == InstanceState::Decided {
                let id = *id;
                self.reproposals.remove(&id);
                continue;
            }
            return Some((*id, value.clone()));
        }
        None
    }

    #[cfg(test)]
    pub fn has_reproposals(&self) -> bool {
        !self.reproposals.is_empty()
    }

    // Records that the supplied instance was just proposed in phase 2.
    pub fn on_proposed(&mut self, id: InstanceId, now: Instant) {
        self.cursor = self.cursor.max(id + 1);
        self.reproposals.remove(&id);
        self.in_flight.insert(id, now + self.retransmit_timeout);
    }

    pub fn on_decided(&mut self, id: InstanceId) {
        self.in_flight.remove(&id);
        self.reproposals.remove(&id);
    }

    // Drops everything below the supplied id, which a snapshot covers.
    pub fn forget_below(&mut self, id: InstanceId) {
        self.in_flight = self.in_flight.split_off(&id);
        self.reproposals = self.reproposals.split_off(&id);
        self.cursor = self.cursor.max(id);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    // Returns the earliest point in time at which a retransmission is due.
    pub fn deadline(&self) -> Option<Instant> {
        let phase2 = self.in_flight.values().min().copied();
        match (self.phase1_deadline, phase2) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // Returns whether phase 1 should be sent again, re-arming the timer.
    pub fn phase1_due(&mut self, now: Instant) -> bool {
        match self.phase1_deadline {
            Some(deadline) if deadline <= now => {
                self.phase1_deadline = Some(now + self.retransmit_timeout);
                true
            }
            _ => false,
        }
    }

    // Returns the replicas which have not promised yet.
    pub fn missing_promises(&self) -> Vec<ReplicaId> {
        self.cluster
            .others()
            .filter(|r| !self.promised.contains(r))
            .collect()
    }

    // Returns the proposals whose retransmission is due, re-arming their timers.
    pub fn due_proposals(&mut self, now: Instant) -> Vec<InstanceId> {
        let mut due = Vec::new();
        for (id, deadline) in self.in_flight.iter_mut() {
            if *deadline <= now {
                *deadline = now + self.retransmit_timeout;
                due.push(*id);
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[test]
    fn test_start_and_prepare_with_majority() {
        let mut proposer = Proposer::new(Cluster::new(1, 5), TIMEOUT);
        let now = Instant::now();
        proposer.start(6, 3, now).unwrap();
        assert_eq!(proposer.state(), ProposerState::Preparing);
        assert_eq!(proposer.deadline(), Some(now + TIMEOUT));

        assert!(!proposer.on_phase1_response(1, 6, 0, vec![]).prepared);
        assert!(!proposer.on_phase1_response(2, 6, 0, vec![]).prepared);

        // Duplicates don't count twice.
        assert!(!proposer.on_phase1_response(2, 6, 0, vec![]).prepared);
        assert_eq!(proposer.missing_promises(), vec![0, 3, 4]);

        assert!(proposer.on_phase1_response(4, 6, 0, vec![]).prepared);
        assert_eq!(proposer.state(), ProposerState::Prepared);
    }

    #[test]
    fn test_start_in_foreign_view() {
        let mut proposer = Proposer::new(Cluster::new(1, 5), TIMEOUT);
        let result = proposer.start(2, 0, Instant::now());
        assert!(matches!(result, Err(PaxosError::Invariant(_))));
        assert_eq!(proposer.state(), ProposerState::Inactive);
        assert_eq!(proposer.deadline(), None);
    }

    #[test]
    fn test_ignores_other_views() {
        let mut proposer = Proposer::new(Cluster::new(0, 3), TIMEOUT);
        proposer.start(3, 0, Instant::now()).unwrap();
        assert!(!proposer.on_phase1_response(0, 3, 0, vec![]).prepared);
        assert!(!proposer.on_phase1_response(1, 0, 0, vec![]).prepared);
        assert_eq!(proposer.state(), ProposerState::Preparing);
    }

    #[test]
    fn test_adopts_value_from_highest_view() {
        let mut proposer = Proposer::new(Cluster::new(0, 3), TIMEOUT);
        proposer.start(3, 0, Instant::now()).unwrap();
        proposer.on_phase1_response(0, 3, 0, vec![known(1, 1, "old")]);
        let merge = proposer.on_phase1_response(1, 3, 0, vec![known(1, 2, "new"), known(2, 0, "x")]);
        assert!(merge.prepared);

        let mut log = Log::new();
        proposer.plan_reproposals(&log);

        // Instance 0 was never mentioned but lies below a known one: no-op.
        assert_eq!(
            proposer.next_reproposal(&log),
            Some((0, request::noop()))
        );
        proposer.on_proposed(0, Instant::now());
        assert_eq!(
            proposer.next_reproposal(&log),
            Some((1, Bytes::from("new")))
        );

        // Instances which get decided in the meantime are skipped.
        let instance = log.instance_mut(1).unwrap();
        instance.set_value(2, Bytes::from("new")).unwrap();
        instance.set_decided().unwrap();
        assert_eq!(proposer.next_reproposal(&log), Some((2, Bytes::from("x"))));
    }

    #[test]
    fn test_decided_records_are_returned() {
        let mut proposer = Proposer::new(Cluster::new(0, 3), TIMEOUT);
        proposer.start(3, 2, Instant::now()).unwrap();
        let records = vec![
            decided(1, 0, "below-start"),
            decided(2, 1, "d"),
            known(3, 1, "k"),
        ];
        let merge = proposer.on_phase1_response(1, 3, 0, records);
        assert_eq!(merge.decided.len(), 1);
        assert_eq!(merge.decided[0].id, 2);
    }

    #[test]
    fn test_reproposals_start_above_truncation() {
        let mut proposer = Proposer::new(Cluster::new(0, 3), TIMEOUT);
        proposer.start(3, 0, Instant::now()).unwrap();
        proposer.on_phase1_response(0, 3, 0, vec![]);
        proposer.on_phase1_response(2, 3, 5, vec![known(6, 1, "v")]);
        assert_eq!(proposer.highest_truncation(), 5);

        let log = Log::new();
        proposer.plan_reproposals(&log);
        assert_eq!(proposer.next_reproposal(&log), Some((5, request::noop())));
    }

    #[test]
    fn test_fill_gaps() {
        let mut proposer = Proposer::new(Cluster::new(0, 3), TIMEOUT);
        proposer.start(3, 0, Instant::now()).unwrap();
        proposer.on_phase1_response(0, 3, 0, vec![]);
        proposer.on_phase1_response(1, 3, 0, vec![]);

        let mut log = Log::new();
        proposer.plan_reproposals(&log);
        assert!(!proposer.has_reproposals());

        // Catch-up delivered instance 3 while 0 was proposed.
        proposer.on_proposed(0, Instant::now());
        let instance = log.instance_mut(3).unwrap();
        instance.update_from_decision(1, Bytes::from("d")).unwrap();
        log.instance_mut(0).unwrap();

        proposer.fill_gaps(&log);
        assert_eq!(proposer.next_reproposal(&log), Some((1, request::noop())));
        proposer.on_proposed(1, Instant::now());
        assert_eq!(proposer.next_reproposal(&log), Some((2, request::noop())));
        proposer.on_proposed(2, Instant::now());
        assert_eq!(proposer.next_reproposal(&log), None);

        proposer.forget_below(2);
        assert_eq!(proposer.in_flight(), 1);
    }

    #[test]
    fn test_retransmission_deadlines() {
        let mut proposer = Proposer::new(Cluster::new(0, 3), TIMEOUT);
        let start = Instant::now();
        proposer.start(0, 0, start).unwrap();
        assert!(!proposer.phase1_due(start));
        assert!(proposer.phase1_due(start + TIMEOUT));
        assert!(!proposer.phase1_due(start + TIMEOUT));

        proposer.on_phase1_response(0, 0, 0, vec![]);
        proposer.on_phase1_response(1, 0, 0, vec![]);
        assert_eq!(proposer.deadline(), None);

        proposer.on_proposed(0, start);
        proposer.on_proposed(1, start + TIMEOUT);
        assert_eq!(proposer.due_proposals(start + TIMEOUT), vec![0]);
        assert_eq!(proposer.due_proposals(start + TIMEOUT * 2), vec![0, 1]);

        proposer.on_decided(0);
        assert_eq!(proposer.in_flight(), 1);

        proposer.stop();
        assert_eq!(proposer.state(), ProposerState::Inactive);
        assert_eq!(proposer.deadline(), None);
    }

    fn known(id: InstanceId, view: View, value: &str) -> InstanceRecord {
        InstanceRecord {
            id,
            view,
            state: InstanceState::Known,
            value: Some(Bytes::from(value.to_string())),
        }
    }

    fn decided(id: InstanceId, view: View, value: &str) -> InstanceRecord {
        InstanceRecord {
            id,
            view,
            state: InstanceState::Decided,
            value: Some(Bytes::from(value.to_string())),
        }
    }
}
