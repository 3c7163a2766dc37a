use std::collections::BTreeMap;

use bytes::Bytes;

use crate::paxos::error::{PaxosError, PaxosResult};
use crate::paxos::instance::{ConsensusInstance, InstanceState};
use crate::paxos::message::{DecidedRecord, InstanceRecord};
use crate::paxos::{InstanceId, View};

// Represents the replicated log held by one replica. Instances are created
// lazily on first reference; ids without an entry are implicitly unknown.
// Instances below "lowest_available" were compacted into a snapshot and are
// implicitly decided.
pub struct Log {
    instances: BTreeMap<InstanceId, ConsensusInstance>,

    // One past the highest instance id referenced so far.
    next_id: InstanceId,

    // The lowest id not yet decided. Only ever increases.
    first_uncommitted: InstanceId,

    lowest_available: InstanceId,
}

impl Log {
    pub fn new() -> Self {
        Log {
            instances: BTreeMap::new(),
            next_id: 0,
            first_uncommitted: 0,
            lowest_available: 0,
        }
    }

    // Rebuilds a log from instances read back from durable storage, starting
    // after the supplied compaction point.
    pub fn restore(lowest_available: InstanceId, instances: Vec<ConsensusInstance>) -> Self {
        let mut log = Log::new();
        log.lowest_available = lowest_available;
        log.first_uncommitted = lowest_available;
        log.next_id = lowest_available;
        for instance in instances {
            if instance.id() < lowest_available {
                continue;
            }
            log.next_id = log.next_id.max(instance.id() + 1);
            log.instances.insert(instance.id(), instance);
        }
        log.update_first_uncommitted();
        log
    }

    pub fn next_id(&self) -> InstanceId {
        self.next_id
    }

    pub fn first_uncommitted(&self) -> InstanceId {
        self.first_uncommitted
    }

    pub fn lowest_available(&self) -> InstanceId {
        self.lowest_available
    }

    // Returns the instance with the supplied id if it was ever referenced and
    // has not been compacted.
    pub fn get(&self, id: InstanceId) -> Option<&ConsensusInstance> {
        self.instances.get(&id)
    }

    pub fn state_of(&self, id: InstanceId) -> InstanceState {
        if id < self.lowest_available {
            return InstanceState::Decided;
        }
        match self.instances.get(&id) {
            Some(instance) => instance.state(),
            None => InstanceState::Unknown,
        }
    }

    pub fn is_compacted(&self, id: InstanceId) -> bool {
        id < self.lowest_available
    }

    // Returns the instance with the supplied id, creating it if necessary. Must
    // not be called for compacted instances.
    pub fn instance_mut(&mut self, id: InstanceId) -> PaxosResult<&mut ConsensusInstance> {
        if id < self.lowest_available {
            return Err(PaxosError::Invariant(format!(
                "Instance {} was compacted (lowest available {})",
                id, self.lowest_available
            )));
        }
        self.next_id = self.next_id.max(id + 1);
        Ok(self
            .instances
            .entry(id)
            .or_insert_with(|| ConsensusInstance::new(id)))
    }

    // Creates a new instance at the end of the log holding the supplied value.
    // Returns the id of the new instance.
    pub fn append(&mut self, view: View, value: Bytes) -> PaxosResult<InstanceId> {
        let id = self.next_id;
        self.instance_mut(id)?.set_value(view, value)?;
        Ok(id)
    }

    // Records that instances up to (excluding) the supplied id exist somewhere,
    // as reported by a peer.
    pub fn extend_to(&mut self, next_id: InstanceId) {
        self.next_id = self.next_id.max(next_id);
    }

    // Returns whether the supplied instance may be proposed or accepted given a
    // window of the supplied size past the first undecided instance.
    pub fn is_in_window(&self, id: InstanceId, window: usize) -> bool {
        id < self.first_uncommitted + window as u64
    }

    // Advances first_uncommitted past any decided prefix. Returns the new value.
    pub fn update_first_uncommitted(&mut self) -> InstanceId {
        while self.first_uncommitted < self.next_id
            && self.state_of(self.first_uncommitted) == InstanceState::Decided
        {
            self.first_uncommitted += 1;
        }
        self.first_uncommitted
    }

    // Returns whether some instance after first_uncommitted is already decided,
    // i.e., the log has a hole.
    pub fn has_decided_after_hole(&self) -> bool {
        self.instances
            .range(self.first_uncommitted..)
            .any(|(_, instance)| instance.is_decided())
    }

    // Drops all instances strictly below the supplied id. These must be covered
    // by a snapshot.
    pub fn truncate_below(&mut self, id: InstanceId) {
        if id <= self.lowest_available {
            return;
        }
        self.instances = self.instances.split_off(&id);
        self.lowest_available = id;
        self.next_id = self.next_id.max(id);
        self.first_uncommitted = self.first_uncommitted.max(id);
        self.update_first_uncommitted();
    }

    // Returns the evidence an acceptor reports in phase 1: every instance at or
    // after the supplied id that holds a value.
    pub fn records_from(&self, from: InstanceId) -> Vec<InstanceRecord> {
        let start = from.max(self.lowest_available);
        self.instances
            .range(start..)
            .filter(|(_, instance)| instance.state() != InstanceState::Unknown)
            .map(|(id, instance)| InstanceRecord {
                id: *id,
                view: instance.view(),
                state: instance.state(),
                value: instance.value().cloned(),
            })
            .collect()
    }

    // Returns all decided instances at or after the supplied id, split into
    // parts of roughly at most "part_bytes" each. Every part holds at least one
    // instance. Returns no parts if nothing is decided.
    pub fn decided_from(&self, from: InstanceId, part_bytes: usize) -> Vec<Vec<DecidedRecord>> {
        let start = from.max(self.lowest_available);
        let mut parts = Vec::new();
        let mut current: Vec<DecidedRecord> = Vec::new();
        let mut current_bytes = 0;
        for (id, instance) in self.instances.range(start..) {
            if !instance.is_decided() {
                continue;
            }
            let value = match instance.value() {
                Some(value) => value.clone(),
                None => continue,
            };
            let record = DecidedRecord {
                id: *id,
                view: instance.view(),
                value,
            };
            if !current.is_empty() && current_bytes + record.encoded_len() > part_bytes {
                parts.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current_bytes += record.encoded_len();
            current.push(record);
        }
        if !current.is_empty() {
            parts.push(current);
        }
        parts
    }

    // Returns the ids of instances at or after the supplied id which hold a
    // value but are not decided yet.
    pub fn undecided_from(&self, from: InstanceId) -> Vec<InstanceId> {
        self.instances
            .range(from.max(self.lowest_available)..)
            .filter(|(_, instance)| instance.state() == InstanceState::Known)
            .map(|(id, _)| *id)
            .collect()
    }

    // Returns the total size of all values held in memory.
    pub fn size_bytes(&self) -> usize {
        self.instances.values().map(|i| i.size_bytes()).sum()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial() {
        let l = Log::new();
        assert_eq!(l.next_id(), 0);
        assert_eq!(l.first_uncommitted(), 0);
        assert_eq!(l.lowest_available(), 0);
        assert_eq!(l.state_of(0), InstanceState::Unknown);
        assert!(l.get(0).is_none());
    }

    #[test]
    fn test_lazy_creation() {
        let mut l = Log::new();
        l.instance_mut(5).unwrap();
        assert_eq!(l.next_id(), 6);
        assert_eq!(l.len(), 1);

        // Instances in between are implicitly unknown.
        assert_eq!(l.state_of(3), InstanceState::Unknown);
        assert!(l.get(3).is_none());
    }

    #[test]
    fn test_append() {
        let mut l = Log::new();
        assert_eq!(l.append(2 /* view */, payload("a")).unwrap(), 0);
        assert_eq!(l.append(2 /* view */, payload("b")).unwrap(), 1);
        assert_eq!(l.next_id(), 2);
        assert_eq!(l.state_of(1), InstanceState::Known);
        assert_eq!(l.size_bytes(), 2);
    }

    #[test]
    fn test_first_uncommitted_skips_decided_prefix() {
        let mut l = Log::new();
        decide(&mut l, 0);
        decide(&mut l, 2);
        assert_eq!(l.update_first_uncommitted(), 1);
        assert!(l.has_decided_after_hole());

        decide(&mut l, 1);
        assert_eq!(l.update_first_uncommitted(), 3);
        assert!(!l.has_decided_after_hole());
    }

    #[test]
    fn test_window() {
        let mut l = Log::new();
        assert!(l.is_in_window(0, 2));
        assert!(l.is_in_window(1, 2));
        assert!(!l.is_in_window(2, 2));

        decide(&mut l, 0);
        l.update_first_uncommitted();
        assert!(l.is_in_window(2, 2));
        assert!(!l.is_in_window(3, 2));
    }

    #[test]
    fn test_truncate_below() {
        let mut l = Log::new();
        for id in 0..5 {
            decide(&mut l, id);
        }
        l.instance_mut(6).unwrap().set_value(1, payload("x")).unwrap();
        l.update_first_uncommitted();

        l.truncate_below(4);
        assert_eq!(l.lowest_available(), 4);
        assert!(l.is_compacted(3));
        assert!(l.get(3).is_none());
        assert_eq!(l.state_of(2), InstanceState::Decided);
        assert_eq!(l.first_uncommitted(), 5);
        assert!(l.instance_mut(2).is_err());

        // Truncating backwards does nothing.
        l.truncate_below(1);
        assert_eq!(l.lowest_available(), 4);
    }

    #[test]
    fn test_truncate_past_everything() {
        let mut l = Log::new();
        l.instance_mut(1).unwrap().set_value(0, payload("x")).unwrap();

        // A snapshot from a peer can cover instances we never decided.
        l.truncate_below(10);
        assert_eq!(l.len(), 0);
        assert_eq!(l.first_uncommitted(), 10);
        assert_eq!(l.next_id(), 10);
    }

    #[test]
    fn test_records_from() {
        let mut l = Log::new();
        decide(&mut l, 0);
        l.instance_mut(1).unwrap().set_value(3, payload("b")).unwrap();
        l.instance_mut(2).unwrap();
        l.instance_mut(3).unwrap().set_value(3, payload("d")).unwrap();

        let records = l.records_from(1);
        let ids: Vec<InstanceId> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(records[0].view, 3);
        assert_eq!(records[0].state, InstanceState::Known);
        assert_eq!(records[1].value, Some(payload("d")));
    }

    #[test]
    fn test_decided_from_parts() {
        let mut l = Log::new();
        for id in 0..6 {
            decide(&mut l, id);
        }
        l.instance_mut(6).unwrap().set_value(0, payload("x")).unwrap();

        // Each record is 20 bytes of header plus 1 byte of payload.
        let parts = l.decided_from(2, 45);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(parts[1].iter().map(|r| r.id).collect::<Vec<_>>(), vec![4, 5]);

        // A tiny part size still makes progress.
        assert_eq!(l.decided_from(0, 1).len(), 6);
        assert!(l.decided_from(6, 1000).is_empty());
    }

    #[test]
    fn test_undecided_from() {
        let mut l = Log::new();
        decide(&mut l, 0);
        l.instance_mut(1).unwrap().set_value(0, payload("b")).unwrap();
        l.instance_mut(3).unwrap().set_value(0, payload("d")).unwrap();
        assert_eq!(l.undecided_from(0), vec![1, 3]);
        assert_eq!(l.undecided_from(2), vec![3]);
    }

    #[test]
    fn test_restore() {
        let instances = vec![
            ConsensusInstance::restored(2, 1, Some(payload("a")), true),
            ConsensusInstance::restored(3, 1, Some(payload("b")), true),
            ConsensusInstance::restored(4, 1, Some(payload("c")), false),
            ConsensusInstance::restored(1, 1, Some(payload("z")), true),
        ];
        let l = Log::restore(2, instances);
        assert_eq!(l.lowest_available(), 2);
        assert_eq!(l.first_uncommitted(), 4);
        assert_eq!(l.next_id(), 5);
        assert!(l.get(1).is_none());
    }

    #[test]
    fn test_extend_to() {
        let mut l = Log::new();
        l.extend_to(7);
        assert_eq!(l.next_id(), 7);
        l.extend_to(3);
        assert_eq!(l.next_id(), 7);
        assert_eq!(l.first_uncommitted(), 0);
    }

    fn payload(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    fn decide(l: &mut Log, id: InstanceId) {
        let instance = l.instance_mut(id).unwrap();
        instance
            .set_value(0 /* view */, Bytes::from(format!("{}", id % 10)))
            .unwrap();
        instance.set_decided().unwrap();
    }
}
