use std::collections::{BTreeMap, HashMap};

use async_std::sync::{Arc, Mutex};
use bytes::Bytes;
use tracing::{debug, info};

use crate::paxos::request::RequestId;
use crate::paxos::{InstanceId, ReplicaId, View};

// Holds information about the execution of a cluster over time. Can be used
// to perform various integrity checks based on the recorded data. For
// instance, there should be no instance for which two replicas decided
// different values.
pub struct Diagnostics {
    replicas: BTreeMap<ReplicaId, Arc<Mutex<ReplicaDiagnostics>>>,

    // Everything validated so far.
    leaders: BTreeMap<View, ReplicaId>,
    decided: BTreeMap<InstanceId, Bytes>,
}

impl Diagnostics {
    // Returns a new instance which, initially, knows about no replicas.
    pub fn new() -> Self {
        Diagnostics {
            replicas: BTreeMap::new(),
            leaders: BTreeMap::new(),
            decided: BTreeMap::new(),
        }
    }

    // Returns the ReplicaDiagnostics object for the supplied replica, creating
    // one if necessary.
    pub fn get_replica(&mut self, replica: ReplicaId) -> Arc<Mutex<ReplicaDiagnostics>> {
        self.replicas
            .entry(replica)
            .or_insert_with(|| Arc::new(Mutex::new(ReplicaDiagnostics::new())))
            .clone()
    }

    pub fn replicas(&self) -> Vec<Arc<Mutex<ReplicaDiagnostics>>> {
        self.replicas.values().cloned().collect()
    }

    // Performs a set of checks on the data recorded by the individual
    // replicas. Returns an error if any of the checks fail.
    pub async fn validate(&mut self) -> Result<(), String> {
        self.validate_leaders().await?;
        self.validate_decisions().await?;
        self.validate_executions().await?;
        Ok(())
    }

    // Returns the number of instances known to be decided consistently.
    pub fn validated_instances(&self) -> usize {
        self.decided.len()
    }

    // Validates that all replicas agree on who led every view.
    async fn validate_leaders(&mut self) -> Result<(), String> {
        for (replica, diagnostics) in &self.replicas {
            let d = diagnostics.lock().await;
            for (view, leader) in &d.leaders {
                match self.leaders.get(view) {
                    Some(existing) if existing != leader => {
                        return Err(format!(
                            "Replica {} saw leader {} for view {}, others saw {}",
                            replica, leader, view, existing
                        ));
                    }
                    Some(_) => {}
                    None => {
                        debug!(view, leader, "validated leader");
                        self.leaders.insert(*view, *leader);
                    }
                }
            }
        }
        Ok(())
    }

    // Validates that no two replicas ever decided different values for the
    // same instance. Reported decisions are moved into the validated set.
    async fn validate_decisions(&mut self) -> Result<(), String> {
        let before = self.decided.len();
        for (replica, diagnostics) in &self.replicas {
            let mut d = diagnostics.lock().await;
            for (id, value) in std::mem::take(&mut d.decided) {
                match self.decided.get(&id) {
                    Some(existing) if *existing != value => {
                        return Err(format!(
                            "Replica {} decided a different value for instance {}",
                            replica, id
                        ));
                    }
                    Some(_) => {}
                    None => {
                        self.decided.insert(id, value);
                    }
                }
            }
        }
        if self.decided.len() > before {
            info!(
                validated = self.decided.len(),
                "validated decisions across replicas"
            );
        }
        Ok(())
    }

    // Validates that no replica executed any request twice.
    async fn validate_executions(&self) -> Result<(), String> {
        for (replica, diagnostics) in &self.replicas {
            let d = diagnostics.lock().await;
            if let Some((id, count)) = d.executed.iter().find(|(_, count)| **count > 1) {
                return Err(format!(
                    "Replica {} executed request {} {} times",
                    replica, id, count
                ));
            }
        }
        Ok(())
    }
}

// Holds information about a single replica's execution as part of a cluster
// over time.
pub struct ReplicaDiagnostics {
    views: Vec<View>,

    // Keeps track of the leader for each view this replica took part in.
    leaders: BTreeMap<View, ReplicaId>,

    // Decisions not validated yet.
    decided: BTreeMap<InstanceId, Bytes>,

    // Number of times each request was executed by the current incarnation.
    executed: HashMap<RequestId, u32>,

    snapshots_installed: usize,
}

impl ReplicaDiagnostics {
    fn new() -> Self {
        ReplicaDiagnostics {
            views: Vec::new(),
            leaders: BTreeMap::new(),
            decided: BTreeMap::new(),
            executed: HashMap::new(),
            snapshots_installed: 0,
        }
    }

    // Called when the replica moves to a new view.
    pub fn report_view(&mut self, view: View, leader: ReplicaId) {
        if let Some(last) = self.views.last() {
            assert!(view > *last, "view went from {} to {}", last, view);
        }
        self.views.push(view);
        self.report_leader(view, leader);
    }

    // Called when the replica acknowledges a leader for the supplied view.
    pub fn report_leader(&mut self, view: View, leader: ReplicaId) {
        let existing = self.leaders.get(&view);
        assert!(existing.is_none() || existing == Some(&leader));
        self.leaders.insert(view, leader);
    }

    pub fn report_decided(&mut self, id: InstanceId, value: &Bytes) {
        let existing = self.decided.get(&id);
        assert!(
            existing.is_none() || existing == Some(value),
            "instance {} decided twice",
            id
        );
        self.decided.insert(id, value.clone());
    }

    pub fn report_executed(&mut self, id: RequestId) {
        *self.executed.entry(id).or_insert(0) += 1;
    }

    pub fn report_snapshot_installed(&mut self) {
        self.snapshots_installed += 1;
    }

    // Called when the replica is started again after a crash. The new
    // incarnation rebuilds its state from scratch.
    pub fn report_restart(&mut self) {
        self.executed.clear();
        self.views.clear();
    }

    pub fn latest_view(&self) -> Option<View> {
        self.views.last().copied()
    }

    // The leader of the highest view this replica has heard of.
    pub fn latest_leader(&self) -> Option<ReplicaId> {
        self.leaders.last_key_value().map(|(_, leader)| *leader)
    }

    pub fn executions(&self, id: &RequestId) -> u32 {
        self.executed.get(id).copied().unwrap_or(0)
    }

    pub fn snapshots_installed(&self) -> usize {
        self.snapshots_installed
    }
}
