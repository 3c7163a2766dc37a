use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::info;

use crate::paxos::cluster::Cluster;
use crate::paxos::error::PaxosResult;
use crate::paxos::instance::ConsensusInstance;
use crate::paxos::log::Log;
use crate::paxos::options::CrashModel;
use crate::paxos::snapshot::Snapshot;
use crate::paxos::storage::Storage;
use crate::paxos::{InstanceId, ReplicaId, View};

// The state a replica starts from, as far as its crash model preserves it.
pub struct Initial {
    pub view: View,
    pub epoch: u64,
    pub log: Log,
    pub snapshot: Option<Snapshot>,

    // Set if the replica has never run before with this storage.
    pub first_run: bool,
}

impl Initial {
    fn empty(view: View, epoch: u64, first_run: bool) -> Self {
        Initial {
            view,
            epoch,
            log: Log::new(),
            snapshot: None,
            first_run,
        }
    }
}

// What a crash model keeps durable and what a restarted replica has to do
// before it may take part in the protocol again.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn crash_model(&self) -> CrashModel;

    // Loads the durable state and starts a new incarnation.
    async fn initialize(&self, storage: &mut dyn Storage) -> PaxosResult<Initial>;

    // Whether the replica has to learn the view and the log from its peers
    // before taking part.
    fn needs_peers(&self, initial: &Initial) -> bool;

    // Whether every change to an instance must be on disk before it is
    // acknowledged.
    fn persists_instances(&self) -> bool {
        false
    }

    // Whether a view must be on disk before the replica acts in it.
    fn persists_view(&self) -> bool {
        false
    }

    // Whether protocol messages carry epoch vectors.
    fn uses_epochs(&self) -> bool {
        false
    }
}

pub fn strategy(crash_model: CrashModel) -> Box<dyn RecoveryStrategy> {
    match crash_model {
        CrashModel::CrashStop => Box::new(CrashStop),
        CrashModel::FullStableStorage => Box::new(FullStableStorage),
        CrashModel::ViewStableStorage => Box::new(ViewStableStorage),
        CrashModel::EpochStableStorage => Box::new(EpochStableStorage),
    }
}

// Bumps the incarnation counter. Returns the new epoch and whether this is the
// first incarnation ever.
async fn start_incarnation(storage: &mut dyn Storage) -> PaxosResult<(u64, bool)> {
    let previous = storage.read_epoch().await?;
    let epoch = previous + 1;
    storage.write_epoch(epoch).await?;
    Ok((epoch, previous == 0))
}

pub struct CrashStop;

#[async_trait]
impl RecoveryStrategy for CrashStop {
    fn crash_model(&self) -> CrashModel {
        CrashModel::CrashStop
    }

    async fn initialize(&self, _storage: &mut dyn Storage) -> PaxosResult<Initial> {
        Ok(Initial::empty(0, 0, true))
    }

    fn needs_peers(&self, _initial: &Initial) -> bool {
        false
    }
}

pub struct FullStableStorage;

#[async_trait]
impl RecoveryStrategy for FullStableStorage {
    fn crash_model(&self) -> CrashModel {
        CrashModel::FullStableStorage
    }

    async fn initialize(&self, storage: &mut dyn Storage) -> PaxosResult<Initial> {
        let (epoch, first_run) = start_incarnation(storage).await?;
        let view = storage.read_view().await?;
        let snapshot = storage.read_snapshot().await?;
        let lowest_available = snapshot.as_ref().map(|s| s.next_instance_id).unwrap_or(0);
        let instances = storage
            .read_log()
            .await?
            .into_iter()
            .map(|s| ConsensusInstance::restored(s.id, s.view, s.value, s.decided))
            .collect();
        let log = Log::restore(lowest_available, instances);
        info!(
            view,
            epoch,
            lowest_available,
            first_uncommitted = log.first_uncommitted(),
            next_id = log.next_id(),
            "restored log from disk"
        );
        Ok(Initial {
            view,
            epoch,
            log,
            snapshot,
            first_run,
        })
    }

    fn needs_peers(&self, _initial: &Initial) -> bool {
        false
    }

    fn persists_instances(&self) -> bool {
        true
    }

    fn persists_view(&self) -> bool {
        true
    }
}

pub struct ViewStableStorage;

#[async_trait]
impl RecoveryStrategy for ViewStableStorage {
    fn crash_model(&self) -> CrashModel {
        CrashModel::ViewStableStorage
    }

    async fn initialize(&self, storage: &mut dyn Storage) -> PaxosResult<Initial> {
        let (epoch, first_run) = start_incarnation(storage).await?;
        let view = storage.read_view().await?;
        info!(view, epoch, first_run, "restored view from disk");
        Ok(Initial::empty(view, epoch, first_run))
    }

    fn needs_peers(&self, initial: &Initial) -> bool {
        !initial.first_run
    }

    fn persists_view(&self) -> bool {
        true
    }
}

pub struct EpochStableStorage;

#[async_trait]
impl RecoveryStrategy for EpochStableStorage {
    fn crash_model(&self) -> CrashModel {
        CrashModel::EpochStableStorage
    }

    async fn initialize(&self, storage: &mut dyn Storage) -> PaxosResult<Initial> {
        let (epoch, first_run) = start_incarnation(storage).await?;
        info!(epoch, first_run, "starting new incarnation");
        Ok(Initial::empty(0, epoch, first_run))
    }

    fn needs_peers(&self, initial: &Initial) -> bool {
        !initial.first_run
    }

    fn uses_epochs(&self) -> bool {
        true
    }
}

// Collects answers to the Recovery query of a restarted replica. Recovery
// completes once a majority of the other replicas answered and the leader of
// the highest view reported among them is one of them. The leader's log size
// is then the point the replica has to catch up to.
pub struct RecoveryTracker {
    cluster: Cluster,
    epoch: u64,
    uses_epochs: bool,
    view: View,
    answered: BTreeSet<ReplicaId>,
    leader_next: Option<InstanceId>,
    retransmit_timeout: Duration,
    deadline: Instant,
}

impl RecoveryTracker {
    pub fn new(
        cluster: Cluster,
        view: View,
        epoch: u64,
        uses_epochs: bool,
        retransmit_timeout: Duration,
        now: Instant,
    ) -> Self {
        RecoveryTracker {
            cluster,
            epoch,
            uses_epochs,
            view,
            answered: BTreeSet::new(),
            leader_next: None,
            retransmit_timeout,
            deadline: now,
        }
    }

    // The highest view seen so far.
    pub fn view(&self) -> View {
        self.view
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    // Returns the replicas the query has to be sent (again) to, if it is due.
    pub fn poll(&mut self, now: Instant) -> Vec<ReplicaId> {
        if self.deadline > now {
            return Vec::new();
        }
        self.deadline = now + self.retransmit_timeout;
        self.cluster
            .others()
            .filter(|r| !self.answered.contains(r) || self.cluster.leader_of(self.view) == *r)
            .collect()
    }

    // Records an answer. Returns the instance to catch up to once enough
    // replicas answered.
    pub fn on_answer(
        &mut self,
        sender: ReplicaId,
        view: View,
        epochs: &[u64],
        next_instance: InstanceId,
    ) -> Option<InstanceId> {
        if self.uses_epochs && epochs.get(self.cluster.me()) != Some(&self.epoch) {
            // An answer meant for an earlier incarnation of ours.
            return None;
        }
        if view < self.view {
            return None;
        }
        if view > self.view {
            self.view = view;
            self.leader_next = None;
        }
        self.answered.insert(sender);
        if self.cluster.leader_of(self.view) == sender {
            self.leader_next = Some(next_instance);
        }
        if !self.cluster.is_majority(self.answered.len()) {
            return None;
        }
        self.leader_next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::storage::MemoryStorage;
    use bytes::Bytes;

    const TIMEOUT: Duration = Duration::from_millis(100);

    #[tokio::test]
    async fn test_crash_stop_starts_empty() {
        let mut storage = MemoryStorage::new();
        storage.write_view(7).await.unwrap();
        let initial = CrashStop.initialize(&mut storage).await.unwrap();
        assert_eq!(initial.view, 0);
        assert!(initial.first_run);
        assert!(!CrashStop.needs_peers(&initial));
    }

    #[tokio::test]
    async fn test_full_restores_log() {
        let mut storage = MemoryStorage::new();
        storage.write_view(4).await.unwrap();
        let value = Bytes::from("v");
        storage
            .append_or_update_instance(0, 4, Some(&value), true)
            .await
            .unwrap();
        storage
            .append_or_update_instance(1, 4, Some(&value), false)
            .await
            .unwrap();

        let first = FullStableStorage.initialize(&mut storage).await.unwrap();
        assert!(first.first_run);
        assert_eq!(first.view, 4);
        assert_eq!(first.log.first_uncommitted(), 1);
        assert_eq!(first.log.next_id(), 2);

        let second = FullStableStorage.initialize(&mut storage).await.unwrap();
        assert!(!second.first_run);
        assert_eq!(second.epoch, 2);
        assert!(!FullStableStorage.needs_peers(&second));
    }

    #[tokio::test]
    async fn test_view_and_epoch_need_peers_after_restart() {
        let mut storage = MemoryStorage::new();
        let first = ViewStableStorage.initialize(&mut storage).await.unwrap();
        assert!(!ViewStableStorage.needs_peers(&first));
        storage.write_view(3).await.unwrap();

        let second = ViewStableStorage.initialize(&mut storage).await.unwrap();
        assert_eq!(second.view, 3);
        assert!(ViewStableStorage.needs_peers(&second));

        let mut storage = MemoryStorage::new();
        let first = EpochStableStorage.initialize(&mut storage).await.unwrap();
        assert_eq!(first.epoch, 1);
        let second = EpochStableStorage.initialize(&mut storage).await.unwrap();
        assert_eq!(second.epoch, 2);
        assert_eq!(second.view, 0);
        assert!(EpochStableStorage.needs_peers(&second));
    }

    #[test]
    fn test_tracker_needs_majority_and_leader() {
        let now = Instant::now();
        let mut tracker = RecoveryTracker::new(Cluster::new(4, 5), 2, 1, false, TIMEOUT, now);

        // Answers for views we already moved past are dropped.
        assert_eq!(tracker.on_answer(1, 1, &[], 9), None);

        assert_eq!(tracker.on_answer(0, 2, &[], 5), None);
        assert_eq!(tracker.on_answer(1, 2, &[], 5), None);

        // Majority, but the leader of view 2 did not answer yet.
        assert_eq!(tracker.on_answer(3, 2, &[], 5), None);
        assert_eq!(tracker.on_answer(2, 2, &[], 7), Some(7));
    }

    #[test]
    fn test_tracker_adopts_higher_view() {
        let now = Instant::now();
        let mut tracker = RecoveryTracker::new(Cluster::new(0, 3), 0, 1, false, TIMEOUT, now);
        assert_eq!(tracker.on_answer(1, 1, &[], 4), None);
        assert_eq!(tracker.view(), 1);

        // The leader of view 1 answered, but in view 2 it's replica 2.
        assert_eq!(tracker.on_answer(2, 2, &[], 6), Some(6));
        assert_eq!(tracker.view(), 2);
    }

    #[test]
    fn test_tracker_checks_epochs() {
        let now = Instant::now();
        let mut tracker = RecoveryTracker::new(Cluster::new(0, 3), 0, 3, true, TIMEOUT, now);
        assert_eq!(tracker.on_answer(1, 1, &[2, 0, 0], 4), None);
        assert_eq!(tracker.on_answer(2, 1, &[3, 0, 0], 4), None);
        assert_eq!(tracker.on_answer(1, 1, &[3, 0, 0], 4), Some(4));
    }

    #[test]
    fn test_tracker_retransmits_to_missing() {
        let now = Instant::now();
        let mut tracker = RecoveryTracker::new(Cluster::new(0, 3), 0, 1, false, TIMEOUT, now);
        assert_eq!(tracker.poll(now), vec![1, 2]);
        assert!(tracker.poll(now).is_empty());

        tracker.on_answer(2, 0, &[], 0);
        assert_eq!(tracker.poll(now + TIMEOUT), vec![1]);
    }
}
