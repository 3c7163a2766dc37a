use crate::paxos::{ReplicaId, View};

// Holds the static membership of a replica group, as seen from one member.
// Leadership is derived purely from arithmetic on views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cluster {
    me: ReplicaId,
    size: usize,
}

impl Cluster {
    pub fn new(me: ReplicaId, size: usize) -> Self {
        assert!(size > 0, "cluster must have members");
        assert!(me < size, "replica {} outside cluster of size {}", me, size);
        Cluster { me, size }
    }

    // Returns the id of the replica this object describes.
    pub fn me(&self) -> ReplicaId {
        self.me
    }

    // Returns the number of participants in the cluster (including us).
    pub fn size(&self) -> usize {
        self.size
    }

    // Returns the ids of all other members in the cluster.
    pub fn others(&self) -> impl Iterator<Item = ReplicaId> + use<> {
        let me = self.me;
        (0..self.size).filter(move |r| *r != me)
    }

    pub fn leader_of(&self, view: View) -> ReplicaId {
        (view % self.size as u64) as ReplicaId
    }

    pub fn is_leader(&self, view: View) -> bool {
        self.leader_of(view) == self.me
    }

    // Returns whether the supplied number of replicas forms a strict majority.
    pub fn is_majority(&self, count: usize) -> bool {
        2 * count > self.size
    }

    // Returns the smallest view strictly greater than the supplied one which this
    // replica leads.
    pub fn next_view_led_by_me(&self, view: View) -> View {
        let n = self.size as u64;
        let mut next = view - view % n + self.me as u64;
        if next <= view {
            next += n;
        }
        next
    }

    // Returns how many steps after the leader of the supplied view this replica
    // comes, in id order. The leader itself has distance zero.
    pub fn distance_from_leader(&self, view: View) -> usize {
        (self.me + self.size - self.leader_of(view)) % self.size
    }
}
