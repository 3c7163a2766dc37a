use std::time::Duration;

use tokio::time::Instant;

use crate::paxos::ReplicaId;
use crate::paxos::cluster::Cluster;

// Decides when to ask which peer for decided instances we are missing. The
// dispatcher does the actual sending and merging. Queries go to the leader
// first and then rotate over the other replicas. Every unanswered query
// doubles the timeout, up to a bound.
pub struct CatchUp {
    cluster: Cluster,
    base_timeout: Duration,
    max_backoff: u32,
    active: bool,
    next_query: Option<Instant>,
    backoff: u32,
    rotation: usize,
}

impl CatchUp {
    pub fn new(cluster: Cluster, base_timeout: Duration, max_backoff: u32) -> Self {
        CatchUp {
            cluster,
            base_timeout,
            max_backoff: max_backoff.max(1),
            active: false,
            next_query: None,
            backoff: 1,
            rotation: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    // Requests a catch-up round as soon as possible. Does nothing if one is
    // already running.
    pub fn force(&mut self, now: Instant) {
        if self.active {
            return;
        }
        self.active = true;
        self.backoff = 1;
        self.rotation = 0;
        self.next_query = Some(now);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.next_query
    }

    pub fn current_timeout(&self) -> Duration {
        self.base_timeout * self.backoff
    }

    // Returns the peer to query if a query is due and schedules the timeout
    // for it.
    pub fn poll(&mut self, now: Instant, leader: ReplicaId) -> Option<ReplicaId> {
        match self.next_query {
            Some(at) if self.active && at <= now => {}
            _ => return None,
        }
        let target = match self.next_target(leader) {
            Some(target) => target,
            None => {
                self.finish();
                return None;
            }
        };
        self.next_query = Some(now + self.current_timeout());
        self.backoff = (self.backoff * 2).min(self.max_backoff);
        Some(target)
    }

    // Called when a peer answered. Answers mean the peer is healthy, so the
    // timeout goes back to its initial value.
    pub fn on_response(&mut self, now: Instant) {
        self.backoff = 1;
        if self.active {
            self.next_query = Some(now + self.current_timeout());
        }
    }

    // Issues the next query right away, e.g., because a complete answer still
    // left us behind.
    pub fn query_again(&mut self, now: Instant) {
        if self.active {
            self.next_query = Some(now);
        }
    }

    pub fn finish(&mut self) {
        self.active = false;
        self.next_query = None;
        self.backoff = 1;
    }

    // The leader first, then everybody else in id order after it.
    fn next_target(&mut self, leader: ReplicaId) -> Option<ReplicaId> {
        let size = self.cluster.size();
        let candidates: Vec<ReplicaId> = (0..size)
            .map(|offset| (leader + offset) % size)
            .filter(|r| *r != self.cluster.me())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let target = candidates[self.rotation % candidates.len()];
        self.rotation += 1;
        Some(target)
    }
}
