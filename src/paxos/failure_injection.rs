use std::collections::HashSet;
use std::time::Duration;

use crate::paxos::ReplicaId;

// Options used to control failure injection on the in-process network.
#[derive(Debug, Clone)]
pub struct FailureOptions {
    // Probability with which a frame is dropped.
    pub failure_probability: f64,

    // Probability with which to delay a frame.
    pub latency_probability: f64,

    // How much latency to add for delayed frames.
    pub latency_ms: u32,

    // Replicas which can neither send nor receive anything.
    pub disconnected: HashSet<ReplicaId>,
}

// What happens to a single frame on its way from one replica to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Drop,
    Deliver(Option<Duration>),
}

impl FailureOptions {
    // Returns failure injection options which don't add any failures.
    pub fn no_failures() -> Self {
        Self {
            failure_probability: 0.0,
            latency_probability: 0.0,
            latency_ms: 0,
            disconnected: HashSet::new(),
        }
    }

    // Returns failure injection options which drop frames with the supplied probability.
    pub fn fail_with_probability(failure_probability: f64) -> Self {
        Self {
            failure_probability,
            ..Self::no_failures()
        }
    }

    pub fn with_latency(self, latency_probability: f64, latency_ms: u32) -> Self {
        Self {
            latency_probability,
            latency_ms,
            ..self
        }
    }

    // Cuts the supplied replica off from everybody else.
    pub fn disconnect(&mut self, replica: ReplicaId) {
        self.disconnected.insert(replica);
    }

    pub fn reconnect(&mut self, replica: ReplicaId) {
        self.disconnected.remove(&replica);
    }

    pub fn is_disconnected(&self, replica: ReplicaId) -> bool {
        self.disconnected.contains(&replica)
    }

    // Rolls the dice for one frame. Frames a replica sends to itself are
    // always delivered right away.
    pub fn decide(&self, from: ReplicaId, to: ReplicaId) -> Delivery {
        if from == to {
            return Delivery::Deliver(None);
        }
        if self.is_disconnected(from) || self.is_disconnected(to) {
            return Delivery::Drop;
        }
        if rand::random::<f64>() < self.failure_probability {
            return Delivery::Drop;
        }
        if self.latency_ms > 0 && rand::random::<f64>() < self.latency_probability {
            return Delivery::Deliver(Some(Duration::from_millis(self.latency_ms as u64)));
        }
        Delivery::Deliver(None)
    }
}
