// The replication engine: one Paxos instance per log position, driven by a
// single protocol loop per replica. The execution side lives in the replica
// module.

pub type ReplicaId = usize;
pub type View = u64;
pub type InstanceId = u64;

mod acceptor;
mod batcher;
mod catchup;
mod codec;
mod instance;
mod learner;
mod log;
mod proposer;
mod view;

mod cluster;
pub use cluster::Cluster;

mod diagnostics;
pub use diagnostics::{Diagnostics, ReplicaDiagnostics};

mod dispatcher;
pub use dispatcher::{Decision, Event, Inbox, Paxos};

mod error;
pub use error::{PaxosError, PaxosResult};

mod failure_injection;
pub use failure_injection::FailureOptions;

mod message;
pub use message::{MessageKind, Payload};

mod network;
pub use network::{Inbound, LocalNetwork, Router};

mod options;
pub use options::{CrashModel, Options};

mod recovery;

mod request;
pub use request::{
    ClientId, Reply, Request, RequestId, SequenceNumber, decode_batch, encode_batch,
};

mod snapshot;
pub use snapshot::Snapshot;

mod state_machine;
pub use state_machine::{StateMachine, StateMachineResult};

mod storage;
pub use storage::PersistenceOptions;

#[cfg(test)]
pub mod testing;
