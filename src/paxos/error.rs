use thiserror::Error;

use crate::paxos::{InstanceId, View};

/// A specialized `Result` type for replication operations.
pub type PaxosResult<T> = Result<T, PaxosError>;

/// Structured error type used throughout the paxos package.
#[derive(Error, Debug)]
pub enum PaxosError {
    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error(
        "Conflicting decision for instance {instance}: decided in view {decided_view}, got another value in view {view}"
    )]
    ConflictingDecision {
        instance: InstanceId,
        decided_view: View,
        view: View,
    },

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl PaxosError {
    pub(crate) fn truncated(what: &str) -> Self {
        Self::Malformed(format!("Truncated {}", what))
    }

    // Returns whether continuing after this error could compromise the single
    // decision per instance guarantee. Such errors stop the replica.
    pub fn is_fatal(&self) -> bool {
        match self {
            PaxosError::Storage(_)
            | PaxosError::Malformed(_)
            | PaxosError::ConflictingDecision { .. }
            | PaxosError::Invariant(_) => true,
            PaxosError::Initialization(_)
            | PaxosError::Snapshot(_)
            | PaxosError::ChannelClosed(_) => false,
        }
    }
}
