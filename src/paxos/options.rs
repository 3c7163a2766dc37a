use std::str::FromStr;
use std::time::Duration;

use crate::paxos::storage::PersistenceOptions;

const DEFAULT_WINDOW_SIZE: usize = 2;
const DEFAULT_BATCH_SIZE_BYTES: usize = 64 * 1024;
const DEFAULT_RETRANSMIT_TIMEOUT_MS: u64 = 1000;
const DEFAULT_SUSPECT_TIMEOUT_MS: u64 = 1000;
const DEFAULT_ALIVE_INTERVAL_MS: u64 = 250;
const DEFAULT_CATCH_UP_TIMEOUT_MS: u64 = 500;
const DEFAULT_MAX_CATCH_UP_BACKOFF: u32 = 8;
const DEFAULT_PERIODIC_CATCH_UP_MS: u64 = 2000;
const DEFAULT_CATCH_UP_PART_BYTES: usize = 64 * 1024;
const DEFAULT_SNAPSHOT_INTERVAL: u64 = 100;
const DEFAULT_MAX_PENDING_REQUESTS: usize = 2048;
const DEFAULT_FORWARD_BATCH_BYTES: usize = 16 * 1024;

// Selects what a replica keeps on stable storage, and therefore how it
// rejoins the cluster after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashModel {
    // Nothing is persisted. A crashed replica never comes back.
    CrashStop,

    // The view and every change to the log are written synchronously.
    FullStableStorage,

    // Only the view is written. The log is recovered from peers.
    ViewStableStorage,

    // Only an incarnation counter is written. The log is recovered from peers.
    EpochStableStorage,
}

impl FromStr for CrashModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CrashStop" => Ok(CrashModel::CrashStop),
            "FullSS" => Ok(CrashModel::FullStableStorage),
            "ViewSS" => Ok(CrashModel::ViewStableStorage),
            "EpochSS" => Ok(CrashModel::EpochStableStorage),
            other => Err(format!("Unknown crash model: {}", other)),
        }
    }
}

// Parameters used to configure the behavior of a replica. Built once at startup
// and handed to every component that needs it.
#[derive(Debug, Clone)]
pub struct Options {
    // Maximum number of instances at or after the first undecided one which may
    // be in flight at once.
    pub window_size: usize,

    // Upper bound on the encoded size of a single batch of client requests.
    pub batch_size_bytes: usize,

    // How long to wait for phase 1 or phase 2 answers before sending again, also
    // used for recovery queries.
    pub retransmit_timeout: Duration,

    // How long a follower waits without hearing from the leader before it
    // suspects it has failed.
    pub suspect_timeout: Duration,

    // How frequently the leader announces that it is alive.
    pub alive_interval: Duration,

    // Initial timeout for an unanswered catch-up query.
    pub catch_up_timeout: Duration,

    // The catch-up timeout doubles up to this multiple of the initial timeout.
    pub max_catch_up_backoff: u32,

    // How frequently to check whether the log has holes that need catching up.
    pub periodic_catch_up: Duration,

    // Upper bound on the size of a single catch-up response part.
    pub catch_up_part_bytes: usize,

    // Number of executed instances between snapshots. Zero disables snapshots.
    pub snapshot_interval: u64,

    pub crash_model: CrashModel,
    pub persistence: PersistenceOptions,

    // Bound on un-acknowledged client requests per replica, if any.
    pub max_pending_requests: Option<usize>,

    // Upper bound on the size of a single bundle of forwarded requests.
    pub forward_batch_bytes: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            window_size: DEFAULT_WINDOW_SIZE,
            batch_size_bytes: DEFAULT_BATCH_SIZE_BYTES,
            retransmit_timeout: Duration::from_millis(DEFAULT_RETRANSMIT_TIMEOUT_MS),
            suspect_timeout: Duration::from_millis(DEFAULT_SUSPECT_TIMEOUT_MS),
            alive_interval: Duration::from_millis(DEFAULT_ALIVE_INTERVAL_MS),
            catch_up_timeout: Duration::from_millis(DEFAULT_CATCH_UP_TIMEOUT_MS),
            max_catch_up_backoff: DEFAULT_MAX_CATCH_UP_BACKOFF,
            periodic_catch_up: Duration::from_millis(DEFAULT_PERIODIC_CATCH_UP_MS),
            catch_up_part_bytes: DEFAULT_CATCH_UP_PART_BYTES,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            crash_model: CrashModel::CrashStop,
            persistence: PersistenceOptions::InMemory,
            max_pending_requests: Some(DEFAULT_MAX_PENDING_REQUESTS),
            forward_batch_bytes: DEFAULT_FORWARD_BATCH_BYTES,
        }
    }
}

impl Options {
    pub fn with_window_size(self, window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            ..self
        }
    }

    pub fn with_batch_size_bytes(self, batch_size_bytes: usize) -> Self {
        Self {
            batch_size_bytes,
            ..self
        }
    }

    pub fn with_snapshot_interval(self, snapshot_interval: u64) -> Self {
        Self {
            snapshot_interval,
            ..self
        }
    }

    // Keeps the supplied crash model and the directory its durable state lives in.
    pub fn with_persistence(self, crash_model: CrashModel, persistence: PersistenceOptions) -> Self {
        Self {
            crash_model,
            persistence,
            ..self
        }
    }

    pub fn with_max_pending_requests(self, max_pending_requests: Option<usize>) -> Self {
        Self {
            max_pending_requests,
            ..self
        }
    }

    pub fn with_catch_up_part_bytes(self, catch_up_part_bytes: usize) -> Self {
        Self {
            catch_up_part_bytes,
            ..self
        }
    }

    // Scales every timeout by the supplied factor. Handy to make a cluster react
    // faster in tests or slower on loaded machines.
    pub fn with_timeout_scale(self, factor: f64) -> Self {
        let scale = |d: Duration| d.mul_f64(factor);
        Self {
            retransmit_timeout: scale(self.retransmit_timeout),
            suspect_timeout: scale(self.suspect_timeout),
            alive_interval: scale(self.alive_interval),
            catch_up_timeout: scale(self.catch_up_timeout),
            periodic_catch_up: scale(self.periodic_catch_up),
            ..self
        }
    }
}
