use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_std::sync::Mutex;
#[cfg(test)]
use futures::Future;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::sync::oneshot;
#[cfg(test)]
use tokio::time::sleep;
use tracing::info;

use crate::paxos::{
    CrashModel, Diagnostics, FailureOptions, LocalNetwork, Options, PaxosError, PaxosResult,
    PersistenceOptions, ReplicaId, Request, StateMachine,
};
use crate::replica::{ClientReply, FatalErrors, MapStore, Replica};

type StateMachineFactory = Arc<dyn Fn() -> Box<dyn StateMachine + Send> + Send + Sync>;

// Represents a collection of replicas that interact with each other. In a real
// production deployment, these replicas would be on different machines, but
// the harness manages all of them in a single process for convenience. The
// harness can crash and restart individual replicas.
pub struct Harness {
    network: Arc<LocalNetwork>,
    options: Options,
    diagnostics: Arc<Mutex<Diagnostics>>,
    replicas: Mutex<Vec<Option<Replica>>>,
    http: Vec<Option<SocketAddr>>,
    persistence_root: Option<PathBuf>,
    state_machines: StateMachineFactory,
    fatal_sender: FatalErrors,
    fatal: Mutex<UnboundedReceiver<(ReplicaId, PaxosError)>>,
}

// Used to capture the settings of a harness before starting any replica.
pub struct HarnessBuilder {
    size: usize,
    failure: FailureOptions,
    options: Options,
    http: bool,
    persistence_root: Option<PathBuf>,
    wipe_persistence: bool,
    state_machines: StateMachineFactory,
}

impl HarnessBuilder {
    // Starts all replicas and returns the harness managing them.
    pub async fn build(self) -> Result<Harness, Box<dyn Error>> {
        if self.options.crash_model != CrashModel::CrashStop && self.persistence_root.is_none() {
            return Err(format!(
                "Crash model {:?} needs a persistence directory",
                self.options.crash_model
            )
            .into());
        }

        let mut listeners = Vec::new();
        let mut http = Vec::new();
        for _ in 0..self.size {
            if self.http {
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                http.push(Some(listener.local_addr()?));
                listeners.push(Some(listener));
            } else {
                http.push(None);
                listeners.push(None);
            }
        }

        let (fatal_sender, fatal) = unbounded_channel();
        let harness = Harness {
            network: LocalNetwork::new(self.size, self.failure),
            options: self.options,
            diagnostics: Arc::new(Mutex::new(Diagnostics::new())),
            replicas: Mutex::new((0..self.size).map(|_| None).collect()),
            http,
            persistence_root: self.persistence_root,
            state_machines: self.state_machines,
            fatal_sender,
            fatal: Mutex::new(fatal),
        };

        for (id, listener) in listeners.into_iter().enumerate() {
            let replica = harness
                .start_replica(id, listener, self.wipe_persistence)
                .await?;
            harness.replicas.lock().await[id] = Some(replica);
        }
        info!(size = harness.size(), "started cluster");
        Ok(harness)
    }

    // Consumes this instance and returns an instance with the failure options set.
    pub fn with_failure(self, failure: FailureOptions) -> Self {
        Self { failure, ..self }
    }

    pub fn with_options(self, options: Options) -> Self {
        Self { options, ..self }
    }

    // Makes every replica serve client requests over HTTP on a local port.
    pub fn with_http(self) -> Self {
        Self { http: true, ..self }
    }

    // Keeps each replica's durable state in its own directory under "root".
    pub fn with_persistence(self, root: PathBuf, wipe: bool) -> Self {
        Self {
            persistence_root: Some(root),
            wipe_persistence: wipe,
            ..self
        }
    }

    pub fn with_state_machine(
        self,
        factory: impl Fn() -> Box<dyn StateMachine + Send> + Send + Sync + 'static,
    ) -> Self {
        Self {
            state_machines: Arc::new(factory),
            ..self
        }
    }
}

impl Harness {
    // Creates a harness builder for a cluster of the supplied size, running
    // the key-value store without failures by default.
    pub fn builder(size: usize) -> HarnessBuilder {
        HarnessBuilder {
            size,
            failure: FailureOptions::no_failures(),
            options: Options::default(),
            http: false,
            persistence_root: None,
            wipe_persistence: false,
            state_machines: Arc::new(|| Box::new(MapStore::new())),
        }
    }

    pub fn size(&self) -> usize {
        self.network.size()
    }

    // Returns the "host:port" addresses of the replicas' HTTP front-ends.
    pub fn addresses(&self) -> Vec<String> {
        self.http.iter().flatten().map(|a| a.to_string()).collect()
    }

    // Returns the diagnostics object used for this harness.
    pub fn diagnostics(&self) -> Arc<Mutex<Diagnostics>> {
        self.diagnostics.clone()
    }

    pub fn update_failures(&self, update: impl FnOnce(&mut FailureOptions)) {
        self.network.update_failures(update);
    }

    // Submits a request to the supplied replica, as a client connected to it
    // would. The returned channel yields the reply.
    pub async fn submit(
        &self,
        replica: ReplicaId,
        request: Request,
    ) -> PaxosResult<oneshot::Receiver<ClientReply>> {
        match &self.replicas.lock().await[replica] {
            Some(r) => r.submit(request).await,
            None => Err(PaxosError::ChannelClosed("replica is down")),
        }
    }

    pub async fn is_running(&self, replica: ReplicaId) -> bool {
        self.replicas.lock().await[replica].is_some()
    }

    // Stops the supplied replica as if the process had crashed.
    pub async fn crash(&self, replica: ReplicaId) {
        let stopped = self.replicas.lock().await[replica].take();
        if let Some(r) = stopped {
            info!(replica, "crashing replica");
            r.stop().await;
        }
    }

    // Starts a crashed replica again, from whatever its crash model kept.
    pub async fn restart(&self, replica: ReplicaId) -> Result<(), Box<dyn Error>> {
        if self.options.crash_model == CrashModel::CrashStop {
            return Err("Crash-stop replicas never come back".into());
        }
        if self.is_running(replica).await {
            return Err(format!("Replica {} is running", replica).into());
        }
        let listener = match self.http[replica] {
            Some(address) => Some(TcpListener::bind(address).await?),
            None => None,
        };
        self.diagnostics
            .lock()
            .await
            .get_replica(replica)
            .lock()
            .await
            .report_restart();

        info!(replica, "restarting replica");
        let started = self.start_replica(replica, listener, false).await?;
        self.replicas.lock().await[replica] = Some(started);
        Ok(())
    }

    // Validates all available diagnostics and panics on failure.
    pub async fn validate(&self) {
        self.diagnostics
            .lock()
            .await
            .validate()
            .await
            .expect("validate");
    }

    // Waits for a replica to fail. Returns None once the harness is gone.
    pub async fn next_fatal(&self) -> Option<(ReplicaId, PaxosError)> {
        self.fatal.lock().await.recv().await
    }

    // Stops all the replicas of this harness.
    pub async fn stop(&self) {
        for replica in 0..self.size() {
            self.crash(replica).await;
        }
    }

    // Keeps resubmitting the request to the supplied replica until a reply
    // arrives, the way a client retries after a timeout.
    #[cfg(test)]
    pub async fn execute(
        &self,
        replica: ReplicaId,
        request: Request,
        timeout_duration: Duration,
    ) -> ClientReply {
        wait_for(timeout_duration, || async {
            let receiver = self.submit(replica, request.clone()).await.ok()?;
            tokio::time::timeout(Duration::from_secs(1), receiver)
                .await
                .ok()?
                .ok()
        })
        .await
        .expect("execute")
    }

    async fn start_replica(
        &self,
        id: ReplicaId,
        listener: Option<TcpListener>,
        wipe: bool,
    ) -> PaxosResult<Replica> {
        let mut options = self.options.clone();
        if let Some(root) = &self.persistence_root {
            let path = root.join(format!("replica-{}", id));
            let path = path
                .to_str()
                .ok_or_else(|| PaxosError::Initialization(format!("Bad path {:?}", path)))?
                .to_string();
            let crash_model = options.crash_model;
            options = options.with_persistence(
                crash_model,
                PersistenceOptions::Directory { path, wipe },
            );
        }
        let diagnostics = self.diagnostics.lock().await.get_replica(id);
        Replica::start(
            id,
            options,
            self.network.clone(),
            (self.state_machines)(),
            Some(diagnostics),
            listener,
            self.fatal_sender.clone(),
        )
        .await
    }
}

#[cfg(test)]
/// Waits for a condition to become true, up to the given `timeout_duration`.
/// Returns `Ok(T)` if the condition is met in time, or `Err(())` on timeout.
pub async fn wait_for<F, Fut, T>(timeout_duration: Duration, mut condition: F) -> Result<T, ()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if let Some(result) = condition().await {
            return Ok(result);
        }
        sleep(Duration::from_millis(50)).await;
    }
    Err(())
}
