// Runs one member of the cluster: the protocol loop, the executor and the
// client-facing request pipeline, wired together with channels.

use std::sync::Arc;

use async_std::channel;
use async_std::sync::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::paxos::{
    Cluster, Inbound, Inbox, LocalNetwork, MessageKind, Options, Paxos, PaxosError, PaxosResult,
    Payload, ReplicaDiagnostics, ReplicaId, Request, Router, StateMachine,
};

mod executor;
mod http;
mod requests;
mod store;

pub use executor::Executor;
pub use http::HttpHandler;
pub use requests::{ClientReply, RequestManager};
pub use store::MapStore;

// Errors which stopped a replica, reported to whoever supervises the cluster.
pub type FatalErrors = UnboundedSender<(ReplicaId, PaxosError)>;

pub struct Replica {
    id: ReplicaId,
    network: Arc<LocalNetwork>,
    requests: Arc<RequestManager>,
    shutdown: channel::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl Replica {
    // Loads the replica's durable state, joins the network and starts all of
    // its tasks. If a listener is supplied, clients can reach the replica over
    // HTTP on it.
    pub async fn start(
        id: ReplicaId,
        options: Options,
        network: Arc<LocalNetwork>,
        state_machine: Box<dyn StateMachine + Send>,
        diagnostics: Option<Arc<Mutex<ReplicaDiagnostics>>>,
        listener: Option<TcpListener>,
        fatal: FatalErrors,
    ) -> PaxosResult<Self> {
        let cluster = Cluster::new(id, network.size());
        let span = info_span!("replica", id);

        let (priority_sender, priority) = unbounded_channel();
        let (protocol_sender, protocol) = unbounded_channel();
        let (forwarded_sender, forwarded) = unbounded_channel();
        let (events_sender, events) = unbounded_channel();
        let (decisions_sender, decisions) = unbounded_channel();
        let (shutdown, shutdown_receiver) = channel::unbounded::<()>();

        let mut router = Router::new(id);
        let protocol_kinds: Vec<MessageKind> = MessageKind::ALL
            .into_iter()
            .filter(|k| *k != MessageKind::Alive && *k != MessageKind::ForwardedClientRequests)
            .collect();
        router.register(&[MessageKind::Alive], priority_sender);
        router.register(&protocol_kinds, protocol_sender.clone());
        router.register(&[MessageKind::ForwardedClientRequests], forwarded_sender);
        router.register_faults(protocol_sender);

        let paxos = Paxos::new(
            cluster,
            options.clone(),
            network.endpoint(id),
            decisions_sender,
            diagnostics.clone(),
        )
        .instrument(span.clone())
        .await?;

        let requests = Arc::new(RequestManager::new(
            options.max_pending_requests,
            events_sender.clone(),
        ));
        let executor = Executor::new(
            state_machine,
            requests.clone(),
            events_sender,
            diagnostics,
            options.snapshot_interval,
        );

        let mut tasks = Vec::new();
        let inbox = Inbox {
            priority,
            protocol,
            events,
            shutdown: shutdown_receiver.clone(),
        };
        tasks.push(supervise(id, "protocol", paxos.run(inbox), fatal.clone(), &span));
        tasks.push(supervise(id, "executor", executor.run(decisions), fatal.clone(), &span));
        tasks.push(supervise(
            id,
            "forwarding",
            forward_loop(requests.clone(), forwarded),
            fatal,
            &span,
        ));

        if let Some(listener) = listener {
            let address = listener
                .local_addr()
                .map_err(|e| PaxosError::Initialization(e.to_string()))?;
            let routes = HttpHandler::new(requests.clone()).routes();
            let signal = async move { shutdown_receiver.recv().await.unwrap_or(()) };
            tasks.push(tokio::spawn(
                async move {
                    match axum::serve(listener, routes)
                        .with_graceful_shutdown(signal)
                        .await
                    {
                        Ok(()) => debug!("serving terminated"),
                        Err(message) => error!(%message, "serving terminated unsuccessfully"),
                    }
                }
                .instrument(span.clone()),
            ));
            info!(parent: &span, %address, "serving client requests");
        }

        // Only attach once everything is listening.
        network.attach(id, router);
        Ok(Replica {
            id,
            network,
            requests,
            shutdown,
            tasks,
        })
    }

    // Submits a request as if a client had sent it to this replica.
    pub async fn submit(&self, request: Request) -> PaxosResult<oneshot::Receiver<ClientReply>> {
        let (sender, receiver) = oneshot::channel();
        self.requests
            .on_client_request(request, Box::new(sender))
            .await?;
        Ok(receiver)
    }

    // Stops the replica as if it had crashed: it drops off the network and
    // loses everything not on stable storage.
    pub async fn stop(self) {
        self.network.detach(self.id);
        self.shutdown.close();
        for task in self.tasks {
            if let Err(error) = task.await {
                warn!(id = self.id, %error, "replica task panicked");
            }
        }
        info!(id = self.id, "stopped");
    }
}

// Hands requests forwarded by other replicas to the pipeline.
async fn forward_loop(
    requests: Arc<RequestManager>,
    mut forwarded: UnboundedReceiver<Inbound>,
) -> PaxosResult<()> {
    while let Some(inbound) = forwarded.recv().await {
        if let Payload::ForwardedClientRequests { requests: batch } = inbound.message?.payload {
            requests.on_forwarded(batch).await?;
        }
    }
    Ok(())
}

// Runs one of the replica's loops, reporting the error which ended it.
fn supervise(
    id: ReplicaId,
    name: &'static str,
    task: impl Future<Output = PaxosResult<()>> + Send + 'static,
    fatal: FatalErrors,
    span: &tracing::Span,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            match task.await {
                Ok(()) => debug!(task = name, "done"),
                Err(PaxosError::ChannelClosed(what)) => {
                    debug!(task = name, what, "stopping, channel closed")
                }
                Err(e) => {
                    error!(task = name, error = %e, fatal = e.is_fatal(), "replica failed");
                    let _ = fatal.send((id, e));
                }
            }
        }
        .instrument(span.clone()),
    )
}
