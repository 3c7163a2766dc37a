use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tracing::{debug, trace, warn};

use crate::paxos::ReplicaId;
use crate::paxos::error::PaxosResult;
use crate::paxos::failure_injection::{Delivery, FailureOptions};
use crate::paxos::message::{Message, MessageKind};

// A message as handed to a listener, tagged with the replica that sent it. The
// message is an error if the frame could not be decoded.
#[derive(Debug)]
pub struct Inbound {
    pub from: ReplicaId,
    pub message: PaxosResult<Message>,
}

// Sends frames to the other members of the cluster. Delivery is best effort:
// frames may be lost, but frames between a pair of replicas are never
// reordered.
pub trait Network: Send + Sync {
    fn me(&self) -> ReplicaId;
    fn size(&self) -> usize;

    fn send_frame(&self, frame: Bytes, to: ReplicaId);

    fn send_to(&self, message: &Message, to: ReplicaId) {
        self.send_frame(message.encode(), to);
    }

    fn send_to_many(&self, message: &Message, targets: &[ReplicaId]) {
        if targets.is_empty() {
            return;
        }
        let frame = message.encode();
        for target in targets {
            self.send_frame(frame.clone(), *target);
        }
    }

    fn send_to_others(&self, message: &Message) {
        let me = self.me();
        let others: Vec<ReplicaId> = (0..self.size()).filter(|r| *r != me).collect();
        self.send_to_many(message, &others);
    }

    fn send_to_all(&self, message: &Message) {
        let all: Vec<ReplicaId> = (0..self.size()).collect();
        self.send_to_many(message, &all);
    }
}

// Decodes incoming frames and hands them to whoever registered for their kind.
// Frames which fail to decode go to the fault listener.
pub struct Router {
    me: ReplicaId,
    routes: HashMap<MessageKind, UnboundedSender<Inbound>>,
    faults: Option<UnboundedSender<Inbound>>,
}

impl Router {
    pub fn new(me: ReplicaId) -> Self {
        Router {
            me,
            routes: HashMap::new(),
            faults: None,
        }
    }

    pub fn register(&mut self, kinds: &[MessageKind], sender: UnboundedSender<Inbound>) {
        for kind in kinds {
            self.routes.insert(*kind, sender.clone());
        }
    }

    pub fn register_faults(&mut self, sender: UnboundedSender<Inbound>) {
        self.faults = Some(sender);
    }

    pub fn deliver(&self, from: ReplicaId, frame: Bytes) {
        match Message::decode(frame) {
            Ok(message) => match self.routes.get(&message.kind()) {
                Some(sender) => {
                    let inbound = Inbound {
                        from,
                        message: Ok(message),
                    };
                    if sender.send(inbound).is_err() {
                        trace!(me = self.me, from, "listener gone, dropping frame");
                    }
                }
                None => debug!(me = self.me, from, kind = ?message.kind(), "no listener"),
            },
            Err(error) => {
                warn!(me = self.me, from, %error, "received malformed frame");
                if let Some(faults) = &self.faults {
                    let _ = faults.send(Inbound {
                        from,
                        message: Err(error),
                    });
                }
            }
        }
    }
}

type Routers = Arc<RwLock<HashMap<ReplicaId, Arc<Router>>>>;
type Link = UnboundedSender<(Bytes, Option<Duration>)>;

// Connects replicas running in the same process. Every ordered pair of
// replicas gets its own queue, drained by a task which applies the injected
// latency, so delayed frames hold back later ones on the same link.
pub struct LocalNetwork {
    size: usize,
    failures: Mutex<FailureOptions>,
    routers: Routers,
    links: Mutex<HashMap<(ReplicaId, ReplicaId), Link>>,
}

impl LocalNetwork {
    pub fn new(size: usize, failures: FailureOptions) -> Arc<Self> {
        Arc::new(LocalNetwork {
            size,
            failures: Mutex::new(failures),
            routers: Arc::new(RwLock::new(HashMap::new())),
            links: Mutex::new(HashMap::new()),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    // Makes the supplied router receive everything sent to the replica,
    // replacing any previous one.
    pub fn attach(&self, replica: ReplicaId, router: Router) {
        self.routers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(replica, Arc::new(router));
    }

    // Frames sent to a detached replica are lost, as if it had crashed.
    pub fn detach(&self, replica: ReplicaId) {
        self.routers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&replica);
    }

    // Returns the handle the supplied replica uses to send.
    pub fn endpoint(self: &Arc<Self>, replica: ReplicaId) -> Arc<dyn Network> {
        Arc::new(LocalEndpoint {
            me: replica,
            network: self.clone(),
        })
    }

    pub fn update_failures(&self, update: impl FnOnce(&mut FailureOptions)) {
        update(&mut self.failures.lock().unwrap_or_else(PoisonError::into_inner));
    }

    pub fn failures(&self) -> FailureOptions {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn send(&self, from: ReplicaId, to: ReplicaId, frame: Bytes) {
        if to >= self.size {
            warn!(from, to, "dropping frame for unknown replica");
            return;
        }
        let decision = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .decide(from, to);
        let delay = match decision {
            Delivery::Drop => {
                trace!(from, to, "dropping frame");
                return;
            }
            Delivery::Deliver(delay) => delay,
        };

        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        let link = links
            .entry((from, to))
            .or_insert_with(|| self.open_link(from, to));
        if let Err(returned) = link.send((frame, delay)) {
            let link = self.open_link(from, to);
            let _ = link.send(returned.0);
            links.insert((from, to), link);
        }
    }

    fn open_link(&self, from: ReplicaId, to: ReplicaId) -> Link {
        let (sender, mut receiver) = unbounded_channel::<(Bytes, Option<Duration>)>();
        let routers = self.routers.clone();
        tokio::spawn(async move {
            while let Some((frame, delay)) = receiver.recv().await {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let router = routers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&to)
                    .cloned();
                match router {
                    Some(router) => router.deliver(from, frame),
                    None => trace!(from, to, "replica not attached, dropping frame"),
                }
            }
        });
        sender
    }
}

struct LocalEndpoint {
    me: ReplicaId,
    network: Arc<LocalNetwork>,
}

impl Network for LocalEndpoint {
    fn me(&self) -> ReplicaId {
        self.me
    }

    fn size(&self) -> usize {
        self.network.size()
    }

    fn send_frame(&self, frame: Bytes, to: ReplicaId) {
        self.network.send(self.me, to, frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::error::PaxosError;
    use crate::paxos::message::Payload;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn alive(log_next_id: u64) -> Message {
        Message::new(1, Payload::Alive { log_next_id })
    }

    fn attach(network: &Arc<LocalNetwork>, replica: ReplicaId) -> UnboundedReceiver<Inbound> {
        let (sender, receiver) = unbounded_channel();
        let mut router = Router::new(replica);
        router.register(&MessageKind::ALL, sender.clone());
        router.register_faults(sender);
        network.attach(replica, router);
        receiver
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let network = LocalNetwork::new(3, FailureOptions::no_failures());
        let mut inbox = attach(&network, 1);
        network.endpoint(0).send_to(&alive(4), 1);

        let inbound = inbox.recv().await.unwrap();
        assert_eq!(inbound.from, 0);
        assert_eq!(inbound.message.unwrap(), alive(4));
    }

    #[tokio::test]
    async fn test_send_to_others_skips_self() {
        let network = LocalNetwork::new(3, FailureOptions::no_failures());
        let mut inboxes: Vec<_> = (0..3).map(|r| attach(&network, r)).collect();
        network.endpoint(2).send_to_others(&alive(0));

        assert_eq!(inboxes[0].recv().await.unwrap().from, 2);
        assert_eq!(inboxes[1].recv().await.unwrap().from, 2);
        network.endpoint(2).send_to_all(&alive(1));
        let own = inboxes[2].recv().await.unwrap();
        assert_eq!(own.message.unwrap(), alive(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_preserves_order() {
        let network = LocalNetwork::new(2, FailureOptions::no_failures());
        let mut inbox = attach(&network, 1);
        let endpoint = network.endpoint(0);

        network.update_failures(|f| *f = FailureOptions::no_failures().with_latency(1.0, 50));
        endpoint.send_to(&alive(1), 1);
        network.update_failures(|f| *f = FailureOptions::no_failures());
        endpoint.send_to(&alive(2), 1);

        assert_eq!(inbox.recv().await.unwrap().message.unwrap(), alive(1));
        assert_eq!(inbox.recv().await.unwrap().message.unwrap(), alive(2));
    }

    #[tokio::test]
    async fn test_disconnected_replica() {
        let network = LocalNetwork::new(2, FailureOptions::no_failures());
        let mut inbox = attach(&network, 1);
        let endpoint = network.endpoint(0);

        network.update_failures(|f| f.disconnect(0));
        endpoint.send_to(&alive(1), 1);
        network.update_failures(|f| f.reconnect(0));
        endpoint.send_to(&alive(2), 1);

        assert_eq!(inbox.recv().await.unwrap().message.unwrap(), alive(2));
    }

    #[tokio::test]
    async fn test_malformed_frame_reported() {
        let network = LocalNetwork::new(2, FailureOptions::no_failures());
        let mut inbox = attach(&network, 1);
        network
            .endpoint(0)
            .send_frame(Bytes::from_static(&[42, 0, 0]), 1);

        let inbound = inbox.recv().await.unwrap();
        assert!(matches!(inbound.message, Err(PaxosError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_detached_replica_gets_nothing() {
        let network = LocalNetwork::new(2, FailureOptions::no_failures());
        let mut inbox = attach(&network, 1);
        network.detach(1);

        // The old listener was dropped along with its router.
        assert!(inbox.recv().await.is_none());

        let mut inbox = attach(&network, 1);
        network.endpoint(0).send_to(&alive(2), 1);
        assert_eq!(inbox.recv().await.unwrap().message.unwrap(), alive(2));
    }
}
