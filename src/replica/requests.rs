use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_std::sync::Mutex;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tracing::{debug, trace};

use crate::paxos::{ClientId, Event, PaxosError, PaxosResult, Reply, Request, RequestId};

const TOO_OLD: &str = "request too old";

// What a client eventually gets back for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientReply {
    Reply(Bytes),

    // The request was refused and resending it will not help.
    Nack(String),
}

// The connection a request arrived on. Replies are fire-and-forget: if the
// client is gone, it will resend the request later.
pub trait ClientHandle: Send {
    fn send_reply(self: Box<Self>, reply: ClientReply);
}

impl ClientHandle for oneshot::Sender<ClientReply> {
    fn send_reply(self: Box<Self>, reply: ClientReply) {
        if self.send(reply).is_err() {
            trace!("client went away before the reply");
        }
    }
}

struct Pending {
    handle: Box<dyn ClientHandle>,

    // Released once the reply is routed.
    permit: Option<OwnedSemaphorePermit>,
}

// Front door for client requests on one replica. Filters out requests which
// were executed already, keeps the handles of requests waiting for execution
// and hands new requests to the protocol loop.
//
// Locks are always taken in the order last_replies, then pending. A flow
// control permit is never acquired while holding either.
pub struct RequestManager {
    // Written only by the executor.
    last_replies: Mutex<BTreeMap<ClientId, Reply>>,
    pending: Mutex<HashMap<RequestId, Pending>>,
    permits: Option<Arc<Semaphore>>,
    events: UnboundedSender<Event>,
}

impl RequestManager {
    pub fn new(max_pending_requests: Option<usize>, events: UnboundedSender<Event>) -> Self {
        RequestManager {
            last_replies: Mutex::new(BTreeMap::new()),
            pending: Mutex::new(HashMap::new()),
            permits: max_pending_requests.map(|max| Arc::new(Semaphore::new(max.max(1)))),
            events,
        }
    }

    // Handles a request submitted by a client connected to this replica. The
    // handle gets the reply once the request was executed, or right away if it
    // was executed before.
    pub async fn on_client_request(
        &self,
        request: Request,
        handle: Box<dyn ClientHandle>,
    ) -> PaxosResult<()> {
        // Requests answerable from the cache don't wait for a permit.
        let cached = {
            let last_replies = self.last_replies.lock().await;
            answer_from_cache(last_replies.get(&request.id.client_id), &request)
        };
        if let Some(answer) = cached {
            handle.send_reply(answer);
            return Ok(());
        }

        let resubmitted = self.pending.lock().await.contains_key(&request.id);
        let permit = match &self.permits {
            Some(permits) if !resubmitted => Some(
                permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| PaxosError::ChannelClosed("request permits"))?,
            ),
            _ => None,
        };

        // The request may have been executed while we waited.
        let last_replies = self.last_replies.lock().await;
        if let Some(answer) = answer_from_cache(last_replies.get(&request.id.client_id), &request) {
            drop(last_replies);
            handle.send_reply(answer);
            return Ok(());
        }

        let mut pending = self.pending.lock().await;
        drop(last_replies);
        let permit = match pending.remove(&request.id) {
            // Keep the permit of the earlier submission.
            Some(previous) => previous.permit.or(permit),
            None => permit,
        };
        pending.insert(
            request.id,
            Pending {
                handle,
                permit,
            },
        );
        drop(pending);

        debug!(id = %request.id, "new client request");
        self.submit(vec![request])
    }

    // Handles requests another replica forwarded to us as the leader. Nobody
    // is waiting for their replies here.
    pub async fn on_forwarded(&self, requests: Vec<Request>) -> PaxosResult<()> {
        let last_replies = self.last_replies.lock().await;
        let fresh: Vec<Request> = requests
            .into_iter()
            .filter(|r| answer_from_cache(last_replies.get(&r.id.client_id), r).is_none())
            .collect();
        drop(last_replies);
        if fresh.is_empty() {
            return Ok(());
        }
        trace!(count = fresh.len(), "forwarded requests");
        self.submit(fresh)
    }

    // Returns whether the supplied request still needs executing, i.e., no
    // reply for it or a later request of the same client is cached.
    pub async fn is_new(&self, id: &RequestId) -> bool {
        match self.last_replies.lock().await.get(&id.client_id) {
            Some(cached) => cached.id.sequence < id.sequence,
            None => true,
        }
    }

    // Records the reply of an executed request and routes it to the waiting
    // client, if it is connected to this replica.
    pub async fn on_request_executed(&self, reply: Reply) {
        let mut last_replies = self.last_replies.lock().await;
        let mut pending = self.pending.lock().await;
        last_replies.insert(reply.id.client_id, reply.clone());
        drop(last_replies);
        if let Some(waiting) = pending.remove(&reply.id) {
            waiting.handle.send_reply(ClientReply::Reply(reply.value));
        }
    }

    // Answers a waiting client from the cache. Used when a request is decided
    // again after it was executed.
    pub async fn resend_cached(&self, id: &RequestId) {
        let last_replies = self.last_replies.lock().await;
        let mut pending = self.pending.lock().await;
        let cached = last_replies.get(&id.client_id);
        if let Some(reply) = cached.filter(|c| c.id == *id) {
            if let Some(waiting) = pending.remove(id) {
                waiting
                    .handle
                    .send_reply(ClientReply::Reply(reply.value.clone()));
            }
        }
    }

    // Replaces the cache with the one carried by a snapshot. Waiting clients
    // whose requests the snapshot covers are answered.
    pub async fn install_replies(&self, replies: BTreeMap<ClientId, Reply>) {
        let mut last_replies = self.last_replies.lock().await;
        let mut pending = self.pending.lock().await;
        *last_replies = replies;

        let covered: Vec<RequestId> = pending
            .keys()
            .filter(|id| {
                matches!(last_replies.get(&id.client_id), Some(c) if c.id.sequence >= id.sequence)
            })
            .copied()
            .collect();
        for id in covered {
            if let (Some(waiting), Some(cached)) =
                (pending.remove(&id), last_replies.get(&id.client_id))
            {
                let answer = if cached.id == id {
                    ClientReply::Reply(cached.value.clone())
                } else {
                    ClientReply::Nack(TOO_OLD.to_string())
                };
                waiting.handle.send_reply(answer);
            }
        }
    }

    pub async fn last_reply(&self, client: ClientId) -> Option<Reply> {
        self.last_replies.lock().await.get(&client).cloned()
    }

    // Returns a copy of the cache, to be stored with a snapshot.
    pub async fn replies_snapshot(&self) -> BTreeMap<ClientId, Reply> {
        self.last_replies.lock().await.clone()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    fn submit(&self, requests: Vec<Request>) -> PaxosResult<()> {
        self.events
            .send(Event::ClientRequests(requests))
            .map_err(|_| PaxosError::ChannelClosed("events"))
    }
}

// Returns the answer for a request which must not be executed again, if any.
fn answer_from_cache(cached: Option<&Reply>, request: &Request) -> Option<ClientReply> {
    let cached = cached?;
    if cached.id.sequence > request.id.sequence {
        return Some(ClientReply::Nack(TOO_OLD.to_string()));
    }
    if cached.id.sequence == request.id.sequence {
        return Some(ClientReply::Reply(cached.value.clone()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    struct Fixture {
        manager: RequestManager,
        events: UnboundedReceiver<Event>,
    }

    impl Fixture {
        fn new(max_pending: Option<usize>) -> Self {
            let (sender, events) = unbounded_channel();
            Fixture {
                manager: RequestManager::new(max_pending, sender),
                events,
            }
        }

        async fn submit(&self, client: ClientId, sequence: u64) -> oneshot::Receiver<ClientReply> {
            let (sender, receiver) = oneshot::channel();
            let request = Request::new(client, sequence, Bytes::from("op"));
            self.manager
                .on_client_request(request, Box::new(sender))
                .await
                .unwrap();
            receiver
        }

        fn submitted(&mut self) -> Vec<RequestId> {
            let mut ids = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                if let Event::ClientRequests(requests) = event {
                    ids.extend(requests.iter().map(|r| r.id));
                }
            }
            ids
        }
    }

    #[tokio::test]
    async fn test_new_request_routed_after_execution() {
        let mut f = Fixture::new(None);
        let receiver = f.submit(7, 3).await;
        assert_eq!(f.submitted(), vec![RequestId::new(7, 3)]);
        assert_eq!(f.manager.pending_count().await, 1);

        f.manager
            .on_request_executed(Reply::new(RequestId::new(7, 3), Bytes::from("done")))
            .await;
        assert_eq!(
            receiver.await.unwrap(),
            ClientReply::Reply(Bytes::from("done"))
        );
        assert_eq!(f.manager.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_answered_from_cache() {
        let mut f = Fixture::new(None);
        f.manager
            .on_request_executed(Reply::new(RequestId::new(7, 3), Bytes::from("done")))
            .await;

        // Same sequence: the cached reply, without executing again.
        let receiver = f.submit(7, 3).await;
        assert_eq!(
            receiver.await.unwrap(),
            ClientReply::Reply(Bytes::from("done"))
        );

        // Lower sequence: refused.
        let receiver = f.submit(7, 2).await;
        assert_eq!(
            receiver.await.unwrap(),
            ClientReply::Nack(TOO_OLD.to_string())
        );
        assert!(f.submitted().is_empty());
        assert!(!f.manager.is_new(&RequestId::new(7, 3)).await);
        assert!(f.manager.is_new(&RequestId::new(7, 4)).await);
    }

    #[tokio::test]
    async fn test_resubmission_replaces_handle() {
        let mut f = Fixture::new(Some(1));
        let first = f.submit(1, 1).await;
        // Does not block on the single permit, the earlier one is reused.
        let second = f.submit(1, 1).await;
        assert_eq!(f.submitted().len(), 2);

        f.manager
            .on_request_executed(Reply::new(RequestId::new(1, 1), Bytes::from("x")))
            .await;
        assert!(first.await.is_err());
        assert_eq!(second.await.unwrap(), ClientReply::Reply(Bytes::from("x")));

        // The permit is back.
        let _third = f.submit(2, 1).await;
        assert_eq!(f.submitted(), vec![RequestId::new(2, 1)]);
    }

    #[tokio::test]
    async fn test_cached_reply_while_permits_exhausted() {
        let mut f = Fixture::new(Some(1));
        f.manager
            .on_request_executed(Reply::new(RequestId::new(2, 4), Bytes::from("cached")))
            .await;

        // Holds the only permit until executed.
        let _waiting = f.submit(1, 1).await;
        assert_eq!(f.submitted(), vec![RequestId::new(1, 1)]);

        let receiver = tokio::time::timeout(Duration::from_secs(1), f.submit(2, 4))
            .await
            .expect("answered without a permit");
        assert_eq!(
            receiver.await.unwrap(),
            ClientReply::Reply(Bytes::from("cached"))
        );
        let receiver = tokio::time::timeout(Duration::from_secs(1), f.submit(2, 3))
            .await
            .expect("answered without a permit");
        assert_eq!(
            receiver.await.unwrap(),
            ClientReply::Nack(TOO_OLD.to_string())
        );
        assert!(f.submitted().is_empty());
        assert_eq!(f.manager.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_forwarded_requests_filtered() {
        let mut f = Fixture::new(None);
        f.manager
            .on_request_executed(Reply::new(RequestId::new(1, 5), Bytes::new()))
            .await;
        f.manager
            .on_forwarded(vec![
                Request::new(1, 5, Bytes::new()),
                Request::new(1, 6, Bytes::new()),
                Request::new(2, 1, Bytes::new()),
            ])
            .await
            .unwrap();
        assert_eq!(
            f.submitted(),
            vec![RequestId::new(1, 6), RequestId::new(2, 1)]
        );
    }

    #[tokio::test]
    async fn test_install_replies_answers_covered() {
        let f = Fixture::new(None);
        let covered = f.submit(1, 2).await;
        let _waiting = f.submit(2, 9).await;

        let mut replies = BTreeMap::new();
        replies.insert(1, Reply::new(RequestId::new(1, 2), Bytes::from("snap")));
        replies.insert(2, Reply::new(RequestId::new(2, 4), Bytes::new()));
        f.manager.install_replies(replies).await;

        assert_eq!(
            covered.await.unwrap(),
            ClientReply::Reply(Bytes::from("snap"))
        );
        assert_eq!(f.manager.pending_count().await, 1);
        assert_eq!(
            f.manager.last_reply(2).await.map(|r| r.id.sequence),
            Some(4)
        );
    }
}
