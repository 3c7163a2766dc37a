use std::sync::Arc;

use async_std::sync::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, trace};

use crate::paxos::{
    Decision, Event, InstanceId, PaxosError, PaxosResult, Reply, ReplicaDiagnostics, Snapshot,
    StateMachine, decode_batch,
};
use crate::replica::requests::RequestManager;

// Applies decided instances to the application, strictly in log order, on a
// task of its own so that slow commands don't hold up the protocol.
pub struct Executor {
    state_machine: Box<dyn StateMachine + Send>,
    requests: Arc<RequestManager>,
    events: UnboundedSender<Event>,
    diagnostics: Option<Arc<Mutex<ReplicaDiagnostics>>>,

    // Instances executed between two snapshots, zero to never snapshot.
    snapshot_interval: u64,
    next_instance: InstanceId,
}

impl Executor {
    pub fn new(
        state_machine: Box<dyn StateMachine + Send>,
        requests: Arc<RequestManager>,
        events: UnboundedSender<Event>,
        diagnostics: Option<Arc<Mutex<ReplicaDiagnostics>>>,
        snapshot_interval: u64,
    ) -> Self {
        Executor {
            state_machine,
            requests,
            events,
            diagnostics,
            snapshot_interval,
            next_instance: 0,
        }
    }

    // Executes decisions until the protocol loop goes away.
    pub async fn run(mut self, mut decisions: UnboundedReceiver<Decision>) -> PaxosResult<()> {
        while let Some(decision) = decisions.recv().await {
            match decision {
                Decision::Instance { id, value } => self.execute_instance(id, &value).await?,
                Decision::Snapshot(snapshot) => self.load_snapshot(snapshot).await?,
            }
        }
        debug!(next_instance = self.next_instance, "executor done");
        Ok(())
    }

    pub fn next_instance(&self) -> InstanceId {
        self.next_instance
    }

    async fn execute_instance(&mut self, id: InstanceId, value: &bytes::Bytes) -> PaxosResult<()> {
        if id < self.next_instance {
            trace!(id, "instance covered by a snapshot");
            return Ok(());
        }
        if id > self.next_instance {
            return Err(PaxosError::Invariant(format!(
                "Instance {} handed to the executor before {}",
                id, self.next_instance
            )));
        }

        for request in decode_batch(value)? {
            if !self.requests.is_new(&request.id).await {
                // Decided twice, e.g., forwarded again while the first copy
                // was in flight.
                trace!(id = %request.id, "skipping executed request");
                self.requests.resend_cached(&request.id).await;
                continue;
            }
            let result = self.state_machine.execute(&request.value);
            if let Some(d) = &self.diagnostics {
                d.lock().await.report_executed(request.id);
            }
            self.requests
                .on_request_executed(Reply::new(request.id, result))
                .await;
        }
        self.next_instance = id + 1;

        if self.snapshot_interval > 0 && self.next_instance % self.snapshot_interval == 0 {
            self.make_snapshot().await?;
        }
        Ok(())
    }

    async fn make_snapshot(&mut self) -> PaxosResult<()> {
        let snapshot = Snapshot {
            next_instance_id: self.next_instance,
            state: self.state_machine.create_snapshot(),
            last_replies: self.requests.replies_snapshot().await,
        };
        debug!(
            next = snapshot.next_instance_id,
            bytes = snapshot.size_bytes(),
            "snapshot taken"
        );
        self.events
            .send(Event::SnapshotMade(snapshot))
            .map_err(|_| PaxosError::ChannelClosed("events"))
    }

    async fn load_snapshot(&mut self, snapshot: Snapshot) -> PaxosResult<()> {
        if snapshot.next_instance_id <= self.next_instance {
            return Ok(());
        }
        info!(
            next = snapshot.next_instance_id,
            executed = self.next_instance,
            "loading snapshot"
        );
        self.state_machine
            .load_snapshot(&snapshot.state)
            .map_err(PaxosError::Snapshot)?;
        self.requests.install_replies(snapshot.last_replies).await;
        self.next_instance = snapshot.next_instance_id;
        if let Some(d) = &self.diagnostics {
            d.lock().await.report_snapshot_installed();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::testing::FakeStateMachine;
    use crate::paxos::{Request, RequestId};
    use crate::replica::requests::ClientReply;
    use bytes::Bytes;
    use std::collections::BTreeMap;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::sync::oneshot;

    struct Fixture {
        executor: Executor,
        requests: Arc<RequestManager>,
        events: UnboundedReceiver<Event>,
    }

    impl Fixture {
        fn new(snapshot_interval: u64) -> Self {
            let (sender, events) = unbounded_channel();
            let requests = Arc::new(RequestManager::new(None, sender.clone()));
            Fixture {
                executor: Executor::new(
                    Box::new(FakeStateMachine::new()),
                    requests.clone(),
                    sender,
                    None,
                    snapshot_interval,
                ),
                requests,
                events,
            }
        }
    }

    fn batch(requests: &[(u64, u64, &'static str)]) -> Bytes {
        let requests: Vec<Request> = requests
            .iter()
            .map(|(c, s, v)| Request::new(*c, *s, Bytes::from(*v)))
            .collect();
        crate::paxos::encode_batch(&requests)
    }

    #[tokio::test]
    async fn test_executes_in_order_and_replies() {
        let mut f = Fixture::new(0);
        let (sender, receiver) = oneshot::channel();
        f.requests
            .on_client_request(Request::new(1, 1, Bytes::from("a")), Box::new(sender))
            .await
            .unwrap();

        f.executor
            .execute_instance(0, &batch(&[(1, 1, "a"), (2, 1, "b")]))
            .await
            .unwrap();
        assert_eq!(
            receiver.await.unwrap(),
            ClientReply::Reply(Bytes::from("1:a"))
        );
        assert_eq!(
            f.requests.last_reply(2).await.unwrap().value,
            Bytes::from("2:b")
        );
        assert_eq!(f.executor.next_instance(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_not_executed_twice() {
        let mut f = Fixture::new(0);
        f.executor
            .execute_instance(0, &batch(&[(1, 1, "a")]))
            .await
            .unwrap();
        f.executor
            .execute_instance(1, &batch(&[(1, 1, "a"), (1, 2, "b")]))
            .await
            .unwrap();

        // The counter in the reply shows "a" ran once.
        assert_eq!(
            f.requests.last_reply(1).await.unwrap(),
            Reply::new(RequestId::new(1, 2), Bytes::from("2:b"))
        );
    }

    #[tokio::test]
    async fn test_gap_is_an_error() {
        let mut f = Fixture::new(0);
        let result = f.executor.execute_instance(3, &batch(&[])).await;
        assert!(matches!(result, Err(PaxosError::Invariant(_))));
    }

    #[tokio::test]
    async fn test_snapshot_every_interval() {
        let mut f = Fixture::new(2);
        f.executor
            .execute_instance(0, &batch(&[(1, 1, "a")]))
            .await
            .unwrap();
        assert!(f.events.try_recv().is_err());
        f.executor.execute_instance(1, &batch(&[])).await.unwrap();

        match f.events.try_recv() {
            Ok(Event::SnapshotMade(snapshot)) => {
                assert_eq!(snapshot.next_instance_id, 2);
                assert_eq!(snapshot.state, Bytes::copy_from_slice(&1u64.to_be_bytes()));
                assert_eq!(snapshot.last_replies.len(), 1);
            }
            other => panic!("expected a snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_load_snapshot_skips_covered_instances() {
        let mut f = Fixture::new(0);
        let mut last_replies = BTreeMap::new();
        last_replies.insert(4, Reply::new(RequestId::new(4, 2), Bytes::from("old")));
        let snapshot = Snapshot {
            next_instance_id: 5,
            state: Bytes::copy_from_slice(&9u64.to_be_bytes()),
            last_replies,
        };
        f.executor.load_snapshot(snapshot).await.unwrap();
        assert_eq!(f.executor.next_instance(), 5);

        f.executor
            .execute_instance(4, &batch(&[(4, 3, "x")]))
            .await
            .unwrap();
        assert_eq!(f.requests.last_reply(4).await.unwrap().id.sequence, 2);

        f.executor
            .execute_instance(5, &batch(&[(4, 3, "x")]))
            .await
            .unwrap();
        assert_eq!(
            f.requests.last_reply(4).await.unwrap().value,
            Bytes::from("10:x")
        );
    }

    #[tokio::test]
    async fn test_bad_snapshot_rejected() {
        let mut f = Fixture::new(0);
        let snapshot = Snapshot {
            next_instance_id: 1,
            state: Bytes::from("nope"),
            last_replies: BTreeMap::new(),
        };
        assert!(matches!(
            f.executor.load_snapshot(snapshot).await,
            Err(PaxosError::Snapshot(_))
        ));
    }
}
