use std::sync::Arc;

use async_std::channel::Receiver;
use bytes::Bytes;
use tokio::select;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, trace, warn};

use crate::paxos::acceptor::{self, ProposeOutcome};
use crate::paxos::batcher::Batcher;
use crate::paxos::catchup::CatchUp;
use crate::paxos::cluster::Cluster;
use crate::paxos::diagnostics::ReplicaDiagnostics;
use crate::paxos::error::{PaxosError, PaxosResult};
use crate::paxos::learner::{self, AcceptOutcome};
use crate::paxos::log::Log;
use crate::paxos::message::{DecidedRecord, InstanceRecord, Message, Payload};
use crate::paxos::network::{Inbound, Network};
use crate::paxos::options::Options;
use crate::paxos::proposer::{Proposer, ProposerState};
use crate::paxos::recovery::{self, RecoveryStrategy, RecoveryTracker};
use crate::paxos::request::Request;
use crate::paxos::snapshot::Snapshot;
use crate::paxos::storage::{self, Storage};
use crate::paxos::view::{DetectorAction, FailureDetector};
use crate::paxos::{InstanceId, ReplicaId, View};

// Things happening locally which the protocol loop has to react to.
#[derive(Debug)]
pub enum Event {
    // New client requests which passed duplicate detection.
    ClientRequests(Vec<Request>),

    // The state machine has executed everything below the snapshot's
    // next_instance_id. The log below that point can go.
    SnapshotMade(Snapshot),
}

// What the protocol loop hands to the executor, strictly in log order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Instance { id: InstanceId, value: Bytes },

    // Replaces the state machine's state. Instances up to the snapshot's
    // next_instance_id are skipped.
    Snapshot(Snapshot),
}

// Everything the protocol loop listens to.
pub struct Inbox {
    // Heartbeats, handled before anything else so that a busy replica does
    // not suspect a healthy leader.
    pub priority: UnboundedReceiver<Inbound>,
    pub protocol: UnboundedReceiver<Inbound>,
    pub events: UnboundedReceiver<Event>,
    pub shutdown: Receiver<()>,
}

enum Phase {
    // Waiting for peers to tell us the view and how far the log goes. Once the
    // target is known, we catch up to it.
    Recovering {
        tracker: RecoveryTracker,
        target: Option<InstanceId>,
    },
    Active,
}

// The protocol core of one replica. Owns the log, the view and all protocol
// roles. Runs as a single task, so none of the state needs locking.
pub struct Paxos {
    cluster: Cluster,
    options: Options,
    view: View,
    epochs: Vec<u64>,
    first_run: bool,
    needs_peers: bool,
    phase: Phase,

    log: Log,
    snapshot: Option<Snapshot>,
    next_to_deliver: InstanceId,

    proposer: Proposer,
    batcher: Batcher,
    catch_up: CatchUp,
    detector: FailureDetector,

    storage: Box<dyn Storage>,
    strategy: Box<dyn RecoveryStrategy>,
    network: Arc<dyn Network>,
    decisions: UnboundedSender<Decision>,
    diagnostics: Option<Arc<async_std::sync::Mutex<ReplicaDiagnostics>>>,

    periodic_at: Instant,
    periodic_first_uncommitted: InstanceId,
}

impl Paxos {
    // Loads whatever the configured crash model keeps on disk. Does not talk
    // to anybody yet.
    pub async fn new(
        cluster: Cluster,
        options: Options,
        network: Arc<dyn Network>,
        decisions: UnboundedSender<Decision>,
        diagnostics: Option<Arc<async_std::sync::Mutex<ReplicaDiagnostics>>>,
    ) -> PaxosResult<Self> {
        let mut storage = storage::new(&options.persistence).await?;
        let strategy = recovery::strategy(options.crash_model);
        let initial = strategy.initialize(storage.as_mut()).await?;
        let needs_peers = strategy.needs_peers(&initial);

        let mut epochs = vec![0; cluster.size()];
        epochs[cluster.me()] = initial.epoch;

        let now = Instant::now();
        Ok(Paxos {
            cluster,
            view: initial.view,
            epochs,
            first_run: initial.first_run,
            needs_peers,
            phase: Phase::Active,
            next_to_deliver: initial.log.lowest_available(),
            log: initial.log,
            snapshot: initial.snapshot,
            proposer: Proposer::new(cluster, options.retransmit_timeout),
            batcher: Batcher::new(options.batch_size_bytes),
            catch_up: CatchUp::new(
                cluster,
                options.catch_up_timeout,
                options.max_catch_up_backoff,
            ),
            detector: FailureDetector::new(
                cluster,
                options.alive_interval,
                options.suspect_timeout,
            ),
            storage,
            strategy,
            network,
            decisions,
            diagnostics,
            periodic_at: now + options.periodic_catch_up,
            periodic_first_uncommitted: 0,
            options,
        })
    }

    // Runs the protocol until shutdown is requested. Returns an error if the
    // replica hit a condition it cannot safely continue from.
    pub async fn run(mut self, mut inbox: Inbox) -> PaxosResult<()> {
        self.start(Instant::now()).await?;
        loop {
            let deadline = self.next_deadline();
            select! {
                biased;
                _ = inbox.shutdown.recv() => {
                    info!(view = self.view, "shutting down");
                    return Ok(());
                }
                Some(inbound) = inbox.priority.recv() => self.on_inbound(inbound).await?,
                Some(inbound) = inbox.protocol.recv() => self.on_inbound(inbound).await?,
                Some(event) = inbox.events.recv() => self.on_event(event).await?,
                _ = sleep_until(deadline) => self.on_tick(Instant::now()).await?,
            }
            self.after_event(Instant::now()).await?;
        }
    }

    async fn start(&mut self, now: Instant) -> PaxosResult<()> {
        if let Some(snapshot) = self.snapshot.clone() {
            self.next_to_deliver = snapshot.next_instance_id;
            self.deliver(Decision::Snapshot(snapshot))?;
        }
        self.report_view().await;

        if self.needs_peers {
            info!(
                view = self.view,
                epoch = self.epochs[self.cluster.me()],
                "recovering state from peers"
            );
            self.detector.pause();
            self.phase = Phase::Recovering {
                tracker: RecoveryTracker::new(
                    self.cluster,
                    self.view,
                    self.epochs[self.cluster.me()],
                    self.strategy.uses_epochs(),
                    self.options.retransmit_timeout,
                    now,
                ),
                target: None,
            };
            return Ok(());
        }
        self.activate(now).await
    }

    // Starts taking part in the protocol.
    async fn activate(&mut self, now: Instant) -> PaxosResult<()> {
        self.phase = Phase::Active;
        if self.strategy.persists_view() {
            self.storage.write_view(self.view).await?;
        }
        self.detector.on_view(self.view, now);
        info!(
            view = self.view,
            first_uncommitted = self.log.first_uncommitted(),
            "active"
        );

        if self.cluster.is_leader(self.view) {
            if self.first_run && self.view == 0 {
                self.start_proposer(now).await?;
            } else {
                // We may have led this view before and forgotten what we did.
                self.promote(now).await?;
            }
        } else if !self.batcher.is_empty() {
            let queued = self.batcher.drain();
            self.forward(queued);
        }
        Ok(())
    }

    fn next_deadline(&self) -> Instant {
        let mut deadline = self.periodic_at;
        let mut consider = |candidate: Option<Instant>| {
            if let Some(candidate) = candidate {
                deadline = deadline.min(candidate);
            }
        };
        consider(self.detector.deadline());
        consider(self.proposer.deadline());
        consider(self.catch_up.deadline());
        if let Phase::Recovering { tracker, .. } = &self.phase {
            consider(Some(tracker.deadline()));
        }
        deadline
    }

    async fn on_inbound(&mut self, inbound: Inbound) -> PaxosResult<()> {
        let Inbound { from, message } = inbound;
        let message = message?;
        if from == self.cluster.me() {
            return Ok(());
        }
        trace!(from, kind = ?message.kind(), view = message.view, "received");
        let now = Instant::now();
        if matches!(self.phase, Phase::Recovering { .. }) {
            self.on_recovering_message(from, message, now).await
        } else {
            self.on_message(from, message, now).await
        }
    }

    async fn on_recovering_message(
        &mut self,
        from: ReplicaId,
        message: Message,
        now: Instant,
    ) -> PaxosResult<()> {
        let Message { view, payload } = message;
        match payload {
            Payload::RecoveryAnswer {
                epochs,
                next_instance,
            } => {
                self.merge_epochs(&epochs);
                let (target, answered_view) = match &mut self.phase {
                    Phase::Recovering { tracker, target } => {
                        if let Some(t) = tracker.on_answer(from, view, &epochs, next_instance) {
                            if target.is_none() {
                                info!(target = t, view = tracker.view(), "recovery target known");
                                *target = Some(t);
                            }
                        }
                        (*target, tracker.view())
                    }
                    Phase::Active => return Ok(()),
                };
                if answered_view > self.view && !self.cluster.is_leader(answered_view) {
                    self.view = answered_view;
                    self.report_view().await;
                }
                if let Some(target) = target {
                    self.log.extend_to(target);
                    if self.log.first_uncommitted() < target {
                        self.catch_up.force(now);
                    }
                }
            }
            Payload::CatchUpResponse {
                last_part,
                instances,
                ..
            } => self.on_catch_up_response(last_part, instances, now).await?,
            Payload::CatchUpSnapshot { snapshot, .. } => {
                self.catch_up.on_response(now);
                self.install_snapshot(snapshot).await?;
            }
            other => trace!(from, payload = ?other, "ignoring message while recovering"),
        }
        Ok(())
    }

    async fn on_message(&mut self, from: ReplicaId, message: Message, now: Instant) -> PaxosResult<()> {
        let Message { view, payload } = message;
        match payload {
            Payload::Phase1Request { from_instance } => {
                if self.enter_view(view, now).await? {
                    self.on_phase1_request(from, from_instance, now).await?;
                }
            }
            Payload::Phase1Response {
                lowest_available,
                epochs,
                instances,
            } => {
                if self.enter_view(view, now).await? {
                    self.on_phase1_response(from, lowest_available, epochs, instances, now)
                        .await?;
                }
            }
            Payload::Propose { instance, value } => {
                if self.enter_view(view, now).await? {
                    self.on_propose(from, instance, value, now).await?;
                }
            }
            Payload::Accept { instance, value } => {
                if self.enter_view(view, now).await? {
                    self.on_accept(from, instance, value, now).await?;
                }
            }
            Payload::Alive { log_next_id } => {
                if self.enter_view(view, now).await? {
                    self.on_alive(from, log_next_id, now);
                }
            }
            Payload::CatchUpQuery {
                from_instance,
                request_time,
            } => self.on_catch_up_query(from, from_instance, request_time),
            Payload::CatchUpResponse {
                last_part,
                instances,
                ..
            } => self.on_catch_up_response(last_part, instances, now).await?,
            Payload::CatchUpSnapshot { snapshot, .. } => {
                self.catch_up.on_response(now);
                self.install_snapshot(snapshot).await?;
            }
            Payload::Recovery { epoch } => self.on_recovery(from, view, epoch, now).await?,
            Payload::RecoveryAnswer { .. } => trace!(from, "late recovery answer"),
            Payload::ForwardedClientRequests { .. } => {
                warn!(from, "forwarded requests reached the protocol loop")
            }
        }
        Ok(())
    }

    // Applies the view rules to an incoming message. Returns whether the
    // message should be processed, i.e., whether it belongs to our view now.
    async fn enter_view(&mut self, view: View, now: Instant) -> PaxosResult<bool> {
        if view < self.view {
            trace!(view, current = self.view, "dropping stale message");
            return Ok(false);
        }
        if view == self.view {
            return Ok(true);
        }
        if self.cluster.is_leader(view) {
            // Only an earlier incarnation of ours can have used this view. We
            // must not act in it, so we move past it on our own.
            warn!(view, "message for a view led by this replica");
            let next = self.cluster.next_view_led_by_me(view);
            self.advance_view(next, now).await?;
            self.start_proposer(now).await?;
            return Ok(false);
        }
        self.advance_view(view, now).await?;
        Ok(true)
    }

    async fn advance_view(&mut self, view: View, now: Instant) -> PaxosResult<()> {
        if view <= self.view {
            return Err(PaxosError::Invariant(format!(
                "view would move from {} to {}",
                self.view, view
            )));
        }
        if self.proposer.is_active() {
            info!(view = self.proposer.view(), "stepping down");
            self.proposer.stop();
        }
        self.view = view;
        if self.strategy.persists_view() {
            self.storage.write_view(view).await?;
        }
        self.report_view().await;
        self.detector.on_view(view, now);
        info!(view, leader = self.cluster.leader_of(view), "entered view");

        if !self.cluster.is_leader(view) && !self.batcher.is_empty() {
            let queued = self.batcher.drain();
            self.forward(queued);
        }
        Ok(())
    }

    // Moves to the next view we lead and starts phase 1 in it.
    async fn promote(&mut self, now: Instant) -> PaxosResult<()> {
        let view = self.cluster.next_view_led_by_me(self.view);
        self.advance_view(view, now).await?;
        self.start_proposer(now).await
    }

    async fn start_proposer(&mut self, now: Instant) -> PaxosResult<()> {
        let from = self.log.first_uncommitted();
        info!(view = self.view, from, "starting phase 1");
        self.proposer.start(self.view, from, now)?;
        if let Some(d) = &self.diagnostics {
            d.lock().await.report_leader(self.view, self.cluster.me());
        }
        self.network.send_to_others(&Message::new(
            self.view,
            Payload::Phase1Request {
                from_instance: from,
            },
        ));

        // We answer our own phase 1 like everybody else.
        let own = acceptor::on_prepare(&self.log, from);
        let lowest = self.log.lowest_available();
        let epochs = self.epoch_vector();
        self.on_phase1_response(self.cluster.me(), lowest, epochs, own, now)
            .await
    }

    async fn on_phase1_request(
        &mut self,
        from: ReplicaId,
        from_instance: InstanceId,
        now: Instant,
    ) -> PaxosResult<()> {
        if from != self.cluster.leader_of(self.view) {
            warn!(from, view = self.view, "phase 1 from a replica not leading the view");
            return Ok(());
        }
        self.detector.on_leader_heard(now);
        let instances = acceptor::on_prepare(&self.log, from_instance);
        debug!(from, from_instance, records = instances.len(), "promising");
        self.network.send_to(
            &Message::new(
                self.view,
                Payload::Phase1Response {
                    lowest_available: self.log.lowest_available(),
                    epochs: self.epoch_vector(),
                    instances,
                },
            ),
            from,
        );
        Ok(())
    }

    async fn on_phase1_response(
        &mut self,
        from: ReplicaId,
        lowest_available: InstanceId,
        epochs: Vec<u64>,
        instances: Vec<InstanceRecord>,
        now: Instant,
    ) -> PaxosResult<()> {
        if self.strategy.uses_epochs() {
            if epochs.get(from).copied().unwrap_or(0) < self.epochs[from] {
                debug!(from, "phase 1 response from an earlier incarnation");
                return Ok(());
            }
            self.merge_epochs(&epochs);
        }
        let merge = self
            .proposer
            .on_phase1_response(from, self.view, lowest_available, instances);
        for record in merge.decided {
            self.learn_decision(record, now).await?;
        }
        if merge.prepared {
            self.on_prepared(now);
        }
        Ok(())
    }

    fn on_prepared(&mut self, now: Instant) {
        info!(
            view = self.view,
            first_uncommitted = self.log.first_uncommitted(),
            "prepared"
        );
        self.proposer.plan_reproposals(&self.log);
        if self.proposer.highest_truncation() > self.log.first_uncommitted() {
            // Some acceptor already compacted what we are missing.
            self.catch_up.force(now);
        }
    }

    // Proposes as much as the window allows: first anything phase 1 told us
    // to finish, then new batches.
    async fn propose_next(&mut self, now: Instant) -> PaxosResult<()> {
        if self.proposer.state() != ProposerState::Prepared {
            return Ok(());
        }
        // Instances below a peer's truncation point are decided, but nobody
        // reported them. Catch-up has to bring them in first.
        if self.log.first_uncommitted() < self.proposer.highest_truncation() {
            return Ok(());
        }
        self.proposer.fill_gaps(&self.log);
        let window = self.options.window_size;
        while let Some((id, value)) = self.proposer.next_reproposal(&self.log) {
            if !self.log.is_in_window(id, window) {
                return Ok(());
            }
            self.propose(id, value, now).await?;
        }
        loop {
            let id = self.log.next_id();
            if !self.log.is_in_window(id, window) {
                return Ok(());
            }
            match self.batcher.next_batch() {
                Some(batch) => self.propose(id, batch, now).await?,
                None => return Ok(()),
            }
        }
    }

    async fn propose(&mut self, id: InstanceId, value: Bytes, now: Instant) -> PaxosResult<()> {
        let changed = self.log.instance_mut(id)?.set_value(self.view, value.clone())?;
        if changed {
            self.persist_instance(id).await?;
        }
        self.proposer.on_proposed(id, now);
        trace!(id, view = self.view, bytes = value.len(), "proposing");
        self.network.send_to_others(&Message::new(
            self.view,
            Payload::Propose {
                instance: id,
                value,
            },
        ));
        if learner::record_accepts(&mut self.log, &self.cluster, id, &[self.cluster.me()])? {
            self.on_decided(id, now).await?;
        }
        Ok(())
    }

    async fn on_propose(
        &mut self,
        from: ReplicaId,
        id: InstanceId,
        value: Bytes,
        now: Instant,
    ) -> PaxosResult<()> {
        if from != self.cluster.leader_of(self.view) {
            warn!(from, view = self.view, "proposal from a replica not leading the view");
            return Ok(());
        }
        self.detector.on_leader_heard(now);
        let window = self.options.window_size;
        match acceptor::on_propose(&mut self.log, window, self.view, id, value.clone())? {
            ProposeOutcome::Accepted { changed } => {
                if changed {
                    self.persist_instance(id).await?;
                }
                self.network.send_to_others(&Message::new(
                    self.view,
                    Payload::Accept {
                        instance: id,
                        value,
                    },
                ));
                let voters = [from, self.cluster.me()];
                if learner::record_accepts(&mut self.log, &self.cluster, id, &voters)? {
                    self.on_decided(id, now).await?;
                }
            }
            ProposeOutcome::OutsideWindow => {
                debug!(id, first_uncommitted = self.log.first_uncommitted(), "proposal past window");
                self.log.extend_to(id + 1);
                self.catch_up.force(now);
            }
            ProposeOutcome::Stale | ProposeOutcome::AlreadyDecided => {}
        }
        Ok(())
    }

    async fn on_accept(
        &mut self,
        from: ReplicaId,
        id: InstanceId,
        value: Bytes,
        now: Instant,
    ) -> PaxosResult<()> {
        let window = self.options.window_size;
        let outcome = learner::on_accept(
            &mut self.log,
            &self.cluster,
            window,
            self.view,
            id,
            value,
            from,
        )?;
        match outcome {
            AcceptOutcome::Recorded { changed } => {
                if changed {
                    self.persist_instance(id).await?;
                }
            }
            AcceptOutcome::Decided => self.on_decided(id, now).await?,
            AcceptOutcome::OutsideWindow => {
                self.log.extend_to(id + 1);
                self.catch_up.force(now);
            }
            AcceptOutcome::Ignored => {}
        }
        Ok(())
    }

    fn on_alive(&mut self, from: ReplicaId, log_next_id: InstanceId, now: Instant) {
        if from != self.cluster.leader_of(self.view) {
            return;
        }
        self.detector.on_leader_heard(now);
        let window = self.options.window_size as u64;
        if log_next_id > self.log.first_uncommitted() + window {
            self.log.extend_to(log_next_id);
            if !self.catch_up.is_active() {
                debug!(log_next_id, "leader is ahead, catching up");
            }
            self.catch_up.force(now);
        }
    }

    // Bookkeeping for an instance which just became decided.
    async fn on_decided(&mut self, id: InstanceId, _now: Instant) -> PaxosResult<()> {
        self.persist_instance(id).await?;
        if let Some(d) = &self.diagnostics {
            if let Some(value) = self.log.get(id).and_then(|i| i.value()) {
                d.lock().await.report_decided(id, value);
            }
        }
        self.proposer.on_decided(id);
        self.log.update_first_uncommitted();
        trace!(id, first_uncommitted = self.log.first_uncommitted(), "decided");
        Ok(())
    }

    // Installs a decision learned from a peer.
    async fn learn_decision(&mut self, record: DecidedRecord, now: Instant) -> PaxosResult<()> {
        if self.log.is_compacted(record.id) {
            return Ok(());
        }
        let changed = self
            .log
            .instance_mut(record.id)?
            .update_from_decision(record.view, record.value)?;
        if changed {
            self.on_decided(record.id, now).await?;
        }
        Ok(())
    }

    fn on_catch_up_query(&mut self, from: ReplicaId, from_instance: InstanceId, request_time: i64) {
        if let Some(snapshot) = &self.snapshot {
            if from_instance < self.log.lowest_available() {
                debug!(from, from_instance, "answering catch-up with snapshot");
                self.network.send_to(
                    &Message::new(
                        self.view,
                        Payload::CatchUpSnapshot {
                            request_time,
                            snapshot: snapshot.clone(),
                        },
                    ),
                    from,
                );
            }
        }

        let parts = self
            .log
            .decided_from(from_instance, self.options.catch_up_part_bytes);
        if parts.is_empty() {
            self.network.send_to(
                &Message::new(
                    self.view,
                    Payload::CatchUpResponse {
                        request_time,
                        last_part: true,
                        instances: Vec::new(),
                    },
                ),
                from,
            );
            return;
        }
        let count = parts.len();
        for (index, instances) in parts.into_iter().enumerate() {
            self.network.send_to(
                &Message::new(
                    self.view,
                    Payload::CatchUpResponse {
                        request_time,
                        last_part: index + 1 == count,
                        instances,
                    },
                ),
                from,
            );
        }
    }

    async fn on_catch_up_response(
        &mut self,
        last_part: bool,
        instances: Vec<DecidedRecord>,
        now: Instant,
    ) -> PaxosResult<()> {
        self.catch_up.on_response(now);
        let progress = !instances.is_empty();
        for record in instances {
            self.learn_decision(record, now).await?;
        }
        if !last_part {
            return Ok(());
        }
        if !self.is_behind() {
            if self.catch_up.is_active() {
                debug!(first_uncommitted = self.log.first_uncommitted(), "caught up");
            }
            self.catch_up.finish();
        } else if progress {
            self.catch_up.query_again(now);
        }
        Ok(())
    }

    // Returns whether we know of decided instances we don't have yet.
    fn is_behind(&self) -> bool {
        let first_uncommitted = self.log.first_uncommitted();
        if let Phase::Recovering {
            target: Some(target),
            ..
        } = &self.phase
        {
            if first_uncommitted < *target {
                return true;
            }
        }
        if self.proposer.highest_truncation() > first_uncommitted {
            return true;
        }
        self.log.next_id() > first_uncommitted + self.options.window_size as u64
    }

    async fn install_snapshot(&mut self, snapshot: Snapshot) -> PaxosResult<()> {
        let next = snapshot.next_instance_id;
        if next <= self.log.first_uncommitted() {
            trace!(next, "ignoring snapshot we don't need");
            return Ok(());
        }
        info!(next, bytes = snapshot.size_bytes(), "installing snapshot from peer");
        if self.strategy.persists_instances() {
            self.storage.write_snapshot(&snapshot).await?;
        }
        self.log.truncate_below(next);
        self.proposer.forget_below(next);
        if next > self.next_to_deliver {
            self.next_to_deliver = next;
            self.deliver(Decision::Snapshot(snapshot.clone()))?;
        }
        self.snapshot = Some(snapshot);
        Ok(())
    }

    async fn on_recovery(
        &mut self,
        from: ReplicaId,
        view: View,
        epoch: u64,
        now: Instant,
    ) -> PaxosResult<()> {
        if self.strategy.uses_epochs() {
            self.epochs[from] = self.epochs[from].max(epoch);
        }
        if view > self.view {
            self.enter_view(view, now).await?;
        }
        if self.cluster.leader_of(self.view) == from {
            // Our leader restarted. Answering would let it rejoin as leader
            // of a view it forgot about, so we wait for a new view instead.
            debug!(from, view = self.view, "not answering recovery of our leader");
            return Ok(());
        }
        debug!(from, epoch, "answering recovery");
        self.network.send_to(
            &Message::new(
                self.view,
                Payload::RecoveryAnswer {
                    epochs: self.epoch_vector(),
                    next_instance: self.log.next_id(),
                },
            ),
            from,
        );
        Ok(())
    }

    async fn on_event(&mut self, event: Event) -> PaxosResult<()> {
        match event {
            Event::ClientRequests(requests) => {
                let active = matches!(self.phase, Phase::Active);
                if !active || self.cluster.is_leader(self.view) {
                    for request in requests {
                        self.batcher.enqueue(request);
                    }
                    trace!(queued = self.batcher.len(), "queued client requests");
                } else {
                    self.forward(requests);
                }
            }
            Event::SnapshotMade(snapshot) => {
                let next = snapshot.next_instance_id;
                if next <= self.log.lowest_available() {
                    return Ok(());
                }
                debug!(next, bytes = snapshot.size_bytes(), "truncating log");
                if self.strategy.persists_instances() {
                    self.storage.write_snapshot(&snapshot).await?;
                }
                self.log.truncate_below(next);
                self.proposer.forget_below(next);
                self.snapshot = Some(snapshot);
            }
        }
        Ok(())
    }

    async fn on_tick(&mut self, now: Instant) -> PaxosResult<()> {
        let mut query_recovery = Vec::new();
        if let Phase::Recovering { tracker, .. } = &mut self.phase {
            query_recovery = tracker.poll(now);
        } else {
            match self.detector.on_tick(now) {
                DetectorAction::SendAlive => {
                    if self.cluster.is_leader(self.view) {
                        self.network.send_to_others(&Message::new(
                            self.view,
                            Payload::Alive {
                                log_next_id: self.log.next_id(),
                            },
                        ));
                    }
                }
                DetectorAction::SuspectLeader => {
                    info!(
                        view = self.view,
                        leader = self.cluster.leader_of(self.view),
                        "suspecting leader"
                    );
                    self.promote(now).await?;
                }
                DetectorAction::Nothing => {}
            }
        }

        if !query_recovery.is_empty() {
            let message = Message::new(
                self.view,
                Payload::Recovery {
                    epoch: self.epochs[self.cluster.me()],
                },
            );
            self.network.send_to_many(&message, &query_recovery);
        }

        if self.proposer.is_active() {
            self.retransmit(now);
        }

        if let Some(target) = self.catch_up.poll(now, self.cluster.leader_of(self.view)) {
            let from_instance = self.log.first_uncommitted();
            debug!(target, from_instance, "sending catch-up query");
            self.network.send_to(
                &Message::new(
                    self.view,
                    Payload::CatchUpQuery {
                        from_instance,
                        request_time: chrono::Utc::now().timestamp_millis(),
                    },
                ),
                target,
            );
        }

        if now >= self.periodic_at {
            self.periodic_at = now + self.options.periodic_catch_up;
            let first_uncommitted = self.log.first_uncommitted();
            if matches!(self.phase, Phase::Active)
                && first_uncommitted == self.periodic_first_uncommitted
                && self.log.has_decided_after_hole()
            {
                debug!(first_uncommitted, "log has a hole, catching up");
                self.catch_up.force(now);
            }
            self.periodic_first_uncommitted = first_uncommitted;
        }
        Ok(())
    }

    fn retransmit(&mut self, now: Instant) {
        if self.proposer.phase1_due(now) {
            let missing = self.proposer.missing_promises();
            debug!(view = self.view, ?missing, "resending phase 1");
            self.network.send_to_many(
                &Message::new(
                    self.view,
                    Payload::Phase1Request {
                        from_instance: self.proposer.prepare_from(),
                    },
                ),
                &missing,
            );
        }
        for id in self.proposer.due_proposals(now) {
            let instance = match self.log.get(id) {
                Some(instance) if !instance.is_decided() => instance,
                _ => continue,
            };
            let value = match instance.value() {
                Some(value) => value.clone(),
                None => continue,
            };
            let missing: Vec<ReplicaId> = self
                .cluster
                .others()
                .filter(|r| !instance.accepts().contains(r))
                .collect();
            trace!(id, ?missing, "resending proposal");
            self.network.send_to_many(
                &Message::new(
                    self.view,
                    Payload::Propose {
                        instance: id,
                        value,
                    },
                ),
                &missing,
            );
        }
    }

    // Runs after every event: hands decisions to the executor, finishes
    // recovery once caught up, and keeps the pipeline full.
    async fn after_event(&mut self, now: Instant) -> PaxosResult<()> {
        self.deliver_decided()?;
        let recovered_to = match &self.phase {
            Phase::Recovering {
                target: Some(target),
                ..
            } if self.log.first_uncommitted() >= *target => Some(*target),
            _ => None,
        };
        if let Some(target) = recovered_to {
            info!(target, "recovery complete");
            self.catch_up.finish();
            self.activate(now).await?;
        }
        self.propose_next(now).await
    }

    fn deliver_decided(&mut self) -> PaxosResult<()> {
        while self.next_to_deliver < self.log.first_uncommitted() {
            let id = self.next_to_deliver;
            if self.log.is_compacted(id) {
                self.next_to_deliver = self.log.lowest_available();
                continue;
            }
            let value = self
                .log
                .get(id)
                .and_then(|instance| instance.value().cloned())
                .ok_or_else(|| {
                    PaxosError::Invariant(format!("decided instance {} has no value", id))
                })?;
            self.deliver(Decision::Instance { id, value })?;
            self.next_to_deliver += 1;
        }
        Ok(())
    }

    fn deliver(&self, decision: Decision) -> PaxosResult<()> {
        self.decisions
            .send(decision)
            .map_err(|_| PaxosError::ChannelClosed("decisions"))
    }

    // Sends requests to the leader of the current view, in bundles.
    fn forward(&self, requests: Vec<Request>) {
        let leader = self.cluster.leader_of(self.view);
        let mut bundle = Vec::new();
        let mut size = 0;
        for request in requests {
            size += request.encoded_len();
            bundle.push(request);
            if size >= self.options.forward_batch_bytes {
                self.send_bundle(std::mem::take(&mut bundle), leader);
                size = 0;
            }
        }
        if !bundle.is_empty() {
            self.send_bundle(bundle, leader);
        }
    }

    fn send_bundle(&self, requests: Vec<Request>, leader: ReplicaId) {
        trace!(leader, count = requests.len(), "forwarding requests");
        self.network.send_to(
            &Message::new(self.view, Payload::ForwardedClientRequests { requests }),
            leader,
        );
    }

    async fn persist_instance(&mut self, id: InstanceId) -> PaxosResult<()> {
        if !self.strategy.persists_instances() {
            return Ok(());
        }
        if let Some(instance) = self.log.get(id) {
            self.storage
                .append_or_update_instance(
                    id,
                    instance.view(),
                    instance.value(),
                    instance.is_decided(),
                )
                .await?;
        }
        Ok(())
    }

    fn epoch_vector(&self) -> Vec<u64> {
        if self.strategy.uses_epochs() {
            self.epochs.clone()
        } else {
            Vec::new()
        }
    }

    fn merge_epochs(&mut self, epochs: &[u64]) {
        for (mine, theirs) in self.epochs.iter_mut().zip(epochs) {
            *mine = (*mine).max(*theirs);
        }
    }

    async fn report_view(&self) {
        if let Some(d) = &self.diagnostics {
            d.lock()
                .await
                .report_view(self.view, self.cluster.leader_of(self.view));
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::failure_injection::FailureOptions;
    use crate::paxos::message::MessageKind;
    use crate::paxos::network::{LocalNetwork, Router};
    use crate::paxos::request::decode_batch;
    use async_std::channel;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    // A cluster of protocol loops without executors. Each replica's decisions
    // end up in a channel the test reads.
    struct Fixture {
        events: Vec<UnboundedSender<Event>>,
        decisions: Vec<UnboundedReceiver<Decision>>,
        shutdown: channel::Sender<()>,
        tasks: Vec<JoinHandle<PaxosResult<()>>>,
    }

    impl Fixture {
        async fn new(size: usize) -> Self {
            let network = LocalNetwork::new(size, FailureOptions::no_failures());
            let (shutdown, shutdown_receiver) = channel::unbounded::<()>();
            let mut events = Vec::new();
            let mut decisions = Vec::new();
            let mut tasks = Vec::new();
            for id in 0..size {
                let (priority_sender, priority) = unbounded_channel();
                let (protocol_sender, protocol) = unbounded_channel();
                let (events_sender, events_receiver) = unbounded_channel();
                let (decisions_sender, decisions_receiver) = unbounded_channel();

                let (forwarded_sender, mut forwarded) = unbounded_channel::<Inbound>();

                let mut router = Router::new(id);
                router.register(&MessageKind::ALL, protocol_sender);
                router.register(&[MessageKind::Alive], priority_sender);
                router.register(&[MessageKind::ForwardedClientRequests], forwarded_sender);

                // Stands in for the request pipeline, which hands forwarded
                // requests back to the protocol loop.
                let resubmit = events_sender.clone();
                tokio::spawn(async move {
                    while let Some(inbound) = forwarded.recv().await {
                        if let Ok(Message {
                            payload: Payload::ForwardedClientRequests { requests },
                            ..
                        }) = inbound.message
                        {
                            let _ = resubmit.send(Event::ClientRequests(requests));
                        }
                    }
                });

                let paxos = Paxos::new(
                    Cluster::new(id, size),
                    Options::default(),
                    network.endpoint(id),
                    decisions_sender,
                    None,
                )
                .await
                .expect("paxos");
                network.attach(id, router);
                let inbox = Inbox {
                    priority,
                    protocol,
                    events: events_receiver,
                    shutdown: shutdown_receiver.clone(),
                };
                tasks.push(tokio::spawn(paxos.run(inbox)));
                events.push(events_sender);
                decisions.push(decisions_receiver);
            }
            Fixture {
                events,
                decisions,
                shutdown,
                tasks,
            }
        }

        fn submit(&self, replica: ReplicaId, requests: Vec<Request>) {
            self.events[replica]
                .send(Event::ClientRequests(requests))
                .expect("send");
        }

        // Returns the requests decided in the next instance the supplied
        // replica delivers, skipping no-ops.
        async fn next_requests(&mut self, replica: ReplicaId) -> (InstanceId, Vec<Request>) {
            loop {
                let decision = timeout(Duration::from_secs(30), self.decisions[replica].recv())
                    .await
                    .expect("decision in time")
                    .expect("decision");
                if let Decision::Instance { id, value } = decision {
                    let requests = decode_batch(&value).expect("decode");
                    if !requests.is_empty() {
                        return (id, requests);
                    }
                }
            }
        }

        async fn stop(self) {
            self.shutdown.close();
            for task in self.tasks {
                task.await.expect("join").expect("clean shutdown");
            }
        }
    }

    fn request(client: u64, sequence: u64) -> Request {
        Request::new(client, sequence, Bytes::from(format!("op-{}", sequence)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_replica_decides_alone() {
        let mut f = Fixture::new(1).await;
        f.submit(0, vec![request(1, 1)]);

        let (id, requests) = f.next_requests(0).await;
        assert_eq!(id, 0);
        assert_eq!(requests, vec![request(1, 1)]);
        f.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_replica_learns_in_order() {
        let mut f = Fixture::new(3).await;
        f.submit(0, vec![request(1, 1)]);
        let (first, _) = f.next_requests(0).await;
        f.submit(0, vec![request(1, 2), request(2, 1)]);
        let (second, _) = f.next_requests(0).await;
        assert!(second > first);

        for replica in 1..3 {
            let (id, requests) = f.next_requests(replica).await;
            assert_eq!(id, first);
            assert_eq!(requests, vec![request(1, 1)]);
            let (id, requests) = f.next_requests(replica).await;
            assert_eq!(id, second);
            assert_eq!(requests, vec![request(1, 2), request(2, 1)]);
        }
        f.stop().await;
    }

    // Returns the next message of the supplied kind that arrived at a peer
    // whose traffic is captured.
    async fn next_sent(sent: &mut UnboundedReceiver<Inbound>, kind: MessageKind) -> Message {
        loop {
            let inbound = timeout(Duration::from_secs(30), sent.recv())
                .await
                .expect("message in time")
                .expect("message");
            let message = inbound.message.expect("decodable");
            if message.kind() == kind {
                return message;
            }
        }
    }

    // Replica 1 accepted a value from the leader of view 0 which nobody else
    // saw decided. Once it takes over, phase 1 must bring the value back and
    // get it decided unchanged.
    #[tokio::test(start_paused = true)]
    async fn test_new_leader_finishes_accepted_value() {
        let size = 5;
        let network = LocalNetwork::new(size, FailureOptions::no_failures());
        let (shutdown, shutdown_receiver) = channel::unbounded::<()>();

        // Replica 2 stands for the live followers, and we watch what it gets.
        let (captured, mut sent) = unbounded_channel();
        let mut capture = Router::new(2);
        capture.register(&MessageKind::ALL, captured);
        network.attach(2, capture);

        let (priority_sender, priority) = unbounded_channel();
        let (protocol_sender, protocol) = unbounded_channel();
        let (_events, events) = unbounded_channel();
        let (decisions_sender, mut decisions) = unbounded_channel();
        let mut router = Router::new(1);
        router.register(&MessageKind::ALL, protocol_sender);
        router.register(&[MessageKind::Alive], priority_sender);

        let paxos = Paxos::new(
            Cluster::new(1, size),
            Options::default(),
            network.endpoint(1),
            decisions_sender,
            None,
        )
        .await
        .expect("paxos");
        network.attach(1, router);
        let task = tokio::spawn(paxos.run(Inbox {
            priority,
            protocol,
            events,
            shutdown: shutdown_receiver,
        }));

        let value = Bytes::from("X");
        network.endpoint(0).send_to(
            &Message::new(
                0,
                Payload::Propose {
                    instance: 0,
                    value: value.clone(),
                },
            ),
            1,
        );
        let accepted = next_sent(&mut sent, MessageKind::Accept).await;
        assert_eq!(accepted.view, 0);

        // Replica 0 falls silent, so replica 1 suspects it and runs phase 1.
        let prepare = next_sent(&mut sent, MessageKind::Phase1Request).await;
        assert_eq!(prepare.view, 1);
        assert_eq!(prepare.payload, Payload::Phase1Request { from_instance: 0 });

        let promise = Message::new(
            1,
            Payload::Phase1Response {
                lowest_available: 0,
                epochs: vec![0; size],
                instances: vec![],
            },
        );
        network.endpoint(2).send_to(&promise, 1);
        network.endpoint(3).send_to(&promise, 1);

        let proposal = next_sent(&mut sent, MessageKind::Propose).await;
        assert_eq!(proposal.view, 1);
        assert_eq!(
            proposal.payload,
            Payload::Propose {
                instance: 0,
                value: value.clone(),
            }
        );

        let accept = Message::new(
            1,
            Payload::Accept {
                instance: 0,
                value: value.clone(),
            },
        );
        network.endpoint(2).send_to(&accept, 1);
        network.endpoint(3).send_to(&accept, 1);

        let decision = timeout(Duration::from_secs(30), decisions.recv())
            .await
            .expect("decision in time")
            .expect("decision");
        assert_eq!(decision, Decision::Instance { id: 0, value });

        shutdown.close();
        task.await.expect("join").expect("clean shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_forwards_to_leader() {
        let mut f = Fixture::new(3).await;
        f.submit(2, vec![request(5, 1)]);

        let (_, requests) = f.next_requests(0).await;
        assert_eq!(requests, vec![request(5, 1)]);
        let (_, requests) = f.next_requests(2).await;
        assert_eq!(requests, vec![request(5, 1)]);
        f.stop().await;
    }
}
