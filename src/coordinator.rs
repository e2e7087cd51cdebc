use ahash::AHashMap as HashMap;
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep};

use crate::EntityState;
use crate::config::RingConfig;
use crate::context::{BatchId, CoordinatorId, EntityId, NO_BATCH, TransactionContext, TxnId};
use crate::entity::Entity;
use crate::errors::{Result, TxnError};
use crate::scheduler::DeterministicBatchSchedule;

/// The single token circulating the coordinator ring.
///
/// Whoever holds it may assign ids and emit one deterministic batch; the
/// counters inside are the only global sequencing state in the engine.
#[derive(Debug, Clone)]
pub struct BatchToken {
    /// Last transaction id handed out, `-1` before the first. Batch ids are
    /// drawn from the same counter, so a batch id equals the id of its first
    /// transaction.
    pub last_txn_id: i64,
    /// Last batch emitted anywhere in the ring.
    pub last_batch_id: BatchId,
    /// Ring position that emitted `last_batch_id`.
    pub last_batch_owner: Option<CoordinatorId>,
    /// Highest batch known committed anywhere.
    pub highest_committed: BatchId,
    /// Last batch that touched each entity, for per-entity predecessors.
    pub entity_last_batch: HashMap<EntityId, BatchId>,
    /// Ring position that last saw the token with no work, if any.
    pub idle_marker: Option<CoordinatorId>,
    /// Set once the idle marker survived a full circulation; forwarding then
    /// sleeps between hops.
    pub backoff: bool,
}

impl BatchToken {
    pub fn new() -> Self {
        Self {
            last_txn_id: -1,
            last_batch_id: NO_BATCH,
            last_batch_owner: None,
            highest_committed: NO_BATCH,
            entity_last_batch: HashMap::new(),
            idle_marker: None,
            backoff: false,
        }
    }
}

impl Default for BatchToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a coordinator reacts to. One inbox, no other entry points.
pub(crate) enum CoordinatorMsg {
    /// The ring token arrived.
    Token(BatchToken),
    /// A deterministic transaction wants admission into the next batch.
    PactRequest {
        accesses: HashMap<EntityId, u32>,
        reply: oneshot::Sender<TransactionContext>,
    },
    /// A non-deterministic transaction wants an id.
    ActRequest {
        reply: oneshot::Sender<TransactionContext>,
    },
    /// An entity finished one of this coordinator's batches.
    BatchComplete { batch: BatchId },
    /// Another coordinator needs to know when `batch` (owned here) commits.
    WaitCommit {
        batch: BatchId,
        reply: oneshot::Sender<()>,
    },
    /// Another coordinator committed `batch`.
    CommitNotice { batch: BatchId },
    /// Internal: the awaited predecessor of `batch` has committed.
    PredecessorCommitted { batch: BatchId },
}

/// Cheap cloneable address of one coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    id: CoordinatorId,
    tx: mpsc::UnboundedSender<CoordinatorMsg>,
    /// Raised when admission work arrives, so a backoff sleep can cut short.
    work_arrived: Arc<AtomicBool>,
}

impl CoordinatorHandle {
    pub fn id(&self) -> CoordinatorId {
        self.id
    }

    /// Admits a deterministic transaction; resolves with its context once a
    /// batch containing it is emitted.
    pub(crate) async fn request_pact(
        &self,
        accesses: HashMap<EntityId, u32>,
    ) -> Result<TransactionContext> {
        let (reply, rx) = oneshot::channel();
        self.work_arrived.store(true, Ordering::Relaxed);
        self.tx
            .send(CoordinatorMsg::PactRequest { accesses, reply })
            .map_err(|_| TxnError::Internal("coordinator inbox closed".into()))?;
        rx.await
            .map_err(|_| TxnError::Internal("coordinator dropped an admission reply".into()))
    }

    /// Admits a non-deterministic transaction; resolves once an id from the
    /// token pool is available.
    pub(crate) async fn request_act(&self) -> Result<TransactionContext> {
        let (reply, rx) = oneshot::channel();
        self.work_arrived.store(true, Ordering::Relaxed);
        self.tx
            .send(CoordinatorMsg::ActRequest { reply })
            .map_err(|_| TxnError::Internal("coordinator inbox closed".into()))?;
        rx.await
            .map_err(|_| TxnError::Internal("coordinator dropped an admission reply".into()))
    }

    pub(crate) fn forward_token(&self, token: BatchToken) {
        if self.tx.send(CoordinatorMsg::Token(token)).is_err() {
            warn!("coordinator {} is gone, the ring token is lost", self.id);
        }
    }

    pub(crate) fn ack_batch_completion(&self, batch: BatchId) {
        let _ = self.tx.send(CoordinatorMsg::BatchComplete { batch });
    }

    pub(crate) fn wait_commit(&self, batch: BatchId, reply: oneshot::Sender<()>) {
        let _ = self.tx.send(CoordinatorMsg::WaitCommit { batch, reply });
    }

    pub(crate) fn notify_commit(&self, batch: BatchId) {
        let _ = self.tx.send(CoordinatorMsg::CommitNotice { batch });
    }

    fn predecessor_committed(&self, batch: BatchId) {
        let _ = self.tx.send(CoordinatorMsg::PredecessorCommitted { batch });
    }
}

/// Commit bookkeeping for one batch this coordinator emitted.
struct EmittedBatch {
    expected_acks: usize,
    acks: usize,
    global_predecessor: BatchId,
    predecessor_owner: Option<CoordinatorId>,
    entities: Vec<EntityId>,
    complete: bool,
    waiting_predecessor: bool,
}

/// One ring member, run as a task owning its inbox.
///
/// All coordination is message passing: admission requests buffer locally,
/// the token triggers emission, entities acknowledge completion, and commit
/// dependencies between coordinators travel as wait/notice pairs.
pub(crate) struct Coordinator<S: EntityState> {
    id: CoordinatorId,
    config: RingConfig,
    inbox: mpsc::UnboundedReceiver<CoordinatorMsg>,
    peers: Vec<CoordinatorHandle>,
    entities: Arc<HashMap<EntityId, Arc<Entity<S>>>>,
    work_arrived: Arc<AtomicBool>,
    pending_pacts: Vec<(HashMap<EntityId, u32>, oneshot::Sender<TransactionContext>)>,
    act_waiters: VecDeque<oneshot::Sender<TransactionContext>>,
    /// Pre-allocated non-deterministic ids, refilled on token arrival.
    act_pool: VecDeque<TxnId>,
    /// Admissions since the last token, feeding the demand estimate.
    act_demand: u64,
    /// Exponential moving average of per-circulation demand, alpha 0.5.
    act_ewma: f64,
    highest_committed: BatchId,
    emitted: HashMap<BatchId, EmittedBatch>,
    commit_waiters: HashMap<BatchId, Vec<oneshot::Sender<()>>>,
    last_emission: Option<Instant>,
}

impl<S: EntityState> Coordinator<S> {
    /// Builds the whole ring at once: handles first so entities can hold
    /// them, then the coordinators themselves.
    pub(crate) fn ring(
        config: &RingConfig,
    ) -> (Vec<CoordinatorHandle>, Vec<PendingCoordinator>) {
        let mut handles = Vec::with_capacity(config.ring_size);
        let mut inboxes = Vec::with_capacity(config.ring_size);
        for id in 0..config.ring_size {
            let (tx, rx) = mpsc::unbounded_channel();
            let work_arrived = Arc::new(AtomicBool::new(false));
            handles.push(CoordinatorHandle {
                id,
                tx,
                work_arrived,
            });
            inboxes.push(rx);
        }
        let pending = inboxes
            .into_iter()
            .enumerate()
            .map(|(id, inbox)| PendingCoordinator { id, inbox })
            .collect();
        (handles, pending)
    }

    pub(crate) fn new(
        pending: PendingCoordinator,
        config: RingConfig,
        peers: Vec<CoordinatorHandle>,
        entities: Arc<HashMap<EntityId, Arc<Entity<S>>>>,
    ) -> Self {
        let work_arrived = peers[pending.id].work_arrived.clone();
        Self {
            id: pending.id,
            config,
            inbox: pending.inbox,
            peers,
            entities,
            work_arrived,
            pending_pacts: Vec::new(),
            act_waiters: VecDeque::new(),
            act_pool: VecDeque::new(),
            act_demand: 0,
            act_ewma: 0.0,
            highest_committed: NO_BATCH,
            emitted: HashMap::new(),
            commit_waiters: HashMap::new(),
            last_emission: None,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("coordinator {} up", self.id);
        while let Some(msg) = self.inbox.recv().await {
            match msg {
                CoordinatorMsg::Token(token) => self.handle_token(token),
                CoordinatorMsg::PactRequest { accesses, reply } => {
                    self.pending_pacts.push((accesses, reply));
                }
                CoordinatorMsg::ActRequest { reply } => {
                    self.act_demand += 1;
                    match self.act_pool.pop_front() {
                        Some(txn_id) => {
                            let _ = reply.send(TransactionContext::non_deterministic(
                                txn_id,
                                self.highest_committed,
                            ));
                        }
                        None => self.act_waiters.push_back(reply),
                    }
                }
                CoordinatorMsg::BatchComplete { batch } => self.handle_batch_complete(batch),
                CoordinatorMsg::WaitCommit { batch, reply } => {
                    if batch <= self.highest_committed {
                        let _ = reply.send(());
                    } else {
                        self.commit_waiters.entry(batch).or_default().push(reply);
                    }
                }
                CoordinatorMsg::CommitNotice { batch } => self.observe_watermark(batch),
                CoordinatorMsg::PredecessorCommitted { batch } => {
                    let predecessor = self.emitted.get(&batch).map(|e| e.global_predecessor);
                    if let Some(predecessor) = predecessor {
                        self.observe_watermark(predecessor);
                    }
                }
            }
        }
        debug!("coordinator {} inbox closed, shutting down", self.id);
    }

    /// The per-token work cycle: emit a batch if admissions are buffered,
    /// refill the non-deterministic id pool, update the idle state, forward
    /// the token, and only then push schedules to entities.
    fn handle_token(&mut self, mut token: BatchToken) {
        self.observe_watermark(token.highest_committed);

        let mut schedules = Vec::new();
        let emitting = !self.pending_pacts.is_empty();
        if emitting {
            // Pace emissions so batches amortize coordination cost. The
            // token is re-delivered after the gap rather than slept on
            // inline, keeping the inbox draining meanwhile.
            if let Some(last) = self.last_emission {
                let next_slot = last + self.config.batch_interval;
                let now = Instant::now();
                if now < next_slot {
                    let me = self.peers[self.id].clone();
                    tokio::spawn(async move {
                        sleep(next_slot - now).await;
                        me.forward_token(token);
                    });
                    return;
                }
            }
            self.last_emission = Some(Instant::now());
            schedules = self.emit_batch(&mut token);
        }

        let act_served = self.refill_act_pool(&mut token);

        let worked = emitting || act_served;
        if worked {
            token.idle_marker = None;
            token.backoff = false;
        } else if token.idle_marker == Some(self.id) {
            token.backoff = true;
        } else if token.idle_marker.is_none() {
            token.idle_marker = Some(self.id);
        }
        if self.highest_committed > token.highest_committed {
            token.highest_committed = self.highest_committed;
        }

        let next = self.peers[(self.id + 1) % self.peers.len()].clone();
        if token.backoff {
            // Sleep off-task so the inbox stays live, probing for fresh
            // admissions to cut the sleep short.
            let backoff = self.config.backoff_interval;
            let probe = self.config.idle_probe_interval;
            let work_arrived = self.work_arrived.clone();
            tokio::spawn(async move {
                let deadline = Instant::now() + backoff;
                loop {
                    sleep(probe).await;
                    if work_arrived.swap(false, Ordering::Relaxed)
                        || Instant::now() >= deadline
                    {
                        break;
                    }
                }
                next.forward_token(token);
            });
        } else {
            self.work_arrived.store(false, Ordering::Relaxed);
            next.forward_token(token);
        }

        for (entity_id, schedule) in schedules {
            match self.entities.get(&entity_id) {
                Some(entity) => entity.receive_batch_schedule(schedule),
                None => warn!(
                    "coordinator {}: schedule for unknown entity {entity_id} dropped",
                    self.id
                ),
            }
        }
    }

    /// Drains buffered deterministic admissions into one batch, assigning
    /// ids from the token and recording predecessors before overwriting the
    /// token's per-entity map.
    fn emit_batch(
        &mut self,
        token: &mut BatchToken,
    ) -> Vec<(EntityId, DeterministicBatchSchedule)> {
        let batch_id = token.last_txn_id + 1;
        let global_predecessor = token.last_batch_id;
        let predecessor_owner = token.last_batch_owner;

        let mut per_entity: HashMap<EntityId, Vec<(TxnId, u32)>> = HashMap::new();
        for (accesses, reply) in self.pending_pacts.drain(..) {
            token.last_txn_id += 1;
            let txn_id = token.last_txn_id as TxnId;
            for (entity, count) in &accesses {
                per_entity.entry(*entity).or_default().push((txn_id, *count));
            }
            let ctx = TransactionContext::deterministic(
                txn_id,
                batch_id,
                accesses,
                self.highest_committed,
            );
            let _ = reply.send(ctx);
        }
        token.last_batch_id = batch_id;
        token.last_batch_owner = Some(self.id);

        let mut schedules = Vec::with_capacity(per_entity.len());
        for (entity, txns) in per_entity {
            let predecessor = token
                .entity_last_batch
                .insert(entity, batch_id)
                .unwrap_or(NO_BATCH);
            schedules.push((
                entity,
                DeterministicBatchSchedule {
                    batch_id,
                    predecessor,
                    global_predecessor,
                    coordinator: self.id,
                    txns,
                    highest_committed: self.highest_committed,
                },
            ));
        }
        self.emitted.insert(
            batch_id,
            EmittedBatch {
                expected_acks: schedules.len(),
                acks: 0,
                global_predecessor,
                predecessor_owner,
                entities: schedules.iter().map(|(entity, _)| *entity).collect(),
                complete: false,
                waiting_predecessor: false,
            },
        );
        debug!(
            "coordinator {}: emitted batch {batch_id} over {} entities, predecessor {global_predecessor}",
            self.id,
            schedules.len()
        );
        schedules
    }

    /// Serves waiting non-deterministic admissions and tops the id pool up
    /// to the demand estimate. Returns whether any demand existed this
    /// circulation.
    fn refill_act_pool(&mut self, token: &mut BatchToken) -> bool {
        let waiting = self.act_waiters.len();
        let demand = self.act_demand as f64;
        self.act_ewma = 0.5 * demand + 0.5 * self.act_ewma;
        self.act_demand = 0;

        let target = (self.act_ewma.ceil() as usize).max(waiting);
        while self.act_pool.len() < target {
            token.last_txn_id += 1;
            self.act_pool.push_back(token.last_txn_id as TxnId);
        }
        while let Some(reply) = self.act_waiters.pop_front() {
            // target >= waiting, so the pool covers every waiter.
            let Some(txn_id) = self.act_pool.pop_front() else {
                break;
            };
            let _ = reply.send(TransactionContext::non_deterministic(
                txn_id,
                self.highest_committed,
            ));
        }
        waiting > 0 || demand > 0.0
    }

    fn handle_batch_complete(&mut self, batch: BatchId) {
        let Some(emitted) = self.emitted.get_mut(&batch) else {
            return;
        };
        emitted.acks += 1;
        if emitted.acks >= emitted.expected_acks {
            emitted.complete = true;
            debug!("coordinator {}: batch {batch} complete everywhere", self.id);
            self.try_commit(batch);
        }
    }

    /// Commits `batch` if its global predecessor is covered; otherwise
    /// subscribes to the predecessor's owner once.
    fn try_commit(&mut self, batch: BatchId) {
        let Some(emitted) = self.emitted.get_mut(&batch) else {
            return;
        };
        if !emitted.complete {
            return;
        }
        if emitted.global_predecessor <= self.highest_committed {
            self.commit_emitted(batch);
            self.drain_commit_ready();
            return;
        }
        if emitted.waiting_predecessor {
            return;
        }
        emitted.waiting_predecessor = true;
        let predecessor = emitted.global_predecessor;
        let owner = emitted.predecessor_owner.unwrap_or(self.id);
        let (tx, rx) = oneshot::channel();
        self.peers[owner].wait_commit(predecessor, tx);
        let me = self.peers[self.id].clone();
        tokio::spawn(async move {
            if rx.await.is_ok() {
                me.predecessor_committed(batch);
            }
        });
    }

    /// Commit of one owned batch: bump the watermark, tell the touched
    /// entities, tell the other coordinators, release local commit waits.
    fn commit_emitted(&mut self, batch: BatchId) {
        let Some(emitted) = self.emitted.remove(&batch) else {
            return;
        };
        if batch > self.highest_committed {
            self.highest_committed = batch;
        }
        debug!("coordinator {}: batch {batch} committed", self.id);
        for entity_id in &emitted.entities {
            if let Some(entity) = self.entities.get(entity_id) {
                entity.batch_committed(batch);
            }
        }
        for (peer_id, peer) in self.peers.iter().enumerate() {
            if peer_id != self.id {
                peer.notify_commit(batch);
            }
        }
        self.release_commit_waiters();
    }

    /// Cascades: a fresh watermark may unblock further complete batches.
    fn drain_commit_ready(&mut self) {
        loop {
            let ready = self
                .emitted
                .iter()
                .find(|(_, emitted)| {
                    emitted.complete && emitted.global_predecessor <= self.highest_committed
                })
                .map(|(batch, _)| *batch);
            match ready {
                Some(batch) => self.commit_emitted(batch),
                None => break,
            }
        }
    }

    fn observe_watermark(&mut self, watermark: BatchId) {
        if watermark <= self.highest_committed {
            return;
        }
        self.highest_committed = watermark;
        self.release_commit_waiters();
        self.drain_commit_ready();
    }

    fn release_commit_waiters(&mut self) {
        let watermark = self.highest_committed;
        let ready: Vec<BatchId> = self
            .commit_waiters
            .keys()
            .filter(|batch| **batch <= watermark)
            .copied()
            .collect();
        for batch in ready {
            for waiter in self.commit_waiters.remove(&batch).unwrap_or_default() {
                let _ = waiter.send(());
            }
        }
    }
}

/// A coordinator's inbox, created with the ring handles and consumed when
/// the coordinator task is spawned.
pub(crate) struct PendingCoordinator {
    id: CoordinatorId,
    inbox: mpsc::UnboundedReceiver<CoordinatorMsg>,
}
