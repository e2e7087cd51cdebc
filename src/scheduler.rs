use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use log::debug;
use tokio::sync::oneshot;

use crate::context::{BatchId, CoordinatorId, NO_BATCH, TxnId};
use crate::errors::{Result, TxnError};

/// The execution plan for one batch at one entity.
///
/// Created by the owning coordinator when the batch is emitted; the entity's
/// scheduler consumes it turn by turn and drops it once the batch commits and
/// no successor references it.
#[derive(Debug, Clone)]
pub struct DeterministicBatchSchedule {
    pub batch_id: BatchId,
    /// Previous batch at this entity, `NO_BATCH` if none.
    pub predecessor: BatchId,
    /// Previous batch in token order regardless of entity, for the
    /// before/after consecutiveness test.
    pub global_predecessor: BatchId,
    /// Ring position of the coordinator that emitted the batch.
    pub coordinator: CoordinatorId,
    /// Transaction turns in order, each with its declared access count at
    /// this entity.
    pub txns: Vec<(TxnId, u32)>,
    /// Commit watermark snapshot at emission time, forwarded for garbage
    /// collection.
    pub highest_committed: BatchId,
}

/// A granted or pending scheduler turn. Await outside the scheduler lock.
pub enum Turn {
    Ready,
    Wait(oneshot::Receiver<()>),
}

impl Turn {
    /// Resolves once the turn is granted.
    pub async fn acquired(self) -> Result<()> {
        match self {
            Turn::Ready => Ok(()),
            Turn::Wait(rx) => rx
                .await
                .map_err(|_| TxnError::Internal("scheduler dropped a turn promise".into())),
        }
    }
}

/// Outcome of acknowledging one deterministic access.
#[derive(Debug, Clone, Copy)]
pub struct AckComplete {
    /// True when the whole batch at this entity is exhausted and completion
    /// should be acknowledged to the owning coordinator.
    pub switching_batches: bool,
    /// Ring position of the coordinator owning the batch.
    pub coordinator: CoordinatorId,
}

/// Before/after ordering facts for one non-deterministic transaction at one
/// entity, fed into the serializability check.
#[derive(Debug, Clone, Default)]
pub struct BeforeAfter {
    pub before: HashSet<BatchId>,
    pub after: HashSet<BatchId>,
    pub max_before: BatchId,
    pub min_after: BatchId,
    /// Global predecessor of `min_after`, `NO_BATCH` when unknown (the
    /// check then stays conservative).
    pub min_after_global_pred: BatchId,
}

/// One link in the ordering chain: a deterministic batch (possibly a
/// placeholder whose schedule has not arrived) or a non-deterministic window.
struct ScheduleNode {
    id: BatchId,
    deterministic: bool,
    prev: Option<BatchId>,
    next: Option<BatchId>,
    /// Predecessor chain complete; this node may execute.
    active: bool,
    complete: bool,
    committed: bool,
    commit_waiters: Vec<oneshot::Sender<()>>,
    /// Deterministic node created by a successor link before its own
    /// schedule arrived.
    placeholder: bool,
    /// Window only: joined transactions and how many are still running.
    members: HashSet<TxnId>,
    running: usize,
    window_waiters: Vec<(TxnId, oneshot::Sender<()>)>,
}

impl ScheduleNode {
    fn root() -> Self {
        Self {
            id: NO_BATCH,
            deterministic: true,
            prev: None,
            next: None,
            active: true,
            complete: true,
            committed: true,
            commit_waiters: Vec::new(),
            placeholder: false,
            members: HashSet::new(),
            running: 0,
            window_waiters: Vec::new(),
        }
    }

    fn deterministic(id: BatchId, placeholder: bool) -> Self {
        Self {
            id,
            deterministic: true,
            prev: None,
            next: None,
            active: false,
            complete: false,
            committed: false,
            commit_waiters: Vec::new(),
            placeholder,
            members: HashSet::new(),
            running: 0,
            window_waiters: Vec::new(),
        }
    }

    fn window(id: BatchId) -> Self {
        Self {
            id,
            deterministic: false,
            prev: None,
            next: None,
            active: false,
            complete: false,
            committed: false,
            commit_waiters: Vec::new(),
            placeholder: false,
            members: HashSet::new(),
            running: 0,
            window_waiters: Vec::new(),
        }
    }
}

/// Turn state of one registered batch.
struct BatchRun {
    schedule: DeterministicBatchSchedule,
    remaining: Vec<u32>,
    cursor: usize,
    /// A call of the cursor transaction is currently executing; later calls
    /// of the same transaction queue behind it.
    in_flight: bool,
    turn_waiters: Vec<(TxnId, oneshot::Sender<()>)>,
}

impl BatchRun {
    fn new(schedule: DeterministicBatchSchedule) -> Self {
        let remaining = schedule.txns.iter().map(|(_, count)| *count).collect();
        Self {
            schedule,
            remaining,
            cursor: 0,
            in_flight: false,
            turn_waiters: Vec::new(),
        }
    }

    fn current_txn(&self) -> Option<TxnId> {
        self.schedule.txns.get(self.cursor).map(|(tid, _)| *tid)
    }
}

/// Orders deterministic batches and non-deterministic windows at one entity.
///
/// The chain is an arena of nodes keyed by batch id (windows get synthetic
/// negative ids) with explicit prev/next links, rooted at node `-1` which is
/// born complete. All operations run under the owning entity's scheduler
/// mutex; turn waits are returned as promises and awaited outside it.
pub struct Scheduler {
    nodes: HashMap<BatchId, ScheduleNode>,
    runs: HashMap<BatchId, BatchRun>,
    tail: BatchId,
    next_window_id: BatchId,
    /// Which window each in-flight non-deterministic transaction joined.
    window_of: HashMap<TxnId, BatchId>,
    highest_committed: BatchId,
    /// Calls buffered before their batch's schedule arrived.
    pending_det: HashMap<BatchId, Vec<(TxnId, oneshot::Sender<()>)>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(NO_BATCH, ScheduleNode::root());
        Self {
            nodes,
            runs: HashMap::new(),
            tail: NO_BATCH,
            next_window_id: NO_BATCH - 1,
            window_of: HashMap::new(),
            highest_committed: NO_BATCH,
            pending_det: HashMap::new(),
        }
    }

    pub fn highest_committed(&self) -> BatchId {
        self.highest_committed
    }

    /// Registers an emitted batch, linking it into the chain.
    ///
    /// Schedules arrive in any order, so a batch is inserted by id among the
    /// chain's deterministic nodes, never blindly at the tail. A placeholder
    /// created by an earlier successor is filled in place; either way, if the
    /// batch's predecessor has not arrived and is not yet committed, a
    /// placeholder for it is linked in front of the batch first.
    pub fn register_batch(&mut self, schedule: DeterministicBatchSchedule) {
        let batch = schedule.batch_id;
        self.advance_watermark(schedule.highest_committed);
        if self.runs.contains_key(&batch) || batch <= self.highest_committed {
            debug!("ignoring duplicate or stale schedule for batch {batch}");
            return;
        }

        let mut run = BatchRun::new(schedule);
        if let Some(waiters) = self.pending_det.remove(&batch) {
            run.turn_waiters = waiters;
        }

        let pred = run.schedule.predecessor;
        let pred_missing =
            pred != NO_BATCH && pred > self.highest_committed && !self.nodes.contains_key(&pred);
        if let Some(node) = self.nodes.get_mut(&batch) {
            node.placeholder = false;
            if pred_missing {
                // The filled node may have activated off an unrelated
                // neighbor; its real predecessor goes in front of it first
                // and the splice clears the active flag.
                self.link_before(ScheduleNode::deterministic(pred, true), batch);
            }
        } else {
            if pred_missing {
                self.insert_det_node(ScheduleNode::deterministic(pred, true));
            }
            self.insert_det_node(ScheduleNode::deterministic(batch, false));
        }

        let active = self.nodes.get(&batch).map(|n| n.active).unwrap_or(false);
        self.runs.insert(batch, run);
        if active {
            self.wake_current(batch);
        }
        debug!("registered batch {batch}, tail now {}", self.tail);
    }

    /// Deterministic turn-taking: resolves when the batch is at the chain's
    /// execution point, the batch cursor is at `txn`, and no earlier call of
    /// the same transaction is still in flight.
    pub fn wait_det(&mut self, batch: BatchId, txn: TxnId) -> Result<Turn> {
        if batch <= self.highest_committed {
            return Err(TxnError::Internal(format!(
                "call for already-committed batch {batch}"
            )));
        }
        let Some(run) = self.runs.get_mut(&batch) else {
            // Schedule not here yet; buffer the call.
            let (tx, rx) = oneshot::channel();
            self.pending_det.entry(batch).or_default().push((txn, tx));
            return Ok(Turn::Wait(rx));
        };
        let Some(slot) = run.schedule.txns.iter().position(|(t, _)| *t == txn) else {
            return Err(TxnError::Application(format!(
                "transaction {txn} has no turn in batch {batch} at this entity"
            )));
        };
        if run.remaining[slot] == 0 {
            return Err(TxnError::Application(format!(
                "transaction {txn} exceeded its declared accesses in batch {batch}"
            )));
        }

        let node_active = self.nodes.get(&batch).map(|n| n.active).unwrap_or(false);
        let run = self.runs.get_mut(&batch).expect("run just present");
        if node_active && !run.in_flight && run.current_txn() == Some(txn) {
            run.in_flight = true;
            return Ok(Turn::Ready);
        }
        let (tx, rx) = oneshot::channel();
        run.turn_waiters.push((txn, tx));
        Ok(Turn::Wait(rx))
    }

    /// Records one finished access of `txn` in `batch`. Advances the batch
    /// cursor when the transaction's count reaches zero and reports
    /// `switching_batches` once the whole list is exhausted.
    pub fn ack_det(&mut self, batch: BatchId, txn: TxnId) -> Result<AckComplete> {
        let run = self
            .runs
            .get_mut(&batch)
            .ok_or_else(|| TxnError::Internal(format!("ack for unknown batch {batch}")))?;
        if run.current_txn() != Some(txn) {
            return Err(TxnError::Internal(format!(
                "out-of-turn ack by transaction {txn} in batch {batch}"
            )));
        }
        run.in_flight = false;
        run.remaining[run.cursor] = run.remaining[run.cursor].saturating_sub(1);
        let coordinator = run.schedule.coordinator;
        if run.remaining[run.cursor] > 0 {
            self.wake_current(batch);
            return Ok(AckComplete {
                switching_batches: false,
                coordinator,
            });
        }
        run.cursor += 1;
        if run.cursor < run.schedule.txns.len() {
            self.wake_current(batch);
            return Ok(AckComplete {
                switching_batches: false,
                coordinator,
            });
        }
        debug!("batch {batch} exhausted at this entity");
        self.mark_complete(batch);
        Ok(AckComplete {
            switching_batches: true,
            coordinator,
        })
    }

    /// Non-deterministic turn-taking: joins the tail window (opening one if
    /// the tail is deterministic) and resolves once no deterministic batch
    /// stands between the window and the execution point.
    pub fn wait_act(&mut self, txn: TxnId) -> Turn {
        let window = match self.window_of.get(&txn) {
            Some(w) => *w,
            None => {
                let tail = self.tail;
                let window = if self
                    .nodes
                    .get(&tail)
                    .map(|n| !n.deterministic)
                    .unwrap_or(false)
                {
                    tail
                } else {
                    let id = self.next_window_id;
                    self.next_window_id -= 1;
                    self.link_at_tail(ScheduleNode::window(id));
                    id
                };
                let node = self.nodes.get_mut(&window).expect("window just linked");
                node.members.insert(txn);
                node.running += 1;
                self.window_of.insert(txn, window);
                window
            }
        };
        let node = self.nodes.get_mut(&window).expect("window present");
        if node.active {
            Turn::Ready
        } else {
            let (tx, rx) = oneshot::channel();
            node.window_waiters.push((txn, tx));
            Turn::Wait(rx)
        }
    }

    /// Marks a non-deterministic transaction finished at this entity
    /// (committed or aborted). A closed, drained window completes and hands
    /// the execution point to its successor.
    pub fn act_finished(&mut self, txn: TxnId) {
        let Some(window) = self.window_of.remove(&txn) else {
            return;
        };
        let Some(node) = self.nodes.get_mut(&window) else {
            return;
        };
        node.running = node.running.saturating_sub(1);
        if node.active && node.next.is_some() && node.running == 0 {
            self.mark_complete(window);
        }
    }

    /// Walks the chain backward and forward from `txn`'s window, collecting
    /// the deterministic batch ids before and after it.
    pub fn before_after(&self, txn: TxnId) -> Result<BeforeAfter> {
        let window = *self.window_of.get(&txn).ok_or_else(|| {
            TxnError::Internal(format!("transaction {txn} holds no window at this entity"))
        })?;
        let mut facts = BeforeAfter {
            max_before: NO_BATCH,
            min_after: BatchId::MAX,
            min_after_global_pred: NO_BATCH,
            ..Default::default()
        };

        let mut cur = self.nodes.get(&window).and_then(|n| n.prev);
        while let Some(id) = cur {
            let node = self.nodes.get(&id).expect("linked node present");
            if node.deterministic && node.id != NO_BATCH {
                facts.before.insert(node.id);
                facts.max_before = facts.max_before.max(node.id);
            }
            cur = node.prev;
        }

        let mut cur = self.nodes.get(&window).and_then(|n| n.next);
        while let Some(id) = cur {
            let node = self.nodes.get(&id).expect("linked node present");
            if node.deterministic {
                facts.after.insert(node.id);
                if node.id < facts.min_after {
                    facts.min_after = node.id;
                    facts.min_after_global_pred = self
                        .runs
                        .get(&node.id)
                        .map(|run| run.schedule.global_predecessor)
                        .unwrap_or(NO_BATCH);
                }
            }
            cur = node.next;
        }
        Ok(facts)
    }

    /// Resolves a batch's commit promise and prunes the chain from the root
    /// up to and including its node, chasing the predecessor chain to drop
    /// schedule entries nothing references any more.
    pub fn commit_batch(&mut self, batch: BatchId) {
        if batch > self.highest_committed {
            self.highest_committed = batch;
        }
        let Some(node) = self.nodes.get_mut(&batch) else {
            return;
        };
        node.committed = true;
        for waiter in node.commit_waiters.drain(..) {
            let _ = waiter.send(());
        }

        // Prune root..=batch. Everything in between is complete by the time
        // a batch commits.
        let mut cur = self.nodes.get(&NO_BATCH).and_then(|n| n.next);
        let mut after = None;
        while let Some(id) = cur {
            let node = self.nodes.remove(&id).expect("linked node present");
            self.runs.remove(&id);
            cur = node.next;
            if id == batch {
                after = node.next;
                break;
            }
        }
        if let Some(root) = self.nodes.get_mut(&NO_BATCH) {
            root.next = after;
        }
        match after {
            Some(id) => {
                if let Some(next) = self.nodes.get_mut(&id) {
                    next.prev = Some(NO_BATCH);
                }
            }
            None => self.tail = NO_BATCH,
        }

        // Drop schedules reachable only through the committed batch.
        let mut pred = batch;
        while pred != NO_BATCH {
            match self.runs.remove(&pred) {
                Some(run) => pred = run.schedule.predecessor,
                None => break,
            }
        }
        debug!(
            "committed batch {batch}, watermark {}",
            self.highest_committed
        );
    }

    /// Applies a commit watermark learned from a schedule snapshot or a
    /// coordinator notice: every chain batch at or below it is committed.
    pub fn advance_watermark(&mut self, watermark: BatchId) {
        if watermark <= self.highest_committed {
            return;
        }
        loop {
            let first_det = {
                let mut cur = self.nodes.get(&NO_BATCH).and_then(|n| n.next);
                let mut found = None;
                while let Some(id) = cur {
                    let node = self.nodes.get(&id).expect("linked node present");
                    if node.deterministic {
                        found = Some(id);
                        break;
                    }
                    cur = node.next;
                }
                found
            };
            match first_det {
                Some(id) if id <= watermark => self.commit_batch(id),
                _ => break,
            }
        }
        if watermark > self.highest_committed {
            self.highest_committed = watermark;
        }
    }

    /// Commit promise for a batch; already resolved for pruned or
    /// watermark-covered batches.
    pub fn wait_batch_commit(&mut self, batch: BatchId) -> Result<Turn> {
        if batch <= self.highest_committed {
            return Ok(Turn::Ready);
        }
        let Some(node) = self.nodes.get_mut(&batch) else {
            return Err(TxnError::Internal(format!(
                "commit wait for unknown batch {batch}"
            )));
        };
        if node.committed {
            return Ok(Turn::Ready);
        }
        let (tx, rx) = oneshot::channel();
        node.commit_waiters.push(tx);
        Ok(Turn::Wait(rx))
    }

    /// Links a deterministic node at its ordered position: directly before
    /// the first deterministic node with a higher id, or at the tail when no
    /// such node exists. Batch ids increase along the per-entity chain, so
    /// this keeps late-delivered schedules from jumping ahead of earlier
    /// batches.
    fn insert_det_node(&mut self, node: ScheduleNode) {
        let mut cur = self.nodes.get(&NO_BATCH).and_then(|n| n.next);
        let mut before = None;
        while let Some(id) = cur {
            let candidate = self.nodes.get(&id).expect("linked node present");
            if candidate.deterministic && candidate.id > node.id {
                before = Some(id);
                break;
            }
            cur = candidate.next;
        }
        match before {
            Some(next_id) => self.link_before(node, next_id),
            None => self.link_at_tail(node),
        }
    }

    /// Splices `node` into the chain directly in front of `next_id`. The
    /// displaced node loses its active flag; it regains it through the normal
    /// cascade once the new node completes.
    fn link_before(&mut self, mut node: ScheduleNode, next_id: BatchId) {
        let id = node.id;
        let prev_id = self
            .nodes
            .get(&next_id)
            .and_then(|n| n.prev)
            .expect("non-root node has a predecessor link");
        node.prev = Some(prev_id);
        node.next = Some(next_id);
        self.nodes.insert(id, node);
        let prev_complete = {
            let prev = self.nodes.get_mut(&prev_id).expect("linked node present");
            prev.next = Some(id);
            prev.complete
        };
        let next = self.nodes.get_mut(&next_id).expect("linked node present");
        next.prev = Some(id);
        next.active = false;
        if prev_complete {
            self.activate_chain(id);
        }
    }

    fn link_at_tail(&mut self, mut node: ScheduleNode) {
        let id = node.id;
        let old_tail = self.tail;
        node.prev = Some(old_tail);
        self.nodes.insert(id, node);
        let tail_complete = {
            let tail_node = self.nodes.get_mut(&old_tail).expect("tail present");
            tail_node.next = Some(id);
            tail_node.complete
        };
        self.tail = id;

        // Linking a deterministic node behind a drained window closes it.
        let closes_window = self
            .nodes
            .get(&old_tail)
            .map(|prev| !prev.deterministic && prev.active && prev.running == 0 && !prev.complete)
            .unwrap_or(false);
        if closes_window {
            self.mark_complete(old_tail);
            return;
        }
        if tail_complete {
            self.activate_chain(id);
        }
    }

    fn mark_complete(&mut self, id: BatchId) {
        let next = {
            let node = self.nodes.get_mut(&id).expect("node present");
            node.complete = true;
            node.next
        };
        if let Some(next) = next {
            self.activate_chain(next);
        }
    }

    /// Activates `id` and cascades past any window that is already closed
    /// and drained.
    fn activate_chain(&mut self, id: BatchId) {
        let mut cur = Some(id);
        while let Some(c) = cur {
            cur = None;
            let wake = {
                let Some(node) = self.nodes.get_mut(&c) else {
                    break;
                };
                if node.active {
                    break;
                }
                node.active = true;
                if node.deterministic {
                    !node.placeholder
                } else {
                    for (_, waiter) in node.window_waiters.drain(..) {
                        let _ = waiter.send(());
                    }
                    if node.next.is_some() && node.running == 0 {
                        node.complete = true;
                        cur = node.next;
                    }
                    false
                }
            };
            if wake {
                self.wake_current(c);
            }
        }
    }

    /// Grants the turn to the next queued call of the batch's cursor
    /// transaction, if any.
    fn wake_current(&mut self, batch: BatchId) {
        let Some(run) = self.runs.get_mut(&batch) else {
            return;
        };
        if run.in_flight {
            return;
        }
        let Some(current) = run.current_txn() else {
            return;
        };
        while let Some(pos) = run.turn_waiters.iter().position(|(t, _)| *t == current) {
            let (_, tx) = run.turn_waiters.remove(pos);
            if tx.send(()).is_ok() {
                run.in_flight = true;
                return;
            }
        }
    }
}
