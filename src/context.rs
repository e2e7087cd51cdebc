use ahash::{AHashMap as HashMap, AHashSet as HashSet};

use crate::errors::TxnError;

/// Identifies one transaction across the whole runtime.
pub type TxnId = u64;
/// Identifies one deterministic batch; `NO_BATCH` (`-1`) means "none" and is
/// also the id of every scheduler chain root.
pub type BatchId = i64;
/// Stable key addressing one entity cluster-wide.
pub type EntityId = u64;
/// Position of a coordinator in the ring.
pub type CoordinatorId = usize;
/// Opaque application payload; callers bring their own encoding.
pub type Payload = Vec<u8>;

/// Sentinel batch id: no batch assigned / chain root.
pub const NO_BATCH: BatchId = -1;

/// One transaction's identity and declared or derived metadata.
///
/// Created when a coordinator admits the transaction and carried verbatim
/// through every nested call; discarded at commit or abort.
#[derive(Debug, Clone)]
pub struct TransactionContext {
    /// Globally unique transaction id, drawn from the token's counter.
    pub txn_id: TxnId,
    /// Batch this transaction belongs to; `NO_BATCH` for non-deterministic
    /// transactions.
    pub batch_id: BatchId,
    /// Whether the access set was declared up front.
    pub deterministic: bool,
    /// Declared accesses per entity (deterministic only).
    pub accesses: HashMap<EntityId, u32>,
    /// Highest committed batch id known by the admitting coordinator.
    pub highest_committed_seen: BatchId,
}

impl TransactionContext {
    pub fn deterministic(
        txn_id: TxnId,
        batch_id: BatchId,
        accesses: HashMap<EntityId, u32>,
        highest_committed_seen: BatchId,
    ) -> Self {
        Self {
            txn_id,
            batch_id,
            deterministic: true,
            accesses,
            highest_committed_seen,
        }
    }

    pub fn non_deterministic(txn_id: TxnId, highest_committed_seen: BatchId) -> Self {
        Self {
            txn_id,
            batch_id: NO_BATCH,
            deterministic: false,
            accesses: HashMap::new(),
            highest_committed_seen,
        }
    }
}

/// One function invocation at one entity.
#[derive(Debug, Clone)]
pub struct FunctionCall {
    /// Registry name of the function to run.
    pub function: String,
    /// Opaque input payload.
    pub input: Payload,
}

impl FunctionCall {
    pub fn new(function: impl Into<String>, input: Payload) -> Self {
        Self {
            function: function.into(),
            input,
        }
    }
}

/// How a transaction touched one entity.
#[derive(Debug, Clone, Copy, Default)]
pub struct Participation {
    pub reads: bool,
    pub writes: bool,
    /// Number of calls executed at the entity; deterministic drivers compare
    /// this against the declared count to flush unused turns.
    pub calls: u32,
}

/// Per-transaction accumulated effect across nested entity calls.
///
/// Every call in the tree writes into the one instance the execution handle
/// carries; consumed by the serializability check and then discarded.
#[derive(Debug, Clone, Default)]
pub struct FunctionResult {
    /// Set when business logic failed somewhere in the call tree.
    pub exception: Option<TxnError>,
    /// Every entity touched, with read/write flags and call counts.
    pub participants: HashMap<EntityId, Participation>,
    /// Deterministic batches ordered before this transaction at any entity.
    pub before_set: HashSet<BatchId>,
    /// Deterministic batches ordered after this transaction at any entity.
    pub after_set: HashSet<BatchId>,
    /// Largest id in the before-set and the entity whose chain produced it.
    pub max_before: BatchId,
    pub max_before_entity: Option<EntityId>,
    /// Smallest id in the after-set and that batch's global predecessor,
    /// used for the consecutiveness test.
    pub min_after: BatchId,
    pub min_after_global_pred: BatchId,
}

impl FunctionResult {
    pub fn new() -> Self {
        Self {
            max_before: NO_BATCH,
            min_after: BatchId::MAX,
            min_after_global_pred: NO_BATCH,
            ..Default::default()
        }
    }

    /// Records one call at `entity`.
    pub fn record_call(&mut self, entity: EntityId, read: bool, write: bool) {
        let p = self.participants.entry(entity).or_default();
        p.reads |= read;
        p.writes |= write;
        p.calls += 1;
    }

    /// Folds ordering facts gathered at one entity into this result.
    pub fn absorb_ordering(&mut self, entity: EntityId, facts: &crate::scheduler::BeforeAfter) {
        self.before_set.extend(facts.before.iter().copied());
        self.after_set.extend(facts.after.iter().copied());
        if facts.max_before > self.max_before {
            self.max_before = facts.max_before;
            self.max_before_entity = Some(entity);
        }
        if facts.min_after < self.min_after {
            self.min_after = facts.min_after;
            self.min_after_global_pred = facts.min_after_global_pred;
        }
    }
}

/// What a top-level `start_transaction` call hands back to the application.
#[derive(Debug, Clone)]
pub struct TxnOutcome {
    pub txn_id: TxnId,
    /// `None` on success; the failure taxonomy otherwise.
    pub error: Option<TxnError>,
    /// Entry-call output payload, when the call produced one.
    pub output: Option<Payload>,
}

impl TxnOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}
