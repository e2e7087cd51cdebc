use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

use crate::EntityState;
use crate::cc::{CcKind, ConcurrencyControl};
use crate::context::{BatchId, EntityId, NO_BATCH, TransactionContext, TxnId};
use crate::coordinator::CoordinatorHandle;
use crate::errors::{Result, TxnError};
use crate::registry::FunctionRegistry;
use crate::scheduler::{BeforeAfter, DeterministicBatchSchedule, Scheduler, Turn};
use crate::storage::CommitLog;

/// One partitioned unit of application state.
///
/// An entity pairs its scheduler (ordering) with a concurrency-control store
/// (state versions). Both sit behind short-lived mutexes that are never held
/// across an await; waiting is done on promises handed out under the lock.
/// Deterministic transactions bypass the store's speculative machinery and
/// touch committed state directly, which is safe because the scheduler grants
/// them exclusive, totally ordered turns.
pub struct Entity<S: EntityState> {
    id: EntityId,
    scheduler: Mutex<Scheduler>,
    store: Mutex<Box<dyn ConcurrencyControl<S>>>,
    registry: Arc<FunctionRegistry<S>>,
    ring: Vec<CoordinatorHandle>,
    commit_log: Arc<dyn CommitLog>,
    /// Commit watermark, published for cheap multi-waiter commit waits.
    watermark: watch::Sender<BatchId>,
}

impl<S: EntityState> Entity<S> {
    pub(crate) fn new(
        id: EntityId,
        initial: S,
        cc: CcKind,
        registry: Arc<FunctionRegistry<S>>,
        ring: Vec<CoordinatorHandle>,
        commit_log: Arc<dyn CommitLog>,
    ) -> Arc<Self> {
        let (watermark, _) = watch::channel(NO_BATCH);
        Arc::new(Self {
            id,
            scheduler: Mutex::new(Scheduler::new()),
            store: Mutex::new(cc.new_store(initial)),
            registry,
            ring,
            commit_log,
            watermark,
        })
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub(crate) fn registry(&self) -> &FunctionRegistry<S> {
        &self.registry
    }

    pub fn highest_committed(&self) -> BatchId {
        self.scheduler.lock().highest_committed()
    }

    /// Accepts a batch schedule pushed by its owning coordinator.
    pub(crate) fn receive_batch_schedule(&self, schedule: DeterministicBatchSchedule) {
        let watermark = {
            let mut scheduler = self.scheduler.lock();
            scheduler.register_batch(schedule);
            scheduler.highest_committed()
        };
        self.publish_watermark(watermark);
    }

    /// Applies a batch commit decided by its owning coordinator.
    pub(crate) fn batch_committed(&self, batch: BatchId) {
        let watermark = {
            let mut scheduler = self.scheduler.lock();
            scheduler.commit_batch(batch);
            scheduler.highest_committed()
        };
        debug!("entity {}: batch {batch} committed", self.id);
        self.publish_watermark(watermark);
    }

    fn publish_watermark(&self, watermark: BatchId) {
        self.watermark.send_if_modified(|current| {
            if watermark > *current {
                *current = watermark;
                true
            } else {
                false
            }
        });
    }

    /// Turn promise for one access of `ctx` at this entity.
    pub(crate) fn wait_turn(&self, ctx: &TransactionContext) -> Result<Turn> {
        let mut scheduler = self.scheduler.lock();
        if ctx.deterministic {
            scheduler.wait_det(ctx.batch_id, ctx.txn_id)
        } else {
            Ok(scheduler.wait_act(ctx.txn_id))
        }
    }

    /// Finishes one deterministic access. When this exhausts the batch at
    /// this entity, the post-batch state hook fires and completion is
    /// acknowledged to the owning coordinator.
    pub(crate) fn ack_access(&self, ctx: &TransactionContext) -> Result<()> {
        let done = self.scheduler.lock().ack_det(ctx.batch_id, ctx.txn_id)?;
        if done.switching_batches {
            let state = self.store.lock().committed().snapshot();
            if let Err(err) = self
                .commit_log
                .record_batch_state(self.id, ctx.batch_id, state)
            {
                warn!("entity {}: batch state hook failed: {err}", self.id);
            }
            match self.ring.get(done.coordinator) {
                Some(coordinator) => coordinator.ack_batch_completion(ctx.batch_id),
                None => warn!(
                    "entity {}: batch {} owned by unknown coordinator {}",
                    self.id, ctx.batch_id, done.coordinator
                ),
            }
        }
        Ok(())
    }

    /// Consumes `count` declared-but-unused accesses so the batch never
    /// stalls on a transaction that touched this entity less than declared.
    pub(crate) async fn flush_accesses(&self, ctx: &TransactionContext, count: u32) -> Result<()> {
        for _ in 0..count {
            let turn = self.wait_turn(ctx)?;
            turn.acquired().await?;
            self.ack_access(ctx)?;
        }
        Ok(())
    }

    /// Commit promise for a deterministic batch, resolved by the scheduler.
    pub(crate) fn batch_commit_promise(&self, batch: BatchId) -> Result<Turn> {
        self.scheduler.lock().wait_batch_commit(batch)
    }

    /// Resolves once this entity's commit watermark covers `batch`.
    pub(crate) async fn wait_batch_committed(&self, batch: BatchId) -> Result<()> {
        let mut rx = self.watermark.subscribe();
        rx.wait_for(|watermark| *watermark >= batch)
            .await
            .map(|_| ())
            .map_err(|_| TxnError::Internal("entity watermark channel closed".into()))
    }

    /// Ordering facts for a non-deterministic transaction's window here.
    pub(crate) fn before_after(&self, txn: TxnId) -> Result<BeforeAfter> {
        self.scheduler.lock().before_after(txn)
    }

    /// Phase-one vote for a non-deterministic transaction. A writing
    /// participant that votes yes persists its prepared state first; a hook
    /// failure counts as a failed prepare.
    pub(crate) fn prepare_act(&self, txn: TxnId, is_writer: bool) -> Result<bool> {
        let (vote, prepared) = {
            let mut store = self.store.lock();
            let vote = store.prepare(txn, is_writer);
            let prepared = if vote && is_writer {
                Some(store.write(txn).snapshot())
            } else {
                None
            };
            (vote, prepared)
        };
        if let Some(state) = prepared {
            self.commit_log.record_prepared(txn, self.id, state)?;
        }
        Ok(vote)
    }

    /// Phase-two commit plus release of the transaction's window slot.
    pub(crate) fn commit_act(&self, txn: TxnId) {
        self.store.lock().commit(txn);
        self.scheduler.lock().act_finished(txn);
    }

    /// Phase-two abort. Idempotent and infallible; safe to call for a
    /// transaction that never reached this entity's store.
    pub(crate) fn abort_act(&self, txn: TxnId) {
        self.store.lock().abort(txn);
        self.scheduler.lock().act_finished(txn);
    }

    /// Deterministic read: committed state, no speculative copy.
    pub(crate) fn committed_state(&self) -> S {
        self.store.lock().committed().clone()
    }

    /// Deterministic in-place update of committed state.
    pub(crate) fn update_committed<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(self.store.lock().committed_mut())
    }

    /// Non-deterministic read through the concurrency-control strategy.
    pub(crate) fn speculative_read(&self, txn: TxnId) -> Result<S> {
        self.store.lock().read(txn)
    }

    /// Non-deterministic update of the transaction's speculative copy.
    pub(crate) fn update_speculative<R>(&self, txn: TxnId, f: impl FnOnce(&mut S) -> R) -> R {
        f(self.store.lock().write(txn))
    }
}
