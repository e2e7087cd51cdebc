use ahash::AHashMap as HashMap;
use futures::future::join_all;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::EntityState;
use crate::cc::CcKind;
use crate::config::RingConfig;
use crate::context::{
    BatchId, EntityId, FunctionCall, FunctionResult, NO_BATCH, Payload, TransactionContext,
    TxnOutcome,
};
use crate::coordinator::{BatchToken, Coordinator, CoordinatorHandle};
use crate::entity::Entity;
use crate::errors::{Result, TxnError};
use crate::registry::FunctionRegistry;
use crate::storage::{CommitLog, NoopCommitLog};

/// Everything the drivers and nested calls need to reach: the entity
/// directory, the ring, and the ambient configuration.
struct Shared<S: EntityState> {
    entities: Arc<HashMap<EntityId, Arc<Entity<S>>>>,
    ring: Vec<CoordinatorHandle>,
    config: RingConfig,
    commit_log: Arc<dyn CommitLog>,
    round_robin: AtomicUsize,
}

impl<S: EntityState> Shared<S> {
    fn pick_coordinator(&self) -> &CoordinatorHandle {
        let slot = self.round_robin.fetch_add(1, Ordering::Relaxed) % self.ring.len();
        &self.ring[slot]
    }

    fn entity(&self, id: EntityId) -> Result<Arc<Entity<S>>> {
        self.entities
            .get(&id)
            .cloned()
            .ok_or_else(|| TxnError::Configuration(format!("unknown entity {id}")))
    }
}

/// Builds a [`Runtime`]: entities, their initial state, the function
/// registry, the concurrency-control strategy, and the ring configuration.
///
/// Configuration is injected exactly once; a second `configure` call is
/// rejected rather than silently replacing ring parameters.
pub struct RuntimeBuilder<S: EntityState> {
    registry: Arc<FunctionRegistry<S>>,
    config: Option<RingConfig>,
    cc: CcKind,
    commit_log: Arc<dyn CommitLog>,
    entities: Vec<(EntityId, S)>,
}

impl<S: EntityState> RuntimeBuilder<S> {
    pub fn new(registry: FunctionRegistry<S>) -> Self {
        Self {
            registry: Arc::new(registry),
            config: None,
            cc: CcKind::TwoPhaseLocking,
            commit_log: Arc::new(NoopCommitLog),
            entities: Vec::new(),
        }
    }

    /// Injects the ring configuration. Fails on a repeated call.
    pub fn configure(mut self, config: RingConfig) -> Result<Self> {
        if self.config.is_some() {
            return Err(TxnError::Configuration(
                "ring configuration was already injected".into(),
            ));
        }
        config.validate()?;
        self.config = Some(config);
        Ok(self)
    }

    /// Picks the concurrency-control strategy shared by all entities.
    pub fn concurrency_control(mut self, cc: CcKind) -> Self {
        self.cc = cc;
        self
    }

    /// Installs the logging/persistence hook collaborator.
    pub fn commit_log(mut self, log: Arc<dyn CommitLog>) -> Self {
        self.commit_log = log;
        self
    }

    /// Declares an entity and its initial state.
    pub fn entity(mut self, id: EntityId, initial: S) -> Self {
        self.entities.push((id, initial));
        self
    }

    /// Declares an entity seeded with `S::default()`.
    pub fn entity_default(mut self, id: EntityId) -> Self {
        self.entities.push((id, S::default()));
        self
    }

    /// Wires the ring and spawns the coordinator tasks. Must run inside a
    /// tokio runtime. The token is injected at ring position zero.
    pub fn build(self) -> Result<Runtime<S>> {
        let config = match self.config {
            Some(config) => config,
            None => RingConfig::default(),
        };
        if self.entities.is_empty() {
            return Err(TxnError::Configuration(
                "at least one entity must be declared".into(),
            ));
        }

        let (ring, pending) = Coordinator::<S>::ring(&config);
        let mut entities = HashMap::with_capacity(self.entities.len());
        for (id, initial) in self.entities {
            if entities.contains_key(&id) {
                return Err(TxnError::Configuration(format!(
                    "entity {id} declared twice"
                )));
            }
            let entity = Entity::new(
                id,
                initial,
                self.cc,
                self.registry.clone(),
                ring.clone(),
                self.commit_log.clone(),
            );
            entities.insert(id, entity);
        }
        let entities = Arc::new(entities);

        let mut tasks = Vec::with_capacity(config.ring_size);
        for inbox in pending {
            let coordinator =
                Coordinator::new(inbox, config.clone(), ring.clone(), entities.clone());
            tasks.push(tokio::spawn(coordinator.run()));
        }
        ring[0].forward_token(BatchToken::new());
        debug!(
            "runtime up: {} entities, ring of {}",
            entities.len(),
            config.ring_size
        );

        Ok(Runtime {
            shared: Arc::new(Shared {
                entities,
                ring,
                config,
                commit_log: self.commit_log,
                round_robin: AtomicUsize::new(0),
            }),
            tasks,
        })
    }
}

/// The running engine. Dropping it detaches the coordinator tasks; call
/// [`Runtime::shutdown`] to stop them.
pub struct Runtime<S: EntityState> {
    shared: Arc<Shared<S>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: EntityState> Runtime<S> {
    /// Dispatcher: a declared access set selects the deterministic path.
    pub async fn start_transaction(
        &self,
        entity: EntityId,
        call: FunctionCall,
        accesses: Option<HashMap<EntityId, u32>>,
    ) -> TxnOutcome {
        match accesses {
            Some(accesses) => self.start_deterministic(entity, call, accesses).await,
            None => self.start_non_deterministic(entity, call).await,
        }
    }

    /// Runs one deterministic transaction end to end and resolves once its
    /// batch has committed. Business failures still commit the batch and are
    /// carried in the outcome.
    pub async fn start_deterministic(
        &self,
        entity: EntityId,
        call: FunctionCall,
        accesses: HashMap<EntityId, u32>,
    ) -> TxnOutcome {
        match self.run_deterministic(entity, call, accesses).await {
            Ok(outcome) => outcome,
            Err(err) => TxnOutcome {
                txn_id: 0,
                error: Some(err),
                output: None,
            },
        }
    }

    async fn run_deterministic(
        &self,
        entity: EntityId,
        call: FunctionCall,
        accesses: HashMap<EntityId, u32>,
    ) -> Result<TxnOutcome> {
        if accesses.get(&entity).copied().unwrap_or(0) == 0 {
            return Err(TxnError::Configuration(format!(
                "entry entity {entity} is missing from the declared accesses"
            )));
        }
        for declared in accesses.keys() {
            self.shared.entity(*declared)?;
        }

        let coordinator = self.shared.pick_coordinator();
        let ctx = coordinator.request_pact(accesses).await?;
        debug!(
            "txn {} admitted into batch {} at entity {entity}",
            ctx.txn_id, ctx.batch_id
        );

        let mut exec = TxnExecution::new(self.shared.clone(), ctx.clone());
        let run = exec.call(entity, &call.function, call.input).await;

        // Consume declared accesses the call tree never used, so the batch
        // completes even when the business logic bailed out early.
        for (declared_entity, declared) in &ctx.accesses {
            let used = exec
                .result
                .participants
                .get(declared_entity)
                .map(|p| p.calls)
                .unwrap_or(0);
            if used < *declared {
                let target = self.shared.entity(*declared_entity)?;
                target.flush_accesses(&ctx, *declared - used).await?;
            }
        }

        let entry = self.shared.entity(entity)?;
        let promise = entry.batch_commit_promise(ctx.batch_id)?;
        promise.acquired().await?;

        let (output, error) = match run {
            Ok(payload) => (Some(payload), exec.result.exception.clone()),
            Err(err) => (None, Some(err)),
        };
        Ok(TxnOutcome {
            txn_id: ctx.txn_id,
            error,
            output,
        })
    }

    /// Runs one non-deterministic transaction: execute against speculative
    /// copies, then two-phase commit gated by the serializability check.
    pub async fn start_non_deterministic(&self, entity: EntityId, call: FunctionCall) -> TxnOutcome {
        let coordinator = self.shared.pick_coordinator();
        let ctx = match coordinator.request_act().await {
            Ok(ctx) => ctx,
            Err(err) => {
                return TxnOutcome {
                    txn_id: 0,
                    error: Some(err),
                    output: None,
                };
            }
        };
        let txn_id = ctx.txn_id;
        let mut exec = TxnExecution::new(self.shared.clone(), ctx);
        let run = exec.call(entity, &call.function, call.input).await;
        match self.finish_non_deterministic(&mut exec, run).await {
            Ok(output) => TxnOutcome {
                txn_id,
                error: None,
                output: Some(output),
            },
            Err(err) => TxnOutcome {
                txn_id,
                error: Some(err),
                output: None,
            },
        }
    }

    /// The commit protocol of one executed non-deterministic transaction.
    /// Presumed abort: any failure on the way aborts every participant and
    /// reports the first error.
    async fn finish_non_deterministic(
        &self,
        exec: &mut TxnExecution<S>,
        run: Result<Payload>,
    ) -> Result<Payload> {
        let txn_id = exec.ctx.txn_id;
        let participants: Vec<(Arc<Entity<S>>, bool)> = {
            let mut list = Vec::with_capacity(exec.result.participants.len());
            for (id, participation) in &exec.result.participants {
                list.push((self.shared.entity(*id)?, participation.writes));
            }
            list
        };

        let payload = match run {
            Ok(payload) => payload,
            Err(err) => {
                self.abort_everywhere(txn_id, &participants);
                return Err(err);
            }
        };

        let ids: Vec<EntityId> = participants.iter().map(|(e, _)| e.id()).collect();
        if let Err(err) = self.shared.commit_log.record_participants(txn_id, &ids) {
            self.abort_everywhere(txn_id, &participants);
            return Err(err);
        }

        for (participant, _) in &participants {
            let facts = match participant.before_after(txn_id) {
                Ok(facts) => facts,
                Err(err) => {
                    self.abort_everywhere(txn_id, &participants);
                    return Err(err);
                }
            };
            exec.result.absorb_ordering(participant.id(), &facts);
        }
        let watermark = participants
            .iter()
            .map(|(e, _)| e.highest_committed())
            .max()
            .unwrap_or(NO_BATCH);
        if let Err(err) = check_serializability(&exec.result, watermark) {
            debug!("txn {txn_id} failed the ordering check: {err}");
            self.abort_everywhere(txn_id, &participants);
            return Err(err);
        }

        let votes = join_all(
            participants
                .iter()
                .map(|(participant, writes)| async move { participant.prepare_act(txn_id, *writes) }),
        )
        .await;
        for vote in votes {
            match vote {
                Ok(true) => {}
                Ok(false) => {
                    self.abort_everywhere(txn_id, &participants);
                    return Err(TxnError::PrepareRejected);
                }
                Err(err) => {
                    self.abort_everywhere(txn_id, &participants);
                    return Err(err);
                }
            }
        }

        join_all(
            participants
                .iter()
                .map(|(participant, _)| async move { participant.commit_act(txn_id) }),
        )
        .await;
        if let Err(err) = self.shared.commit_log.record_commit(txn_id) {
            warn!("txn {txn_id}: commit record hook failed after commit: {err}");
        }
        debug!("txn {txn_id} committed via two-phase commit");

        // Do not report success before the deterministic batches this
        // transaction is ordered after are themselves committed.
        if exec.result.max_before > watermark {
            if let Some(entity_id) = exec.result.max_before_entity {
                self.shared
                    .entity(entity_id)?
                    .wait_batch_committed(exec.result.max_before)
                    .await?;
            }
        }
        Ok(payload)
    }

    fn abort_everywhere(&self, txn_id: u64, participants: &[(Arc<Entity<S>>, bool)]) {
        for (participant, _) in participants {
            participant.abort_act(txn_id);
        }
    }

    /// Stops the coordinator tasks. In-flight transactions fail with
    /// internal errors once the ring is gone.
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Decides whether a non-deterministic transaction may commit given the
/// before/after ordering facts gathered from every participant and a commit
/// watermark known to be reached.
///
/// Serializable when nothing was ordered before it, when everything before
/// it already committed, or when the earliest batch after it is the direct
/// global successor of the latest batch before it (no gap a missed batch
/// could hide in). A batch ordered both before and after is a hard
/// violation; anything else is merely unprovable and aborts conservatively.
pub fn check_serializability(result: &FunctionResult, watermark: BatchId) -> Result<()> {
    if result.before_set.is_empty() {
        return Ok(());
    }
    if result.min_after != BatchId::MAX && result.max_before >= result.min_after {
        return Err(TxnError::NotSerializable);
    }
    if result.max_before <= watermark {
        return Ok(());
    }
    if result.min_after != BatchId::MAX && result.min_after_global_pred == result.max_before {
        return Ok(());
    }
    Err(TxnError::NotSureSerializable)
}

/// Execution handle threaded through an entity function's call tree.
///
/// Holds the transaction context and the accumulated [`FunctionResult`];
/// nested calls and state accesses all flow through it, which is what lets
/// the engine reconcile ordering facts across entities afterwards.
///
/// Calls of one deterministic transaction run strictly in order, so a
/// deterministic function must not call back into an entity that is still
/// executing an earlier call of the same transaction.
pub struct TxnExecution<S: EntityState> {
    shared: Arc<Shared<S>>,
    ctx: TransactionContext,
    pub(crate) result: FunctionResult,
    current: Option<Arc<Entity<S>>>,
}

impl<S: EntityState> TxnExecution<S> {
    fn new(shared: Arc<Shared<S>>, ctx: TransactionContext) -> Self {
        Self {
            shared,
            ctx,
            result: FunctionResult::new(),
            current: None,
        }
    }

    pub fn txn_id(&self) -> u64 {
        self.ctx.txn_id
    }

    pub fn is_deterministic(&self) -> bool {
        self.ctx.deterministic
    }

    /// Invokes `function` at `entity`, waiting for the scheduler turn the
    /// transaction is entitled to there. The entry call and every nested
    /// call go through here.
    pub async fn call(
        &mut self,
        entity_id: EntityId,
        function: &str,
        input: Payload,
    ) -> Result<Payload> {
        let entity = self.shared.entity(entity_id)?;
        let function = entity.registry().resolve(function)?;

        if self.ctx.deterministic {
            // An undeclared entity has no turn scheduled; waiting for one
            // would never resolve, so reject before touching the scheduler.
            if !self.ctx.accesses.contains_key(&entity_id) {
                return self.finish_call(Err(TxnError::Application(format!(
                    "transaction {} did not declare entity {entity_id}",
                    self.ctx.txn_id
                ))));
            }
            let turn = entity.wait_turn(&self.ctx)?;
            turn.acquired().await?;
            self.result.record_call(entity_id, false, false);

            let previous = self.current.replace(entity.clone());
            let output = (*function)(self, input).await;
            self.current = previous;

            let acked = entity.ack_access(&self.ctx);
            let payload = self.finish_call(output)?;
            acked?;
            Ok(payload)
        } else {
            // Register participation before waiting so an abort after a
            // deadlock timeout still reaches this entity.
            self.result.record_call(entity_id, false, false);
            let turn = entity.wait_turn(&self.ctx)?;
            match timeout(self.shared.config.deadlock_timeout, turn.acquired()).await {
                Ok(granted) => granted?,
                Err(_) => {
                    debug!("txn {}: turn wait timed out at entity {entity_id}", self.ctx.txn_id);
                    return self.finish_call(Err(TxnError::Deadlock));
                }
            }

            let previous = self.current.replace(entity.clone());
            let output = (*function)(self, input).await;
            self.current = previous;
            self.finish_call(output)
        }
    }

    /// Reads the current entity's state: committed directly on the
    /// deterministic path, through the concurrency-control strategy
    /// otherwise.
    pub fn read(&mut self) -> Result<S> {
        let entity = self.current_entity()?;
        if self.ctx.deterministic {
            Ok(entity.committed_state())
        } else {
            let state = entity.speculative_read(self.ctx.txn_id)?;
            self.mark_access(entity.id(), true, false);
            Ok(state)
        }
    }

    /// Mutates the current entity's state under the same split.
    pub fn update<R>(&mut self, f: impl FnOnce(&mut S) -> R) -> Result<R> {
        let entity = self.current_entity()?;
        if self.ctx.deterministic {
            Ok(entity.update_committed(f))
        } else {
            let value = entity.update_speculative(self.ctx.txn_id, f);
            self.mark_access(entity.id(), false, true);
            Ok(value)
        }
    }

    fn current_entity(&self) -> Result<Arc<Entity<S>>> {
        self.current
            .clone()
            .ok_or_else(|| TxnError::Internal("state access outside an entity function".into()))
    }

    fn mark_access(&mut self, entity: EntityId, read: bool, write: bool) {
        if let Some(p) = self.result.participants.get_mut(&entity) {
            p.reads |= read;
            p.writes |= write;
        }
    }

    fn finish_call(&mut self, output: Result<Payload>) -> Result<Payload> {
        if let Err(err) = &output {
            if self.result.exception.is_none() {
                self.result.exception = Some(err.clone());
            }
        }
        output
    }
}
