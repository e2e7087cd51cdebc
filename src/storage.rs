use crate::context::{BatchId, EntityId, Payload, TxnId};
use crate::errors::Result;

/// Hook trait for the logging/persistence collaborator.
///
/// The engine calls these at four points and specifies nothing about the
/// storage format: before two-phase-commit prepare (participant set), after a
/// writing participant prepares (its prepared state), after commit (commit
/// record), and when a deterministic batch completes at an entity (post-batch
/// state). Implementations must be `Send` and `Sync`; they are invoked
/// concurrently from many transactions.
pub trait CommitLog: Send + Sync {
    /// Records the participant set of a non-deterministic transaction before
    /// prepare begins.
    fn record_participants(&self, txn_id: TxnId, participants: &[EntityId]) -> Result<()>;

    /// Persists a writing participant's prepared state.
    fn record_prepared(&self, txn_id: TxnId, entity: EntityId, state: Payload) -> Result<()>;

    /// Appends a commit record once every participant has committed.
    fn record_commit(&self, txn_id: TxnId) -> Result<()>;

    /// Appends an entity's state after it finished a deterministic batch.
    fn record_batch_state(&self, entity: EntityId, batch_id: BatchId, state: Payload)
    -> Result<()>;
}

/// Default hook that drops everything. Durability is an external concern.
#[derive(Debug, Default)]
pub struct NoopCommitLog;

impl CommitLog for NoopCommitLog {
    fn record_participants(&self, _txn_id: TxnId, _participants: &[EntityId]) -> Result<()> {
        Ok(())
    }

    fn record_prepared(&self, _txn_id: TxnId, _entity: EntityId, _state: Payload) -> Result<()> {
        Ok(())
    }

    fn record_commit(&self, _txn_id: TxnId) -> Result<()> {
        Ok(())
    }

    fn record_batch_state(
        &self,
        _entity: EntityId,
        _batch_id: BatchId,
        _state: Payload,
    ) -> Result<()> {
        Ok(())
    }
}
