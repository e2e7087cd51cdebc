//! Pluggable per-entity concurrency control for non-deterministic access.
//!
//! Deterministic transactions never come through here: their order is already
//! total, so they read and write the committed state directly under the
//! scheduler's turn discipline. Non-deterministic transactions get a
//! speculative per-transaction copy and a prepare/commit/abort protocol.

/// Strict two-phase locking strategy.
pub mod locking;
/// Timestamp-ordering strategy.
pub mod timestamp;

use crate::EntityState;
use crate::context::TxnId;
use crate::errors::Result;

/// Per-entity protocol for non-deterministic reads and writes over committed
/// state plus in-flight speculative versions.
///
/// `abort` is idempotent and never fails toward the caller; presumed-abort
/// two-phase commit depends on that.
pub trait ConcurrencyControl<S: EntityState>: Send {
    /// Returns a working copy for `txn`. The first access clones the
    /// committed state; later accesses reuse the transaction's speculative
    /// copy.
    fn read(&mut self, txn: TxnId) -> Result<S>;

    /// Returns the speculative copy for mutation, creating it from the
    /// committed state on first access.
    fn write(&mut self, txn: TxnId) -> &mut S;

    /// Phase-one vote: locks or validates according to the strategy.
    /// `false` means conflict; the coordinator must abort everywhere.
    fn prepare(&mut self, txn: TxnId, is_writer: bool) -> bool;

    /// Applies the speculative copy to committed state and releases
    /// bookkeeping.
    fn commit(&mut self, txn: TxnId);

    /// Discards the speculative copy and releases bookkeeping.
    fn abort(&mut self, txn: TxnId);

    /// Committed state, for the deterministic bypass.
    fn committed(&self) -> &S;

    /// Mutable committed state, for the deterministic bypass.
    fn committed_mut(&mut self) -> &mut S;
}

/// Which concurrency-control strategy an entity runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcKind {
    /// Strict two-phase locking, acquired and validated at prepare.
    TwoPhaseLocking,
    /// Timestamp ordering keyed on transaction ids.
    TimestampOrdering,
}

impl CcKind {
    /// Builds a fresh store for one entity.
    pub fn new_store<S: EntityState>(self, initial: S) -> Box<dyn ConcurrencyControl<S>> {
        match self {
            CcKind::TwoPhaseLocking => Box::new(locking::TwoPhaseLocking::new(initial)),
            CcKind::TimestampOrdering => Box::new(timestamp::TimestampOrdering::new(initial)),
        }
    }
}

/// One transaction's in-flight speculative version.
#[derive(Debug, Clone)]
pub(crate) struct Speculative<S> {
    pub(crate) state: S,
    pub(crate) wrote: bool,
    /// Committed-state version the copy was cloned from. Prepare rejects the
    /// transaction when the committed state has moved past it since.
    pub(crate) base_version: u64,
}

impl<S: Clone> Speculative<S> {
    pub(crate) fn from_committed(committed: &S, version: u64) -> Self {
        Self {
            state: committed.clone(),
            wrote: false,
            base_version: version,
        }
    }
}
