use ahash::AHashMap as HashMap;
use log::debug;

use crate::EntityState;
use crate::cc::{ConcurrencyControl, Speculative};
use crate::context::TxnId;
use crate::errors::Result;

/// Timestamp ordering keyed on transaction ids.
///
/// A transaction's id doubles as its timestamp. Reads advance the high read
/// mark; writer commits advance the high write mark. Prepare validates that
/// no higher-timestamp transaction already read or wrote this entity, and
/// that the committed state has not moved since the transaction cloned its
/// speculative copy, so the commit order agrees with the timestamp order and
/// no committed write is silently overwritten.
pub struct TimestampOrdering<S> {
    committed: S,
    /// Bumped on every committed write; stale speculative copies are caught
    /// by comparing against it at prepare.
    version: u64,
    copies: HashMap<TxnId, Speculative<S>>,
    max_read_ts: TxnId,
    max_write_ts: TxnId,
}

impl<S: EntityState> TimestampOrdering<S> {
    pub fn new(initial: S) -> Self {
        Self {
            committed: initial,
            version: 0,
            copies: HashMap::new(),
            max_read_ts: 0,
            max_write_ts: 0,
        }
    }
}

impl<S: EntityState> ConcurrencyControl<S> for TimestampOrdering<S> {
    fn read(&mut self, txn: TxnId) -> Result<S> {
        self.max_read_ts = self.max_read_ts.max(txn);
        let copy = self
            .copies
            .entry(txn)
            .or_insert_with(|| Speculative::from_committed(&self.committed, self.version));
        Ok(copy.state.clone())
    }

    fn write(&mut self, txn: TxnId) -> &mut S {
        // A blind write still reads the committed state it clones from.
        self.max_read_ts = self.max_read_ts.max(txn);
        let copy = self
            .copies
            .entry(txn)
            .or_insert_with(|| Speculative::from_committed(&self.committed, self.version));
        copy.wrote = true;
        &mut copy.state
    }

    fn prepare(&mut self, txn: TxnId, is_writer: bool) -> bool {
        if let Some(copy) = self.copies.get(&txn) {
            if copy.base_version != self.version {
                debug!(
                    "prepare rejected for txn {txn}: copy from version {} but committed is {}",
                    copy.base_version, self.version
                );
                return false;
            }
        }
        if txn < self.max_write_ts {
            debug!(
                "prepare rejected for txn {txn}: write with ts {} already applied",
                self.max_write_ts
            );
            return false;
        }
        if is_writer && txn < self.max_read_ts {
            debug!(
                "prepare rejected for writer txn {txn}: read with ts {} already recorded",
                self.max_read_ts
            );
            return false;
        }
        true
    }

    fn commit(&mut self, txn: TxnId) {
        if let Some(copy) = self.copies.remove(&txn) {
            if copy.wrote {
                self.committed = copy.state;
                self.version += 1;
                self.max_write_ts = self.max_write_ts.max(txn);
            }
        }
    }

    fn abort(&mut self, txn: TxnId) {
        // Idempotent; timestamp marks are left in place, which only makes
        // later validation more conservative, never incorrect.
        self.copies.remove(&txn);
    }

    fn committed(&self) -> &S {
        &self.committed
    }

    fn committed_mut(&mut self) -> &mut S {
        &mut self.committed
    }
}
