use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use log::debug;

use crate::EntityState;
use crate::cc::{ConcurrencyControl, Speculative};
use crate::context::TxnId;
use crate::errors::Result;

/// Strict two-phase locking over one entity's state slice.
///
/// The lock lives at entity granularity: shared for readers, exclusive for
/// writers, acquired at prepare and held until commit or abort. Prepare never
/// waits; an incompatible holder is an immediate negative vote. Because the
/// speculative copy is cloned before any lock exists, prepare also validates
/// that the committed state has not moved since the clone; a stale copy is a
/// negative vote and the transaction must abort and retry from fresh state.
pub struct TwoPhaseLocking<S> {
    committed: S,
    /// Bumped on every committed write; stale speculative copies are caught
    /// by comparing against it at prepare.
    version: u64,
    copies: HashMap<TxnId, Speculative<S>>,
    readers: HashSet<TxnId>,
    writer: Option<TxnId>,
}

impl<S: EntityState> TwoPhaseLocking<S> {
    pub fn new(initial: S) -> Self {
        Self {
            committed: initial,
            version: 0,
            copies: HashMap::new(),
            readers: HashSet::new(),
            writer: None,
        }
    }

    fn release(&mut self, txn: TxnId) {
        self.readers.remove(&txn);
        if self.writer == Some(txn) {
            self.writer = None;
        }
    }
}

impl<S: EntityState> ConcurrencyControl<S> for TwoPhaseLocking<S> {
    fn read(&mut self, txn: TxnId) -> Result<S> {
        let copy = self
            .copies
            .entry(txn)
            .or_insert_with(|| Speculative::from_committed(&self.committed, self.version));
        Ok(copy.state.clone())
    }

    fn write(&mut self, txn: TxnId) -> &mut S {
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
        if is_writer {
            let no_other_reader = self.readers.iter().all(|r| *r == txn);
            if no_other_reader && self.writer.is_none_or(|w| w == txn) {
                self.writer = Some(txn);
                true
            } else {
                debug!(
                    "prepare rejected for writer txn {txn}: lock held (writer={:?}, readers={})",
                    self.writer,
                    self.readers.len()
                );
                false
            }
        } else if self.writer.is_none_or(|w| w == txn) {
            self.readers.insert(txn);
            true
        } else {
            debug!(
                "prepare rejected for reader txn {txn}: exclusive lock held by {:?}",
                self.writer
            );
            false
        }
    }

    fn commit(&mut self, txn: TxnId) {
        if let Some(copy) = self.copies.remove(&txn) {
            if copy.wrote {
                self.committed = copy.state;
                self.version += 1;
            }
        }
        self.release(txn);
    }

    fn abort(&mut self, txn: TxnId) {
        // Idempotent: a second abort finds nothing to discard and no locks
        // held, and that is fine.
        self.copies.remove(&txn);
        self.release(txn);
    }

    fn committed(&self) -> &S {
        &self.committed
    }

    fn committed_mut(&mut self) -> &mut S {
        &mut self.committed
    }
}
