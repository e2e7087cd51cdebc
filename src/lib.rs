pub mod errors;
pub mod context;
pub mod config;
pub mod cc;
pub mod scheduler;
pub mod storage;
pub mod registry;
pub mod entity;
pub mod coordinator;
pub mod runtime;

// Re-export key types and structs for easier access
pub use cc::{CcKind, ConcurrencyControl};
pub use config::RingConfig;
pub use context::{
    BatchId, CoordinatorId, EntityId, FunctionCall, FunctionResult, NO_BATCH, Payload,
    TransactionContext, TxnId, TxnOutcome,
};
pub use coordinator::BatchToken;
pub use entity::Entity;
pub use errors::{Result, TxnError};
pub use registry::{CallFuture, EntityFunction, FunctionRegistry};
pub use runtime::{Runtime, RuntimeBuilder, TxnExecution, check_serializability};
pub use storage::{CommitLog, NoopCommitLog};

/// State carried by one entity.
///
/// `Clone` backs the speculative copies of non-deterministic transactions,
/// `Default` seeds entities declared without an explicit initial state, and
/// [`EntityState::snapshot`] feeds the persistence hooks. The default
/// snapshot is empty, which is fine when the hooks are no-ops.
pub trait EntityState: Clone + Default + Send + 'static {
    /// Opaque serialized form handed to the [`CommitLog`] hooks.
    fn snapshot(&self) -> Payload {
        Payload::new()
    }
}
