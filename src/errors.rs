use thiserror::Error;

/// The closed set of ways a transaction can fail.
///
/// Abort signaling and genuine faults are kept apart so callers can tell
/// retryable contention (`Deadlock`, `NotSerializable`, `NotSureSerializable`,
/// `PrepareRejected`) from logic errors (`Application`) and from setup
/// mistakes (`Configuration`, which is fatal and never retried).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxnError {
    /// Business logic signaled failure. A non-deterministic transaction
    /// aborts; a deterministic one still commits its batch and carries the
    /// failure in the result.
    #[error("application error: {0}")]
    Application(String),

    /// A non-deterministic wait on a scheduler turn exceeded the configured
    /// deadlock timeout; the transaction is forced to abort.
    #[error("deadlock suspected: turn wait exceeded the timeout")]
    Deadlock,

    /// The before/after-set check found an actual ordering violation.
    #[error("transaction is not serializable against the deterministic timeline")]
    NotSerializable,

    /// The before/after-set check could not prove an ordering; treated
    /// conservatively as an abort, reported distinctly for diagnostics.
    #[error("transaction serializability could not be established")]
    NotSureSerializable,

    /// A two-phase-commit participant voted no during prepare.
    #[error("a participant rejected the prepare request")]
    PrepareRejected,

    /// Invalid or duplicate setup (ring configuration, registry wiring).
    /// Fatal at startup/admission time.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A coordination channel closed unexpectedly.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, TxnError>;
