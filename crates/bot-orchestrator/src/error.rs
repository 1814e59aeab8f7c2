use delta_hedge_lock::LockError;
use delta_hedge_state::StateError;
use thiserror::Error;

/// Terminal outcomes of the orchestrator.
///
/// `LockContended` and `LockLost` are the only conditions that should end
/// the process; the composition root decides the actual exit. Everything
/// transient is absorbed inside the cycle loop.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Another instance already holds the lock; this one must not run.
    #[error("another instance already holds the lock for '{resource}'")]
    LockContended { resource: String },

    /// Ownership was lost mid-run. Continuing would risk two live
    /// controllers acting on the same position.
    #[error("lock ownership lost for '{resource}'; stopping to avoid split-brain")]
    LockLost { resource: String },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    State(#[from] StateError),
}
