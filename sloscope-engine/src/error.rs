//! Error types for the experiment engine.
//!
//! Every fallible engine operation returns [`EngineError`]. The variants
//! partition failures by where they originate and how the engine reacts:
//! parse and predicate errors abort before any mutation, invariant and task
//! errors latch the experiment failure flag, and driver errors propagate
//! unchanged to the caller.

use thiserror::Error;

/// Error produced by the experiment engine and its collaborators.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed experiment spec: unknown task discriminator, missing task
    /// name and run command, malformed task inputs, or a malformed metric
    /// name. No experiment state is mutated.
    #[error("parse error: {0}")]
    Parse(String),

    /// A data-model invariant was violated: version count mismatch, metric
    /// metadata conflict, SLO limit conflict, or a type/value mismatch on a
    /// metric update.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// An `if` clause failed to compile or evaluate. Fatal for the
    /// experiment; the engine does not guess intent.
    #[error("predicate error: {0}")]
    Predicate(String),

    /// A task failed while running: script exited non-zero, a readiness
    /// deadline expired, or a collaborator reported an error.
    #[error("task error: {0}")]
    Task(String),

    /// The persistence driver failed to read or write the artifact.
    #[error("driver error: {0}")]
    Driver(String),
}

/// Convenience alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;
