//! Engine error taxonomy.
//!
//! Most store operations return `anyhow::Result`; this enum exists for the
//! failure classes callers must branch on rather than just report.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or misordered threshold configuration. Metrics affected by
    /// this degrade to `unknown` status, never to green.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A uniqueness constraint rejected a write. Callers treat this as
    /// "already handled" success, not failure.
    #[error("duplicate write: {0}")]
    DuplicateWrite(String),

    /// The voice-call provider was unreachable or rejected the request.
    #[error("external capability error: {0}")]
    ExternalCapability(String),

    /// The store's escalation level changed between read and commit.
    /// The transition must be aborted and re-evaluated from a fresh read.
    #[error("stale state for store {store_id}: expected level {expected}, found {found}")]
    StaleState {
        store_id: i64,
        expected: i64,
        found: i64,
    },
}

/// Whether a sqlx error is a unique-constraint violation.
///
/// The uniqueness invariants on alerts, snapshots, and ai_calls are enforced
/// at the storage layer; this is how the application layer recognizes the
/// constraint firing so it can treat the write as already handled.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}
