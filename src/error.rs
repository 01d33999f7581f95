//! Crate-wide error types.
//!
//! Two surfaces:
//!
//! * [`StoreError`] — everything the storage and index layers can fail with.
//!   Lookup misses are **not** errors: lookups return `Option` / empty `Vec`.
//!   Unique-key conflicts on the idempotent insert paths are treated as
//!   success with the existing id and never reach the caller.
//!
//! * [`ModelError`] — failures of the external collaborators (embedding
//!   model, query planner, answer planner). These are retried with
//!   exponential backoff where the contract allows; exhaustion is reported
//!   as [`StoreError::Dependency`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Empty or malformed argument, e.g. an empty string handed to the
    /// string dictionary. Surfaced to the caller without retry.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A stored blob failed validation (wrong-length embedding, undecodable
    /// JSON object). Scoped to the single offending row; other rows remain
    /// readable.
    #[error("corrupt data in {table}: {detail}")]
    CorruptData { table: String, detail: String },

    /// An external collaborator kept failing after the retry budget was
    /// spent.
    #[error("dependency failure: {0}")]
    Dependency(String),

    /// Cooperative cancellation was signalled through the caller's token.
    #[error("operation cancelled")]
    Cancelled,

    /// The database is unreadable or carries an unsupported schema version.
    /// Not retried; the owning handle should be discarded.
    #[error("fatal storage error: {0}")]
    Fatal(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure of an external collaborator call.
///
/// Collaborators are treated as pure functions with possibly-failing I/O;
/// the variants say *which* collaborator failed, the payload says why.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("embedding model failed: {0}")]
    Embedding(String),

    #[error("query planner failed: {0}")]
    Planner(String),

    #[error("answer planner failed: {0}")]
    Answer(String),

    /// The answer planner had neither evidence chunks nor usable history.
    #[error("no evidence available to answer from")]
    NoEvidence,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn invalid_input_display() {
        let e = StoreError::InvalidInput("empty text".into());
        assert!(e.to_string().contains("empty text"));
    }

    #[test]
    fn corrupt_data_names_table() {
        let e = StoreError::CorruptData {
            table: "keywords_embeddings".into(),
            detail: "blob length 7 is not a multiple of 4".into(),
        };
        assert!(e.to_string().contains("keywords_embeddings"));
        assert!(e.to_string().contains("multiple of 4"));
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let e: StoreError = io_err.into();
        assert!(e.to_string().contains("io error"));
        let _: &dyn Error = &e;
    }

    #[test]
    fn sqlite_error_converts() {
        let sq = rusqlite::Error::QueryReturnedNoRows;
        let e: StoreError = sq.into();
        assert!(e.to_string().contains("storage error"));
    }

    #[test]
    fn model_error_display() {
        assert!(
            ModelError::Embedding("timeout".into())
                .to_string()
                .contains("timeout")
        );
        assert!(ModelError::NoEvidence.to_string().contains("no evidence"));
    }
}
