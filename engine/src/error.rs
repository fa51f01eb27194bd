//! Error types for the Hearth engine.

use crate::entity::{Collection, RecordKey};
use thiserror::Error;

/// All possible errors from the Hearth engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Addressing errors
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("invalid id '{id}' for collection {collection}")]
    InvalidKey { collection: Collection, id: String },

    // Resolution errors
    #[error("cannot resolve {local} against {remote}: keys differ")]
    KeyMismatch { local: RecordKey, remote: RecordKey },

    // Integrity errors
    #[error("foreign key violation: {child} references missing {parent}")]
    ForeignKeyViolation { child: RecordKey, parent: RecordKey },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
