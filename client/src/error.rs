//! Unified error handling for the client.

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::remote::RemoteError;
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable, serializable names for everything that can go wrong.
///
/// These cross the boundary to the UI layer, so their serialized form never
/// changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotAuthenticated,
    NotAvailable,
    InvalidCredential,
    SessionExpired,
    NoSession,
    NetworkTimeout,
    PartialSyncFailure,
    /// Not an error: the cache holds nothing usable for the key.
    CacheMiss,
    ForeignKeyViolation,
    Offline,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotAuthenticated => "NOT_AUTHENTICATED",
            ErrorCode::NotAvailable => "NOT_AVAILABLE",
            ErrorCode::InvalidCredential => "INVALID_CREDENTIAL",
            ErrorCode::SessionExpired => "SESSION_EXPIRED",
            ErrorCode::NoSession => "NO_SESSION",
            ErrorCode::NetworkTimeout => "NETWORK_TIMEOUT",
            ErrorCode::PartialSyncFailure => "PARTIAL_SYNC_FAILURE",
            ErrorCode::CacheMiss => "CACHE_MISS",
            ErrorCode::ForeignKeyViolation => "FOREIGN_KEY_VIOLATION",
            ErrorCode::Offline => "OFFLINE",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Engine error: {0}")]
    Engine(#[from] hearth_engine::Error),

    #[error("{0} has shut down")]
    Shutdown(&'static str),
}

impl Error {
    /// The taxonomy code for this error, when it has one.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Store(e) => e.code(),
            Error::Remote(e) => e.code(),
            Error::Auth(e) => e.code(),
            Error::Engine(hearth_engine::Error::ForeignKeyViolation { .. }) => {
                ErrorCode::ForeignKeyViolation
            }
            _ => ErrorCode::Internal,
        }
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_engine::RecordKey;

    #[test]
    fn codes_serialize_screaming() {
        let json = serde_json::to_string(&ErrorCode::ForeignKeyViolation).unwrap();
        assert_eq!(json, "\"FOREIGN_KEY_VIOLATION\"");
        let json = serde_json::to_string(&ErrorCode::NoSession).unwrap();
        assert_eq!(json, format!("\"{}\"", ErrorCode::NoSession));
    }

    #[test]
    fn engine_fk_maps_to_code() {
        let err = Error::from(hearth_engine::Error::ForeignKeyViolation {
            child: RecordKey::device("d"),
            parent: RecordKey::room("r"),
        });
        assert_eq!(err.code(), ErrorCode::ForeignKeyViolation);
        assert_eq!(Error::Shutdown("cache").code(), ErrorCode::Internal);
    }
}
