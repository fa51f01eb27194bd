//! Remote authoritative store and identity.

mod http;
mod memory;

pub use http::HttpRemote;
pub use memory::MemoryRemote;

use crate::error::ErrorCode;
use async_trait::async_trait;
use hearth_engine::{Collection, HistoryId, Record, RecordKey, UserId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Remote errors.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Remote unavailable: {0}")]
    Unavailable(String),

    #[error("Remote rejected {key}: {reason}")]
    Rejected { key: RecordKey, reason: String },
}

impl RemoteError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RemoteError::Http(e) if e.is_timeout() => ErrorCode::NetworkTimeout,
            RemoteError::Status { status: 401, .. } => ErrorCode::NotAuthenticated,
            _ => ErrorCode::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Networked access to the authoritative copy of every collection.
///
/// Records crossing this boundary are always in their sync view: no dirty
/// flag, no local sync time, no local-only fields.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    async fn read(&self, key: &RecordKey) -> Result<Option<Record>>;

    /// Create or replace a record.
    async fn write(&self, record: &Record) -> Result<()>;

    /// Full enumeration, for the small collections.
    async fn list(&self, collection: Collection) -> Result<Vec<Record>>;

    /// Append to an append-only collection. Returns the remote's key.
    async fn push(&self, record: &Record) -> Result<String>;

    /// Append-only records with an id greater than `after`, ascending.
    async fn list_since(&self, collection: Collection, after: HistoryId) -> Result<Vec<Record>>;
}

/// The user the remote identity service has signed in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUser {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub photo_ref: Option<String>,
}

impl RemoteUser {
    /// A user known only by id.
    pub fn with_id(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            email: String::new(),
            photo_ref: None,
        }
    }
}

/// Source of the current remote session.
pub trait IdentityProvider: Send + Sync + 'static {
    fn current_user(&self) -> Option<RemoteUser>;
}

/// Identity set explicitly by whoever performed the remote login.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    user: RwLock<Option<RemoteUser>>,
}

impl StaticIdentity {
    pub fn new(user: Option<RemoteUser>) -> Self {
        Self {
            user: RwLock::new(user),
        }
    }

    pub fn sign_in(&self, user: RemoteUser) {
        tracing::info!(user_id = %user.id, "Remote session started");
        *self.user.write() = Some(user);
    }

    pub fn sign_out(&self) {
        if let Some(user) = self.user.write().take() {
            tracing::info!(user_id = %user.id, "Remote session ended");
        }
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> Option<RemoteUser> {
        self.user.read().clone()
    }
}
