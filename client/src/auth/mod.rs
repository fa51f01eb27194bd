//! Offline credential management.
//!
//! After one successful remote login a user can enable offline login with a
//! PIN. The PIN is stored only as an Argon2id hash on the local profile, and
//! a successful offline login opens a session that lasts a bounded time
//! (seven days by default) regardless of whether the remote identity service
//! is reachable.

mod offline;
mod secret;
mod service;

pub use offline::OfflineAuthenticator;
pub use secret::{hash_pin, verify_pin, KdfParams};
pub use service::CredentialManager;

use crate::error::ErrorCode;
use crate::store::StoreError;
use hearth_engine::{Timestamp, UserId, UserProfile};
use serde::{Deserialize, Serialize};

/// Message for every failed credential check. It never says whether the user
/// or the PIN was wrong.
pub(crate) const INVALID_CREDENTIAL_MESSAGE: &str = "Invalid credentials";

/// Credential errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("No active remote session for this user")]
    NotAuthenticated,

    #[error("Offline login is not set up on this device")]
    NotAvailable,

    #[error("{}", INVALID_CREDENTIAL_MESSAGE)]
    InvalidCredential,

    #[error("Offline session expired")]
    SessionExpired,

    #[error("No offline session")]
    NoSession,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Hashing error: {0}")]
    Hashing(String),

    #[error("Credential manager unavailable")]
    Unavailable,
}

impl AuthError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::NotAuthenticated => ErrorCode::NotAuthenticated,
            AuthError::NotAvailable => ErrorCode::NotAvailable,
            AuthError::InvalidCredential => ErrorCode::InvalidCredential,
            AuthError::SessionExpired => ErrorCode::SessionExpired,
            AuthError::NoSession => ErrorCode::NoSession,
            AuthError::Storage(_) | AuthError::Hashing(_) | AuthError::Unavailable => {
                ErrorCode::Internal
            }
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        AuthError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(e: serde_json::Error) -> Self {
        AuthError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;

/// Serializable outcome of a credential operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<T>,
}

impl<T> AuthResponse<T> {
    pub fn into_result(self) -> std::result::Result<Option<T>, ErrorCode> {
        match self.code {
            Some(code) if !self.success => Err(code),
            _ => Ok(self.payload),
        }
    }
}

impl<T> From<Result<T>> for AuthResponse<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(payload) => Self {
                success: true,
                code: None,
                message: "OK".to_string(),
                payload: Some(payload),
            },
            Err(e) => Self {
                success: false,
                code: Some(e.code()),
                message: e.to_string(),
                payload: None,
            },
        }
    }
}

/// What an offline login reveals about the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineUser {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub photo_ref: Option<String>,
}

impl From<&UserProfile> for OfflineUser {
    fn from(profile: &UserProfile) -> Self {
        Self {
            id: profile.id.clone(),
            name: profile.name.clone(),
            email: profile.email.clone(),
            photo_ref: profile.photo_ref.clone(),
        }
    }
}

/// Session details returned by a successful check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineSession {
    pub user_id: UserId,
    pub started_at: Timestamp,
    pub expires_at: Timestamp,
}

/// Offline login state of this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthState {
    /// Offline login has never been enabled, or was disabled
    Uninitialized,
    LoggedOut,
    LoggedIn,
}
