//! Sync status, triggers and pass reports.

use crate::error::ErrorCode;
use chrono::{DateTime, Utc};
use hearth_engine::{Collection, RecordKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

/// Where the coordinator is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Idle,
    Syncing,
    /// A pulled record met an unpushed local edit
    Conflict,
    Success,
    Error,
}

impl SyncStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Success | SyncStatus::Error)
    }
}

/// Why a pass was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    ConnectivityRegained,
    Explicit,
    Foreground,
    Periodic,
    Startup,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncTrigger::ConnectivityRegained => "connectivity_regained",
            SyncTrigger::Explicit => "explicit",
            SyncTrigger::Foreground => "foreground",
            SyncTrigger::Periodic => "periodic",
            SyncTrigger::Startup => "startup",
        };
        f.write_str(name)
    }
}

/// What to do with a record whose remote call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum RetryPolicy {
    /// Leave it dirty; the next trigger picks it up (default)
    #[default]
    DeferToNextTrigger,
    /// Retry up to `attempts` more times within the same pass. Timeouts are
    /// never retried.
    InPass { attempts: u32 },
}

impl RetryPolicy {
    pub fn extra_attempts(&self) -> u32 {
        match self {
            RetryPolicy::DeferToNextTrigger => 0,
            RetryPolicy::InPass { attempts } => *attempts,
        }
    }
}

/// Why one record (or a whole collection) could not be synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "message")]
pub enum FailureCause {
    Timeout,
    Remote(String),
    Store(String),
    ForeignKey(String),
    /// The two sides could not be resolved against each other
    Resolve(String),
}

impl FailureCause {
    pub fn code(&self) -> ErrorCode {
        match self {
            FailureCause::Timeout => ErrorCode::NetworkTimeout,
            FailureCause::ForeignKey(_) => ErrorCode::ForeignKeyViolation,
            FailureCause::Remote(_) | FailureCause::Store(_) | FailureCause::Resolve(_) => {
                ErrorCode::Internal
            }
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Timeout => f.write_str("remote call timed out"),
            FailureCause::Remote(msg) => write!(f, "remote: {msg}"),
            FailureCause::Store(msg) => write!(f, "store: {msg}"),
            FailureCause::ForeignKey(msg) => write!(f, "foreign key: {msg}"),
            FailureCause::Resolve(msg) => write!(f, "resolve: {msg}"),
        }
    }
}

/// What failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureTarget {
    Record(RecordKey),
    Collection(Collection),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFailure {
    pub target: FailureTarget,
    pub cause: FailureCause,
}

/// Outcome of one sync request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub pass_id: Uuid,
    pub trigger: SyncTrigger,
    /// `Success` or `Error` for a pass that ran; `Idle` when sync is disabled
    pub status: SyncStatus,
    pub code: Option<ErrorCode>,
    pub message: Option<String>,
    pub pushed: usize,
    pub pulled: usize,
    pub conflicts: usize,
    pub failures: Vec<EntityFailure>,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
}

impl SyncReport {
    pub(crate) fn begin(trigger: SyncTrigger, now: Timestamp) -> Self {
        Self {
            pass_id: Uuid::new_v4(),
            trigger,
            status: SyncStatus::Syncing,
            code: None,
            message: None,
            pushed: 0,
            pulled: 0,
            conflicts: 0,
            failures: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    /// A request answered without running a pass.
    pub(crate) fn skipped(
        trigger: SyncTrigger,
        status: SyncStatus,
        code: Option<ErrorCode>,
        message: &str,
        now: Timestamp,
    ) -> Self {
        Self {
            status,
            code,
            message: Some(message.to_string()),
            ..Self::begin(trigger, now)
        }
    }

    /// Settle the final status from the collected failures.
    pub(crate) fn finish(&mut self, now: Timestamp) {
        self.finished_at = now;
        if self.failures.is_empty() {
            self.status = SyncStatus::Success;
        } else {
            self.status = SyncStatus::Error;
            self.code = Some(ErrorCode::PartialSyncFailure);
            self.message = Some(format!("{} item(s) failed to sync", self.failures.len()));
        }
    }

    pub(crate) fn fail(&mut self, target: FailureTarget, cause: FailureCause) {
        self.failures.push(EntityFailure { target, cause });
    }

    pub fn is_success(&self) -> bool {
        self.status == SyncStatus::Success
    }

    /// Failed record keys, in the order they failed.
    pub fn failed_keys(&self) -> Vec<&RecordKey> {
        self.failures
            .iter()
            .filter_map(|f| match &f.target {
                FailureTarget::Record(key) => Some(key),
                FailureTarget::Collection(_) => None,
            })
            .collect()
    }

    pub fn finished_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.finished_at as i64)
    }
}

/// Publishes status changes to the latest-value channel and to the
/// transition stream.
#[derive(Debug)]
pub(crate) struct StatusPublisher {
    current: watch::Sender<SyncStatus>,
    transitions: broadcast::Sender<SyncStatus>,
}

impl StatusPublisher {
    pub(crate) fn new(
        current: watch::Sender<SyncStatus>,
        transitions: broadcast::Sender<SyncStatus>,
    ) -> Self {
        Self {
            current,
            transitions,
        }
    }

    pub(crate) fn publish(&self, status: SyncStatus) {
        self.current.send_replace(status);
        let _ = self.transitions.send(status);
    }
}
