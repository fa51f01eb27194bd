//! Durable store: the on-device system of record.
//!
//! Every replicated entity lives here as one record. The cache reads and
//! writes through it, the coordinator drains its dirty records, and the
//! credential manager keeps its bookkeeping in the settings area.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::ErrorCode;
use async_trait::async_trait;
use hearth_engine::{Collection, HistoryId, Record, RecordKey, Timestamp};
use tokio::sync::broadcast;

/// Capacity of the change-notification channel.
pub(crate) const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Engine(#[from] hearth_engine::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::Engine(hearth_engine::Error::ForeignKeyViolation { .. }) => {
                ErrorCode::ForeignKeyViolation
            }
            _ => ErrorCode::Internal,
        }
    }

    pub fn is_foreign_key_violation(&self) -> bool {
        self.code() == ErrorCode::ForeignKeyViolation
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A committed change, published after the write succeeds.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    Upserted(Record),
    Deleted(RecordKey),
}

impl StoreChange {
    pub fn key(&self) -> RecordKey {
        match self {
            StoreChange::Upserted(record) => record.key(),
            StoreChange::Deleted(key) => key.clone(),
        }
    }

    pub fn collection(&self) -> Collection {
        match self {
            StoreChange::Upserted(record) => record.collection(),
            StoreChange::Deleted(key) => key.collection,
        }
    }
}

/// CRUD and query access to locally persisted records.
///
/// Implementations must allow concurrent reads and apply writes to the same
/// key one at a time.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    /// Insert or replace a record.
    ///
    /// A device whose room does not exist is rejected with
    /// [`hearth_engine::Error::ForeignKeyViolation`].
    async fn upsert(&self, record: &Record) -> Result<()>;

    async fn get(&self, key: &RecordKey) -> Result<Option<Record>>;

    /// All records of a collection, in id order (numeric for history).
    async fn list(&self, collection: Collection) -> Result<Vec<Record>>;

    /// Records not yet acknowledged by the remote.
    async fn dirty(&self, collection: Collection) -> Result<Vec<Record>>;

    /// Records of `collection` whose parent id is `parent_id`.
    async fn children(&self, collection: Collection, parent_id: &str) -> Result<Vec<Record>>;

    /// Clear the dirty flag and stamp the sync time. Returns whether the
    /// record existed.
    async fn mark_synced(&self, key: &RecordKey, at: Timestamp) -> Result<bool>;

    /// Delete a record and, transitively, everything that references it.
    /// Returns whether the record existed.
    async fn delete(&self, key: &RecordKey) -> Result<bool>;

    /// Delete the records of `collection` referencing `parent_id`, and their
    /// own dependents. Returns the number of records removed.
    async fn delete_by_foreign_key(&self, collection: Collection, parent_id: &str)
        -> Result<usize>;

    /// Largest history id stored locally.
    async fn max_history_id(&self) -> Result<Option<HistoryId>>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    async fn put_setting(&self, key: &str, value: &str) -> Result<()>;

    async fn remove_setting(&self, key: &str) -> Result<()>;

    /// Subscribe to committed changes across all collections.
    fn changes(&self) -> broadcast::Receiver<StoreChange>;
}

/// Parent that must exist before `record` may be stored.
///
/// Only devices are checked: history may outlive a device on the remote and
/// is still accepted locally.
pub(crate) fn required_parent(record: &Record) -> Option<RecordKey> {
    match record {
        Record::Device(_) => record.parent_key(),
        _ => None,
    }
}

/// Sort records the way `list` promises: history numerically, others by id.
pub(crate) fn sort_records(records: &mut [Record]) {
    records.sort_by(|a, b| match (a, b) {
        (Record::History(x), Record::History(y)) => x.id.cmp(&y.id),
        _ => a.key().cmp(&b.key()),
    });
}

/// Follow a collection's change stream only.
pub fn collection_changes(
    rx: broadcast::Receiver<StoreChange>,
    collection: Collection,
) -> futures::stream::BoxStream<'static, StoreChange> {
    use futures::StreamExt;

    futures::stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(change) if change.collection() == collection => return Some((change, rx)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(%collection, skipped, "Store change stream lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
