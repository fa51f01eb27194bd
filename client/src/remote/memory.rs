//! In-memory remote with fault injection.

use super::{RemoteError, RemoteStore, Result};
use async_trait::async_trait;
use hearth_engine::{Collection, HistoryEvent, HistoryId, Record, RecordKey};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// How a faulty key misbehaves.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Fault {
    /// Never answer
    Stall,
    /// Answer with an error
    Fail(String),
}

/// A [`RemoteStore`] held in memory, standing in for the remote service.
///
/// Individual keys can be made to stall or fail so that sync behaviour under
/// partial failure can be exercised.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    records: RwLock<BTreeMap<RecordKey, Record>>,
    faults: Mutex<HashMap<RecordKey, Fault>>,
    failing_lists: Mutex<HashSet<Collection>>,
    unreachable: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record as if another client had written it.
    pub fn insert(&self, record: Record) {
        let record = record.sync_view();
        self.records.write().insert(record.key(), record);
    }

    /// Inspect the remote copy of a record.
    pub fn get(&self, key: &RecordKey) -> Option<Record> {
        self.records.read().get(key).cloned()
    }

    pub fn remove(&self, key: &RecordKey) -> Option<Record> {
        self.records.write().remove(key)
    }

    /// Number of accepted writes and pushes.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Calls touching `key` never complete.
    pub fn stall(&self, key: RecordKey) {
        self.faults.lock().insert(key, Fault::Stall);
    }

    /// Calls touching `key` fail with `reason`.
    pub fn fail(&self, key: RecordKey, reason: impl Into<String>) {
        self.faults.lock().insert(key, Fault::Fail(reason.into()));
    }

    /// Enumerating `collection` fails.
    pub fn fail_list(&self, collection: Collection) {
        self.failing_lists.lock().insert(collection);
    }

    /// Every call fails as if the network were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
        self.failing_lists.lock().clear();
        self.unreachable.store(false, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("network unreachable".to_string()));
        }
        Ok(())
    }

    async fn check_key(&self, key: &RecordKey) -> Result<()> {
        self.check_reachable()?;
        let fault = self.faults.lock().get(key).cloned();
        match fault {
            Some(Fault::Stall) => std::future::pending().await,
            Some(Fault::Fail(reason)) => Err(RemoteError::Rejected {
                key: key.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }

    fn check_list(&self, collection: Collection) -> Result<()> {
        self.check_reachable()?;
        if self.failing_lists.lock().contains(&collection) {
            return Err(RemoteError::Unavailable(format!("{collection} listing failed")));
        }
        Ok(())
    }

    fn store(&self, record: &Record) {
        let record = record.sync_view();
        self.records.write().insert(record.key(), record);
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn read(&self, key: &RecordKey) -> Result<Option<Record>> {
        self.check_key(key).await?;
        Ok(self.get(key))
    }

    async fn write(&self, record: &Record) -> Result<()> {
        self.check_key(&record.key()).await?;
        self.store(record);
        Ok(())
    }

    async fn list(&self, collection: Collection) -> Result<Vec<Record>> {
        self.check_list(collection)?;
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.collection() == collection)
            .cloned()
            .collect())
    }

    async fn push(&self, record: &Record) -> Result<String> {
        self.check_key(&record.key()).await?;
        let Record::History(event) = record.sync_view() else {
            return Err(RemoteError::Rejected {
                key: record.key(),
                reason: format!("{} is not append-only", record.collection()),
            });
        };

        let mut records = self.records.write();
        let next = records
            .values()
            .filter_map(|r| match r {
                Record::History(h) => Some(h.id),
                _ => None,
            })
            .max()
            .unwrap_or(0)
            + 1;
        let appended = Record::History(HistoryEvent { id: next, ..event });
        let key = appended.key();
        records.insert(key.clone(), appended);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(key.id)
    }

    async fn list_since(&self, collection: Collection, after: HistoryId) -> Result<Vec<Record>> {
        self.check_list(collection)?;
        let mut out: Vec<Record> = self
            .records
            .read()
            .values()
            .filter(|r| match r {
                Record::History(h) => collection == Collection::History && h.id > after,
                _ => false,
            })
            .cloned()
            .collect();
        out.sort_by_key(|r| match r {
            Record::History(h) => h.id,
            _ => 0,
        });
        Ok(out)
    }
}
