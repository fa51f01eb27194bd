//! In-memory durable store for tests and ephemeral sessions.

use super::{
    required_parent, sort_records, DurableStore, Result, StoreChange, StoreError,
    CHANGE_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use hearth_engine::{Collection, HistoryId, Record, RecordKey, Timestamp};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// A [`DurableStore`] kept entirely in memory.
#[derive(Debug)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<RecordKey, Record>>,
    settings: RwLock<HashMap<String, String>>,
    changes: broadcast::Sender<StoreChange>,
    failing: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            records: RwLock::new(BTreeMap::new()),
            settings: RwLock::new(HashMap::new()),
            changes,
            failing: AtomicBool::new(false),
        }
    }

    /// Make every write fail until switched back. Reads keep working.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn check_writable(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }

    fn publish(&self, change: StoreChange) {
        // no receivers is fine
        let _ = self.changes.send(change);
    }

    /// Keys of everything that transitively references `key`.
    fn dependents(records: &BTreeMap<RecordKey, Record>, key: &RecordKey) -> Vec<RecordKey> {
        let mut out = Vec::new();
        let mut frontier = vec![key.clone()];
        while let Some(parent) = frontier.pop() {
            let Some(child_collection) = parent.collection.child() else {
                continue;
            };
            for record in records.values() {
                if record.collection() == child_collection
                    && record.parent_key().as_ref() == Some(&parent)
                {
                    out.push(record.key());
                    frontier.push(record.key());
                }
            }
        }
        out
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn upsert(&self, record: &Record) -> Result<()> {
        self.check_writable()?;
        {
            let mut records = self.records.write();
            if let Some(parent) = required_parent(record) {
                if !records.contains_key(&parent) {
                    return Err(hearth_engine::Error::ForeignKeyViolation {
                        child: record.key(),
                        parent,
                    }
                    .into());
                }
            }
            records.insert(record.key(), record.clone());
        }
        self.publish(StoreChange::Upserted(record.clone()));
        Ok(())
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<Record>> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn list(&self, collection: Collection) -> Result<Vec<Record>> {
        let mut out: Vec<Record> = self
            .records
            .read()
            .values()
            .filter(|r| r.collection() == collection)
            .cloned()
            .collect();
        sort_records(&mut out);
        Ok(out)
    }

    async fn dirty(&self, collection: Collection) -> Result<Vec<Record>> {
        let mut out: Vec<Record> = self
            .records
            .read()
            .values()
            .filter(|r| r.collection() == collection && r.is_dirty())
            .cloned()
            .collect();
        sort_records(&mut out);
        Ok(out)
    }

    async fn children(&self, collection: Collection, parent_id: &str) -> Result<Vec<Record>> {
        let mut out: Vec<Record> = self
            .records
            .read()
            .values()
            .filter(|r| {
                r.collection() == collection
                    && r.parent_key().is_some_and(|parent| parent.id == parent_id)
            })
            .cloned()
            .collect();
        sort_records(&mut out);
        Ok(out)
    }

    async fn mark_synced(&self, key: &RecordKey, at: Timestamp) -> Result<bool> {
        self.check_writable()?;
        let updated = {
            let mut records = self.records.write();
            match records.get_mut(key) {
                Some(record) => {
                    record.mark_synced(at);
                    Some(record.clone())
                }
                None => None,
            }
        };
        match updated {
            Some(record) => {
                self.publish(StoreChange::Upserted(record));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &RecordKey) -> Result<bool> {
        self.check_writable()?;
        let removed = {
            let mut records = self.records.write();
            if records.remove(key).is_none() {
                return Ok(false);
            }
            let dependents = Self::dependents(&records, key);
            for dependent in &dependents {
                records.remove(dependent);
            }
            dependents
        };
        self.publish(StoreChange::Deleted(key.clone()));
        for dependent in removed {
            self.publish(StoreChange::Deleted(dependent));
        }
        Ok(true)
    }

    async fn delete_by_foreign_key(
        &self,
        collection: Collection,
        parent_id: &str,
    ) -> Result<usize> {
        self.check_writable()?;
        let removed = {
            let mut records = self.records.write();
            let direct: Vec<RecordKey> = records
                .values()
                .filter(|r| {
                    r.collection() == collection
                        && r.parent_key().is_some_and(|parent| parent.id == parent_id)
                })
                .map(|r| r.key())
                .collect();

            let mut removed = Vec::new();
            for key in direct {
                let dependents = Self::dependents(&records, &key);
                records.remove(&key);
                removed.push(key);
                for dependent in dependents {
                    records.remove(&dependent);
                    removed.push(dependent);
                }
            }
            removed
        };
        let count = removed.len();
        for key in removed {
            self.publish(StoreChange::Deleted(key));
        }
        Ok(count)
    }

    async fn max_history_id(&self) -> Result<Option<HistoryId>> {
        Ok(self
            .records
            .read()
            .values()
            .filter_map(|r| match r {
                Record::History(h) => Some(h.id),
                _ => None,
            })
            .max())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.settings.read().get(key).cloned())
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        self.settings
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_setting(&self, key: &str) -> Result<()> {
        self.check_writable()?;
        self.settings.write().remove(key);
        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_engine::{Device, HistoryEvent, Room};

    fn room(id: &str) -> Record {
        Record::Room(Room {
            id: id.into(),
            name: id.into(),
            ..Default::default()
        })
    }

    fn device(id: &str, room_id: &str) -> Record {
        Record::Device(Device {
            id: id.into(),
            room_id: room_id.into(),
            dirty: true,
            ..Default::default()
        })
    }

    fn event(id: u64, device_id: &str) -> Record {
        Record::History(HistoryEvent {
            id,
            device_id: device_id.into(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn device_requires_room() {
        let store = MemoryStore::new();
        let err = store.upsert(&device("lamp", "attic")).await.unwrap_err();
        assert!(err.is_foreign_key_violation());
        assert!(store.is_empty());

        store.upsert(&room("attic")).await.unwrap();
        store.upsert(&device("lamp", "attic")).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn room_delete_cascades() {
        let store = MemoryStore::new();
        store.upsert(&room("kitchen")).await.unwrap();
        store.upsert(&room("hall")).await.unwrap();
        store.upsert(&device("kettle", "kitchen")).await.unwrap();
        store.upsert(&device("light", "hall")).await.unwrap();
        store.upsert(&event(1, "kettle")).await.unwrap();
        store.upsert(&event(2, "light")).await.unwrap();

        assert!(store.delete(&RecordKey::room("kitchen")).await.unwrap());

        assert!(store
            .children(Collection::Devices, "kitchen")
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .children(Collection::History, "kettle")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.children(Collection::History, "light").await.unwrap().len(), 1);
        assert!(!store.delete(&RecordKey::room("kitchen")).await.unwrap());
    }

    #[tokio::test]
    async fn delete_by_foreign_key_removes_grandchildren() {
        let store = MemoryStore::new();
        store.upsert(&room("office")).await.unwrap();
        store.upsert(&device("fan", "office")).await.unwrap();
        store.upsert(&device("lamp", "office")).await.unwrap();
        store.upsert(&event(7, "fan")).await.unwrap();

        let removed = store
            .delete_by_foreign_key(Collection::Devices, "office")
            .await
            .unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn dirty_and_mark_synced() {
        let store = MemoryStore::new();
        store.upsert(&room("r")).await.unwrap();
        store.upsert(&device("d", "r")).await.unwrap();

        assert_eq!(store.dirty(Collection::Devices).await.unwrap().len(), 1);
        assert!(store.mark_synced(&RecordKey::device("d"), 99).await.unwrap());
        assert!(store.dirty(Collection::Devices).await.unwrap().is_empty());

        let stored = store.get(&RecordKey::device("d")).await.unwrap().unwrap();
        assert_eq!(stored.last_sync_at(), Some(99));
        assert!(!store.mark_synced(&RecordKey::device("x"), 1).await.unwrap());
    }

    #[tokio::test]
    async fn publishes_changes() {
        let store = MemoryStore::new();
        let mut rx = store.changes();
        store.upsert(&room("r")).await.unwrap();
        store.delete(&RecordKey::room("r")).await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), StoreChange::Upserted(_)));
        assert_eq!(
            rx.recv().await.unwrap(),
            StoreChange::Deleted(RecordKey::room("r"))
        );
    }

    #[tokio::test]
    async fn failing_writes() {
        let store = MemoryStore::new();
        store.set_failing(true);
        assert!(store.upsert(&room("r")).await.is_err());
        assert!(store.put_setting("k", "v").await.is_err());
        store.set_failing(false);
        store.upsert(&room("r")).await.unwrap();
    }

    #[tokio::test]
    async fn settings_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get_setting("k").await.unwrap(), None);
        store.put_setting("k", "v").await.unwrap();
        assert_eq!(store.get_setting("k").await.unwrap().as_deref(), Some("v"));
        store.remove_setting("k").await.unwrap();
        assert_eq!(store.get_setting("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn max_history_id() {
        let store = MemoryStore::new();
        assert_eq!(store.max_history_id().await.unwrap(), None);
        store.upsert(&event(9, "d")).await.unwrap();
        store.upsert(&event(12, "d")).await.unwrap();
        assert_eq!(store.max_history_id().await.unwrap(), Some(12));
    }
}
