//! Freshness cache in front of the durable store.
//!
//! Entries are served from memory while they are younger than the TTL and
//! re-read from storage after that. Writes go through the cache: the new
//! value is visible immediately and reaches storage later, in call order,
//! through a single background writer.
//!
//! The cache's freshness stamp is independent of the entity's own
//! `updated_at`; it only says when the cache last saw the value.
//!
//! A written entry waits for storage to report that exact value back. Until
//! then, values read from or reported by storage are older and do not
//! replace it.

use crate::store::{required_parent, DurableStore, StoreError};
use crate::{Error, Result};
use dashmap::mapref::entry::Entry as Slot;
use dashmap::DashMap;
use futures::Stream;
use hearth_engine::{
    device_changes, Clock, Entity, HistoryId, Record, RecordKey, Timestamp, Trigger, UserId,
    PROVISIONAL_HISTORY_ID,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, OnceCell};
use tokio::task::JoinHandle;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Entry {
    record: Record,
    cached_at: Timestamp,
    // written here, not yet seen coming back from storage
    awaiting_store: bool,
}

impl Entry {
    fn settled(record: Record, cached_at: Timestamp) -> Self {
        Self {
            record,
            cached_at,
            awaiting_store: false,
        }
    }
}

/// Result of looking at the cache without touching storage.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Fresh(Record),
    /// Present but older than the TTL
    Stale(Record),
    /// Nothing cached; the `CACHE_MISS` signal
    Miss,
}

/// Entry counts at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total: usize,
    pub valid: usize,
    pub expired: usize,
    /// When a whole collection was last loaded, 0 if never
    pub last_full_refresh: Timestamp,
}

/// Change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Updated(Record),
    Invalidated(RecordKey),
}

impl CacheEvent {
    pub fn key(&self) -> RecordKey {
        match self {
            CacheEvent::Updated(record) => record.key(),
            CacheEvent::Invalidated(key) => key.clone(),
        }
    }
}

enum WriteJob {
    Persist(Vec<Record>),
    Flush(oneshot::Sender<()>),
}

/// In-memory, TTL-bounded view of the durable store.
pub struct FreshnessCache {
    entries: Arc<DashMap<RecordKey, Entry>>,
    // write-throughs not yet applied to storage, per key
    pending: Arc<DashMap<RecordKey, usize>>,
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    ttl: Timestamp,
    last_full_refresh: AtomicU64,
    next_history_id: AtomicU64,
    history_seeded: OnceCell<()>,
    actor: RwLock<Option<UserId>>,
    // one write-through at a time, so storage sees writes in call order
    write_gate: Mutex<()>,
    writer: mpsc::UnboundedSender<WriteJob>,
    events: broadcast::Sender<CacheEvent>,
}

impl std::fmt::Debug for FreshnessCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreshnessCache")
            .field("entries", &self.entries.len())
            .field("pending", &self.pending.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl FreshnessCache {
    /// Create the cache and start its background writer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Arc<Self> {
        let entries = Arc::new(DashMap::new());
        let pending = Arc::new(DashMap::new());
        let (writer, jobs) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(run_writer(
            jobs,
            store.clone(),
            entries.clone(),
            pending.clone(),
            events.clone(),
        ));

        Arc::new(Self {
            entries,
            pending,
            store,
            clock,
            ttl: ttl.as_millis() as Timestamp,
            last_full_refresh: AtomicU64::new(0),
            next_history_id: AtomicU64::new(PROVISIONAL_HISTORY_ID),
            history_seeded: OnceCell::new(),
            actor: RwLock::new(None),
            write_gate: Mutex::new(()),
            writer,
            events,
        })
    }

    fn is_fresh(&self, entry: &Entry, now: Timestamp) -> bool {
        now.saturating_sub(entry.cached_at) < self.ttl
    }

    fn emit(&self, event: CacheEvent) {
        let _ = self.events.send(event);
    }

    /// Classify the cached state of `key` without reading storage.
    pub fn peek(&self, key: &RecordKey) -> Lookup {
        let now = self.clock.now();
        match self.entries.get(key) {
            Some(entry) if self.is_fresh(&entry, now) => Lookup::Fresh(entry.record.clone()),
            Some(entry) => Lookup::Stale(entry.record.clone()),
            None => Lookup::Miss,
        }
    }

    /// The value for `key`: from memory while fresh, otherwise re-read from
    /// storage and cached again.
    ///
    /// Absence is `Ok(None)`; only a storage failure is an error.
    pub async fn get(&self, key: &RecordKey) -> std::result::Result<Option<Record>, StoreError> {
        let now = self.clock.now();
        if let Some(entry) = self.entries.get(key) {
            // an unpersisted write is newer than anything storage holds
            if self.is_fresh(&entry, now) || self.is_pending(key) {
                return Ok(Some(entry.record.clone()));
            }
        }

        tracing::debug!(key = %key, "Cache miss, reading store");
        match self.store.get(key).await? {
            Some(record) => Ok(Some(self.settle(record.clone()).unwrap_or(record))),
            None => {
                let newer = self.entries.remove_if(key, |_, e| !e.awaiting_store);
                match newer {
                    Some(_) => Ok(None),
                    None => Ok(self.entries.get(key).map(|e| e.record.clone())),
                }
            }
        }
    }

    /// Cache a value read from storage.
    ///
    /// Returns the entry's own value instead when that entry is a local write
    /// storage has not reported back yet.
    fn settle(&self, record: Record) -> Option<Record> {
        let now = self.clock.now();
        match self.entries.entry(record.key()) {
            Slot::Occupied(slot) if slot.get().awaiting_store && slot.get().record != record => {
                Some(slot.get().record.clone())
            }
            slot => {
                slot.insert(Entry::settled(record, now));
                None
            }
        }
    }

    /// Typed [`get`](Self::get).
    pub async fn get_entity<T: Entity>(
        &self,
        id: &str,
    ) -> std::result::Result<Option<T>, StoreError> {
        let key = RecordKey::new(T::COLLECTION, id);
        Ok(self.get(&key).await?.and_then(T::from_record))
    }

    /// Overwrite the entry with a value that came from storage.
    pub fn put_from_source(&self, record: Record) {
        if let Record::History(event) = &record {
            self.observe_history_id(event.id);
        }
        self.entries
            .insert(record.key(), Entry::settled(record.clone(), self.clock.now()));
        self.emit(CacheEvent::Updated(record));
    }

    /// Apply a change storage reported. Returns whether the entry took it.
    pub(crate) fn put_from_store(&self, record: Record) -> bool {
        if let Record::History(event) = &record {
            self.observe_history_id(event.id);
        }
        if let Some(newer) = self.settle(record.clone()) {
            tracing::trace!(key = %newer.key(), "Older stored value ignored");
            return false;
        }
        self.emit(CacheEvent::Updated(record));
        true
    }

    /// Drop the entry for a key storage reported deleted, unless it holds a
    /// local write made since.
    pub(crate) fn invalidate_from_store(&self, key: &RecordKey) {
        if self
            .entries
            .remove_if(key, |_, e| !e.awaiting_store)
            .is_some()
        {
            self.emit(CacheEvent::Invalidated(key.clone()));
        }
    }

    /// Apply `mutate` to the current value of `key` and persist it in the
    /// background.
    ///
    /// The result is visible to [`get`](Self::get) as soon as this returns.
    /// Keys nobody has stored yet start from an empty record. Device state
    /// changes also append history events.
    pub async fn write_through<F>(&self, key: &RecordKey, mutate: F) -> Result<Record>
    where
        F: FnOnce(&mut Record) + Send,
    {
        let _gate = self.write_gate.lock().await;

        let before = match self.get(key).await? {
            Some(record) => record,
            None => Record::placeholder(key)?,
        };
        let mut after = before.clone();
        mutate(&mut after);

        if after.key() != *key {
            return Err(hearth_engine::Error::KeyMismatch {
                local: key.clone(),
                remote: after.key(),
            }
            .into());
        }

        if let Some(parent) = required_parent(&after) {
            if !self.entries.contains_key(&parent) && self.store.get(&parent).await?.is_none() {
                return Err(hearth_engine::Error::ForeignKeyViolation {
                    child: key.clone(),
                    parent,
                }
                .into());
            }
        }

        let now = self.clock.now();
        let mut history = Vec::new();
        if let (Record::Device(old), Record::Device(new)) = (&before, &mut after) {
            new.apply_power_rule(old);
            if new.state_differs(old) {
                new.last_state_change_at = now.max(old.last_state_change_at);
            }
            let changes = device_changes(old, new);
            if !changes.is_empty() {
                self.seed_history_ids().await?;
                let actor = self.actor.read().clone();
                for change in changes {
                    history.push(Record::History(change.into_event(
                        self.next_history_id.fetch_add(1, Ordering::SeqCst),
                        new.id.clone(),
                        now,
                        Trigger::User,
                        actor.clone(),
                    )));
                }
            }
        }
        after.touch(now);
        after.set_dirty(true);

        self.commit(after.clone(), history, now);
        Ok(after)
    }

    /// Publish a written record and its history, then queue them for storage.
    fn commit(&self, record: Record, history: Vec<Record>, now: Timestamp) {
        let mut batch = Vec::with_capacity(1 + history.len());
        batch.push(record);
        batch.extend(history);

        // pending is raised before the entry becomes visible
        for record in &batch {
            *self.pending.entry(record.key()).or_insert(0) += 1;
        }
        for record in &batch {
            self.entries.insert(
                record.key(),
                Entry {
                    record: record.clone(),
                    cached_at: now,
                    awaiting_store: true,
                },
            );
            self.emit(CacheEvent::Updated(record.clone()));
        }

        if self.writer.send(WriteJob::Persist(batch)).is_err() {
            tracing::error!("Cache writer has stopped; write kept in memory only");
        }
    }

    async fn seed_history_ids(&self) -> std::result::Result<(), StoreError> {
        self.history_seeded
            .get_or_try_init(|| async {
                let max = self.store.max_history_id().await?;
                if let Some(max) = max {
                    self.observe_history_id(max);
                }
                Ok::<_, StoreError>(())
            })
            .await?;
        Ok(())
    }

    fn observe_history_id(&self, id: HistoryId) {
        self.next_history_id.fetch_max(id + 1, Ordering::SeqCst);
    }

    /// Whether a write-through for `key` has not reached storage yet.
    pub fn is_pending(&self, key: &RecordKey) -> bool {
        self.pending.get(key).is_some_and(|count| *count > 0)
    }

    /// Drop the entry so the next `get` reads storage.
    pub fn invalidate(&self, key: &RecordKey) {
        if self.entries.remove(key).is_some() {
            self.emit(CacheEvent::Invalidated(key.clone()));
        }
    }

    /// Drop every entry and forget the last full refresh.
    pub fn invalidate_all(&self) {
        let keys: Vec<RecordKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        self.entries.clear();
        self.last_full_refresh.store(0, Ordering::SeqCst);
        for key in keys {
            self.emit(CacheEvent::Invalidated(key));
        }
    }

    /// Load a whole collection from storage. Returns the number of entries.
    pub async fn refresh(
        &self,
        collection: hearth_engine::Collection,
    ) -> std::result::Result<usize, StoreError> {
        let records = self.store.list(collection).await?;
        let mut loaded = 0;
        for record in records {
            if self.is_pending(&record.key()) {
                continue;
            }
            if self.put_from_store(record) {
                loaded += 1;
            }
        }
        self.last_full_refresh
            .store(self.clock.now(), Ordering::SeqCst);
        tracing::debug!(%collection, loaded, "Cache refreshed");
        Ok(loaded)
    }

    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let mut stats = CacheStats {
            total: 0,
            valid: 0,
            expired: 0,
            last_full_refresh: self.last_full_refresh.load(Ordering::SeqCst),
        };
        for entry in self.entries.iter() {
            stats.total += 1;
            if self.is_fresh(entry.value(), now) {
                stats.valid += 1;
            } else {
                stats.expired += 1;
            }
        }
        stats
    }

    /// Attribute future history events to `actor`.
    pub fn set_actor(&self, actor: Option<UserId>) {
        *self.actor.write() = actor;
    }

    /// Wait until every queued write has been applied to storage.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.writer
            .send(WriteJob::Flush(tx))
            .map_err(|_| Error::Shutdown("cache writer"))?;
        rx.await.map_err(|_| Error::Shutdown("cache writer"))
    }

    /// Stream changes to `key` until the subscription is cancelled or dropped.
    pub fn subscribe(&self, key: RecordKey) -> Subscription {
        let mut events = self.events.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let watched = key.clone();

        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.key() == watched => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(key = %watched, skipped, "Subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Subscription { key, rx, task }
    }
}

async fn run_writer(
    mut jobs: mpsc::UnboundedReceiver<WriteJob>,
    store: Arc<dyn DurableStore>,
    entries: Arc<DashMap<RecordKey, Entry>>,
    pending: Arc<DashMap<RecordKey, usize>>,
    events: broadcast::Sender<CacheEvent>,
) {
    while let Some(job) = jobs.recv().await {
        match job {
            WriteJob::Persist(batch) => {
                for record in batch {
                    let key = record.key();
                    if let Err(e) = store.upsert(&record).await {
                        tracing::warn!(key = %key, error = %e, "Write-through persist failed");
                        // the next read goes back to storage
                        if entries.remove(&key).is_some() {
                            let _ = events.send(CacheEvent::Invalidated(key.clone()));
                        }
                    }
                    pending.remove_if_mut(&key, |_, count| {
                        *count = count.saturating_sub(1);
                        *count == 0
                    });
                }
            }
            WriteJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("Cache writer stopped");
}

/// Change notifications for one key.
///
/// Dropping the subscription (or calling [`cancel`](Self::cancel)) stops the
/// background task feeding it.
#[derive(Debug)]
pub struct Subscription {
    key: RecordKey,
    rx: mpsc::UnboundedReceiver<CacheEvent>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn key(&self) -> &RecordKey {
        &self.key
    }

    /// Stop receiving notifications.
    pub fn cancel(self) {
        self.task.abort();
    }

    /// Next notification, or `None` once cancelled.
    pub async fn next_event(&mut self) -> Option<CacheEvent> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = CacheEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use futures::StreamExt;
    use hearth_engine::clock::MINUTE;
    use hearth_engine::{Collection, Device, HistoryAction, ManualClock, Room};

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: ManualClock,
        cache: Arc<FreshnessCache>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(1_000_000);
        store
            .upsert(&Record::Room(Room {
                id: "living".into(),
                name: "Living room".into(),
                ..Default::default()
            }))
            .await
            .unwrap();
        let cache = FreshnessCache::spawn(
            store.clone(),
            Arc::new(clock.clone()),
            Duration::from_secs(15 * 60),
        );
        Fixture {
            store,
            clock,
            cache,
        }
    }

    fn lamp() -> Record {
        Record::Device(Device {
            id: "lamp".into(),
            room_id: "living".into(),
            name: "Lamp".into(),
            on: true,
            intensity: 50,
            online: true,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn get_caches_store_reads() {
        let f = fixture().await;
        let key = RecordKey::room("living");

        assert_eq!(f.cache.peek(&key), Lookup::Miss);
        assert!(f.cache.get(&key).await.unwrap().is_some());
        assert!(matches!(f.cache.peek(&key), Lookup::Fresh(_)));
    }

    #[tokio::test]
    async fn expired_entries_reload() {
        let f = fixture().await;
        let key = RecordKey::room("living");
        f.cache.get(&key).await.unwrap();

        // change storage behind the cache's back
        let renamed = Record::Room(Room {
            id: "living".into(),
            name: "Lounge".into(),
            ..Default::default()
        });
        f.store.upsert(&renamed).await.unwrap();

        f.clock.advance(14 * MINUTE);
        let Some(Record::Room(room)) = f.cache.get(&key).await.unwrap() else {
            panic!("expected room");
        };
        assert_eq!(room.name, "Living room");

        f.clock.advance(MINUTE);
        assert!(matches!(f.cache.peek(&key), Lookup::Stale(_)));
        let Some(Record::Room(room)) = f.cache.get(&key).await.unwrap() else {
            panic!("expected room");
        };
        assert_eq!(room.name, "Lounge");
    }

    #[tokio::test]
    async fn missing_is_none_not_error() {
        let f = fixture().await;
        assert_eq!(f.cache.get(&RecordKey::device("ghost")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_through_visible_before_persist() {
        let f = fixture().await;
        f.store.upsert(&lamp()).await.unwrap();
        let key = RecordKey::device("lamp");

        let written = f
            .cache
            .write_through(&key, |r| {
                if let Record::Device(d) = r {
                    d.name = "Desk lamp".into();
                }
            })
            .await
            .unwrap();
        assert!(written.is_dirty());

        let Some(Record::Device(cached)) = f.cache.get(&key).await.unwrap() else {
            panic!("expected device");
        };
        assert_eq!(cached.name, "Desk lamp");

        f.cache.flush().await.unwrap();
        let Some(Record::Device(stored)) = f.store.get(&key).await.unwrap() else {
            panic!("expected device");
        };
        assert_eq!(stored.name, "Desk lamp");
        assert!(stored.dirty);
        assert!(!f.cache.is_pending(&key));
    }

    #[tokio::test]
    async fn intensity_rule_and_history() {
        let f = fixture().await;
        f.store.upsert(&lamp()).await.unwrap();
        f.cache.set_actor(Some("u1".into()));
        let key = RecordKey::device("lamp");

        let written = f
            .cache
            .write_through(&key, |r| {
                if let Record::Device(d) = r {
                    d.intensity = 0;
                }
            })
            .await
            .unwrap();
        let Record::Device(device) = written else {
            panic!("expected device");
        };
        assert!(!device.on);
        assert_eq!(device.last_state_change_at, 1_000_000);

        f.cache.flush().await.unwrap();
        let history = f.store.list(Collection::History).await.unwrap();
        let actions: Vec<_> = history
            .iter()
            .filter_map(|r| match r {
                Record::History(h) => Some((h.id, h.action, h.actor_id.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            actions,
            vec![
                (
                    PROVISIONAL_HISTORY_ID,
                    HistoryAction::TurnOff,
                    Some("u1".to_string())
                ),
                (
                    PROVISIONAL_HISTORY_ID + 1,
                    HistoryAction::SetIntensity,
                    Some("u1".to_string())
                ),
            ]
        );
    }

    #[tokio::test]
    async fn history_ids_continue_after_stored_max() {
        let f = fixture().await;
        f.store.upsert(&lamp()).await.unwrap();
        // one confirmed by the remote, one still local from an earlier run
        for id in [41, PROVISIONAL_HISTORY_ID + 41] {
            f.store
                .upsert(&Record::History(hearth_engine::HistoryEvent {
                    id,
                    device_id: "lamp".into(),
                    ..Default::default()
                }))
                .await
                .unwrap();
        }

        f.cache
            .write_through(&RecordKey::device("lamp"), |r| {
                if let Record::Device(d) = r {
                    d.on = false;
                }
            })
            .await
            .unwrap();
        f.cache.flush().await.unwrap();
        assert_eq!(
            f.store.max_history_id().await.unwrap(),
            Some(PROVISIONAL_HISTORY_ID + 42)
        );
    }

    #[tokio::test]
    async fn local_history_ids_start_at_the_provisional_floor() {
        let f = fixture().await;
        f.store.upsert(&lamp()).await.unwrap();
        f.cache
            .write_through(&RecordKey::device("lamp"), |r| {
                if let Record::Device(d) = r {
                    d.on = false;
                }
            })
            .await
            .unwrap();
        f.cache.flush().await.unwrap();

        let history = f.store.list(Collection::History).await.unwrap();
        assert_eq!(history.len(), 1);
        let Record::History(event) = &history[0] else {
            panic!("expected history");
        };
        assert!(event.is_provisional());
    }

    #[tokio::test]
    async fn stored_values_do_not_replace_unconfirmed_writes() {
        let f = fixture().await;
        let key = RecordKey::room("living");
        let stored = f.cache.get(&key).await.unwrap().unwrap();

        let written = f
            .cache
            .write_through(&key, |r| {
                if let Record::Room(room) = r {
                    room.name = "Den".into();
                }
            })
            .await
            .unwrap();

        // a change notification for the value storage held before the write
        assert!(!f.cache.put_from_store(stored.clone()));
        f.cache.invalidate_from_store(&key);
        assert_eq!(f.cache.peek(&key), Lookup::Fresh(written.clone()));

        // storage reports the write itself; later changes apply again
        assert!(f.cache.put_from_store(written));
        assert!(f.cache.put_from_store(stored.clone()));
        assert_eq!(f.cache.peek(&key), Lookup::Fresh(stored));
        f.cache.invalidate_from_store(&key);
        assert_eq!(f.cache.peek(&key), Lookup::Miss);
    }

    #[tokio::test]
    async fn write_through_synthesizes_missing_entry() {
        let f = fixture().await;
        let key = RecordKey::room("attic");
        let written = f
            .cache
            .write_through(&key, |r| {
                if let Record::Room(room) = r {
                    room.name = "Attic".into();
                }
            })
            .await
            .unwrap();
        assert_eq!(written.key(), key);
        assert_eq!(written.updated_at(), 1_000_000);
    }

    #[tokio::test]
    async fn write_through_rejects_missing_room() {
        let f = fixture().await;
        let err = f
            .cache
            .write_through(&RecordKey::device("fan"), |r| {
                if let Record::Device(d) = r {
                    d.room_id = "garage".into();
                }
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::ForeignKeyViolation);
        assert_eq!(f.cache.peek(&RecordKey::device("fan")), Lookup::Miss);
    }

    #[tokio::test]
    async fn failed_persist_invalidates() {
        let f = fixture().await;
        let key = RecordKey::room("living");
        f.store.set_failing(true);
        f.cache
            .write_through(&key, |r| {
                if let Record::Room(room) = r {
                    room.name = "Den".into();
                }
            })
            .await
            .unwrap();
        f.cache.flush().await.unwrap();
        f.store.set_failing(false);

        assert_eq!(f.cache.peek(&key), Lookup::Miss);
        let Some(Record::Room(room)) = f.cache.get(&key).await.unwrap() else {
            panic!("expected room");
        };
        assert_eq!(room.name, "Living room");
    }

    #[tokio::test]
    async fn invalidate_all_resets_stats() {
        let f = fixture().await;
        f.cache.refresh(Collection::Rooms).await.unwrap();
        let stats = f.cache.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.last_full_refresh, 1_000_000);

        f.clock.advance(20 * MINUTE);
        assert_eq!(f.cache.stats().expired, 1);

        f.cache.invalidate_all();
        assert_eq!(
            f.cache.stats(),
            CacheStats {
                total: 0,
                valid: 0,
                expired: 0,
                last_full_refresh: 0,
            }
        );
    }

    #[tokio::test]
    async fn subscription_receives_changes_until_cancelled() {
        let f = fixture().await;
        let key = RecordKey::room("living");
        let mut sub = f.cache.subscribe(key.clone());
        tokio::task::yield_now().await;

        f.cache.get(&key).await.unwrap();
        f.cache
            .write_through(&key, |r| {
                if let Record::Room(room) = r {
                    room.floor = 2;
                }
            })
            .await
            .unwrap();

        let event = sub.next().await.unwrap();
        let CacheEvent::Updated(Record::Room(room)) = event else {
            panic!("expected room update");
        };
        assert_eq!(room.floor, 2);

        f.cache.invalidate(&key);
        assert_eq!(sub.next().await, Some(CacheEvent::Invalidated(key)));
        sub.cancel();
    }

    #[tokio::test]
    async fn cancel_stops_the_feeding_task() {
        let f = fixture().await;
        let sub = f.cache.subscribe(RecordKey::room("living"));
        assert_eq!(f.cache.events.receiver_count(), 1);

        sub.cancel();
        for _ in 0..100 {
            if f.cache.events.receiver_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(f.cache.events.receiver_count(), 0);
    }
}
