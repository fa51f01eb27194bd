//! One replication pass over every collection.
//!
//! Per collection, in sync order:
//!
//! 1. Push every dirty record. When the remote holds a different value
//!    that changed after this replica last synced the record, the two are
//!    resolved first and only the resolution is pushed. History is appended
//!    instead, and each event takes the id the remote assigns.
//! 2. Pull the remote snapshot (incrementally for history) and fold each
//!    record into the local replica.
//!
//! A failing record is noted in the report and skipped for the rest of the
//! pass; it stays dirty for the next trigger.

use super::status::{FailureCause, FailureTarget, StatusPublisher, SyncReport, SyncStatus};
use super::RetryPolicy;
use crate::cache::FreshnessCache;
use crate::remote::{RemoteError, RemoteStore};
use crate::store::{DurableStore, StoreError};
use hearth_engine::{
    resolve_conflict, Clock, Collection, ConflictStrategy, HistoryEvent, HistoryId, Record,
    RecordKey,
};
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

/// Settings key holding the highest remote history id folded in so far.
const HISTORY_CURSOR_SETTING: &str = "sync.history_cursor";

/// Settings that shape every pass.
#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub strategy: ConflictStrategy,
    pub retry: RetryPolicy,
    pub remote_timeout: Duration,
}

impl From<StoreError> for FailureCause {
    fn from(e: StoreError) -> Self {
        if e.is_foreign_key_violation() {
            FailureCause::ForeignKey(e.to_string())
        } else {
            FailureCause::Store(e.to_string())
        }
    }
}

impl From<hearth_engine::Error> for FailureCause {
    fn from(e: hearth_engine::Error) -> Self {
        match e {
            hearth_engine::Error::ForeignKeyViolation { .. } => {
                FailureCause::ForeignKey(e.to_string())
            }
            _ => FailureCause::Resolve(e.to_string()),
        }
    }
}

pub(crate) struct SyncPass<'a> {
    pub store: &'a dyn DurableStore,
    pub remote: &'a dyn RemoteStore,
    pub cache: &'a FreshnessCache,
    pub clock: &'a dyn Clock,
    pub settings: SyncSettings,
    pub status: &'a StatusPublisher,
    pub report: SyncReport,
    failed: HashSet<RecordKey>,
}

impl<'a> SyncPass<'a> {
    pub fn new(
        store: &'a dyn DurableStore,
        remote: &'a dyn RemoteStore,
        cache: &'a FreshnessCache,
        clock: &'a dyn Clock,
        settings: SyncSettings,
        status: &'a StatusPublisher,
        report: SyncReport,
    ) -> Self {
        Self {
            store,
            remote,
            cache,
            clock,
            settings,
            status,
            report,
            failed: HashSet::new(),
        }
    }

    pub async fn run(mut self) -> SyncReport {
        for collection in Collection::SYNC_ORDER {
            self.push_collection(collection).await;
            self.pull_collection(collection).await;
        }
        self.report.finish(self.clock.now());
        self.report
    }

    fn fail(&mut self, key: RecordKey, cause: FailureCause) {
        tracing::warn!(
            pass_id = %self.report.pass_id,
            key = %key,
            cause = %cause,
            "Record failed to sync"
        );
        self.failed.insert(key.clone());
        self.report.fail(FailureTarget::Record(key), cause);
    }

    fn fail_collection(&mut self, collection: Collection, cause: FailureCause) {
        tracing::warn!(
            pass_id = %self.report.pass_id,
            collection = %collection,
            cause = %cause,
            "Collection failed to sync"
        );
        self.report
            .fail(FailureTarget::Collection(collection), cause);
    }

    /// Run one remote call under the per-call timeout, retrying per policy.
    async fn remote_call<T, F, Fut>(&self, mut call: F) -> Result<T, FailureCause>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempts_left = self.settings.retry.extra_attempts();
        loop {
            match tokio::time::timeout(self.settings.remote_timeout, call()).await {
                Err(_) => return Err(FailureCause::Timeout),
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if attempts_left == 0 => return Err(FailureCause::Remote(e.to_string())),
                Ok(Err(e)) => {
                    attempts_left -= 1;
                    tracing::debug!(error = %e, attempts_left, "Retrying remote call");
                }
            }
        }
    }

    /// Write a record to the remote in its sync view.
    async fn send(&self, record: &Record) -> Result<(), FailureCause> {
        let view = record.sync_view();
        self.remote_call(|| self.remote.write(&view)).await
    }

    async fn push_collection(&mut self, collection: Collection) {
        let dirty = match self.store.dirty(collection).await {
            Ok(records) => records,
            Err(e) => return self.fail_collection(collection, e.into()),
        };
        if !dirty.is_empty() {
            tracing::debug!(%collection, count = dirty.len(), "Pushing dirty records");
        }

        for local in dirty {
            let key = local.key();
            if let Err(cause) = self.push_record(local).await {
                self.fail(key, cause);
            }
        }
    }

    async fn push_record(&mut self, local: Record) -> Result<(), FailureCause> {
        if let Record::History(event) = local {
            return self.append_event(event).await;
        }

        let key = local.key();
        match self.remote_call(|| self.remote.read(&key)).await? {
            Some(remote) if remote.content_eq(&local) => self.acknowledge(&local).await,
            Some(remote) if changed_since_sync(&local, &remote) => {
                self.reconcile(local, remote).await
            }
            // the remote still holds what this replica last saw
            _ => {
                self.send(&local).await?;
                self.report.pushed += 1;
                self.acknowledge(&local).await
            }
        }
    }

    /// Append a locally recorded event and move it to the id the remote
    /// assigned.
    async fn append_event(&mut self, event: HistoryEvent) -> Result<(), FailureCause> {
        let view = Record::History(event.clone()).sync_view();
        let remote_key = self.remote_call(|| self.remote.push(&view)).await?;
        self.report.pushed += 1;

        let id: HistoryId = remote_key.parse().map_err(|_| {
            FailureCause::Remote(format!("malformed history key {remote_key:?}"))
        })?;
        tracing::debug!(local_id = event.id, remote_id = id, "Appended");

        let local_key = RecordKey::history(event.id);
        let mut confirmed = Record::History(HistoryEvent { id, ..event });
        confirmed.mark_synced(self.clock.now());
        self.store.upsert(&confirmed).await?;
        if confirmed.key() != local_key {
            self.store.delete(&local_key).await?;
            self.cache.invalidate(&local_key);
        }
        self.cache.put_from_source(confirmed);
        Ok(())
    }

    /// The remote holds `pushed`: clear the local dirty flag, unless the
    /// record was edited again meanwhile.
    async fn acknowledge(&mut self, pushed: &Record) -> Result<(), FailureCause> {
        let key = pushed.key();
        if self.cache.is_pending(&key) {
            return Ok(());
        }
        match self.store.get(&key).await? {
            Some(current) if current.content_eq(pushed) => {
                self.store.mark_synced(&key, self.clock.now()).await?;
                self.cache.invalidate(&key);
            }
            _ => tracing::debug!(key = %key, "Record changed during push, left dirty"),
        }
        Ok(())
    }

    async fn pull_collection(&mut self, collection: Collection) {
        let cursor = if collection.is_append_only() {
            match self.history_cursor().await {
                Ok(cursor) => Some(cursor),
                Err(e) => return self.fail_collection(collection, e.into()),
            }
        } else {
            None
        };

        let pulled = match cursor {
            Some(after) => {
                self.remote_call(|| self.remote.list_since(collection, after))
                    .await
            }
            None => self.remote_call(|| self.remote.list(collection)).await,
        };
        let records = match pulled {
            Ok(records) => records,
            Err(cause) => return self.fail_collection(collection, cause),
        };

        // the cursor only moves past an unbroken run of applied events
        let mut settled = cursor;
        for mut remote in records {
            remote.set_dirty(false);
            let key = remote.key();
            let event_id = match &remote {
                Record::History(event) => Some(event.id),
                _ => None,
            };

            // already failed, or edited locally and not yet persisted
            let applied = if self.failed.contains(&key) || self.cache.is_pending(&key) {
                false
            } else if let Err(cause) = self.pull_record(remote).await {
                self.fail(key, cause);
                false
            } else {
                true
            };

            match (applied, event_id) {
                (true, Some(id)) => settled = settled.map(|at| at.max(id)),
                (false, Some(_)) => settled = None,
                _ => {}
            }
        }

        if let (Some(before), Some(after)) = (cursor, settled) {
            if after > before {
                if let Err(e) = self
                    .store
                    .put_setting(HISTORY_CURSOR_SETTING, &after.to_string())
                    .await
                {
                    self.fail_collection(collection, e.into());
                }
            }
        }
    }

    async fn history_cursor(&self) -> Result<HistoryId, StoreError> {
        let stored = self.store.get_setting(HISTORY_CURSOR_SETTING).await?;
        Ok(stored.and_then(|s| s.parse().ok()).unwrap_or(0))
    }

    async fn pull_record(&mut self, remote: Record) -> Result<(), FailureCause> {
        match self.store.get(&remote.key()).await? {
            None => {
                let mut record = remote;
                record.mark_synced(self.clock.now());
                self.persist(record).await?;
                self.report.pulled += 1;
                Ok(())
            }
            Some(local) if local.content_eq(&remote) => {
                if local.is_dirty() {
                    self.acknowledge(&local).await?;
                }
                Ok(())
            }
            Some(local) if local.is_dirty() && !changed_since_sync(&local, &remote) => {
                tracing::debug!(key = %local.key(), "Unpushed local edit kept");
                Ok(())
            }
            Some(local) => self.reconcile(local, remote).await,
        }
    }

    /// Resolve differing local and remote values and apply the outcome on
    /// both sides.
    async fn reconcile(&mut self, local: Record, remote: Record) -> Result<(), FailureCause> {
        let conflicted = local.is_dirty();
        if conflicted {
            self.report.conflicts += 1;
            self.status.publish(SyncStatus::Conflict);
        }

        let outcome = self.apply_resolution(&local, &remote).await;

        if conflicted {
            self.status.publish(SyncStatus::Syncing);
        }
        outcome
    }

    async fn apply_resolution(&mut self, local: &Record, remote: &Record) -> Result<(), FailureCause> {
        let resolution = resolve_conflict(local, remote, self.settings.strategy)?;

        tracing::debug!(
            key = %local.key(),
            origin = ?resolution.origin,
            requires_push = resolution.requires_push,
            "Resolved"
        );

        let mut resolved = resolution.resolved;
        if resolution.requires_push {
            self.send(&resolved).await?;
            self.report.pushed += 1;
        }
        resolved.mark_synced(self.clock.now());
        self.persist(resolved).await?;
        self.report.pulled += 1;
        Ok(())
    }

    /// Write a settled record to storage and the cache.
    async fn persist(&mut self, record: Record) -> Result<(), FailureCause> {
        let key = record.key();
        if self.cache.is_pending(&key) {
            tracing::debug!(key = %key, "Local edit in flight, keeping it");
            return Ok(());
        }
        self.store.upsert(&record).await?;
        self.cache.put_from_source(record);
        Ok(())
    }
}

/// Whether `remote` was written after this replica last synced `local`.
///
/// A record that never synced has nothing to compare against, so any remote
/// value counts as a concurrent change.
fn changed_since_sync(local: &Record, remote: &Record) -> bool {
    match local.last_sync_at() {
        Some(synced) => remote.updated_at() > synced,
        None => true,
    }
}
