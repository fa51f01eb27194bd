//! SQLite persistence for records and client settings.

use super::{
    required_parent, sort_records, DurableStore, Result, StoreChange, CHANGE_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use hearth_engine::{Collection, HistoryId, Record, RecordKey, Timestamp};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tokio::sync::{broadcast, Mutex};

/// A stored record row from the database.
#[derive(Debug)]
struct StoredRecord {
    payload: String,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for StoredRecord {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(StoredRecord {
            payload: row.try_get("payload")?,
        })
    }
}

impl StoredRecord {
    fn to_record(&self) -> Result<Record> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

fn to_records(rows: Vec<StoredRecord>) -> Result<Vec<Record>> {
    let mut records = rows
        .iter()
        .map(StoredRecord::to_record)
        .collect::<Result<Vec<_>>>()?;
    sort_records(&mut records);
    Ok(records)
}

/// A [`DurableStore`] backed by an SQLite database.
#[derive(Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
    changes: broadcast::Sender<StoreChange>,
    // serializes writers so read-check-write sequences stay atomic
    write_lock: Mutex<()>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and run migrations.
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // every connection to `:memory:` is its own database, so keep exactly one alive
        let in_memory = url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 4 });
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        tracing::info!(url = %url, "Running store migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            pool,
            changes,
            write_lock: Mutex::new(()),
        })
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn publish(&self, change: StoreChange) {
        let _ = self.changes.send(change);
    }

    async fn fetch(&self, key: &RecordKey) -> Result<Option<Record>> {
        let row = sqlx::query_as::<_, StoredRecord>(
            r#"
            SELECT payload FROM records
            WHERE collection = ?1 AND record_id = ?2
            "#,
        )
        .bind(key.collection.as_str())
        .bind(&key.id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.to_record()).transpose()
    }

    async fn write(&self, record: &Record) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO records (
                collection, record_id, parent_id, payload, dirty, updated_at, last_sync_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (collection, record_id) DO UPDATE SET
                parent_id = excluded.parent_id,
                payload = excluded.payload,
                dirty = excluded.dirty,
                updated_at = excluded.updated_at,
                last_sync_at = excluded.last_sync_at
            "#,
        )
        .bind(record.collection().as_str())
        .bind(record.id())
        .bind(record.parent_key().map(|k| k.id))
        .bind(serde_json::to_string(record)?)
        .bind(record.is_dirty())
        .bind(record.updated_at() as i64)
        .bind(record.last_sync_at().map(|t| t as i64))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Keys of everything that transitively references `key`.
    async fn dependents(&self, key: &RecordKey) -> Result<Vec<RecordKey>> {
        let mut out = Vec::new();
        let mut frontier = vec![key.clone()];
        while let Some(parent) = frontier.pop() {
            let Some(child_collection) = parent.collection.child() else {
                continue;
            };
            let ids: Vec<(String,)> = sqlx::query_as(
                r#"
                SELECT record_id FROM records
                WHERE collection = ?1 AND parent_id = ?2
                "#,
            )
            .bind(child_collection.as_str())
            .bind(&parent.id)
            .fetch_all(&self.pool)
            .await?;

            for (id,) in ids {
                let child = RecordKey::new(child_collection, id);
                out.push(child.clone());
                frontier.push(child);
            }
        }
        Ok(out)
    }

    async fn remove_all(&self, keys: &[RecordKey]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for key in keys {
            sqlx::query("DELETE FROM records WHERE collection = ?1 AND record_id = ?2")
                .bind(key.collection.as_str())
                .bind(&key.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn upsert(&self, record: &Record) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = required_parent(record) {
            if self.fetch(&parent).await?.is_none() {
                return Err(hearth_engine::Error::ForeignKeyViolation {
                    child: record.key(),
                    parent,
                }
                .into());
            }
        }
        self.write(record).await?;
        self.publish(StoreChange::Upserted(record.clone()));
        Ok(())
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<Record>> {
        self.fetch(key).await
    }

    async fn list(&self, collection: Collection) -> Result<Vec<Record>> {
        let rows = sqlx::query_as::<_, StoredRecord>(
            "SELECT payload FROM records WHERE collection = ?1",
        )
        .bind(collection.as_str())
        .fetch_all(&self.pool)
        .await?;

        to_records(rows)
    }

    async fn dirty(&self, collection: Collection) -> Result<Vec<Record>> {
        let rows = sqlx::query_as::<_, StoredRecord>(
            "SELECT payload FROM records WHERE collection = ?1 AND dirty = 1",
        )
        .bind(collection.as_str())
        .fetch_all(&self.pool)
        .await?;

        to_records(rows)
    }

    async fn children(&self, collection: Collection, parent_id: &str) -> Result<Vec<Record>> {
        let rows = sqlx::query_as::<_, StoredRecord>(
            "SELECT payload FROM records WHERE collection = ?1 AND parent_id = ?2",
        )
        .bind(collection.as_str())
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        to_records(rows)
    }

    async fn mark_synced(&self, key: &RecordKey, at: Timestamp) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(mut record) = self.fetch(key).await? else {
            return Ok(false);
        };
        record.mark_synced(at);
        self.write(&record).await?;
        self.publish(StoreChange::Upserted(record));
        Ok(true)
    }

    async fn delete(&self, key: &RecordKey) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        if self.fetch(key).await?.is_none() {
            return Ok(false);
        }

        let mut keys = vec![key.clone()];
        keys.extend(self.dependents(key).await?);
        self.remove_all(&keys).await?;

        tracing::debug!(key = %key, removed = keys.len(), "Deleted record with dependents");
        for key in keys {
            self.publish(StoreChange::Deleted(key));
        }
        Ok(true)
    }

    async fn delete_by_foreign_key(
        &self,
        collection: Collection,
        parent_id: &str,
    ) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let ids: Vec<(String,)> = sqlx::query_as(
            "SELECT record_id FROM records WHERE collection = ?1 AND parent_id = ?2",
        )
        .bind(collection.as_str())
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        let mut keys = Vec::new();
        for (id,) in ids {
            let key = RecordKey::new(collection, id);
            let dependents = self.dependents(&key).await?;
            keys.push(key);
            keys.extend(dependents);
        }
        self.remove_all(&keys).await?;

        let count = keys.len();
        for key in keys {
            self.publish(StoreChange::Deleted(key));
        }
        Ok(count)
    }

    async fn max_history_id(&self) -> Result<Option<HistoryId>> {
        let (max,): (Option<i64>,) = sqlx::query_as(
            "SELECT MAX(CAST(record_id AS INTEGER)) FROM records WHERE collection = ?1",
        )
        .bind(Collection::History.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(max.map(|id| id as HistoryId))
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(value,)| value))
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?1, ?2)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_setting(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM settings WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}
