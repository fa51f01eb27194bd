//! Application context: one of each component per process.

use crate::auth::{AuthResponse, CredentialManager, OfflineAuthenticator, OfflineUser};
use crate::cache::{FreshnessCache, Subscription};
use crate::config::Config;
use crate::remote::{
    HttpRemote, IdentityProvider, MemoryRemote, RemoteStore, RemoteUser, StaticIdentity,
};
use crate::store::{DurableStore, SqliteStore, StoreChange};
use crate::sync::{SyncCoordinator, SyncReport, SyncSettings, SyncStatus, SyncTrigger};
use crate::Result;
use hearth_engine::{Clock, Record, RecordKey, SystemClock};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Owns the cache, the sync coordinator and the credential manager, and the
/// background tasks that connect them.
///
/// Dropping the context stops every task it started. Call
/// [`shutdown`](Self::shutdown) first to let queued cache writes finish.
pub struct AppContext {
    config: Arc<Config>,
    store: Arc<dyn DurableStore>,
    remote: Arc<dyn RemoteStore>,
    identity: Arc<dyn IdentityProvider>,
    cache: Arc<FreshnessCache>,
    sync: SyncCoordinator,
    auth: CredentialManager,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("sync", &self.sync)
            .finish()
    }
}

impl AppContext {
    /// Build the context from a SQLite store and, when configured, the HTTP
    /// remote.
    pub async fn open(config: Config) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(&config.database_url).await?);

        let remote: Arc<dyn RemoteStore> = match &config.remote_url {
            Some(url) => Arc::new(HttpRemote::new(url.as_str(), config.remote_token.clone())),
            None => {
                tracing::warn!("No remote configured, changes stay on this device");
                Arc::new(MemoryRemote::new())
            }
        };
        let identity = Arc::new(StaticIdentity::new(
            config.user_id.clone().map(RemoteUser::with_id),
        ));

        Ok(Self::new(config, store, remote, identity))
    }

    /// Must be called from within a tokio runtime.
    pub fn new(
        config: Config,
        store: Arc<dyn DurableStore>,
        remote: Arc<dyn RemoteStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self::with_clock(config, store, remote, identity, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: Config,
        store: Arc<dyn DurableStore>,
        remote: Arc<dyn RemoteStore>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut tasks = Vec::new();

        let cache = FreshnessCache::spawn(store.clone(), clock.clone(), config.cache_ttl);
        cache.set_actor(identity.current_user().map(|user| user.id));
        tasks.push(tokio::spawn(follow_store(store.changes(), cache.clone())));

        let (sync, worker) = SyncCoordinator::spawn(
            store.clone(),
            remote.clone(),
            identity.clone(),
            cache.clone(),
            clock.clone(),
            SyncSettings {
                strategy: config.conflict_strategy,
                retry: config.retry_policy,
                remote_timeout: config.remote_timeout,
            },
        );
        sync.set_enabled(config.sync_enabled);
        tasks.push(worker);

        if let Some(interval) = config.sync_interval {
            tasks.push(tokio::spawn(tick_sync(sync.clone(), interval)));
        }

        let (auth, auth_worker) = CredentialManager::spawn(OfflineAuthenticator::new(
            store.clone(),
            identity.clone(),
            clock,
            config.session_ttl,
            config.kdf,
        ));
        tasks.push(auth_worker);

        tracing::info!(
            strategy = ?config.conflict_strategy,
            sync_enabled = config.sync_enabled,
            sync_interval = ?config.sync_interval,
            "Context ready"
        );

        Self {
            config: Arc::new(config),
            store,
            remote,
            identity,
            cache,
            sync,
            auth,
            tasks,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn identity(&self) -> &Arc<dyn IdentityProvider> {
        &self.identity
    }

    pub fn cache(&self) -> &Arc<FreshnessCache> {
        &self.cache
    }

    pub fn sync(&self) -> &SyncCoordinator {
        &self.sync
    }

    pub fn auth(&self) -> &CredentialManager {
        &self.auth
    }

    /// Current value of `key`, from the cache while fresh.
    pub async fn get_cached(&self, key: &RecordKey) -> Result<Option<Record>> {
        Ok(self.cache.get(key).await?)
    }

    /// Change local data; see [`FreshnessCache::write_through`].
    pub async fn write_through<F>(&self, key: &RecordKey, mutate: F) -> Result<Record>
    where
        F: FnOnce(&mut Record) + Send,
    {
        self.cache.write_through(key, mutate).await
    }

    pub fn subscribe(&self, key: RecordKey) -> Subscription {
        self.cache.subscribe(key)
    }

    /// Run an explicit pass, or join the one in progress.
    pub async fn request_sync(&self) -> Result<SyncReport> {
        self.sync.request_sync(SyncTrigger::Explicit).await
    }

    /// The app came to the foreground.
    pub fn foreground(&self) {
        if self.sync.is_enabled() {
            self.sync.trigger(SyncTrigger::Foreground);
        }
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.sync.status()
    }

    pub fn is_online(&self) -> bool {
        self.sync.is_online()
    }

    pub fn set_online(&self, online: bool) {
        self.sync.set_online(online);
    }

    /// Offline login; history written afterwards is attributed to the user.
    pub async fn login_offline(&self, pin: &str) -> AuthResponse<OfflineUser> {
        let response = self.auth.login_offline(pin).await;
        if let Some(user) = &response.payload {
            self.cache.set_actor(Some(user.id.clone()));
        }
        response
    }

    /// End the offline session, keeping the PIN.
    pub async fn end_offline_session(&self) -> AuthResponse<()> {
        let response = self.auth.end_offline_session().await;
        if response.success {
            self.cache
                .set_actor(self.identity.current_user().map(|user| user.id));
        }
        response
    }

    /// Wait for queued cache writes, then stop the background tasks.
    pub async fn shutdown(mut self) -> Result<()> {
        let flushed = self.cache.flush().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        tracing::info!("Context shut down");
        flushed
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Feed committed store changes into the cache.
async fn follow_store(mut changes: broadcast::Receiver<StoreChange>, cache: Arc<FreshnessCache>) {
    loop {
        match changes.recv().await {
            Ok(StoreChange::Upserted(record)) => {
                cache.put_from_store(record);
            }
            Ok(StoreChange::Deleted(key)) => cache.invalidate_from_store(&key),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Store follower lagged, dropping cache");
                cache.invalidate_all();
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    tracing::debug!("Store follower stopped");
}

async fn tick_sync(sync: SyncCoordinator, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if sync.is_enabled() && sync.is_online() {
            sync.trigger(SyncTrigger::Periodic);
        }
    }
}
