use super::pass::{SyncPass, SyncSettings};
use super::status::{StatusPublisher, SyncReport, SyncStatus, SyncTrigger};
use crate::cache::FreshnessCache;
use crate::error::ErrorCode;
use crate::remote::{IdentityProvider, RemoteStore};
use crate::store::DurableStore;
use crate::{Error, Result};
use hearth_engine::Clock;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const REQUEST_QUEUE_CAPACITY: usize = 64;
const STATUS_CHANNEL_CAPACITY: usize = 64;

struct SyncRequest {
    trigger: SyncTrigger,
    reply: oneshot::Sender<SyncReport>,
}

/// Handle to the replication worker.
///
/// Cloning is cheap; every clone talks to the same worker. Passes never run
/// in parallel: requests queued before a pass starts, and requests arriving
/// while it runs, all receive that pass's report.
#[derive(Debug, Clone)]
pub struct SyncCoordinator {
    requests: mpsc::Sender<SyncRequest>,
    status: watch::Receiver<SyncStatus>,
    transitions: broadcast::Sender<SyncStatus>,
    online: Arc<AtomicBool>,
    enabled: Arc<AtomicBool>,
    last_report: Arc<RwLock<Option<SyncReport>>>,
}

impl std::fmt::Debug for SyncRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRequest")
            .field("trigger", &self.trigger)
            .finish()
    }
}

impl SyncCoordinator {
    /// Start the worker. The coordinator begins online and enabled.
    pub fn spawn(
        store: Arc<dyn DurableStore>,
        remote: Arc<dyn RemoteStore>,
        identity: Arc<dyn IdentityProvider>,
        cache: Arc<FreshnessCache>,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> (Self, JoinHandle<()>) {
        let (requests, queue) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (status_tx, status) = watch::channel(SyncStatus::Idle);
        let (transitions, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let online = Arc::new(AtomicBool::new(true));
        let enabled = Arc::new(AtomicBool::new(true));
        let last_report = Arc::new(RwLock::new(None));

        let worker = SyncWorker {
            store,
            remote,
            identity,
            cache,
            clock,
            settings,
            publisher: StatusPublisher::new(status_tx, transitions.clone()),
            online: online.clone(),
            enabled: enabled.clone(),
            last_report: last_report.clone(),
        };
        let handle = tokio::spawn(worker.run(queue));

        let coordinator = Self {
            requests,
            status,
            transitions,
            online,
            enabled,
            last_report,
        };
        (coordinator, handle)
    }

    /// Request a pass and wait for its report.
    ///
    /// A request made while another is pending or running joins it.
    pub async fn request_sync(&self, trigger: SyncTrigger) -> Result<SyncReport> {
        let (reply, report) = oneshot::channel();
        self.requests
            .send(SyncRequest { trigger, reply })
            .await
            .map_err(|_| Error::Shutdown("sync worker"))?;
        report.await.map_err(|_| Error::Shutdown("sync worker"))
    }

    /// Request a pass without waiting for it.
    pub fn trigger(&self, trigger: SyncTrigger) {
        let (reply, _) = oneshot::channel();
        match self.requests.try_send(SyncRequest { trigger, reply }) {
            Ok(()) => {}
            // a pass is already queued and this one would join it
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(%trigger, "Sync queue full, trigger dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(%trigger, "Sync worker stopped, trigger dropped");
            }
        }
    }

    /// Record a connectivity change. Regaining connectivity starts a pass
    /// when syncing is enabled.
    pub fn set_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online == online {
            return;
        }
        tracing::info!(online, "Connectivity changed");
        if online && self.is_enabled() {
            self.trigger(SyncTrigger::ConnectivityRegained);
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Administratively allow or forbid syncing.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    /// Latest-value view of the status.
    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Every status transition from now on.
    pub fn status_events(&self) -> broadcast::Receiver<SyncStatus> {
        self.transitions.subscribe()
    }

    pub fn last_report(&self) -> Option<SyncReport> {
        self.last_report.read().clone()
    }
}

struct SyncWorker {
    store: Arc<dyn DurableStore>,
    remote: Arc<dyn RemoteStore>,
    identity: Arc<dyn IdentityProvider>,
    cache: Arc<FreshnessCache>,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
    publisher: StatusPublisher,
    online: Arc<AtomicBool>,
    enabled: Arc<AtomicBool>,
    last_report: Arc<RwLock<Option<SyncReport>>>,
}

impl SyncWorker {
    async fn run(mut self, mut queue: mpsc::Receiver<SyncRequest>) {
        while let Some(first) = queue.recv().await {
            let trigger = first.trigger;
            let mut waiters = vec![first.reply];
            while let Ok(queued) = queue.try_recv() {
                waiters.push(queued.reply);
            }

            let report = {
                let pass = self.execute(trigger);
                tokio::pin!(pass);
                loop {
                    tokio::select! {
                        report = &mut pass => break report,
                        Some(joined) = queue.recv() => {
                            tracing::debug!(trigger = %joined.trigger, "Joined running pass");
                            waiters.push(joined.reply);
                        }
                    }
                }
            };

            for waiter in waiters {
                let _ = waiter.send(report.clone());
            }
        }
        tracing::debug!("Sync worker stopped");
    }

    async fn execute(&mut self, trigger: SyncTrigger) -> SyncReport {
        if let Some(skipped) = self.preflight(trigger) {
            tracing::debug!(%trigger, status = ?skipped.status, "Sync pass skipped");
            *self.last_report.write() = Some(skipped.clone());
            return skipped;
        }

        let begin = SyncReport::begin(trigger, self.clock.now());
        tracing::info!(pass_id = %begin.pass_id, %trigger, "Sync pass started");
        self.publisher.publish(SyncStatus::Syncing);

        let pass = SyncPass::new(
            self.store.as_ref(),
            self.remote.as_ref(),
            &self.cache,
            self.clock.as_ref(),
            self.settings,
            &self.publisher,
            begin,
        );
        let report = pass.run().await;

        *self.last_report.write() = Some(report.clone());
        self.publisher.publish(report.status);
        self.publisher.publish(SyncStatus::Idle);
        tracing::info!(
            pass_id = %report.pass_id,
            status = ?report.status,
            pushed = report.pushed,
            pulled = report.pulled,
            conflicts = report.conflicts,
            failures = report.failures.len(),
            "Sync pass finished"
        );
        report
    }

    /// Why a pass cannot run right now, as its report.
    fn preflight(&self, trigger: SyncTrigger) -> Option<SyncReport> {
        let now = self.clock.now();
        if !self.enabled.load(Ordering::SeqCst) {
            return Some(SyncReport::skipped(
                trigger,
                SyncStatus::Idle,
                None,
                "sync disabled",
                now,
            ));
        }
        if self.identity.current_user().is_none() {
            return Some(SyncReport::skipped(
                trigger,
                SyncStatus::Error,
                Some(ErrorCode::NotAuthenticated),
                "not authenticated",
                now,
            ));
        }
        if !self.online.load(Ordering::SeqCst) {
            return Some(SyncReport::skipped(
                trigger,
                SyncStatus::Error,
                Some(ErrorCode::Offline),
                "offline",
                now,
            ));
        }
        None
    }
}
