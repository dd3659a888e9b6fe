/// Engine façade
///
/// One engine per process holds the store, cache, queue, monitor and remote,
/// and exposes the CRUD surface plus sync controls. Construct it with
/// [`EngineBuilder`] and share it by reference or `Arc`.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info};

use outpost_core::{
    ClientId, EngineConfig, Error, Filters, LocalStore, MemoryStore, Record, Result,
};

use crate::auth::AuthGuard;
use crate::cache::CollectionCache;
use crate::collections::LocalCollections;
use crate::conflict::{ConflictResolver, LastWriterWins};
use crate::monitor::{ConnectionEvent, ConnectionMonitor};
use crate::orchestrator::{DrainReport, ReconcileReport, SyncOrchestrator, SyncReport};
use crate::queue::{QueueStatus, SyncQueue};
use crate::remote::RemoteBackend;
use crate::router::{CrudRouter, ListResponse, RecordResponse, RemoveResponse};

/// Builder for an [`Engine`]
pub struct EngineBuilder {
    store: Option<Arc<dyn LocalStore>>,
    remote: Option<Arc<dyn RemoteBackend>>,
    config: EngineConfig,
    resolver: Arc<dyn ConflictResolver>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            remote: None,
            config: EngineConfig::default(),
            resolver: Arc::new(LastWriterWins),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn LocalStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteBackend>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_conflict_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Builds the engine. Without a store, state lives in memory only.
    pub fn build(self) -> Result<Engine> {
        self.config.validate().map_err(Error::InvalidArgument)?;
        let remote = self
            .remote
            .ok_or_else(|| Error::InvalidArgument("a remote backend is required".to_string()))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn LocalStore>);

        let client_id = ClientId::load_or_create(store.as_ref())?;
        let monitor = Arc::new(ConnectionMonitor::new(
            remote.clone(),
            self.config.probe_cache_window,
            self.config.probe_timeout,
        ));
        let cache = Arc::new(CollectionCache::open(store.clone())?);
        let collections = Arc::new(LocalCollections::new(store.clone()));
        let queue = Arc::new(SyncQueue::open(
            store.clone(),
            client_id.clone(),
            self.config.retry_policy.clone(),
            self.config.max_queue_size,
        )?);

        let router = CrudRouter::new(
            remote.clone(),
            monitor.clone(),
            cache.clone(),
            collections.clone(),
            queue.clone(),
            AuthGuard::new(remote.clone(), store.clone()),
            self.config.offline_latency,
        );
        let orchestrator = Arc::new(SyncOrchestrator::new(
            remote.clone(),
            monitor.clone(),
            cache.clone(),
            collections,
            queue.clone(),
            self.resolver.clone(),
            self.config.update_conflict_tolerance,
        ));

        // The orchestrator observes transitions from construction on
        let connection_events = monitor.subscribe();
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            "Engine ready (client {}, remote {}, resolver {})",
            client_id,
            remote.name(),
            self.resolver.name()
        );

        Ok(Engine {
            config: self.config,
            client_id,
            monitor,
            cache,
            queue,
            router,
            orchestrator,
            connection_events: Mutex::new(Some(connection_events)),
            running: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Engine {
    config: EngineConfig,
    client_id: ClientId,
    monitor: Arc<ConnectionMonitor>,
    cache: Arc<CollectionCache>,
    queue: Arc<SyncQueue>,
    router: CrudRouter,
    orchestrator: Arc<SyncOrchestrator>,
    connection_events: Mutex<Option<broadcast::Receiver<ConnectionEvent>>>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub async fn get_all(&self, table: &str, filters: &Filters) -> Result<ListResponse> {
        self.router.get_all(table, filters).await
    }

    pub async fn get_by_id(&self, table: &str, id: &str) -> Result<RecordResponse> {
        self.router.get_by_id(table, id).await
    }

    pub async fn create(&self, table: &str, data: Record) -> Result<RecordResponse> {
        self.router.create(table, data).await
    }

    pub async fn update(&self, table: &str, id: &str, data: Record) -> Result<RecordResponse> {
        self.router.update(table, id, data).await
    }

    pub async fn remove(&self, table: &str, id: &str) -> Result<RemoveResponse> {
        self.router.remove(table, id).await
    }

    pub fn invalidate_cache(&self, table: &str) -> Result<()> {
        self.cache.invalidate(table)
    }

    pub fn invalidate_all_caches(&self) -> Result<()> {
        self.cache.invalidate_all()
    }

    /// Staleness of the cached snapshot for `table`/`filters`.
    pub fn cache_age(&self, table: &str, filters: &Filters) -> Result<Option<Duration>> {
        self.cache.cache_age(table, filters)
    }

    /// Drains the sync queue now.
    pub async fn process_sync_queue(&self) -> Result<DrainReport> {
        self.orchestrator.drain().await
    }

    pub fn sync_queue_status(&self) -> QueueStatus {
        self.queue.status()
    }

    /// Moves dead-lettered entries back into the queue.
    pub fn retry_failed(&self) -> Result<usize> {
        self.queue.retry_failed()
    }

    pub async fn reconcile(&self, table: &str) -> Result<ReconcileReport> {
        self.orchestrator.reconcile(table).await
    }

    pub async fn reconcile_all(&self) -> Result<Vec<ReconcileReport>> {
        self.orchestrator.reconcile_all().await
    }

    pub async fn sync_now(&self) -> Result<SyncReport> {
        self.orchestrator.drain_and_reconcile().await
    }

    pub async fn is_available(&self) -> bool {
        self.monitor.is_available().await
    }

    pub fn current_connection_status(&self) -> bool {
        self.monitor.current_status()
    }

    /// Registers an observer of reachability transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.monitor.subscribe()
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts the periodic probe and the sync task. The sync task drains and
    /// reconciles on every reconnection and drains on `drain_interval`.
    /// Calling it again while running does nothing; after `shutdown` it
    /// starts fresh tasks.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Engine background tasks already started");
            return;
        }
        // The first start keeps the receiver taken at build time
        let mut events = self
            .connection_events
            .lock()
            .take()
            .unwrap_or_else(|| self.monitor.subscribe());
        self.shutdown_tx.send_replace(false);

        let probe_task = {
            let monitor = self.monitor.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            let period = self.config.probe_interval;
            tokio::spawn(async move {
                let mut interval = time::interval(period);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            monitor.probe().await;
                        }
                        _ = shutdown.changed() => {
                            debug!("Probe task shutting down");
                            break;
                        }
                    }
                }
            })
        };

        let sync_task = {
            let orchestrator = self.orchestrator.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            let period = self.config.drain_interval;
            tokio::spawn(async move {
                let mut interval = time::interval(period);
                // The first tick fires immediately; the first probe covers it
                interval.tick().await;
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Ok(ConnectionEvent::Restored) => {
                                match orchestrator.drain_and_reconcile().await {
                                    Ok(report) => debug!("Reconnection sync: {:?}", report.drain),
                                    Err(e) => error!("Reconnection sync failed: {}", e),
                                }
                            }
                            Ok(ConnectionEvent::Lost) => {}
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                debug!("Missed {} connection events", skipped);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                        _ = interval.tick() => {
                            if let Err(e) = orchestrator.drain().await {
                                error!("Periodic drain failed: {}", e);
                            }
                        }
                        _ = shutdown.changed() => {
                            debug!("Sync task shutting down");
                            break;
                        }
                    }
                }
            })
        };

        self.tasks.lock().extend([probe_task, sync_task]);
        info!("Engine background tasks started");
    }

    /// Forces a probe whenever the host reports an online/offline change.
    /// The host flag is only a hint; the probe decides.
    pub fn attach_host_signals(&self, mut host: watch::Receiver<bool>) {
        let monitor = self.monitor.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = host.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let hint = *host.borrow_and_update();
                        debug!("Host reports online={}, probing", hint);
                        monitor.probe().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        self.tasks.lock().push(task);
    }

    /// Stops every background task and waits for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Background task ended abnormally: {}", e);
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("Engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
