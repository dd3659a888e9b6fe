/// Generic CRUD router
///
/// Every table goes through the same five operations. When the remote is
/// reachable they run against it and the cache is refreshed or patched;
/// otherwise (or when the remote fails with a transient error) they are
/// served from the cache and local collections, and writes are queued.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use outpost_core::{
    ensure_id, now_iso, Error, Filters, Record, RecordExt, Result, CLIENT_UPDATED_AT, CREATED_AT,
    ID, UPDATED_AT, VERSION,
};

use crate::auth::AuthGuard;
use crate::cache::CollectionCache;
use crate::collections::LocalCollections;
use crate::monitor::ConnectionMonitor;
use crate::queue::{overlay_pending, overlay_pending_record, Operation, SyncQueue};
use crate::remote::RemoteBackend;

/// Where a response's data came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Remote,
    Cache,
    LocalStore,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub data: Vec<Record>,
    pub online: bool,
    pub source: DataSource,
    /// Staleness of the cache snapshot served, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_age_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordResponse {
    pub data: Record,
    pub online: bool,
    pub source: DataSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveResponse {
    pub success: bool,
    pub online: bool,
}

pub struct CrudRouter {
    remote: Arc<dyn RemoteBackend>,
    monitor: Arc<ConnectionMonitor>,
    cache: Arc<CollectionCache>,
    collections: Arc<LocalCollections>,
    queue: Arc<SyncQueue>,
    auth: AuthGuard,
    offline_latency: Duration,
}

impl CrudRouter {
    pub fn new(
        remote: Arc<dyn RemoteBackend>,
        monitor: Arc<ConnectionMonitor>,
        cache: Arc<CollectionCache>,
        collections: Arc<LocalCollections>,
        queue: Arc<SyncQueue>,
        auth: AuthGuard,
        offline_latency: Duration,
    ) -> Self {
        Self {
            remote,
            monitor,
            cache,
            collections,
            queue,
            auth,
            offline_latency,
        }
    }

    /// Lists a table, overlaying queued mutations so unsynced writes are
    /// visible immediately.
    pub async fn get_all(&self, table: &str, filters: &Filters) -> Result<ListResponse> {
        if self.monitor.is_available().await {
            match self.remote.select(table, filters).await {
                Ok(records) => {
                    if let Err(e) = self.refresh_cache(table, filters, &records) {
                        warn!("Refreshing cache for {} failed: {}", table, e);
                    }
                    let pending = self.queue.pending_for(table);
                    return Ok(ListResponse {
                        data: overlay_pending(records, &pending, filters),
                        online: true,
                        source: DataSource::Remote,
                        cache_age_ms: None,
                    });
                }
                Err(e) if e.is_retryable() => {
                    warn!("Listing {} remotely failed, serving local data: {}", table, e);
                }
                Err(e) => return Err(e),
            }
        }

        self.simulate_latency().await;
        let pending = self.queue.pending_for(table);

        let cached = self.cache.lookup(table, filters).unwrap_or_else(|e| {
            warn!("Reading cache for {} failed, trying local store: {}", table, e);
            None
        });
        if let Some(entry) = cached {
            debug!("Serving {} from cache ({} records)", table, entry.data.len());
            let cache_age_ms = Some(entry.age().as_millis() as u64);
            return Ok(ListResponse {
                data: overlay_pending(entry.data, &pending, filters),
                online: false,
                source: DataSource::Cache,
                cache_age_ms,
            });
        }

        let stored = self.collections.load(table)?;
        if stored.is_none() && pending.is_empty() {
            return Err(Error::NetworkUnavailable(format!(
                "no cached or local data for {}",
                table
            )));
        }

        debug!("Serving {} from local store", table);
        let records = filters.apply(&stored.unwrap_or_default());
        Ok(ListResponse {
            data: overlay_pending(records, &pending, filters),
            online: false,
            source: DataSource::LocalStore,
            cache_age_ms: None,
        })
    }

    /// Fetches one record. A queued delete hides it even if the remote or
    /// cache still has it.
    pub async fn get_by_id(&self, table: &str, id: &str) -> Result<RecordResponse> {
        if self.monitor.is_available().await {
            match self.remote.fetch(table, id).await {
                Ok(found) => {
                    let patched = match &found {
                        Some(record) => self.cache.upsert_record(table, record),
                        None => self.cache.remove_record(table, id),
                    };
                    if let Err(e) = patched {
                        warn!("Patching cache for {}/{} failed: {}", table, id, e);
                    }
                    let pending = self.queue.pending_for(table);
                    let data = overlay_pending_record(found, &pending, id)
                        .ok_or_else(|| not_found(table, id))?;
                    return Ok(RecordResponse {
                        data,
                        online: true,
                        source: DataSource::Remote,
                    });
                }
                Err(e) if e.is_retryable() => {
                    warn!("Fetching {}/{} remotely failed, serving local data: {}", table, id, e);
                }
                Err(e) => return Err(e),
            }
        }

        self.simulate_latency().await;
        let pending = self.queue.pending_for(table);
        let cached = self.cache.find(table, id).unwrap_or_else(|e| {
            warn!("Reading cache for {} failed, trying local store: {}", table, e);
            None
        });
        let (found, source) = match cached {
            Some(record) => (Some(record), DataSource::Cache),
            None => (self.collections.find(table, id)?, DataSource::LocalStore),
        };

        let data = overlay_pending_record(found, &pending, id).ok_or_else(|| not_found(table, id))?;
        Ok(RecordResponse {
            data,
            online: false,
            source,
        })
    }

    /// Creates a record, assigning an id if it has none.
    pub async fn create(&self, table: &str, data: Record) -> Result<RecordResponse> {
        let mut record = data;
        let id = ensure_id(&mut record)?;
        let now = now_iso();
        record
            .entry(CREATED_AT)
            .or_insert_with(|| Value::String(now.clone()));
        record.insert(UPDATED_AT.to_string(), Value::String(now.clone()));
        if record.version().is_none() {
            record.insert(VERSION.to_string(), Value::from(1));
        }

        let online = self.monitor.is_available().await;
        self.auth.ensure(online).await?;

        if online {
            match self.create_remote(table, &id, record.clone()).await {
                Ok(saved) => {
                    self.cache.upsert_record(table, &saved)?;
                    self.collections.upsert(table, &saved)?;
                    return Ok(RecordResponse {
                        data: saved,
                        online: true,
                        source: DataSource::Remote,
                    });
                }
                Err(e) if e.is_retryable() => {
                    warn!("Creating in {} remotely failed, queueing: {}", table, e);
                }
                Err(e) => return Err(e),
            }
        }

        self.simulate_latency().await;
        record.insert(CLIENT_UPDATED_AT.to_string(), Value::String(now));
        self.queue
            .enqueue(table, Operation::Insert, record.clone(), None)?;
        self.collections.upsert(table, &record)?;
        self.cache.upsert_record(table, &record)?;

        Ok(RecordResponse {
            data: record,
            online: false,
            source: DataSource::LocalStore,
        })
    }

    /// Updates a record. A `version` in `data` is the version the caller
    /// expects to overwrite; a mismatch fails with `VersionConflict`.
    pub async fn update(&self, table: &str, id: &str, data: Record) -> Result<RecordResponse> {
        let expected = data.version();
        let mut changes = data;
        changes.remove(ID);
        changes.remove(VERSION);
        let now = now_iso();

        let online = self.monitor.is_available().await;
        self.auth.ensure(online).await?;

        if online {
            match self.update_remote(table, id, &changes, expected, &now).await {
                Ok(saved) => {
                    self.cache.upsert_record(table, &saved)?;
                    self.collections.upsert(table, &saved)?;
                    return Ok(RecordResponse {
                        data: saved,
                        online: true,
                        source: DataSource::Remote,
                    });
                }
                Err(e) if e.is_retryable() => {
                    warn!("Updating {}/{} remotely failed, queueing: {}", table, id, e);
                }
                Err(e) => return Err(e),
            }
        }

        self.simulate_latency().await;
        let pending = self.queue.pending_for(table);
        let base = match self.collections.find(table, id)? {
            Some(record) => Some(record),
            None => self.cache.find(table, id)?,
        };
        let current = overlay_pending_record(base, &pending, id).ok_or_else(|| not_found(table, id))?;
        check_version(current.version(), expected)?;

        let base_updated_at = current
            .get(UPDATED_AT)
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut updated = current.clone();
        updated.overlay(&changes);
        updated.insert(ID.to_string(), Value::String(id.to_string()));
        updated.insert(UPDATED_AT.to_string(), Value::String(now.clone()));
        updated.insert(CLIENT_UPDATED_AT.to_string(), Value::String(now));
        updated.insert(
            VERSION.to_string(),
            Value::from(current.version().unwrap_or(0) + 1),
        );

        self.queue
            .enqueue(table, Operation::Update, updated.clone(), base_updated_at)?;
        self.collections.upsert(table, &updated)?;
        self.cache.upsert_record(table, &updated)?;

        Ok(RecordResponse {
            data: updated,
            online: false,
            source: DataSource::LocalStore,
        })
    }

    /// Removes a record. Removing an id the remote does not have succeeds.
    pub async fn remove(&self, table: &str, id: &str) -> Result<RemoveResponse> {
        let online = self.monitor.is_available().await;
        self.auth.ensure(online).await?;

        if online {
            let outcome = match self.remote.delete(table, id).await {
                Ok(()) => Ok(()),
                Err(Error::NotFound(_)) => {
                    debug!("{}/{} already absent remotely", table, id);
                    Ok(())
                }
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => {
                    self.cache.remove_record(table, id)?;
                    self.collections.remove(table, id)?;
                    return Ok(RemoveResponse {
                        success: true,
                        online: true,
                    });
                }
                Err(e) if e.is_retryable() => {
                    warn!("Deleting {}/{} remotely failed, queueing: {}", table, id, e);
                }
                Err(e) => return Err(e),
            }
        }

        self.simulate_latency().await;
        let current = match self.collections.find(table, id)? {
            Some(record) => Some(record),
            None => self.cache.find(table, id)?,
        };
        let base_updated_at = current
            .as_ref()
            .and_then(|r| r.get(UPDATED_AT))
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut tombstone = Record::new();
        tombstone.insert(ID.to_string(), Value::String(id.to_string()));
        self.queue
            .enqueue(table, Operation::Delete, tombstone, base_updated_at)?;
        self.collections.remove(table, id)?;
        self.cache.remove_record(table, id)?;

        Ok(RemoveResponse {
            success: true,
            online: false,
        })
    }

    /// Upserts a new record. A create of an id the remote already has becomes
    /// an update: the remote `created_at` is kept and its version bumped.
    async fn create_remote(&self, table: &str, id: &str, mut record: Record) -> Result<Record> {
        if let Some(existing) = self.remote.fetch(table, id).await? {
            debug!("{}/{} already exists remotely, updating it", table, id);
            record.remove(CREATED_AT);
            record.insert(
                VERSION.to_string(),
                Value::from(existing.version().unwrap_or(0) + 1),
            );
        }
        self.remote.upsert(table, record).await
    }

    fn refresh_cache(&self, table: &str, filters: &Filters, records: &[Record]) -> Result<()> {
        self.cache.put(table, filters, records.to_vec())?;
        if !filters.is_empty() {
            self.cache.absorb(table, records)?;
        }
        Ok(())
    }

    async fn update_remote(
        &self,
        table: &str,
        id: &str,
        changes: &Record,
        expected: Option<i64>,
        now: &str,
    ) -> Result<Record> {
        let current = self
            .remote
            .fetch(table, id)
            .await?
            .ok_or_else(|| not_found(table, id))?;
        check_version(current.version(), expected)?;

        let next_version = current.version().or(expected).unwrap_or(0) + 1;
        let mut patch = changes.clone();
        patch.insert(UPDATED_AT.to_string(), Value::String(now.to_string()));
        patch.insert(VERSION.to_string(), Value::from(next_version));

        self.remote.update(table, id, patch).await
    }

    async fn simulate_latency(&self) {
        if !self.offline_latency.is_zero() {
            tokio::time::sleep(self.offline_latency).await;
        }
    }
}

fn check_version(current: Option<i64>, expected: Option<i64>) -> Result<()> {
    match (current, expected) {
        (Some(current_version), Some(attempted_version)) if current_version != attempted_version => {
            Err(Error::VersionConflict {
                current_version,
                attempted_version,
            })
        }
        _ => Ok(()),
    }
}

fn not_found(table: &str, id: &str) -> Error {
    Error::NotFound(format!("{}/{}", table, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use outpost_core::{into_record, ClientId, LocalStore, MemoryStore, RetryPolicy};
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        into_record(value).unwrap()
    }

    struct Fixture {
        router: CrudRouter,
        remote: Arc<MemoryRemote>,
        queue: Arc<SyncQueue>,
        cache: Arc<CollectionCache>,
    }

    /// Store whose cache snapshots cannot be written or read
    struct BrokenCacheStore(MemoryStore);

    impl LocalStore for BrokenCacheStore {
        fn get(&self, key: &str) -> Result<Option<Value>> {
            if key.starts_with("cache:") {
                return Err(Error::Storage("disk full".to_string()));
            }
            self.0.get(key)
        }

        fn set(&self, key: &str, value: Value) -> Result<()> {
            if key.starts_with("cache:") {
                return Err(Error::Storage("disk full".to_string()));
            }
            self.0.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<()> {
            self.0.remove(key)
        }
    }

    fn fixture() -> Fixture {
        fixture_with_store(Arc::new(MemoryStore::new()))
    }

    fn fixture_with_store(store: Arc<dyn LocalStore>) -> Fixture {
        let remote = Arc::new(MemoryRemote::new());
        let backend: Arc<dyn RemoteBackend> = remote.clone();
        let monitor = Arc::new(ConnectionMonitor::new(
            backend.clone(),
            Duration::ZERO,
            Duration::from_secs(1),
        ));
        let cache = Arc::new(CollectionCache::open(store.clone()).unwrap());
        let collections = Arc::new(LocalCollections::new(store.clone()));
        let queue = Arc::new(
            SyncQueue::open(store.clone(), ClientId::new(), RetryPolicy::default(), 100).unwrap(),
        );
        let router = CrudRouter::new(
            backend.clone(),
            monitor,
            cache.clone(),
            collections,
            queue.clone(),
            AuthGuard::new(backend, store),
            Duration::ZERO,
        );
        Fixture {
            router,
            remote,
            queue,
            cache,
        }
    }

    #[tokio::test]
    async fn test_online_create_and_list() {
        let fx = fixture();
        let created = fx
            .router
            .create("fees", record(json!({"amount": 100})))
            .await
            .unwrap();
        assert!(created.online);
        let id = created.data.id().unwrap().to_string();
        assert_eq!(created.data[VERSION], 1);
        assert!(created.data.contains_key(CREATED_AT));
        assert!(fx.remote.get("fees", &id).is_some());

        let listed = fx.router.get_all("fees", &Filters::new()).await.unwrap();
        assert_eq!(listed.source, DataSource::Remote);
        assert_eq!(listed.data.len(), 1);
        assert!(fx.cache.get("fees", &Filters::new()).unwrap().is_some());
        assert!(fx.queue.is_empty());
    }

    #[tokio::test]
    async fn test_offline_create_is_visible_and_queued() {
        let fx = fixture();
        fx.router.auth.ensure(true).await.unwrap();
        fx.remote.set_reachable(false);

        let created = fx
            .router
            .create("fees", record(json!({"id": "f1", "amount": 100})))
            .await
            .unwrap();
        assert!(!created.online);
        assert!(created.data.contains_key(CLIENT_UPDATED_AT));

        let listed = fx.router.get_all("fees", &Filters::new()).await.unwrap();
        assert!(!listed.online);
        assert_eq!(listed.source, DataSource::LocalStore);
        assert_eq!(listed.data[0]["amount"], 100);
        assert_eq!(fx.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_offline_mutation_without_session_is_refused() {
        let fx = fixture();
        fx.remote.set_reachable(false);
        let err = fx
            .router
            .create("fees", record(json!({"id": "f1"})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AUTH_REQUIRED");
        assert!(fx.queue.is_empty());
    }

    #[tokio::test]
    async fn test_cache_fallback_when_unreachable() {
        let fx = fixture();
        fx.remote
            .seed("fees", [record(json!({"id": "f1", "status": "due"}))]);
        fx.router.get_all("fees", &Filters::new()).await.unwrap();

        fx.remote.set_reachable(false);
        let listed = fx
            .router
            .get_all("fees", &Filters::new().eq("status", "due"))
            .await
            .unwrap();
        assert_eq!(listed.source, DataSource::Cache);
        assert!(!listed.online);
        assert_eq!(listed.data.len(), 1);
        assert!(listed.cache_age_ms.is_some());
    }

    #[tokio::test]
    async fn test_no_local_data_offline() {
        let fx = fixture();
        fx.remote.set_reachable(false);
        let err = fx.router.get_all("fees", &Filters::new()).await.unwrap_err();
        assert_eq!(err.code(), "NETWORK_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_transient_remote_failure_falls_back() {
        let fx = fixture();
        fx.remote.seed("fees", [record(json!({"id": "f1"}))]);
        fx.router.get_all("fees", &Filters::new()).await.unwrap();

        fx.remote.fail_next(Error::Remote("503 Service Unavailable".to_string()));
        let listed = fx.router.get_all("fees", &Filters::new()).await.unwrap();
        assert_eq!(listed.source, DataSource::Cache);

        fx.remote.fail_next(Error::permission_denied("row level security"));
        let err = fx.router.get_all("fees", &Filters::new()).await.unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");
    }

    #[tokio::test]
    async fn test_online_version_conflict() {
        let fx = fixture();
        fx.remote
            .seed("fees", [record(json!({"id": "f1", "amount": 100, "version": 3}))]);

        let err = fx
            .router
            .update("fees", "f1", record(json!({"amount": 150, "version": 2})))
            .await
            .unwrap_err();
        let failure = err.to_failure();
        assert_eq!(failure.error, "VERSION_CONFLICT");
        assert_eq!(failure.details, json!({"currentVersion": 3, "attemptedVersion": 2}));

        let updated = fx
            .router
            .update("fees", "f1", record(json!({"amount": 150, "version": 3})))
            .await
            .unwrap();
        assert_eq!(updated.data["version"], 4);
        assert_eq!(fx.remote.get("fees", "f1").unwrap()["amount"], 150);
    }

    #[tokio::test]
    async fn test_offline_update_records_base_timestamp() {
        let fx = fixture();
        fx.remote.seed(
            "fees",
            [record(json!({
                "id": "f1", "amount": 100, "version": 1,
                "updated_at": "2024-01-01T00:00:00.000Z"
            }))],
        );
        fx.router.get_all("fees", &Filters::new()).await.unwrap();
        fx.router.auth.ensure(true).await.unwrap();
        fx.remote.set_reachable(false);

        let updated = fx
            .router
            .update("fees", "f1", record(json!({"amount": 120})))
            .await
            .unwrap();
        assert_eq!(updated.data["version"], 2);
        assert_eq!(updated.data["amount"], 120);

        let entry = &fx.queue.snapshot()[0];
        assert_eq!(entry.operation, Operation::Update);
        assert_eq!(
            entry.base_updated_at.as_deref(),
            Some("2024-01-01T00:00:00.000Z")
        );

        let fetched = fx.router.get_by_id("fees", "f1").await.unwrap();
        assert_eq!(fetched.data["amount"], 120);
    }

    #[tokio::test]
    async fn test_queued_delete_wins_on_read() {
        let fx = fixture();
        fx.remote.seed("fees", [record(json!({"id": "f1"}))]);
        fx.router.get_all("fees", &Filters::new()).await.unwrap();
        fx.router.auth.ensure(true).await.unwrap();

        fx.remote.set_reachable(false);
        let removed = fx.router.remove("fees", "f1").await.unwrap();
        assert!(removed.success && !removed.online);

        fx.remote.set_reachable(true);
        assert!(fx.remote.get("fees", "f1").is_some());
        let err = fx.router.get_by_id("fees", "f1").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        let listed = fx.router.get_all("fees", &Filters::new()).await.unwrap();
        assert!(listed.data.is_empty());
    }

    #[tokio::test]
    async fn test_online_remove_is_idempotent() {
        let fx = fixture();
        let removed = fx.router.remove("fees", "missing").await.unwrap();
        assert!(removed.success && removed.online);
    }

    #[tokio::test]
    async fn test_create_over_existing_id_bumps_version() {
        let fx = fixture();
        fx.remote.seed(
            "fees",
            [record(json!({
                "id": "f1",
                "amount": 100,
                "version": 5,
                "created_at": "2024-01-01T00:00:00.000Z"
            }))],
        );

        let created = fx
            .router
            .create("fees", record(json!({"id": "f1", "amount": 120})))
            .await
            .unwrap();
        assert_eq!(created.data[VERSION], 6);
        assert_eq!(created.data[CREATED_AT], "2024-01-01T00:00:00.000Z");
        assert_eq!(fx.remote.get("fees", "f1").unwrap()[VERSION], 6);

        let updated = fx
            .router
            .update("fees", "f1", record(json!({"amount": 130, "version": 6})))
            .await
            .unwrap();
        assert_eq!(updated.data[VERSION], 7);
    }

    #[tokio::test]
    async fn test_cache_failures_do_not_fail_reads() {
        let store = BrokenCacheStore(MemoryStore::new());
        let fx = fixture_with_store(Arc::new(store));
        fx.remote
            .seed("fees", [record(json!({"id": "f1", "amount": 100}))]);

        let listed = fx.router.get_all("fees", &Filters::new()).await.unwrap();
        assert!(listed.online);
        assert_eq!(listed.data.len(), 1);

        let fetched = fx.router.get_by_id("fees", "f1").await.unwrap();
        assert_eq!(fetched.data["amount"], 100);

        fx.remote.set_reachable(false);
        let err = fx.router.get_all("fees", &Filters::new()).await.unwrap_err();
        assert_eq!(err.code(), "NETWORK_UNAVAILABLE");
    }
}
