/// Sync orchestrator
///
/// Drains the sync queue against the remote backend and runs full-collection
/// reconciliation. Only one drain or reconciliation runs at a time.

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use outpost_core::{Error, Filters, Record, RecordExt, Result};

use crate::cache::CollectionCache;
use crate::collections::LocalCollections;
use crate::conflict::{merge_collections, ConflictResolver};
use crate::monitor::ConnectionMonitor;
use crate::queue::{FailureOutcome, Operation, QueueEntry, SyncQueue};
use crate::remote::RemoteBackend;

/// Outcome counts of one drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Entries applied remotely, including resolved conflicts
    pub synced: usize,
    /// Deletes skipped because the server copy was newer
    pub conflicts: usize,
    /// Entries that failed and stay queued
    pub errors: usize,
    /// Entries dropped as permanently unfixable
    pub dropped: usize,
    /// Synced entries that went through conflict resolution
    pub resolved: usize,
    /// Entries held back by backoff or an earlier failure on the same record
    pub deferred: usize,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        *self == DrainReport::default()
    }
}

/// Outcome of reconciling one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub table: String,
    pub server_records: usize,
    pub local_only: usize,
    pub total: usize,
}

/// Drain followed by reconciliation of every known table
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub drain: DrainReport,
    pub reconciled: Vec<ReconcileReport>,
}

enum Applied {
    Saved { record: Record, resolved: bool },
    Deleted,
    /// Server copy changed after the delete was queued
    DeleteSkipped { server: Record },
}

pub struct SyncOrchestrator {
    remote: Arc<dyn RemoteBackend>,
    monitor: Arc<ConnectionMonitor>,
    cache: Arc<CollectionCache>,
    collections: Arc<LocalCollections>,
    queue: Arc<SyncQueue>,
    resolver: Arc<dyn ConflictResolver>,
    update_conflict_tolerance: Duration,
    sync_lock: Mutex<()>,
}

impl SyncOrchestrator {
    pub fn new(
        remote: Arc<dyn RemoteBackend>,
        monitor: Arc<ConnectionMonitor>,
        cache: Arc<CollectionCache>,
        collections: Arc<LocalCollections>,
        queue: Arc<SyncQueue>,
        resolver: Arc<dyn ConflictResolver>,
        update_conflict_tolerance: Duration,
    ) -> Self {
        Self {
            remote,
            monitor,
            cache,
            collections,
            queue,
            resolver,
            update_conflict_tolerance,
            sync_lock: Mutex::new(()),
        }
    }

    /// Applies queued mutations in timestamp order.
    ///
    /// Returns an empty report when offline, when the queue is empty, or when
    /// another drain is already running.
    pub async fn drain(&self) -> Result<DrainReport> {
        let Ok(_guard) = self.sync_lock.try_lock() else {
            debug!("Drain already in progress");
            return Ok(DrainReport::default());
        };
        self.drain_locked().await
    }

    /// Pulls every row of `table`, merges it with the local collection and
    /// refreshes the cache.
    pub async fn reconcile(&self, table: &str) -> Result<ReconcileReport> {
        let _guard = self.sync_lock.lock().await;
        self.reconcile_locked(table).await
    }

    /// Reconciles every table known locally. Stops at the first transient
    /// error; other per-table errors are logged and skipped.
    pub async fn reconcile_all(&self) -> Result<Vec<ReconcileReport>> {
        let _guard = self.sync_lock.lock().await;
        self.reconcile_all_locked().await
    }

    /// Drain, then reconcile everything if the backend is still reachable.
    pub async fn drain_and_reconcile(&self) -> Result<SyncReport> {
        let Ok(_guard) = self.sync_lock.try_lock() else {
            debug!("Sync already in progress");
            return Ok(SyncReport::default());
        };

        let drain = self.drain_locked().await?;
        let reconciled = if self.monitor.is_available().await {
            self.reconcile_all_locked().await?
        } else {
            Vec::new()
        };
        Ok(SyncReport { drain, reconciled })
    }

    async fn drain_locked(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        if self.queue.is_empty() {
            return Ok(report);
        }
        if !self.monitor.is_available().await {
            debug!("Skipping drain of {} entries: offline", self.queue.len());
            return Ok(report);
        }

        let snapshot = self.queue.snapshot();
        info!("Draining {} queued operations", snapshot.len());

        let now = Utc::now();
        let mut blocked: HashSet<(String, String)> = HashSet::new();
        let mut touched: BTreeSet<String> = BTreeSet::new();

        for entry in snapshot {
            let record_key = (
                entry.table.clone(),
                entry.record_id().unwrap_or_default().to_string(),
            );
            if blocked.contains(&record_key) {
                report.deferred += 1;
                continue;
            }
            if !entry.is_ready(self.queue.policy(), now) {
                blocked.insert(record_key);
                report.deferred += 1;
                continue;
            }

            match self.apply(&entry).await {
                Ok(applied) => {
                    self.queue.remove(&entry.id)?;
                    match applied {
                        Applied::Saved { record, resolved } => {
                            report.synced += 1;
                            if resolved {
                                report.resolved += 1;
                            }
                            self.collections.upsert(&entry.table, &record)?;
                        }
                        Applied::Deleted => {
                            report.synced += 1;
                            self.collections.remove(&entry.table, &record_key.1)?;
                        }
                        Applied::DeleteSkipped { server } => {
                            report.conflicts += 1;
                            self.collections.upsert(&entry.table, &server)?;
                        }
                    }
                    touched.insert(entry.table.clone());
                }
                Err(e) if e.is_permanent() => {
                    warn!(
                        "Dropping {} on {}/{}: {}",
                        entry.operation.as_str(),
                        entry.table,
                        record_key.1,
                        e
                    );
                    self.queue.remove(&entry.id)?;
                    report.dropped += 1;
                }
                Err(e) => {
                    report.errors += 1;
                    blocked.insert(record_key);
                    match self.queue.record_failure(&entry.id, &e.to_string())? {
                        FailureOutcome::Retrying {
                            attempts,
                            next_attempt_at,
                        } => debug!(
                            "{} on {} failed (attempt {}), next try at {}: {}",
                            entry.operation.as_str(),
                            entry.table,
                            attempts,
                            next_attempt_at,
                            e
                        ),
                        FailureOutcome::Exhausted | FailureOutcome::Missing => {}
                    }
                }
            }
        }

        for table in &touched {
            self.cache.invalidate(table)?;
        }

        info!(
            "Drain finished: {} synced, {} conflicts, {} errors, {} dropped",
            report.synced, report.conflicts, report.errors, report.dropped
        );
        Ok(report)
    }

    async fn apply(&self, entry: &QueueEntry) -> Result<Applied> {
        let table = entry.table.as_str();
        let id = entry
            .record_id()
            .ok_or_else(|| Error::InvalidRecord(format!("queued {} without id", table)))?;

        let server = self.remote.fetch(table, id).await?;

        match (entry.operation, server) {
            (Operation::Insert, Some(server)) => self.apply_resolved(entry, id, &server).await,
            (Operation::Insert, None) | (Operation::Update, None) => {
                let record = self.remote.insert(table, entry.data.clone()).await?;
                Ok(Applied::Saved {
                    record,
                    resolved: false,
                })
            }
            (Operation::Update, Some(server)) => {
                if self.has_drifted(&server, entry) {
                    self.apply_resolved(entry, id, &server).await
                } else {
                    let record = self.remote.update(table, id, entry.data.clone()).await?;
                    Ok(Applied::Saved {
                        record,
                        resolved: false,
                    })
                }
            }
            (Operation::Delete, None) => Err(Error::NotFound(format!("{}/{}", table, id))),
            (Operation::Delete, Some(server)) => {
                if server.updated_at().is_some_and(|at| at > entry.queued_at()) {
                    info!(
                        "Skipping delete of {}/{}: changed on the server after it was queued",
                        table, id
                    );
                    return Ok(Applied::DeleteSkipped { server });
                }
                self.remote.delete(table, id).await?;
                Ok(Applied::Deleted)
            }
        }
    }

    async fn apply_resolved(&self, entry: &QueueEntry, id: &str, server: &Record) -> Result<Applied> {
        let resolved = self
            .resolver
            .resolve(&entry.table, Some(&entry.data), Some(server))
            .ok_or_else(|| Error::Internal("resolver returned no record".to_string()))?;
        let record = self
            .remote
            .update(&entry.table, id, resolved.record)
            .await?;
        Ok(Applied::Saved {
            record,
            resolved: true,
        })
    }

    /// Whether the server copy moved away from the one the update was based on.
    fn has_drifted(&self, server: &Record, entry: &QueueEntry) -> bool {
        match (server.updated_at(), entry.base_timestamp()) {
            (Some(server_at), Some(base_at)) => {
                let drift = (server_at - base_at).num_milliseconds().unsigned_abs();
                drift > self.update_conflict_tolerance.as_millis() as u64
            }
            // Unknown base: let the resolver decide
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    async fn reconcile_locked(&self, table: &str) -> Result<ReconcileReport> {
        let server = self.remote.select(table, &Filters::new()).await?;

        let server_ids: HashSet<&str> = server.iter().filter_map(|r| r.id()).collect();
        let merged = self
            .collections
            .replace_with(table, |local| merge_collections(&server, &local))?;
        let local_only = merged
            .iter()
            .filter(|r| r.id().is_some_and(|id| !server_ids.contains(id)))
            .count();

        self.cache.invalidate(table)?;
        self.cache.put(table, &Filters::new(), merged.clone())?;

        debug!(
            "Reconciled {}: {} from server, {} local only",
            table,
            server.len(),
            local_only
        );
        Ok(ReconcileReport {
            table: table.to_string(),
            server_records: server.len(),
            local_only,
            total: merged.len(),
        })
    }

    async fn reconcile_all_locked(&self) -> Result<Vec<ReconcileReport>> {
        let mut tables: BTreeSet<String> = self.collections.tables()?.into_iter().collect();
        tables.extend(self.cache.tables());

        let mut reports = Vec::with_capacity(tables.len());
        for table in tables {
            match self.reconcile_locked(&table).await {
                Ok(report) => reports.push(report),
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => warn!("Reconciling {} failed: {}", table, e),
            }
        }
        if !reports.is_empty() {
            info!("Reconciled {} tables", reports.len());
        }
        Ok(reports)
    }
}
