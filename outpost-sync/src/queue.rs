/// Durable sync queue
///
/// Mutations that could not be applied remotely are appended here and
/// drained in timestamp order once the backend is reachable. The whole queue
/// is persisted under `sync_queue` on every change; entries that exhaust the
/// retry policy move to `sync_queue_failed`.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use outpost_core::{
    parse_timestamp, ClientId, Error, Filters, LocalStore, Record, RecordExt, Result,
    RetryPolicy, StoreExt,
};

const QUEUE_KEY: &str = "sync_queue";
const FAILED_KEY: &str = "sync_queue_failed";

/// Kind of queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

/// A mutation waiting to be applied remotely
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: String,
    pub table: String,
    pub operation: Operation,
    /// Full record for insert/update, at least the id for delete
    pub data: Record,
    /// Enqueue time in ms since epoch, strictly increasing within a queue
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    pub client_id: ClientId,
    /// `updated_at` of the record this mutation was made against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_updated_at: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueueEntry {
    pub fn record_id(&self) -> Option<&str> {
        self.data.id()
    }

    pub fn queued_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn base_timestamp(&self) -> Option<DateTime<Utc>> {
        self.base_updated_at
            .as_ref()
            .and_then(|ts| parse_timestamp(&serde_json::Value::String(ts.clone())))
    }

    /// Whether the entry's backoff has elapsed.
    pub fn is_ready(&self, policy: &RetryPolicy, now: DateTime<Utc>) -> bool {
        match self.last_attempt_at.and_then(|ms| Utc.timestamp_millis_opt(ms).single()) {
            Some(last) => policy.next_attempt_at(self.attempts, last) <= now,
            None => true,
        }
    }
}

/// Outcome of recording a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Entry stays queued until `next_attempt_at`
    Retrying {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Entry moved to the failed list
    Exhausted,
    /// Entry was no longer queued
    Missing,
}

/// One line of the queue diagnostic
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: String,
    pub table: String,
    pub operation: Operation,
    pub record_id: Option<String>,
    pub timestamp: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl From<&QueueEntry> for QueuedOperation {
    fn from(entry: &QueueEntry) -> Self {
        Self {
            id: entry.id.clone(),
            table: entry.table.clone(),
            operation: entry.operation,
            record_id: entry.record_id().map(str::to_string),
            timestamp: entry.timestamp,
            attempts: entry.attempts,
            last_error: entry.last_error.clone(),
        }
    }
}

/// Queue diagnostic: counts plus a per-operation summary
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub pending: usize,
    pub failed: usize,
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    pub by_table: BTreeMap<String, usize>,
    pub oldest_timestamp: Option<i64>,
    pub client_id: String,
    pub operations: Vec<QueuedOperation>,
}

pub struct SyncQueue {
    store: Arc<dyn LocalStore>,
    client_id: ClientId,
    policy: RetryPolicy,
    max_size: usize,
    entries: Mutex<Vec<QueueEntry>>,
    failed: Mutex<Vec<QueueEntry>>,
    last_timestamp: AtomicI64,
}

impl SyncQueue {
    /// Opens the queue, restoring pending and failed entries from the store.
    pub fn open(
        store: Arc<dyn LocalStore>,
        client_id: ClientId,
        policy: RetryPolicy,
        max_size: usize,
    ) -> Result<Self> {
        let entries: Vec<QueueEntry> = store.get_json(QUEUE_KEY)?.unwrap_or_default();
        let failed: Vec<QueueEntry> = store.get_json(FAILED_KEY)?.unwrap_or_default();
        let last = entries.iter().map(|e| e.timestamp).max().unwrap_or(0);

        if !entries.is_empty() || !failed.is_empty() {
            info!(
                "Restored sync queue: {} pending, {} failed",
                entries.len(),
                failed.len()
            );
        }

        Ok(Self {
            store,
            client_id,
            policy,
            max_size,
            entries: Mutex::new(entries),
            failed: Mutex::new(failed),
            last_timestamp: AtomicI64::new(last),
        })
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Appends a mutation and persists the whole queue.
    ///
    /// The in-memory queue only changes once the write succeeded.
    pub fn enqueue(
        &self,
        table: &str,
        operation: Operation,
        data: Record,
        base_updated_at: Option<String>,
    ) -> Result<QueueEntry> {
        if data.id().is_none() {
            return Err(Error::InvalidRecord(format!(
                "cannot queue {} on {} without an id",
                operation.as_str(),
                table
            )));
        }

        let mut entries = self.entries.lock();
        if entries.len() >= self.max_size {
            return Err(Error::ResourceExhausted(format!(
                "sync queue is full ({} entries)",
                self.max_size
            )));
        }

        let entry = QueueEntry {
            id: uuid::Uuid::new_v4().to_string(),
            table: table.to_string(),
            operation,
            version: data.version(),
            data,
            timestamp: self.next_timestamp(),
            client_id: self.client_id.clone(),
            base_updated_at,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
        };

        let mut updated = entries.clone();
        updated.push(entry.clone());
        self.store.set_json(QUEUE_KEY, &updated)?;
        *entries = updated;

        debug!(
            "Queued {} on {}/{} ({} pending)",
            operation.as_str(),
            table,
            entry.record_id().unwrap_or("?"),
            entries.len()
        );
        Ok(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy of the pending entries in timestamp order.
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        let mut entries = self.entries.lock().clone();
        entries.sort_by_key(|e| e.timestamp);
        entries
    }

    /// Pending entries for one table, in timestamp order.
    pub fn pending_for(&self, table: &str) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self
            .entries
            .lock()
            .iter()
            .filter(|e| e.table == table)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.timestamp);
        entries
    }

    /// Removes an entry after it was applied or judged unfixable.
    pub fn remove(&self, entry_id: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        if !entries.iter().any(|e| e.id == entry_id) {
            return Ok(false);
        }

        let updated: Vec<QueueEntry> = entries
            .iter()
            .filter(|e| e.id != entry_id)
            .cloned()
            .collect();
        self.store.set_json(QUEUE_KEY, &updated)?;
        *entries = updated;
        Ok(true)
    }

    /// Records a transient failure, applying backoff or moving the entry to
    /// the failed list once the retry policy is exhausted.
    pub fn record_failure(&self, entry_id: &str, error: &str) -> Result<FailureOutcome> {
        let mut entries = self.entries.lock();
        let Some(position) = entries.iter().position(|e| e.id == entry_id) else {
            return Ok(FailureOutcome::Missing);
        };

        let now = Utc::now();
        let mut updated = entries.clone();
        let entry = &mut updated[position];
        entry.attempts += 1;
        entry.last_attempt_at = Some(now.timestamp_millis());
        entry.last_error = Some(error.to_string());

        if self.policy.is_exhausted(entry.attempts) {
            let exhausted = updated.remove(position);
            warn!(
                "Giving up on {} {}/{} after {} attempts: {}",
                exhausted.operation.as_str(),
                exhausted.table,
                exhausted.record_id().unwrap_or("?"),
                exhausted.attempts,
                error
            );

            let mut failed = self.failed.lock();
            let mut failed_updated = failed.clone();
            failed_updated.push(exhausted);
            self.store.set_json(FAILED_KEY, &failed_updated)?;
            self.store.set_json(QUEUE_KEY, &updated)?;
            *failed = failed_updated;
            *entries = updated;
            return Ok(FailureOutcome::Exhausted);
        }

        let attempts = entry.attempts;
        let next_attempt_at = self.policy.next_attempt_at(attempts, now);
        self.store.set_json(QUEUE_KEY, &updated)?;
        *entries = updated;
        Ok(FailureOutcome::Retrying {
            attempts,
            next_attempt_at,
        })
    }

    /// Entries that exhausted the retry policy.
    pub fn failed(&self) -> Vec<QueueEntry> {
        self.failed.lock().clone()
    }

    /// Moves every failed entry back into the live queue with a fresh
    /// attempt counter. Returns how many were re-queued.
    pub fn retry_failed(&self) -> Result<usize> {
        let mut entries = self.entries.lock();
        let mut failed = self.failed.lock();
        if failed.is_empty() {
            return Ok(0);
        }

        let mut updated = entries.clone();
        for entry in failed.iter() {
            let mut entry = entry.clone();
            entry.attempts = 0;
            entry.last_attempt_at = None;
            entry.last_error = None;
            updated.push(entry);
        }
        updated.sort_by_key(|e| e.timestamp);

        self.store.set_json(QUEUE_KEY, &updated)?;
        self.store.set_json(FAILED_KEY, &Vec::<QueueEntry>::new())?;
        let count = failed.len();
        *entries = updated;
        failed.clear();

        info!("Re-queued {} failed operations", count);
        Ok(count)
    }

    pub fn status(&self) -> QueueStatus {
        let entries = self.snapshot();
        let failed = self.failed.lock().len();

        let mut by_table = BTreeMap::new();
        let (mut inserts, mut updates, mut deletes) = (0, 0, 0);
        for entry in &entries {
            *by_table.entry(entry.table.clone()).or_insert(0) += 1;
            match entry.operation {
                Operation::Insert => inserts += 1,
                Operation::Update => updates += 1,
                Operation::Delete => deletes += 1,
            }
        }

        QueueStatus {
            pending: entries.len(),
            failed,
            inserts,
            updates,
            deletes,
            by_table,
            oldest_timestamp: entries.first().map(|e| e.timestamp),
            client_id: self.client_id.to_string(),
            operations: entries.iter().map(QueuedOperation::from).collect(),
        }
    }

    /// Drops every pending and failed entry.
    pub fn clear(&self) -> Result<()> {
        let mut entries = self.entries.lock();
        let mut failed = self.failed.lock();
        self.store.remove(QUEUE_KEY)?;
        self.store.remove(FAILED_KEY)?;
        entries.clear();
        failed.clear();
        Ok(())
    }

    fn next_timestamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last_timestamp.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self.last_timestamp.compare_exchange(
                last,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }
}

/// Overlays queued mutations onto a list of records (read-your-writes).
///
/// Queued inserts and updates are applied in order; records that stop
/// matching `filters` are dropped and new ones are added only when they
/// match. Any queued delete removes the record regardless of order.
pub fn overlay_pending(
    mut records: Vec<Record>,
    pending: &[QueueEntry],
    filters: &Filters,
) -> Vec<Record> {
    let mut deleted = HashSet::new();

    for entry in pending {
        let Some(id) = entry.record_id() else {
            continue;
        };
        let position = records.iter().position(|r| r.id() == Some(id));

        match entry.operation {
            Operation::Delete => {
                deleted.insert(id.to_string());
            }
            Operation::Insert | Operation::Update => {
                let merged = match position {
                    Some(idx) => {
                        let mut existing = records[idx].clone();
                        existing.overlay(&entry.data);
                        existing
                    }
                    None => entry.data.clone(),
                };
                match (position, filters.matches(&merged)) {
                    (Some(idx), true) => records[idx] = merged,
                    (Some(idx), false) => {
                        records.remove(idx);
                    }
                    (None, true) => records.push(merged),
                    (None, false) => {}
                }
            }
        }
    }

    if !deleted.is_empty() {
        records.retain(|r| r.id().map_or(true, |id| !deleted.contains(id)));
    }
    records
}

/// Overlays queued mutations for a single record id.
pub fn overlay_pending_record(
    record: Option<Record>,
    pending: &[QueueEntry],
    id: &str,
) -> Option<Record> {
    let relevant: Vec<&QueueEntry> = pending
        .iter()
        .filter(|e| e.record_id() == Some(id))
        .collect();

    if relevant.iter().any(|e| e.operation == Operation::Delete) {
        return None;
    }

    relevant.into_iter().fold(record, |current, entry| match current {
        Some(mut existing) => {
            existing.overlay(&entry.data);
            Some(existing)
        }
        None => Some(entry.data.clone()),
    })
}
