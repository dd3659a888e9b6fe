/// Collection cache: last known server state per table and filter set
///
/// Entries are complete snapshots and are only ever replaced, never edited in
/// place. Each entry lives in the local store under `cache:<key>`; the set of
/// known keys (and the filters behind them) is kept under `cache_index` so
/// every variant of a table can be patched or dropped together.

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use outpost_core::{Filters, LocalStore, Record, RecordExt, Result, StoreExt};

const CACHE_PREFIX: &str = "cache:";
const CACHE_INDEX_KEY: &str = "cache_index";

/// Snapshot of a table (or filtered view of it)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub data: Vec<Record>,
    /// When the snapshot was last written (ms since epoch)
    pub timestamp: i64,
    /// When the snapshot was last refreshed from the server (ms since epoch)
    pub last_sync: i64,
}

impl CacheEntry {
    fn fresh(data: Vec<Record>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            data,
            timestamp: now,
            last_sync: now,
        }
    }

    /// Time since the snapshot was last refreshed from the server.
    pub fn age(&self) -> Duration {
        let elapsed = Utc::now().timestamp_millis() - self.last_sync;
        Duration::from_millis(elapsed.max(0) as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheVariant {
    table: String,
    filters: Filters,
}

pub struct CollectionCache {
    store: Arc<dyn LocalStore>,
    entries: RwLock<HashMap<String, CacheEntry>>,
    index: RwLock<BTreeMap<String, CacheVariant>>,
}

impl CollectionCache {
    /// Opens the cache, loading the key index from the store.
    pub fn open(store: Arc<dyn LocalStore>) -> Result<Self> {
        let index: BTreeMap<String, CacheVariant> =
            store.get_json(CACHE_INDEX_KEY)?.unwrap_or_default();
        debug!("Collection cache opened with {} entries", index.len());

        Ok(Self {
            store,
            entries: RwLock::new(HashMap::new()),
            index: RwLock::new(index),
        })
    }

    /// Snapshot stored under the composite key for `table` and `filters`.
    pub fn get(&self, table: &str, filters: &Filters) -> Result<Option<CacheEntry>> {
        self.get_key(&filters.cache_key(table))
    }

    pub fn get_key(&self, key: &str) -> Result<Option<CacheEntry>> {
        if let Some(entry) = self.entries.read().get(key) {
            return Ok(Some(entry.clone()));
        }

        let loaded: Option<CacheEntry> = self.store.get_json(&storage_key(key))?;
        if let Some(entry) = &loaded {
            self.entries.write().insert(key.to_string(), entry.clone());
        }
        Ok(loaded)
    }

    /// Replaces the snapshot for `table`/`filters`, stamping it as just synced.
    pub fn put(&self, table: &str, filters: &Filters, data: Vec<Record>) -> Result<()> {
        let key = filters.cache_key(table);
        self.write_entry(&key, CacheEntry::fresh(data))?;
        self.register(&key, table, filters)
    }

    /// Best available snapshot for a read: the exact variant, or the
    /// unfiltered table snapshot narrowed client-side.
    pub fn lookup(&self, table: &str, filters: &Filters) -> Result<Option<CacheEntry>> {
        if let Some(entry) = self.get(table, filters)? {
            return Ok(Some(entry));
        }
        if filters.is_empty() {
            return Ok(None);
        }
        Ok(self.get(table, &Filters::new())?.map(|mut entry| {
            entry.data = filters.apply(&entry.data);
            entry
        }))
    }

    /// Finds a record by id across the table's snapshots.
    pub fn find(&self, table: &str, id: &str) -> Result<Option<Record>> {
        for key in self.keys_for(table) {
            if let Some(entry) = self.get_key(&key)? {
                if let Some(record) = entry.data.iter().find(|r| r.id() == Some(id)) {
                    return Ok(Some(record.clone()));
                }
            }
        }
        Ok(None)
    }

    /// Folds records from a filtered fetch into the unfiltered table snapshot
    /// so later unfiltered reads see them. Seeds the snapshot if absent.
    pub fn absorb(&self, table: &str, records: &[Record]) -> Result<()> {
        let unfiltered = Filters::new();
        match self.get(table, &unfiltered)? {
            Some(entry) => {
                let mut data = entry.data;
                for record in records {
                    upsert_into(&mut data, record);
                }
                self.write_entry(
                    table,
                    CacheEntry {
                        data,
                        timestamp: Utc::now().timestamp_millis(),
                        last_sync: entry.last_sync,
                    },
                )
            }
            None => self.put(table, &unfiltered, records.to_vec()),
        }
    }

    /// Applies a created or updated record to every snapshot of the table.
    ///
    /// Filtered snapshots gain the record when it matches their filters and
    /// lose it when it no longer does. Tables without a snapshot are left alone.
    pub fn upsert_record(&self, table: &str, record: &Record) -> Result<()> {
        for (key, filters) in self.variants_of(table) {
            let Some(entry) = self.get_key(&key)? else {
                continue;
            };
            let mut data = entry.data;
            if filters.matches(record) {
                upsert_into(&mut data, record);
            } else {
                data.retain(|r| r.id() != record.id());
            }
            self.patch_entry(&key, entry.last_sync, data)?;
        }
        Ok(())
    }

    /// Removes a record from every snapshot of the table.
    pub fn remove_record(&self, table: &str, id: &str) -> Result<()> {
        for key in self.keys_for(table) {
            let Some(entry) = self.get_key(&key)? else {
                continue;
            };
            if entry.data.iter().any(|r| r.id() == Some(id)) {
                let data = entry
                    .data
                    .into_iter()
                    .filter(|r| r.id() != Some(id))
                    .collect();
                self.patch_entry(&key, entry.last_sync, data)?;
            }
        }
        Ok(())
    }

    /// Drops every snapshot of `table`, filtered variants included.
    pub fn invalidate(&self, table: &str) -> Result<()> {
        let keys = self.keys_for(table);
        for key in &keys {
            self.drop_entry(key)?;
        }
        if !keys.is_empty() {
            debug!("Invalidated {} cache entries for {}", keys.len(), table);
        }
        Ok(())
    }

    pub fn invalidate_all(&self) -> Result<()> {
        let keys: Vec<String> = self.index.read().keys().cloned().collect();
        for key in &keys {
            self.drop_entry(key)?;
        }
        debug!("Invalidated all {} cache entries", keys.len());
        Ok(())
    }

    /// Staleness of the snapshot for `table`/`filters`, if one exists.
    pub fn cache_age(&self, table: &str, filters: &Filters) -> Result<Option<Duration>> {
        Ok(self.get(table, filters)?.map(|entry| entry.age()))
    }

    /// Tables with at least one snapshot.
    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self
            .index
            .read()
            .values()
            .map(|variant| variant.table.clone())
            .collect();
        tables.sort();
        tables.dedup();
        tables
    }

    pub fn keys(&self) -> Vec<String> {
        self.index.read().keys().cloned().collect()
    }

    fn keys_for(&self, table: &str) -> Vec<String> {
        self.variants_of(table).into_iter().map(|(key, _)| key).collect()
    }

    fn variants_of(&self, table: &str) -> Vec<(String, Filters)> {
        self.index
            .read()
            .iter()
            .filter(|(_, variant)| variant.table == table)
            .map(|(key, variant)| (key.clone(), variant.filters.clone()))
            .collect()
    }

    fn patch_entry(&self, key: &str, last_sync: i64, data: Vec<Record>) -> Result<()> {
        self.write_entry(
            key,
            CacheEntry {
                data,
                timestamp: Utc::now().timestamp_millis(),
                last_sync,
            },
        )
    }

    fn write_entry(&self, key: &str, entry: CacheEntry) -> Result<()> {
        self.store.set_json(&storage_key(key), &entry)?;
        self.entries.write().insert(key.to_string(), entry);
        Ok(())
    }

    fn register(&self, key: &str, table: &str, filters: &Filters) -> Result<()> {
        let mut index = self.index.write();
        if index.contains_key(key) {
            return Ok(());
        }
        index.insert(
            key.to_string(),
            CacheVariant {
                table: table.to_string(),
                filters: filters.clone(),
            },
        );
        self.store.set_json(CACHE_INDEX_KEY, &*index)
    }

    fn drop_entry(&self, key: &str) -> Result<()> {
        self.store.remove(&storage_key(key))?;
        self.entries.write().remove(key);
        let mut index = self.index.write();
        if index.remove(key).is_some() {
            self.store.set_json(CACHE_INDEX_KEY, &*index)?;
        }
        Ok(())
    }
}

fn storage_key(key: &str) -> String {
    format!("{}{}", CACHE_PREFIX, key)
}

fn upsert_into(data: &mut Vec<Record>, record: &Record) {
    match data.iter().position(|r| r.id().is_some() && r.id() == record.id()) {
        Some(idx) => data[idx] = record.clone(),
        None => data.push(record.clone()),
    }
}
