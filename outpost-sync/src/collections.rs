/// Raw local collections
///
/// The device's own copy of each table, stored under `collection:<table>`.
/// Written by local mutations and reconciliation; read when neither the
/// remote nor the cache can serve a request.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

use outpost_core::{LocalStore, Record, RecordExt, Result, StoreExt};

const COLLECTION_PREFIX: &str = "collection:";
const COLLECTIONS_INDEX_KEY: &str = "collections";

pub struct LocalCollections {
    store: Arc<dyn LocalStore>,
    // Serializes read-modify-write cycles on a collection
    write_lock: Mutex<()>,
}

impl LocalCollections {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Loads a collection. `None` means the table was never stored locally,
    /// as opposed to stored and empty.
    pub fn load(&self, table: &str) -> Result<Option<Vec<Record>>> {
        self.store.get_json(&collection_key(table))
    }

    pub fn save(&self, table: &str, records: &[Record]) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.save_locked(table, records)
    }

    /// Replaces the record with the same id, or appends it.
    pub fn upsert(&self, table: &str, record: &Record) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut records = self.load(table)?.unwrap_or_default();
        match records
            .iter()
            .position(|r| r.id().is_some() && r.id() == record.id())
        {
            Some(idx) => records[idx] = record.clone(),
            None => records.push(record.clone()),
        }
        self.save_locked(table, &records)
    }

    /// Removes the record; returns whether it was present.
    pub fn remove(&self, table: &str, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let Some(mut records) = self.load(table)? else {
            return Ok(false);
        };
        let before = records.len();
        records.retain(|r| r.id() != Some(id));
        if records.len() == before {
            return Ok(false);
        }
        self.save_locked(table, &records)?;
        Ok(true)
    }

    /// Replaces a collection with `f(current)` without letting another write
    /// land in between.
    pub fn replace_with<F>(&self, table: &str, f: F) -> Result<Vec<Record>>
    where
        F: FnOnce(Vec<Record>) -> Vec<Record>,
    {
        let _guard = self.write_lock.lock();
        let records = f(self.load(table)?.unwrap_or_default());
        self.save_locked(table, &records)?;
        Ok(records)
    }

    pub fn find(&self, table: &str, id: &str) -> Result<Option<Record>> {
        Ok(self
            .load(table)?
            .and_then(|records| records.into_iter().find(|r| r.id() == Some(id))))
    }

    /// Tables that have a local collection.
    pub fn tables(&self) -> Result<Vec<String>> {
        let index: BTreeSet<String> = self
            .store
            .get_json(COLLECTIONS_INDEX_KEY)?
            .unwrap_or_default();
        Ok(index.into_iter().collect())
    }

    fn save_locked(&self, table: &str, records: &[Record]) -> Result<()> {
        self.store.set_json(&collection_key(table), records)?;

        let mut index: BTreeSet<String> = self
            .store
            .get_json(COLLECTIONS_INDEX_KEY)?
            .unwrap_or_default();
        if index.insert(table.to_string()) {
            self.store.set_json(COLLECTIONS_INDEX_KEY, &index)?;
        }
        Ok(())
    }
}

fn collection_key(table: &str) -> String {
    format!("{}{}", COLLECTION_PREFIX, table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_core::{into_record, MemoryStore};
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        into_record(value).unwrap()
    }

    #[test]
    fn test_missing_vs_empty() {
        let collections = LocalCollections::new(Arc::new(MemoryStore::new()));
        assert!(collections.load("fees").unwrap().is_none());

        collections.save("fees", &[]).unwrap();
        assert_eq!(collections.load("fees").unwrap(), Some(vec![]));
        assert_eq!(collections.tables().unwrap(), vec!["fees".to_string()]);
    }

    #[test]
    fn test_upsert_find_remove() {
        let collections = LocalCollections::new(Arc::new(MemoryStore::new()));
        collections
            .upsert("fees", &record(json!({"id": "f1", "amount": 100})))
            .unwrap();
        collections
            .upsert("fees", &record(json!({"id": "f1", "amount": 150})))
            .unwrap();
        collections
            .upsert("fees", &record(json!({"id": "f2", "amount": 10})))
            .unwrap();

        let f1 = collections.find("fees", "f1").unwrap().unwrap();
        assert_eq!(f1["amount"], 150);
        assert_eq!(collections.load("fees").unwrap().unwrap().len(), 2);

        assert!(collections.remove("fees", "f1").unwrap());
        assert!(!collections.remove("fees", "f1").unwrap());
        assert!(!collections.remove("students", "s1").unwrap());
        assert!(collections.find("fees", "f1").unwrap().is_none());
    }

    #[test]
    fn test_replace_with() {
        let collections = LocalCollections::new(Arc::new(MemoryStore::new()));
        collections
            .upsert("fees", &record(json!({"id": "f1"})))
            .unwrap();

        let replaced = collections
            .replace_with("fees", |mut records| {
                records.push(record(json!({"id": "f2"})));
                records
            })
            .unwrap();
        assert_eq!(replaced.len(), 2);
        assert_eq!(collections.load("fees").unwrap().unwrap(), replaced);
    }
}
