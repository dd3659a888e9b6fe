/// In-process remote backend
///
/// Behaves like a table store behind a network: it can be switched
/// unreachable, have failures injected and be edited "by another client".
/// Used by tests and local demos.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};

use outpost_core::{Error, Filters, Record, RecordExt, Result};

use super::{RemoteBackend, Session};

struct MemoryRemoteState {
    tables: BTreeMap<String, Vec<Record>>,
    reachable: bool,
    session: Option<Session>,
    injected: VecDeque<Error>,
    calls: Vec<String>,
}

pub struct MemoryRemote {
    state: Mutex<MemoryRemoteState>,
}

impl MemoryRemote {
    /// Reachable backend with a signed-in session
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryRemoteState {
                tables: BTreeMap::new(),
                reachable: true,
                session: Some(Session::new("local-user")),
                injected: VecDeque::new(),
                calls: Vec::new(),
            }),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    pub fn is_reachable(&self) -> bool {
        self.state.lock().reachable
    }

    pub fn set_session(&self, session: Option<Session>) {
        self.state.lock().session = session;
    }

    /// Makes the next data operation fail with `error`.
    pub fn fail_next(&self, error: Error) {
        self.state.lock().injected.push_back(error);
    }

    /// Writes a row directly, as another client would.
    pub fn put(&self, table: &str, record: Record) {
        let mut state = self.state.lock();
        let rows = state.tables.entry(table.to_string()).or_default();
        match rows.iter().position(|r| r.id() == record.id()) {
            Some(idx) => rows[idx] = record,
            None => rows.push(record),
        }
    }

    pub fn seed(&self, table: &str, records: impl IntoIterator<Item = Record>) {
        for record in records {
            self.put(table, record);
        }
    }

    pub fn get(&self, table: &str, id: &str) -> Option<Record> {
        let state = self.state.lock();
        state
            .tables
            .get(table)
            .and_then(|rows| rows.iter().find(|r| r.id() == Some(id)).cloned())
    }

    pub fn records(&self, table: &str) -> Vec<Record> {
        self.state
            .lock()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Log of data operations, formatted as `op:table[:id]`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn begin(&self, call: String) -> Result<parking_lot::MutexGuard<'_, MemoryRemoteState>> {
        let mut state = self.state.lock();
        if !state.reachable {
            return Err(Error::NetworkUnavailable("memory remote is offline".to_string()));
        }
        state.calls.push(call);
        if let Some(error) = state.injected.pop_front() {
            return Err(error);
        }
        Ok(state)
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

fn require_id(record: &Record) -> Result<String> {
    record
        .id()
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidRecord("record has no id".to_string()))
}

#[async_trait]
impl RemoteBackend for MemoryRemote {
    async fn probe(&self) -> Result<()> {
        if self.state.lock().reachable {
            Ok(())
        } else {
            Err(Error::NetworkUnavailable("memory remote is offline".to_string()))
        }
    }

    async fn session(&self) -> Result<Option<Session>> {
        let state = self.state.lock();
        if !state.reachable {
            return Err(Error::NetworkUnavailable("memory remote is offline".to_string()));
        }
        Ok(state.session.clone())
    }

    async fn select(&self, table: &str, filters: &Filters) -> Result<Vec<Record>> {
        let state = self.begin(format!("select:{}", table))?;
        Ok(state
            .tables
            .get(table)
            .map(|rows| filters.apply(rows))
            .unwrap_or_default())
    }

    async fn fetch(&self, table: &str, id: &str) -> Result<Option<Record>> {
        let state = self.begin(format!("fetch:{}:{}", table, id))?;
        Ok(state
            .tables
            .get(table)
            .and_then(|rows| rows.iter().find(|r| r.id() == Some(id)).cloned()))
    }

    async fn insert(&self, table: &str, record: Record) -> Result<Record> {
        let id = require_id(&record)?;
        let mut state = self.begin(format!("insert:{}:{}", table, id))?;
        let rows = state.tables.entry(table.to_string()).or_default();
        if rows.iter().any(|r| r.id() == Some(id.as_str())) {
            return Err(Error::DuplicateKey(format!(
                "duplicate key value violates unique constraint \"{}_pkey\"",
                table
            )));
        }
        rows.push(record.clone());
        Ok(record)
    }

    async fn upsert(&self, table: &str, record: Record) -> Result<Record> {
        let id = require_id(&record)?;
        let mut state = self.begin(format!("upsert:{}:{}", table, id))?;
        let rows = state.tables.entry(table.to_string()).or_default();
        match rows.iter_mut().find(|r| r.id() == Some(id.as_str())) {
            Some(existing) => {
                existing.overlay(&record);
                Ok(existing.clone())
            }
            None => {
                rows.push(record.clone());
                Ok(record)
            }
        }
    }

    async fn update(&self, table: &str, id: &str, patch: Record) -> Result<Record> {
        let mut state = self.begin(format!("update:{}:{}", table, id))?;
        let existing = state
            .tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|r| r.id() == Some(id)))
            .ok_or_else(|| Error::NotFound(format!("{}/{}", table, id)))?;
        existing.overlay(&patch);
        Ok(existing.clone())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        let mut state = self.begin(format!("delete:{}:{}", table, id))?;
        let rows = state
            .tables
            .get_mut(table)
            .ok_or_else(|| Error::NotFound(format!("{}/{}", table, id)))?;
        let before = rows.len();
        rows.retain(|r| r.id() != Some(id));
        if rows.len() == before {
            return Err(Error::NotFound(format!("{}/{}", table, id)));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
