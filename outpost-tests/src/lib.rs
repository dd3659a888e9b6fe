/// Test utilities and helpers for Outpost testing
///
/// Wraps an [`Engine`] wired to an in-process remote so tests can flip
/// connectivity, edit the server "as another client" and restart the engine
/// over the same local store.

use chrono::{Duration as ChronoDuration, Utc};
use outpost_core::{
    format_timestamp, into_record, EngineConfig, FileStore, LocalStore, MemoryStore, Record,
    StoreExt,
};
use outpost_sync::{Engine, MemoryRemote, Session};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Engine plus the handles tests need to drive it
pub struct TestEngine {
    pub engine: Engine,
    pub remote: Arc<MemoryRemote>,
    pub store: Arc<dyn LocalStore>,
    path: Option<PathBuf>,
    _temp_dir: Option<TempDir>,
}

impl TestEngine {
    /// In-memory engine that probes on every call
    pub fn new() -> Self {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryRemote::new());
        let engine = build(store.clone(), remote.clone(), test_config());
        Self {
            engine,
            remote,
            store,
            path: None,
            _temp_dir: None,
        }
    }

    /// Engine backed by a file store in a temporary directory
    pub fn on_disk() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().to_path_buf();
        let store: Arc<dyn LocalStore> =
            Arc::new(FileStore::open(&path).expect("Failed to open file store"));
        let remote = Arc::new(MemoryRemote::new());
        let engine = build(store.clone(), remote.clone(), test_config());
        Self {
            engine,
            remote,
            store,
            path: Some(path),
            _temp_dir: Some(temp_dir),
        }
    }

    /// Drops the engine and builds a new one over the same store directory
    /// and remote, as a process restart would.
    pub fn restart(self) -> Self {
        let Self {
            engine,
            remote,
            store,
            path,
            _temp_dir,
        } = self;
        drop(engine);

        let store = match &path {
            Some(path) => {
                drop(store);
                Arc::new(FileStore::open(path).expect("Failed to reopen file store"))
                    as Arc<dyn LocalStore>
            }
            None => store,
        };
        let engine = build(store.clone(), remote.clone(), test_config());
        Self {
            engine,
            remote,
            store,
            path,
            _temp_dir,
        }
    }

    pub fn go_offline(&self) {
        self.remote.set_reachable(false);
    }

    pub fn go_online(&self) {
        self.remote.set_reachable(true);
    }

    /// Leaves a signed-in session behind, as an earlier online session would.
    pub fn remember_session(&self, user_id: &str) {
        self.store
            .set_json("auth_session", &Session::new(user_id))
            .expect("Failed to store session");
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn test_config() -> EngineConfig {
    EngineConfig::new()
        .with_probe_cache_window(Duration::ZERO)
        .with_probe_timeout(Duration::from_secs(1))
}

fn build(store: Arc<dyn LocalStore>, remote: Arc<MemoryRemote>, config: EngineConfig) -> Engine {
    Engine::builder()
        .with_store(store)
        .with_remote(remote)
        .with_config(config)
        .build()
        .expect("Failed to build engine")
}

/// Builds a record from a JSON object literal
pub fn record(value: Value) -> Record {
    into_record(value).expect("record must be a JSON object")
}

/// Timestamp `minutes` before now, formatted like record timestamps
pub fn minutes_ago(minutes: i64) -> String {
    format_timestamp(Utc::now() - ChronoDuration::minutes(minutes))
}

/// Timestamp `seconds` after now
pub fn seconds_from_now(seconds: i64) -> String {
    format_timestamp(Utc::now() + ChronoDuration::seconds(seconds))
}

/// Ids of `records`, in order
pub fn ids(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .filter_map(|r| r.get("id").and_then(Value::as_str).map(str::to_string))
        .collect()
}
