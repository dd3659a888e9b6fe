/// Remote backend abstraction
///
/// The authoritative table store reached over the network. Implementations
/// report "no such row" as `Ok(None)` from [`RemoteBackend::fetch`] and map
/// backend failures onto the shared error taxonomy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use outpost_core::{Filters, Record, Result};

pub mod memory;
#[cfg(feature = "http-sync")]
pub mod http;

pub use memory::MemoryRemote;
#[cfg(feature = "http-sync")]
pub use http::HttpRemote;

/// An authenticated session as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Table-oriented query/mutation interface of the remote backend
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Lightweight reachability check
    async fn probe(&self) -> Result<()>;

    /// Current authenticated session, `None` when signed out
    async fn session(&self) -> Result<Option<Session>>;

    /// Select rows matching equality / in-set filters
    async fn select(&self, table: &str, filters: &Filters) -> Result<Vec<Record>>;

    /// Fetch a single row by id
    async fn fetch(&self, table: &str, id: &str) -> Result<Option<Record>>;

    /// Insert a new row; fails with `DuplicateKey` if the id exists
    async fn insert(&self, table: &str, record: Record) -> Result<Record>;

    /// Insert, or update the existing row with the same id
    async fn upsert(&self, table: &str, record: Record) -> Result<Record>;

    /// Update the row with `id`; fails with `NotFound` if it does not exist
    async fn update(&self, table: &str, id: &str, patch: Record) -> Result<Record>;

    /// Delete the row with `id`; fails with `NotFound` if it does not exist
    async fn delete(&self, table: &str, id: &str) -> Result<()>;

    /// Name used in logs
    fn name(&self) -> &str;
}
