/// Offline-first synchronization for Outpost
///
/// Routes table reads and writes to a remote backend when it is reachable
/// and to a local cache and durable mutation queue when it is not, then
/// drains the queue with timestamp-based conflict resolution once the
/// connection comes back.

pub mod remote;
pub mod monitor;
pub mod cache;
pub mod collections;
pub mod queue;
pub mod conflict;
pub mod auth;
pub mod router;
pub mod orchestrator;
pub mod engine;

pub use remote::{MemoryRemote, RemoteBackend, Session};
#[cfg(feature = "http-sync")]
pub use remote::HttpRemote;
pub use monitor::{ConnectionEvent, ConnectionMonitor};
pub use cache::{CacheEntry, CollectionCache};
pub use collections::LocalCollections;
pub use queue::{Operation, QueueEntry, QueueStatus, QueuedOperation, SyncQueue};
pub use conflict::{
    merge_collections, resolve, resolve_at, ConflictResolution, ConflictResolver, LastWriterWins,
    Resolved,
};
pub use auth::AuthGuard;
pub use router::{DataSource, ListResponse, RecordResponse, RemoveResponse};
pub use orchestrator::{DrainReport, ReconcileReport, SyncReport};
pub use engine::{Engine, EngineBuilder};
