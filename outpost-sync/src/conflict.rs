/// Conflict resolution and collection merge
///
/// Whole-record last-writer-wins: the side with the newer timestamp wins
/// every field both sides define, and fields only the loser has are kept.
/// Concurrent edits to disjoint fields therefore lose the older side's
/// values for shared fields; there is no field-level merge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

use outpost_core::{
    format_timestamp, Record, RecordExt, CONFLICT_RESOLUTION, CONFLICT_RESOLVED_AT, UPDATED_AT,
};

/// How a conflict was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Local record was strictly newer
    LocalWins,
    /// Server record was newer or equally new
    ServerWins,
    /// Only a local record existed
    LocalOnly,
    /// Only a server record existed
    ServerOnly,
}

impl ConflictResolution {
    /// Tag written into `conflict_resolution` on merged records.
    pub fn tag(&self) -> &'static str {
        match self {
            ConflictResolution::LocalWins => "local_wins_timestamp",
            ConflictResolution::ServerWins => "server_wins_timestamp",
            ConflictResolution::LocalOnly => "local_only",
            ConflictResolution::ServerOnly => "server_only",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ConflictResolution::LocalWins | ConflictResolution::ServerWins
        )
    }
}

/// Result of resolving a local/server pair
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub record: Record,
    pub resolution: ConflictResolution,
}

/// Pluggable resolution policy
pub trait ConflictResolver: Send + Sync {
    /// Resolve a local/server pair. Returns `None` only when both are absent.
    fn resolve(&self, table: &str, local: Option<&Record>, server: Option<&Record>)
        -> Option<Resolved>;

    /// Get the name of this resolver
    fn name(&self) -> &str;
}

/// Timestamp-based last-writer-wins resolver
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriterWins;

impl ConflictResolver for LastWriterWins {
    fn resolve(
        &self,
        table: &str,
        local: Option<&Record>,
        server: Option<&Record>,
    ) -> Option<Resolved> {
        resolve(table, local, server)
    }

    fn name(&self) -> &str {
        "last_writer_wins"
    }
}

/// Resolves a local/server pair, stamping the merge with the current time.
pub fn resolve(table: &str, local: Option<&Record>, server: Option<&Record>) -> Option<Resolved> {
    resolve_at(table, local, server, Utc::now())
}

/// Deterministic form of [`resolve`]: the merge is stamped with `now`.
///
/// Local wins iff its `updated_at` (or `client_updated_at`) is strictly newer
/// than the server's `updated_at`. A missing timestamp counts as older than
/// any present one; two missing timestamps go to the server.
pub fn resolve_at(
    table: &str,
    local: Option<&Record>,
    server: Option<&Record>,
    now: DateTime<Utc>,
) -> Option<Resolved> {
    let (local, server) = match (local, server) {
        (None, None) => return None,
        (Some(local), None) => {
            return Some(Resolved {
                record: local.clone(),
                resolution: ConflictResolution::LocalOnly,
            })
        }
        (None, Some(server)) => {
            return Some(Resolved {
                record: server.clone(),
                resolution: ConflictResolution::ServerOnly,
            })
        }
        (Some(local), Some(server)) => (local, server),
    };

    let local_newer = match (local.local_timestamp(), server.updated_at()) {
        (Some(l), Some(s)) => l > s,
        (Some(_), None) => true,
        (None, _) => false,
    };

    let (mut record, resolution) = if local_newer {
        let mut merged = server.clone();
        merged.overlay(local);
        (merged, ConflictResolution::LocalWins)
    } else {
        let mut merged = local.clone();
        merged.overlay(server);
        (merged, ConflictResolution::ServerWins)
    };

    let stamp = Value::String(format_timestamp(now));
    record.insert(UPDATED_AT.to_string(), stamp.clone());
    record.insert(CONFLICT_RESOLVED_AT.to_string(), stamp);
    record.insert(
        CONFLICT_RESOLUTION.to_string(),
        Value::String(resolution.tag().to_string()),
    );

    debug!(
        "Resolved conflict on {}/{}: {}",
        table,
        record.id().unwrap_or("?"),
        resolution.tag()
    );
    Some(Resolved { record, resolution })
}

/// Merges a server collection with a local one for full reconciliation.
///
/// Records without an id are dropped. Server records come first in server
/// order, followed by local records whose id the server does not have, in
/// local order.
pub fn merge_collections(server: &[Record], local: &[Record]) -> Vec<Record> {
    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(server.len() + local.len());

    for record in server.iter().chain(local.iter()) {
        if let Some(id) = record.id() {
            if seen.insert(id.to_string()) {
                merged.push(record.clone());
            }
        }
    }
    merged
}
