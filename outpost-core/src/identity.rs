/// Process-durable client identity
///
/// Generated once, persisted in the local store and stamped on every queued
/// mutation so the author of a change can be told apart.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;
use uuid::Uuid;

use crate::store::{LocalStore, StoreExt};
use crate::Result;

pub const CLIENT_ID_KEY: &str = "client_id";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    /// Create a new random client ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Loads the persisted identity, generating and storing one on first use.
    pub fn load_or_create(store: &dyn LocalStore) -> Result<Self> {
        if let Some(existing) = store.get_json::<ClientId>(CLIENT_ID_KEY)? {
            return Ok(existing);
        }

        let id = Self::new();
        store.set_json(CLIENT_ID_KEY, &id)?;
        info!("Generated client id {}", id);
        Ok(id)
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
