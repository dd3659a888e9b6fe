pub mod error;
pub mod types;
pub mod store;
pub mod config;
pub mod retry;
pub mod identity;

pub use error::{Error, Failure, Result};
pub use types::*;
pub use store::{FileStore, LocalStore, MemoryStore, StoreExt};
pub use config::EngineConfig;
pub use retry::RetryPolicy;
pub use identity::ClientId;
