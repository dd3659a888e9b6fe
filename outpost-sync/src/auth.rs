/// Session check in front of mutations
///
/// Online, the backend's session is authoritative and is cached under
/// `auth_session`. Offline, only a cached, unexpired session lets a write be
/// queued; queuing writes that can never be authorized is refused.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use outpost_core::{Error, LocalStore, Result, StoreExt};

use crate::remote::{RemoteBackend, Session};

const AUTH_SESSION_KEY: &str = "auth_session";

pub struct AuthGuard {
    remote: Arc<dyn RemoteBackend>,
    store: Arc<dyn LocalStore>,
}

impl AuthGuard {
    pub fn new(remote: Arc<dyn RemoteBackend>, store: Arc<dyn LocalStore>) -> Self {
        Self { remote, store }
    }

    /// Returns the session a mutation runs under, or `AuthRequired`.
    pub async fn ensure(&self, online: bool) -> Result<Session> {
        if online {
            match self.remote.session().await {
                Ok(Some(session)) => {
                    self.store.set_json(AUTH_SESSION_KEY, &session)?;
                    return Ok(session);
                }
                Ok(None) => {
                    self.store.remove(AUTH_SESSION_KEY)?;
                    return Err(Error::AuthRequired);
                }
                Err(e) if e.is_retryable() => {
                    warn!("Session check failed, using cached session: {}", e);
                }
                Err(e) => return Err(e),
            }
        }

        match self.cached()? {
            Some(session) if !session.is_expired(Utc::now()) => {
                debug!("Using cached session for {}", session.user_id);
                Ok(session)
            }
            _ => Err(Error::AuthRequired),
        }
    }

    pub fn cached(&self) -> Result<Option<Session>> {
        self.store.get_json(AUTH_SESSION_KEY)
    }

    pub fn clear(&self) -> Result<()> {
        self.store.remove(AUTH_SESSION_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use chrono::Duration;
    use outpost_core::MemoryStore;
    use tokio_test::assert_ok;

    fn guard(remote: Arc<MemoryRemote>) -> AuthGuard {
        AuthGuard::new(remote, Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_online_session_is_cached() {
        let remote = Arc::new(MemoryRemote::new());
        let guard = guard(remote.clone());

        let session = assert_ok!(guard.ensure(true).await);
        assert_eq!(session.user_id, "local-user");
        assert_eq!(guard.cached().unwrap(), Some(session.clone()));

        // Offline falls back to the cached session
        assert_eq!(guard.ensure(false).await.unwrap(), session);
    }

    #[tokio::test]
    async fn test_signed_out_is_refused() {
        let remote = Arc::new(MemoryRemote::new());
        let guard = guard(remote.clone());
        guard.ensure(true).await.unwrap();

        remote.set_session(None);
        assert!(matches!(guard.ensure(true).await, Err(Error::AuthRequired)));
        assert!(guard.cached().unwrap().is_none());
        assert!(matches!(guard.ensure(false).await, Err(Error::AuthRequired)));
    }

    #[tokio::test]
    async fn test_expired_cached_session_is_refused() {
        let remote = Arc::new(MemoryRemote::new());
        remote.set_session(Some(
            Session::new("u1").with_expiry(Utc::now() - Duration::minutes(1)),
        ));
        let guard = guard(remote.clone());
        guard.ensure(true).await.unwrap();

        remote.set_reachable(false);
        assert!(matches!(guard.ensure(true).await, Err(Error::AuthRequired)));
    }
}
