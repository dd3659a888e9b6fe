/// Connection monitor
///
/// Answers "is the remote reachable right now", reusing a probe result for a
/// short window so bursts of reads do not turn into bursts of probes.
/// Reachability transitions are published to subscribers.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::remote::RemoteBackend;

/// Reachability transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Backend became reachable
    Restored,
    /// Backend stopped being reachable
    Lost,
}

#[derive(Debug, Clone, Copy)]
struct ProbeState {
    available: bool,
    checked_at: Option<Instant>,
}

pub struct ConnectionMonitor {
    remote: Arc<dyn RemoteBackend>,
    cache_window: Duration,
    probe_timeout: Duration,
    state: RwLock<ProbeState>,
    // Coalesces concurrent probes into one
    probe_lock: Mutex<()>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionMonitor {
    /// Starts out unavailable; the first successful probe counts as a
    /// transition to available.
    pub fn new(
        remote: Arc<dyn RemoteBackend>,
        cache_window: Duration,
        probe_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            remote,
            cache_window,
            probe_timeout,
            state: RwLock::new(ProbeState {
                available: false,
                checked_at: None,
            }),
            probe_lock: Mutex::new(()),
            events,
        }
    }

    /// Registers an observer of reachability transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Reachability, probing only if the cached result is older than the
    /// cache window.
    pub async fn is_available(&self) -> bool {
        if let Some(available) = self.cached() {
            return available;
        }

        let _guard = self.probe_lock.lock().await;
        // Another caller may have probed while we waited
        if let Some(available) = self.cached() {
            return available;
        }
        self.run_probe().await
    }

    /// Probes now, ignoring the cache window.
    pub async fn probe(&self) -> bool {
        let _guard = self.probe_lock.lock().await;
        self.run_probe().await
    }

    /// Last known status without probing.
    pub fn current_status(&self) -> bool {
        self.state.read().available
    }

    /// Time since the last probe, if one has run.
    pub fn last_checked(&self) -> Option<Duration> {
        self.state.read().checked_at.map(|at| at.elapsed())
    }

    fn cached(&self) -> Option<bool> {
        let state = self.state.read();
        match state.checked_at {
            Some(at) if at.elapsed() < self.cache_window => Some(state.available),
            _ => None,
        }
    }

    async fn run_probe(&self) -> bool {
        let available = match time::timeout(self.probe_timeout, self.remote.probe()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", self.remote.name(), e);
                false
            }
            Err(_) => {
                debug!(
                    "Probe of {} timed out after {:?}",
                    self.remote.name(),
                    self.probe_timeout
                );
                false
            }
        };

        let previous = {
            let mut state = self.state.write();
            let previous = state.available;
            state.available = available;
            state.checked_at = Some(Instant::now());
            previous
        };

        if previous != available {
            let event = if available {
                info!("Connection to {} restored", self.remote.name());
                ConnectionEvent::Restored
            } else {
                warn!("Connection to {} lost", self.remote.name());
                ConnectionEvent::Lost
            };
            // No subscribers is fine
            let _ = self.events.send(event);
        }

        available
    }
}
