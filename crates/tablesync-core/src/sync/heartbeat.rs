//! Liveness tracking and rendezvous reconnection
//!
//! `HeartbeatSupervisor` is a plain state machine driven by the session
//! loop: [`observe`](HeartbeatSupervisor::observe) on every arrival and
//! [`sweep`](HeartbeatSupervisor::sweep) whenever the clock reaches
//! [`next_deadline`](HeartbeatSupervisor::next_deadline), so transitions
//! fire at the configured timeout rather than on the next heartbeat tick.
//!
//! ```text
//!            silence >= peer_timeout        silence >= offline_timeout
//!   Online ─────────────────────────> Reconnecting ─────────────────────> Offline
//!     ^                                    │                    (connection dropped)
//!     └──────────── any message ───────────┘
//!
//!   link closed (any phase) ───────────────────────────────────────────> Offline
//! ```
//!
//! [`run_reconnect`] restores the local rendezvous registration with
//! exponential backoff and reports progress as [`LocalLink`] changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{LocalLink, PeerStatus, SessionEvent};
use crate::config::{ReconnectPolicy, SessionConfig};
use crate::transport::Transport;
use crate::types::PeerId;

#[derive(Debug, Clone, Copy)]
struct Liveness {
    last_seen: Instant,
    status: PeerStatus,
}

/// Per-peer liveness state machine
#[derive(Debug)]
pub struct HeartbeatSupervisor {
    peer_timeout: Duration,
    offline_timeout: Duration,
    peers: HashMap<PeerId, Liveness>,
}

impl HeartbeatSupervisor {
    pub fn new(peer_timeout: Duration, offline_timeout: Duration) -> Self {
        Self {
            peer_timeout,
            offline_timeout,
            peers: HashMap::new(),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.peer_timeout, config.offline_timeout)
    }

    /// Start tracking a newly active connection as `Online`
    pub fn track(&mut self, peer: PeerId, now: Instant) {
        self.peers.insert(
            peer,
            Liveness {
                last_seen: now,
                status: PeerStatus::Online,
            },
        );
    }

    /// Record an arrival; returns `Some(Online)` when this revived the peer
    pub fn observe(&mut self, peer: &PeerId, now: Instant) -> Option<PeerStatus> {
        let entry = self.peers.get_mut(peer)?;
        entry.last_seen = now;
        if entry.status == PeerStatus::Reconnecting {
            entry.status = PeerStatus::Online;
            return Some(PeerStatus::Online);
        }
        None
    }

    /// Apply timeouts; returns every transition made
    ///
    /// Peers reaching `Offline` are no longer tracked.
    pub fn sweep(&mut self, now: Instant) -> Vec<(PeerId, PeerStatus)> {
        let mut transitions = Vec::new();
        for (peer, entry) in self.peers.iter_mut() {
            let silence = now.saturating_duration_since(entry.last_seen);
            match entry.status {
                PeerStatus::Online if silence >= self.offline_timeout => {
                    entry.status = PeerStatus::Offline;
                    transitions.push((peer.clone(), PeerStatus::Reconnecting));
                    transitions.push((peer.clone(), PeerStatus::Offline));
                }
                PeerStatus::Online if silence >= self.peer_timeout => {
                    entry.status = PeerStatus::Reconnecting;
                    transitions.push((peer.clone(), PeerStatus::Reconnecting));
                }
                PeerStatus::Reconnecting if silence >= self.offline_timeout => {
                    entry.status = PeerStatus::Offline;
                    transitions.push((peer.clone(), PeerStatus::Offline));
                }
                _ => {}
            }
        }
        self.peers.retain(|_, entry| entry.status != PeerStatus::Offline);
        transitions
    }

    /// Earliest instant at which [`Self::sweep`] will make a transition
    pub fn next_deadline(&self) -> Option<Instant> {
        self.peers
            .values()
            .filter_map(|entry| match entry.status {
                PeerStatus::Online => Some(entry.last_seen + self.peer_timeout),
                PeerStatus::Reconnecting => Some(entry.last_seen + self.offline_timeout),
                PeerStatus::Offline => None,
            })
            .min()
    }

    /// Stop tracking a peer whose link closed; returns whether it was tracked
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        self.peers.remove(peer).is_some()
    }

    pub fn status(&self, peer: &PeerId) -> Option<PeerStatus> {
        self.peers.get(peer).map(|entry| entry.status)
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

/// Shared view of the local rendezvous state
#[derive(Clone)]
pub struct LinkMonitor {
    state: Arc<Mutex<LocalLink>>,
    events: broadcast::Sender<SessionEvent>,
}

impl LinkMonitor {
    pub fn new(events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            state: Arc::new(Mutex::new(LocalLink::Connected)),
            events,
        }
    }

    pub fn get(&self) -> LocalLink {
        *self.state.lock()
    }

    /// Update the state, emitting `LocalLinkChanged` if it differs
    pub fn set(&self, next: LocalLink) {
        let mut state = self.state.lock();
        if *state != next {
            *state = next;
            let _ = self.events.send(SessionEvent::LocalLinkChanged(next));
        }
    }
}

/// Restore the local rendezvous registration with exponential backoff
///
/// Returns `true` once reconnected. After `max_attempts` failures the link
/// is marked `Disconnected` and `false` is returned; that state is terminal
/// until the rendezvous drops and recovers again.
pub async fn run_reconnect(
    transport: Arc<dyn Transport>,
    local: PeerId,
    policy: ReconnectPolicy,
    monitor: LinkMonitor,
    cancel: CancellationToken,
) -> bool {
    for attempt in 1..=policy.max_attempts {
        monitor.set(LocalLink::Reconnecting { attempt });
        let delay = policy.delay_for(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Waiting before rendezvous reconnect");

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Rendezvous reconnect cancelled");
                return false;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        match transport.reconnect(local.clone()).await {
            Ok(()) => {
                info!(peer = %local, attempt, "Rendezvous link restored");
                monitor.set(LocalLink::Connected);
                return true;
            }
            Err(e) => {
                warn!(
                    peer = %local,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Rendezvous reconnect failed"
                );
            }
        }
    }

    warn!(peer = %local, "Rendezvous reconnect attempts exhausted");
    monitor.set(LocalLink::Disconnected);
    false
}
