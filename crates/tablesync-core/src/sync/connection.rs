//! Connection lifecycle for one session
//!
//! The `ConnectionManager` owns every link the session holds and the join
//! handshake state on both sides of it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  ConnectionManager                                              │
//! │  ├── connections: HashMap<PeerId, Connection>                   │
//! │  │   └── one reader task per link -> Inbound channel            │
//! │  ├── pending: HashMap<JoinRequestId, PendingJoin>   (host)      │
//! │  ├── waiters / bootstrap: join in flight            (client)    │
//! │  └── liveness: HeartbeatSupervisor                              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Links become *active* once the handshake completes. Only active links
//! take part in `send`; inactive links carry nothing but handshake traffic.
//!
//! Lock order is connections, then document, then liveness. Nothing awaits
//! while a lock is held: frames are pushed into unbounded link channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::events::{PeerStatus, PeerSummary, SessionEvent};
use super::heartbeat::HeartbeatSupervisor;
use super::protocol::{Envelope, JoinRequestId, SessionMessage, WireMessage};
use crate::doc::DocumentStore;
use crate::error::{SyncError, SyncResult};
use crate::transport::{Link, Transport};
use crate::types::{LinkRole, PeerId, SessionRole};

/// Where to send a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// One active connection, of any role
    Peer(PeerId),
    /// Every active star connection (host links and accepted clients)
    Broadcast,
    /// Every active star connection except one
    AllExcept(PeerId),
    /// Every active connection including mesh links
    Everyone,
}

/// Traffic from link reader tasks to the session loop
#[derive(Debug)]
pub enum Inbound {
    Frame {
        from: PeerId,
        link_id: u64,
        bytes: Bytes,
    },
    Closed {
        peer: PeerId,
        link_id: u64,
    },
}

/// What became of a connection that went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub peer: PeerId,
    pub role: LinkRole,
    /// The connection had completed its handshake
    pub was_active: bool,
}

#[derive(Debug)]
enum JoinOutcome {
    Approved,
    Rejected(String),
}

struct Connection {
    role: LinkRole,
    link_id: u64,
    sender: mpsc::UnboundedSender<Bytes>,
    active: bool,
    profile: Option<Vec<u8>>,
    reader: JoinHandle<()>,
}

impl Connection {
    fn in_star(&self) -> bool {
        self.role != LinkRole::Mesh
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

struct PendingJoin {
    peer: PeerId,
    profile: Vec<u8>,
}

struct JoinWaiter {
    request_id: JoinRequestId,
    host: PeerId,
    tx: oneshot::Sender<JoinOutcome>,
}

struct Inner {
    role: SessionRole,
    profile: Vec<u8>,
    connections: HashMap<PeerId, Connection>,
    pending: HashMap<JoinRequestId, PendingJoin>,
    waiters: HashMap<JoinRequestId, JoinWaiter>,
    /// Approved join still waiting for the host's snapshot
    bootstrap: Option<JoinWaiter>,
    next_link_id: u64,
}

/// Cloneable handle to the session's connections
#[derive(Clone)]
pub struct ConnectionManager {
    local: PeerId,
    transport: Arc<dyn Transport>,
    inner: Arc<Mutex<Inner>>,
    liveness: Arc<Mutex<HeartbeatSupervisor>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    events: broadcast::Sender<SessionEvent>,
}

fn encode(envelope: &Envelope) -> Option<Bytes> {
    match WireMessage::new(envelope.clone()).encode() {
        Ok(bytes) => Some(Bytes::from(bytes)),
        Err(e) => {
            warn!(kind = envelope.message.name(), error = %e, "Failed to encode message");
            None
        }
    }
}

impl ConnectionManager {
    pub fn new(
        local: PeerId,
        transport: Arc<dyn Transport>,
        liveness: Arc<Mutex<HeartbeatSupervisor>>,
        inbound_tx: mpsc::UnboundedSender<Inbound>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            local,
            transport,
            inner: Arc::new(Mutex::new(Inner {
                role: SessionRole::Host,
                profile: Vec::new(),
                connections: HashMap::new(),
                pending: HashMap::new(),
                waiters: HashMap::new(),
                bootstrap: None,
                next_link_id: 0,
            })),
            liveness,
            inbound_tx,
            events,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local
    }

    pub fn role(&self) -> SessionRole {
        self.inner.lock().role.clone()
    }

    pub fn is_host(&self) -> bool {
        self.inner.lock().role.is_host()
    }

    /// Host of this session, if joined as a client
    pub fn host(&self) -> Option<PeerId> {
        match &self.inner.lock().role {
            SessionRole::Client { host } => Some(host.clone()),
            SessionRole::Host => None,
        }
    }

    /// Profile announced for this process
    pub fn set_profile(&self, profile: Vec<u8>) {
        self.inner.lock().profile = profile;
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn envelope(&self, message: SessionMessage) -> Envelope {
        Envelope::new(self.local.clone(), message)
    }

    /// Register a link and start its reader task
    fn attach(&self, inner: &mut Inner, link: Link, role: LinkRole, active: bool) -> u64 {
        inner.next_link_id += 1;
        let link_id = inner.next_link_id;
        let Link {
            remote,
            sender,
            mut receiver,
        } = link;

        let inbound_tx = self.inbound_tx.clone();
        let peer = remote.clone();
        let reader = tokio::spawn(async move {
            while let Some(bytes) = receiver.recv().await {
                let frame = Inbound::Frame {
                    from: peer.clone(),
                    link_id,
                    bytes,
                };
                if inbound_tx.send(frame).is_err() {
                    return;
                }
            }
            let _ = inbound_tx.send(Inbound::Closed { peer, link_id });
        });

        if let Some(previous) = inner.connections.insert(
            remote.clone(),
            Connection {
                role,
                link_id,
                sender,
                active,
                profile: None,
                reader,
            },
        ) {
            debug!(peer = %remote, role = %previous.role, "Replaced existing link");
        }
        debug!(peer = %remote, %role, link_id, active, "Link attached");
        link_id
    }

    fn activate(&self, inner: &mut Inner, peer: &PeerId) {
        let Some(conn) = inner.connections.get_mut(peer) else {
            return;
        };
        conn.active = true;
        let role = conn.role;
        self.liveness.lock().track(peer.clone(), Instant::now());
        info!(peer = %peer, %role, "Peer connected");
        self.emit(SessionEvent::PeerConnected {
            peer: peer.clone(),
            role,
        });
    }

    /// Push a frame onto a link regardless of its handshake state
    fn send_raw(inner: &Inner, peer: &PeerId, bytes: Bytes) -> bool {
        match inner.connections.get(peer) {
            Some(conn) => conn.sender.send(bytes).is_ok(),
            None => false,
        }
    }

    /// Take ownership of a link opened by a remote peer
    ///
    /// A host treats it as a join attempt and waits for JOIN_REQUEST. A
    /// client treats it as a mesh link from a sibling. When both siblings
    /// dial each other at once, both keep the link dialed by the smaller id.
    pub fn accept_link(&self, link: Link) {
        let remote = link.remote.clone();
        if remote == self.local {
            debug!("Ignoring link from self");
            return;
        }

        let mut inner = self.inner.lock();
        if inner.role.is_host() {
            if inner.connections.get(&remote).is_some_and(|c| c.active) {
                info!(peer = %remote, "Member reconnected with a new link");
                self.liveness.lock().remove(&remote);
            }
            self.attach(&mut inner, link, LinkRole::Accepted, false);
            return;
        }

        match inner.connections.get(&remote).map(|c| c.role) {
            None => {
                self.attach(&mut inner, link, LinkRole::Mesh, true);
                self.activate(&mut inner, &remote);
            }
            Some(LinkRole::Mesh) if remote < self.local => {
                debug!(peer = %remote, "Keeping mesh link dialed by smaller id");
                self.attach(&mut inner, link, LinkRole::Mesh, true);
            }
            Some(role) => {
                debug!(peer = %remote, %role, "Dropping duplicate inbound link");
            }
        }
    }

    /// Join a host's session
    ///
    /// Dials the host, sends JOIN_REQUEST and waits for the matching
    /// JOIN_RESPONSE and the bootstrap snapshot behind it, both of which
    /// arrive through the session loop. Fails with
    /// `ConnectionRejected` carrying the host's reason verbatim, or with
    /// `ConnectionUnreachable` if the host cannot be dialed, the link closes
    /// mid-handshake, or no answer arrives within `join_timeout`.
    pub async fn connect_as_client(
        &self,
        host: PeerId,
        profile: Vec<u8>,
        join_timeout: Duration,
    ) -> SyncResult<()> {
        if host == self.local {
            return Err(SyncError::ConnectionUnreachable("cannot join self".into()));
        }

        let link = self
            .transport
            .dial(self.local.clone(), host.clone())
            .await
            .map_err(|e| match e {
                SyncError::ConnectionUnreachable(_) => e,
                other => SyncError::ConnectionUnreachable(format!("{}: {}", host, other)),
            })?;

        let request_id = JoinRequestId::new();
        let (tx, mut rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            inner.profile = profile.clone();
            inner.waiters.insert(
                request_id,
                JoinWaiter {
                    request_id,
                    host: host.clone(),
                    tx,
                },
            );
            self.attach(&mut inner, link, LinkRole::ToHost, false);

            let request = self.envelope(SessionMessage::JoinRequest {
                request_id,
                profile,
            });
            if let Some(bytes) = encode(&request) {
                if !Self::send_raw(&inner, &host, bytes) {
                    inner.waiters.remove(&request_id);
                    inner.connections.remove(&host);
                    return Err(SyncError::ConnectionUnreachable(format!(
                        "{}: link closed before join request",
                        host
                    )));
                }
            }
        }
        info!(host = %host, request = %request_id, "Sent join request");

        let outcome = match tokio::time::timeout(join_timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                return Err(SyncError::ConnectionUnreachable(format!(
                    "{}: link closed during handshake",
                    host
                )))
            }
            Err(_) => {
                let mut inner = self.inner.lock();
                let bootstrapping = inner
                    .bootstrap
                    .as_ref()
                    .is_some_and(|waiter| waiter.request_id == request_id);
                if bootstrapping {
                    inner.bootstrap = None;
                    inner.role = SessionRole::Host;
                    self.depart(&mut inner, &host);
                }
                if inner.waiters.remove(&request_id).is_some() || bootstrapping {
                    if inner.connections.get(&host).is_some_and(|c| !c.active) {
                        inner.connections.remove(&host);
                    }
                    warn!(host = %host, timeout_ms = join_timeout.as_millis() as u64, "Join request timed out");
                    return Err(SyncError::ConnectionUnreachable(format!(
                        "{}: no join response",
                        host
                    )));
                }
                // Resolved while the timeout fired
                drop(inner);
                rx.try_recv().map_err(|_| {
                    SyncError::ConnectionUnreachable(format!("{}: no join response", host))
                })?
            }
        };

        match outcome {
            JoinOutcome::Approved => Ok(()),
            JoinOutcome::Rejected(reason) => Err(SyncError::ConnectionRejected(reason)),
        }
    }

    /// Record a JOIN_REQUEST that arrived on a not-yet-active link
    pub fn record_join_request(&self, from: &PeerId, request_id: JoinRequestId, profile: Vec<u8>) {
        let mut inner = self.inner.lock();
        if !inner.role.is_host() {
            debug!(peer = %from, "Ignoring join request while not hosting");
            return;
        }
        if !inner.connections.contains_key(from) {
            return;
        }
        inner.pending.insert(
            request_id,
            PendingJoin {
                peer: from.clone(),
                profile: profile.clone(),
            },
        );
        drop(inner);

        info!(peer = %from, request = %request_id, "Join request received");
        self.emit(SessionEvent::ConnectionRequest {
            request: request_id,
            peer: from.clone(),
            profile,
        });
    }

    /// Resolve the local join waiter for a JOIN_RESPONSE
    ///
    /// An approval promotes the connection immediately, so frames behind the
    /// response on the same link are routed as active. The caller of
    /// `connect_as_client` is released only once the snapshot that follows
    /// has been applied (see [`Self::finish_bootstrap`]).
    pub fn resolve_join(
        &self,
        from: &PeerId,
        request_id: JoinRequestId,
        approved: bool,
        reason: Option<String>,
    ) {
        let mut inner = self.inner.lock();
        match inner.waiters.get(&request_id) {
            Some(waiter) if &waiter.host == from => {}
            _ => {
                debug!(peer = %from, request = %request_id, "Ignoring unexpected join response");
                return;
            }
        }
        let Some(waiter) = inner.waiters.remove(&request_id) else {
            return;
        };

        if approved {
            inner.role = SessionRole::Client { host: from.clone() };
            self.activate(&mut inner, from);
            info!(host = %from, "Join approved");
            inner.bootstrap = Some(waiter);
            return;
        }

        inner.connections.remove(from);
        let reason = reason.unwrap_or_default();
        info!(host = %from, %reason, "Join rejected");
        drop(inner);
        let _ = waiter.tx.send(JoinOutcome::Rejected(reason));
    }

    /// Release `connect_as_client` after the host's snapshot was applied
    pub fn finish_bootstrap(&self, from: &PeerId) {
        let mut inner = self.inner.lock();
        if !inner.bootstrap.as_ref().is_some_and(|waiter| &waiter.host == from) {
            return;
        }
        if let Some(waiter) = inner.bootstrap.take() {
            drop(inner);
            debug!(host = %from, "Bootstrap complete");
            let _ = waiter.tx.send(JoinOutcome::Approved);
        }
    }

    /// Admit a pending joiner
    ///
    /// Sends JOIN_RESPONSE, one PEER_ANNOUNCE per existing member (this host
    /// included) and a full snapshot of `store`, then announces the newcomer
    /// to everyone else. The snapshot is taken while connections are locked,
    /// so no delta broadcast can fall between it and activation.
    pub fn accept_join(&self, request_id: JoinRequestId, store: &DocumentStore) -> SyncResult<PeerId> {
        let mut inner = self.inner.lock();
        if !inner.role.is_host() {
            return Err(SyncError::NotHost);
        }
        let pending = inner
            .pending
            .remove(&request_id)
            .ok_or_else(|| SyncError::JoinRequestNotFound(request_id.to_string()))?;
        let peer = pending.peer;
        if !inner.connections.contains_key(&peer) {
            return Err(SyncError::ConnectionUnreachable(format!(
                "{}: link closed before acceptance",
                peer
            )));
        }

        let mut welcome = vec![
            SessionMessage::JoinResponse {
                request_id,
                approved: true,
                reason: None,
            },
            SessionMessage::PeerAnnounce {
                identity: self.local.clone(),
                profile: inner.profile.clone(),
            },
        ];
        for (member, conn) in inner.connections.iter() {
            if member != &peer && conn.active && conn.role == LinkRole::Accepted {
                welcome.push(SessionMessage::PeerAnnounce {
                    identity: member.clone(),
                    profile: conn.profile.clone().unwrap_or_default(),
                });
            }
        }
        // Last, so the joiner knows the roster once its bootstrap completes
        welcome.push(SessionMessage::ReplicatedSnapshot {
            bytes: store.encode_full_state().to_vec(),
        });
        for message in welcome {
            if let Some(bytes) = encode(&self.envelope(message)) {
                Self::send_raw(&inner, &peer, bytes);
            }
        }

        if let Some(conn) = inner.connections.get_mut(&peer) {
            conn.profile = Some(pending.profile.clone());
        }
        self.activate(&mut inner, &peer);

        let announce = self.envelope(SessionMessage::PeerAnnounce {
            identity: peer.clone(),
            profile: pending.profile,
        });
        let notified = self.send_locked(&inner, Target::AllExcept(peer.clone()), &announce);
        info!(peer = %peer, request = %request_id, notified, "Join accepted");
        Ok(peer)
    }

    /// Decline a pending joiner with a reason and close its link
    pub fn reject_join(&self, request_id: JoinRequestId, reason: impl Into<String>) -> SyncResult<()> {
        let reason = reason.into();
        let mut inner = self.inner.lock();
        if !inner.role.is_host() {
            return Err(SyncError::NotHost);
        }
        let pending = inner
            .pending
            .remove(&request_id)
            .ok_or_else(|| SyncError::JoinRequestNotFound(request_id.to_string()))?;

        let response = self.envelope(SessionMessage::JoinResponse {
            request_id,
            approved: false,
            reason: Some(reason.clone()),
        });
        if let Some(bytes) = encode(&response) {
            Self::send_raw(&inner, &pending.peer, bytes);
        }
        // Dropping the sender closes the link after the queued response
        inner.connections.remove(&pending.peer);
        info!(peer = %pending.peer, request = %request_id, %reason, "Join rejected");
        Ok(())
    }

    /// Join requests awaiting a decision
    pub fn pending_requests(&self) -> Vec<(JoinRequestId, PeerId)> {
        self.inner
            .lock()
            .pending
            .iter()
            .map(|(id, pending)| (*id, pending.peer.clone()))
            .collect()
    }

    /// Open direct links to siblings
    ///
    /// Idempotent: peers that already have a link, and this process itself,
    /// are skipped. Returns how many new links were opened. Dial failures
    /// are logged; messages still reach those peers through the host.
    pub async fn connect_mesh(&self, peers: &[PeerId]) -> usize {
        let mut opened = 0;
        for peer in peers {
            if peer == &self.local || self.inner.lock().connections.contains_key(peer) {
                continue;
            }
            match self.transport.dial(self.local.clone(), peer.clone()).await {
                Ok(link) => {
                    let mut inner = self.inner.lock();
                    if inner.connections.contains_key(peer) && self.local > *peer {
                        debug!(peer = %peer, "Sibling dialed first, keeping its link");
                        continue;
                    }
                    self.attach(&mut inner, link, LinkRole::Mesh, true);
                    self.activate(&mut inner, peer);
                    opened += 1;
                }
                Err(e) => warn!(peer = %peer, error = %e, "Mesh dial failed"),
            }
        }
        opened
    }

    fn send_locked(&self, inner: &Inner, target: Target, envelope: &Envelope) -> usize {
        let Some(bytes) = encode(envelope) else {
            return 0;
        };
        let mut delivered = 0;
        for (peer, conn) in inner.connections.iter().filter(|(_, c)| c.active) {
            let selected = match &target {
                Target::Peer(id) => peer == id,
                Target::Broadcast => conn.in_star(),
                Target::AllExcept(id) => conn.in_star() && peer != id,
                Target::Everyone => true,
            };
            if !selected {
                continue;
            }
            if conn.sender.send(bytes.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!(peer = %peer, kind = envelope.message.name(), "Send on closed link dropped");
            }
        }
        if delivered == 0 {
            debug!(?target, kind = envelope.message.name(), "No recipients");
        }
        delivered
    }

    /// Best-effort send; returns the number of links the frame was queued on
    pub fn send(&self, target: Target, envelope: &Envelope) -> usize {
        let inner = self.inner.lock();
        self.send_locked(&inner, target, envelope)
    }

    /// Send a message authored by this process
    pub fn send_message(&self, target: Target, message: SessionMessage) -> usize {
        self.send(target, &self.envelope(message))
    }

    /// Handshake state of a link: `None` if `link_id` is stale
    pub fn link_state(&self, peer: &PeerId, link_id: u64) -> Option<bool> {
        self.inner
            .lock()
            .connections
            .get(peer)
            .filter(|conn| conn.link_id == link_id)
            .map(|conn| conn.active)
    }

    pub fn has_active(&self, peer: &PeerId) -> bool {
        self.inner
            .lock()
            .connections
            .get(peer)
            .is_some_and(|conn| conn.active)
    }

    pub fn role_of(&self, peer: &PeerId) -> Option<LinkRole> {
        self.inner.lock().connections.get(peer).map(|conn| conn.role)
    }

    fn depart(&self, inner: &mut Inner, peer: &PeerId) -> Option<Departure> {
        let conn = inner.connections.remove(peer)?;
        inner.pending.retain(|_, pending| &pending.peer != peer);
        // Dropping a waiter's sender fails its handshake as unreachable
        inner.waiters.retain(|_, waiter| &waiter.host != peer);
        if inner.bootstrap.as_ref().is_some_and(|waiter| &waiter.host == peer) {
            inner.bootstrap = None;
        }
        self.liveness.lock().remove(peer);
        Some(Departure {
            peer: peer.clone(),
            role: conn.role,
            was_active: conn.active,
        })
    }

    /// Forget a link whose reader ended; stale link ids are ignored
    pub fn handle_closed(&self, peer: &PeerId, link_id: u64) -> Option<Departure> {
        let mut inner = self.inner.lock();
        if inner.connections.get(peer)?.link_id != link_id {
            return None;
        }
        let departure = self.depart(&mut inner, peer)?;
        info!(peer = %peer, role = %departure.role, "Link closed");
        Some(departure)
    }

    /// Drop a peer's connection, closing the link
    pub fn disconnect(&self, peer: &PeerId) -> Option<Departure> {
        let mut inner = self.inner.lock();
        let departure = self.depart(&mut inner, peer)?;
        info!(peer = %peer, role = %departure.role, "Dropped connection");
        Some(departure)
    }

    /// Active connections with their current liveness
    pub fn peers(&self) -> Vec<PeerSummary> {
        let inner = self.inner.lock();
        let liveness = self.liveness.lock();
        let mut peers: Vec<PeerSummary> = inner
            .connections
            .iter()
            .filter(|(_, conn)| conn.active)
            .map(|(peer, conn)| PeerSummary {
                peer: peer.clone(),
                role: conn.role,
                status: liveness.status(peer).unwrap_or(PeerStatus::Offline),
                profile: conn.profile.clone(),
            })
            .collect();
        peers.sort_by(|a, b| a.peer.cmp(&b.peer));
        peers
    }

    /// Close every link and fail outstanding handshakes
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.connections.clear();
        inner.pending.clear();
        inner.waiters.clear();
        inner.bootstrap = None;
        self.liveness.lock().clear();
    }
}
