//! Session handle and event loop
//!
//! A [`Session`] is one participant in a shared table: it owns a transport
//! identity, the replicated document, and a single background loop that
//! handles everything arriving from the network.
//!
//! ```text
//!                      ┌──────────────────────────────┐
//!   incoming links ───>│                              │
//!   inbound frames ───>│   session loop (select!)     │──> ConnectionManager::send
//!   heartbeat tick ───>│                              │──> SessionEvent broadcast
//!   liveness deadline ─>│                              │
//!   local doc changes ─>│                              │
//!   rendezvous watch ──>│                              │──> reconnect task (backoff)
//!                      └──────────────────────────────┘
//! ```
//!
//! Several sessions can live in one process; nothing here is global.
//!
//! ## Example
//!
//! ```ignore
//! let transport = Arc::new(MemoryTransport::new());
//! let host = Session::initialize(transport.clone(), SessionConfig::default(), Some("room-1".into())).await?;
//! let client = Session::initialize(transport, SessionConfig::default(), None).await?;
//!
//! let mut events = host.subscribe();
//! tokio::spawn(async move { client.connect_as_client("room-1".into(), b"Aria".to_vec()).await });
//! while let Ok(event) = events.recv().await {
//!     if let SessionEvent::ConnectionRequest { request, .. } = event {
//!         host.accept_join(request)?;
//!     }
//! }
//! ```

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::doc::{DocChange, DocOp, DocumentStore};
use crate::error::{SyncError, SyncResult};
use crate::sync::{
    run_reconnect, ConnectionManager, ControlAction, Departure, EventRouter, HeartbeatSupervisor,
    Inbound, JoinRequestId, LinkMonitor, LocalLink, PeerStatus, PeerSummary, SessionEvent,
    SessionMessage, SessionState, Target,
};
use crate::transport::{Binding, Link, Transport};
use crate::types::{LinkRole, PeerId, SessionRole};

struct SessionInner {
    local: PeerId,
    config: SessionConfig,
    manager: ConnectionManager,
    store: DocumentStore,
    state: Arc<Mutex<SessionState>>,
    liveness: Arc<Mutex<HeartbeatSupervisor>>,
    monitor: LinkMonitor,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Cloneable handle to one session
///
/// The background loop stops when [`Session::shutdown`] is called or the
/// last handle is dropped.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Claim an identity and start the session loop
    ///
    /// With `preferred` set, fails with `SyncError::IdentityUnavailable`
    /// when that identity is taken, unless `identity_fallback` is enabled,
    /// in which case a random suffix is appended once.
    pub async fn initialize(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        preferred: Option<PeerId>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let Binding {
            local,
            incoming,
            rendezvous,
        } = bind(transport.as_ref(), &config, preferred).await?;

        let (events, _) = broadcast::channel(config.event_capacity);
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let liveness = Arc::new(Mutex::new(HeartbeatSupervisor::from_config(&config)));
        let manager = ConnectionManager::new(
            local.clone(),
            transport.clone(),
            liveness.clone(),
            inbound_tx,
            events.clone(),
        );
        let store = DocumentStore::new(config.max_chat_messages, config.event_capacity)?;
        let state = Arc::new(Mutex::new(SessionState::default()));
        let router = EventRouter::new(
            manager.clone(),
            store.clone(),
            state.clone(),
            liveness.clone(),
            events.clone(),
        );
        let monitor = LinkMonitor::new(events.clone());
        let cancel = CancellationToken::new();

        let driver = SessionLoop {
            local: local.clone(),
            config: config.clone(),
            transport,
            manager: manager.clone(),
            router,
            store: store.clone(),
            state: state.clone(),
            liveness: liveness.clone(),
            monitor: monitor.clone(),
            events: events.clone(),
            cancel: cancel.clone(),
            incoming,
            inbound,
            changes: store.subscribe(),
            rendezvous,
        };
        tokio::spawn(driver.run());
        info!(peer = %local, "Session initialized");

        Ok(Self {
            inner: Arc::new(SessionInner {
                local,
                config,
                manager,
                store,
                state,
                liveness,
                monitor,
                events,
                cancel,
            }),
        })
    }

    pub fn local_id(&self) -> &PeerId {
        &self.inner.local
    }

    pub fn role(&self) -> SessionRole {
        self.inner.manager.role()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// The replicated document
    pub fn document(&self) -> &DocumentStore {
        &self.inner.store
    }

    /// Apply a local document operation
    ///
    /// The resulting delta is sent to the host (client) or to every member
    /// (host) by the session loop.
    pub fn mutate(&self, op: DocOp) -> SyncResult<Bytes> {
        self.ensure_open()?;
        self.inner.store.mutate(op)
    }

    /// Join the session hosted by `host`
    pub async fn connect_as_client(&self, host: PeerId, profile: Vec<u8>) -> SyncResult<()> {
        self.ensure_open()?;
        self.inner
            .manager
            .connect_as_client(host, profile, self.inner.config.join_timeout)
            .await
    }

    /// Approve a pending join request; returns the admitted peer
    pub fn accept_join(&self, request: JoinRequestId) -> SyncResult<PeerId> {
        self.ensure_open()?;
        let peer = self.inner.manager.accept_join(request, &self.inner.store)?;
        if let Some(profile) = self
            .inner
            .manager
            .peers()
            .into_iter()
            .find(|summary| summary.peer == peer)
            .and_then(|summary| summary.profile)
        {
            self.inner.state.lock().roster.insert(peer.clone(), profile);
        }
        Ok(peer)
    }

    /// Decline a pending join request; the reason reaches the joiner verbatim
    pub fn reject_join(&self, request: JoinRequestId, reason: impl Into<String>) -> SyncResult<()> {
        self.ensure_open()?;
        self.inner.manager.reject_join(request, reason)
    }

    pub fn pending_requests(&self) -> Vec<(JoinRequestId, PeerId)> {
        self.inner.manager.pending_requests()
    }

    /// Open direct links to sibling clients; returns how many were opened
    pub async fn connect_mesh(&self, peers: &[PeerId]) -> usize {
        if self.inner.cancel.is_cancelled() {
            return 0;
        }
        self.inner.manager.connect_mesh(peers).await
    }

    /// Transient broadcast to the whole table, never merged
    pub fn send_ephemeral(&self, subtype: impl Into<String>, data: Vec<u8>) -> usize {
        self.inner.manager.send_message(
            Target::Broadcast,
            SessionMessage::Ephemeral {
                subtype: subtype.into(),
                data,
            },
        )
    }

    /// Apply a control action locally and send it to the table
    pub fn send_control(&self, action: ControlAction) -> usize {
        self.inner.state.lock().apply(&action);
        self.inner
            .manager
            .send_message(Target::Broadcast, SessionMessage::SessionControl { action })
    }

    /// Send to one peer
    ///
    /// Uses a direct link (mesh or star) when one is active, otherwise the
    /// host forwards it. Returns whether the message was queued on a link.
    pub fn send_directed(&self, to: &PeerId, subtype: impl Into<String>, data: Vec<u8>) -> bool {
        let message = SessionMessage::Directed {
            to: to.clone(),
            subtype: subtype.into(),
            data,
        };
        let manager = &self.inner.manager;
        let target = if manager.has_active(to) {
            Target::Peer(to.clone())
        } else if manager.host().is_some() {
            Target::Broadcast
        } else {
            debug!(to = %to, "No route for directed message");
            return false;
        };
        manager.send_message(target, message) > 0
    }

    /// Liveness of a peer; peers without an active connection are offline
    pub fn peer_status(&self, peer: &PeerId) -> PeerStatus {
        self.inner
            .liveness
            .lock()
            .status(peer)
            .unwrap_or(PeerStatus::Offline)
    }

    pub fn peers(&self) -> Vec<PeerSummary> {
        self.inner.manager.peers()
    }

    pub fn local_link(&self) -> LocalLink {
        self.inner.monitor.get()
    }

    pub fn session_state(&self) -> SessionState {
        self.inner.state.lock().clone()
    }

    /// Profile announced to members when this process hosts
    pub fn set_profile(&self, profile: Vec<u8>) {
        self.inner.manager.set_profile(profile);
    }

    /// Stop the loop, close every link and release the identity
    pub fn shutdown(&self) {
        if !self.inner.cancel.is_cancelled() {
            info!(peer = %self.inner.local, "Shutting down session");
            self.inner.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(SyncError::SessionClosed);
        }
        Ok(())
    }
}

async fn bind(
    transport: &dyn Transport,
    config: &SessionConfig,
    preferred: Option<PeerId>,
) -> SyncResult<Binding> {
    match transport.bind(preferred).await {
        Err(SyncError::IdentityUnavailable(taken)) if config.identity_fallback => {
            let fallback = PeerId::new(format!(
                "{}-{}",
                taken,
                hex::encode(rand::random::<[u8; 2]>())
            ));
            warn!(%taken, %fallback, "Preferred identity taken, using fallback");
            transport.bind(Some(fallback)).await
        }
        other => other,
    }
}

/// State owned by the background loop
struct SessionLoop {
    local: PeerId,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    manager: ConnectionManager,
    router: EventRouter,
    store: DocumentStore,
    state: Arc<Mutex<SessionState>>,
    liveness: Arc<Mutex<HeartbeatSupervisor>>,
    monitor: LinkMonitor,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    incoming: mpsc::Receiver<Link>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    changes: broadcast::Receiver<DocChange>,
    rendezvous: watch::Receiver<bool>,
}

impl SessionLoop {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut incoming_open = true;
        let mut rendezvous_open = true;
        let mut reconnect: Option<JoinHandle<bool>> = None;

        loop {
            let deadline = self.liveness.lock().next_deadline();

            tokio::select! {
                _ = self.cancel.cancelled() => break,

                link = self.incoming.recv(), if incoming_open => match link {
                    Some(link) => self.manager.accept_link(link),
                    None => incoming_open = false,
                },

                Some(inbound) = self.inbound.recv() => self.handle_inbound(inbound),

                _ = ticker.tick() => {
                    self.send_heartbeat();
                    self.sweep();
                }

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.sweep();
                }

                change = self.changes.recv() => match change {
                    Ok(change) if change.origin.is_local() => {
                        self.manager.send_message(
                            Target::Broadcast,
                            SessionMessage::ReplicatedDelta { bytes: change.bytes.to_vec() },
                        );
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Change feed lagged, broadcasting full state");
                        let full = self.store.encode_full_state();
                        self.manager.send_message(
                            Target::Broadcast,
                            SessionMessage::ReplicatedDelta { bytes: full.to_vec() },
                        );
                    }
                    Err(RecvError::Closed) => break,
                },

                changed = self.rendezvous.changed(), if rendezvous_open => {
                    if changed.is_err() {
                        rendezvous_open = false;
                        continue;
                    }
                    let up = *self.rendezvous.borrow_and_update();
                    let idle = reconnect.as_ref().map_or(true, |task| task.is_finished());
                    if !up && idle {
                        warn!(peer = %self.local, "Rendezvous link lost");
                        reconnect = Some(tokio::spawn(run_reconnect(
                            self.transport.clone(),
                            self.local.clone(),
                            self.config.reconnect.clone(),
                            self.monitor.clone(),
                            self.cancel.child_token(),
                        )));
                    }
                }
            }
        }

        if let Some(task) = reconnect {
            task.abort();
        }
        self.manager.shutdown();
        self.transport.release(&self.local);
        debug!(peer = %self.local, "Session loop stopped");
    }

    fn handle_inbound(&self, inbound: Inbound) {
        match inbound {
            Inbound::Frame {
                from,
                link_id,
                bytes,
            } => self.router.handle_frame(&from, link_id, &bytes),
            Inbound::Closed { peer, link_id } => {
                if let Some(departure) = self.manager.handle_closed(&peer, link_id) {
                    if departure.was_active {
                        self.emit(SessionEvent::PeerStatusChanged {
                            peer: peer.clone(),
                            status: PeerStatus::Offline,
                        });
                    }
                    self.on_departure(departure);
                }
            }
        }
    }

    fn send_heartbeat(&self) {
        let heads = self.store.heads();
        self.manager
            .send_message(Target::Everyone, SessionMessage::heartbeat(&heads));
    }

    fn sweep(&self) {
        let transitions = self.liveness.lock().sweep(Instant::now());
        for (peer, status) in transitions {
            info!(peer = %peer, %status, "Peer status changed");
            self.emit(SessionEvent::PeerStatusChanged {
                peer: peer.clone(),
                status,
            });
            if status == PeerStatus::Offline {
                if let Some(departure) = self.manager.disconnect(&peer) {
                    self.on_departure(departure);
                }
            }
        }
    }

    fn on_departure(&self, departure: Departure) {
        if !departure.was_active {
            return;
        }
        let Departure { peer, role, .. } = departure;
        self.emit(SessionEvent::PeerDisconnected { peer: peer.clone() });

        if role == LinkRole::Accepted && self.manager.is_host() {
            self.state.lock().roster.remove(&peer);
            let notified = self.manager.send_message(
                Target::AllExcept(peer.clone()),
                SessionMessage::PeerLeft {
                    identity: peer.clone(),
                },
            );
            debug!(peer = %peer, notified, "Announced departure");
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
