//! Inbound dispatch
//!
//! Every frame read from any link passes through [`EventRouter::handle_frame`]
//! exactly once. The router decodes it, updates liveness, and applies the
//! effect for its class:
//!
//! | Class      | Local effect                      | Host relay               |
//! |------------|-----------------------------------|--------------------------|
//! | Replicated | merge under `Origin::Remote`      | all except sender        |
//! | Ephemeral  | `SessionEvent::Ephemeral`         | all except sender        |
//! | Control    | apply to [`SessionState`]         | all except sender        |
//! | Directed   | event if addressed here           | addressee only           |
//! | Liveness   | timer reset, catch-up if behind   | none                     |
//! | Membership | roster update                     | none                     |
//!
//! Relays go out over star links only, so a host never sends a frame back
//! to the link it came from nor twice to the same peer.

use std::collections::BTreeMap;
use std::sync::Arc;

use automerge::ChangeHash;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::connection::{ConnectionManager, Target};
use super::events::{PeerStatus, SessionEvent};
use super::heartbeat::HeartbeatSupervisor;
use super::protocol::{ControlAction, Envelope, MessageClass, SessionMessage, WireMessage};
use crate::doc::{DocumentStore, Origin};
use crate::types::{LinkRole, PeerId};

/// Session-wide state driven by control messages and membership traffic
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub paused: bool,
    pub started: bool,
    pub turn: u64,
    pub settings: BTreeMap<String, String>,
    /// Known members other than this process, with their profiles
    pub roster: BTreeMap<PeerId, Vec<u8>>,
}

impl SessionState {
    pub fn apply(&mut self, action: &ControlAction) {
        match action {
            ControlAction::SetPaused(paused) => self.paused = *paused,
            ControlAction::StartGame => {
                self.started = true;
                self.paused = false;
            }
            ControlAction::AdvanceTurn => self.turn += 1,
            ControlAction::UpdateSetting { key, value } => {
                self.settings.insert(key.clone(), value.clone());
            }
            ControlAction::Custom { .. } => {}
        }
    }
}

/// Applies inbound frames for one session
#[derive(Clone)]
pub struct EventRouter {
    local: PeerId,
    manager: ConnectionManager,
    store: DocumentStore,
    state: Arc<Mutex<SessionState>>,
    liveness: Arc<Mutex<HeartbeatSupervisor>>,
    events: broadcast::Sender<SessionEvent>,
}

impl EventRouter {
    pub fn new(
        manager: ConnectionManager,
        store: DocumentStore,
        state: Arc<Mutex<SessionState>>,
        liveness: Arc<Mutex<HeartbeatSupervisor>>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            local: manager.local_id().clone(),
            manager,
            store,
            state,
            liveness,
            events,
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Handle one frame read from `from`'s link
    pub fn handle_frame(&self, from: &PeerId, link_id: u64, bytes: &Bytes) {
        let Some(active) = self.manager.link_state(from, link_id) else {
            trace!(peer = %from, link_id, "Frame from stale link");
            return;
        };

        let envelope = match WireMessage::decode(bytes) {
            Ok(wire) => wire.into_inner(),
            Err(e) => {
                warn!(peer = %from, bytes = bytes.len(), error = %e, "Dropping undecodable frame");
                return;
            }
        };
        let class = envelope.message.class();
        trace!(peer = %from, kind = envelope.message.name(), ?class, "Frame received");

        if !active {
            if class.allowed_before_approval() {
                self.handle_handshake(from, &envelope.message);
            } else {
                debug!(peer = %from, kind = envelope.message.name(), "Dropping message from unapproved link");
            }
            return;
        }

        self.observe(from);
        let accepted = match class {
            MessageClass::Handshake => {
                self.handle_handshake(from, &envelope.message);
                false
            }
            MessageClass::Membership => {
                self.handle_membership(&envelope.message);
                false
            }
            MessageClass::Replicated => self.handle_replicated(from, &envelope.message),
            MessageClass::Ephemeral | MessageClass::Control => {
                self.handle_application(&envelope);
                true
            }
            MessageClass::Directed => {
                self.handle_directed(from, &envelope);
                false
            }
            MessageClass::Liveness => {
                self.handle_heartbeat(from, &envelope.message);
                false
            }
        };

        if accepted && class.fans_out() {
            self.relay(from, &envelope);
        }
    }

    /// Any arrival resets the peer's timer and revives it
    fn observe(&self, from: &PeerId) {
        let revived = self.liveness.lock().observe(from, Instant::now());
        if revived == Some(PeerStatus::Online) {
            info!(peer = %from, "Peer back online");
            self.emit(SessionEvent::PeerStatusChanged {
                peer: from.clone(),
                status: PeerStatus::Online,
            });
            // Anything changed while silent reaches the peer as one delta
            let full = self.store.encode_full_state();
            self.manager.send_message(
                Target::Peer(from.clone()),
                SessionMessage::ReplicatedDelta { bytes: full.to_vec() },
            );
        }
    }

    fn handle_handshake(&self, from: &PeerId, message: &SessionMessage) {
        match message {
            SessionMessage::JoinRequest { request_id, profile } => {
                if self.manager.has_active(from) {
                    debug!(peer = %from, "Ignoring join request from active member");
                } else {
                    self.manager.record_join_request(from, *request_id, profile.clone());
                }
            }
            SessionMessage::JoinResponse {
                request_id,
                approved,
                reason,
            } => {
                self.manager
                    .resolve_join(from, *request_id, *approved, reason.clone());
            }
            _ => {}
        }
    }

    fn handle_membership(&self, message: &SessionMessage) {
        match message {
            SessionMessage::PeerAnnounce { identity, profile } => {
                if identity == &self.local {
                    return;
                }
                self.state
                    .lock()
                    .roster
                    .insert(identity.clone(), profile.clone());
                info!(peer = %identity, "Member announced");
                self.emit(SessionEvent::PeerAnnounced {
                    peer: identity.clone(),
                    profile: profile.clone(),
                });
            }
            SessionMessage::PeerLeft { identity } => {
                self.state.lock().roster.remove(identity);
                info!(peer = %identity, "Member left");
                self.emit(SessionEvent::PeerLeft {
                    peer: identity.clone(),
                });
            }
            _ => {}
        }
    }

    /// Returns whether the document changed, which is what makes the host relay
    fn handle_replicated(&self, from: &PeerId, message: &SessionMessage) -> bool {
        match message {
            SessionMessage::ReplicatedDelta { bytes } => self
                .store
                .merge_remote_delta(bytes, Origin::Remote(from.clone())),
            SessionMessage::ReplicatedSnapshot { bytes } => {
                if self.manager.host().as_ref() == Some(from) {
                    if let Err(e) = self
                        .store
                        .replace_full_state(bytes, Origin::Remote(from.clone()))
                    {
                        warn!(peer = %from, error = %e, "Dropping malformed snapshot");
                    }
                    self.manager.finish_bootstrap(from);
                } else {
                    self.store
                        .merge_remote_delta(bytes, Origin::Remote(from.clone()));
                }
                false
            }
            _ => false,
        }
    }

    fn handle_application(&self, envelope: &Envelope) {
        match &envelope.message {
            SessionMessage::Ephemeral { subtype, data } => {
                self.emit(SessionEvent::Ephemeral {
                    from: envelope.origin.clone(),
                    subtype: subtype.clone(),
                    data: data.clone(),
                });
            }
            SessionMessage::SessionControl { action } => {
                self.state.lock().apply(action);
                self.emit(SessionEvent::Control {
                    from: envelope.origin.clone(),
                    action: action.clone(),
                });
            }
            _ => {}
        }
    }

    fn handle_directed(&self, from: &PeerId, envelope: &Envelope) {
        let SessionMessage::Directed { to, subtype, data } = &envelope.message else {
            return;
        };
        if to == &self.local {
            self.emit(SessionEvent::Directed {
                from: envelope.origin.clone(),
                subtype: subtype.clone(),
                data: data.clone(),
            });
        } else if self.manager.is_host() {
            if self.manager.send(Target::Peer(to.clone()), envelope) == 0 {
                debug!(peer = %from, to = %to, "Directed message has no route");
            }
        } else {
            debug!(peer = %from, to = %to, "Dropping directed message for another peer");
        }
    }

    /// Answer a beat whose heads are behind ours with the missing changes
    ///
    /// Mesh links carry no document traffic, so their heads are ignored.
    fn handle_heartbeat(&self, from: &PeerId, message: &SessionMessage) {
        let SessionMessage::Heartbeat { heads } = message else {
            return;
        };
        if self.manager.role_of(from) == Some(LinkRole::Mesh) {
            return;
        }
        let heads: Vec<ChangeHash> = heads.iter().copied().map(ChangeHash).collect();
        if let Some(missing) = self.store.changes_since(&heads) {
            debug!(peer = %from, bytes = missing.len(), "Sending catch-up delta");
            self.manager.send_message(
                Target::Peer(from.clone()),
                SessionMessage::ReplicatedDelta {
                    bytes: missing.to_vec(),
                },
            );
        }
    }

    fn relay(&self, from: &PeerId, envelope: &Envelope) {
        if self.manager.is_host() {
            let relayed = self.manager.send(Target::AllExcept(from.clone()), envelope);
            trace!(peer = %from, kind = envelope.message.name(), relayed, "Relayed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_actions() {
        let mut state = SessionState::default();
        state.apply(&ControlAction::SetPaused(true));
        assert!(state.paused);
        state.apply(&ControlAction::StartGame);
        assert!(state.started && !state.paused);
        state.apply(&ControlAction::AdvanceTurn);
        state.apply(&ControlAction::AdvanceTurn);
        assert_eq!(state.turn, 2);
        state.apply(&ControlAction::UpdateSetting {
            key: "difficulty".into(),
            value: "hard".into(),
        });
        assert_eq!(state.settings.get("difficulty").map(String::as_str), Some("hard"));

        let before = state.clone();
        state.apply(&ControlAction::Custom {
            subtype: "ambience".into(),
            data: vec![1],
        });
        assert_eq!(state, before);
    }
}
