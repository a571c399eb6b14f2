//! Session wire protocol
//!
//! Messages are serialized with postcard and sent as one frame per message
//! over a [`crate::transport::Link`].
//!
//! ## Join Handshake
//!
//! ```text
//! Client                              Host
//!   |                                   |
//!   |--- JoinRequest {id, profile} ---->|
//!   |                                   |  (ConnectionRequest event,
//!   |                                   |   accept_join / reject_join)
//!   |<-- JoinResponse {id, approved} ---|
//!   |<-- PeerAnnounce (host, members) --|
//!   |<-- ReplicatedSnapshot {doc} ------|  (bootstrap completes here)
//!   |                                   |--- PeerAnnounce {client} ---> others
//! ```
//!
//! Until a link is approved only the handshake and liveness classes are
//! accepted on it. After that every message is routed by its
//! [`MessageClass`].
//!
//! ## Heads exchange
//!
//! Each heartbeat carries the sender's document heads. A receiver holding
//! changes the sender lacks answers with a catch-up `ReplicatedDelta`, so
//! deltas dropped by a short outage are recovered on the next beat.

use std::fmt;

use automerge::ChangeHash;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::types::PeerId;

/// Correlates a JOIN_RESPONSE with its JOIN_REQUEST
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JoinRequestId(pub Ulid);

impl JoinRequestId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for JoinRequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JoinRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Typed session-control payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlAction {
    SetPaused(bool),
    StartGame,
    AdvanceTurn,
    UpdateSetting { key: String, value: String },
    /// Application-defined control message
    Custom { subtype: String, data: Vec<u8> },
}

/// Routing class of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Handshake,
    Membership,
    Replicated,
    Ephemeral,
    Control,
    Directed,
    Liveness,
}

impl MessageClass {
    /// Whether the class is accepted on a link that has not been approved yet
    pub fn allowed_before_approval(self) -> bool {
        matches!(self, MessageClass::Handshake | MessageClass::Liveness)
    }

    /// Whether the host forwards the class to every other member
    pub fn fans_out(self) -> bool {
        matches!(
            self,
            MessageClass::Replicated | MessageClass::Ephemeral | MessageClass::Control
        )
    }
}

/// Messages exchanged between session peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMessage {
    /// Ask the host for admission
    JoinRequest {
        request_id: JoinRequestId,
        /// Opaque application profile
        profile: Vec<u8>,
    },

    /// Host's decision on a join request
    JoinResponse {
        request_id: JoinRequestId,
        approved: bool,
        reason: Option<String>,
    },

    /// A member's identity and profile
    PeerAnnounce { identity: PeerId, profile: Vec<u8> },

    /// A member's connection to the host closed
    PeerLeft { identity: PeerId },

    /// Incremental document change (`save_after` bytes, or a full save)
    ReplicatedDelta { bytes: Vec<u8> },

    /// Full document, sent by the host once at bootstrap
    ReplicatedSnapshot { bytes: Vec<u8> },

    /// Transient broadcast, never merged into the document
    Ephemeral { subtype: String, data: Vec<u8> },

    SessionControl { action: ControlAction },

    /// Addressed to one peer; the host forwards it if needed
    Directed {
        to: PeerId,
        subtype: String,
        data: Vec<u8>,
    },

    /// Liveness beat with the sender's document heads
    Heartbeat { heads: Vec<[u8; 32]> },
}

impl SessionMessage {
    pub fn heartbeat(heads: &[ChangeHash]) -> Self {
        SessionMessage::Heartbeat {
            heads: heads.iter().map(|hash| hash.0).collect(),
        }
    }

    pub fn class(&self) -> MessageClass {
        match self {
            SessionMessage::JoinRequest { .. } | SessionMessage::JoinResponse { .. } => {
                MessageClass::Handshake
            }
            SessionMessage::PeerAnnounce { .. } | SessionMessage::PeerLeft { .. } => {
                MessageClass::Membership
            }
            SessionMessage::ReplicatedDelta { .. } | SessionMessage::ReplicatedSnapshot { .. } => {
                MessageClass::Replicated
            }
            SessionMessage::Ephemeral { .. } => MessageClass::Ephemeral,
            SessionMessage::SessionControl { .. } => MessageClass::Control,
            SessionMessage::Directed { .. } => MessageClass::Directed,
            SessionMessage::Heartbeat { .. } => MessageClass::Liveness,
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            SessionMessage::JoinRequest { .. } => "join_request",
            SessionMessage::JoinResponse { .. } => "join_response",
            SessionMessage::PeerAnnounce { .. } => "peer_announce",
            SessionMessage::PeerLeft { .. } => "peer_left",
            SessionMessage::ReplicatedDelta { .. } => "replicated_delta",
            SessionMessage::ReplicatedSnapshot { .. } => "replicated_snapshot",
            SessionMessage::Ephemeral { .. } => "ephemeral",
            SessionMessage::SessionControl { .. } => "session_control",
            SessionMessage::Directed { .. } => "directed",
            SessionMessage::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// A message with its original author
///
/// `origin` survives host relaying, so receivers of relayed traffic see the
/// peer that produced it rather than the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: PeerId,
    pub message: SessionMessage,
}

impl Envelope {
    pub fn new(origin: PeerId, message: SessionMessage) -> Self {
        Self { origin, message }
    }
}

/// Wrapper for versioned messages
///
/// New versions can be added as variants without breaking existing nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Protocol version 1
    V1(Envelope),
}

impl WireMessage {
    pub fn new(envelope: Envelope) -> Self {
        WireMessage::V1(envelope)
    }

    /// Encode wire message to bytes using postcard
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Decode wire message from bytes using postcard
    pub fn decode(data: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(data)
    }

    pub fn into_inner(self) -> Envelope {
        match self {
            WireMessage::V1(envelope) => envelope,
        }
    }

    pub fn as_inner(&self) -> &Envelope {
        match self {
            WireMessage::V1(envelope) => envelope,
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            WireMessage::V1(_) => 1,
        }
    }
}
