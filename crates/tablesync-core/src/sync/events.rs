//! Session notifications and status types
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  PeerStatus: per-connection liveness                            │
//! │  ├── Online: heard from within peer_timeout                     │
//! │  ├── Reconnecting: silent, link still open                      │
//! │  └── Offline: closed or silent past offline_timeout             │
//! │                                                                 │
//! │  LocalLink: our own rendezvous registration                     │
//! │  ├── Connected                                                  │
//! │  ├── Reconnecting { attempt }                                   │
//! │  └── Disconnected: backoff exhausted, terminal                  │
//! │                                                                 │
//! │  SessionEvent: everything a consumer reacts to                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use super::protocol::{ControlAction, JoinRequestId};
use crate::types::{LinkRole, PeerId};

/// Liveness phase of one remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    Online,
    Reconnecting,
    Offline,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerStatus::Online => write!(f, "online"),
            PeerStatus::Reconnecting => write!(f, "reconnecting"),
            PeerStatus::Offline => write!(f, "offline"),
        }
    }
}

/// State of the local rendezvous registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalLink {
    #[default]
    Connected,
    Reconnecting {
        /// 1-based attempt about to be made
        attempt: u32,
    },
    /// Reconnect attempts exhausted
    Disconnected,
}

impl fmt::Display for LocalLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalLink::Connected => write!(f, "connected"),
            LocalLink::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
            LocalLink::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// One entry of [`crate::Session::peers`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub peer: PeerId,
    pub role: LinkRole,
    pub status: PeerStatus,
    /// Profile from the join request or PEER_ANNOUNCE, if known
    pub profile: Option<Vec<u8>>,
}

/// Events emitted by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A connection became active
    PeerConnected { peer: PeerId, role: LinkRole },

    /// A connection closed or was dropped after going offline
    PeerDisconnected { peer: PeerId },

    /// A peer asked to join; answer with `accept_join` or `reject_join`
    ConnectionRequest {
        request: JoinRequestId,
        peer: PeerId,
        profile: Vec<u8>,
    },

    PeerStatusChanged { peer: PeerId, status: PeerStatus },

    /// A session member was announced by the host
    PeerAnnounced { peer: PeerId, profile: Vec<u8> },

    /// The host reported a member leaving
    PeerLeft { peer: PeerId },

    Ephemeral {
        from: PeerId,
        subtype: String,
        data: Vec<u8>,
    },

    Control { from: PeerId, action: ControlAction },

    /// A directed message addressed to this process
    Directed {
        from: PeerId,
        subtype: String,
        data: Vec<u8>,
    },

    LocalLinkChanged(LocalLink),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(PeerStatus::Reconnecting.to_string(), "reconnecting");
        assert_eq!(
            LocalLink::Reconnecting { attempt: 3 }.to_string(),
            "reconnecting (attempt 3)"
        );
        assert_eq!(LocalLink::default(), LocalLink::Connected);
    }
}
