//! Session synchronization layer
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  ConnectionManager                                              │
//! │  ├── links (Accepted / ToHost / Mesh), one reader task each     │
//! │  └── join handshake: pending requests (host), waiters (client)  │
//! │                                                                 │
//! │  EventRouter                                                    │
//! │  ├── classifies every inbound frame                             │
//! │  └── merges, relays (host), emits SessionEvents                 │
//! │                                                                 │
//! │  HeartbeatSupervisor                                            │
//! │  ├── online -> reconnecting -> offline per peer                 │
//! │  └── run_reconnect: backoff for the local rendezvous link       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The topology is a star: clients talk to the host, the host relays.
//! Optional mesh links between clients carry only directed traffic and
//! heartbeats.
//!
//! ## Protocol
//!
//! - **JoinRequest / JoinResponse**: admission handshake
//! - **PeerAnnounce / PeerLeft**: membership
//! - **ReplicatedDelta / ReplicatedSnapshot**: document changes
//! - **Ephemeral, SessionControl, Directed**: application traffic
//! - **Heartbeat**: liveness, carrying document heads for catch-up

pub mod connection;
pub mod events;
pub mod heartbeat;
pub mod protocol;
pub mod router;

pub use connection::{ConnectionManager, Departure, Inbound, Target};
pub use events::{LocalLink, PeerStatus, PeerSummary, SessionEvent};
pub use heartbeat::{run_reconnect, HeartbeatSupervisor, LinkMonitor};
pub use protocol::{
    ControlAction, Envelope, JoinRequestId, MessageClass, SessionMessage, WireMessage,
};
pub use router::{EventRouter, SessionState};
