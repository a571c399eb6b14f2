//! tablesync core library
//!
//! Peer-to-peer shared tabletop sessions with Automerge-replicated state.
//!
//! ## Overview
//!
//! One process hosts a session; clients join it through a handshake the
//! host approves. State is split by how strongly peers must agree on it:
//!
//! - **Replicated**: tokens, notes, quests and the chat transcript live in
//!   an Automerge document ([`DocumentStore`]) and converge regardless of
//!   delivery order or duplication
//! - **Transient**: ephemeral broadcasts, session control and directed
//!   messages are relayed by the host and never merged
//!
//! ## Core Principles
//!
//! - **No central server**: the host relays, a rendezvous only resolves ids
//! - **Explicit origin**: every merge is tagged local or remote, so relayed
//!   deltas are never sent back
//! - **Loss is a state**: silent peers go `reconnecting`, then `offline`
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tablesync_core::{DocOp, MemoryTransport, Session, SessionConfig, TokenRecord};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(MemoryTransport::new());
//!     let host = Session::initialize(transport, SessionConfig::default(), Some("room-1".into())).await?;
//!
//!     host.mutate(DocOp::UpsertToken(TokenRecord::new("orc-1", "Orc", 3, 4)))?;
//!     for (id, token) in host.document().tokens()? {
//!         println!("{}: ({}, {})", id, token.x, token.y);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod doc;
pub mod error;
pub mod session;
pub mod sync;
pub mod transport;
pub mod types;

// Re-exports
pub use config::{ReconnectPolicy, SessionConfig};
pub use doc::{DocChange, DocOp, DocState, DocumentStore, Origin, Region, SessionDoc};
pub use error::{SyncError, SyncResult};
pub use session::Session;
pub use sync::{
    ControlAction, JoinRequestId, LocalLink, PeerStatus, PeerSummary, SessionEvent,
    SessionMessage, SessionState, WireMessage,
};
pub use transport::{IrohTransport, MemoryTransport, Transport};
pub use types::*;
