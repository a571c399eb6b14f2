//! Peer links and rendezvous identities
//!
//! A transport does three things for a session:
//!
//! 1. **bind**: claim a session-wide identity and start listening
//! 2. **dial**: open a reliable, ordered link to another identity
//! 3. **reconnect**: restore the rendezvous registration after it drops
//!
//! Every link, whatever carries it, is exposed as a [`Link`]: a pair of
//! byte-frame channels. Dropping the sending half closes the link, and the
//! remote side observes the close as its receiver ending.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  Transport                                                     │
//! │  ├── MemoryTransport  in-process hub (tests, embedding)        │
//! │  └── IrohTransport    QUIC endpoint, one bi-stream per link    │
//! │                                                                │
//! │  Binding                                                       │
//! │  ├── local       claimed PeerId                                │
//! │  ├── incoming    inbound Links                                 │
//! │  └── rendezvous  true while the identity is reachable          │
//! └────────────────────────────────────────────────────────────────┘
//! ```

pub mod memory;
pub mod quic;

pub use memory::MemoryTransport;
pub use quic::{IrohTransport, SESSION_ALPN};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};

use crate::error::SyncResult;
use crate::types::PeerId;

/// One open, ordered link to a remote identity
#[derive(Debug)]
pub struct Link {
    pub remote: PeerId,
    pub sender: mpsc::UnboundedSender<Bytes>,
    pub receiver: mpsc::UnboundedReceiver<Bytes>,
}

/// Result of claiming an identity
#[derive(Debug)]
pub struct Binding {
    pub local: PeerId,
    /// Links opened by remote peers
    pub incoming: mpsc::Receiver<Link>,
    /// `true` while the local identity is registered with the rendezvous
    pub rendezvous: watch::Receiver<bool>,
}

/// Network backend used by a session
pub trait Transport: Send + Sync + 'static {
    /// Claim an identity and start accepting links
    ///
    /// Fails with `SyncError::IdentityUnavailable` when `preferred` is
    /// already claimed. With no preference the transport chooses one.
    fn bind(&self, preferred: Option<PeerId>) -> BoxFuture<'_, SyncResult<Binding>>;

    /// Open a link from `local` to `remote`
    ///
    /// Fails with `SyncError::ConnectionUnreachable` if the remote cannot
    /// be reached.
    fn dial(&self, local: PeerId, remote: PeerId) -> BoxFuture<'_, SyncResult<Link>>;

    /// Try once to restore the rendezvous registration of `local`
    fn reconnect(&self, local: PeerId) -> BoxFuture<'_, SyncResult<()>>;

    /// Give up the identity; existing links are left to close on their own
    fn release(&self, local: &PeerId);
}
