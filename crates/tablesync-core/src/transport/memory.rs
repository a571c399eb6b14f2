//! In-process transport
//!
//! All sessions sharing one `MemoryTransport` can reach each other. Besides
//! plain links the hub can simulate the failures a session has to survive:
//!
//! - [`MemoryTransport::partition`] silently drops frames between two
//!   identities while the links stay open
//! - [`MemoryTransport::sever`] takes an identity off the rendezvous until
//!   [`MemoryTransport::restore`] is called
//!
//! Links are driven by one forwarding task per direction, so closing either
//! end closes the other.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

use super::{Binding, Link, Transport};
use crate::error::{SyncError, SyncResult};
use crate::types::PeerId;

const INCOMING_CAPACITY: usize = 32;

struct Registration {
    incoming: mpsc::Sender<Link>,
    rendezvous: watch::Sender<bool>,
    /// Registered with the rendezvous and accepting links
    online: bool,
    /// Simulated outage: reconnect attempts fail until restored
    outage: bool,
}

#[derive(Default)]
struct Hub {
    peers: HashMap<PeerId, Registration>,
    partitions: HashSet<(PeerId, PeerId)>,
}

impl Hub {
    fn is_partitioned(&self, a: &PeerId, b: &PeerId) -> bool {
        self.partitions.contains(&pair(a, b))
    }
}

fn pair(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Transport connecting sessions inside one process
#[derive(Clone, Default)]
pub struct MemoryTransport {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all frames between `a` and `b` until [`Self::heal`]
    pub fn partition(&self, a: &PeerId, b: &PeerId) {
        info!(a = %a, b = %b, "Partitioning peers");
        self.hub.lock().partitions.insert(pair(a, b));
    }

    pub fn heal(&self, a: &PeerId, b: &PeerId) {
        info!(a = %a, b = %b, "Healing partition");
        self.hub.lock().partitions.remove(&pair(a, b));
    }

    /// Knock `id` off the rendezvous; reconnects fail until [`Self::restore`]
    pub fn sever(&self, id: &PeerId) {
        let mut hub = self.hub.lock();
        if let Some(reg) = hub.peers.get_mut(id) {
            info!(peer = %id, "Severing rendezvous link");
            reg.online = false;
            reg.outage = true;
            reg.rendezvous.send_replace(false);
        }
    }

    /// End the simulated outage; the next reconnect attempt succeeds
    pub fn restore(&self, id: &PeerId) {
        if let Some(reg) = self.hub.lock().peers.get_mut(id) {
            info!(peer = %id, "Rendezvous available again");
            reg.outage = false;
        }
    }

    /// Whether `id` is currently registered with the rendezvous
    pub fn is_online(&self, id: &PeerId) -> bool {
        self.hub.lock().peers.get(id).is_some_and(|reg| reg.online)
    }

    fn random_id(hub: &Hub) -> PeerId {
        loop {
            let candidate = PeerId::new(format!("peer-{}", hex::encode(rand::random::<[u8; 4]>())));
            if !hub.peers.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Build both ends of a link from `a` to `b`
    fn wire(&self, a: PeerId, b: PeerId) -> (Link, Link) {
        let (a_tx, a_out) = mpsc::unbounded_channel();
        let (b_tx, b_out) = mpsc::unbounded_channel();
        let (a_in_tx, a_in) = mpsc::unbounded_channel();
        let (b_in_tx, b_in) = mpsc::unbounded_channel();

        tokio::spawn(forward(self.hub.clone(), a.clone(), b.clone(), a_out, b_in_tx));
        tokio::spawn(forward(self.hub.clone(), b.clone(), a.clone(), b_out, a_in_tx));

        (
            Link {
                remote: b.clone(),
                sender: a_tx,
                receiver: a_in,
            },
            Link {
                remote: a,
                sender: b_tx,
                receiver: b_in,
            },
        )
    }
}

async fn forward(
    hub: Arc<Mutex<Hub>>,
    from: PeerId,
    to: PeerId,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    tx: mpsc::UnboundedSender<Bytes>,
) {
    while let Some(frame) = rx.recv().await {
        if hub.lock().is_partitioned(&from, &to) {
            trace!(from = %from, to = %to, bytes = frame.len(), "Partitioned, dropping frame");
            continue;
        }
        if tx.send(frame).is_err() {
            break;
        }
    }
    debug!(from = %from, to = %to, "Link direction closed");
}

impl Transport for MemoryTransport {
    fn bind(&self, preferred: Option<PeerId>) -> BoxFuture<'_, SyncResult<Binding>> {
        Box::pin(async move {
            let mut hub = self.hub.lock();
            let local = match preferred {
                Some(id) if hub.peers.contains_key(&id) => {
                    return Err(SyncError::IdentityUnavailable(id));
                }
                Some(id) => id,
                None => Self::random_id(&hub),
            };

            let (incoming_tx, incoming) = mpsc::channel(INCOMING_CAPACITY);
            let (rendezvous_tx, rendezvous) = watch::channel(true);
            hub.peers.insert(
                local.clone(),
                Registration {
                    incoming: incoming_tx,
                    rendezvous: rendezvous_tx,
                    online: true,
                    outage: false,
                },
            );
            info!(peer = %local, "Bound memory identity");

            Ok(Binding {
                local,
                incoming,
                rendezvous,
            })
        })
    }

    fn dial(&self, local: PeerId, remote: PeerId) -> BoxFuture<'_, SyncResult<Link>> {
        Box::pin(async move {
            let incoming = {
                let hub = self.hub.lock();
                if !hub.peers.get(&local).is_some_and(|reg| reg.online) {
                    return Err(SyncError::Network(format!(
                        "{} is not registered with the rendezvous",
                        local
                    )));
                }
                match hub.peers.get(&remote) {
                    Some(reg) if reg.online => reg.incoming.clone(),
                    _ => {
                        return Err(SyncError::ConnectionUnreachable(format!(
                            "{} is not reachable",
                            remote
                        )))
                    }
                }
            };

            let (near, far) = self.wire(local, remote.clone());
            incoming
                .send(far)
                .await
                .map_err(|_| SyncError::ConnectionUnreachable(format!("{} stopped accepting", remote)))?;
            debug!(remote = %remote, "Memory link opened");
            Ok(near)
        })
    }

    fn reconnect(&self, local: PeerId) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(async move {
            let mut hub = self.hub.lock();
            let reg = hub
                .peers
                .get_mut(&local)
                .ok_or_else(|| SyncError::Transport(format!("{} is not bound", local)))?;
            if reg.outage {
                return Err(SyncError::Network("rendezvous unavailable".into()));
            }
            reg.online = true;
            reg.rendezvous.send_replace(true);
            Ok(())
        })
    }

    fn release(&self, local: &PeerId) {
        let mut hub = self.hub.lock();
        if hub.peers.remove(local).is_some() {
            debug!(peer = %local, "Released memory identity");
        }
        hub.partitions.retain(|(a, b)| a != local && b != local);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_preferred_identity_conflict() {
        let transport = MemoryTransport::new();
        let _first = transport.bind(Some(PeerId::from("room-1"))).await.unwrap();

        let err = transport
            .bind(Some(PeerId::from("room-1")))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::IdentityUnavailable(id) if id.as_str() == "room-1"));
    }

    #[tokio::test]
    async fn test_generated_identity() {
        let transport = MemoryTransport::new();
        let binding = transport.bind(None).await.unwrap();
        assert!(binding.local.as_str().starts_with("peer-"));
        assert!(transport.is_online(&binding.local));
    }

    #[tokio::test]
    async fn test_link_carries_frames_both_ways() {
        let transport = MemoryTransport::new();
        let mut host = transport.bind(Some(PeerId::from("host"))).await.unwrap();
        let _client = transport.bind(Some(PeerId::from("client"))).await.unwrap();

        let mut near = transport
            .dial(PeerId::from("client"), PeerId::from("host"))
            .await
            .unwrap();
        let mut far = host.incoming.recv().await.unwrap();
        assert_eq!(far.remote.as_str(), "client");

        near.sender.send(Bytes::from_static(b"ping")).unwrap();
        assert_eq!(far.receiver.recv().await.unwrap(), Bytes::from_static(b"ping"));
        far.sender.send(Bytes::from_static(b"pong")).unwrap();
        assert_eq!(near.receiver.recv().await.unwrap(), Bytes::from_static(b"pong"));

        drop(far);
        assert!(near.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dial_unknown_peer_is_unreachable() {
        let transport = MemoryTransport::new();
        let _client = transport.bind(Some(PeerId::from("client"))).await.unwrap();
        let err = transport
            .dial(PeerId::from("client"), PeerId::from("nobody"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ConnectionUnreachable(_)));
    }

    #[tokio::test]
    async fn test_partition_drops_frames_until_healed() {
        let transport = MemoryTransport::new();
        let mut host = transport.bind(Some(PeerId::from("host"))).await.unwrap();
        let _client = transport.bind(Some(PeerId::from("client"))).await.unwrap();
        let near = transport
            .dial(PeerId::from("client"), PeerId::from("host"))
            .await
            .unwrap();
        let mut far = host.incoming.recv().await.unwrap();

        transport.partition(&PeerId::from("host"), &PeerId::from("client"));
        near.sender.send(Bytes::from_static(b"lost")).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        transport.heal(&PeerId::from("client"), &PeerId::from("host"));
        near.sender.send(Bytes::from_static(b"kept")).unwrap();

        assert_eq!(far.receiver.recv().await.unwrap(), Bytes::from_static(b"kept"));
    }

    #[tokio::test]
    async fn test_sever_and_restore() {
        let transport = MemoryTransport::new();
        let mut binding = transport.bind(Some(PeerId::from("host"))).await.unwrap();
        let id = PeerId::from("host");

        transport.sever(&id);
        assert!(!*binding.rendezvous.borrow_and_update());
        assert!(transport.reconnect(id.clone()).await.is_err());

        transport.restore(&id);
        transport.reconnect(id.clone()).await.unwrap();
        assert!(*binding.rendezvous.borrow_and_update());
        assert!(transport.is_online(&id));
    }
}
