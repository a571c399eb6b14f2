//! iroh QUIC transport
//!
//! One endpoint per session, one bidirectional stream per link. Frames on the
//! stream are length-delimited (4-byte big-endian length, 1 MiB max).
//!
//! The session identity is the endpoint id. A preferred name is turned into
//! a deterministic secret key, so the same name always yields the same id.
//! Before binding a name the transport dials the derived id from a throwaway
//! endpoint; if anything answers, the name is taken and `bind` fails with
//! `IdentityUnavailable`.
//!
//! The rendezvous watch follows the endpoint's home relay: it drops to
//! `false` when the relay connection is lost after having been up (or never
//! comes up within [`RELAY_GRACE`]), and `reconnect` waits for the relay to
//! come back.
//!
//! QUIC only opens a stream on the accepting side once data arrives, so the
//! dialer writes one empty frame right after `open_bi`. Readers skip empty
//! frames.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use iroh::discovery::static_provider::StaticProvider;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::protocol::{AcceptError, ProtocolHandler, Router};
use iroh::{Endpoint, EndpointAddr, EndpointId, SecretKey, Watcher};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use super::{Binding, Link, Transport};
use crate::error::{SyncError, SyncResult};
use crate::types::PeerId;

/// ALPN for session links
pub const SESSION_ALPN: &[u8] = b"/tablesync/session/1";

const MAX_FRAME_SIZE: usize = 1024 * 1024;
const INCOMING_CAPACITY: usize = 32;
const FLUSH_TIMEOUT: Duration = Duration::from_millis(500);
const CLAIM_CHECK_TIMEOUT: Duration = Duration::from_secs(3);
/// How long a fresh endpoint may take to reach its home relay
pub const RELAY_GRACE: Duration = Duration::from_secs(10);
const RELAY_WAIT: Duration = Duration::from_secs(5);
const IDENTITY_CONTEXT: &str = "tablesync 2026 session identity v1";

/// Derive the endpoint secret key for a preferred session name
pub fn derive_secret_key(name: &str) -> SecretKey {
    SecretKey::from_bytes(&blake3::derive_key(IDENTITY_CONTEXT, name.as_bytes()))
}

struct Bound {
    local: PeerId,
    endpoint: Endpoint,
    router: Router,
    rendezvous: watch::Sender<bool>,
    relay_monitor: JoinHandle<()>,
}

/// Transport over an iroh endpoint
pub struct IrohTransport {
    static_provider: StaticProvider,
    claim_check: Duration,
    bound: Mutex<Option<Bound>>,
}

impl Default for IrohTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl IrohTransport {
    pub fn new() -> Self {
        Self {
            static_provider: StaticProvider::new(),
            claim_check: CLAIM_CHECK_TIMEOUT,
            bound: Mutex::new(None),
        }
    }

    /// How long `bind` waits for a holder of the preferred name to answer
    pub fn with_claim_check(mut self, timeout: Duration) -> Self {
        self.claim_check = timeout;
        self
    }

    /// Make a peer's direct addresses known without relying on DNS discovery
    pub fn add_peer_addr(&self, endpoint_addr: EndpointAddr) {
        info!(
            peer = %endpoint_addr.id,
            addrs = endpoint_addr.addrs.len(),
            "Adding peer address to static discovery"
        );
        self.static_provider.add_endpoint_info(endpoint_addr);
    }

    /// Full address of the bound endpoint, for sharing out of band
    pub fn endpoint_addr(&self) -> Option<EndpointAddr> {
        self.bound.lock().as_ref().map(|b| b.endpoint.addr())
    }

    fn endpoint(&self) -> SyncResult<Endpoint> {
        self.bound
            .lock()
            .as_ref()
            .map(|b| b.endpoint.clone())
            .ok_or_else(|| SyncError::Transport("endpoint not bound".into()))
    }

    /// Whether some other endpoint already answers as `id`
    async fn is_claimed(&self, id: EndpointId) -> SyncResult<bool> {
        let scout = Endpoint::builder()
            .discovery(self.static_provider.clone())
            .bind()
            .await
            .map_err(|e| SyncError::Network(format!("Failed to bind endpoint: {}", e)))?;

        let claimed = match tokio::time::timeout(self.claim_check, scout.connect(id, SESSION_ALPN)).await {
            Ok(Ok(connection)) => {
                connection.close(0u32.into(), b"identity check");
                true
            }
            Ok(Err(e)) => {
                debug!(peer = %id, error = %e, "Identity not answering");
                false
            }
            Err(_) => false,
        };
        scout.close().await;
        Ok(claimed)
    }
}

impl Transport for IrohTransport {
    fn bind(&self, preferred: Option<PeerId>) -> BoxFuture<'_, SyncResult<Binding>> {
        Box::pin(async move {
            if self.bound.lock().is_some() {
                return Err(SyncError::Transport("endpoint already bound".into()));
            }

            let secret_key = match &preferred {
                Some(name) => {
                    let key = derive_secret_key(name.as_str());
                    if self.is_claimed(key.public()).await? {
                        warn!(name = %name, "Preferred identity already answers");
                        return Err(SyncError::IdentityUnavailable(name.clone()));
                    }
                    key
                }
                None => SecretKey::generate(&mut rand::rng()),
            };

            let endpoint = Endpoint::builder()
                .secret_key(secret_key)
                .alpns(vec![SESSION_ALPN.to_vec()])
                .discovery(self.static_provider.clone())
                .bind()
                .await
                .map_err(|e| SyncError::Network(format!("Failed to bind endpoint: {}", e)))?;

            let local = PeerId::new(endpoint.id().to_string());
            info!(peer = %local, ?preferred, "Endpoint bound");

            let (incoming_tx, incoming) = mpsc::channel(INCOMING_CAPACITY);
            let router = Router::builder(endpoint.clone())
                .accept(SESSION_ALPN, SessionProtocolHandler { incoming_tx })
                .spawn();

            let (rendezvous_tx, rendezvous) = watch::channel(true);
            let relay_monitor = tokio::spawn(follow_home_relay(
                endpoint.clone(),
                local.clone(),
                rendezvous_tx.clone(),
            ));

            let mut bound = self.bound.lock();
            if bound.is_some() {
                relay_monitor.abort();
                return Err(SyncError::Transport("endpoint already bound".into()));
            }
            *bound = Some(Bound {
                local: local.clone(),
                endpoint,
                router,
                rendezvous: rendezvous_tx,
                relay_monitor,
            });

            Ok(Binding {
                local,
                incoming,
                rendezvous,
            })
        })
    }

    fn dial(&self, _local: PeerId, remote: PeerId) -> BoxFuture<'_, SyncResult<Link>> {
        Box::pin(async move {
            let endpoint = self.endpoint()?;
            let remote_id: EndpointId = remote
                .as_str()
                .parse()
                .map_err(|e| SyncError::ConnectionUnreachable(format!("{}: {}", remote, e)))?;

            let connection = endpoint
                .connect(remote_id, SESSION_ALPN)
                .await
                .map_err(|e| SyncError::ConnectionUnreachable(format!("{}: {}", remote, e)))?;

            let (mut send, recv) = connection
                .open_bi()
                .await
                .map_err(|e| SyncError::ConnectionUnreachable(format!("{}: {}", remote, e)))?;

            // Empty frame so the acceptor sees the stream
            send.write_all(&0u32.to_be_bytes())
                .await
                .map_err(|e| SyncError::ConnectionUnreachable(format!("{}: {}", remote, e)))?;

            debug!(remote = %remote, "QUIC link opened");
            Ok(spawn_link(remote, connection, send, recv))
        })
    }

    fn reconnect(&self, local: PeerId) -> BoxFuture<'_, SyncResult<()>> {
        Box::pin(async move {
            let (endpoint, rendezvous) = {
                let bound = self.bound.lock();
                match bound.as_ref() {
                    Some(b) if b.local == local && !b.endpoint.is_closed() => {
                        (b.endpoint.clone(), b.rendezvous.clone())
                    }
                    Some(_) => return Err(SyncError::Network("endpoint closed".into())),
                    None => return Err(SyncError::Transport(format!("{} is not bound", local))),
                }
            };

            // Re-check interfaces and relays instead of waiting for the next report
            endpoint.network_change().await;
            let mut relays = endpoint
                .watch_addr()
                .map(|addr| addr.relay_urls().cloned().collect::<Vec<_>>())
                .stream();
            let registered = tokio::time::timeout(RELAY_WAIT, async {
                while let Some(urls) = relays.next().await {
                    if !urls.is_empty() {
                        return true;
                    }
                }
                false
            })
            .await;

            match registered {
                Ok(true) => {
                    rendezvous.send_replace(true);
                    Ok(())
                }
                Ok(false) => Err(SyncError::Network("endpoint closed".into())),
                Err(_) => Err(SyncError::Network("home relay unreachable".into())),
            }
        })
    }

    fn release(&self, local: &PeerId) {
        let Some(bound) = self.bound.lock().take() else {
            return;
        };
        if &bound.local != local {
            warn!(peer = %local, bound = %bound.local, "Releasing a different identity");
        }
        bound.relay_monitor.abort();
        bound.rendezvous.send_replace(false);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to shut down endpoint on");
            return;
        };
        handle.spawn(async move {
            if let Err(e) = bound.router.shutdown().await {
                warn!(error = ?e, "Failed to shutdown router cleanly");
            }
            bound.endpoint.close().await;
            info!(peer = %bound.local, "Endpoint closed");
        });
    }
}

/// Mirror the home relay connection into the rendezvous watch
async fn follow_home_relay(endpoint: Endpoint, local: PeerId, rendezvous: watch::Sender<bool>) {
    let mut relays = endpoint
        .watch_addr()
        .map(|addr| addr.relay_urls().cloned().collect::<Vec<_>>())
        .stream();
    let mut registered = false;
    let grace = tokio::time::sleep(RELAY_GRACE);
    tokio::pin!(grace);

    loop {
        tokio::select! {
            urls = relays.next() => {
                let Some(urls) = urls else { break };
                let up = !urls.is_empty();
                if up {
                    registered = true;
                }
                // Before the first registration only the grace timer marks it down
                if registered && set_rendezvous(&rendezvous, up) {
                    info!(peer = %local, up, "Home relay changed");
                }
            }
            _ = &mut grace, if !registered => {
                registered = true;
                if set_rendezvous(&rendezvous, false) {
                    warn!(peer = %local, "No home relay after grace period");
                }
            }
        }
    }
    debug!(peer = %local, "Home relay monitor stopped");
}

fn set_rendezvous(rendezvous: &watch::Sender<bool>, up: bool) -> bool {
    rendezvous.send_if_modified(|current| {
        let changed = *current != up;
        *current = up;
        changed
    })
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

/// Pump frames between a QUIC stream pair and a [`Link`]
fn spawn_link(remote: PeerId, connection: Connection, send: SendStream, recv: RecvStream) -> Link {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Bytes>();

    let writer_peer = remote.clone();
    let writer_conn = connection.clone();
    tokio::spawn(async move {
        let mut writer = FramedWrite::new(send, codec());
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = writer.send(frame).await {
                debug!(peer = %writer_peer, error = %e, "Write failed, closing link");
                break;
            }
        }
        let mut send = writer.into_inner();
        if send.finish().is_ok() {
            // Let queued frames (a rejection, a last delta) reach the peer
            let _ = tokio::time::timeout(FLUSH_TIMEOUT, send.stopped()).await;
        }
        writer_conn.close(0u32.into(), b"link closed");
        debug!(peer = %writer_peer, "Link writer finished");
    });

    let reader_peer = remote.clone();
    tokio::spawn(async move {
        let mut reader = FramedRead::new(recv, codec());
        while let Some(frame) = reader.next().await {
            match frame {
                Ok(frame) if frame.is_empty() => continue,
                Ok(frame) => {
                    if in_tx.send(frame.freeze()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(peer = %reader_peer, error = %e, "Read failed, closing link");
                    break;
                }
            }
        }
        debug!(peer = %reader_peer, "Link reader finished");
    });

    Link {
        remote,
        sender: out_tx,
        receiver: in_rx,
    }
}

/// Accepts session links routed by ALPN
#[derive(Clone)]
struct SessionProtocolHandler {
    incoming_tx: mpsc::Sender<Link>,
}

impl std::fmt::Debug for SessionProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionProtocolHandler").finish_non_exhaustive()
    }
}

impl ProtocolHandler for SessionProtocolHandler {
    fn accept(&self, conn: Connection) -> impl Future<Output = Result<(), AcceptError>> + Send {
        let incoming_tx = self.incoming_tx.clone();

        async move {
            let remote = PeerId::new(conn.remote_id().to_string());
            debug!(peer = %remote, "Router accepting session link");

            // Identity checks connect and close without opening a stream
            let (send, recv) = conn.accept_bi().await.map_err(|e| {
                debug!(peer = %remote, error = %e, "Connection closed before opening a stream");
                AcceptError::from_err(e)
            })?;

            let link = spawn_link(remote.clone(), conn.clone(), send, recv);
            if incoming_tx.send(link).await.is_err() {
                warn!(peer = %remote, "Session no longer accepting links");
                return Ok(());
            }

            // Keep the handler alive for the lifetime of the connection
            conn.closed().await;
            Ok(())
        }
    }
}
