//! Shared handle to the session document with a change feed
//!
//! `DocumentStore` is the single place the session document is mutated.
//! Every successful mutation or merge is announced on a broadcast channel
//! tagged with its [`Origin`]:
//!
//! - `Origin::Local` changes must be sent to peers
//! - `Origin::Remote(_)` changes already arrived over the network and must
//!   not be re-sent by the subscriber
//!
//! That tag is what keeps relays from looping deltas back and forth.

use std::collections::BTreeMap;
use std::sync::Arc;

use automerge::ChangeHash;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::session_doc::{DocOp, DocState, Region, SessionDoc};
use crate::error::SyncResult;
use crate::types::{ChatMessage, Note, PeerId, Quest, TokenId, TokenRecord};

/// Where a document change came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Produced by this process; subscribers should replicate it
    Local,
    /// Merged from a peer; subscribers must not replicate it again
    Remote(PeerId),
}

impl Origin {
    pub fn is_local(&self) -> bool {
        matches!(self, Origin::Local)
    }
}

/// Whether a change was an incremental delta or a wholesale replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Delta,
    Snapshot,
}

/// Notification emitted after every successful mutate, merge or replace
#[derive(Debug, Clone)]
pub struct DocChange {
    pub origin: Origin,
    pub kind: ChangeKind,
    /// Region touched by a local operation, unknown for merges
    pub region: Option<Region>,
    /// Encoded delta (or snapshot) that produced this change
    pub bytes: Bytes,
    /// Automerge operations applied, for merges
    pub ops_applied: usize,
}

/// Cloneable handle to the replicated session document
#[derive(Clone)]
pub struct DocumentStore {
    doc: Arc<Mutex<SessionDoc>>,
    change_tx: broadcast::Sender<DocChange>,
}

impl DocumentStore {
    /// Create a store around a fresh document
    pub fn new(max_messages: usize, capacity: usize) -> SyncResult<Self> {
        let doc = SessionDoc::new()?.with_max_messages(max_messages);
        Ok(Self::from_doc(doc, capacity))
    }

    /// Wrap an existing document
    pub fn from_doc(doc: SessionDoc, capacity: usize) -> Self {
        let (change_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            doc: Arc::new(Mutex::new(doc)),
            change_tx,
        }
    }

    /// Subscribe to document changes
    ///
    /// Multiple subscribers can exist; each receives every change in order.
    pub fn subscribe(&self) -> broadcast::Receiver<DocChange> {
        self.change_tx.subscribe()
    }

    /// Apply a local operation and return its delta
    ///
    /// The change is announced with `Origin::Local` before the lock is
    /// released, so subscribers see deltas in the order they were produced.
    pub fn mutate(&self, op: DocOp) -> SyncResult<Bytes> {
        let mut doc = self.doc.lock();
        let delta = Bytes::from(doc.apply(&op)?);
        let _ = self.change_tx.send(DocChange {
            origin: Origin::Local,
            kind: ChangeKind::Delta,
            region: Some(op.region()),
            bytes: delta.clone(),
            ops_applied: 0,
        });
        Ok(delta)
    }

    /// Merge a delta tagged with its origin
    ///
    /// Never fails outward: an undecodable delta is logged and dropped so a
    /// single corrupt message cannot take the session down. Returns whether
    /// the delta changed the document; duplicates and deltas still waiting
    /// on their dependencies return `false` and are not announced.
    pub fn merge_remote_delta(&self, delta: &[u8], origin: Origin) -> bool {
        let mut doc = self.doc.lock();
        match doc.merge_delta(delta) {
            Ok(0) => {
                debug!(?origin, bytes = delta.len(), "Delta had nothing new");
                false
            }
            Ok(ops_applied) => {
                debug!(?origin, bytes = delta.len(), ops_applied, "Merged delta");
                let _ = self.change_tx.send(DocChange {
                    origin,
                    kind: ChangeKind::Delta,
                    region: None,
                    bytes: Bytes::copy_from_slice(delta),
                    ops_applied,
                });
                true
            }
            Err(e) => {
                warn!(?origin, bytes = delta.len(), error = %e, "Dropping malformed delta");
                false
            }
        }
    }

    /// Current document heads
    pub fn heads(&self) -> Vec<ChangeHash> {
        self.doc.lock().heads()
    }

    /// Changes a peer reporting `their_heads` has not seen yet
    pub fn changes_since(&self, their_heads: &[ChangeHash]) -> Option<Bytes> {
        self.doc.lock().changes_since(their_heads).map(Bytes::from)
    }

    /// Encode the complete document
    pub fn encode_full_state(&self) -> Bytes {
        Bytes::from(self.doc.lock().save())
    }

    /// Replace the whole document with a snapshot
    ///
    /// Used for the bootstrap sync a client receives right after joining and
    /// for loading a saved session. On error the document is unchanged.
    pub fn replace_full_state(&self, snapshot: &[u8], origin: Origin) -> SyncResult<()> {
        let mut doc = self.doc.lock();
        doc.replace(snapshot)?;
        debug!(?origin, bytes = snapshot.len(), "Replaced document from snapshot");
        let _ = self.change_tx.send(DocChange {
            origin,
            kind: ChangeKind::Snapshot,
            region: None,
            bytes: Bytes::copy_from_slice(snapshot),
            ops_applied: 0,
        });
        Ok(())
    }

    /// Materialize all regions
    pub fn state(&self) -> SyncResult<DocState> {
        self.doc.lock().state()
    }

    pub fn token(&self, id: &TokenId) -> SyncResult<Option<TokenRecord>> {
        self.doc.lock().token(id)
    }

    pub fn tokens(&self) -> SyncResult<BTreeMap<TokenId, TokenRecord>> {
        self.doc.lock().tokens()
    }

    pub fn notes(&self) -> SyncResult<Vec<Note>> {
        self.doc.lock().notes()
    }

    pub fn quests(&self) -> SyncResult<Vec<Quest>> {
        self.doc.lock().quests()
    }

    pub fn messages(&self) -> SyncResult<Vec<ChatMessage>> {
        self.doc.lock().messages()
    }
}
