//! Replicated session document
//!
//! The session document holds the state several peers may change at the
//! same time: tokens on the shared map, notes, quests and the chat
//! transcript. It is backed by an Automerge document, so concurrent edits
//! converge without coordination.

pub mod session_doc;
pub mod store;

pub use session_doc::{DocOp, DocState, ListEntry, Region, SessionDoc};
pub use store::{ChangeKind, DocChange, DocumentStore, Origin};
