//! Automerge document wrapper for the shared session state
//!
//! SessionDoc wraps an Automerge document with four regions at the root:
//!
//! ```text
//! ROOT
//! ├── tokens:   Map<TokenId, json(TokenRecord)>
//! ├── notes:    List<json(Note)>
//! ├── quests:   List<json(Quest)>
//! └── messages: List<json(ChatMessage)>   (capped, oldest evicted)
//! ```
//!
//! ## Conflict rules
//!
//! - Tokens: last writer wins per token id. Concurrent puts on the same key
//!   are ordered by Automerge op id, i.e. Lamport counter first and actor id
//!   second, so every replica picks the same winner regardless of arrival
//!   order.
//! - Lists: concurrent inserts are all kept, in a deterministic RGA order.
//!   Replacements look the entry up by its id and overwrite that element.
//!
//! ## Shared genesis
//!
//! The region objects are created by a genesis change written with a fixed
//! actor and a zero timestamp, so every fresh replica produces the same
//! genesis change hash. Independent replicas therefore agree on the region
//! object ids and can merge deltas without a prior snapshot exchange.

use std::collections::BTreeMap;

use automerge::transaction::{CommitOptions, Transactable};
use automerge::{ActorId, AutoCommit, ChangeHash, ObjId, ObjType, ReadDoc, ROOT};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::DEFAULT_MAX_CHAT_MESSAGES;
use crate::error::{SyncError, SyncResult};
use crate::types::{ChatMessage, ItemId, Note, Quest, TokenId, TokenRecord};

/// Actor used only for the genesis change
const GENESIS_ACTOR: [u8; 16] = *b"tablesync-genesi";

/// Named region of the session document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    Tokens,
    Notes,
    Quests,
    Messages,
}

impl Region {
    pub const ALL: [Region; 4] = [Region::Tokens, Region::Notes, Region::Quests, Region::Messages];

    /// Key of the region object under the document root
    pub fn key(self) -> &'static str {
        match self {
            Region::Tokens => "tokens",
            Region::Notes => "notes",
            Region::Quests => "quests",
            Region::Messages => "messages",
        }
    }

    fn obj_type(self) -> ObjType {
        match self {
            Region::Tokens => ObjType::Map,
            _ => ObjType::List,
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Entry type stored in one of the list regions
pub trait ListEntry: Serialize + DeserializeOwned {
    const REGION: Region;

    fn item_id(&self) -> ItemId;
}

impl ListEntry for Note {
    const REGION: Region = Region::Notes;

    fn item_id(&self) -> ItemId {
        self.id
    }
}

impl ListEntry for Quest {
    const REGION: Region = Region::Quests;

    fn item_id(&self) -> ItemId {
        self.id
    }
}

impl ListEntry for ChatMessage {
    const REGION: Region = Region::Messages;

    fn item_id(&self) -> ItemId {
        self.id
    }
}

/// Only the id of a list entry, for lookups without decoding the full record
#[derive(Deserialize)]
struct EntryId {
    id: ItemId,
}

/// A local mutation of the session document
#[derive(Debug, Clone, PartialEq)]
pub enum DocOp {
    /// Insert or overwrite a token by id
    UpsertToken(TokenRecord),
    RemoveToken(TokenId),
    AppendNote(Note),
    ReplaceNote(Note),
    RemoveNote(ItemId),
    AppendQuest(Quest),
    ReplaceQuest(Quest),
    RemoveQuest(ItemId),
    /// Append a chat line, evicting the oldest lines beyond the cap
    AppendMessage(ChatMessage),
    ReplaceMessage(ChatMessage),
}

impl DocOp {
    /// Region this operation touches
    pub fn region(&self) -> Region {
        match self {
            DocOp::UpsertToken(_) | DocOp::RemoveToken(_) => Region::Tokens,
            DocOp::AppendNote(_) | DocOp::ReplaceNote(_) | DocOp::RemoveNote(_) => Region::Notes,
            DocOp::AppendQuest(_) | DocOp::ReplaceQuest(_) | DocOp::RemoveQuest(_) => {
                Region::Quests
            }
            DocOp::AppendMessage(_) | DocOp::ReplaceMessage(_) => Region::Messages,
        }
    }
}

/// Materialized value of the whole document
///
/// Two replicas have converged exactly when their `DocState`s are equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocState {
    pub tokens: BTreeMap<TokenId, TokenRecord>,
    pub notes: Vec<Note>,
    pub quests: Vec<Quest>,
    pub messages: Vec<ChatMessage>,
}

/// Automerge document wrapper for a session's shared state
///
/// # Example
///
/// ```
/// use tablesync_core::doc::{DocOp, SessionDoc};
/// use tablesync_core::TokenRecord;
///
/// let mut host = SessionDoc::new().unwrap();
/// let mut client = SessionDoc::new().unwrap();
///
/// let delta = host
///     .apply(&DocOp::UpsertToken(TokenRecord::new("goblin-1", "Goblin", 2, 2)))
///     .unwrap();
/// client.merge_delta(&delta).unwrap();
///
/// assert_eq!(host.state().unwrap(), client.state().unwrap());
/// ```
pub struct SessionDoc {
    doc: AutoCommit,
    max_messages: usize,
}

impl SessionDoc {
    /// Create a new document with the shared genesis regions
    pub fn new() -> SyncResult<Self> {
        Ok(Self {
            doc: Self::genesis()?,
            max_messages: DEFAULT_MAX_CHAT_MESSAGES,
        })
    }

    fn genesis() -> SyncResult<AutoCommit> {
        let mut doc = AutoCommit::new().with_actor(ActorId::from(GENESIS_ACTOR.as_slice()));
        for region in Region::ALL {
            doc.put_object(ROOT, region.key(), region.obj_type())?;
        }
        doc.commit_with(CommitOptions::default().with_time(0));
        doc.set_actor(ActorId::random());
        Ok(doc)
    }

    /// Set the chat transcript cap
    pub fn with_max_messages(mut self, cap: usize) -> Self {
        self.max_messages = cap.max(1);
        self
    }

    /// Load a document from a full snapshot
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Serialization` if the bytes are not a valid
    /// document or are missing one of the four regions.
    pub fn load(data: &[u8]) -> SyncResult<Self> {
        let doc = AutoCommit::load(data)
            .map_err(|e| SyncError::Serialization(e.to_string()))?
            .with_actor(ActorId::random());
        let loaded = Self {
            doc,
            max_messages: DEFAULT_MAX_CHAT_MESSAGES,
        };
        for region in Region::ALL {
            loaded.region_obj(region)?;
        }
        Ok(loaded)
    }

    /// Replace the whole document with a snapshot, keeping the message cap
    ///
    /// On error the current document is left untouched.
    pub fn replace(&mut self, snapshot: &[u8]) -> SyncResult<()> {
        let loaded = Self::load(snapshot)?;
        self.doc = loaded.doc;
        Ok(())
    }

    /// Save the full document state
    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Fork the document for concurrent editing (tests and simulations)
    pub fn fork(&mut self) -> Self {
        Self {
            doc: self.doc.fork(),
            max_messages: self.max_messages,
        }
    }

    /// Merge another in-process document into this one
    pub fn merge(&mut self, other: &mut SessionDoc) -> SyncResult<()> {
        self.doc.merge(&mut other.doc)?;
        Ok(())
    }

    /// Get the document heads (change hashes)
    pub fn heads(&mut self) -> Vec<ChangeHash> {
        self.doc.get_heads()
    }

    /// Apply a local operation atomically and return the encoded delta
    ///
    /// All Automerge ops produced by `op` land in a single change. If any
    /// step fails the pending ops are rolled back and nothing is emitted.
    pub fn apply(&mut self, op: &DocOp) -> SyncResult<Vec<u8>> {
        let before = self.doc.get_heads();
        if let Err(e) = self.apply_ops(op) {
            self.doc.rollback();
            return Err(e);
        }
        self.doc
            .commit_with(CommitOptions::default().with_time(chrono::Utc::now().timestamp()));
        let delta = self.doc.save_after(&before);
        debug!(region = %op.region(), bytes = delta.len(), "Applied local operation");
        Ok(delta)
    }

    fn apply_ops(&mut self, op: &DocOp) -> SyncResult<()> {
        match op {
            DocOp::UpsertToken(token) => {
                let tokens = self.region_obj(Region::Tokens)?;
                let json = serde_json::to_string(token)?;
                self.doc.put(&tokens, token.id.as_str(), json)?;
            }
            DocOp::RemoveToken(id) => {
                let tokens = self.region_obj(Region::Tokens)?;
                if self.doc.get(&tokens, id.as_str())?.is_none() {
                    return Err(SyncError::ItemNotFound(id.to_string()));
                }
                self.doc.delete(&tokens, id.as_str())?;
            }
            DocOp::AppendNote(note) => self.append(note)?,
            DocOp::ReplaceNote(note) => self.replace_entry(note)?,
            DocOp::RemoveNote(id) => self.remove_entry(Region::Notes, *id)?,
            DocOp::AppendQuest(quest) => self.append(quest)?,
            DocOp::ReplaceQuest(quest) => self.replace_entry(quest)?,
            DocOp::RemoveQuest(id) => self.remove_entry(Region::Quests, *id)?,
            DocOp::AppendMessage(message) => {
                self.append(message)?;
                self.evict_messages()?;
            }
            DocOp::ReplaceMessage(message) => self.replace_entry(message)?,
        }
        Ok(())
    }

    fn append<T: ListEntry>(&mut self, entry: &T) -> SyncResult<()> {
        let list = self.region_obj(T::REGION)?;
        let json = serde_json::to_string(entry)?;
        let end = self.doc.length(&list);
        self.doc.insert(&list, end, json)?;
        Ok(())
    }

    fn replace_entry<T: ListEntry>(&mut self, entry: &T) -> SyncResult<()> {
        let list = self.region_obj(T::REGION)?;
        let index = self
            .position(&list, entry.item_id())?
            .ok_or_else(|| SyncError::ItemNotFound(entry.item_id().to_string()))?;
        let json = serde_json::to_string(entry)?;
        self.doc.put(&list, index, json)?;
        Ok(())
    }

    fn remove_entry(&mut self, region: Region, id: ItemId) -> SyncResult<()> {
        let list = self.region_obj(region)?;
        let index = self
            .position(&list, id)?
            .ok_or_else(|| SyncError::ItemNotFound(id.to_string()))?;
        self.doc.delete(&list, index)?;
        Ok(())
    }

    fn evict_messages(&mut self) -> SyncResult<()> {
        let list = self.region_obj(Region::Messages)?;
        while self.doc.length(&list) > self.max_messages {
            self.doc.delete(&list, 0usize)?;
        }
        Ok(())
    }

    fn position(&self, list: &ObjId, id: ItemId) -> SyncResult<Option<usize>> {
        for index in 0..self.doc.length(list) {
            if let Some((value, _)) = self.doc.get(list, index)? {
                let Some(json) = value.to_str() else { continue };
                if let Ok(entry) = serde_json::from_str::<EntryId>(json) {
                    if entry.id == id {
                        return Ok(Some(index));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Merge an encoded delta produced by any replica
    ///
    /// Duplicate changes are ignored and changes whose dependencies have not
    /// arrived yet are queued until they do, so deltas may be delivered in
    /// any order and any number of times. A full snapshot is also a valid
    /// delta. Returns the number of operations applied.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Automerge` if the bytes are not a sequence of
    /// well-formed automerge chunks. Nothing is merged in that case.
    pub fn merge_delta(&mut self, delta: &[u8]) -> SyncResult<usize> {
        if delta.is_empty() {
            return Ok(0);
        }
        // load_incremental skips unparseable input on a non-empty document
        check_chunks(delta)?;
        let applied = self.doc.load_incremental(delta)?;
        Ok(applied)
    }

    /// Encode the changes a replica reporting `their_heads` is missing
    ///
    /// Heads this replica has never seen are ignored, so the result may
    /// repeat changes the other side already holds. Returns `None` when every
    /// local change is already covered by `their_heads`.
    pub fn changes_since(&mut self, their_heads: &[ChangeHash]) -> Option<Vec<u8>> {
        let known: Vec<ChangeHash> = their_heads
            .iter()
            .filter(|hash| self.doc.get_change_by_hash(hash).is_some())
            .copied()
            .collect();
        let delta = self.doc.save_after(&known);
        (!delta.is_empty()).then_some(delta)
    }

    fn region_obj(&self, region: Region) -> SyncResult<ObjId> {
        match self.doc.get(ROOT, region.key())? {
            Some((_, obj)) => Ok(obj),
            None => Err(SyncError::Serialization(format!(
                "{} region not found",
                region.key()
            ))),
        }
    }

    fn read_list<T: ListEntry>(&self) -> SyncResult<Vec<T>> {
        let list = self.region_obj(T::REGION)?;
        let mut entries = Vec::new();
        for index in 0..self.doc.length(&list) {
            if let Some((value, _)) = self.doc.get(&list, index)? {
                match value.to_str().map(serde_json::from_str::<T>) {
                    Some(Ok(entry)) => entries.push(entry),
                    _ => warn!(region = %T::REGION, index, "Skipping undecodable list entry"),
                }
            }
        }
        Ok(entries)
    }

    /// Get a token by id
    pub fn token(&self, id: &TokenId) -> SyncResult<Option<TokenRecord>> {
        let tokens = self.region_obj(Region::Tokens)?;
        match self.doc.get(&tokens, id.as_str())? {
            Some((value, _)) => {
                let json = value
                    .to_str()
                    .ok_or_else(|| SyncError::Serialization("token value is not a string".into()))?;
                Ok(Some(serde_json::from_str(json)?))
            }
            None => Ok(None),
        }
    }

    /// All tokens keyed by id
    pub fn tokens(&self) -> SyncResult<BTreeMap<TokenId, TokenRecord>> {
        let tokens = self.region_obj(Region::Tokens)?;
        let mut out = BTreeMap::new();
        for key in self.doc.keys(&tokens) {
            if let Some((value, _)) = self.doc.get(&tokens, &key)? {
                if let Some(Ok(token)) = value.to_str().map(serde_json::from_str::<TokenRecord>) {
                    out.insert(token.id.clone(), token);
                }
            }
        }
        Ok(out)
    }

    pub fn notes(&self) -> SyncResult<Vec<Note>> {
        self.read_list()
    }

    pub fn quests(&self) -> SyncResult<Vec<Quest>> {
        self.read_list()
    }

    /// Chat transcript, at most the configured cap, oldest first
    ///
    /// Concurrent appends on different replicas can briefly leave more
    /// entries than the cap in the list; reads always show the newest ones.
    pub fn messages(&self) -> SyncResult<Vec<ChatMessage>> {
        let mut messages: Vec<ChatMessage> = self.read_list()?;
        if messages.len() > self.max_messages {
            messages.drain(..messages.len() - self.max_messages);
        }
        Ok(messages)
    }

    /// Materialize all four regions
    pub fn state(&self) -> SyncResult<DocState> {
        Ok(DocState {
            tokens: self.tokens()?,
            notes: self.notes()?,
            quests: self.quests()?,
            messages: self.messages()?,
        })
    }
}

const CHUNK_MAGIC: [u8; 4] = [0x85, 0x6f, 0x4a, 0x83];
const CHUNK_HEADER_LEN: usize = 9;
const CHUNK_DOCUMENT: u8 = 0;
const CHUNK_CHANGE: u8 = 1;
const CHUNK_COMPRESSED_CHANGE: u8 = 2;

/// Walk the chunk framing of an encoded delta
///
/// Each chunk is `magic(4) checksum(4) type(1) uleb128(len) body(len)` and
/// the chunks must cover the input exactly. Change chunks are also decoded,
/// which verifies their checksum.
fn check_chunks(mut bytes: &[u8]) -> SyncResult<()> {
    let malformed = |what: &str| SyncError::Automerge(format!("malformed delta: {}", what));

    while !bytes.is_empty() {
        let header = bytes
            .get(..CHUNK_HEADER_LEN)
            .ok_or_else(|| malformed("truncated chunk header"))?;
        if header[..4] != CHUNK_MAGIC {
            return Err(malformed("bad magic bytes"));
        }
        let chunk_type = header[8];
        let (body_len, len_bytes) = read_uleb128(&bytes[CHUNK_HEADER_LEN..])
            .ok_or_else(|| malformed("bad chunk length"))?;
        let end = CHUNK_HEADER_LEN
            .checked_add(len_bytes)
            .and_then(|n| n.checked_add(body_len))
            .ok_or_else(|| malformed("bad chunk length"))?;
        let chunk = bytes.get(..end).ok_or_else(|| malformed("truncated chunk"))?;

        match chunk_type {
            CHUNK_DOCUMENT => {}
            CHUNK_CHANGE | CHUNK_COMPRESSED_CHANGE => {
                automerge::Change::try_from(chunk)
                    .map_err(|e| SyncError::Automerge(format!("malformed delta: {}", e)))?;
            }
            other => return Err(malformed(&format!("unknown chunk type {}", other))),
        }
        bytes = &bytes[end..];
    }
    Ok(())
}

fn read_uleb128(bytes: &[u8]) -> Option<(usize, usize)> {
    let mut value: u64 = 0;
    for (i, byte) in bytes.iter().take(10).enumerate() {
        value |= u64::from(byte & 0x7f).checked_shl(7 * i as u32)?;
        if byte & 0x80 == 0 {
            return Some((usize::try_from(value).ok()?, i + 1));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PeerId, QuestStatus};

    fn chat(text: &str) -> ChatMessage {
        ChatMessage::new(PeerId::from("tester"), "Tester", text)
    }

    #[test]
    fn test_session_doc_new_is_empty() {
        let doc = SessionDoc::new().unwrap();
        assert_eq!(doc.state().unwrap(), DocState::default());
    }

    #[test]
    fn test_fresh_replicas_share_genesis() {
        let mut a = SessionDoc::new().unwrap();
        let mut b = SessionDoc::new().unwrap();
        assert_eq!(a.heads(), b.heads());

        let delta = a
            .apply(&DocOp::AppendNote(Note::new("Map", "Cave under the mill")))
            .unwrap();
        b.merge_delta(&delta).unwrap();
        assert_eq!(b.notes().unwrap().len(), 1);
    }

    #[test]
    fn test_upsert_and_remove_token() {
        let mut doc = SessionDoc::new().unwrap();
        let token = TokenRecord::new("goblin-1", "Goblin", 2, 2);
        doc.apply(&DocOp::UpsertToken(token.clone())).unwrap();
        assert_eq!(doc.token(&token.id).unwrap(), Some(token.clone()));

        doc.apply(&DocOp::UpsertToken(token.moved_to(3, 2))).unwrap();
        assert_eq!(doc.token(&token.id).unwrap().unwrap().x, 3);

        doc.apply(&DocOp::RemoveToken(token.id.clone())).unwrap();
        assert!(doc.token(&token.id).unwrap().is_none());
    }

    #[test]
    fn test_remove_missing_token_fails_without_delta() {
        let mut doc = SessionDoc::new().unwrap();
        let heads = doc.heads();
        let result = doc.apply(&DocOp::RemoveToken(TokenId::from("nobody")));
        assert!(matches!(result, Err(SyncError::ItemNotFound(_))));
        assert_eq!(doc.heads(), heads);
    }

    #[test]
    fn test_replace_quest_by_id() {
        let mut doc = SessionDoc::new().unwrap();
        let quest = Quest::new("Rescue the miller", "He was last seen at the well");
        doc.apply(&DocOp::AppendQuest(Quest::new("Other", ""))).unwrap();
        doc.apply(&DocOp::AppendQuest(quest.clone())).unwrap();

        doc.apply(&DocOp::ReplaceQuest(quest.with_status(QuestStatus::Completed)))
            .unwrap();

        let quests = doc.quests().unwrap();
        assert_eq!(quests.len(), 2);
        assert_eq!(quests[1].status, QuestStatus::Completed);
    }

    #[test]
    fn test_replace_missing_note_fails() {
        let mut doc = SessionDoc::new().unwrap();
        let result = doc.apply(&DocOp::ReplaceNote(Note::new("ghost", "")));
        assert!(matches!(result, Err(SyncError::ItemNotFound(_))));
    }

    #[test]
    fn test_remove_note() {
        let mut doc = SessionDoc::new().unwrap();
        let note = Note::new("Clue", "The key is under the rug");
        doc.apply(&DocOp::AppendNote(note.clone())).unwrap();
        doc.apply(&DocOp::RemoveNote(note.id)).unwrap();
        assert!(doc.notes().unwrap().is_empty());
    }

    #[test]
    fn test_messages_capped_oldest_evicted() {
        let mut doc = SessionDoc::new().unwrap().with_max_messages(3);
        for i in 0..5 {
            doc.apply(&DocOp::AppendMessage(chat(&format!("line {}", i))))
                .unwrap();
        }
        let texts: Vec<String> = doc.messages().unwrap().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_merge_delta_is_idempotent() {
        let mut a = SessionDoc::new().unwrap();
        let mut b = SessionDoc::new().unwrap();
        let delta = a.apply(&DocOp::AppendMessage(chat("hello"))).unwrap();

        b.merge_delta(&delta).unwrap();
        let once = b.state().unwrap();
        b.merge_delta(&delta).unwrap();
        assert_eq!(b.state().unwrap(), once);
        assert_eq!(once.messages.len(), 1);
    }

    #[test]
    fn test_out_of_order_deltas_converge() {
        let mut a = SessionDoc::new().unwrap();
        let mut b = SessionDoc::new().unwrap();
        let token = TokenRecord::new("hero", "Hero", 0, 0);
        let first = a.apply(&DocOp::UpsertToken(token.clone())).unwrap();
        let second = a.apply(&DocOp::UpsertToken(token.moved_to(5, 5))).unwrap();

        // Second depends on first; it is held back until first arrives
        b.merge_delta(&second).unwrap();
        b.merge_delta(&first).unwrap();

        assert_eq!(a.state().unwrap(), b.state().unwrap());
        assert_eq!(b.token(&token.id).unwrap().unwrap().x, 5);
    }

    #[test]
    fn test_concurrent_token_moves_pick_same_winner() {
        let mut host = SessionDoc::new().unwrap();
        let token = TokenRecord::new("goblin-1", "Goblin", 2, 2);
        let base = host.apply(&DocOp::UpsertToken(token.clone())).unwrap();
        let mut client = SessionDoc::new().unwrap();
        client.merge_delta(&base).unwrap();

        let from_host = host.apply(&DocOp::UpsertToken(token.moved_to(3, 2))).unwrap();
        let from_client = client.apply(&DocOp::UpsertToken(token.moved_to(2, 3))).unwrap();

        host.merge_delta(&from_client).unwrap();
        client.merge_delta(&from_host).unwrap();

        let on_host = host.token(&token.id).unwrap().unwrap();
        let on_client = client.token(&token.id).unwrap().unwrap();
        assert_eq!(on_host, on_client);
        assert!((on_host.x, on_host.y) == (3, 2) || (on_host.x, on_host.y) == (2, 3));
    }

    #[test]
    fn test_malformed_delta_is_rejected() {
        let mut doc = SessionDoc::new().unwrap();
        let result = doc.merge_delta(&[0xde, 0xad, 0xbe, 0xef]);
        assert!(result.is_err());
        assert_eq!(doc.state().unwrap(), DocState::default());
    }

    #[test]
    fn test_corrupted_delta_is_rejected_after_edits() {
        let mut source = SessionDoc::new().unwrap();
        let mut doc = SessionDoc::new().unwrap();
        let first = source.apply(&DocOp::AppendNote(Note::new("Map", ""))).unwrap();
        doc.merge_delta(&first).unwrap();

        let mut truncated = source.apply(&DocOp::AppendNote(Note::new("Door", ""))).unwrap();
        truncated.truncate(truncated.len() / 2);
        assert!(doc.merge_delta(&truncated).is_err());

        let mut trailing = first.clone();
        trailing.extend_from_slice(b"junk");
        assert!(doc.merge_delta(&trailing).is_err());

        assert_eq!(doc.notes().unwrap().len(), 1);
    }

    #[test]
    fn test_empty_delta_is_a_no_op() {
        let mut doc = SessionDoc::new().unwrap();
        assert_eq!(doc.merge_delta(&[]).unwrap(), 0);
    }

    #[test]
    fn test_changes_since_covers_only_missing_changes() {
        let mut a = SessionDoc::new().unwrap();
        let mut b = SessionDoc::new().unwrap();
        let shared = a.apply(&DocOp::AppendNote(Note::new("Shared", ""))).unwrap();
        b.merge_delta(&shared).unwrap();

        let b_heads = b.heads();
        assert!(a.changes_since(&b_heads).is_none());

        a.apply(&DocOp::AppendMessage(chat("lost while apart"))).unwrap();
        let catch_up = a.changes_since(&b_heads).unwrap();
        assert!(b.merge_delta(&catch_up).unwrap() > 0);
        assert_eq!(a.state().unwrap(), b.state().unwrap());
        assert!(a.changes_since(&b.heads()).is_none());
    }

    #[test]
    fn test_changes_since_ignores_unknown_heads() {
        let mut a = SessionDoc::new().unwrap();
        let mut b = SessionDoc::new().unwrap();
        a.apply(&DocOp::AppendNote(Note::new("Only on a", ""))).unwrap();
        b.apply(&DocOp::AppendNote(Note::new("Only on b", ""))).unwrap();

        let catch_up = a.changes_since(&b.heads()).unwrap();
        b.merge_delta(&catch_up).unwrap();
        assert_eq!(b.notes().unwrap().len(), 2);
    }

    #[test]
    fn test_save_load_and_replace() {
        let mut doc = SessionDoc::new().unwrap();
        doc.apply(&DocOp::AppendNote(Note::new("Persisted", ""))).unwrap();
        let bytes = doc.save();

        let loaded = SessionDoc::load(&bytes).unwrap();
        assert_eq!(loaded.notes().unwrap().len(), 1);

        let mut other = SessionDoc::new().unwrap();
        other.apply(&DocOp::AppendQuest(Quest::new("Gone", ""))).unwrap();
        other.replace(&bytes).unwrap();
        assert_eq!(other.state().unwrap(), doc.state().unwrap());
    }

    #[test]
    fn test_replace_with_garbage_keeps_document() {
        let mut doc = SessionDoc::new().unwrap();
        doc.apply(&DocOp::AppendNote(Note::new("Keep me", ""))).unwrap();
        assert!(doc.replace(b"not a document").is_err());
        assert_eq!(doc.notes().unwrap().len(), 1);
    }

    #[test]
    fn test_full_save_merges_as_delta() {
        let mut a = SessionDoc::new().unwrap();
        let mut b = SessionDoc::new().unwrap();
        a.apply(&DocOp::AppendNote(Note::new("from a", ""))).unwrap();
        b.apply(&DocOp::AppendNote(Note::new("from b", ""))).unwrap();

        let full_a = a.save();
        let full_b = b.save();
        a.merge_delta(&full_b).unwrap();
        b.merge_delta(&full_a).unwrap();

        assert_eq!(a.state().unwrap(), b.state().unwrap());
        assert_eq!(a.notes().unwrap().len(), 2);
    }

    #[test]
    fn test_fork_and_merge() {
        let mut doc1 = SessionDoc::new().unwrap();
        doc1.apply(&DocOp::AppendMessage(chat("Original"))).unwrap();

        let mut doc2 = doc1.fork();
        doc2.apply(&DocOp::AppendMessage(chat("From fork"))).unwrap();

        doc1.merge(&mut doc2).unwrap();
        assert_eq!(doc1.messages().unwrap().len(), 2);
    }

    #[test]
    fn test_op_regions() {
        assert_eq!(DocOp::RemoveToken(TokenId::from("t")).region(), Region::Tokens);
        assert_eq!(DocOp::AppendMessage(chat("x")).region(), Region::Messages);
        assert_eq!(DocOp::RemoveQuest(ItemId::new()).region(), Region::Quests);
    }
}
