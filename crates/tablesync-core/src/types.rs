//! Core types for tablesync

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Session-scoped peer address
///
/// Assigned once when a session binds its transport and immutable for the
/// lifetime of the process. The string is opaque: for the in-memory transport
/// it is the claimed name, for iroh it is the endpoint id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a PeerId from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the underlying string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines and status displays
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier for a token on the shared map
///
/// Tokens are keyed by string so callers (or the dungeon-master tool calls)
/// can use stable names like `goblin-2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub String);

impl TokenId {
    /// Create a new random TokenId
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Borrow the underlying string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for TokenId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier for an entry in one of the list regions (notes, quests, chat)
///
/// Uses ULID for time-ordered unique identifiers that sort lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub Ulid);

impl ItemId {
    /// Create a new ItemId with current timestamp
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse from string representation
    pub fn from_string(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A token placed on the shared map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: TokenId,
    /// Display name
    pub name: String,
    /// Grid column
    pub x: i32,
    /// Grid row
    pub y: i32,
    /// Peer allowed to move this token, `None` for dungeon-master tokens
    #[serde(default)]
    pub owner: Option<PeerId>,
    #[serde(default)]
    pub hit_points: Option<i32>,
    #[serde(default)]
    pub initiative: Option<i32>,
    /// Hidden from players until revealed
    #[serde(default)]
    pub hidden: bool,
}

impl TokenRecord {
    /// Create a visible token at a grid position
    pub fn new(id: impl Into<TokenId>, name: impl Into<String>, x: i32, y: i32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            x,
            y,
            owner: None,
            hit_points: None,
            initiative: None,
            hidden: false,
        }
    }

    /// Set the owning peer
    pub fn with_owner(mut self, owner: PeerId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Copy of this token moved to a new grid position
    pub fn moved_to(&self, x: i32, y: i32) -> Self {
        Self {
            x,
            y,
            ..self.clone()
        }
    }
}

impl From<String> for TokenId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Shared note
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: ItemId,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub author: Option<PeerId>,
    /// Unix timestamp of creation
    pub created_at: i64,
}

impl Note {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: ItemId::new(),
            title: title.into(),
            body: body.into(),
            author: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Progress of a quest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum QuestStatus {
    #[default]
    Active,
    Completed,
    Failed,
}

/// Shared quest entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quest {
    pub id: ItemId,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub status: QuestStatus,
    /// Unix timestamp of creation
    pub created_at: i64,
}

impl Quest {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: ItemId::new(),
            title: title.into(),
            description: description.into(),
            status: QuestStatus::Active,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Copy of this quest with a new status
    pub fn with_status(&self, status: QuestStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

/// Who a chat line is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ChatKind {
    /// Written by a player
    #[default]
    Player,
    /// Narration produced by the dungeon master
    Narrator,
    /// Session notices (joins, dice results)
    System,
}

/// One line of the shared chat transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: ItemId,
    pub sender: PeerId,
    pub display_name: String,
    pub text: String,
    #[serde(default)]
    pub kind: ChatKind,
    /// Unix timestamp (milliseconds)
    pub sent_at: i64,
}

impl ChatMessage {
    pub fn new(sender: PeerId, display_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: ItemId::new(),
            sender,
            display_name: display_name.into(),
            text: text.into(),
            kind: ChatKind::Player,
            sent_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_kind(mut self, kind: ChatKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Role of this process in the session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionRole {
    /// Accepts joins and relays traffic. Every session starts here.
    #[default]
    Host,
    /// Joined another host
    Client { host: PeerId },
}

impl SessionRole {
    pub fn is_host(&self) -> bool {
        matches!(self, SessionRole::Host)
    }
}

/// Role of a connection relative to the local process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkRole {
    /// Host side of an approved join
    Accepted,
    /// Client side of the link to the host
    ToHost,
    /// Direct sibling link used to bypass host relay
    Mesh,
}

impl std::fmt::Display for LinkRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkRole::Accepted => write!(f, "accepted"),
            LinkRole::ToHost => write!(f, "to-host"),
            LinkRole::Mesh => write!(f, "mesh"),
        }
    }
}
