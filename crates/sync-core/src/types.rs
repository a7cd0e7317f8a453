use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::id::OrderedId;

/// Connection phase of the realtime session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    /// No connection and no attempt in progress.
    Disconnected,
    /// Transport connection is being opened.
    Connecting,
    /// Hello received; identify sent, waiting for ready.
    Identifying,
    /// Session is live and heartbeating.
    Connected,
    /// Reconnecting with the previous session id.
    Resuming,
    /// Server rejected the session; a fresh identify is required.
    Invalidated,
}

/// Why a session ended in a way that needs caller action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InvalidationReason {
    /// Token rejected by the server (or no token available). Force logout.
    AuthenticationFailed,
    /// Reconnect attempts ran out.
    ReconnectionExhausted,
}

/// Public profile of a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: OrderedId,
    pub username: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

/// File attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub id: OrderedId,
    pub filename: String,
    pub url: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// A chat message in one channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Ordering key. [`OrderedId::PLACEHOLDER`] while the message is pending.
    pub id: OrderedId,
    pub channel_id: OrderedId,
    #[serde(default)]
    pub guild_id: Option<OrderedId>,
    pub author: User,
    #[serde(default)]
    pub content: Option<String>,
    /// Client-generated correlation token used to reconcile local echoes.
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// Build an optimistic local echo with a fresh nonce and a placeholder id.
    pub fn pending(channel_id: OrderedId, author: User, content: impl Into<String>) -> Self {
        Self {
            id: OrderedId::PLACEHOLDER,
            channel_id,
            guild_id: None,
            author,
            content: Some(content.into()),
            nonce: Some(Uuid::new_v4().to_string()),
            edited: false,
            attachments: Vec::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.id.is_placeholder()
    }
}

/// Guild (server) metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Guild {
    pub id: OrderedId,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    pub owner_id: OrderedId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    #[default]
    Text,
    Voice,
    Direct,
    Category,
}

/// Channel metadata. `guild_id` is `None` for direct-message channels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub id: OrderedId,
    #[serde(default)]
    pub guild_id: Option<OrderedId>,
    pub name: String,
    #[serde(default)]
    pub kind: ChannelKind,
    #[serde(default)]
    pub position: i32,
}

/// Guild membership of a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub guild_id: OrderedId,
    pub user: User,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub roles: Vec<OrderedId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Idle,
    DoNotDisturb,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Presence {
    pub user_id: OrderedId,
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingStart {
    pub channel_id: OrderedId,
    pub user_id: OrderedId,
    /// Unix milliseconds.
    #[serde(default)]
    pub timestamp_ms: u64,
}

/// Read marker moved for a channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageAck {
    pub channel_id: OrderedId,
    pub message_id: OrderedId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRemove {
    pub id: OrderedId,
    pub channel_id: OrderedId,
    #[serde(default)]
    pub guild_id: Option<OrderedId>,
}

/// Guild with its channels and members, as delivered by guild-create frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuildSnapshot {
    pub guild: Guild,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub members: Vec<Member>,
}

/// Initial state delivered once a session is identified.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadyPayload {
    pub user: User,
    #[serde(default)]
    pub guilds: Vec<GuildSnapshot>,
    pub session_id: String,
}
