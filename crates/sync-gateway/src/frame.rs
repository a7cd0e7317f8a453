//! JSON wire frames.
//!
//! Every frame travels in the envelope `{"t": <discriminator>, "s": <seq>, "d": <payload>}`.
//! `s` is only present on server frames that advance the session sequence.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use sync_core::{
    Channel, Guild, GuildSnapshot, Member, Message, MessageAck, MessageRemove, OrderedId,
    Presence, ReadyPayload, SyncError, SyncErrorCategory, TypingStart, User,
};
use thiserror::Error;

/// Reasons in `INVALID_SESSION` that mean the token itself was rejected.
pub const AUTH_FAILURE_REASONS: [&str; 2] = ["authentication_failed", "invalid_token"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown frame discriminator '{0}'")]
    UnknownDiscriminator(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl From<FrameError> for SyncError {
    fn from(err: FrameError) -> Self {
        let code = match err {
            FrameError::UnknownDiscriminator(_) => "frame_unknown",
            FrameError::Malformed(_) => "frame_malformed",
        };
        SyncError::new(SyncErrorCategory::Protocol, code, err.to_string())
    }
}

/// Frame sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Hello { heartbeat_interval_ms: u64 },
    /// Server asks for an immediate heartbeat.
    Heartbeat,
    HeartbeatAck,
    InvalidSession { reason: String },
    Ready(ReadyPayload),
    Resumed,
    MessageCreate(Message),
    MessageUpdate(Message),
    MessageRemove(MessageRemove),
    MessageAck(MessageAck),
    ChannelCreate(Channel),
    ChannelRemove(Channel),
    GuildCreate(GuildSnapshot),
    GuildUpdate(Guild),
    GuildRemove(Guild),
    MemberCreate(Member),
    MemberRemove(Member),
    PresenceUpdate(Presence),
    TypingStart(TypingStart),
    UserUpdate(User),
}

/// A decoded server frame with its optional sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedFrame {
    pub sequence: Option<u64>,
    pub frame: InboundFrame,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    t: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    s: Option<u64>,
    #[serde(default)]
    d: Value,
}

#[derive(Serialize, Deserialize)]
struct HelloBody {
    heartbeat_interval: u64,
}

#[derive(Serialize, Deserialize)]
struct InvalidSessionBody {
    #[serde(default)]
    reason: String,
}

#[derive(Serialize, Deserialize)]
struct MessageBody<T> {
    message: T,
}

#[derive(Serialize, Deserialize)]
struct ChannelBody<T> {
    channel: T,
}

#[derive(Serialize, Deserialize)]
struct GuildBody<T> {
    guild: T,
}

#[derive(Serialize, Deserialize)]
struct MemberBody<T> {
    member: T,
}

#[derive(Serialize, Deserialize)]
struct UserBody<T> {
    user: T,
}

impl InboundFrame {
    pub fn discriminator(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "HELLO",
            Self::Heartbeat => "HEARTBEAT",
            Self::HeartbeatAck => "HEARTBEAT_ACK",
            Self::InvalidSession { .. } => "INVALID_SESSION",
            Self::Ready(_) => "READY",
            Self::Resumed => "RESUMED",
            Self::MessageCreate(_) => "MESSAGE_CREATE",
            Self::MessageUpdate(_) => "MESSAGE_UPDATE",
            Self::MessageRemove(_) => "MESSAGE_REMOVE",
            Self::MessageAck(_) => "MESSAGE_ACK",
            Self::ChannelCreate(_) => "CHANNEL_CREATE",
            Self::ChannelRemove(_) => "CHANNEL_REMOVE",
            Self::GuildCreate(_) => "GUILD_CREATE",
            Self::GuildUpdate(_) => "GUILD_UPDATE",
            Self::GuildRemove(_) => "GUILD_REMOVE",
            Self::MemberCreate(_) => "MEMBER_CREATE",
            Self::MemberRemove(_) => "MEMBER_REMOVE",
            Self::PresenceUpdate(_) => "PRESENCE_UPDATE",
            Self::TypingStart(_) => "TYPING_START",
            Self::UserUpdate(_) => "USER_UPDATE",
        }
    }

    /// Control frames drive the session; everything else is domain data.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Self::Hello { .. }
                | Self::Heartbeat
                | Self::HeartbeatAck
                | Self::InvalidSession { .. }
                | Self::Ready(_)
                | Self::Resumed
        )
    }

    pub fn decode(text: &str) -> Result<SequencedFrame, FrameError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|err| FrameError::Malformed(err.to_string()))?;
        let Envelope { t, s, d } = envelope;

        let frame = match t.as_str() {
            "HELLO" => {
                let body: HelloBody = payload(&t, d)?;
                Self::Hello {
                    heartbeat_interval_ms: body.heartbeat_interval,
                }
            }
            "HEARTBEAT" => Self::Heartbeat,
            "HEARTBEAT_ACK" => Self::HeartbeatAck,
            "INVALID_SESSION" => {
                let body: InvalidSessionBody = payload(&t, d)?;
                Self::InvalidSession {
                    reason: body.reason,
                }
            }
            "READY" => Self::Ready(payload(&t, d)?),
            "RESUMED" => Self::Resumed,
            "MESSAGE_CREATE" => {
                Self::MessageCreate(payload::<MessageBody<Message>>(&t, d)?.message)
            }
            "MESSAGE_UPDATE" => {
                Self::MessageUpdate(payload::<MessageBody<Message>>(&t, d)?.message)
            }
            "MESSAGE_REMOVE" => Self::MessageRemove(payload(&t, d)?),
            "MESSAGE_ACK" => Self::MessageAck(payload(&t, d)?),
            "CHANNEL_CREATE" => {
                Self::ChannelCreate(payload::<ChannelBody<Channel>>(&t, d)?.channel)
            }
            "CHANNEL_REMOVE" => {
                Self::ChannelRemove(payload::<ChannelBody<Channel>>(&t, d)?.channel)
            }
            "GUILD_CREATE" => Self::GuildCreate(payload(&t, d)?),
            "GUILD_UPDATE" => Self::GuildUpdate(payload::<GuildBody<Guild>>(&t, d)?.guild),
            "GUILD_REMOVE" => Self::GuildRemove(payload::<GuildBody<Guild>>(&t, d)?.guild),
            "MEMBER_CREATE" => Self::MemberCreate(payload::<MemberBody<Member>>(&t, d)?.member),
            "MEMBER_REMOVE" => Self::MemberRemove(payload::<MemberBody<Member>>(&t, d)?.member),
            "PRESENCE_UPDATE" => Self::PresenceUpdate(payload(&t, d)?),
            "TYPING_START" => Self::TypingStart(payload(&t, d)?),
            "USER_UPDATE" => Self::UserUpdate(payload::<UserBody<User>>(&t, d)?.user),
            _ => return Err(FrameError::UnknownDiscriminator(t)),
        };

        Ok(SequencedFrame { sequence: s, frame })
    }

    /// Encode as the server would. Used by in-memory servers and tests.
    pub fn encode(&self, sequence: Option<u64>) -> Result<String, FrameError> {
        let d = match self {
            Self::Hello {
                heartbeat_interval_ms,
            } => to_value(&HelloBody {
                heartbeat_interval: *heartbeat_interval_ms,
            })?,
            Self::Heartbeat | Self::HeartbeatAck | Self::Resumed => Value::Null,
            Self::InvalidSession { reason } => to_value(&InvalidSessionBody {
                reason: reason.clone(),
            })?,
            Self::Ready(ready) => to_value(ready)?,
            Self::MessageCreate(message) | Self::MessageUpdate(message) => {
                to_value(&MessageBody { message })?
            }
            Self::MessageRemove(remove) => to_value(remove)?,
            Self::MessageAck(ack) => to_value(ack)?,
            Self::ChannelCreate(channel) | Self::ChannelRemove(channel) => {
                to_value(&ChannelBody { channel })?
            }
            Self::GuildCreate(snapshot) => to_value(snapshot)?,
            Self::GuildUpdate(guild) | Self::GuildRemove(guild) => to_value(&GuildBody { guild })?,
            Self::MemberCreate(member) | Self::MemberRemove(member) => {
                to_value(&MemberBody { member })?
            }
            Self::PresenceUpdate(presence) => to_value(presence)?,
            Self::TypingStart(typing) => to_value(typing)?,
            Self::UserUpdate(user) => to_value(&UserBody { user })?,
        };

        serde_json::to_string(&Envelope {
            t: self.discriminator().to_owned(),
            s: sequence,
            d,
        })
        .map_err(|err| FrameError::Malformed(err.to_string()))
    }
}

/// Session to resume, sent inside `IDENTIFY`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResumeRequest {
    pub session_id: String,
    #[serde(default)]
    pub seq: Option<u64>,
}

/// Frame sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "t", content = "d", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundFrame {
    Identify {
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume: Option<ResumeRequest>,
    },
    Heartbeat {
        seq: Option<u64>,
    },
    StartTyping {
        channel_id: OrderedId,
    },
}

impl OutboundFrame {
    pub fn discriminator(&self) -> &'static str {
        match self {
            Self::Identify { .. } => "IDENTIFY",
            Self::Heartbeat { .. } => "HEARTBEAT",
            Self::StartTyping { .. } => "START_TYPING",
        }
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(|err| FrameError::Malformed(err.to_string()))
    }

    /// Decode as the server would. Used by in-memory servers and tests.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        serde_json::from_str(text).map_err(|err| FrameError::Malformed(err.to_string()))
    }
}

fn payload<T: DeserializeOwned>(discriminator: &str, d: Value) -> Result<T, FrameError> {
    serde_json::from_value(d)
        .map_err(|err| FrameError::Malformed(format!("{discriminator} payload: {err}")))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, FrameError> {
    serde_json::to_value(value).map_err(|err| FrameError::Malformed(err.to_string()))
}
