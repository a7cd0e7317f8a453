use serde::{Deserialize, Serialize};

use crate::types::{
    Channel, Guild, GuildSnapshot, InvalidationReason, Member, Message, MessageAck,
    MessageRemove, Presence, ReadyPayload, SessionPhase, TypingStart, User,
};

/// Every event published on the [`EventBus`](crate::bus::EventBus).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncEvent {
    /// Session phase transition.
    PhaseChanged { phase: SessionPhase },
    /// A reconnect attempt was scheduled after `delay_ms`.
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// Session ended in a way the caller must act on (typically forced logout).
    SessionInvalidated { reason: InvalidationReason },
    Ready(ReadyPayload),
    MessageCreated(Message),
    MessageUpdated(Message),
    MessageRemoved(MessageRemove),
    MessageAcked(MessageAck),
    ChannelCreated(Channel),
    ChannelRemoved(Channel),
    GuildCreated(GuildSnapshot),
    GuildUpdated(Guild),
    GuildRemoved(Guild),
    MemberCreated(Member),
    MemberRemoved(Member),
    PresenceUpdated(Presence),
    TypingStarted(TypingStart),
    UserUpdated(User),
}

/// Variant tag of [`SyncEvent`], used as the subscription key.
///
/// Matching is exact: a subscriber for one kind never sees another kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    PhaseChanged,
    Reconnecting,
    SessionInvalidated,
    Ready,
    MessageCreated,
    MessageUpdated,
    MessageRemoved,
    MessageAcked,
    ChannelCreated,
    ChannelRemoved,
    GuildCreated,
    GuildUpdated,
    GuildRemoved,
    MemberCreated,
    MemberRemoved,
    PresenceUpdated,
    TypingStarted,
    UserUpdated,
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::PhaseChanged { .. } => EventKind::PhaseChanged,
            Self::Reconnecting { .. } => EventKind::Reconnecting,
            Self::SessionInvalidated { .. } => EventKind::SessionInvalidated,
            Self::Ready(_) => EventKind::Ready,
            Self::MessageCreated(_) => EventKind::MessageCreated,
            Self::MessageUpdated(_) => EventKind::MessageUpdated,
            Self::MessageRemoved(_) => EventKind::MessageRemoved,
            Self::MessageAcked(_) => EventKind::MessageAcked,
            Self::ChannelCreated(_) => EventKind::ChannelCreated,
            Self::ChannelRemoved(_) => EventKind::ChannelRemoved,
            Self::GuildCreated(_) => EventKind::GuildCreated,
            Self::GuildUpdated(_) => EventKind::GuildUpdated,
            Self::GuildRemoved(_) => EventKind::GuildRemoved,
            Self::MemberCreated(_) => EventKind::MemberCreated,
            Self::MemberRemoved(_) => EventKind::MemberRemoved,
            Self::PresenceUpdated(_) => EventKind::PresenceUpdated,
            Self::TypingStarted(_) => EventKind::TypingStarted,
            Self::UserUpdated(_) => EventKind::UserUpdated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(
            SyncEvent::PhaseChanged {
                phase: SessionPhase::Connected
            }
            .kind(),
            EventKind::PhaseChanged
        );
        assert_eq!(
            SyncEvent::SessionInvalidated {
                reason: InvalidationReason::ReconnectionExhausted
            }
            .kind(),
            EventKind::SessionInvalidated
        );
    }
}
