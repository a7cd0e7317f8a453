//! Core of the realtime chat sync client.
//!
//! This crate defines the ordered id type, domain payloads, the event enum
//! and bus, the bounded per-channel message cache, the session lifecycle
//! state machine, and shared error/config types. It performs no I/O.

/// Publish/subscribe bus keyed by event kind.
pub mod bus;
/// Bounded, LRU-evicted per-channel message windows.
pub mod cache;
/// Environment-backed runtime configuration.
pub mod config;
/// Guild, channel and member metadata.
pub mod directory;
/// Stable error types and close-code classification.
pub mod error;
/// Event enum published on the bus.
pub mod event;
/// Time-ordered 64-bit identifiers.
pub mod id;
/// Reconnect backoff policy.
pub mod retry;
/// Realtime session lifecycle state machine.
pub mod state_machine;
/// Single-writer / many-reader store handles.
pub mod store;
/// Domain payload types.
pub mod types;

pub use bus::{
    BusError, EventBus, EventWaiter, Subscriber, SubscriberError, SubscriberFuture,
    SubscriptionGuard,
};
pub use cache::{MessageCache, MessageQuery};
pub use config::{ConfigError, SyncConfig};
pub use directory::GuildDirectory;
pub use error::{SyncError, SyncErrorCategory, classify_close_code};
pub use event::{EventKind, SyncEvent};
pub use id::{OrderedId, OrderedIdGenerator};
pub use retry::{BackoffPolicy, ReconnectDecision};
pub use state_machine::{SessionInput, SessionStateMachine, WakeAction};
pub use store::{StoreReader, StoreWriter, SyncStore};
pub use types::{
    Attachment, Channel, ChannelKind, Guild, GuildSnapshot, InvalidationReason, Member, Message,
    MessageAck, MessageRemove, Presence, PresenceStatus, ReadyPayload, SessionPhase, TypingStart,
    User,
};
