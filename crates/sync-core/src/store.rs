//! Shared ownership of the message cache and the guild directory.
//!
//! [`SyncStore::new`] hands out exactly one [`StoreWriter`] (not `Clone`),
//! which is moved into the connection supervisor, and a cloneable
//! [`StoreReader`] for UI consumers. Both wrap the same `RwLock`s.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{
    cache::{MessageCache, MessageQuery},
    directory::GuildDirectory,
    id::OrderedId,
    types::{Channel, Guild, Member, Message, User},
};

#[derive(Debug, Default)]
struct StoreState {
    messages: RwLock<MessageCache>,
    directory: RwLock<GuildDirectory>,
}

pub struct SyncStore;

impl SyncStore {
    pub fn new(channel_limit: usize, window_capacity: usize) -> (StoreWriter, StoreReader) {
        let state = Arc::new(StoreState {
            messages: RwLock::new(MessageCache::new(channel_limit, window_capacity)),
            directory: RwLock::new(GuildDirectory::default()),
        });
        (
            StoreWriter {
                state: Arc::clone(&state),
            },
            StoreReader { state },
        )
    }
}

/// The only write path into the store.
#[derive(Debug)]
pub struct StoreWriter {
    state: Arc<StoreState>,
}

impl StoreWriter {
    pub fn reader(&self) -> StoreReader {
        StoreReader {
            state: Arc::clone(&self.state),
        }
    }

    /// Run `f` with exclusive access to the message cache.
    pub fn with_messages<R>(&self, f: impl FnOnce(&mut MessageCache) -> R) -> R {
        f(&mut write(&self.state.messages))
    }

    /// Run `f` with exclusive access to the guild directory.
    pub fn with_directory<R>(&self, f: impl FnOnce(&mut GuildDirectory) -> R) -> R {
        f(&mut write(&self.state.directory))
    }

    pub fn register_channel(&self, channel_id: OrderedId) -> Vec<OrderedId> {
        self.with_messages(|cache| cache.register_channel(channel_id))
    }

    pub fn add_message(&self, message: Message) -> bool {
        self.with_messages(|cache| cache.add_message(message))
    }

    pub fn add_messages(&self, channel_id: OrderedId, batch: Vec<Message>) -> usize {
        self.with_messages(|cache| cache.add_messages(channel_id, batch))
    }

    pub fn update_message(&self, message: Message) -> bool {
        self.with_messages(|cache| cache.update_message(message))
    }

    pub fn drop_message(&self, channel_id: OrderedId, message_id: OrderedId) -> bool {
        self.with_messages(|cache| cache.drop_message(channel_id, message_id))
    }

    pub fn drop_pending(&self, channel_id: OrderedId, nonce: &str) -> bool {
        self.with_messages(|cache| cache.drop_pending(channel_id, nonce))
    }

    /// Remove a guild and the message windows of its channels.
    pub fn remove_guild(&self, guild_id: OrderedId) -> Vec<OrderedId> {
        let channels = self.with_directory(|directory| directory.remove_guild(guild_id));
        self.with_messages(|cache| {
            for channel_id in &channels {
                cache.unregister_channel(*channel_id);
            }
        });
        channels
    }

    /// Remove a channel from the directory and drop its message window.
    pub fn remove_channel(&self, channel: &Channel) -> bool {
        let removed = self.with_directory(|directory| directory.remove_channel(channel));
        self.with_messages(|cache| cache.unregister_channel(channel.id));
        removed
    }

    /// Forget everything, e.g. on logout.
    pub fn clear(&self) {
        self.with_messages(|cache| {
            *cache = MessageCache::new(cache.channel_limit(), cache.window_capacity());
        });
        self.with_directory(|directory| *directory = GuildDirectory::default());
    }
}

/// Read-only view shared with any number of consumers.
#[derive(Debug, Clone)]
pub struct StoreReader {
    state: Arc<StoreState>,
}

impl StoreReader {
    pub fn get_messages(
        &self,
        channel_id: OrderedId,
        query: MessageQuery,
        limit: usize,
    ) -> Vec<Message> {
        read(&self.state.messages).get_messages(channel_id, query, limit)
    }

    pub fn get_message(&self, channel_id: OrderedId, message_id: OrderedId) -> Option<Message> {
        read(&self.state.messages).get_message(channel_id, message_id)
    }

    pub fn pending_messages(&self, channel_id: OrderedId) -> Vec<Message> {
        read(&self.state.messages).pending_messages(channel_id)
    }

    pub fn is_registered(&self, channel_id: OrderedId) -> bool {
        read(&self.state.messages).is_registered(channel_id)
    }

    pub fn registered_channels(&self) -> Vec<OrderedId> {
        read(&self.state.messages).registered_channels()
    }

    pub fn current_user(&self) -> Option<User> {
        read(&self.state.directory).current_user().cloned()
    }

    pub fn guilds(&self) -> Vec<Guild> {
        read(&self.state.directory).guilds()
    }

    pub fn channels(&self, guild_id: OrderedId) -> Vec<Channel> {
        read(&self.state.directory).channels(guild_id)
    }

    pub fn channel(&self, channel_id: OrderedId) -> Option<Channel> {
        read(&self.state.directory).channel(channel_id)
    }

    pub fn member(&self, guild_id: OrderedId, user_id: OrderedId) -> Option<Member> {
        read(&self.state.directory).member(guild_id, user_id)
    }
}

// Every mutation is a single call on a plain data structure, so a panic while
// holding the lock cannot leave a half-applied write behind.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
