//! Per-channel bounded message windows with cursor queries.
//!
//! Windows are keyed by [`OrderedId`] and always iterate in ascending order,
//! so `before`/`after`/`around` are range searches over the stored ids rather
//! than arithmetic on the cursor. Ids inserted at uneven strides or in reverse
//! order need no special handling.
//!
//! Nothing here returns an error: unknown channels and missing cursors degrade
//! to empty or partial results.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    ops::Bound,
};

use tracing::{debug, trace};

use crate::{id::OrderedId, types::Message};

pub const DEFAULT_CHANNEL_LIMIT: usize = 5;
pub const DEFAULT_WINDOW_CAPACITY: usize = 500;

/// Cursor selecting which slice of a window a query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageQuery {
    /// Newest messages.
    #[default]
    Latest,
    /// Newest messages with an id strictly below the cursor.
    Before(OrderedId),
    /// Oldest messages with an id strictly above the cursor.
    After(OrderedId),
    /// About half below the cursor, the rest at or above it.
    Around(OrderedId),
}

impl MessageQuery {
    /// Build a query from optional cursors. The first present cursor wins,
    /// checked in `before`, `after`, `around` order.
    pub fn from_cursors(
        before: Option<OrderedId>,
        after: Option<OrderedId>,
        around: Option<OrderedId>,
    ) -> Self {
        match (before, after, around) {
            (Some(cursor), _, _) => Self::Before(cursor),
            (None, Some(cursor), _) => Self::After(cursor),
            (None, None, Some(cursor)) => Self::Around(cursor),
            (None, None, None) => Self::Latest,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ChannelWindow {
    messages: BTreeMap<OrderedId, Message>,
    /// Local echoes awaiting a server id, in send order.
    pending: Vec<Message>,
}

impl ChannelWindow {
    fn insert(&mut self, message: Message, capacity: usize) {
        if let Some(nonce) = message.nonce.as_deref() {
            self.pending
                .retain(|pending| pending.nonce.as_deref() != Some(nonce));
        }
        self.messages.insert(message.id, message);
        self.trim_to(capacity);
    }

    fn trim_to(&mut self, capacity: usize) {
        while self.messages.len() > capacity {
            self.messages.pop_first();
        }
    }

    fn select(&self, query: MessageQuery, limit: usize) -> Vec<Message> {
        if limit == 0 {
            return Vec::new();
        }

        match query {
            MessageQuery::Latest => newest(self.messages.values(), limit),
            MessageQuery::Before(cursor) => {
                newest(self.messages.range(..cursor).map(|(_, m)| m), limit)
            }
            MessageQuery::After(cursor) => self
                .messages
                .range((Bound::Excluded(cursor), Bound::Unbounded))
                .take(limit)
                .map(|(_, message)| message.clone())
                .collect(),
            MessageQuery::Around(cursor) => {
                let below = limit / 2;
                let mut selected = newest(self.messages.range(..cursor).map(|(_, m)| m), below);
                selected.extend(
                    self.messages
                        .range(cursor..)
                        .take(limit - below)
                        .map(|(_, message)| message.clone()),
                );
                selected
            }
        }
    }
}

/// Last `limit` items of an ascending iterator, still ascending.
fn newest<'a>(
    messages: impl DoubleEndedIterator<Item = &'a Message>,
    limit: usize,
) -> Vec<Message> {
    let mut selected: Vec<Message> = messages.rev().take(limit).cloned().collect();
    selected.reverse();
    selected
}

/// Bounded per-channel message store.
///
/// At most `channel_limit` channels hold a window; registering one more evicts
/// the least recently registered channel together with its whole window.
#[derive(Debug, Clone)]
pub struct MessageCache {
    windows: HashMap<OrderedId, ChannelWindow>,
    /// Registered channels, least recently touched first.
    recency: VecDeque<OrderedId>,
    channel_limit: usize,
    window_capacity: usize,
}

impl MessageCache {
    /// Create a cache (`channel_limit >= 1`, `window_capacity >= 1`).
    pub fn new(channel_limit: usize, window_capacity: usize) -> Self {
        Self {
            windows: HashMap::new(),
            recency: VecDeque::new(),
            channel_limit: channel_limit.max(1),
            window_capacity: window_capacity.max(1),
        }
    }

    pub fn channel_limit(&self) -> usize {
        self.channel_limit
    }

    pub fn window_capacity(&self) -> usize {
        self.window_capacity
    }

    /// Create an empty window if absent and mark the channel most recently used.
    ///
    /// Returns the channels evicted to stay within the limit.
    pub fn register_channel(&mut self, channel_id: OrderedId) -> Vec<OrderedId> {
        if self.windows.contains_key(&channel_id) {
            self.recency.retain(|id| *id != channel_id);
        } else {
            self.windows.insert(channel_id, ChannelWindow::default());
        }
        self.recency.push_back(channel_id);

        let mut evicted = Vec::new();
        while self.recency.len() > self.channel_limit {
            let Some(oldest) = self.recency.pop_front() else {
                break;
            };
            self.windows.remove(&oldest);
            debug!(channel_id = %oldest, "evicted channel window");
            evicted.push(oldest);
        }
        evicted
    }

    /// Drop a channel's window entirely. No-op when not registered.
    pub fn unregister_channel(&mut self, channel_id: OrderedId) -> bool {
        self.recency.retain(|id| *id != channel_id);
        self.windows.remove(&channel_id).is_some()
    }

    pub fn is_registered(&self, channel_id: OrderedId) -> bool {
        self.windows.contains_key(&channel_id)
    }

    pub fn channel_count(&self) -> usize {
        self.windows.len()
    }

    /// Registered channels, least recently touched first.
    pub fn registered_channels(&self) -> Vec<OrderedId> {
        self.recency.iter().copied().collect()
    }

    /// Insert one message into its channel's window.
    ///
    /// Messages for unregistered channels are discarded: the cache never grows
    /// for channels nobody opened. A pending message (placeholder id) is kept
    /// aside until a confirmed message with the same nonce replaces it; pending
    /// messages without a nonce cannot be reconciled and are discarded.
    ///
    /// Returns whether the message was stored.
    pub fn add_message(&mut self, message: Message) -> bool {
        let capacity = self.window_capacity;
        let Some(window) = self.windows.get_mut(&message.channel_id) else {
            trace!(
                channel_id = %message.channel_id,
                "discarding message for unregistered channel"
            );
            return false;
        };

        if message.is_pending() {
            let Some(nonce) = message.nonce.as_deref() else {
                debug!(
                    channel_id = %message.channel_id,
                    "discarding pending message without nonce"
                );
                return false;
            };
            window
                .pending
                .retain(|pending| pending.nonce.as_deref() != Some(nonce));
            window.pending.push(message);
            return true;
        }

        window.insert(message, capacity);
        true
    }

    /// Bulk insert into one channel. Order of the batch does not matter.
    ///
    /// Duplicate ids are last-write-wins, within the batch and against stored
    /// entries. Messages addressed to another channel are skipped. Returns the
    /// number of messages stored.
    pub fn add_messages(&mut self, channel_id: OrderedId, batch: Vec<Message>) -> usize {
        if !self.windows.contains_key(&channel_id) {
            trace!(%channel_id, size = batch.len(), "discarding batch for unregistered channel");
            return 0;
        }

        let mut stored = 0;
        for message in batch {
            if message.channel_id != channel_id {
                debug!(
                    %channel_id,
                    message_channel_id = %message.channel_id,
                    "skipping batch message addressed to another channel"
                );
                continue;
            }
            if self.add_message(message) {
                stored += 1;
            }
        }
        stored
    }

    /// Up to `limit` confirmed messages, ascending by id.
    pub fn get_messages(
        &self,
        channel_id: OrderedId,
        query: MessageQuery,
        limit: usize,
    ) -> Vec<Message> {
        self.windows
            .get(&channel_id)
            .map(|window| window.select(query, limit))
            .unwrap_or_default()
    }

    /// Local echoes awaiting confirmation, in send order.
    pub fn pending_messages(&self, channel_id: OrderedId) -> Vec<Message> {
        self.windows
            .get(&channel_id)
            .map(|window| window.pending.clone())
            .unwrap_or_default()
    }

    pub fn get_message(&self, channel_id: OrderedId, message_id: OrderedId) -> Option<Message> {
        self.windows
            .get(&channel_id)?
            .messages
            .get(&message_id)
            .cloned()
    }

    /// Replace the stored message with the same id. The id (and so the
    /// position) never changes. Returns whether an entry was replaced.
    pub fn update_message(&mut self, message: Message) -> bool {
        let Some(slot) = self
            .windows
            .get_mut(&message.channel_id)
            .and_then(|window| window.messages.get_mut(&message.id))
        else {
            return false;
        };
        *slot = message;
        true
    }

    /// Remove one message. Returns whether it was present.
    pub fn drop_message(&mut self, channel_id: OrderedId, message_id: OrderedId) -> bool {
        self.windows
            .get_mut(&channel_id)
            .and_then(|window| window.messages.remove(&message_id))
            .is_some()
    }

    /// Discard a local echo, e.g. after the send failed.
    pub fn drop_pending(&mut self, channel_id: OrderedId, nonce: &str) -> bool {
        let Some(window) = self.windows.get_mut(&channel_id) else {
            return false;
        };
        let before = window.pending.len();
        window
            .pending
            .retain(|pending| pending.nonce.as_deref() != Some(nonce));
        window.pending.len() != before
    }

    /// Clamp a requested page size against the window capacity (`1..=capacity`).
    pub fn bounded_limit(&self, requested: usize) -> usize {
        requested.max(1).min(self.window_capacity)
    }
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_LIMIT, DEFAULT_WINDOW_CAPACITY)
    }
}
