use std::collections::{BTreeMap, HashMap};

use crate::{
    id::OrderedId,
    types::{Channel, Guild, GuildSnapshot, Member, User},
};

#[derive(Debug, Clone)]
struct GuildEntry {
    guild: Guild,
    channels: BTreeMap<OrderedId, Channel>,
    members: HashMap<OrderedId, Member>,
}

/// Guild, channel and member metadata of the current session.
#[derive(Debug, Clone, Default)]
pub struct GuildDirectory {
    current_user: Option<User>,
    guilds: BTreeMap<OrderedId, GuildEntry>,
    direct_channels: BTreeMap<OrderedId, Channel>,
}

impl GuildDirectory {
    /// Replace everything with a ready snapshot.
    pub fn load_ready(&mut self, user: User, guilds: Vec<GuildSnapshot>) {
        self.current_user = Some(user);
        self.guilds.clear();
        self.direct_channels.clear();
        for snapshot in guilds {
            self.upsert_snapshot(snapshot);
        }
    }

    pub fn current_user(&self) -> Option<&User> {
        self.current_user.as_ref()
    }

    pub fn set_current_user(&mut self, user: User) {
        if self
            .current_user
            .as_ref()
            .is_some_and(|current| current.id == user.id)
        {
            self.current_user = Some(user);
        }
    }

    pub fn upsert_snapshot(&mut self, snapshot: GuildSnapshot) {
        let GuildSnapshot {
            guild,
            channels,
            members,
        } = snapshot;
        let entry = GuildEntry {
            channels: channels
                .into_iter()
                .map(|channel| (channel.id, channel))
                .collect(),
            members: members
                .into_iter()
                .map(|member| (member.user.id, member))
                .collect(),
            guild,
        };
        self.guilds.insert(entry.guild.id, entry);
    }

    /// Replace guild metadata, keeping channels and members.
    pub fn update_guild(&mut self, guild: Guild) -> bool {
        let Some(entry) = self.guilds.get_mut(&guild.id) else {
            return false;
        };
        entry.guild = guild;
        true
    }

    /// Remove a guild. Returns the ids of the channels that went with it.
    pub fn remove_guild(&mut self, guild_id: OrderedId) -> Vec<OrderedId> {
        self.guilds
            .remove(&guild_id)
            .map(|entry| entry.channels.into_keys().collect())
            .unwrap_or_default()
    }

    pub fn upsert_channel(&mut self, channel: Channel) -> bool {
        match channel.guild_id {
            Some(guild_id) => {
                let Some(entry) = self.guilds.get_mut(&guild_id) else {
                    return false;
                };
                entry.channels.insert(channel.id, channel);
            }
            None => {
                self.direct_channels.insert(channel.id, channel);
            }
        }
        true
    }

    pub fn remove_channel(&mut self, channel: &Channel) -> bool {
        match channel.guild_id {
            Some(guild_id) => self
                .guilds
                .get_mut(&guild_id)
                .and_then(|entry| entry.channels.remove(&channel.id))
                .is_some(),
            None => self.direct_channels.remove(&channel.id).is_some(),
        }
    }

    pub fn upsert_member(&mut self, member: Member) -> bool {
        let Some(entry) = self.guilds.get_mut(&member.guild_id) else {
            return false;
        };
        entry.members.insert(member.user.id, member);
        true
    }

    pub fn remove_member(&mut self, guild_id: OrderedId, user_id: OrderedId) -> bool {
        self.guilds
            .get_mut(&guild_id)
            .and_then(|entry| entry.members.remove(&user_id))
            .is_some()
    }

    /// Guilds ordered by id.
    pub fn guilds(&self) -> Vec<Guild> {
        self.guilds.values().map(|entry| entry.guild.clone()).collect()
    }

    pub fn guild(&self, guild_id: OrderedId) -> Option<Guild> {
        self.guilds.get(&guild_id).map(|entry| entry.guild.clone())
    }

    /// Channels of a guild ordered by position, then id.
    pub fn channels(&self, guild_id: OrderedId) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self
            .guilds
            .get(&guild_id)
            .map(|entry| entry.channels.values().cloned().collect())
            .unwrap_or_default();
        channels.sort_by_key(|channel| (channel.position, channel.id));
        channels
    }

    pub fn direct_channels(&self) -> Vec<Channel> {
        self.direct_channels.values().cloned().collect()
    }

    pub fn channel(&self, channel_id: OrderedId) -> Option<Channel> {
        self.direct_channels.get(&channel_id).cloned().or_else(|| {
            self.guilds
                .values()
                .find_map(|entry| entry.channels.get(&channel_id).cloned())
        })
    }

    pub fn member(&self, guild_id: OrderedId, user_id: OrderedId) -> Option<Member> {
        self.guilds.get(&guild_id)?.members.get(&user_id).cloned()
    }

    pub fn member_count(&self, guild_id: OrderedId) -> usize {
        self.guilds
            .get(&guild_id)
            .map_or(0, |entry| entry.members.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelKind;

    fn user(id: u64, name: &str) -> User {
        User {
            id: OrderedId::new(id),
            username: name.into(),
            avatar: None,
            bot: false,
        }
    }

    fn guild(id: u64, name: &str) -> Guild {
        Guild {
            id: OrderedId::new(id),
            name: name.into(),
            icon: None,
            owner_id: OrderedId::new(1),
        }
    }

    fn channel(id: u64, guild_id: Option<u64>, position: i32) -> Channel {
        Channel {
            id: OrderedId::new(id),
            guild_id: guild_id.map(OrderedId::new),
            name: format!("c{id}"),
            kind: ChannelKind::Text,
            position,
        }
    }

    fn snapshot() -> GuildSnapshot {
        GuildSnapshot {
            guild: guild(100, "rustaceans"),
            channels: vec![channel(11, Some(100), 2), channel(10, Some(100), 1)],
            members: vec![Member {
                guild_id: OrderedId::new(100),
                user: user(1, "alice"),
                nickname: None,
                roles: Vec::new(),
            }],
        }
    }

    #[test]
    fn loads_ready_snapshot() {
        let mut directory = GuildDirectory::default();
        directory.load_ready(user(1, "alice"), vec![snapshot()]);

        assert_eq!(directory.current_user().map(|u| u.id), Some(OrderedId::new(1)));
        assert_eq!(directory.guilds().len(), 1);
        let channels: Vec<u64> = directory
            .channels(OrderedId::new(100))
            .iter()
            .map(|c| c.id.get())
            .collect();
        assert_eq!(channels, vec![10, 11]);
        assert_eq!(directory.member_count(OrderedId::new(100)), 1);
    }

    #[test]
    fn guild_update_keeps_channels_and_remove_reports_them() {
        let mut directory = GuildDirectory::default();
        directory.upsert_snapshot(snapshot());

        assert!(directory.update_guild(guild(100, "renamed")));
        assert!(!directory.update_guild(guild(999, "unknown")));
        assert_eq!(
            directory.guild(OrderedId::new(100)).map(|g| g.name),
            Some("renamed".to_owned())
        );
        assert_eq!(directory.channels(OrderedId::new(100)).len(), 2);

        let mut removed = directory.remove_guild(OrderedId::new(100));
        removed.sort();
        assert_eq!(removed, vec![OrderedId::new(10), OrderedId::new(11)]);
        assert!(directory.guilds().is_empty());
    }

    #[test]
    fn channels_and_members_follow_create_and_remove() {
        let mut directory = GuildDirectory::default();
        directory.upsert_snapshot(snapshot());

        assert!(directory.upsert_channel(channel(12, Some(100), 0)));
        assert!(!directory.upsert_channel(channel(13, Some(404), 0)));
        assert!(directory.upsert_channel(channel(50, None, 0)));
        assert_eq!(directory.direct_channels().len(), 1);
        assert!(directory.channel(OrderedId::new(12)).is_some());

        assert!(directory.remove_channel(&channel(12, Some(100), 0)));
        assert!(directory.channel(OrderedId::new(12)).is_none());

        assert!(directory.upsert_member(Member {
            guild_id: OrderedId::new(100),
            user: user(2, "bob"),
            nickname: Some("bobby".into()),
            roles: Vec::new(),
        }));
        assert_eq!(directory.member_count(OrderedId::new(100)), 2);
        assert!(directory.remove_member(OrderedId::new(100), OrderedId::new(2)));
        assert!(directory.member(OrderedId::new(100), OrderedId::new(2)).is_none());
    }

    #[test]
    fn user_update_only_touches_current_user() {
        let mut directory = GuildDirectory::default();
        directory.load_ready(user(1, "alice"), Vec::new());

        directory.set_current_user(user(2, "mallory"));
        assert_eq!(directory.current_user().map(|u| u.username.as_str()), Some("alice"));

        directory.set_current_user(user(1, "alice2"));
        assert_eq!(directory.current_user().map(|u| u.username.as_str()), Some("alice2"));
    }
}
