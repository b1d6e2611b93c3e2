use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{
    BROADCAST_ROOM, TOPIC_BROADCAST, TOPIC_DIRECT, TOPIC_USER_JOINED, TOPIC_USER_LEFT,
};

/// The fixed set of broker topics a chat session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// Room-wide chat
    Broadcast,
    /// One-to-one chat, filtered by recipient on the receiving side
    Direct,
    /// Join announcements
    Joined,
    /// Leave announcements
    Left,
}

impl Topic {
    pub const ALL: [Topic; 4] = [Topic::Broadcast, Topic::Direct, Topic::Joined, Topic::Left];

    pub fn wire_name(&self) -> &'static str {
        match self {
            Topic::Broadcast => TOPIC_BROADCAST,
            Topic::Direct => TOPIC_DIRECT,
            Topic::Joined => TOPIC_USER_JOINED,
            Topic::Left => TOPIC_USER_LEFT,
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.wire_name() == name)
    }

    /// Whether chat messages (text or file) travel on this topic.
    pub fn carries_chat(&self) -> bool {
        matches!(self, Topic::Broadcast | Topic::Direct)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Consumer-group state as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupState {
    Stable,
    PreparingRebalance,
    CompletingRebalance,
    Empty,
    Dead,
    Unknown(String),
}

impl GroupState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Stable" => Self::Stable,
            "PreparingRebalance" => Self::PreparingRebalance,
            "CompletingRebalance" | "AwaitingSync" => Self::CompletingRebalance,
            "Empty" => Self::Empty,
            "Dead" => Self::Dead,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// All members assigned and no rebalance pending.
    pub fn is_stable(&self) -> bool {
        matches!(self, Self::Stable)
    }
}

/// Best-effort mapping of active participants: display name to consumer
/// group id. Always rebuilt wholesale, never patched entry by entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PresenceDirectory {
    entries: HashMap<String, String>,
}

impl PresenceDirectory {
    /// A directory holding only the broadcast room.
    pub fn with_broadcast_room() -> Self {
        let mut dir = Self::default();
        dir.insert_broadcast_room();
        dir
    }

    pub fn insert(&mut self, display_name: impl Into<String>, group_id: impl Into<String>) {
        self.entries.insert(display_name.into(), group_id.into());
    }

    /// Adds the synthetic broadcast-room entry, replacing any broker-derived
    /// participant that happens to use the reserved name.
    pub fn insert_broadcast_room(&mut self) {
        self.entries
            .insert(BROADCAST_ROOM.to_string(), TOPIC_BROADCAST.to_string());
    }

    /// Drop every participant mapped to `group_id`. The broadcast room is
    /// never removed.
    pub fn remove_group(&mut self, group_id: &str) {
        self.entries
            .retain(|name, group| name == BROADCAST_ROOM || group != group_id);
    }

    pub fn get(&self, display_name: &str) -> Option<&str> {
        self.entries.get(display_name).map(String::as_str)
    }

    pub fn contains(&self, display_name: &str) -> bool {
        self.entries.contains_key(display_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Participant names sorted, without the broadcast room.
    pub fn participants(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .entries
            .keys()
            .map(String::as_str)
            .filter(|name| *name != BROADCAST_ROOM)
            .collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_wire_names_roundtrip() {
        for topic in Topic::ALL {
            assert_eq!(Topic::from_wire(topic.wire_name()), Some(topic));
        }
        assert_eq!(Topic::from_wire("active-users"), None);
    }

    #[test]
    fn test_group_state_parse() {
        assert!(GroupState::parse("Stable").is_stable());
        assert_eq!(
            GroupState::parse("PreparingRebalance"),
            GroupState::PreparingRebalance
        );
        assert_eq!(
            GroupState::parse("Whatever"),
            GroupState::Unknown("Whatever".into())
        );
        assert!(!GroupState::parse("Empty").is_stable());
    }

    #[test]
    fn test_broadcast_room_overrides_collision() {
        let mut dir = PresenceDirectory::default();
        dir.insert(BROADCAST_ROOM, "chat-user-global-abc123");
        dir.insert_broadcast_room();
        assert_eq!(dir.get(BROADCAST_ROOM), Some(TOPIC_BROADCAST));
        assert!(dir.participants().is_empty());
    }

    #[test]
    fn test_remove_group_keeps_others() {
        let mut dir = PresenceDirectory::with_broadcast_room();
        dir.insert("alice", "chat-user-alice-a1");
        dir.insert("bob", "chat-user-bob-b2");
        dir.remove_group("chat-user-alice-a1");
        dir.remove_group(TOPIC_BROADCAST);
        assert_eq!(dir.participants(), vec!["bob"]);
        assert!(dir.contains(BROADCAST_ROOM));
    }
}
