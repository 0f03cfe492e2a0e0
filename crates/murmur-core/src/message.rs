//! Message model exchanged between devices.
//!
//! These are the in-memory objects the block readers produce and the block
//! writers consume. Local-only bookkeeping (storage keys, duplicate counters,
//! where an attachment landed on disk) lives with the storage collaborator,
//! not here.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::crypto::GroupKey;
use crate::ids::{ChatId, GroupId, StatusId, UserId};

/// Highest interest level a contact can attach to a hashtag.
pub const MAX_INTEREST: u8 = 5;

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A social-style post pushed to every member of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushStatus {
    pub id: StatusId,
    pub group: GroupId,
    /// Device that handed us this copy.
    pub sender: UserId,
    pub author: UserId,
    pub author_name: String,
    pub post: String,
    /// Name of the attached file, if any.
    pub filename: Option<String>,
    /// Creation time, milliseconds since the UNIX epoch.
    pub created_at: u64,
    /// Time to live in seconds. `<= 0` never expires.
    pub ttl: i64,
    pub hop_count: u16,
    /// Maximum number of hops. 0 means unlimited.
    pub hop_limit: u16,
    pub replication: u32,
    pub like: u32,
}

impl PushStatus {
    /// A new status authored locally.
    pub fn new(group: GroupId, author: UserId, author_name: &str, post: &str) -> Self {
        Self {
            id: StatusId::random(),
            group,
            sender: author,
            author,
            author_name: author_name.to_string(),
            post: post.to_string(),
            filename: None,
            created_at: now_millis(),
            ttl: 0,
            hop_count: 0,
            hop_limit: 0,
            replication: 0,
            like: 0,
        }
    }

    pub fn has_attachment(&self) -> bool {
        self.filename.is_some()
    }

    /// Hashtags mentioned in the post, lowercased and without the `#`.
    pub fn hashtags(&self) -> BTreeSet<String> {
        extract_hashtags(&self.post)
    }

    /// True once `ttl` seconds have elapsed since creation.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        if self.ttl <= 0 {
            return false;
        }
        let elapsed_ms = now_ms.saturating_sub(self.created_at);
        elapsed_ms >= (self.ttl as u64).saturating_mul(1000)
    }

    /// True when the status already travelled its maximum number of hops.
    pub fn hops_exhausted(&self) -> bool {
        self.hop_limit > 0 && self.hop_count >= self.hop_limit
    }
}

/// Extract `#tag` tokens from free text. A tag is a run of alphanumerics or `_`.
pub fn extract_hashtags(text: &str) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();
    let mut chars = text.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '#' {
            continue;
        }
        let mut tag = String::new();
        while let Some(&(_, next)) = chars.peek() {
            if next.is_alphanumeric() || next == '_' {
                tag.extend(next.to_lowercase());
                chars.next();
            } else {
                break;
            }
        }
        if !tag.is_empty() {
            tags.insert(tag);
        }
    }
    tags
}

/// A direct chat message between two devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: ChatId,
    pub author: UserId,
    pub author_name: String,
    pub text: String,
    pub created_at: u64,
}

impl ChatMessage {
    pub fn new(author: UserId, author_name: &str, text: &str) -> Self {
        Self {
            id: ChatId::random(),
            author,
            author_name: author_name.to_string(),
            text: text.to_string(),
            created_at: now_millis(),
        }
    }
}

/// Profile a device advertises about its user: who they are, which groups
/// they joined and how much they care about each hashtag.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Contact {
    pub uid: UserId,
    pub name: String,
    pub groups: BTreeSet<GroupId>,
    /// Hashtag (lowercased, no `#`) to interest level in `0..=MAX_INTEREST`.
    pub interests: BTreeMap<String, u8>,
}

impl Contact {
    pub fn new(uid: UserId, name: &str) -> Self {
        Self {
            uid,
            name: name.to_string(),
            groups: BTreeSet::new(),
            interests: BTreeMap::new(),
        }
    }

    pub fn join(mut self, group: GroupId) -> Self {
        self.groups.insert(group);
        self
    }

    pub fn interested_in(mut self, tag: &str, level: u8) -> Self {
        self.interests.insert(normalize_tag(tag), level.min(MAX_INTEREST));
        self
    }
}

/// Interest key for `tag`: no leading `#`, lowercased.
pub fn normalize_tag(tag: &str) -> String {
    tag.trim_start_matches('#').to_lowercase()
}

/// A group as the sending device knows it. Private groups carry their key.
#[derive(Debug, Clone)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub key: Option<GroupKey>,
}

impl Group {
    pub fn public(id: GroupId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            key: None,
        }
    }

    pub fn private(id: GroupId, name: &str, key: GroupKey) -> Self {
        Self {
            id,
            name: name.to_string(),
            key: Some(key),
        }
    }

    pub fn is_private(&self) -> bool {
        self.key.is_some()
    }
}
