//! Storage collaborator: statuses, groups and the chat log.
//!
//! Dispatchers address statuses by a local numeric id handed out on insert;
//! the wire UUID only matters for recognising a copy we already hold.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use murmur_core::crypto::{GroupKey, GroupKeyring};
use murmur_core::{ChatMessage, Group, GroupId, PushStatus, StatusId, UserId};

/// Local id of a stored status.
pub type LocalId = u64;

/// A status together with what this device knows about it.
#[derive(Debug, Clone)]
pub struct StatusRecord {
    pub local_id: LocalId,
    pub status: PushStatus,
    /// Copies received so far. Zero for statuses authored here.
    pub duplicate: u32,
    /// Contact that handed us the first copy.
    pub received_from: Option<UserId>,
    /// Where the attachment lives on this device.
    pub attachment: Option<PathBuf>,
    /// Contacts this status was already pushed to.
    pub sent_to: HashSet<UserId>,
}

impl StatusRecord {
    /// Whether this status may ever be offered to `contact`.
    pub fn eligible_for(&self, contact: &UserId, now_ms: u64) -> bool {
        self.status.author != *contact
            && self.received_from.as_ref() != Some(contact)
            && !self.sent_to.contains(contact)
            && !self.status.is_expired(now_ms)
            && !self.status.hops_exhausted()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// First copy; the status got a fresh local id.
    Inserted(LocalId),
    /// Already known; counters were merged into the existing record.
    Merged(LocalId),
}

impl InsertOutcome {
    pub fn local_id(&self) -> LocalId {
        match self {
            InsertOutcome::Inserted(id) | InsertOutcome::Merged(id) => *id,
        }
    }
}

/// What the dispatchers need from storage.
///
/// Implementations serialise writes; reads may run concurrently.
pub trait StatusStore: Send + Sync {
    /// Ids of statuses in one of `groups`, never sent to `contact`, not
    /// authored or forwarded by it, not expired and with hops to spare.
    fn query_candidates(
        &self,
        groups: &BTreeSet<GroupId>,
        contact: &UserId,
        now_ms: u64,
    ) -> Vec<LocalId>;

    fn get(&self, id: LocalId) -> Option<StatusRecord>;

    fn find(&self, status: &StatusId) -> Option<LocalId>;

    /// Insert a status, or merge it into the copy already stored.
    fn insert(
        &self,
        status: PushStatus,
        received_from: Option<UserId>,
        attachment: Option<PathBuf>,
    ) -> InsertOutcome;

    /// Replace the status body of an existing record.
    fn update(&self, id: LocalId, status: PushStatus) -> bool;

    fn delete(&self, id: LocalId) -> Option<StatusRecord>;

    /// Remember that `id` reached `contact`.
    fn mark_sent(&self, id: LocalId, contact: &UserId);

    fn group(&self, id: &GroupId) -> Option<Group>;
}

/// In-memory store.
#[derive(Clone, Default)]
pub struct MemoryStatusStore {
    records: Arc<DashMap<LocalId, StatusRecord>>,
    by_uuid: Arc<DashMap<StatusId, LocalId>>,
    groups: Arc<DashMap<GroupId, Group>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&self, group: Group) {
        self.groups.insert(group.id, group);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl StatusStore for MemoryStatusStore {
    fn query_candidates(
        &self,
        groups: &BTreeSet<GroupId>,
        contact: &UserId,
        now_ms: u64,
    ) -> Vec<LocalId> {
        let mut ids: Vec<LocalId> = self
            .records
            .iter()
            .filter(|r| groups.contains(&r.status.group) && r.eligible_for(contact, now_ms))
            .map(|r| *r.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    fn get(&self, id: LocalId) -> Option<StatusRecord> {
        self.records.get(&id).map(|r| r.clone())
    }

    fn find(&self, status: &StatusId) -> Option<LocalId> {
        self.by_uuid.get(status).map(|id| *id)
    }

    fn insert(
        &self,
        status: PushStatus,
        received_from: Option<UserId>,
        attachment: Option<PathBuf>,
    ) -> InsertOutcome {
        match self.by_uuid.entry(status.id) {
            Entry::Occupied(existing) => {
                let id = *existing.get();
                if let Some(mut record) = self.records.get_mut(&id) {
                    record.duplicate = record.duplicate.saturating_add(1);
                    record.status.like = record.status.like.max(status.like);
                    record.status.replication =
                        record.status.replication.max(status.replication);
                    if record.attachment.is_none() {
                        record.attachment = attachment;
                    }
                }
                InsertOutcome::Merged(id)
            }
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                slot.insert(id);
                self.records.insert(
                    id,
                    StatusRecord {
                        local_id: id,
                        duplicate: u32::from(received_from.is_some()),
                        status,
                        received_from,
                        attachment,
                        sent_to: HashSet::new(),
                    },
                );
                InsertOutcome::Inserted(id)
            }
        }
    }

    fn update(&self, id: LocalId, status: PushStatus) -> bool {
        match self.records.get_mut(&id) {
            Some(mut record) if record.status.id == status.id => {
                record.status = status;
                true
            }
            _ => false,
        }
    }

    fn delete(&self, id: LocalId) -> Option<StatusRecord> {
        let (_, record) = self.records.remove(&id)?;
        self.by_uuid.remove(&record.status.id);
        Some(record)
    }

    fn mark_sent(&self, id: LocalId, contact: &UserId) {
        if let Some(mut record) = self.records.get_mut(&id) {
            record.sent_to.insert(*contact);
        }
    }

    fn group(&self, id: &GroupId) -> Option<Group> {
        self.groups.get(id).map(|g| g.clone())
    }
}

impl GroupKeyring for MemoryStatusStore {
    fn group_key(&self, group: &GroupId) -> Option<GroupKey> {
        self.groups.get(group).and_then(|g| g.key.clone())
    }
}

// ── Chat log ──────────────────────────────────────────────────────────────────

/// Chats per contact, oldest first.
///
/// The same message can arrive over more than one channel; it is kept once.
#[derive(Clone, Default)]
pub struct ChatLog {
    messages: Arc<DashMap<UserId, Vec<ChatMessage>>>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `message` from `contact`. Returns false for a repeat.
    pub fn add(&self, contact: UserId, message: ChatMessage) -> bool {
        let mut thread = self.messages.entry(contact).or_default();
        if thread.iter().any(|m| m.id == message.id) {
            return false;
        }
        let at = thread.partition_point(|m| m.created_at <= message.created_at);
        thread.insert(at, message);
        true
    }

    pub fn get(&self, contact: &UserId) -> Vec<ChatMessage> {
        self.messages
            .get(contact)
            .map(|thread| thread.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, contact: &UserId) -> usize {
        self.messages.get(contact).map(|thread| thread.len()).unwrap_or(0)
    }
}
