//! Ordered, de-duplicated log of the messages rendered in the open thread.
//!
//! ```text
//!  push ──┐
//!  poll ──┼──► append(id) ──► has(id)? ──yes──► Duplicate (no-op)
//!  send ──┘                      │
//!                                no
//!                                ▼
//!                   entries.push(entry), index[id] = slot
//! ```
//!
//! Rendering order is insertion order, never numeric id order: a poll
//! racing the push channel can deliver id 12 before id 11, and the
//! timeline must show them the way they were first observed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::protocol::MessageId;
use crate::thread::ThreadKey;

/// Who authored a message, relative to the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn from_incoming(incoming: bool) -> Self {
        if incoming {
            Self::Incoming
        } else {
            Self::Outgoing
        }
    }
}

/// One rendered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEntry {
    pub id: MessageId,
    pub thread: ThreadKey,
    pub direction: Direction,
    /// Opaque render blob (server-produced HTML fragment)
    pub content: String,
    /// Insertion sequence, assigned by the store
    pub created_order: u64,
    /// Read by the other side (only meaningful for outgoing entries)
    pub read: bool,
}

impl MessageEntry {
    /// Create an entry; `created_order` is assigned on append.
    pub fn new(
        id: MessageId,
        thread: ThreadKey,
        direction: Direction,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id,
            thread,
            direction,
            content: content.into(),
            created_order: 0,
            read: false,
        }
    }
}

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Stored at the given insertion sequence
    Appended(u64),
    /// An entry with this id already exists; nothing changed
    Duplicate,
}

impl AppendOutcome {
    pub fn is_appended(&self) -> bool {
        matches!(self, Self::Appended(_))
    }
}

/// The timeline of the currently open thread.
///
/// Idempotent append is the only way entries get in; nothing is ever
/// removed or reordered while the view lives.
#[derive(Debug, Default)]
pub struct TimelineStore {
    entries: Vec<MessageEntry>,
    index: HashMap<MessageId, usize>,
    next_order: u64,
    max_id: Option<MessageId>,
    /// Highest remote read boundary applied so far
    read_boundary: Option<MessageId>,
}

impl TimelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, id: MessageId) -> bool {
        self.index.contains_key(&id)
    }

    /// Insert `entry` unless its id is already present.
    pub fn append(&mut self, mut entry: MessageEntry) -> AppendOutcome {
        if self.has(entry.id) {
            return AppendOutcome::Duplicate;
        }

        let order = self.next_order;
        self.next_order += 1;
        entry.created_order = order;

        // A receipt can overtake the message it covers (poll vs. push race)
        if entry.direction == Direction::Outgoing
            && self.read_boundary.is_some_and(|b| entry.id <= b)
        {
            entry.read = true;
        }

        self.max_id = Some(self.max_id.map_or(entry.id, |m| m.max(entry.id)));
        self.index.insert(entry.id, self.entries.len());
        self.entries.push(entry);
        AppendOutcome::Appended(order)
    }

    /// Load history already rendered by the page. Returns how many
    /// entries were new.
    pub fn seed(&mut self, entries: impl IntoIterator<Item = MessageEntry>) -> usize {
        let mut added = 0;
        for entry in entries {
            if self.append(entry).is_appended() {
                added += 1;
            }
        }
        added
    }

    /// Entries in first-observed order.
    pub fn all_in_order(&self) -> &[MessageEntry] {
        &self.entries
    }

    /// Highest id among stored entries (read-boundary candidate).
    pub fn last_id(&self) -> Option<MessageId> {
        self.max_id
    }

    /// Highest incoming id, used when marking the thread read.
    pub fn last_incoming_id(&self) -> Option<MessageId> {
        self.entries
            .iter()
            .filter(|e| e.direction == Direction::Incoming)
            .map(|e| e.id)
            .max()
    }

    /// Incoming ids in `(after, up_to]`, ascending.
    pub fn incoming_between(&self, after: Option<MessageId>, up_to: MessageId) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self
            .entries
            .iter()
            .filter(|e| e.direction == Direction::Incoming)
            .map(|e| e.id)
            .filter(|id| *id <= up_to && after.map_or(true, |a| *id > a))
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn get(&self, id: MessageId) -> Option<&MessageEntry> {
        self.index.get(&id).map(|&slot| &self.entries[slot])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest remote read boundary seen so far.
    pub fn read_boundary(&self) -> Option<MessageId> {
        self.read_boundary
    }

    /// Mark every outgoing entry with `id <= boundary` as read.
    ///
    /// Returns only the ids that changed state. A boundary at or below
    /// the current one is a no-op.
    pub fn apply_read_boundary(&mut self, boundary: MessageId) -> Vec<MessageId> {
        if self.read_boundary.is_some_and(|b| boundary <= b) {
            return Vec::new();
        }
        self.read_boundary = Some(boundary);

        let mut changed = Vec::new();
        for entry in &mut self.entries {
            if entry.direction == Direction::Outgoing && entry.id <= boundary && !entry.read {
                entry.read = true;
                changed.push(entry.id);
            }
        }
        changed
    }
}
