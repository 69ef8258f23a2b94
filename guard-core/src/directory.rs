//! Digest directory: the ordered set of per-entry records every other component works on.
//!
//! Records live in an arena and are threaded into a doubly linked list kept in key order
//! (case-sensitive name, namespace as tiebreak). Links are arena indices, never addresses.
//!
//! At most one record per key is *linked*. When two copies of the same key meet, the one in
//! the higher-priority state stays linked and the other is demoted to `Deleted` but kept
//! reachable from the winner as its superseded twin. The twin is what the rollback view of
//! the directory sees in place of the winner until the commit that produced the pair is
//! finalized or undone.
use alloc::vec::Vec;
use core::cmp::Ordering;
use core::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use shared::variable::compare_keys;
use shared::{Attributes, AuthInfo, EntryState, Namespace, StorePosition, VariableName};

use crate::cache::CacheSlot;
use crate::crypto::Digest;

/// Arena index of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(u32);

impl RecordId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Lifecycle state of a directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    Added,
    InDeleteTransition,
    Deleted,
}

impl RecordState {
    const fn priority(self) -> u8 {
        match self {
            RecordState::Added => 2,
            RecordState::InDeleteTransition => 1,
            RecordState::Deleted => 0,
        }
    }

    pub const fn entry_state(self) -> EntryState {
        match self {
            RecordState::Added => EntryState::Added,
            RecordState::InDeleteTransition => EntryState::InDeleteTransition,
            RecordState::Deleted => EntryState::Deleted,
        }
    }
}

impl From<EntryState> for RecordState {
    fn from(state: EntryState) -> Self {
        match state {
            EntryState::Added => RecordState::Added,
            EntryState::InDeleteTransition => RecordState::InDeleteTransition,
            EntryState::Deleted => RecordState::Deleted,
        }
    }
}

bitflags! {
    /// Capability flags of a record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RecordFlags: u8 {
        /// Covered by a digest and by the aggregate checksum.
        const PROTECTED = 0x01;
        /// Payload is an AEAD envelope.
        const ENCRYPTED = 0x02;
        /// Digest reflects the current payload.
        const VALID = 0x04;
        /// Arena slot may be reused once the record is removed.
        const FREEABLE = 0x08;
    }
}

/// Digest of a protected record, or the raw value of an unprotected one.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigestSlot {
    Mac(Digest),
    Cached(Vec<u8>),
}

impl DigestSlot {
    pub fn digest(&self) -> Option<&Digest> {
        match self {
            DigestSlot::Mac(digest) => Some(digest),
            DigestSlot::Cached(_) => None,
        }
    }

    pub fn cached(&self) -> Option<&[u8]> {
        match self {
            DigestSlot::Mac(_) => None,
            DigestSlot::Cached(value) => Some(value),
        }
    }
}

impl fmt::Debug for DigestSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestSlot::Mac(digest) => write!(f, "Mac({digest:?})"),
            DigestSlot::Cached(value) => write!(f, "Cached({} bytes)", value.len()),
        }
    }
}

/// Per-entry record.
#[derive(Debug, Clone)]
pub struct DigestRecord {
    pub name: VariableName,
    pub namespace: Namespace,
    /// Attributes as stored, including library-reserved bits.
    pub attributes: Attributes,
    pub plain_size: usize,
    pub stored_size: usize,
    pub slot: DigestSlot,
    pub state: RecordState,
    pub flags: RecordFlags,
    /// `None` while the record belongs to a batch that has not landed yet.
    pub position: Option<StorePosition>,
    pub cache: Option<CacheSlot>,
    pub auth: Option<AuthInfo>,
    superseded: Option<RecordId>,
    prev: Option<RecordId>,
    next: Option<RecordId>,
    linked: bool,
}

impl DigestRecord {
    pub fn new(
        name: VariableName,
        namespace: Namespace,
        attributes: Attributes,
        slot: DigestSlot,
        state: RecordState,
    ) -> Self {
        Self {
            name,
            namespace,
            attributes,
            plain_size: 0,
            stored_size: 0,
            slot,
            state,
            flags: RecordFlags::empty(),
            position: None,
            cache: None,
            auth: None,
            superseded: None,
            prev: None,
            next: None,
            linked: false,
        }
    }

    pub fn matches(&self, name: &VariableName, namespace: &Namespace) -> bool {
        self.name == *name && self.namespace == *namespace
    }

    fn key_cmp(&self, other: &DigestRecord) -> Ordering {
        compare_keys(
            self.name.as_bytes(),
            &self.namespace,
            other.name.as_bytes(),
            &other.namespace,
        )
    }

    pub fn is_protected(&self) -> bool {
        self.flags.contains(RecordFlags::PROTECTED)
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags.contains(RecordFlags::ENCRYPTED)
    }

    /// Earlier generation of this key kept for the rollback view.
    pub fn superseded(&self) -> Option<RecordId> {
        self.superseded
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }
}

/// Which generation of each key an iteration yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryView {
    /// Only records in state `Added`; superseded twins and pending deletions are skipped.
    Committed,
    /// Superseded twins replace their winners and pending deletions still count as live.
    Rollback,
    /// The rollback view without one twinless record left by a commit that never finished.
    RollbackWithout(RecordId),
}

/// What a record left behind in the store and the cache when it was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released {
    pub id: RecordId,
    pub position: Option<StorePosition>,
    pub cache: Option<CacheSlot>,
}

#[derive(Debug, Clone, Default)]
pub struct DigestDirectory {
    slots: Vec<Option<DigestRecord>>,
    free: Vec<RecordId>,
    head: Option<RecordId>,
    tail: Option<RecordId>,
    len: usize,
}

impl DigestDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of linked records.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, id: RecordId) -> Option<&DigestRecord> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: RecordId) -> Option<&mut DigestRecord> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    fn alloc(&mut self, record: DigestRecord) -> RecordId {
        if let Some(id) = self.free.pop() {
            self.slots[id.index()] = Some(record);
            return id;
        }
        let id = RecordId(self.slots.len() as u32);
        self.slots.push(Some(record));
        id
    }

    fn set_prev(&mut self, id: Option<RecordId>, prev: Option<RecordId>) {
        match id.and_then(|id| self.get_mut(id)) {
            Some(record) => record.prev = prev,
            None => self.tail = prev,
        }
    }

    fn set_next(&mut self, id: Option<RecordId>, next: Option<RecordId>) {
        match id.and_then(|id| self.get_mut(id)) {
            Some(record) => record.next = next,
            None => self.head = next,
        }
    }

    fn link_after(&mut self, before: Option<RecordId>, id: RecordId) {
        let next = match before {
            Some(before) => self.get(before).and_then(|record| record.next),
            None => self.head,
        };
        if let Some(record) = self.get_mut(id) {
            record.prev = before;
            record.next = next;
            record.linked = true;
        }
        self.set_next(before, Some(id));
        self.set_prev(next, Some(id));
        self.len += 1;
    }

    fn unlink(&mut self, id: RecordId) {
        let Some(record) = self.get_mut(id) else {
            return;
        };
        if !record.linked {
            return;
        }
        let (prev, next) = (record.prev.take(), record.next.take());
        record.linked = false;
        self.set_next(prev, next);
        self.set_prev(next, prev);
        self.len -= 1;
    }

    /// Put `replacement` where `current` sits in the order.
    fn replace_link(&mut self, current: RecordId, replacement: RecordId) {
        let Some(record) = self.get(current) else {
            return;
        };
        let prev = record.prev;
        self.unlink(current);
        self.link_after(prev, replacement);
    }

    /// Mark a detached record `Deleted` and free its slot when allowed.
    fn retire(&mut self, id: RecordId) -> Option<Released> {
        let record = self.get_mut(id)?;
        record.state = RecordState::Deleted;
        let released = Released {
            id,
            position: record.position,
            cache: record.cache.take(),
        };
        if record.flags.contains(RecordFlags::FREEABLE) {
            self.slots[id.index()] = None;
            self.free.push(id);
        }
        Some(released)
    }

    /// Insert `record` in key order, resolving a collision with an existing linked record.
    ///
    /// The copy in the higher-priority state stays linked; the loser becomes the winner's
    /// superseded twin. Between equal states the incoming record wins and the displaced
    /// one is retired outright. Returns the arena id of `record`, linked or not.
    pub fn insert(&mut self, mut record: DigestRecord) -> RecordId {
        record.superseded = None;
        record.prev = None;
        record.next = None;
        record.linked = false;

        if record.state == RecordState::Deleted {
            return self.alloc(record);
        }

        let mut before = None;
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let Some(existing) = self.get(id) else {
                break;
            };
            match existing.key_cmp(&record) {
                Ordering::Less => {
                    before = Some(id);
                    cursor = existing.next;
                }
                Ordering::Equal => return self.resolve(id, record),
                Ordering::Greater => break,
            }
        }

        let id = self.alloc(record);
        self.link_after(before, id);
        id
    }

    fn resolve(&mut self, existing: RecordId, record: DigestRecord) -> RecordId {
        let Some(current) = self.get(existing) else {
            return self.alloc(record);
        };
        let incoming = record.state.priority();
        let resident = current.state.priority();
        let resident_twin = current.superseded;

        if incoming < resident {
            log::trace!("{} demoted to superseded twin", record.name);
            if let Some(stale) = resident_twin {
                self.retire(stale);
            }
            let id = self.alloc(record);
            if let Some(twin) = self.get_mut(id) {
                twin.state = RecordState::Deleted;
            }
            if let Some(winner) = self.get_mut(existing) {
                winner.superseded = Some(id);
            }
            return id;
        }

        let id = self.alloc(record);
        self.replace_link(existing, id);
        if incoming > resident {
            log::trace!("{} supersedes an earlier generation", self.display_name(id));
            if let Some(stale) = resident_twin {
                self.retire(stale);
            }
            if let Some(loser) = self.get_mut(existing) {
                loser.state = RecordState::Deleted;
                loser.superseded = None;
            }
            if let Some(winner) = self.get_mut(id) {
                winner.superseded = Some(existing);
            }
        } else {
            log::warn!(
                "{} present twice in the same state, keeping the later copy",
                self.display_name(id)
            );
            if let Some(loser) = self.get_mut(existing) {
                loser.superseded = None;
            }
            self.retire(existing);
            if let Some(winner) = self.get_mut(id) {
                winner.superseded = resident_twin;
            }
        }
        id
    }

    fn display_name(&self, id: RecordId) -> VariableName {
        self.get(id)
            .map(|record| record.name.clone())
            .unwrap_or_else(|| VariableName::new(Vec::new()))
    }

    /// Unlink `id`, mark it `Deleted` and release its slot if `Freeable`.
    ///
    /// A superseded twin still attached to `id` is released with it.
    pub fn remove(&mut self, id: RecordId) -> Option<Released> {
        let twin = self.get_mut(id)?.superseded.take();
        if let Some(twin) = twin {
            self.retire(twin);
        }
        self.unlink(id);
        self.retire(id)
    }

    /// Drop the superseded twin of `winner`, finalizing the newer generation.
    pub fn release_twin(&mut self, winner: RecordId) -> Option<Released> {
        let twin = self.get_mut(winner)?.superseded.take()?;
        self.retire(twin)
    }

    /// Undo a supersession: unlink `winner`, relink its twin in state `Added`.
    ///
    /// Returns the restored twin and what the dropped winner released.
    pub fn restore_twin(&mut self, winner: RecordId) -> Option<(RecordId, Released)> {
        let twin = self.get_mut(winner)?.superseded.take()?;
        self.replace_link(winner, twin);
        if let Some(restored) = self.get_mut(twin) {
            restored.state = RecordState::Added;
        }
        let released = self.retire(winner)?;
        Some((twin, released))
    }

    /// Re-attach a detached record as the superseded twin of `winner`.
    pub(crate) fn attach_twin(&mut self, winner: RecordId, twin: RecordId) {
        let Some(record) = self.get_mut(twin) else {
            return;
        };
        if record.linked {
            return;
        }
        record.state = RecordState::Deleted;
        if let Some(winner) = self.get_mut(winner) {
            winner.superseded = Some(twin);
        }
    }

    /// Linked record for `(name, namespace)`, whatever its live state.
    pub fn find(&self, name: &VariableName, namespace: &Namespace) -> Option<RecordId> {
        self.iter()
            .take_while(|(_, record)| {
                compare_keys(
                    record.name.as_bytes(),
                    &record.namespace,
                    name.as_bytes(),
                    namespace,
                ) != Ordering::Greater
            })
            .find(|(_, record)| record.matches(name, namespace))
            .map(|(id, _)| id)
    }

    /// Linked record or superseded twin recorded at `position`.
    pub fn find_by_position(&self, position: StorePosition) -> Option<RecordId> {
        self.iter().find_map(|(id, record)| {
            if record.position == Some(position) {
                return Some(id);
            }
            record
                .superseded
                .filter(|twin| self.get(*twin).and_then(|twin| twin.position) == Some(position))
        })
    }

    /// Linked record with the smallest store position strictly after `cursor`.
    pub fn next_after(&self, cursor: Option<StorePosition>) -> Option<RecordId> {
        self.iter()
            .filter_map(|(id, record)| record.position.map(|position| (position, id)))
            .filter(|(position, _)| cursor.is_none_or(|cursor| *position > cursor))
            .min_by_key(|(position, _)| *position)
            .map(|(_, id)| id)
    }

    /// Linked records in key order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            directory: self,
            cursor: self.head,
        }
    }

    /// Ids of the linked records in key order, detached from the borrow.
    pub fn ids(&self) -> Vec<RecordId> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Records as seen by one generation, in key order.
    pub fn view(&self, view: DirectoryView) -> impl Iterator<Item = &DigestRecord> + '_ {
        self.iter().filter_map(move |(id, record)| match view {
            DirectoryView::Committed => (record.state == RecordState::Added).then_some(record),
            DirectoryView::Rollback | DirectoryView::RollbackWithout(_) => {
                match record.superseded {
                    Some(twin) => self.get(twin),
                    None if view == DirectoryView::RollbackWithout(id) => None,
                    None => Some(record),
                }
            }
        })
    }

    /// Whether any key still has two generations or a pending deletion.
    pub fn has_transitional(&self) -> bool {
        self.iter().any(|(_, record)| {
            record.superseded.is_some() || record.state == RecordState::InDeleteTransition
        })
    }

    /// Every record held by the arena, linked or not.
    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut DigestRecord> {
        self.slots.iter_mut().filter_map(Option::as_mut)
    }
}

pub struct Iter<'a> {
    directory: &'a DigestDirectory,
    cursor: Option<RecordId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (RecordId, &'a DigestRecord);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let record = self.directory.get(id)?;
        self.cursor = record.next;
        Some((id, record))
    }
}
