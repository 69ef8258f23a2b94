//! In-memory implementations of every injected interface.
//!
//! Used by unit and scenario tests and by host-side simulation of a boot flow.
use alloc::{collections::BTreeMap, vec::Vec};

use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{GuardError, GuardResult};
use crate::store::{
    CounterId, HandoffTransport, ROOT_KEY_SIZE, ReplayCounters, RootKeySource, VariableStore,
};
use crate::variable::{
    EntryState, Namespace, NewEntry, StorePosition, StoredEntry, VariableName,
};

/// Default batch limit of [`MemoryStore`].
pub const DEFAULT_MAX_RECORD_SIZE: usize = 0x1000;

/// Append-only store kept in a vector, positions are byte offsets.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    entries: Vec<StoredEntry>,
    next_position: u32,
    max_record_size: usize,
    auth_format: bool,
    fail_writes: bool,
    fail_deletes: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORD_SIZE)
    }
}

impl MemoryStore {
    pub fn new(max_record_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            next_position: 0,
            max_record_size,
            auth_format: true,
            fail_writes: false,
            fail_deletes: false,
        }
    }

    pub fn with_auth_format(mut self, auth_format: bool) -> Self {
        self.auth_format = auth_format;
        self
    }

    /// Every entry ever appended, deleted ones included.
    pub fn entries(&self) -> &[StoredEntry] {
        &self.entries
    }

    /// Entries not in state `Deleted`.
    pub fn live_entries(&self) -> impl Iterator<Item = &StoredEntry> {
        self.entries.iter().filter(|entry| entry.state.is_live())
    }

    /// Live copies of one entry, in store order.
    pub fn live_copies(&self, name: &VariableName, namespace: &Namespace) -> Vec<&StoredEntry> {
        self.live_entries()
            .filter(|entry| entry.matches(name, namespace))
            .collect()
    }

    /// Make subsequent writes fail as if the store were full.
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Make subsequent `Deleted` marks fail as if the flash were busy.
    pub fn set_fail_deletes(&mut self, fail: bool) {
        self.fail_deletes = fail;
    }

    /// Append an entry directly, bypassing any guard logic.
    pub fn seed(&mut self, entry: NewEntry, state: EntryState) -> GuardResult<StorePosition> {
        let position = self.append(entry)?;
        if let Some(stored) = self.entry_mut(position) {
            stored.state = state;
        }
        Ok(position)
    }

    /// Flip every bit of one payload byte of the entry at `position`.
    pub fn tamper(&mut self, position: StorePosition, index: usize) -> GuardResult<()> {
        let entry = self.entry_mut(position).ok_or(GuardError::NotFound)?;
        let byte = entry
            .data
            .get_mut(index)
            .ok_or(GuardError::InvalidParameter("tamper index"))?;
        *byte ^= 0xFF;
        log::debug!("tampered byte {index} of entry at {position}");
        Ok(())
    }

    fn entry_mut(&mut self, position: StorePosition) -> Option<&mut StoredEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.position == position)
    }

    fn append(&mut self, entry: NewEntry) -> GuardResult<StorePosition> {
        let position = StorePosition(self.next_position);
        let next = position
            .after(entry.record_size())
            .ok_or(GuardError::OutOfResources)?;
        self.entries.push(StoredEntry {
            position,
            state: EntryState::Added,
            attributes: entry.attributes,
            namespace: entry.namespace,
            name: entry.name,
            data: entry.data,
            auth: entry.auth,
        });
        self.next_position = next.0;
        Ok(position)
    }
}

impl VariableStore for MemoryStore {
    fn get(&self, position: StorePosition) -> GuardResult<StoredEntry> {
        self.entries
            .iter()
            .find(|entry| entry.position == position)
            .cloned()
            .ok_or(GuardError::NotFound)
    }

    fn get_by_name(&self, name: &VariableName, namespace: &Namespace) -> GuardResult<StoredEntry> {
        let copies = self.live_copies(name, namespace);
        copies
            .iter()
            .rev()
            .find(|entry| entry.state == EntryState::Added)
            .or_else(|| copies.last())
            .map(|entry| (*entry).clone())
            .ok_or(GuardError::NotFound)
    }

    fn get_next(&self, after: Option<StorePosition>) -> GuardResult<Option<StoredEntry>> {
        let next = match after {
            None => self.entries.first(),
            Some(cursor) => self.entries.iter().find(|entry| entry.position > cursor),
        };
        Ok(next.cloned())
    }

    fn raw_update_state(&mut self, position: StorePosition, state: EntryState) -> GuardResult<()> {
        if self.fail_deletes && state == EntryState::Deleted {
            log::warn!("refusing to delete entry at {position}");
            return Err(GuardError::DeviceError);
        }
        let entry = self.entry_mut(position).ok_or(GuardError::NotFound)?;
        log::trace!("entry at {position}: {:?} -> {state:?}", entry.state);
        entry.state = state;
        Ok(())
    }

    fn write(&mut self, entries: &[NewEntry]) -> GuardResult<StorePosition> {
        let size: usize = entries.iter().map(NewEntry::record_size).sum();
        if size > self.max_record_size {
            return Err(GuardError::BadBufferSize {
                size,
                limit: self.max_record_size,
            });
        }
        if self.fail_writes {
            log::warn!("store full, {} entries rejected", entries.len());
            return Err(GuardError::OutOfResources);
        }
        let first = StorePosition(self.next_position);
        for entry in entries {
            self.append(entry.clone())?;
        }
        log::trace!("{} entries appended at {first}", entries.len());
        Ok(first)
    }

    fn max_record_size(&self) -> usize {
        self.max_record_size
    }

    fn is_auth_format(&self) -> bool {
        self.auth_format
    }
}

/// Two counters backed by plain integers.
#[derive(Debug, Clone, Default)]
pub struct MemoryCounters {
    values: [u32; 2],
    failing: Option<CounterId>,
}

impl MemoryCounters {
    pub fn new(first: u32, second: u32) -> Self {
        Self {
            values: [first, second],
            failing: None,
        }
    }

    /// Make every access to `id` report a device error.
    pub fn fail(&mut self, id: Option<CounterId>) {
        self.failing = id;
    }

    pub fn values(&self) -> (u32, u32) {
        (self.values[0], self.values[1])
    }

    fn check(&self, id: CounterId) -> GuardResult<usize> {
        if self.failing == Some(id) {
            return Err(GuardError::DeviceError);
        }
        Ok(match id {
            CounterId::First => 0,
            CounterId::Second => 1,
        })
    }
}

impl ReplayCounters for MemoryCounters {
    fn advance(&mut self, id: CounterId) -> GuardResult<()> {
        let index = self.check(id)?;
        self.values[index] = self.values[index]
            .checked_add(1)
            .ok_or(GuardError::DeviceError)?;
        Ok(())
    }

    fn read(&self, id: CounterId) -> GuardResult<u32> {
        let index = self.check(id)?;
        Ok(self.values[index])
    }
}

/// Root-key source returning a fixed key.
#[derive(Clone)]
pub struct FixedRootKey {
    key: Zeroizing<[u8; ROOT_KEY_SIZE]>,
}

impl FixedRootKey {
    pub fn new(key: [u8; ROOT_KEY_SIZE]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }
}

impl RootKeySource for FixedRootKey {
    fn derive_root_key(&mut self, key: &mut [u8; ROOT_KEY_SIZE]) -> GuardResult<()> {
        key.copy_from_slice(self.key.as_ref());
        Ok(())
    }
}

/// Handoff channel keyed by blob identifier.
#[derive(Debug, Default)]
pub struct MemoryHandoff {
    blobs: BTreeMap<Uuid, Zeroizing<Vec<u8>>>,
}

impl MemoryHandoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw view of a published blob, for inspecting what a later stage would see.
    pub fn raw(&self, id: Uuid) -> Option<&[u8]> {
        self.blobs.get(&id).map(|blob| blob.as_slice())
    }
}

impl HandoffTransport for MemoryHandoff {
    fn put(&mut self, id: Uuid, blob: &[u8]) -> GuardResult<()> {
        self.blobs.insert(id, Zeroizing::new(blob.to_vec()));
        Ok(())
    }

    fn get(&self, id: Uuid) -> GuardResult<Vec<u8>> {
        self.blobs
            .get(&id)
            .map(|blob| blob.to_vec())
            .ok_or(GuardError::NotFound)
    }
}
