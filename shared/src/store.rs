//! Narrow interfaces the guard consumes from the platform.
//!
//! None of them are implemented here beyond the in-memory doubles in [`crate::memory`]:
//! the flat store, the monotonic counters, the root-key source and the inter-stage
//! transport all belong to the platform.
use alloc::vec::Vec;

use uuid::Uuid;

use crate::error::GuardResult;
use crate::variable::{EntryState, Namespace, NewEntry, StorePosition, StoredEntry, VariableName};

/// Size of the platform root key.
pub const ROOT_KEY_SIZE: usize = 32;

/// Flat, append-mostly variable store.
pub trait VariableStore {
    /// Fetch the entry recorded at `position`.
    fn get(&self, position: StorePosition) -> GuardResult<StoredEntry>;

    /// Fetch the live entry named `name` in `namespace`, preferring `Added` over
    /// `InDeleteTransition` copies.
    fn get_by_name(&self, name: &VariableName, namespace: &Namespace) -> GuardResult<StoredEntry>;

    /// Entry following `after` in store order, including deleted ones.
    ///
    /// `None` starts the walk at the first entry.
    fn get_next(&self, after: Option<StorePosition>) -> GuardResult<Option<StoredEntry>>;

    /// Raw in-place rewrite of the state field of the entry at `position`.
    fn raw_update_state(&mut self, position: StorePosition, state: EntryState) -> GuardResult<()>;

    /// Append `entries` contiguously, in order, returning the position of the first one.
    ///
    /// Each entry occupies exactly [`NewEntry::record_size`] bytes.
    fn write(&mut self, entries: &[NewEntry]) -> GuardResult<StorePosition>;

    /// Largest batch, in bytes, a single [`VariableStore::write`] call accepts.
    fn max_record_size(&self) -> usize;

    /// Whether entries carry authenticated-format auxiliary fields.
    fn is_auth_format(&self) -> bool {
        true
    }
}

/// Identifier of one of the two hardware replay counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterId {
    First,
    Second,
}

/// Pair of independent monotonic counters that only ever advance by one.
pub trait ReplayCounters {
    fn advance(&mut self, id: CounterId) -> GuardResult<()>;

    fn read(&self, id: CounterId) -> GuardResult<u32>;
}

/// Source of the platform root key.
pub trait RootKeySource {
    fn derive_root_key(&mut self, key: &mut [u8; ROOT_KEY_SIZE]) -> GuardResult<()>;
}

/// Opaque byte-blob channel between boot stages.
pub trait HandoffTransport {
    fn put(&mut self, id: Uuid, blob: &[u8]) -> GuardResult<()>;

    fn get(&self, id: Uuid) -> GuardResult<Vec<u8>>;
}
