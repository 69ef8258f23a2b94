//! Data model of the flat variable store the guard sits in front of.
//!
//! Every entry is addressed by a `(name, namespace)` pair. Names are opaque byte strings
//! compared case-sensitively; namespaces are GUIDs serialized in the firmware mixed-endian
//! layout whenever they feed a digest or a key derivation.
use alloc::{borrow::Cow, string::String, vec::Vec};
use core::cmp::Ordering;
use core::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace identifier of an entry (vendor GUID).
pub type Namespace = Uuid;

/// Width in bytes of every per-entry digest and of the aggregate checksum.
pub const DIGEST_SIZE: usize = 32;

/// Fixed per-record overhead of the backing store format.
pub const ENTRY_HEADER_SIZE: usize = 60;

/// Records are laid out on this alignment inside the store.
pub const ENTRY_ALIGNMENT: usize = 4;

/// Entry name as stored on flash.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariableName(Vec<u8>);

impl VariableName {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lossy textual form used for log lines.
    pub fn display(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl From<&str> for VariableName {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<&[u8]> for VariableName {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}

impl fmt::Debug for VariableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VariableName({:?})", self.display())
    }
}

impl fmt::Display for VariableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

/// Total order used by the digest directory: name bytes first, namespace as tiebreak.
pub fn compare_keys(
    name: &[u8],
    namespace: &Namespace,
    other_name: &[u8],
    other_namespace: &Namespace,
) -> Ordering {
    name.cmp(other_name)
        .then_with(|| namespace.as_bytes().cmp(other_namespace.as_bytes()))
}

/// Namespace bytes in the layout firmware uses on flash.
pub fn namespace_bytes(namespace: &Namespace) -> [u8; 16] {
    namespace.to_bytes_le()
}

bitflags::bitflags! {
    /// Declared attribute flags of a store entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Attributes: u32 {
        const NON_VOLATILE = 0x0000_0001;
        const BOOTSERVICE_ACCESS = 0x0000_0002;
        const RUNTIME_ACCESS = 0x0000_0004;
        const HARDWARE_ERROR_RECORD = 0x0000_0008;
        const AUTHENTICATED_WRITE_ACCESS = 0x0000_0010;
        const TIME_BASED_AUTHENTICATED_WRITE_ACCESS = 0x0000_0020;
        const APPEND_WRITE = 0x0000_0040;
        /// Library-reserved: the payload starts with a cipher header.
        ///
        /// Covered by the entry digest, so stripping or adding it is detected.
        const ENCRYPTED_PAYLOAD = 0x8000_0000;
    }
}

impl Attributes {
    /// Attributes the library assigns to the entries it manages itself.
    pub const LIBRARY_MANAGED: Attributes = Attributes::NON_VOLATILE
        .union(Attributes::BOOTSERVICE_ACCESS)
        .union(Attributes::RUNTIME_ACCESS);

    /// Attributes as declared by the caller, without library-reserved bits.
    pub const fn declared(self) -> Attributes {
        self.difference(Attributes::ENCRYPTED_PAYLOAD)
    }
}

/// Lifecycle state of a store entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryState {
    Added,
    InDeleteTransition,
    Deleted,
}

impl EntryState {
    pub const fn is_live(self) -> bool {
        !matches!(self, EntryState::Deleted)
    }
}

/// Auxiliary fields carried by authenticated-format entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthInfo {
    pub key_index: u32,
    pub monotonic_count: u64,
    pub timestamp: [u8; 16],
}

impl AuthInfo {
    /// Value folded into digests for entries without authenticated fields.
    pub const SENTINEL: AuthInfo = AuthInfo {
        key_index: u32::MAX,
        monotonic_count: u64::MAX,
        timestamp: [0xFF; 16],
    };
}

/// Byte offset of an entry inside the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorePosition(pub u32);

impl StorePosition {
    /// Position of the record that follows one of `record_size` bytes.
    pub fn after(self, record_size: usize) -> Option<StorePosition> {
        let size = u32::try_from(record_size).ok()?;
        self.0.checked_add(size).map(StorePosition)
    }
}

impl fmt::Display for StorePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Entry as returned by the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub position: StorePosition,
    pub state: EntryState,
    pub attributes: Attributes,
    pub namespace: Namespace,
    pub name: VariableName,
    pub data: Vec<u8>,
    pub auth: Option<AuthInfo>,
}

impl StoredEntry {
    pub fn matches(&self, name: &VariableName, namespace: &Namespace) -> bool {
        self.name == *name && self.namespace == *namespace
    }
}

/// Entry handed to the backing store for appending.
#[derive(Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub attributes: Attributes,
    pub namespace: Namespace,
    pub name: VariableName,
    pub data: Vec<u8>,
    pub auth: Option<AuthInfo>,
}

impl NewEntry {
    /// Bytes the entry occupies once appended, header and alignment included.
    pub fn record_size(&self) -> usize {
        record_size(self.name.len(), self.data.len())
    }
}

impl fmt::Debug for NewEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewEntry")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("attributes", &self.attributes)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Aligned on-store footprint of an entry with the given name and payload lengths.
pub const fn record_size(name_len: usize, data_len: usize) -> usize {
    let raw = ENTRY_HEADER_SIZE + name_len + data_len;
    raw.div_ceil(ENTRY_ALIGNMENT) * ENTRY_ALIGNMENT
}
