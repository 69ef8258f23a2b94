//! Serialized context handed from the trust-establishing stage to later ones.
//!
//! ```text
//! magic:u32 ‖ version:u16 ‖ flags:u16 ‖ origin:u64 ‖ body_len:u32 ‖ body ‖ crc32:u32
//! ```
//!
//! All header integers are little-endian. The body is a postcard-encoded context image;
//! the trailing CRC covers header and body. Nothing in the body is an address: records refer
//! to each other by index and to the cache by offset, so moving the blob only changes the
//! `origin` field.
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use shared::checksum::compute_crc32;
use shared::wellknown::CONTEXT_HANDOFF_ID;
use shared::{
    Attributes, AuthInfo, GuardError, GuardResult, HandoffTransport, Namespace, StorePosition,
    VariableName,
};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::cache::{CacheSlot, VariableCache};
use crate::config::GuardConfig;
use crate::context::{ContextFlags, ProtectedContext};
use crate::crypto::{CryptoProvider, KeyMaterial, MacKey, RootKey};
use crate::directory::{DigestDirectory, DigestRecord, DigestSlot, RecordFlags, RecordState};
use crate::reconcile::PendingFixup;

pub const HANDOFF_MAGIC: u32 = 0x5854_4347; // "GCTX"
pub const HANDOFF_VERSION: u16 = 1;

const CRC_LEN: usize = 4;

bitflags! {
    /// Header flags of a handoff blob.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BlobFlags: u16 {
        /// Body carries the root and MAC keys.
        const SECRETS_PRESENT = 0x0001;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: BlobFlags,
    /// Base the blob was laid out for.
    pub origin: u64,
    pub body_len: u32,
}

impl BlobHeader {
    pub const ENCODED_LEN: usize = 20;

    pub fn new(flags: BlobFlags, origin: u64, body_len: u32) -> Self {
        Self {
            magic: HANDOFF_MAGIC,
            version: HANDOFF_VERSION,
            flags,
            origin,
            body_len,
        }
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut bytes = [0u8; Self::ENCODED_LEN];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.version.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        bytes[8..16].copy_from_slice(&self.origin.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.body_len.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HandoffError> {
        let bytes: &[u8; Self::ENCODED_LEN] = bytes
            .get(..Self::ENCODED_LEN)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(HandoffError::Truncated)?;

        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != HANDOFF_MAGIC {
            return Err(HandoffError::InvalidMagic(magic));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != HANDOFF_VERSION {
            return Err(HandoffError::UnsupportedVersion(version));
        }
        let flags = BlobFlags::from_bits_retain(u16::from_le_bytes([bytes[6], bytes[7]]));
        let mut origin = [0u8; 8];
        origin.copy_from_slice(&bytes[8..16]);
        let body_len = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);

        Ok(Self {
            magic,
            version,
            flags,
            origin: u64::from_le_bytes(origin),
            body_len,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffError {
    Truncated,
    InvalidMagic(u32),
    UnsupportedVersion(u16),
    LengthMismatch { declared: u32, actual: usize },
    ChecksumMismatch { expected: u32, actual: u32 },
    Body,
    /// Body decoded but refers to records or cache windows it does not hold.
    Inconsistent,
}

impl fmt::Display for HandoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandoffError::Truncated => f.write_str("handoff blob truncated"),
            HandoffError::InvalidMagic(actual) => {
                write!(f, "invalid handoff magic 0x{actual:08X}")
            }
            HandoffError::UnsupportedVersion(actual) => {
                write!(f, "unsupported handoff version {actual}")
            }
            HandoffError::LengthMismatch { declared, actual } => {
                write!(f, "handoff body declares {declared} bytes, found {actual}")
            }
            HandoffError::ChecksumMismatch { expected, actual } => write!(
                f,
                "handoff checksum mismatch: expected 0x{expected:08X}, got 0x{actual:08X}"
            ),
            HandoffError::Body => f.write_str("handoff body does not decode"),
            HandoffError::Inconsistent => f.write_str("handoff body is inconsistent"),
        }
    }
}

impl From<HandoffError> for GuardError {
    fn from(err: HandoffError) -> Self {
        log::error!("{err}");
        GuardError::Codec
    }
}

impl From<postcard::Error> for HandoffError {
    fn from(_: postcard::Error) -> Self {
        HandoffError::Body
    }
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct KeyImage {
    root: [u8; 32],
    mac: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordImage {
    name: VariableName,
    namespace: Namespace,
    attributes: u32,
    plain_size: u32,
    stored_size: u32,
    slot: DigestSlot,
    state: RecordState,
    flags: u8,
    position: Option<StorePosition>,
    cache: Option<CacheSlot>,
    auth: Option<AuthInfo>,
    /// Index into [`ContextImage::twins`].
    twin: Option<u32>,
}

impl RecordImage {
    fn capture(record: &DigestRecord, twin: Option<u32>) -> GuardResult<Self> {
        let size = |value: usize| u32::try_from(value).map_err(|_| GuardError::OutOfResources);
        Ok(Self {
            name: record.name.clone(),
            namespace: record.namespace,
            attributes: record.attributes.bits(),
            plain_size: size(record.plain_size)?,
            stored_size: size(record.stored_size)?,
            slot: record.slot.clone(),
            state: record.state,
            flags: record.flags.bits(),
            position: record.position,
            cache: record.cache,
            auth: record.auth,
            twin,
        })
    }

    fn restore(&self, state: RecordState) -> DigestRecord {
        let mut record = DigestRecord::new(
            self.name.clone(),
            self.namespace,
            Attributes::from_bits_retain(self.attributes),
            self.slot.clone(),
            state,
        );
        record.plain_size = self.plain_size as usize;
        record.stored_size = self.stored_size as usize;
        record.flags = RecordFlags::from_bits_retain(self.flags);
        record.position = self.position;
        record.cache = self.cache;
        record.auth = self.auth;
        record
    }
}

#[derive(Serialize, Deserialize)]
struct ContextImage {
    flags: u8,
    keys: Option<KeyImage>,
    records: Vec<RecordImage>,
    twins: Vec<RecordImage>,
    cache: Vec<u8>,
    cache_garbage: u32,
    keyed_on: Option<u32>,
    fixup: Option<PendingFixup>,
    checksum_delete_used: bool,
}

impl Drop for ContextImage {
    fn drop(&mut self) {
        self.cache.zeroize();
    }
}

impl ContextImage {
    fn encode(&self, origin: u64) -> GuardResult<ContextBlob> {
        let body = Zeroizing::new(postcard::to_allocvec(self).map_err(HandoffError::from)?);
        let body_len = u32::try_from(body.len()).map_err(|_| GuardError::OutOfResources)?;
        let mut flags = BlobFlags::empty();
        flags.set(BlobFlags::SECRETS_PRESENT, self.keys.is_some());
        let header = BlobHeader::new(flags, origin, body_len).encode();
        let crc = compute_crc32(&[&header, &body]);

        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(header.len() + body.len() + CRC_LEN)
            .map_err(|_| GuardError::OutOfResources)?;
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&body);
        bytes.extend_from_slice(&crc.to_le_bytes());
        Ok(ContextBlob(Zeroizing::new(bytes)))
    }
}

/// Validated handoff blob.
#[derive(Clone)]
pub struct ContextBlob(Zeroizing<Vec<u8>>);

impl fmt::Debug for ContextBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextBlob")
            .field("len", &self.0.len())
            .finish()
    }
}

impl ContextBlob {
    /// Check framing and CRC of `bytes`.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, HandoffError> {
        let bytes = Zeroizing::new(bytes);
        let header = BlobHeader::decode(&bytes)?;
        let actual = bytes
            .len()
            .checked_sub(BlobHeader::ENCODED_LEN + CRC_LEN)
            .ok_or(HandoffError::Truncated)?;
        if actual != header.body_len as usize {
            return Err(HandoffError::LengthMismatch {
                declared: header.body_len,
                actual,
            });
        }

        let (framed, trailer) = bytes.split_at(bytes.len() - CRC_LEN);
        let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let computed = compute_crc32(&[framed]);
        if expected != computed {
            return Err(HandoffError::ChecksumMismatch {
                expected,
                actual: computed,
            });
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn header(&self) -> BlobHeader {
        // Validated on construction.
        BlobHeader::decode(&self.0).unwrap_or(BlobHeader::new(BlobFlags::empty(), 0, 0))
    }

    pub fn origin(&self) -> u64 {
        self.header().origin
    }

    pub fn has_secrets(&self) -> bool {
        self.header().flags.contains(BlobFlags::SECRETS_PRESENT)
    }

    fn body(&self) -> &[u8] {
        &self.0[BlobHeader::ENCODED_LEN..self.0.len() - CRC_LEN]
    }

    fn image(&self) -> Result<ContextImage, HandoffError> {
        Ok(postcard::from_bytes(self.body())?)
    }

    /// Move the blob to `base`. Returns `false` when it already sits there.
    pub fn rebase(&mut self, base: u64) -> bool {
        let mut header = self.header();
        if header.origin == base {
            return false;
        }
        log::debug!("handoff blob rebased from 0x{:X} to 0x{base:X}", header.origin);
        header.origin = base;
        self.0[..BlobHeader::ENCODED_LEN].copy_from_slice(&header.encode());
        self.reseal();
        true
    }

    /// Drop the key material, keeping everything a read-only stage needs.
    pub fn scrub_secrets(&mut self) -> GuardResult<()> {
        if !self.has_secrets() {
            return Ok(());
        }
        let mut image = self.image()?;
        image.keys = None;
        *self = image.encode(self.origin())?;
        log::debug!("secrets scrubbed from handoff blob");
        Ok(())
    }

    fn reseal(&mut self) {
        let end = self.0.len() - CRC_LEN;
        let crc = compute_crc32(&[&self.0[..end]]);
        self.0[end..].copy_from_slice(&crc.to_le_bytes());
    }

    /// Publish under [`CONTEXT_HANDOFF_ID`].
    pub fn publish<T: HandoffTransport>(&self, transport: &mut T) -> GuardResult<()> {
        transport.put(CONTEXT_HANDOFF_ID, &self.0)
    }

    /// Fetch and validate the blob published under [`CONTEXT_HANDOFF_ID`].
    pub fn take<T: HandoffTransport>(transport: &T) -> GuardResult<Self> {
        Ok(Self::from_bytes(transport.get(CONTEXT_HANDOFF_ID)?)?)
    }
}

/// Context flags that survive a stage transition.
const CARRIED_FLAGS: ContextFlags = ContextFlags::AUTH_FORMAT
    .union(ContextFlags::RECOVERY_MODE)
    .union(ContextFlags::CACHE_READY);

impl<P: CryptoProvider> ProtectedContext<P> {
    /// Serialize the context for a later stage laid out at `origin`.
    pub fn capture(&self, origin: u64) -> GuardResult<ContextBlob> {
        if self.pending.is_some() {
            return Err(GuardError::NotReady);
        }

        let mut records = Vec::with_capacity(self.directory.len());
        let mut twins = Vec::new();
        for (_, record) in self.directory.iter() {
            let twin = match record.superseded().and_then(|id| self.directory.get(id)) {
                Some(twin) => {
                    let index = u32::try_from(twins.len()).map_err(|_| GuardError::OutOfResources)?;
                    twins.push(RecordImage::capture(twin, None)?);
                    Some(index)
                }
                None => None,
            };
            records.push(RecordImage::capture(record, twin)?);
        }

        let image = ContextImage {
            flags: (self.flags & CARRIED_FLAGS).bits(),
            keys: self.keys.as_ref().map(|keys| KeyImage {
                root: *keys.root.as_bytes(),
                mac: *keys.mac.as_bytes(),
            }),
            records,
            twins,
            cache: self.cache.region().to_vec(),
            cache_garbage: u32::try_from(self.cache.garbage())
                .map_err(|_| GuardError::OutOfResources)?,
            keyed_on: self.keyed_on,
            fixup: self.fixup.clone(),
            checksum_delete_used: self.checksum_delete_used,
        };
        let blob = image.encode(origin)?;
        log::info!(
            "context captured: {} records, {} bytes",
            image.records.len(),
            blob.as_bytes().len()
        );
        Ok(blob)
    }

    /// Rebuild a context from `blob`, moving it to `base` first.
    pub fn adopt(
        blob: &ContextBlob,
        base: u64,
        provider: P,
        config: GuardConfig,
    ) -> GuardResult<Self> {
        let mut blob = blob.clone();
        blob.rebase(base);
        let mut image = blob.image()?;

        let keys = image.keys.take().map(|keys| KeyMaterial {
            root: RootKey::new(keys.root),
            mac: MacKey::new(keys.mac),
        });
        let mut context = Self::with_parts(provider, config, keys)?;

        let region = core::mem::take(&mut image.cache);
        let region_len = region.len();
        let fits = |slot: &Option<CacheSlot>| {
            slot.is_none_or(|slot| slot.offset as usize + slot.capacity as usize <= region_len)
        };
        if !image
            .records
            .iter()
            .chain(image.twins.iter())
            .all(|record| fits(&record.cache))
        {
            return Err(HandoffError::Inconsistent.into());
        }
        context.cache = VariableCache::from_region(region, image.cache_garbage as usize);

        let mut directory = DigestDirectory::new();
        for record in &image.records {
            let id = directory.insert(record.restore(record.state));
            if let Some(index) = record.twin {
                let twin = image
                    .twins
                    .get(index as usize)
                    .ok_or(HandoffError::Inconsistent)?;
                let twin_id = directory.insert(twin.restore(RecordState::Deleted));
                directory.attach_twin(id, twin_id);
            }
        }
        context.directory = directory;

        context.flags |= ContextFlags::from_bits_truncate(image.flags) & CARRIED_FLAGS;
        context.keyed_on = image.keyed_on;
        context.fixup = image.fixup.take();
        context.checksum_delete_used = image.checksum_delete_used;
        context.origin = Some(base);
        context.refresh_well_known();

        log::info!(
            "context adopted at 0x{base:X}: {} records, secrets {}",
            context.directory.len(),
            if context.has_keys() { "present" } else { "absent" }
        );
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RustCryptoProvider;
    use crate::pipeline::UpdateRequest;
    use shared::memory::{FixedRootKey, MemoryCounters, MemoryHandoff, MemoryStore};
    use uuid::Uuid;

    const NS: Namespace = Uuid::from_u128(0x3);

    fn populated() -> (MemoryStore, MemoryCounters, ProtectedContext) {
        let mut store = MemoryStore::default();
        let mut counters = MemoryCounters::new(0, 0);
        let mut context = ProtectedContext::build(
            &mut store,
            &mut counters,
            &mut FixedRootKey::new([1; 32]),
            RustCryptoProvider,
            GuardConfig::default(),
        )
        .unwrap();
        context.write_init(&mut store, &mut counters).unwrap();
        for (name, value) in [("a", b"one".as_slice()), ("b", b"two".as_slice())] {
            context
                .commit(
                    &mut store,
                    &mut counters,
                    UpdateRequest::write(name, NS, Attributes::NON_VOLATILE, value),
                )
                .unwrap();
        }
        (store, counters, context)
    }

    #[test]
    fn header_roundtrip() {
        let header = BlobHeader::new(BlobFlags::SECRETS_PRESENT, 0x8000_0000, 77);
        assert_eq!(BlobHeader::decode(&header.encode()), Ok(header));
        assert_eq!(
            BlobHeader::decode(&[0u8; 4]),
            Err(HandoffError::Truncated)
        );
    }

    #[test]
    fn adopted_context_reads_like_the_original() {
        let (store, _, mut context) = populated();
        let blob = context.capture(0x1000).unwrap();
        assert!(blob.has_secrets());

        let mut adopted =
            ProtectedContext::adopt(&blob, 0x2000, RustCryptoProvider, GuardConfig::default())
                .unwrap();
        assert_eq!(adopted.origin(), Some(0x2000));
        assert_eq!(adopted.keyed_on(), context.keyed_on());
        assert_eq!(adopted.directory().len(), context.directory().len());
        for name in ["a", "b"] {
            let name = VariableName::from(name);
            assert_eq!(
                adopted.read(&store, &name, &NS).unwrap().to_vec(),
                context.read(&store, &name, &NS).unwrap().to_vec()
            );
        }
        assert_eq!(adopted.verify_all(&store), Ok(2));
    }

    #[test]
    fn corrupted_blob_is_rejected() {
        let (_, _, context) = populated();
        let mut bytes = context.capture(0).unwrap().as_bytes().to_vec();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0x40;

        assert!(matches!(
            ContextBlob::from_bytes(bytes.clone()),
            Err(HandoffError::ChecksumMismatch { .. })
        ));
        bytes.truncate(10);
        assert_eq!(ContextBlob::from_bytes(bytes).err(), Some(HandoffError::Truncated));
    }

    #[test]
    fn rebase_only_touches_origin() {
        let (_, _, context) = populated();
        let mut blob = context.capture(0x10).unwrap();
        let body = blob.body().to_vec();

        assert!(!blob.rebase(0x10));
        assert!(blob.rebase(0x20));
        assert_eq!(blob.origin(), 0x20);
        assert_eq!(blob.body(), body.as_slice());
        assert!(ContextBlob::from_bytes(blob.as_bytes().to_vec()).is_ok());
    }

    #[test]
    fn scrubbed_blob_carries_no_keys() {
        let (store, _, context) = populated();
        let mut blob = context.capture(0).unwrap();
        let root = *context.keys.as_ref().unwrap().root.as_bytes();
        blob.scrub_secrets().unwrap();

        assert!(!blob.has_secrets());
        assert!(!blob.as_bytes().windows(root.len()).any(|window| window == root));

        let mut adopted =
            ProtectedContext::adopt(&blob, 0, RustCryptoProvider, GuardConfig::default()).unwrap();
        assert!(!adopted.has_keys());
        assert_eq!(
            adopted.read(&store, &VariableName::from("a"), &NS).err(),
            Some(GuardError::Unsupported)
        );
        assert_eq!(adopted.entries(false).count(), 2);
    }

    #[test]
    fn transport_roundtrip() {
        let (_, _, context) = populated();
        let mut transport = MemoryHandoff::new();
        context.capture(0).unwrap().publish(&mut transport).unwrap();

        let taken = ContextBlob::take(&transport).unwrap();
        assert!(taken.has_secrets());
        assert_eq!(
            ContextBlob::take(&MemoryHandoff::new()).err(),
            Some(GuardError::NotFound)
        );
    }

    #[test]
    fn pending_commit_blocks_capture() {
        let (mut store, mut counters, mut context) = populated();
        context
            .update(
                &mut store,
                &mut counters,
                UpdateRequest::write("c", NS, Attributes::NON_VOLATILE, *b"v"),
            )
            .unwrap();
        assert_eq!(context.capture(0).err(), Some(GuardError::NotReady));
    }
}
