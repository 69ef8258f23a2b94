//! The per-stage context every guard operation runs against.
//!
//! A [`ProtectedContext`] owns the key material, the digest directory, the payload cache
//! and the commit state of one stage. It is either built from the backing store by the
//! trust-establishing stage or adopted from a handoff blob by a later one.
use alloc::vec::Vec;

use bitflags::bitflags;
use shared::store::ROOT_KEY_SIZE;
use shared::wellknown::{
    CHECKSUM_NAMESPACE, ERROR_FLAG_NAME, ERROR_FLAG_NAMESPACE, WellKnown, checksum_entry_name,
    is_checksum_entry,
};
use shared::{
    Attributes, AuthInfo, CounterId, EntryState, GuardError, GuardResult, Namespace,
    ReplayCounters, RootKeySource, StorePosition, StoredEntry, VariableName, VariableStore,
};
use zeroize::Zeroizing;

use crate::cache::VariableCache;
use crate::cipher;
use crate::config::GuardConfig;
use crate::crypto::{CryptoProvider, KeyMaterial, RootKey, RustCryptoProvider};
use crate::directory::{
    DigestDirectory, DigestRecord, DigestSlot, RecordFlags, RecordId, RecordState,
};
use crate::integrity::IntegrityEngine;
use crate::pipeline::PendingCommit;
use crate::reconcile::{self, Candidates, PendingFixup, Resolution};

bitflags! {
    /// Context-wide state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ContextFlags: u8 {
        /// Store entries carry authenticated-format auxiliary fields.
        const AUTH_FORMAT = 0x01;
        const WRITE_INIT_DONE = 0x02;
        const WRITE_READY = 0x04;
        /// Digest verification is skipped and a missing checksum is re-synthesized.
        const RECOVERY_MODE = 0x08;
        const CACHE_READY = 0x10;
    }
}

/// Directory ids of the library-managed entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WellKnownCache {
    checksum_added: Option<RecordId>,
    checksum_in_deletion: Option<RecordId>,
    error_flag: Option<RecordId>,
    platform: Vec<Option<RecordId>>,
}

impl WellKnownCache {
    pub fn collect(directory: &DigestDirectory, config: &GuardConfig) -> Self {
        let mut cache = Self::default();

        if let Some(id) = directory.find(&checksum_entry_name(), &CHECKSUM_NAMESPACE) {
            match directory.get(id).map(|record| record.state) {
                Some(RecordState::Added) => {
                    cache.checksum_added = Some(id);
                    cache.checksum_in_deletion = directory.get(id).and_then(|r| r.superseded());
                }
                Some(RecordState::InDeleteTransition) => cache.checksum_in_deletion = Some(id),
                _ => {}
            }
        }

        let error_flag = VariableName::from(ERROR_FLAG_NAME);
        cache.error_flag = directory.find(&error_flag, &ERROR_FLAG_NAMESPACE);
        cache.platform = config
            .platform_reserved()
            .iter()
            .map(|entry| directory.find(&entry.name, &entry.namespace))
            .collect();
        cache
    }

    pub fn record(&self, entry: WellKnown) -> Option<RecordId> {
        match entry {
            WellKnown::ChecksumAdded => self.checksum_added,
            WellKnown::ChecksumInDeletion => self.checksum_in_deletion,
            WellKnown::ErrorFlag => self.error_flag,
            WellKnown::Platform(index) => self.platform.get(index).copied().flatten(),
        }
    }

    pub fn position(&self, directory: &DigestDirectory, entry: WellKnown) -> Option<StorePosition> {
        self.record(entry)
            .and_then(|id| directory.get(id))
            .and_then(|record| record.position)
    }
}

pub struct ProtectedContext<P: CryptoProvider = RustCryptoProvider> {
    pub(crate) provider: P,
    pub(crate) config: GuardConfig,
    pub(crate) keys: Option<KeyMaterial>,
    pub(crate) directory: DigestDirectory,
    pub(crate) well_known: WellKnownCache,
    pub(crate) flags: ContextFlags,
    pub(crate) cache: VariableCache,
    pub(crate) scratch: Zeroizing<Vec<u8>>,
    /// Counter value the active checksum is bound to.
    pub(crate) keyed_on: Option<u32>,
    pub(crate) fixup: Option<PendingFixup>,
    pub(crate) pending: Option<PendingCommit>,
    pub(crate) checksum_delete_used: bool,
    pub(crate) origin: Option<u64>,
}

/// Integrity engine over the context's key, borrowed field by field.
pub(crate) fn integrity_engine<'a, P: CryptoProvider>(
    provider: &'a P,
    keys: Option<&'a KeyMaterial>,
    flags: ContextFlags,
) -> GuardResult<IntegrityEngine<'a, P>> {
    let keys = keys.ok_or(GuardError::Unsupported)?;
    Ok(IntegrityEngine::new(provider, &keys.mac)
        .with_auth_format(flags.contains(ContextFlags::AUTH_FORMAT))
        .with_recovery(flags.contains(ContextFlags::RECOVERY_MODE)))
}

/// Record for a library-managed entry whose value lives in the digest slot.
pub(crate) fn library_record(
    name: VariableName,
    namespace: Namespace,
    attributes: Attributes,
    value: Vec<u8>,
    auth: Option<AuthInfo>,
    state: RecordState,
) -> DigestRecord {
    let size = value.len();
    let mut record = DigestRecord::new(name, namespace, attributes, DigestSlot::Cached(value), state);
    record.plain_size = size;
    record.stored_size = size;
    record.auth = auth;
    record.flags = RecordFlags::FREEABLE;
    record
}

impl<P: CryptoProvider> ProtectedContext<P> {
    pub(crate) fn with_parts(
        provider: P,
        config: GuardConfig,
        keys: Option<KeyMaterial>,
    ) -> GuardResult<Self> {
        let mut scratch = Zeroizing::new(Vec::new());
        scratch
            .try_reserve_exact(config.max_payload_size())
            .map_err(|_| GuardError::OutOfResources)?;

        let mut flags = ContextFlags::empty();
        flags.set(ContextFlags::RECOVERY_MODE, config.recovery_mode());

        Ok(Self {
            provider,
            config,
            keys,
            directory: DigestDirectory::new(),
            well_known: WellKnownCache::default(),
            flags,
            cache: VariableCache::new(),
            scratch,
            keyed_on: None,
            fixup: None,
            pending: None,
            checksum_delete_used: false,
            origin: None,
        })
    }

    /// Build the context from the backing store and reconcile the replay state.
    ///
    /// In recovery mode an unverifiable or missing checksum is replaced right away, which
    /// writes to `store` and advances both counters.
    pub fn build<S, C, K>(
        store: &mut S,
        counters: &mut C,
        key_source: &mut K,
        provider: P,
        config: GuardConfig,
    ) -> GuardResult<Self>
    where
        S: VariableStore,
        C: ReplayCounters,
        K: RootKeySource,
    {
        let mut root = Zeroizing::new([0u8; ROOT_KEY_SIZE]);
        key_source.derive_root_key(&mut root)?;
        let keys = KeyMaterial::derive(RootKey::new(*root), &provider)?;

        let mut context = Self::with_parts(provider, config, Some(keys))?;
        context
            .flags
            .set(ContextFlags::AUTH_FORMAT, store.is_auth_format());
        context.load(store)?;
        context.flags.insert(ContextFlags::CACHE_READY);

        let first = counters.read(CounterId::First)?;
        let second = counters.read(CounterId::Second)?;
        let resolution = {
            let engine =
                integrity_engine(&context.provider, context.keys.as_ref(), context.flags)?;
            let candidates = Candidates::collect(&context.directory);
            reconcile::reconcile(&engine, &context.directory, &candidates, first, second)?
        };

        match resolution {
            Resolution::Active(active) => {
                let mut fixup = PendingFixup::default();
                reconcile::settle(&mut context.directory, &active, &mut fixup);
                context.keyed_on = Some(active.keyed_on);
                if !fixup.is_empty() {
                    log::warn!(
                        "stale generation found: {:?} settlement, {} deletions and {} restores owed",
                        active.settlement,
                        fixup.delete.len(),
                        fixup.restore.len()
                    );
                    context.fixup = Some(fixup);
                }
            }
            Resolution::Fresh => {
                let mut fixup = PendingFixup::default();
                reconcile::clear_fresh(&mut context.directory, &mut fixup);
                if !fixup.is_empty() {
                    log::warn!("dropping data of a first commit that never finished");
                    context.fixup = Some(fixup);
                }
                log::info!("no protected entries yet, starting a fresh store");
            }
            Resolution::Synthesize => context.synthesize_trust_root(store, counters)?,
        }

        context.compact_cache();
        context.refresh_well_known();
        log::info!(
            "context built: {} records, counters ({first}, {second})",
            context.directory.len()
        );
        Ok(context)
    }

    fn load<S: VariableStore>(&mut self, store: &S) -> GuardResult<()> {
        let recovery = self.flags.contains(ContextFlags::RECOVERY_MODE);
        let mut checksum_copies = [0usize; 2];
        let mut cursor = None;

        while let Some(entry) = store.get_next(cursor)? {
            if cursor.is_some_and(|cursor| entry.position <= cursor) {
                log::error!("store enumeration went backwards at {}", entry.position);
                return Err(GuardError::VolumeCorrupted("store enumeration"));
            }
            cursor = Some(entry.position);

            let copies = match entry.state {
                EntryState::Deleted => continue,
                EntryState::Added => &mut checksum_copies[0],
                EntryState::InDeleteTransition => &mut checksum_copies[1],
            };
            if is_checksum_entry(&entry.name, &entry.namespace) {
                *copies += 1;
                if *copies > 1 && !recovery {
                    log::error!("two checksum generations in state {:?}", entry.state);
                    return Err(GuardError::VolumeCorrupted("duplicate checksum generation"));
                }
            }

            let record = self.record_from_store(entry)?;
            self.directory.insert(record);
        }
        Ok(())
    }

    fn record_from_store(&mut self, entry: StoredEntry) -> GuardResult<DigestRecord> {
        let state = RecordState::from(entry.state);
        if self.config.is_library_managed(&entry.name, &entry.namespace) {
            let mut record = library_record(
                entry.name,
                entry.namespace,
                entry.attributes,
                entry.data,
                entry.auth,
                state,
            );
            record.position = Some(entry.position);
            return Ok(record);
        }

        let engine = integrity_engine(&self.provider, self.keys.as_ref(), self.flags)?;
        let digest = engine.digest_stored(&entry)?;
        let encrypted = entry.attributes.contains(Attributes::ENCRYPTED_PAYLOAD);
        let plain_size = if encrypted {
            cipher::plaintext_size(&entry.data)?
        } else {
            entry.data.len()
        };
        log::trace!("{} digested at {}", entry.name, entry.position);

        let mut record = DigestRecord::new(
            entry.name,
            entry.namespace,
            entry.attributes,
            DigestSlot::Mac(digest),
            state,
        );
        record.flags = RecordFlags::PROTECTED | RecordFlags::VALID;
        record.flags.set(RecordFlags::ENCRYPTED, encrypted);
        record.plain_size = plain_size;
        record.stored_size = entry.data.len();
        record.position = Some(entry.position);
        record.auth = entry.auth;
        record.cache = Some(self.cache.store(&entry.data)?);
        Ok(record)
    }

    /// Replace every checksum generation with a fresh one over the current entries.
    fn synthesize_trust_root<S, C>(&mut self, store: &mut S, counters: &mut C) -> GuardResult<()>
    where
        S: VariableStore,
        C: ReplayCounters,
    {
        if !self.config.may_advance_counters() {
            return Err(GuardError::Unsupported);
        }

        let mut stale = PendingFixup::default();
        reconcile::roll_forward(&mut self.directory, &mut stale);
        if let Some(id) = self.directory.find(&checksum_entry_name(), &CHECKSUM_NAMESPACE) {
            self.directory.remove(id);
        }
        // Every live checksum copy goes, including duplicates the directory never linked.
        let mut cursor = None;
        while let Some(entry) = store.get_next(cursor)? {
            cursor = Some(entry.position);
            if entry.state.is_live() && is_checksum_entry(&entry.name, &entry.namespace) {
                stale.delete.push(entry.position);
            }
        }
        stale.delete.sort();
        stale.delete.dedup();
        for position in &stale.delete {
            store.raw_update_state(*position, EntryState::Deleted)?;
        }

        let mut first = counters.read(CounterId::First)?;
        let mut second = counters.read(CounterId::Second)?;
        while second < first {
            counters.advance(CounterId::Second)?;
            second += 1;
        }
        while first < second {
            counters.advance(CounterId::First)?;
            first += 1;
        }
        counters.advance(CounterId::First)?;
        let candidate = second.checked_add(1).ok_or(GuardError::DeviceError)?;

        let entry = {
            let engine = integrity_engine(&self.provider, self.keys.as_ref(), self.flags)?;
            engine.refresh_checksum(&self.directory, candidate)?
        };
        let position = store.write(core::slice::from_ref(&entry))?;
        counters.advance(CounterId::Second)?;

        let mut record = library_record(
            entry.name,
            entry.namespace,
            entry.attributes,
            entry.data,
            entry.auth,
            RecordState::Added,
        );
        record.position = Some(position);
        self.directory.insert(record);
        self.keyed_on = Some(candidate);
        log::warn!(
            "new trust root synthesized at {position}, {} stale entries dropped, counters at {candidate}",
            stale.delete.len()
        );
        Ok(())
    }

    pub(crate) fn refresh_well_known(&mut self) {
        self.well_known = WellKnownCache::collect(&self.directory, &self.config);
    }

    /// Drop cache windows no longer referenced by any record.
    pub fn compact_cache(&mut self) {
        let slots = self
            .directory
            .records_mut()
            .filter_map(|record| record.cache.as_mut());
        self.cache.compact(slots);
    }

    pub fn directory(&self) -> &DigestDirectory {
        &self.directory
    }

    pub fn flags(&self) -> ContextFlags {
        self.flags
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn well_known(&self) -> &WellKnownCache {
        &self.well_known
    }

    pub fn cache(&self) -> &VariableCache {
        &self.cache
    }

    pub fn has_keys(&self) -> bool {
        self.keys.is_some()
    }

    /// Counter value the active checksum is bound to, `None` before the first commit.
    pub fn keyed_on(&self) -> Option<u32> {
        self.keyed_on
    }

    /// Store writes the next write-init still has to settle.
    pub fn pending_fixup(&self) -> Option<&PendingFixup> {
        self.fixup.as_ref()
    }

    /// Base the context was adopted at, `None` for a context built from the store.
    pub fn origin(&self) -> Option<u64> {
        self.origin
    }

    /// Active checksum record, if any.
    pub fn active_checksum(&self) -> Option<&DigestRecord> {
        self.well_known
            .record(WellKnown::ChecksumAdded)
            .and_then(|id| self.directory.get(id))
    }
}
