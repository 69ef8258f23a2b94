//! Verified reads and enumeration.
use alloc::borrow::Cow;
use alloc::vec::Vec;

use shared::{
    Attributes, GuardError, GuardResult, Namespace, StorePosition, VariableName, VariableStore,
};
use zeroize::{Zeroize, Zeroizing};

use crate::cipher::ConfidentialityEngine;
use crate::context::{ProtectedContext, integrity_engine};
use crate::crypto::CryptoProvider;
use crate::directory::{DigestRecord, DirectoryView, RecordId, RecordState};

/// Public description of one committed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: VariableName,
    pub namespace: Namespace,
    /// Attributes as declared by the writer.
    pub attributes: Attributes,
    /// Plaintext size in bytes.
    pub size: usize,
    pub position: StorePosition,
    pub protected: bool,
    pub encrypted: bool,
}

impl EntryInfo {
    fn of(record: &DigestRecord) -> Option<Self> {
        Some(Self {
            name: record.name.clone(),
            namespace: record.namespace,
            attributes: record.attributes.declared(),
            size: record.plain_size,
            position: record.position?,
            protected: record.is_protected(),
            encrypted: record.is_encrypted(),
        })
    }
}

impl<P: CryptoProvider> ProtectedContext<P> {
    fn committed(&self, name: &VariableName, namespace: &Namespace) -> GuardResult<RecordId> {
        let id = self
            .directory
            .find(name, namespace)
            .ok_or(GuardError::NotFound)?;
        let record = self.directory.get(id).ok_or(GuardError::NotFound)?;
        if record.state != RecordState::Added {
            return Err(GuardError::NotFound);
        }
        if record.position.is_none() {
            return Err(GuardError::NotReady);
        }
        Ok(id)
    }

    /// Read and verify one entry, returning its plaintext.
    pub fn read<S: VariableStore>(
        &mut self,
        store: &S,
        name: &VariableName,
        namespace: &Namespace,
    ) -> GuardResult<Zeroizing<Vec<u8>>> {
        let id = self.committed(name, namespace)?;
        self.load_plaintext(store, id)?;
        Ok(Zeroizing::new(self.scratch.to_vec()))
    }

    /// Read and verify one entry into `output`, returning the plaintext length.
    ///
    /// `BufferTooSmall` reports the required size without touching `output`.
    pub fn read_into<S: VariableStore>(
        &mut self,
        store: &S,
        name: &VariableName,
        namespace: &Namespace,
        output: &mut [u8],
    ) -> GuardResult<usize> {
        let id = self.committed(name, namespace)?;
        let required = self
            .directory
            .get(id)
            .map_or(0, |record| record.plain_size);
        if output.len() < required {
            return Err(GuardError::BufferTooSmall { required });
        }
        let len = self.load_plaintext(store, id)?;
        output[..len].copy_from_slice(&self.scratch[..len]);
        Ok(len)
    }

    /// Verify `id` and leave its plaintext in the scratch buffer.
    fn load_plaintext<S: VariableStore>(&mut self, store: &S, id: RecordId) -> GuardResult<usize> {
        let record = self.directory.get(id).ok_or(GuardError::NotFound)?;
        self.scratch.zeroize();

        if let Some(value) = record.slot.cached() {
            self.scratch.extend_from_slice(value);
            return Ok(value.len());
        }

        let cached = record.cache.as_ref().and_then(|slot| self.cache.get(slot));
        let Some(keys) = self.keys.as_ref() else {
            // Only the cache handed over by the verifying stage is trusted without keys.
            let Some(stored) = cached.filter(|_| !record.is_encrypted()) else {
                return Err(GuardError::Unsupported);
            };
            self.scratch.extend_from_slice(stored);
            return Ok(stored.len());
        };

        let stored: Cow<'_, [u8]> = match cached {
            Some(bytes) => Cow::Borrowed(bytes),
            None => {
                log::debug!("{} not cached, reading from the store", record.name);
                let position = record.position.ok_or(GuardError::NotReady)?;
                let entry = store.get_by_name(&record.name, &record.namespace)?;
                if entry.position == position {
                    Cow::Owned(entry.data)
                } else {
                    // An unsettled twin is live under the same name.
                    Cow::Owned(store.get(position)?.data)
                }
            }
        };

        let engine = integrity_engine(&self.provider, Some(keys), self.flags)?;
        let recomputed = engine.digest_record(record, &stored)?;
        engine.verify(record, &recomputed)?;

        let cipher = ConfidentialityEngine::new(&self.provider, self.config.algorithm());
        match cipher.decrypt_record(record, &stored, &keys.root, &mut self.scratch) {
            Err(GuardError::Unsupported) => {
                self.scratch.extend_from_slice(&stored);
                Ok(stored.len())
            }
            result => result,
        }
    }

    pub fn entry_info(&self, name: &VariableName, namespace: &Namespace) -> GuardResult<EntryInfo> {
        let id = self.committed(name, namespace)?;
        self.directory
            .get(id)
            .and_then(EntryInfo::of)
            .ok_or(GuardError::NotFound)
    }

    /// Committed entry with the smallest store position after `cursor`.
    ///
    /// Library-managed entries are skipped unless `include_library` is set.
    pub fn next_entry(
        &self,
        cursor: Option<StorePosition>,
        include_library: bool,
    ) -> Option<EntryInfo> {
        self.directory
            .view(DirectoryView::Committed)
            .filter(|record| include_library || record.is_protected())
            .filter_map(EntryInfo::of)
            .filter(|info| cursor.is_none_or(|cursor| info.position > cursor))
            .min_by_key(|info| info.position)
    }

    /// Committed entries in store order.
    pub fn entries(&self, include_library: bool) -> impl Iterator<Item = EntryInfo> + '_ {
        let mut cursor = None;
        core::iter::from_fn(move || {
            let next = self.next_entry(cursor, include_library)?;
            cursor = Some(next.position);
            Some(next)
        })
    }

    /// Re-verify every committed protected entry and the active checksum.
    ///
    /// Returns the number of entries verified.
    pub fn verify_all<S: VariableStore>(&mut self, store: &S) -> GuardResult<usize> {
        if self.pending.is_some() {
            return Err(GuardError::NotReady);
        }
        if self.keys.is_none() {
            return Err(GuardError::Unsupported);
        }

        let protected: Vec<RecordId> = self
            .directory
            .iter()
            .filter(|(_, record)| record.state == RecordState::Added && record.is_protected())
            .map(|(id, _)| id)
            .collect();
        for id in &protected {
            self.load_plaintext(store, *id)?;
        }
        self.scratch.zeroize();

        let engine = integrity_engine(&self.provider, self.keys.as_ref(), self.flags)?;
        if !engine.is_recovery() {
            match (self.keyed_on, self.active_checksum()) {
                (Some(counter), Some(checksum)) => {
                    let value = checksum.slot.cached().unwrap_or_default();
                    if !engine.checksum_matches(
                        &self.directory,
                        DirectoryView::Committed,
                        counter,
                        value,
                    )? {
                        log::error!("aggregate checksum no longer matches the directory");
                        return Err(GuardError::CompromisedData("aggregate checksum mismatch"));
                    }
                }
                (None, None) if protected.is_empty() => {}
                _ => return Err(GuardError::CompromisedData("checksum entry missing")),
            }
        }
        log::info!("{} protected entries verified", protected.len());
        Ok(protected.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherHeader;
    use crate::config::GuardConfig;
    use crate::crypto::RustCryptoProvider;
    use crate::pipeline::UpdateRequest;
    use shared::memory::{FixedRootKey, MemoryCounters, MemoryStore};
    use uuid::Uuid;

    const NS: Namespace = Uuid::from_u128(0x51);

    fn attrs() -> Attributes {
        Attributes::NON_VOLATILE | Attributes::BOOTSERVICE_ACCESS
    }

    fn ready(
        store: &mut MemoryStore,
        counters: &mut MemoryCounters,
        config: GuardConfig,
    ) -> ProtectedContext {
        let mut context = ProtectedContext::build(
            store,
            counters,
            &mut FixedRootKey::new([9; 32]),
            RustCryptoProvider,
            config,
        )
        .unwrap();
        context.write_init(store, counters).unwrap();
        context
    }

    #[test]
    fn read_returns_plaintext_of_encrypted_entry() {
        let mut store = MemoryStore::default();
        let mut counters = MemoryCounters::new(0, 0);
        let mut context = ready(&mut store, &mut counters, GuardConfig::default());
        let name = VariableName::from("BootOrder");
        context
            .commit(
                &mut store,
                &mut counters,
                UpdateRequest::write(name.clone(), NS, attrs(), *b"\x01\x00\x02\x00"),
            )
            .unwrap();

        let value = context.read(&store, &name, &NS).unwrap();
        assert_eq!(value.as_slice(), b"\x01\x00\x02\x00");

        let info = context.entry_info(&name, &NS).unwrap();
        assert!(info.protected && info.encrypted);
        assert_eq!(info.size, 4);
        assert_eq!(info.attributes, attrs());

        let stored = store.get(info.position).unwrap();
        assert!(stored.attributes.contains(Attributes::ENCRYPTED_PAYLOAD));
        assert_ne!(stored.data.as_slice(), b"\x01\x00\x02\x00");
    }

    #[test]
    fn read_into_reports_required_size() {
        let mut store = MemoryStore::default();
        let mut counters = MemoryCounters::new(0, 0);
        let mut context = ready(
            &mut store,
            &mut counters,
            GuardConfig::default().with_confidentiality(false),
        );
        let name = VariableName::from("Timeout");
        context
            .commit(&mut store, &mut counters, UpdateRequest::write(name.clone(), NS, attrs(), *b"0005"))
            .unwrap();

        let mut small = [0u8; 2];
        assert_eq!(
            context.read_into(&store, &name, &NS, &mut small),
            Err(GuardError::BufferTooSmall { required: 4 })
        );
        let mut exact = [0u8; 8];
        assert_eq!(context.read_into(&store, &name, &NS, &mut exact), Ok(4));
        assert_eq!(&exact[..4], b"0005");
    }

    #[test]
    fn tampered_cache_is_detected() {
        let mut store = MemoryStore::default();
        let mut counters = MemoryCounters::new(0, 0);
        let mut context = ready(&mut store, &mut counters, GuardConfig::default());
        let name = VariableName::from("Key");
        context
            .commit(&mut store, &mut counters, UpdateRequest::write(name.clone(), NS, attrs(), *b"secret"))
            .unwrap();

        let slot = context
            .directory
            .find(&name, &NS)
            .and_then(|id| context.directory.get(id))
            .and_then(|record| record.cache)
            .unwrap();
        context.cache.get_mut(&slot).unwrap()[CipherHeader::ENCODED_LEN] ^= 0x01;

        assert!(matches!(
            context.read(&store, &name, &NS),
            Err(GuardError::CompromisedData(_))
        ));
        assert!(matches!(
            context.verify_all(&store),
            Err(GuardError::CompromisedData(_))
        ));
    }

    #[test]
    fn enumeration_follows_store_order_and_hides_library_entries() {
        let mut store = MemoryStore::default();
        let mut counters = MemoryCounters::new(0, 0);
        let mut context = ready(&mut store, &mut counters, GuardConfig::default());
        for name in ["zeta", "alpha", "mid"] {
            context
                .commit(&mut store, &mut counters, UpdateRequest::write(name, NS, attrs(), *b"v"))
                .unwrap();
        }

        let names: Vec<_> = context
            .entries(false)
            .map(|info| info.name.display().into_owned())
            .collect();
        assert_eq!(names, ["zeta", "alpha", "mid"]);

        let with_library = context.entries(true).count();
        assert_eq!(with_library, 4);
        assert_eq!(context.verify_all(&store), Ok(3));
    }

    fn evict(context: &mut ProtectedContext, name: &VariableName) {
        let id = context.directory.find(name, &NS).unwrap();
        let record = context.directory.get_mut(id).unwrap();
        let slot = record.cache.take().unwrap();
        context.cache.release(slot);
    }

    #[test]
    fn uncached_read_is_verified_against_the_store() {
        let mut store = MemoryStore::default();
        let mut counters = MemoryCounters::new(0, 0);
        let mut context = ready(
            &mut store,
            &mut counters,
            GuardConfig::default().with_confidentiality(false),
        );
        let name = VariableName::from("Lang");
        context
            .commit(&mut store, &mut counters, UpdateRequest::write(name.clone(), NS, attrs(), *b"eng"))
            .unwrap();
        evict(&mut context, &name);

        assert_eq!(context.read(&store, &name, &NS).unwrap().as_slice(), b"eng");

        let position = context.entry_info(&name, &NS).unwrap().position;
        store.tamper(position, 1).unwrap();
        assert!(matches!(
            context.read(&store, &name, &NS),
            Err(GuardError::CompromisedData(_))
        ));
    }

    #[test]
    fn keyless_stage_reads_only_handed_over_cache() {
        let mut store = MemoryStore::default();
        let mut counters = MemoryCounters::new(0, 0);
        let config = GuardConfig::default().with_confidentiality(false);
        let mut context = ready(&mut store, &mut counters, config.clone());
        let name = VariableName::from("Timeout");
        context
            .commit(&mut store, &mut counters, UpdateRequest::write(name.clone(), NS, attrs(), *b"0005"))
            .unwrap();
        let mut blob = context.capture(0).unwrap();
        blob.scrub_secrets().unwrap();

        let mut adopted = ProtectedContext::adopt(&blob, 0, RustCryptoProvider, config).unwrap();
        assert!(!adopted.has_keys());
        assert_eq!(adopted.read(&store, &name, &NS).unwrap().as_slice(), b"0005");

        // Without keys the store copy cannot be verified.
        evict(&mut adopted, &name);
        let position = adopted.entry_info(&name, &NS).unwrap().position;
        store.tamper(position, 0).unwrap();
        assert_eq!(
            adopted.read(&store, &name, &NS).err(),
            Some(GuardError::Unsupported)
        );
        assert!(adopted.scratch.is_empty());
    }

    #[test]
    fn missing_and_pending_entries() {
        let mut store = MemoryStore::default();
        let mut counters = MemoryCounters::new(0, 0);
        let mut context = ready(&mut store, &mut counters, GuardConfig::default());
        let name = VariableName::from("Fresh");

        assert_eq!(context.read(&store, &name, &NS).err(), Some(GuardError::NotFound));

        context
            .update(&mut store, &mut counters, UpdateRequest::write(name.clone(), NS, attrs(), *b"v"))
            .unwrap();
        assert_eq!(context.read(&store, &name, &NS).err(), Some(GuardError::NotReady));
        assert_eq!(context.verify_all(&store), Err(GuardError::NotReady));
    }
}
