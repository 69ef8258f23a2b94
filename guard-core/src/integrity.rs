//! Per-entry digests and the aggregate checksum over them.
//!
//! Field encoding of an entry digest, all integers little-endian:
//!
//! ```text
//! SEP ‖ name_len:u32 ‖ name
//! SEP ‖ namespace (mixed-endian GUID) ‖ attributes:u32 ‖ payload_len:u32
//! SEP ‖ payload
//! SEP ‖ key_index:u32 ‖ monotonic_count:u64 ‖ timestamp[16]
//! ```
//!
//! The payload is whatever the store holds, so encrypted entries are covered in their
//! ciphertext form. The aggregate is `HMAC(digest_1 ‖ … ‖ digest_n ‖ counter:u32)` over the
//! protected records of one directory view, in directory order.
use alloc::vec::Vec;

use shared::variable::namespace_bytes;
use shared::wellknown::{CHECKSUM_NAMESPACE, checksum_entry_name};
use shared::{
    Attributes, AuthInfo, GuardError, GuardResult, Namespace, NewEntry, StoredEntry, VariableName,
};

use crate::crypto::{CryptoProvider, Digest, MacKey, MacSession};
use crate::directory::{DigestDirectory, DigestRecord, DirectoryView, RecordFlags};

/// Byte written between digest field groups.
pub const FIELD_SEPARATOR: u8 = 0x1E;

pub struct IntegrityEngine<'a, P> {
    provider: &'a P,
    key: &'a MacKey,
    auth_format: bool,
    recovery: bool,
}

impl<'a, P: CryptoProvider> IntegrityEngine<'a, P> {
    pub fn new(provider: &'a P, key: &'a MacKey) -> Self {
        Self {
            provider,
            key,
            auth_format: true,
            recovery: false,
        }
    }

    /// Whether auxiliary authenticated fields are folded in as stored.
    ///
    /// Without the authenticated store format they are always replaced by
    /// [`AuthInfo::SENTINEL`].
    pub fn with_auth_format(mut self, auth_format: bool) -> Self {
        self.auth_format = auth_format;
        self
    }

    pub fn with_recovery(mut self, recovery: bool) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn is_recovery(&self) -> bool {
        self.recovery
    }

    pub fn digest_of(
        &self,
        name: &VariableName,
        namespace: &Namespace,
        attributes: Attributes,
        payload: &[u8],
        auth: Option<&AuthInfo>,
    ) -> GuardResult<Digest> {
        let name_len =
            u32::try_from(name.len()).map_err(|_| GuardError::InvalidParameter("name length"))?;
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| GuardError::InvalidParameter("payload length"))?;
        let aux = match auth {
            Some(auth) if self.auth_format => *auth,
            _ => AuthInfo::SENTINEL,
        };

        let mut session = self.provider.mac_session(self.key.as_bytes())?;
        session.update(&[FIELD_SEPARATOR]);
        session.update(&name_len.to_le_bytes());
        session.update(name.as_bytes());
        session.update(&[FIELD_SEPARATOR]);
        session.update(&namespace_bytes(namespace));
        session.update(&attributes.bits().to_le_bytes());
        session.update(&payload_len.to_le_bytes());
        session.update(&[FIELD_SEPARATOR]);
        session.update(payload);
        session.update(&[FIELD_SEPARATOR]);
        session.update(&aux.key_index.to_le_bytes());
        session.update(&aux.monotonic_count.to_le_bytes());
        session.update(&aux.timestamp);
        Ok(session.finalize())
    }

    pub fn digest_stored(&self, entry: &StoredEntry) -> GuardResult<Digest> {
        self.digest_of(
            &entry.name,
            &entry.namespace,
            entry.attributes,
            &entry.data,
            entry.auth.as_ref(),
        )
    }

    pub fn digest_new(&self, entry: &NewEntry) -> GuardResult<Digest> {
        self.digest_of(
            &entry.name,
            &entry.namespace,
            entry.attributes,
            &entry.data,
            entry.auth.as_ref(),
        )
    }

    /// Digest of `record` recomputed over the stored bytes `payload`.
    pub fn digest_record(&self, record: &DigestRecord, payload: &[u8]) -> GuardResult<Digest> {
        self.digest_of(
            &record.name,
            &record.namespace,
            record.attributes,
            payload,
            record.auth.as_ref(),
        )
    }

    /// Compare a recomputed digest with the one held by `record`.
    ///
    /// Always succeeds in recovery mode and for unprotected records.
    pub fn verify(&self, record: &DigestRecord, recomputed: &Digest) -> GuardResult<()> {
        if self.recovery || !record.is_protected() {
            return Ok(());
        }
        match record.slot.digest() {
            Some(digest) if digest.ct_matches(recomputed.as_bytes()) => Ok(()),
            _ => {
                log::error!("digest mismatch on {}", record.name);
                Err(GuardError::CompromisedData("entry digest mismatch"))
            }
        }
    }

    /// Aggregate MAC over the protected, valid records of `view`, bound to `counter`.
    pub fn aggregate(
        &self,
        directory: &DigestDirectory,
        view: DirectoryView,
        counter: u32,
    ) -> GuardResult<Digest> {
        let mut session = self.provider.mac_session(self.key.as_bytes())?;
        let mut covered = 0usize;
        for record in directory.view(view) {
            if !record
                .flags
                .contains(RecordFlags::PROTECTED | RecordFlags::VALID)
            {
                continue;
            }
            if let Some(digest) = record.slot.digest() {
                session.update(digest.as_bytes());
                covered += 1;
            }
        }
        session.update(&counter.to_le_bytes());
        log::trace!("aggregate over {covered} records keyed on {counter}");
        Ok(session.finalize())
    }

    /// Whether `stored` is the aggregate of `view` keyed on `counter`.
    pub fn checksum_matches(
        &self,
        directory: &DigestDirectory,
        view: DirectoryView,
        counter: u32,
        stored: &[u8],
    ) -> GuardResult<bool> {
        Ok(self.aggregate(directory, view, counter)?.ct_matches(stored))
    }

    /// New checksum entry over the committed view, keyed on the candidate `Counter-2 + 1`.
    pub fn refresh_checksum(
        &self,
        directory: &DigestDirectory,
        candidate: u32,
    ) -> GuardResult<NewEntry> {
        let digest = self.aggregate(directory, DirectoryView::Committed, candidate)?;
        Ok(checksum_entry(digest))
    }
}

/// Checksum entry carrying `digest`.
pub fn checksum_entry(digest: Digest) -> NewEntry {
    let mut data = Vec::with_capacity(digest.as_bytes().len());
    data.extend_from_slice(digest.as_bytes());
    NewEntry {
        attributes: Attributes::LIBRARY_MANAGED,
        namespace: CHECKSUM_NAMESPACE,
        name: checksum_entry_name(),
        data,
        auth: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RustCryptoProvider;
    use crate::directory::{DigestSlot, RecordState};
    use uuid::Uuid;

    fn key() -> MacKey {
        MacKey::new([0x33; 32])
    }

    fn digest(engine: &IntegrityEngine<'_, RustCryptoProvider>, payload: &[u8]) -> Digest {
        engine
            .digest_of(
                &VariableName::from("k1"),
                &Uuid::from_u128(1),
                Attributes::NON_VOLATILE,
                payload,
                None,
            )
            .unwrap()
    }

    fn protected(name: &str, engine: &IntegrityEngine<'_, RustCryptoProvider>) -> DigestRecord {
        let payload = name.as_bytes();
        let mut record = DigestRecord::new(
            VariableName::from(name),
            Uuid::from_u128(1),
            Attributes::NON_VOLATILE,
            DigestSlot::Mac(digest(engine, payload)),
            RecordState::Added,
        );
        record.flags = RecordFlags::PROTECTED | RecordFlags::VALID;
        record
    }

    #[test]
    fn digest_is_deterministic_and_field_sensitive() {
        let provider = RustCryptoProvider;
        let key = key();
        let engine = IntegrityEngine::new(&provider, &key);

        let base = digest(&engine, b"v1");
        assert_eq!(base, digest(&engine, b"v1"));
        assert_ne!(base, digest(&engine, b"v2"));

        let renamed = engine
            .digest_of(
                &VariableName::from("k2"),
                &Uuid::from_u128(1),
                Attributes::NON_VOLATILE,
                b"v1",
                None,
            )
            .unwrap();
        let reattributed = engine
            .digest_of(
                &VariableName::from("k1"),
                &Uuid::from_u128(1),
                Attributes::NON_VOLATILE | Attributes::RUNTIME_ACCESS,
                b"v1",
                None,
            )
            .unwrap();
        assert_ne!(base, renamed);
        assert_ne!(base, reattributed);
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let provider = RustCryptoProvider;
        let key = key();
        let engine = IntegrityEngine::new(&provider, &key);
        let ns = Uuid::from_u128(1);

        let left = engine
            .digest_of(&VariableName::from("ab"), &ns, Attributes::empty(), b"c", None)
            .unwrap();
        let right = engine
            .digest_of(&VariableName::from("a"), &ns, Attributes::empty(), b"bc", None)
            .unwrap();
        assert_ne!(left, right);
    }

    #[test]
    fn auth_fields_count_only_in_auth_format() {
        let provider = RustCryptoProvider;
        let key = key();
        let auth = AuthInfo {
            key_index: 3,
            monotonic_count: 9,
            timestamp: [1; 16],
        };
        let name = VariableName::from("k1");
        let ns = Uuid::from_u128(1);

        let auth_engine = IntegrityEngine::new(&provider, &key);
        let with = auth_engine
            .digest_of(&name, &ns, Attributes::NON_VOLATILE, b"v", Some(&auth))
            .unwrap();
        let without = auth_engine
            .digest_of(&name, &ns, Attributes::NON_VOLATILE, b"v", None)
            .unwrap();
        assert_ne!(with, without);

        let plain_engine = IntegrityEngine::new(&provider, &key).with_auth_format(false);
        let ignored = plain_engine
            .digest_of(&name, &ns, Attributes::NON_VOLATILE, b"v", Some(&auth))
            .unwrap();
        assert_eq!(ignored, without);
    }

    #[test]
    fn verify_rejects_mismatch_unless_skipped() {
        let provider = RustCryptoProvider;
        let key = key();
        let engine = IntegrityEngine::new(&provider, &key);
        let record = protected("k1", &engine);
        let wrong = Digest::from_bytes([0; 32]);

        assert!(matches!(
            engine.verify(&record, &wrong),
            Err(GuardError::CompromisedData(_))
        ));
        assert!(
            IntegrityEngine::new(&provider, &key)
                .with_recovery(true)
                .verify(&record, &wrong)
                .is_ok()
        );

        let mut unprotected = record.clone();
        unprotected.flags = RecordFlags::empty();
        assert!(engine.verify(&unprotected, &wrong).is_ok());
    }

    #[test]
    fn aggregate_tracks_counter_and_membership() {
        let provider = RustCryptoProvider;
        let key = key();
        let engine = IntegrityEngine::new(&provider, &key);
        let mut directory = DigestDirectory::new();
        directory.insert(protected("a", &engine));

        let first = engine
            .aggregate(&directory, DirectoryView::Committed, 1)
            .unwrap();
        assert_ne!(
            first,
            engine
                .aggregate(&directory, DirectoryView::Committed, 2)
                .unwrap()
        );

        let mut unprotected = protected("b", &engine);
        unprotected.flags = RecordFlags::empty();
        directory.insert(unprotected);
        assert_eq!(
            first,
            engine
                .aggregate(&directory, DirectoryView::Committed, 1)
                .unwrap()
        );

        directory.insert(protected("c", &engine));
        let entry = engine.refresh_checksum(&directory, 1).unwrap();
        assert_ne!(entry.data, first.as_bytes().to_vec());
        assert!(
            engine
                .checksum_matches(&directory, DirectoryView::Committed, 1, &entry.data)
                .unwrap()
        );
    }
}
