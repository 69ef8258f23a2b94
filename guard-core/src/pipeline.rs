//! Write-init / update / write-final commit protocol.
//!
//! ```text
//! Uninitialized --write_init--> Ready --update--> Updating --write_final--> Ready
//!                                          \--abandon--/
//! ```
//!
//! `update` leaves the store with the previous checksum generation and the superseded
//! entry marked `InDeleteTransition` and hands back one batch, checksum entry first, that
//! the caller appends with a single [`VariableStore::write`]. Until `write_final` runs,
//! [`crate::reconcile`] can resolve a crash either way.
use alloc::vec::Vec;

use shared::variable::record_size;
use shared::wellknown::{CHECKSUM_ENTRY_NAME, WellKnown, is_checksum_entry};
use shared::{
    Attributes, AuthInfo, CounterId, DIGEST_SIZE, EntryState, GuardError, GuardResult, Namespace,
    NewEntry, ReplayCounters, StorePosition, VariableName, VariableStore,
};
use zeroize::Zeroizing;

use crate::cipher::{ConfidentialityEngine, EnvelopeTarget, derive_nonce};
use crate::context::{ContextFlags, ProtectedContext, integrity_engine, library_record};
use crate::crypto::CryptoProvider;
use crate::directory::{DigestRecord, DigestSlot, RecordFlags, RecordId, RecordState};
use crate::reconcile::{CounterRelation, PendingFixup};

/// Externally visible phase of the commit protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPhase {
    Uninitialized,
    Ready,
    /// A batch was handed out and awaits `write_final` or `abandon`.
    Updating,
}

/// One write or deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub name: VariableName,
    pub namespace: Namespace,
    pub attributes: Attributes,
    /// `None` deletes the entry.
    pub value: Option<Vec<u8>>,
    pub auth: Option<AuthInfo>,
}

impl UpdateRequest {
    pub fn write(
        name: impl Into<VariableName>,
        namespace: Namespace,
        attributes: Attributes,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace,
            attributes,
            value: Some(value.into()),
            auth: None,
        }
    }

    pub fn delete(name: impl Into<VariableName>, namespace: Namespace) -> Self {
        Self {
            name: name.into(),
            namespace,
            attributes: Attributes::empty(),
            value: None,
            auth: None,
        }
    }

    pub fn with_auth(mut self, auth: AuthInfo) -> Self {
        self.auth = Some(auth);
        self
    }

    fn validate(&self) -> GuardResult<()> {
        if self.name.is_empty() {
            return Err(GuardError::InvalidParameter("empty name"));
        }
        if self.value.as_ref().is_some_and(|value| value.is_empty()) {
            return Err(GuardError::InvalidParameter("empty value"));
        }
        if self.attributes.contains(Attributes::ENCRYPTED_PAYLOAD) {
            return Err(GuardError::InvalidParameter("reserved attribute"));
        }
        Ok(())
    }
}

/// Entries to append in one write: the checksum entry, then the data entry if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitBatch {
    pub entries: Vec<NewEntry>,
}

impl CommitBatch {
    pub fn checksum(&self) -> Option<&NewEntry> {
        self.entries.first()
    }

    pub fn data(&self) -> Option<&NewEntry> {
        self.entries.get(1)
    }

    /// Bytes the batch occupies in the store.
    pub fn record_size(&self) -> usize {
        self.entries.iter().map(NewEntry::record_size).sum()
    }
}

/// State of the batch between `update` and `write_final`.
#[derive(Debug)]
pub(crate) struct PendingCommit {
    checksum: RecordId,
    checksum_size: usize,
    data: Option<RecordId>,
    deleted: Option<RecordId>,
    stored: Option<Zeroizing<Vec<u8>>>,
    /// Store positions flipped to `InDeleteTransition`, in the order they were marked.
    marked: Vec<StorePosition>,
    candidate: u32,
    consumed_checksum_delete: bool,
}

/// Size of a checksum entry in the store.
const CHECKSUM_RECORD_SIZE: usize = record_size(CHECKSUM_ENTRY_NAME.len(), DIGEST_SIZE);

impl<P: CryptoProvider> ProtectedContext<P> {
    pub fn phase(&self) -> CommitPhase {
        if self.pending.is_some() {
            CommitPhase::Updating
        } else if self.flags.contains(ContextFlags::WRITE_READY) {
            CommitPhase::Ready
        } else {
            CommitPhase::Uninitialized
        }
    }

    /// Prepare the stage for writing; a no-op once done in this boot.
    ///
    /// Settles whatever the last reconciliation left owing (advancing `Counter-2`, deleting
    /// stale generations, restoring rolled-back ones) and arms `Counter-1`.
    pub fn write_init<S, C>(&mut self, store: &mut S, counters: &mut C) -> GuardResult<()>
    where
        S: VariableStore,
        C: ReplayCounters,
    {
        if self.keys.is_none() {
            return Err(GuardError::AccessDenied);
        }
        if self.flags.contains(ContextFlags::WRITE_INIT_DONE) {
            log::debug!("write-init already done");
            return Ok(());
        }

        self.settle_fixup(store, counters)?;
        self.arm(counters)?;
        self.flags
            .insert(ContextFlags::WRITE_INIT_DONE | ContextFlags::WRITE_READY);
        log::info!("write-init done");
        Ok(())
    }

    /// Apply the store writes owed by the last reconciliation or an interrupted write-final.
    ///
    /// Whatever could not be applied stays owed.
    fn settle_fixup<S, C>(&mut self, store: &mut S, counters: &mut C) -> GuardResult<()>
    where
        S: VariableStore,
        C: ReplayCounters,
    {
        let Some(mut fixup) = self.fixup.take() else {
            return Ok(());
        };

        if fixup.advance_second {
            if !self.config.may_advance_counters() {
                self.fixup = Some(fixup);
                return Err(GuardError::Unsupported);
            }
            if let Err(err) = counters.advance(CounterId::Second) {
                self.fixup = Some(fixup);
                return Err(err);
            }
            fixup.advance_second = false;
            log::warn!("rolled forward an unfinished commit");
        }
        while let Some(&position) = fixup.delete.first() {
            if let Err(err) = store.raw_update_state(position, EntryState::Deleted) {
                self.fixup = Some(fixup);
                return Err(err);
            }
            fixup.delete.remove(0);
        }
        while let Some(&position) = fixup.restore.first() {
            if let Err(err) = store.raw_update_state(position, EntryState::Added) {
                self.fixup = Some(fixup);
                return Err(err);
            }
            fixup.restore.remove(0);
        }
        log::info!("stale generations settled");
        Ok(())
    }

    /// Advance `Counter-1` when no commit window is open; returns the counter pair.
    fn arm<C: ReplayCounters>(&mut self, counters: &mut C) -> GuardResult<(u32, u32)> {
        let first = counters.read(CounterId::First)?;
        let second = counters.read(CounterId::Second)?;
        match CounterRelation::classify(first, second) {
            CounterRelation::Armed => Ok((first, second)),
            CounterRelation::Equal => {
                if !self.config.may_advance_counters() {
                    return Err(GuardError::Unsupported);
                }
                counters.advance(CounterId::First)?;
                log::debug!("counter-1 armed at {}", first + 1);
                Ok((first + 1, second))
            }
            CounterRelation::Diverged => {
                log::error!("replay counters diverged: ({first}, {second})");
                Err(GuardError::CompromisedData("replay counters diverged"))
            }
        }
    }

    /// Apply `request` to the directory and return the batch to append.
    pub fn update<S, C>(
        &mut self,
        store: &mut S,
        counters: &mut C,
        request: UpdateRequest,
    ) -> GuardResult<CommitBatch>
    where
        S: VariableStore,
        C: ReplayCounters,
    {
        if self.keys.is_none() {
            return Err(GuardError::AccessDenied);
        }
        if self.phase() != CommitPhase::Ready {
            return Err(GuardError::NotReady);
        }
        request.validate()?;
        self.settle_fixup(store, counters)?;

        let checksum_target = is_checksum_entry(&request.name, &request.namespace);
        let library = self
            .config
            .is_library_managed(&request.name, &request.namespace);
        let existing = self
            .directory
            .find(&request.name, &request.namespace)
            .filter(|id| {
                self.directory
                    .get(*id)
                    .is_some_and(|record| record.state == RecordState::Added)
            });

        let mut consumed_checksum_delete = false;
        let superseded = match (&request.value, checksum_target) {
            (Some(_), true) => return Err(GuardError::AccessDenied),
            (None, true) => {
                if self.checksum_delete_used {
                    return Err(GuardError::AccessDenied);
                }
                consumed_checksum_delete = true;
                None
            }
            (None, false) if library => return Err(GuardError::AccessDenied),
            (None, false) => Some(existing.ok_or(GuardError::NotFound)?),
            (Some(_), false) => existing,
        };

        if let (Some(id), Some(_)) = (superseded, &request.value) {
            let declared = self
                .directory
                .get(id)
                .map(|record| record.attributes.declared());
            if declared != Some(request.attributes) {
                return Err(GuardError::InvalidParameter("attribute mismatch"));
            }
        }

        let first = counters.read(CounterId::First)?;
        let second = counters.read(CounterId::Second)?;
        let relation = CounterRelation::classify(first, second);
        if relation == CounterRelation::Diverged {
            log::error!("replay counters diverged: ({first}, {second})");
            return Err(GuardError::CompromisedData("replay counters diverged"));
        }
        let candidate = second.checked_add(1).ok_or(GuardError::DeviceError)?;
        let armed_first = match relation {
            CounterRelation::Equal => candidate,
            _ => first,
        };

        let data = match &request.value {
            Some(value) => {
                Some(self.prepare_entry(&request, value, !library, (armed_first, candidate))?)
            }
            None => None,
        };

        let size = CHECKSUM_RECORD_SIZE
            + data.as_ref().map_or(0, |(entry, _)| entry.record_size());
        let limit = self.config.record_limit(store.max_record_size());
        if size > limit {
            return Err(GuardError::BadBufferSize { size, limit });
        }

        self.arm(counters)?;

        let previous_checksum = self.well_known.record(WellKnown::ChecksumAdded);
        let mut marked = Vec::new();
        for id in [previous_checksum, superseded].into_iter().flatten() {
            let Some(position) = self.directory.get(id).and_then(|record| record.position) else {
                continue;
            };
            if let Err(err) = store.raw_update_state(position, EntryState::InDeleteTransition) {
                for position in marked.iter().rev() {
                    store.raw_update_state(*position, EntryState::Added)?;
                }
                return Err(err);
            }
            marked.push(position);
        }
        for id in [previous_checksum, superseded].into_iter().flatten() {
            if let Some(record) = self.directory.get_mut(id) {
                record.state = RecordState::InDeleteTransition;
            }
        }

        let mut stored = None;
        let mut data_id = None;
        let mut data_entry = None;
        if let Some((entry, record)) = data {
            stored = Some(Zeroizing::new(entry.data.clone()));
            data_id = Some(self.directory.insert(record));
            data_entry = Some(entry);
        }

        let checksum_entry = {
            let engine = integrity_engine(&self.provider, self.keys.as_ref(), self.flags)?;
            engine.refresh_checksum(&self.directory, candidate)?
        };
        let checksum = self.directory.insert(library_record(
            checksum_entry.name.clone(),
            checksum_entry.namespace,
            checksum_entry.attributes,
            checksum_entry.data.clone(),
            None,
            RecordState::Added,
        ));

        let mut entries = Vec::with_capacity(2);
        entries.push(checksum_entry);
        entries.extend(data_entry);

        self.checksum_delete_used |= consumed_checksum_delete;
        self.pending = Some(PendingCommit {
            checksum,
            checksum_size: CHECKSUM_RECORD_SIZE,
            data: data_id,
            deleted: if request.value.is_none() { superseded } else { None },
            stored,
            marked,
            candidate,
            consumed_checksum_delete,
        });
        log::debug!(
            "{} {} staged, checksum keyed on {candidate}",
            request.name,
            if request.value.is_some() { "write" } else { "delete" }
        );
        Ok(CommitBatch { entries })
    }

    /// Build the store entry and its directory record for a write.
    fn prepare_entry(
        &self,
        request: &UpdateRequest,
        value: &[u8],
        protected: bool,
        counters: (u32, u32),
    ) -> GuardResult<(NewEntry, DigestRecord)> {
        let limit = self.config.max_payload_size();
        if value.len() > limit {
            return Err(GuardError::BadBufferSize {
                size: value.len(),
                limit,
            });
        }

        if !protected {
            let entry = NewEntry {
                attributes: request.attributes,
                namespace: request.namespace,
                name: request.name.clone(),
                data: value.to_vec(),
                auth: request.auth,
            };
            let record = library_record(
                entry.name.clone(),
                entry.namespace,
                entry.attributes,
                entry.data.clone(),
                entry.auth,
                RecordState::Added,
            );
            return Ok((entry, record));
        }

        let keys = self.keys.as_ref().ok_or(GuardError::AccessDenied)?;
        let encrypt = self.config.confidentiality();
        let mut attributes = request.attributes;
        let data = if encrypt {
            attributes |= Attributes::ENCRYPTED_PAYLOAD;
            let target = EnvelopeTarget {
                name: &request.name,
                namespace: &request.namespace,
            };
            let nonce = derive_nonce(&self.provider, &keys.mac, counters, target, value)?;
            ConfidentialityEngine::new(&self.provider, self.config.algorithm())
                .encrypt(value, &keys.root, target, nonce)?
                .0
        } else {
            value.to_vec()
        };

        let entry = NewEntry {
            attributes,
            namespace: request.namespace,
            name: request.name.clone(),
            data,
            auth: request.auth,
        };
        let digest = integrity_engine(&self.provider, Some(keys), self.flags)?.digest_new(&entry)?;

        let mut record = DigestRecord::new(
            entry.name.clone(),
            entry.namespace,
            entry.attributes,
            DigestSlot::Mac(digest),
            RecordState::Added,
        );
        record.flags = RecordFlags::PROTECTED | RecordFlags::VALID | RecordFlags::FREEABLE;
        record.flags.set(RecordFlags::ENCRYPTED, encrypt);
        record.plain_size = value.len();
        record.stored_size = entry.data.len();
        record.auth = entry.auth;
        Ok((entry, record))
    }

    /// Finish the commit whose batch landed at `written`.
    ///
    /// Advances `Counter-2`, retires the previous generation in the store and the
    /// directory, and moves the new payload into the cache.
    pub fn write_final<S, C>(
        &mut self,
        store: &mut S,
        counters: &mut C,
        written: StorePosition,
    ) -> GuardResult<()>
    where
        S: VariableStore,
        C: ReplayCounters,
    {
        let Some(pending) = self.pending.take() else {
            return Err(GuardError::NotReady);
        };
        let Some(data_position) = written.after(pending.checksum_size) else {
            self.pending = Some(pending);
            return Err(GuardError::InvalidParameter("written position"));
        };
        if self.directory.get(pending.checksum).is_none() {
            self.pending = Some(pending);
            return Err(GuardError::NotReady);
        }
        if !self.config.may_advance_counters() {
            self.pending = Some(pending);
            return Err(GuardError::Unsupported);
        }
        if let Err(err) = counters.advance(CounterId::Second) {
            self.pending = Some(pending);
            return Err(err);
        }

        let mut stale = Vec::new();
        if let Some(record) = self.directory.get_mut(pending.checksum) {
            record.position = Some(written);
        }
        if let Some(released) = self.directory.release_twin(pending.checksum) {
            stale.extend(released.position);
        }

        let mut reusable = None;
        if let Some(data) = pending.data {
            if let Some(record) = self.directory.get_mut(data) {
                record.position = Some(data_position);
            }
            if let Some(released) = self.directory.release_twin(data) {
                stale.extend(released.position);
                reusable = released.cache;
            }
        }
        if let Some(deleted) = pending.deleted {
            if let Some(released) = self.directory.remove(deleted) {
                stale.extend(released.position);
                if let Some(slot) = released.cache {
                    self.cache.release(slot);
                }
            }
        }

        if let (Some(data), Some(bytes)) = (pending.data, pending.stored.as_ref()) {
            let protected = self
                .directory
                .get(data)
                .is_some_and(DigestRecord::is_protected);
            if protected {
                let slot = match reusable {
                    Some(slot) => self.cache.rewrite(slot, bytes).inspect_err(|_| {
                        self.cache.release(slot);
                    }),
                    None => self.cache.store(bytes),
                };
                match slot {
                    Ok(slot) => {
                        if let Some(record) = self.directory.get_mut(data) {
                            record.cache = Some(slot);
                        }
                    }
                    // Reads fall back to the store for uncached records.
                    Err(err) => log::warn!("committed payload left uncached: {err}"),
                }
            } else if let Some(slot) = reusable {
                self.cache.release(slot);
            }
        }

        if self.cache.garbage() > self.cache.region().len() / 2 {
            self.compact_cache();
        }
        self.keyed_on = Some(pending.candidate);
        self.refresh_well_known();

        let mut owed = Vec::new();
        for position in stale {
            if let Err(err) = store.raw_update_state(position, EntryState::Deleted) {
                log::warn!("stale entry at {position} not deleted: {err}");
                owed.push(position);
            }
        }
        if !owed.is_empty() {
            self.fixup
                .get_or_insert_with(PendingFixup::default)
                .delete
                .extend(owed);
        }
        log::info!(
            "commit finalized at {written}, checksum keyed on {}",
            pending.candidate
        );
        Ok(())
    }

    /// Undo an `update` whose batch never reached the store.
    ///
    /// Restores the superseded entries in the store and the directory. `Counter-1` stays
    /// armed for the next attempt.
    pub fn abandon<S: VariableStore>(&mut self, store: &mut S) -> GuardResult<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };

        for id in [pending.data, Some(pending.checksum)].into_iter().flatten() {
            let has_twin = self
                .directory
                .get(id)
                .is_some_and(|record| record.superseded().is_some());
            if has_twin {
                self.directory.restore_twin(id);
            } else {
                self.directory.remove(id);
            }
        }
        if let Some(deleted) = pending.deleted {
            if let Some(record) = self.directory.get_mut(deleted) {
                record.state = RecordState::Added;
            }
        }
        if pending.consumed_checksum_delete {
            self.checksum_delete_used = false;
        }
        self.refresh_well_known();

        // Data first, checksum last, so a torn undo still reconciles to the old generation.
        for position in pending.marked.iter().rev() {
            store.raw_update_state(*position, EntryState::Added)?;
        }
        log::warn!("commit abandoned, {} entries restored", pending.marked.len());
        Ok(())
    }

    /// Run one complete commit: update, append the batch, write-final.
    ///
    /// A failed append is abandoned before the error is returned.
    pub fn commit<S, C>(
        &mut self,
        store: &mut S,
        counters: &mut C,
        request: UpdateRequest,
    ) -> GuardResult<StorePosition>
    where
        S: VariableStore,
        C: ReplayCounters,
    {
        let batch = self.update(store, counters, request)?;
        match store.write(&batch.entries) {
            Ok(written) => {
                self.write_final(store, counters, written)?;
                Ok(written)
            }
            Err(err) => {
                self.abandon(store)?;
                Err(err)
            }
        }
    }
}
