//! Replay protection: choosing the surviving checksum generation after a boot.
//!
//! A writer advances `Counter-1`, marks the old checksum generation pending-delete, lands the
//! new generation keyed on `Counter-2 + 1` together with the data, advances `Counter-2` and
//! finally deletes the old generation. Every prefix of that sequence maps to one
//! [`ReconcileState`], and every state to exactly one outcome.
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};
use shared::wellknown::{CHECKSUM_NAMESPACE, checksum_entry_name, is_checksum_entry};
use shared::{GuardError, GuardResult, StorePosition};

use crate::crypto::CryptoProvider;
use crate::directory::{DigestDirectory, DirectoryView, RecordId, RecordState};
use crate::integrity::IntegrityEngine;

/// How the two replay counters relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterRelation {
    /// `Counter-1 == Counter-2`: no commit window open.
    Equal,
    /// `Counter-1 == Counter-2 + 1`: a writer armed the window.
    Armed,
    Diverged,
}

impl CounterRelation {
    pub fn classify(first: u32, second: u32) -> Self {
        if first == second {
            CounterRelation::Equal
        } else if second.checked_add(1) == Some(first) {
            CounterRelation::Armed
        } else {
            CounterRelation::Diverged
        }
    }
}

/// One physical checksum generation.
#[derive(Debug, Clone, Copy)]
pub struct ChecksumCandidate<'a> {
    pub record: RecordId,
    pub value: &'a [u8],
}

/// The at most two checksum generations found in the directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct Candidates<'a> {
    /// Generation in state `Added`.
    pub committed: Option<ChecksumCandidate<'a>>,
    /// Generation in state `InDeleteTransition`.
    pub pending: Option<ChecksumCandidate<'a>>,
}

impl<'a> Candidates<'a> {
    pub fn collect(directory: &'a DigestDirectory) -> Self {
        let Some(id) = directory.find(&checksum_entry_name(), &CHECKSUM_NAMESPACE) else {
            return Self::default();
        };
        let Some(record) = directory.get(id) else {
            return Self::default();
        };
        let candidate = |id: RecordId| {
            directory.get(id).map(|record| ChecksumCandidate {
                record: id,
                value: record.slot.cached().unwrap_or(&[]),
            })
        };

        match record.state {
            RecordState::Added => Self {
                committed: candidate(id),
                pending: record.superseded().and_then(candidate),
            },
            RecordState::InDeleteTransition => Self {
                committed: None,
                pending: candidate(id),
            },
            RecordState::Deleted => Self::default(),
        }
    }
}

/// Presence of each generation combined with the counter relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    CommittedOnly(CounterRelation),
    PendingOnly(CounterRelation),
    Both(CounterRelation),
    Neither(CounterRelation),
}

impl ReconcileState {
    pub fn of(candidates: &Candidates<'_>, relation: CounterRelation) -> Self {
        match (candidates.committed.is_some(), candidates.pending.is_some()) {
            (true, false) => ReconcileState::CommittedOnly(relation),
            (false, true) => ReconcileState::PendingOnly(relation),
            (true, true) => ReconcileState::Both(relation),
            (false, false) => ReconcileState::Neither(relation),
        }
    }
}

/// Which generation of the directory the active checksum vouches for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    Committed,
    Pending,
}

/// What has to happen to the store to leave only the active generation behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Clean,
    /// The newer generation is valid; older copies and pending deletions are stale.
    RollForward { advance_second: bool },
    /// The newer generation never fully landed; the pending copies are restored.
    ///
    /// `stray` is the entry a new key left behind when only its data landed.
    RollBack { stray: Option<RecordId> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveChecksum {
    pub record: RecordId,
    pub generation: Generation,
    /// Counter value the active aggregate is bound to once settled.
    pub keyed_on: u32,
    pub settlement: Settlement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Active(ActiveChecksum),
    /// No checksum, no protected entries and no commit ever made.
    Fresh,
    /// Recovery mode: a new trust root must be synthesized.
    Synthesize,
}

/// Store writes owed by a settlement or a partly failed write-final, carried until the next
/// write-init or update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingFixup {
    pub advance_second: bool,
    /// Positions to mark `Deleted`, applied first.
    pub delete: Vec<StorePosition>,
    /// Positions to mark `Added` again, applied in order after the deletions.
    pub restore: Vec<StorePosition>,
}

impl PendingFixup {
    pub fn is_empty(&self) -> bool {
        !self.advance_second && self.delete.is_empty() && self.restore.is_empty()
    }
}

/// Pick the active checksum generation.
pub fn reconcile<P: CryptoProvider>(
    engine: &IntegrityEngine<'_, P>,
    directory: &DigestDirectory,
    candidates: &Candidates<'_>,
    first: u32,
    second: u32,
) -> GuardResult<Resolution> {
    let relation = CounterRelation::classify(first, second);
    let state = ReconcileState::of(candidates, relation);
    log::debug!("reconciling {state:?} with counters ({first}, {second})");

    let recovery = engine.is_recovery();
    let unresolved = |reason: &'static str| {
        if recovery {
            log::warn!("{reason}, synthesizing a new trust root");
            Ok(Resolution::Synthesize)
        } else {
            log::error!("{reason}");
            Err(GuardError::CompromisedData(reason))
        }
    };
    let forward = |advance_second: bool| {
        if advance_second || directory.has_transitional() {
            Settlement::RollForward { advance_second }
        } else {
            Settlement::Clean
        }
    };
    let check = |view, counter, candidate| vouches(engine, directory, view, counter, candidate);

    let committed = candidates.committed;
    let pending = candidates.pending;
    match state {
        ReconcileState::CommittedOnly(CounterRelation::Diverged)
        | ReconcileState::PendingOnly(CounterRelation::Diverged)
        | ReconcileState::Both(CounterRelation::Diverged)
        | ReconcileState::Neither(CounterRelation::Diverged) => {
            unresolved("replay counters diverged")
        }
        ReconcileState::CommittedOnly(CounterRelation::Equal | CounterRelation::Armed) => {
            if check(DirectoryView::Committed, second, committed)? {
                Ok(active(committed, Generation::Committed, second, forward(false)))
            } else {
                unresolved("checksum mismatch")
            }
        }
        ReconcileState::PendingOnly(CounterRelation::Equal | CounterRelation::Armed) => {
            match rolls_back(engine, directory, second, pending)? {
                Some(settlement) => Ok(active(pending, Generation::Pending, second, settlement)),
                None => unresolved("pending checksum mismatch"),
            }
        }
        ReconcileState::Both(CounterRelation::Armed) => {
            if check(DirectoryView::Committed, first, committed)? {
                return Ok(active(committed, Generation::Committed, first, forward(true)));
            }
            match rolls_back(engine, directory, second, pending)? {
                Some(settlement) => Ok(active(pending, Generation::Pending, second, settlement)),
                None => unresolved("no checksum generation matches"),
            }
        }
        ReconcileState::Both(CounterRelation::Equal) => {
            if check(DirectoryView::Committed, second, committed)? {
                return Ok(active(committed, Generation::Committed, second, forward(false)));
            }
            match rolls_back(engine, directory, second, pending)? {
                Some(settlement) => Ok(active(pending, Generation::Pending, second, settlement)),
                None => unresolved("no checksum generation matches"),
            }
        }
        ReconcileState::Neither(CounterRelation::Equal | CounterRelation::Armed) => {
            if recovery {
                log::warn!("no checksum entry in recovery mode");
                Ok(Resolution::Synthesize)
            } else if second == 0 && unvouched(directory, stray_entry(directory, None)) == 0 {
                // No commit ever finished, so the most a torn first commit leaves is its data.
                Ok(Resolution::Fresh)
            } else {
                unresolved("checksum entry missing")
            }
        }
    }
}

fn vouches<P: CryptoProvider>(
    engine: &IntegrityEngine<'_, P>,
    directory: &DigestDirectory,
    view: DirectoryView,
    counter: u32,
    candidate: Option<ChecksumCandidate<'_>>,
) -> GuardResult<bool> {
    match candidate {
        Some(candidate) => engine.checksum_matches(directory, view, counter, candidate.value),
        None => Ok(false),
    }
}

fn active(
    candidate: Option<ChecksumCandidate<'_>>,
    generation: Generation,
    keyed_on: u32,
    settlement: Settlement,
) -> Resolution {
    match candidate {
        Some(candidate) => Resolution::Active(ActiveChecksum {
            record: candidate.record,
            generation,
            keyed_on,
            settlement,
        }),
        None => Resolution::Fresh,
    }
}

/// Whether the pending generation vouches for the rollback view, either as it is or once the
/// stray entry of a torn commit is set aside.
fn rolls_back<P: CryptoProvider>(
    engine: &IntegrityEngine<'_, P>,
    directory: &DigestDirectory,
    counter: u32,
    pending: Option<ChecksumCandidate<'_>>,
) -> GuardResult<Option<Settlement>> {
    if vouches(engine, directory, DirectoryView::Rollback, counter, pending)? {
        return Ok(Some(Settlement::RollBack { stray: None }));
    }
    let after = pending
        .and_then(|candidate| directory.get(candidate.record))
        .and_then(|record| record.position);
    let Some(stray) = after.and_then(|after| stray_entry(directory, Some(after))) else {
        return Ok(None);
    };
    let view = DirectoryView::RollbackWithout(stray);
    if vouches(engine, directory, view, counter, pending)? {
        log::warn!("data of an unfinished commit landed without its checksum generation");
        return Ok(Some(Settlement::RollBack { stray: Some(stray) }));
    }
    Ok(None)
}

/// The newest data record in the store, when it is protected, has no earlier generation and
/// was appended after `after`.
pub fn stray_entry(directory: &DigestDirectory, after: Option<StorePosition>) -> Option<RecordId> {
    let (id, record, position) = directory
        .iter()
        .filter(|(_, record)| !is_checksum_entry(&record.name, &record.namespace))
        .filter_map(|(id, record)| Some((id, record, record.position?)))
        .max_by_key(|(_, _, position)| *position)?;
    let stray = record.state == RecordState::Added
        && record.is_protected()
        && record.superseded().is_none()
        && after.is_none_or(|after| position > after);
    stray.then_some(id)
}

/// Protected records in the rollback view other than `except`.
fn unvouched(directory: &DigestDirectory, except: Option<RecordId>) -> usize {
    let view = match except {
        Some(id) => DirectoryView::RollbackWithout(id),
        None => DirectoryView::Rollback,
    };
    directory.view(view).filter(|record| record.is_protected()).count()
}

/// Drop the stray entry of a torn first commit from a store that never finished one.
pub fn clear_fresh(directory: &mut DigestDirectory, fixup: &mut PendingFixup) {
    if let Some(stray) = stray_entry(directory, None) {
        if let Some(released) = directory.remove(stray) {
            fixup.delete.extend(released.position);
        }
    }
}

/// Apply `settlement` to the directory and list the store writes it still owes.
///
/// Returns the record now holding the active checksum.
pub fn settle(
    directory: &mut DigestDirectory,
    active: &ActiveChecksum,
    fixup: &mut PendingFixup,
) -> Option<RecordId> {
    match active.settlement {
        Settlement::Clean => Some(active.record),
        Settlement::RollForward { advance_second } => {
            fixup.advance_second |= advance_second;
            roll_forward(directory, fixup);
            Some(active.record)
        }
        Settlement::RollBack { stray } => {
            if let Some(released) = stray.and_then(|stray| directory.remove(stray)) {
                fixup.delete.extend(released.position);
            }
            roll_back(directory, fixup)
        }
    }
}

/// Keep the newest generation of every key and drop pending deletions.
pub fn roll_forward(directory: &mut DigestDirectory, fixup: &mut PendingFixup) {
    for id in directory.ids() {
        if let Some(released) = directory.release_twin(id) {
            fixup.delete.extend(released.position);
        }
        let pending_delete = directory
            .get(id)
            .is_some_and(|record| record.state == RecordState::InDeleteTransition);
        if pending_delete {
            if let Some(released) = directory.remove(id) {
                fixup.delete.extend(released.position);
            }
        }
    }
}

fn roll_back(directory: &mut DigestDirectory, fixup: &mut PendingFixup) -> Option<RecordId> {
    let mut checksum = None;
    let mut restore_checksum = None;

    for id in directory.ids() {
        let Some(record) = directory.get(id) else {
            continue;
        };
        let is_checksum = is_checksum_entry(&record.name, &record.namespace);

        let (survivor, restored) = if record.superseded().is_some() {
            match directory.restore_twin(id) {
                Some((twin, released)) => {
                    fixup.delete.extend(released.position);
                    (twin, directory.get(twin).and_then(|twin| twin.position))
                }
                None => continue,
            }
        } else if record.state == RecordState::InDeleteTransition {
            let position = record.position;
            if let Some(record) = directory.get_mut(id) {
                record.state = RecordState::Added;
            }
            (id, position)
        } else {
            (id, None)
        };

        if is_checksum {
            checksum = Some(survivor);
            restore_checksum = restored;
        } else {
            fixup.restore.extend(restored);
        }
    }

    // The checksum generation comes back last so a torn fixup still reconciles.
    fixup.restore.extend(restore_checksum);
    checksum
}
