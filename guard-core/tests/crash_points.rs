//! Replays every prefix of a commit's durable writes and reboots from it.
use std::cell::RefCell;
use std::rc::Rc;

use guard_core::crypto::RustCryptoProvider;
use guard_core::{GuardConfig, GuardError, GuardResult, ProtectedContext, UpdateRequest};
use shared::memory::{FixedRootKey, MemoryCounters, MemoryStore};
use shared::wellknown::{CHECKSUM_NAMESPACE, checksum_entry_name};
use shared::{
    Attributes, CounterId, EntryState, Namespace, NewEntry, ReplayCounters, StorePosition,
    StoredEntry, VariableName, VariableStore,
};
use uuid::Uuid;

const ROOT: [u8; 32] = [0x42; 32];
const NS: Namespace = Uuid::from_u128(0x10);

#[derive(Debug, Clone)]
enum Op {
    Advance(CounterId),
    Mark(StorePosition, EntryState),
    Write(Vec<NewEntry>),
}

type Log = Rc<RefCell<Vec<Op>>>;

struct RecordingStore {
    inner: MemoryStore,
    log: Log,
}

impl VariableStore for RecordingStore {
    fn get(&self, position: StorePosition) -> GuardResult<StoredEntry> {
        self.inner.get(position)
    }

    fn get_by_name(&self, name: &VariableName, namespace: &Namespace) -> GuardResult<StoredEntry> {
        self.inner.get_by_name(name, namespace)
    }

    fn get_next(&self, after: Option<StorePosition>) -> GuardResult<Option<StoredEntry>> {
        self.inner.get_next(after)
    }

    fn raw_update_state(&mut self, position: StorePosition, state: EntryState) -> GuardResult<()> {
        self.inner.raw_update_state(position, state)?;
        self.log.borrow_mut().push(Op::Mark(position, state));
        Ok(())
    }

    fn write(&mut self, entries: &[NewEntry]) -> GuardResult<StorePosition> {
        let position = self.inner.write(entries)?;
        self.log.borrow_mut().push(Op::Write(entries.to_vec()));
        Ok(position)
    }

    fn max_record_size(&self) -> usize {
        self.inner.max_record_size()
    }
}

struct RecordingCounters {
    inner: MemoryCounters,
    log: Log,
}

impl ReplayCounters for RecordingCounters {
    fn advance(&mut self, id: CounterId) -> GuardResult<()> {
        self.inner.advance(id)?;
        self.log.borrow_mut().push(Op::Advance(id));
        Ok(())
    }

    fn read(&self, id: CounterId) -> GuardResult<u32> {
        self.inner.read(id)
    }
}

/// Apply `ops` to copies of the base state. A `Write` torn to `landed` entries keeps only
/// that many leading entries of the batch.
fn replay(
    store: &MemoryStore,
    counters: &MemoryCounters,
    ops: &[Op],
    landed: Option<usize>,
) -> (MemoryStore, MemoryCounters) {
    let (mut store, mut counters) = (store.clone(), counters.clone());
    for op in ops {
        match op {
            Op::Advance(id) => counters.advance(*id).expect("advance"),
            Op::Mark(position, state) => store
                .raw_update_state(*position, *state)
                .expect("mark"),
            Op::Write(entries) => {
                let count = landed.unwrap_or(entries.len()).min(entries.len());
                store.write(&entries[..count]).expect("write");
            }
        }
    }
    (store, counters)
}

fn boot<S: VariableStore, C: ReplayCounters>(
    store: &mut S,
    counters: &mut C,
) -> GuardResult<ProtectedContext> {
    ProtectedContext::build(
        store,
        counters,
        &mut FixedRootKey::new(ROOT),
        RustCryptoProvider,
        GuardConfig::default(),
    )
}

fn attrs() -> Attributes {
    Attributes::NON_VOLATILE | Attributes::RUNTIME_ACCESS
}

fn k1() -> VariableName {
    VariableName::from("k1")
}

/// Settled store holding `k1 = v1` and the durable ops of write-init plus `request`.
fn record_commit(request: UpdateRequest) -> (MemoryStore, MemoryCounters, Vec<Op>) {
    let mut store = MemoryStore::default();
    let mut counters = MemoryCounters::new(0, 0);
    let mut context = boot(&mut store, &mut counters).expect("fresh boot");
    context
        .write_init(&mut store, &mut counters)
        .expect("write-init");
    context
        .commit(
            &mut store,
            &mut counters,
            UpdateRequest::write(k1(), NS, attrs(), *b"v1"),
        )
        .expect("seed commit");
    drop(context);

    let log = Log::default();
    let mut recording_store = RecordingStore {
        inner: store.clone(),
        log: log.clone(),
    };
    let mut recording_counters = RecordingCounters {
        inner: counters.clone(),
        log: log.clone(),
    };
    let mut context =
        boot(&mut recording_store, &mut recording_counters).expect("boot before commit");
    context
        .write_init(&mut recording_store, &mut recording_counters)
        .expect("write-init");
    context
        .commit(&mut recording_store, &mut recording_counters, request)
        .expect("recorded commit");

    let ops = log.borrow().clone();
    (store, counters, ops)
}

/// Boot from a crash image, settle it and check the surviving value of `k1`.
fn recover(mut store: MemoryStore, mut counters: MemoryCounters) -> Option<Vec<u8>> {
    let mut context = boot(&mut store, &mut counters).expect("crash image must reconcile");
    let before = context.read(&store, &k1(), &NS).map(|value| value.to_vec());

    context
        .write_init(&mut store, &mut counters)
        .expect("write-init settles the crash");
    let (first, second) = counters.values();
    assert_eq!(first, second + 1, "write-init leaves the window armed");
    assert_eq!(
        store
            .live_copies(&checksum_entry_name(), &CHECKSUM_NAMESPACE)
            .len(),
        1
    );
    assert!(store.live_copies(&k1(), &NS).len() <= 1);
    assert!(
        store
            .live_entries()
            .all(|entry| entry.state == EntryState::Added)
    );

    drop(context);
    let mut context = boot(&mut store, &mut counters).expect("settled store reboots");
    assert!(context.pending_fixup().is_none());
    context.verify_all(&store).expect("settled store verifies");
    let after = context.read(&store, &k1(), &NS).map(|value| value.to_vec());
    assert_eq!(before, after, "settling must not change what reads return");

    // The next commit goes through on the recovered store.
    context
        .write_init(&mut store, &mut counters)
        .expect("write-init");
    context
        .commit(
            &mut store,
            &mut counters,
            UpdateRequest::write("after", NS, attrs(), *b"a"),
        )
        .expect("commit after recovery");

    match after {
        Ok(value) => Some(value),
        Err(GuardError::NotFound) => None,
        Err(err) => panic!("unexpected read error {err}"),
    }
}

fn written_at(ops: &[Op]) -> usize {
    ops.iter()
        .position(|op| matches!(op, Op::Write(_)))
        .expect("commit appends a batch")
}

#[test]
fn overwrite_survives_every_crash_point() {
    let (store, counters, ops) = record_commit(UpdateRequest::write(k1(), NS, attrs(), *b"v2"));
    assert!(matches!(ops.first(), Some(Op::Advance(CounterId::First))));
    let write = written_at(&ops);

    for prefix in 0..=ops.len() {
        let (store, counters) = replay(&store, &counters, &ops[..prefix], None);
        let expected: &[u8] = if prefix > write { b"v2" } else { b"v1" };
        assert_eq!(
            recover(store, counters).as_deref(),
            Some(expected),
            "crash after {prefix} ops"
        );
    }
}

#[test]
fn delete_survives_every_crash_point() {
    let (store, counters, ops) = record_commit(UpdateRequest::delete(k1(), NS));
    let write = written_at(&ops);

    for prefix in 0..=ops.len() {
        let (store, counters) = replay(&store, &counters, &ops[..prefix], None);
        let expected = (prefix <= write).then_some(b"v1".to_vec());
        assert_eq!(recover(store, counters), expected, "crash after {prefix} ops");
    }
}

#[test]
fn torn_overwrite_with_only_checksum_landed_rolls_back() {
    let (store, counters, ops) = record_commit(UpdateRequest::write(k1(), NS, attrs(), *b"v2"));
    let write = written_at(&ops);

    let (store, counters) = replay(&store, &counters, &ops[..=write], Some(1));
    assert_eq!(recover(store, counters).as_deref(), Some(b"v1".as_slice()));
}

#[test]
fn counter_relation_holds_at_every_crash_point() {
    let (store, counters, ops) = record_commit(UpdateRequest::write(k1(), NS, attrs(), *b"v2"));
    for prefix in 0..=ops.len() {
        let (_, counters) = replay(&store, &counters, &ops[..prefix], None);
        let (first, second) = counters.values();
        assert!(first == second || first == second + 1, "after {prefix} ops");
    }
}

#[test]
fn new_key_with_only_data_landed_is_dropped() {
    let k2 = VariableName::from("k2");
    let (store, counters, ops) =
        record_commit(UpdateRequest::write(k2.clone(), NS, attrs(), *b"new"));
    let write = written_at(&ops);
    let Op::Write(entries) = &ops[write] else {
        panic!("expected the commit batch");
    };
    let (mut store, mut counters) = replay(&store, &counters, &ops[..write], None);
    store.write(&entries[1..]).expect("data lands alone");
    assert_eq!(
        recover(store.clone(), counters.clone()).as_deref(),
        Some(b"v1".as_slice())
    );

    let mut context = boot(&mut store, &mut counters).expect("data-only landing reconciles");
    assert_eq!(context.read(&store, &k2, &NS).err(), Some(GuardError::NotFound));
    assert!(context.pending_fixup().is_some());
    context
        .write_init(&mut store, &mut counters)
        .expect("write-init");
    assert!(store.live_copies(&k2, &NS).is_empty());
    assert_eq!(
        context.read(&store, &k1(), &NS).map(|value| value.to_vec()),
        Ok(b"v1".to_vec())
    );
}

#[test]
fn first_commit_with_only_data_landed_starts_fresh() {
    let mut store = MemoryStore::default();
    let mut counters = MemoryCounters::new(0, 0);
    let mut context = boot(&mut store, &mut counters).expect("fresh boot");
    context
        .write_init(&mut store, &mut counters)
        .expect("write-init");
    let batch = context
        .update(
            &mut store,
            &mut counters,
            UpdateRequest::write(k1(), NS, attrs(), *b"v1"),
        )
        .expect("update");
    store.write(&batch.entries[1..]).expect("data lands alone");
    drop(context);

    let mut context = boot(&mut store, &mut counters).expect("torn first commit reconciles");
    assert_eq!(context.read(&store, &k1(), &NS).err(), Some(GuardError::NotFound));
    context
        .write_init(&mut store, &mut counters)
        .expect("write-init");
    assert_eq!(store.live_entries().count(), 0);
    context
        .commit(
            &mut store,
            &mut counters,
            UpdateRequest::write(k1(), NS, attrs(), *b"v2"),
        )
        .expect("commit on the fresh store");
    assert_eq!(
        context.read(&store, &k1(), &NS).map(|value| value.to_vec()),
        Ok(b"v2".to_vec())
    );
}
