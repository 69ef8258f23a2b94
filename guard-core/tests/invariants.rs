//! Seeded random walks over commits, failures and reboots.
use std::collections::BTreeMap;

use guard_core::cipher::CipherHeader;
use guard_core::crypto::RustCryptoProvider;
use guard_core::{GuardConfig, GuardError, GuardResult, ProtectedContext, UpdateRequest};
use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};
use shared::memory::{FixedRootKey, MemoryCounters, MemoryStore};
use shared::wellknown::{CHECKSUM_NAMESPACE, checksum_entry_name};
use shared::{Attributes, Namespace, VariableName, VariableStore};
use uuid::Uuid;

const ROOT: [u8; 32] = [0x33; 32];
const NS: Namespace = Uuid::from_u128(0x77);
const KEYS: [&str; 4] = ["Boot0000", "BootOrder", "Lang", "Timeout"];

fn boot(store: &mut MemoryStore, counters: &mut MemoryCounters) -> GuardResult<ProtectedContext> {
    ProtectedContext::build(
        store,
        counters,
        &mut FixedRootKey::new(ROOT),
        RustCryptoProvider,
        GuardConfig::default(),
    )
}

fn attrs() -> Attributes {
    Attributes::NON_VOLATILE | Attributes::BOOTSERVICE_ACCESS | Attributes::RUNTIME_ACCESS
}

fn below(rng: &mut ChaCha20Rng, bound: usize) -> usize {
    (rng.next_u32() as usize) % bound
}

fn random_value(rng: &mut ChaCha20Rng) -> Vec<u8> {
    let mut value = vec![0u8; 1 + below(rng, 24)];
    rng.fill_bytes(&mut value);
    value
}

struct Walk {
    store: MemoryStore,
    counters: MemoryCounters,
    context: ProtectedContext,
    model: BTreeMap<&'static str, Vec<u8>>,
}

impl Walk {
    fn start() -> Self {
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
                UpdateRequest::write(KEYS[0], NS, attrs(), *b"seed"),
            )
            .expect("seed commit");
        Self {
            store,
            counters,
            context,
            model: BTreeMap::from([(KEYS[0], b"seed".to_vec())]),
        }
    }

    fn reboot(&mut self) {
        self.context = boot(&mut self.store, &mut self.counters).expect("reboot");
        self.context
            .write_init(&mut self.store, &mut self.counters)
            .expect("write-init after reboot");
    }

    fn step(&mut self, rng: &mut ChaCha20Rng) {
        let key = KEYS[below(rng, KEYS.len())];
        match below(rng, 6) {
            0 | 1 => {
                let value = random_value(rng);
                self.context
                    .commit(
                        &mut self.store,
                        &mut self.counters,
                        UpdateRequest::write(key, NS, attrs(), value.clone()),
                    )
                    .expect("commit");
                self.model.insert(key, value);
            }
            2 => {
                let request = UpdateRequest::delete(key, NS);
                let result = self
                    .context
                    .commit(&mut self.store, &mut self.counters, request);
                if self.model.remove(key).is_some() {
                    result.expect("delete");
                } else {
                    assert_eq!(result.err(), Some(GuardError::NotFound));
                }
            }
            3 => {
                self.store.set_fail_writes(true);
                let result = self.context.commit(
                    &mut self.store,
                    &mut self.counters,
                    UpdateRequest::write(key, NS, attrs(), random_value(rng)),
                );
                self.store.set_fail_writes(false);
                assert_eq!(result.err(), Some(GuardError::OutOfResources));
            }
            4 => {
                // Power loss between the append and write-final.
                let value = random_value(rng);
                let batch = self
                    .context
                    .update(
                        &mut self.store,
                        &mut self.counters,
                        UpdateRequest::write(key, NS, attrs(), value.clone()),
                    )
                    .expect("update");
                self.store.write(&batch.entries).expect("append");
                self.model.insert(key, value);
                self.reboot();
            }
            _ => self.reboot(),
        }
    }

    fn check(&mut self, step: usize) {
        let (first, second) = self.counters.values();
        assert!(
            first == second || first == second + 1,
            "counters ({first}, {second}) after step {step}"
        );
        assert_eq!(
            self.store
                .live_copies(&checksum_entry_name(), &CHECKSUM_NAMESPACE)
                .len(),
            1,
            "checksum generations after step {step}"
        );

        for key in KEYS {
            let name = VariableName::from(key);
            let read = self
                .context
                .read(&self.store, &name, &NS)
                .map(|value| value.to_vec());
            match self.model.get(key) {
                Some(expected) => assert_eq!(read.as_ref(), Ok(expected), "{key} at step {step}"),
                None => assert_eq!(read, Err(GuardError::NotFound), "{key} at step {step}"),
            }
        }
    }
}

#[test]
fn random_walks_keep_counters_and_values_consistent() {
    for seed in 0..8u8 {
        let mut rng = ChaCha20Rng::from_seed([seed; 32]);
        let mut walk = Walk::start();
        for step in 0..40 {
            walk.step(&mut rng);
            walk.check(step);
        }

        walk.reboot();
        walk.check(usize::MAX);
        assert_eq!(
            walk.context.verify_all(&walk.store),
            Ok(walk.model.len()),
            "seed {seed}"
        );
    }
}

#[test]
fn any_flipped_byte_fails_the_next_boot() {
    for seed in 100..116u8 {
        let mut rng = ChaCha20Rng::from_seed([seed; 32]);
        let mut walk = Walk::start();
        for _ in 0..6 {
            let key = KEYS[below(&mut rng, KEYS.len())];
            let value = random_value(&mut rng);
            walk.context
                .commit(
                    &mut walk.store,
                    &mut walk.counters,
                    UpdateRequest::write(key, NS, attrs(), value),
                )
                .expect("commit");
        }

        let live: Vec<_> = walk
            .store
            .live_entries()
            .map(|entry| {
                let skip = if entry.attributes.contains(Attributes::ENCRYPTED_PAYLOAD) {
                    CipherHeader::ENCODED_LEN
                } else {
                    0
                };
                (entry.position, skip, entry.data.len())
            })
            .collect();
        let (position, skip, len) = live[below(&mut rng, live.len())];
        let index = skip + below(&mut rng, len - skip);
        walk.store.tamper(position, index).expect("tamper");

        let err = boot(&mut walk.store, &mut walk.counters)
            .err()
            .expect("tampered store must not boot");
        assert!(err.is_integrity_failure(), "seed {seed}: {err}");
    }
}
