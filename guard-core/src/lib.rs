#![cfg_attr(not(test), no_std)]

//! Integrity, replay protection and confidentiality for a flat variable store.
//!
//! Every protected entry is covered by an HMAC digest; all digests are folded into one
//! aggregate checksum entry bound to a pair of monotonic counters; payloads are optionally
//! sealed with an AEAD. The backing store, the counters, the root-key source and the
//! inter-stage transport are injected through the traits in [`shared::store`].

extern crate alloc;

pub mod access;
pub mod cache;
pub mod cipher;
pub mod config;
pub mod context;
pub mod crypto;
pub mod directory;
pub mod handoff;
pub mod integrity;
pub mod pipeline;
pub mod reconcile;
pub mod stage;

pub use access::EntryInfo;
pub use config::{GuardConfig, ReservedEntry};
pub use context::{ContextFlags, ProtectedContext};
pub use crypto::{CryptoProvider, EnvelopeAlgorithm, RustCryptoProvider};
pub use handoff::ContextBlob;
pub use pipeline::{CommitBatch, CommitPhase, UpdateRequest};
pub use stage::{ReadOnlyStage, TrustStage, UpdateStage};

pub use shared::{GuardError, GuardResult};
