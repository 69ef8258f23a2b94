#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod checksum;
pub mod error;
pub mod memory;
pub mod store;
pub mod variable;
pub mod wellknown;

pub use error::{GuardError, GuardResult};
pub use store::{CounterId, HandoffTransport, ReplayCounters, RootKeySource, VariableStore};
pub use variable::{
    Attributes, AuthInfo, DIGEST_SIZE, EntryState, Namespace, NewEntry, StorePosition,
    StoredEntry, VariableName,
};
