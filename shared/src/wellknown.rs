//! Library-managed entries that live in the store unprotected.
use uuid::Uuid;

use crate::variable::{Namespace, VariableName};

/// Name of the aggregate checksum entry.
pub const CHECKSUM_ENTRY_NAME: &[u8] = b"MetaDataHmacVar";

/// Namespace of the aggregate checksum entry.
pub const CHECKSUM_NAMESPACE: Namespace = Uuid::from_u128(0xb54a_9af6_1c3c_4fa7_a4d5_2e77_4a83_92c1);

/// Name of the store error flag maintained by the variable driver.
pub const ERROR_FLAG_NAME: &[u8] = b"VarErrorFlag";

/// Namespace of the store error flag.
pub const ERROR_FLAG_NAMESPACE: Namespace =
    Uuid::from_u128(0x04b3_7fe8_f6ae_480b_bdd5_37d9_8c5e_89aa);

/// Identifier of the handoff blob carrying the cross-stage context.
pub const CONTEXT_HANDOFF_ID: Uuid = Uuid::from_u128(0x8c51_65a2_77e4_4f0c_9a3b_d1f0_3e6b_57d4);

/// Slot of a well-known entry in the context's position cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnown {
    /// Checksum entry generation in state `Added`.
    ChecksumAdded,
    /// Checksum entry generation in state `InDeleteTransition`.
    ChecksumInDeletion,
    ErrorFlag,
    /// Platform-reserved entry, indexed by its position in the configured list.
    Platform(usize),
}

pub fn is_checksum_entry(name: &VariableName, namespace: &Namespace) -> bool {
    name.as_bytes() == CHECKSUM_ENTRY_NAME && *namespace == CHECKSUM_NAMESPACE
}

pub fn is_error_flag(name: &VariableName, namespace: &Namespace) -> bool {
    name.as_bytes() == ERROR_FLAG_NAME && *namespace == ERROR_FLAG_NAMESPACE
}

pub fn checksum_entry_name() -> VariableName {
    VariableName::from(CHECKSUM_ENTRY_NAME)
}
