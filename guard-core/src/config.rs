use alloc::vec::Vec;

use shared::wellknown::{is_checksum_entry, is_error_flag};
use shared::{Namespace, VariableName};

use crate::crypto::EnvelopeAlgorithm;

/// Default capacity of the scratch buffer used for one-entry-at-a-time verification.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 0x0C00;

/// Platform entry the guard leaves unprotected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedEntry {
    pub name: VariableName,
    pub namespace: Namespace,
}

impl ReservedEntry {
    pub fn new(name: impl Into<Vec<u8>>, namespace: Namespace) -> Self {
        Self {
            name: VariableName::new(name),
            namespace,
        }
    }
}

/// Per-stage settings of the guard.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    max_record_size: Option<usize>,
    max_payload_size: usize,
    algorithm: EnvelopeAlgorithm,
    confidentiality: bool,
    recovery_mode: bool,
    platform_reserved: Vec<ReservedEntry>,
    advance_counters: bool,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_record_size: None,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            algorithm: EnvelopeAlgorithm::Aes256Gcm,
            confidentiality: true,
            recovery_mode: false,
            platform_reserved: Vec::new(),
            advance_counters: true,
        }
    }
}

impl GuardConfig {
    /// Settings of an unprivileged stage: no counter access, no recovery.
    pub fn read_only() -> Self {
        Self::default().with_counter_advance(false)
    }

    /// Cap the batch size below what the backing store accepts.
    pub fn with_max_record_size(mut self, size: usize) -> Self {
        self.max_record_size = Some(size);
        self
    }

    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    pub fn with_algorithm(mut self, algorithm: EnvelopeAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_confidentiality(mut self, enabled: bool) -> Self {
        self.confidentiality = enabled;
        self
    }

    pub fn with_recovery_mode(mut self, enabled: bool) -> Self {
        self.recovery_mode = enabled;
        self
    }

    pub fn with_reserved_entry(mut self, entry: ReservedEntry) -> Self {
        self.platform_reserved.push(entry);
        self
    }

    pub fn with_counter_advance(mut self, allowed: bool) -> Self {
        self.advance_counters = allowed;
        self
    }

    /// Largest batch accepted by one commit given the store's own limit.
    pub fn record_limit(&self, store_limit: usize) -> usize {
        match self.max_record_size {
            Some(limit) => limit.min(store_limit),
            None => store_limit,
        }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    pub fn algorithm(&self) -> EnvelopeAlgorithm {
        self.algorithm
    }

    pub fn confidentiality(&self) -> bool {
        self.confidentiality
    }

    pub fn recovery_mode(&self) -> bool {
        self.recovery_mode
    }

    pub fn platform_reserved(&self) -> &[ReservedEntry] {
        &self.platform_reserved
    }

    pub fn may_advance_counters(&self) -> bool {
        self.advance_counters
    }

    /// Index of `(name, namespace)` in the platform-reserved list.
    pub fn reserved_index(&self, name: &VariableName, namespace: &Namespace) -> Option<usize> {
        self.platform_reserved
            .iter()
            .position(|entry| entry.name == *name && entry.namespace == *namespace)
    }

    /// Whether the entry is maintained by the library rather than covered by a digest.
    pub fn is_library_managed(&self, name: &VariableName, namespace: &Namespace) -> bool {
        is_checksum_entry(name, namespace)
            || is_error_flag(name, namespace)
            || self.reserved_index(name, namespace).is_some()
    }
}
