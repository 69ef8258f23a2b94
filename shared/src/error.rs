use thiserror::Error;

/// Result alias used throughout the guard stack.
pub type GuardResult<T> = Result<T, GuardError>;

/// Failure taxonomy shared by the backing store, the counters and the guard engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("entry not found")]
    NotFound,
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("out of resources")]
    OutOfResources,
    /// A cryptographic primitive rejected its input or failed to authenticate.
    #[error("cryptographic operation aborted")]
    Aborted,
    /// Integrity or replay verification failed. Never retried or downgraded.
    #[error("integrity check failed: {0}")]
    CompromisedData(&'static str),
    #[error("volume corrupted: {0}")]
    VolumeCorrupted(&'static str),
    #[error("buffer too small, {required} bytes required")]
    BufferTooSmall { required: usize },
    #[error("record of {size} bytes exceeds store limit of {limit} bytes")]
    BadBufferSize { size: usize, limit: usize },
    #[error("replay counter device error")]
    DeviceError,
    /// Attempted direct mutation of a library-managed entry.
    #[error("access denied")]
    AccessDenied,
    #[error("operation unsupported in this stage")]
    Unsupported,
    #[error("commit pipeline not ready")]
    NotReady,
    #[error("handoff codec error")]
    Codec,
}

impl GuardError {
    /// Whether the error must halt the boot instead of being handed back to the caller.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            GuardError::CompromisedData(_)
                | GuardError::VolumeCorrupted(_)
                | GuardError::DeviceError
                | GuardError::OutOfResources
        )
    }

    /// Whether the error stems from integrity or replay verification.
    pub const fn is_integrity_failure(&self) -> bool {
        matches!(self, GuardError::CompromisedData(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn fatal_classification_follows_propagation_policy() {
        assert!(GuardError::CompromisedData("checksum").is_fatal());
        assert!(GuardError::VolumeCorrupted("header").is_fatal());
        assert!(GuardError::DeviceError.is_fatal());
        assert!(!GuardError::BufferTooSmall { required: 4 }.is_fatal());
        assert!(!GuardError::NotReady.is_fatal());
        assert!(!GuardError::AccessDenied.is_fatal());
    }

    #[test]
    fn messages_carry_context() {
        assert_eq!(
            GuardError::BufferTooSmall { required: 12 }.to_string(),
            "buffer too small, 12 bytes required"
        );
        assert_eq!(
            GuardError::BadBufferSize {
                size: 70,
                limit: 64
            }
            .to_string(),
            "record of 70 bytes exceeds store limit of 64 bytes"
        );
    }
}
