//! Confidentiality engine: per-entry AEAD envelopes keyed from the root key.
//!
//! Stored payload layout of an encrypted entry is `header ‖ ciphertext ‖ tag`. The header is
//! a fixed little-endian structure that records the algorithm, the plaintext size and the
//! nonce; it is also bound into the associated data together with the entry's identity, so a
//! ciphertext cannot be replayed under a different name or namespace.
use alloc::vec::Vec;
use core::fmt;

use shared::variable::namespace_bytes;
use shared::{GuardError, GuardResult, Namespace, VariableName};
use zeroize::Zeroizing;

use crate::crypto::{CryptoProvider, EnvelopeAlgorithm, MacKey, MacSession, NONCE_SIZE, RootKey};
use crate::directory::{DigestRecord, RecordFlags};

pub const CIPHER_HEADER_MAGIC: u32 = 0x4345_564E; // "NVEC"
pub const CIPHER_HEADER_VERSION: u8 = 1;

/// HKDF info prefix of per-entry encryption keys.
pub const ENCRYPTION_KEY_INFO: &[u8] = b"VAR_ENC_KEY";

const NONCE_DOMAIN: [u8; 4] = *b"NVE1";

/// Header prepended to every encrypted payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherHeader {
    pub algorithm: EnvelopeAlgorithm,
    pub plaintext_size: u32,
    pub nonce: [u8; NONCE_SIZE],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherHeaderError {
    Truncated(usize),
    InvalidMagic(u32),
    UnsupportedVersion(u8),
    UnknownAlgorithm(u8),
}

impl fmt::Display for CipherHeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherHeaderError::Truncated(len) => write!(f, "cipher header truncated at {len} bytes"),
            CipherHeaderError::InvalidMagic(actual) => {
                write!(f, "invalid cipher header magic 0x{actual:08X}")
            }
            CipherHeaderError::UnsupportedVersion(version) => {
                write!(f, "unsupported cipher header version {version}")
            }
            CipherHeaderError::UnknownAlgorithm(value) => {
                write!(f, "unknown envelope algorithm 0x{value:02X}")
            }
        }
    }
}

impl From<CipherHeaderError> for GuardError {
    fn from(_: CipherHeaderError) -> Self {
        GuardError::VolumeCorrupted("cipher header")
    }
}

impl CipherHeader {
    pub const ENCODED_LEN: usize = 24;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut bytes = [0u8; Self::ENCODED_LEN];
        bytes[0..4].copy_from_slice(&CIPHER_HEADER_MAGIC.to_le_bytes());
        bytes[4] = CIPHER_HEADER_VERSION;
        bytes[5] = self.algorithm.to_wire();
        // bytes[6..8] reserved
        bytes[8..12].copy_from_slice(&self.plaintext_size.to_le_bytes());
        bytes[12..24].copy_from_slice(&self.nonce);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CipherHeaderError> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(CipherHeaderError::Truncated(bytes.len()));
        }

        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != CIPHER_HEADER_MAGIC {
            return Err(CipherHeaderError::InvalidMagic(magic));
        }
        if bytes[4] != CIPHER_HEADER_VERSION {
            return Err(CipherHeaderError::UnsupportedVersion(bytes[4]));
        }
        let algorithm = EnvelopeAlgorithm::from_wire(bytes[5])
            .ok_or(CipherHeaderError::UnknownAlgorithm(bytes[5]))?;
        let plaintext_size = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[12..24]);

        Ok(Self {
            algorithm,
            plaintext_size,
            nonce,
        })
    }
}

/// Nonce of a new envelope: a MAC over the commit counters, the entry identity and the
/// plaintext, truncated to the AEAD nonce width.
///
/// `counters` is `(Counter-1, Counter-2 + 1)` of the commit. An abandoned or rolled-back
/// commit leaves the counter pair unchanged, so the plaintext keeps a retry from reusing it.
pub fn derive_nonce<P: CryptoProvider>(
    provider: &P,
    mac_key: &MacKey,
    counters: (u32, u32),
    target: EnvelopeTarget<'_>,
    plaintext: &[u8],
) -> GuardResult<[u8; NONCE_SIZE]> {
    let name_len = u32::try_from(target.name.len())
        .map_err(|_| GuardError::InvalidParameter("name length"))?;
    let mut session = provider.mac_session(mac_key.as_bytes())?;
    session.update(&NONCE_DOMAIN);
    session.update(&counters.0.to_le_bytes());
    session.update(&counters.1.to_le_bytes());
    session.update(&namespace_bytes(target.namespace));
    session.update(&name_len.to_le_bytes());
    session.update(target.name.as_bytes());
    session.update(plaintext);
    let digest = session.finalize();

    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&digest.as_bytes()[..NONCE_SIZE]);
    Ok(nonce)
}

/// Identity an envelope is bound to.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeTarget<'a> {
    pub name: &'a VariableName,
    pub namespace: &'a Namespace,
}

impl<'a> EnvelopeTarget<'a> {
    pub fn of(record: &'a DigestRecord) -> Self {
        Self {
            name: &record.name,
            namespace: &record.namespace,
        }
    }
}

/// Encrypts and decrypts entry payloads.
pub struct ConfidentialityEngine<'a, P> {
    provider: &'a P,
    algorithm: EnvelopeAlgorithm,
}

impl<'a, P: CryptoProvider> ConfidentialityEngine<'a, P> {
    pub fn new(provider: &'a P, algorithm: EnvelopeAlgorithm) -> Self {
        Self {
            provider,
            algorithm,
        }
    }

    fn entry_key(
        &self,
        root_key: &RootKey,
        target: EnvelopeTarget<'_>,
    ) -> GuardResult<Zeroizing<[u8; 32]>> {
        let mut key = Zeroizing::new([0u8; 32]);
        let namespace = namespace_bytes(target.namespace);
        self.provider.hkdf_sha256(
            root_key.as_bytes(),
            &[],
            &[ENCRYPTION_KEY_INFO, &namespace, target.name.as_bytes()],
            key.as_mut(),
        )?;
        Ok(key)
    }

    fn associated_data(header: &[u8; CipherHeader::ENCODED_LEN], target: EnvelopeTarget<'_>) -> Vec<u8> {
        let mut aad = Vec::with_capacity(header.len() + 16 + target.name.len());
        aad.extend_from_slice(header);
        aad.extend_from_slice(&namespace_bytes(target.namespace));
        aad.extend_from_slice(target.name.as_bytes());
        aad
    }

    /// Encrypt `plaintext`, returning the header and the stored payload (`header ‖ ciphertext`).
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        root_key: &RootKey,
        target: EnvelopeTarget<'_>,
        nonce: [u8; NONCE_SIZE],
    ) -> GuardResult<(Vec<u8>, CipherHeader)> {
        let plaintext_size =
            u32::try_from(plaintext.len()).map_err(|_| GuardError::InvalidParameter("payload size"))?;
        let header = CipherHeader {
            algorithm: self.algorithm,
            plaintext_size,
            nonce,
        };
        let encoded = header.encode();
        let key = self.entry_key(root_key, target)?;

        let mut sealed = Vec::new();
        sealed
            .try_reserve_exact(plaintext.len() + self.provider.tag_len(self.algorithm))
            .map_err(|_| GuardError::OutOfResources)?;
        sealed.extend_from_slice(plaintext);
        self.provider.seal_in_place(
            header.algorithm,
            &key,
            &header.nonce,
            &Self::associated_data(&encoded, target),
            &mut sealed,
        )?;

        let mut stored = Vec::new();
        stored
            .try_reserve_exact(CipherHeader::ENCODED_LEN + sealed.len())
            .map_err(|_| GuardError::OutOfResources)?;
        stored.extend_from_slice(&encoded);
        stored.extend_from_slice(&sealed);
        Ok((stored, header))
    }

    /// Decrypt a stored payload into `output`, which ends up holding exactly the plaintext.
    ///
    /// `output` is reused as scratch space; its previous contents are overwritten.
    pub fn decrypt_into(
        &self,
        stored: &[u8],
        root_key: &RootKey,
        target: EnvelopeTarget<'_>,
        output: &mut Zeroizing<Vec<u8>>,
    ) -> GuardResult<usize> {
        let header = CipherHeader::decode(stored)?;
        let encoded = header.encode();
        let ciphertext = &stored[CipherHeader::ENCODED_LEN..];
        let key = self.entry_key(root_key, target)?;

        output.iter_mut().for_each(|byte| *byte = 0);
        output.clear();
        output
            .try_reserve(ciphertext.len())
            .map_err(|_| GuardError::OutOfResources)?;
        output.extend_from_slice(ciphertext);
        self.provider.open_in_place(
            header.algorithm,
            &key,
            &header.nonce,
            &Self::associated_data(&encoded, target),
            output,
        )?;

        if output.len() != header.plaintext_size as usize {
            return Err(GuardError::Aborted);
        }
        Ok(output.len())
    }

    /// Decrypt a stored payload into a fresh buffer.
    pub fn decrypt(
        &self,
        stored: &[u8],
        root_key: &RootKey,
        target: EnvelopeTarget<'_>,
    ) -> GuardResult<Zeroizing<Vec<u8>>> {
        let mut output = Zeroizing::new(Vec::new());
        self.decrypt_into(stored, root_key, target, &mut output)?;
        Ok(output)
    }

    /// Decrypt the payload of `record`; `Unsupported` when the record is not encrypted, in
    /// which case the stored bytes already are the plaintext.
    pub fn decrypt_record(
        &self,
        record: &DigestRecord,
        stored: &[u8],
        root_key: &RootKey,
        output: &mut Zeroizing<Vec<u8>>,
    ) -> GuardResult<usize> {
        if !record.flags.contains(RecordFlags::ENCRYPTED) {
            return Err(GuardError::Unsupported);
        }
        self.decrypt_into(stored, root_key, EnvelopeTarget::of(record), output)
    }
}

/// Plaintext size recorded in a stored encrypted payload.
pub fn plaintext_size(stored: &[u8]) -> GuardResult<usize> {
    Ok(CipherHeader::decode(stored)?.plaintext_size as usize)
}
