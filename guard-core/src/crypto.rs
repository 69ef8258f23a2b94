//! Cryptographic primitives consumed through an injected provider.
//!
//! The guard never calls a primitive directly: HMAC sessions, HKDF expansion and AEAD
//! sealing all go through [`CryptoProvider`]. [`RustCryptoProvider`] is the default backend.
use alloc::vec::Vec;
use core::fmt;

use aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use shared::store::ROOT_KEY_SIZE;
use shared::{DIGEST_SIZE, GuardError, GuardResult};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// HKDF info string used to derive the MAC key from the root key.
pub const MAC_KEY_INFO: &[u8] = b"HMAC_KEY";

/// Size of the derived MAC key.
pub const MAC_KEY_SIZE: usize = 32;

/// Size of AEAD nonces used for payload envelopes.
pub const NONCE_SIZE: usize = 12;

type HmacSha256 = Hmac<Sha256>;

/// Fixed-size MAC value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest([u8; DIGEST_SIZE]);

impl Digest {
    pub const fn from_bytes(bytes: [u8; DIGEST_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; DIGEST_SIZE] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub const fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    /// Constant-time comparison against raw bytes of any length.
    pub fn ct_matches(&self, other: &[u8]) -> bool {
        other.len() == DIGEST_SIZE && bool::from(self.0.ct_eq(other))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Platform root key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RootKey([u8; ROOT_KEY_SIZE]);

impl RootKey {
    pub const fn new(bytes: [u8; ROOT_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; ROOT_KEY_SIZE] {
        &self.0
    }

    /// HKDF-SHA256 expand of the root key with [`MAC_KEY_INFO`] and an empty salt.
    pub fn derive_mac_key<P: CryptoProvider>(&self, provider: &P) -> GuardResult<MacKey> {
        let mut key = MacKey([0u8; MAC_KEY_SIZE]);
        provider.hkdf_sha256(&self.0, &[], &[MAC_KEY_INFO], &mut key.0)?;
        Ok(key)
    }
}

impl fmt::Debug for RootKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RootKey(..)")
    }
}

/// Key of every per-entry digest and of the aggregate checksum.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MacKey([u8; MAC_KEY_SIZE]);

impl MacKey {
    pub const fn new(bytes: [u8; MAC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; MAC_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for MacKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MacKey(..)")
    }
}

/// Symmetric algorithms supported for payload envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeAlgorithm {
    /// AES-256-GCM with a 256-bit key.
    Aes256Gcm,
    /// ChaCha20-Poly1305 with a 256-bit key.
    ChaCha20Poly1305,
}

impl EnvelopeAlgorithm {
    pub const fn to_wire(self) -> u8 {
        match self {
            EnvelopeAlgorithm::Aes256Gcm => 0x01,
            EnvelopeAlgorithm::ChaCha20Poly1305 => 0x02,
        }
    }

    pub const fn from_wire(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(EnvelopeAlgorithm::Aes256Gcm),
            0x02 => Some(EnvelopeAlgorithm::ChaCha20Poly1305),
            _ => None,
        }
    }
}

/// Incremental MAC computation.
pub trait MacSession {
    fn update(&mut self, bytes: &[u8]);

    fn finalize(self) -> Digest;
}

/// Cryptographic backend injected into the guard.
pub trait CryptoProvider {
    type Session: MacSession;

    /// Start an HMAC-SHA256 session keyed with `key`.
    fn mac_session(&self, key: &[u8]) -> GuardResult<Self::Session>;

    /// HKDF-SHA256 extract-and-expand into `okm`; `info` parts are concatenated.
    fn hkdf_sha256(&self, ikm: &[u8], salt: &[u8], info: &[&[u8]], okm: &mut [u8])
    -> GuardResult<()>;

    /// Encrypt `buffer` in place, appending the authentication tag.
    fn seal_in_place(
        &self,
        algorithm: EnvelopeAlgorithm,
        key: &[u8; 32],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        buffer: &mut Vec<u8>,
    ) -> GuardResult<()>;

    /// Authenticate and decrypt `buffer` in place, stripping the tag.
    fn open_in_place(
        &self,
        algorithm: EnvelopeAlgorithm,
        key: &[u8; 32],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        buffer: &mut Vec<u8>,
    ) -> GuardResult<()>;

    /// Length of the tag appended by [`CryptoProvider::seal_in_place`].
    fn tag_len(&self, _algorithm: EnvelopeAlgorithm) -> usize {
        16
    }
}

/// Default provider backed by the RustCrypto crates.
#[derive(Debug, Clone, Copy, Default)]
pub struct RustCryptoProvider;

/// HMAC-SHA256 session of [`RustCryptoProvider`].
pub struct HmacSha256Session(HmacSha256);

impl MacSession for HmacSha256Session {
    fn update(&mut self, bytes: &[u8]) {
        Mac::update(&mut self.0, bytes);
    }

    fn finalize(self) -> Digest {
        Digest(Mac::finalize(self.0).into_bytes().into())
    }
}

impl CryptoProvider for RustCryptoProvider {
    type Session = HmacSha256Session;

    fn mac_session(&self, key: &[u8]) -> GuardResult<Self::Session> {
        <HmacSha256 as Mac>::new_from_slice(key)
            .map(HmacSha256Session)
            .map_err(|_| GuardError::InvalidParameter("mac key length"))
    }

    fn hkdf_sha256(
        &self,
        ikm: &[u8],
        salt: &[u8],
        info: &[&[u8]],
        okm: &mut [u8],
    ) -> GuardResult<()> {
        let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
        hkdf.expand_multi_info(info, okm)
            .map_err(|_| GuardError::InvalidParameter("hkdf output length"))
    }

    fn seal_in_place(
        &self,
        algorithm: EnvelopeAlgorithm,
        key: &[u8; 32],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        buffer: &mut Vec<u8>,
    ) -> GuardResult<()> {
        match algorithm {
            EnvelopeAlgorithm::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| GuardError::Aborted)?;
                cipher
                    .encrypt_in_place(aes_gcm::Nonce::from_slice(nonce), aad, buffer)
                    .map_err(|_| GuardError::Aborted)
            }
            EnvelopeAlgorithm::ChaCha20Poly1305 => {
                let cipher =
                    ChaCha20Poly1305::new_from_slice(key).map_err(|_| GuardError::Aborted)?;
                cipher
                    .encrypt_in_place(chacha20poly1305::Nonce::from_slice(nonce), aad, buffer)
                    .map_err(|_| GuardError::Aborted)
            }
        }
    }

    fn open_in_place(
        &self,
        algorithm: EnvelopeAlgorithm,
        key: &[u8; 32],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        buffer: &mut Vec<u8>,
    ) -> GuardResult<()> {
        match algorithm {
            EnvelopeAlgorithm::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| GuardError::Aborted)?;
                cipher
                    .decrypt_in_place(aes_gcm::Nonce::from_slice(nonce), aad, buffer)
                    .map_err(|_| GuardError::Aborted)
            }
            EnvelopeAlgorithm::ChaCha20Poly1305 => {
                let cipher =
                    ChaCha20Poly1305::new_from_slice(key).map_err(|_| GuardError::Aborted)?;
                cipher
                    .decrypt_in_place(chacha20poly1305::Nonce::from_slice(nonce), aad, buffer)
                    .map_err(|_| GuardError::Aborted)
            }
        }
    }
}

/// Root key and the MAC key derived from it.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    pub root: RootKey,
    pub mac: MacKey,
}

impl KeyMaterial {
    pub fn derive<P: CryptoProvider>(root: RootKey, provider: &P) -> GuardResult<Self> {
        let mac = root.derive_mac_key(provider)?;
        Ok(Self { root, mac })
    }
}
