//! Authenticated Encryption with Associated Data (AEAD).
//!
//! Uses ChaCha20-Poly1305. The nonce is the 4-byte per-direction prefix
//! followed by the packet number, so a key never seals two packets with the
//! same nonce as long as packet numbers are not reused.

use chacha20poly1305::{
    aead::{Aead as AeadTrait, KeyInit, Payload},
    ChaCha20Poly1305,
};
use rand_core::{OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{Decrypter, Encrypter, KEY_SIZE, NONCE_PREFIX_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use crate::types::PacketNumber;

/// A symmetric key for AEAD operations.
///
/// Automatically zeroized when dropped.
#[derive(Clone, Debug, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a new AEAD key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a random key.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with care - this is secret key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// A nonce (number used once) for AEAD operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Nonce for `packet_number` under the given prefix.
    ///
    /// The prefix fills the first 4 bytes, the packet number the last 8
    /// (little-endian).
    pub fn for_packet(prefix: [u8; NONCE_PREFIX_SIZE], packet_number: PacketNumber) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..NONCE_PREFIX_SIZE].copy_from_slice(&prefix);
        nonce[NONCE_PREFIX_SIZE..].copy_from_slice(&packet_number.to_le_bytes());
        Self(nonce)
    }

    /// Get the raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Packet number carried by the nonce (for diagnostics).
    pub fn packet_number(&self) -> PacketNumber {
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&self.0[NONCE_PREFIX_SIZE..]);
        u64::from_le_bytes(counter)
    }
}

/// ChaCha20-Poly1305 packet sealer.
pub struct AeadEncrypter {
    cipher: ChaCha20Poly1305,
    nonce_prefix: [u8; NONCE_PREFIX_SIZE],
}

impl AeadEncrypter {
    /// Create a sealer with the given key and nonce prefix.
    pub fn new(key: &AeadKey, nonce_prefix: [u8; NONCE_PREFIX_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
            nonce_prefix,
        }
    }
}

impl Encrypter for AeadEncrypter {
    fn encrypt_packet(
        &self,
        packet_number: PacketNumber,
        associated_data: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let nonce = Nonce::for_packet(self.nonce_prefix, packet_number);
        let payload = Payload {
            msg: plaintext,
            aad: associated_data,
        };

        self.cipher
            .encrypt(nonce.as_bytes().into(), payload)
            .map_err(|_| Error::crypto("encryption failed"))
    }

    fn max_plaintext_size(&self, ciphertext_size: usize) -> usize {
        ciphertext_size.saturating_sub(TAG_SIZE)
    }

    fn ciphertext_size(&self, plaintext_size: usize) -> usize {
        plaintext_size + TAG_SIZE
    }
}

/// ChaCha20-Poly1305 packet opener.
pub struct AeadDecrypter {
    cipher: ChaCha20Poly1305,
    nonce_prefix: [u8; NONCE_PREFIX_SIZE],
}

impl AeadDecrypter {
    /// Create an opener with the given key and nonce prefix.
    pub fn new(key: &AeadKey, nonce_prefix: [u8; NONCE_PREFIX_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
            nonce_prefix,
        }
    }
}

impl Decrypter for AeadDecrypter {
    fn decrypt_packet(
        &self,
        packet_number: PacketNumber,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::Buffer {
                expected: TAG_SIZE,
                actual: ciphertext.len(),
            });
        }

        let nonce = Nonce::for_packet(self.nonce_prefix, packet_number);
        let payload = Payload {
            msg: ciphertext,
            aad: associated_data,
        };

        self.cipher
            .decrypt(nonce.as_bytes().into(), payload)
            .map_err(|_| Error::crypto("decryption/authentication failed"))
    }
}
