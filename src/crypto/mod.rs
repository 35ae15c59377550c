//! Packet protection.
//!
//! The connection never sees keys: it installs [`Encrypter`]s on the packet
//! generator and [`Decrypter`]s on the framer, one per encryption level. The
//! handshake that derives keys lives outside this crate.
//!
//! Two implementations ship here:
//! - [`NullEncrypter`]/[`NullDecrypter`]: an integrity tag only, used for
//!   `EncryptionLevel::None`
//! - [`AeadEncrypter`]/[`AeadDecrypter`]: ChaCha20-Poly1305 keyed by the
//!   handshake, nonce derived from the packet number

mod aead;
mod null;

pub use aead::{AeadDecrypter, AeadEncrypter, AeadKey, Nonce};
pub use null::{NullDecrypter, NullEncrypter};

use crate::error::Result;
use crate::types::PacketNumber;

/// Size of symmetric keys in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of AEAD nonce in bytes (96 bits for ChaCha20-Poly1305)
pub const NONCE_SIZE: usize = 12;

/// Size of the per-direction nonce prefix
pub const NONCE_PREFIX_SIZE: usize = 4;

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Size of the null integrity tag
pub const NULL_TAG_SIZE: usize = 8;

/// Seals packet payloads.
pub trait Encrypter {
    /// Encrypt `plaintext`, authenticating `associated_data` (the public header).
    fn encrypt_packet(
        &self,
        packet_number: PacketNumber,
        associated_data: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>>;

    /// Largest plaintext that fits in `ciphertext_size` bytes.
    fn max_plaintext_size(&self, ciphertext_size: usize) -> usize;

    /// Ciphertext length for `plaintext_size` bytes.
    fn ciphertext_size(&self, plaintext_size: usize) -> usize;
}

/// Opens packet payloads.
pub trait Decrypter {
    /// Decrypt `ciphertext`, verifying `associated_data`.
    fn decrypt_packet(
        &self,
        packet_number: PacketNumber,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_and_aead_are_not_interchangeable() {
        let key = AeadKey::from_bytes([7u8; KEY_SIZE]);
        let aead = AeadEncrypter::new(&key, [1, 2, 3, 4]);
        let sealed = aead.encrypt_packet(9, b"header", b"payload").unwrap();

        assert!(NullDecrypter.decrypt_packet(9, b"header", &sealed).is_err());

        let null_sealed = NullEncrypter.encrypt_packet(9, b"header", b"payload").unwrap();
        let opener = AeadDecrypter::new(&key, [1, 2, 3, 4]);
        assert!(opener.decrypt_packet(9, b"header", &null_sealed).is_err());
    }
}
