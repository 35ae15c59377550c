//! Integrity-only packet protection for unencrypted packets.
//!
//! The sealed form is `fnv1a64(associated_data || plaintext) || plaintext`.

use crate::crypto::{Decrypter, Encrypter, NULL_TAG_SIZE};
use crate::error::{Error, Result};
use crate::types::PacketNumber;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a64(parts: &[&[u8]]) -> u64 {
    let mut hash = FNV_OFFSET;
    for part in parts {
        for &byte in *part {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}

/// Encrypter for `EncryptionLevel::None`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEncrypter;

impl Encrypter for NullEncrypter {
    fn encrypt_packet(
        &self,
        _packet_number: PacketNumber,
        associated_data: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let tag = fnv1a64(&[associated_data, plaintext]);
        let mut out = Vec::with_capacity(NULL_TAG_SIZE + plaintext.len());
        out.extend_from_slice(&tag.to_be_bytes());
        out.extend_from_slice(plaintext);
        Ok(out)
    }

    fn max_plaintext_size(&self, ciphertext_size: usize) -> usize {
        ciphertext_size.saturating_sub(NULL_TAG_SIZE)
    }

    fn ciphertext_size(&self, plaintext_size: usize) -> usize {
        plaintext_size + NULL_TAG_SIZE
    }
}

/// Decrypter for `EncryptionLevel::None`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDecrypter;

impl Decrypter for NullDecrypter {
    fn decrypt_packet(
        &self,
        _packet_number: PacketNumber,
        associated_data: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        if ciphertext.len() < NULL_TAG_SIZE {
            return Err(Error::Buffer {
                expected: NULL_TAG_SIZE,
                actual: ciphertext.len(),
            });
        }
        let (tag, plaintext) = ciphertext.split_at(NULL_TAG_SIZE);
        let mut expected = [0u8; NULL_TAG_SIZE];
        expected.copy_from_slice(tag);
        if u64::from_be_bytes(expected) != fnv1a64(&[associated_data, plaintext]) {
            return Err(Error::crypto("null tag mismatch"));
        }
        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_seal_open() {
        let sealed = NullEncrypter.encrypt_packet(1, b"ad", b"frames").unwrap();
        assert_eq!(sealed.len(), NullEncrypter.ciphertext_size(6));

        let opened = NullDecrypter.decrypt_packet(1, b"ad", &sealed).unwrap();
        assert_eq!(opened, b"frames");
    }

    #[test]
    fn test_null_detects_tampering() {
        let mut sealed = NullEncrypter.encrypt_packet(1, b"ad", b"frames").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(NullDecrypter.decrypt_packet(1, b"ad", &sealed).is_err());

        let sealed = NullEncrypter.encrypt_packet(1, b"ad", b"frames").unwrap();
        assert!(NullDecrypter.decrypt_packet(1, b"other", &sealed).is_err());
        assert!(NullDecrypter.decrypt_packet(1, b"ad", &sealed[..4]).is_err());
    }
}
