//! AEAD seal/open with AES-256-GCM.
//!
//! Every seal generates a fresh random 96-bit nonce; callers must not
//! persist and reuse nonces. The 128-bit tag travels separately from the
//! ciphertext on the wire.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::RngCore;

use super::device_key::DeviceKey;
use crate::error::AeadError;

/// Nonce length in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Authentication tag length in bytes (128 bits).
pub const TAG_LEN: usize = 16;

/// Output of one seal operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBox {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
}

/// Encrypt `plaintext` under `key`, binding the optional `aad`.
pub fn seal(plaintext: &[u8], key: &DeviceKey, aad: &[u8]) -> Result<SealedBox, AeadError> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    seal_with_nonce(plaintext, key, aad, nonce)
}

fn seal_with_nonce(
    plaintext: &[u8],
    key: &DeviceKey,
    aad: &[u8],
    nonce: [u8; NONCE_LEN],
) -> Result<SealedBox, AeadError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let mut sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| AeadError::Decrypt)?;

    // aes-gcm appends the tag to the ciphertext; the wire carries it apart.
    if sealed.len() < TAG_LEN {
        return Err(AeadError::Decrypt);
    }
    let tag_bytes = sealed.split_off(sealed.len() - TAG_LEN);
    let tag: [u8; TAG_LEN] = tag_bytes.as_slice().try_into().expect("tag length");

    Ok(SealedBox {
        ciphertext: sealed,
        nonce,
        tag,
    })
}

/// Decrypt a sealed payload. Any failure is fatal for this envelope; the
/// same inputs will never succeed on retry.
pub fn open(
    ciphertext: &[u8],
    key: &DeviceKey,
    nonce: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, AeadError> {
    if nonce.len() != NONCE_LEN || tag.len() != TAG_LEN {
        return Err(AeadError::Decrypt);
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let mut combined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);

    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: &combined,
                aad,
            },
        )
        .map_err(|_| AeadError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DeviceKey {
        DeviceKey::new([0xAA; 32])
    }

    #[test]
    fn test_seal_open_roundtrip_with_fixed_vector() {
        // Key = 32 x 0xAA, nonce = 12 x 0xAB, AAD = "device-id".
        let sealed =
            seal_with_nonce(b"hello, hypo", &key(), b"device-id", [0xAB; NONCE_LEN]).unwrap();

        let plain = open(
            &sealed.ciphertext,
            &key(),
            &sealed.nonce,
            &sealed.tag,
            b"device-id",
        )
        .unwrap();
        assert_eq!(plain, b"hello, hypo");
    }

    #[test]
    fn test_bit_flip_in_ciphertext_fails() {
        let mut sealed =
            seal_with_nonce(b"hello, hypo", &key(), b"device-id", [0xAB; NONCE_LEN]).unwrap();
        sealed.ciphertext[0] ^= 0x01;

        let result = open(
            &sealed.ciphertext,
            &key(),
            &sealed.nonce,
            &sealed.tag,
            b"device-id",
        );
        assert_eq!(result, Err(AeadError::Decrypt));
    }

    #[test]
    fn test_aad_binding() {
        // Sealed under AAD "A" must not open under AAD "B".
        let sealed = seal(b"payload", &key(), b"A").unwrap();
        let result = open(&sealed.ciphertext, &key(), &sealed.nonce, &sealed.tag, b"B");
        assert_eq!(result, Err(AeadError::Decrypt));
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let a = seal(b"x", &key(), b"").unwrap();
        let b = seal(b"x", &key(), b"").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(b"secret", &key(), b"aad").unwrap();
        let other = DeviceKey::new([0xBB; 32]);
        let result = open(&sealed.ciphertext, &other, &sealed.nonce, &sealed.tag, b"aad");
        assert_eq!(result, Err(AeadError::Decrypt));
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let sealed = seal(b"", &key(), b"aad").unwrap();
        assert!(sealed.ciphertext.is_empty());
        let plain = open(&sealed.ciphertext, &key(), &sealed.nonce, &sealed.tag, b"aad").unwrap();
        assert!(plain.is_empty());
    }
}
