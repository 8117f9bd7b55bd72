//! X25519 key agreement with HKDF-SHA256 derivation.
//!
//! Both sides of a pairing run `derive_shared` with their own private key and
//! the peer's public key; identical inputs on both sides yield the same
//! 32-byte device key.

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use super::device_key::{DeviceKey, KEY_LEN};

/// Domain separation for the derived device key.
const DEFAULT_INFO: &[u8] = b"hypo-sync v1 device key";

/// Generate a fresh X25519 keypair.
pub fn generate_keypair() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random();
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// ECDH then HKDF-SHA256 into a 32-byte symmetric key.
pub fn derive_shared(
    own_priv: &StaticSecret,
    peer_pub: &PublicKey,
    salt: Option<&[u8]>,
    info: Option<&[u8]>,
) -> DeviceKey {
    let shared = own_priv.diffie_hellman(peer_pub);

    let hk = Hkdf::<Sha256>::new(salt, shared.as_bytes());
    let mut okm = [0u8; KEY_LEN];
    hk.expand(info.unwrap_or(DEFAULT_INFO), &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");

    DeviceKey::new(okm)
}
