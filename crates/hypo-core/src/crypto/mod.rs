//! Cryptographic services: AEAD sealing, key agreement, identity fingerprints.
//!
//! Primitives are fixed by the wire protocol: AES-256-GCM (96-bit nonce,
//! 128-bit tag), X25519 for agreement, HKDF-SHA256 for derivation.

pub mod aead;
pub mod fingerprint;
pub mod key_exchange;

mod device_key;

pub use aead::{open, seal, SealedBox, NONCE_LEN, TAG_LEN};
pub use device_key::{DeviceKey, KEY_LEN};
pub use fingerprint::IdentityFingerprint;
pub use key_exchange::{derive_shared, generate_keypair};
