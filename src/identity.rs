//! The local device's long-term identity.

use ed25519_dalek::SigningKey;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use hypo_core::crypto::IdentityFingerprint;
use hypo_core::device::Platform;
use hypo_core::ids::DeviceId;
use hypo_core::pairing::PairingPayload;

/// Long-term keys and naming for this device.
///
/// The Ed25519 key signs pairing payloads and anchors the identity
/// fingerprint; the X25519 secret is this device's side of every pairing
/// key agreement. Both persist for the lifetime of the install; losing them
/// requires re-pairing.
pub struct DeviceIdentity {
    pub device_id: DeviceId,
    pub name: String,
    pub platform: Platform,
    signing_key: SigningKey,
    exchange_secret: StaticSecret,
}

impl DeviceIdentity {
    /// Fresh identity with a random device id and keys.
    pub fn generate(name: impl Into<String>, platform: Platform) -> Self {
        let mut signing_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut signing_bytes);

        Self {
            device_id: DeviceId::new(uuid::Uuid::new_v4().to_string()),
            name: name.into(),
            platform,
            signing_key: SigningKey::from_bytes(&signing_bytes),
            exchange_secret: StaticSecret::random(),
        }
    }

    /// Rebuild an identity from persisted key material.
    pub fn from_parts(
        device_id: DeviceId,
        name: impl Into<String>,
        platform: Platform,
        signing_key_bytes: [u8; 32],
        exchange_secret_bytes: [u8; 32],
    ) -> Self {
        Self {
            device_id,
            name: name.into(),
            platform,
            signing_key: SigningKey::from_bytes(&signing_key_bytes),
            exchange_secret: StaticSecret::from(exchange_secret_bytes),
        }
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn exchange_secret(&self) -> &StaticSecret {
        &self.exchange_secret
    }

    pub fn exchange_public(&self) -> PublicKey {
        PublicKey::from(&self.exchange_secret)
    }

    pub fn fingerprint(&self) -> IdentityFingerprint {
        IdentityFingerprint::from_public_key(self.signing_key.verifying_key().as_bytes())
    }

    /// Issue a signed pairing offer for display as a QR code (or claim via
    /// the relay).
    pub fn issue_pairing_payload(
        &self,
        service_name: Option<String>,
        port: Option<u16>,
        relay_hint: Option<String>,
        validity: chrono::Duration,
    ) -> PairingPayload {
        PairingPayload::issue(
            self.device_id.clone(),
            self.name.clone(),
            &self.exchange_public(),
            &self.signing_key,
            service_name,
            port,
            relay_hint,
            validity,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_generated_identities_are_distinct() {
        let a = DeviceIdentity::generate("Desk", Platform::MacOS);
        let b = DeviceIdentity::generate("Phone", Platform::Android);
        assert_ne!(a.device_id, b.device_id);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_issued_payload_verifies() {
        let identity = DeviceIdentity::generate("Desk", Platform::MacOS);
        let payload = identity.issue_pairing_payload(
            Some("desk._hypo._tcp.local.".into()),
            Some(9010),
            None,
            chrono::Duration::minutes(5),
        );
        assert!(payload.verify(Utc::now()).is_ok());
        assert_eq!(payload.device_id, identity.device_id);
    }

    #[test]
    fn test_from_parts_is_deterministic() {
        let a = DeviceIdentity::from_parts(
            DeviceId::new("6ba7b810-9dad-11d1-80b4-00c04fd430c8"),
            "Desk",
            Platform::MacOS,
            [7u8; 32],
            [9u8; 32],
        );
        let b = DeviceIdentity::from_parts(
            DeviceId::new("6ba7b810-9dad-11d1-80b4-00c04fd430c8"),
            "Desk",
            Platform::MacOS,
            [7u8; 32],
            [9u8; 32],
        );
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(
            a.exchange_public().as_bytes(),
            b.exchange_public().as_bytes()
        );
    }
}
