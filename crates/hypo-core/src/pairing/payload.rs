use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey;

use crate::envelope::b64;
use crate::error::PairingError;
use crate::ids::DeviceId;

/// The out-of-band pairing offer: shown as a QR code, or claimed through the
/// relay with a short code.
///
/// Everything except `signature` is covered by an Ed25519 signature under
/// `signing_key`, so a tampered payload is rejected before any handshake
/// traffic. Expired payloads are rejected before any network activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingPayload {
    pub version: u32,
    pub device_id: DeviceId,
    pub device_name: String,
    /// X25519 public key for the shared-key derivation (32 bytes).
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
    /// Ed25519 verifying key the signature is checked against (32 bytes).
    #[serde(with = "b64")]
    pub signing_key: Vec<u8>,
    /// mDNS instance name of the issuer's embedded server, when on LAN.
    pub service_name: Option<String>,
    pub port: Option<u16>,
    /// Relay URL hint for peers that cannot reach the issuer directly.
    pub relay_hint: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

/// The signed portion, serialized with a fixed field order.
#[derive(Serialize)]
struct SignedFields<'a> {
    version: u32,
    device_id: &'a DeviceId,
    device_name: &'a str,
    #[serde(with = "b64")]
    public_key: &'a [u8],
    #[serde(with = "b64")]
    signing_key: &'a [u8],
    service_name: &'a Option<String>,
    port: Option<u16>,
    relay_hint: &'a Option<String>,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl PairingPayload {
    pub const CURRENT_VERSION: u32 = 1;

    /// Build and sign a payload for this device.
    #[allow(clippy::too_many_arguments)]
    pub fn issue(
        device_id: DeviceId,
        device_name: String,
        public_key: &PublicKey,
        signing_key: &SigningKey,
        service_name: Option<String>,
        port: Option<u16>,
        relay_hint: Option<String>,
        validity: chrono::Duration,
    ) -> Self {
        let issued_at = Utc::now();
        let mut payload = Self {
            version: Self::CURRENT_VERSION,
            device_id,
            device_name,
            public_key: public_key.as_bytes().to_vec(),
            signing_key: signing_key.verifying_key().as_bytes().to_vec(),
            service_name,
            port,
            relay_hint,
            issued_at,
            expires_at: issued_at + validity,
            signature: Vec::new(),
        };
        payload.signature = signing_key.sign(&payload.signed_bytes()).to_bytes().to_vec();
        payload
    }

    fn signed_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&SignedFields {
            version: self.version,
            device_id: &self.device_id,
            device_name: &self.device_name,
            public_key: &self.public_key,
            signing_key: &self.signing_key,
            service_name: &self.service_name,
            port: self.port,
            relay_hint: &self.relay_hint,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
        })
        .expect("signed fields serialize")
    }

    /// Check expiry then signature. Both failures are fatal for this payload.
    pub fn verify(&self, now: DateTime<Utc>) -> Result<(), PairingError> {
        if now > self.expires_at {
            return Err(PairingError::Expired);
        }

        let key_bytes: [u8; 32] = self
            .signing_key
            .as_slice()
            .try_into()
            .map_err(|_| PairingError::SignatureInvalid)?;
        let verifying_key =
            VerifyingKey::from_bytes(&key_bytes).map_err(|_| PairingError::SignatureInvalid)?;
        let signature = Signature::from_slice(&self.signature)
            .map_err(|_| PairingError::SignatureInvalid)?;

        verifying_key
            .verify(&self.signed_bytes(), &signature)
            .map_err(|_| PairingError::SignatureInvalid)
    }

    /// The issuer's X25519 key, for deriving the shared device key.
    pub fn x25519_public(&self) -> Result<PublicKey, PairingError> {
        let bytes: [u8; 32] = self
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| PairingError::SignatureInvalid)?;
        Ok(PublicKey::from(bytes))
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("pairing payload serializes")
    }

    pub fn decode(raw: &str) -> Result<Self, PairingError> {
        Ok(serde_json::from_str(raw)?)
    }
}
