//! Challenge/response construction and verification.
//!
//! Both sides derive the same shared key via X25519+HKDF before these run.
//! The initiator proves knowledge of the key by sealing random challenge
//! bytes; the responder proves it back by returning their SHA-256 under the
//! same key. AEAD failures are fatal for the handshake, never retried.

use chrono::Utc;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use x25519_dalek::PublicKey;

use super::messages::{AckSecret, ChallengeSecret, PairingAck, PairingChallenge};
use crate::crypto::{self, DeviceKey};
use crate::error::PairingError;
use crate::ids::{ChallengeId, DeviceId};

/// Length of the random challenge in bytes.
pub const CHALLENGE_LEN: usize = 32;

/// Initiator side: seal fresh challenge bytes under the shared key.
pub fn build_challenge(
    key: &DeviceKey,
    initiator: &DeviceId,
    initiator_name: &str,
    initiator_pub: &PublicKey,
) -> Result<(PairingChallenge, Vec<u8>), PairingError> {
    let mut challenge_bytes = vec![0u8; CHALLENGE_LEN];
    rand::rng().fill_bytes(&mut challenge_bytes);

    let secret = ChallengeSecret {
        challenge_bytes: challenge_bytes.clone(),
        timestamp: Utc::now(),
    };
    let body = serde_json::to_vec(&secret)?;
    let sealed = crypto::seal(&body, key, initiator.as_str().as_bytes())?;

    let challenge = PairingChallenge {
        challenge_id: ChallengeId::new(),
        initiator_device_id: initiator.clone(),
        initiator_device_name: initiator_name.to_string(),
        initiator_pub_key: initiator_pub.as_bytes().to_vec(),
        nonce: sealed.nonce.to_vec(),
        ciphertext: sealed.ciphertext,
        tag: sealed.tag.to_vec(),
    };
    Ok((challenge, challenge_bytes))
}

/// Responder side: open the challenge with the derived shared key.
pub fn open_challenge(
    challenge: &PairingChallenge,
    key: &DeviceKey,
) -> Result<ChallengeSecret, PairingError> {
    let body = crypto::open(
        &challenge.ciphertext,
        key,
        &challenge.nonce,
        &challenge.tag,
        challenge.initiator_device_id.as_str().as_bytes(),
    )?;
    Ok(serde_json::from_slice(&body)?)
}

/// Responder side: prove the challenge was opened by returning its hash.
pub fn build_ack(
    key: &DeviceKey,
    responder: &DeviceId,
    responder_name: &str,
    challenge_id: ChallengeId,
    challenge_bytes: &[u8],
) -> Result<PairingAck, PairingError> {
    let secret = AckSecret {
        response_hash: Sha256::digest(challenge_bytes).to_vec(),
        issued_at: Utc::now(),
        responder_pub_key: None,
    };
    let body = serde_json::to_vec(&secret)?;
    let sealed = crypto::seal(&body, key, responder.as_str().as_bytes())?;

    Ok(PairingAck {
        challenge_id,
        responder_device_id: responder.clone(),
        responder_device_name: responder_name.to_string(),
        nonce: sealed.nonce.to_vec(),
        ciphertext: sealed.ciphertext,
        tag: sealed.tag.to_vec(),
    })
}

/// Initiator side: open the ack and compare hashes in constant time.
pub fn verify_ack(
    ack: &PairingAck,
    key: &DeviceKey,
    expected_challenge_id: &ChallengeId,
    challenge_bytes: &[u8],
) -> Result<AckSecret, PairingError> {
    if &ack.challenge_id != expected_challenge_id {
        return Err(PairingError::ChallengeMismatch);
    }

    let body = crypto::open(
        &ack.ciphertext,
        key,
        &ack.nonce,
        &ack.tag,
        ack.responder_device_id.as_str().as_bytes(),
    )?;
    let secret: AckSecret = serde_json::from_slice(&body)?;

    let expected = Sha256::digest(challenge_bytes);
    if !bool::from(expected.as_slice().ct_eq(&secret.response_hash)) {
        return Err(PairingError::ChallengeMismatch);
    }
    Ok(secret)
}
