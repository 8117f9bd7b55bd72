//! Responder side of the pairing handshake.
//!
//! Installed on the transport manager as the pairing text handler: every
//! inbound pairing frame (embedded server or relay) lands here. A valid
//! challenge is answered with an ack on the same path, the derived key is
//! installed, and the initiator becomes a paired device.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{info, warn};

use hypo_core::crypto::derive_shared;
use hypo_core::device::{PairedDevice, Platform};
use hypo_core::error::PairingError;
use hypo_core::ids::ChallengeId;
use hypo_core::pairing::{build_ack, open_challenge, PairingChallenge, PairingMessage};
use hypo_core::ports::DeviceKeyStore;
use hypo_net::manager::{PairingReply, PairingTextHandler, TransportManager};

use crate::identity::DeviceIdentity;

pub struct PairingResponder {
    identity: Arc<DeviceIdentity>,
    key_store: Arc<dyn DeviceKeyStore>,
    manager: TransportManager,
    /// Challenge ids already answered; a replay is fatal for that handshake.
    seen_challenges: Mutex<HashSet<ChallengeId>>,
}

impl PairingResponder {
    pub fn new(
        identity: Arc<DeviceIdentity>,
        key_store: Arc<dyn DeviceKeyStore>,
        manager: TransportManager,
    ) -> Self {
        Self {
            identity,
            key_store,
            manager,
            seen_challenges: Mutex::new(HashSet::new()),
        }
    }

    async fn handle_challenge(
        &self,
        challenge: PairingChallenge,
        reply: &PairingReply,
    ) -> Result<(), PairingError> {
        {
            let mut seen = self.seen_challenges.lock().expect("challenge set lock");
            if !seen.insert(challenge.challenge_id.clone()) {
                return Err(PairingError::DuplicateChallengeId);
            }
        }

        let initiator_pub: [u8; 32] = challenge
            .initiator_pub_key
            .as_slice()
            .try_into()
            .map_err(|_| PairingError::SignatureInvalid)?;
        let shared_key = derive_shared(
            self.identity.exchange_secret(),
            &x25519_dalek::PublicKey::from(initiator_pub),
            None,
            None,
        );

        // AEAD failure here is fatal for the handshake; no retry with the
        // same payload.
        let secret = open_challenge(&challenge, &shared_key)?;

        let ack = build_ack(
            &shared_key,
            &self.identity.device_id,
            &self.identity.name,
            challenge.challenge_id.clone(),
            &secret.challenge_bytes,
        )?;
        reply
            .send_text(PairingMessage::Ack(ack).encode())
            .await
            .map_err(|e| PairingError::Storage(e.to_string()))?;

        let initiator_id = challenge.initiator_device_id.clone();
        self.key_store
            .save(&initiator_id, &shared_key)
            .await
            .map_err(|e| PairingError::Storage(e.to_string()))?;

        let device = PairedDevice::new(
            initiator_id.clone(),
            challenge.initiator_device_name.clone(),
            Platform::Unknown,
        );
        self.manager.register_paired_device(device);
        self.manager
            .notify_pairing_completed(initiator_id.clone(), challenge.initiator_device_name);

        info!(device_id = %initiator_id, "pairing completed (responder)");
        Ok(())
    }
}

#[async_trait]
impl PairingTextHandler for PairingResponder {
    async fn on_pairing_text(&self, text: String, reply: PairingReply) {
        match PairingMessage::decode(&text) {
            Ok(PairingMessage::Challenge(challenge)) => {
                let challenge_id = challenge.challenge_id.clone();
                if let Err(e) = self.handle_challenge(challenge, &reply).await {
                    warn!(challenge_id = %challenge_id, error = %e, "pairing challenge rejected");
                }
            }
            Ok(PairingMessage::Ack(_)) => {
                // Acks are consumed by the initiator session; one landing
                // here has no matching handshake.
                warn!("stray pairing ack ignored");
            }
            Err(e) => {
                warn!(error = %e, "undecodable pairing frame ignored");
            }
        }
    }
}
