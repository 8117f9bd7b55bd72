//! Initiator side of the pairing handshake.
//!
//! The user scanned the responder's QR payload (or claimed it with a remote
//! code). Verify it offline, derive the shared key, dial the responder
//! (LAN endpoint first, relay hint otherwise) and run challenge/ack over
//! pairing text frames. On success the key is installed and the peer is
//! registered as paired.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use hypo_core::crypto::{derive_shared, IdentityFingerprint};
use hypo_core::device::{PairedDevice, Platform};
use hypo_core::error::{PairingError, TransportError};
use hypo_core::pairing::{build_challenge, verify_ack, PairingMessage, PairingPayload};
use hypo_core::ports::DeviceKeyStore;
use hypo_net::transport::{TransportEvent, WsTransport};
use hypo_net::TransportManager;

use crate::identity::DeviceIdentity;

/// How long the initiator waits for the responder's ack.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PairingInitiator {
    identity: Arc<DeviceIdentity>,
    key_store: Arc<dyn DeviceKeyStore>,
    manager: TransportManager,
}

impl PairingInitiator {
    pub fn new(
        identity: Arc<DeviceIdentity>,
        key_store: Arc<dyn DeviceKeyStore>,
        manager: TransportManager,
    ) -> Self {
        Self {
            identity,
            key_store,
            manager,
        }
    }

    /// Run the full handshake against the device that issued `payload`.
    pub async fn pair_with_payload(
        &self,
        payload: PairingPayload,
    ) -> Result<PairedDevice, PairingError> {
        // Expired or tampered payloads are rejected before any network
        // activity.
        payload.verify(Utc::now())?;

        let peer_id = payload.device_id.clone();
        let shared_key = derive_shared(
            self.identity.exchange_secret(),
            &payload.x25519_public()?,
            None,
            None,
        );

        let url = self.resolve_url(&payload).await?;
        debug!(device_id = %peer_id, url = %url, "dialing pairing endpoint");

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let transport = WsTransport::new(
            hypo_core::config::SyncConfig::lan(),
            self.identity.device_id.clone(),
            events_tx,
        );
        transport.start().await;
        transport.set_peer_url(Some(url));

        let result = self
            .run_handshake(&transport, &mut events_rx, &payload, &shared_key)
            .await;
        transport.close().await;

        let ack = result?;

        self.key_store
            .save(&peer_id, &shared_key)
            .await
            .map_err(|e| PairingError::Storage(e.to_string()))?;

        let mut device = PairedDevice::new(
            peer_id.clone(),
            ack.responder_device_name.clone(),
            Platform::Unknown,
        );
        device.service_name = payload.service_name.clone();
        device.port = payload.port;
        device.fingerprint = Some(
            IdentityFingerprint::from_public_key(&payload.signing_key)
                .as_hex()
                .to_string(),
        );
        self.manager.register_paired_device(device.clone());
        self.manager
            .notify_pairing_completed(peer_id.clone(), device.name.clone());

        info!(device_id = %peer_id, name = %device.name, "pairing completed");
        Ok(device)
    }

    async fn run_handshake(
        &self,
        transport: &WsTransport,
        events_rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
        payload: &PairingPayload,
        shared_key: &hypo_core::crypto::DeviceKey,
    ) -> Result<hypo_core::pairing::PairingAck, PairingError> {
        let (challenge, challenge_bytes) = build_challenge(
            shared_key,
            &self.identity.device_id,
            &self.identity.name,
            &self.identity.exchange_public(),
        )?;
        let challenge_id = challenge.challenge_id.clone();

        transport
            .send_text(PairingMessage::Challenge(challenge).encode())
            .await?;

        let ack = tokio::time::timeout(ACK_TIMEOUT, async {
            while let Some(event) = events_rx.recv().await {
                if let TransportEvent::PairingText(text) = event {
                    match PairingMessage::decode(&text) {
                        Ok(PairingMessage::Ack(ack)) => return Some(ack),
                        Ok(_) => continue,
                        Err(e) => {
                            debug!(error = %e, "ignoring unparseable pairing frame");
                            continue;
                        }
                    }
                }
            }
            None
        })
        .await
        .map_err(|_| PairingError::Transport(TransportError::HandshakeTimeout))?
        .ok_or(PairingError::Transport(TransportError::SocketClosed {
            code: None,
        }))?;

        if ack.responder_device_id != payload.device_id {
            return Err(PairingError::ChallengeMismatch);
        }
        verify_ack(&ack, shared_key, &challenge_id, &challenge_bytes)?;
        Ok(ack)
    }

    /// LAN endpoint first (discovery, then the payload's advertised
    /// service), relay hint as the fallback.
    async fn resolve_url(&self, payload: &PairingPayload) -> Result<String, PairingError> {
        if let Some(url) = self.manager.lan_endpoint_for(&payload.device_id).await {
            return Ok(url);
        }
        if let Some(relay) = &payload.relay_hint {
            return Ok(relay.clone());
        }
        Err(PairingError::Transport(TransportError::ConnectRefused(
            "no LAN endpoint discovered and no relay hint in payload".to_string(),
        )))
    }
}
