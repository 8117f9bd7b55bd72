//! LAN-first delivery with cloud fallback.
//!
//! Given a target device, try the directly reachable peer first under a
//! short probe timeout, then fall through to the relay. The whole dispatch
//! is one future: dropping it cancels both attempts, and nothing outlives
//! the send.

use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use hypo_core::envelope::SyncEnvelope;
use hypo_core::error::DispatcherError;
use hypo_core::events::TransportKind;
use hypo_core::ids::DeviceId;

use crate::manager::TransportManager;

/// How long one LAN delivery attempt may take before falling through.
pub const LAN_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub struct FallbackDispatcher {
    manager: TransportManager,
}

impl FallbackDispatcher {
    pub fn new(manager: TransportManager) -> Self {
        Self { manager }
    }

    pub async fn dispatch(
        &self,
        envelope: SyncEnvelope,
        target: &DeviceId,
    ) -> Result<TransportKind, DispatcherError> {
        let known = self.manager.is_known_device(target).await;

        // A peer that dialed us has a live inbound connection; that is the
        // cheapest LAN path and the only one for peers we cannot dial back.
        if let Some(server) = self.manager.server().await {
            if let Some(addr) = server.connection_for_device(target).await {
                match timeout(LAN_PROBE_TIMEOUT, server.send_envelope(addr, &envelope)).await {
                    Ok(Ok(())) => {
                        self.manager
                            .record_successful_transport(target, TransportKind::Lan);
                        return Ok(TransportKind::Lan);
                    }
                    Ok(Err(e)) => {
                        debug!(target = %target, error = %e, "inbound connection reuse failed");
                    }
                    Err(_) => {
                        debug!(target = %target, "inbound connection reuse timed out");
                    }
                }
            }
        }

        // A peer with a usable LAN endpoint gets the direct attempt; hosts
        // that never resolved ("unknown") or are loopback skip straight to
        // the relay.
        if let Some(endpoint) = self.manager.lan_endpoint_for(target).await {
            let transport = self.manager.lan_transport_for(target, &endpoint).await;
            match timeout(LAN_PROBE_TIMEOUT, transport.send(envelope.clone())).await {
                Ok(Ok(())) => {
                    self.manager
                        .record_successful_transport(target, TransportKind::Lan);
                    return Ok(TransportKind::Lan);
                }
                Ok(Err(e)) => {
                    debug!(target = %target, error = %e, "LAN attempt failed, trying cloud");
                }
                Err(_) => {
                    debug!(target = %target, "LAN attempt timed out, trying cloud");
                }
            }
        }

        match self.manager.cloud_transport().await {
            Some(cloud) => {
                cloud.send(envelope).await.map_err(|e| {
                    warn!(target = %target, error = %e, "cloud delivery failed");
                    DispatcherError::Transport(e)
                })?;
                self.manager
                    .record_successful_transport(target, TransportKind::Cloud);
                Ok(TransportKind::Cloud)
            }
            None if known => Err(DispatcherError::NoRoute(target.clone())),
            None => Err(DispatcherError::PeerUnknown(target.clone())),
        }
    }
}
