//! Construction and wiring of the sync core.
//!
//! Every service is constructor-injected; there are no global singletons.
//! The builder owns the wiring order: transport manager first, then the
//! engine's inbound handler and the pairing responder are installed into
//! their single slots, then everything starts.

use std::sync::Arc;

use anyhow::Result;

use hypo_core::config::SyncConfig;
use hypo_core::ports::{ClipboardSink, DeviceKeyStore};
use hypo_infra::{KeyringDeviceKeyStore, MemoryDeviceKeyStore};
use hypo_net::discovery::DiscoveryConfig;
use hypo_net::TransportManager;

use crate::engine::SyncEngine;
use crate::identity::DeviceIdentity;
use crate::pairing::{PairingInitiator, PairingResponder};

pub struct SyncCoreBuilder {
    identity: DeviceIdentity,
    config: SyncConfig,
    key_store: Option<Arc<dyn DeviceKeyStore>>,
    clipboard_sink: Option<Arc<dyn ClipboardSink>>,
    instance_name: Option<String>,
    loopback_rewrite: Option<String>,
}

impl SyncCoreBuilder {
    pub fn new(identity: DeviceIdentity, config: SyncConfig) -> Self {
        Self {
            identity,
            config,
            key_store: None,
            clipboard_sink: None,
            instance_name: None,
            loopback_rewrite: None,
        }
    }

    /// Override the key store (tests use the in-memory one).
    pub fn with_key_store(mut self, key_store: Arc<dyn DeviceKeyStore>) -> Self {
        self.key_store = Some(key_store);
        self
    }

    pub fn with_memory_key_store(self) -> Self {
        self.with_key_store(Arc::new(MemoryDeviceKeyStore::new()))
    }

    pub fn with_clipboard_sink(mut self, sink: Arc<dyn ClipboardSink>) -> Self {
        self.clipboard_sink = Some(sink);
        self
    }

    /// mDNS instance name; defaults to the device name.
    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = Some(name.into());
        self
    }

    /// Host substituted for loopback peers advertised by emulator targets.
    pub fn with_loopback_rewrite(mut self, host: impl Into<String>) -> Self {
        self.loopback_rewrite = Some(host.into());
        self
    }

    pub fn build(self) -> SyncCore {
        let identity = Arc::new(self.identity);
        let key_store: Arc<dyn DeviceKeyStore> = self
            .key_store
            .unwrap_or_else(|| Arc::new(KeyringDeviceKeyStore::new()));

        let mut discovery = DiscoveryConfig::new(
            self.instance_name
                .unwrap_or_else(|| identity.name.clone()),
            identity.device_id.clone(),
            0,
        );
        discovery.fingerprint = identity.fingerprint().as_hex().to_string();
        discovery.loopback_rewrite = self.loopback_rewrite;

        let manager = TransportManager::new(
            identity.device_id.clone(),
            self.config.clone(),
            discovery,
        );

        let engine = SyncEngine::new(
            &identity,
            self.config,
            key_store.clone(),
            Arc::new(manager.clone()),
        );
        if let Some(sink) = self.clipboard_sink {
            engine.set_clipboard_sink(sink);
        }

        let responder = Arc::new(PairingResponder::new(
            identity.clone(),
            key_store.clone(),
            manager.clone(),
        ));
        let initiator = PairingInitiator::new(identity.clone(), key_store.clone(), manager.clone());

        manager.set_incoming_clipboard_handler(engine.inbound_handler());
        manager.set_pairing_handler(responder.clone());

        SyncCore {
            identity,
            key_store,
            engine,
            manager,
            initiator,
            responder,
        }
    }
}

/// The assembled sync core.
pub struct SyncCore {
    pub identity: Arc<DeviceIdentity>,
    pub key_store: Arc<dyn DeviceKeyStore>,
    pub engine: SyncEngine,
    pub manager: TransportManager,
    pub initiator: PairingInitiator,
    pub responder: Arc<PairingResponder>,
}

impl SyncCore {
    /// Bring up the transport layer and the queue processor.
    pub async fn start(&self) -> Result<()> {
        self.manager.start().await?;
        self.engine.start().await;
        Ok(())
    }

    /// Orderly shutdown; cancellation cascades to every descendant task.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
        self.manager.shutdown().await;
    }

    /// Un-pair: drop the stored key, the paired record and route history.
    pub async fn unpair(&self, device_id: &hypo_core::ids::DeviceId) -> Result<()> {
        self.key_store.delete(device_id).await?;
        self.manager.unregister_paired_device(device_id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypo_core::device::Platform;
    use hypo_core::ports::SyncTransportPort;

    #[tokio::test]
    async fn test_builder_wires_a_core() {
        let identity = DeviceIdentity::generate("Desk", Platform::MacOS);
        let core = SyncCoreBuilder::new(identity, SyncConfig::lan())
            .with_memory_key_store()
            .build();

        assert!(core.manager.paired_devices().is_empty());
        assert_eq!(core.engine.queued_len(), 0);
    }

    #[tokio::test]
    async fn test_unpair_removes_key_and_device() {
        let identity = DeviceIdentity::generate("Desk", Platform::MacOS);
        let core = SyncCoreBuilder::new(identity, SyncConfig::lan())
            .with_memory_key_store()
            .build();

        let peer = hypo_core::ids::DeviceId::new("7ba7b810-9dad-11d1-80b4-00c04fd430c8");
        core.key_store
            .save(&peer, &hypo_core::crypto::DeviceKey::new([1u8; 32]))
            .await
            .unwrap();
        core.manager
            .register_paired_device(hypo_core::device::PairedDevice::new(
                peer.clone(),
                "Phone",
                Platform::Android,
            ));

        core.unpair(&peer).await.unwrap();
        assert!(core.key_store.load(&peer).await.unwrap().is_none());
        assert!(core.manager.paired_devices().is_empty());
    }
}
