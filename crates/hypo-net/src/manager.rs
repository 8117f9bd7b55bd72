//! The transport manager: owns discovery, the cloud transport, per-peer LAN
//! transports, the embedded server, and the connection-state machine shown
//! to the UI.
//!
//! Mutable state is updated only by the manager's own pump tasks; observers
//! read snapshots. The sync engine installs an inbound handler once at
//! startup and otherwise talks to the manager through the
//! [`SyncTransportPort`] capability, which keeps the two acyclic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, RwLock as StdRwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hypo_core::config::{Environment, SyncConfig};
use hypo_core::device::PairedDevice;
use hypo_core::envelope::SyncEnvelope;
use hypo_core::error::DispatcherError;
use hypo_core::events::{ConnectionState, NetworkEvent, TransportKind};
use hypo_core::ids::DeviceId;
use hypo_core::ports::SyncTransportPort;

use crate::discovery::{Discovery, DiscoveryConfig, DiscoveryEvent};
use crate::dispatcher::FallbackDispatcher;
use crate::server::{ServerEvent, WsServer};
use crate::transport::{TransportEvent, WsTransport};

/// Close codes the manager interprets as server-initiated.
const SERVER_INITIATED_CODES: &[u16] = &[1001, 1006, 1011, 1015];

/// Raw inbound envelopes, decrypted and deduplicated by the sync engine.
#[async_trait]
pub trait InboundEnvelopeHandler: Send + Sync {
    async fn on_envelope(&self, envelope: SyncEnvelope);
}

/// Inbound pairing text frames, handled by the pairing responder.
#[async_trait]
pub trait PairingTextHandler: Send + Sync {
    async fn on_pairing_text(&self, text: String, reply: PairingReply);
}

/// Where a pairing reply goes: back down the same server connection, or out
/// through the transport the challenge arrived on.
#[derive(Clone)]
pub struct PairingReply {
    via: ReplyVia,
}

#[derive(Clone)]
enum ReplyVia {
    Server { server: Arc<WsServer>, addr: SocketAddr },
    Transport(WsTransport),
}

impl PairingReply {
    pub async fn send_text(&self, text: String) -> anyhow::Result<()> {
        match &self.via {
            ReplyVia::Server { server, addr } => server.send_text(*addr, text).await,
            ReplyVia::Transport(transport) => Ok(transport.send_text(text).await?),
        }
    }
}

struct ManagerInner {
    local_device: DeviceId,
    config: SyncConfig,

    paired: StdRwLock<HashMap<DeviceId, PairedDevice>>,
    last_successful: StdRwLock<HashMap<DeviceId, TransportKind>>,

    discovery: Discovery,
    cloud: RwLock<Option<WsTransport>>,
    lan: RwLock<HashMap<DeviceId, WsTransport>>,
    server: RwLock<Option<Arc<WsServer>>>,

    connection_state_tx: watch::Sender<ConnectionState>,
    network_events_tx: broadcast::Sender<NetworkEvent>,

    inbound_handler: OnceLock<Arc<dyn InboundEnvelopeHandler>>,
    pairing_handler: OnceLock<Arc<dyn PairingTextHandler>>,

    transport_events_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    server_events_tx: mpsc::UnboundedSender<ServerEvent>,
    server_events_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct TransportManager {
    inner: Arc<ManagerInner>,
}

impl TransportManager {
    pub fn new(local_device: DeviceId, config: SyncConfig, discovery: DiscoveryConfig) -> Self {
        let (connection_state_tx, _) = watch::channel(ConnectionState::Idle);
        let (network_events_tx, _) = broadcast::channel(64);
        let (transport_events_tx, transport_events_rx) = mpsc::unbounded_channel();
        let (server_events_tx, server_events_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(ManagerInner {
                local_device,
                config,
                paired: StdRwLock::new(HashMap::new()),
                last_successful: StdRwLock::new(HashMap::new()),
                discovery: Discovery::new(discovery),
                cloud: RwLock::new(None),
                lan: RwLock::new(HashMap::new()),
                server: RwLock::new(None),
                connection_state_tx,
                network_events_tx,
                inbound_handler: OnceLock::new(),
                pairing_handler: OnceLock::new(),
                transport_events_tx,
                transport_events_rx: Mutex::new(Some(transport_events_rx)),
                server_events_tx,
                server_events_rx: Mutex::new(Some(server_events_rx)),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Bring the whole transport layer up: embedded server, discovery
    /// (advertising the server's port), the cloud transport when a relay is
    /// configured, and the event pumps.
    pub async fn start(&self) -> anyhow::Result<()> {
        let server = Arc::new(
            WsServer::bind(
                0,
                self.inner.config.max_frame_bytes,
                self.inner.server_events_tx.clone(),
            )
            .await?,
        );
        server.start().await;
        let port = server.port();
        *self.inner.server.write().await = Some(server);

        // Discovery advertises the port the server actually bound. A host
        // without multicast (some containers) still gets cloud sync; the
        // restart path reacquires mDNS when the network changes.
        self.inner.discovery.set_port(port);
        if let Err(e) = self.inner.discovery.start().await {
            warn!(error = %e, "mDNS discovery unavailable; LAN sync disabled until restart");
        }

        if self.inner.config.url.is_some() {
            let cloud = WsTransport::new(
                cloud_config(&self.inner.config),
                self.inner.local_device.clone(),
                self.inner.transport_events_tx.clone(),
            );
            cloud.start().await;
            self.update_connection_state(Environment::Cloud, ConnectionState::ConnectingCloud);
            *self.inner.cloud.write().await = Some(cloud);
        }

        self.spawn_transport_pump().await;
        self.spawn_server_pump().await;
        self.spawn_discovery_pump().await;
        Ok(())
    }

    pub async fn shutdown(&self) {
        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(cloud) = self.inner.cloud.write().await.take() {
            cloud.close().await;
        }
        for (_, transport) in self.inner.lan.write().await.drain() {
            transport.close().await;
        }
        if let Some(server) = self.inner.server.write().await.take() {
            server.shutdown().await;
        }
        self.inner.discovery.stop().await;
        self.inner
            .connection_state_tx
            .send_replace(ConnectionState::Disconnected);
    }

    // === Handler installation (single-slot, set once) ===

    pub fn set_incoming_clipboard_handler(&self, handler: Arc<dyn InboundEnvelopeHandler>) {
        if self.inner.inbound_handler.set(handler).is_err() {
            warn!("incoming clipboard handler was already installed");
        }
    }

    pub fn set_pairing_handler(&self, handler: Arc<dyn PairingTextHandler>) {
        if self.inner.pairing_handler.set(handler).is_err() {
            warn!("pairing handler was already installed");
        }
    }

    // === Peer bookkeeping ===

    pub fn register_paired_device(&self, device: PairedDevice) {
        let id = device.id.clone();
        self.inner
            .paired
            .write()
            .expect("paired set lock")
            .insert(id.clone(), device);
        info!(device_id = %id, "paired device registered");
    }

    /// Explicit un-pair: forget the device, its route history and its LAN
    /// transport. The stored key is the caller's to delete.
    pub async fn unregister_paired_device(&self, device_id: &DeviceId) {
        self.inner
            .paired
            .write()
            .expect("paired set lock")
            .remove(device_id);
        self.inner
            .last_successful
            .write()
            .expect("last-successful lock")
            .remove(device_id);
        if let Some(transport) = self.inner.lan.write().await.remove(device_id) {
            transport.close().await;
        }
    }

    pub fn update_device_last_seen(&self, device_id: &DeviceId) {
        if let Some(device) = self
            .inner
            .paired
            .write()
            .expect("paired set lock")
            .get_mut(device_id)
        {
            device.last_seen = Utc::now();
        }
    }

    pub fn update_device_online_status(&self, device_id: &DeviceId, online: bool) {
        let mut changed = false;
        if let Some(device) = self
            .inner
            .paired
            .write()
            .expect("paired set lock")
            .get_mut(device_id)
        {
            changed = device.is_online != online;
            device.is_online = online;
            if online {
                device.last_seen = Utc::now();
            }
        }
        if changed {
            let _ = self.inner.network_events_tx.send(NetworkEvent::DeviceOnline {
                device_id: device_id.clone(),
                online,
            });
        }
    }

    pub async fn lan_discovered_peers(&self) -> Vec<hypo_core::device::DiscoveredPeer> {
        self.inner.discovery.current_peers().await
    }

    pub async fn current_peers(&self) -> Vec<hypo_core::device::DiscoveredPeer> {
        self.lan_discovered_peers().await
    }

    pub async fn is_known_device(&self, device_id: &DeviceId) -> bool {
        if self
            .inner
            .paired
            .read()
            .expect("paired set lock")
            .contains_key(device_id)
        {
            return true;
        }
        self.inner
            .discovery
            .peer_for_device(device_id)
            .await
            .is_some()
    }

    /// A dialable LAN URL for the peer, from discovery first, then the
    /// paired-device record. `None` when the peer is not on the LAN.
    pub async fn lan_endpoint_for(&self, device_id: &DeviceId) -> Option<String> {
        if let Some(peer) = self.inner.discovery.peer_for_device(device_id).await {
            if let Some(url) = peer.ws_url() {
                return Some(url);
            }
        }
        self.inner
            .paired
            .read()
            .expect("paired set lock")
            .get(device_id)
            .and_then(|device| device.lan_url())
    }

    /// Get or create the LAN transport that follows this peer, pointing it
    /// at `url`. A change of endpoint forces a reconnect onto the new URL.
    pub async fn lan_transport_for(&self, device_id: &DeviceId, url: &str) -> WsTransport {
        let mut lan = self.inner.lan.write().await;
        let transport = lan.entry(device_id.clone()).or_insert_with(|| {
            WsTransport::new(
                lan_config(&self.inner.config),
                self.inner.local_device.clone(),
                self.inner.transport_events_tx.clone(),
            )
        });
        transport.start().await;
        transport.set_peer_url(Some(url.to_string()));
        transport.clone()
    }

    pub async fn cloud_transport(&self) -> Option<WsTransport> {
        self.inner.cloud.read().await.clone()
    }

    pub async fn server(&self) -> Option<Arc<WsServer>> {
        self.inner.server.read().await.clone()
    }

    pub fn record_successful_transport(&self, device_id: &DeviceId, kind: TransportKind) {
        self.inner
            .last_successful
            .write()
            .expect("last-successful lock")
            .insert(device_id.clone(), kind);
        self.update_device_online_status(device_id, true);
    }

    pub fn last_successful_transport(&self, device_id: &DeviceId) -> Option<TransportKind> {
        self.inner
            .last_successful
            .read()
            .expect("last-successful lock")
            .get(device_id)
            .copied()
    }

    // === Connection state ===

    /// Only cloud transitions move the global state; LAN connections are
    /// per-peer and do not.
    pub fn update_connection_state(&self, environment: Environment, state: ConnectionState) {
        if environment != Environment::Cloud {
            return;
        }
        let changed = self.inner.connection_state_tx.send_if_modified(|current| {
            if *current != state {
                *current = state.clone();
                true
            } else {
                false
            }
        });
        if changed {
            let _ = self
                .inner
                .network_events_tx
                .send(NetworkEvent::ConnectionStateChanged(state));
        }
    }

    pub fn subscribe_network_events(&self) -> broadcast::Receiver<NetworkEvent> {
        self.inner.network_events_tx.subscribe()
    }

    /// The host reported a network path change: restart discovery and kick
    /// the cloud reconnect immediately instead of waiting out the backoff.
    pub async fn handle_network_path_change(&self) {
        info!("network path changed; restarting discovery and kicking cloud reconnect");
        if let Some(cloud) = self.inner.cloud.read().await.clone() {
            cloud.kick();
        }
        self.inner.discovery.restart().await;
    }

    /// Used by the pairing layer once a handshake concludes.
    pub fn notify_pairing_completed(&self, device_id: DeviceId, name: String) {
        let _ = self
            .inner
            .network_events_tx
            .send(NetworkEvent::PairingCompleted { device_id, name });
    }

    // === Event pumps ===

    async fn spawn_transport_pump(&self) {
        let Some(mut rx) = self.inner.transport_events_rx.lock().await.take() else {
            return;
        };
        let manager = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                manager.on_transport_event(event).await;
            }
        });
        self.inner.tasks.lock().await.push(task);
    }

    async fn on_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Opened { environment, handshake } => {
                debug!(%environment, ?handshake, "transport opened");
                self.update_connection_state(environment, ConnectionState::ConnectedCloud);
            }
            TransportEvent::Closed { environment, code } => {
                if let Some(code) = code {
                    if SERVER_INITIATED_CODES.contains(&code) {
                        debug!(%environment, code, "server-initiated close");
                    }
                }
                self.update_connection_state(environment, ConnectionState::Disconnected);
            }
            TransportEvent::Envelope(envelope) => {
                self.deliver_inbound(envelope).await;
            }
            TransportEvent::PairingText(text) => {
                let reply = self.inner.cloud.read().await.clone().map(|transport| {
                    PairingReply {
                        via: ReplyVia::Transport(transport),
                    }
                });
                if let (Some(handler), Some(reply)) =
                    (self.inner.pairing_handler.get().cloned(), reply)
                {
                    handler.on_pairing_text(text, reply).await;
                }
            }
            TransportEvent::RoundTrip { envelope, elapsed } => {
                debug!(envelope_id = %envelope.id, ?elapsed, "round trip resolved");
                self.update_device_last_seen(&envelope.payload.device_id);
            }
            TransportEvent::PinningFailure(report) => {
                warn!(host = %report.host, "certificate pinning failure");
                self.update_connection_state(
                    Environment::Cloud,
                    ConnectionState::Error("certificate pinning failure".to_string()),
                );
                let _ = self
                    .inner
                    .network_events_tx
                    .send(NetworkEvent::PinningFailure(report));
            }
        }
    }

    async fn spawn_server_pump(&self) {
        let Some(mut rx) = self.inner.server_events_rx.lock().await.take() else {
            return;
        };
        let manager = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                manager.on_server_event(event).await;
            }
        });
        self.inner.tasks.lock().await.push(task);
    }

    async fn on_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Connected { addr } => {
                debug!(%addr, "inbound LAN connection");
            }
            ServerEvent::Disconnected { addr, device_id } => {
                debug!(%addr, "inbound LAN connection closed");
                if let Some(device_id) = device_id {
                    self.update_device_online_status(&device_id, false);
                }
            }
            ServerEvent::Envelope { envelope, .. } => {
                let sender = envelope.payload.device_id.clone();
                self.update_device_online_status(&sender, true);
                self.deliver_inbound(envelope).await;
            }
            ServerEvent::PairingText { addr, text } => {
                let server = self.inner.server.read().await.clone();
                if let (Some(handler), Some(server)) =
                    (self.inner.pairing_handler.get().cloned(), server)
                {
                    let reply = PairingReply {
                        via: ReplyVia::Server { server, addr },
                    };
                    handler.on_pairing_text(text, reply).await;
                }
            }
        }
    }

    async fn spawn_discovery_pump(&self) {
        let mut rx = self.inner.discovery.subscribe();
        let manager = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => manager.on_discovery_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "discovery event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.inner.tasks.lock().await.push(task);
    }

    async fn on_discovery_event(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Added(peer) => {
                let _ = self
                    .inner
                    .network_events_tx
                    .send(NetworkEvent::PeerDiscovered(peer));
            }
            DiscoveryEvent::Resolved(peer) => {
                if let Some(device_id) = peer.device_id.clone() {
                    let mut refreshed = false;
                    if let Some(device) = self
                        .inner
                        .paired
                        .write()
                        .expect("paired set lock")
                        .get_mut(&device_id)
                    {
                        device.service_name = Some(peer.service_name.clone());
                        device.host = Some(peer.host.clone());
                        device.port = Some(peer.port);
                        device.fingerprint = peer.fingerprint.clone();
                        device.last_seen = Utc::now();
                        refreshed = true;
                    }
                    // Retarget this peer's LAN transport; a changed endpoint
                    // forces Closing → Connecting onto the new URL.
                    if refreshed {
                        if let Some(url) = peer.ws_url() {
                            if let Some(transport) =
                                self.inner.lan.read().await.get(&device_id)
                            {
                                transport.set_peer_url(Some(url));
                            }
                        }
                    }
                }
                let _ = self
                    .inner
                    .network_events_tx
                    .send(NetworkEvent::PeerResolved(peer));
            }
            DiscoveryEvent::Removed(service_name) => {
                let device_id = self
                    .inner
                    .paired
                    .read()
                    .expect("paired set lock")
                    .values()
                    .find(|d| d.service_name.as_deref() == Some(service_name.as_str()))
                    .map(|d| d.id.clone());
                if let Some(device_id) = device_id {
                    self.update_device_online_status(&device_id, false);
                    if let Some(transport) = self.inner.lan.read().await.get(&device_id) {
                        transport.set_peer_url(None);
                    }
                }
                let _ = self
                    .inner
                    .network_events_tx
                    .send(NetworkEvent::PeerLost(service_name));
            }
        }
    }

    async fn deliver_inbound(&self, envelope: SyncEnvelope) {
        match self.inner.inbound_handler.get() {
            Some(handler) => handler.on_envelope(envelope).await,
            None => debug!("inbound envelope dropped: no handler installed"),
        }
    }
}

#[async_trait]
impl SyncTransportPort for TransportManager {
    async fn dispatch(
        &self,
        envelope: SyncEnvelope,
        target: &DeviceId,
    ) -> Result<TransportKind, DispatcherError> {
        FallbackDispatcher::new(self.clone())
            .dispatch(envelope, target)
            .await
    }

    fn paired_devices(&self) -> Vec<PairedDevice> {
        self.inner
            .paired
            .read()
            .expect("paired set lock")
            .values()
            .cloned()
            .collect()
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection_state_tx.subscribe()
    }

    async fn note_device_seen(&self, device_id: &DeviceId) {
        self.update_device_last_seen(device_id);
        self.update_device_online_status(device_id, true);
    }
}

fn cloud_config(config: &SyncConfig) -> SyncConfig {
    SyncConfig {
        environment: Environment::Cloud,
        ..config.clone()
    }
}

fn lan_config(config: &SyncConfig) -> SyncConfig {
    SyncConfig {
        environment: Environment::Lan,
        url: None,
        fingerprint_sha256: None,
        headers: config.headers.clone(),
        ..config.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypo_core::device::Platform;

    fn manager() -> TransportManager {
        let local = DeviceId::new("6ba7b810-9dad-11d1-80b4-00c04fd430c8");
        let discovery = DiscoveryConfig::new("desk", local.clone(), 0);
        TransportManager::new(local, SyncConfig::lan(), discovery)
    }

    fn paired(id: &str) -> PairedDevice {
        PairedDevice::new(DeviceId::new(id), "Phone", Platform::Android)
    }

    #[tokio::test]
    async fn test_register_and_unregister_paired_device() {
        let m = manager();
        let device = paired("7ba7b810-9dad-11d1-80b4-00c04fd430c8");
        let id = device.id.clone();

        m.register_paired_device(device);
        assert_eq!(m.paired_devices().len(), 1);
        assert!(m.is_known_device(&id).await);

        m.unregister_paired_device(&id).await;
        assert!(m.paired_devices().is_empty());
    }

    #[tokio::test]
    async fn test_lan_transitions_do_not_move_global_state() {
        let m = manager();
        let rx = m.connection_state();
        assert_eq!(*rx.borrow(), ConnectionState::Idle);

        m.update_connection_state(Environment::Lan, ConnectionState::ConnectedLan);
        assert_eq!(*rx.borrow(), ConnectionState::Idle);

        m.update_connection_state(Environment::Cloud, ConnectionState::ConnectedCloud);
        assert_eq!(*rx.borrow(), ConnectionState::ConnectedCloud);
    }

    #[tokio::test]
    async fn test_last_successful_transport_tracking() {
        let m = manager();
        let device = paired("7ba7b810-9dad-11d1-80b4-00c04fd430c8");
        let id = device.id.clone();
        m.register_paired_device(device);

        assert!(m.last_successful_transport(&id).is_none());
        m.record_successful_transport(&id, TransportKind::Lan);
        assert_eq!(m.last_successful_transport(&id), Some(TransportKind::Lan));
        m.record_successful_transport(&id, TransportKind::Cloud);
        assert_eq!(m.last_successful_transport(&id), Some(TransportKind::Cloud));
    }

    #[tokio::test]
    async fn test_lan_endpoint_prefers_discovery_then_paired_record() {
        let m = manager();
        let mut device = paired("7ba7b810-9dad-11d1-80b4-00c04fd430c8");
        device.host = Some("192.168.1.50".to_string());
        device.port = Some(9010);
        let id = device.id.clone();
        m.register_paired_device(device);

        // Nothing discovered: falls back to the paired record.
        assert_eq!(
            m.lan_endpoint_for(&id).await.as_deref(),
            Some("ws://192.168.1.50:9010/ws")
        );
    }

    #[tokio::test]
    async fn test_unknown_host_yields_no_lan_endpoint() {
        let m = manager();
        let mut device = paired("7ba7b810-9dad-11d1-80b4-00c04fd430c8");
        device.host = Some("unknown".to_string());
        device.port = Some(9010);
        let id = device.id.clone();
        m.register_paired_device(device);

        assert!(m.lan_endpoint_for(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_online_status_change_emits_event() {
        let m = manager();
        let device = paired("7ba7b810-9dad-11d1-80b4-00c04fd430c8");
        let id = device.id.clone();
        m.register_paired_device(device);

        let mut events = m.subscribe_network_events();
        m.update_device_online_status(&id, true);
        match events.recv().await.unwrap() {
            NetworkEvent::DeviceOnline { device_id, online } => {
                assert_eq!(device_id, id);
                assert!(online);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
