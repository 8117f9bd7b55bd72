//! mDNS service discovery of LAN peers.
//!
//! Advertises the local endpoint as a `_hypo._tcp.` service with the device
//! id, protocol version and identity fingerprint in TXT attributes, and
//! browses for the same service type. Exposes a lazy, restartable stream of
//! discovery events plus a snapshot accessor. Entries whose host never
//! resolves stay `"unknown"` and are withheld from transports; records that
//! go sixty seconds without a resolve are evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use mdns_sd::{ResolvedService, ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hypo_core::device::DiscoveredPeer;
use hypo_core::ids::DeviceId;

/// mDNS service type for Hypo sync.
pub const SERVICE_TYPE: &str = "_hypo._tcp.local.";

/// TXT attribute keys.
const TXT_DEVICE_ID: &str = "device_id";
const TXT_VERSION: &str = "version";
const TXT_FINGERPRINT: &str = "fingerprint";
const TXT_PROTOCOLS: &str = "protocols";

/// Backoff cap while reacquiring the daemon after a network change.
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// How often stale records are swept.
const EVICT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A service appeared; its host is not yet known.
    Added(DiscoveredPeer),
    /// A service resolved to a host and port.
    Resolved(DiscoveredPeer),
    /// A service went away or its record became stale (service name).
    Removed(String),
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Instance name to advertise under.
    pub instance_name: String,
    pub device_id: DeviceId,
    pub version: String,
    pub fingerprint: String,
    /// TCP port the embedded server listens on.
    pub port: u16,
    /// Resolve-silence after which a record is evicted.
    pub stale_after: Duration,
    /// Host to substitute when a peer resolves to loopback (emulator
    /// targets advertise 127.0.0.1; the runtime knows the reachable
    /// address).
    pub loopback_rewrite: Option<String>,
}

impl DiscoveryConfig {
    pub fn new(instance_name: impl Into<String>, device_id: DeviceId, port: u16) -> Self {
        Self {
            instance_name: instance_name.into(),
            device_id,
            version: env!("CARGO_PKG_VERSION").to_string(),
            fingerprint: String::new(),
            port,
            stale_after: Duration::from_secs(60),
            loopback_rewrite: None,
        }
    }
}

struct DiscoveryInner {
    config: DiscoveryConfig,
    /// The port actually advertised; the embedded server may bind an
    /// ephemeral port after this config was built.
    advertised_port: AtomicU16,
    peers: RwLock<HashMap<String, DiscoveredPeer>>,
    event_tx: broadcast::Sender<DiscoveryEvent>,
    daemon: Mutex<Option<ServiceDaemon>>,
    registered: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Advertise-and-browse handle. Created idle; `start` brings the daemon up.
#[derive(Clone)]
pub struct Discovery {
    inner: Arc<DiscoveryInner>,
}

impl Discovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        let advertised_port = AtomicU16::new(config.port);
        Self {
            inner: Arc::new(DiscoveryInner {
                config,
                advertised_port,
                peers: RwLock::new(HashMap::new()),
                event_tx,
                daemon: Mutex::new(None),
                registered: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Replace the advertised port (the embedded server binds before
    /// discovery starts). Takes effect on the next `start`/`restart`.
    pub fn set_port(&self, port: u16) {
        self.inner.advertised_port.store(port, Ordering::SeqCst);
    }

    /// Bring up the daemon, advertise the local endpoint and start browsing.
    pub async fn start(&self) -> Result<()> {
        let daemon = ServiceDaemon::new().context("failed to create mDNS daemon")?;

        self.advertise(&daemon).await?;
        self.browse(&daemon).await?;
        self.spawn_evictor().await;

        *self.inner.daemon.lock().await = Some(daemon);
        info!(
            port = self.inner.advertised_port.load(Ordering::SeqCst),
            "mDNS discovery started"
        );
        Ok(())
    }

    async fn advertise(&self, daemon: &ServiceDaemon) -> Result<()> {
        let config = &self.inner.config;
        let properties: HashMap<String, String> = [
            (TXT_DEVICE_ID.to_string(), config.device_id.to_string()),
            (TXT_VERSION.to_string(), config.version.clone()),
            (TXT_FINGERPRINT.to_string(), config.fingerprint.clone()),
            (TXT_PROTOCOLS.to_string(), "ws".to_string()),
        ]
        .into_iter()
        .collect();

        let hostname = format!("hypo-{}.local.", &uuid::Uuid::new_v4().to_string()[..8]);
        let service_info = ServiceInfo::new(
            SERVICE_TYPE,
            &config.instance_name,
            &hostname,
            "", // empty = auto-detect local IP
            self.inner.advertised_port.load(Ordering::SeqCst),
            properties,
        )
        .context("failed to build mDNS service info")?;

        let fullname = service_info.get_fullname().to_string();
        daemon
            .register(service_info)
            .context("failed to register mDNS service")?;
        *self.inner.registered.lock().await = Some(fullname);
        Ok(())
    }

    async fn browse(&self, daemon: &ServiceDaemon) -> Result<()> {
        let receiver = daemon
            .browse(SERVICE_TYPE)
            .context("failed to browse mDNS services")?;

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    ServiceEvent::ServiceFound(_, fullname) => {
                        inner.on_found(fullname).await;
                    }
                    ServiceEvent::ServiceResolved(info) => {
                        inner.on_resolved(&info).await;
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        inner.on_removed(&fullname, "removed").await;
                    }
                    _ => {}
                }
            }
            debug!("mDNS browse channel closed");
        });
        self.inner.tasks.lock().await.push(task);
        Ok(())
    }

    async fn spawn_evictor(&self) {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(EVICT_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let stale: Vec<String> = {
                    let peers = inner.peers.read().await;
                    let now = Utc::now();
                    peers
                        .values()
                        .filter(|p| p.is_stale(inner.config.stale_after, now))
                        .map(|p| p.service_name.clone())
                        .collect()
                };
                for name in stale {
                    inner.on_removed(&name, "stale").await;
                }
            }
        });
        self.inner.tasks.lock().await.push(task);
    }

    /// Tear down and bring the daemon back up, retrying with exponential
    /// backoff capped at thirty seconds. Called on interface up/down.
    pub async fn restart(&self) {
        self.stop().await;

        let mut backoff = Duration::from_secs(1);
        loop {
            match self.start().await {
                Ok(()) => return,
                Err(e) => {
                    warn!(error = %e, delay = ?backoff, "mDNS restart failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RESTART_BACKOFF_CAP);
                }
            }
        }
    }

    pub async fn stop(&self) {
        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }

        let registered = self.inner.registered.lock().await.take();
        if let Some(daemon) = self.inner.daemon.lock().await.take() {
            if let Some(fullname) = registered {
                let _ = daemon.unregister(&fullname);
            }
            let _ = daemon.shutdown();
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Snapshot of peers transports may dial: resolved, non-loopback,
    /// non-stale.
    pub async fn current_peers(&self) -> Vec<DiscoveredPeer> {
        let now = Utc::now();
        self.inner
            .peers
            .read()
            .await
            .values()
            .filter(|p| p.has_usable_host() && !p.is_stale(self.inner.config.stale_after, now))
            .cloned()
            .collect()
    }

    /// Look up the freshest resolved peer advertising `device_id`.
    ///
    /// Multi-homed hosts can announce the same device id from several
    /// instances; ties break deterministically by most recent `last_seen`,
    /// then lexicographically smallest service name.
    pub async fn peer_for_device(&self, device_id: &DeviceId) -> Option<DiscoveredPeer> {
        let mut matches: Vec<DiscoveredPeer> = self
            .current_peers()
            .await
            .into_iter()
            .filter(|p| p.matches_device(device_id))
            .collect();
        matches.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.service_name.cmp(&b.service_name))
        });
        matches.into_iter().next()
    }
}

impl DiscoveryInner {
    async fn on_found(&self, fullname: String) {
        if self.is_own_service(&fullname).await {
            return;
        }
        let mut peers = self.peers.write().await;
        if !peers.contains_key(&fullname) {
            let peer = DiscoveredPeer::unresolved(fullname.clone());
            peers.insert(fullname, peer.clone());
            drop(peers);
            debug!(service = %peer.service_name, "peer added");
            let _ = self.event_tx.send(DiscoveryEvent::Added(peer));
        }
    }

    async fn on_resolved(&self, info: &ResolvedService) {
        let fullname = info.fullname.clone();
        if self.is_own_service(&fullname).await {
            return;
        }

        let Some(peer) = self.peer_from_service(info) else {
            debug!(service = %fullname, "resolved service had no usable address");
            return;
        };

        self.peers
            .write()
            .await
            .insert(fullname.clone(), peer.clone());
        debug!(service = %fullname, host = %peer.host, port = peer.port, "peer resolved");
        let _ = self.event_tx.send(DiscoveryEvent::Resolved(peer));
    }

    async fn on_removed(&self, fullname: &str, reason: &str) {
        if self.peers.write().await.remove(fullname).is_some() {
            debug!(service = %fullname, reason, "peer removed");
            let _ = self
                .event_tx
                .send(DiscoveryEvent::Removed(fullname.to_string()));
        }
    }

    async fn is_own_service(&self, fullname: &str) -> bool {
        self.registered.lock().await.as_deref() == Some(fullname)
    }

    fn peer_from_service(&self, info: &ResolvedService) -> Option<DiscoveredPeer> {
        let address = info
            .addresses
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| info.addresses.iter().next())
            .map(|a| a.to_ip_addr())?;

        let mut host = address.to_string();
        if address.is_loopback() {
            // An emulator target advertises loopback; substitute the
            // host-reachable address when the runtime configured one.
            if let Some(rewrite) = &self.config.loopback_rewrite {
                host = rewrite.clone();
            }
        }

        let txt = |key: &str| {
            info.txt_properties
                .get(key)
                .map(|v| v.val_str().to_string())
        };

        Some(DiscoveredPeer {
            service_name: info.fullname.clone(),
            host,
            port: info.port,
            device_id: txt(TXT_DEVICE_ID).map(DeviceId::new),
            version: txt(TXT_VERSION),
            fingerprint: txt(TXT_FINGERPRINT),
            protocols: txt(TXT_PROTOCOLS)
                .map(|p| p.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
            last_seen: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DiscoveryConfig {
        DiscoveryConfig::new(
            "desk",
            DeviceId::new("6ba7b810-9dad-11d1-80b4-00c04fd430c8"),
            9010,
        )
    }

    #[tokio::test]
    async fn test_unresolved_peer_is_withheld_from_snapshot() {
        let discovery = Discovery::new(config());
        discovery
            .inner
            .on_found("phone._hypo._tcp.local.".to_string())
            .await;

        assert!(discovery.current_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_found_then_removed_emits_events() {
        let discovery = Discovery::new(config());
        let mut events = discovery.subscribe();

        discovery
            .inner
            .on_found("phone._hypo._tcp.local.".to_string())
            .await;
        discovery
            .inner
            .on_removed("phone._hypo._tcp.local.", "removed")
            .await;

        assert!(matches!(events.recv().await.unwrap(), DiscoveryEvent::Added(_)));
        assert!(matches!(
            events.recv().await.unwrap(),
            DiscoveryEvent::Removed(name) if name == "phone._hypo._tcp.local."
        ));
    }

    #[tokio::test]
    async fn test_peer_for_device_breaks_ties_deterministically() {
        let discovery = Discovery::new(config());
        let device = DeviceId::new("7ba7b810-9dad-11d1-80b4-00c04fd430c8");
        let seen = Utc::now();

        let mut a = DiscoveredPeer::unresolved("a._hypo._tcp.local.");
        a.host = "192.168.1.10".into();
        a.port = 9010;
        a.device_id = Some(device.clone());
        a.last_seen = seen;

        let mut b = a.clone();
        b.service_name = "b._hypo._tcp.local.".into();
        b.host = "10.0.0.7".into();

        {
            let mut peers = discovery.inner.peers.write().await;
            peers.insert(a.service_name.clone(), a.clone());
            peers.insert(b.service_name.clone(), b);
        }

        // Same last_seen: the lexicographically smaller service name wins.
        let chosen = discovery.peer_for_device(&device).await.unwrap();
        assert_eq!(chosen.service_name, "a._hypo._tcp.local.");

        // A fresher sighting beats the name order.
        {
            let mut peers = discovery.inner.peers.write().await;
            let b = peers.get_mut("b._hypo._tcp.local.").unwrap();
            b.last_seen = seen + chrono::Duration::seconds(5);
        }
        let chosen = discovery.peer_for_device(&device).await.unwrap();
        assert_eq!(chosen.service_name, "b._hypo._tcp.local.");
    }
}
