use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::DeviceId;

/// A peer seen on the local network via mDNS.
///
/// Created on "added" with host `"unknown"`, filled in on "resolved",
/// evicted after the stale interval or an explicit "removed".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPeer {
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub device_id: Option<DeviceId>,
    pub version: Option<String>,
    pub fingerprint: Option<String>,
    pub protocols: Vec<String>,
    pub last_seen: DateTime<Utc>,
}

impl DiscoveredPeer {
    pub fn unresolved(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            host: "unknown".to_string(),
            port: 0,
            device_id: None,
            version: None,
            fingerprint: None,
            protocols: Vec::new(),
            last_seen: Utc::now(),
        }
    }

    /// Hosts that transports must never dial: unresolved or loopback.
    pub fn has_usable_host(&self) -> bool {
        if self.host == "unknown" || self.host == "localhost" {
            return false;
        }
        !self
            .host
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
    }

    pub fn is_stale(&self, threshold: std::time::Duration, now: DateTime<Utc>) -> bool {
        let threshold = Duration::from_std(threshold).unwrap_or(Duration::seconds(60));
        now - self.last_seen > threshold
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    pub fn matches_device(&self, id: &DeviceId) -> bool {
        self.device_id.as_ref() == Some(id)
    }

    pub fn ws_url(&self) -> Option<String> {
        if !self.has_usable_host() {
            return None;
        }
        Some(format!("ws://{}:{}/ws", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_peer_has_no_usable_host() {
        let peer = DiscoveredPeer::unresolved("desk._hypo._tcp.local.");
        assert!(!peer.has_usable_host());
        assert!(peer.ws_url().is_none());
    }

    #[test]
    fn test_loopback_is_not_usable() {
        let mut peer = DiscoveredPeer::unresolved("desk._hypo._tcp.local.");
        peer.host = "127.0.0.1".to_string();
        peer.port = 9010;
        assert!(!peer.has_usable_host());
    }

    #[test]
    fn test_staleness() {
        let mut peer = DiscoveredPeer::unresolved("desk._hypo._tcp.local.");
        peer.last_seen = Utc::now() - Duration::seconds(120);
        assert!(peer.is_stale(std::time::Duration::from_secs(60), Utc::now()));
        peer.touch();
        assert!(!peer.is_stale(std::time::Duration::from_secs(60), Utc::now()));
    }

    #[test]
    fn test_device_match_is_case_insensitive_via_normalization() {
        let mut peer = DiscoveredPeer::unresolved("desk._hypo._tcp.local.");
        peer.device_id = Some(DeviceId::new(
            "MACOS-6BA7B810-9DAD-11D1-80B4-00C04FD430C8",
        ));
        assert!(peer.matches_device(&DeviceId::new(
            "6ba7b810-9dad-11d1-80b4-00c04fd430c8"
        )));
    }
}
