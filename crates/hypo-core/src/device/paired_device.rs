use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Platform;
use crate::ids::DeviceId;

/// A device this one has completed pairing with.
///
/// Created by the pairing protocol on success; host/port/fingerprint are
/// refreshed from discovery, `is_online` from the transport layer. Destroyed
/// only by an explicit user un-pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedDevice {
    pub id: DeviceId,
    pub name: String,
    pub platform: Platform,
    pub last_seen: DateTime<Utc>,
    pub is_online: bool,
    /// mDNS instance name, when the peer has been seen on the LAN.
    pub service_name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Identity fingerprint advertised by the peer (hex SHA-256).
    pub fingerprint: Option<String>,
}

impl PairedDevice {
    pub fn new(id: DeviceId, name: impl Into<String>, platform: Platform) -> Self {
        Self {
            id,
            name: name.into(),
            platform,
            last_seen: Utc::now(),
            is_online: false,
            service_name: None,
            host: None,
            port: None,
            fingerprint: None,
        }
    }

    /// Whether the peer has a LAN endpoint a transport can actually dial.
    pub fn has_usable_lan_endpoint(&self) -> bool {
        match (&self.host, self.port) {
            (Some(host), Some(_)) => host != "unknown" && !is_loopback(host),
            _ => false,
        }
    }

    pub fn lan_url(&self) -> Option<String> {
        if !self.has_usable_lan_endpoint() {
            return None;
        }
        Some(format!("ws://{}:{}/ws", self.host.as_ref()?, self.port?))
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

fn is_loopback(host: &str) -> bool {
    host == "localhost"
        || host
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> PairedDevice {
        PairedDevice::new(
            DeviceId::new("6ba7b810-9dad-11d1-80b4-00c04fd430c8"),
            "Desk",
            Platform::MacOS,
        )
    }

    #[test]
    fn test_no_endpoint_without_host() {
        assert!(!device().has_usable_lan_endpoint());
    }

    #[test]
    fn test_unknown_host_is_unusable() {
        let mut d = device();
        d.host = Some("unknown".to_string());
        d.port = Some(9010);
        assert!(!d.has_usable_lan_endpoint());
        assert!(d.lan_url().is_none());
    }

    #[test]
    fn test_loopback_host_is_unusable() {
        let mut d = device();
        d.host = Some("127.0.0.1".to_string());
        d.port = Some(9010);
        assert!(!d.has_usable_lan_endpoint());
    }

    #[test]
    fn test_lan_url_format() {
        let mut d = device();
        d.host = Some("192.168.1.20".to_string());
        d.port = Some(9010);
        assert_eq!(d.lan_url().as_deref(), Some("ws://192.168.1.20:9010/ws"));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let d = device();
        let json = serde_json::to_string(&d).unwrap();
        let restored: PairedDevice = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.id, d.id);
        assert_eq!(restored.name, d.name);
    }
}
