//! Transport configuration surface.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

/// Which environment a transport serves. LAN transports obtain their URL
/// from discovery; cloud transports use the configured relay URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Lan,
    Cloud,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Lan => write!(f, "lan"),
            Environment::Cloud => write!(f, "cloud"),
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lan" => Ok(Environment::Lan),
            "cloud" => Ok(Environment::Cloud),
            other => Err(format!("unknown environment: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub environment: Environment,

    /// Relay URL for cloud; absent for LAN (filled from discovery).
    #[serde(default)]
    pub url: Option<String>,

    /// Hex SHA-256 of the relay certificate DER; a mismatch aborts the
    /// session.
    #[serde(default)]
    pub fingerprint_sha256: Option<String>,

    /// Extra headers sent on the upgrade request (`X-Device-Id` is always
    /// added by the transport).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default = "defaults::idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(default = "defaults::round_trip_timeout_ms")]
    pub round_trip_timeout_ms: u64,

    /// Upper bound on a single attachment's plaintext size. Kept below the
    /// frame limit so the sealed, base64-expanded envelope still fits.
    #[serde(default = "defaults::max_attachment_bytes")]
    pub max_attachment_bytes: usize,

    /// Upper bound on one frame's JSON body.
    #[serde(default = "defaults::max_frame_bytes")]
    pub max_frame_bytes: usize,
}

mod defaults {
    pub fn idle_timeout_ms() -> u64 {
        30_000
    }

    pub fn round_trip_timeout_ms() -> u64 {
        60_000
    }

    pub fn max_attachment_bytes() -> usize {
        192 * 1024
    }

    pub fn max_frame_bytes() -> usize {
        256 * 1024
    }
}

impl SyncConfig {
    pub fn lan() -> Self {
        Self {
            environment: Environment::Lan,
            url: None,
            fingerprint_sha256: None,
            headers: BTreeMap::new(),
            idle_timeout_ms: defaults::idle_timeout_ms(),
            round_trip_timeout_ms: defaults::round_trip_timeout_ms(),
            max_attachment_bytes: defaults::max_attachment_bytes(),
            max_frame_bytes: defaults::max_frame_bytes(),
        }
    }

    pub fn cloud(url: impl Into<String>, fingerprint_sha256: Option<String>) -> Self {
        Self {
            environment: Environment::Cloud,
            url: Some(url.into()),
            fingerprint_sha256,
            ..Self::lan()
        }
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn round_trip_timeout(&self) -> Duration {
        Duration::from_millis(self.round_trip_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::lan()
    }
}
