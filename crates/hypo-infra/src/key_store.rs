//! Device key persistence.
//!
//! Keys are base64-encoded and handed to the host's secure credential
//! facility; the facility's own locking serializes concurrent access, so a
//! concurrent save for the same id is last-writer-wins.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use keyring::Entry;
use tokio::sync::RwLock;
use tracing::debug;

use hypo_core::crypto::DeviceKey;
use hypo_core::ids::DeviceId;
use hypo_core::ports::DeviceKeyStore;

/// Keychain service under which all device keys are filed.
const DEFAULT_SERVICE: &str = "com.hypo.sync";

/// Key store backed by the OS keychain / credential manager.
pub struct KeyringDeviceKeyStore {
    service: String,
}

impl KeyringDeviceKeyStore {
    pub fn new() -> Self {
        Self::with_service(DEFAULT_SERVICE)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry_name(id: &str) -> String {
        format!("device-key:{id}")
    }

    async fn read_entry(&self, id: String) -> Result<Option<String>> {
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<String>> {
            let entry = Entry::new(&service, &Self::entry_name(&id))?;
            match entry.get_password() {
                Ok(secret) => Ok(Some(secret)),
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await?
    }

    async fn write_entry(&self, id: String, secret: String) -> Result<()> {
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let entry = Entry::new(&service, &Self::entry_name(&id))?;
            entry.set_password(&secret)?;
            Ok(())
        })
        .await?
    }

    async fn delete_entry(&self, id: String) -> Result<()> {
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let entry = Entry::new(&service, &Self::entry_name(&id))?;
            match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await?
    }
}

impl Default for KeyringDeviceKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceKeyStore for KeyringDeviceKeyStore {
    async fn save(&self, device_id: &DeviceId, key: &DeviceKey) -> Result<()> {
        self.write_entry(device_id.as_str().to_string(), key.to_base64())
            .await
    }

    async fn load(&self, device_id: &DeviceId) -> Result<Option<DeviceKey>> {
        if let Some(secret) = self.read_entry(device_id.as_str().to_string()).await? {
            let key = DeviceKey::from_base64(&secret)
                .context("stored device key is not valid base64")?;
            return Ok(Some(key));
        }

        // Older builds filed keys under the platform-prefixed id; migrate on
        // first hit.
        if device_id.was_normalized() {
            if let Some(secret) = self.read_entry(device_id.raw().to_string()).await? {
                debug!(device_id = %device_id, "migrating legacy device key entry");
                let key = DeviceKey::from_base64(&secret)
                    .context("stored device key is not valid base64")?;
                self.save(device_id, &key).await?;
                self.delete_entry(device_id.raw().to_string()).await?;
                return Ok(Some(key));
            }
        }

        Ok(None)
    }

    async fn delete(&self, device_id: &DeviceId) -> Result<()> {
        self.delete_entry(device_id.as_str().to_string()).await?;
        if device_id.was_normalized() {
            self.delete_entry(device_id.raw().to_string()).await?;
        }
        Ok(())
    }
}

/// In-memory key store for tests and for hosts without a credential facility.
#[derive(Default)]
pub struct MemoryDeviceKeyStore {
    keys: Arc<RwLock<HashMap<String, DeviceKey>>>,
}

impl MemoryDeviceKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a legacy, pre-normalization entry the way an old build would
    /// have written it.
    pub async fn insert_raw(&self, raw_id: &str, key: DeviceKey) {
        self.keys.write().await.insert(raw_id.to_string(), key);
    }
}

#[async_trait]
impl DeviceKeyStore for MemoryDeviceKeyStore {
    async fn save(&self, device_id: &DeviceId, key: &DeviceKey) -> Result<()> {
        self.keys
            .write()
            .await
            .insert(device_id.as_str().to_string(), key.clone());
        Ok(())
    }

    async fn load(&self, device_id: &DeviceId) -> Result<Option<DeviceKey>> {
        let keys = self.keys.read().await;
        if let Some(key) = keys.get(device_id.as_str()) {
            return Ok(Some(key.clone()));
        }
        // Fall back to the pre-normalization form.
        Ok(keys.get(device_id.raw()).cloned())
    }

    async fn delete(&self, device_id: &DeviceId) -> Result<()> {
        let mut keys = self.keys.write().await;
        keys.remove(device_id.as_str());
        keys.remove(device_id.raw());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> DeviceKey {
        DeviceKey::new([byte; 32])
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryDeviceKeyStore::new();
        let id = DeviceId::new("6ba7b810-9dad-11d1-80b4-00c04fd430c8");

        assert!(!store.has(&id).await.unwrap());
        store.save(&id, &key(0x01)).await.unwrap();
        assert_eq!(store.load(&id).await.unwrap(), Some(key(0x01)));

        store.delete(&id).await.unwrap();
        assert!(store.load(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let store = MemoryDeviceKeyStore::new();
        let id = DeviceId::new("6ba7b810-9dad-11d1-80b4-00c04fd430c8");

        store.save(&id, &key(0x01)).await.unwrap();
        store.save(&id, &key(0x02)).await.unwrap();
        assert_eq!(store.load(&id).await.unwrap(), Some(key(0x02)));
    }

    #[tokio::test]
    async fn test_legacy_prefixed_entry_is_found() {
        let store = MemoryDeviceKeyStore::new();
        store
            .insert_raw("macos-6ba7b810-9dad-11d1-80b4-00c04fd430c8", key(0x03))
            .await;

        // Lookup arrives with the prefixed form; normalization strips it but
        // the raw form is still tried.
        let id = DeviceId::new("macos-6ba7b810-9dad-11d1-80b4-00c04fd430c8");
        assert_eq!(store.load(&id).await.unwrap(), Some(key(0x03)));
    }

    #[tokio::test]
    async fn test_prefixed_and_plain_ids_share_one_slot() {
        let store = MemoryDeviceKeyStore::new();
        let prefixed = DeviceId::new("android-6ba7b810-9dad-11d1-80b4-00c04fd430c8");
        let plain = DeviceId::new("6ba7b810-9dad-11d1-80b4-00c04fd430c8");

        store.save(&prefixed, &key(0x04)).await.unwrap();
        assert_eq!(store.load(&plain).await.unwrap(), Some(key(0x04)));
    }
}
