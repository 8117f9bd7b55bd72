use anyhow::Result;
use async_trait::async_trait;

use crate::crypto::DeviceKey;
use crate::ids::DeviceId;

/// Per-peer symmetric key persistence.
///
/// Lookups normalize the device id; implementations additionally try the
/// pre-normalization form so pairings saved by older builds keep working.
/// Concurrent saves for the same id are last-writer-wins.
#[async_trait]
pub trait DeviceKeyStore: Send + Sync {
    async fn save(&self, device_id: &DeviceId, key: &DeviceKey) -> Result<()>;

    async fn load(&self, device_id: &DeviceId) -> Result<Option<DeviceKey>>;

    async fn delete(&self, device_id: &DeviceId) -> Result<()>;

    async fn has(&self, device_id: &DeviceId) -> Result<bool> {
        Ok(self.load(device_id).await?.is_some())
    }
}
