//! Ports: capability interfaces between the sync core's layers.
//!
//! The engine sees the transport layer, the key store and the upward
//! consumer only through these traits, so each side can be replaced in
//! tests.

mod key_store;
mod sink;
mod transport;

pub use key_store::DeviceKeyStore;
pub use sink::ClipboardSink;
pub use transport::SyncTransportPort;
