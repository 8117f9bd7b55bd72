//! # hypo-sync
//!
//! End-to-end encrypted clipboard sync core: takes local clipboard events
//! from the host glue, encrypts them per paired peer, delivers them LAN-first
//! with cloud-relay fallback, and hands decrypted inbound events back up.
//!
//! The crate wires three layers together:
//! - `hypo-core`: domain models, crypto, pairing and queue logic
//! - `hypo-net`: discovery, WebSocket transports, embedded server, dispatch
//! - `hypo-infra`: device key persistence
//!
//! Entry point: [`SyncCoreBuilder`].

pub mod builder;
pub mod engine;
pub mod identity;
pub mod pairing;

pub use builder::{SyncCore, SyncCoreBuilder};
pub use engine::SyncEngine;
pub use identity::DeviceIdentity;
pub use pairing::{PairingInitiator, PairingResponder};

pub use hypo_core::{
    ClipboardEvent, ConnectionState, ContentType, DeviceId, PairedDevice, Platform, SyncConfig,
};
pub use hypo_infra::{KeyringDeviceKeyStore, MemoryDeviceKeyStore};
pub use hypo_net::TransportManager;
