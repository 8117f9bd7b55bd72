//! # hypo-core
//!
//! Core domain models and business logic for the Hypo sync core.
//!
//! This crate contains pure business logic without any infrastructure dependencies.

// Public module exports
pub mod clipboard;
pub mod config;
pub mod crypto;
pub mod device;
pub mod envelope;
pub mod error;
pub mod events;
pub mod ids;
pub mod pairing;
pub mod ports;
pub mod sync;

// Re-export commonly used types at the crate root
pub use clipboard::ClipboardEvent;
pub use config::{Environment, SyncConfig};
pub use crypto::{DeviceKey, IdentityFingerprint};
pub use device::{DiscoveredPeer, PairedDevice, Platform};
pub use envelope::{ContentType, EnvelopeAssembler, EnvelopeKind, Payload, SyncEnvelope};
pub use error::{AeadError, CodecError, DispatcherError, PairingError, TransportError};
pub use events::{ConnectionState, TransportKind};
pub use ids::{ChallengeId, DeviceId, EnvelopeId};
