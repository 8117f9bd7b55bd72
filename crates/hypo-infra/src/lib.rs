//! # hypo-infra
//!
//! Infrastructure adapters for the Hypo sync core. Currently: device key
//! persistence against the host credential facility, plus an in-memory
//! store for tests and headless use.

pub mod key_store;

pub use key_store::{KeyringDeviceKeyStore, MemoryDeviceKeyStore};
