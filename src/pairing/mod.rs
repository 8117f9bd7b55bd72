//! Pairing session drivers.
//!
//! The pure message construction and verification rules live in
//! `hypo_core::pairing`; this module moves those messages over a connected
//! socket, installs the derived key, and registers the peer.

mod initiator;
mod responder;

pub use initiator::PairingInitiator;
pub use responder::PairingResponder;
