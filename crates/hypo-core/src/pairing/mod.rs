//! Pairing protocol domain: the out-of-band payload, the challenge/ack
//! handshake messages, and their verification rules.
//!
//! The session drivers that move these messages over a socket live in the
//! orchestration layer; everything here is pure and testable offline.

pub mod handshake;
mod messages;
mod payload;

pub use handshake::{build_ack, build_challenge, open_challenge, verify_ack, CHALLENGE_LEN};
pub use messages::{AckSecret, ChallengeSecret, PairingAck, PairingChallenge, PairingMessage};
pub use payload::PairingPayload;
