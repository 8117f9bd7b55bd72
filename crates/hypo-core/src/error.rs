//! Error kinds surfaced by the sync core.
//!
//! Recoverable failures (a bad frame, a single envelope that fails AEAD) are
//! handled where they occur; structural failures (transport, pairing) are
//! surfaced to the caller. No error kind aborts the core.

use thiserror::Error;

use crate::ids::DeviceId;

/// Frame-level failures. Local recovery: drop the frame, keep the connection.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The stream holds fewer bytes than one complete frame.
    #[error("truncated frame")]
    Truncated,

    /// Body length exceeds the configured maximum.
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    TooLarge { len: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Stream-level I/O surfaced through the framed reader.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// AEAD failures. The envelope is dropped and a decryption diagnostic is
/// emitted upward; the connection stays up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AeadError {
    #[error("decryption failed")]
    Decrypt,

    #[error("no key stored for device {0}")]
    MissingKey(DeviceId),

    #[error("nonce misuse detected")]
    NonceMisuse,
}

/// Transport failures. The connection is closed and reconnected per policy;
/// a pinning failure additionally records a telemetry event.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    ConnectRefused(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("certificate pinning failure for {host}")]
    PinningFailure { host: String, message: String },

    #[error("socket closed{}", .code.map(|c| format!(" (code {c})")).unwrap_or_default())]
    SocketClosed { code: Option<u16> },

    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Pairing failures. Fatal for the handshake in progress; surfaced to the UI.
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("pairing payload signature is invalid")]
    SignatureInvalid,

    #[error("pairing payload has expired")]
    Expired,

    #[error("challenge response hash does not match")]
    ChallengeMismatch,

    #[error("duplicate challenge id")]
    DuplicateChallengeId,

    #[error("malformed pairing message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Crypto(#[from] AeadError),

    #[error("pairing transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("key persistence failed: {0}")]
    Storage(String),
}

/// Dispatch failures. The envelope stays queued until its validity window
/// expires, then is dropped with a diagnostic.
#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("no transport can reach device {0}")]
    NoRoute(DeviceId),

    #[error("device {0} is not known")]
    PeerUnknown(DeviceId),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
