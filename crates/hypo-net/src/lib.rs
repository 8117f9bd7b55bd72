//! # hypo-net
//!
//! The network layer of the Hypo sync core: frame codec, mDNS discovery,
//! the WebSocket transport (LAN and cloud), the embedded LAN server, the
//! LAN-first fallback dispatcher, and the transport manager that owns them.

pub mod codec;
pub mod discovery;
pub mod dispatcher;
pub mod manager;
pub mod pinning;
pub mod server;
pub mod transport;

pub use codec::{decode_frame, encode_frame, FrameCodec};
pub use discovery::{Discovery, DiscoveryConfig, DiscoveryEvent};
pub use dispatcher::FallbackDispatcher;
pub use manager::TransportManager;
pub use server::{ServerEvent, WsServer};
pub use transport::{TransportEvent, WsTransport};
