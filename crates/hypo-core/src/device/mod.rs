//! Device domain models: paired devices and peers discovered on the LAN.

mod discovered_peer;
mod paired_device;
mod platform;

pub use discovered_peer::DiscoveredPeer;
pub use paired_device::PairedDevice;
pub use platform::Platform;
