//! weft-fabric — the per-host named channel fabric.
//!
//! A channel is a named membership set. Local processes join it over a
//! localhost WebSocket; remote fabrics join it over mutually authenticated
//! SRP tunnels whose credentials derive from the channel name alone.
//! Channels find each other on the LAN by mDNS/DNS-SD.

pub mod channel;
pub mod discovery;
pub mod peer;
pub mod proxy;
pub mod service;
pub mod transport;
pub mod tunnel;

pub use channel::Channel;
pub use service::Fabric;
