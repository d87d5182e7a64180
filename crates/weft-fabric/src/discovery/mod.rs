//! LAN discovery: DNS-SD advertisement and browsing over a private mDNS port.

pub mod advertise;
pub mod browse;
pub mod mdns;
pub mod record;

pub use advertise::DiscoveryService;
pub use browse::DiscoveryBrowser;
pub use record::DnsRecord;
