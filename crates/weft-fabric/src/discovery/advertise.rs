//! DNS-SD advertisement for one channel.

use std::net::{Ipv4Addr, Ipv6Addr};

use weft_core::id::generate_id;

use super::mdns::{AdvertRegistry, ServiceAdvert};

/// A channel's registration with the fabric's mDNS responder: one
/// `_nws._tcp` instance under a random id, SRV pointing at the fabric's
/// tunnel port, and a TXT payload carrying the channel hash and the opaque
/// proxy path. Shutdown withdraws the record.
pub struct DiscoveryService {
    registry: AdvertRegistry,
    instance: String,
}

impl DiscoveryService {
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        registry: &AdvertRegistry,
        domain: &str,
        host: &str,
        proxy_port: u16,
        hash_base64: &str,
        proxy_path: &str,
        addr_v4: Option<Ipv4Addr>,
        addr_v6: Option<Ipv6Addr>,
    ) -> DiscoveryService {
        let instance = generate_id();
        registry.insert(
            instance.clone(),
            ServiceAdvert {
                instance: instance.clone(),
                host: host.to_string(),
                port: proxy_port,
                txt: vec![
                    format!("hash={hash_base64}"),
                    format!("path={proxy_path}"),
                ],
                addr_v4,
                addr_v6,
            },
        );

        tracing::info!(instance = %instance, domain, host, port = proxy_port, "channel advertised");

        DiscoveryService {
            registry: registry.clone(),
            instance,
        }
    }

    pub fn shutdown(&self) {
        self.registry.remove(&self.instance);
        tracing::debug!(instance = %self.instance, "advertisement withdrawn");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::mdns::new_registry;

    #[test]
    fn register_and_shutdown_round_trip() {
        let registry = new_registry();
        let service = DiscoveryService::register(
            &registry,
            "local",
            "host",
            40000,
            "aGFzaA==",
            "/opaque",
            Some(Ipv4Addr::LOCALHOST),
            None,
        );
        assert_eq!(registry.len(), 1);
        let advert = registry.iter().next().unwrap().value().clone();
        assert_eq!(advert.port, 40000);
        assert!(advert.txt.contains(&"hash=aGFzaA==".to_string()));
        assert!(advert.txt.contains(&"path=/opaque".to_string()));

        service.shutdown();
        assert!(registry.is_empty());
    }
}
