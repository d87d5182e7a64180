//! Discovered DNS-SD records.

use std::net::{Ipv4Addr, Ipv6Addr};

use weft_core::name::decode_hash;

use super::mdns::ServiceEntry;

/// A parsed `_nws._tcp` record: where to dial and which channel hash it
/// advertises. Valid only when both path and hash are present.
#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub host: String,
    pub addr_v4: Option<Ipv4Addr>,
    pub addr_v6: Option<Ipv6Addr>,
    pub port: u16,
    pub path: String,
    pub hash_base64: String,
    pub hash_bcrypt: Vec<u8>,
}

impl DnsRecord {
    /// Parse a service entry's TXT payload (`hash=<base64>,path=<path>`,
    /// tokens separated by any of `, ; <space>`). Entries missing either
    /// field, or with an undecodable hash, are dropped.
    pub fn from_entry(entry: &ServiceEntry) -> Option<DnsRecord> {
        let mut hash_base64 = String::new();
        let mut path = String::new();

        for item in entry
            .txt
            .iter()
            .flat_map(|s| s.split([',', ';', ' ']))
            .filter(|item| !item.is_empty())
        {
            let Some((key, value)) = item.split_once('=') else {
                continue;
            };
            match key {
                "hash" => hash_base64 = value.to_string(),
                "path" => path = value.to_string(),
                _ => {}
            }
        }

        if hash_base64.is_empty() || path.is_empty() {
            return None;
        }
        let hash_bcrypt = decode_hash(&hash_base64)?;

        Some(DnsRecord {
            host: entry.host.clone(),
            addr_v4: entry.addr_v4,
            addr_v6: entry.addr_v6,
            port: entry.port,
            path,
            hash_base64,
            hash_bcrypt,
        })
    }
}
