//! Minimal mDNS/DNS-SD engine for `_nws._tcp` records.
//!
//! Uses the reserved mDNS multicast group but a distinct port, 5406, so the
//! fabric never shares 5353 with the OS resolver. Intentional isolation, not an oversight.
//! Every fabric binds the port with address reuse, so several fabrics on one
//! host all receive the group's traffic; queries and responses are both sent
//! to the group.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{rdata, DNSClass, Name, RData, Record, RecordType};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

/// Multicast port. Deliberately not 5353.
pub const MDNS_PORT: u16 = 5406;

/// The reserved IPv4 mDNS group.
pub const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// DNS-SD service type browsed and advertised by every fabric.
pub const SERVICE_TYPE: &str = "_nws._tcp.local.";

const DNS_TTL: u32 = 120;

fn service_name() -> Name {
    Name::from_ascii(SERVICE_TYPE).unwrap()
}

/// One advertised channel: everything needed to answer a PTR query.
#[derive(Debug, Clone)]
pub struct ServiceAdvert {
    pub instance: String,
    pub host: String,
    pub port: u16,
    pub txt: Vec<String>,
    pub addr_v4: Option<Ipv4Addr>,
    pub addr_v6: Option<Ipv6Addr>,
}

/// Shared between every channel's [`super::DiscoveryService`] and the
/// fabric's responder task. Keyed on instance id.
pub type AdvertRegistry = Arc<DashMap<String, ServiceAdvert>>;

pub fn new_registry() -> AdvertRegistry {
    Arc::new(DashMap::new())
}

/// A service instance assembled from one response message.
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    pub instance: String,
    pub host: String,
    pub port: u16,
    pub addr_v4: Option<Ipv4Addr>,
    pub addr_v6: Option<Ipv6Addr>,
    pub txt: Vec<String>,
}

/// Join the group and run the responder/collector loop until `done` fires.
///
/// Inbound queries for our service type are answered from the advert
/// registry; inbound responses are parsed into [`ServiceEntry`]s and handed
/// to the browser. Returns the socket for issuing queries.
pub fn spawn_endpoint(
    adverts: AdvertRegistry,
    entries_tx: mpsc::Sender<ServiceEntry>,
    mut done: watch::Receiver<bool>,
) -> Result<Arc<UdpSocket>> {
    let socket = make_socket().context("failed to create mDNS socket")?;
    let socket = Arc::new(UdpSocket::from_std(socket).context("failed to register mDNS socket")?);

    let loop_socket = socket.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, from) = tokio::select! {
                _ = done.changed() => break,
                result = loop_socket.recv_from(&mut buf) => match result {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "mDNS recv_from failed");
                        continue;
                    }
                },
            };

            let Ok(message) = Message::from_vec(&buf[..len]) else {
                continue;
            };

            match message.message_type() {
                MessageType::Query => {
                    if !message
                        .queries()
                        .iter()
                        .any(|q| q.query_type() == RecordType::PTR && q.name() == &service_name())
                    {
                        continue;
                    }
                    let Some(response) = build_response(&adverts) else {
                        continue;
                    };
                    match response.to_vec() {
                        Ok(bytes) => {
                            if let Err(e) = loop_socket
                                .send_to(&bytes, (MDNS_GROUP_V4, MDNS_PORT))
                                .await
                            {
                                tracing::warn!(error = %e, "mDNS response send failed");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "mDNS response encode failed"),
                    }
                }
                MessageType::Response => {
                    for entry in parse_entries(&message, from) {
                        // Dropping when no sweep is draining is fine; the
                        // next sweep re-queries.
                        let _ = entries_tx.try_send(entry);
                    }
                }
            }
        }
    });

    Ok(socket)
}

/// Issue one PTR query for the service type.
pub async fn query(socket: &UdpSocket) -> Result<()> {
    let mut message = Message::new();
    message.set_id(0);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    let mut question = Query::query(service_name(), RecordType::PTR);
    question.set_query_class(DNSClass::IN);
    message.add_query(question);

    let bytes = message.to_vec().context("failed to encode mDNS query")?;
    socket
        .send_to(&bytes, (MDNS_GROUP_V4, MDNS_PORT))
        .await
        .context("failed to send mDNS query")?;
    Ok(())
}

/// The IPv4 address the OS would use to reach the multicast group.
/// Used for our A records; loopback-only hosts fall back to 127.0.0.1.
pub fn local_ipv4() -> Ipv4Addr {
    fn probe() -> Option<Ipv4Addr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect((MDNS_GROUP_V4, MDNS_PORT)).ok()?;
        match socket.local_addr().ok()? {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        }
    }
    probe().unwrap_or(Ipv4Addr::LOCALHOST)
}

/// Create a UDP socket bound to the mDNS port and joined to the group.
/// Address reuse lets several fabrics on one host coexist.
fn make_socket() -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    #[cfg(unix)]
    socket.set_reuse_port(true).context("SO_REUSEPORT")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, MDNS_PORT));
    socket.bind(&bind_addr.into()).context("bind()")?;

    socket
        .join_multicast_v4(&MDNS_GROUP_V4, &Ipv4Addr::UNSPECIFIED)
        .context("IP_ADD_MEMBERSHIP")?;
    socket
        .set_multicast_loop_v4(true)
        .context("IP_MULTICAST_LOOP")?;
    socket.set_multicast_ttl_v4(255).context("IP_MULTICAST_TTL")?;

    Ok(socket.into())
}

/// Build one authoritative response covering every registered advert.
fn build_response(adverts: &AdvertRegistry) -> Option<Message> {
    if adverts.is_empty() {
        return None;
    }

    let mut message = Message::new();
    message.set_id(0);
    message.set_message_type(MessageType::Response);
    message.set_op_code(OpCode::Query);
    message.set_authoritative(true);

    let service = service_name();
    for entry in adverts.iter() {
        let advert = entry.value();
        let Ok(instance) = Name::from_ascii(format!("{}.{}", advert.instance, SERVICE_TYPE)) else {
            continue;
        };
        let Ok(target) = Name::from_ascii(format!("{}.local.", advert.host)) else {
            continue;
        };

        message.add_answer(Record::from_rdata(
            service.clone(),
            DNS_TTL,
            RData::PTR(rdata::PTR(instance.clone())),
        ));
        message.add_additional(Record::from_rdata(
            instance.clone(),
            DNS_TTL,
            RData::SRV(rdata::SRV::new(0, 0, advert.port, target.clone())),
        ));
        message.add_additional(Record::from_rdata(
            instance,
            DNS_TTL,
            RData::TXT(rdata::TXT::new(advert.txt.clone())),
        ));
        if let Some(v4) = advert.addr_v4 {
            message.add_additional(Record::from_rdata(
                target.clone(),
                DNS_TTL,
                RData::A(rdata::A::from(v4)),
            ));
        }
        if let Some(v6) = advert.addr_v6 {
            message.add_additional(Record::from_rdata(
                target,
                DNS_TTL,
                RData::AAAA(rdata::AAAA::from(v6)),
            ));
        }
    }

    Some(message)
}

/// Assemble complete service entries out of one response message.
/// A sender that omitted its A record is keyed by its source address.
fn parse_entries(message: &Message, from: SocketAddr) -> Vec<ServiceEntry> {
    let service = service_name();

    let mut instances: Vec<Name> = Vec::new();
    let mut srv: HashMap<Name, (u16, Name)> = HashMap::new();
    let mut txt: HashMap<Name, Vec<String>> = HashMap::new();
    let mut a: HashMap<Name, Ipv4Addr> = HashMap::new();
    let mut aaaa: HashMap<Name, Ipv6Addr> = HashMap::new();

    for record in message.answers().iter().chain(message.additionals()) {
        match record.data() {
            Some(RData::PTR(ptr)) if record.name() == &service => {
                instances.push(ptr.0.clone());
            }
            Some(RData::SRV(s)) => {
                srv.insert(record.name().clone(), (s.port(), s.target().clone()));
            }
            Some(RData::TXT(t)) => {
                txt.insert(
                    record.name().clone(),
                    t.txt_data()
                        .iter()
                        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                        .collect(),
                );
            }
            Some(RData::A(addr)) => {
                a.insert(record.name().clone(), addr.0);
            }
            Some(RData::AAAA(addr)) => {
                aaaa.insert(record.name().clone(), addr.0);
            }
            _ => {}
        }
    }

    let fallback_v4 = match from {
        SocketAddr::V4(v4) => Some(*v4.ip()),
        SocketAddr::V6(_) => None,
    };

    let mut entries = Vec::new();
    for instance in instances {
        let Some((port, target)) = srv.get(&instance) else {
            continue;
        };
        let host = target
            .to_string()
            .trim_end_matches('.')
            .trim_end_matches(".local")
            .to_string();
        entries.push(ServiceEntry {
            instance: instance.to_string(),
            host,
            port: *port,
            addr_v4: a.get(target).copied().or(fallback_v4),
            addr_v6: aaaa.get(target).copied(),
            txt: txt.get(&instance).cloned().unwrap_or_default(),
        });
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advert(instance: &str) -> ServiceAdvert {
        ServiceAdvert {
            instance: instance.to_string(),
            host: "testhost".to_string(),
            port: 40123,
            txt: vec!["hash=aGFzaA".to_string(), "path=/12345".to_string()],
            addr_v4: Some(Ipv4Addr::new(192, 168, 1, 10)),
            addr_v6: None,
        }
    }

    #[test]
    fn response_round_trips_through_the_parser() {
        let registry = new_registry();
        registry.insert("98765".to_string(), advert("98765"));

        let message = build_response(&registry).unwrap();
        let bytes = message.to_vec().unwrap();
        let parsed = Message::from_vec(&bytes).unwrap();

        let from: SocketAddr = "192.168.1.10:5406".parse().unwrap();
        let entries = parse_entries(&parsed, from);
        assert_eq!(entries.len(), 1);

        let entry = &entries[0];
        assert!(entry.instance.starts_with("98765."));
        assert_eq!(entry.host, "testhost");
        assert_eq!(entry.port, 40123);
        assert_eq!(entry.addr_v4, Some(Ipv4Addr::new(192, 168, 1, 10)));
        assert_eq!(entry.txt.len(), 2);
    }

    #[test]
    fn empty_registry_yields_no_response() {
        assert!(build_response(&new_registry()).is_none());
    }

    #[test]
    fn entry_without_srv_is_dropped() {
        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        message.add_answer(Record::from_rdata(
            service_name(),
            DNS_TTL,
            RData::PTR(rdata::PTR(
                Name::from_ascii(format!("1.{SERVICE_TYPE}")).unwrap(),
            )),
        ));

        let from: SocketAddr = "10.0.0.1:5406".parse().unwrap();
        assert!(parse_entries(&message, from).is_empty());
    }

    #[test]
    fn sender_address_backfills_missing_a_record() {
        let registry = new_registry();
        let mut no_addr = advert("42");
        no_addr.addr_v4 = None;
        registry.insert("42".to_string(), no_addr);

        let message = build_response(&registry).unwrap();
        let from: SocketAddr = "10.1.2.3:5406".parse().unwrap();
        let entries = parse_entries(&message, from);
        assert_eq!(entries[0].addr_v4, Some(Ipv4Addr::new(10, 1, 2, 3)));
    }
}
