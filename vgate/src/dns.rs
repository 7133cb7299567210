//! Embedded DNS server
//!
//! Serves the configured zones on the gateway IP inside the virtual stack.
//! A query whose name falls under a zone is answered locally: exact record
//! match, regex record match, or the zone default IP; a zone hit with no
//! match and no default is NXDOMAIN. Everything else is forwarded verbatim
//! to the upstream resolvers and the first reply is relayed back.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use regex::Regex;
use tokio::net::UdpSocket;

use crate::config::Zone;
use crate::error::{Result, VgateError};

const QTYPE_A: u16 = 1;
const RCODE_NXDOMAIN: u16 = 3;
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug)]
enum Matcher {
    Exact(String),
    Pattern(Regex),
}

#[derive(Debug)]
struct CompiledRecord {
    matcher: Matcher,
    ip: Ipv4Addr,
}

#[derive(Debug)]
struct CompiledZone {
    /// Suffix including the leading label separator, e.g. ".containers.internal."
    suffix: String,
    records: Vec<CompiledRecord>,
    default_ip: Option<Ipv4Addr>,
}

/// How a zone resolved a query.
#[derive(Debug, PartialEq)]
enum ZoneAnswer {
    A(Ipv4Addr),
    /// Zone hit, but the query type is not A: empty NOERROR answer.
    Empty,
    NxDomain,
}

#[derive(Debug)]
pub struct DnsServer {
    zones: Vec<CompiledZone>,
    upstreams: Vec<SocketAddr>,
}

impl DnsServer {
    pub fn new(zones: &[Zone], upstreams: Vec<SocketAddr>) -> Result<Self> {
        let mut compiled = Vec::with_capacity(zones.len());
        for zone in zones {
            let mut records = Vec::with_capacity(zone.records.len());
            for record in &zone.records {
                let matcher = if let Some(name) = &record.name {
                    Matcher::Exact(name.to_ascii_lowercase())
                } else if let Some(pattern) = &record.regexp {
                    let re = Regex::new(pattern).map_err(|err| {
                        VgateError::Config(format!("invalid DNS record pattern '{pattern}': {err}"))
                    })?;
                    Matcher::Pattern(re)
                } else {
                    return Err(VgateError::Config(format!(
                        "DNS record in zone '{}' has neither name nor regexp",
                        zone.name
                    )));
                };
                records.push(CompiledRecord {
                    matcher,
                    ip: record.ip,
                });
            }
            let mut name = zone.name.to_ascii_lowercase();
            if !name.ends_with('.') {
                name.push('.');
            }
            compiled.push(CompiledZone {
                suffix: format!(".{name}"),
                records,
                default_ip: zone.default_ip,
            });
        }
        Ok(Self {
            zones: compiled,
            upstreams,
        })
    }

    /// Handle one raw DNS query; returns the raw reply, or `None` when the
    /// query is malformed or no upstream answered.
    pub async fn handle_query(&self, query: &[u8]) -> Option<Vec<u8>> {
        let question = Question::parse(query)?;

        if let Some(answer) = self.match_zones(&question.name, question.qtype) {
            return Some(build_reply(query, &question, &answer));
        }

        self.forward_upstream(query).await
    }

    fn match_zones(&self, name: &str, qtype: u16) -> Option<ZoneAnswer> {
        for zone in &self.zones {
            let Some(without_zone) = name.strip_suffix(&zone.suffix) else {
                continue;
            };
            if qtype != QTYPE_A {
                return Some(ZoneAnswer::Empty);
            }
            for record in &zone.records {
                let hit = match &record.matcher {
                    Matcher::Exact(record_name) => record_name == without_zone,
                    Matcher::Pattern(re) => re.is_match(without_zone),
                };
                if hit {
                    return Some(ZoneAnswer::A(record.ip));
                }
            }
            if let Some(ip) = zone.default_ip {
                return Some(ZoneAnswer::A(ip));
            }
            return Some(ZoneAnswer::NxDomain);
        }
        None
    }

    async fn forward_upstream(&self, query: &[u8]) -> Option<Vec<u8>> {
        for upstream in &self.upstreams {
            match self.forward_one(query, *upstream).await {
                Ok(reply) => return Some(reply),
                Err(err) => {
                    tracing::debug!(%upstream, error = %err, "upstream query failed");
                }
            }
        }
        tracing::warn!("no upstream resolver answered");
        None
    }

    async fn forward_one(&self, query: &[u8], upstream: SocketAddr) -> Result<Vec<u8>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(query, upstream).await?;
        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| {
                VgateError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "upstream timed out",
                ))
            })??;
        buf.truncate(n);
        Ok(buf)
    }
}

/// The first question of a query, plus the byte offset where it ends.
#[derive(Debug)]
struct Question {
    /// Lowercase FQDN with trailing dot.
    name: String,
    qtype: u16,
    /// End of the question section in the original packet.
    end: usize,
}

impl Question {
    fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < 12 {
            return None;
        }
        let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
        if qdcount == 0 {
            return None;
        }

        let mut name = String::new();
        let mut pos = 12;
        loop {
            let len = *packet.get(pos)? as usize;
            pos += 1;
            if len == 0 {
                break;
            }
            // Compression pointers are not legal in a query's question name.
            if len & 0xc0 != 0 {
                return None;
            }
            let label = packet.get(pos..pos + len)?;
            name.push_str(&String::from_utf8_lossy(label).to_ascii_lowercase());
            name.push('.');
            pos += len;
        }
        if name.is_empty() {
            name.push('.');
        }

        let qtype = u16::from_be_bytes([*packet.get(pos)?, *packet.get(pos + 1)?]);
        let end = pos + 4;
        packet.get(..end)?;
        Some(Self { name, qtype, end })
    }
}

/// Build a reply by echoing the query header and question, then appending
/// the answer (name compressed to the question at offset 12).
fn build_reply(query: &[u8], question: &Question, answer: &ZoneAnswer) -> Vec<u8> {
    let mut reply = query[..question.end].to_vec();

    let orig_flags = u16::from_be_bytes([query[2], query[3]]);
    let rcode = match answer {
        ZoneAnswer::NxDomain => RCODE_NXDOMAIN,
        _ => 0,
    };
    // QR | opcode (copied) | RD (copied) | RA | rcode.
    let flags = 0x8080 | (orig_flags & 0x7900) | rcode;
    reply[2..4].copy_from_slice(&flags.to_be_bytes());
    reply[4..6].copy_from_slice(&1u16.to_be_bytes());

    let ancount: u16 = match answer {
        ZoneAnswer::A(ip) => {
            reply.extend_from_slice(&[0xc0, 0x0c]);
            reply.extend_from_slice(&QTYPE_A.to_be_bytes());
            reply.extend_from_slice(&1u16.to_be_bytes()); // class IN
            reply.extend_from_slice(&0u32.to_be_bytes()); // TTL
            reply.extend_from_slice(&4u16.to_be_bytes());
            reply.extend_from_slice(&ip.octets());
            1
        }
        _ => 0,
    };
    reply[6..8].copy_from_slice(&ancount.to_be_bytes());
    reply[8..10].copy_from_slice(&0u16.to_be_bytes());
    reply[10..12].copy_from_slice(&0u16.to_be_bytes());
    reply
}

/// Build a query for `name` (trailing dot optional) with the given qtype.
#[cfg(test)]
pub(crate) fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut packet = Vec::new();
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0; 6]);
    for label in name.trim_end_matches('.').split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // class IN
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Record;

    fn parse_answer_ip(reply: &[u8]) -> Option<Ipv4Addr> {
        let ancount = u16::from_be_bytes([reply[6], reply[7]]);
        if ancount == 0 {
            return None;
        }
        let ip = &reply[reply.len() - 4..];
        Some(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]))
    }

    fn rcode(reply: &[u8]) -> u16 {
        u16::from_be_bytes([reply[2], reply[3]]) & 0x000f
    }

    fn test_zones() -> Vec<Zone> {
        vec![Zone {
            name: "containers.internal.".into(),
            records: vec![
                Record {
                    name: Some("gateway".into()),
                    regexp: None,
                    ip: Ipv4Addr::new(192, 168, 127, 1),
                },
                Record {
                    name: None,
                    regexp: Some("^app-[0-9]+$".into()),
                    ip: Ipv4Addr::new(192, 168, 127, 2),
                },
            ],
            default_ip: None,
        }]
    }

    #[tokio::test]
    async fn test_exact_record() {
        let server = DnsServer::new(&test_zones(), vec![]).unwrap();
        let query = build_query(7, "gateway.containers.internal", QTYPE_A);
        let reply = server.handle_query(&query).await.unwrap();
        assert_eq!(reply[..2], query[..2]);
        assert_eq!(parse_answer_ip(&reply), Some(Ipv4Addr::new(192, 168, 127, 1)));
        assert_eq!(rcode(&reply), 0);
    }

    #[tokio::test]
    async fn test_pattern_record() {
        let server = DnsServer::new(&test_zones(), vec![]).unwrap();
        let query = build_query(8, "app-42.containers.internal", QTYPE_A);
        let reply = server.handle_query(&query).await.unwrap();
        assert_eq!(parse_answer_ip(&reply), Some(Ipv4Addr::new(192, 168, 127, 2)));
    }

    #[tokio::test]
    async fn test_zone_miss_is_nxdomain() {
        let server = DnsServer::new(&test_zones(), vec![]).unwrap();
        let query = build_query(9, "unknown.containers.internal", QTYPE_A);
        let reply = server.handle_query(&query).await.unwrap();
        assert_eq!(rcode(&reply), RCODE_NXDOMAIN);
        assert_eq!(parse_answer_ip(&reply), None);
    }

    #[tokio::test]
    async fn test_default_ip_catches_zone_misses() {
        let mut zones = test_zones();
        zones[0].default_ip = Some(Ipv4Addr::new(192, 168, 127, 254));
        let server = DnsServer::new(&zones, vec![]).unwrap();
        let query = build_query(10, "whatever.containers.internal", QTYPE_A);
        let reply = server.handle_query(&query).await.unwrap();
        assert_eq!(
            parse_answer_ip(&reply),
            Some(Ipv4Addr::new(192, 168, 127, 254))
        );
    }

    #[tokio::test]
    async fn test_non_a_query_in_zone_is_empty_noerror() {
        let server = DnsServer::new(&test_zones(), vec![]).unwrap();
        let query = build_query(11, "gateway.containers.internal", 28); // AAAA
        let reply = server.handle_query(&query).await.unwrap();
        assert_eq!(rcode(&reply), 0);
        assert_eq!(parse_answer_ip(&reply), None);
    }

    #[tokio::test]
    async fn test_outside_zone_forwards_to_upstream() {
        // Fake upstream echoing a canned reply.
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = upstream.recv_from(&mut buf).await.unwrap();
            let mut reply = buf[..n].to_vec();
            reply[2] |= 0x80; // QR
            upstream.send_to(&reply, peer).await.unwrap();
        });

        let server = DnsServer::new(&test_zones(), vec![upstream_addr]).unwrap();
        let query = build_query(12, "example.com", QTYPE_A);
        let reply = server.handle_query(&query).await.unwrap();
        assert_eq!(reply[..2], query[..2]);
        assert_ne!(reply[2] & 0x80, 0);
    }

    #[tokio::test]
    async fn test_malformed_query_is_dropped() {
        let server = DnsServer::new(&test_zones(), vec![]).unwrap();
        assert!(server.handle_query(&[0u8; 5]).await.is_none());
    }

    #[test]
    fn test_record_without_matcher_is_rejected() {
        let zones = vec![Zone {
            name: "bad.".into(),
            records: vec![Record {
                name: None,
                regexp: None,
                ip: Ipv4Addr::LOCALHOST,
            }],
            default_ip: None,
        }];
        assert!(matches!(
            DnsServer::new(&zones, vec![]),
            Err(VgateError::Config(_))
        ));
    }
}
