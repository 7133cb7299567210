//! DHCPv4 wire codec
//!
//! Fixed BOOTP header, magic cookie, then option TLVs. Only what the
//! embedded server needs; anything unparseable is `None` and the caller
//! drops the exchange.

use std::net::Ipv4Addr;

use smoltcp::wire::EthernetAddress;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
pub const HTYPE_ETHERNET: u8 = 1;
pub const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

/// BOOTP fixed header length, up to and including the magic cookie.
pub const HEADER_LEN: usize = 240;
/// Minimum BOOTP packet size; replies are padded up to this.
pub const MIN_PACKET_LEN: usize = 300;

pub const OPT_PAD: u8 = 0;
pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_ROUTER: u8 = 3;
pub const OPT_DNS_SERVERS: u8 = 6;
pub const OPT_HOST_NAME: u8 = 12;
pub const OPT_INTERFACE_MTU: u8 = 26;
pub const OPT_REQUESTED_IP: u8 = 50;
pub const OPT_LEASE_TIME: u8 = 51;
pub const OPT_MESSAGE_TYPE: u8 = 53;
pub const OPT_SERVER_ID: u8 = 54;
pub const OPT_PARAMETER_LIST: u8 = 55;
pub const OPT_CLIENT_ID: u8 = 61;
pub const OPT_END: u8 = 255;

pub const DHCP_DISCOVER: u8 = 1;
pub const DHCP_OFFER: u8 = 2;
pub const DHCP_REQUEST: u8 = 3;
pub const DHCP_DECLINE: u8 = 4;
pub const DHCP_ACK: u8 = 5;
pub const DHCP_NAK: u8 = 6;
pub const DHCP_RELEASE: u8 = 7;
pub const DHCP_INFORM: u8 = 8;

/// A parsed (or to-be-emitted) DHCPv4 packet.
#[derive(Debug, Clone)]
pub struct Packet {
    pub op: u8,
    pub xid: u32,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    /// Options in wire order, excluding PAD and END.
    pub options: Vec<(u8, Vec<u8>)>,
}

impl Packet {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN || data[236..240] != MAGIC_COOKIE {
            return None;
        }

        let ip = |off: usize| Ipv4Addr::new(data[off], data[off + 1], data[off + 2], data[off + 3]);
        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[28..44]);

        let mut options = Vec::new();
        let mut pos = HEADER_LEN;
        while pos < data.len() {
            let code = data[pos];
            pos += 1;
            match code {
                OPT_PAD => continue,
                OPT_END => break,
                _ => {
                    let len = *data.get(pos)? as usize;
                    pos += 1;
                    let value = data.get(pos..pos + len)?;
                    options.push((code, value.to_vec()));
                    pos += len;
                }
            }
        }

        Some(Self {
            op: data[0],
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: ip(12),
            yiaddr: ip(16),
            siaddr: ip(20),
            giaddr: ip(24),
            chaddr,
            options,
        })
    }

    pub fn emit(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0] = self.op;
        buf[1] = HTYPE_ETHERNET;
        buf[2] = 6; // hlen
        buf[4..8].copy_from_slice(&self.xid.to_be_bytes());
        buf[10..12].copy_from_slice(&self.flags.to_be_bytes());
        buf[12..16].copy_from_slice(&self.ciaddr.octets());
        buf[16..20].copy_from_slice(&self.yiaddr.octets());
        buf[20..24].copy_from_slice(&self.siaddr.octets());
        buf[24..28].copy_from_slice(&self.giaddr.octets());
        buf[28..44].copy_from_slice(&self.chaddr);
        buf[236..240].copy_from_slice(&MAGIC_COOKIE);

        for (code, value) in &self.options {
            buf.push(*code);
            buf.push(value.len() as u8);
            buf.extend_from_slice(value);
        }
        buf.push(OPT_END);
        if buf.len() < MIN_PACKET_LEN {
            buf.resize(MIN_PACKET_LEN, 0);
        }
        buf
    }

    pub fn option(&self, code: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.as_slice())
    }

    pub fn message_type(&self) -> Option<u8> {
        self.option(OPT_MESSAGE_TYPE)?.first().copied()
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        let v = self.option(OPT_REQUESTED_IP)?;
        let octets: [u8; 4] = v.try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }

    pub fn client_mac(&self) -> EthernetAddress {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.chaddr[..6]);
        EthernetAddress(mac)
    }
}
