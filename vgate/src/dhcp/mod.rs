//! Embedded DHCPv4 server
//!
//! Stateless per exchange: Discover is answered with an Offer, Request with
//! an Ack, and every other message type is logged and dropped. The lease
//! itself lives in the [`IpPool`]; the same pool lookup backs both the Offer
//! and the Ack, so a Discover/Request pair always sees the same address.

pub mod wire;

use std::net::Ipv4Addr;
use std::sync::Arc;

use smoltcp::wire::EthernetAddress;

use crate::constants::mac_to_string;
use crate::notify::{Notification, NotifySender};
use crate::pool::IpPool;

/// A reply ready for the virtual stack to frame: the UDP payload plus the
/// L2/L3 addressing of the client it goes back to.
#[derive(Debug)]
pub struct DhcpReply {
    pub payload: Vec<u8>,
    pub client_mac: EthernetAddress,
    pub client_ip: Ipv4Addr,
}

#[derive(Debug)]
pub struct DhcpServer {
    pool: Arc<IpPool>,
    mtu: u16,
    notifier: NotifySender,
}

impl DhcpServer {
    pub fn new(pool: Arc<IpPool>, mtu: u16, notifier: NotifySender) -> Self {
        Self {
            pool,
            mtu,
            notifier,
        }
    }

    /// Handle one packet arriving on the virtual link's port 67.
    pub fn handle(&self, payload: &[u8]) -> Option<DhcpReply> {
        let request = wire::Packet::parse(payload)?;
        if request.op != wire::BOOTREQUEST {
            return None;
        }
        let mac = request.client_mac();

        let reply_type = match request.message_type()? {
            wire::DHCP_DISCOVER => wire::DHCP_OFFER,
            wire::DHCP_REQUEST => wire::DHCP_ACK,
            other => {
                tracing::debug!(
                    mac = %mac_to_string(&mac),
                    message_type = other,
                    "unhandled DHCP message type"
                );
                return None;
            }
        };

        let ip = match self.pool.get_or_assign(mac) {
            Ok(ip) => ip,
            Err(err) => {
                tracing::warn!(mac = %mac_to_string(&mac), error = %err, "DHCP assignment failed");
                return None;
            }
        };

        if reply_type == wire::DHCP_ACK {
            self.notifier.send(Notification::LeaseAssigned {
                mac: mac_to_string(&mac),
                ip,
            });
        }

        Some(DhcpReply {
            payload: self.build_reply(&request, reply_type, ip).emit(),
            client_mac: mac,
            client_ip: ip,
        })
    }

    fn build_reply(&self, request: &wire::Packet, reply_type: u8, ip: Ipv4Addr) -> wire::Packet {
        let gateway = self.pool.gateway();
        let lease_secs = self.pool.lease_time().as_secs() as u32;
        let netmask: Ipv4Addr = self.pool.subnet().netmask();

        wire::Packet {
            op: wire::BOOTREPLY,
            xid: request.xid,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: ip,
            siaddr: gateway,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: request.chaddr,
            options: vec![
                (wire::OPT_MESSAGE_TYPE, vec![reply_type]),
                (wire::OPT_SERVER_ID, gateway.octets().to_vec()),
                (wire::OPT_LEASE_TIME, lease_secs.to_be_bytes().to_vec()),
                (wire::OPT_SUBNET_MASK, netmask.octets().to_vec()),
                (wire::OPT_ROUTER, gateway.octets().to_vec()),
                (wire::OPT_DNS_SERVERS, gateway.octets().to_vec()),
                (wire::OPT_INTERFACE_MTU, self.mtu.to_be_bytes().to_vec()),
            ],
        }
    }
}
