//! Virtual network constants shared across gateway components
//!
//! These define the default topology handed to guests and must remain
//! consistent between the configuration defaults, the DHCP server, and
//! the virtual stack.

use smoltcp::wire::EthernetAddress;

use crate::error::{Result, VgateError};

/// Default virtual network subnet
pub const SUBNET: &str = "192.168.127.0/24";

/// Default gateway IP address (the gateway answers DHCP, DNS, and ICMP here)
pub const GATEWAY_IP: &str = "192.168.127.1";

/// Default gateway MAC address
///
/// Uses locally administered address space (bit 2 of first octet set).
pub const GATEWAY_MAC: [u8; 6] = [0x5a, 0x94, 0xef, 0xe4, 0x0c, 0xdd];

/// Gateway MAC address as colon-separated string
pub const GATEWAY_MAC_STRING: &str = "5a:94:ef:e4:0c:dd";

/// Default MTU for the virtual network
pub const DEFAULT_MTU: u16 = 1500;

/// Default DNS lease duration handed out in DHCP replies
pub const DHCP_LEASE_SECS: u32 = 3600;

/// DHCP server port on the virtual link
pub const DHCP_SERVER_PORT: u16 = 67;

/// DHCP client port on the virtual link
pub const DHCP_CLIENT_PORT: u16 = 68;

/// DNS port served on the gateway IP
pub const DNS_PORT: u16 = 53;

/// Upstream resolvers used for queries outside every configured zone
pub const DEFAULT_DNS_UPSTREAMS: &[&str] = &["8.8.8.8:53", "8.8.4.4:53"];

/// DNS search domains handed out alongside leases
pub const DNS_SEARCH_DOMAINS: &[&str] = &["local"];

/// Capacity of the notification queue; events beyond this are dropped
pub const NOTIFY_QUEUE_CAPACITY: usize = 100;

/// Magic bytes a vfkit peer sends in its first datagram
pub const VFKIT_MAGIC: [u8; 4] = *b"VFKT";

/// Format a MAC address as a colon-separated string
pub fn mac_to_string(mac: &EthernetAddress) -> String {
    let b = mac.as_bytes();
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5]
    )
}

/// Parse a colon-separated MAC address string
pub fn parse_mac(s: &str) -> Result<EthernetAddress> {
    let mut bytes = [0u8; 6];
    let mut parts = s.split(':');
    for byte in bytes.iter_mut() {
        let part = parts
            .next()
            .ok_or_else(|| VgateError::Config(format!("invalid MAC address '{}'", s)))?;
        *byte = u8::from_str_radix(part, 16)
            .map_err(|_| VgateError::Config(format!("invalid MAC address '{}'", s)))?;
    }
    if parts.next().is_some() {
        return Err(VgateError::Config(format!("invalid MAC address '{}'", s)));
    }
    Ok(EthernetAddress(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_round_trip() {
        let mac = parse_mac(GATEWAY_MAC_STRING).unwrap();
        assert_eq!(mac.as_bytes(), GATEWAY_MAC);
        assert_eq!(mac_to_string(&mac), GATEWAY_MAC_STRING);
    }

    #[test]
    fn test_parse_mac_rejects_garbage() {
        assert!(parse_mac("not-a-mac").is_err());
        assert!(parse_mac("5a:94:ef:e4:0c").is_err());
        assert!(parse_mac("5a:94:ef:e4:0c:dd:00").is_err());
        assert!(parse_mac("zz:94:ef:e4:0c:dd").is_err());
    }
}
