//! Gateway configuration structures
//!
//! A [`Configuration`] is immutable once the gateway is constructed, with two
//! exceptions: the `forwards` and `nat` tables can be hot-reloaded through
//! [`crate::gateway::Gateway::reload_rules`].

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};
use smoltcp::wire::{EthernetAddress, Ipv4Cidr};

use crate::constants;
use crate::error::{Result, VgateError};

/// Frame encapsulation spoken on the guest transport link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Ethernet frames with a 32-bit big-endian length prefix.
    #[default]
    Qemu,
    /// Ethernet frames with a 16-bit little-endian length prefix.
    Hyperkit,
    /// One Ethernet frame per datagram, no prefix.
    Vfkit,
}

/// A single DNS record inside a zone.
///
/// Either `name` (exact match on the label under the zone) or `regexp`
/// (matched against the full query name) selects the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regexp: Option<String>,
    pub ip: Ipv4Addr,
}

/// Local DNS zone served by the gateway's embedded DNS server.
///
/// Queries not matching any zone are forwarded to the upstream resolvers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    /// Zone name with trailing dot (e.g. "containers.internal.")
    pub name: String,
    #[serde(default)]
    pub records: Vec<Record>,
    /// Answer for queries inside the zone that match no record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_ip: Option<Ipv4Addr>,
}

/// Full gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Enable verbose per-packet logging
    pub debug: bool,

    /// Optional pcap path. Accepted for compatibility but not implemented;
    /// loading a configuration with it set logs a warning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_file: Option<String>,

    /// MTU advertised to the guest via DHCP
    pub mtu: u16,

    /// Virtual network subnet in CIDR notation (e.g. "192.168.127.0/24")
    pub subnet: String,

    /// Gateway IP address inside the subnet
    pub gateway_ip: Ipv4Addr,

    /// Gateway MAC address as colon-separated string
    pub gateway_mac: String,

    /// Local DNS zones
    pub dns: Vec<Zone>,

    /// DNS search domains handed to the guest
    pub dns_search_domains: Vec<String>,

    /// Upstream resolvers for queries outside every zone
    pub dns_upstreams: Vec<SocketAddr>,

    /// Static port forwards seeded at startup: local endpoint -> guest endpoint
    pub forwards: BTreeMap<String, String>,

    /// NAT map: guest-visible IP -> real IP dialed on the host
    pub nat: BTreeMap<Ipv4Addr, Ipv4Addr>,

    /// Extra IPs the gateway answers ARP (and ICMP echo) for
    pub gateway_virtual_ips: Vec<Ipv4Addr>,

    /// Static DHCP leases: MAC -> IP
    pub dhcp_static_leases: BTreeMap<String, Ipv4Addr>,

    /// Frame encapsulation on the guest link
    pub protocol: Protocol,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            debug: false,
            capture_file: None,
            mtu: constants::DEFAULT_MTU,
            subnet: constants::SUBNET.to_string(),
            gateway_ip: constants::GATEWAY_IP.parse().unwrap_or(Ipv4Addr::UNSPECIFIED),
            gateway_mac: constants::GATEWAY_MAC_STRING.to_string(),
            dns: Vec::new(),
            dns_search_domains: constants::DNS_SEARCH_DOMAINS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            dns_upstreams: constants::DEFAULT_DNS_UPSTREAMS
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
            forwards: BTreeMap::new(),
            nat: BTreeMap::new(),
            gateway_virtual_ips: Vec::new(),
            dhcp_static_leases: BTreeMap::new(),
            protocol: Protocol::Qemu,
        }
    }
}

impl Configuration {
    /// Load a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the topology fields.
    ///
    /// A malformed subnet, a gateway outside the subnet, or an unparseable
    /// MAC is fatal to gateway construction.
    pub fn validate(&self) -> Result<()> {
        let subnet = self.subnet_cidr()?;
        if subnet.prefix_len() > 30 {
            return Err(VgateError::Config(format!(
                "subnet {} has no assignable host addresses",
                self.subnet
            )));
        }
        if !subnet.contains_addr(&self.gateway_ip) {
            return Err(VgateError::Config(format!(
                "gateway {} is outside subnet {}",
                self.gateway_ip, self.subnet
            )));
        }
        constants::parse_mac(&self.gateway_mac)?;
        for (mac, ip) in &self.dhcp_static_leases {
            constants::parse_mac(mac)?;
            if !subnet.contains_addr(ip) {
                return Err(VgateError::Config(format!(
                    "static lease {} is outside subnet {}",
                    ip, self.subnet
                )));
            }
        }
        if let Some(path) = &self.capture_file {
            tracing::warn!(path, "packet capture is not implemented, ignoring");
        }
        Ok(())
    }

    /// Parsed subnet CIDR.
    pub fn subnet_cidr(&self) -> Result<Ipv4Cidr> {
        self.subnet
            .parse()
            .map_err(|_| VgateError::Config(format!("invalid subnet '{}'", self.subnet)))
    }

    /// Parsed gateway MAC.
    pub fn gateway_mac(&self) -> Result<EthernetAddress> {
        constants::parse_mac(&self.gateway_mac)
    }

    /// Add a DNS zone.
    pub fn with_zone(mut self, zone: Zone) -> Self {
        self.dns.push(zone);
        self
    }

    /// Add a static port forward.
    pub fn with_forward(mut self, local: impl Into<String>, remote: impl Into<String>) -> Self {
        self.forwards.insert(local.into(), remote.into());
        self
    }

    /// Add a NAT mapping.
    pub fn with_nat(mut self, guest_visible: Ipv4Addr, real: Ipv4Addr) -> Self {
        self.nat.insert(guest_visible, real);
        self
    }

    /// Add a static DHCP lease.
    pub fn with_static_lease(mut self, mac: impl Into<String>, ip: Ipv4Addr) -> Self {
        self.dhcp_static_leases.insert(mac.into(), ip);
        self
    }

    /// Set the frame encapsulation.
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Enable debug logging.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}
