//! IP address pool for the virtual subnet
//!
//! The pool owns every lease; the DHCP server reads and writes leases only
//! through this API. An IP is leased to at most one MAC at a time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use smoltcp::wire::{EthernetAddress, Ipv4Cidr};

use crate::constants::mac_to_string;
use crate::error::{Result, VgateError};

/// One address lease.
#[derive(Debug, Clone, Copy)]
pub struct Lease {
    pub ip: Ipv4Addr,
    pub expires_at: Instant,
}

#[derive(Debug, Default)]
struct PoolState {
    by_mac: HashMap<EthernetAddress, Lease>,
    in_use: HashSet<Ipv4Addr>,
}

/// Subnet-scoped address pool.
///
/// Read-mostly: assignment happens a handful of times per guest lifetime,
/// while ARP dispatch checks [`IpPool::is_leased`] on every request.
#[derive(Debug)]
pub struct IpPool {
    subnet: Ipv4Cidr,
    gateway: Ipv4Addr,
    lease_time: Duration,
    state: RwLock<PoolState>,
}

impl IpPool {
    pub fn new(subnet: Ipv4Cidr, gateway: Ipv4Addr, lease_time: Duration) -> Self {
        Self {
            subnet,
            gateway,
            lease_time,
            state: RwLock::new(PoolState::default()),
        }
    }

    pub fn subnet(&self) -> Ipv4Cidr {
        self.subnet
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn lease_time(&self) -> Duration {
        self.lease_time
    }

    /// Return the existing lease for `mac`, or assign the next free host
    /// address in the subnet. Refreshes the expiry on every hit.
    ///
    /// Never returns a zero IP: exhaustion is a typed error.
    pub fn get_or_assign(&self, mac: EthernetAddress) -> Result<Ipv4Addr> {
        let mut state = self.state.write();

        if let Some(lease) = state.by_mac.get_mut(&mac) {
            lease.expires_at = Instant::now() + self.lease_time;
            return Ok(lease.ip);
        }

        let network = u32::from(self.subnet.network().address());
        let broadcast = self
            .subnet
            .broadcast()
            .map(u32::from)
            .unwrap_or(u32::MAX);
        let gateway = u32::from(self.gateway);

        for raw in network + 1..broadcast {
            if raw == gateway {
                continue;
            }
            let candidate = Ipv4Addr::from(raw);
            if state.in_use.contains(&candidate) {
                continue;
            }
            state.in_use.insert(candidate);
            state.by_mac.insert(
                mac,
                Lease {
                    ip: candidate,
                    expires_at: Instant::now() + self.lease_time,
                },
            );
            tracing::info!(mac = %mac_to_string(&mac), ip = %candidate, "assigned lease");
            return Ok(candidate);
        }

        Err(VgateError::PoolExhausted {
            subnet: self.subnet.to_string(),
        })
    }

    /// Pre-seed a static lease. Fails if the address is already leased to a
    /// different MAC.
    pub fn reserve(&self, ip: Ipv4Addr, mac: EthernetAddress) -> Result<()> {
        let mut state = self.state.write();
        match state.by_mac.get(&mac) {
            Some(lease) if lease.ip == ip => return Ok(()),
            _ if state.in_use.contains(&ip) => return Err(VgateError::AddressInUse { ip }),
            _ => {}
        }
        if let Some(old) = state.by_mac.insert(
            mac,
            Lease {
                ip,
                expires_at: Instant::now() + self.lease_time,
            },
        ) {
            state.in_use.remove(&old.ip);
        }
        state.in_use.insert(ip);
        tracing::debug!(mac = %mac_to_string(&mac), ip = %ip, "reserved static lease");
        Ok(())
    }

    /// Free the lease held by `mac`, if any.
    pub fn release(&self, mac: EthernetAddress) -> Option<Ipv4Addr> {
        let mut state = self.state.write();
        let lease = state.by_mac.remove(&mac)?;
        state.in_use.remove(&lease.ip);
        tracing::debug!(mac = %mac_to_string(&mac), ip = %lease.ip, "released lease");
        Some(lease.ip)
    }

    /// Whether `ip` is currently leased to any client.
    pub fn is_leased(&self, ip: Ipv4Addr) -> bool {
        self.state.read().in_use.contains(&ip)
    }

    /// Snapshot of all leases as MAC string -> IP. A copy, never the live map.
    pub fn leases(&self) -> BTreeMap<String, Ipv4Addr> {
        self.state
            .read()
            .by_mac
            .iter()
            .map(|(mac, lease)| (mac_to_string(mac), lease.ip))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(subnet: &str, gateway: Ipv4Addr) -> IpPool {
        IpPool::new(subnet.parse().unwrap(), gateway, Duration::from_secs(3600))
    }

    fn mac(last: u8) -> EthernetAddress {
        EthernetAddress([0x5a, 0x94, 0xef, 0xe4, 0x0c, last])
    }

    #[test]
    fn test_assignment_skips_network_gateway_broadcast() {
        let p = pool("192.168.127.0/24", Ipv4Addr::new(192, 168, 127, 1));
        let ip = p.get_or_assign(mac(1)).unwrap();
        assert_eq!(ip, Ipv4Addr::new(192, 168, 127, 2));
    }

    #[test]
    fn test_get_or_assign_is_stable_per_mac() {
        let p = pool("192.168.127.0/24", Ipv4Addr::new(192, 168, 127, 1));
        let first = p.get_or_assign(mac(1)).unwrap();
        let second = p.get_or_assign(mac(1)).unwrap();
        assert_eq!(first, second);

        let other = p.get_or_assign(mac(2)).unwrap();
        assert_ne!(first, other);
    }

    #[test]
    fn test_exhaustion_is_typed() {
        // /29 leaves 5 assignable hosts after network, broadcast, gateway.
        let p = pool("10.0.0.0/29", Ipv4Addr::new(10, 0, 0, 1));
        for i in 0..5 {
            p.get_or_assign(mac(i)).unwrap();
        }
        let err = p.get_or_assign(mac(99)).unwrap_err();
        assert!(matches!(err, VgateError::PoolExhausted { .. }));
    }

    #[test]
    fn test_release_frees_the_address() {
        let p = pool("10.0.0.0/29", Ipv4Addr::new(10, 0, 0, 1));
        for i in 0..5 {
            p.get_or_assign(mac(i)).unwrap();
        }
        let freed = p.release(mac(3)).unwrap();
        let reassigned = p.get_or_assign(mac(99)).unwrap();
        assert_eq!(freed, reassigned);
        assert!(p.release(mac(3)).is_none());
    }

    #[test]
    fn test_reserve_conflicts() {
        let p = pool("192.168.127.0/24", Ipv4Addr::new(192, 168, 127, 1));
        let ip = Ipv4Addr::new(192, 168, 127, 10);
        p.reserve(ip, mac(1)).unwrap();
        // Same pair is idempotent.
        p.reserve(ip, mac(1)).unwrap();
        // Same IP, different MAC conflicts.
        assert!(matches!(
            p.reserve(ip, mac(2)),
            Err(VgateError::AddressInUse { .. })
        ));
        // The reserved MAC keeps its address through DHCP.
        assert_eq!(p.get_or_assign(mac(1)).unwrap(), ip);
    }

    #[test]
    fn test_leases_snapshot() {
        let p = pool("192.168.127.0/24", Ipv4Addr::new(192, 168, 127, 1));
        let ip = p.get_or_assign(mac(0xee)).unwrap();
        let snapshot = p.leases();
        assert_eq!(snapshot.get("5a:94:ef:e4:0c:ee"), Some(&ip));
        assert!(p.is_leased(ip));
    }
}
