//! Gateway assembly
//!
//! Ties the address pool, the embedded DHCP and DNS servers, the virtual
//! stack, and the port forwarder together behind one handle. Everything is
//! instance state; two gateways in one process do not share anything.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::api;
use crate::config::Configuration;
use crate::constants::{DHCP_LEASE_SECS, parse_mac};
use crate::dhcp::DhcpServer;
use crate::dns::DnsServer;
use crate::error::Result;
use crate::forwarder::PortForwarder;
use crate::notify::{Notification, NotifySender};
use crate::pool::IpPool;
use crate::stack::{NetCtx, VirtualStack};
use crate::transport::Connection;

pub struct Gateway {
    config: Configuration,
    pool: Arc<IpPool>,
    ctx: Arc<NetCtx>,
    stack: VirtualStack,
    forwarder: Arc<PortForwarder>,
    notifier: NotifySender,
    token: CancellationToken,
    seeded: AtomicBool,
}

impl Gateway {
    pub fn new(config: Configuration) -> Result<Self> {
        Self::with_notifier(config, NotifySender::disabled())
    }

    /// Build a gateway that reports operational events through `notifier`.
    pub fn with_notifier(config: Configuration, notifier: NotifySender) -> Result<Self> {
        config.validate()?;
        let subnet = config.subnet_cidr()?;
        let gateway_mac = config.gateway_mac()?;

        let pool = Arc::new(IpPool::new(
            subnet,
            config.gateway_ip,
            Duration::from_secs(u64::from(DHCP_LEASE_SECS)),
        ));
        for (mac, ip) in &config.dhcp_static_leases {
            pool.reserve(*ip, parse_mac(mac)?)?;
        }

        let ctx = Arc::new(NetCtx::new(
            config.gateway_ip,
            gateway_mac,
            config.mtu,
            config.nat.iter().map(|(k, v)| (*k, *v)).collect(),
        ));
        let dns = Arc::new(DnsServer::new(&config.dns, config.dns_upstreams.clone())?);
        let dhcp = DhcpServer::new(pool.clone(), config.mtu, notifier.clone());
        let stack = VirtualStack::new(
            ctx.clone(),
            pool.clone(),
            dhcp,
            dns,
            subnet,
            config.gateway_virtual_ips.clone(),
        );
        let forwarder = Arc::new(PortForwarder::new(ctx.clone(), notifier.clone()));

        Ok(Self {
            config,
            pool,
            ctx,
            stack,
            forwarder,
            notifier,
            token: CancellationToken::new(),
            seeded: AtomicBool::new(false),
        })
    }

    /// Serve one guest link until it closes or [`Gateway::shutdown`] fires.
    ///
    /// The first call also seeds the port forwards from the configuration;
    /// a reattached link keeps whatever the table holds by then.
    pub async fn run(&self, conn: Connection) -> Result<()> {
        if !self.seeded.swap(true, Ordering::SeqCst) {
            for (local, remote) in &self.config.forwards {
                if let Err(err) = self.forwarder.expose(local, remote).await {
                    tracing::warn!(%local, %remote, error = %err, "configured forward failed");
                }
            }
        }

        self.notifier.send(Notification::NetworkReady {
            gateway: self.config.gateway_ip,
        });
        tracing::info!(
            gateway = %self.config.gateway_ip,
            subnet = %self.config.subnet,
            protocol = ?self.config.protocol,
            "serving guest link"
        );
        self.stack
            .run(conn, self.config.protocol, self.token.clone())
            .await
    }

    /// Control API over this gateway's tables.
    pub fn router(&self) -> Router {
        api::router(self.forwarder.clone(), self.pool.clone())
    }

    pub fn forwarder(&self) -> Arc<PortForwarder> {
        self.forwarder.clone()
    }

    /// Current DHCP leases, keyed by MAC.
    pub fn leases(&self) -> BTreeMap<String, Ipv4Addr> {
        self.pool.leases()
    }

    /// Replace the forwarding and NAT rules, converging the exposure table:
    /// dropped entries are unexposed, new or changed entries re-exposed.
    /// Established flows are unaffected.
    pub async fn reload_rules(
        &self,
        forwards: &BTreeMap<String, String>,
        nat: &BTreeMap<Ipv4Addr, Ipv4Addr>,
    ) -> Result<()> {
        let current = self.forwarder.list();
        for entry in &current {
            match forwards.get(&entry.local) {
                Some(remote) if *remote == entry.remote => {}
                _ => self.forwarder.unexpose(&entry.local),
            }
        }
        for (local, remote) in forwards {
            let unchanged = current
                .iter()
                .any(|e| &e.local == local && &e.remote == remote);
            if unchanged {
                continue;
            }
            if let Err(err) = self.forwarder.expose(local, remote).await {
                tracing::warn!(%local, %remote, error = %err, "forward reload failed");
            }
        }

        *self.ctx.nat.write() = nat.iter().map(|(k, v)| (*k, *v)).collect();
        tracing::info!(
            forwards = forwards.len(),
            nat = nat.len(),
            "rules reloaded"
        );
        Ok(())
    }

    /// Stop serving. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;

    #[tokio::test]
    async fn test_static_leases_are_reserved_at_build() {
        let config = Configuration::default()
            .with_static_lease("02:32:17:00:00:05", Ipv4Addr::new(192, 168, 127, 5));
        let gateway = Gateway::new(config).unwrap();
        assert_eq!(
            gateway.leases().get("02:32:17:00:00:05"),
            Some(&Ipv4Addr::new(192, 168, 127, 5))
        );
    }

    #[tokio::test]
    async fn test_invalid_configuration_is_rejected() {
        let mut config = Configuration::default();
        config.subnet = "not-a-subnet".to_string();
        assert!(Gateway::new(config).is_err());

        let mut config = Configuration::default();
        config.gateway_ip = Ipv4Addr::new(10, 0, 0, 1);
        assert!(Gateway::new(config).is_err());
    }

    #[tokio::test]
    async fn test_reload_rules_converges_the_table() {
        let config = Configuration::default().with_protocol(Protocol::Qemu);
        let gateway = Gateway::new(config).unwrap();
        gateway
            .forwarder()
            .expose("127.0.0.1:0", "192.168.127.2:80")
            .await
            .unwrap();

        let mut forwards = BTreeMap::new();
        let mut nat = BTreeMap::new();
        nat.insert(
            Ipv4Addr::new(192, 168, 127, 254),
            Ipv4Addr::new(127, 0, 0, 1),
        );
        gateway.reload_rules(&forwards, &nat).await.unwrap();
        assert!(gateway.forwarder().list().is_empty());
        assert_eq!(
            gateway.ctx.translate(Ipv4Addr::new(192, 168, 127, 254)),
            Ipv4Addr::new(127, 0, 0, 1)
        );

        forwards.insert("127.0.0.1:0".to_string(), "192.168.127.3:22".to_string());
        gateway.reload_rules(&forwards, &nat).await.unwrap();
        let listed = gateway.forwarder().list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].remote, "192.168.127.3:22");
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let gateway = Gateway::new(Configuration::default()).unwrap();
        gateway.shutdown();
        gateway.shutdown();
    }
}
