//! Virtual Ethernet stack
//!
//! One stack serves one guest link. The dispatch loop parses inbound frames
//! and routes them: ARP and ICMP echo are answered inline, DHCP and DNS go
//! to the embedded servers, everything else is handed to the forwarder.
//! Dispatch never blocks on host I/O; host-facing work lives in per-flow
//! tasks that push reply frames onto a shared channel, drained by a single
//! writer task.

pub mod craft;
pub mod framing;

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Cidr, Ipv4Packet, Ipv4Repr, TcpPacket, TcpRepr,
    UdpPacket, UdpRepr,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Protocol;
use crate::constants::{DHCP_CLIENT_PORT, DHCP_SERVER_PORT, DNS_PORT};
use crate::dhcp::DhcpServer;
use crate::dns::DnsServer;
use crate::error::Result;
use crate::forwarder::{tcp, udp};
use crate::pool::IpPool;
use crate::transport::Connection;

/// Depth of the shared reply-frame channel.
const FRAME_QUEUE: usize = 1024;

/// State shared between the dispatch loop and the per-flow tasks.
pub(crate) struct NetCtx {
    pub gateway_ip: Ipv4Addr,
    pub gateway_mac: EthernetAddress,
    pub mtu: u16,
    /// Sender for frames headed to the guest. Replaced on every (re)attach;
    /// tasks holding a stale clone fail to send and wind down.
    pub frames: RwLock<mpsc::Sender<Vec<u8>>>,
    /// Guest-visible address to real address.
    pub nat: RwLock<HashMap<Ipv4Addr, Ipv4Addr>>,
    pub flows: Mutex<HashMap<tcp::FlowKey, tcp::FlowHandle>>,
    pub udp_flows: Mutex<HashMap<udp::UdpFlowKey, udp::UdpFlowHandle>>,
    /// MACs learned from guest traffic, keyed by IP.
    pub neighbors: RwLock<HashMap<Ipv4Addr, EthernetAddress>>,
}

impl NetCtx {
    pub fn new(
        gateway_ip: Ipv4Addr,
        gateway_mac: EthernetAddress,
        mtu: u16,
        nat: HashMap<Ipv4Addr, Ipv4Addr>,
    ) -> Self {
        // Placeholder channel; a real one is installed when a link attaches.
        let (tx, _rx) = mpsc::channel(1);
        Self {
            gateway_ip,
            gateway_mac,
            mtu,
            frames: RwLock::new(tx),
            nat: RwLock::new(nat),
            flows: Mutex::new(HashMap::new()),
            udp_flows: Mutex::new(HashMap::new()),
            neighbors: RwLock::new(HashMap::new()),
        }
    }

    pub fn frame_sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.frames.read().clone()
    }

    /// Apply the NAT table to a guest-visible destination.
    pub fn translate(&self, ip: Ipv4Addr) -> Ipv4Addr {
        self.nat.read().get(&ip).copied().unwrap_or(ip)
    }

    fn learn_neighbor(&self, ip: Ipv4Addr, mac: EthernetAddress) {
        if self.neighbors.read().get(&ip) == Some(&mac) {
            return;
        }
        self.neighbors.write().insert(ip, mac);
    }
}

pub(crate) struct VirtualStack {
    ctx: Arc<NetCtx>,
    pool: Arc<IpPool>,
    dhcp: DhcpServer,
    dns: Arc<DnsServer>,
    subnet: Ipv4Cidr,
    virtual_ips: Vec<Ipv4Addr>,
}

impl VirtualStack {
    pub fn new(
        ctx: Arc<NetCtx>,
        pool: Arc<IpPool>,
        dhcp: DhcpServer,
        dns: Arc<DnsServer>,
        subnet: Ipv4Cidr,
        virtual_ips: Vec<Ipv4Addr>,
    ) -> Self {
        Self {
            ctx,
            pool,
            dhcp,
            dns,
            subnet,
            virtual_ips,
        }
    }

    /// Serve one guest link until it closes or the token fires.
    pub async fn run(
        &self,
        conn: Connection,
        protocol: Protocol,
        token: CancellationToken,
    ) -> Result<()> {
        let (mut reader, mut writer) = framing::split(conn, protocol)?;

        let (tx, mut rx) = mpsc::channel(FRAME_QUEUE);
        *self.ctx.frames.write() = tx;

        let writer_token = token.child_token();
        let writer_task = {
            let writer_token = writer_token.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = writer_token.cancelled() => break,
                        frame = rx.recv() => {
                            let Some(frame) = frame else { break };
                            if let Err(err) = writer.write_frame(&frame).await {
                                tracing::debug!(error = %err, "link write failed");
                                break;
                            }
                        }
                    }
                }
            })
        };

        let result = loop {
            tokio::select! {
                _ = token.cancelled() => break Ok(()),
                frame = reader.read_frame() => match frame {
                    Ok(Some(frame)) => self.dispatch(&frame).await,
                    Ok(None) => {
                        tracing::info!("guest link closed");
                        break Ok(());
                    }
                    Err(err) => break Err(err),
                },
            }
        };

        // Tear down per-link state; relay tasks notice their event channels
        // closing and exit on their own.
        self.ctx.flows.lock().clear();
        self.ctx.udp_flows.lock().clear();
        writer_token.cancel();
        let _ = writer_task.await;
        result
    }

    /// Route one frame from the guest. Malformed frames are dropped.
    pub async fn dispatch(&self, frame: &[u8]) {
        let Ok(eth) = EthernetFrame::new_checked(frame) else {
            tracing::trace!(len = frame.len(), "runt frame dropped");
            return;
        };
        match eth.ethertype() {
            EthernetProtocol::Arp => self.handle_arp(eth.payload()).await,
            EthernetProtocol::Ipv4 => self.handle_ipv4(eth.src_addr(), eth.payload()).await,
            other => {
                tracing::trace!(ethertype = %other, "unhandled ethertype");
            }
        }
    }

    async fn handle_arp(&self, payload: &[u8]) {
        let Ok(packet) = ArpPacket::new_checked(payload) else {
            return;
        };
        let Ok(ArpRepr::EthernetIpv4 {
            operation,
            source_hardware_addr,
            source_protocol_addr,
            target_protocol_addr,
            ..
        }) = ArpRepr::parse(&packet)
        else {
            return;
        };

        if !source_protocol_addr.is_unspecified() {
            self.ctx
                .learn_neighbor(source_protocol_addr, source_hardware_addr);
        }

        if operation == ArpOperation::Request && self.claims(target_protocol_addr) {
            let reply = craft::arp_reply(
                self.ctx.gateway_mac,
                target_protocol_addr,
                source_hardware_addr,
                source_protocol_addr,
            );
            self.emit(reply).await;
        }
    }

    /// Whether the gateway answers ARP for `ip`: its own address, the
    /// configured virtual addresses, and any unleased address of the subnet
    /// (traffic for those is routed to the host side).
    fn claims(&self, ip: Ipv4Addr) -> bool {
        if ip == self.ctx.gateway_ip || self.virtual_ips.contains(&ip) {
            return true;
        }
        self.subnet.contains_addr(&ip) && !self.pool.is_leased(ip)
    }

    async fn handle_ipv4(&self, guest_mac: EthernetAddress, payload: &[u8]) {
        let caps = ChecksumCapabilities::default();
        let Ok(packet) = Ipv4Packet::new_checked(payload) else {
            return;
        };
        let Ok(ip) = Ipv4Repr::parse(&packet, &caps) else {
            return;
        };

        if self.subnet.contains_addr(&ip.src_addr) {
            self.ctx.learn_neighbor(ip.src_addr, guest_mac);
        }

        match ip.next_header {
            IpProtocol::Icmp => self.handle_icmp(guest_mac, &ip, packet.payload()).await,
            IpProtocol::Udp => self.handle_udp(guest_mac, &ip, packet.payload()).await,
            IpProtocol::Tcp => {
                let Ok(segment) = TcpPacket::new_checked(packet.payload()) else {
                    return;
                };
                let Ok(tcp) = TcpRepr::parse(
                    &segment,
                    &ip.src_addr.into(),
                    &ip.dst_addr.into(),
                    &caps,
                ) else {
                    return;
                };
                let src = SocketAddrV4::new(ip.src_addr, tcp.src_port);
                let dst = SocketAddrV4::new(ip.dst_addr, tcp.dst_port);
                tcp::handle_segment(&self.ctx, guest_mac, src, dst, &tcp).await;
            }
            other => {
                tracing::trace!(protocol = %other, "unhandled ip protocol");
            }
        }
    }

    async fn handle_icmp(&self, guest_mac: EthernetAddress, ip: &Ipv4Repr, payload: &[u8]) {
        if ip.dst_addr != self.ctx.gateway_ip && !self.virtual_ips.contains(&ip.dst_addr) {
            return;
        }
        let caps = ChecksumCapabilities::default();
        let Ok(packet) = Icmpv4Packet::new_checked(payload) else {
            return;
        };
        let Ok(Icmpv4Repr::EchoRequest {
            ident,
            seq_no,
            data,
        }) = Icmpv4Repr::parse(&packet, &caps)
        else {
            return;
        };

        let reply = craft::icmp_echo_reply(
            self.ctx.gateway_mac,
            guest_mac,
            ip.dst_addr,
            ip.src_addr,
            ident,
            seq_no,
            data,
        );
        self.emit(reply).await;
    }

    async fn handle_udp(&self, guest_mac: EthernetAddress, ip: &Ipv4Repr, payload: &[u8]) {
        let caps = ChecksumCapabilities::default();
        let Ok(packet) = UdpPacket::new_checked(payload) else {
            return;
        };
        if UdpRepr::parse(
            &packet,
            &ip.src_addr.into(),
            &ip.dst_addr.into(),
            &caps,
        )
        .is_err()
        {
            return;
        }
        let src = SocketAddrV4::new(ip.src_addr, packet.src_port());
        let dst = SocketAddrV4::new(ip.dst_addr, packet.dst_port());
        let datagram = packet.payload();

        if dst.port() == DHCP_SERVER_PORT {
            if let Some(reply) = self.dhcp.handle(datagram) {
                self.ctx.learn_neighbor(reply.client_ip, reply.client_mac);
                let frame = craft::udp_frame(
                    self.ctx.gateway_mac,
                    reply.client_mac,
                    SocketAddrV4::new(self.ctx.gateway_ip, DHCP_SERVER_PORT),
                    SocketAddrV4::new(reply.client_ip, DHCP_CLIENT_PORT),
                    &reply.payload,
                );
                self.emit(frame).await;
            }
            return;
        }

        if dst.port() == DNS_PORT
            && (dst.ip() == &self.ctx.gateway_ip || self.virtual_ips.contains(dst.ip()))
        {
            // Upstream forwarding can wait on the network; answer off-path.
            let dns = self.dns.clone();
            let frames = self.ctx.frame_sender();
            let gateway_mac = self.ctx.gateway_mac;
            let query = datagram.to_vec();
            tokio::spawn(async move {
                if let Some(answer) = dns.handle_query(&query).await {
                    let frame = craft::udp_frame(gateway_mac, guest_mac, dst, src, &answer);
                    let _ = frames.send(frame).await;
                }
            });
            return;
        }

        if dst.ip().is_broadcast() || dst.ip().is_multicast() {
            tracing::trace!(%dst, "broadcast datagram dropped");
            return;
        }
        udp::handle_datagram(&self.ctx, guest_mac, src, dst, datagram).await;
    }

    async fn emit(&self, frame: Vec<u8>) {
        if self.ctx.frame_sender().send(frame).await.is_err() {
            tracing::trace!("no guest link attached, frame dropped");
        }
    }
}
