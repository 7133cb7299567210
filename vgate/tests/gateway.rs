//! End-to-end tests driving a gateway over an in-memory guest link.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetFrame, EthernetProtocol, Icmpv4Packet, Icmpv4Repr,
    IpProtocol, Ipv4Packet, Ipv4Repr, TcpControl, TcpPacket, TcpRepr, TcpSeqNumber, UdpPacket,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

use vgate::config::Protocol;
use vgate::stack::craft;
use vgate::stack::framing::{self, FrameReader, FrameWriter};
use vgate::transport::Connection;
use vgate::{Configuration, Gateway};

const GW_MAC: smoltcp::wire::EthernetAddress =
    smoltcp::wire::EthernetAddress([0x5a, 0x94, 0xef, 0xe4, 0x0c, 0xdd]);
const GUEST_MAC: smoltcp::wire::EthernetAddress =
    smoltcp::wire::EthernetAddress([0x02, 0x32, 0x17, 0x00, 0x00, 0x02]);
const GW_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 127, 1);
const GUEST_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 127, 2);

const WAIT: Duration = Duration::from_secs(5);

/// The guest's end of the link, speaking qemu framing.
struct Guest {
    reader: FrameReader,
    writer: FrameWriter,
}

/// A TCP segment as the guest saw it.
#[derive(Debug)]
struct Segment {
    src: SocketAddrV4,
    dst: SocketAddrV4,
    control: TcpControl,
    seq: TcpSeqNumber,
    ack: Option<TcpSeqNumber>,
    payload: Vec<u8>,
}

impl Guest {
    async fn send(&mut self, frame: &[u8]) {
        self.writer.write_frame(frame).await.unwrap();
    }

    async fn recv(&mut self) -> Vec<u8> {
        timeout(WAIT, self.reader.read_frame())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .expect("link closed")
    }

    /// Next TCP segment addressed to the guest, answering ARP requests for
    /// the guest's address along the way.
    async fn recv_tcp(&mut self) -> Segment {
        loop {
            let frame = self.recv().await;
            let eth = EthernetFrame::new_checked(&frame[..]).unwrap();
            match eth.ethertype() {
                EthernetProtocol::Arp => {
                    let arp = ArpPacket::new_checked(eth.payload()).unwrap();
                    let Ok(ArpRepr::EthernetIpv4 {
                        operation,
                        source_hardware_addr,
                        source_protocol_addr,
                        target_protocol_addr,
                        ..
                    }) = ArpRepr::parse(&arp)
                    else {
                        continue;
                    };
                    if operation == ArpOperation::Request && target_protocol_addr == GUEST_IP {
                        let reply = craft::arp_reply(
                            GUEST_MAC,
                            GUEST_IP,
                            source_hardware_addr,
                            source_protocol_addr,
                        );
                        self.send(&reply).await;
                    }
                }
                EthernetProtocol::Ipv4 => {
                    let caps = ChecksumCapabilities::default();
                    let ip_packet = Ipv4Packet::new_checked(eth.payload()).unwrap();
                    let ip = Ipv4Repr::parse(&ip_packet, &caps).unwrap();
                    if ip.next_header != IpProtocol::Tcp {
                        continue;
                    }
                    let tcp_packet = TcpPacket::new_checked(ip_packet.payload()).unwrap();
                    let tcp = TcpRepr::parse(
                        &tcp_packet,
                        &ip.src_addr.into(),
                        &ip.dst_addr.into(),
                        &caps,
                    )
                    .unwrap();
                    // Bare acks carry no information these tests need.
                    if tcp.payload.is_empty()
                        && tcp.control == TcpControl::None
                        && tcp.ack_number.is_some()
                    {
                        continue;
                    }
                    return Segment {
                        src: SocketAddrV4::new(ip.src_addr, tcp.src_port),
                        dst: SocketAddrV4::new(ip.dst_addr, tcp.dst_port),
                        control: tcp.control,
                        seq: tcp.seq_number,
                        ack: tcp.ack_number,
                        payload: tcp.payload.to_vec(),
                    };
                }
                _ => {}
            }
        }
    }

    async fn send_tcp(
        &mut self,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        control: TcpControl,
        seq: TcpSeqNumber,
        ack: Option<TcpSeqNumber>,
        payload: &[u8],
    ) {
        let frame = craft::tcp_frame(&craft::TcpSegment {
            src_mac: GUEST_MAC,
            dst_mac: GW_MAC,
            src,
            dst,
            control,
            seq,
            ack,
            window: 65535,
            mss: if control == TcpControl::Syn {
                Some(1460)
            } else {
                None
            },
            payload,
        });
        self.send(&frame).await;
    }
}

/// Spin up a gateway on an in-memory stream and hand back the guest's end.
fn attach(config: Configuration) -> (Arc<Gateway>, Guest) {
    let gateway = Arc::new(Gateway::new(config).unwrap());
    let (host_side, guest_side) = tokio::io::duplex(1 << 20);

    let runner = gateway.clone();
    tokio::spawn(async move {
        let _ = runner.run(Connection::Stream(Box::new(host_side))).await;
    });

    let (reader, writer) =
        framing::split(Connection::Stream(Box::new(guest_side)), Protocol::Qemu).unwrap();
    (gateway, Guest { reader, writer })
}

fn base_config() -> Configuration {
    Configuration::default().with_static_lease("02:32:17:00:00:02", GUEST_IP)
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_dhcp_handshake_and_ping() {
    let (_gateway, mut guest) = attach(base_config());

    let mut chaddr = [0u8; 16];
    chaddr[..6].copy_from_slice(GUEST_MAC.as_bytes());
    for (message_type, expected_reply) in [
        (vgate::dhcp::wire::DHCP_DISCOVER, vgate::dhcp::wire::DHCP_OFFER),
        (vgate::dhcp::wire::DHCP_REQUEST, vgate::dhcp::wire::DHCP_ACK),
    ] {
        let request = vgate::dhcp::wire::Packet {
            op: vgate::dhcp::wire::BOOTREQUEST,
            xid: 0xabcd,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            options: vec![(vgate::dhcp::wire::OPT_MESSAGE_TYPE, vec![message_type])],
        };
        let frame = craft::udp_frame(
            GUEST_MAC,
            smoltcp::wire::EthernetAddress::BROADCAST,
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 68),
            SocketAddrV4::new(Ipv4Addr::BROADCAST, 67),
            &request.emit(),
        );
        guest.send(&frame).await;

        let reply = guest.recv().await;
        let eth = EthernetFrame::new_checked(&reply[..]).unwrap();
        assert_eq!(eth.dst_addr(), GUEST_MAC);
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert_eq!(ip.dst_addr(), GUEST_IP);
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        let packet = vgate::dhcp::wire::Packet::parse(udp.payload()).unwrap();
        assert_eq!(packet.message_type(), Some(expected_reply));
        assert_eq!(packet.yiaddr, GUEST_IP);
    }

    // Gateway answers pings on its own address.
    let caps = ChecksumCapabilities::default();
    let icmp_repr = Icmpv4Repr::EchoRequest {
        ident: 1,
        seq_no: 1,
        data: b"probe",
    };
    let ip_repr = Ipv4Repr {
        src_addr: GUEST_IP,
        dst_addr: GW_IP,
        next_header: IpProtocol::Icmp,
        payload_len: icmp_repr.buffer_len(),
        hop_limit: 64,
    };
    let mut frame = vec![0u8; 14 + 20 + icmp_repr.buffer_len()];
    smoltcp::wire::EthernetRepr {
        src_addr: GUEST_MAC,
        dst_addr: GW_MAC,
        ethertype: EthernetProtocol::Ipv4,
    }
    .emit(&mut EthernetFrame::new_unchecked(&mut frame[..]));
    ip_repr.emit(&mut Ipv4Packet::new_unchecked(&mut frame[14..]), &caps);
    icmp_repr.emit(&mut Icmpv4Packet::new_unchecked(&mut frame[34..]), &caps);
    guest.send(&frame).await;

    let reply = guest.recv().await;
    let eth = EthernetFrame::new_checked(&reply[..]).unwrap();
    let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
    assert_eq!(ip.src_addr(), GW_IP);
    let icmp = Icmpv4Packet::new_checked(ip.payload()).unwrap();
    let Ok(Icmpv4Repr::EchoReply { data, .. }) = Icmpv4Repr::parse(&icmp, &caps) else {
        panic!("expected echo reply");
    };
    assert_eq!(data, b"probe");
}

#[tokio::test]
async fn test_egress_tcp_flow_with_nat() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host_port = listener.local_addr().unwrap().port();

    // The guest talks to a virtual peer; NAT lands it on the host listener.
    let virtual_peer = Ipv4Addr::new(192, 168, 127, 254);
    let config = base_config().with_nat(virtual_peer, Ipv4Addr::new(127, 0, 0, 1));
    let (_gateway, mut guest) = attach(config);

    let server = tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        conn.write_all(b"world").await.unwrap();
        conn
    });

    let guest_ep = SocketAddrV4::new(GUEST_IP, 49000);
    let peer_ep = SocketAddrV4::new(virtual_peer, host_port);
    let isn = TcpSeqNumber(1000);
    guest
        .send_tcp(guest_ep, peer_ep, TcpControl::Syn, isn, None, &[])
        .await;

    let synack = guest.recv_tcp().await;
    assert_eq!(synack.control, TcpControl::Syn);
    assert_eq!(synack.src, peer_ep);
    assert_eq!(synack.dst, guest_ep);
    assert_eq!(synack.ack, Some(isn + 1));
    let server_isn = synack.seq;

    guest
        .send_tcp(
            guest_ep,
            peer_ep,
            TcpControl::Psh,
            isn + 1,
            Some(server_isn + 1),
            b"hello",
        )
        .await;

    let data = guest.recv_tcp().await;
    assert_eq!(data.payload, b"world");
    assert_eq!(data.seq, server_isn + 1);

    let conn = timeout(WAIT, server).await.unwrap().unwrap();
    drop(conn);

    // The host side is done; its close surfaces as a FIN.
    let fin = guest.recv_tcp().await;
    assert_eq!(fin.control, TcpControl::Fin);
}

#[tokio::test]
async fn test_link_local_destination_is_reset() {
    let (_gateway, mut guest) = attach(base_config());

    let guest_ep = SocketAddrV4::new(GUEST_IP, 49001);
    let metadata = SocketAddrV4::new(Ipv4Addr::new(169, 254, 169, 254), 80);
    let isn = TcpSeqNumber(2000);
    guest
        .send_tcp(guest_ep, metadata, TcpControl::Syn, isn, None, &[])
        .await;

    let rst = guest.recv_tcp().await;
    assert_eq!(rst.control, TcpControl::Rst);
    assert_eq!(rst.src, metadata);
    assert_eq!(rst.ack, Some(isn + 1));
}

#[tokio::test]
async fn test_stray_segment_is_reset() {
    let (_gateway, mut guest) = attach(base_config());

    let guest_ep = SocketAddrV4::new(GUEST_IP, 49002);
    let peer = SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 443);
    guest
        .send_tcp(
            guest_ep,
            peer,
            TcpControl::None,
            TcpSeqNumber(5000),
            Some(TcpSeqNumber(6000)),
            b"stale",
        )
        .await;

    let rst = guest.recv_tcp().await;
    assert_eq!(rst.control, TcpControl::Rst);
    assert_eq!(rst.seq, TcpSeqNumber(6000));
}

#[tokio::test]
async fn test_exposed_port_reaches_the_guest() {
    let (gateway, mut guest) = attach(base_config());

    let port = free_port().await;
    let local = format!("127.0.0.1:{port}");
    gateway
        .forwarder()
        .expose(&local, &format!("{GUEST_IP}:8080"))
        .await
        .unwrap();

    let client = tokio::spawn(async move {
        let mut conn = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        conn.write_all(b"ping").await.unwrap();
        conn
    });

    // recv_tcp answers the gateway's ARP probe for the guest address.
    let syn = guest.recv_tcp().await;
    assert_eq!(syn.control, TcpControl::Syn);
    assert_eq!(syn.ack, None);
    assert_eq!(syn.dst, SocketAddrV4::new(GUEST_IP, 8080));
    assert_eq!(*syn.src.ip(), GW_IP);

    let guest_isn = TcpSeqNumber(7000);
    guest
        .send_tcp(
            syn.dst,
            syn.src,
            TcpControl::Syn,
            guest_isn,
            Some(syn.seq + 1),
            &[],
        )
        .await;

    let data = guest.recv_tcp().await;
    assert_eq!(data.payload, b"ping");
    assert_eq!(data.seq, syn.seq + 1);

    let _conn = client.await.unwrap();

    // Removing the exposure frees the port for a fresh listener.
    gateway.forwarder().unexpose(&local);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpListener::bind(("127.0.0.1", port)).await.is_ok());
}

#[tokio::test]
async fn test_control_api_reports_leases_and_forwards() {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    let gateway = Gateway::new(base_config()).unwrap();
    let app = gateway.router();

    let response = app
        .clone()
        .oneshot(Request::get("/leases").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let leases: std::collections::BTreeMap<String, Ipv4Addr> =
        serde_json::from_slice(&body).unwrap();
    assert_eq!(leases.get("02:32:17:00:00:02"), Some(&GUEST_IP));

    let response = app
        .oneshot(
            Request::get("/services/forwarder/all")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
