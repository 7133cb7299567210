//! Outbound frame construction
//!
//! Every frame the gateway emits toward the guest is built here from
//! smoltcp wire representations, with checksums computed on emit.

use std::net::SocketAddrV4;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Packet, Ipv4Repr, TcpControl,
    TcpPacket, TcpRepr, TcpSeqNumber, UdpPacket, UdpRepr,
};

const ETHERNET_HEADER_LEN: usize = 14;
const IPV4_HEADER_LEN: usize = 20;

/// One TCP segment headed for the guest.
#[derive(Debug)]
pub struct TcpSegment<'a> {
    pub src_mac: EthernetAddress,
    pub dst_mac: EthernetAddress,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub control: TcpControl,
    pub seq: TcpSeqNumber,
    pub ack: Option<TcpSeqNumber>,
    pub window: u16,
    /// MSS option, carried on SYN and SYN-ACK only.
    pub mss: Option<u16>,
    pub payload: &'a [u8],
}

pub fn tcp_frame(seg: &TcpSegment<'_>) -> Vec<u8> {
    let caps = ChecksumCapabilities::default();

    let tcp_repr = TcpRepr {
        src_port: seg.src.port(),
        dst_port: seg.dst.port(),
        control: seg.control,
        seq_number: seg.seq,
        ack_number: seg.ack,
        window_len: seg.window,
        window_scale: None,
        max_seg_size: seg.mss,
        sack_permitted: false,
        sack_ranges: [None, None, None],
        timestamp: None,
        payload: seg.payload,
    };
    let tcp_len = tcp_repr.buffer_len();

    let ip_repr = Ipv4Repr {
        src_addr: *seg.src.ip(),
        dst_addr: *seg.dst.ip(),
        next_header: IpProtocol::Tcp,
        payload_len: tcp_len,
        hop_limit: 64,
    };

    let mut frame = vec![0u8; ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + tcp_len];
    emit_ethernet(&mut frame, seg.src_mac, seg.dst_mac, EthernetProtocol::Ipv4);

    let mut ip_packet = Ipv4Packet::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..]);
    ip_repr.emit(&mut ip_packet, &caps);

    let mut tcp_packet =
        TcpPacket::new_unchecked(&mut frame[ETHERNET_HEADER_LEN + IPV4_HEADER_LEN..]);
    tcp_repr.emit(
        &mut tcp_packet,
        &(*seg.src.ip()).into(),
        &(*seg.dst.ip()).into(),
        &caps,
    );

    frame
}

pub fn udp_frame(
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    src: SocketAddrV4,
    dst: SocketAddrV4,
    payload: &[u8],
) -> Vec<u8> {
    let caps = ChecksumCapabilities::default();

    let udp_repr = UdpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
    };
    let udp_len = udp_repr.header_len() + payload.len();

    let ip_repr = Ipv4Repr {
        src_addr: *src.ip(),
        dst_addr: *dst.ip(),
        next_header: IpProtocol::Udp,
        payload_len: udp_len,
        hop_limit: 64,
    };

    let mut frame = vec![0u8; ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + udp_len];
    emit_ethernet(&mut frame, src_mac, dst_mac, EthernetProtocol::Ipv4);

    let mut ip_packet = Ipv4Packet::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..]);
    ip_repr.emit(&mut ip_packet, &caps);

    let mut udp_packet =
        UdpPacket::new_unchecked(&mut frame[ETHERNET_HEADER_LEN + IPV4_HEADER_LEN..]);
    udp_repr.emit(
        &mut udp_packet,
        &(*src.ip()).into(),
        &(*dst.ip()).into(),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &caps,
    );

    frame
}

/// ARP reply claiming `claimed_ip` for `our_mac`.
pub fn arp_reply(
    our_mac: EthernetAddress,
    claimed_ip: std::net::Ipv4Addr,
    requester_mac: EthernetAddress,
    requester_ip: std::net::Ipv4Addr,
) -> Vec<u8> {
    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Reply,
        source_hardware_addr: our_mac,
        source_protocol_addr: claimed_ip,
        target_hardware_addr: requester_mac,
        target_protocol_addr: requester_ip,
    };

    let mut frame = vec![0u8; ETHERNET_HEADER_LEN + arp_repr.buffer_len()];
    emit_ethernet(&mut frame, our_mac, requester_mac, EthernetProtocol::Arp);

    let mut arp_packet = ArpPacket::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..]);
    arp_repr.emit(&mut arp_packet);

    frame
}

/// Broadcast ARP request asking who holds `target_ip`.
pub fn arp_request(
    our_mac: EthernetAddress,
    our_ip: std::net::Ipv4Addr,
    target_ip: std::net::Ipv4Addr,
) -> Vec<u8> {
    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: our_mac,
        source_protocol_addr: our_ip,
        target_hardware_addr: EthernetAddress([0; 6]),
        target_protocol_addr: target_ip,
    };

    let mut frame = vec![0u8; ETHERNET_HEADER_LEN + arp_repr.buffer_len()];
    emit_ethernet(
        &mut frame,
        our_mac,
        EthernetAddress::BROADCAST,
        EthernetProtocol::Arp,
    );

    let mut arp_packet = ArpPacket::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..]);
    arp_repr.emit(&mut arp_packet);

    frame
}

pub fn icmp_echo_reply(
    src_mac: EthernetAddress,
    dst_mac: EthernetAddress,
    src_ip: std::net::Ipv4Addr,
    dst_ip: std::net::Ipv4Addr,
    ident: u16,
    seq_no: u16,
    data: &[u8],
) -> Vec<u8> {
    let caps = ChecksumCapabilities::default();

    let icmp_repr = Icmpv4Repr::EchoReply {
        ident,
        seq_no,
        data,
    };
    let icmp_len = icmp_repr.buffer_len();

    let ip_repr = Ipv4Repr {
        src_addr: src_ip,
        dst_addr: dst_ip,
        next_header: IpProtocol::Icmp,
        payload_len: icmp_len,
        hop_limit: 64,
    };

    let mut frame = vec![0u8; ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + icmp_len];
    emit_ethernet(&mut frame, src_mac, dst_mac, EthernetProtocol::Ipv4);

    let mut ip_packet = Ipv4Packet::new_unchecked(&mut frame[ETHERNET_HEADER_LEN..]);
    ip_repr.emit(&mut ip_packet, &caps);

    let mut icmp_packet =
        Icmpv4Packet::new_unchecked(&mut frame[ETHERNET_HEADER_LEN + IPV4_HEADER_LEN..]);
    icmp_repr.emit(&mut icmp_packet, &caps);

    frame
}

fn emit_ethernet(
    frame: &mut [u8],
    src: EthernetAddress,
    dst: EthernetAddress,
    ethertype: EthernetProtocol,
) {
    let eth_repr = EthernetRepr {
        src_addr: src,
        dst_addr: dst,
        ethertype,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(frame);
    eth_repr.emit(&mut eth_frame);
}
