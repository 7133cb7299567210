//! UDP egress translation
//!
//! Each guest (src, dst) pair gets a connected host socket. Replies are
//! rewritten so the guest keeps seeing the address it originally sent to,
//! even when NAT substituted the real destination. Flows expire after a
//! period of silence from the peer.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use smoltcp::wire::EthernetAddress;
use tokio::net::UdpSocket;

use crate::stack::{NetCtx, craft};

/// A flow with no inbound traffic for this long is torn down.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_DATAGRAM: usize = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct UdpFlowKey {
    pub guest: SocketAddrV4,
    pub peer: SocketAddrV4,
}

#[derive(Debug, Clone)]
pub(crate) struct UdpFlowHandle {
    socket: Arc<UdpSocket>,
}

/// Forward one datagram from the guest to the host network.
pub(crate) async fn handle_datagram(
    ctx: &Arc<NetCtx>,
    guest_mac: EthernetAddress,
    src: SocketAddrV4,
    dst: SocketAddrV4,
    payload: &[u8],
) {
    let key = UdpFlowKey {
        guest: src,
        peer: dst,
    };

    let existing = ctx.udp_flows.lock().get(&key).cloned();
    let handle = match existing {
        Some(handle) => handle,
        None => match open_flow(ctx, guest_mac, key).await {
            Some(handle) => handle,
            None => return,
        },
    };

    // A full socket buffer drops the datagram, as UDP allows.
    if let Err(err) = handle.socket.try_send(payload) {
        tracing::trace!(guest = %src, peer = %dst, error = %err, "datagram dropped");
    }
}

async fn open_flow(
    ctx: &Arc<NetCtx>,
    guest_mac: EthernetAddress,
    key: UdpFlowKey,
) -> Option<UdpFlowHandle> {
    let real_ip = ctx.translate(*key.peer.ip());
    let real_dst = SocketAddr::V4(SocketAddrV4::new(real_ip, key.peer.port()));

    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => Arc::new(socket),
        Err(err) => {
            tracing::warn!(peer = %real_dst, error = %err, "udp socket bind failed");
            return None;
        }
    };
    if let Err(err) = socket.connect(real_dst).await {
        tracing::warn!(peer = %real_dst, error = %err, "udp connect failed");
        return None;
    }

    let handle = UdpFlowHandle {
        socket: socket.clone(),
    };
    ctx.udp_flows.lock().insert(key, handle.clone());
    tracing::debug!(guest = %key.guest, peer = %key.peer, dst = %real_dst, "udp flow opened");

    let ctx = ctx.clone();
    tokio::spawn(async move {
        let frames = ctx.frame_sender();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            match tokio::time::timeout(IDLE_TIMEOUT, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    let frame = craft::udp_frame(
                        ctx.gateway_mac,
                        guest_mac,
                        key.peer,
                        key.guest,
                        &buf[..n],
                    );
                    if frames.send(frame).await.is_err() {
                        break;
                    }
                }
                Ok(Err(err)) => {
                    tracing::trace!(guest = %key.guest, error = %err, "udp recv failed");
                    break;
                }
                Err(_) => break, // idle
            }
        }
        ctx.udp_flows.lock().remove(&key);
        tracing::debug!(guest = %key.guest, peer = %key.peer, "udp flow closed");
    });

    Some(handle)
}
