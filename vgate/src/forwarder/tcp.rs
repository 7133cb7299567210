//! TCP flow proxying between the virtual link and real host sockets
//!
//! Each flow is owned by a single relay task: it performs the host dial,
//! answers the handshake, and is the only emitter of frames (and therefore
//! the only owner of seq/ack state) for that flow. The dispatch loop just
//! classifies inbound segments into [`FlowEvent`]s and hands them over on a
//! bounded channel; a full channel drops the segment and the guest's own
//! retransmission recovers it.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use smoltcp::wire::{EthernetAddress, TcpControl, TcpRepr, TcpSeqNumber};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

use crate::stack::{NetCtx, craft};

/// Per-flow event queue depth.
const EVENT_QUEUE: usize = 256;

/// How long an inbound dial waits for the guest to answer the handshake.
const GUEST_SYN_TIMEOUT: Duration = Duration::from_secs(10);

/// Source ports for gateway-originated (ingress) flows.
const EPHEMERAL_BASE: u16 = 61000;
const EPHEMERAL_RANGE: u16 = 4000;

static NEXT_EPHEMERAL: AtomicU16 = AtomicU16::new(0);

/// A flow is keyed by the guest endpoint and the peer address as the guest
/// sees it (before any NAT substitution).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FlowKey {
    pub guest: SocketAddrV4,
    pub peer: SocketAddrV4,
}

/// Inbound segment, reduced to what the relay task needs.
#[derive(Debug)]
pub(crate) enum FlowEvent {
    SynAck { seq: TcpSeqNumber, ack: TcpSeqNumber },
    Ack,
    Data { seq: TcpSeqNumber, payload: Vec<u8> },
    Fin { seq: TcpSeqNumber, payload: Vec<u8> },
    Rst,
}

#[derive(Debug, Clone)]
pub(crate) struct FlowHandle {
    events: mpsc::Sender<FlowEvent>,
}

/// Route one TCP segment arriving from the guest.
pub(crate) async fn handle_segment(
    ctx: &Arc<NetCtx>,
    guest_mac: EthernetAddress,
    src: SocketAddrV4,
    dst: SocketAddrV4,
    tcp: &TcpRepr<'_>,
) {
    let key = FlowKey {
        guest: src,
        peer: dst,
    };

    let existing = ctx.flows.lock().get(&key).cloned();
    if let Some(handle) = existing {
        let event = match classify(tcp) {
            Some(event) => event,
            None => return,
        };
        if handle.events.try_send(event).is_err() {
            tracing::trace!(guest = %src, peer = %dst, "flow queue full, dropping segment");
        }
        return;
    }

    if tcp.control == TcpControl::Syn && tcp.ack_number.is_none() {
        // Link-local guard wins over NAT: reset, no dial.
        if dst.ip().is_link_local() {
            tracing::debug!(guest = %src, peer = %dst, "link-local destination refused");
            send_rst(ctx, guest_mac, key, TcpSeqNumber(0), Some(tcp.seq_number + 1)).await;
            return;
        }
        spawn_egress_flow(ctx, guest_mac, key, tcp.seq_number);
        return;
    }

    // Segment for a flow we do not know; answer with a reset so the guest
    // does not hang on a stale connection.
    if tcp.control != TcpControl::Rst {
        let (seq, ack) = match tcp.ack_number {
            Some(ack) => (ack, None),
            None => (
                TcpSeqNumber(0),
                Some(tcp.seq_number + tcp.payload.len() + 1),
            ),
        };
        send_rst(ctx, guest_mac, key, seq, ack).await;
    }
}

fn classify(tcp: &TcpRepr<'_>) -> Option<FlowEvent> {
    match tcp.control {
        TcpControl::Rst => Some(FlowEvent::Rst),
        TcpControl::Syn => tcp.ack_number.map(|ack| FlowEvent::SynAck {
            seq: tcp.seq_number,
            ack,
        }),
        TcpControl::Fin => Some(FlowEvent::Fin {
            seq: tcp.seq_number,
            payload: tcp.payload.to_vec(),
        }),
        TcpControl::None | TcpControl::Psh => {
            if tcp.payload.is_empty() {
                tcp.ack_number.map(|_| FlowEvent::Ack)
            } else {
                Some(FlowEvent::Data {
                    seq: tcp.seq_number,
                    payload: tcp.payload.to_vec(),
                })
            }
        }
    }
}

/// Guest-initiated flow: dial the (NAT-substituted) destination on the host,
/// then bridge.
fn spawn_egress_flow(
    ctx: &Arc<NetCtx>,
    guest_mac: EthernetAddress,
    key: FlowKey,
    guest_isn: TcpSeqNumber,
) {
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    ctx.flows
        .lock()
        .insert(key, FlowHandle { events: events_tx });

    let real_ip = ctx.translate(*key.peer.ip());
    let real_dst = SocketAddr::V4(SocketAddrV4::new(real_ip, key.peer.port()));
    let ctx = ctx.clone();

    tokio::spawn(async move {
        let io = FlowIo::new(&ctx, guest_mac, key);
        let our_isn = TcpSeqNumber(rand::random::<i32>());

        let host = match TcpStream::connect(real_dst).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(guest = %key.guest, dst = %real_dst, error = %err, "host dial failed");
                io.send(TcpControl::Rst, TcpSeqNumber(0), Some(guest_isn + 1), &[])
                    .await;
                ctx.flows.lock().remove(&key);
                return;
            }
        };
        tracing::debug!(guest = %key.guest, peer = %key.peer, dst = %real_dst, "flow established");

        io.send(TcpControl::Syn, our_isn, Some(guest_isn + 1), &[])
            .await;
        bridge(io, key, our_isn + 1, guest_isn + 1, events_rx, host).await;
        ctx.flows.lock().remove(&key);
    });
}

/// Gateway-originated flow toward the guest, driven by an accepted host
/// connection on an exposed port.
pub(crate) fn spawn_ingress_flow(
    ctx: &Arc<NetCtx>,
    guest_mac: EthernetAddress,
    guest: SocketAddrV4,
    host: TcpStream,
) {
    let offset = NEXT_EPHEMERAL.fetch_add(1, Ordering::Relaxed) % EPHEMERAL_RANGE;
    let key = FlowKey {
        guest,
        peer: SocketAddrV4::new(ctx.gateway_ip, EPHEMERAL_BASE + offset),
    };

    let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE);
    ctx.flows
        .lock()
        .insert(key, FlowHandle { events: events_tx });
    let ctx = ctx.clone();

    tokio::spawn(async move {
        let io = FlowIo::new(&ctx, guest_mac, key);
        let our_isn = TcpSeqNumber(rand::random::<i32>());
        io.send(TcpControl::Syn, our_isn, None, &[]).await;

        // The guest must answer the handshake before anything is bridged.
        let guest_isn = loop {
            let event = tokio::time::timeout(GUEST_SYN_TIMEOUT, events_rx.recv()).await;
            match event {
                Ok(Some(FlowEvent::SynAck { seq, ack })) if ack == our_isn + 1 => break seq,
                Ok(Some(FlowEvent::Rst)) | Ok(None) => {
                    tracing::debug!(guest = %key.guest, "guest refused inbound flow");
                    ctx.flows.lock().remove(&key);
                    return;
                }
                Err(_) => {
                    tracing::debug!(guest = %key.guest, "guest handshake timed out");
                    io.send(TcpControl::Rst, our_isn + 1, None, &[]).await;
                    ctx.flows.lock().remove(&key);
                    return;
                }
                Ok(Some(_)) => continue,
            }
        };

        io.send(TcpControl::None, our_isn + 1, Some(guest_isn + 1), &[])
            .await;
        bridge(io, key, our_isn + 1, guest_isn + 1, events_rx, host).await;
        ctx.flows.lock().remove(&key);
    });
}

/// Everything needed to emit frames for one flow.
struct FlowIo {
    frames: mpsc::Sender<Vec<u8>>,
    gateway_mac: EthernetAddress,
    guest_mac: EthernetAddress,
    key: FlowKey,
    mss: u16,
}

impl FlowIo {
    fn new(ctx: &Arc<NetCtx>, guest_mac: EthernetAddress, key: FlowKey) -> Self {
        Self {
            frames: ctx.frame_sender(),
            gateway_mac: ctx.gateway_mac,
            guest_mac,
            key,
            mss: ctx.mtu.saturating_sub(40),
        }
    }

    async fn send(
        &self,
        control: TcpControl,
        seq: TcpSeqNumber,
        ack: Option<TcpSeqNumber>,
        payload: &[u8],
    ) {
        let mss = match control {
            TcpControl::Syn => Some(self.mss),
            _ => None,
        };
        let frame = craft::tcp_frame(&craft::TcpSegment {
            src_mac: self.gateway_mac,
            dst_mac: self.guest_mac,
            src: self.key.peer,
            dst: self.key.guest,
            control,
            seq,
            ack,
            window: 65535,
            mss,
            payload,
        });
        // Channel-closed means the link is gone; the relay notices on its
        // own event channel.
        let _ = self.frames.send(frame).await;
    }
}

async fn send_rst(
    ctx: &Arc<NetCtx>,
    guest_mac: EthernetAddress,
    key: FlowKey,
    seq: TcpSeqNumber,
    ack: Option<TcpSeqNumber>,
) {
    FlowIo::new(ctx, guest_mac, key)
        .send(TcpControl::Rst, seq, ack, &[])
        .await;
}

/// Pump bytes both ways until either side closes or resets. Flow-table
/// cleanup stays with the callers.
async fn bridge(
    io: FlowIo,
    key: FlowKey,
    mut snd_nxt: TcpSeqNumber,
    mut rcv_nxt: TcpSeqNumber,
    mut events: mpsc::Receiver<FlowEvent>,
    host: TcpStream,
) {
    let (mut host_read, mut host_write): (OwnedReadHalf, OwnedWriteHalf) = host.into_split();
    let mut buf = vec![0u8; io.mss as usize];
    let mut guest_closed = false;
    let mut host_closed = false;

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    None | Some(FlowEvent::Rst) => break,
                    Some(FlowEvent::Ack) | Some(FlowEvent::SynAck { .. }) => {}
                    Some(FlowEvent::Data { seq, payload }) => {
                        if seq == rcv_nxt && !guest_closed {
                            rcv_nxt = rcv_nxt + payload.len();
                            if host_write.write_all(&payload).await.is_err() {
                                io.send(TcpControl::Rst, snd_nxt, Some(rcv_nxt), &[]).await;
                                break;
                            }
                        }
                        // In-order data is acked; anything else gets a
                        // duplicate ack and the guest retransmits.
                        io.send(TcpControl::None, snd_nxt, Some(rcv_nxt), &[]).await;
                    }
                    Some(FlowEvent::Fin { seq, payload }) => {
                        if seq == rcv_nxt && !guest_closed {
                            if !payload.is_empty() {
                                rcv_nxt = rcv_nxt + payload.len();
                                let _ = host_write.write_all(&payload).await;
                            }
                            rcv_nxt = rcv_nxt + 1;
                            guest_closed = true;
                            let _ = host_write.shutdown().await;
                        }
                        io.send(TcpControl::None, snd_nxt, Some(rcv_nxt), &[]).await;
                        if host_closed {
                            break;
                        }
                    }
                }
            }
            read = host_read.read(&mut buf), if !host_closed => {
                match read {
                    Ok(0) => {
                        host_closed = true;
                        io.send(TcpControl::Fin, snd_nxt, Some(rcv_nxt), &[]).await;
                        snd_nxt = snd_nxt + 1;
                        if guest_closed {
                            break;
                        }
                    }
                    Ok(n) => {
                        io.send(TcpControl::Psh, snd_nxt, Some(rcv_nxt), &buf[..n]).await;
                        snd_nxt = snd_nxt + n;
                    }
                    Err(err) => {
                        tracing::debug!(guest = %key.guest, error = %err, "host read failed");
                        io.send(TcpControl::Rst, snd_nxt, Some(rcv_nxt), &[]).await;
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!(guest = %key.guest, peer = %key.peer, "flow closed");
}
