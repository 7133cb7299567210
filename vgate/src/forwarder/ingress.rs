//! Host-side port exposure
//!
//! Exposing a port binds a host listener first; only a successful bind
//! mutates the table, so a failed expose leaves no partial state. Removing
//! an exposure stops the accept loop but leaves established flows alone.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smoltcp::wire::EthernetAddress;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::error::{Result, VgateError};
use crate::forwarder::tcp;
use crate::notify::{Notification, NotifySender};
use crate::stack::{NetCtx, craft};

/// How often the neighbor table is polled while waiting for an ARP answer.
const ARP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const ARP_ATTEMPTS: u32 = 30;

/// One exposure, as carried over the control API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposeRequest {
    pub local: String,
    pub remote: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnexposeRequest {
    pub local: String,
}

struct Exposure {
    remote: String,
    task: JoinHandle<()>,
}

/// Table of exposed host ports, each backed by an accept loop.
pub struct PortForwarder {
    ctx: Arc<NetCtx>,
    notifier: NotifySender,
    entries: Mutex<HashMap<String, Exposure>>,
}

impl PortForwarder {
    pub(crate) fn new(ctx: Arc<NetCtx>, notifier: NotifySender) -> Self {
        Self {
            ctx,
            notifier,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Bind `local` on the host and forward accepted connections to the
    /// guest endpoint `remote`.
    pub async fn expose(&self, local: &str, remote: &str) -> Result<()> {
        if self.entries.lock().contains_key(local) {
            return Err(VgateError::AlreadyExposed {
                local: local.to_string(),
            });
        }

        let local_addr: SocketAddr = local
            .parse()
            .map_err(|_| VgateError::Config(format!("invalid local address '{local}'")))?;
        let remote_addr: SocketAddrV4 = remote
            .parse()
            .map_err(|_| VgateError::Config(format!("invalid remote address '{remote}'")))?;

        let listener = TcpListener::bind(local_addr).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::AddrInUse {
                VgateError::AlreadyExposed {
                    local: local.to_string(),
                }
            } else {
                VgateError::Io(err)
            }
        })?;

        let task = tokio::spawn(accept_loop(self.ctx.clone(), listener, remote_addr));
        let mut entries = self.entries.lock();
        if entries.contains_key(local) {
            task.abort();
            return Err(VgateError::AlreadyExposed {
                local: local.to_string(),
            });
        }
        entries.insert(
            local.to_string(),
            Exposure {
                remote: remote.to_string(),
                task,
            },
        );
        drop(entries);

        tracing::info!(local, remote, "port exposed");
        self.notifier.send(Notification::PortExposed {
            local: local.to_string(),
            remote: remote.to_string(),
        });
        Ok(())
    }

    /// Remove an exposure. Unknown addresses are a no-op.
    pub fn unexpose(&self, local: &str) {
        let Some(exposure) = self.entries.lock().remove(local) else {
            return;
        };
        exposure.task.abort();
        tracing::info!(local, "port unexposed");
        self.notifier.send(Notification::PortUnexposed {
            local: local.to_string(),
        });
    }

    /// Current exposures, sorted by local address.
    pub fn list(&self) -> Vec<ExposeRequest> {
        let mut all: Vec<ExposeRequest> = self
            .entries
            .lock()
            .iter()
            .map(|(local, exposure)| ExposeRequest {
                local: local.clone(),
                remote: exposure.remote.clone(),
            })
            .collect();
        all.sort_by(|a, b| a.local.cmp(&b.local));
        all
    }
}

impl Drop for PortForwarder {
    fn drop(&mut self) {
        for exposure in self.entries.lock().values() {
            exposure.task.abort();
        }
    }
}

async fn accept_loop(ctx: Arc<NetCtx>, listener: TcpListener, remote: SocketAddrV4) {
    loop {
        match listener.accept().await {
            Ok((conn, peer)) => {
                tracing::debug!(%peer, guest = %remote, "inbound connection accepted");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    match resolve_guest_mac(&ctx, remote).await {
                        Ok(mac) => tcp::spawn_ingress_flow(&ctx, mac, remote, conn),
                        Err(err) => {
                            tracing::warn!(guest = %remote, error = %err, "inbound flow dropped");
                        }
                    }
                });
            }
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Find the guest's MAC, asking over ARP if it is not yet known.
async fn resolve_guest_mac(ctx: &Arc<NetCtx>, guest: SocketAddrV4) -> Result<EthernetAddress> {
    if let Some(mac) = ctx.neighbors.read().get(guest.ip()).copied() {
        return Ok(mac);
    }

    let frames = ctx.frame_sender();
    for _ in 0..ARP_ATTEMPTS {
        let request = craft::arp_request(ctx.gateway_mac, ctx.gateway_ip, *guest.ip());
        let _ = frames.send(request).await;
        tokio::time::sleep(ARP_POLL_INTERVAL).await;
        if let Some(mac) = ctx.neighbors.read().get(guest.ip()).copied() {
            return Ok(mac);
        }
    }
    Err(VgateError::GuestUnreachable(*guest.ip()))
}
