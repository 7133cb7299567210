//! Operational event notifications
//!
//! Events are delivered as one JSON line per fresh Unix-socket connection.
//! Delivery is best-effort and at-most-once by contract: the queue is
//! bounded and a full queue drops the event with a warning rather than
//! blocking the data path.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::constants::NOTIFY_QUEUE_CAPACITY;
use crate::error::Result;

/// Operational events emitted by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    /// The virtual stack is attached to a guest link and serving.
    NetworkReady { gateway: Ipv4Addr },
    /// A DHCP lease was acknowledged.
    LeaseAssigned { mac: String, ip: Ipv4Addr },
    /// A port exposure was added.
    PortExposed { local: String, remote: String },
    /// A port exposure was removed.
    PortUnexposed { local: String },
}

/// Non-blocking event sender.
///
/// Cloneable; all clones feed the same worker. Without a socket path the
/// sender is a silent no-op.
#[derive(Debug, Clone)]
pub struct NotifySender {
    tx: Option<mpsc::Sender<Notification>>,
}

impl NotifySender {
    /// A sender that discards every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Start a delivery worker writing to the Unix socket at `path`.
    pub fn new(path: PathBuf, token: CancellationToken) -> Self {
        Self::with_capacity(path, NOTIFY_QUEUE_CAPACITY, token)
    }

    fn with_capacity(path: PathBuf, capacity: usize, token: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::channel(capacity);

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if let Err(err) = deliver(&path, &event).await {
                    tracing::warn!(path = %path.display(), error = %err, "notification delivery failed");
                }
            }
            tracing::debug!("notification worker stopped");
        });

        Self { tx: Some(tx) }
    }

    /// Queue an event. Never blocks; a full queue drops the event.
    pub fn send(&self, event: Notification) {
        let Some(tx) = &self.tx else { return };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(?event, "notification queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

async fn deliver(path: &PathBuf, event: &Notification) -> Result<()> {
    let mut stream = UnixStream::connect(path).await?;
    let mut line = serde_json::to_vec(event)?;
    line.push(b'\n');
    stream.write_all(&line).await?;
    stream.shutdown().await?;
    Ok(())
}
