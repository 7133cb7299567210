//! vgate: a user-space network gateway for VM and sandboxed guests.
//!
//! A [`Gateway`] owns a virtual subnet and serves one guest Ethernet link at
//! a time: it assigns addresses over DHCP, answers DNS for configured zones,
//! relays TCP and UDP flows to the host network with optional NAT, and
//! accepts inbound connections on exposed host ports. Guest links arrive
//! over pluggable transports (vsock, Unix sockets, TCP, a child process's
//! stdio) with per-hypervisor frame encapsulation.
//!
//! ```no_run
//! use vgate::{Configuration, Gateway};
//!
//! # async fn serve() -> vgate::Result<()> {
//! let gateway = Gateway::new(Configuration::default())?;
//! let endpoint: vgate::Endpoint = "unix:///tmp/guest.sock".parse()?;
//! let mut listener = endpoint.listen().await?;
//! let conn = listener.accept().await?;
//! gateway.run(conn).await?;
//! # Ok(())
//! # }
//! ```

mod api;
pub mod config;
pub mod constants;
pub mod dhcp;
pub mod dns;
pub mod error;
pub mod forwarder;
pub mod gateway;
pub mod notify;
pub mod pool;
pub mod retry;
pub mod stack;
pub mod transport;
pub mod watcher;

pub use config::{Configuration, Protocol, Record, Zone};
pub use error::{Result, VgateError};
pub use forwarder::{ExposeRequest, PortForwarder, UnexposeRequest};
pub use gateway::Gateway;
pub use notify::{Notification, NotifySender};
pub use transport::{Connection, Endpoint, Listener};
pub use watcher::FileWatcher;
