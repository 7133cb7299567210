//! Traffic forwarding between the virtual link and the host network
//!
//! Egress TCP and UDP flows are dialed on behalf of the guest, with NAT
//! substitution applied to the destination; ingress flows are accepted on
//! exposed host ports and originated toward the guest from the gateway.

pub mod ingress;
pub(crate) mod tcp;
pub(crate) mod udp;

pub use ingress::{ExposeRequest, PortForwarder, UnexposeRequest};
