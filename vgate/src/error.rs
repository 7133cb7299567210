//! Error types for the gateway.
//!
//! Errors are grouped by where they surface:
//! - endpoint/transport errors are returned before or during connection setup,
//! - pool/forwarder errors are returned synchronously from the control plane,
//! - per-flow errors tear down a single flow and are logged, never propagated
//!   past the flow's own task.

use std::io;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VgateError>;

/// Errors produced by gateway components.
#[derive(Debug, Error)]
pub enum VgateError {
    /// Endpoint URL carried a scheme the transport layer does not know.
    #[error("unexpected scheme '{0}'")]
    UnexpectedScheme(String),

    /// Endpoint URL was syntactically valid but semantically unusable.
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// The peer answered the tunnel handshake with something other than `OK`.
    #[error("tunnel handshake failed: {0}")]
    TunnelHandshake(String),

    /// A datagram peer did not open with the expected magic bytes.
    #[error("datagram handshake failed: {0}")]
    DatagramHandshake(String),

    /// Every assignable host address in the subnet is leased.
    #[error("no free IP address left in {subnet}")]
    PoolExhausted { subnet: String },

    /// An address was reserved for, or leased to, another client already.
    #[error("address {ip} already leased")]
    AddressInUse { ip: std::net::Ipv4Addr },

    /// A port exposure already exists for this local endpoint.
    #[error("proxy already running on {local}")]
    AlreadyExposed { local: String },

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A retried operation ran out of attempts.
    #[error("operation failed after {attempts} attempts: {source}")]
    RetryTimeout {
        attempts: u32,
        #[source]
        source: Box<VgateError>,
    },

    /// The surrounding cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The guest is not reachable on the virtual link.
    #[error("guest {0} is not reachable")]
    GuestUnreachable(std::net::Ipv4Addr),

    /// Generic IO error (catch-all).
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VgateError::UnexpectedScheme("ftp".into());
        assert_eq!(err.to_string(), "unexpected scheme 'ftp'");

        let err = VgateError::AlreadyExposed {
            local: "127.0.0.1:8080".into(),
        };
        assert_eq!(err.to_string(), "proxy already running on 127.0.0.1:8080");
    }

    #[test]
    fn test_retry_timeout_wraps_source() {
        let inner = VgateError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        let err = VgateError::RetryTimeout {
            attempts: 60,
            source: Box::new(inner),
        };
        assert!(err.to_string().contains("after 60 attempts"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
