//! Transport layer - TLS connection establishment
//!
//! Builds the TLS connector/acceptor pair the engine dials and accepts
//! carriers with, and owns the endpoint address handling.

mod tls;

pub use tls::{build_acceptor, build_connector, connect, load_certs, load_private_key};

use std::net::SocketAddr;
use thiserror::Error;

/// Timeout for establishing one carrier (TCP connect, then TLS handshake).
pub const DIAL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Endpoint id mismatch")]
    AuthFailed,

    #[error("Timeout")]
    Timeout,
}

/// Split a `host:port` endpoint, accepting bracketed IPv6 literals.
pub fn split_host_port(endpoint: &str) -> Result<(String, u16), TransportError> {
    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        return Ok((addr.ip().to_string(), addr.port()));
    }

    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| TransportError::InvalidEndpoint(endpoint.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| TransportError::InvalidEndpoint(endpoint.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(TransportError::InvalidEndpoint(endpoint.to_string()));
    }

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_hostname() {
        let (host, port) = split_host_port("vpn.example.com:443").unwrap();
        assert_eq!(host, "vpn.example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_split_ipv4() {
        let (host, port) = split_host_port("192.0.2.10:8443").unwrap();
        assert_eq!(host, "192.0.2.10");
        assert_eq!(port, 8443);
    }

    #[test]
    fn test_split_ipv6() {
        let (host, port) = split_host_port("[2001:db8::1]:443").unwrap();
        assert_eq!(host, "2001:db8::1");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_split_rejects_missing_port() {
        assert!(split_host_port("vpn.example.com").is_err());
        assert!(split_host_port(":443").is_err());
        assert!(split_host_port("host:notaport").is_err());
    }
}
