//! # Braid
//!
//! A layer-3 VPN that braids IP traffic across a pool of mutually
//! authenticated TLS connections.
//!
//! ## Features
//!
//! - **Carrier pooling**: datagrams are spread uniformly over N parallel
//!   TLS connections, so a single slow TCP flow never stalls the tunnel
//! - **Best-effort forwarding**: bounded queues drop on overload, matching
//!   IP loss semantics instead of building unbounded backlog
//! - **Shared-token authentication**: a 16-byte endpoint id verified in
//!   constant time on top of the TLS handshake
//! - **Symmetric engine**: initiator and responder differ only in how
//!   carriers are established
//!
//! ## Architecture
//!
//! ```text
//! ┌──────┐ read ┌───────┐   ┌────────────────┐ workers ┌──────────────┐
//! │ TUN  ├─────►│ frame ├──►│ outbound queue ├────────►│ carrier pool │
//! │device│      └───────┘   └────────────────┘  pick   │  (TLS x N)   │
//! │      │◄─────┐                                rand   └──────┬───────┘
//! └──────┘ write│           ┌────────────────┐ deframe        │
//!               └───────────┤ inbound queue  │◄────────────────┘
//!                           └────────────────┘  per-carrier read loop
//! ```

pub mod config;
pub mod device;
pub mod engine;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use engine::{Engine, Initiator, Responder};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Device error: {0}")]
    Device(#[from] device::DeviceError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),
}
