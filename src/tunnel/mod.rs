//! Tunnel layer - carrier framing, pooling, and dispatch
//!
//! Provides:
//! - Frame encoding/decoding
//! - The authenticated-carrier pool
//! - Bounded drop-on-full dispatch queues

mod frame;
mod pool;
mod queue;

pub use frame::{encode_frame, read_frame, FRAME_HEADER_LEN, MAX_PAYLOAD_SIZE};
pub use pool::{Carrier, CarrierReader, CarrierWriter, ConnectionPool};
pub use queue::DispatchQueue;

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Empty frame")]
    EmptyFrame,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
