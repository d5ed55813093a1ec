//! Bounded dispatch queues between the device and network sides
//!
//! Producers never block: when a queue is full the packet is dropped
//! with a warning, mirroring IP loss semantics. Replacing this with an
//! unbounded queue or a blocking send would let overload build backlog
//! and can deadlock shutdown.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Bounded FIFO of owned packet buffers.
///
/// Cloning shares the underlying channel; the receive side is behind a
/// mutex so a pool of consumers can share it. The mutex is held only
/// across the `recv` await, never across packet I/O.
#[derive(Clone)]
pub struct DispatchQueue {
    label: &'static str,
    tx: mpsc::Sender<Bytes>,
    rx: Arc<Mutex<mpsc::Receiver<Bytes>>>,
}

impl DispatchQueue {
    pub fn new(label: &'static str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            label,
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Non-blocking offer. Returns false when the packet was dropped.
    pub fn offer(&self, packet: Bytes) -> bool {
        match self.tx.try_send(packet) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "{} queue full, dropping packet; consider raising the buffer size",
                    self.label
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Receive the next packet, waiting until one is available.
    pub async fn next(&self) -> Option<Bytes> {
        self.rx.lock().await.recv().await
    }

    /// Discard everything currently queued. Returns the discard count.
    pub async fn drain(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut discarded = 0;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}
