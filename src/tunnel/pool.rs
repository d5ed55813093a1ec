//! Carrier connections and the pool that holds them
//!
//! A carrier is one authenticated TLS connection between the two
//! endpoints. The pool is a flat sequence behind a coarse RW lock:
//! writers (add/remove) exclude readers (pick/count), multiple pickers
//! may run concurrently, and no critical section performs I/O.

use rand::Rng;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

/// Read half of a carrier stream, owned by its read loop.
pub type CarrierReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a carrier stream, shared by the workers.
pub type CarrierWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One live carrier connection.
///
/// The write half is serialized by a mutex held only across a single
/// framed write, so one datagram's bytes are never interleaved with
/// another's on the wire.
pub struct Carrier {
    id: Uuid,
    writer: Mutex<CarrierWriter>,
    closed: Notify,
}

impl Carrier {
    fn new(writer: CarrierWriter) -> Self {
        Self {
            id: Uuid::new_v4(),
            writer: Mutex::new(writer),
            closed: Notify::new(),
        }
    }

    /// Pool bookkeeping handle for this carrier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Write one framed datagram in full.
    pub async fn write_frame(&self, frame: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await
    }

    /// Wake the read loop and shut the write half down. If a worker is
    /// mid-write the shutdown is skipped; the stream closes when the
    /// last reference to the carrier drops.
    pub async fn close(&self) {
        self.closed.notify_one();
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = writer.shutdown().await;
        }
    }

    /// Resolves once `close` has been called.
    pub async fn wait_closed(&self) {
        self.closed.notified().await;
    }
}

/// Thread-safe set of live carriers with uniform-random pick.
#[derive(Default)]
pub struct ConnectionPool {
    carriers: RwLock<Vec<Arc<Carrier>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a write half into a carrier and insert it.
    pub fn add(&self, writer: CarrierWriter) -> Arc<Carrier> {
        let carrier = Arc::new(Carrier::new(writer));
        self.carriers
            .write()
            .expect("connection pool lock poisoned")
            .push(carrier.clone());
        carrier
    }

    /// Number of live carriers.
    pub fn count(&self) -> usize {
        self.carriers
            .read()
            .expect("connection pool lock poisoned")
            .len()
    }

    /// Pick one carrier uniformly at random, or `None` when empty.
    pub fn pick_random(&self) -> Option<Arc<Carrier>> {
        let carriers = self.carriers.read().expect("connection pool lock poisoned");
        if carriers.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..carriers.len());
        Some(carriers[index].clone())
    }

    /// Remove a carrier by handle. Idempotent: a second remove of the
    /// same handle returns `None`.
    pub fn remove(&self, id: Uuid) -> Option<Arc<Carrier>> {
        let mut carriers = self.carriers.write().expect("connection pool lock poisoned");
        let index = carriers.iter().position(|c| c.id() == id)?;
        Some(carriers.swap_remove(index))
    }

    /// Remove a carrier and close it.
    pub async fn remove_and_close(&self, id: Uuid) {
        if let Some(carrier) = self.remove(id) {
            carrier.close().await;
        }
    }

    /// Empty the pool and close every carrier that was in it.
    pub async fn close_all(&self) {
        let carriers = std::mem::take(
            &mut *self.carriers.write().expect("connection pool lock poisoned"),
        );
        for carrier in carriers {
            carrier.close().await;
        }
    }
}
