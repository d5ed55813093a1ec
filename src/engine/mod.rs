//! Packet-forwarding engine
//!
//! The engine owns the concurrent pipeline shared by both endpoints:
//!
//! - one device reader framing datagrams into the outbound queue
//! - N workers draining the outbound queue onto randomly picked carriers
//! - one read loop per carrier feeding the inbound queue
//! - one device writer draining the inbound queue
//!
//! The initiator and responder lifecycles in the sibling modules only
//! differ in how carriers are established; everything after
//! [`Engine::attach_carrier`] is identical.

mod initiator;
mod responder;

pub use initiator::Initiator;
pub use responder::Responder;

use crate::device::{PacketRead, PacketWrite};
use crate::tunnel::{
    read_frame, Carrier, CarrierReader, CarrierWriter, ConnectionPool, DispatchQueue,
    FRAME_HEADER_LEN, MAX_PAYLOAD_SIZE,
};
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Length of the endpoint id exchanged after the TLS handshake.
pub const ENDPOINT_ID_LEN: usize = 16;

/// Deadline for a new carrier to present its endpoint id.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Interval between dial-maintainer deficit checks.
pub const MAINTAIN_INTERVAL: Duration = Duration::from_secs(1);

/// Shared state of one tunnel endpoint.
///
/// Lifecycle is one-way: running until [`Engine::shutdown`], which stops
/// the tasks, closes every carrier, joins, and drains the queues.
pub struct Engine {
    id: Uuid,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    pool: ConnectionPool,
    outbound: DispatchQueue,
    inbound: DispatchQueue,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Create an engine with the given endpoint id and queue capacities.
    pub fn new(
        id: Uuid,
        device_to_remote_capacity: usize,
        remote_to_device_capacity: usize,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            running: AtomicBool::new(true),
            shutdown_tx,
            pool: ConnectionPool::new(),
            outbound: DispatchQueue::new("device-to-remote", device_to_remote_capacity),
            inbound: DispatchQueue::new("remote-to-device", remote_to_device_capacity),
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// The shared endpoint id.
    pub fn endpoint_id(&self) -> &Uuid {
        &self.id
    }

    /// True until shutdown begins.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The carrier pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Constant-time comparison of a presented id against the
    /// configured one.
    pub fn id_matches(&self, presented: &[u8; ENDPOINT_ID_LEN]) -> bool {
        self.id.as_bytes().ct_eq(presented).into()
    }

    fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Register a task so shutdown can join it. Finished tasks are
    /// pruned here so the list stays bounded on long-running endpoints.
    pub(crate) fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().expect("engine task list lock poisoned");
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Spawn the device reader: frame each datagram and offer it to the
    /// outbound queue. Exits on device error or shutdown.
    pub fn start_device_reader(self: &Arc<Self>, mut reader: impl PacketRead + 'static) {
        let engine = self.clone();
        let mut shutdown = self.shutdown_signal();
        let handle = tokio::spawn(async move {
            while engine.is_running() {
                let mut buf = BytesMut::zeroed(FRAME_HEADER_LEN + MAX_PAYLOAD_SIZE);
                let size = tokio::select! {
                    _ = shutdown.changed() => break,
                    result = reader.read_packet(&mut buf[FRAME_HEADER_LEN..]) => match result {
                        Ok(size) => size,
                        Err(e) => {
                            debug!("device read failed, stopping reader: {}", e);
                            break;
                        }
                    }
                };
                if size == 0 || size > MAX_PAYLOAD_SIZE {
                    continue;
                }

                buf[..FRAME_HEADER_LEN].copy_from_slice(&(size as u16).to_be_bytes());
                buf.truncate(FRAME_HEADER_LEN + size);
                engine.outbound.offer(buf.freeze());
            }
            debug!("device reader stopped");
        });
        self.track(handle);
    }

    /// Spawn `count` workers draining the outbound queue onto random
    /// carriers. A failed write evicts the carrier; the datagram is
    /// dropped, not requeued.
    pub fn start_workers(self: &Arc<Self>, count: usize) {
        for _ in 0..count {
            let engine = self.clone();
            let mut shutdown = self.shutdown_signal();
            let handle = tokio::spawn(async move {
                while engine.is_running() {
                    let frame = tokio::select! {
                        _ = shutdown.changed() => break,
                        frame = engine.outbound.next() => match frame {
                            Some(frame) => frame,
                            None => break,
                        }
                    };

                    // No carrier available: drop, like a routerless IP host.
                    let Some(carrier) = engine.pool.pick_random() else {
                        continue;
                    };
                    if let Err(e) = carrier.write_frame(&frame).await {
                        warn!("carrier {} write failed, evicting: {}", carrier.id(), e);
                        engine.pool.remove_and_close(carrier.id()).await;
                    }
                }
            });
            self.track(handle);
        }
    }

    /// Spawn the device writer draining the inbound queue. A failed
    /// write drops the datagram and keeps going.
    pub fn start_device_writer(self: &Arc<Self>, mut writer: impl PacketWrite + 'static) {
        let engine = self.clone();
        let mut shutdown = self.shutdown_signal();
        let handle = tokio::spawn(async move {
            while engine.is_running() {
                let packet = tokio::select! {
                    _ = shutdown.changed() => break,
                    packet = engine.inbound.next() => match packet {
                        Some(packet) => packet,
                        None => break,
                    }
                };
                if let Err(e) = writer.write_packet(&packet).await {
                    debug!("device write failed, dropping packet: {}", e);
                }
            }
            debug!("device writer stopped");
        });
        self.track(handle);
    }

    /// Insert an authenticated stream into the pool and start its read
    /// loop. Returns `None` when the engine is already stopping, in
    /// which case the stream is closed and discarded.
    pub fn attach_carrier(
        self: &Arc<Self>,
        reader: CarrierReader,
        writer: CarrierWriter,
    ) -> Option<Arc<Carrier>> {
        if !self.is_running() {
            return None;
        }

        let carrier = self.pool.add(writer);

        // Lost the race against close_all: undo the insert.
        if !self.is_running() {
            let id = carrier.id();
            let engine = self.clone();
            tokio::spawn(async move { engine.pool.remove_and_close(id).await });
            return None;
        }

        let engine = self.clone();
        let read_carrier = carrier.clone();
        let handle = tokio::spawn(async move { engine.run_carrier(reader, read_carrier).await });
        self.track(handle);

        Some(carrier)
    }

    /// Per-carrier read loop: deframe datagrams into the inbound queue
    /// until the stream fails, the peer sends the end-of-stream marker,
    /// or the carrier is closed.
    async fn run_carrier(&self, mut reader: CarrierReader, carrier: Arc<Carrier>) {
        loop {
            let payload = tokio::select! {
                _ = carrier.wait_closed() => break,
                result = read_frame(&mut reader) => match result {
                    Ok(Some(payload)) => payload,
                    Ok(None) => {
                        debug!("carrier {} closed by peer", carrier.id());
                        break;
                    }
                    Err(e) => {
                        debug!("carrier {} read failed: {}", carrier.id(), e);
                        break;
                    }
                }
            };
            self.inbound.offer(payload);
        }
        self.pool.remove_and_close(carrier.id()).await;
    }

    /// Stop the engine: flip `running`, wake every task, close all
    /// carriers, join, then drain the queues. Idempotent.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        self.pool.close_all().await;

        let handles = std::mem::take(
            &mut *self.tasks.lock().expect("engine task list lock poisoned"),
        );
        for handle in handles {
            let _ = handle.await;
        }

        let discarded = self.outbound.drain().await + self.inbound.drain().await;
        if discarded > 0 {
            debug!("discarded {} queued packet(s) during shutdown", discarded);
        }
        info!("engine stopped");
    }
}
