//! Initiator lifecycle
//!
//! The initiator owns a dial maintainer: every second it compares the
//! pool size against the configured target and dials the deficit in
//! parallel. Failed or evicted carriers are replaced on the next tick;
//! there is no other reconnect path.

use super::{Engine, MAINTAIN_INTERVAL};
use crate::config::{Config, ConfigError};
use crate::device::{PacketRead, PacketWrite, TunDevice};
use crate::transport::{self, TransportError};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// The dialing endpoint of the tunnel.
pub struct Initiator {
    engine: Arc<Engine>,
}

impl Initiator {
    /// Create the TUN device from the configuration and start the
    /// engine on it.
    pub async fn start(config: &Config) -> crate::Result<Self> {
        config.validate()?;
        let device = TunDevice::create(config)?;
        let (reader, writer) = device.split()?;
        Self::start_with_device(config, reader, writer).await
    }

    /// Start the engine on an externally supplied packet device.
    pub async fn start_with_device(
        config: &Config,
        reader: impl PacketRead + 'static,
        writer: impl PacketWrite + 'static,
    ) -> crate::Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| ConfigError::Invalid("initiator requires an endpoint".to_string()))?;
        let connector = transport::build_connector(config.insecure, config.ca_bundle.as_deref())?;

        let engine = Engine::new(
            config.id,
            config.device_to_remote_buffer_size,
            config.remote_to_device_buffer_size,
        );
        engine.start_device_reader(reader);
        engine.start_workers(config.threads);
        engine.start_device_writer(writer);

        info!(
            "initiator started: {} carrier(s) to {}, {} worker(s)",
            config.connection_count, endpoint, config.threads
        );
        spawn_maintainer(&engine, connector, endpoint, config.connection_count);
        Ok(Self { engine })
    }

    /// The underlying engine.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Number of live carriers.
    pub fn carrier_count(&self) -> usize {
        self.engine.pool().count()
    }

    /// True until shutdown begins.
    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    /// Stop dialing, close every carrier, and join all tasks.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }
}

/// Spawn the dial maintainer task.
fn spawn_maintainer(
    engine: &Arc<Engine>,
    connector: TlsConnector,
    endpoint: String,
    target: usize,
) {
    let maintainer = engine.clone();
    let mut shutdown = engine.shutdown_signal();
    let handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(MAINTAIN_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while maintainer.is_running() {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {}
            }

            let deficit = target.saturating_sub(maintainer.pool().count());
            for _ in 0..deficit {
                let engine = maintainer.clone();
                let connector = connector.clone();
                let endpoint = endpoint.clone();
                let dial = tokio::spawn(async move {
                    if let Err(e) = dial_carrier(&engine, &connector, &endpoint).await {
                        debug!("dial {} failed: {}", endpoint, e);
                    }
                });
                maintainer.track(dial);
            }
        }
        debug!("dial maintainer stopped");
    });
    engine.track(handle);
}

/// Establish one carrier: TLS dial, present the endpoint id, insert into
/// the pool. Any failure before insertion just closes the stream.
async fn dial_carrier(
    engine: &Arc<Engine>,
    connector: &TlsConnector,
    endpoint: &str,
) -> Result<(), TransportError> {
    let mut stream = transport::connect(connector, endpoint).await?;
    stream.write_all(engine.endpoint_id().as_bytes()).await?;
    stream.flush().await?;

    let (reader, writer) = tokio::io::split(stream);
    if let Some(carrier) = engine.attach_carrier(Box::new(reader), Box::new(writer)) {
        debug!("carrier {} established to {}", carrier.id(), endpoint);
    }
    Ok(())
}
