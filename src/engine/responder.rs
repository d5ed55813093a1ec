//! Responder lifecycle
//!
//! The responder accepts TLS connections and admits the ones that
//! present the shared endpoint id within the auth deadline. It never
//! dials; a dead carrier simply disappears from the pool and the
//! initiator replaces it.

use super::{Engine, AUTH_TIMEOUT, ENDPOINT_ID_LEN};
use crate::config::{Config, ConfigError};
use crate::device::{PacketRead, PacketWrite, TunDevice};
use crate::transport::{self, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// The listening endpoint of the tunnel.
pub struct Responder {
    engine: Arc<Engine>,
    local_addr: SocketAddr,
}

impl Responder {
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
        let certificate = config.certificate.as_ref().ok_or_else(|| {
            ConfigError::Invalid("responder requires certificate paths".to_string())
        })?;
        let acceptor = transport::build_acceptor(&certificate.crt, &certificate.key)?;

        let listen_addr = config
            .listen_addr
            .ok_or_else(|| ConfigError::Invalid("responder requires listen-addr".to_string()))?;
        let listen_port = config
            .listen_port
            .ok_or_else(|| ConfigError::Invalid("responder requires listen-port".to_string()))?;
        let listener = TcpListener::bind(SocketAddr::new(listen_addr, listen_port)).await?;
        let local_addr = listener.local_addr()?;

        let engine = Engine::new(
            config.id,
            config.device_to_remote_buffer_size,
            config.remote_to_device_buffer_size,
        );
        engine.start_device_reader(reader);
        engine.start_workers(config.threads);
        engine.start_device_writer(writer);
        spawn_acceptor(&engine, listener, acceptor);

        info!(
            "responder started: listening on {}, {} worker(s)",
            local_addr, config.threads
        );
        Ok(Self { engine, local_addr })
    }

    /// The underlying engine.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live carriers.
    pub fn carrier_count(&self) -> usize {
        self.engine.pool().count()
    }

    /// True until shutdown begins.
    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    /// Close the listener, close every carrier, and join all tasks.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }
}

/// Spawn the accept loop. The listener is dropped (and the socket
/// closed) when the loop exits.
fn spawn_acceptor(engine: &Arc<Engine>, listener: TcpListener, acceptor: TlsAcceptor) {
    let accepting = engine.clone();
    let mut shutdown = engine.shutdown_signal();
    let handle = tokio::spawn(async move {
        loop {
            let (tcp, peer) = tokio::select! {
                _ = shutdown.changed() => break,
                result = listener.accept() => match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                }
            };
            tcp.set_nodelay(true).ok();

            let engine = accepting.clone();
            let acceptor = acceptor.clone();
            let handler = tokio::spawn(async move {
                if let Err(e) = handle_carrier(&engine, acceptor, tcp).await {
                    debug!("connection from {} rejected: {}", peer, e);
                }
            });
            accepting.track(handler);
        }
        debug!("accept loop stopped");
    });
    engine.track(handle);
}

/// Admit one connection: finish the TLS handshake, read the 16-byte
/// endpoint id within the auth deadline, and compare it in constant
/// time. Anything else closes the stream.
async fn handle_carrier(
    engine: &Arc<Engine>,
    acceptor: TlsAcceptor,
    tcp: TcpStream,
) -> Result<(), TransportError> {
    let (stream, presented) = tokio::time::timeout(AUTH_TIMEOUT, async {
        let mut stream = acceptor.accept(tcp).await?;
        let mut presented = [0u8; ENDPOINT_ID_LEN];
        stream.read_exact(&mut presented).await?;
        Ok::<_, std::io::Error>((stream, presented))
    })
    .await
    .map_err(|_| TransportError::Timeout)??;

    if !engine.id_matches(&presented) {
        return Err(TransportError::AuthFailed);
    }

    let (reader, writer) = tokio::io::split(stream);
    if let Some(carrier) = engine.attach_carrier(Box::new(reader), Box::new(writer)) {
        debug!("carrier {} authenticated", carrier.id());
    }
    Ok(())
}
