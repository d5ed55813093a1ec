//! TUN device creation and packet I/O
//!
//! The engine consumes the device through the [`PacketRead`] and
//! [`PacketWrite`] traits: one IP datagram per call, no fragmentation.
//! The real implementation wraps a kernel TUN interface; tests supply
//! in-memory implementations.

use crate::config::Config;
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};
use tun::{AbstractDevice, AsyncDevice, Configuration, DeviceReader, DeviceWriter};

/// Device layer errors
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("TUN error: {0}")]
    Tun(#[from] tun::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device configuration error: {0}")]
    Config(String),
}

/// Source of IP datagrams, one per call.
#[async_trait]
pub trait PacketRead: Send {
    async fn read_packet(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// Sink of IP datagrams, one per call.
#[async_trait]
pub trait PacketWrite: Send {
    async fn write_packet(&mut self, packet: &[u8]) -> std::io::Result<()>;
}

/// A configured kernel TUN interface.
pub struct TunDevice {
    device: AsyncDevice,
    name: String,
}

impl TunDevice {
    /// Create the TUN interface described by the configuration and bring
    /// it up.
    ///
    /// The first IPv4 prefix is applied through the driver; remaining
    /// prefixes and all IPv6 prefixes are added with the platform's
    /// address tooling.
    pub fn create(config: &Config) -> Result<Self, DeviceError> {
        let primary = config.ipv4.first().ok_or_else(|| {
            DeviceError::Config("an ipv4 prefix is required to create the device".to_string())
        })?;

        let mut tun_config = Configuration::default();
        tun_config
            .address(primary.addr())
            .netmask(primary.netmask())
            .mtu(config.mtu)
            .up();
        if !config.name.is_empty() {
            tun_config.tun_name(config.name.as_str());
        }

        let device = tun::create_as_async(&tun_config)?;
        let name = device.tun_name()?;
        info!("created TUN device {} (mtu {})", name, config.mtu);

        for prefix in config.ipv4.iter().skip(1) {
            add_address(&name, false, &prefix.to_string())?;
        }
        for prefix in &config.ipv6 {
            add_address(&name, true, &prefix.to_string())?;
        }

        Ok(Self { device, name })
    }

    /// Interface name as assigned by the OS.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Split into read and write halves.
    /// Note: the tun crate returns the halves in (writer, reader) order.
    pub fn split(self) -> Result<(TunReader, TunWriter), DeviceError> {
        let (writer, reader) = self.device.split()?;
        Ok((TunReader { reader }, TunWriter { writer }))
    }
}

/// Assign an additional address to the interface.
#[cfg(target_os = "linux")]
fn add_address(name: &str, v6: bool, prefix: &str) -> Result<(), DeviceError> {
    let mut args = Vec::new();
    if v6 {
        args.push("-6");
    }
    args.extend(["addr", "add", prefix, "dev", name]);

    let output = std::process::Command::new("ip").args(&args).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Idempotent: an address that is already present is fine.
        if stderr.to_lowercase().contains("file exists") {
            warn!("address {} already present on {}", prefix, name);
            return Ok(());
        }
        return Err(DeviceError::Config(format!(
            "failed to add {} to {}: {}",
            prefix,
            name,
            stderr.trim()
        )));
    }

    info!("assigned {} to {}", prefix, name);
    Ok(())
}

#[cfg(target_os = "macos")]
fn add_address(name: &str, v6: bool, prefix: &str) -> Result<(), DeviceError> {
    let family = if v6 { "inet6" } else { "inet" };
    let output = std::process::Command::new("ifconfig")
        .args([name, family, prefix, "alias"])
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DeviceError::Config(format!(
            "failed to add {} to {}: {}",
            prefix,
            name,
            stderr.trim()
        )));
    }

    info!("assigned {} to {}", prefix, name);
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn add_address(name: &str, _v6: bool, prefix: &str) -> Result<(), DeviceError> {
    warn!(
        "cannot assign extra address {} to {} on this platform",
        prefix, name
    );
    Ok(())
}

/// Read half of a split TUN device.
pub struct TunReader {
    reader: DeviceReader,
}

#[async_trait]
impl PacketRead for TunReader {
    async fn read_packet(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf).await
    }
}

/// Write half of a split TUN device.
pub struct TunWriter {
    writer: DeviceWriter,
}

#[async_trait]
impl PacketWrite for TunWriter {
    async fn write_packet(&mut self, packet: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(packet).await
    }
}
