//! End-to-end tunnel scenarios
//!
//! Drives full initiator/responder pairs over loopback TLS carriers,
//! with in-memory packet devices standing in for the kernel TUN:
//! - single-carrier ordering
//! - fan-out delivery across a carrier pool
//! - endpoint id rejection
//! - overload behavior with no carriers
//! - carrier replacement after an eviction
//! - graceful shutdown under load

use async_trait::async_trait;
use braid::config::{CertificateConfig, Config, Mode};
use braid::device::{PacketRead, PacketWrite};
use braid::{Initiator, Responder};
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Read side of an in-memory packet device.
struct MemReader {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl PacketRead for MemReader {
    async fn read_packet(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.rx.recv().await {
            Some(packet) => {
                buf[..packet.len()].copy_from_slice(&packet);
                Ok(packet.len())
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "device closed",
            )),
        }
    }
}

/// Write side of an in-memory packet device.
struct MemWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

#[async_trait]
impl PacketWrite for MemWriter {
    async fn write_packet(&mut self, packet: &[u8]) -> std::io::Result<()> {
        self.tx
            .send(packet.to_vec())
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "device closed"))
    }
}

/// An in-memory stand-in for a TUN device. Packets sent on the returned
/// sender are "read" from the device; packets the engine writes come out
/// of the returned receiver.
fn memory_device(
    capacity: usize,
) -> (
    mpsc::Sender<Vec<u8>>,
    MemReader,
    MemWriter,
    mpsc::Receiver<Vec<u8>>,
) {
    let (inject_tx, inject_rx) = mpsc::channel(capacity);
    let (deliver_tx, deliver_rx) = mpsc::channel(capacity);
    (
        inject_tx,
        MemReader { rx: inject_rx },
        MemWriter { tx: deliver_tx },
        deliver_rx,
    )
}

/// Write a fresh self-signed certificate pair under the temp dir.
fn write_self_signed_cert(tag: &str) -> (PathBuf, PathBuf) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = std::env::temp_dir().join(format!("braid-test-{}-{}", std::process::id(), tag));
    std::fs::create_dir_all(&dir).unwrap();
    let crt = dir.join("tunnel.crt");
    let key = dir.join("tunnel.key");
    std::fs::write(&crt, cert.serialize_pem().unwrap()).unwrap();
    std::fs::write(&key, cert.serialize_private_key_pem()).unwrap();
    (crt, key)
}

fn responder_config(id: Uuid, tag: &str) -> Config {
    let (crt, key) = write_self_signed_cert(tag);
    Config {
        id,
        mode: Mode::Responder,
        name: String::new(),
        mtu: 1400,
        ipv4: vec!["10.99.0.1/24".parse().unwrap()],
        ipv6: Vec::new(),
        threads: 2,
        endpoint: None,
        insecure: false,
        ca_bundle: None,
        connection_count: 4,
        listen_addr: Some("127.0.0.1".parse().unwrap()),
        listen_port: Some(0),
        certificate: Some(CertificateConfig { crt, key }),
        device_to_remote_buffer_size: 4096,
        remote_to_device_buffer_size: 4096,
    }
}

fn initiator_config(id: Uuid, endpoint: String, connection_count: usize, threads: usize) -> Config {
    Config {
        id,
        mode: Mode::Initiator,
        name: String::new(),
        mtu: 1400,
        ipv4: vec!["10.99.0.2/24".parse().unwrap()],
        ipv6: Vec::new(),
        threads,
        endpoint: Some(endpoint),
        insecure: true,
        ca_bundle: None,
        connection_count,
        listen_addr: None,
        listen_port: None,
        certificate: None,
        device_to_remote_buffer_size: 4096,
        remote_to_device_buffer_size: 4096,
    }
}

/// Poll a condition until it holds or the deadline passes.
async fn wait_until<F: Fn() -> bool>(deadline: Duration, condition: F) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test]
async fn test_single_carrier_preserves_order() {
    let id = Uuid::new_v4();
    // One worker per side so the single carrier stays strictly ordered.
    let mut config = responder_config(id, "single");
    config.threads = 1;
    let (r_inject, r_reader, r_writer, mut r_deliver) = memory_device(4096);
    let responder = Responder::start_with_device(&config, r_reader, r_writer)
        .await
        .unwrap();

    let endpoint = format!("127.0.0.1:{}", responder.local_addr().port());
    let (i_inject, i_reader, i_writer, mut i_deliver) = memory_device(4096);
    let initiator =
        Initiator::start_with_device(&initiator_config(id, endpoint, 1, 1), i_reader, i_writer)
            .await
            .unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || initiator.carrier_count() == 1
            && responder.carrier_count() == 1)
            .await,
        "carrier never came up"
    );

    let mut rng = rand::thread_rng();
    let mut sent = Vec::with_capacity(1000);
    for _ in 0..1000 {
        let size = rng.gen_range(1..=1400);
        let mut packet = vec![0u8; size];
        rng.fill(&mut packet[..]);
        i_inject.send(packet.clone()).await.unwrap();
        sent.push(packet);
    }

    // One carrier is one ordered byte stream: everything arrives at the
    // peer device intact and in order.
    for expected in &sent {
        let got = tokio::time::timeout(Duration::from_secs(5), r_deliver.recv())
            .await
            .expect("delivery timed out")
            .unwrap();
        assert_eq!(&got, expected);
    }

    // Loop the same datagrams back the other way.
    for packet in &sent {
        r_inject.send(packet.clone()).await.unwrap();
    }
    for expected in &sent {
        let got = tokio::time::timeout(Duration::from_secs(5), i_deliver.recv())
            .await
            .expect("return delivery timed out")
            .unwrap();
        assert_eq!(&got, expected);
    }

    initiator.shutdown().await;
    responder.shutdown().await;
}

#[tokio::test]
async fn test_fan_out_delivers_every_datagram() {
    const COUNT: u32 = 10_000;

    let id = Uuid::new_v4();
    let mut config = responder_config(id, "fanout");
    config.device_to_remote_buffer_size = 16384;
    config.remote_to_device_buffer_size = 16384;
    let (_r_inject, r_reader, r_writer, mut r_deliver) = memory_device(16384);
    let responder = Responder::start_with_device(&config, r_reader, r_writer)
        .await
        .unwrap();

    let endpoint = format!("127.0.0.1:{}", responder.local_addr().port());
    let mut config = initiator_config(id, endpoint, 8, 4);
    config.device_to_remote_buffer_size = 16384;
    config.remote_to_device_buffer_size = 16384;
    let (i_inject, i_reader, i_writer, _i_deliver) = memory_device(16384);
    let initiator = Initiator::start_with_device(&config, i_reader, i_writer)
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || initiator.carrier_count() == 8).await,
        "pool never reached its target"
    );

    for i in 0..COUNT {
        i_inject.send(i.to_be_bytes().to_vec()).await.unwrap();
    }

    // Datagrams shard across carriers, so ordering is gone, but the
    // received multiset must equal the sent one.
    let mut received = Vec::with_capacity(COUNT as usize);
    for _ in 0..COUNT {
        let got = tokio::time::timeout(Duration::from_secs(10), r_deliver.recv())
            .await
            .expect("delivery timed out")
            .unwrap();
        received.push(u32::from_be_bytes(got.as_slice().try_into().unwrap()));
    }
    received.sort_unstable();
    assert_eq!(received, (0..COUNT).collect::<Vec<_>>());

    initiator.shutdown().await;
    responder.shutdown().await;
}

#[tokio::test]
async fn test_wrong_endpoint_id_is_rejected() {
    let id = Uuid::new_v4();
    let (_inject, reader, writer, _deliver) = memory_device(64);
    let responder = Responder::start_with_device(&responder_config(id, "auth"), reader, writer)
        .await
        .unwrap();
    let endpoint = format!("127.0.0.1:{}", responder.local_addr().port());

    let connector = braid::transport::build_connector(true, None).unwrap();
    let mut stream = braid::transport::connect(&connector, &endpoint).await.unwrap();
    stream
        .write_all(Uuid::new_v4().as_bytes())
        .await
        .unwrap();
    stream.flush().await.unwrap();

    // The responder closes without admitting the carrier.
    let mut buf = [0u8; 1];
    match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        Ok(Ok(n)) => panic!("responder sent {} unexpected byte(s)", n),
        Err(_) => panic!("responder did not close the connection"),
    }
    assert_eq!(responder.carrier_count(), 0);

    responder.shutdown().await;
}

#[tokio::test]
async fn test_overload_without_carriers_keeps_engine_alive() {
    // A port with nothing listening: every dial fails fast.
    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = format!("127.0.0.1:{}", unused.local_addr().unwrap().port());
    drop(unused);

    let mut config = initiator_config(Uuid::new_v4(), endpoint, 1, 1);
    config.device_to_remote_buffer_size = 4;
    let (inject, reader, writer, mut deliver) = memory_device(256);
    let initiator = Initiator::start_with_device(&config, reader, writer)
        .await
        .unwrap();

    for i in 0..100u8 {
        inject.send(vec![i]).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Everything is dropped (tiny queue, empty pool), nothing is
    // delivered anywhere, and the engine keeps running.
    assert!(initiator.is_running());
    assert_eq!(initiator.carrier_count(), 0);
    assert!(deliver.try_recv().is_err());

    tokio::time::timeout(Duration::from_secs(2), initiator.shutdown())
        .await
        .expect("shutdown did not complete");
    assert!(!initiator.is_running());
}

#[tokio::test]
async fn test_evicted_carrier_is_replaced() {
    let id = Uuid::new_v4();
    let (_r_inject, r_reader, r_writer, _r_deliver) = memory_device(256);
    let responder = Responder::start_with_device(&responder_config(id, "replace"), r_reader, r_writer)
        .await
        .unwrap();

    let endpoint = format!("127.0.0.1:{}", responder.local_addr().port());
    let (_i_inject, i_reader, i_writer, _i_deliver) = memory_device(256);
    let initiator =
        Initiator::start_with_device(&initiator_config(id, endpoint, 3, 2), i_reader, i_writer)
            .await
            .unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || initiator.carrier_count() == 3).await,
        "pool never reached its target"
    );

    // Kill one carrier from the responder side, as a middlebox would.
    let victim = responder.engine().pool().pick_random().unwrap();
    responder.engine().pool().remove_and_close(victim.id()).await;

    assert!(
        wait_until(Duration::from_secs(2), || initiator.carrier_count() < 3).await,
        "initiator never noticed the dead carrier"
    );
    assert!(
        wait_until(Duration::from_secs(3), || initiator.carrier_count() == 3).await,
        "dead carrier was not replaced"
    );

    initiator.shutdown().await;
    responder.shutdown().await;
}

#[tokio::test]
async fn test_graceful_shutdown_under_load() {
    let id = Uuid::new_v4();
    let (_r_inject, r_reader, r_writer, _r_deliver) = memory_device(4096);
    let responder = Responder::start_with_device(&responder_config(id, "shutdown"), r_reader, r_writer)
        .await
        .unwrap();

    let endpoint = format!("127.0.0.1:{}", responder.local_addr().port());
    let (i_inject, i_reader, i_writer, _i_deliver) = memory_device(4096);
    let initiator =
        Initiator::start_with_device(&initiator_config(id, endpoint, 4, 2), i_reader, i_writer)
            .await
            .unwrap();

    assert!(wait_until(Duration::from_secs(5), || initiator.carrier_count() == 4).await);

    // Keep traffic flowing until the engine's device reader goes away.
    let feeder = tokio::spawn(async move {
        let mut n: u32 = 0;
        loop {
            if i_inject.send(n.to_be_bytes().to_vec()).await.is_err() {
                break;
            }
            n = n.wrapping_add(1);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    tokio::time::timeout(Duration::from_secs(2), async {
        initiator.shutdown().await;
        responder.shutdown().await;
    })
    .await
    .expect("shutdown did not complete under load");

    assert!(!initiator.is_running());
    assert!(!responder.is_running());
    feeder.await.unwrap();
}
