//! Worker crash recovery and reaper-driven timeouts.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use pruv::framing::{Framing, FramingFactory};
use pruv::Timeouts;
use pruv_tests::framing::{KeepAliveField, LengthPrefixed};
use pruv_tests::harness::{start, TestServerConfig};

fn factory() -> FramingFactory {
    Arc::new(|| Box::new(LengthPrefixed::new(8, KeepAliveField::U64At(8))) as Box<dyn Framing>)
}

fn request(body: &[u8], keep_alive: u64) -> Vec<u8> {
    let mut req = Vec::with_capacity(16 + body.len());
    req.extend_from_slice(&(body.len() as u64).to_le_bytes());
    req.extend_from_slice(&keep_alive.to_le_bytes());
    req.extend_from_slice(body);
    req
}

#[tokio::test]
async fn crashed_worker_closes_its_connection_but_not_the_server() {
    let server = start(TestServerConfig {
        framing: factory(),
        handler: "crash-on-boom",
        workers: 1,
        timeouts: None,
    })
    .await;

    // The handler exits mid-request: no response, connection closed.
    let mut sock = TcpStream::connect(server.addr).await.unwrap();
    sock.write_all(&request(b"boom", 0)).await.unwrap();
    let mut got = Vec::new();
    sock.read_to_end(&mut got).await.unwrap();
    assert!(got.is_empty());

    // A replacement worker is spawned on demand for the next request.
    let mut sock = TcpStream::connect(server.addr).await.unwrap();
    sock.write_all(&request(b"ping", 0)).await.unwrap();
    let mut got = Vec::new();
    sock.read_to_end(&mut got).await.unwrap();
    assert_eq!(got, b"ok");

    server.stop().await;
}

#[tokio::test]
async fn idle_connection_is_closed_by_the_reaper() {
    let server = start(TestServerConfig {
        framing: factory(),
        handler: "adler-echo",
        workers: 1,
        timeouts: Some(Timeouts {
            idle: Duration::from_secs(1),
            io: Duration::from_secs(1),
            processing: Duration::from_secs(5),
            kill: Duration::from_secs(2),
            tick: Duration::from_millis(200),
        }),
    })
    .await;

    let started = std::time::Instant::now();
    let mut sock = TcpStream::connect(server.addr).await.unwrap();
    // Send nothing; the server must close the connection on its own.
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), sock.read(&mut buf))
        .await
        .expect("server should have closed the idle connection")
        .unwrap();
    assert_eq!(n, 0);
    assert!(started.elapsed() >= Duration::from_secs(1));

    server.stop().await;
}
