//! Checksum echo across request sizes chosen to land on window and
//! buffer boundaries.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use pruv::framing::{Framing, FramingFactory};
use pruv_shm::{REQUEST_CHUNK, RESPONSE_CHUNK};
use pruv_tests::adler32;
use pruv_tests::framing::{KeepAliveField, LengthPrefixed};
use pruv_tests::harness::{start, TestServerConfig};

fn factory() -> FramingFactory {
    Arc::new(|| Box::new(LengthPrefixed::new(8, KeepAliveField::U64At(8))) as Box<dyn Framing>)
}

fn sizes() -> Vec<u64> {
    let req = REQUEST_CHUNK as u64;
    let resp = RESPONSE_CHUNK as u64;
    vec![
        0,
        1,
        4096, // page boundary
        req - 16,
        req,
        resp - 16,
        resp,
        10 * resp - 16,
        123,
        10 * resp + 123,
    ]
}

#[tokio::test]
async fn adler32_of_zero_bodies_round_trips() {
    let server = start(TestServerConfig {
        framing: factory(),
        handler: "adler-echo",
        workers: 1,
        timeouts: None,
    })
    .await;

    for n in sizes() {
        let mut sock = TcpStream::connect(server.addr).await.unwrap();
        let body = vec![0u8; n as usize];
        let mut req = Vec::with_capacity(16 + body.len());
        req.extend_from_slice(&n.to_le_bytes());
        req.extend_from_slice(&0u64.to_le_bytes()); // close after response
        req.extend_from_slice(&body);
        sock.write_all(&req).await.unwrap();

        let mut got = Vec::new();
        sock.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, adler32(&body).to_le_bytes(), "body of {n} zeros");
    }

    server.stop().await;
}
