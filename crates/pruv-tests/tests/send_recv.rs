//! Round-trips of varying response sizes through a real worker process,
//! non-persistent and persistent.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use pruv::framing::{Framing, FramingFactory};
use pruv_tests::framing::{KeepAliveField, LengthPrefixed};
use pruv_tests::harness::{start, TestServerConfig};

const SIZES: [u64; 8] = [0, 1, 4096, 65536, 131072, 1310720, 123, 1310843];

fn factory() -> FramingFactory {
    Arc::new(|| Box::new(LengthPrefixed::new(16, KeepAliveField::U64At(16))) as Box<dyn Framing>)
}

/// `[u64 16][u64 resp_len][u64 keep_alive]`
fn request(resp_len: u64, keep_alive: u64) -> Vec<u8> {
    let mut req = Vec::with_capacity(24);
    req.extend_from_slice(&16u64.to_le_bytes());
    req.extend_from_slice(&resp_len.to_le_bytes());
    req.extend_from_slice(&keep_alive.to_le_bytes());
    req
}

fn pattern(len: u64) -> Vec<u8> {
    (0..len).map(|i| i as u8).collect()
}

#[tokio::test]
async fn each_connection_gets_its_bytes_then_eof() {
    let server = start(TestServerConfig {
        framing: factory(),
        handler: "byte-pattern",
        workers: 1,
        timeouts: None,
    })
    .await;

    for &len in &SIZES {
        let mut sock = TcpStream::connect(server.addr).await.unwrap();
        sock.write_all(&request(len, 0)).await.unwrap();
        let mut got = Vec::new();
        sock.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, pattern(len), "response length {len}");
    }

    server.stop().await;
}

#[tokio::test]
async fn persistent_connection_answers_in_request_order() {
    let server = start(TestServerConfig {
        framing: factory(),
        handler: "byte-pattern",
        workers: 1,
        timeouts: None,
    })
    .await;

    let mut sock = TcpStream::connect(server.addr).await.unwrap();
    let mut expected = Vec::new();
    for (i, &len) in SIZES.iter().enumerate() {
        let keep_alive = u64::from(i + 1 < SIZES.len());
        sock.write_all(&request(len, keep_alive)).await.unwrap();
        expected.extend_from_slice(&pattern(len));
    }

    // The server closes after the last (non-keep-alive) response.
    let mut got = Vec::new();
    sock.read_to_end(&mut got).await.unwrap();
    assert_eq!(got.len(), expected.len());
    assert_eq!(got, expected);

    server.stop().await;
}
