//! Seven back-to-back requests transmitted with arbitrary chunk
//! boundaries and small delays, answered in order. Runs once through a
//! worker process and once through the dispatcher's in-process response
//! path.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use pruv::framing::{Framing, FramingFactory};
use pruv_shm::REQUEST_CHUNK;
use pruv_tests::framing::{KeepAliveField, LengthPrefixed, XorCascadeInplace};
use pruv_tests::harness::{start, TestServerConfig};
use pruv_tests::xor_cascade_response;

/// Total request sizes: 8-byte length field + flag byte + body.
fn request_sizes() -> Vec<u64> {
    let chunk = REQUEST_CHUNK as u64;
    vec![9, 10, chunk - 1, chunk, chunk + 1, chunk + 9, 10 * chunk]
}

fn build_streams() -> (Vec<u8>, Vec<u8>) {
    let sizes = request_sizes();
    let mut requests = Vec::new();
    let mut responses = Vec::new();
    for (i, &size) in sizes.iter().enumerate() {
        let body_len = size - 9;
        let keep_alive = u8::from(i + 1 < sizes.len());
        let body: Vec<u8> = (0..body_len).map(|j| (j * 31 + 7 * i as u64) as u8).collect();
        requests.extend_from_slice(&body_len.to_le_bytes());
        requests.push(keep_alive);
        requests.extend_from_slice(&body);
        responses.extend_from_slice(&xor_cascade_response(&body, keep_alive));
    }
    (requests, responses)
}

async fn run_pipeline(framing: FramingFactory, handler: &'static str) {
    let server = start(TestServerConfig {
        framing,
        handler,
        workers: 1,
        timeouts: None,
    })
    .await;

    let (requests, expected) = build_streams();
    let sock = TcpStream::connect(server.addr).await.unwrap();
    let (mut rd, mut wr) = sock.into_split();

    // Chunk boundaries deliberately unrelated to message boundaries.
    let chunk = REQUEST_CHUNK;
    let mut chunks = vec![10, 9, 2 * chunk - 1, 3 * chunk];
    let sent: usize = chunks.iter().sum();
    chunks.push(requests.len() - sent);

    let writer = tokio::spawn(async move {
        let mut offset = 0;
        for len in chunks {
            wr.write_all(&requests[offset..offset + len]).await.unwrap();
            offset += len;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        wr
    });

    let mut got = vec![0u8; expected.len()];
    rd.read_exact(&mut got).await.unwrap();
    assert_eq!(got.len(), expected.len());
    assert_eq!(got, expected);

    // Last request was non-keep-alive: the server closes.
    let mut tail = Vec::new();
    rd.read_to_end(&mut tail).await.unwrap();
    assert!(tail.is_empty());

    drop(writer.await.unwrap());
    server.stop().await;
}

#[tokio::test]
async fn pipelined_requests_through_a_worker() {
    run_pipeline(
        Arc::new(|| {
            Box::new(LengthPrefixed::new(1, KeepAliveField::ByteAt(8))) as Box<dyn Framing>
        }),
        "xor-cascade",
    )
    .await;
}

#[tokio::test]
async fn pipelined_requests_answered_in_process() {
    // The worker pool sits unused here; the framing builds responses
    // itself.
    run_pipeline(
        Arc::new(|| Box::new(XorCascadeInplace::new()) as Box<dyn Framing>),
        "xor-cascade",
    )
    .await;
}
