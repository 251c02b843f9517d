//! Worker binary for the end-to-end suite. `--handler <name>` picks the
//! request handler, mirroring how the daemon binary picks its own.

use std::io;
use std::process::ExitCode;

use clap::Parser;

use pruv::worker_loop::{self, WorkerLoop};
use pruv_shm::{ShmBuffer, RESPONSE_CHUNK};

use pruv_tests::{adler32, xor_cascade_response};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    handler: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = worker_loop::setup() {
        tracing::error!(error = %e, "worker setup failed");
        return ExitCode::FAILURE;
    }

    let code = match args.handler.as_str() {
        "byte-pattern" => WorkerLoop::new(byte_pattern).run(),
        "adler-echo" => WorkerLoop::new(adler_echo).run(),
        "xor-cascade" => WorkerLoop::new(xor_cascade).run(),
        "crash-on-boom" => WorkerLoop::new(crash_on_boom).run(),
        other => {
            tracing::error!(handler = other, "unknown handler");
            1
        }
    };
    ExitCode::from(code as u8)
}

fn bad_request(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, what.to_owned())
}

fn reply(response: &mut ShmBuffer, bytes: &[u8]) -> io::Result<()> {
    response.set_data_size(0);
    response.append(bytes, RESPONSE_CHUNK)
}

/// Request: `[u64 16][u64 resp_len][u64 keep_alive]`.
/// Response: `resp_len` bytes, byte `i` holding `i as u8`.
fn byte_pattern(request: &mut [u8], response: &mut ShmBuffer) -> io::Result<()> {
    if request.len() != 24 {
        return Err(bad_request("request must be 24 bytes"));
    }
    let rest_len = u64::from_le_bytes(request[..8].try_into().expect("eight bytes"));
    if rest_len != 16 {
        return Err(bad_request("length field must be 16"));
    }
    let resp_len = u64::from_le_bytes(request[8..16].try_into().expect("eight bytes"));

    response.set_data_size(0);
    let mut produced = 0u64;
    let mut chunk = vec![0u8; 64 * 1024];
    while produced < resp_len {
        let n = std::cmp::min(chunk.len() as u64, resp_len - produced);
        for (i, byte) in chunk[..n as usize].iter_mut().enumerate() {
            *byte = (produced + i as u64) as u8;
        }
        response.append(&chunk[..n as usize], RESPONSE_CHUNK)?;
        produced += n;
    }
    Ok(())
}

/// Request: `[u64 body_len][u64 keep_alive][body]`.
/// Response: 4-byte little-endian adler32 of the body.
fn adler_echo(request: &mut [u8], response: &mut ShmBuffer) -> io::Result<()> {
    if request.len() < 16 {
        return Err(bad_request("request too short"));
    }
    let body_len = u64::from_le_bytes(request[..8].try_into().expect("eight bytes")) as usize;
    if 16 + body_len != request.len() {
        return Err(bad_request("length field mismatch"));
    }
    let sum = adler32(&request[16..]);
    reply(response, &sum.to_le_bytes())
}

/// Request: `[u64 body_len][u8 keep_alive][body]`.
/// Response: the cascading-xor transform.
fn xor_cascade(request: &mut [u8], response: &mut ShmBuffer) -> io::Result<()> {
    if request.len() < 9 {
        return Err(bad_request("request too short"));
    }
    let body_len = u64::from_le_bytes(request[..8].try_into().expect("eight bytes")) as usize;
    if 9 + body_len != request.len() {
        return Err(bad_request("length field mismatch"));
    }
    let keep = request[8];
    let out = xor_cascade_response(&request[9..], keep);
    reply(response, &out)
}

/// Request: adler-echo format. A body of `boom` kills the process the way
/// a buggy handler would; anything else answers `ok`.
fn crash_on_boom(request: &mut [u8], response: &mut ShmBuffer) -> io::Result<()> {
    if request.len() < 16 {
        return Err(bad_request("request too short"));
    }
    if &request[16..] == b"boom" {
        std::process::exit(1);
    }
    reply(response, b"ok")
}
