//! The pruv HTTP daemon.
//!
//! One binary, two roles. Without `--worker` it runs the dispatcher:
//! binds the listening socket, spawns workers up to the configured cap
//! and serves until SIGTERM/SIGINT/SIGHUP. With `--worker` it runs the
//! worker loop around the demo HTTP handler. By default workers are
//! respawns of this very executable.

use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pruv::http::HttpPipelining;
use pruv::http_worker::{write_error_response, HttpRequest, ResponseWriter};
use pruv::worker_loop::{self, RequestHandler, WorkerLoop};
use pruv::{termination, Dispatcher, DispatcherConfig};
use pruv_shm::ShmBuffer;

#[derive(Parser, Debug)]
#[command(name = "pruv-httpd")]
#[command(about = "Multi-process HTTP front end")]
struct Args {
    /// Fork into the background and log to the journal.
    #[arg(long)]
    daemon: bool,
    /// Run as a worker child instead of the dispatcher.
    #[arg(long)]
    worker: bool,
    /// Disable the periodic reaper.
    #[arg(long)]
    notimeouts: bool,
    /// Maximum syslog level (0..7).
    #[arg(long, default_value_t = 6)]
    loglevel: u8,
    /// Omit file/line metadata from log records.
    #[arg(long)]
    nologlocations: bool,
    /// IPv4 or IPv6 listen address.
    #[arg(long, default_value = "::")]
    listen_addr: IpAddr,
    #[arg(long, default_value_t = 8000)]
    listen_port: u16,
    /// Worker pool cap.
    #[arg(long, default_value_t = 1)]
    workers_num: usize,
    /// Program to spawn as worker; defaults to this executable.
    #[arg(long)]
    worker_executable: Option<PathBuf>,
    /// Extra argument for workers; repeatable.
    #[arg(long = "worker-arg")]
    worker_arg: Vec<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    if args.worker {
        return worker_main();
    }
    dispatcher_main(args)
}

/// Map the syslog-numbered `--loglevel` onto a tracing filter.
fn level_filter(loglevel: u8) -> &'static str {
    match loglevel {
        0..=3 => "error",
        4 => "warn",
        5 | 6 => "info",
        _ => "debug",
    }
}

fn init_logging(args: &Args) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level_filter(args.loglevel)));
    let registry = tracing_subscriber::registry().with(filter);

    // Workers own stdout for the control pipe: all logging must go
    // elsewhere. Daemons have no terminal at all.
    if args.daemon || args.worker {
        if let Ok(journald) = tracing_journald::layer() {
            registry.with(journald).init();
            return;
        }
    }
    let locations = !args.nologlocations;
    registry
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_file(locations)
                .with_line_number(locations),
        )
        .init();
}

fn worker_main() -> ExitCode {
    if let Err(e) = worker_loop::setup() {
        tracing::error!(error = %e, "worker setup failed");
        return ExitCode::FAILURE;
    }
    let mut w = WorkerLoop::new(HttpHandler);
    ExitCode::from(w.run() as u8)
}

fn dispatcher_main(args: Args) -> ExitCode {
    if args.daemon {
        match daemonize() {
            Ok(Role::Parent) => return ExitCode::SUCCESS,
            Ok(Role::Daemon) => tracing::info!("daemon started"),
            Err(e) => {
                tracing::error!(error = %e, "daemonization failed");
                return ExitCode::FAILURE;
            }
        }
    }

    let cfg = match build_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    // The runtime comes up after the daemon fork; a single thread drives
    // everything.
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to create runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = rt.block_on(async {
        let dispatcher = Dispatcher::bind(cfg).await?;
        let handle = dispatcher.handle();
        if let Err(e) = watch_signals(handle) {
            tracing::error!(error = %e, "installing signal handlers failed");
        }
        dispatcher.run().await
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

fn build_config(args: &Args) -> io::Result<DispatcherConfig> {
    let self_exe = args.worker_executable.is_none();
    let worker_exe = match &args.worker_executable {
        Some(path) => path.clone(),
        None => std::env::current_exe()?,
    };
    let mut worker_args = args.worker_arg.clone();
    if self_exe {
        worker_args.push("--worker".to_owned());
        worker_args.push("--loglevel".to_owned());
        worker_args.push(args.loglevel.min(7).to_string());
    }

    let mut cfg = DispatcherConfig::new(
        worker_exe,
        Arc::new(|| Box::new(HttpPipelining::new()) as Box<dyn pruv::Framing>),
    );
    cfg.listen_addr = args.listen_addr;
    cfg.listen_port = args.listen_port;
    cfg.workers_max = args.workers_num.max(1);
    cfg.worker_args = worker_args;
    cfg.timeouts_enabled = !args.notimeouts;
    Ok(cfg)
}

enum Role {
    Parent,
    Daemon,
}

fn daemonize() -> io::Result<Role> {
    // SAFETY: single-threaded at this point; the runtime is built later.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }
    if pid > 0 {
        return Ok(Role::Parent);
    }
    // SAFETY: plain syscalls in the child.
    unsafe {
        libc::umask(0);
        if libc::setsid() < 0 {
            tracing::error!(error = %io::Error::last_os_error(), "setsid failed");
        }
    }
    Ok(Role::Daemon)
}

fn watch_signals(handle: pruv::DispatcherHandle) -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut hup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = term.recv() => {}
                _ = int.recv() => {}
                _ = hup.recv() => {}
            }
            tracing::info!("received stop signal");
            handle.stop();
        }
    });
    Ok(())
}

/// Demo responder: `/double/N` and `/square/N` answer with arithmetic,
/// anything else with 400.
struct HttpHandler;

impl RequestHandler for HttpHandler {
    fn handle(&mut self, request: &mut [u8], response: &mut ShmBuffer) -> io::Result<()> {
        if termination::requested() {
            return write_error_response(response);
        }
        let req = match HttpRequest::parse(request) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request");
                return write_error_response(response);
            }
        };
        let Some(value) = eval_path(req.path) else {
            return write_error_response(response);
        };

        let keep_alive = req.keep_alive;
        let mut w = ResponseWriter::new(response);
        w.status_line("HTTP/1.1 200 OK")?;
        w.header("Content-Type", "text/html; charset=utf-8")?;
        if !keep_alive {
            w.header("Connection", "close")?;
        }
        w.begin_body()?;
        w.body(value.to_string().as_bytes())?;
        w.body(b"\r\n")?;
        w.finish()
    }
}

fn eval_path(path: &str) -> Option<i64> {
    let mut parts = path.split('/').filter(|p| !p.is_empty());
    let op = parts.next()?;
    let value: i64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    match op {
        "double" => Some(value.wrapping_shl(1)),
        "square" => Some(value.wrapping_mul(value)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pruv_shm::RESPONSE_CHUNK;

    #[test]
    fn eval_path_accepts_the_two_operations() {
        assert_eq!(eval_path("/double/21"), Some(42));
        assert_eq!(eval_path("/square/9"), Some(81));
        assert_eq!(eval_path("/square/-3"), Some(9));
        assert_eq!(eval_path("/cube/3"), None);
        assert_eq!(eval_path("/double/x"), None);
        assert_eq!(eval_path("/double"), None);
        assert_eq!(eval_path("/double/1/2"), None);
    }

    #[test]
    fn handler_answers_double() {
        let mut response = ShmBuffer::open(None, true).unwrap();
        response.reset_defaults(RESPONSE_CHUNK).unwrap();

        let mut request = b"GET /double/4 HTTP/1.1\r\nHost: t\r\n\r\n".to_vec();
        HttpHandler.handle(&mut request, &mut response).unwrap();

        response.seek(0, RESPONSE_CHUNK).unwrap();
        let len = response.data_size() as usize;
        let bytes = response.remaining()[..len].to_vec();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("8\r\n"));
    }

    #[test]
    fn handler_rejects_unknown_paths() {
        let mut response = ShmBuffer::open(None, true).unwrap();
        response.reset_defaults(RESPONSE_CHUNK).unwrap();
        let mut request = b"GET /nope HTTP/1.1\r\n\r\n".to_vec();
        HttpHandler.handle(&mut request, &mut response).unwrap();

        response.seek(0, RESPONSE_CHUNK).unwrap();
        let len = response.data_size() as usize;
        let text = String::from_utf8(response.remaining()[..len].to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }
}
