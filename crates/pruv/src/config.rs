//! Dispatcher configuration.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::framing::FramingFactory;

/// Listen backlog for the accepting socket.
pub const BACKLOG: u32 = 16384;

/// Deadlines enforced by the reaper. The defaults are the production
/// values; tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Close a connection with no queued data after this long.
    pub idle: Duration,
    /// Close a connection stuck reading or writing after this long.
    pub io: Duration,
    /// Kill a worker that has not produced its response line.
    pub processing: Duration,
    /// Escalate SIGTERM to SIGKILL for a terminated worker.
    pub kill: Duration,
    /// Reaper period.
    pub tick: Duration,
}

impl Default for Timeouts {
    fn default() -> Timeouts {
        Timeouts {
            idle: Duration::from_secs(30),
            io: Duration::from_secs(10),
            processing: Duration::from_secs(10),
            kill: Duration::from_secs(10),
            tick: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct DispatcherConfig {
    pub listen_addr: IpAddr,
    pub listen_port: u16,
    /// Cap on concurrently live worker processes.
    pub workers_max: usize,
    /// Program spawned for each worker.
    pub worker_executable: PathBuf,
    /// Extra arguments passed to every worker.
    pub worker_args: Vec<String>,
    /// `false` disables the periodic reaper entirely.
    pub timeouts_enabled: bool,
    pub timeouts: Timeouts,
    /// Produces the per-connection protocol framing.
    pub framing: FramingFactory,
}

impl DispatcherConfig {
    pub fn new(worker_executable: impl Into<PathBuf>, framing: FramingFactory) -> DispatcherConfig {
        DispatcherConfig {
            listen_addr: "::".parse().expect("valid literal"),
            listen_port: 8000,
            workers_max: 1,
            worker_executable: worker_executable.into(),
            worker_args: Vec::new(),
            timeouts_enabled: true,
            timeouts: Timeouts::default(),
            framing,
        }
    }
}
