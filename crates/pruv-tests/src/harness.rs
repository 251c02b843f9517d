//! Boots a dispatcher on an ephemeral port around the `test-worker`
//! helper binary.

use std::net::SocketAddr;

use tokio::task::JoinHandle;

use pruv::framing::FramingFactory;
use pruv::{Dispatcher, DispatcherError, DispatcherHandle, DispatcherConfig, Timeouts};

pub struct TestServer {
    pub addr: SocketAddr,
    handle: DispatcherHandle,
    task: JoinHandle<Result<(), DispatcherError>>,
}

pub struct TestServerConfig {
    pub framing: FramingFactory,
    /// Handler name understood by the test-worker binary.
    pub handler: &'static str,
    pub workers: usize,
    pub timeouts: Option<Timeouts>,
}

/// Bind on a free port and run the dispatcher in a background task.
pub async fn start(cfg: TestServerConfig) -> TestServer {
    let worker_exe = std::env::var("CARGO_BIN_EXE_test-worker")
        .expect("CARGO_BIN_EXE_test-worker not set");
    let mut dc = DispatcherConfig::new(&worker_exe, cfg.framing);
    dc.listen_addr = "::1".parse().expect("valid literal");
    dc.listen_port = 0;
    dc.workers_max = cfg.workers;
    dc.worker_args = vec!["--handler".to_owned(), cfg.handler.to_owned()];
    if let Some(timeouts) = cfg.timeouts {
        dc.timeouts = timeouts;
    }

    let dispatcher = Dispatcher::bind(dc).await.expect("bind test dispatcher");
    let addr = dispatcher.local_addr();
    let handle = dispatcher.handle();
    let task = tokio::spawn(dispatcher.run());
    TestServer { addr, handle, task }
}

impl TestServer {
    /// Graceful stop; waits for the full drain.
    pub async fn stop(self) {
        self.handle.stop();
        self.task
            .await
            .expect("dispatcher task panicked")
            .expect("dispatcher failed");
    }
}
