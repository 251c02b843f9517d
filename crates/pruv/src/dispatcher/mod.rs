//! The dispatcher engine.
//!
//! One central task owns every pool and table: the request/response buffer
//! pools, the worker table with its free/in-use/terminated membership, the
//! connection table with tagged list membership and deadlines, and the
//! scheduling queue. Connection sockets and worker pipes are driven by
//! small tasks that report back over one event channel; all ownership
//! transfers and list moves happen here, between two channel receives.

mod conn;
mod worker;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot};

use pruv_shm::{ShmBuffer, REQUEST_CHUNK, RESPONSE_CHUNK};

use crate::config::{DispatcherConfig, BACKLOG};
use crate::framing::RequestSpan;
use crate::wire;

pub(crate) type ConnId = u64;
pub(crate) type WorkerId = u64;

#[derive(Debug)]
pub enum DispatcherError {
    /// Could not bind or listen on the configured address.
    Bind(io::Error),
}

impl fmt::Display for DispatcherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatcherError::Bind(e) => write!(f, "failed to bind: {e}"),
        }
    }
}

impl std::error::Error for DispatcherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DispatcherError::Bind(e) => Some(e),
        }
    }
}

/// Which pool a buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufKind {
    Request,
    Response,
}

/// Failure modes of a worker's stdout pipe.
#[derive(Debug)]
pub(crate) enum PipeError {
    Eof,
    LineTooLong,
    NotUtf8,
    Io(io::Error),
}

impl fmt::Display for PipeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeError::Eof => write!(f, "pipe closed"),
            PipeError::LineTooLong => write!(f, "response line too long"),
            PipeError::NotUtf8 => write!(f, "response line is not valid UTF-8"),
            PipeError::Io(e) => write!(f, "pipe read failed: {e}"),
        }
    }
}

/// Everything the engine reacts to.
pub(crate) enum Event {
    Accepted(TcpStream, SocketAddr),
    /// A connection task needs a buffer from a pool.
    NeedBuffer {
        conn: ConnId,
        kind: BufKind,
        reply: oneshot::Sender<Option<ShmBuffer>>,
    },
    /// A connection framed a complete request that needs a worker.
    RequestReady {
        conn: ConnId,
        span: RequestSpan,
        protocol: &'static str,
        in_name: String,
    },
    /// Bytes moved on the connection: refresh the IO deadline.
    ConnActive { conn: ConnId },
    /// The connection is drained: move it to the idle list.
    ConnQuiescent { conn: ConnId },
    /// A buffer the connection owned goes back to its pool.
    ReturnBuffer { kind: BufKind, buf: ShmBuffer },
    /// The connection task finished; its buffers come home.
    ConnClosed {
        conn: ConnId,
        read_buf: Option<ShmBuffer>,
        resp_bufs: Vec<ShmBuffer>,
    },
    /// The asynchronous command write to a worker's stdin completed.
    WorkerWritten {
        worker: WorkerId,
        result: io::Result<()>,
    },
    /// A line (or a pipe failure) arrived from a worker's stdout.
    WorkerLine {
        worker: WorkerId,
        line: Result<String, PipeError>,
    },
    /// The OS reported the worker's exit.
    WorkerExited {
        worker: WorkerId,
        status: io::Result<std::process::ExitStatus>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListId {
    Idle,
    Io,
    Scheduling,
    Processing,
}

struct PendingRequest {
    span: RequestSpan,
    protocol: &'static str,
    in_name: String,
}

struct ConnEntry {
    list: ListId,
    deadline: Instant,
    cmds: mpsc::UnboundedSender<conn::ConnCmd>,
    /// Worker currently serving this connection's request.
    worker: Option<WorkerId>,
    pending: Option<PendingRequest>,
    closing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Free,
    InUse,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IoState {
    Idle,
    Write,
    Read,
}

struct WorkerEntry {
    pid: u32,
    state: WorkerState,
    io_state: IoState,
    deadline: Instant,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    /// Connection whose request this worker is processing.
    processed_con: Option<ConnId>,
    /// Read buffer parked here when its connection closed mid-processing.
    in_buf: Option<ShmBuffer>,
    /// Response buffer owned by the worker for the processing window.
    out_buf: Option<ShmBuffer>,
}

/// A bound dispatcher, ready to run.
pub struct Dispatcher {
    engine: Engine,
    listener: TcpListener,
    local_addr: SocketAddr,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

/// Cheap handle for requesting a graceful stop.
#[derive(Clone)]
pub struct DispatcherHandle {
    events: mpsc::UnboundedSender<Event>,
}

impl DispatcherHandle {
    pub fn stop(&self) {
        let _ = self.events.send(Event::Shutdown);
    }
}

impl Dispatcher {
    /// Bind the listening socket. Fatal init failures surface here so the
    /// caller can exit non-zero.
    pub async fn bind(cfg: DispatcherConfig) -> Result<Dispatcher, DispatcherError> {
        let addr = SocketAddr::new(cfg.listen_addr, cfg.listen_port);
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(DispatcherError::Bind)?;
        socket.set_reuseaddr(true).map_err(DispatcherError::Bind)?;
        socket.bind(addr).map_err(DispatcherError::Bind)?;
        let listener = socket.listen(BACKLOG).map_err(DispatcherError::Bind)?;
        let local_addr = listener.local_addr().map_err(DispatcherError::Bind)?;
        tracing::info!(addr = %local_addr, "server started");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Dispatcher {
            engine: Engine::new(cfg, events_tx),
            listener,
            local_addr,
            events_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            events: self.engine.events.clone(),
        }
    }

    /// Drive the dispatcher until a graceful stop has fully drained:
    /// every connection closed, every worker reaped, every pool released.
    pub async fn run(self) -> Result<(), DispatcherError> {
        let Dispatcher {
            mut engine,
            listener,
            local_addr: _,
            mut events_rx,
        } = self;

        let (stop_tx, stop_rx) = oneshot::channel();
        engine.accept_stop = Some(stop_tx);
        tokio::spawn(accept_loop(listener, engine.events.clone(), stop_rx));

        let mut reaper = tokio::time::interval(engine.cfg.timeouts.tick);
        reaper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if engine.drained() {
                break;
            }
            tokio::select! {
                biased;
                ev = events_rx.recv() => match ev {
                    Some(ev) => engine.handle_event(ev),
                    None => break,
                },
                _ = reaper.tick() => engine.on_timer_tick(),
            }
        }

        engine.close_pools();
        tracing::info!("server stopped");
        Ok(())
    }
}

/// Owns the listening socket; closes it the moment shutdown starts.
async fn accept_loop(
    listener: TcpListener,
    events: mpsc::UnboundedSender<Event>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => break,
            res = listener.accept() => match res {
                Ok((stream, addr)) => {
                    if events.send(Event::Accepted(stream, addr)).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!(error = %e, "accept failed"),
            },
        }
    }
}

struct Engine {
    cfg: DispatcherConfig,
    events: mpsc::UnboundedSender<Event>,
    accept_stop: Option<oneshot::Sender<()>>,

    conns: HashMap<ConnId, ConnEntry>,
    next_conn_id: ConnId,
    /// Connections holding a complete request, in arrival order.
    sched_queue: VecDeque<ConnId>,

    workers: HashMap<WorkerId, WorkerEntry>,
    free_workers: VecDeque<WorkerId>,
    next_worker_id: WorkerId,
    workers_cnt: usize,

    req_pool: Vec<ShmBuffer>,
    resp_pool: Vec<ShmBuffer>,

    shutting_down: bool,
}

impl Engine {
    fn new(cfg: DispatcherConfig, events: mpsc::UnboundedSender<Event>) -> Engine {
        Engine {
            cfg,
            events,
            accept_stop: None,
            conns: HashMap::new(),
            next_conn_id: 0,
            sched_queue: VecDeque::new(),
            workers: HashMap::new(),
            free_workers: VecDeque::new(),
            next_worker_id: 0,
            workers_cnt: 0,
            req_pool: Vec::new(),
            resp_pool: Vec::new(),
            shutting_down: false,
        }
    }

    fn drained(&self) -> bool {
        self.shutting_down && self.conns.is_empty() && self.workers.is_empty()
    }

    fn handle_event(&mut self, ev: Event) {
        match ev {
            Event::Accepted(stream, addr) => self.on_accepted(stream, addr),
            Event::NeedBuffer { conn, kind, reply } => self.on_need_buffer(conn, kind, reply),
            Event::RequestReady {
                conn,
                span,
                protocol,
                in_name,
            } => self.on_request_ready(conn, span, protocol, in_name),
            Event::ConnActive { conn } => self.on_conn_active(conn),
            Event::ConnQuiescent { conn } => self.on_conn_quiescent(conn),
            Event::ReturnBuffer { kind, buf } => {
                self.return_buffer(kind, buf);
                self.schedule();
            }
            Event::ConnClosed {
                conn,
                read_buf,
                resp_bufs,
            } => self.on_conn_closed(conn, read_buf, resp_bufs),
            Event::WorkerWritten { worker, result } => self.on_worker_written(worker, result),
            Event::WorkerLine { worker, line } => self.on_worker_line(worker, line),
            Event::WorkerExited { worker, status } => self.on_worker_exited(worker, status),
            Event::Shutdown => self.on_shutdown(),
        }
    }

    fn on_accepted(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.shutting_down {
            return;
        }
        tracing::debug!(peer = %addr, "connection received");
        let id = self.next_conn_id;
        self.next_conn_id += 1;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let framing = (self.cfg.framing.as_ref())();
        self.conns.insert(
            id,
            ConnEntry {
                list: ListId::Idle,
                deadline: Instant::now() + self.cfg.timeouts.idle,
                cmds: cmd_tx,
                worker: None,
                pending: None,
                closing: false,
            },
        );
        tokio::spawn(conn::run_conn(conn::ConnTask::new(
            id,
            stream,
            framing,
            self.events.clone(),
            cmd_rx,
        )));
    }

    fn on_need_buffer(
        &mut self,
        conn: ConnId,
        kind: BufKind,
        reply: oneshot::Sender<Option<ShmBuffer>>,
    ) {
        if self.shutting_down || !self.conns.contains_key(&conn) {
            let _ = reply.send(None);
            return;
        }
        let _ = reply.send(self.get_buffer(kind));
    }

    fn on_request_ready(
        &mut self,
        conn: ConnId,
        span: RequestSpan,
        protocol: &'static str,
        in_name: String,
    ) {
        let Some(entry) = self.conns.get_mut(&conn) else {
            return;
        };
        if entry.closing {
            return;
        }
        tracing::debug!(
            conn,
            pos = span.pos,
            len = span.len,
            "request message parsed"
        );
        entry.list = ListId::Scheduling;
        entry.pending = Some(PendingRequest {
            span,
            protocol,
            in_name,
        });
        self.sched_queue.push_back(conn);
        self.schedule();
    }

    fn on_conn_active(&mut self, conn: ConnId) {
        if let Some(entry) = self.conns.get_mut(&conn) {
            // Scheduling/processing membership is engine-owned; activity
            // only refreshes the idle/io lists.
            if matches!(entry.list, ListId::Idle | ListId::Io) && !entry.closing {
                entry.list = ListId::Io;
                entry.deadline = Instant::now() + self.cfg.timeouts.io;
            }
        }
    }

    fn on_conn_quiescent(&mut self, conn: ConnId) {
        if let Some(entry) = self.conns.get_mut(&conn) {
            if entry.list == ListId::Io && !entry.closing {
                entry.list = ListId::Idle;
                entry.deadline = Instant::now() + self.cfg.timeouts.idle;
            }
        }
    }

    fn on_conn_closed(
        &mut self,
        conn: ConnId,
        read_buf: Option<ShmBuffer>,
        resp_bufs: Vec<ShmBuffer>,
    ) {
        let Some(entry) = self.conns.remove(&conn) else {
            return;
        };
        tracing::debug!(conn, "connection closed");
        for buf in resp_bufs {
            self.return_buffer(BufKind::Response, buf);
        }
        if let Some(buf) = read_buf {
            let mut buf = Some(buf);
            if let Some(wid) = entry.worker {
                if let Some(w) = self.workers.get_mut(&wid) {
                    // The worker still reads from this buffer; park it
                    // there until the worker responds or exits.
                    w.in_buf = buf.take();
                }
            }
            if let Some(buf) = buf.take() {
                self.return_buffer(BufKind::Request, buf);
            }
        }
        if let Some(wid) = entry.worker {
            if let Some(w) = self.workers.get_mut(&wid) {
                if w.processed_con == Some(conn) {
                    w.processed_con = None;
                }
            }
        }
        self.schedule();
    }

    fn on_worker_written(&mut self, worker: WorkerId, result: io::Result<()>) {
        let Some(w) = self.workers.get_mut(&worker) else {
            return;
        };
        if w.state == WorkerState::Terminated {
            return;
        }
        match result {
            Ok(()) => {
                tracing::debug!(worker, "request sent to worker");
                debug_assert_eq!(w.io_state, IoState::Write);
                w.io_state = IoState::Read;
            }
            Err(e) => {
                tracing::error!(worker, error = %e, "writing worker stdin failed");
                self.kill_worker(worker);
            }
        }
    }

    fn on_worker_line(&mut self, worker: WorkerId, line: Result<String, PipeError>) {
        let Some(w) = self.workers.get_mut(&worker) else {
            return;
        };
        if w.state == WorkerState::Terminated {
            // Killed already; EOF and leftovers are expected noise.
            return;
        }
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(worker, error = %e, "reading worker stdout failed");
                self.kill_worker(worker);
                return;
            }
        };
        if w.io_state != IoState::Read {
            tracing::error!(worker, "worker wrote while not awaited");
            self.kill_worker(worker);
            return;
        }
        let resp = match wire::Response::parse(&line) {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(worker, line = %line, error = %e, "bad response line");
                self.kill_worker(worker);
                return;
            }
        };
        tracing::debug!(worker, len = resp.len, "response received from worker");

        let Some(mut out) = w.out_buf.take() else {
            tracing::error!(worker, "worker responded without an assigned buffer");
            self.kill_worker(worker);
            return;
        };
        // The worker reports its resizes so we can skip an fstat.
        out.update_file_size(resp.file_size);
        out.set_data_size(resp.len);

        w.io_state = IoState::Idle;
        w.state = WorkerState::Free;
        let parked_in = w.in_buf.take();
        let conn = w.processed_con.take();
        self.free_workers.push_back(worker);

        // Deliver to the connection if it is still around; a connection
        // closed mid-processing means the output is simply discarded.
        let mut out = Some(out);
        if let Some(cid) = conn {
            if let Some(entry) = self.conns.get_mut(&cid) {
                if !entry.closing {
                    entry.worker = None;
                    entry.list = ListId::Io;
                    entry.deadline = Instant::now() + self.cfg.timeouts.io;
                    if let Some(buf) = out.take() {
                        if let Err(mpsc::error::SendError(cmd)) =
                            entry.cmds.send(conn::ConnCmd::Response(buf))
                        {
                            // The task is already gone; reclaim below.
                            if let conn::ConnCmd::Response(buf) = cmd {
                                out = Some(buf);
                            }
                        }
                    }
                }
            }
        }
        if let Some(buf) = out {
            self.return_buffer(BufKind::Response, buf);
        }
        if let Some(buf) = parked_in {
            self.return_buffer(BufKind::Request, buf);
        }
        self.schedule();
    }

    fn on_worker_exited(
        &mut self,
        worker: WorkerId,
        status: io::Result<std::process::ExitStatus>,
    ) {
        let Some(mut w) = self.workers.remove(&worker) else {
            return;
        };
        match &status {
            Ok(st) => tracing::info!(worker, pid = w.pid, status = %st, "worker exited"),
            Err(e) => tracing::error!(worker, pid = w.pid, error = %e, "worker wait failed"),
        }
        self.free_workers.retain(|&id| id != worker);
        self.workers_cnt -= 1;
        if let Some(cid) = w.processed_con.take() {
            self.close_conn(cid);
        }
        // Buffers may be safely reused only after the worker is gone.
        if let Some(buf) = w.in_buf.take() {
            self.return_buffer(BufKind::Request, buf);
        }
        if let Some(buf) = w.out_buf.take() {
            self.return_buffer(BufKind::Response, buf);
        }
        self.schedule();
    }

    fn on_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        tracing::info!("graceful shutdown requested");
        self.shutting_down = true;
        if let Some(stop) = self.accept_stop.take() {
            let _ = stop.send(());
        }
        let conn_ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for id in conn_ids {
            self.close_conn(id);
        }
        let worker_ids: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, w)| w.state != WorkerState::Terminated)
            .map(|(&id, _)| id)
            .collect();
        for id in worker_ids {
            self.kill_worker(id);
        }
        self.close_pools();
    }

    /// Pair ready requests with free workers until one side runs out.
    fn schedule(&mut self) {
        loop {
            // Skip entries that stopped being schedulable meanwhile.
            while let Some(&id) = self.sched_queue.front() {
                let schedulable = self
                    .conns
                    .get(&id)
                    .map(|e| e.list == ListId::Scheduling && !e.closing)
                    .unwrap_or(false);
                if schedulable {
                    break;
                }
                self.sched_queue.pop_front();
            }
            if self.sched_queue.is_empty() {
                return;
            }

            if self.free_workers.is_empty() {
                if self.workers_cnt < self.cfg.workers_max {
                    self.spawn_worker();
                }
                if self.free_workers.is_empty() {
                    // Nothing can serve these requests.
                    tracing::error!("no worker for request, closing scheduling connections");
                    self.close_scheduling_conns();
                    return;
                }
            }

            let Some(resp_buf) = self.get_buffer(BufKind::Response) else {
                tracing::error!("no buffer for response, closing scheduling connections");
                self.close_scheduling_conns();
                return;
            };

            // Pick the head connection whose command line formats.
            let mut chosen: Option<(ConnId, Vec<u8>)> = None;
            while let Some(cid) = self.sched_queue.pop_front() {
                let Some(entry) = self.conns.get_mut(&cid) else {
                    continue;
                };
                if entry.list != ListId::Scheduling || entry.closing {
                    continue;
                }
                let Some(pending) = entry.pending.as_ref() else {
                    continue;
                };
                let cmd = wire::Command {
                    protocol: pending.protocol.to_owned(),
                    in_name: pending.in_name.clone(),
                    pos: pending.span.pos,
                    len: pending.span.len,
                    out_name: resp_buf.name().to_owned(),
                    out_file_size: resp_buf.file_size(),
                };
                match cmd.format() {
                    Ok(line) => {
                        chosen = Some((cid, line));
                        break;
                    }
                    Err(e) => {
                        tracing::error!(conn = cid, error = %e, "cannot format worker command");
                        self.close_conn(cid);
                    }
                }
            }
            let Some((cid, line)) = chosen else {
                self.return_buffer(BufKind::Response, resp_buf);
                return;
            };
            let Some(wid) = self.free_workers.pop_front() else {
                self.return_buffer(BufKind::Response, resp_buf);
                return;
            };

            // Transfer ownership: pair the worker and the connection.
            let now = Instant::now();
            let processing = self.cfg.timeouts.processing;
            let Some(w) = self.workers.get_mut(&wid) else {
                self.return_buffer(BufKind::Response, resp_buf);
                continue;
            };
            debug_assert_eq!(w.io_state, IoState::Idle);
            w.state = WorkerState::InUse;
            w.io_state = IoState::Write;
            w.deadline = now + processing;
            w.processed_con = Some(cid);
            w.out_buf = Some(resp_buf);
            let send_failed = w.writer.send(line).is_err();

            if let Some(entry) = self.conns.get_mut(&cid) {
                entry.worker = Some(wid);
                entry.list = ListId::Processing;
                entry.pending = None;
            }
            if send_failed {
                tracing::error!(worker = wid, "worker stdin writer is gone");
                self.kill_worker(wid);
            }
        }
    }

    fn spawn_worker(&mut self) {
        let id = self.next_worker_id;
        match worker::spawn(id, &self.cfg, self.events.clone()) {
            Ok(proc) => {
                self.next_worker_id += 1;
                tracing::info!(worker = id, pid = proc.pid, "worker process started");
                self.workers.insert(
                    id,
                    WorkerEntry {
                        pid: proc.pid,
                        state: WorkerState::Free,
                        io_state: IoState::Idle,
                        deadline: Instant::now(),
                        writer: proc.writer,
                        processed_con: None,
                        in_buf: None,
                        out_buf: None,
                    },
                );
                self.free_workers.push_back(id);
                self.workers_cnt += 1;
            }
            Err(e) => tracing::error!(error = %e, "spawning worker failed"),
        }
    }

    /// Detach the worker from its connection, stop caring about its
    /// stdout, SIGTERM it and let the reaper escalate.
    fn kill_worker(&mut self, worker: WorkerId) {
        let kill_after = self.cfg.timeouts.kill;
        let Some(w) = self.workers.get_mut(&worker) else {
            return;
        };
        if w.state == WorkerState::Terminated {
            return;
        }
        let conn = w.processed_con.take();
        // SAFETY: the worker table only holds pids we spawned and have not
        // reaped yet.
        let r = unsafe { libc::kill(w.pid as libc::pid_t, libc::SIGTERM) };
        if r != 0 {
            tracing::error!(worker, pid = w.pid, error = %io::Error::last_os_error(),
                "SIGTERM failed");
        }
        w.state = WorkerState::Terminated;
        w.io_state = IoState::Idle;
        w.deadline = Instant::now() + kill_after;
        self.free_workers.retain(|&id| id != worker);
        if let Some(cid) = conn {
            self.close_conn(cid);
        }
    }

    fn close_conn(&mut self, conn: ConnId) {
        if let Some(entry) = self.conns.get_mut(&conn) {
            if !entry.closing {
                entry.closing = true;
                let _ = entry.cmds.send(conn::ConnCmd::Close);
            }
        }
    }

    fn close_scheduling_conns(&mut self) {
        let ids: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, e)| e.list == ListId::Scheduling)
            .map(|(&id, _)| id)
            .collect();
        for id in ids {
            self.close_conn(id);
        }
        self.sched_queue.clear();
    }

    fn get_buffer(&mut self, kind: BufKind) -> Option<ShmBuffer> {
        let (pool, default_size) = match kind {
            BufKind::Request => (&mut self.req_pool, REQUEST_CHUNK),
            BufKind::Response => (&mut self.resp_pool, RESPONSE_CHUNK),
        };
        if let Some(buf) = pool.pop() {
            debug_assert_eq!(buf.data_size(), 0);
            debug_assert_eq!(buf.cur_pos(), 0);
            return Some(buf);
        }
        let mut buf = match ShmBuffer::open(None, true) {
            Ok(buf) => buf,
            Err(e) => {
                tracing::error!(error = %e, "opening shared memory buffer failed");
                return None;
            }
        };
        if let Err(e) = buf.reset_defaults(default_size) {
            tracing::error!(error = %e, "sizing shared memory buffer failed");
            return None;
        }
        Some(buf)
    }

    fn return_buffer(&mut self, kind: BufKind, mut buf: ShmBuffer) {
        let (pool, default_size) = match kind {
            BufKind::Request => (&mut self.req_pool, REQUEST_CHUNK),
            BufKind::Response => (&mut self.resp_pool, RESPONSE_CHUNK),
        };
        if self.shutting_down {
            // Pools are already closed; release outright.
            if let Err(e) = buf.close() {
                tracing::error!(error = %e, "closing shared memory buffer failed");
            }
            return;
        }
        if let Err(e) = buf.reset_defaults(default_size) {
            tracing::error!(error = %e, "buffer reset failed, destroying it");
            if let Err(e) = buf.close() {
                tracing::error!(error = %e, "closing shared memory buffer failed");
            }
            return;
        }
        buf.set_data_size(0);
        pool.push(buf);
    }

    fn close_pools(&mut self) {
        for buf in self.req_pool.drain(..).chain(self.resp_pool.drain(..)) {
            if let Err(e) = buf.close() {
                tracing::error!(error = %e, "closing pooled buffer failed");
            }
        }
    }

    /// Periodic cleanup: escalate kills, enforce worker and connection
    /// deadlines.
    fn on_timer_tick(&mut self) {
        if !self.cfg.timeouts_enabled {
            return;
        }
        let now = Instant::now();

        for (&id, w) in &self.workers {
            if w.state == WorkerState::Terminated && w.deadline <= now {
                tracing::warn!(worker = id, pid = w.pid, "escalating to SIGKILL");
                // SAFETY: signaling a pid we spawned and have not reaped yet.
                let r = unsafe { libc::kill(w.pid as libc::pid_t, libc::SIGKILL) };
                if r != 0 {
                    tracing::error!(worker = id, error = %io::Error::last_os_error(),
                        "SIGKILL failed");
                }
            }
        }

        let overdue_workers: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, w)| w.state == WorkerState::InUse && w.deadline <= now)
            .map(|(&id, _)| id)
            .collect();
        for id in overdue_workers {
            tracing::error!(worker = id, "processing timeout, killing worker");
            self.kill_worker(id);
        }

        let overdue_conns: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, e)| {
                matches!(e.list, ListId::Idle | ListId::Io) && !e.closing && e.deadline <= now
            })
            .map(|(&id, _)| id)
            .collect();
        for id in overdue_conns {
            tracing::debug!(conn = id, "connection timed out");
            self.close_conn(id);
        }
    }
}
