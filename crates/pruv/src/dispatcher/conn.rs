//! Per-connection I/O task.
//!
//! Owns the accepted socket, the read buffer while the connection holds
//! one, and the FIFO of response buffers waiting to be written. Everything
//! else — pools, worker pairing, deadlines — lives in the engine; this
//! task reports through the event channel and obeys commands.
//!
//! When the connection could both read and write, writing wins
//! (backpressure). Reading keeps going while a request is in flight so
//! pipelined follow-ups accumulate, but nothing past the current message
//! is acted on until its response has been received.

use std::collections::VecDeque;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use pruv_shm::{ShmBuffer, REQUEST_CHUNK, RESPONSE_CHUNK};

use crate::framing::Framing;

use super::{BufKind, ConnId, Event};

/// Cap on queued responses per connection.
const RESPONSES_MAX_DEPTH: usize = 10;
/// Cap on total bytes queued in responses per connection.
const RESPONSES_MAX_BYTES: u64 = 10 * 1024 * 1024;

pub(crate) enum ConnCmd {
    /// A worker finished the in-flight request; stream this buffer out.
    Response(ShmBuffer),
    Close,
}

/// Why the connection is going away. Only the logging level cares.
enum Close {
    Eof,
    Requested,
    EngineGone,
    NoBuffer,
    Protocol(String),
    Io(std::io::Error),
    ResponseDone,
}

pub(crate) struct ConnTask {
    id: ConnId,
    sock: TcpStream,
    framing: Box<dyn Framing>,
    events: mpsc::UnboundedSender<Event>,
    cmds: mpsc::UnboundedReceiver<ConnCmd>,
    read_buf: Option<ShmBuffer>,
    resp_queue: VecDeque<ShmBuffer>,
    resp_queue_bytes: u64,
    /// prepare_for_response ran for the queue head.
    write_started: bool,
    /// A request was handed to the engine and no response came back yet.
    in_flight: bool,
}

pub(crate) async fn run_conn(task: ConnTask) {
    task.run().await
}

impl ConnTask {
    pub(crate) fn new(
        id: ConnId,
        sock: TcpStream,
        framing: Box<dyn Framing>,
        events: mpsc::UnboundedSender<Event>,
        cmds: mpsc::UnboundedReceiver<ConnCmd>,
    ) -> ConnTask {
        ConnTask {
            id,
            sock,
            framing,
            events,
            cmds,
            read_buf: None,
            resp_queue: VecDeque::new(),
            resp_queue_bytes: 0,
            write_started: false,
            in_flight: false,
        }
    }

    async fn run(mut self) {
        let close = match self.serve().await {
            Ok(close) => close,
            Err(close) => close,
        };
        match &close {
            Close::Eof | Close::Requested | Close::ResponseDone => {
                tracing::debug!(conn = self.id, "closing connection")
            }
            Close::EngineGone => {}
            Close::NoBuffer => tracing::error!(conn = self.id, "no buffer, closing connection"),
            Close::Protocol(what) => tracing::warn!(conn = self.id, error = %what, "closing connection"),
            Close::Io(e) => tracing::warn!(conn = self.id, error = %e, "closing connection"),
        }
        let read_buf = self.read_buf.take();
        let resp_bufs: Vec<ShmBuffer> = self.resp_queue.drain(..).collect();
        let _ = self.events.send(Event::ConnClosed {
            conn: self.id,
            read_buf,
            resp_bufs,
        });
    }

    async fn serve(&mut self) -> Result<Close, Close> {
        loop {
            // Commands never wait behind socket I/O.
            loop {
                match self.cmds.try_recv() {
                    Ok(cmd) => self.on_cmd(cmd).await?,
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => return Ok(Close::EngineGone),
                }
            }

            if !self.resp_queue.is_empty() {
                // Writing wins over reading.
                self.write_chunk().await?;
                continue;
            }

            if !self.can_read() {
                match self.cmds.recv().await {
                    Some(cmd) => self.on_cmd(cmd).await?,
                    None => return Ok(Close::EngineGone),
                }
                continue;
            }

            // Wait for readability before taking a buffer from the pool,
            // so an idle connection holds nothing.
            tokio::select! {
                biased;
                cmd = self.cmds.recv() => {
                    match cmd {
                        Some(cmd) => self.on_cmd(cmd).await?,
                        None => return Ok(Close::EngineGone),
                    }
                }
                ready = self.sock.readable() => {
                    ready.map_err(Close::Io)?;
                    self.read_ready().await?;
                }
            }
        }
    }

    fn can_read(&self) -> bool {
        self.resp_queue.len() < RESPONSES_MAX_DEPTH && self.resp_queue_bytes < RESPONSES_MAX_BYTES
    }

    /// The socket reported readability: prepare a window at the end of
    /// the read buffer and take whatever bytes are there.
    async fn read_ready(&mut self) -> Result<(), Close> {
        self.ensure_read_buf().await?;
        let Some(mut buf) = self.read_buf.take() else {
            return Err(Close::NoBuffer);
        };
        if let Err(e) = buf.seek(buf.data_size(), REQUEST_CHUNK) {
            self.read_buf = Some(buf);
            return Err(Close::Io(e));
        }
        let nread = self.sock.try_read(buf.remaining_mut());
        self.read_buf = Some(buf);
        match nread {
            Ok(0) => Err(Close::Eof),
            Ok(n) => self.on_bytes(n).await,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(Close::Io(e)),
        }
    }

    async fn on_cmd(&mut self, cmd: ConnCmd) -> Result<(), Close> {
        match cmd {
            ConnCmd::Close => Err(Close::Requested),
            ConnCmd::Response(buf) => {
                debug_assert!(self.in_flight);
                self.in_flight = false;
                self.push_response(buf);
                self.framing.advance_past_request();
                // Part of the next message may have been read along with
                // the previous one; pick it up now.
                if let Some(rb) = self.read_buf.as_mut() {
                    self.framing
                        .parse_request(rb)
                        .map_err(|e| Close::Protocol(e.to_string()))?;
                }
                self.maybe_dispatch().await?;
                self.maybe_release_read_buf();
                Ok(())
            }
        }
    }

    async fn on_bytes(&mut self, n: usize) -> Result<(), Close> {
        let Some(buf) = self.read_buf.as_mut() else {
            return Err(Close::NoBuffer);
        };
        buf.set_data_size(buf.data_size() + n as u64);
        let _ = self.events.send(Event::ConnActive { conn: self.id });

        self.framing
            .parse_request(buf)
            .map_err(|e| Close::Protocol(e.to_string()))?;
        if buf.data_size() - self.framing.parse_pos() > self.framing.max_buffered() {
            return Err(Close::Protocol("request buffer limit exceeded".into()));
        }
        self.maybe_dispatch().await?;
        self.maybe_release_read_buf();
        Ok(())
    }

    /// Hand the current request over once it is complete: to the engine
    /// for worker scheduling, or straight to the response queue for
    /// framings that answer in-process.
    async fn maybe_dispatch(&mut self) -> Result<(), Close> {
        if self.in_flight {
            return Ok(());
        }
        let Some(span) = self.framing.request() else {
            return Ok(());
        };
        if self.framing.wants_inplace() {
            let mut out = self.request_buffer(BufKind::Response).await?;
            let Some(input) = self.read_buf.as_mut() else {
                return Err(Close::NoBuffer);
            };
            self.framing
                .inplace_response(span, input, &mut out)
                .map_err(|e| Close::Protocol(e.to_string()))?;
            out.seek(0, RESPONSE_CHUNK).map_err(Close::Io)?;
            self.push_response(out);
            self.framing.advance_past_request();
            let _ = self.events.send(Event::ConnActive { conn: self.id });
        } else {
            let Some(input) = self.read_buf.as_ref() else {
                return Err(Close::NoBuffer);
            };
            let _ = self.events.send(Event::RequestReady {
                conn: self.id,
                span,
                protocol: self.framing.protocol(),
                in_name: input.name().to_owned(),
            });
            self.in_flight = true;
        }
        Ok(())
    }

    fn push_response(&mut self, buf: ShmBuffer) {
        self.resp_queue_bytes += buf.data_size();
        self.resp_queue.push_back(buf);
    }

    /// Return the read buffer to the pool once everything in it has been
    /// claimed by finished requests.
    fn maybe_release_read_buf(&mut self) {
        if self.in_flight {
            return;
        }
        let drained = self
            .read_buf
            .as_ref()
            .map(|buf| self.framing.parse_pos() >= buf.data_size())
            .unwrap_or(false);
        if !drained {
            return;
        }
        if let Some(buf) = self.read_buf.take() {
            self.framing.on_buffer_released();
            let _ = self.events.send(Event::ReturnBuffer {
                kind: BufKind::Request,
                buf,
            });
        }
        if self.resp_queue.is_empty() {
            let _ = self.events.send(Event::ConnQuiescent { conn: self.id });
        }
    }

    /// Stream one window of the queue head to the socket.
    async fn write_chunk(&mut self) -> Result<(), Close> {
        if !self.write_started {
            self.framing.prepare_for_response();
            self.write_started = true;
        }
        let Some(buf) = self.resp_queue.front_mut() else {
            return Ok(());
        };
        if buf.cur_pos() >= buf.data_size() {
            // Covers the empty response as well.
            return self.finish_response().await;
        }
        if buf.remaining().is_empty() {
            // Window exhausted; map the next one.
            let map_size =
                std::cmp::min(RESPONSE_CHUNK as u64, buf.data_size() - buf.cur_pos()) as usize;
            let at = buf.cur_pos();
            buf.map(at, map_size).map_err(Close::Io)?;
        }
        let n = std::cmp::min(buf.remaining().len() as u64, buf.data_size() - buf.cur_pos())
            as usize;
        self.framing.parse_response(&buf.remaining()[..n]);
        let window = &buf.remaining()[..n];
        self.sock.write_all(window).await.map_err(Close::Io)?;
        buf.advance(n);
        tracing::trace!(conn = self.id, bytes = n, "response chunk written");
        let _ = self.events.send(Event::ConnActive { conn: self.id });
        if buf.cur_pos() >= buf.data_size() {
            return self.finish_response().await;
        }
        Ok(())
    }

    /// The last byte of the queue head went out: settle keep-alive, return
    /// the buffer and resolve the connection's next state.
    async fn finish_response(&mut self) -> Result<(), Close> {
        let keep_alive = self.framing.keep_alive();
        self.write_started = false;
        if let Some(buf) = self.resp_queue.pop_front() {
            self.resp_queue_bytes -= buf.data_size();
            let _ = self.events.send(Event::ReturnBuffer {
                kind: BufKind::Response,
                buf,
            });
        }
        tracing::debug!(conn = self.id, keep_alive, "response sent");
        if !keep_alive {
            return Err(Close::ResponseDone);
        }
        if !self.resp_queue.is_empty() {
            return Ok(());
        }
        // A request that became complete during the write can go out now.
        if !self.in_flight {
            if let Some(rb) = self.read_buf.as_mut() {
                self.framing
                    .parse_request(rb)
                    .map_err(|e| Close::Protocol(e.to_string()))?;
            }
            self.maybe_dispatch().await?;
        }
        self.maybe_release_read_buf();
        // Resolve the connection: partially read message means IO, a bare
        // socket means IDLE. In-flight requests stay engine-owned.
        if self.resp_queue.is_empty() && !self.in_flight {
            let ev = if self.read_buf.is_some() {
                Event::ConnActive { conn: self.id }
            } else {
                Event::ConnQuiescent { conn: self.id }
            };
            let _ = self.events.send(ev);
        }
        Ok(())
    }

    async fn ensure_read_buf(&mut self) -> Result<(), Close> {
        if self.read_buf.is_some() {
            return Ok(());
        }
        let buf = self.request_buffer(BufKind::Request).await?;
        self.read_buf = Some(buf);
        Ok(())
    }

    async fn request_buffer(&mut self, kind: BufKind) -> Result<ShmBuffer, Close> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::NeedBuffer {
                conn: self.id,
                kind,
                reply,
            })
            .map_err(|_| Close::EngineGone)?;
        match rx.await {
            Ok(Some(buf)) => Ok(buf),
            Ok(None) => Err(Close::NoBuffer),
            Err(_) => Err(Close::EngineGone),
        }
    }
}
