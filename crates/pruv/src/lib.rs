//! pruv: a multi-process HTTP front end.
//!
//! A single dispatcher process terminates TCP connections, frames
//! requests at the edge, and hands each one to a pool of worker child
//! processes over a control pipe plus two shared-memory buffers. Workers
//! produce the response bytes into shared memory and report completion
//! with one line on stdout; the dispatcher streams the response back to
//! the originating connection, keep-alive and pipelining included.
//!
//! The crate splits along the process boundary:
//!
//! - [`dispatcher`] — the engine: connection state machine, worker pool
//!   and scheduler, buffer pools, and the timer-driven reaper.
//! - [`worker_loop`] — the worker-side loop around a [`worker_loop::RequestHandler`].
//! - [`framing`]/[`http`] — the dispatcher-side protocol seam and its
//!   HTTP implementations.
//! - [`http_worker`] — worker-side HTTP parsing and response building.
//! - [`wire`] — the bit-exact control-pipe line protocol.
//! - [`termination`] — the two-level interruption flag workers honor.

pub mod config;
pub mod dispatcher;
pub mod framing;
pub mod http;
pub mod http_worker;
pub mod termination;
pub mod wire;
pub mod worker_loop;

pub use config::{DispatcherConfig, Timeouts};
pub use dispatcher::{Dispatcher, DispatcherError, DispatcherHandle};
pub use framing::{Framing, FramingError, FramingFactory, RequestSpan};
