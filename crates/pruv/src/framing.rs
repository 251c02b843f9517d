//! The dispatcher-side protocol seam.
//!
//! A [`Framing`] instance lives inside one connection. It turns the byte
//! stream accumulated in the connection's read buffer into request spans,
//! optionally produces responses in-process, and watches outgoing response
//! bytes to decide keep-alive.

use std::fmt;
use std::io;

use pruv_shm::ShmBuffer;

/// Location of a complete request inside the connection's read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSpan {
    pub pos: u64,
    pub len: u64,
}

#[derive(Debug)]
pub enum FramingError {
    /// The byte stream violates the protocol; the connection is closed.
    Protocol(&'static str),
    /// The client requested a protocol upgrade, which is not supported.
    Upgrade,
    /// Buffer manipulation failed.
    Io(io::Error),
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingError::Protocol(what) => write!(f, "protocol error: {what}"),
            FramingError::Upgrade => write!(f, "protocol upgrade not supported"),
            FramingError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for FramingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FramingError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FramingError {
    fn from(e: io::Error) -> Self {
        FramingError::Io(e)
    }
}

/// Default cap on buffered-but-unprocessed request bytes.
pub const DEFAULT_MAX_BUFFERED: u64 = 1024 * 1024;

pub trait Framing: Send {
    /// Protocol tag passed to the worker on the command line.
    fn protocol(&self) -> &'static str;

    /// Consume newly arrived bytes: `buf.data_size()` grew since the last
    /// call. Parsing stops at the end of the current message; bytes beyond
    /// it stay buffered untouched.
    fn parse_request(&mut self, buf: &mut ShmBuffer) -> Result<(), FramingError>;

    /// Span of the current message once it is complete.
    fn request(&self) -> Option<RequestSpan>;

    /// Start of the first byte not yet claimed by a finished request.
    /// When this reaches `data_size`, the read buffer can return to the
    /// pool.
    fn parse_pos(&self) -> u64;

    /// The current request has been fully answered; skip past it and get
    /// ready for the next message.
    fn advance_past_request(&mut self);

    /// The read buffer went back to the pool; positions restart at zero.
    fn on_buffer_released(&mut self);

    /// Cap on `data_size - parse_pos()`; exceeding it closes the
    /// connection.
    fn max_buffered(&self) -> u64 {
        DEFAULT_MAX_BUFFERED
    }

    /// Whether the current request can be answered without a worker.
    fn wants_inplace(&self) -> bool {
        false
    }

    /// Produce the response for `span` directly into `out`. Only called
    /// when [`Framing::wants_inplace`] returned true.
    fn inplace_response(
        &mut self,
        span: RequestSpan,
        input: &mut ShmBuffer,
        out: &mut ShmBuffer,
    ) -> Result<(), FramingError> {
        let _ = (span, input, out);
        Err(FramingError::Protocol("inplace response not supported"))
    }

    /// A response is about to start streaming to the socket.
    fn prepare_for_response(&mut self);

    /// Observe an outgoing chunk of the current response.
    fn parse_response(&mut self, chunk: &[u8]);

    /// After the last byte of the current response: keep the connection?
    fn keep_alive(&self) -> bool;
}

/// Factory producing one [`Framing`] per accepted connection.
pub type FramingFactory =
    std::sync::Arc<dyn Fn() -> Box<dyn Framing> + Send + Sync>;
