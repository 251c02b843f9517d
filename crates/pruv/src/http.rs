//! HTTP/1.x framing on the dispatcher side.
//!
//! Requests are framed incrementally: headers with `httparse`, then the
//! body by `Content-Length` arithmetic or a chunked-coding scanner. Header
//! blocks must fit in one read window. Parsing stops at the end of the
//! current message so pipelined follow-ups stay buffered until the message
//! in flight has been answered.
//!
//! The response side reads only enough of the outgoing bytes to decide
//! keep-alive once the response headers are complete.

use pruv_shm::{ShmBuffer, REQUEST_CHUNK};

use crate::framing::{Framing, FramingError, RequestSpan};

const MAX_HEADERS: usize = 64;
/// Give up on keep-alive detection if response headers exceed this.
const MAX_RESPONSE_HEADERS: usize = 64 * 1024;

enum MsgState {
    Headers,
    Body { remaining: u64 },
    Chunked(ChunkScanner),
    Complete,
}

/// Pipelining HTTP framing: the read buffer may hold several sequential
/// messages; the current one lives at `(request_pos, request_len)`.
pub struct HttpPipelining {
    request_pos: u64,
    request_len: u64,
    msg: MsgState,
    resp: RespParser,
}

impl HttpPipelining {
    pub fn new() -> HttpPipelining {
        HttpPipelining {
            request_pos: 0,
            request_len: 0,
            msg: MsgState::Headers,
            resp: RespParser::new(),
        }
    }
}

impl Default for HttpPipelining {
    fn default() -> Self {
        Self::new()
    }
}

impl Framing for HttpPipelining {
    fn protocol(&self) -> &'static str {
        "HTTP"
    }

    fn parse_request(&mut self, buf: &mut ShmBuffer) -> Result<(), FramingError> {
        parse_http_request(&mut self.msg, self.request_pos, &mut self.request_len, buf)
    }

    fn request(&self) -> Option<RequestSpan> {
        match self.msg {
            MsgState::Complete => Some(RequestSpan {
                pos: self.request_pos,
                len: self.request_len,
            }),
            _ => None,
        }
    }

    fn parse_pos(&self) -> u64 {
        self.request_pos
    }

    fn advance_past_request(&mut self) {
        self.request_pos += self.request_len;
        self.request_len = 0;
        self.msg = MsgState::Headers;
    }

    fn on_buffer_released(&mut self) {
        self.request_pos = 0;
        self.request_len = 0;
        self.msg = MsgState::Headers;
    }

    fn prepare_for_response(&mut self) {
        self.resp.prepare();
    }

    fn parse_response(&mut self, chunk: &[u8]) {
        self.resp.observe(chunk);
    }

    fn keep_alive(&self) -> bool {
        self.resp.keep_alive
    }
}

/// Non-pipelining HTTP framing: one in-flight request; bytes arriving
/// after a complete message, before its response has finished, close the
/// connection.
pub struct HttpSingle {
    request_pos: u64,
    request_len: u64,
    msg: MsgState,
    /// A request was answered but the buffer has not been drained yet.
    awaiting_reset: bool,
    resp: RespParser,
}

impl HttpSingle {
    pub fn new() -> HttpSingle {
        HttpSingle {
            request_pos: 0,
            request_len: 0,
            msg: MsgState::Headers,
            awaiting_reset: false,
            resp: RespParser::new(),
        }
    }
}

impl Default for HttpSingle {
    fn default() -> Self {
        Self::new()
    }
}

impl Framing for HttpSingle {
    fn protocol(&self) -> &'static str {
        "HTTP"
    }

    fn parse_request(&mut self, buf: &mut ShmBuffer) -> Result<(), FramingError> {
        let buffered_past_msg = buf.data_size() > self.request_pos + self.request_len;
        if matches!(self.msg, MsgState::Complete) && buffered_past_msg {
            return Err(FramingError::Protocol("pipelined request refused"));
        }
        if self.awaiting_reset && buffered_past_msg {
            return Err(FramingError::Protocol("request before previous response finished"));
        }
        parse_http_request(&mut self.msg, self.request_pos, &mut self.request_len, buf)
    }

    fn request(&self) -> Option<RequestSpan> {
        match self.msg {
            MsgState::Complete => Some(RequestSpan {
                pos: self.request_pos,
                len: self.request_len,
            }),
            _ => None,
        }
    }

    fn parse_pos(&self) -> u64 {
        self.request_pos
    }

    fn advance_past_request(&mut self) {
        self.request_pos += self.request_len;
        self.request_len = 0;
        self.msg = MsgState::Headers;
        self.awaiting_reset = true;
    }

    fn on_buffer_released(&mut self) {
        self.request_pos = 0;
        self.request_len = 0;
        self.msg = MsgState::Headers;
        self.awaiting_reset = false;
    }

    fn prepare_for_response(&mut self) {
        self.resp.prepare();
    }

    fn parse_response(&mut self, chunk: &[u8]) {
        self.resp.observe(chunk);
    }

    fn keep_alive(&self) -> bool {
        self.resp.keep_alive
    }
}

/// Advance the message state over bytes `[pos + len, data_size)`.
fn parse_http_request(
    msg: &mut MsgState,
    request_pos: u64,
    request_len: &mut u64,
    buf: &mut ShmBuffer,
) -> Result<(), FramingError> {
    loop {
        let end = buf.data_size();
        let consumed = request_pos + *request_len;
        match msg {
            MsgState::Complete => return Ok(()),
            _ if consumed >= end => return Ok(()),
            MsgState::Headers => {
                buf.seek(request_pos, REQUEST_CHUNK)?;
                let window = buf.remaining();
                let avail = std::cmp::min((end - request_pos) as usize, window.len());
                let slice = &window[..avail];

                let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let mut req = httparse::Request::new(&mut headers);
                match req.parse(slice) {
                    Ok(httparse::Status::Complete(header_len)) => {
                        let body = body_framing(req.headers)?;
                        *request_len = header_len as u64;
                        *msg = match body {
                            BodyFraming::None => MsgState::Complete,
                            BodyFraming::Length(0) => MsgState::Complete,
                            BodyFraming::Length(n) => MsgState::Body { remaining: n },
                            BodyFraming::Chunked => MsgState::Chunked(ChunkScanner::new()),
                        };
                    }
                    Ok(httparse::Status::Partial) => {
                        if avail == window.len() {
                            // The header block overflows the read window.
                            return Err(FramingError::Protocol("request headers too large"));
                        }
                        return Ok(());
                    }
                    Err(_) => return Err(FramingError::Protocol("bad request head")),
                }
            }
            MsgState::Body { remaining } => {
                let take = std::cmp::min(end - consumed, *remaining);
                *request_len += take;
                *remaining -= take;
                if *remaining == 0 {
                    *msg = MsgState::Complete;
                } else {
                    return Ok(());
                }
            }
            MsgState::Chunked(scan) => {
                buf.seek(consumed, REQUEST_CHUNK)?;
                let window = buf.remaining();
                let avail = std::cmp::min((end - consumed) as usize, window.len());
                let used = scan.feed(&window[..avail])?;
                *request_len += used as u64;
                if scan.done {
                    *msg = MsgState::Complete;
                } else if used == avail {
                    // Everything mapped and buffered has been scanned;
                    // either the window or the data ran out.
                    if consumed + used as u64 >= end {
                        return Ok(());
                    }
                }
            }
        }
    }
}

enum BodyFraming {
    None,
    Length(u64),
    Chunked,
}

fn body_framing(headers: &[httparse::Header<'_>]) -> Result<BodyFraming, FramingError> {
    let mut framing = BodyFraming::None;
    for h in headers {
        if h.name.eq_ignore_ascii_case("upgrade") {
            return Err(FramingError::Upgrade);
        } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
            let value =
                std::str::from_utf8(h.value).map_err(|_| FramingError::Protocol("bad header"))?;
            if value
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
            {
                framing = BodyFraming::Chunked;
            }
        } else if h.name.eq_ignore_ascii_case("content-length") {
            let n: u64 = std::str::from_utf8(h.value)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .ok_or(FramingError::Protocol("bad content-length"))?;
            if !matches!(framing, BodyFraming::Chunked) {
                framing = BodyFraming::Length(n);
            }
        }
    }
    Ok(framing)
}

/// Incremental scanner for the chunked transfer coding, trailers included.
struct ChunkScanner {
    state: ChunkState,
    size: u64,
    done: bool,
}

enum ChunkState {
    Size { any_digit: bool },
    SizeExt,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    TrailerStart,
    TrailerField,
    TrailerLf,
    FinalLf,
}

impl ChunkScanner {
    fn new() -> ChunkScanner {
        ChunkScanner {
            state: ChunkState::Size { any_digit: false },
            size: 0,
            done: false,
        }
    }

    /// Scan as much of `input` as possible; returns the number of bytes
    /// consumed (all of them unless the coding ends inside `input`).
    fn feed(&mut self, input: &[u8]) -> Result<usize, FramingError> {
        let mut i = 0;
        while i < input.len() && !self.done {
            let b = input[i];
            match &mut self.state {
                ChunkState::Size { any_digit } => match b {
                    b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                        let digit = (b as char).to_digit(16).unwrap_or(0) as u64;
                        self.size = self
                            .size
                            .checked_mul(16)
                            .and_then(|s| s.checked_add(digit))
                            .ok_or(FramingError::Protocol("chunk size overflow"))?;
                        *any_digit = true;
                        i += 1;
                    }
                    b';' if *any_digit => {
                        self.state = ChunkState::SizeExt;
                        i += 1;
                    }
                    b'\r' if *any_digit => {
                        self.state = ChunkState::SizeLf;
                        i += 1;
                    }
                    _ => return Err(FramingError::Protocol("bad chunk size")),
                },
                ChunkState::SizeExt => {
                    if b == b'\r' {
                        self.state = ChunkState::SizeLf;
                    }
                    i += 1;
                }
                ChunkState::SizeLf => {
                    if b != b'\n' {
                        return Err(FramingError::Protocol("bad chunk size line"));
                    }
                    i += 1;
                    self.state = if self.size == 0 {
                        ChunkState::TrailerStart
                    } else {
                        ChunkState::Data
                    };
                }
                ChunkState::Data => {
                    let take = std::cmp::min(self.size, (input.len() - i) as u64);
                    self.size -= take;
                    i += take as usize;
                    if self.size == 0 {
                        self.state = ChunkState::DataCr;
                    }
                }
                ChunkState::DataCr => {
                    if b != b'\r' {
                        return Err(FramingError::Protocol("missing CR after chunk data"));
                    }
                    i += 1;
                    self.state = ChunkState::DataLf;
                }
                ChunkState::DataLf => {
                    if b != b'\n' {
                        return Err(FramingError::Protocol("missing LF after chunk data"));
                    }
                    i += 1;
                    self.state = ChunkState::Size { any_digit: false };
                }
                ChunkState::TrailerStart => {
                    if b == b'\r' {
                        self.state = ChunkState::FinalLf;
                    } else {
                        self.state = ChunkState::TrailerField;
                    }
                    i += 1;
                }
                ChunkState::TrailerField => {
                    if b == b'\r' {
                        self.state = ChunkState::TrailerLf;
                    }
                    i += 1;
                }
                ChunkState::TrailerLf => {
                    if b != b'\n' {
                        return Err(FramingError::Protocol("bad trailer line"));
                    }
                    i += 1;
                    self.state = ChunkState::TrailerStart;
                }
                ChunkState::FinalLf => {
                    if b != b'\n' {
                        return Err(FramingError::Protocol("bad chunked terminator"));
                    }
                    i += 1;
                    self.done = true;
                }
            }
        }
        Ok(i)
    }
}

/// Keep-alive detection over the first bytes of an outgoing response.
struct RespParser {
    acc: Vec<u8>,
    keep_alive: bool,
    settled: bool,
}

impl RespParser {
    fn new() -> RespParser {
        RespParser {
            acc: Vec::new(),
            keep_alive: false,
            settled: false,
        }
    }

    fn prepare(&mut self) {
        self.acc.clear();
        self.keep_alive = false;
        self.settled = false;
    }

    fn observe(&mut self, chunk: &[u8]) {
        if self.settled {
            return;
        }
        let room = MAX_RESPONSE_HEADERS.saturating_sub(self.acc.len());
        self.acc
            .extend_from_slice(&chunk[..std::cmp::min(room, chunk.len())]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);
        match resp.parse(&self.acc) {
            Ok(httparse::Status::Complete(_)) => {
                self.keep_alive = should_keep_alive(resp.version, resp.headers);
                self.settled = true;
            }
            Ok(httparse::Status::Partial) => {
                if self.acc.len() >= MAX_RESPONSE_HEADERS {
                    self.settled = true;
                }
            }
            Err(_) => self.settled = true,
        }
    }
}

/// HTTP/1.1 defaults to keep-alive unless `Connection: close`; HTTP/1.0
/// only keeps the connection on an explicit `Connection: keep-alive`.
fn should_keep_alive(version: Option<u8>, headers: &[httparse::Header<'_>]) -> bool {
    let mut close = false;
    let mut keep = false;
    for h in headers {
        if h.name.eq_ignore_ascii_case("connection") {
            if let Ok(value) = std::str::from_utf8(h.value) {
                for token in value.split(',') {
                    let token = token.trim();
                    if token.eq_ignore_ascii_case("close") {
                        close = true;
                    } else if token.eq_ignore_ascii_case("keep-alive") {
                        keep = true;
                    }
                }
            }
        }
    }
    match version {
        Some(1) => !close,
        _ => keep,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(bytes: &[u8]) -> ShmBuffer {
        let mut buf = ShmBuffer::open(None, true).unwrap();
        buf.reset_defaults(REQUEST_CHUNK).unwrap();
        append(&mut buf, bytes);
        buf
    }

    fn append(buf: &mut ShmBuffer, bytes: &[u8]) {
        let mut pos = buf.data_size();
        let mut rest = bytes;
        while !rest.is_empty() {
            buf.seek(pos, REQUEST_CHUNK).unwrap();
            let window = buf.remaining_mut();
            let n = std::cmp::min(window.len(), rest.len());
            window[..n].copy_from_slice(&rest[..n]);
            pos += n as u64;
            rest = &rest[n..];
        }
        buf.set_data_size(pos);
    }

    #[test]
    fn frames_request_without_body() {
        let mut buf = buffer_with(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut f = HttpPipelining::new();
        f.parse_request(&mut buf).unwrap();
        let span = f.request().unwrap();
        assert_eq!(span.pos, 0);
        assert_eq!(span.len, buf.data_size());
    }

    #[test]
    fn frames_content_length_body_incrementally() {
        let head = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n";
        let mut buf = buffer_with(head);
        let mut f = HttpPipelining::new();
        f.parse_request(&mut buf).unwrap();
        assert!(f.request().is_none());

        append(&mut buf, b"he");
        f.parse_request(&mut buf).unwrap();
        assert!(f.request().is_none());

        append(&mut buf, b"llo");
        f.parse_request(&mut buf).unwrap();
        let span = f.request().unwrap();
        assert_eq!(span.len, head.len() as u64 + 5);
    }

    #[test]
    fn frames_pipelined_requests_one_at_a_time() {
        let first = b"GET /1 HTTP/1.1\r\n\r\n";
        let second = b"GET /2 HTTP/1.1\r\n\r\n";
        let mut all = first.to_vec();
        all.extend_from_slice(second);
        let mut buf = buffer_with(&all);

        let mut f = HttpPipelining::new();
        f.parse_request(&mut buf).unwrap();
        let span = f.request().unwrap();
        assert_eq!((span.pos, span.len), (0, first.len() as u64));

        // The follow-up stays unparsed until the first is answered.
        f.advance_past_request();
        assert!(f.request().is_none());
        assert_eq!(f.parse_pos(), first.len() as u64);

        f.parse_request(&mut buf).unwrap();
        let span = f.request().unwrap();
        assert_eq!((span.pos, span.len), (first.len() as u64, second.len() as u64));
    }

    #[test]
    fn frames_chunked_body() {
        let msg = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                    4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut buf = buffer_with(msg);
        let mut f = HttpPipelining::new();
        f.parse_request(&mut buf).unwrap();
        let span = f.request().unwrap();
        assert_eq!(span.len, msg.len() as u64);
    }

    #[test]
    fn chunked_with_trailers_and_split_feeds() {
        let mut scan = ChunkScanner::new();
        let coded = b"a;note=1\r\n0123456789\r\n0\r\nX-Sum: 1\r\n\r\n";
        let mut fed = 0;
        for piece in coded.chunks(3) {
            fed += scan.feed(piece).unwrap();
        }
        assert!(scan.done);
        assert_eq!(fed, coded.len());
    }

    #[test]
    fn upgrade_closes_connection() {
        let mut buf =
            buffer_with(b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n");
        let mut f = HttpPipelining::new();
        match f.parse_request(&mut buf) {
            Err(FramingError::Upgrade) => {}
            other => panic!("expected upgrade error, got {other:?}"),
        }
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let mut buf = buffer_with(b"\0\0\0\0garbage\r\n\r\n");
        let mut f = HttpPipelining::new();
        assert!(f.parse_request(&mut buf).is_err());
    }

    #[test]
    fn single_refuses_pipelining() {
        let mut buf = buffer_with(b"GET /1 HTTP/1.1\r\n\r\n");
        let mut f = HttpSingle::new();
        f.parse_request(&mut buf).unwrap();
        assert!(f.request().is_some());

        append(&mut buf, b"GET /2 HTTP/1.1\r\n\r\n");
        assert!(f.parse_request(&mut buf).is_err());
    }

    #[test]
    fn keep_alive_matrix() {
        let cases: &[(&[u8], bool)] = &[
            (b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", true),
            (
                b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
                false,
            ),
            (b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n", false),
            (
                b"HTTP/1.0 200 OK\r\nConnection: keep-alive\r\nContent-Length: 0\r\n\r\n",
                true,
            ),
        ];
        for (bytes, expect) in cases {
            let mut f = HttpPipelining::new();
            f.prepare_for_response();
            // Feed a byte at a time: detection must cope with any chunking.
            for b in bytes.iter() {
                f.parse_response(std::slice::from_ref(b));
            }
            assert_eq!(f.keep_alive(), *expect, "case {:?}", std::str::from_utf8(bytes));
        }
    }
}
