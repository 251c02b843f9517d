//! Binary length-prefixed framings used by the end-to-end tests.
//!
//! Every test message starts with a little-endian `u64` length field,
//! followed by a protocol-specific rest of the header, followed by the
//! body the length field counts. The keep-alive decision comes from a
//! flag inside the request header rather than from the response bytes.

use pruv::framing::{Framing, FramingError, RequestSpan};
use pruv_shm::{ShmBuffer, REQUEST_CHUNK, RESPONSE_CHUNK};

use crate::xor_cascade_response;

/// Where the keep-alive flag lives inside the message header.
#[derive(Debug, Clone, Copy)]
pub enum KeepAliveField {
    U64At(usize),
    ByteAt(usize),
}

/// Framing for messages of the form
/// `[u64 body_len][extra_header bytes][body_len bytes]`.
pub struct LengthPrefixed {
    extra_header: u64,
    keep_at: KeepAliveField,
    request_pos: u64,
    request_len: u64,
    total: Option<u64>,
    keep_alive: bool,
}

impl LengthPrefixed {
    pub fn new(extra_header: u64, keep_at: KeepAliveField) -> LengthPrefixed {
        assert!(8 + extra_header <= 32, "header fits the scratch buffer");
        LengthPrefixed {
            extra_header,
            keep_at,
            request_pos: 0,
            request_len: 0,
            total: None,
            keep_alive: false,
        }
    }

    fn header_len(&self) -> u64 {
        8 + self.extra_header
    }
}

/// Copy `out.len()` bytes starting at `pos`, window by window.
fn read_bytes(buf: &mut ShmBuffer, mut pos: u64, out: &mut [u8]) -> std::io::Result<()> {
    let mut done = 0;
    while done < out.len() {
        buf.seek(pos, REQUEST_CHUNK)?;
        let window = buf.remaining();
        let n = std::cmp::min(window.len(), out.len() - done);
        out[done..done + n].copy_from_slice(&window[..n]);
        pos += n as u64;
        done += n;
    }
    Ok(())
}

impl Framing for LengthPrefixed {
    fn protocol(&self) -> &'static str {
        "TEST"
    }

    fn parse_request(&mut self, buf: &mut ShmBuffer) -> Result<(), FramingError> {
        let have = buf.data_size() - self.request_pos;
        if self.total.is_none() {
            if have < self.header_len() {
                return Ok(());
            }
            let mut header = [0u8; 32];
            let header_len = self.header_len() as usize;
            read_bytes(buf, self.request_pos, &mut header[..header_len])?;
            let body_len = u64::from_le_bytes(
                header[..8].try_into().expect("eight bytes"),
            );
            self.keep_alive = match self.keep_at {
                KeepAliveField::U64At(at) => {
                    u64::from_le_bytes(header[at..at + 8].try_into().expect("eight bytes")) != 0
                }
                KeepAliveField::ByteAt(at) => header[at] != 0,
            };
            self.total = Some(self.header_len() + body_len);
        }
        if let Some(total) = self.total {
            self.request_len = std::cmp::min(have, total);
        }
        Ok(())
    }

    fn request(&self) -> Option<RequestSpan> {
        match self.total {
            Some(total) if self.request_len == total => Some(RequestSpan {
                pos: self.request_pos,
                len: total,
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
        self.total = None;
    }

    fn on_buffer_released(&mut self) {
        self.request_pos = 0;
        self.request_len = 0;
        self.total = None;
    }

    // The suite sends messages past the HTTP limit on purpose.
    fn max_buffered(&self) -> u64 {
        u64::MAX
    }

    fn prepare_for_response(&mut self) {}

    fn parse_response(&mut self, _chunk: &[u8]) {}

    fn keep_alive(&self) -> bool {
        self.keep_alive
    }
}

/// The cascading-xor protocol answered by the dispatcher itself, without
/// any worker round-trip.
pub struct XorCascadeInplace {
    inner: LengthPrefixed,
}

impl XorCascadeInplace {
    pub fn new() -> XorCascadeInplace {
        XorCascadeInplace {
            inner: LengthPrefixed::new(1, KeepAliveField::ByteAt(8)),
        }
    }
}

impl Default for XorCascadeInplace {
    fn default() -> Self {
        Self::new()
    }
}

impl Framing for XorCascadeInplace {
    fn protocol(&self) -> &'static str {
        self.inner.protocol()
    }

    fn parse_request(&mut self, buf: &mut ShmBuffer) -> Result<(), FramingError> {
        self.inner.parse_request(buf)
    }

    fn request(&self) -> Option<RequestSpan> {
        self.inner.request()
    }

    fn parse_pos(&self) -> u64 {
        self.inner.parse_pos()
    }

    fn advance_past_request(&mut self) {
        self.inner.advance_past_request()
    }

    fn on_buffer_released(&mut self) {
        self.inner.on_buffer_released()
    }

    fn max_buffered(&self) -> u64 {
        self.inner.max_buffered()
    }

    fn wants_inplace(&self) -> bool {
        true
    }

    fn inplace_response(
        &mut self,
        span: RequestSpan,
        input: &mut ShmBuffer,
        out: &mut ShmBuffer,
    ) -> Result<(), FramingError> {
        input.ensure_span(span.pos, span.len)?;
        let message = &input.remaining()[..span.len as usize];
        let keep = message[8];
        let body = &message[9..];
        let response = xor_cascade_response(body, keep);
        out.set_data_size(0);
        out.append(&response, RESPONSE_CHUNK)?;
        Ok(())
    }

    fn prepare_for_response(&mut self) {}

    fn parse_response(&mut self, _chunk: &[u8]) {}

    fn keep_alive(&self) -> bool {
        self.inner.keep_alive()
    }
}
