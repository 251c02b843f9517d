//! Worker-side HTTP: request parsing and response building.
//!
//! The dispatcher only forwards complete messages, so the request span is
//! parsed in one go. Responses are streamed into the shared-memory buffer
//! window by window; `Content-Length` is reserved up front and patched
//! once the body size is known.

use std::io;

use pruv_shm::{ShmBuffer, RESPONSE_CHUNK};

const MAX_HEADERS: usize = 64;
/// Reserved digits for the deferred Content-Length value.
const LENGTH_FIELD: usize = 20;

/// A parsed request, borrowing from the mapped request span.
pub struct HttpRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub version: u8,
    pub keep_alive: bool,
    pub body: &'a [u8],
    headers: Vec<(&'a str, &'a [u8])>,
}

impl<'a> HttpRequest<'a> {
    pub fn parse(bytes: &'a [u8]) -> io::Result<HttpRequest<'a>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let header_len = match req.parse(bytes) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "truncated request",
                ))
            }
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
        };
        let (method, path, version) = match (req.method, req.path, req.version) {
            (Some(m), Some(p), Some(v)) => (m, p, v),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "incomplete request line",
                ))
            }
        };
        let headers: Vec<(&str, &[u8])> = req
            .headers
            .iter()
            .map(|h| (h.name, h.value))
            .collect();

        let mut close = false;
        let mut keep = false;
        for (name, value) in &headers {
            if name.eq_ignore_ascii_case("connection") {
                if let Ok(value) = std::str::from_utf8(value) {
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
        let keep_alive = if version == 1 { !close } else { keep };

        Ok(HttpRequest {
            method,
            path,
            version,
            keep_alive,
            body: &bytes[header_len..],
            headers,
        })
    }

    pub fn header(&self, name: &str) -> Option<&'a [u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, v)| v)
    }
}

/// Streams an HTTP response into a shared-memory buffer.
///
/// Call order: [`status_line`](ResponseWriter::status_line), any number of
/// [`header`](ResponseWriter::header)s, [`begin_body`], then
/// [`body`](ResponseWriter::body) chunks, then [`finish`].
///
/// [`begin_body`]: ResponseWriter::begin_body
/// [`finish`]: ResponseWriter::finish
pub struct ResponseWriter<'a> {
    buf: &'a mut ShmBuffer,
    body_start: u64,
}

impl<'a> ResponseWriter<'a> {
    pub fn new(buf: &'a mut ShmBuffer) -> ResponseWriter<'a> {
        buf.set_data_size(0);
        ResponseWriter { buf, body_start: 0 }
    }

    pub fn status_line(&mut self, line: &str) -> io::Result<()> {
        self.write(line.as_bytes())?;
        self.write(b"\r\n")
    }

    pub fn header(&mut self, name: &str, value: &str) -> io::Result<()> {
        self.write(name.as_bytes())?;
        self.write(b": ")?;
        self.write(value.as_bytes())?;
        self.write(b"\r\n")
    }

    /// Close the header block, reserving room for `Content-Length`.
    pub fn begin_body(&mut self) -> io::Result<()> {
        self.write(b"Content-Length: ")?;
        self.write(&[b' '; LENGTH_FIELD])?;
        self.write(b"\r\n\r\n")?;
        self.body_start = self.buf.data_size();
        Ok(())
    }

    pub fn body(&mut self, data: &[u8]) -> io::Result<()> {
        self.write(data)
    }

    /// Patch the reserved `Content-Length` with the actual body size.
    pub fn finish(&mut self) -> io::Result<()> {
        let content_length = self.buf.data_size() - self.body_start;
        let digits = content_length.to_string();
        // The reserved field sits LENGTH_FIELD + 4 bytes before the body
        // ("<spaces>\r\n\r\n").
        let patch_pos = self.body_start - (LENGTH_FIELD as u64 + 4);
        let mut written = 0;
        while written < digits.len() {
            self.buf.seek(patch_pos + written as u64, RESPONSE_CHUNK)?;
            let window = self.buf.remaining_mut();
            let n = std::cmp::min(window.len(), digits.len() - written);
            window[..n].copy_from_slice(&digits.as_bytes()[written..written + n]);
            written += n;
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.buf.append(data, RESPONSE_CHUNK)
    }
}

/// The canned failure answer for unparseable or interrupted requests.
pub fn write_error_response(buf: &mut ShmBuffer) -> io::Result<()> {
    const RESPONSE: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\
        Content-Length: 14\r\n\
        Content-Type: text/html; charset=utf-8\r\n\
        Connection: close\r\n\
        \r\n\
        Bad Request!\r\n";
    buf.set_data_size(0);
    buf.append(RESPONSE, RESPONSE_CHUNK)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_back(buf: &mut ShmBuffer) -> Vec<u8> {
        let mut out = Vec::new();
        let mut pos = 0u64;
        while pos < buf.data_size() {
            buf.seek(pos, RESPONSE_CHUNK).unwrap();
            let avail =
                std::cmp::min(buf.remaining().len() as u64, buf.data_size() - pos) as usize;
            out.extend_from_slice(&buf.remaining()[..avail]);
            pos += avail as u64;
        }
        out
    }

    #[test]
    fn parses_request_with_headers_and_body() {
        let bytes = b"POST /items?id=1 HTTP/1.1\r\n\
            Host: localhost\r\n\
            Content-Length: 4\r\n\
            \r\n\
            data";
        let req = HttpRequest::parse(bytes).unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/items?id=1");
        assert_eq!(req.version, 1);
        assert!(req.keep_alive);
        assert_eq!(req.header("host"), Some(&b"localhost"[..]));
        assert_eq!(req.body, b"data");
    }

    #[test]
    fn connection_close_disables_keep_alive() {
        let bytes = b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n";
        let req = HttpRequest::parse(bytes).unwrap();
        assert!(!req.keep_alive);
    }

    #[test]
    fn writer_emits_parseable_response_with_patched_length() {
        let mut buf = ShmBuffer::open(None, true).unwrap();
        buf.reset_defaults(RESPONSE_CHUNK).unwrap();

        let mut w = ResponseWriter::new(&mut buf);
        w.status_line("HTTP/1.1 200 OK").unwrap();
        w.header("Content-Type", "text/html; charset=utf-8").unwrap();
        w.begin_body().unwrap();
        w.body(b"hello ").unwrap();
        w.body(b"world").unwrap();
        w.finish().unwrap();

        let bytes = read_back(&mut buf);
        let mut headers = [httparse::EMPTY_HEADER; 8];
        let mut resp = httparse::Response::new(&mut headers);
        let header_len = match resp.parse(&bytes).unwrap() {
            httparse::Status::Complete(n) => n,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(resp.code, Some(200));
        let cl = resp
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("content-length"))
            .unwrap();
        let cl: usize = std::str::from_utf8(cl.value).unwrap().trim().parse().unwrap();
        assert_eq!(cl, 11);
        assert_eq!(&bytes[header_len..], b"hello world");
    }

    #[test]
    fn writer_handles_body_larger_than_one_window() {
        let mut buf = ShmBuffer::open(None, true).unwrap();
        buf.reset_defaults(RESPONSE_CHUNK).unwrap();

        let body: Vec<u8> = (0..3 * RESPONSE_CHUNK).map(|i| (i % 251) as u8).collect();
        let mut w = ResponseWriter::new(&mut buf);
        w.status_line("HTTP/1.1 200 OK").unwrap();
        w.begin_body().unwrap();
        w.body(&body).unwrap();
        w.finish().unwrap();

        let bytes = read_back(&mut buf);
        let text_len = bytes.len() - body.len();
        assert!(std::str::from_utf8(&bytes[..text_len]).is_ok());
        assert!(String::from_utf8_lossy(&bytes[..text_len])
            .contains(&format!("Content-Length: {}", body.len())));
        assert_eq!(&bytes[text_len..], &body[..]);
    }

    #[test]
    fn error_response_is_well_formed() {
        let mut buf = ShmBuffer::open(None, true).unwrap();
        buf.reset_defaults(RESPONSE_CHUNK).unwrap();
        write_error_response(&mut buf).unwrap();
        let bytes = read_back(&mut buf);
        assert!(bytes.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
        assert!(bytes.ends_with(b"Bad Request!\r\n"));
        assert_eq!(buf.data_size(), bytes.len() as u64);
    }
}
