//! Control-pipe line protocol between the dispatcher and its workers.
//!
//! Both directions are single ASCII lines terminated by `'\n'`:
//!
//! ```text
//! <PROTO> IN SHM <name_in> <pos>, <size> OUT SHM <name_out> <file_size>\n
//! RESP <resp_len> of <resp_file_size> END\n
//! ```
//!
//! A command line longer than [`MAX_COMMAND_LINE`] cannot be sent; an
//! unparseable response line is a fatal protocol error for the worker.

use std::fmt;
use std::io::Write;

/// Hard limit on a dispatcher-to-worker command line, newline included.
pub const MAX_COMMAND_LINE: usize = 256;

#[derive(Debug, PartialEq, Eq)]
pub enum WireError {
    /// Command did not fit in [`MAX_COMMAND_LINE`] bytes.
    CommandTooLong,
    /// Line structure did not match the protocol.
    Malformed,
    /// A numeric field failed to parse.
    BadNumber,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::CommandTooLong => write!(f, "command line exceeds {MAX_COMMAND_LINE} bytes"),
            WireError::Malformed => write!(f, "malformed control line"),
            WireError::BadNumber => write!(f, "bad numeric field in control line"),
        }
    }
}

impl std::error::Error for WireError {}

/// One unit of work, as sent to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub protocol: String,
    pub in_name: String,
    /// Offset of the request inside the in-buffer (pipelining).
    pub pos: u64,
    pub len: u64,
    pub out_name: String,
    /// Current size of the out-buffer, so the worker can skip ftruncate
    /// when the response fits.
    pub out_file_size: u64,
}

impl Command {
    /// Render the command line, newline included.
    pub fn format(&self) -> Result<Vec<u8>, WireError> {
        let mut line = Vec::with_capacity(MAX_COMMAND_LINE);
        writeln!(
            line,
            "{} IN SHM {} {}, {} OUT SHM {} {}",
            self.protocol, self.in_name, self.pos, self.len, self.out_name, self.out_file_size
        )
        .map_err(|_| WireError::Malformed)?;
        if line.len() > MAX_COMMAND_LINE {
            return Err(WireError::CommandTooLong);
        }
        Ok(line)
    }

    /// Parse a command line (without the trailing newline).
    pub fn parse(line: &str) -> Result<Command, WireError> {
        let mut it = line.split_ascii_whitespace();
        let protocol = it.next().ok_or(WireError::Malformed)?;
        expect(&mut it, "IN")?;
        expect(&mut it, "SHM")?;
        let in_name = it.next().ok_or(WireError::Malformed)?;
        let pos = it
            .next()
            .and_then(|t| t.strip_suffix(','))
            .ok_or(WireError::Malformed)?;
        let len = it.next().ok_or(WireError::Malformed)?;
        expect(&mut it, "OUT")?;
        expect(&mut it, "SHM")?;
        let out_name = it.next().ok_or(WireError::Malformed)?;
        let out_file_size = it.next().ok_or(WireError::Malformed)?;
        if it.next().is_some() {
            return Err(WireError::Malformed);
        }
        Ok(Command {
            protocol: protocol.to_owned(),
            in_name: in_name.to_owned(),
            pos: parse_u64(pos)?,
            len: parse_u64(len)?,
            out_name: out_name.to_owned(),
            out_file_size: parse_u64(out_file_size)?,
        })
    }
}

/// Completion report, as sent back by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub len: u64,
    pub file_size: u64,
}

impl Response {
    /// Render the response line, newline included.
    pub fn format(&self) -> Vec<u8> {
        format!("RESP {} of {} END\n", self.len, self.file_size).into_bytes()
    }

    /// Parse a response line (without the trailing newline).
    pub fn parse(line: &str) -> Result<Response, WireError> {
        let mut it = line.split_ascii_whitespace();
        expect(&mut it, "RESP")?;
        let len = it.next().ok_or(WireError::Malformed)?;
        expect(&mut it, "of")?;
        let file_size = it.next().ok_or(WireError::Malformed)?;
        expect(&mut it, "END")?;
        if it.next().is_some() {
            return Err(WireError::Malformed);
        }
        Ok(Response {
            len: parse_u64(len)?,
            file_size: parse_u64(file_size)?,
        })
    }
}

fn expect<'a>(it: &mut impl Iterator<Item = &'a str>, tok: &str) -> Result<(), WireError> {
    if it.next() == Some(tok) {
        Ok(())
    } else {
        Err(WireError::Malformed)
    }
}

fn parse_u64(tok: &str) -> Result<u64, WireError> {
    tok.parse().map_err(|_| WireError::BadNumber)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trip() {
        let cmd = Command {
            protocol: "HTTP".into(),
            in_name: "/pruv-shm-0123456789abcdef0123456789abcdef".into(),
            pos: 65536,
            len: 1234,
            out_name: "/pruv-shm-fedcba9876543210fedcba9876543210".into(),
            out_file_size: 131072,
        };
        let line = cmd.format().unwrap();
        assert_eq!(
            line,
            b"HTTP IN SHM /pruv-shm-0123456789abcdef0123456789abcdef 65536, 1234 \
              OUT SHM /pruv-shm-fedcba9876543210fedcba9876543210 131072\n"
                .to_vec()
        );
        let text = std::str::from_utf8(&line[..line.len() - 1]).unwrap();
        assert_eq!(Command::parse(text).unwrap(), cmd);
    }

    #[test]
    fn oversized_command_is_rejected() {
        let cmd = Command {
            protocol: "X".repeat(300),
            in_name: "/a".into(),
            pos: 0,
            len: 0,
            out_name: "/b".into(),
            out_file_size: 0,
        };
        assert_eq!(cmd.format().unwrap_err(), WireError::CommandTooLong);
    }

    #[test]
    fn response_round_trip() {
        let resp = Response {
            len: 42,
            file_size: 131072,
        };
        assert_eq!(resp.format(), b"RESP 42 of 131072 END\n".to_vec());
        assert_eq!(Response::parse("RESP 42 of 131072 END").unwrap(), resp);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(Command::parse("HTTP IN SHM /a 1 2 OUT SHM /b 3").is_err()); // missing comma
        assert!(Command::parse("HTTP IN /a 1, 2 OUT SHM /b 3").is_err());
        assert!(Response::parse("RESP x of 1 END").is_err());
        assert!(Response::parse("RESP 1 of 2").is_err());
        assert!(Response::parse("RESP 1 of 2 END trailing").is_err());
        assert!(Response::parse("").is_err());
    }
}
