//! Worker-side request loop.
//!
//! Workers are plain synchronous processes: read one command line from
//! stdin, map the referenced shared-memory regions, run the handler,
//! report the response line on stdout. Signals raise the interruption
//! flag; the read is done with raw `read(2)` so a signal interrupts it
//! instead of being swallowed by an automatic retry.

use std::io::{self, Write};

use pruv_shm::{ShmBuffer, ShmCache, REQUEST_CHUNK, RESPONSE_CHUNK};

use crate::termination::{self, Interruption};
use crate::wire;

/// Commands from the dispatcher fit in 256 bytes, but leave headroom for
/// protocol growth.
const MAX_LINE: usize = 1024;

/// The user hook: turn one request into one response.
///
/// `request` is the raw message, mapped contiguously. The response goes
/// into `response`: write the bytes and leave `data_size` set to the
/// response length.
pub trait RequestHandler {
    fn handle(&mut self, request: &mut [u8], response: &mut ShmBuffer) -> io::Result<()>;
}

impl<F> RequestHandler for F
where
    F: FnMut(&mut [u8], &mut ShmBuffer) -> io::Result<()>,
{
    fn handle(&mut self, request: &mut [u8], response: &mut ShmBuffer) -> io::Result<()> {
        self(request, response)
    }
}

extern "C" fn on_signal(sig: libc::c_int) {
    let level = if sig == libc::SIGINT {
        Interruption::Int
    } else {
        Interruption::Term
    };
    termination::raise(level);
}

/// Install signal handlers and the parent-death signal. Returns an error
/// when the process is already orphaned.
pub fn setup() -> io::Result<()> {
    // SAFETY: sigaction with a handler that only touches one atomic.
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = on_signal as usize;
        libc::sigemptyset(&mut act.sa_mask);
        // No SA_RESTART: the blocking read must see EINTR.
        act.sa_flags = 0;
        for sig in [libc::SIGTERM, libc::SIGINT, libc::SIGHUP] {
            if libc::sigaction(sig, &act, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    // The dispatcher died between fork and prctl.
    // SAFETY: getppid has no failure modes.
    if unsafe { libc::getppid() } == 1 {
        return Err(io::Error::other("orphaned at start"));
    }
    Ok(())
}

pub struct WorkerLoop<H> {
    handler: H,
    in_cache: ShmCache,
    out_cache: ShmCache,
    line: [u8; MAX_LINE],
}

impl<H: RequestHandler> WorkerLoop<H> {
    pub fn new(handler: H) -> WorkerLoop<H> {
        WorkerLoop {
            handler,
            in_cache: ShmCache::new(),
            out_cache: ShmCache::new(),
            line: [0; MAX_LINE],
        }
    }

    /// Serve requests until the dispatcher closes the pipe or a
    /// termination signal arrives. Returns the process exit code.
    pub fn run(&mut self) -> i32 {
        loop {
            let cmd = match self.next_command() {
                Ok(Some(cmd)) => cmd,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "reading command failed");
                    return 1;
                }
            };
            if let Err(e) = self.serve(&cmd) {
                tracing::error!(error = %e, "request failed");
                return 1;
            }
            match termination::current() {
                Interruption::Term => break,
                // The interrupted request's response was still sent;
                // lower the flag and keep serving.
                Interruption::Int => termination::clear(),
                Interruption::None => {}
            }
        }
        tracing::info!("terminated");
        0
    }

    /// Read and parse one command line. `Ok(None)` means clean shutdown:
    /// the pipe closed or a signal arrived while waiting.
    fn next_command(&mut self) -> io::Result<Option<wire::Command>> {
        let Some(len) = self.read_line()? else {
            return Ok(None);
        };
        let text = std::str::from_utf8(&self.line[..len])
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "command is not UTF-8"))?;
        let cmd = wire::Command::parse(text)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(cmd))
    }

    /// Read bytes from fd 0 until a newline, at most [`MAX_LINE`] bytes.
    fn read_line(&mut self) -> io::Result<Option<usize>> {
        let mut len = 0usize;
        while !termination::requested() {
            // SAFETY: reading into our own buffer within its bounds.
            let r = unsafe {
                libc::read(
                    libc::STDIN_FILENO,
                    self.line[len..].as_mut_ptr() as *mut libc::c_void,
                    MAX_LINE - len,
                )
            };
            if r < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if r == 0 {
                // Dispatcher closed our stdin: no more work.
                return Ok(None);
            }
            let new_len = len + r as usize;
            if let Some(pos) = self.line[len..new_len].iter().position(|&b| b == b'\n') {
                return Ok(Some(len + pos));
            }
            len = new_len;
            if len >= MAX_LINE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "input line too long",
                ));
            }
        }
        Ok(None)
    }

    fn serve(&mut self, cmd: &wire::Command) -> io::Result<()> {
        let WorkerLoop {
            handler,
            in_cache,
            out_cache,
            ..
        } = self;

        let in_buf = in_cache.get(&cmd.in_name)?;
        in_buf.ensure_span(cmd.pos, cmd.len)?;

        let out_buf = out_cache.get(&cmd.out_name)?;
        out_buf.update_file_size(cmd.out_file_size);

        let request = &mut in_buf.remaining_mut()[..cmd.len as usize];
        handler.handle(request, out_buf)?;

        // Release address space an oversized response claimed, but keep
        // the descriptor cached.
        if out_buf.window_len() > RESPONSE_CHUNK {
            out_buf.unmap()?;
        }

        let report = wire::Response {
            len: out_buf.data_size(),
            file_size: out_buf.file_size(),
        };
        let mut stdout = io::stdout().lock();
        stdout.write_all(&report.format())?;
        stdout.flush()?;

        if in_buf.window_offset() + in_buf.window_len() as u64 > REQUEST_CHUNK as u64 {
            in_buf.unmap()?;
        }
        Ok(())
    }
}
