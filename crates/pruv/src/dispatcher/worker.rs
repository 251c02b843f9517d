//! Worker process spawning and pipe plumbing.
//!
//! A worker is an ordinary child process talking the control-line
//! protocol over its stdin/stdout. Three small tasks serve each worker:
//! a stdin writer (the asynchronous command write), a stdout reader
//! accumulating the bounded response line, and an exit watcher. All three
//! report into the engine's event channel; the engine keeps every
//! decision.

use std::io;
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::DispatcherConfig;
use crate::wire::MAX_COMMAND_LINE;

use super::{Event, PipeError, WorkerId};

pub(crate) struct SpawnedWorker {
    pub pid: u32,
    pub writer: mpsc::UnboundedSender<Vec<u8>>,
}

/// Spawn one worker with piped stdio and the parent-death signal armed,
/// and wire its pipes into the event channel.
pub(crate) fn spawn(
    id: WorkerId,
    cfg: &DispatcherConfig,
    events: mpsc::UnboundedSender<Event>,
) -> io::Result<SpawnedWorker> {
    let mut command = Command::new(&cfg.worker_executable);
    command
        .args(&cfg.worker_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    // SAFETY: prctl(PR_SET_PDEATHSIG) is async-signal-safe, fine between
    // fork and exec.
    unsafe {
        command.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = command.spawn()?;
    let pid = child
        .id()
        .ok_or_else(|| io::Error::other("spawned worker has no pid"))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::other("worker stdin not piped"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("worker stdout not piped"))?;

    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_commands(id, stdin, writer_rx, events.clone()));
    tokio::spawn(read_lines(id, stdout, events.clone()));
    tokio::spawn(async move {
        let status = child.wait().await;
        let _ = events.send(Event::WorkerExited { worker: id, status });
    });

    Ok(SpawnedWorker {
        pid,
        writer: writer_tx,
    })
}

/// Drain command lines into the worker's stdin. Dropping the sender ends
/// the task and closes the pipe, which is how an idle worker learns to
/// exit.
async fn write_commands(
    id: WorkerId,
    mut stdin: tokio::process::ChildStdin,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::UnboundedSender<Event>,
) {
    use tokio::io::AsyncWriteExt;
    while let Some(line) = rx.recv().await {
        let result = stdin.write_all(&line).await;
        let failed = result.is_err();
        if events
            .send(Event::WorkerWritten { worker: id, result })
            .is_err()
            || failed
        {
            break;
        }
    }
}

/// Accumulate newline-terminated response lines, at most
/// [`MAX_COMMAND_LINE`] bytes each, and report EOF or failure.
async fn read_lines(
    id: WorkerId,
    mut stdout: tokio::process::ChildStdout,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut acc: Vec<u8> = Vec::new();
    let mut chunk = [0u8; MAX_COMMAND_LINE];
    loop {
        let line = match stdout.read(&mut chunk).await {
            Ok(0) => Err(PipeError::Eof),
            Ok(n) => {
                acc.extend_from_slice(&chunk[..n]);
                match acc.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        let rest = acc.split_off(pos + 1);
                        let mut line = std::mem::replace(&mut acc, rest);
                        line.pop(); // strip '\n'
                        match String::from_utf8(line) {
                            Ok(line) => Ok(line),
                            Err(_) => Err(PipeError::NotUtf8),
                        }
                    }
                    None if acc.len() >= MAX_COMMAND_LINE => Err(PipeError::LineTooLong),
                    None => continue,
                }
            }
            Err(e) => Err(PipeError::Io(e)),
        };
        let stop = line.is_err();
        if events.send(Event::WorkerLine { worker: id, line }).is_err() || stop {
            break;
        }
    }
}
