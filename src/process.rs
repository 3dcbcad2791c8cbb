//! Host-side handle on an in-container process.
//!
//! Built from the descriptor set a Run or Attach response carries. Three
//! copier threads bridge the remote descriptors to the caller's streams; the
//! two output copiers form the completion latch that [`Process::wait`]
//! blocks on. The stdin copier is deliberately excluded from that latch: a
//! caller's stdin may never close, and that must not stall `wait`.

use crate::error::{Error, Result};
use crate::wshd::{check_rights, Wshd};
use garden_protocol::{FdRights, Signal, TtySpec};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Caller-supplied streams to wire to a process's stdio.
#[derive(Default)]
pub struct ProcessIo {
    /// Stream copied into the process's stdin until EOF.
    pub stdin: Option<Box<dyn Read + Send>>,
    /// Sink for the process's stdout.
    pub stdout: Option<Box<dyn Write + Send>>,
    /// Sink for the process's stderr. Never written in TTY mode.
    pub stderr: Option<Box<dyn Write + Send>>,
}

/// A running (or exited, not yet waited) in-container process.
#[derive(Debug)]
pub struct Process {
    id: u32,
    status: Option<File>,
    copiers: Vec<JoinHandle<()>>,
    wshd: Wshd,
}

impl Process {
    /// The agent-assigned process ID, stable across attaches.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Block until stdout and stderr (when present) have drained, then read
    /// the exit status off the status pipe.
    pub fn wait(&mut self) -> Result<i32> {
        for copier in self.copiers.drain(..) {
            let _ = copier.join();
        }

        let mut status = self
            .status
            .take()
            .ok_or_else(|| Error::protocol("process already waited"))?;

        let mut line = String::new();
        status.read_to_string(&mut line)?;

        line.trim()
            .parse()
            .map_err(|_| Error::protocol(format!("malformed exit status: {:?}", line)))
    }

    /// Deliver a portable signal to the process.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        self.wshd.signal(self.id, signal)
    }

    /// Resize the process's terminal.
    pub fn set_tty(&self, tty: TtySpec) -> Result<()> {
        self.wshd.set_window_size(self.id, tty.columns, tty.rows)
    }
}

/// Pair received descriptors with their slots and start the copier threads.
pub(crate) fn attach_process(
    id: u32,
    rights: FdRights,
    fds: Vec<OwnedFd>,
    io: ProcessIo,
    wshd: Wshd,
) -> Result<Process> {
    check_rights(rights, &fds)?;

    let offsets = rights.offsets();
    let mut slots: Vec<Option<OwnedFd>> = fds.into_iter().map(Some).collect();
    let mut file_at =
        |offset: Option<usize>| offset.map(|i| File::from(slots[i].take().expect("slot reused")));

    let status = file_at(offsets.status)
        .ok_or_else(|| Error::protocol("response carried no status descriptor"))?;
    let stdin = file_at(offsets.stdin);
    let stdout = file_at(offsets.stdout);
    let stderr = file_at(offsets.stderr);

    // Copier failures are expected noise at teardown (reads and writes race
    // descriptor closure), so they are swallowed; wait depends on EOF, not
    // on error propagation.

    if let (Some(mut remote_stdin), Some(mut caller_stdin)) = (stdin, io.stdin) {
        let wshd = wshd.clone();
        thread::spawn(move || {
            let _ = io::copy(&mut caller_stdin, &mut remote_stdin);
            drop(remote_stdin);
            // The supervisor still holds its own write end; retire it so the
            // process can observe EOF.
            if let Err(e) = wshd.close_stdin(id) {
                debug!(process_id = id, error = %e, "close stdin failed");
            }
        });
    }

    let mut copiers = Vec::new();

    if let Some(mut remote_stdout) = stdout {
        let mut sink: Box<dyn Write + Send> = io.stdout.unwrap_or_else(|| Box::new(io::sink()));
        copiers.push(thread::spawn(move || {
            let _ = io::copy(&mut remote_stdout, &mut sink);
        }));
    }

    if let Some(mut remote_stderr) = stderr {
        let mut sink: Box<dyn Write + Send> = io.stderr.unwrap_or_else(|| Box::new(io::sink()));
        copiers.push(thread::spawn(move || {
            let _ = io::copy(&mut remote_stderr, &mut sink);
        }));
    }

    Ok(Process {
        id,
        status: Some(status),
        copiers,
        wshd,
    })
}
