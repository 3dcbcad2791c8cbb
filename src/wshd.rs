//! Host-side proxy for a container's wshd supervisor.
//!
//! Every remote operation dials a fresh connection through the bind-mounted
//! socket path, writes a single request, and reads a single response, using
//! `recvmsg` for the two response kinds that carry SCM_RIGHTS. Then it closes.
//! Failures reported by the agent surface as [`Error::Remote`]; connection
//! failures abort the one operation and are not retried.

use crate::error::{Error, Result};
use crate::process::{attach_process, Process, ProcessIo};
use garden_protocol::{
    read_frame, recv_with_fds, write_frame, FdRights, Request, Response, Signal, TtySpec,
};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Socket read timeout. Agent responses are immediate; a stall means the
/// container is gone.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Socket write timeout. Requests are a few hundred bytes.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// A process specification as accepted by [`Wshd::run`].
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// Executable path, resolved in the container via `$PATH` when it
    /// contains no `/`.
    pub path: String,
    /// Arguments, excluding `argv[0]`.
    pub args: Vec<String>,
    /// Additional environment, appended after the container's own fragment.
    pub env: Vec<(String, String)>,
    /// Working directory inside the container.
    pub dir: Option<String>,
    /// User to run as; empty means root.
    pub user: String,
    /// Attach a controlling PTY with these initial dimensions.
    pub tty: Option<TtySpec>,
}

/// Handle on one container's supervisor socket. Cheap to clone; each
/// operation opens its own connection.
#[derive(Debug, Clone)]
pub struct Wshd {
    socket_path: Arc<PathBuf>,
}

impl Wshd {
    /// Create a proxy for the socket at `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: Arc::new(socket_path.into()),
        }
    }

    /// Path of the supervisor socket as seen from the host.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Spawn a process in the container and bridge its stdio to `io`.
    pub fn run(&self, spec: ProcessSpec, io: ProcessIo) -> Result<Process> {
        let request = Request::Run {
            path: spec.path,
            args: spec.args,
            env: spec.env,
            dir: spec.dir,
            user: spec.user,
            tty: spec.tty,
        };

        let (response, fds) = self.round_trip_with_fds(&request)?;
        let (process_id, rights) = match response {
            Response::Run { process_id, rights } => (process_id, rights),
            other => return Err(unexpected(other)),
        };

        attach_process(process_id, rights, fds, io, self.clone())
    }

    /// Re-attach to a previously spawned process.
    pub fn attach(&self, process_id: u32, io: ProcessIo) -> Result<Process> {
        let (response, fds) = self.round_trip_with_fds(&Request::Attach { process_id })?;
        let rights = match response {
            Response::Attach { rights } => rights,
            other => return Err(unexpected(other)),
        };

        attach_process(process_id, rights, fds, io, self.clone())
    }

    /// Deliver a portable signal to a process.
    pub fn signal(&self, process_id: u32, signal: Signal) -> Result<()> {
        match self.round_trip(&Request::Signal { process_id, signal })? {
            Response::Signal => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Resize a process's terminal.
    pub fn set_window_size(&self, process_id: u32, columns: u16, rows: u16) -> Result<()> {
        let request = Request::SetWindowSize {
            process_id,
            columns,
            rows,
        };
        match self.round_trip(&request)? {
            Response::SetWindowSize => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Ensure a directory exists inside the container.
    pub fn create_dir(&self, path: &str) -> Result<()> {
        let request = Request::CreateDir {
            path: path.to_string(),
        };
        match self.round_trip(&request)? {
            Response::CreateDir => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Retire the supervisor-held stdin write end of a process.
    pub fn close_stdin(&self, process_id: u32) -> Result<()> {
        match self.round_trip(&Request::CloseStdin { process_id })? {
            Response::CloseStdin => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn connect(&self) -> Result<UnixStream> {
        let stream = UnixStream::connect(self.socket_path.as_ref())?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        Ok(stream)
    }

    /// One request, one fd-less response.
    fn round_trip(&self, request: &Request) -> Result<Response> {
        let mut stream = self.connect()?;
        write_frame(&mut stream, request)?;

        let response: Response = read_frame(&mut stream)?
            .ok_or_else(|| Error::protocol("connection closed before response"))?;
        Ok(response)
    }

    /// One request, one response gathered with its ancillary descriptors.
    fn round_trip_with_fds(&self, request: &Request) -> Result<(Response, Vec<OwnedFd>)> {
        let mut stream = self.connect()?;
        write_frame(&mut stream, request)?;

        let (response, fds) = recv_with_fds::<Response>(&mut stream)?;
        Ok((response, fds))
    }
}

/// Validate the fd payload against the advertised rights.
pub(crate) fn check_rights(rights: FdRights, fds: &[OwnedFd]) -> Result<()> {
    if fds.len() != rights.len() {
        return Err(Error::protocol(format!(
            "descriptor count mismatch: rights name {}, received {}",
            rights.len(),
            fds.len()
        )));
    }
    Ok(())
}

fn unexpected(response: Response) -> Error {
    match response {
        Response::Error { message } => Error::remote(message),
        other => Error::protocol(format!("unexpected response: {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_becomes_remote_error() {
        let err = unexpected(Response::Error {
            message: "unknown process: 9".to_string(),
        });
        assert_eq!(err.to_string(), "remote error: unknown process: 9");
    }

    #[test]
    fn test_mismatched_response_is_protocol_error() {
        let err = unexpected(Response::Signal);
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_check_rights_mismatch() {
        let rights = FdRights {
            status: true,
            stdin: true,
            stdout: true,
            stderr: true,
        };
        let err = check_rights(rights, &[]).unwrap_err();
        assert!(err.to_string().contains("descriptor count mismatch"));
    }

    #[test]
    fn test_connect_failure_aborts_operation() {
        let wshd = Wshd::new("/nonexistent/garden/wshd.sock");
        assert!(wshd.create_dir("/tmp/x").is_err());
    }
}
