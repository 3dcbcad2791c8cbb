//! Protocol types for host-container communication.
//!
//! This crate defines the wire protocol spoken between the garden host and
//! the `wshd` supervisor listening on a Unix socket inside each container.
//!
//! # Protocol Overview
//!
//! Communication uses JSON-encoded messages over a Unix stream socket. Each
//! message is prefixed with a 4-byte big-endian length header.
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4 BE)  | JSON payload      |
//! +----------------+-------------------+
//! ```
//!
//! Responses to [`Request::Run`] and [`Request::Attach`] additionally carry
//! the spawned process's file descriptors as `SCM_RIGHTS` ancillary data on
//! the same socket. Which descriptors are present is described by
//! [`FdRights`]; their positions in the ancillary array follow the canonical
//! `status, stdin, stdout, stderr` order, restricted to present slots.

#![deny(missing_docs)]

use serde::{Deserialize, Serialize};

mod fdpass;

pub use fdpass::{recv_with_fds, send_with_fds, MAX_TRANSFER_FDS};

/// Maximum frame size. Requests and responses are small control messages;
/// anything larger indicates a corrupt or hostile peer.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Name of the supervisor socket inside the runtime directory.
pub const SOCKET_NAME: &str = "wshd.sock";

// ============================================================================
// Requests
// ============================================================================

/// Requests accepted by the in-container supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Spawn a process inside the container.
    Run {
        /// Executable path. Resolved via `$PATH` when it contains no `/`.
        path: String,
        /// Arguments, not including `argv[0]`.
        #[serde(default)]
        args: Vec<String>,
        /// Environment variables as (key, value) pairs.
        #[serde(default)]
        env: Vec<(String, String)>,
        /// Working directory for the process.
        #[serde(default)]
        dir: Option<String>,
        /// User to run as, looked up in the container's `/etc/passwd` by
        /// name or numeric uid.
        user: String,
        /// When present, attach a controlling PTY instead of a pipe triplet.
        #[serde(default)]
        tty: Option<TtySpec>,
    },

    /// Re-fetch the descriptor set of a previously spawned process.
    Attach {
        /// Process ID returned by a prior Run.
        process_id: u32,
    },

    /// Deliver a signal to a process.
    Signal {
        /// Target process ID.
        process_id: u32,
        /// Portable signal name.
        signal: Signal,
    },

    /// Resize the PTY of a process and notify it with `SIGWINCH`.
    SetWindowSize {
        /// Target process ID.
        process_id: u32,
        /// New width in columns.
        columns: u16,
        /// New height in rows.
        rows: u16,
    },

    /// Recursively create a directory inside the container.
    CreateDir {
        /// Absolute path to create.
        path: String,
    },

    /// Close the supervisor-held write end of a process's stdin.
    ///
    /// After this, the process observes EOF once every other writer has
    /// closed, and subsequent Attach responses omit the stdin slot.
    CloseStdin {
        /// Target process ID.
        process_id: u32,
    },
}

/// Initial terminal dimensions for a PTY-attached process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtySpec {
    /// Width in columns.
    pub columns: u16,
    /// Height in rows.
    pub rows: u16,
}

/// Portable signal vocabulary. Translation to OS signal numbers happens in
/// the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// Graceful termination (SIGTERM).
    Terminate,
    /// Forceful kill (SIGKILL).
    Kill,
}

// ============================================================================
// Responses
// ============================================================================

/// Responses produced by the supervisor, one per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Process spawned. The descriptors named by `rights` ride along as
    /// `SCM_RIGHTS` ancillary data.
    Run {
        /// Supervisor-assigned process ID, unique for the supervisor's
        /// lifetime.
        process_id: u32,
        /// Which descriptor slots accompany this response.
        rights: FdRights,
    },

    /// Attach succeeded; descriptors ride along as with Run.
    Attach {
        /// Which descriptor slots accompany this response.
        rights: FdRights,
    },

    /// Signal delivered.
    Signal,

    /// Window size applied.
    SetWindowSize,

    /// Directory created.
    CreateDir,

    /// Stdin write end closed.
    CloseStdin,

    /// The request failed; the connection remains usable.
    Error {
        /// Human-readable failure description.
        message: String,
    },
}

// ============================================================================
// Descriptor slot bookkeeping
// ============================================================================

/// Describes which of the four descriptor slots accompany a Run or Attach
/// response.
///
/// Present slots appear in the transmitted `SCM_RIGHTS` array in the
/// canonical order `status, stdin, stdout, stderr`; absent slots do not
/// occupy a position. Sender and receiver agree on positions purely through
/// this ordering; no indices travel on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdRights {
    /// Exit-status pipe. Always present while the process record exists.
    pub status: bool,
    /// Stdin write end. Absent once closed via CloseStdin.
    pub stdin: bool,
    /// Stdout read end (the PTY master in TTY mode).
    pub stdout: bool,
    /// Stderr read end. Absent in TTY mode.
    pub stderr: bool,
}

impl FdRights {
    /// Number of descriptors described.
    pub fn len(&self) -> usize {
        [self.status, self.stdin, self.stdout, self.stderr]
            .iter()
            .filter(|present| **present)
            .count()
    }

    /// True when no descriptors are described.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Positions of the present slots within the received descriptor array,
    /// reconstructed by walking the canonical order.
    pub fn offsets(&self) -> FdOffsets {
        let mut offsets = FdOffsets::default();
        let mut next = 0;

        let mut take = |present: bool| {
            if present {
                let offset = next;
                next += 1;
                Some(offset)
            } else {
                None
            }
        };

        offsets.status = take(self.status);
        offsets.stdin = take(self.stdin);
        offsets.stdout = take(self.stdout);
        offsets.stderr = take(self.stderr);
        offsets
    }
}

/// Positions of present slots in a received descriptor array. Produced by
/// [`FdRights::offsets`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FdOffsets {
    /// Position of the status pipe, when present.
    pub status: Option<usize>,
    /// Position of the stdin write end, when present.
    pub stdin: Option<usize>,
    /// Position of the stdout read end, when present.
    pub stdout: Option<usize>,
    /// Position of the stderr read end, when present.
    pub stderr: Option<usize>,
}

// ============================================================================
// Wire format
// ============================================================================

/// Encode a message to wire format (length-prefixed JSON).
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;

    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);

    Ok(buf)
}

/// Read one frame from a stream.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly at a frame
/// boundary.
pub fn read_frame<T, R>(reader: &mut R) -> Result<Option<T>, DecodeError>
where
    T: for<'de> Deserialize<'de>,
    R: std::io::Read,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(DecodeError::Io(e)),
    }

    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_SIZE {
        return Err(DecodeError::TooLarge(len as usize));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).map_err(DecodeError::Io)?;

    serde_json::from_slice(&payload).map_err(DecodeError::Json)
}

/// Write one frame to a stream.
pub fn write_frame<T, W>(writer: &mut W, msg: &T) -> Result<(), DecodeError>
where
    T: Serialize,
    W: std::io::Write,
{
    let frame = encode_frame(msg).map_err(DecodeError::Json)?;
    writer.write_all(&frame).map_err(DecodeError::Io)?;
    writer.flush().map_err(DecodeError::Io)
}

/// Error decoding or transporting a wire message.
#[derive(Debug)]
pub enum DecodeError {
    /// Transport-level I/O failure.
    Io(std::io::Error),
    /// Frame size exceeds [`MAX_FRAME_SIZE`].
    TooLarge(usize),
    /// JSON parse error.
    Json(serde_json::Error),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Io(e) => write!(f, "i/o error: {}", e),
            DecodeError::TooLarge(size) => write!(f, "frame too large: {} bytes", size),
            DecodeError::Json(e) => write!(f, "JSON decode error: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}
