//! `SCM_RIGHTS` descriptor transfer over Unix stream sockets.
//!
//! Run and Attach responses carry their descriptor sets as ancillary data on
//! the same socket as the response frame. The ancillary payload must travel
//! with the first byte of the frame, so the frame and control message go out
//! in a single `sendmsg`; the receiver gathers both with one `recvmsg` and
//! completes any remaining frame bytes with plain reads.

use std::io::{self, IoSlice, IoSliceMut, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use serde::Deserialize;

use crate::{DecodeError, MAX_FRAME_SIZE};

/// Upper bound on descriptors in a single transfer: status, stdin, stdout,
/// stderr.
pub const MAX_TRANSFER_FDS: usize = 4;

/// Buffer sized to hold a whole response frame in the common case.
const RECV_BUFFER_SIZE: usize = 64 * 1024;

fn errno_to_io(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// Send an encoded frame together with descriptors as `SCM_RIGHTS`.
///
/// The descriptors are duplicated into the socket by the kernel; the caller
/// retains ownership of its copies.
pub fn send_with_fds(stream: &UnixStream, frame: &[u8], fds: &[RawFd]) -> io::Result<()> {
    let cmsgs = if fds.is_empty() {
        Vec::new()
    } else {
        vec![ControlMessage::ScmRights(fds)]
    };

    let iov = [IoSlice::new(frame)];
    let mut sent = sendmsg::<()>(
        stream.as_raw_fd(),
        &iov,
        &cmsgs,
        MsgFlags::empty(),
        None,
    )
    .map_err(errno_to_io)?;

    // The ancillary data went out with the first segment; push any frame
    // remainder with plain sends.
    while sent < frame.len() {
        let iov = [IoSlice::new(&frame[sent..])];
        let n = sendmsg::<()>(stream.as_raw_fd(), &iov, &[], MsgFlags::empty(), None)
            .map_err(errno_to_io)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "socket closed mid-frame",
            ));
        }
        sent += n;
    }

    Ok(())
}

/// Receive one frame plus any `SCM_RIGHTS` descriptors that accompany it.
///
/// Received descriptors are promoted to [`OwnedFd`] immediately so they are
/// closed on every return path.
pub fn recv_with_fds<T>(stream: &mut UnixStream) -> Result<(T, Vec<OwnedFd>), DecodeError>
where
    T: for<'de> Deserialize<'de>,
{
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let mut fds: Vec<OwnedFd> = Vec::new();

    let mut filled = {
        let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_TRANSFER_FDS]);
        let mut iov = [IoSliceMut::new(&mut buf)];
        let msg = recvmsg::<()>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_space),
            MsgFlags::empty(),
        )
        .map_err(|e| DecodeError::Io(errno_to_io(e)))?;

        for cmsg in msg.cmsgs().map_err(|e| DecodeError::Io(errno_to_io(e)))? {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                for fd in received {
                    // SAFETY: the kernel just installed this descriptor into
                    // our table for us; we are its sole owner.
                    fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                }
            }
        }

        msg.bytes
    };

    if filled == 0 {
        return Err(DecodeError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before response",
        )));
    }

    // Complete the length header if the first segment was short.
    while filled < 4 {
        let n = stream.read(&mut buf[filled..4]).map_err(DecodeError::Io)?;
        if n == 0 {
            return Err(DecodeError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside frame header",
            )));
        }
        filled += n;
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > MAX_FRAME_SIZE {
        return Err(DecodeError::TooLarge(len as usize));
    }
    let total = 4 + len as usize;

    if buf.len() < total {
        buf.resize(total, 0);
    }
    if filled < total {
        stream
            .read_exact(&mut buf[filled..total])
            .map_err(DecodeError::Io)?;
    }

    let msg = serde_json::from_slice(&buf[4..total]).map_err(DecodeError::Json)?;
    Ok((msg, fds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{encode_frame, FdRights, Response};
    use std::io::Write;

    #[test]
    fn test_frame_without_fds() {
        let (tx, mut rx) = UnixStream::pair().unwrap();

        let resp = Response::CreateDir;
        let frame = encode_frame(&resp).unwrap();
        send_with_fds(&tx, &frame, &[]).unwrap();

        let (decoded, fds): (Response, _) = recv_with_fds(&mut rx).unwrap();
        assert!(matches!(decoded, Response::CreateDir));
        assert!(fds.is_empty());
    }

    #[test]
    fn test_run_response_carries_matching_fd_count() {
        let (tx, mut rx) = UnixStream::pair().unwrap();

        let (status_r, _status_w) = std::io::pipe().unwrap();
        let (stdout_r, _stdout_w) = std::io::pipe().unwrap();

        let rights = FdRights {
            status: true,
            stdin: false,
            stdout: true,
            stderr: false,
        };
        let frame = encode_frame(&Response::Run {
            process_id: 1,
            rights,
        })
        .unwrap();
        send_with_fds(&tx, &frame, &[status_r.as_raw_fd(), stdout_r.as_raw_fd()]).unwrap();

        let (decoded, fds): (Response, Vec<OwnedFd>) = recv_with_fds(&mut rx).unwrap();
        let Response::Run {
            process_id,
            rights: received,
        } = decoded
        else {
            panic!("expected Run response, got {:?}", decoded);
        };
        assert_eq!(process_id, 1);
        assert_eq!(received, rights);
        assert_eq!(fds.len(), rights.len());
    }

    #[test]
    fn test_fd_payloads_flow_through_duplicates() {
        let (tx, mut rx) = UnixStream::pair().unwrap();

        let (status_r, mut status_w) = std::io::pipe().unwrap();
        let (stdout_r, mut stdout_w) = std::io::pipe().unwrap();

        let rights = FdRights {
            status: true,
            stdin: false,
            stdout: true,
            stderr: false,
        };
        let frame = encode_frame(&Response::Attach { rights }).unwrap();
        send_with_fds(&tx, &frame, &[status_r.as_raw_fd(), stdout_r.as_raw_fd()]).unwrap();
        drop(status_r);
        drop(stdout_r);

        let (_, fds): (Response, Vec<OwnedFd>) = recv_with_fds(&mut rx).unwrap();
        assert_eq!(fds.len(), 2);

        status_w.write_all(b"17\n").unwrap();
        drop(status_w);
        stdout_w.write_all(b"payload").unwrap();
        drop(stdout_w);

        let offsets = rights.offsets();
        let mut received: Vec<Option<OwnedFd>> = fds.into_iter().map(Some).collect();

        let mut status_file = std::fs::File::from(received[offsets.status.unwrap()].take().unwrap());
        let mut status_out = String::new();
        status_file.read_to_string(&mut status_out).unwrap();
        assert_eq!(status_out, "17\n");

        let mut stdout_file = std::fs::File::from(received[offsets.stdout.unwrap()].take().unwrap());
        let mut data = String::new();
        stdout_file.read_to_string(&mut data).unwrap();
        assert_eq!(data, "payload");
    }
}
