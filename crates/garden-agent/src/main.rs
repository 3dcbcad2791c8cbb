//! wshd, the in-container process supervisor.
//!
//! wshd runs as the init payload of a garden container. It binds a Unix
//! socket in the runtime directory the host bind-mounted in, detaches that
//! mount so the host-side path becomes the canonical carrier of the socket,
//! and then services requests: spawning user processes with a pipe triplet
//! or a controlling PTY, re-offering their descriptors on attach, and
//! delivering signals and window resizes.
//!
//! Spawned-process descriptors travel back to the caller as SCM_RIGHTS
//! ancillary data alongside the Run/Attach response frame.

use std::fs;
use std::os::fd::RawFd;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use clap::Parser;
use garden_protocol::{encode_frame, read_frame, send_with_fds, write_frame, Request, Response};
use nix::mount::{umount2, MntFlags};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod passwd;
mod process;

use process::{ProcessTable, RunSpec};

/// wshd - garden container supervisor
#[derive(Parser, Debug)]
#[command(name = "wshd")]
#[command(about = "garden in-container process supervisor")]
struct Cli {
    /// Runtime directory in which to bind the listening socket.
    #[arg(long = "run")]
    run: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    init_logging();

    if let Err(e) = serve(&cli.run) {
        error!(error = %e, "wshd failed");
        eprintln!("wshd: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wshd=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Bind the socket, unbind the bootstrap mount, then accept forever.
fn serve(run_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let socket_path = run_dir.join(garden_protocol::SOCKET_NAME);

    let _ = fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;

    // The host delivers this directory by bind-mounting a tmpfs over the
    // path before the container starts. The socket was just created on that
    // tmpfs; detach the mount so the host-side path stays the canonical
    // carrier and the in-container skeleton can be dropped.
    umount2(run_dir, MntFlags::MNT_DETACH)?;
    fs::remove_dir_all(run_dir)?;

    fs::set_permissions("/tmp", fs::Permissions::from_mode(0o777))?;

    info!(socket = %socket_path.display(), "wshd listening");

    let table = Arc::new(ProcessTable::new());

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, &table) {
                        warn!(error = %e, "connection error");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept error");
            }
        }
    }

    Ok(())
}

/// Service one connection: read requests until EOF, answering each with
/// exactly one response. Handler failures are reported in the response; the
/// connection stays usable.
fn handle_connection(
    mut stream: UnixStream,
    table: &ProcessTable,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let request = match read_frame::<Request, _>(&mut stream)? {
            Some(request) => request,
            None => {
                debug!("connection closed");
                return Ok(());
            }
        };

        debug!(?request, "received request");

        match request {
            Request::Run {
                path,
                args,
                env,
                dir,
                user,
                tty,
            } => {
                let spec = RunSpec {
                    path,
                    args,
                    env,
                    dir,
                    user,
                    tty,
                };
                match table.run(spec) {
                    Ok((process_id, rights, fds)) => respond_with_fds(
                        &stream,
                        &Response::Run { process_id, rights },
                        &fds,
                    )?,
                    Err(message) => respond_err(&mut stream, message)?,
                }
            }

            Request::Attach { process_id } => match table.rights(process_id) {
                Ok((rights, fds)) => {
                    respond_with_fds(&stream, &Response::Attach { rights }, &fds)?
                }
                Err(message) => respond_err(&mut stream, message)?,
            },

            Request::Signal { process_id, signal } => match table.signal(process_id, signal) {
                Ok(()) => write_frame(&mut stream, &Response::Signal)?,
                Err(message) => respond_err(&mut stream, message)?,
            },

            Request::SetWindowSize {
                process_id,
                columns,
                rows,
            } => match table.set_window_size(process_id, columns, rows) {
                Ok(()) => write_frame(&mut stream, &Response::SetWindowSize)?,
                Err(message) => respond_err(&mut stream, message)?,
            },

            Request::CreateDir { path } => match create_dir(&path) {
                Ok(()) => write_frame(&mut stream, &Response::CreateDir)?,
                Err(message) => respond_err(&mut stream, message)?,
            },

            Request::CloseStdin { process_id } => match table.close_stdin(process_id) {
                Ok(()) => write_frame(&mut stream, &Response::CloseStdin)?,
                Err(message) => respond_err(&mut stream, message)?,
            },
        }
    }
}

/// Write a response frame with its descriptor set as SCM_RIGHTS ancillary
/// data in a single sendmsg.
fn respond_with_fds(
    stream: &UnixStream,
    response: &Response,
    fds: &[RawFd],
) -> Result<(), Box<dyn std::error::Error>> {
    let frame = encode_frame(response)?;
    send_with_fds(stream, &frame, fds)?;
    Ok(())
}

fn respond_err(
    stream: &mut UnixStream,
    message: String,
) -> Result<(), Box<dyn std::error::Error>> {
    warn!(error = %message, "request failed");
    write_frame(stream, &Response::Error { message })?;
    Ok(())
}

/// Recursively create a directory with mode 0755. Used by host-side
/// streaming to guarantee copy-in destinations exist.
fn create_dir(path: &str) -> Result<(), String> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
        .map_err(|e| format!("create {}: {}", path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use garden_protocol::recv_with_fds;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::OwnedFd;

    fn running_as_root() -> bool {
        nix::unistd::geteuid().is_root()
    }

    /// Wire a client stream to a fresh agent servicing one connection.
    fn connect_agent() -> UnixStream {
        let (client, server) = UnixStream::pair().unwrap();
        let table = Arc::new(ProcessTable::new());
        thread::spawn(move || {
            let _ = handle_connection(server, &table);
        });
        client
    }

    /// Split the received descriptor array into (status, stdin, stdout)
    /// files using the canonical offsets.
    fn split_fds(
        rights: garden_protocol::FdRights,
        fds: Vec<OwnedFd>,
    ) -> (Option<File>, Option<File>, Option<File>) {
        assert_eq!(fds.len(), rights.len(), "descriptor count mismatch");
        let offsets = rights.offsets();
        let mut slots: Vec<Option<OwnedFd>> = fds.into_iter().map(Some).collect();

        let mut file_at = |offset: Option<usize>| {
            offset.map(|i| File::from(slots[i].take().expect("slot already taken")))
        };

        let status = file_at(offsets.status);
        let stdin = file_at(offsets.stdin);
        let stdout = file_at(offsets.stdout);
        (status, stdin, stdout)
    }

    #[test]
    fn test_run_echo_end_to_end() {
        if !running_as_root() {
            return;
        }

        let mut client = connect_agent();
        write_frame(
            &mut client,
            &Request::Run {
                path: "/bin/echo".to_string(),
                args: vec!["hello".to_string()],
                env: Vec::new(),
                dir: None,
                user: "root".to_string(),
                tty: None,
            },
        )
        .unwrap();

        let (resp, fds): (Response, Vec<OwnedFd>) = recv_with_fds(&mut client).unwrap();
        let Response::Run { rights, .. } = resp else {
            panic!("expected Run response, got {:?}", resp);
        };

        let (status, stdin, stdout) = split_fds(rights, fds);
        drop(stdin);

        let mut out = String::new();
        stdout.unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello\n");

        let mut line = String::new();
        status.unwrap().read_to_string(&mut line).unwrap();
        assert_eq!(line, "0\n");
    }

    #[test]
    fn test_run_cat_with_close_stdin() {
        if !running_as_root() {
            return;
        }

        let mut client = connect_agent();
        write_frame(
            &mut client,
            &Request::Run {
                path: "/bin/cat".to_string(),
                args: Vec::new(),
                env: Vec::new(),
                dir: None,
                user: "root".to_string(),
                tty: None,
            },
        )
        .unwrap();

        let (resp, fds): (Response, Vec<OwnedFd>) = recv_with_fds(&mut client).unwrap();
        let Response::Run { process_id, rights } = resp else {
            panic!("expected Run response, got {:?}", resp);
        };

        let (status, stdin, stdout) = split_fds(rights, fds);
        let mut stdin = stdin.expect("stdin must be offered before CloseStdin");

        stdin.write_all(b"ping\n").unwrap();
        drop(stdin);

        // The supervisor still holds its own stdin write end; cat only sees
        // EOF once CloseStdin retires it.
        write_frame(&mut client, &Request::CloseStdin { process_id }).unwrap();
        let resp: Response = read_frame(&mut client).unwrap().unwrap();
        assert!(matches!(resp, Response::CloseStdin), "got {:?}", resp);

        let mut out = String::new();
        stdout.unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "ping\n");

        let mut line = String::new();
        status.unwrap().read_to_string(&mut line).unwrap();
        assert_eq!(line, "0\n");
    }

    #[test]
    fn test_attach_unknown_process() {
        let mut client = connect_agent();
        write_frame(&mut client, &Request::Attach { process_id: 9000 }).unwrap();
        let resp: Response = read_frame(&mut client).unwrap().unwrap();
        match resp {
            Response::Error { message } => assert_eq!(message, "unknown process: 9000"),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_connection_survives_handler_failure() {
        let mut client = connect_agent();

        write_frame(&mut client, &Request::Attach { process_id: 1 }).unwrap();
        let resp: Response = read_frame(&mut client).unwrap().unwrap();
        assert!(matches!(resp, Response::Error { .. }));

        // The same connection keeps servicing requests.
        let dir = std::env::temp_dir().join(format!("wshd-conn-{}", std::process::id()));
        write_frame(
            &mut client,
            &Request::CreateDir {
                path: dir.to_string_lossy().into_owned(),
            },
        )
        .unwrap();
        let resp: Response = read_frame(&mut client).unwrap().unwrap();
        assert!(matches!(resp, Response::CreateDir), "got {:?}", resp);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_create_dir_recursive() {
        let base = std::env::temp_dir().join(format!("wshd-test-{}", std::process::id()));
        let nested = base.join("a/b/c");

        create_dir(nested.to_str().unwrap()).unwrap();
        assert!(nested.is_dir());

        // Creating an existing path is not an error.
        create_dir(nested.to_str().unwrap()).unwrap();

        fs::remove_dir_all(&base).unwrap();
    }

    #[test]
    fn test_create_dir_reports_path() {
        let err = create_dir("/proc/definitely/not/writable").unwrap_err();
        assert!(err.contains("/proc/definitely/not/writable"));
    }
}
