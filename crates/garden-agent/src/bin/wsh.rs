//! wsh, the in-container launcher.
//!
//! Connects to a running wshd, spawns the given command through it, bridges
//! its own stdio to the returned descriptors, and exits with the child's
//! status. Exit code 255 means wsh itself failed (bad arguments, connection
//! or protocol trouble) rather than the child.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread;

use clap::Parser;
use garden_protocol::{read_frame, recv_with_fds, write_frame, Request, Response, TtySpec};

/// Exit code for protocol or setup failures, distinct from any child status.
const SETUP_FAILURE: i32 = 255;

/// wsh - run a command through the garden supervisor
#[derive(Parser, Debug)]
#[command(name = "wsh")]
#[command(about = "launch a process via a wshd socket")]
struct Cli {
    /// Path to the wshd socket.
    #[arg(long)]
    socket: PathBuf,

    /// Working directory for the command.
    #[arg(long)]
    dir: Option<String>,

    /// User to run as.
    #[arg(long, default_value = "root")]
    user: String,

    /// Allocate a controlling PTY.
    #[arg(long)]
    tty: bool,

    /// Initial terminal width, used with --tty.
    #[arg(long, default_value_t = 80)]
    columns: u16,

    /// Initial terminal height, used with --tty.
    #[arg(long, default_value_t = 24)]
    rows: u16,

    /// Command and arguments to run.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    match launch(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("wsh: {}", e);
            std::process::exit(SETUP_FAILURE);
        }
    }
}

fn launch(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    let mut command = cli.command.into_iter();
    let path = command.next().ok_or("no command given")?;
    let args: Vec<String> = command.collect();

    let tty = cli.tty.then_some(TtySpec {
        columns: cli.columns,
        rows: cli.rows,
    });

    let mut stream = UnixStream::connect(&cli.socket)?;
    write_frame(
        &mut stream,
        &Request::Run {
            path,
            args,
            env: std::env::vars().collect(),
            dir: cli.dir,
            user: cli.user,
            tty,
        },
    )?;

    let (resp, fds): (Response, Vec<OwnedFd>) = recv_with_fds(&mut stream)?;
    let (process_id, rights) = match resp {
        Response::Run { process_id, rights } => (process_id, rights),
        Response::Error { message } => return Err(format!("remote error: {}", message).into()),
        other => return Err(format!("unexpected response: {:?}", other).into()),
    };

    if fds.len() != rights.len() {
        return Err(format!(
            "descriptor count mismatch: rights name {}, received {}",
            rights.len(),
            fds.len()
        )
        .into());
    }

    let offsets = rights.offsets();
    let mut slots: Vec<Option<OwnedFd>> = fds.into_iter().map(Some).collect();
    let mut take = |offset: Option<usize>| offset.map(|i| File::from(slots[i].take().unwrap()));

    let status = take(offsets.status).ok_or("response carried no status descriptor")?;
    let stdin = take(offsets.stdin);
    let stdout = take(offsets.stdout);
    let stderr = take(offsets.stderr);

    // Feed our stdin to the remote process. Deliberately not joined: our
    // stdin may never close, and that must not hold up exit.
    if let Some(mut remote_stdin) = stdin {
        let socket_path = cli.socket.clone();
        thread::spawn(move || {
            let _ = io::copy(&mut io::stdin().lock(), &mut remote_stdin);
            drop(remote_stdin);
            let _ = close_remote_stdin(&socket_path, process_id);
        });
    }

    let mut copiers = Vec::new();
    if let Some(mut remote_stdout) = stdout {
        copiers.push(thread::spawn(move || {
            let _ = io::copy(&mut remote_stdout, &mut io::stdout().lock());
        }));
    }
    if let Some(mut remote_stderr) = stderr {
        copiers.push(thread::spawn(move || {
            let _ = io::copy(&mut remote_stderr, &mut io::stderr().lock());
        }));
    }

    for copier in copiers {
        let _ = copier.join();
    }

    let mut status = status;
    let mut line = String::new();
    status.read_to_string(&mut line)?;
    let code: i32 = line.trim().parse()?;
    Ok(code)
}

/// Tell the supervisor to retire its stdin write end once our own stdin has
/// drained, so the child can observe EOF.
fn close_remote_stdin(socket: &PathBuf, process_id: u32) -> Result<(), Box<dyn std::error::Error>> {
    let mut stream = UnixStream::connect(socket)?;
    write_frame(&mut stream, &Request::CloseStdin { process_id })?;
    let _: Option<Response> = read_frame(&mut stream)?;
    Ok(())
}
