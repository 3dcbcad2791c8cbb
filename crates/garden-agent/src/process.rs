//! The supervisor's process table.
//!
//! Each spawned process is recorded with its pid and the descriptor set the
//! host cares about: the status pipe (always), and whichever of
//! stdin/stdout/stderr exist for its I/O mode. Records are created by Run,
//! never mutated apart from explicit stdin closure, and persist for the
//! supervisor's lifetime.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::thread;

use garden_protocol::{FdRights, Signal, TtySpec};
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{kill, Signal as OsSignal};
use nix::unistd::{pipe, Pid};
use tracing::{debug, warn};

nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, Winsize);

/// Default `$PATH` for processes running as root.
const ROOT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Default `$PATH` for everyone else.
const USER_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Everything needed to spawn one process.
#[derive(Debug)]
pub struct RunSpec {
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub dir: Option<String>,
    pub user: String,
    pub tty: Option<TtySpec>,
}

/// One live process record. The descriptors are owned by the record; wire
/// transfers duplicate them into the socket.
struct Process {
    pid: i32,
    tty: bool,

    status_r: OwnedFd,
    stdin_w: Option<OwnedFd>,
    stdout_r: Option<OwnedFd>,
    stderr_r: Option<OwnedFd>,
}

impl Process {
    fn rights(&self) -> FdRights {
        FdRights {
            status: true,
            stdin: self.stdin_w.is_some(),
            stdout: self.stdout_r.is_some(),
            stderr: self.stderr_r.is_some(),
        }
    }

    /// Raw descriptors in the canonical `status, stdin, stdout, stderr`
    /// order, restricted to present slots.
    fn raw_fds(&self) -> Vec<RawFd> {
        let mut fds = vec![self.status_r.as_raw_fd()];
        if let Some(fd) = &self.stdin_w {
            fds.push(fd.as_raw_fd());
        }
        if let Some(fd) = &self.stdout_r {
            fds.push(fd.as_raw_fd());
        }
        if let Some(fd) = &self.stderr_r {
            fds.push(fd.as_raw_fd());
        }
        fds
    }
}

/// Table of live processes, keyed by a supervisor-lifetime-unique 32-bit ID.
/// A single mutex serializes ID allocation and every table access.
pub struct ProcessTable {
    inner: Mutex<TableInner>,
}

struct TableInner {
    next_id: u32,
    processes: HashMap<u32, Process>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                next_id: 1,
                processes: HashMap::new(),
            }),
        }
    }

    /// Spawn a process and register it. Returns the new ID together with the
    /// descriptor set to hand to the caller.
    pub fn run(&self, spec: RunSpec) -> Result<(u32, FdRights, Vec<RawFd>), String> {
        let exec_path = resolve_executable(&spec.path)?;
        let user = crate::passwd::lookup_user(&spec.user)?;

        let (status_r, status_w) =
            pipe().map_err(|e| format!("create status pipe: {}", e))?;

        let mut cmd = Command::new(&exec_path);
        // argv[0] carries the requested path, not the resolved binary.
        cmd.arg0(&spec.path);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.dir {
            cmd.current_dir(dir);
        }

        cmd.env_clear();
        // The caller's literal user string decides the default PATH and the
        // USER value; only credentials and HOME come from the passwd record.
        let default_path = if spec.user == "root" { ROOT_PATH } else { USER_PATH };
        cmd.env("PATH", default_path);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.env("USER", &spec.user);
        cmd.env("HOME", &user.home);

        cmd.uid(user.uid);
        cmd.gid(user.gid);

        let (child, process) = if let Some(tty) = spec.tty {
            spawn_with_pty(cmd, tty, status_r)?
        } else {
            spawn_with_pipes(cmd, status_r)?
        };

        spawn_status_writer(child, status_w);

        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;

        let rights = process.rights();
        let fds = process.raw_fds();
        inner.processes.insert(id, process);

        debug!(process_id = id, path = %spec.path, "process registered");

        Ok((id, rights, fds))
    }

    /// Descriptor set of an existing process, for Attach.
    pub fn rights(&self, id: u32) -> Result<(FdRights, Vec<RawFd>), String> {
        let inner = self.inner.lock().unwrap();
        let process = inner
            .processes
            .get(&id)
            .ok_or_else(|| format!("unknown process: {}", id))?;
        Ok((process.rights(), process.raw_fds()))
    }

    /// Deliver a signal to a process.
    pub fn signal(&self, id: u32, signal: Signal) -> Result<(), String> {
        let inner = self.inner.lock().unwrap();
        let process = inner
            .processes
            .get(&id)
            .ok_or_else(|| format!("unknown process: {}", id))?;

        let os_signal = match signal {
            Signal::Terminate => OsSignal::SIGTERM,
            Signal::Kill => OsSignal::SIGKILL,
        };

        kill(Pid::from_raw(process.pid), os_signal).map_err(|e| format!("kill: {}", e))
    }

    /// Resize a process's PTY and notify it with SIGWINCH.
    pub fn set_window_size(&self, id: u32, columns: u16, rows: u16) -> Result<(), String> {
        let inner = self.inner.lock().unwrap();
        let process = inner
            .processes
            .get(&id)
            .ok_or_else(|| format!("unknown process: {}", id))?;

        if !process.tty {
            return Err(format!("process {} has no tty", id));
        }

        // The stdout slot holds a master duplicate and survives stdin
        // closure, so resize through it.
        let master = process
            .stdout_r
            .as_ref()
            .ok_or_else(|| format!("process {} has no pty master", id))?;

        let winsize = Winsize {
            ws_row: rows,
            ws_col: columns,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        // SAFETY: master is a valid open PTY master owned by the record.
        unsafe { tiocswinsz(master.as_raw_fd(), &winsize) }
            .map_err(|e| format!("set window size: {}", e))?;

        kill(Pid::from_raw(process.pid), OsSignal::SIGWINCH)
            .map_err(|e| format!("deliver SIGWINCH: {}", e))
    }

    /// Close the supervisor-held stdin write end. Idempotent; subsequent
    /// Attach responses omit the stdin slot.
    pub fn close_stdin(&self, id: u32) -> Result<(), String> {
        let mut inner = self.inner.lock().unwrap();
        let process = inner
            .processes
            .get_mut(&id)
            .ok_or_else(|| format!("unknown process: {}", id))?;

        process.stdin_w.take();
        Ok(())
    }
}

/// Pipe-triplet spawn: three pipes, child gets the far ends.
fn spawn_with_pipes(mut cmd: Command, status_r: OwnedFd) -> Result<(Child, Process), String> {
    let (stdin_r, stdin_w) = pipe().map_err(|e| format!("create stdin pipe: {}", e))?;
    let (stdout_r, stdout_w) = pipe().map_err(|e| format!("create stdout pipe: {}", e))?;
    let (stderr_r, stderr_w) = pipe().map_err(|e| format!("create stderr pipe: {}", e))?;

    cmd.stdin(Stdio::from(stdin_r));
    cmd.stdout(Stdio::from(stdout_w));
    cmd.stderr(Stdio::from(stderr_w));

    let child = cmd.spawn().map_err(|e| format!("start: {}", e))?;
    let pid = child.id() as i32;

    // The child's pipe ends are dropped with `cmd` when this frame returns.
    Ok((
        child,
        Process {
            pid,
            tty: false,
            status_r,
            stdin_w: Some(stdin_w),
            stdout_r: Some(stdout_r),
            stderr_r: Some(stderr_r),
        },
    ))
}

/// PTY spawn: the child gets the slave on all three streams and becomes
/// session leader with the slave as controlling terminal. The master is
/// exposed as both the stdin write end and the stdout read end; stderr is
/// indistinguishable from stdout on a PTY, so that slot stays empty.
fn spawn_with_pty(
    mut cmd: Command,
    tty: TtySpec,
    status_r: OwnedFd,
) -> Result<(Child, Process), String> {
    let winsize = Winsize {
        ws_row: tty.rows,
        ws_col: tty.columns,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    let pty = openpty(Some(&winsize), None).map_err(|e| format!("create pty: {}", e))?;
    let master = pty.master;
    let slave = pty.slave;

    let slave_out = slave
        .try_clone()
        .map_err(|e| format!("duplicate pty slave: {}", e))?;
    let slave_err = slave
        .try_clone()
        .map_err(|e| format!("duplicate pty slave: {}", e))?;

    cmd.stdin(Stdio::from(slave));
    cmd.stdout(Stdio::from(slave_out));
    cmd.stderr(Stdio::from(slave_err));

    // SAFETY: setsid and ioctl are async-signal-safe; stdin is the pty slave
    // at this point, so TIOCSCTTY on fd 0 adopts it as controlling terminal.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(0, libc::TIOCSCTTY as libc::c_ulong, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| format!("start: {}", e))?;
    let pid = child.id() as i32;

    let master_out = master
        .try_clone()
        .map_err(|e| format!("duplicate pty master: {}", e))?;

    Ok((
        child,
        Process {
            pid,
            tty: true,
            status_r,
            stdin_w: Some(master),
            stdout_r: Some(master_out),
            stderr_r: None,
        },
    ))
}

/// Reap the child in the background; its decimal exit status plus newline is
/// the one-shot payload of the status pipe. Dropping the write end afterward
/// is what lets the host-side reader observe EOF.
fn spawn_status_writer(mut child: Child, status_w: OwnedFd) {
    thread::spawn(move || {
        let code = match child.wait() {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                warn!(error = %e, "wait failed");
                -1
            }
        };

        let mut status = File::from(status_w);
        if let Err(e) = writeln!(status, "{}", code) {
            warn!(error = %e, "status write failed");
        }
    });
}

/// Resolve the executable for a Run request: paths containing `/` are used
/// verbatim, anything else is searched for on the supervisor's `$PATH`.
fn resolve_executable(path: &str) -> Result<String, String> {
    if path.contains('/') {
        return Ok(path.to_string());
    }

    let search = std::env::var("PATH").unwrap_or_else(|_| ROOT_PATH.to_string());
    for dir in search.split(':') {
        if dir.is_empty() {
            continue;
        }
        let candidate = Path::new(dir).join(path);
        if let Ok(metadata) = candidate.metadata() {
            if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
                return Ok(candidate.to_string_lossy().into_owned());
            }
        }
    }

    Err(format!("executable {} not found in $PATH", path))
}
