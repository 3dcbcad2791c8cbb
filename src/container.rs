//! A live container and its caller-facing operations.
//!
//! Containers are created and destroyed by the [`Backend`](crate::backend::Backend);
//! everything in between (process execution, properties, stream in/out,
//! signals) happens through the methods here. Process execution delegates
//! to the container's wshd proxy; file streaming combines host-side staging
//! with the machine runtime's copy verbs.

use crate::error::{Error, Result};
use crate::machine::Machine;
use crate::process::{Process, ProcessIo};
use crate::wshd::{ProcessSpec, Wshd};
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::debug;

/// User-visible container properties.
pub type Properties = HashMap<String, String>;

/// Grace time applied when the spec does not name one.
const DEFAULT_GRACE_TIME: Duration = Duration::from_secs(5 * 60);

/// How a caller-supplied directory is bound into the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMountMode {
    /// Read-only bind.
    Ro,
    /// Read-write bind.
    Rw,
}

/// A caller-supplied bind mount.
#[derive(Debug, Clone)]
pub struct BindMount {
    /// Host-side source path.
    pub src_path: PathBuf,
    /// In-container destination path.
    pub dst_path: PathBuf,
    /// Read-only or read-write.
    pub mode: BindMountMode,
}

/// Everything a caller can ask for at container creation.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Client-chosen handle; the generated ID is adopted when empty.
    pub handle: String,
    /// Rootfs URI (`raw://...` or `docker://...`).
    pub rootfs: String,
    /// Initial properties.
    pub properties: Properties,
    /// Environment fragment prepended to every process spawned inside.
    pub env: Vec<(String, String)>,
    /// Grace period hint; defaults to five minutes.
    pub grace_time: Option<Duration>,
    /// Additional bind mounts.
    pub bind_mounts: Vec<BindMount>,
}

/// A registered container.
#[derive(Debug)]
pub struct Container {
    id: String,
    dir: PathBuf,
    handle: String,

    properties: RwLock<Properties>,
    env: Vec<(String, String)>,
    grace_time: RwLock<Duration>,

    /// Name of the per-container image clone, for docker-backed rootfses.
    image: Option<String>,

    wshd: Wshd,
    machine: Machine,
}

impl Container {
    pub(crate) fn new(
        spec: ContainerSpec,
        dir: PathBuf,
        id: String,
        image: Option<String>,
        machine: Machine,
    ) -> Self {
        let socket_path = dir.join("run").join(garden_protocol::SOCKET_NAME);

        Self {
            id,
            handle: spec.handle,
            properties: RwLock::new(spec.properties),
            env: spec.env,
            grace_time: RwLock::new(spec.grace_time.unwrap_or(DEFAULT_GRACE_TIME)),
            image,
            wshd: Wshd::new(socket_path),
            machine,
            dir,
        }
    }

    /// The caller-facing handle.
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// The internal short ID used for unit and machine names.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }

    // ========================================================================
    // Processes
    // ========================================================================

    /// Spawn a process inside the container.
    pub fn run(&self, spec: ProcessSpec, io: ProcessIo) -> Result<Process> {
        let mut spec = spec;
        if spec.user.is_empty() {
            spec.user = "root".to_string();
        }

        let mut env = self.env.clone();
        env.extend(spec.env);
        spec.env = env;

        debug!(container = %self.id, path = %spec.path, "running process");
        self.wshd.run(spec, io)
    }

    /// Re-attach to a previously spawned process by ID.
    pub fn attach(&self, process_id: u32, io: ProcessIo) -> Result<Process> {
        self.wshd.attach(process_id, io)
    }

    /// Signal the whole container: SIGTERM, or SIGKILL when `kill` is set.
    pub fn stop(&self, kill: bool) -> Result<()> {
        let signal = if kill { "SIGKILL" } else { "SIGTERM" };
        self.machine.kill(&self.id, signal)
    }

    // ========================================================================
    // Properties and grace time
    // ========================================================================

    /// Snapshot of the full property map.
    pub fn properties(&self) -> Properties {
        self.properties.read().clone()
    }

    /// Value of one property.
    pub fn property(&self, name: &str) -> Result<String> {
        self.properties
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::undefined_property(name))
    }

    /// Set or replace a property.
    pub fn set_property(&self, name: &str, value: &str) {
        self.properties
            .write()
            .insert(name.to_string(), value.to_string());
    }

    /// Remove a property; absent keys are an error.
    pub fn remove_property(&self, name: &str) -> Result<()> {
        match self.properties.write().remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::undefined_property(name)),
        }
    }

    /// True when every filter entry is present with an equal value.
    pub(crate) fn matches(&self, filter: &Properties) -> bool {
        let properties = self.properties.read();
        filter
            .iter()
            .all(|(key, value)| properties.get(key) == Some(value))
    }

    /// The current grace-time hint.
    pub fn grace_time(&self) -> Duration {
        *self.grace_time.read()
    }

    /// Replace the grace-time hint.
    pub fn set_grace_time(&self, grace_time: Duration) {
        *self.grace_time.write() = grace_time;
    }

    // ========================================================================
    // Streaming
    // ========================================================================

    /// Extract a tar stream into the container at `dest_path`.
    ///
    /// The stream is staged on the host first, the agent guarantees the
    /// destination directory exists, and the machine runtime moves the
    /// staged tree in.
    pub fn stream_in(&self, dest_path: &str, tar_stream: impl Read) -> Result<()> {
        let dest = dest_path.trim_end_matches('/');

        let staging = tempfile::Builder::new()
            .prefix("stream-in-")
            .tempdir_in(&self.dir)?;

        tar::Archive::new(tar_stream).unpack(staging.path())?;

        self.wshd.create_dir(dest)?;
        self.machine.copy_to(&self.id, staging.path(), dest)?;

        Ok(())
    }

    /// Produce a gzipped tar stream of `src_path` inside the container.
    ///
    /// The returned reader owns the host-side staging directory and releases
    /// it when dropped.
    pub fn stream_out(&self, src_path: &str) -> Result<StreamOut> {
        let mut path = src_path.to_string();
        if path.ends_with('/') {
            path.push('.');
        }

        let staging = tempfile::Builder::new()
            .prefix("stream-out-")
            .tempdir_in(&self.dir)?;

        // Plain concatenation: Path::join would swallow a trailing "/.",
        // which directs the copy into the staging dir itself.
        let base = base_name(&path);
        let local = format!("{}/{}", staging.path().display(), base);

        self.machine.copy_from(&self.id, &path, Path::new(&local))?;

        let archive = build_archive(base, Path::new(&local), tempfile::tempfile()?)?;

        Ok(StreamOut {
            archive,
            _staging: staging,
        })
    }
}

/// A gzipped tar stream backed by an unlinked spool file. Dropping it
/// releases the spool and then the staging directory it was built from.
pub struct StreamOut {
    archive: File,
    _staging: TempDir,
}

impl Read for StreamOut {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.archive.read(buf)
    }
}

/// Final path component, honoring a trailing `/.`.
fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Compress `path` into `spool` as a gzipped tar rooted at `name`, and
/// rewind the spool for reading.
fn build_archive(name: &str, path: &Path, spool: File) -> Result<File> {
    let encoder = GzEncoder::new(spool, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let metadata = std::fs::metadata(path)?;
    if metadata.is_dir() {
        builder.append_dir_all(name, path)?;
    } else {
        builder.append_path_with_name(path, name)?;
    }

    let encoder = builder.into_inner()?;
    let mut archive = encoder.finish()?;
    archive.seek(SeekFrom::Start(0))?;
    Ok(archive)
}
