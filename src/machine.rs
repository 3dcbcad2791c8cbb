//! Machine runtime driver.
//!
//! The backend never talks to systemd directly; everything goes through this
//! thin shell-out layer over `systemctl` and `machinectl`. Failures capture
//! the full command line and both output streams so they can be reported
//! verbatim.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Where machinectl keeps pulled and cloned images.
const MACHINES_DIR: &str = "/var/lib/machines";

/// Driver for the host's machine runtime.
#[derive(Debug, Clone, Default)]
pub struct Machine;

impl Machine {
    /// Create a driver.
    pub fn new() -> Self {
        Self
    }

    /// `systemctl start <unit>`.
    pub fn start_unit(&self, unit: &str) -> Result<()> {
        self.run(Command::new("systemctl").args(["start", unit]))
    }

    /// `systemctl stop <unit>`.
    pub fn stop_unit(&self, unit: &str) -> Result<()> {
        self.run(Command::new("systemctl").args(["stop", unit]))
    }

    /// `systemctl link <template>`: make a unit template from the skeleton
    /// visible to systemd.
    pub fn link_unit(&self, template: &Path) -> Result<()> {
        self.run(Command::new("systemctl").arg("link").arg(template))
    }

    /// `machinectl status <machine>`; succeeds once the machine is up.
    pub fn status(&self, machine: &str) -> Result<()> {
        self.run(Command::new("machinectl").args(["status", machine]))
    }

    /// `machinectl kill -s <signal> <machine>`.
    pub fn kill(&self, machine: &str, signal: &str) -> Result<()> {
        self.run(Command::new("machinectl").args(["kill", "-s", signal, machine]))
    }

    /// `machinectl copy-to <machine> <src> <dst>`.
    pub fn copy_to(&self, machine: &str, src: &Path, dst: &str) -> Result<()> {
        self.run(
            Command::new("machinectl")
                .args(["copy-to", machine])
                .arg(src)
                .arg(dst),
        )
    }

    /// `machinectl copy-from <machine> <src> <dst>`.
    pub fn copy_from(&self, machine: &str, src: &str, dst: &Path) -> Result<()> {
        self.run(
            Command::new("machinectl")
                .args(["copy-from", machine, src])
                .arg(dst),
        )
    }

    /// `machinectl pull-dkr <repo>:<tag> <name>` against the given index.
    ///
    /// No-op when the image is already present.
    pub fn pull_docker(&self, index: &str, repo: &str, tag: &str, name: &str) -> Result<()> {
        if self.image_path(name).exists() {
            debug!(image = name, "image already pulled");
            return Ok(());
        }

        self.run(Command::new("machinectl").args([
            "pull-dkr",
            "--verify=no",
            &format!("--dkr-index-url={}", index),
            &format!("{}:{}", repo, tag),
            name,
        ]))
    }

    /// `machinectl clone <from> <to>`.
    pub fn clone_image(&self, from: &str, to: &str) -> Result<()> {
        self.run(Command::new("machinectl").args(["clone", from, to]))
    }

    /// `machinectl remove <image>`.
    pub fn remove_image(&self, image: &str) -> Result<()> {
        self.run(Command::new("machinectl").args(["remove", image]))
    }

    /// On-disk location of a named image.
    pub fn image_path(&self, image: &str) -> PathBuf {
        Path::new(MACHINES_DIR).join(image)
    }

    /// Run a command to completion, capturing both output streams. On
    /// failure everything we know lands in the error.
    fn run(&self, cmd: &mut Command) -> Result<()> {
        let rendered = render(cmd);
        debug!(command = %rendered, "running");

        let output = cmd
            .output()
            .map_err(|e| Error::runtime(rendered.clone(), e.to_string()))?;

        if !output.status.success() {
            return Err(Error::runtime(
                rendered,
                format!(
                    "{}\nstdout: {}\nstderr: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stdout).trim(),
                    String::from_utf8_lossy(&output.stderr).trim(),
                ),
            ));
        }

        Ok(())
    }
}

/// Render a command with its arguments for error reporting.
fn render(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(
        cmd.get_args()
            .map(|arg| arg.to_string_lossy().into_owned()),
    );
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_path() {
        let machine = Machine::new();
        assert_eq!(
            machine.image_path("library-ubuntu-latest"),
            PathBuf::from("/var/lib/machines/library-ubuntu-latest")
        );
    }

    #[test]
    fn test_run_failure_captures_output() {
        let machine = Machine::new();
        let err = machine
            .run(Command::new("sh").args(["-c", "echo visible-out; echo visible-err >&2; exit 3"]))
            .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("sh -c"), "command missing: {}", msg);
        assert!(msg.contains("visible-out"), "stdout missing: {}", msg);
        assert!(msg.contains("visible-err"), "stderr missing: {}", msg);
    }

    #[test]
    fn test_run_success_is_quiet() {
        let machine = Machine::new();
        machine.run(&mut Command::new("true")).unwrap();
    }
}
