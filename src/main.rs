//! gardend CLI entry point.

use clap::{Parser, Subcommand};
use garden::{Backend, ContainerSpec, ProcessIo, ProcessSpec, TtySpec};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// gardend - drive garden containers from the command line
#[derive(Parser, Debug)]
#[command(name = "gardend")]
#[command(about = "container management over systemd-nspawn")]
#[command(version)]
struct Cli {
    /// Directory holding per-container working directories.
    #[arg(long, default_value = "/var/lib/garden")]
    containers_dir: PathBuf,

    /// Skeleton directory with the unit template and agent binaries.
    #[arg(long, default_value = "/usr/lib/garden/skeleton")]
    skeleton_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a container, run one command in it, then destroy it.
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Rootfs URI, e.g. raw:///images/base or docker:///ubuntu#24.04.
    #[arg(long)]
    rootfs: String,

    /// User to run as inside the container.
    #[arg(long, default_value = "root")]
    user: String,

    /// Working directory inside the container.
    #[arg(long)]
    dir: Option<String>,

    /// Allocate a controlling PTY.
    #[arg(long)]
    tty: bool,

    /// Command and arguments to run.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    init_logging();

    tracing::debug!(version = garden::VERSION, "starting gardend");

    let result = match cli.command {
        Commands::Run(args) => run(&cli.containers_dir, &cli.skeleton_dir, args),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// One full lifecycle: create, run, wait, destroy.
fn run(containers_dir: &PathBuf, skeleton_dir: &PathBuf, args: RunArgs) -> garden::Result<i32> {
    let mut command = args.command.into_iter();
    let path = command.next().expect("clap requires a command");

    let backend = Backend::new(containers_dir, skeleton_dir);
    backend.start()?;

    let container = backend.create(ContainerSpec {
        rootfs: args.rootfs,
        ..Default::default()
    })?;
    let handle = container.handle().to_string();

    let spec = ProcessSpec {
        path,
        args: command.collect(),
        dir: args.dir,
        user: args.user,
        tty: args.tty.then_some(TtySpec {
            columns: 80,
            rows: 24,
        }),
        ..Default::default()
    };

    let io = ProcessIo {
        stdin: Some(Box::new(std::io::stdin())),
        stdout: Some(Box::new(std::io::stdout())),
        stderr: Some(Box::new(std::io::stderr())),
    };

    let status = (|| {
        let mut process = container.run(spec, io)?;
        process.wait()
    })();

    if let Err(e) = backend.destroy(&handle) {
        tracing::warn!(handle = %handle, error = %e, "destroy failed");
    }

    status
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("garden=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
