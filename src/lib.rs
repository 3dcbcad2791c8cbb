//! garden - container management over systemd-nspawn machines.
//!
//! The host side of a two-process system: containers boot as ephemeral
//! nspawn machines whose init payload is the `wshd` supervisor (built from
//! `crates/garden-agent`). Processes run *inside* a container, but their
//! stdio and exit status are owned by the host: wshd passes the actual
//! file descriptors back over a Unix socket with SCM_RIGHTS.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │  Backend (registry, create/destroy)            │
//! ├────────────────────────────────────────────────┤
//! │  Container (properties, run/attach, streams)   │
//! ├───────────────────────┬────────────────────────┤
//! │  Wshd proxy (socket,  │  Machine (systemctl /  │
//! │  SCM_RIGHTS, copiers) │  machinectl verbs)     │
//! ├───────────────────────┴────────────────────────┤
//! │  wshd supervisor inside the nspawn machine     │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use garden::{Backend, ContainerSpec, ProcessIo, ProcessSpec};
//!
//! let backend = Backend::new("/var/lib/garden", "/usr/lib/garden/skeleton");
//! backend.start().unwrap();
//!
//! let container = backend
//!     .create(ContainerSpec {
//!         rootfs: "raw:///images/base".to_string(),
//!         ..Default::default()
//!     })
//!     .unwrap();
//!
//! let mut process = container
//!     .run(
//!         ProcessSpec {
//!             path: "/bin/echo".to_string(),
//!             args: vec!["hello".to_string()],
//!             ..Default::default()
//!         },
//!         ProcessIo {
//!             stdout: Some(Box::new(std::io::stdout())),
//!             ..Default::default()
//!         },
//!     )
//!     .unwrap();
//!
//! let status = process.wait().unwrap();
//! println!("exited: {}", status);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod container;
pub mod error;
pub mod machine;
pub mod process;
pub mod rootfs;
pub mod wshd;

// Re-export main types for convenience
pub use backend::Backend;
pub use container::{BindMount, BindMountMode, Container, ContainerSpec, Properties, StreamOut};
pub use error::{Error, Result};
pub use garden_protocol::{Signal, TtySpec};
pub use process::{Process, ProcessIo};
pub use rootfs::RootFs;
pub use wshd::ProcessSpec;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
