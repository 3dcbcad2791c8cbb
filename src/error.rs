//! Error types for the garden host side.
//!
//! Error messages are lowercase and follow either
//! `"<operation> failed: <reason>"` or `"<entity> not found: <identifier>"`,
//! with identifiers included wherever they exist. Failures of the machine
//! runtime carry the command and its captured output verbatim so the caller
//! can diagnose what systemd or machinectl actually said.

use thiserror::Error;

/// Result type alias using garden's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the backend, containers, and the host proxy.
#[derive(Error, Debug)]
pub enum Error {
    /// Lookup, destroy, or per-container call on an unknown handle.
    #[error("container not found: {handle}")]
    ContainerNotFound {
        /// The handle that was looked up.
        handle: String,
    },

    /// GetProperty/RemoveProperty on an absent key.
    #[error("property does not exist: {key}")]
    UndefinedProperty {
        /// The missing property key.
        key: String,
    },

    /// Missing, malformed, or unsupported rootfs URI.
    #[error("invalid rootfs: {0}")]
    InvalidRootfs(String),

    /// A machine-runtime, systemd, or filesystem operation failed.
    #[error("command '{command}' failed: {reason}")]
    Runtime {
        /// The command (with arguments) that failed.
        command: String,
        /// Exit status plus captured stdout/stderr.
        reason: String,
    },

    /// The agent reported a failure in its response.
    #[error("remote error: {0}")]
    Remote(String),

    /// Short or malformed response, or missing SCM_RIGHTS where expected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// IO error wrapper.
    #[error("io operation failed: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a container-not-found error.
    pub fn container_not_found(handle: impl Into<String>) -> Self {
        Self::ContainerNotFound {
            handle: handle.into(),
        }
    }

    /// Create an undefined-property error.
    pub fn undefined_property(key: impl Into<String>) -> Self {
        Self::UndefinedProperty { key: key.into() }
    }

    /// Create an invalid-rootfs error.
    pub fn invalid_rootfs(reason: impl Into<String>) -> Self {
        Self::InvalidRootfs(reason.into())
    }

    /// Create a runtime-command error.
    pub fn runtime(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Runtime {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Create a remote error from an agent response.
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote(message.into())
    }

    /// Create a protocol error.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol(reason.into())
    }

    /// True for failures that mean "the thing you named does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ContainerNotFound { .. })
    }
}

impl From<garden_protocol::DecodeError> for Error {
    fn from(e: garden_protocol::DecodeError) -> Self {
        match e {
            garden_protocol::DecodeError::Io(io) => Self::Io(io),
            other => Self::Protocol(other.to_string()),
        }
    }
}
