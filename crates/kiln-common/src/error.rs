//! Common error types for the Kiln workspace.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`KilnError`].
pub type KilnResult<T> = Result<T, KilnError>;

/// Common errors across the Kiln workspace.
#[derive(Error, Diagnostic, Debug)]
pub enum KilnError {
    /// Instance not found.
    #[error("Instance not found: {name}")]
    #[diagnostic(code(kiln::instance::not_found))]
    InstanceNotFound {
        /// The instance name that was not found.
        name: String,
    },

    /// Instance already exists.
    #[error("Instance already exists: {name}")]
    #[diagnostic(code(kiln::instance::exists))]
    InstanceExists {
        /// The colliding instance name.
        name: String,
    },

    /// Invalid instance name.
    #[error("Invalid instance name: {name:?}")]
    #[diagnostic(
        code(kiln::instance::invalid_name),
        help("Instance names must not contain path separators or whitespace")
    )]
    InvalidInstanceName {
        /// The invalid name.
        name: String,
    },

    /// A lock is already held by another operation.
    #[error("Another operation is in progress on {path}")]
    #[diagnostic(
        code(kiln::lock::contention),
        help("Wait for the other operation to finish, or clear a stale lock manually")
    )]
    LockContention {
        /// The contended lock file.
        path: PathBuf,
    },

    /// Another run session is currently starting on this instance.
    #[error("Another run session is starting on instance {name}")]
    #[diagnostic(code(kiln::instance::mode_conflict))]
    ModeConflict {
        /// The busy instance.
        name: String,
    },

    /// The instance's filesystem is not mounted.
    #[error("Instance {name} is not mounted")]
    #[diagnostic(code(kiln::instance::not_mounted))]
    NotMounted {
        /// The instance name.
        name: String,
    },

    /// Not a kiln workspace.
    #[error("Not a kiln workspace: {path}")]
    #[diagnostic(
        code(kiln::workspace::missing),
        help("Run `kiln init` in the directory first")
    )]
    NotAWorkspace {
        /// The checked directory.
        path: PathBuf,
    },

    /// On-disk workspace version does not match this build.
    #[error("Incompatible workspace version {found} (expected {expected})")]
    #[diagnostic(code(kiln::workspace::version))]
    VersionMismatch {
        /// Version string read from disk.
        found: String,
        /// Version this build expects.
        expected: String,
    },

    /// An external runtime launch, run, or stop failed.
    #[error("Container runtime failure: {message}")]
    #[diagnostic(code(kiln::runtime::failure))]
    Runtime {
        /// Diagnostic output from the runtime.
        message: String,
        /// The underlying process exit code, when one exists.
        exit_code: Option<i32>,
    },

    /// A boot or shutdown wait was cancelled or timed out.
    #[error("Cancelled: {reason}")]
    #[diagnostic(code(kiln::runtime::cancelled))]
    Cancelled {
        /// Why the wait ended early.
        reason: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(kiln::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(kiln::serialization))]
    Serialization(String),

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(
        code(kiln::unsupported),
        help("Kiln requires a Linux kernel with overlayfs support")
    )]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(kiln::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl KilnError {
    /// The exit code carried by a runtime failure, if any.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Runtime { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::Serialization(err.to_string())
    }
}
