//! External container-runtime collaborators.
//!
//! The core never supervises container processes itself; it talks to an
//! external runtime through [`ContainerRuntime`] and classifies sessions
//! through [`SessionClassifier`], so both can be stubbed in tests.

pub mod nspawn;
pub mod proc;

use std::path::Path;

use async_trait::async_trait;
use kiln_common::KilnResult;

pub use nspawn::{NspawnRuntime, is_bootable};
pub use proc::NspawnClassifier;

/// Liveness of a runtime session, as reported by the external runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MachineState {
    /// The session reports itself fully up (running or degraded).
    pub running: bool,
    /// The session is gone for good, as opposed to still booting.
    pub dead: bool,
}

/// The external container runtime the core delegates process work to.
///
/// All calls are blocking RPC-style operations; process exit codes are
/// the primary success signal.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Boot a container at `root` under `machine_id`.
    ///
    /// Blocks until the booted environment reports itself initialized.
    ///
    /// # Errors
    ///
    /// [`KilnError::Cancelled`](kiln_common::KilnError::Cancelled) when
    /// the launch aborts or the readiness wait times out.
    async fn launch_boot(&self, root: &Path, machine_id: &str, args: &[String])
    -> KilnResult<()>;

    /// Run a single command in a fresh one-shot (chroot-style) container.
    ///
    /// Returns the command's exit code.
    async fn launch_one_shot(
        &self,
        root: &Path,
        machine_id: &str,
        args: &[String],
    ) -> KilnResult<i32>;

    /// Run a command inside an already-running session.
    async fn run_in_session(&self, machine_id: &str, args: &[String]) -> KilnResult<i32>;

    /// Query the liveness of a session.
    async fn state(&self, machine_id: &str) -> MachineState;

    /// Request a graceful power-off of a booted session.
    async fn poweroff(&self, machine_id: &str) -> KilnResult<()>;

    /// Terminate a session immediately.
    async fn terminate(&self, machine_id: &str) -> KilnResult<()>;
}

/// Decides whether a live session is a boot-mode session.
///
/// The one place the core inspects external process state rather than its
/// own lock files; implementations must tolerate the session disappearing
/// mid-query and report `false` rather than an error.
pub trait SessionClassifier: Send + Sync {
    /// Whether the session behind `machine_id` was started in boot mode.
    fn is_boot_session(&self, machine_id: &str) -> KilnResult<bool>;
}
