//! systemd-nspawn adapter for the [`ContainerRuntime`] trait.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use kiln_common::{KilnError, KilnResult};
use tokio::process::Command;

use super::{ContainerRuntime, MachineState};

/// Paths whose presence marks a root filesystem as bootable.
const BOOTABLE_FILES: &[&str] = &[
    "usr/lib/systemd/systemd",
    "lib/systemd/systemd",
    "sbin/init",
];

/// How often readiness and shutdown polls sample machine state.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Whether the tree at `root` contains a recognized init binary.
#[must_use]
pub fn is_bootable(root: &Path) -> bool {
    BOOTABLE_FILES.iter().any(|file| root.join(file).exists())
}

/// Drives containers through `systemd-nspawn`, `systemd-run`,
/// `machinectl`, and `systemctl`.
#[derive(Debug, Clone)]
pub struct NspawnRuntime {
    /// Deadline for a boot to report readiness.
    pub boot_timeout: Duration,
    /// Grace period for a power-off before escalating to terminate.
    pub poweroff_timeout: Duration,
}

impl Default for NspawnRuntime {
    fn default() -> Self {
        Self {
            boot_timeout: Duration::from_secs(60),
            poweroff_timeout: Duration::from_secs(5),
        }
    }
}

impl NspawnRuntime {
    /// `systemctl is-system-running -M <id>`, trimmed.
    async fn machine_status(machine_id: &str) -> String {
        let output = Command::new("systemctl")
            .args(["is-system-running", "-M", machine_id])
            .env("LANG", "C")
            .output()
            .await;
        match output {
            Ok(output) => {
                let mut combined = output.stdout;
                combined.extend_from_slice(&output.stderr);
                String::from_utf8_lossy(&combined).trim().to_string()
            }
            Err(err) => {
                tracing::warn!(%err, "systemctl is-system-running failed to spawn");
                String::new()
            }
        }
    }

    async fn wait_until_dead(&self, machine_id: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if machine_dead(&Self::machine_status(machine_id).await) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl ContainerRuntime for NspawnRuntime {
    async fn launch_boot(
        &self,
        root: &Path,
        machine_id: &str,
        args: &[String],
    ) -> KilnResult<()> {
        tracing::info!(root = %root.display(), machine_id, "Booting container");

        let mut child = Command::new("systemd-nspawn")
            .arg("--quiet")
            .arg("-D")
            .arg(root)
            .arg("--boot")
            .args(["-M", machine_id])
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        // Readiness poll: the call returns only once the booted system
        // reports itself up, the launcher dies, or the deadline fires.
        let deadline = tokio::time::Instant::now() + self.boot_timeout;
        loop {
            if machine_running(&Self::machine_status(machine_id).await) {
                tracing::info!(machine_id, "Container booted");
                return Ok(());
            }
            if let Some(status) = child.try_wait()? {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    use tokio::io::AsyncReadExt;
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                return Err(KilnError::Cancelled {
                    reason: format!(
                        "launcher exited with {status} before boot finished: {}",
                        stderr.trim()
                    ),
                });
            }
            if tokio::time::Instant::now() >= deadline {
                child.start_kill()?;
                return Err(KilnError::Cancelled {
                    reason: format!("boot did not finish within {:?}", self.boot_timeout),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn launch_one_shot(
        &self,
        root: &Path,
        machine_id: &str,
        args: &[String],
    ) -> KilnResult<i32> {
        tracing::info!(root = %root.display(), machine_id, "Running one-shot container");

        let status = Command::new("systemd-nspawn")
            .arg("--quiet")
            .arg("-D")
            .arg(root)
            .args(["-M", machine_id])
            .args(args)
            .status()
            .await?;
        Ok(exit_code_of(status))
    }

    async fn run_in_session(&self, machine_id: &str, args: &[String]) -> KilnResult<i32> {
        let status = Command::new("systemd-run")
            .args(["--quiet", "--wait", "--pty", "-M", machine_id])
            .args(args)
            .status()
            .await?;
        Ok(exit_code_of(status))
    }

    async fn state(&self, machine_id: &str) -> MachineState {
        let status = Self::machine_status(machine_id).await;
        MachineState {
            running: machine_running(&status),
            dead: machine_dead(&status),
        }
    }

    async fn poweroff(&self, machine_id: &str) -> KilnResult<()> {
        let output = Command::new("machinectl")
            .args(["poweroff", "--quiet", machine_id])
            .output()
            .await?;
        if !output.status.success() {
            return Err(KilnError::Runtime {
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                exit_code: output.status.code(),
            });
        }
        if !self.wait_until_dead(machine_id, self.poweroff_timeout).await {
            tracing::warn!(machine_id, "Power-off timed out; terminating");
            self.terminate(machine_id).await?;
        }
        Ok(())
    }

    async fn terminate(&self, machine_id: &str) -> KilnResult<()> {
        let output = Command::new("machinectl")
            .args(["terminate", "--quiet", machine_id])
            .output()
            .await?;
        if !output.status.success() {
            return Err(KilnError::Runtime {
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                exit_code: output.status.code(),
            });
        }
        self.wait_until_dead(machine_id, self.poweroff_timeout).await;
        Ok(())
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Whether an `is-system-running` answer means the machine is up.
fn machine_running(status: &str) -> bool {
    matches!(status, "running" | "degraded")
}

/// Whether an `is-system-running` answer means the machine is gone.
fn machine_dead(status: &str) -> bool {
    status == "Failed to connect to bus: Host is down"
}
