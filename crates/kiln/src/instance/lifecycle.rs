//! The per-instance state machine.
//!
//! Three file-presence locks guard an instance:
//!
//! * `fs.lock`: the union filesystem is (or is about to be) mounted.
//! * `refractory.lock`: a session is being set up; held for the whole
//!   lifetime of a one-shot session, but only until the boot-vs-reuse
//!   decision for booted sessions.
//! * `boot.lock`: a booted session exists; released when it is powered
//!   off or found dead.
//!
//! The recorded runtime identity lives next to them in `machine-id`.

use std::path::PathBuf;
use std::sync::Arc;

use kiln_common::{InstanceName, KilnError, KilnResult, WorkspacePaths};
use uuid::Uuid;

use super::status::{FsState, InstanceStatus, RunState};
use crate::filesystem::{LayerStack, is_mounted};
use crate::lock::FileLock;
use crate::runner::{ContainerRuntime, SessionClassifier, is_bootable};

/// How a session should be started.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Boot the container's own service manager when the tree has one.
    pub boot: bool,
    /// Attach the session to the shared network zone.
    pub network: bool,
    /// Extra arguments for the container runtime itself.
    pub runtime_args: Vec<String>,
    /// The command to execute inside the container.
    pub command: Vec<String>,
}

/// One named build container.
pub struct Instance {
    name: InstanceName,
    paths: WorkspacePaths,
    runtime: Arc<dyn ContainerRuntime>,
    classifier: Arc<dyn SessionClassifier>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.name)
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

impl Instance {
    /// Binds an instance handle to workspace paths and a runtime.
    pub fn new(
        name: InstanceName,
        paths: WorkspacePaths,
        runtime: Arc<dyn ContainerRuntime>,
        classifier: Arc<dyn SessionClassifier>,
    ) -> Self {
        Self {
            name,
            paths,
            runtime,
            classifier,
        }
    }

    /// The instance name.
    pub fn name(&self) -> &InstanceName {
        &self.name
    }

    /// Where the union filesystem is mounted.
    pub fn mount_point(&self) -> PathBuf {
        self.paths.mount_point(&self.name)
    }

    /// The layer stack backing this instance.
    #[must_use]
    pub fn layer_stack(&self) -> LayerStack {
        LayerStack::from_dist(
            &self.paths.dist_dir(),
            &self.paths.instance_layers(&self.name),
            &self.mount_point(),
        )
    }

    fn fs_lock(&self) -> FileLock {
        FileLock::new(self.paths.fs_lock(&self.name))
    }

    fn refractory_lock(&self) -> FileLock {
        FileLock::new(self.paths.refractory_lock(&self.name))
    }

    fn boot_lock(&self) -> FileLock {
        FileLock::new(self.paths.boot_lock(&self.name))
    }

    /// The recorded runtime identity, if a session exists.
    pub fn machine_id(&self) -> Option<String> {
        let raw = std::fs::read_to_string(self.paths.machine_id_file(&self.name)).ok()?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_owned())
        }
    }

    fn set_machine_id(&self, id: &str) -> KilnResult<()> {
        std::fs::write(self.paths.machine_id_file(&self.name), id)?;
        Ok(())
    }

    fn clear_machine_id(&self) {
        if let Err(err) = std::fs::remove_file(self.paths.machine_id_file(&self.name)) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(instance = %self.name, %err, "could not remove machine id");
            }
        }
    }

    /// Whether the union filesystem is currently mounted.
    pub fn mounted(&self) -> KilnResult<bool> {
        is_mounted(&self.mount_point())
    }

    /// Claims the filesystem lock, recovering it when it is stale.
    ///
    /// A held lock without a backing mount means a previous process died
    /// between locking and mounting (or after unmounting); the mount table
    /// is the source of truth, so the orphaned lock is discarded.
    pub(crate) fn acquire_fs_lock(&self) -> KilnResult<()> {
        let lock = self.fs_lock();
        if lock.try_acquire() {
            return Ok(());
        }
        if self.mounted()? {
            return Err(KilnError::LockContention {
                path: lock.path().to_path_buf(),
            });
        }
        tracing::warn!(instance = %self.name, "recovering stale filesystem lock");
        lock.release();
        if lock.try_acquire() {
            Ok(())
        } else {
            Err(KilnError::LockContention {
                path: lock.path().to_path_buf(),
            })
        }
    }

    /// Mounts the union filesystem writable at the mount point.
    pub fn mount(&self) -> KilnResult<()> {
        self.acquire_fs_lock()?;
        if let Err(err) = self.layer_stack().mount(true) {
            self.fs_lock().release();
            return Err(err);
        }
        Ok(())
    }

    /// Stops any session, then tears down the union mount.
    ///
    /// Returns [`KilnError::NotMounted`] when there was nothing to unmount;
    /// lock and mount point cleanup still happens in that case.
    pub async fn unmount(&self) -> KilnResult<()> {
        self.stop().await?;
        let was_mounted = self.mounted()?;
        if was_mounted {
            self.layer_stack().unmount()?;
        }
        match std::fs::remove_dir(self.mount_point()) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::debug!(instance = %self.name, %err, "mount point not removed");
            }
        }
        self.fs_lock().release();
        if was_mounted {
            Ok(())
        } else {
            Err(KilnError::NotMounted {
                name: self.name.to_string(),
            })
        }
    }

    /// Folds the instance's private layers down into the distribution layer.
    pub fn commit(&self) -> KilnResult<()> {
        if self.mounted()? {
            return Err(KilnError::Internal {
                message: format!("instance `{}` must be unmounted before commit", self.name),
            });
        }
        self.layer_stack().merge()
    }

    /// Discards everything the instance has written on top of the base.
    pub fn rollback(&self) -> KilnResult<()> {
        if self.mounted()? {
            return Err(KilnError::Internal {
                message: format!("instance `{}` must be unmounted before rollback", self.name),
            });
        }
        self.layer_stack().rollback()
    }

    /// Runs a command inside the container, booting or reusing a session
    /// as needed, and returns the command's exit code.
    pub async fn run(&self, opts: RunOptions) -> KilnResult<i32> {
        let refractory = self.refractory_lock();
        if !refractory.try_acquire() {
            return Err(KilnError::ModeConflict {
                name: self.name.to_string(),
            });
        }

        let fresh_id = self.generate_machine_id();
        if opts.boot && is_bootable(&self.mount_point()) {
            self.run_booted(&refractory, fresh_id, &opts).await
        } else {
            let result = self.run_one_shot(&fresh_id, &opts).await;
            self.clear_machine_id();
            refractory.release();
            result
        }
    }

    async fn run_booted(
        &self,
        refractory: &FileLock,
        fresh_id: String,
        opts: &RunOptions,
    ) -> KilnResult<i32> {
        let mut machine_id = fresh_id;
        let mut to_boot = false;
        match self.machine_id() {
            None => {
                to_boot = true;
            }
            Some(recorded) => {
                if self.runtime.state(&recorded).await.running {
                    // Live booted session: run inside it.
                    machine_id = recorded;
                } else {
                    tracing::info!(instance = %self.name, "previous session is gone, booting anew");
                    self.boot_lock().release();
                    self.clear_machine_id();
                    to_boot = true;
                }
            }
        }
        if to_boot {
            if !self.boot_lock().try_acquire() {
                refractory.release();
                return Err(KilnError::ModeConflict {
                    name: self.name.to_string(),
                });
            }
            if let Err(err) = self.set_machine_id(&machine_id) {
                self.boot_lock().release();
                refractory.release();
                return Err(err);
            }
        }
        // The boot-vs-reuse decision is made; later one-shot attempts must
        // be told apart by the boot lock, not by this one.
        refractory.release();

        if to_boot {
            let mut runtime_args = opts.runtime_args.clone();
            if opts.network {
                runtime_args.insert(0, "--network-zone=kiln".to_owned());
            }
            if let Err(err) = self
                .runtime
                .launch_boot(&self.mount_point(), &machine_id, &runtime_args)
                .await
            {
                self.clear_machine_id();
                self.boot_lock().release();
                return Err(err);
            }
        }

        let result = self.runtime.run_in_session(&machine_id, &opts.command).await;
        let state = self.runtime.state(&machine_id).await;
        if !state.running && state.dead {
            // The session went away underneath us (poweroff from inside).
            self.clear_machine_id();
            self.boot_lock().release();
        }
        result
    }

    async fn run_one_shot(&self, machine_id: &str, opts: &RunOptions) -> KilnResult<i32> {
        self.set_machine_id(machine_id)?;
        let mut args = opts.runtime_args.clone();
        args.extend(opts.command.iter().cloned());
        self.runtime
            .launch_one_shot(&self.mount_point(), machine_id, &args)
            .await
    }

    /// Stops the recorded session, if any. Absence of a session is not an
    /// error.
    pub async fn stop(&self) -> KilnResult<()> {
        let Some(machine_id) = self.machine_id() else {
            tracing::debug!(instance = %self.name, "no session to stop");
            return Ok(());
        };
        if self.boot_lock().is_held() {
            self.runtime.poweroff(&machine_id).await?;
            self.boot_lock().release();
            self.clear_machine_id();
        } else {
            self.runtime.terminate(&machine_id).await?;
            self.clear_machine_id();
            self.refractory_lock().release();
        }
        Ok(())
    }

    /// Whether any session currently claims this instance.
    ///
    /// A held refractory lock counts as running even before a machine id
    /// exists: another process is mid-setup and the instance is not free.
    pub async fn running(&self) -> bool {
        if self.refractory_lock().is_held() {
            return true;
        }
        let Some(machine_id) = self.machine_id() else {
            return false;
        };
        if self.boot_lock().is_held() {
            let state = self.runtime.state(&machine_id).await;
            state.running || !state.dead
        } else {
            true
        }
    }

    /// Whether the live session, if any, runs its own service manager.
    pub async fn running_as_boot(&self) -> bool {
        let Some(machine_id) = self.machine_id() else {
            return false;
        };
        let state = self.runtime.state(&machine_id).await;
        if !state.running && state.dead {
            return false;
        }
        self.classifier
            .is_boot_session(&machine_id)
            .unwrap_or(false)
    }

    /// Builds a status snapshot, clearing session bookkeeping that the
    /// runtime reports as dead.
    pub async fn status(&self) -> KilnResult<InstanceStatus> {
        let filesystem = if self.mounted()? {
            FsState::Mounted
        } else {
            FsState::Free
        };
        let machine_id = self.machine_id();
        // The refractory lock wins over the machine id: a one-shot in
        // flight carries both.
        let (run, boot) = if self.refractory_lock().is_held() {
            (RunState::Locked, false)
        } else {
            match &machine_id {
                None => (RunState::Offline, false),
                Some(id) => {
                    if self.boot_lock().is_held() {
                        let state = self.runtime.state(id).await;
                        if state.running {
                            (RunState::Running, true)
                        } else if state.dead {
                            self.clear_machine_id();
                            self.boot_lock().release();
                            (RunState::Offline, false)
                        } else {
                            (RunState::Linger, true)
                        }
                    } else {
                        (RunState::Running, false)
                    }
                }
            }
        };
        Ok(InstanceStatus {
            name: self.name.to_string(),
            filesystem,
            run,
            boot,
            machine_id: if run == RunState::Offline {
                None
            } else {
                machine_id
            },
        })
    }

    /// Resolves a user's login shell from the container's `/etc/passwd`.
    ///
    /// Falls back to `/bin/sh` when the user has no entry.
    pub fn shell_for(&self, user: &str) -> KilnResult<String> {
        let passwd = std::fs::read_to_string(self.mount_point().join("etc/passwd"))?;
        for line in passwd.lines() {
            let mut fields = line.split(':');
            if fields.next() == Some(user) {
                if let Some(shell) = fields.nth(5) {
                    if !shell.is_empty() {
                        return Ok(shell.to_owned());
                    }
                }
            }
        }
        Ok("/bin/sh".to_owned())
    }

    fn generate_machine_id(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}_{}", self.name, &suffix[..6])
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::runner::MachineState;

    #[derive(Default)]
    struct StubRuntime {
        alive: Mutex<HashSet<String>>,
        exit_code: i32,
        boot_fails: bool,
    }

    impl StubRuntime {
        fn with_exit_code(code: i32) -> Self {
            Self {
                exit_code: code,
                ..Self::default()
            }
        }

        fn mark_alive(&self, id: &str) {
            self.alive.lock().unwrap().insert(id.to_owned());
        }

        fn is_alive(&self, id: &str) -> bool {
            self.alive.lock().unwrap().contains(id)
        }
    }

    #[async_trait]
    impl ContainerRuntime for StubRuntime {
        async fn launch_boot(
            &self,
            _root: &std::path::Path,
            machine_id: &str,
            _args: &[String],
        ) -> KilnResult<()> {
            if self.boot_fails {
                return Err(KilnError::Cancelled {
                    reason: "boot did not come up".to_owned(),
                });
            }
            self.mark_alive(machine_id);
            Ok(())
        }

        async fn launch_one_shot(
            &self,
            _root: &std::path::Path,
            _machine_id: &str,
            _args: &[String],
        ) -> KilnResult<i32> {
            Ok(self.exit_code)
        }

        async fn run_in_session(&self, machine_id: &str, _args: &[String]) -> KilnResult<i32> {
            if self.is_alive(machine_id) {
                Ok(self.exit_code)
            } else {
                Err(KilnError::Runtime {
                    message: format!("no session {machine_id}"),
                    exit_code: None,
                })
            }
        }

        async fn state(&self, machine_id: &str) -> MachineState {
            let running = self.is_alive(machine_id);
            MachineState {
                running,
                dead: !running,
            }
        }

        async fn poweroff(&self, machine_id: &str) -> KilnResult<()> {
            self.alive.lock().unwrap().remove(machine_id);
            Ok(())
        }

        async fn terminate(&self, machine_id: &str) -> KilnResult<()> {
            self.alive.lock().unwrap().remove(machine_id);
            Ok(())
        }
    }

    struct StubClassifier(bool);

    impl SessionClassifier for StubClassifier {
        fn is_boot_session(&self, _machine_id: &str) -> KilnResult<bool> {
            Ok(self.0)
        }
    }

    fn instance(temp: &TempDir, runtime: Arc<StubRuntime>) -> Instance {
        let paths = WorkspacePaths::new(temp.path());
        let name: InstanceName = "main".parse().unwrap();
        std::fs::create_dir_all(paths.instance_dir(&name)).unwrap();
        Instance::new(name, paths, runtime, Arc::new(StubClassifier(true)))
    }

    fn make_bootable(inst: &Instance) {
        let systemd = inst.mount_point().join("usr/lib/systemd");
        std::fs::create_dir_all(&systemd).unwrap();
        std::fs::write(systemd.join("systemd"), b"").unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn one_shot_run_returns_exit_code_and_cleans_up() {
        let temp = TempDir::new().unwrap();
        let runtime = Arc::new(StubRuntime::with_exit_code(7));
        let inst = instance(&temp, runtime);
        std::fs::create_dir_all(inst.mount_point()).unwrap();

        let code = inst
            .run(RunOptions {
                command: vec!["true".to_owned()],
                ..RunOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(code, 7);
        assert!(inst.machine_id().is_none());
        assert!(!inst.running().await);
    }

    #[test_log::test(tokio::test)]
    async fn held_refractory_lock_rejects_concurrent_run() {
        let temp = TempDir::new().unwrap();
        let runtime = Arc::new(StubRuntime::default());
        let inst = instance(&temp, runtime);
        let other = FileLock::new(inst.paths.refractory_lock(&inst.name));
        assert!(other.try_acquire());

        let err = inst.run(RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, KilnError::ModeConflict { .. }));
        // The foreign lock must survive the rejected attempt.
        assert!(other.is_held());
        assert!(inst.running().await);
    }

    #[test_log::test(tokio::test)]
    async fn boot_run_records_session_and_stop_clears_it() {
        let temp = TempDir::new().unwrap();
        let runtime = Arc::new(StubRuntime::with_exit_code(0));
        let inst = instance(&temp, Arc::clone(&runtime));
        make_bootable(&inst);

        let code = inst
            .run(RunOptions {
                boot: true,
                command: vec!["true".to_owned()],
                ..RunOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(code, 0);

        let id = inst.machine_id().expect("session survives the command");
        assert!(id.starts_with("main_"));
        assert!(runtime.is_alive(&id));
        assert!(inst.running().await);
        assert!(inst.running_as_boot().await);

        inst.stop().await.unwrap();
        assert!(inst.machine_id().is_none());
        assert!(!runtime.is_alive(&id));
        assert!(!inst.running().await);
    }

    #[test_log::test(tokio::test)]
    async fn second_boot_run_reuses_live_session() {
        let temp = TempDir::new().unwrap();
        let runtime = Arc::new(StubRuntime::default());
        let inst = instance(&temp, Arc::clone(&runtime));
        make_bootable(&inst);

        let opts = RunOptions {
            boot: true,
            command: vec!["true".to_owned()],
            ..RunOptions::default()
        };
        inst.run(opts.clone()).await.unwrap();
        let first = inst.machine_id().unwrap();
        inst.run(opts).await.unwrap();
        assert_eq!(inst.machine_id().unwrap(), first);
    }

    #[test_log::test(tokio::test)]
    async fn failed_boot_rolls_back_session_state() {
        let temp = TempDir::new().unwrap();
        let runtime = Arc::new(StubRuntime {
            boot_fails: true,
            ..StubRuntime::default()
        });
        let inst = instance(&temp, runtime);
        make_bootable(&inst);

        let err = inst
            .run(RunOptions {
                boot: true,
                ..RunOptions::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::Cancelled { .. }));
        assert!(inst.machine_id().is_none());
        assert!(!inst.running().await);
        // Another run attempt must not be blocked by leftover locks.
        assert!(inst.refractory_lock().try_acquire());
    }

    #[test_log::test(tokio::test)]
    async fn stale_filesystem_lock_is_recovered() {
        let temp = TempDir::new().unwrap();
        let runtime = Arc::new(StubRuntime::default());
        let inst = instance(&temp, runtime);
        std::fs::write(inst.paths.fs_lock(&inst.name), b"").unwrap();

        inst.acquire_fs_lock().unwrap();
        assert!(inst.fs_lock().is_held());
    }

    #[test_log::test(tokio::test)]
    async fn status_reports_offline_for_fresh_instance() {
        let temp = TempDir::new().unwrap();
        let runtime = Arc::new(StubRuntime::default());
        let inst = instance(&temp, runtime);

        let status = inst.status().await.unwrap();
        assert_eq!(status.filesystem, FsState::Free);
        assert_eq!(status.run, RunState::Offline);
        assert!(!status.boot);
    }

    #[test_log::test(tokio::test)]
    async fn status_reports_locked_during_one_shot() {
        let temp = TempDir::new().unwrap();
        let runtime = Arc::new(StubRuntime::default());
        let inst = instance(&temp, runtime);
        // A one-shot in flight holds the refractory lock and has a
        // recorded machine id at the same time.
        assert!(inst.refractory_lock().try_acquire());
        inst.set_machine_id("main_busy01").unwrap();

        let status = inst.status().await.unwrap();
        assert_eq!(status.run, RunState::Locked);
        assert!(!status.boot);
    }

    #[test_log::test(tokio::test)]
    async fn status_clears_dead_boot_session() {
        let temp = TempDir::new().unwrap();
        let runtime = Arc::new(StubRuntime::default());
        let inst = instance(&temp, runtime);
        inst.set_machine_id("main_dead01").unwrap();
        assert!(inst.boot_lock().try_acquire());

        let status = inst.status().await.unwrap();
        assert_eq!(status.run, RunState::Offline);
        assert!(inst.machine_id().is_none());
        assert!(!inst.boot_lock().is_held());
    }

    #[test_log::test(tokio::test)]
    async fn shell_for_reads_container_passwd() {
        let temp = TempDir::new().unwrap();
        let runtime = Arc::new(StubRuntime::default());
        let inst = instance(&temp, runtime);
        let etc = inst.mount_point().join("etc");
        std::fs::create_dir_all(&etc).unwrap();
        std::fs::write(
            etc.join("passwd"),
            "root:x:0:0:root:/root:/bin/zsh\nbuilder:x:1000:1000::/home/builder:/bin/sh\n",
        )
        .unwrap();

        assert_eq!(inst.shell_for("root").unwrap(), "/bin/zsh");
        assert_eq!(inst.shell_for("builder").unwrap(), "/bin/sh");
        assert_eq!(inst.shell_for("nobody").unwrap(), "/bin/sh");
    }
}
