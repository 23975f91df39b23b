//! The workspace root: a directory marked by `.kiln/` with a version file.

use std::path::Path;
use std::sync::Arc;

use kiln_common::{KilnError, KilnResult, WorkspacePaths};

use super::ContainerSet;
use crate::runner::{ContainerRuntime, SessionClassifier};

/// The on-disk layout version this build understands.
pub const CURRENT_VERSION: &str = "3";

/// A validated workspace root directory.
#[derive(Debug)]
pub struct Workspace {
    paths: WorkspacePaths,
}

impl Workspace {
    /// Opens an existing workspace, checking the marker and its version.
    pub fn open(root: impl AsRef<Path>) -> KilnResult<Self> {
        let paths = WorkspacePaths::new(root.as_ref());
        Self::check(&paths)?;
        Ok(Self { paths })
    }

    /// Creates the workspace layout under `root`.
    ///
    /// Fails when the directory is already a workspace.
    pub fn init(root: impl AsRef<Path>) -> KilnResult<Self> {
        let paths = WorkspacePaths::new(root.as_ref());
        if paths.marker_dir().exists() {
            return Err(KilnError::Internal {
                message: format!("`{}` is already a workspace", root.as_ref().display()),
            });
        }
        std::fs::create_dir_all(paths.marker_dir())?;
        std::fs::write(paths.version_file(), CURRENT_VERSION)?;
        std::fs::create_dir_all(paths.dist_dir())?;
        std::fs::create_dir_all(paths.instances_dir())?;
        tracing::info!(root = %root.as_ref().display(), "workspace initialized");
        Ok(Self { paths })
    }

    fn check(paths: &WorkspacePaths) -> KilnResult<()> {
        if !paths.marker_dir().is_dir() {
            return Err(KilnError::NotAWorkspace {
                path: paths.root.clone(),
            });
        }
        let found = std::fs::read_to_string(paths.version_file())
            .map(|raw| raw.trim().to_owned())
            .unwrap_or_default();
        if found != CURRENT_VERSION {
            return Err(KilnError::VersionMismatch {
                found,
                expected: CURRENT_VERSION.to_owned(),
            });
        }
        Ok(())
    }

    /// The path layout of this workspace.
    #[must_use]
    pub fn paths(&self) -> &WorkspacePaths {
        &self.paths
    }

    /// The container set of this workspace, bound to a runtime.
    pub fn containers(
        &self,
        runtime: Arc<dyn ContainerRuntime>,
        classifier: Arc<dyn SessionClassifier>,
    ) -> ContainerSet {
        ContainerSet::new(self.paths.clone(), runtime, classifier)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn init_then_open() {
        let temp = TempDir::new().unwrap();
        Workspace::init(temp.path()).unwrap();

        let ws = Workspace::open(temp.path()).unwrap();
        assert!(ws.paths().dist_dir().is_dir());
        assert!(ws.paths().instances_dir().is_dir());
    }

    #[test]
    fn open_rejects_plain_directory() {
        let temp = TempDir::new().unwrap();
        let err = Workspace::open(temp.path()).unwrap_err();
        assert!(matches!(err, KilnError::NotAWorkspace { .. }));
    }

    #[test]
    fn open_rejects_foreign_version() {
        let temp = TempDir::new().unwrap();
        Workspace::init(temp.path()).unwrap();
        let paths = WorkspacePaths::new(temp.path());
        std::fs::write(paths.version_file(), "2\n").unwrap();

        let err = Workspace::open(temp.path()).unwrap_err();
        match err {
            KilnError::VersionMismatch { found, expected } => {
                assert_eq!(found, "2");
                assert_eq!(expected, CURRENT_VERSION);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn double_init_is_rejected() {
        let temp = TempDir::new().unwrap();
        Workspace::init(temp.path()).unwrap();
        assert!(Workspace::init(temp.path()).is_err());
    }
}
