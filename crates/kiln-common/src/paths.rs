//! The on-disk workspace layout.
//!
//! A kiln workspace is a single directory anchoring everything:
//!
//! ```text
//! <root>/
//!   .kiln/
//!     version                  version marker, exact string match
//!     container/
//!       dist/                  shared distribution layer (bottom of every stack)
//!       instances/
//!         <name>/
//!           layers/
//!             local/           persistent per-instance layer
//!             diff/            writable diff layer
//!           fs.lock            guards mount/unmount
//!           refractory.lock    guards run startup
//!           boot.lock          marks a boot-mode session
//!           machine-id         runtime identity while a session exists
//!   <name>/                    per-instance mount point
//! ```

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Name of the workspace marker directory.
pub const MARKER_DIR_NAME: &str = ".kiln";

/// Default workspace root directory.
pub static KILN_WORKSPACE: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("KILN_WORKSPACE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
});

/// Paths within one kiln workspace.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    /// Workspace root directory.
    pub root: PathBuf,
}

impl WorkspacePaths {
    /// Create paths rooted at the given directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The `.kiln` marker directory.
    #[must_use]
    pub fn marker_dir(&self) -> PathBuf {
        self.root.join(MARKER_DIR_NAME)
    }

    /// The version marker file.
    #[must_use]
    pub fn version_file(&self) -> PathBuf {
        self.marker_dir().join("version")
    }

    /// The container directory holding dist and instances.
    #[must_use]
    pub fn container_dir(&self) -> PathBuf {
        self.marker_dir().join("container")
    }

    /// The shared distribution layer.
    #[must_use]
    pub fn dist_dir(&self) -> PathBuf {
        self.container_dir().join("dist")
    }

    /// The directory holding all instance subdirectories.
    #[must_use]
    pub fn instances_dir(&self) -> PathBuf {
        self.container_dir().join("instances")
    }

    /// The subdirectory of a specific instance.
    #[must_use]
    pub fn instance_dir(&self, name: impl AsRef<str>) -> PathBuf {
        self.instances_dir().join(name.as_ref())
    }

    /// The layer directory of an instance.
    #[must_use]
    pub fn instance_layers(&self, name: impl AsRef<str>) -> PathBuf {
        self.instance_dir(name).join("layers")
    }

    /// The filesystem lock guarding mount/unmount of an instance.
    #[must_use]
    pub fn fs_lock(&self, name: impl AsRef<str>) -> PathBuf {
        self.instance_dir(name).join("fs.lock")
    }

    /// The refractory lock guarding run startup of an instance.
    #[must_use]
    pub fn refractory_lock(&self, name: impl AsRef<str>) -> PathBuf {
        self.instance_dir(name).join("refractory.lock")
    }

    /// The boot lock marking a boot-mode session of an instance.
    #[must_use]
    pub fn boot_lock(&self, name: impl AsRef<str>) -> PathBuf {
        self.instance_dir(name).join("boot.lock")
    }

    /// The machine-id file recording the current runtime identity.
    #[must_use]
    pub fn machine_id_file(&self, name: impl AsRef<str>) -> PathBuf {
        self.instance_dir(name).join("machine-id")
    }

    /// The mount point of an instance, directly under the root.
    #[must_use]
    pub fn mount_point(&self, name: impl AsRef<str>) -> PathBuf {
        self.root.join(name.as_ref())
    }
}

impl Default for WorkspacePaths {
    fn default() -> Self {
        Self {
            root: KILN_WORKSPACE.clone(),
        }
    }
}

impl AsRef<Path> for WorkspacePaths {
    fn as_ref(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let paths = WorkspacePaths::new("/work");
        assert_eq!(paths.version_file(), PathBuf::from("/work/.kiln/version"));
        assert_eq!(
            paths.dist_dir(),
            PathBuf::from("/work/.kiln/container/dist")
        );
        assert_eq!(
            paths.instance_dir("amd64"),
            PathBuf::from("/work/.kiln/container/instances/amd64")
        );
        assert_eq!(
            paths.instance_layers("amd64"),
            PathBuf::from("/work/.kiln/container/instances/amd64/layers")
        );
        assert_eq!(paths.mount_point("amd64"), PathBuf::from("/work/amd64"));
    }

    #[test]
    fn lock_files_sit_flat_in_instance_dir() {
        let paths = WorkspacePaths::new("/work");
        let dir = paths.instance_dir("main");
        assert_eq!(paths.fs_lock("main").parent().unwrap(), dir);
        assert_eq!(paths.refractory_lock("main").parent().unwrap(), dir);
        assert_eq!(paths.boot_lock("main").parent().unwrap(), dir);
        assert_eq!(paths.machine_id_file("main").parent().unwrap(), dir);
    }
}
