//! Overlay union mounts over an ordered layer stack.

use std::path::{Path, PathBuf};

use kiln_common::{KilnError, KilnResult};

/// Suffix of the scratch work directory required by overlayfs, created as
/// a sibling of the upper (diff) layer.
pub const WORK_DIR_SUFFIX: &str = ".tmp";

/// Names of the private layers inside an instance's `layers` directory,
/// bottom to top.
const PRIVATE_LAYERS: &[&str] = &["local", "diff"];

/// An ordered stack of layer directories unioned into one mount view.
///
/// Precedence increases with index: layer 0 is the shared distribution
/// layer, the last entry is the writable diff layer. A stack needs at
/// least two entries to mount read-write.
#[derive(Debug, Clone)]
pub struct LayerStack {
    /// Where the union view is mounted.
    pub mount_point: PathBuf,
    /// Layer directories, lowest precedence first.
    pub layers: Vec<PathBuf>,
}

impl LayerStack {
    /// Create the private layer directories for a new instance.
    pub fn create(layers_dir: &Path) -> KilnResult<()> {
        std::fs::create_dir(layers_dir)?;
        for layer in PRIVATE_LAYERS {
            std::fs::create_dir(layers_dir.join(layer))?;
        }
        Ok(())
    }

    /// Build the stack for an instance: the shared distribution layer at
    /// the bottom, then the instance's private layers.
    #[must_use]
    pub fn from_dist(dist_dir: &Path, layers_dir: &Path, mount_point: &Path) -> Self {
        let mut layers = vec![dist_dir.to_path_buf()];
        for layer in PRIVATE_LAYERS {
            layers.push(layers_dir.join(layer));
        }
        Self {
            mount_point: mount_point.to_path_buf(),
            layers,
        }
    }

    /// The topmost (diff) layer.
    #[must_use]
    pub fn top_layer(&self) -> &Path {
        self.layers
            .last()
            .map_or_else(|| Path::new(""), PathBuf::as_path)
    }

    fn work_dir(&self) -> PathBuf {
        let mut s = self.top_layer().as_os_str().to_os_string();
        s.push(WORK_DIR_SUFFIX);
        PathBuf::from(s)
    }

    /// Build the overlayfs option string.
    ///
    /// The kernel stacks `lowerdir` entries rightmost-bottom, so the layer
    /// list is reversed: layer 0 ends up as the bottom of the union and
    /// the last entry on top.
    #[must_use]
    pub fn mount_options(&self, writable: bool) -> String {
        let reversed: Vec<String> = self
            .layers
            .iter()
            .rev()
            .map(|p| p.display().to_string())
            .collect();
        if writable {
            format!(
                "lowerdir={},upperdir={},workdir={}",
                reversed[1..].join(":"),
                reversed[0],
                self.work_dir().display()
            )
        } else {
            format!("lowerdir={}", reversed.join(":"))
        }
    }

    /// Mount the union view at the mount point.
    ///
    /// With `writable`, the top layer becomes the upper directory and a
    /// scratch work directory is created beside it; otherwise every layer
    /// is a read-only lower directory.
    #[cfg(target_os = "linux")]
    pub fn mount(&self, writable: bool) -> KilnResult<()> {
        use rustix::mount::{MountFlags, mount};

        if writable && self.layers.len() < 2 {
            return Err(KilnError::Internal {
                message: format!(
                    "a writable stack needs at least two layers, got {}",
                    self.layers.len()
                ),
            });
        }

        if writable {
            std::fs::create_dir_all(self.work_dir())?;
        }
        std::fs::create_dir_all(&self.mount_point)?;

        let options = self.mount_options(writable);
        tracing::debug!(
            mount_point = %self.mount_point.display(),
            options = %options,
            "Mounting overlayfs"
        );

        let options = std::ffi::CString::new(options).map_err(|e| KilnError::Internal {
            message: format!("invalid overlay mount options: {e}"),
        })?;
        mount(
            "overlay",
            &self.mount_point,
            "overlay",
            MountFlags::empty(),
            options.as_c_str(),
        )
        .map_err(|e| KilnError::Io(e.into()))?;

        tracing::info!(mount_point = %self.mount_point.display(), "Overlay mounted");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn mount(&self, _writable: bool) -> KilnResult<()> {
        Err(KilnError::Unsupported {
            feature: "overlayfs".to_string(),
        })
    }

    /// Unmount the union view and remove the scratch work directory.
    #[cfg(target_os = "linux")]
    pub fn unmount(&self) -> KilnResult<()> {
        use rustix::mount::{UnmountFlags, unmount};

        tracing::debug!(mount_point = %self.mount_point.display(), "Unmounting overlayfs");

        unmount(&self.mount_point, UnmountFlags::empty()).map_err(|e| KilnError::Io(e.into()))?;
        std::fs::remove_dir_all(self.work_dir()).or_else(ignore_not_found)?;

        tracing::info!(mount_point = %self.mount_point.display(), "Overlay unmounted");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn unmount(&self) -> KilnResult<()> {
        Err(KilnError::Unsupported {
            feature: "overlayfs".to_string(),
        })
    }

    /// Discard the diff layer: remove it wholesale and recreate it empty.
    pub fn rollback(&self) -> KilnResult<()> {
        let diff = self.top_layer().to_path_buf();
        tracing::info!(diff = %diff.display(), "Rolling back diff layer");
        std::fs::remove_dir_all(&diff).or_else(ignore_not_found)?;
        std::fs::create_dir(&diff)?;
        Ok(())
    }
}

fn ignore_not_found(err: std::io::Error) -> std::io::Result<()> {
    if err.kind() == std::io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(err)
    }
}
