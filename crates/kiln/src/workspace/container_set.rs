//! The set of named containers in a workspace.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use kiln_common::{InstanceName, KilnError, KilnResult, WorkspacePaths};

use crate::filesystem::LayerStack;
use crate::instance::Instance;
use crate::runner::{ContainerRuntime, SessionClassifier};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// All containers of one workspace, sharing its distribution layer.
pub struct ContainerSet {
    paths: WorkspacePaths,
    runtime: Arc<dyn ContainerRuntime>,
    classifier: Arc<dyn SessionClassifier>,
}

impl ContainerSet {
    /// Binds a container set to workspace paths and a runtime.
    pub fn new(
        paths: WorkspacePaths,
        runtime: Arc<dyn ContainerRuntime>,
        classifier: Arc<dyn SessionClassifier>,
    ) -> Self {
        Self {
            paths,
            runtime,
            classifier,
        }
    }

    /// Whether an instance of that name exists.
    #[must_use]
    pub fn exists(&self, name: &InstanceName) -> bool {
        self.paths.instance_dir(name).is_dir()
    }

    /// Creates a new instance with empty private layers.
    pub fn add(&self, name: &InstanceName) -> KilnResult<Instance> {
        if self.exists(name) {
            return Err(KilnError::InstanceExists {
                name: name.to_string(),
            });
        }
        std::fs::create_dir_all(self.paths.instance_dir(name))?;
        LayerStack::create(&self.paths.instance_layers(name))?;
        tracing::info!(instance = %name, "instance created");
        Ok(self.bind(name.clone()))
    }

    /// Stops, unmounts and removes an instance and all its layers.
    pub async fn del(&self, name: &InstanceName) -> KilnResult<()> {
        let instance = self.instance(name)?;
        match instance.unmount().await {
            Ok(()) | Err(KilnError::NotMounted { .. }) => {}
            Err(err) => return Err(err),
        }
        std::fs::remove_dir_all(self.paths.instance_dir(name))?;
        tracing::info!(instance = %name, "instance removed");
        Ok(())
    }

    /// Returns a handle to an existing instance.
    pub fn instance(&self, name: &InstanceName) -> KilnResult<Instance> {
        if !self.exists(name) {
            return Err(KilnError::InstanceNotFound {
                name: name.to_string(),
            });
        }
        Ok(self.bind(name.clone()))
    }

    /// Names of all instances, sorted.
    pub fn list_names(&self) -> KilnResult<Vec<InstanceName>> {
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(self.paths.instances_dir()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(name) = name.parse::<InstanceName>() {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Unpacks an OS tarball into the empty distribution layer.
    pub fn load_os(&self, tarball: &Path) -> KilnResult<()> {
        let dist = self.paths.dist_dir();
        if dist.is_dir() && dist.read_dir()?.next().is_some() {
            return Err(KilnError::Internal {
                message: "distribution layer is not empty, use update-os".to_owned(),
            });
        }
        std::fs::create_dir_all(&dist)?;
        unpack_tarball(tarball, &dist)
    }

    /// Replaces the distribution layer wholesale with a fresh tarball.
    ///
    /// All instances must be unmounted; their private layers survive.
    pub async fn update_os(&self, tarball: &Path) -> KilnResult<()> {
        for name in self.list_names()? {
            let instance = self.bind(name.clone());
            if instance.mounted()? {
                return Err(KilnError::Internal {
                    message: format!("instance `{name}` is mounted, unmount it first"),
                });
            }
        }
        let dist = self.paths.dist_dir();
        if dist.is_dir() {
            std::fs::remove_dir_all(&dist)?;
        }
        std::fs::create_dir_all(&dist)?;
        unpack_tarball(tarball, &dist)
    }

    fn bind(&self, name: InstanceName) -> Instance {
        Instance::new(
            name,
            self.paths.clone(),
            Arc::clone(&self.runtime),
            Arc::clone(&self.classifier),
        )
    }
}

/// Unpacks a gzip, zstd or plain tar archive into `dest`.
///
/// The format is sniffed from magic bytes, not the file name.
fn unpack_tarball(tarball: &Path, dest: &Path) -> KilnResult<()> {
    let mut file = File::open(tarball)?;
    let mut magic = [0u8; 4];
    let read = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;
    let file = BufReader::new(file);

    let reader: Box<dyn Read> = if read >= 2 && magic[..2] == GZIP_MAGIC {
        Box::new(flate2::read::GzDecoder::new(file))
    } else if read >= 4 && magic == ZSTD_MAGIC {
        Box::new(zstd::stream::read::Decoder::new(file)?)
    } else {
        Box::new(file)
    };

    tracing::info!(tarball = %tarball.display(), dest = %dest.display(), "unpacking OS tree");
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(true);
    archive.unpack(dest)?;
    Ok(())
}
