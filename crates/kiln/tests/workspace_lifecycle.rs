//! Integration tests for workspace and container-set bookkeeping.

use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use kiln::instance::{FsState, RunState};
use kiln::runner::{ContainerRuntime, MachineState, SessionClassifier};
use kiln::workspace::{ContainerSet, Workspace};
use kiln_common::{InstanceName, KilnResult};
use tempfile::TempDir;

struct NullRuntime;

#[async_trait]
impl ContainerRuntime for NullRuntime {
    async fn launch_boot(&self, _root: &Path, _id: &str, _args: &[String]) -> KilnResult<()> {
        Ok(())
    }

    async fn launch_one_shot(&self, _root: &Path, _id: &str, _args: &[String]) -> KilnResult<i32> {
        Ok(0)
    }

    async fn run_in_session(&self, _id: &str, _args: &[String]) -> KilnResult<i32> {
        Ok(0)
    }

    async fn state(&self, _id: &str) -> MachineState {
        MachineState {
            running: false,
            dead: true,
        }
    }

    async fn poweroff(&self, _id: &str) -> KilnResult<()> {
        Ok(())
    }

    async fn terminate(&self, _id: &str) -> KilnResult<()> {
        Ok(())
    }
}

struct NullClassifier;

impl SessionClassifier for NullClassifier {
    fn is_boot_session(&self, _id: &str) -> KilnResult<bool> {
        Ok(false)
    }
}

fn containers(workspace: &Workspace) -> ContainerSet {
    workspace.containers(Arc::new(NullRuntime), Arc::new(NullClassifier))
}

fn name(raw: &str) -> InstanceName {
    raw.parse().unwrap()
}

#[tokio::test]
async fn workspace_lifecycle() -> Result<(), Box<dyn Error>> {
    let temp = TempDir::new()?;
    Workspace::init(temp.path())?;
    let workspace = Workspace::open(temp.path())?;
    let set = containers(&workspace);

    // Empty workspace lists nothing.
    assert!(set.list_names()?.is_empty());

    set.add(&name("main"))?;
    set.add(&name("arm64"))?;
    assert_eq!(set.list_names()?.len(), 2);

    // Fresh instances are free and offline.
    let status = set.instance(&name("main"))?.status().await?;
    assert_eq!(status.filesystem, FsState::Free);
    assert_eq!(status.run, RunState::Offline);

    set.del(&name("arm64")).await?;
    assert_eq!(set.list_names()?.len(), 1);
    assert!(!set.exists(&name("arm64")));
    Ok(())
}

#[tokio::test]
async fn deleted_instance_leaves_no_trace() -> Result<(), Box<dyn Error>> {
    let temp = TempDir::new()?;
    let workspace = Workspace::init(temp.path())?;
    let set = containers(&workspace);

    set.add(&name("scratch"))?;
    set.del(&name("scratch")).await?;

    let instances_dir = workspace.paths().instances_dir();
    assert_eq!(std::fs::read_dir(instances_dir)?.count(), 0);
    Ok(())
}

#[test]
fn invalid_names_are_rejected_at_the_boundary() {
    assert!("with space".parse::<InstanceName>().is_err());
    assert!("nested/name".parse::<InstanceName>().is_err());
    assert!("..".parse::<InstanceName>().is_err());
    assert!("main".parse::<InstanceName>().is_ok());
}
