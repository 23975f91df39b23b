//! Workspace root and the set of containers living in it.

mod container_set;
mod root;

pub use container_set::ContainerSet;
pub use root::{CURRENT_VERSION, Workspace};
