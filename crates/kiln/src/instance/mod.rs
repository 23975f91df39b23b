//! Instance lifecycle management.
//!
//! An instance is one named, independently lockable unit: a layer stack,
//! a mount point, and (while a session exists) a runtime identity.

mod lifecycle;
mod status;

pub use lifecycle::{Instance, RunOptions};
pub use status::{FsState, InstanceStatus, RunState};
