//! Advisory locks for cross-process mutual exclusion.
//!
//! Lock state lives entirely on the filesystem so it survives process
//! restarts; a crash leaves a lock behind until a stale-lock check clears
//! it.

mod lockfile;
mod sem;

pub use lockfile::FileLock;
pub use sem::Semaphore;
