//! Overlay layer stacks: mounting, merging, and rolling back.

mod merge;
mod mounts;
mod overlay;

pub use mounts::is_mounted;
pub use overlay::{LayerStack, WORK_DIR_SUFFIX};
