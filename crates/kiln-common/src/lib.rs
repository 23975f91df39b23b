//! # kiln-common
//!
//! Shared types for the Kiln build-container workspace manager.
//!
//! This crate provides functionality used across the Kiln workspace:
//! - Instance name validation
//! - The on-disk workspace layout
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod name;
pub mod paths;

pub use error::{KilnError, KilnResult};
pub use name::InstanceName;
pub use paths::WorkspacePaths;
