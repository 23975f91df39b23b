//! # Kiln
//!
//! Kiln manages disposable OS build containers on top of overlayfs.
//!
//! A workspace holds one shared distribution layer and any number of
//! named instances. Each instance stacks private writable layers over
//! the shared base, mounts the union, and runs commands in it through
//! `systemd-nspawn`, either one-shot or inside a booted session. The
//! instance's changes can be folded back into the base (commit) or
//! thrown away (rollback).
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use kiln::workspace::Workspace;
//! use kiln::runner::{NspawnClassifier, NspawnRuntime};
//!
//! # async fn example() -> kiln_common::KilnResult<()> {
//! let workspace = Workspace::open(".")?;
//! let containers = workspace.containers(
//!     Arc::new(NspawnRuntime::default()),
//!     Arc::new(NspawnClassifier),
//! );
//!
//! let instance = containers.instance(&"main".parse()?)?;
//! instance.mount()?;
//! let code = instance
//!     .run(kiln::instance::RunOptions {
//!         command: vec!["uname".into(), "-a".into()],
//!         ..Default::default()
//!     })
//!     .await?;
//! # let _ = code;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod filesystem;
pub mod instance;
pub mod lock;
pub mod runner;
pub mod workspace;
