//! Serializable instance status report.

use serde::{Deserialize, Serialize};

/// Filesystem side of an instance: is the union mounted or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsState {
    /// The overlay union is mounted at the instance mount point.
    Mounted,
    /// No union mount is active.
    Free,
}

/// Runtime side of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// A one-shot session holds the instance exclusively.
    Locked,
    /// A session is live.
    Running,
    /// A booted session exists but its service manager is not answering.
    Linger,
    /// No session.
    Offline,
}

/// Snapshot of a single instance, suitable for `list` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatus {
    /// Instance name.
    pub name: String,
    /// Mount state of the union filesystem.
    pub filesystem: FsState,
    /// Session state of the runtime.
    pub run: RunState,
    /// Whether the live session (if any) was started in boot mode.
    pub boot: bool,
    /// Recorded runtime identity, if a session exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
}
