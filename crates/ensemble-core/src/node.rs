//! Node metadata and path helpers.

use serde::{Deserialize, Serialize};

use crate::errors::{CoordError, Result};

/// Metadata attached to every node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stat {
    /// Transaction id that created the node.
    pub czxid: i64,
    /// Transaction id that last modified the node's data.
    pub mzxid: i64,
    /// Creation time, milliseconds since the epoch.
    pub ctime: i64,
    /// Last modification time, milliseconds since the epoch.
    pub mtime: i64,
    /// Number of data changes.
    pub version: i32,
    /// Number of child-list changes.
    pub cversion: i32,
    /// Owning session id for ephemeral nodes, 0 otherwise.
    pub ephemeral_owner: u64,
    /// Length of the data in bytes.
    pub data_length: u32,
    /// Number of children.
    pub num_children: u32,
}

impl Stat {
    /// Whether the node is tied to a session.
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral_owner != 0
    }
}

/// How a node is created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    /// Survives the creating session.
    #[default]
    Persistent,
    /// Persistent, with a monotonically increasing suffix appended to the name.
    PersistentSequential,
    /// Removed when the creating session ends.
    Ephemeral,
    /// Ephemeral, with a monotonically increasing suffix appended to the name.
    EphemeralSequential,
}

impl CreateMode {
    /// Whether nodes created this way die with their session.
    pub fn is_ephemeral(self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }

    /// Whether the ensemble appends a sequence suffix.
    pub fn is_sequential(self) -> bool {
        matches!(self, Self::PersistentSequential | Self::EphemeralSequential)
    }
}

/// Node data read together with its metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeData<T = Vec<u8>> {
    /// The payload.
    pub data: T,
    /// Metadata observed in the same read.
    pub stat: Stat,
}

/// Child names read together with the parent's metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeChildren {
    /// Child names (not full paths), sorted.
    pub children: Vec<String>,
    /// Metadata of the parent node.
    pub stat: Stat,
}

/// Check that `path` is absolute, has no empty segments and no trailing slash.
pub fn validate_path(path: &str) -> Result<()> {
    let invalid = |reason| CoordError::InvalidPath {
        path: path.to_owned(),
        reason,
    };
    if !path.starts_with('/') {
        return Err(invalid("path must start with /"));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(invalid("path must not end with /"));
    }
    if path.contains("//") {
        return Err(invalid("empty path segment"));
    }
    if path.split('/').any(|s| s == "." || s == "..") {
        return Err(invalid("relative path segment"));
    }
    Ok(())
}

/// Parent of an absolute path; `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of an absolute path; empty for the root.
pub fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or_default()
}

/// Append a child name to a parent path.
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}
