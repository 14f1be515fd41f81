//! Error type shared by every ensemble crate.

use std::time::Duration;

use crate::state::ConnectionState;

/// Convenience alias for results carrying a [`CoordError`].
pub type Result<T, E = CoordError> = std::result::Result<T, E>;

/// Failures surfaced by sessions and by the supervised client.
///
/// Only [`ConnectionLoss`](Self::ConnectionLoss) is absorbed by the retry
/// wrapper; every other variant reaches the caller unchanged.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CoordError {
    // Transient
    /// The connection dropped mid-operation. The operation may or may not
    /// have been applied.
    #[error("connection to the ensemble was lost")]
    ConnectionLoss,

    // Session
    /// The ensemble ended the session; its ephemeral nodes and watches are
    /// gone.
    #[error("session expired")]
    SessionExpired,
    /// The session handle was closed locally.
    #[error("session handle is closed")]
    SessionClosed,

    // Application-level results
    /// The node at the given path does not exist.
    #[error("no node: {0}")]
    NoNode(String),
    /// A node already exists at the given path.
    #[error("node already exists: {0}")]
    NodeExists(String),
    /// A conditional write named a version other than the node's current
    /// one. Carries the path.
    #[error("version mismatch: {0}")]
    BadVersion(String),
    /// The node at the given path still has children.
    #[error("node has children: {0}")]
    NotEmpty(String),
    /// The parent of the given path is ephemeral.
    #[error("ephemeral nodes may not have children: {0}")]
    NoChildrenForEphemerals(String),
    /// A path failed validation.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath {
        /// The rejected path as given.
        path: String,
        /// Which rule it broke.
        reason: &'static str,
    },
    /// Node data at the given path was read as a string but is not UTF-8.
    #[error("node data is not valid UTF-8: {0}")]
    InvalidData(String),

    // Client lifecycle
    /// No ensemble target is configured, so there is no session to wait for.
    #[error("client is not configured")]
    NotConfigured,
    /// No connected session appeared within the bounded wait.
    #[error("no connection available within {0:?}")]
    ConnectionUnavailable(Duration),
    /// A wait for a connection state ran past its deadline.
    #[error("timed out after {waited:?} waiting for state {state}")]
    Timeout {
        /// The state being waited for.
        state: ConnectionState,
        /// How long the caller waited.
        waited: Duration,
    },
    /// A state wait ended because the state machine was dropped.
    #[error("interrupted while waiting for the connection state")]
    Interrupted,
    /// The connector could not open a session. Carries its message.
    #[error("failed to open session: {0}")]
    Connect(String),
}

impl CoordError {
    /// Transient disconnect: the operation may or may not have been applied.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::ConnectionLoss)
    }

    /// An outcome reported by the ensemble about the data itself.
    pub fn is_application(&self) -> bool {
        matches!(
            self,
            Self::NoNode(_)
                | Self::NodeExists(_)
                | Self::BadVersion(_)
                | Self::NotEmpty(_)
                | Self::NoChildrenForEphemerals(_)
                | Self::InvalidPath { .. }
                | Self::InvalidData(_)
        )
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ConnectionLoss => "connection_loss",
            Self::SessionExpired => "session_expired",
            Self::SessionClosed => "session_closed",
            Self::NoNode(_) => "no_node",
            Self::NodeExists(_) => "node_exists",
            Self::BadVersion(_) => "bad_version",
            Self::NotEmpty(_) => "not_empty",
            Self::NoChildrenForEphemerals(_) => "no_children_for_ephemerals",
            Self::InvalidPath { .. } => "invalid_path",
            Self::InvalidData(_) => "invalid_data",
            Self::NotConfigured => "not_configured",
            Self::ConnectionUnavailable(_) => "connection_unavailable",
            Self::Timeout { .. } => "timeout",
            Self::Interrupted => "interrupted",
            Self::Connect(_) => "connect",
        }
    }
}
