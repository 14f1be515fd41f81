//! Boundary between the supervised client and a concrete session implementation.
//!
//! A [`SessionConnector`] opens sessions; each [`Session`] performs raw
//! operations and reports connectivity through the [`EventSink`] it was handed.
//! Nothing here retries: that is the supervised client's job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::Result;
use crate::node::{CreateMode, NodeChildren, NodeData, Stat};
use crate::watch::Watcher;

/// Where to connect and how long the ensemble keeps a silent session alive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnsembleTarget {
    /// Comma-separated `host:port` list.
    pub connect_string: String,
    /// Session timeout negotiated with the ensemble.
    pub session_timeout: Duration,
}

impl EnsembleTarget {
    /// Target with the given connect string and session timeout.
    pub fn new(connect_string: impl Into<String>, session_timeout: Duration) -> Self {
        Self {
            connect_string: connect_string.into(),
            session_timeout,
        }
    }
}

/// Raw connectivity events emitted by a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// The session is connected to an ensemble member.
    Connected,
    /// The connection dropped; the session may still recover it.
    Disconnected,
    /// The ensemble discarded the session. The handle is dead.
    Expired,
}

/// A [`SessionEvent`] tagged with the generation of the session that emitted it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionNotice {
    /// Generation of the emitting session.
    pub generation: u64,
    /// The event itself.
    pub event: SessionEvent,
}

/// Channel end handed to each new session for reporting its events.
#[derive(Clone, Debug)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<SessionNotice>,
}

impl EventSink {
    /// Sink that tags every event with `generation`.
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<SessionNotice>) -> Self {
        Self { generation, tx }
    }

    /// Generation of the session this sink belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Tag `event` with this sink's generation without sending it.
    pub fn notice(&self, event: SessionEvent) -> SessionNotice {
        SessionNotice {
            generation: self.generation,
            event,
        }
    }

    /// Report an event. Returns `false` when nobody is listening any more.
    pub fn emit(&self, event: SessionEvent) -> bool {
        self.tx.send(self.notice(event)).is_ok()
    }
}

/// One live session with the ensemble.
///
/// Operations fail with [`CoordError::ConnectionLoss`](crate::CoordError::ConnectionLoss)
/// while the connection is down; the outcome of a mutation that fails this way
/// is unknown.
#[async_trait]
pub trait Session: Send + Sync {
    /// Metadata of `path`, or `None` if it does not exist.
    async fn exists(&self, path: &str) -> Result<Option<Stat>>;

    /// Sorted child names of `path`.
    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    /// Sorted child names of `path` together with its metadata.
    ///
    /// With a `watcher`, it fires on the next child change or deletion of
    /// `path`. Nothing is registered when the read fails.
    async fn get_children_with_stat(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<NodeChildren>;

    /// Data stored at `path`.
    async fn get_data(&self, path: &str) -> Result<Vec<u8>>;

    /// Data stored at `path` together with its metadata.
    ///
    /// With a `watcher`, it fires on the next data change or deletion of
    /// `path`. Nothing is registered when the read fails.
    async fn get_data_with_stat(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<NodeData>;

    /// Replace the data at `path`. `version` of `None` matches any version.
    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> Result<Stat>;

    /// Create a node and return its actual path (which differs for sequential modes).
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    /// Delete a childless node. `version` of `None` matches any version.
    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()>;

    /// Close the session. Idempotent.
    async fn close(&self);
}

impl std::fmt::Debug for dyn Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

/// Opens sessions.
pub trait SessionConnector: Send + Sync {
    /// Start a session against `target`.
    ///
    /// Returning `Ok` means a handle exists and is connecting in the
    /// background; it reports progress through `sink`. An error means the
    /// connection could not even begin.
    fn connect(&self, target: &EnsembleTarget, sink: EventSink) -> Result<Arc<dyn Session>>;
}
