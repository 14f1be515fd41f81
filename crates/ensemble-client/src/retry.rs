//! Operations that survive connection loss.
//!
//! Every call fetches the live session (waiting for the connected state),
//! runs the operation, and starts over on [`CoordError::ConnectionLoss`].
//! There is no retry limit and no backoff: the wait for the connected state
//! is the pacing. All other errors reach the caller unchanged.
//!
//! A mutation that failed with connection loss may still have been applied,
//! so retried creates and deletes first check whether their effect is
//! already visible.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ensemble_core::node;
use ensemble_core::{
    CoordError, CreateMode, NodeChildren, NodeData, Result, Session, Stat, Watcher,
};
use metrics::counter;
use tracing::debug;

/// Source of the live session for [`RetryingClient`].
#[async_trait]
pub trait SessionAccess: Send + Sync {
    /// The current session once the client is connected.
    ///
    /// Fails immediately with [`CoordError::NotConfigured`] when there is
    /// nothing to wait for, and with [`CoordError::ConnectionUnavailable`]
    /// when `wait` elapses first.
    async fn session(&self, wait: Option<Duration>) -> Result<Arc<dyn Session>>;
}

/// Client whose operations are re-issued across connection loss.
///
/// Cheap to clone; clones share the retry counter.
#[derive(Clone)]
pub struct RetryingClient {
    access: Arc<dyn SessionAccess>,
    wait: Option<Duration>,
    total_retries: Arc<AtomicU64>,
}

impl RetryingClient {
    /// Client drawing sessions from `access`, waiting at most `wait` for a
    /// connection before each attempt (`None` waits indefinitely).
    pub fn new(access: Arc<dyn SessionAccess>, wait: Option<Duration>) -> Self {
        Self {
            access,
            wait,
            total_retries: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A copy that waits at most `wait` for a connection.
    #[must_use]
    pub fn with_wait_timeout(&self, wait: Duration) -> Self {
        Self {
            wait: Some(wait),
            ..self.clone()
        }
    }

    /// Number of attempts re-issued after connection loss so far.
    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Run `attempt` until it finishes with anything but connection loss.
    ///
    /// The closure's `bool` is `true` on every attempt after the first.
    pub async fn retrying<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut(Arc<dyn Session>, bool) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries: u32 = 0;
        loop {
            let session = self.access.session(self.wait).await?;
            match attempt(session, retries > 0).await {
                Err(error) if error.is_connection_loss() => {
                    retries += 1;
                    let _ = self.total_retries.fetch_add(1, Ordering::Relaxed);
                    counter!("ensemble_operation_retries_total", "operation" => operation)
                        .increment(1);
                    debug!(
                        operation,
                        attempt = retries,
                        kind = error.error_kind(),
                        "connection lost, retrying"
                    );
                    tokio::task::yield_now().await;
                }
                Err(error) => {
                    if error.is_application() {
                        debug!(operation, kind = error.error_kind(), "operation rejected");
                    }
                    return Err(error);
                }
                Ok(value) => return Ok(value),
            }
        }
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// Metadata of `path`, or `None` if it does not exist.
    pub async fn exists(&self, path: &str) -> Result<Option<Stat>> {
        self.retrying("exists", move |session, _| async move {
            session.exists(path).await
        })
        .await
    }

    /// Sorted child names of `path`.
    pub async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.retrying("get_children", move |session, _| async move {
            session.get_children(path).await
        })
        .await
    }

    /// Child names of `path` and its metadata, read together, optionally
    /// leaving a one-shot `watcher` on the children of `path`.
    pub async fn get_children_with_stat(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<NodeChildren> {
        self.retrying("get_children_with_stat", move |session, _| {
            let watcher = watcher.clone();
            async move { session.get_children_with_stat(path, watcher).await }
        })
        .await
    }

    /// Every descendant of `path`, relative to it, parents before children.
    ///
    /// Each level is a separate read; a node removed mid-walk surfaces as
    /// [`CoordError::NoNode`].
    pub async fn get_all_children(&self, path: &str) -> Result<Vec<String>> {
        let mut all = Vec::new();
        let mut pending = vec![String::new()];
        while let Some(relative) = pending.pop() {
            let absolute = if relative.is_empty() {
                path.to_owned()
            } else {
                node::join(path, &relative)
            };
            if !relative.is_empty() {
                all.push(relative.clone());
            }
            let children = self.get_children(&absolute).await?;
            pending.extend(children.into_iter().rev().map(|child| {
                if relative.is_empty() {
                    child
                } else {
                    format!("{relative}/{child}")
                }
            }));
        }
        Ok(all)
    }

    /// Data stored at `path`.
    pub async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        self.retrying("get_data", move |session, _| async move {
            session.get_data(path).await
        })
        .await
    }

    /// Data stored at `path`, decoded as UTF-8.
    pub async fn get_string_data(&self, path: &str) -> Result<String> {
        let data = self.get_data(path).await?;
        decode(path, data)
    }

    /// Data of `path` and its metadata, read together, optionally leaving a
    /// one-shot `watcher` on the data of `path`.
    pub async fn get_data_with_stat(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<NodeData> {
        self.retrying("get_data_with_stat", move |session, _| {
            let watcher = watcher.clone();
            async move { session.get_data_with_stat(path, watcher).await }
        })
        .await
    }

    /// Data of `path` decoded as UTF-8, and its metadata. See
    /// [`get_data_with_stat`](Self::get_data_with_stat) for `watcher`.
    pub async fn get_string_data_with_stat(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<NodeData<String>> {
        let NodeData { data, stat } = self.get_data_with_stat(path, watcher).await?;
        Ok(NodeData {
            data: decode(path, data)?,
            stat,
        })
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Replace the data at `path`, regardless of its version.
    pub async fn set_data(&self, path: &str, data: &[u8]) -> Result<Stat> {
        self.retrying("set_data", move |session, _| async move {
            session.set_data(path, data, None).await
        })
        .await
    }

    /// Replace the data at `path` with a UTF-8 string.
    pub async fn set_string_data(&self, path: &str, data: &str) -> Result<Stat> {
        self.set_data(path, data.as_bytes()).await
    }

    /// Create a node and return its path.
    ///
    /// On a retry, an existing node at `path` is taken as this call's own
    /// earlier attempt having landed, and `path` is returned.
    pub async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.retrying("create", move |session, retry| async move {
            if retry && session.exists(path).await?.is_some() {
                return Ok(path.to_owned());
            }
            session.create(path, data, mode).await
        })
        .await
    }

    /// Create a node, first creating any missing ancestors as empty
    /// persistent nodes. Retries are guarded like [`create`](Self::create).
    pub async fn create_with_parents(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String> {
        self.retrying("create_with_parents", move |session, retry| async move {
            if retry && session.exists(path).await?.is_some() {
                return Ok(path.to_owned());
            }
            create_ancestors(session.as_ref(), path).await?;
            session.create(path, data, mode).await
        })
        .await
    }

    /// Set the data at `path` if it exists, otherwise create it (and its
    /// ancestors) with `data`.
    ///
    /// Returns the new metadata when existing data was replaced and `None`
    /// when the node was created. Losing a create race to another client
    /// falls back to replacing its data.
    ///
    /// The create step has no retry guard: a node found on a retry may be
    /// another client's, so it surfaces as [`CoordError::NodeExists`] and
    /// the data is set.
    pub async fn create_or_set_bytes_with_parents(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<Option<Stat>> {
        if self.exists(path).await?.is_some() {
            return self.set_data(path, data).await.map(Some);
        }
        let created = self
            .retrying("create_or_set_with_parents", move |session, _| async move {
                create_ancestors(session.as_ref(), path).await?;
                session.create(path, data, mode).await
            })
            .await;
        match created {
            Ok(_) => Ok(None),
            Err(CoordError::NodeExists(_)) => self.set_data(path, data).await.map(Some),
            Err(error) => Err(error),
        }
    }

    /// [`create_or_set_bytes_with_parents`](Self::create_or_set_bytes_with_parents)
    /// for UTF-8 data.
    pub async fn create_or_set_with_parents(
        &self,
        path: &str,
        data: &str,
        mode: CreateMode,
    ) -> Result<Option<Stat>> {
        self.create_or_set_bytes_with_parents(path, data.as_bytes(), mode)
            .await
    }

    /// Delete a childless node.
    ///
    /// On a retry, a missing node is taken as this call's own earlier
    /// attempt having landed, and the call succeeds.
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.retrying("delete", move |session, retry| async move {
            if retry && session.exists(path).await?.is_none() {
                return Ok(());
            }
            session.delete(path, None).await
        })
        .await
    }

    /// Delete `path` and everything below it, deepest nodes first.
    /// Retries are guarded like [`delete`](Self::delete).
    pub async fn delete_with_children(&self, path: &str) -> Result<()> {
        self.retrying("delete_with_children", move |session, retry| async move {
            if retry && session.exists(path).await?.is_none() {
                return Ok(());
            }
            delete_tree(session.as_ref(), path).await
        })
        .await
    }
}

fn decode(path: &str, data: Vec<u8>) -> Result<String> {
    String::from_utf8(data).map_err(|_| CoordError::InvalidData(path.to_owned()))
}

async fn create_ancestors(session: &dyn Session, path: &str) -> Result<()> {
    let mut missing = Vec::new();
    let mut cursor = node::parent(path);
    while let Some(ancestor) = cursor {
        if ancestor == "/" || session.exists(ancestor).await?.is_some() {
            break;
        }
        missing.push(ancestor);
        cursor = node::parent(ancestor);
    }

    for ancestor in missing.into_iter().rev() {
        match session.create(ancestor, &[], CreateMode::Persistent).await {
            Ok(_) | Err(CoordError::NodeExists(_)) => {}
            Err(error) => return Err(error),
        }
    }
    Ok(())
}

async fn delete_tree(session: &dyn Session, path: &str) -> Result<()> {
    // Breadth-first listing; every parent precedes its children.
    let mut order = vec![path.to_owned()];
    let mut next = 0;
    while next < order.len() {
        let parent = order[next].clone();
        let children = match session.get_children(&parent).await {
            Ok(children) => children,
            Err(CoordError::NoNode(_)) if parent != path => Vec::new(),
            Err(error) => return Err(error),
        };
        order.extend(children.iter().map(|child| node::join(&parent, child)));
        next += 1;
    }

    for target in order.iter().rev() {
        match session.delete(target, None).await {
            Err(CoordError::NoNode(_)) if target != path => {}
            other => other?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use assert_matches::assert_matches;
    use ensemble_core::{EnsembleTarget, EventSink, SessionConnector, WatchEvent, WatchEventKind};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::*;
    use crate::memory::{Fault, MemoryConnector, MemoryEnsemble, OpKind};

    /// Always hands out the same session.
    struct FixedAccess {
        session: Arc<dyn Session>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SessionAccess for FixedAccess {
        async fn session(&self, _wait: Option<Duration>) -> Result<Arc<dyn Session>> {
            let _ = self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(Arc::clone(&self.session))
        }
    }

    struct Unconfigured;

    #[async_trait]
    impl SessionAccess for Unconfigured {
        async fn session(&self, _wait: Option<Duration>) -> Result<Arc<dyn Session>> {
            Err(CoordError::NotConfigured)
        }
    }

    fn fixture() -> (RetryingClient, MemoryEnsemble, Arc<FixedAccess>) {
        let ensemble = MemoryEnsemble::new();
        let connector = MemoryConnector::new(ensemble.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = connector
            .connect(
                &EnsembleTarget::new("mem:1", Duration::from_secs(10)),
                EventSink::new(1, tx),
            )
            .unwrap();
        let access = Arc::new(FixedAccess {
            session,
            calls: AtomicUsize::new(0),
        });
        let client = RetryingClient::new(access.clone(), None);
        (client, ensemble, access)
    }

    #[tokio::test]
    async fn unconfigured_fails_without_attempting() {
        let client = RetryingClient::new(Arc::new(Unconfigured), None);
        assert_matches!(client.exists("/a").await, Err(CoordError::NotConfigured));
        assert_eq!(client.total_retries(), 0);
    }

    #[tokio::test]
    async fn transient_loss_is_retried() {
        let (client, ensemble, access) = fixture();
        ensemble.inject(OpKind::GetData, Fault::LoseBeforeCommit);
        ensemble.inject(OpKind::GetData, Fault::LoseBeforeCommit);
        let _ = ensemble.create("/a", b"hello", CreateMode::Persistent).unwrap();

        assert_eq!(client.get_data("/a").await.unwrap(), b"hello");
        assert_eq!(client.total_retries(), 2);
        assert_eq!(access.calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let (client, _ensemble, _) = fixture();
        assert_matches!(client.get_data("/missing").await, Err(CoordError::NoNode(_)));
        assert_eq!(client.total_retries(), 0);
    }

    #[tokio::test]
    async fn create_landing_before_loss_succeeds_once() {
        let (client, ensemble, _) = fixture();
        ensemble.inject(OpKind::Create, Fault::LoseAfterCommit);

        let path = client.create("/a", b"x", CreateMode::Persistent).await.unwrap();

        assert_eq!(path, "/a");
        assert_eq!(ensemble.get_data("/a").unwrap(), b"x");
        assert_eq!(client.total_retries(), 1);
    }

    #[tokio::test]
    async fn first_create_conflict_surfaces() {
        let (client, ensemble, _) = fixture();
        let _ = ensemble.create("/a", b"theirs", CreateMode::Persistent).unwrap();
        assert_matches!(
            client.create("/a", b"ours", CreateMode::Persistent).await,
            Err(CoordError::NodeExists(_))
        );
    }

    #[tokio::test]
    async fn delete_landing_before_loss_succeeds() {
        let (client, ensemble, _) = fixture();
        let _ = ensemble.create("/a", b"", CreateMode::Persistent).unwrap();
        ensemble.inject(OpKind::Delete, Fault::LoseAfterCommit);

        client.delete("/a").await.unwrap();
        assert!(ensemble.exists("/a").is_none());
        assert_eq!(client.total_retries(), 1);
    }

    #[tokio::test]
    async fn first_delete_of_missing_node_surfaces() {
        let (client, _ensemble, _) = fixture();
        assert_matches!(client.delete("/a").await, Err(CoordError::NoNode(_)));
    }

    #[tokio::test]
    async fn create_with_parents_builds_the_chain() {
        let (client, ensemble, _) = fixture();
        let path = client
            .create_with_parents("/a/b/c", b"leaf", CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(path, "/a/b/c");
        assert_eq!(ensemble.get_data("/a/b").unwrap(), b"");
        assert_eq!(ensemble.get_data("/a/b/c").unwrap(), b"leaf");
    }

    #[tokio::test]
    async fn create_or_set_creates_then_sets() {
        let (client, ensemble, _) = fixture();
        let created = client
            .create_or_set_with_parents("/cfg/x", "one", CreateMode::Persistent)
            .await
            .unwrap();
        assert!(created.is_none());

        let updated = client
            .create_or_set_with_parents("/cfg/x", "two", CreateMode::Persistent)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.version, 1);
        assert_eq!(ensemble.get_data("/cfg/x").unwrap(), b"two");
    }

    #[tokio::test]
    async fn create_or_set_loses_race_and_sets() {
        let (client, ensemble, _) = fixture();
        let _ = ensemble.create("/cfg", b"", CreateMode::Persistent).unwrap();
        ensemble.inject(
            OpKind::Create,
            Fault::interleave(|ens| {
                let _ = ens.create("/cfg/x", b"theirs", CreateMode::Persistent).unwrap();
            }),
        );

        let stat = client
            .create_or_set_with_parents("/cfg/x", "ours", CreateMode::Persistent)
            .await
            .unwrap();

        assert!(stat.is_some());
        assert_eq!(ensemble.get_data("/cfg/x").unwrap(), b"ours");
    }

    #[tokio::test]
    async fn all_children_are_relative_and_preordered() {
        let (client, ensemble, _) = fixture();
        for path in ["/r", "/r/a", "/r/a/x", "/r/b"] {
            let _ = ensemble.create(path, b"", CreateMode::Persistent).unwrap();
        }
        let all = client.get_all_children("/r").await.unwrap();
        assert_eq!(all, ["a", "a/x", "b"]);
    }

    #[tokio::test]
    async fn delete_with_children_removes_subtree() {
        let (client, ensemble, _) = fixture();
        for path in ["/r", "/r/a", "/r/a/x", "/r/b"] {
            let _ = ensemble.create(path, b"", CreateMode::Persistent).unwrap();
        }
        ensemble.inject(OpKind::Delete, Fault::LoseAfterCommit);

        client.delete_with_children("/r").await.unwrap();
        assert!(ensemble.exists("/r").is_none());
        assert_eq!(ensemble.get_children("/").unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn string_helpers_decode_utf8() {
        let (client, ensemble, _) = fixture();
        let _ = ensemble.create("/s", "héllo".as_bytes(), CreateMode::Persistent).unwrap();
        let _ = ensemble.create("/bin", &[0xff, 0xfe], CreateMode::Persistent).unwrap();

        assert_eq!(client.get_string_data("/s").await.unwrap(), "héllo");
        let read = client.get_string_data_with_stat("/s", None).await.unwrap();
        assert_eq!(read.data, "héllo");
        assert_eq!(read.stat.data_length, 6);
        assert_matches!(client.get_string_data("/bin").await, Err(CoordError::InvalidData(_)));

        let stat = client.set_string_data("/s", "bye").await.unwrap();
        assert_eq!(stat.version, 1);
    }

    #[tokio::test]
    async fn compound_reads_return_stat() {
        let (client, ensemble, _) = fixture();
        let _ = ensemble.create("/p", b"d", CreateMode::Persistent).unwrap();
        let _ = ensemble.create("/p/c", b"", CreateMode::Persistent).unwrap();

        let children = client.get_children_with_stat("/p", None).await.unwrap();
        assert_eq!(children.children, ["c"]);
        assert_eq!(children.stat.num_children, 1);

        let data = client.get_data_with_stat("/p", None).await.unwrap();
        assert_eq!(data.data, b"d");
    }

    #[tokio::test]
    async fn create_or_set_sets_when_a_retried_create_finds_another_node() {
        let (client, ensemble, _) = fixture();
        // Another client creates the node right before the retry, whether
        // the retry starts with a read or a write.
        ensemble.inject(OpKind::Exists, Fault::interleave(|_| {}));
        ensemble.inject(
            OpKind::Exists,
            Fault::interleave(|other| {
                let _ = other.create("/x", b"theirs", CreateMode::Persistent);
            }),
        );
        ensemble.inject(OpKind::Create, Fault::LoseBeforeCommit);
        ensemble.inject(
            OpKind::Create,
            Fault::interleave(|other| {
                let _ = other.create("/x", b"theirs", CreateMode::Persistent);
            }),
        );

        let replaced = client
            .create_or_set_with_parents("/x", "ours", CreateMode::Persistent)
            .await
            .unwrap();
        assert!(replaced.is_some());
        assert_eq!(ensemble.get_data("/x").unwrap(), b"ours");
        assert_eq!(client.total_retries(), 1);
    }

    #[derive(Default)]
    struct Seen(Mutex<Vec<WatchEvent>>);

    impl Watcher for Seen {
        fn process(&self, event: WatchEvent) {
            self.0.lock().push(event);
        }
    }

    #[tokio::test]
    async fn watch_survives_a_retried_read() {
        let (client, ensemble, _) = fixture();
        let _ = ensemble.create("/w", b"a", CreateMode::Persistent).unwrap();
        ensemble.inject(OpKind::GetData, Fault::LoseAfterCommit);

        let seen = Arc::new(Seen::default());
        let read = client
            .get_data_with_stat("/w", Some(seen.clone()))
            .await
            .unwrap();
        assert_eq!(read.data, b"a");
        assert_eq!(client.total_retries(), 1);

        let _ = ensemble.set_data("/w", b"b").unwrap();
        let _ = ensemble.set_data("/w", b"c").unwrap();
        assert_eq!(
            *seen.0.lock(),
            [WatchEvent::new(WatchEventKind::NodeDataChanged, "/w")]
        );
    }
}
