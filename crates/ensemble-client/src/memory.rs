//! An in-process ensemble implementing the session boundary.
//!
//! [`MemoryEnsemble`] is a shared node tree with the usual coordination
//! service rules. [`MemoryConnector`] opens [`MemorySession`]s against it, and
//! tests drive connectivity by hand (`establish`, `drop_connection`,
//! `expire`) or script failures per operation kind with [`Fault`]s.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use ensemble_core::node::{self, validate_path};
use ensemble_core::{
    CoordError, CreateMode, EnsembleTarget, EventSink, NodeChildren, NodeData, Result, Session,
    SessionConnector, SessionEvent, SessionNotice, Stat, WatchEvent, WatchEventKind, Watcher,
};
use parking_lot::Mutex;
use tracing::debug;

/// Operation kinds faults can be attached to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// `exists`
    Exists,
    /// `get_children` and `get_children_with_stat`
    GetChildren,
    /// `get_data` and `get_data_with_stat`
    GetData,
    /// `set_data`
    SetData,
    /// `create`
    Create,
    /// `delete`
    Delete,
}

/// A scripted outcome for the next session operation of some kind.
pub enum Fault {
    /// Fail with connection loss without applying the operation.
    LoseBeforeCommit,
    /// Apply the operation, then report connection loss anyway.
    LoseAfterCommit,
    /// Run an action against the ensemble (another client's write, say),
    /// then apply the operation normally.
    Interleave(Box<dyn FnOnce(&MemoryEnsemble) + Send>),
    /// Fail with the given error without applying the operation.
    Fail(CoordError),
}

impl Fault {
    /// Build an [`Interleave`](Self::Interleave) fault.
    pub fn interleave(action: impl FnOnce(&MemoryEnsemble) + Send + 'static) -> Self {
        Self::Interleave(Box::new(action))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Node tree
// ─────────────────────────────────────────────────────────────────────────────

struct Node {
    data: Vec<u8>,
    stat: Stat,
    children: BTreeSet<String>,
    next_sequence: u32,
}

impl Node {
    fn new(data: &[u8], zxid: i64, now: i64, owner: u64) -> Self {
        Self {
            data: data.to_vec(),
            stat: Stat {
                czxid: zxid,
                mzxid: zxid,
                ctime: now,
                mtime: now,
                ephemeral_owner: owner,
                data_length: data.len() as u32,
                ..Stat::default()
            },
            children: BTreeSet::new(),
            next_sequence: 0,
        }
    }
}

struct Registration {
    owner: u64,
    watcher: Arc<dyn Watcher>,
}

type WatchTable = HashMap<String, Vec<Registration>>;

struct Tree {
    nodes: HashMap<String, Node>,
    zxid: i64,
    data_watches: WatchTable,
    child_watches: WatchTable,
    /// Watches triggered by the current mutation, delivered once the tree lock is released.
    fired: Vec<(Arc<dyn Watcher>, WatchEvent)>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        let _ = nodes.insert("/".to_owned(), Node::new(&[], 0, now_millis(), 0));
        Self {
            nodes,
            zxid: 0,
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
            fired: Vec::new(),
        }
    }

    fn next_zxid(&mut self) -> i64 {
        self.zxid += 1;
        self.zxid
    }

    fn node(&self, path: &str) -> Result<&Node> {
        validate_path(path)?;
        self.nodes
            .get(path)
            .ok_or_else(|| CoordError::NoNode(path.to_owned()))
    }

    fn exists(&self, path: &str) -> Result<Option<Stat>> {
        validate_path(path)?;
        Ok(self.nodes.get(path).map(|n| n.stat))
    }

    fn children(&self, path: &str) -> Result<NodeChildren> {
        let node = self.node(path)?;
        Ok(NodeChildren {
            children: node.children.iter().cloned().collect(),
            stat: node.stat,
        })
    }

    fn data(&self, path: &str) -> Result<NodeData> {
        let node = self.node(path)?;
        Ok(NodeData {
            data: node.data.clone(),
            stat: node.stat,
        })
    }

    fn set_data(&mut self, path: &str, data: &[u8], version: Option<i32>) -> Result<Stat> {
        let current = self.node(path)?.stat.version;
        if version.is_some_and(|expected| expected != current) {
            return Err(CoordError::BadVersion(path.to_owned()));
        }
        let zxid = self.next_zxid();
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordError::NoNode(path.to_owned()))?;
        node.data = data.to_vec();
        node.stat.version += 1;
        node.stat.mzxid = zxid;
        node.stat.mtime = now_millis();
        node.stat.data_length = data.len() as u32;
        let stat = node.stat;
        self.trigger_data(path, WatchEventKind::NodeDataChanged);
        Ok(stat)
    }

    fn create(&mut self, path: &str, data: &[u8], mode: CreateMode, owner: u64) -> Result<String> {
        validate_path(path)?;
        let Some(parent_path) = node::parent(path) else {
            return Err(CoordError::NodeExists(path.to_owned()));
        };
        let parent = self
            .nodes
            .get(parent_path)
            .ok_or_else(|| CoordError::NoNode(path.to_owned()))?;
        if parent.stat.is_ephemeral() {
            return Err(CoordError::NoChildrenForEphemerals(path.to_owned()));
        }
        let actual = if mode.is_sequential() {
            format!("{path}{:010}", parent.next_sequence)
        } else {
            path.to_owned()
        };
        if self.nodes.contains_key(&actual) {
            return Err(CoordError::NodeExists(actual));
        }

        let zxid = self.next_zxid();
        let parent_path = parent_path.to_owned();
        if let Some(parent) = self.nodes.get_mut(&parent_path) {
            if mode.is_sequential() {
                parent.next_sequence += 1;
            }
            let _ = parent.children.insert(node::name(&actual).to_owned());
            parent.stat.cversion += 1;
            parent.stat.num_children = parent.children.len() as u32;
        }
        let owner = if mode.is_ephemeral() { owner } else { 0 };
        let _ = self
            .nodes
            .insert(actual.clone(), Node::new(data, zxid, now_millis(), owner));
        self.trigger_children(&parent_path, WatchEventKind::NodeChildrenChanged);
        Ok(actual)
    }

    fn delete(&mut self, path: &str, version: Option<i32>) -> Result<()> {
        let target = self.node(path)?;
        let Some(parent_path) = node::parent(path) else {
            return Err(CoordError::InvalidPath {
                path: path.to_owned(),
                reason: "the root cannot be deleted",
            });
        };
        if version.is_some_and(|expected| expected != target.stat.version) {
            return Err(CoordError::BadVersion(path.to_owned()));
        }
        if !target.children.is_empty() {
            return Err(CoordError::NotEmpty(path.to_owned()));
        }

        let _ = self.nodes.remove(path);
        let _ = self.next_zxid();
        if let Some(parent) = self.nodes.get_mut(parent_path) {
            let _ = parent.children.remove(node::name(path));
            parent.stat.cversion += 1;
            parent.stat.num_children = parent.children.len() as u32;
        }
        self.trigger_data(path, WatchEventKind::NodeDeleted);
        self.trigger_children(path, WatchEventKind::NodeDeleted);
        self.trigger_children(parent_path, WatchEventKind::NodeChildrenChanged);
        Ok(())
    }

    // ── Watches ─────────────────────────────────────────────────────

    fn watch_data(&mut self, path: &str, owner: u64, watcher: Arc<dyn Watcher>) {
        register(&mut self.data_watches, path, owner, watcher);
    }

    fn watch_children(&mut self, path: &str, owner: u64, watcher: Arc<dyn Watcher>) {
        register(&mut self.child_watches, path, owner, watcher);
    }

    fn trigger_data(&mut self, path: &str, kind: WatchEventKind) {
        if let Some(registrations) = self.data_watches.remove(path) {
            let event = WatchEvent::new(kind, path);
            self.fired
                .extend(registrations.into_iter().map(|r| (r.watcher, event.clone())));
        }
    }

    fn trigger_children(&mut self, path: &str, kind: WatchEventKind) {
        if let Some(registrations) = self.child_watches.remove(path) {
            let event = WatchEvent::new(kind, path);
            self.fired
                .extend(registrations.into_iter().map(|r| (r.watcher, event.clone())));
        }
    }

    /// Drop every watch set by session `owner`.
    fn forget_watches(&mut self, owner: u64) {
        for table in [&mut self.data_watches, &mut self.child_watches] {
            table.retain(|_, registrations| {
                registrations.retain(|r| r.owner != owner);
                !registrations.is_empty()
            });
        }
    }

    fn remove_ephemerals(&mut self, owner: u64) -> usize {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.stat.ephemeral_owner == owner)
            .map(|(path, _)| path.clone())
            .collect();
        owned
            .iter()
            .filter(|path| self.delete(path, None).is_ok())
            .count()
    }
}

fn register(table: &mut WatchTable, path: &str, owner: u64, watcher: Arc<dyn Watcher>) {
    let registrations = table.entry(path.to_owned()).or_default();
    if !registrations
        .iter()
        .any(|r| Arc::ptr_eq(&r.watcher, &watcher))
    {
        registrations.push(Registration { owner, watcher });
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ─────────────────────────────────────────────────────────────────────────────
// Ensemble
// ─────────────────────────────────────────────────────────────────────────────

struct EnsembleInner {
    tree: Mutex<Tree>,
    faults: Mutex<HashMap<OpKind, VecDeque<Fault>>>,
    ops: AtomicU64,
    next_session_id: AtomicU64,
}

/// A shared in-memory node tree. Clones refer to the same tree.
#[derive(Clone)]
pub struct MemoryEnsemble {
    inner: Arc<EnsembleInner>,
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnsemble {
    /// An ensemble holding only the root node.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EnsembleInner {
                tree: Mutex::new(Tree::new()),
                faults: Mutex::new(HashMap::new()),
                ops: AtomicU64::new(0),
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    /// Queue a fault for the next session operation of `kind`.
    /// Faults of one kind fire in the order they were queued.
    pub fn inject(&self, kind: OpKind, fault: Fault) {
        self.inner.faults.lock().entry(kind).or_default().push_back(fault);
    }

    /// Number of operations sessions have issued, faulted ones included.
    pub fn op_count(&self) -> u64 {
        self.inner.ops.load(Ordering::Relaxed)
    }

    // ── Direct access (no session, no faults) ───────────────────────

    /// Create a node directly. Ephemeral modes get no owning session.
    pub fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.with_tree(|tree| tree.create(path, data, mode, 0))
    }

    /// Replace a node's data directly.
    pub fn set_data(&self, path: &str, data: &[u8]) -> Result<Stat> {
        self.with_tree(|tree| tree.set_data(path, data, None))
    }

    /// Delete a node directly.
    pub fn delete(&self, path: &str) -> Result<()> {
        self.with_tree(|tree| tree.delete(path, None))
    }

    /// Metadata of `path`, or `None` if absent or invalid.
    pub fn exists(&self, path: &str) -> Option<Stat> {
        self.inner.tree.lock().exists(path).ok().flatten()
    }

    /// Data stored at `path`.
    pub fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        self.inner.tree.lock().data(path).map(|read| read.data)
    }

    /// Sorted child names of `path`.
    pub fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.inner.tree.lock().children(path).map(|read| read.children)
    }

    fn take_fault(&self, kind: OpKind) -> Option<Fault> {
        self.inner.faults.lock().get_mut(&kind)?.pop_front()
    }

    /// Run `f` on the locked tree, then deliver the watches it fired.
    fn with_tree<T>(&self, f: impl FnOnce(&mut Tree) -> T) -> T {
        let (out, fired) = {
            let mut tree = self.inner.tree.lock();
            let out = f(&mut tree);
            (out, std::mem::take(&mut tree.fired))
        };
        for (watcher, event) in fired {
            watcher.process(event);
        }
        out
    }

    fn apply<T>(&self, kind: OpKind, f: impl FnOnce(&mut Tree) -> Result<T>) -> Result<T> {
        let _ = self.inner.ops.fetch_add(1, Ordering::Relaxed);
        match self.take_fault(kind) {
            None => self.with_tree(f),
            Some(Fault::LoseBeforeCommit) => Err(CoordError::ConnectionLoss),
            Some(Fault::LoseAfterCommit) => {
                let applied = self.with_tree(f);
                debug!(?kind, applied = applied.is_ok(), "injected connection loss after commit");
                Err(CoordError::ConnectionLoss)
            }
            Some(Fault::Interleave(action)) => {
                action(self);
                self.with_tree(f)
            }
            Some(Fault::Fail(error)) => Err(error),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Connecting,
    Connected,
    Disconnected,
    Expired,
    Closed,
}

/// A session against a [`MemoryEnsemble`].
pub struct MemorySession {
    id: u64,
    ensemble: MemoryEnsemble,
    sink: EventSink,
    status: Mutex<Status>,
}

impl MemorySession {
    fn new(ensemble: MemoryEnsemble, sink: EventSink) -> Self {
        let id = ensemble.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            ensemble,
            sink,
            status: Mutex::new(Status::Connecting),
        }
    }

    /// Session id; ephemeral nodes it creates carry it as their owner.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Generation tag of this session's events.
    pub fn generation(&self) -> u64 {
        self.sink.generation()
    }

    /// Tag `event` as coming from this session, without sending it.
    pub fn notice(&self, event: SessionEvent) -> SessionNotice {
        self.sink.notice(event)
    }

    /// Whether the session can serve operations.
    pub fn is_connected(&self) -> bool {
        *self.status.lock() == Status::Connected
    }

    /// Whether [`Session::close`] was called.
    pub fn is_closed(&self) -> bool {
        *self.status.lock() == Status::Closed
    }

    /// Finish connecting (or reconnect) and report it.
    pub fn establish(&self) {
        let mut status = self.status.lock();
        if matches!(*status, Status::Connecting | Status::Disconnected) {
            *status = Status::Connected;
            drop(status);
            let _ = self.sink.emit(SessionEvent::Connected);
        }
    }

    /// Lose the connection and report it. Operations fail with connection
    /// loss until [`establish`](Self::establish).
    pub fn drop_connection(&self) {
        let mut status = self.status.lock();
        if *status == Status::Connected {
            *status = Status::Disconnected;
            drop(status);
            let _ = self.sink.emit(SessionEvent::Disconnected);
        }
    }

    /// Expire the session: its ephemeral nodes vanish and it reports expiry.
    pub fn expire(&self) {
        let mut status = self.status.lock();
        if matches!(*status, Status::Expired | Status::Closed) {
            return;
        }
        *status = Status::Expired;
        drop(status);
        let removed = self.ensemble.with_tree(|tree| {
            tree.forget_watches(self.id);
            tree.remove_ephemerals(self.id)
        });
        debug!(session = self.id, removed, "memory session expired");
        let _ = self.sink.emit(SessionEvent::Expired);
    }

    fn run<T>(&self, kind: OpKind, f: impl FnOnce(&mut Tree) -> Result<T>) -> Result<T> {
        match *self.status.lock() {
            Status::Connected => {}
            Status::Connecting | Status::Disconnected => return Err(CoordError::ConnectionLoss),
            Status::Expired => return Err(CoordError::SessionExpired),
            Status::Closed => return Err(CoordError::SessionClosed),
        }
        self.ensemble.apply(kind, f)
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn exists(&self, path: &str) -> Result<Option<Stat>> {
        self.run(OpKind::Exists, |tree| tree.exists(path))
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.run(OpKind::GetChildren, |tree| tree.children(path))
            .map(|read| read.children)
    }

    async fn get_children_with_stat(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<NodeChildren> {
        let owner = self.id;
        self.run(OpKind::GetChildren, |tree| {
            let read = tree.children(path)?;
            if let Some(watcher) = watcher {
                tree.watch_children(path, owner, watcher);
            }
            Ok(read)
        })
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        self.run(OpKind::GetData, |tree| tree.data(path))
            .map(|read| read.data)
    }

    async fn get_data_with_stat(
        &self,
        path: &str,
        watcher: Option<Arc<dyn Watcher>>,
    ) -> Result<NodeData> {
        let owner = self.id;
        self.run(OpKind::GetData, |tree| {
            let read = tree.data(path)?;
            if let Some(watcher) = watcher {
                tree.watch_data(path, owner, watcher);
            }
            Ok(read)
        })
    }

    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> Result<Stat> {
        self.run(OpKind::SetData, |tree| tree.set_data(path, data, version))
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        let owner = self.id;
        self.run(OpKind::Create, |tree| tree.create(path, data, mode, owner))
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        self.run(OpKind::Delete, |tree| tree.delete(path, version))
    }

    async fn close(&self) {
        let previous = std::mem::replace(&mut *self.status.lock(), Status::Closed);
        if previous != Status::Closed {
            let removed = self.ensemble.with_tree(|tree| {
                tree.forget_watches(self.id);
                tree.remove_ephemerals(self.id)
            });
            debug!(session = self.id, removed, "memory session closed");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connector
// ─────────────────────────────────────────────────────────────────────────────

/// Opens [`MemorySession`]s and records every attempt.
pub struct MemoryConnector {
    ensemble: MemoryEnsemble,
    auto_establish: bool,
    failures_left: Mutex<u32>,
    attempts: Mutex<Vec<EnsembleTarget>>,
    sessions: Mutex<Vec<Arc<MemorySession>>>,
}

impl MemoryConnector {
    /// Connector whose sessions connect as soon as they are opened.
    pub fn new(ensemble: MemoryEnsemble) -> Self {
        Self {
            ensemble,
            auto_establish: true,
            failures_left: Mutex::new(0),
            attempts: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Connector whose sessions stay connecting until
    /// [`MemorySession::establish`] is called.
    pub fn manual(ensemble: MemoryEnsemble) -> Self {
        Self {
            auto_establish: false,
            ..Self::new(ensemble)
        }
    }

    /// Refuse the next `count` connect attempts.
    pub fn fail_next_connects(&self, count: u32) {
        *self.failures_left.lock() = count;
    }

    /// The ensemble sessions operate on.
    pub fn ensemble(&self) -> &MemoryEnsemble {
        &self.ensemble
    }

    /// Every target a connect was attempted against, failed ones included.
    pub fn attempts(&self) -> Vec<EnsembleTarget> {
        self.attempts.lock().clone()
    }

    /// Number of connect attempts so far.
    pub fn connect_count(&self) -> usize {
        self.attempts.lock().len()
    }

    /// Sessions opened so far, oldest first.
    pub fn sessions(&self) -> Vec<Arc<MemorySession>> {
        self.sessions.lock().clone()
    }

    /// The most recently opened session.
    pub fn latest_session(&self) -> Option<Arc<MemorySession>> {
        self.sessions.lock().last().cloned()
    }
}

impl SessionConnector for MemoryConnector {
    fn connect(&self, target: &EnsembleTarget, sink: EventSink) -> Result<Arc<dyn Session>> {
        self.attempts.lock().push(target.clone());
        {
            let mut failures = self.failures_left.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(CoordError::Connect(format!(
                    "{} refused the connection",
                    target.connect_string
                )));
            }
        }

        let session = Arc::new(MemorySession::new(self.ensemble.clone(), sink));
        self.sessions.lock().push(Arc::clone(&session));
        debug!(session = session.id(), generation = session.generation(), "memory session opened");
        if self.auto_establish {
            session.establish();
        }
        Ok(session)
    }
}
