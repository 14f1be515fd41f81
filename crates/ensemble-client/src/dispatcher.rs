//! Ordered, de-duplicated delivery of connectivity callbacks.
//!
//! State transitions become boolean notifications (`true` on entering the
//! connected state, `false` on leaving it) queued to one dedicated thread.
//! For every notification the thread snapshots the registered listeners and
//! calls each one whose last delivered value differs. A listener that has
//! heard nothing counts as disconnected. The history is rebuilt from the
//! snapshot every cycle, so removed listeners are forgotten.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ensemble_core::{ConnectionState, LifecycleListener, ListenerId};
use metrics::counter;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const THREAD_NAME: &str = "ensemble-dispatch";

enum Dispatch {
    Notify(bool),
    Barrier(oneshot::Sender<()>),
    Stop,
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ListenerRegistry {
    entries: RwLock<Vec<(ListenerId, Arc<dyn LifecycleListener>)>>,
}

impl ListenerRegistry {
    /// Returns the id and whether the listener was newly added.
    fn add(&self, listener: Arc<dyn LifecycleListener>) -> (ListenerId, bool) {
        let mut entries = self.entries.write();
        if let Some((id, _)) = entries.iter().find(|(_, l)| Arc::ptr_eq(l, &listener)) {
            return (id.clone(), false);
        }
        let id = ListenerId::new();
        entries.push((id.clone(), listener));
        (id, true)
    }

    fn remove(&self, id: &ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(existing, _)| existing != id);
        entries.len() != before
    }

    fn snapshot(&self) -> Vec<(ListenerId, Arc<dyn LifecycleListener>)> {
        self.entries.read().clone()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

/// Delivers lifecycle callbacks on a dedicated thread.
///
/// The thread exits when [`shutdown`](Self::shutdown) is called or the
/// dispatcher is dropped.
pub struct ListenerDispatcher {
    registry: Arc<ListenerRegistry>,
    tx: mpsc::UnboundedSender<Dispatch>,
    stopped: AtomicBool,
}

impl ListenerDispatcher {
    /// Spawn the dispatch thread.
    ///
    /// The thread logs through whichever `tracing` dispatcher is current on
    /// the calling thread.
    pub fn start() -> std::io::Result<Self> {
        let registry = Arc::new(ListenerRegistry::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatch = tracing::dispatcher::get_default(|current| current.clone());

        let worker_registry = Arc::clone(&registry);
        let _detached = std::thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || run(&worker_registry, rx));
            })?;

        Ok(Self {
            registry,
            tx,
            stopped: AtomicBool::new(false),
        })
    }

    /// Register a listener. Registering the same `Arc` again returns the
    /// existing id, and the second element is `false`.
    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) -> (ListenerId, bool) {
        let (id, added) = self.registry.add(listener);
        if added {
            debug!(listener_id = %id, "lifecycle listener registered");
        }
        (id, added)
    }

    /// Unregister a listener. Returns `false` if the id was unknown.
    pub fn remove_listener(&self, id: &ListenerId) -> bool {
        let removed = self.registry.remove(id);
        if removed {
            debug!(listener_id = %id, "lifecycle listener removed");
        }
        removed
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.registry.len()
    }

    /// Queue the notification implied by a state transition, if any.
    pub fn state_changed(&self, old: ConnectionState, new: ConnectionState) {
        if new.is_connected() {
            self.push(Dispatch::Notify(true));
        } else if old.is_connected() {
            self.push(Dispatch::Notify(false));
        }
    }

    /// Queue a connected notification outside of a transition.
    ///
    /// Used when a listener registers while already connected. Listeners that
    /// last saw `true` are skipped, so only the newcomer is called.
    pub fn notify_connected(&self) {
        self.push(Dispatch::Notify(true));
    }

    /// Wait until every notification queued so far has been delivered.
    /// Returns immediately once the dispatcher is stopped.
    pub async fn drained(&self) {
        if self.is_stopped() {
            return;
        }
        let (done, wait) = oneshot::channel();
        self.push(Dispatch::Barrier(done));
        let _ = wait.await;
    }

    /// Stop the dispatch thread after it delivers what is already queued.
    /// Later notifications are ignored.
    pub fn shutdown(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Dispatch::Stop);
            debug!("listener dispatcher stopping");
        }
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn push(&self, message: Dispatch) {
        if self.is_stopped() {
            debug!("listener dispatcher stopped, dropping notification");
            return;
        }
        let _ = self.tx.send(message);
    }
}

impl Drop for ListenerDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(registry: &ListenerRegistry, mut rx: mpsc::UnboundedReceiver<Dispatch>) {
    let mut history: HashMap<ListenerId, bool> = HashMap::new();

    while let Some(message) = rx.blocking_recv() {
        let connected = match message {
            Dispatch::Notify(connected) => connected,
            Dispatch::Barrier(done) => {
                let _ = done.send(());
                continue;
            }
            Dispatch::Stop => break,
        };

        let listeners = registry.snapshot();
        let mut next = HashMap::with_capacity(listeners.len());
        for (id, listener) in listeners {
            let last = history.get(&id).copied().unwrap_or(false);
            if last != connected {
                deliver(&id, listener.as_ref(), connected);
            }
            let _ = next.insert(id, connected);
        }
        history = next;
    }

    debug!("listener dispatcher stopped");
}

fn deliver(id: &ListenerId, listener: &dyn LifecycleListener, connected: bool) {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        if connected {
            listener.on_connected();
        } else {
            listener.on_disconnected();
        }
    }));

    if let Err(panic) = outcome {
        counter!("ensemble_listener_failures_total").increment(1);
        warn!(
            listener_id = %id,
            connected,
            panic = %panic_message(panic.as_ref()),
            "lifecycle listener failed, ignoring"
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Weak;
    use std::time::Duration;

    use ensemble_core::logging::capture_logs;
    use parking_lot::Mutex;
    use tracing::Level;

    use super::*;
    use ensemble_core::ConnectionState::{Connected, Connecting, Reconnecting, Unconfigured};

    /// Records callbacks as `"connected"` / `"disconnected"`.
    #[derive(Default)]
    pub(crate) struct Recorder {
        calls: Mutex<Vec<&'static str>>,
    }

    impl Recorder {
        pub(crate) fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().clone()
        }
    }

    impl LifecycleListener for Recorder {
        fn on_connected(&self) {
            self.calls.lock().push("connected");
        }

        fn on_disconnected(&self) {
            self.calls.lock().push("disconnected");
        }
    }

    struct Exploding;

    impl LifecycleListener for Exploding {
        fn on_connected(&self) {
            panic!("listener blew up");
        }

        fn on_disconnected(&self) {}
    }

    #[tokio::test]
    async fn only_connected_edges_notify() {
        let dispatcher = ListenerDispatcher::start().unwrap();
        let recorder = Arc::new(Recorder::default());
        let _ = dispatcher.add_listener(recorder.clone());

        dispatcher.state_changed(Unconfigured, Connecting);
        dispatcher.state_changed(Connecting, Connected);
        dispatcher.state_changed(Connected, Reconnecting);
        dispatcher.state_changed(Reconnecting, Unconfigured);
        dispatcher.state_changed(Unconfigured, Connecting);
        dispatcher.state_changed(Connecting, Connected);
        dispatcher.drained().await;

        assert_eq!(recorder.calls(), ["connected", "disconnected", "connected"]);
    }

    #[tokio::test]
    async fn fresh_listener_skips_pending_disconnect() {
        let dispatcher = ListenerDispatcher::start().unwrap();
        let recorder = Arc::new(Recorder::default());
        let _ = dispatcher.add_listener(recorder.clone());

        dispatcher.state_changed(Connected, Reconnecting);
        dispatcher.state_changed(Reconnecting, Connected);
        dispatcher.drained().await;

        assert_eq!(recorder.calls(), ["connected"]);
    }

    #[tokio::test]
    async fn repeated_values_are_suppressed() {
        let dispatcher = ListenerDispatcher::start().unwrap();
        let recorder = Arc::new(Recorder::default());
        let _ = dispatcher.add_listener(recorder.clone());

        dispatcher.notify_connected();
        dispatcher.notify_connected();
        dispatcher.state_changed(Connected, Reconnecting);
        dispatcher.state_changed(Connected, Reconnecting);
        dispatcher.drained().await;

        assert_eq!(recorder.calls(), ["connected", "disconnected"]);
    }

    #[tokio::test]
    async fn synthetic_connect_reaches_only_newcomers() {
        let dispatcher = ListenerDispatcher::start().unwrap();
        let first = Arc::new(Recorder::default());
        let _ = dispatcher.add_listener(first.clone());
        dispatcher.state_changed(Connecting, Connected);
        dispatcher.drained().await;

        let second = Arc::new(Recorder::default());
        let (_, added) = dispatcher.add_listener(second.clone());
        assert!(added);
        dispatcher.notify_connected();
        dispatcher.drained().await;

        assert_eq!(first.calls(), ["connected"]);
        assert_eq!(second.calls(), ["connected"]);
    }

    #[tokio::test]
    async fn duplicate_registration_keeps_id() {
        let dispatcher = ListenerDispatcher::start().unwrap();
        let recorder = Arc::new(Recorder::default());
        let (id, added) = dispatcher.add_listener(recorder.clone());
        let (again, added_again) = dispatcher.add_listener(recorder);
        assert!(added);
        assert!(!added_again);
        assert_eq!(id, again);
        assert_eq!(dispatcher.listener_count(), 1);
    }

    #[tokio::test]
    async fn removed_listener_history_is_forgotten() {
        let dispatcher = ListenerDispatcher::start().unwrap();
        let recorder = Arc::new(Recorder::default());
        let (id, _) = dispatcher.add_listener(recorder.clone());
        dispatcher.notify_connected();
        dispatcher.drained().await;

        assert!(dispatcher.remove_listener(&id));
        assert!(!dispatcher.remove_listener(&id));
        dispatcher.state_changed(Connected, Reconnecting);
        dispatcher.drained().await;

        // Re-registering starts from an empty history.
        let _ = dispatcher.add_listener(recorder.clone());
        dispatcher.notify_connected();
        dispatcher.drained().await;

        assert_eq!(recorder.calls(), ["connected", "connected"]);
    }

    /// Adds a newcomer and removes a victim from inside its first callback.
    struct Mutator {
        dispatcher: Weak<ListenerDispatcher>,
        newcomer: Arc<Recorder>,
        victim: Mutex<Option<ListenerId>>,
        thread: Mutex<Option<String>>,
    }

    impl LifecycleListener for Mutator {
        fn on_connected(&self) {
            *self.thread.lock() = std::thread::current().name().map(str::to_owned);
            let Some(dispatcher) = self.dispatcher.upgrade() else {
                return;
            };
            let _ = dispatcher.add_listener(self.newcomer.clone());
            if let Some(victim) = self.victim.lock().take() {
                assert!(dispatcher.remove_listener(&victim));
            }
        }

        fn on_disconnected(&self) {}
    }

    #[tokio::test]
    async fn listeners_may_change_the_registry_from_a_callback() {
        let dispatcher = Arc::new(ListenerDispatcher::start().unwrap());
        let victim = Arc::new(Recorder::default());
        let (victim_id, _) = dispatcher.add_listener(victim.clone());
        let mutator = Arc::new(Mutator {
            dispatcher: Arc::downgrade(&dispatcher),
            newcomer: Arc::new(Recorder::default()),
            victim: Mutex::new(Some(victim_id)),
            thread: Mutex::new(None),
        });
        let _ = dispatcher.add_listener(mutator.clone());
        let settle = || tokio::time::timeout(Duration::from_secs(5), dispatcher.drained());

        dispatcher.state_changed(Connecting, Connected);
        settle().await.expect("dispatch thread blocked");
        assert_eq!(victim.calls(), ["connected"]);
        assert!(mutator.newcomer.calls().is_empty());
        assert_eq!(dispatcher.listener_count(), 2);
        assert_eq!(mutator.thread.lock().as_deref(), Some(THREAD_NAME));

        // The newcomer joins on the next cycle; the mutator already saw it.
        dispatcher.notify_connected();
        settle().await.expect("dispatch thread blocked");
        assert_eq!(mutator.newcomer.calls(), ["connected"]);
        assert_eq!(victim.calls(), ["connected"]);

        // Back under a new id, the victim starts over.
        let _ = dispatcher.add_listener(victim.clone());
        dispatcher.notify_connected();
        settle().await.expect("dispatch thread blocked");
        assert_eq!(victim.calls(), ["connected", "connected"]);
        assert_eq!(mutator.newcomer.calls(), ["connected"]);
    }

    #[tokio::test]
    async fn panicking_listener_is_isolated() {
        let (logs, _guard) = capture_logs();
        let dispatcher = ListenerDispatcher::start().unwrap();
        let _ = dispatcher.add_listener(Arc::new(Exploding));
        let recorder = Arc::new(Recorder::default());
        let _ = dispatcher.add_listener(recorder.clone());

        dispatcher.state_changed(Connecting, Connected);
        dispatcher.state_changed(Connected, Reconnecting);
        dispatcher.drained().await;

        assert_eq!(recorder.calls(), ["connected", "disconnected"]);
        assert!(logs.has_event(Level::WARN, "lifecycle listener failed"));
    }

    #[tokio::test]
    async fn shutdown_ignores_later_notifications() {
        let dispatcher = ListenerDispatcher::start().unwrap();
        let recorder = Arc::new(Recorder::default());
        let _ = dispatcher.add_listener(recorder.clone());

        dispatcher.notify_connected();
        dispatcher.shutdown();
        dispatcher.state_changed(Connected, Reconnecting);
        dispatcher.drained().await;
        assert!(dispatcher.is_stopped());

        // The notification queued before shutdown is still delivered.
        for _ in 0..200 {
            if !recorder.calls().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(recorder.calls(), ["connected"]);
    }

    #[test]
    fn panic_messages() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
