//! The connection supervisor.
//!
//! Owns the session lifecycle behind one async lock: configuring a target,
//! starting a session, reacting to raw session events, recovering from
//! failed starts, and shutting down. Raw events arrive on a channel drained
//! by one pump task; events from sessions that were since replaced are
//! dropped by generation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use ensemble_core::{
    ConnectionState, CoordError, EnsembleTarget, EventSink, LifecycleListener, ListenerId, Result,
    Session, SessionConnector, SessionEvent, SessionNotice,
};
use ensemble_settings::ClientSettings;
use metrics::counter;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::dispatcher::ListenerDispatcher;
use crate::recovery::{RecoveryTicket, recover};
use crate::retry::{RetryingClient, SessionAccess};
use crate::state::ConnectionStateMachine;

/// Knobs the supervisor reads once at construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupervisorOptions {
    /// Fixed backoff between recovery attempts.
    pub reconnect_interval: Duration,
    /// Default bound on waiting for a connection before an operation.
    pub operation_timeout: Option<Duration>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self::from(&ClientSettings::default())
    }
}

impl From<&ClientSettings> for SupervisorOptions {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            reconnect_interval: settings.reconnect_interval(),
            operation_timeout: settings.operation_timeout(),
        }
    }
}

/// Guarded by the lifecycle lock.
pub(crate) struct Lifecycle {
    pub(crate) target: Option<EnsembleTarget>,
    session: Option<Arc<dyn Session>>,
    generation: u64,
}

pub(crate) struct SupervisorCore {
    pub(crate) state: ConnectionStateMachine,
    pub(crate) lifecycle: Mutex<Lifecycle>,
    dispatcher: Arc<ListenerDispatcher>,
    connector: Arc<dyn SessionConnector>,
    events: mpsc::UnboundedSender<SessionNotice>,
    desired: SyncMutex<Option<EnsembleTarget>>,
    recovery: SyncMutex<Option<RecoveryTicket>>,
    next_ticket: AtomicU64,
    options: SupervisorOptions,
}

impl SupervisorCore {
    /// Open a session for the configured target.
    ///
    /// The state moves to connecting first and back to unconfigured if the
    /// connector refuses.
    pub(crate) fn start(&self, lifecycle: &mut Lifecycle) -> Result<()> {
        let target = lifecycle.target.clone().ok_or(CoordError::NotConfigured)?;
        let _ = self.state.change_state(ConnectionState::Connecting);

        lifecycle.generation += 1;
        let sink = EventSink::new(lifecycle.generation, self.events.clone());
        match self.connector.connect(&target, sink) {
            Ok(session) => {
                info!(
                    connect_string = %target.connect_string,
                    generation = lifecycle.generation,
                    "session started"
                );
                lifecycle.session = Some(session);
                Ok(())
            }
            Err(error) => {
                let _ = self.state.change_state(ConnectionState::Unconfigured);
                Err(error)
            }
        }
    }

    /// [`start`](Self::start), falling back to background recovery.
    fn try_start(self: &Arc<Self>, lifecycle: &mut Lifecycle) {
        if let Err(error) = self.start(lifecycle) {
            warn!(
                %error,
                kind = error.error_kind(),
                "failed to start session, entering recovery"
            );
            self.ensure_recovery();
        }
    }

    fn ensure_recovery(self: &Arc<Self>) {
        let mut slot = self.recovery.lock();
        if slot.is_some() {
            debug!("session recovery already running");
            return;
        }
        let ticket = RecoveryTicket::new(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        let (id, cancel) = (ticket.id, ticket.cancel.clone());
        *slot = Some(ticket);
        drop(slot);

        drop(tokio::spawn(recover(
            Arc::clone(self),
            id,
            cancel,
            self.options.reconnect_interval,
        )));
    }

    fn cancel_recovery(&self) {
        if let Some(ticket) = self.recovery.lock().take() {
            debug!(ticket = ticket.id, "cancelling session recovery");
            ticket.cancel.cancel();
        }
    }

    /// Clear the recovery marker if it still belongs to `ticket_id`.
    pub(crate) fn finish_recovery(&self, ticket_id: u64) {
        let mut slot = self.recovery.lock();
        if slot.as_ref().is_some_and(|ticket| ticket.id == ticket_id) {
            *slot = None;
        }
    }

    async fn process(self: &Arc<Self>, notice: SessionNotice) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.session.is_none() || notice.generation != lifecycle.generation {
            counter!("ensemble_stale_events_total").increment(1);
            debug!(
                event = ?notice.event,
                generation = notice.generation,
                current = lifecycle.generation,
                "dropping event from a replaced session"
            );
            return;
        }

        match notice.event {
            SessionEvent::Connected => {
                let _ = self.state.change_state(ConnectionState::Connected);
            }
            SessionEvent::Disconnected => {
                if self.state.current() != ConnectionState::Unconfigured {
                    let _ = self.state.change_state(ConnectionState::Reconnecting);
                }
            }
            SessionEvent::Expired => {
                warn!(generation = notice.generation, "session expired, starting a new one");
                if let Some(expired) = lifecycle.session.take() {
                    expired.close().await;
                }
                self.try_start(&mut lifecycle);
            }
        }
    }

    async fn reconfigure(self: &Arc<Self>) {
        self.cancel_recovery();
        let mut lifecycle = self.lifecycle.lock().await;
        let target = self.desired.lock().clone();
        if lifecycle.target == target {
            debug!("target unchanged, nothing to reconfigure");
            return;
        }

        info!(
            from = ?lifecycle.target.as_ref().map(|t| &t.connect_string),
            to = ?target.as_ref().map(|t| &t.connect_string),
            "reconfiguring"
        );
        if self.state.current() != ConnectionState::Unconfigured || lifecycle.session.is_some() {
            let next = if target.is_some() {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Unconfigured
            };
            let _ = self.state.change_state(next);
            if let Some(session) = lifecycle.session.take() {
                session.close().await;
            }
        }

        lifecycle.target = target;
        if lifecycle.target.is_some() {
            self.try_start(&mut lifecycle);
        } else {
            // A stale handle's events must not move the state any more.
            lifecycle.generation += 1;
        }
    }
}

#[async_trait]
impl SessionAccess for SupervisorCore {
    async fn session(&self, wait: Option<Duration>) -> Result<Arc<dyn Session>> {
        match self.state.current() {
            ConnectionState::Unconfigured => return Err(CoordError::NotConfigured),
            ConnectionState::Connected => {}
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                self.state
                    .wait_for_state(ConnectionState::Connected, wait)
                    .await
                    .map_err(|error| match error {
                        CoordError::Timeout { waited, .. } => {
                            CoordError::ConnectionUnavailable(waited)
                        }
                        other => other,
                    })?;
            }
        }

        let lifecycle = self.lifecycle.lock().await;
        lifecycle.session.clone().ok_or(CoordError::NotConfigured)
    }
}

fn spawn_event_pump(core: Weak<SupervisorCore>, mut rx: mpsc::UnboundedReceiver<SessionNotice>) {
    drop(tokio::spawn(async move {
        while let Some(notice) = rx.recv().await {
            let Some(core) = core.upgrade() else { break };
            core.process(notice).await;
        }
        debug!("session event pump stopped");
    }));
}

// ─────────────────────────────────────────────────────────────────────────────
// Public facade
// ─────────────────────────────────────────────────────────────────────────────

/// Supervises one coordination session and exposes a stable client over it.
///
/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    core: Arc<SupervisorCore>,
    client: RetryingClient,
}

impl ConnectionSupervisor {
    /// Create an unconfigured supervisor.
    ///
    /// Must be called within a Tokio runtime. Fails only if the listener
    /// dispatch thread cannot be spawned.
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        options: SupervisorOptions,
    ) -> std::io::Result<Self> {
        let dispatcher = Arc::new(ListenerDispatcher::start()?);
        let (events, rx) = mpsc::unbounded_channel();
        let core = Arc::new(SupervisorCore {
            state: ConnectionStateMachine::new(Arc::clone(&dispatcher)),
            lifecycle: Mutex::new(Lifecycle {
                target: None,
                session: None,
                generation: 0,
            }),
            dispatcher,
            connector,
            events,
            desired: SyncMutex::new(None),
            recovery: SyncMutex::new(None),
            next_ticket: AtomicU64::new(1),
            options,
        });
        spawn_event_pump(Arc::downgrade(&core), rx);

        let access: Arc<dyn SessionAccess> = core.clone();
        let client = RetryingClient::new(access, core.options.operation_timeout);
        Ok(Self { core, client })
    }

    /// Create a supervisor and apply `settings` to it.
    pub async fn from_settings(
        connector: Arc<dyn SessionConnector>,
        settings: &ClientSettings,
    ) -> std::io::Result<Self> {
        let supervisor = Self::new(connector, SupervisorOptions::from(settings))?;
        supervisor.apply_settings(settings).await;
        Ok(supervisor)
    }

    /// The operation API.
    pub fn client(&self) -> &RetryingClient {
        &self.client
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Point the client at `target`, or tear it down with `None`.
    ///
    /// Does nothing when the target is unchanged. Otherwise the current
    /// session is closed (the state passes through reconnecting, or lands
    /// in unconfigured for `None`) and a new one is started.
    pub async fn configure(&self, target: Option<EnsembleTarget>) {
        {
            let mut desired = self.core.desired.lock();
            if *desired == target {
                debug!("target unchanged, nothing to reconfigure");
                return;
            }
            *desired = target;
        }
        self.core.reconfigure().await;
    }

    /// [`configure`](Self::configure) from a settings snapshot.
    pub async fn apply_settings(&self, settings: &ClientSettings) {
        self.configure(settings.target()).await;
    }

    /// Close the session, stop recovery and stop the dispatcher.
    ///
    /// Listeners get a final disconnect if the client was connected.
    /// Callers blocked in an operation fail on the closed session or keep
    /// waiting for a connection until their own timeout.
    pub async fn shutdown(&self) {
        *self.core.desired.lock() = None;
        self.core.cancel_recovery();

        let mut lifecycle = self.core.lifecycle.lock().await;
        lifecycle.target = None;
        lifecycle.generation += 1;
        let _ = self.core.state.change_state(ConnectionState::Unconfigured);
        if let Some(session) = lifecycle.session.take() {
            session.close().await;
        }
        drop(lifecycle);

        self.core.dispatcher.shutdown();
        info!("connection supervisor shut down");
    }

    /// Apply one raw session event. Normally called by the event pump.
    pub async fn process(&self, notice: SessionNotice) {
        self.core.process(notice).await;
    }

    // ── State ───────────────────────────────────────────────────────

    /// The current state.
    pub fn state(&self) -> ConnectionState {
        self.core.state.current()
    }

    /// Whether operations can be issued right now.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Whether a target is configured.
    pub fn is_configured(&self) -> bool {
        self.core.desired.lock().is_some()
    }

    /// The configured connect string.
    pub fn connect_string(&self) -> Option<String> {
        self.core
            .desired
            .lock()
            .as_ref()
            .map(|target| target.connect_string.clone())
    }

    /// Whether a recovery task is running.
    pub fn recovery_active(&self) -> bool {
        self.core.recovery.lock().is_some()
    }

    /// Wait until the state equals `target`; see
    /// [`ConnectionStateMachine::wait_for_state`].
    pub async fn wait_for_state(
        &self,
        target: ConnectionState,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.core.state.wait_for_state(target, timeout).await
    }

    /// Wait until connected.
    pub async fn wait_for_connected(&self, timeout: Option<Duration>) -> Result<()> {
        self.wait_for_state(ConnectionState::Connected, timeout).await
    }

    /// Receiver of state changes for observers.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.core.state.subscribe()
    }

    // ── Listeners ───────────────────────────────────────────────────

    /// Register a lifecycle listener.
    ///
    /// If the client is connected, the listener gets one `on_connected`
    /// before any later transition. Registering the same `Arc` twice
    /// returns the existing id.
    pub fn register_listener(&self, listener: Arc<dyn LifecycleListener>) -> ListenerId {
        let dispatcher = &self.core.dispatcher;
        self.core.state.observe(|state| {
            let (id, added) = dispatcher.add_listener(listener);
            if added && state.is_connected() {
                dispatcher.notify_connected();
            }
            id
        })
    }

    /// Unregister a listener. Returns `false` if the id was unknown.
    pub fn remove_listener(&self, id: &ListenerId) -> bool {
        self.core.dispatcher.remove_listener(id)
    }

    /// Wait until every notification queued so far has been delivered.
    pub async fn listeners_drained(&self) {
        self.core.dispatcher.drained().await;
    }
}
