//! The connection state machine.
//!
//! The current value sits behind a mutex. Every change queues its
//! dispatcher notification and publishes to a watch channel inside that
//! critical section, so waiters and listeners both see transitions in
//! the order they happened.

use std::sync::Arc;
use std::time::Duration;

use ensemble_core::{ConnectionState, CoordError, Result};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::dispatcher::ListenerDispatcher;

/// Holds the lifecycle state and wakes tasks waiting for a target state.
pub struct ConnectionStateMachine {
    current: Mutex<ConnectionState>,
    watch: watch::Sender<ConnectionState>,
    dispatcher: Arc<ListenerDispatcher>,
}

impl ConnectionStateMachine {
    /// Start in [`ConnectionState::Unconfigured`], reporting transitions to `dispatcher`.
    pub fn new(dispatcher: Arc<ListenerDispatcher>) -> Self {
        let (watch, _) = watch::channel(ConnectionState::Unconfigured);
        Self {
            current: Mutex::new(ConnectionState::Unconfigured),
            watch,
            dispatcher,
        }
    }

    /// The current state.
    pub fn current(&self) -> ConnectionState {
        *self.current.lock()
    }

    /// Move to `new`. Returns `false` (and does nothing) if already there.
    pub fn change_state(&self, new: ConnectionState) -> bool {
        let mut current = self.current.lock();
        let old = *current;
        if old == new {
            return false;
        }
        *current = new;

        debug!(from = %old, to = %new, "connection state changed");
        counter!("ensemble_state_transitions_total", "to" => new.as_str()).increment(1);
        self.dispatcher.state_changed(old, new);
        let _ = self.watch.send_replace(new);
        true
    }

    /// Run `f` with the state locked, so no transition can interleave.
    pub fn observe<R>(&self, f: impl FnOnce(ConnectionState) -> R) -> R {
        let current = self.current.lock();
        f(*current)
    }

    /// A receiver that sees the latest state. Intermediate states may be
    /// skipped by a slow reader.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.watch.subscribe()
    }

    /// Wait until the state equals `target`.
    ///
    /// Returns at once if it already does. With a timeout, fails with
    /// [`CoordError::Timeout`] when the deadline passes first.
    pub async fn wait_for_state(
        &self,
        target: ConnectionState,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let mut rx = self.watch.subscribe();
        let reached = rx.wait_for(|state| *state == target);
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, reached)
                .await
                .map_err(|_| CoordError::Timeout {
                    state: target,
                    waited: limit,
                })?,
            None => reached.await,
        };
        outcome.map(drop).map_err(|_| CoordError::Interrupted)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::dispatcher::tests::Recorder;
    use ensemble_core::ConnectionState::{Connected, Connecting, Reconnecting, Unconfigured};

    fn machine() -> (ConnectionStateMachine, Arc<ListenerDispatcher>) {
        let dispatcher = Arc::new(ListenerDispatcher::start().unwrap());
        (ConnectionStateMachine::new(Arc::clone(&dispatcher)), dispatcher)
    }

    #[tokio::test]
    async fn starts_unconfigured() {
        let (machine, _) = machine();
        assert_eq!(machine.current(), Unconfigured);
    }

    #[tokio::test]
    async fn same_state_is_a_no_op() {
        let (machine, dispatcher) = machine();
        let recorder = Arc::new(Recorder::default());
        let _ = dispatcher.add_listener(recorder.clone());

        assert!(machine.change_state(Connected));
        assert!(!machine.change_state(Connected));
        dispatcher.drained().await;
        assert_eq!(recorder.calls(), ["connected"]);
    }

    #[tokio::test]
    async fn transitions_feed_the_dispatcher() {
        let (machine, dispatcher) = machine();
        let recorder = Arc::new(Recorder::default());
        let _ = dispatcher.add_listener(recorder.clone());

        for state in [Connecting, Connected, Reconnecting, Connected, Unconfigured] {
            let _ = machine.change_state(state);
        }
        dispatcher.drained().await;
        assert_eq!(recorder.calls(), ["connected", "disconnected", "connected", "disconnected"]);
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_there() {
        let (machine, _) = machine();
        machine
            .wait_for_state(Unconfigured, Some(Duration::ZERO))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_wakes_on_transition() {
        let (machine, _) = machine();
        let machine = Arc::new(machine);
        let waiter = {
            let machine = Arc::clone(&machine);
            tokio::spawn(async move { machine.wait_for_state(Connected, None).await })
        };
        tokio::task::yield_now().await;
        let _ = machine.change_state(Connecting);
        let _ = machine.change_state(Connected);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out() {
        let (machine, _) = machine();
        let _ = machine.change_state(Reconnecting);
        let started = tokio::time::Instant::now();

        let result = machine
            .wait_for_state(Connected, Some(Duration::from_millis(100)))
            .await;

        assert_matches!(result, Err(CoordError::Timeout { state: Connected, .. }));
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn observe_holds_the_state() {
        let (machine, _) = machine();
        let _ = machine.change_state(Connected);
        let seen = machine.observe(|state| state);
        assert_eq!(seen, Connected);
    }

    #[tokio::test]
    async fn subscribers_see_latest_value() {
        let (machine, _) = machine();
        let rx = machine.subscribe();
        let _ = machine.change_state(Connecting);
        assert_eq!(*rx.borrow(), Connecting);
    }
}
