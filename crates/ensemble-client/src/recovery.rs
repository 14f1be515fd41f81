//! Background recovery after a session could not be started.
//!
//! At most one recovery task runs at a time. It holds the lifecycle lock
//! for its whole life, including the backoff between attempts, and keeps
//! trying until the state leaves unconfigured (a start got a handle).
//! Reconfiguration and shutdown cancel it through its ticket before taking
//! the lock themselves.

use std::sync::Arc;
use std::time::Duration;

use ensemble_core::ConnectionState;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::supervisor::SupervisorCore;

/// Marks the running recovery task.
pub(crate) struct RecoveryTicket {
    pub(crate) id: u64,
    pub(crate) cancel: CancellationToken,
}

impl RecoveryTicket {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            cancel: CancellationToken::new(),
        }
    }
}

/// Body of the recovery task identified by `ticket_id`.
pub(crate) async fn recover(
    core: Arc<SupervisorCore>,
    ticket_id: u64,
    cancel: CancellationToken,
    interval: Duration,
) {
    info!(ticket = ticket_id, "session recovery started");

    let mut lifecycle = tokio::select! {
        guard = core.lifecycle.lock() => guard,
        () = cancel.cancelled() => {
            core.finish_recovery(ticket_id);
            debug!(ticket = ticket_id, "session recovery cancelled before starting");
            return;
        }
    };

    let mut attempts: u32 = 0;
    while !cancel.is_cancelled()
        && lifecycle.target.is_some()
        && core.state.current() == ConnectionState::Unconfigured
    {
        attempts += 1;
        counter!("ensemble_recovery_attempts_total").increment(1);
        match core.start(&mut lifecycle) {
            Ok(()) => info!(attempts, "session recovery obtained a new session"),
            Err(error) => {
                warn!(
                    attempts,
                    %error,
                    kind = error.error_kind(),
                    retry_in_ms = interval.as_millis() as u64,
                    "session recovery attempt failed"
                );
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = cancel.cancelled() => {}
                }
            }
        }
    }

    core.finish_recovery(ticket_id);
    drop(lifecycle);
    info!(attempts, cancelled = cancel.is_cancelled(), "session recovery finished");
}
