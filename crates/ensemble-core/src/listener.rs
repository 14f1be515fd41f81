//! Lifecycle listener contract.

/// Receives connectivity notifications from a supervised client.
///
/// Callbacks run on the dispatcher thread, one at a time, in transition
/// order. They may block; they only delay later notifications. A panic in a
/// callback is caught and logged and does not affect other listeners.
///
/// A listener registered before the first connection never sees
/// `on_disconnected` before its first `on_connected`, and never sees the same
/// callback twice in a row.
pub trait LifecycleListener: Send + Sync {
    /// The client entered the connected state.
    fn on_connected(&self);

    /// The client left the connected state.
    fn on_disconnected(&self);
}
