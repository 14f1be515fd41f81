//! Structured logging with `tracing`.
//!
//! The client crates only emit events; installing a subscriber is up to the
//! host. [`init_subscriber`] is the default stderr setup, and
//! [`test_utils::capture_logs`] records events for assertions.

pub mod test_utils;

pub use test_utils::{CapturedLogs, capture_logs};

/// Initialize the global tracing subscriber with stderr output only.
///
/// `RUST_LOG` wins over `level` when set. Subsequent calls are no-ops.
pub fn init_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .compact();

    let _ = subscriber.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        init_subscriber("warn");
        init_subscriber("debug");
        tracing::warn!("still logging");
    }
}
