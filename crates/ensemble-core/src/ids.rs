//! Branded identifiers.
//!
//! Listener registrations are keyed by a [`ListenerId`] rather than by the
//! identity of the listener object, so the dispatcher's per-listener history
//! never depends on pointer equality.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Handle returned when a lifecycle listener is registered.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerId(String);

impl ListenerId {
    /// Create a new time-ordered ID (`lsn_` + UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(format!("lsn_{}", Uuid::now_v7()))
    }

    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl AsRef<str> for ListenerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
