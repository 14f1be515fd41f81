//! Connection lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::session::SessionEvent;

/// Lifecycle state of a supervised coordination client.
///
/// There is no terminal state: a shut-down client returns to
/// [`Unconfigured`](Self::Unconfigured) and may be configured again.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No target configured, or explicitly torn down.
    #[default]
    Unconfigured,
    /// A session handle was created and is establishing its first connection.
    Connecting,
    /// The session is live; operations may be issued.
    Connected,
    /// The session lost its connection (or is being replaced) and awaits recovery.
    Reconnecting,
}

impl ConnectionState {
    /// Lowercase name, used in log fields and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// Whether operations may be issued in this state.
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    /// State reached after a raw session event, assuming any restart the event
    /// triggers succeeds. `None` means the event leaves the state alone.
    pub fn after(self, event: SessionEvent) -> Option<Self> {
        match event {
            SessionEvent::Connected => Some(Self::Connected),
            SessionEvent::Disconnected if self == Self::Unconfigured => None,
            SessionEvent::Disconnected => Some(Self::Reconnecting),
            SessionEvent::Expired => Some(Self::Connecting),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_unconfigured() {
        assert_eq!(ConnectionState::default(), ConnectionState::Unconfigured);
    }

    #[test]
    fn connected_event_always_connects() {
        for state in [
            ConnectionState::Unconfigured,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
        ] {
            assert_eq!(state.after(SessionEvent::Connected), Some(ConnectionState::Connected));
        }
    }

    #[test]
    fn disconnect_ignored_when_unconfigured() {
        assert_eq!(ConnectionState::Unconfigured.after(SessionEvent::Disconnected), None);
        assert_eq!(
            ConnectionState::Connected.after(SessionEvent::Disconnected),
            Some(ConnectionState::Reconnecting)
        );
    }

    #[test]
    fn expiry_restarts() {
        assert_eq!(
            ConnectionState::Connected.after(SessionEvent::Expired),
            Some(ConnectionState::Connecting)
        );
    }

    #[test]
    fn serde_lowercase() {
        let json = serde_json::to_string(&ConnectionState::Reconnecting).unwrap();
        assert_eq!(json, "\"reconnecting\"");
        let back: ConnectionState = serde_json::from_str("\"connected\"").unwrap();
        assert_eq!(back, ConnectionState::Connected);
    }

    #[test]
    fn display_matches_as_str() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    }
}
