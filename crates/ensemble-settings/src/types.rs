//! Client settings.

use std::time::Duration;

use ensemble_core::EnsembleTarget;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Default session timeout.
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 10_000;
/// Default backoff between recovery attempts.
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 20_000;

/// Settings consumed by the connection supervisor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Comma-separated `host:port` list. `None` leaves the client unconfigured.
    pub connect_string: Option<String>,
    /// Session timeout negotiated with the ensemble.
    pub session_timeout_ms: u64,
    /// Fixed backoff between recovery attempts after a failed start.
    pub reconnect_interval_ms: u64,
    /// Upper bound on waiting for a connection before an operation.
    /// `None` waits indefinitely.
    pub operation_timeout_ms: Option<u64>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_string: None,
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            operation_timeout_ms: None,
        }
    }
}

impl ClientSettings {
    /// Settings targeting `connect_string` with every other value defaulted.
    pub fn with_connect_string(connect_string: impl Into<String>) -> Self {
        Self {
            connect_string: Some(connect_string.into()),
            ..Self::default()
        }
    }

    /// Session timeout as a [`Duration`].
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Recovery backoff as a [`Duration`].
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Operation wait bound as a [`Duration`].
    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }

    /// Connection target, or `None` when no connect string is set.
    pub fn target(&self) -> Option<EnsembleTarget> {
        self.connect_string
            .as_deref()
            .map(|url| EnsembleTarget::new(url, self.session_timeout()))
    }

    /// Reject values the supervisor cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.connect_string.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(SettingsError::InvalidValue(
                "connectString must not be empty".into(),
            ));
        }
        if self.session_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "sessionTimeoutMs must be positive".into(),
            ));
        }
        if self.reconnect_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "reconnectIntervalMs must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults() {
        let s = ClientSettings::default();
        assert_eq!(s.connect_string, None);
        assert_eq!(s.session_timeout(), Duration::from_secs(10));
        assert_eq!(s.reconnect_interval(), Duration::from_secs(20));
        assert_eq!(s.operation_timeout(), None);
        assert!(s.target().is_none());
    }

    #[test]
    fn target_carries_timeout() {
        let mut s = ClientSettings::with_connect_string("a:2181,b:2181");
        s.session_timeout_ms = 4000;
        let target = s.target().unwrap();
        assert_eq!(target.connect_string, "a:2181,b:2181");
        assert_eq!(target.session_timeout, Duration::from_secs(4));
    }

    #[test]
    fn camel_case_json() {
        let json = serde_json::to_value(ClientSettings::with_connect_string("h:1")).unwrap();
        assert_eq!(json["connectString"], "h:1");
        assert_eq!(json["sessionTimeoutMs"], 10_000);
        assert_eq!(json["reconnectIntervalMs"], 20_000);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: ClientSettings = serde_json::from_str(r#"{"connectString":"h:1"}"#).unwrap();
        assert_eq!(s.connect_string.as_deref(), Some("h:1"));
        assert_eq!(s.session_timeout_ms, DEFAULT_SESSION_TIMEOUT_MS);
    }

    #[test]
    fn validation() {
        assert!(ClientSettings::default().validate().is_ok());
        assert_matches!(
            ClientSettings::with_connect_string(" ").validate(),
            Err(SettingsError::InvalidValue(_))
        );
        let zero = ClientSettings {
            session_timeout_ms: 0,
            ..ClientSettings::default()
        };
        assert_matches!(zero.validate(), Err(SettingsError::InvalidValue(_)));
        let zero = ClientSettings {
            reconnect_interval_ms: 0,
            ..ClientSettings::default()
        };
        assert_matches!(zero.validate(), Err(SettingsError::InvalidValue(_)));
    }
}
