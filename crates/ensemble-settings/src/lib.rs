//! # ensemble-settings
//!
//! Configuration surface for the ensemble client.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ClientSettings::default()`]
//! 2. **User file**: `~/.ensemble/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `ENSEMBLE_*` overrides (highest priority)
//!
//! A loaded snapshot is handed to the supervisor, which reconfigures only
//! when the connect string or session timeout changed.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path,
};
pub use types::ClientSettings;
