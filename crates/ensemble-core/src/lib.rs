//! # ensemble-core
//!
//! Shared vocabulary for the ensemble coordination client.
//!
//! - **State**: [`ConnectionState`], the four-valued lifecycle of a client
//! - **Errors**: [`CoordError`], one `thiserror` enum with retry classification
//! - **Nodes**: [`Stat`], [`CreateMode`], [`NodeData`], [`NodeChildren`] and path helpers
//! - **Session boundary**: [`Session`], [`SessionConnector`], [`EventSink`], [`SessionEvent`]
//! - **Watches**: [`Watcher`] and [`WatchEvent`], one-shot node change notifications
//! - **Listeners**: [`LifecycleListener`] and its branded [`ListenerId`]
//! - **Logging**: subscriber setup and log capture for tests

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod listener;
pub mod logging;
pub mod node;
pub mod session;
pub mod state;
pub mod watch;

pub use errors::{CoordError, Result};
pub use ids::ListenerId;
pub use listener::LifecycleListener;
pub use node::{CreateMode, NodeChildren, NodeData, Stat};
pub use session::{EnsembleTarget, EventSink, Session, SessionConnector, SessionEvent, SessionNotice};
pub use state::ConnectionState;
pub use watch::{WatchEvent, WatchEventKind, Watcher};
