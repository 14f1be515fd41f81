//! # ensemble-client
//!
//! A supervised client for a hierarchical coordination service.
//!
//! Callers get a stable facade over a session that may drop, expire, or be
//! replaced underneath them:
//!
//! - [`ConnectionSupervisor`] owns the session lifecycle: configure, start,
//!   raw event handling, expiry recovery, shutdown
//! - [`ConnectionStateMachine`] holds the four-valued state and lets callers
//!   wait for a target state
//! - [`ListenerDispatcher`] turns state transitions into ordered,
//!   de-duplicated connect/disconnect callbacks on a dedicated thread
//! - [`RetryingClient`] re-issues operations across connection loss, with
//!   idempotence guards for create and delete
//! - [`memory`] is an in-process ensemble implementing the session boundary

#![deny(unsafe_code)]

pub mod dispatcher;
pub mod memory;
mod recovery;
pub mod retry;
pub mod state;
pub mod supervisor;

pub use dispatcher::ListenerDispatcher;
pub use memory::{Fault, MemoryConnector, MemoryEnsemble, MemorySession, OpKind};
pub use retry::{RetryingClient, SessionAccess};
pub use state::ConnectionStateMachine;
pub use supervisor::{ConnectionSupervisor, SupervisorOptions};
