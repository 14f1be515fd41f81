//! One-shot node watches.
//!
//! A [`Watcher`] passed to a watched read is registered on the node it read
//! and fires at most once, on the next change of the watched kind. Watches
//! belong to the session that set them and vanish with it.

use serde::{Deserialize, Serialize};

/// What changed on a watched node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEventKind {
    /// The node was deleted. Fires both data and child watches.
    NodeDeleted,
    /// The node's data was replaced.
    NodeDataChanged,
    /// A child was created or deleted.
    NodeChildrenChanged,
}

/// A fired watch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    /// What changed.
    pub kind: WatchEventKind,
    /// The watched node.
    pub path: String,
}

impl WatchEvent {
    /// Event of `kind` on `path`.
    pub fn new(kind: WatchEventKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// Receives fired watches.
///
/// Called on whichever thread applied the change, outside of any session
/// lock. Registering the same `Arc` twice on one node fires it once.
pub trait Watcher: Send + Sync {
    /// Handle one fired watch.
    fn process(&self, event: WatchEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_snake_case() {
        let event = WatchEvent::new(WatchEventKind::NodeChildrenChanged, "/a");
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"kind":"node_children_changed","path":"/a"}"#);
    }
}
