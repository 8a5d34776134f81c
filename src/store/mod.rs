//! Coordination Store Module
//!
//! Abstract interface to a hierarchical, versioned, watch-capable
//! coordination store, plus an in-memory implementation used by the
//! simulator and tests.

mod memory;

pub use memory::{MemoryClient, MemoryStore};

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// How a node is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Regular node that outlives the creating session
    Persistent,
    /// Persistent node with a server-assigned sequence suffix
    PersistentSequential,
    /// Node removed when the creating session ends
    Ephemeral,
    /// Ephemeral node with a server-assigned sequence suffix
    EphemeralSequential,
}

impl CreateMode {
    /// Whether the store appends a sequence suffix to the name
    pub fn is_sequential(&self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }

    /// Whether the node lifetime is bound to the session
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }
}

/// Node metadata returned alongside reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// Data version, bumped on every write of the node's data
    pub version: i32,
    /// Child version, bumped whenever a child is created or deleted
    pub cversion: i32,
    /// Transaction that created the node
    pub czxid: i64,
    /// Transaction that last modified the node
    pub mzxid: i64,
    /// Owning session of an ephemeral node (0 for persistent nodes)
    pub ephemeral_owner: u64,
    /// Number of direct children
    pub num_children: i32,
}

/// Kind of change reported by a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

/// A fired watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEvent {
    /// What changed
    pub kind: WatchEventKind,
    /// Path the watch was registered on
    pub path: String,
}

/// One-shot watch callback, invoked on the store's I/O thread
pub type Watcher = Arc<dyn Fn(WatchedEvent) + Send + Sync>;

/// Client connection state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// First successful connection
    Connected,
    /// Connection dropped; the session may still be alive
    Suspended,
    /// Connection re-established (possibly with a new session)
    Reconnected,
    /// Session expired; all its ephemeral nodes are gone
    Lost,
}

impl ConnectionState {
    /// Whether the client can talk to the store in this state
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Reconnected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Suspended => write!(f, "SUSPENDED"),
            ConnectionState::Reconnected => write!(f, "RECONNECTED"),
            ConnectionState::Lost => write!(f, "LOST"),
        }
    }
}

/// Connection state callback, invoked on the store's I/O thread
pub type ConnectionListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Handle returned when registering a connection listener
pub type ListenerId = u64;

/// A coordination store client bound to one session.
///
/// Implementations provide atomic create (including ephemeral and
/// sequential nodes), versioned reads and writes, children listing,
/// one-shot watches and connection state callbacks.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Create a node, returning the path actually created
    /// (which differs from `path` for sequential modes).
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String>;

    /// Create `path` and any missing ancestors as persistent nodes.
    async fn create_parents(&self, path: &str) -> Result<()>;

    /// Read a node's data and stat, optionally leaving a data watch.
    async fn get_data(&self, path: &str, watcher: Option<Watcher>) -> Result<(Vec<u8>, Stat)>;

    /// Overwrite a node's data. `version` of `None` skips the version check.
    async fn set_data(&self, path: &str, data: Vec<u8>, version: Option<i32>) -> Result<Stat>;

    /// Delete a node. `version` of `None` skips the version check.
    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()>;

    /// List the names of a node's direct children, optionally leaving a children watch.
    async fn get_children(&self, path: &str, watcher: Option<Watcher>) -> Result<Vec<String>>;

    /// Last known connection state
    fn is_connected(&self) -> bool;

    /// Register a connection state listener
    fn add_connection_listener(&self, listener: ConnectionListener) -> ListenerId;

    /// Remove a previously registered connection state listener
    fn remove_connection_listener(&self, id: ListenerId);
}

/// Parent of an absolute path ("/" for top-level nodes)
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Last segment of an absolute path
pub fn node_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Sequence number encoded in the trailing digits of a node name
pub fn sequence_of(path: &str) -> Option<u64> {
    let name = node_name(path);
    let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    name[name.len() - digits..].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(parent_path("/a/b/c"), "/a/b");
        assert_eq!(parent_path("/a"), "/");
        assert_eq!(node_name("/a/b/member-0000000004"), "member-0000000004");
        assert_eq!(node_name("/"), "");
    }

    #[test]
    fn test_sequence_parsing() {
        assert_eq!(sequence_of("/group/member-0000000042"), Some(42));
        assert_eq!(sequence_of("/group/00000000001"), Some(1));
        assert_eq!(sequence_of("/group/config"), None);
        // digits in the parent do not count
        assert_eq!(sequence_of("/group7/config"), None);
    }

    #[test]
    fn test_create_mode_flags() {
        assert!(CreateMode::EphemeralSequential.is_sequential());
        assert!(CreateMode::EphemeralSequential.is_ephemeral());
        assert!(!CreateMode::Persistent.is_sequential());
        assert!(!CreateMode::PersistentSequential.is_ephemeral());
    }
}
