//! In-Memory Coordination Store
//!
//! A single-process stand-in for a coordination service. One `MemoryStore`
//! plays the server; each `MemoryClient` is a session connected to it.
//! Clients can be suspended, reconnected and expired to exercise the
//! connection handling of the group engine.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    parent_path, ConnectionListener, ConnectionState, CoordinationStore, CreateMode, ListenerId,
    Stat, WatchEventKind, WatchedEvent, Watcher,
};
use crate::error::{Error, Result};

/// Watches collected while the tree lock is held, fired after it is released
type Fired = Vec<(Watcher, WatchedEvent)>;

struct ZNode {
    data: Vec<u8>,
    stat: Stat,
}

struct WatchRegistration {
    session: u64,
    watcher: Watcher,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, ZNode>,
    zxid: i64,
    data_watches: HashMap<String, Vec<WatchRegistration>>,
    child_watches: HashMap<String, Vec<WatchRegistration>>,
    protected: HashSet<String>,
}

struct Shared {
    tree: Mutex<Tree>,
    next_session: AtomicU64,
    writes: AtomicU64,
}

/// In-memory coordination store shared by any number of clients
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store containing only the root node
    pub fn new() -> Self {
        let mut tree = Tree::default();
        tree.nodes.insert(
            "/".to_string(),
            ZNode {
                data: Vec::new(),
                stat: Stat::default(),
            },
        );

        Self {
            shared: Arc::new(Shared {
                tree: Mutex::new(tree),
                next_session: AtomicU64::new(1),
                writes: AtomicU64::new(0),
            }),
        }
    }

    /// Open a new, connected session
    pub fn connect(&self) -> Arc<MemoryClient> {
        Arc::new(MemoryClient {
            store: self.clone(),
            session: AtomicU64::new(self.new_session()),
            connected: AtomicBool::new(true),
            expired: AtomicBool::new(false),
            drop_next_create_response: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        })
    }

    /// Deny creation of `path` and everything below it
    pub fn protect(&self, path: &str) {
        self.tree().protected.insert(path.to_string());
    }

    /// Number of create, set and delete operations applied so far
    pub fn write_count(&self) -> u64 {
        self.shared.writes.load(Ordering::SeqCst)
    }

    /// Whether a node exists
    pub fn exists(&self, path: &str) -> bool {
        self.tree().nodes.contains_key(path)
    }

    /// Direct children names of a node, without leaving a watch
    pub fn children_of(&self, path: &str) -> Vec<String> {
        self.tree().children(path).unwrap_or_default()
    }

    /// Raw data of a node, without leaving a watch
    pub fn data_of(&self, path: &str) -> Option<Vec<u8>> {
        self.tree().nodes.get(path).map(|n| n.data.clone())
    }

    fn new_session(&self) -> u64 {
        self.shared.next_session.fetch_add(1, Ordering::SeqCst)
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.shared.tree.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_write(&self) {
        self.shared.writes.fetch_add(1, Ordering::SeqCst);
    }
}

fn validate_path(path: &str, sequential: bool) -> Result<()> {
    if !path.starts_with('/') || path.contains("//") {
        return Err(Error::InvalidPath(path.to_string()));
    }
    if path.len() > 1 && path.ends_with('/') && !sequential {
        return Err(Error::InvalidPath(path.to_string()));
    }
    Ok(())
}

fn same_watcher(a: &Watcher, b: &Watcher) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn add_watch(
    map: &mut HashMap<String, Vec<WatchRegistration>>,
    path: &str,
    session: u64,
    watcher: Watcher,
) {
    let regs = map.entry(path.to_string()).or_default();
    if !regs
        .iter()
        .any(|r| r.session == session && same_watcher(&r.watcher, &watcher))
    {
        regs.push(WatchRegistration { session, watcher });
    }
}

fn take_watches(
    map: &mut HashMap<String, Vec<WatchRegistration>>,
    path: &str,
    kind: WatchEventKind,
    fired: &mut Fired,
) {
    if let Some(regs) = map.remove(path) {
        for reg in regs {
            fired.push((
                reg.watcher,
                WatchedEvent {
                    kind,
                    path: path.to_string(),
                },
            ));
        }
    }
}

impl Tree {
    fn check_permission(&self, path: &str) -> Result<()> {
        let denied = self.protected.iter().any(|p| {
            path == p || (path.starts_with(p.as_str()) && path[p.len()..].starts_with('/'))
        });
        if denied {
            return Err(Error::NoAuth(path.to_string()));
        }
        Ok(())
    }

    fn create(
        &mut self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        session: u64,
    ) -> Result<(String, Fired)> {
        validate_path(path, mode.is_sequential())?;
        if path == "/" {
            return Err(Error::NodeExists(path.to_string()));
        }
        self.check_permission(path)?;

        let parent = parent_path(path).to_string();
        let sequence = self
            .nodes
            .get(&parent)
            .map(|p| p.stat.cversion)
            .ok_or_else(|| Error::NoNode(parent.clone()))?;

        let actual = if mode.is_sequential() {
            format!("{}{:010}", path, sequence)
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&actual) {
            return Err(Error::NodeExists(actual));
        }

        self.zxid += 1;
        let zxid = self.zxid;
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.stat.cversion += 1;
            p.stat.num_children += 1;
        }
        self.nodes.insert(
            actual.clone(),
            ZNode {
                data,
                stat: Stat {
                    version: 0,
                    cversion: 0,
                    czxid: zxid,
                    mzxid: zxid,
                    ephemeral_owner: if mode.is_ephemeral() { session } else { 0 },
                    num_children: 0,
                },
            },
        );

        let mut fired = Vec::new();
        take_watches(&mut self.data_watches, &actual, WatchEventKind::NodeCreated, &mut fired);
        take_watches(
            &mut self.child_watches,
            &parent,
            WatchEventKind::NodeChildrenChanged,
            &mut fired,
        );
        Ok((actual, fired))
    }

    fn create_parents(&mut self, path: &str) -> Result<(usize, Fired)> {
        validate_path(path, false)?;
        let mut created = 0;
        let mut fired = Vec::new();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            if self.nodes.contains_key(&current) {
                continue;
            }
            let (_, mut f) = self.create(&current, Vec::new(), CreateMode::Persistent, 0)?;
            created += 1;
            fired.append(&mut f);
        }
        Ok((created, fired))
    }

    fn get_data(&mut self, path: &str, watcher: Option<Watcher>, session: u64) -> Result<(Vec<u8>, Stat)> {
        validate_path(path, false)?;
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        let result = (node.data.clone(), node.stat);
        if let Some(watcher) = watcher {
            add_watch(&mut self.data_watches, path, session, watcher);
        }
        Ok(result)
    }

    fn set_data(&mut self, path: &str, data: Vec<u8>, version: Option<i32>) -> Result<(Stat, Fired)> {
        validate_path(path, false)?;
        self.zxid += 1;
        let zxid = self.zxid;
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        if let Some(expected) = version {
            if expected != node.stat.version {
                return Err(Error::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.stat.version,
                });
            }
        }
        node.data = data;
        node.stat.version += 1;
        node.stat.mzxid = zxid;
        let stat = node.stat;

        let mut fired = Vec::new();
        take_watches(&mut self.data_watches, path, WatchEventKind::NodeDataChanged, &mut fired);
        Ok((stat, fired))
    }

    fn delete(&mut self, path: &str, version: Option<i32>) -> Result<Fired> {
        validate_path(path, false)?;
        if path == "/" {
            return Err(Error::NoAuth(path.to_string()));
        }
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| Error::NoNode(path.to_string()))?;
        if let Some(expected) = version {
            if expected != node.stat.version {
                return Err(Error::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.stat.version,
                });
            }
        }
        if node.stat.num_children > 0 {
            return Err(Error::NotEmpty(path.to_string()));
        }

        self.nodes.remove(path);
        self.zxid += 1;
        let parent = parent_path(path).to_string();
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.stat.cversion += 1;
            p.stat.num_children -= 1;
        }

        let mut fired = Vec::new();
        take_watches(&mut self.data_watches, path, WatchEventKind::NodeDeleted, &mut fired);
        take_watches(&mut self.child_watches, path, WatchEventKind::NodeDeleted, &mut fired);
        take_watches(
            &mut self.child_watches,
            &parent,
            WatchEventKind::NodeChildrenChanged,
            &mut fired,
        );
        Ok(fired)
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        if !self.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        Ok(self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| &k[prefix.len()..])
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    fn get_children(&mut self, path: &str, watcher: Option<Watcher>, session: u64) -> Result<Vec<String>> {
        validate_path(path, false)?;
        let children = self.children(path)?;
        if let Some(watcher) = watcher {
            add_watch(&mut self.child_watches, path, session, watcher);
        }
        Ok(children)
    }

    /// Drop a session: its watches go first, then its ephemeral nodes
    fn expire(&mut self, session: u64) -> Fired {
        for regs in self.data_watches.values_mut() {
            regs.retain(|r| r.session != session);
        }
        for regs in self.child_watches.values_mut() {
            regs.retain(|r| r.session != session);
        }

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.stat.ephemeral_owner == session)
            .map(|(k, _)| k.clone())
            .collect();

        let mut fired = Vec::new();
        for path in owned {
            match self.delete(&path, None) {
                Ok(mut f) => fired.append(&mut f),
                Err(e) => tracing::warn!("Failed to remove ephemeral node {}: {}", path, e),
            }
        }
        fired
    }
}

fn fire(fired: Fired) {
    for (watcher, event) in fired {
        watcher(event);
    }
}

/// A session connected to a `MemoryStore`
pub struct MemoryClient {
    store: MemoryStore,
    session: AtomicU64,
    connected: AtomicBool,
    expired: AtomicBool,
    drop_next_create_response: AtomicBool,
    listeners: Mutex<Vec<(ListenerId, ConnectionListener)>>,
    next_listener_id: AtomicU64,
}

impl MemoryClient {
    /// The store this client talks to
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Current session id
    pub fn session_id(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    /// Drop the connection while keeping the session alive
    pub fn suspend(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::debug!("Session {} suspended", self.session_id());
            self.notify(ConnectionState::Suspended);
        }
    }

    /// Re-establish the connection, opening a new session if the old one expired
    pub fn reconnect(&self) {
        if self.expired.swap(false, Ordering::SeqCst) {
            let session = self.store.new_session();
            self.session.store(session, Ordering::SeqCst);
            tracing::debug!("Opened replacement session {}", session);
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.notify(ConnectionState::Reconnected);
        }
    }

    /// Expire the session: its ephemeral nodes are removed and the client is disconnected
    pub fn expire_session(&self) {
        let session = self.session_id();
        let fired = self.store.tree().expire(session);
        self.connected.store(false, Ordering::SeqCst);
        self.expired.store(true, Ordering::SeqCst);
        tracing::debug!("Session {} expired", session);
        fire(fired);
        self.notify(ConnectionState::Lost);
    }

    /// Apply the next create on the server but report a connection loss to the caller
    pub fn drop_next_create_response(&self) {
        self.drop_next_create_response.store(true, Ordering::SeqCst);
    }

    fn notify(&self, state: ConnectionState) {
        let listeners: Vec<ConnectionListener> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(state);
        }
    }

    fn check_connected(&self) -> Result<()> {
        if self.expired.load(Ordering::SeqCst) {
            return Err(Error::SessionExpired);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::ConnectionLoss);
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for MemoryClient {
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        self.check_connected()?;
        let (created, fired) = self
            .store
            .tree()
            .create(path, data, mode, self.session_id())?;
        self.store.record_write();
        fire(fired);

        if self.drop_next_create_response.swap(false, Ordering::SeqCst) {
            tracing::debug!("Dropping create response for {}", created);
            return Err(Error::ConnectionLoss);
        }
        Ok(created)
    }

    async fn create_parents(&self, path: &str) -> Result<()> {
        self.check_connected()?;
        let (created, fired) = self.store.tree().create_parents(path)?;
        for _ in 0..created {
            self.store.record_write();
        }
        fire(fired);
        Ok(())
    }

    async fn get_data(&self, path: &str, watcher: Option<Watcher>) -> Result<(Vec<u8>, Stat)> {
        self.check_connected()?;
        self.store.tree().get_data(path, watcher, self.session_id())
    }

    async fn set_data(&self, path: &str, data: Vec<u8>, version: Option<i32>) -> Result<Stat> {
        self.check_connected()?;
        let (stat, fired) = self.store.tree().set_data(path, data, version)?;
        self.store.record_write();
        fire(fired);
        Ok(stat)
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        self.check_connected()?;
        let fired = self.store.tree().delete(path, version)?;
        self.store.record_write();
        fire(fired);
        Ok(())
    }

    async fn get_children(&self, path: &str, watcher: Option<Watcher>) -> Result<Vec<String>> {
        self.check_connected()?;
        self.store.tree().get_children(path, watcher, self.session_id())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn add_connection_listener(&self, listener: ConnectionListener) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        id
    }

    fn remove_connection_listener(&self, id: ListenerId) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(existing, _)| *existing != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_watcher(counter: &Arc<AtomicUsize>) -> Watcher {
        let counter = Arc::clone(counter);
        Arc::new(move |_event: WatchedEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_sequential_names_increase() {
        let store = MemoryStore::new();
        let client = store.connect();
        client.create_parents("/group").await.unwrap();

        let a = client
            .create("/group/member-", b"a".to_vec(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let b = client
            .create("/group/member-", b"b".to_vec(), CreateMode::EphemeralSequential)
            .await
            .unwrap();

        assert_eq!(a, "/group/member-0000000000");
        assert_eq!(b, "/group/member-0000000001");
        assert_eq!(
            client.get_children("/group", None).await.unwrap(),
            vec!["member-0000000000", "member-0000000001"]
        );
    }

    #[tokio::test]
    async fn test_sequence_never_reused_after_delete() {
        let store = MemoryStore::new();
        let client = store.connect();
        client.create_parents("/group").await.unwrap();

        let a = client
            .create("/group/n-", Vec::new(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        client.delete(&a, None).await.unwrap();
        let b = client
            .create("/group/n-", Vec::new(), CreateMode::EphemeralSequential)
            .await
            .unwrap();
        assert!(crate::store::sequence_of(&b) > crate::store::sequence_of(&a));
    }

    #[tokio::test]
    async fn test_expire_removes_ephemerals_and_fires_watches() {
        let store = MemoryStore::new();
        let owner = store.connect();
        let observer = store.connect();
        owner.create_parents("/group").await.unwrap();
        owner
            .create("/group/persistent", Vec::new(), CreateMode::Persistent)
            .await
            .unwrap();
        let eph = owner
            .create("/group/member-", Vec::new(), CreateMode::EphemeralSequential)
            .await
            .unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        observer
            .get_children("/group", Some(counting_watcher(&fired)))
            .await
            .unwrap();

        owner.expire_session();

        assert!(!store.exists(&eph));
        assert!(store.exists("/group/persistent"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(matches!(
            owner.get_children("/group", None).await,
            Err(Error::SessionExpired)
        ));

        owner.reconnect();
        assert!(owner.is_connected());
        assert!(owner.get_children("/group", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_watches_are_one_shot() {
        let store = MemoryStore::new();
        let client = store.connect();
        client.create_parents("/node").await.unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let watcher = counting_watcher(&fired);
        client.get_data("/node", Some(Arc::clone(&watcher))).await.unwrap();
        // same watcher registered twice counts once
        client.get_data("/node", Some(watcher)).await.unwrap();

        client.set_data("/node", b"1".to_vec(), None).await.unwrap();
        client.set_data("/node", b"2".to_vec(), None).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_versions_and_errors() {
        let store = MemoryStore::new();
        let client = store.connect();
        client.create_parents("/a/b").await.unwrap();

        let stat = client.set_data("/a/b", b"x".to_vec(), Some(0)).await.unwrap();
        assert_eq!(stat.version, 1);
        assert!(matches!(
            client.set_data("/a/b", b"y".to_vec(), Some(0)).await,
            Err(Error::BadVersion { expected: 0, actual: 1, .. })
        ));
        assert!(matches!(client.delete("/a", None).await, Err(Error::NotEmpty(_))));
        assert!(matches!(client.delete("/missing", None).await, Err(Error::NoNode(_))));
        assert!(matches!(
            client.create("/a/b", Vec::new(), CreateMode::Persistent).await,
            Err(Error::NodeExists(_))
        ));
        assert!(matches!(
            client.create("/x/y", Vec::new(), CreateMode::Persistent).await,
            Err(Error::NoNode(_))
        ));
        assert!(matches!(
            client.get_data("relative", None).await,
            Err(Error::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_suspended_client_fails_fast() {
        let store = MemoryStore::new();
        let client = store.connect();

        let states = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&states);
        let id = client.add_connection_listener(Arc::new(move |s: ConnectionState| {
            seen.lock().unwrap().push(s)
        }));

        client.suspend();
        assert!(matches!(
            client.get_children("/", None).await,
            Err(Error::ConnectionLoss)
        ));
        client.reconnect();
        client.remove_connection_listener(id);
        client.suspend();

        assert_eq!(
            *states.lock().unwrap(),
            vec![ConnectionState::Suspended, ConnectionState::Reconnected]
        );
    }

    #[tokio::test]
    async fn test_protected_paths_deny_create() {
        let store = MemoryStore::new();
        store.protect("/locked");
        let client = store.connect();

        assert!(matches!(
            client.create_parents("/locked/group").await,
            Err(Error::NoAuth(_))
        ));
        assert!(client.create_parents("/lockedout/group").await.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_create_response_still_applies() {
        let store = MemoryStore::new();
        let client = store.connect();
        client.create_parents("/group").await.unwrap();

        client.drop_next_create_response();
        assert!(matches!(
            client
                .create("/group/member-", Vec::new(), CreateMode::EphemeralSequential)
                .await,
            Err(Error::ConnectionLoss)
        ));
        assert_eq!(store.children_of("/group").len(), 1);
    }
}
