//! Coordination Group
//!
//! Core membership state machine. A single worker task owns the child
//! cache and applies every queued operation in order; store callbacks
//! only enqueue work. The one exception is a lost connection, which
//! clears the published view and notifies listeners immediately so a
//! master can step down before any stale work runs.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::codec;
use super::entry::{ActiveView, ChildEntry};
use super::operation::{Operation, RefreshMode};
use super::queue::OperationQueue;
use super::{read, write, Group, GroupEvent, GroupListener, GroupPhase, NodeState};
use crate::config::GroupConfig;
use crate::error::{Error, Result};
use crate::store::{
    ConnectionState, CoordinationStore, CreateMode, ListenerId, WatchEventKind, WatchedEvent,
    Watcher,
};

/// Immutable view published by the worker
struct Snapshot<T> {
    children: Arc<Vec<ChildEntry<T>>>,
    active: Arc<ActiveView<T>>,
}

impl<T> Snapshot<T> {
    fn empty() -> Self {
        Self {
            children: Arc::new(Vec::new()),
            active: Arc::new(ActiveView::default()),
        }
    }
}

pub(crate) struct GroupInner<T: NodeState> {
    store: Arc<dyn CoordinationStore>,
    config: GroupConfig,
    queue: Arc<OperationQueue<T>>,
    listeners: RwLock<Vec<Arc<dyn GroupListener<T>>>>,
    /// Last state requested through update()
    state: RwLock<Option<T>>,
    /// Path of our registration node
    self_id: RwLock<Option<String>>,
    /// Tag of a registration whose outcome is not yet reconciled
    pending_handshake: Mutex<Option<String>>,
    snapshot: RwLock<Arc<Snapshot<T>>>,
    started: AtomicBool,
    connected: AtomicBool,
    unstable: AtomicBool,
    phase: AtomicU8,
    /// Bumped whenever the published view is invalidated
    generation: AtomicU64,
    connection_listener: Mutex<Option<ListenerId>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    children_watcher: Watcher,
    data_watcher: Watcher,
}

impl<T: NodeState> GroupInner<T> {
    pub(crate) fn path(&self) -> &str {
        &self.config.path
    }

    fn self_id(&self) -> Option<String> {
        read(&self.self_id).clone()
    }

    fn set_self_id(&self, id: Option<String>) {
        *write(&self.self_id) = id;
    }

    fn pending_handshake(&self) -> Option<String> {
        self.pending_handshake
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_pending_handshake(&self, handshake: Option<String>) {
        *self
            .pending_handshake
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = handshake;
    }

    fn snapshot(&self) -> Arc<Snapshot<T>> {
        Arc::clone(&read(&self.snapshot))
    }

    fn set_phase(&self, phase: GroupPhase) {
        self.phase.store(phase.as_u8(), Ordering::SeqCst);
    }

    /// Drop the published view and invalidate anything the worker is building
    fn invalidate(&self) {
        let mut snapshot = write(&self.snapshot);
        self.generation.fetch_add(1, Ordering::SeqCst);
        *snapshot = Arc::new(Snapshot::empty());
    }

    /// Swap in a new view unless it was invalidated since the worker built it.
    /// Returns the replaced view.
    fn publish(&self, generation: u64, next: Snapshot<T>) -> Option<Arc<Snapshot<T>>> {
        let mut snapshot = write(&self.snapshot);
        if self.generation.load(Ordering::SeqCst) != generation {
            return None;
        }
        Some(std::mem::replace(&mut *snapshot, Arc::new(next)))
    }

    /// Delete every child carrying `handshake`, read straight from the store
    async fn remove_tagged(&self, handshake: &str) -> Result<()> {
        let names = match self.store.get_children(self.path(), None).await {
            Ok(names) => names,
            Err(e) if e.is_no_node() => return Ok(()),
            Err(e) => return Err(e),
        };

        for name in names {
            let path = self.config.child_path(&name);
            let (data, stat) = match self.store.get_data(&path, None).await {
                Ok(found) => found,
                Err(e) if e.is_no_node() => continue,
                Err(e) => return Err(e),
            };
            let entry = ChildEntry::<T>::decode(path.clone(), stat, data);
            if entry.handshake() != Some(handshake) {
                continue;
            }
            match self.store.delete(&path, None).await {
                Ok(()) => tracing::warn!("Deleted unconfirmed registration {}", path),
                Err(e) if e.is_no_node() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn on_children_event(&self, event: WatchedEvent) {
        tracing::trace!("Children watch fired on {}: {:?}", event.path, event.kind);
        self.queue.offer(Operation::Refresh(RefreshMode::Standard));
    }

    fn on_data_event(&self, event: WatchedEvent) {
        match event.kind {
            WatchEventKind::NodeDataChanged | WatchEventKind::NodeDeleted => {
                self.queue.offer(Operation::FetchNode(event.path));
            }
            _ => {}
        }
    }

    fn on_connection_state(self: &Arc<Self>, state: ConnectionState) {
        tracing::info!("Group {} connection state {}", self.config.path, state);
        match state {
            ConnectionState::Connected | ConnectionState::Reconnected => self.handle_connected(),
            ConnectionState::Suspended | ConnectionState::Lost => self.handle_disconnected(),
        }
    }

    fn handle_connected(&self) {
        if self.connected.swap(true, Ordering::SeqCst) {
            tracing::debug!("Group {} already connected", self.config.path);
            return;
        }
        self.set_phase(GroupPhase::Connected);
        let state = read(&self.state).clone();
        self.queue.offer(Operation::composite([
            Operation::Refresh(RefreshMode::ForceGetDataAndStat),
            Operation::ApplyUpdate(state),
            Operation::Notify(GroupEvent::Connected),
        ]));
    }

    fn handle_disconnected(self: &Arc<Self>) {
        self.invalidate();
        if self.started.load(Ordering::SeqCst) {
            self.set_phase(GroupPhase::Disconnected);
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            CoordinationGroup::from_inner(Arc::clone(self)).call_listeners(GroupEvent::Disconnected);
        }
    }
}

impl<T: NodeState> Drop for GroupInner<T> {
    fn drop(&mut self) {
        self.queue.close();
        let listener = self
            .connection_listener
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(id) = listener {
            self.store.remove_connection_listener(id);
        }
    }
}

/// Group membership over one path of a coordination store.
///
/// Cloning yields another handle to the same group.
pub struct CoordinationGroup<T: NodeState> {
    inner: Arc<GroupInner<T>>,
}

impl<T: NodeState> Clone for CoordinationGroup<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: NodeState> CoordinationGroup<T> {
    /// Create a stopped group for `config.path`
    pub fn new(store: Arc<dyn CoordinationStore>, config: GroupConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<GroupInner<T>>| {
            let children_watcher: Watcher = {
                let weak = weak.clone();
                Arc::new(move |event: WatchedEvent| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_children_event(event);
                    }
                })
            };
            let data_watcher: Watcher = {
                let weak = weak.clone();
                Arc::new(move |event: WatchedEvent| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_data_event(event);
                    }
                })
            };

            let queue = Arc::new(OperationQueue::new());
            queue.close();

            GroupInner {
                store,
                config,
                queue,
                listeners: RwLock::new(Vec::new()),
                state: RwLock::new(None),
                self_id: RwLock::new(None),
                pending_handshake: Mutex::new(None),
                snapshot: RwLock::new(Arc::new(Snapshot::empty())),
                started: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                unstable: AtomicBool::new(false),
                phase: AtomicU8::new(GroupPhase::Stopped.as_u8()),
                generation: AtomicU64::new(0),
                connection_listener: Mutex::new(None),
                worker: Mutex::new(None),
                children_watcher,
                data_watcher,
            }
        });
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<GroupInner<T>>) -> Self {
        Self { inner }
    }

    /// Begin watching the path and processing operations.
    ///
    /// Fails if the configuration is invalid or the base path cannot be
    /// created for a reason other than connectivity.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = inner.config.validate() {
            inner.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        inner.set_phase(GroupPhase::Starting);

        if inner.store.is_connected() {
            if let Err(e) = inner.store.create_parents(&inner.config.path).await {
                if e.is_retryable() {
                    tracing::warn!("Could not ensure group path {} yet: {}", inner.config.path, e);
                } else {
                    tracing::error!("Cannot create group path {}: {}", inner.config.path, e);
                    inner.started.store(false, Ordering::SeqCst);
                    inner.set_phase(GroupPhase::Stopped);
                    return Err(e);
                }
            }
        }

        inner.queue.reopen();
        let worker = Worker::new(
            Arc::downgrade(inner),
            Arc::clone(&inner.queue),
            inner.generation.load(Ordering::SeqCst),
        );
        let handle = tokio::spawn(worker.run());
        *inner.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        let weak = Arc::downgrade(inner);
        let id = inner
            .store
            .add_connection_listener(Arc::new(move |state: ConnectionState| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_connection_state(state);
                }
            }));
        *inner
            .connection_listener
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(id);

        tracing::info!("Group started on {}", inner.config.path);

        if inner.store.is_connected() {
            inner.handle_connected();
        }
        Ok(())
    }

    /// Stop the worker and delete our registration. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let listener = inner
            .connection_listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(id) = listener {
            inner.store.remove_connection_listener(id);
        }

        inner.queue.close();
        let handle = inner.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(inner.config.close_grace(), &mut handle)
                .await
                .is_err()
            {
                tracing::warn!(
                    "Worker for {} did not stop within {:?}, aborting",
                    inner.config.path,
                    inner.config.close_grace()
                );
                handle.abort();
            }
        }

        // the worker is gone, nothing else writes the id now
        let id = write(&inner.self_id).take();
        if let Some(id) = id {
            match inner.store.delete(&id, None).await {
                Ok(()) => tracing::info!("Removed registration {}", id),
                Err(e) if e.is_no_node() => {}
                Err(e) => tracing::warn!("Failed to remove registration {}: {}", id, e),
            }
        }

        let handshake = inner
            .pending_handshake
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handshake) = handshake {
            if let Err(e) = inner.remove_tagged(&handshake).await {
                tracing::warn!("Failed to remove unconfirmed registrations: {}", e);
            }
        }

        inner.invalidate();
        inner.unstable.store(false, Ordering::SeqCst);
        inner.set_phase(GroupPhase::Stopped);
        tracing::info!("Group closed on {}", inner.config.path);

        if inner.connected.swap(false, Ordering::SeqCst) {
            self.call_listeners(GroupEvent::Disconnected);
        }
        Ok(())
    }

    /// Publish this member's state, or withdraw it with `None`.
    ///
    /// Returns immediately; the write happens on the worker. Before
    /// `start()` the state is only recorded.
    pub fn update(&self, state: Option<T>) {
        let inner = &self.inner;
        let unchanged = {
            let mut current = write(&inner.state);
            let unchanged = same_encoding(current.as_ref(), state.as_ref());
            *current = state.clone();
            unchanged
        };

        if !inner.started.load(Ordering::SeqCst) {
            tracing::debug!("Group {} not started, recorded state for later", inner.config.path);
            return;
        }
        if unchanged {
            tracing::trace!("State for {} unchanged, skipping update", inner.config.path);
            return;
        }

        inner.queue.offer(Operation::composite([
            Operation::Refresh(RefreshMode::ForceGetDataAndStat),
            Operation::ApplyUpdate(state),
        ]));
    }

    /// Deduplicated members in election order
    pub fn members(&self) -> Arc<ActiveView<T>> {
        Arc::clone(&self.inner.snapshot().active)
    }

    /// Every cached child, including undecodable and superseded ones
    pub fn current_data(&self) -> Arc<Vec<ChildEntry<T>>> {
        Arc::clone(&self.inner.snapshot().children)
    }

    pub fn current_data_for(&self, path: &str) -> Option<ChildEntry<T>> {
        self.inner
            .snapshot()
            .children
            .iter()
            .find(|entry| entry.path() == path)
            .cloned()
    }

    /// Whether our registration is the lowest active sequence
    pub fn is_master(&self) -> bool {
        let Some(id) = self.inner.self_id() else {
            return false;
        };
        self.members()
            .master_entry()
            .map(|entry| entry.path() == id)
            .unwrap_or(false)
    }

    pub fn master(&self) -> Option<T> {
        self.members().master().cloned()
    }

    pub fn slaves(&self) -> Vec<T> {
        self.members().slaves().cloned().collect()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn last_state(&self) -> Option<T> {
        read(&self.inner.state).clone()
    }

    /// Path of our registration node, once created
    pub fn id(&self) -> Option<String> {
        self.inner.self_id()
    }

    /// Set while a registration has been attempted but not yet confirmed
    pub fn is_unstable(&self) -> bool {
        self.inner.unstable.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> GroupPhase {
        GroupPhase::from_u8(self.inner.phase.load(Ordering::SeqCst))
    }

    /// Base path of the group
    pub fn path(&self) -> &str {
        self.inner.path()
    }

    pub fn add_listener(&self, listener: Arc<dyn GroupListener<T>>) {
        write(&self.inner.listeners).push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn GroupListener<T>>) {
        write(&self.inner.listeners).retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    pub(crate) fn call_listeners(&self, event: GroupEvent) {
        let listeners = read(&self.inner.listeners).clone();
        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.group_event(self, event)));
            if outcome.is_err() {
                tracing::error!(
                    "Listener panicked while handling {} on {}",
                    event,
                    self.inner.config.path
                );
            }
        }
    }
}

fn same_encoding<T: NodeState>(a: Option<&T>, b: Option<&T>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => match (codec::encode(a, None), codec::encode(b, None)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        },
        _ => false,
    }
}

#[async_trait]
impl<T: NodeState> Group<T> for CoordinationGroup<T> {
    fn is_connected(&self) -> bool {
        CoordinationGroup::is_connected(self)
    }

    async fn start(&self) -> Result<()> {
        CoordinationGroup::start(self).await
    }

    async fn close(&self) -> Result<()> {
        CoordinationGroup::close(self).await
    }

    fn add_listener(&self, listener: Arc<dyn GroupListener<T>>) {
        CoordinationGroup::add_listener(self, listener)
    }

    fn remove_listener(&self, listener: &Arc<dyn GroupListener<T>>) {
        CoordinationGroup::remove_listener(self, listener)
    }

    fn update(&self, state: Option<T>) {
        CoordinationGroup::update(self, state)
    }

    fn members(&self) -> Arc<ActiveView<T>> {
        CoordinationGroup::members(self)
    }

    fn is_master(&self) -> bool {
        CoordinationGroup::is_master(self)
    }

    fn master(&self) -> Option<T> {
        CoordinationGroup::master(self)
    }

    fn slaves(&self) -> Vec<T> {
        CoordinationGroup::slaves(self)
    }

    fn last_state(&self) -> Option<T> {
        CoordinationGroup::last_state(self)
    }

    fn id(&self) -> Option<String> {
        CoordinationGroup::id(self)
    }

    fn is_unstable(&self) -> bool {
        CoordinationGroup::is_unstable(self)
    }
}

/// Single consumer of a group's operation queue; sole owner of the cache
pub(crate) struct Worker<T: NodeState> {
    inner: Weak<GroupInner<T>>,
    queue: Arc<OperationQueue<T>>,
    cache: BTreeMap<String, ChildEntry<T>>,
    generation: u64,
    dirty: bool,
}

impl<T: NodeState> Worker<T> {
    fn new(inner: Weak<GroupInner<T>>, queue: Arc<OperationQueue<T>>, generation: u64) -> Self {
        Self {
            inner,
            queue,
            cache: BTreeMap::new(),
            generation,
            dirty: false,
        }
    }

    async fn run(mut self) {
        while let Some(op) = self.queue.next().await {
            let Some(group) = self.inner.upgrade() else {
                break;
            };

            let generation = group.generation.load(Ordering::SeqCst);
            if generation != self.generation {
                tracing::debug!("View of {} invalidated, clearing cache", group.path());
                self.cache.clear();
                self.generation = generation;
                self.dirty = true;
            }

            let kind = op.kind();
            tracing::trace!("Running {} on {} ({} queued)", kind, group.path(), self.queue.len());
            if let Err(e) = op.invoke(&mut self, &group).await {
                if e.is_retryable() {
                    tracing::debug!("Operation {} on {} deferred: {}", kind, group.path(), e);
                } else {
                    tracing::warn!("Operation {} on {} failed: {}", kind, group.path(), e);
                }
            }
            self.publish(&group);
        }
        tracing::debug!("Group worker stopped");
    }

    /// List the children, drop vanished entries and fetch new (or all) ones
    pub(crate) async fn refresh(
        &mut self,
        group: &Arc<GroupInner<T>>,
        mode: RefreshMode,
    ) -> Result<()> {
        let path = group.path();
        let watcher = Some(Arc::clone(&group.children_watcher));
        let names = match group.store.get_children(path, watcher.clone()).await {
            Ok(names) => names,
            Err(e) if e.is_no_node() => {
                tracing::info!("Group path {} is missing, recreating it", path);
                group.store.create_parents(path).await?;
                group.store.get_children(path, watcher).await?
            }
            Err(e) => return Err(e),
        };

        let live: BTreeSet<String> = names
            .iter()
            .map(|name| group.config.child_path(name))
            .collect();

        let vanished: Vec<String> = self
            .cache
            .keys()
            .filter(|cached| !live.contains(*cached))
            .cloned()
            .collect();
        for child in vanished {
            self.forget(group, &child);
        }
        if let Some(id) = group.self_id() {
            if !live.contains(&id) {
                self.forget(group, &id);
            }
        }

        for child in &live {
            if mode == RefreshMode::ForceGetDataAndStat || !self.cache.contains_key(child) {
                self.fetch(group, child).await?;
            }
        }

        let Some(handshake) = group.pending_handshake() else {
            return Ok(());
        };
        match group.self_id() {
            Some(id) => self.reconcile(group, Some(&id)).await,
            None => self.adopt(group, &handshake).await,
        }
    }

    /// Re-read one child, dropping it if it no longer exists
    pub(crate) async fn fetch(&mut self, group: &Arc<GroupInner<T>>, path: &str) -> Result<()> {
        let watcher = Some(Arc::clone(&group.data_watcher));
        match group.store.get_data(path, watcher).await {
            Ok((data, stat)) => {
                self.cache
                    .insert(path.to_string(), ChildEntry::decode(path.to_string(), stat, data));
                self.dirty = true;
                Ok(())
            }
            Err(e) if e.is_no_node() => {
                self.forget(group, path);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn forget(&mut self, group: &GroupInner<T>, path: &str) {
        if self.cache.remove(path).is_some() {
            self.dirty = true;
        }
        if group.self_id().as_deref() == Some(path) {
            tracing::info!("Registration {} is gone", path);
            group.set_self_id(None);
        }
    }

    /// Bring our registration in line with the requested state
    pub(crate) async fn apply_update(
        &mut self,
        group: &Arc<GroupInner<T>>,
        state: Option<T>,
    ) -> Result<()> {
        match (state, group.self_id()) {
            (None, None) => self.reconcile(group, None).await,
            (None, Some(id)) => {
                match group.store.delete(&id, None).await {
                    Ok(()) => tracing::info!("Withdrew registration {}", id),
                    Err(e) if e.is_no_node() => {}
                    Err(e) => return Err(e),
                }
                self.forget(group, &id);
                group.set_self_id(None);
                Ok(())
            }
            (Some(state), Some(id)) => {
                let data = codec::encode(&state, None)?;
                let current = self
                    .cache
                    .get(&id)
                    .and_then(ChildEntry::node)
                    .and_then(|node| codec::encode(node, None).ok());
                if current.as_deref() == Some(data.as_slice()) {
                    return Ok(());
                }

                match group.store.set_data(&id, data.clone(), None).await {
                    Ok(stat) => {
                        tracing::debug!("Updated registration {}", id);
                        self.cache
                            .insert(id.clone(), ChildEntry::decode(id, stat, data));
                        self.dirty = true;
                        Ok(())
                    }
                    Err(e) if e.is_no_node() => {
                        self.forget(group, &id);
                        group.set_self_id(None);
                        self.register(group, &state).await
                    }
                    Err(e) => Err(e),
                }
            }
            (Some(state), None) => self.register(group, &state).await,
        }
    }

    /// Take over the node left by a create whose response never arrived
    async fn adopt(&mut self, group: &Arc<GroupInner<T>>, handshake: &str) -> Result<()> {
        let Some(id) = self
            .cache
            .values()
            .filter(|entry| entry.handshake() == Some(handshake))
            .min()
            .map(|entry| entry.path().to_string())
        else {
            return Ok(());
        };

        tracing::info!("Adopting unconfirmed registration {}", id);
        group.set_self_id(Some(id.clone()));
        self.reconcile(group, Some(&id)).await?;

        // the adopted node holds whatever state was current when it was created
        let state = read(&group.state).clone();
        group.queue.offer(Operation::ApplyUpdate(state));
        Ok(())
    }

    async fn register(&mut self, group: &Arc<GroupInner<T>>, state: &T) -> Result<()> {
        if !group.store.is_connected() {
            return Err(Error::ConnectionLoss);
        }

        // reused until a create is confirmed, so residue of a lost attempt can be found
        let handshake = match group.pending_handshake() {
            Some(handshake) => handshake,
            None => {
                let handshake = Uuid::new_v4().to_string();
                group.set_pending_handshake(Some(handshake.clone()));
                handshake
            }
        };
        let data = codec::encode(state, Some(&handshake))?;

        group.unstable.store(true, Ordering::SeqCst);
        let id = group
            .store
            .create(&group.config.node_path(), data, CreateMode::EphemeralSequential)
            .await?;
        tracing::info!("Registered {} as {}", state.container(), id);
        group.set_self_id(Some(id));

        self.refresh(group, RefreshMode::ForceGetDataAndStat).await
    }

    /// Delete nodes carrying the pending handshake tag, except `keep`
    async fn reconcile(&mut self, group: &Arc<GroupInner<T>>, keep: Option<&str>) -> Result<()> {
        let Some(handshake) = group.pending_handshake() else {
            return Ok(());
        };

        let residue: Vec<String> = self
            .cache
            .values()
            .filter(|entry| entry.handshake() == Some(handshake.as_str()))
            .filter(|entry| Some(entry.path()) != keep)
            .map(|entry| entry.path().to_string())
            .collect();

        for path in residue {
            match group.store.delete(&path, None).await {
                Ok(()) => tracing::warn!("Deleted duplicate registration {}", path),
                Err(e) if e.is_no_node() => {}
                Err(e) => return Err(e),
            }
            self.forget(group, &path);
        }

        group.set_pending_handshake(None);
        group.unstable.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Publish the view, then call listeners unless the view went stale
    pub(crate) fn notify(&mut self, group: &Arc<GroupInner<T>>, event: GroupEvent) {
        self.publish(group);
        if group.generation.load(Ordering::SeqCst) != self.generation {
            tracing::debug!("Dropping stale {} for {}", event, group.path());
            return;
        }
        CoordinationGroup::from_inner(Arc::clone(group)).call_listeners(event);
    }

    fn publish(&mut self, group: &GroupInner<T>) {
        if !self.dirty {
            return;
        }

        let children: Vec<ChildEntry<T>> = self.cache.values().cloned().collect();
        let active = ActiveView::from_children(&children);
        let next = Snapshot {
            children: Arc::new(children),
            active: Arc::new(active),
        };

        let Some(previous) = group.publish(self.generation, next) else {
            return;
        };
        self.dirty = false;

        if !same_view(&previous.active, &group.snapshot().active) {
            group.queue.offer(Operation::Notify(GroupEvent::Changed));
        }
    }
}

fn same_view<T: NodeState>(a: &ActiveView<T>, b: &ActiveView<T>) -> bool {
    a.len() == b.len()
        && a
            .entries()
            .iter()
            .zip(b.entries())
            .all(|(x, y)| x.path() == y.path() && x.data() == y.data())
}
