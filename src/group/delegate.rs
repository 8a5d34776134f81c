//! Rebindable Group
//!
//! `DelegateGroup` fronts a `CoordinationGroup` whose store connection can
//! be replaced at runtime. The delegate remembers the last state and the
//! registered listeners and replays both into each new group.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{read, write, ActiveView, CoordinationGroup, Group, GroupListener, NodeState};
use crate::config::GroupConfig;
use crate::error::Result;
use crate::store::CoordinationStore;

pub struct DelegateGroup<T: NodeState> {
    config: GroupConfig,
    group: RwLock<Option<CoordinationGroup<T>>>,
    listeners: RwLock<Vec<Arc<dyn GroupListener<T>>>>,
    state: RwLock<Option<T>>,
    started: AtomicBool,
    /// Serializes rebind, start and close
    lifecycle: Mutex<()>,
}

impl<T: NodeState> DelegateGroup<T> {
    /// Create an unbound delegate
    pub fn new(config: GroupConfig) -> Self {
        Self {
            config,
            group: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            state: RwLock::new(None),
            started: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        }
    }

    /// Create a delegate bound to `store`
    pub fn with_store(store: Arc<dyn CoordinationStore>, config: GroupConfig) -> Self {
        let delegate = Self::new(config);
        *write(&delegate.group) = Some(CoordinationGroup::new(store, delegate.config.clone()));
        delegate
    }

    /// The group currently bound, if any
    pub fn current(&self) -> Option<CoordinationGroup<T>> {
        read(&self.group).clone()
    }

    /// Swap the store connection.
    ///
    /// The previous group is closed (removing its registration) and a new
    /// one is built on `store` with the remembered state and listeners.
    /// It is started if the delegate is. `None` leaves the delegate unbound.
    pub async fn rebind(&self, store: Option<Arc<dyn CoordinationStore>>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let previous = write(&self.group).take();
        if let Some(previous) = previous {
            if let Err(e) = previous.close().await {
                tracing::debug!("Ignoring close failure of replaced group: {}", e);
            }
        }

        let Some(store) = store else {
            tracing::info!("Group {} unbound", self.config.path);
            return Ok(());
        };

        let group = CoordinationGroup::new(store, self.config.clone());
        for listener in read(&self.listeners).iter() {
            group.add_listener(Arc::clone(listener));
        }
        group.update(read(&self.state).clone());
        *write(&self.group) = Some(group.clone());
        tracing::info!("Group {} rebound", self.config.path);

        if self.started.load(Ordering::SeqCst) {
            group.start().await?;
        }
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.current() {
            Some(group) => group.start().await,
            None => Ok(()),
        }
    }

    pub async fn close(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        match self.current() {
            Some(group) => group.close().await,
            None => Ok(()),
        }
    }

    pub fn update(&self, state: Option<T>) {
        *write(&self.state) = state.clone();
        if let Some(group) = self.current() {
            group.update(state);
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn GroupListener<T>>) {
        write(&self.listeners).push(Arc::clone(&listener));
        if let Some(group) = self.current() {
            group.add_listener(listener);
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn GroupListener<T>>) {
        write(&self.listeners).retain(|existing| !Arc::ptr_eq(existing, listener));
        if let Some(group) = self.current() {
            group.remove_listener(listener);
        }
    }
}

#[async_trait]
impl<T: NodeState> Group<T> for DelegateGroup<T> {
    fn is_connected(&self) -> bool {
        self.current().map(|g| g.is_connected()).unwrap_or(false)
    }

    async fn start(&self) -> Result<()> {
        DelegateGroup::start(self).await
    }

    async fn close(&self) -> Result<()> {
        DelegateGroup::close(self).await
    }

    fn add_listener(&self, listener: Arc<dyn GroupListener<T>>) {
        DelegateGroup::add_listener(self, listener)
    }

    fn remove_listener(&self, listener: &Arc<dyn GroupListener<T>>) {
        DelegateGroup::remove_listener(self, listener)
    }

    fn update(&self, state: Option<T>) {
        DelegateGroup::update(self, state)
    }

    fn members(&self) -> Arc<ActiveView<T>> {
        self.current().map(|g| g.members()).unwrap_or_default()
    }

    fn is_master(&self) -> bool {
        self.current().map(|g| g.is_master()).unwrap_or(false)
    }

    fn master(&self) -> Option<T> {
        self.current().and_then(|g| g.master())
    }

    fn slaves(&self) -> Vec<T> {
        self.current().map(|g| g.slaves()).unwrap_or_default()
    }

    fn last_state(&self) -> Option<T> {
        read(&self.state).clone()
    }

    fn id(&self) -> Option<String> {
        self.current().and_then(|g| g.id())
    }

    fn is_unstable(&self) -> bool {
        self.current().map(|g| g.is_unstable()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::testing::{eventually, recorder, state, GROUP_PATH};
    use crate::group::{GroupEvent, ServiceState};
    use crate::store::MemoryStore;

    fn connected_count(events: &std::sync::Mutex<Vec<GroupEvent>>) -> usize {
        events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| **e == GroupEvent::Connected)
            .count()
    }

    #[tokio::test]
    async fn test_rebind_replays_state_and_listeners() {
        let first = MemoryStore::new();
        let second = MemoryStore::new();
        let delegate: DelegateGroup<ServiceState> =
            DelegateGroup::with_store(first.connect(), GroupConfig::new(GROUP_PATH));
        let (listener, events) = recorder();
        delegate.add_listener(listener);

        delegate.update(Some(state("A")));
        delegate.start().await.unwrap();
        eventually("master on first store", || delegate.is_master()).await;
        assert_eq!(first.children_of(GROUP_PATH).len(), 1);

        delegate.rebind(Some(second.connect())).await.unwrap();
        eventually("master on second store", || delegate.is_master()).await;

        assert!(first.children_of(GROUP_PATH).is_empty());
        assert_eq!(second.children_of(GROUP_PATH).len(), 1);
        assert_eq!(delegate.last_state(), Some(state("A")));
        assert_eq!(delegate.master(), Some(state("A")));
        eventually("connected twice", || connected_count(&events) == 2).await;
    }

    #[tokio::test]
    async fn test_unbound_delegate_defers_everything() {
        let store = MemoryStore::new();
        let delegate: DelegateGroup<ServiceState> = DelegateGroup::new(GroupConfig::new(GROUP_PATH));

        delegate.start().await.unwrap();
        delegate.update(Some(state("A")));
        assert!(!delegate.is_connected());
        assert!(delegate.members().is_empty());
        assert!(!delegate.is_master());
        assert_eq!(delegate.id(), None);

        delegate.rebind(Some(store.connect())).await.unwrap();
        eventually("registered once bound", || delegate.is_master()).await;
        assert_eq!(delegate.slaves(), Vec::<ServiceState>::new());
    }

    #[tokio::test]
    async fn test_rebind_to_none_withdraws() {
        let store = MemoryStore::new();
        let delegate: DelegateGroup<ServiceState> =
            DelegateGroup::with_store(store.connect(), GroupConfig::new(GROUP_PATH));
        delegate.update(Some(state("A")));
        delegate.start().await.unwrap();
        eventually("registered", || delegate.id().is_some()).await;

        delegate.rebind(None).await.unwrap();
        assert!(delegate.current().is_none());
        assert!(store.children_of(GROUP_PATH).is_empty());
        assert!(!delegate.is_master());
        // closing an unbound delegate is fine
        delegate.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_removed_listener_is_not_replayed() {
        let first = MemoryStore::new();
        let second = MemoryStore::new();
        let delegate: DelegateGroup<ServiceState> =
            DelegateGroup::with_store(first.connect(), GroupConfig::new(GROUP_PATH));
        let (listener, events) = recorder();
        delegate.add_listener(Arc::clone(&listener));
        delegate.start().await.unwrap();
        eventually("connected", || connected_count(&events) == 1).await;

        delegate.remove_listener(&listener);
        delegate.update(Some(state("A")));
        delegate.rebind(Some(second.connect())).await.unwrap();
        eventually("master", || delegate.is_master()).await;
        assert_eq!(connected_count(&events), 1);
    }
}
