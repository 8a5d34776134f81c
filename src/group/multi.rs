//! Multi-Role Group
//!
//! Several roles share one group path. Members are deduplicated and
//! ordered exactly as in a plain group; leadership is then decided per
//! role: the first active member carrying a role is its master.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ActiveView, CoordinationGroup, Group, GroupListener, NodeState};
use crate::config::GroupConfig;
use crate::error::Result;
use crate::store::CoordinationStore;

pub struct MultiGroup<T: NodeState> {
    group: CoordinationGroup<T>,
}

impl<T: NodeState> MultiGroup<T> {
    pub fn new(store: Arc<dyn CoordinationStore>, config: GroupConfig) -> Self {
        Self {
            group: CoordinationGroup::new(store, config),
        }
    }

    /// Underlying group
    pub fn group(&self) -> &CoordinationGroup<T> {
        &self.group
    }

    /// Whether our registration is the first active one for `role`
    pub fn is_master_for(&self, role: &str) -> bool {
        let Some(id) = self.group.id() else {
            return false;
        };
        self.group
            .members()
            .first_for_id(role)
            .map(|entry| entry.path() == id)
            .unwrap_or(false)
    }

    /// Current master of `role`
    pub fn master_for(&self, role: &str) -> Option<T> {
        self.group
            .members()
            .first_for_id(role)
            .and_then(|entry| entry.node().cloned())
    }
}

#[async_trait]
impl<T: NodeState> Group<T> for MultiGroup<T> {
    fn is_connected(&self) -> bool {
        self.group.is_connected()
    }

    async fn start(&self) -> Result<()> {
        self.group.start().await
    }

    async fn close(&self) -> Result<()> {
        self.group.close().await
    }

    fn add_listener(&self, listener: Arc<dyn GroupListener<T>>) {
        self.group.add_listener(listener)
    }

    fn remove_listener(&self, listener: &Arc<dyn GroupListener<T>>) {
        self.group.remove_listener(listener)
    }

    fn update(&self, state: Option<T>) {
        self.group.update(state)
    }

    fn members(&self) -> Arc<ActiveView<T>> {
        self.group.members()
    }

    fn is_master(&self) -> bool {
        self.group.is_master()
    }

    fn master(&self) -> Option<T> {
        self.group.master()
    }

    fn slaves(&self) -> Vec<T> {
        self.group.slaves()
    }

    fn last_state(&self) -> Option<T> {
        self.group.last_state()
    }

    fn id(&self) -> Option<String> {
        self.group.id()
    }

    fn is_unstable(&self) -> bool {
        self.group.is_unstable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::testing::{eventually, GROUP_PATH};
    use crate::group::ServiceState;
    use crate::store::MemoryStore;

    async fn join(store: &MemoryStore, role: &str, container: &str) -> MultiGroup<ServiceState> {
        let group = MultiGroup::new(store.connect(), GroupConfig::new(GROUP_PATH));
        group.start().await.unwrap();
        group.update(Some(ServiceState::new(role, container)));
        eventually("registration", || group.id().is_some()).await;
        group
    }

    #[tokio::test]
    async fn test_roles_elect_independently() {
        let store = MemoryStore::new();
        let broker1 = join(&store, "broker", "c1").await;
        let gateway1 = join(&store, "gateway", "c2").await;
        let broker2 = join(&store, "broker", "c3").await;
        let gateway2 = join(&store, "gateway", "c4").await;
        let all = [&broker1, &gateway1, &broker2, &gateway2];
        eventually("full view", || all.iter().all(|g| g.members().len() == 4)).await;

        assert!(broker1.is_master_for("broker"));
        assert!(gateway1.is_master_for("gateway"));
        assert!(!broker2.is_master_for("broker"));
        assert!(!gateway2.is_master_for("gateway"));
        assert!(!broker1.is_master_for("gateway"));
        assert!(!broker1.is_master_for("scheduler"));
        // overall mastership ignores roles
        assert!(broker1.is_master());
        assert!(!gateway1.is_master());

        assert_eq!(
            gateway2.master_for("broker"),
            Some(ServiceState::new("broker", "c1"))
        );

        broker1.close().await.unwrap();
        eventually("broker handover", || broker2.is_master_for("broker")).await;
        assert!(gateway1.is_master_for("gateway"));
        eventually("view follows", || {
            gateway2.master_for("broker") == Some(ServiceState::new("broker", "c3"))
        })
        .await;
    }
}
