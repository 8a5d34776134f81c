//! Group Membership Module
//!
//! Members register ephemeral sequential nodes under a shared path and
//! watch each other's registrations. The deduplicated, sequence-ordered
//! view of those nodes decides leadership: the lowest sequence is master.

mod codec;
mod coordination;
mod delegate;
mod entry;
mod multi;
mod operation;
mod queue;
mod state;

pub use codec::{decode, encode, Decoded, HANDSHAKE_FIELD};
pub use coordination::CoordinationGroup;
pub use delegate::DelegateGroup;
pub use entry::{ActiveView, ChildEntry};
pub use multi::MultiGroup;
pub use operation::RefreshMode;
pub use state::ServiceState;

use std::fmt::Debug;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

// poisoned locks are recovered, writers never leave partial state
pub(crate) fn read<L>(lock: &RwLock<L>) -> RwLockReadGuard<'_, L> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write<L>(lock: &RwLock<L>) -> RwLockWriteGuard<'_, L> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

/// Payload a member publishes about itself.
///
/// The payload must serialize to a JSON object. The top-level field name
/// `uuid` is reserved for the registration handshake.
pub trait NodeState: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// Role name; members sharing a path may compete for several roles
    fn id(&self) -> &str;

    /// Stable identity of the logical member, unchanged across reconnects
    fn container(&self) -> &str;
}

/// Event delivered to group listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupEvent {
    /// The group (re)connected and refreshed its view
    Connected,
    /// The connection was lost; membership is unknown
    Disconnected,
    /// Membership changed
    Changed,
}

impl std::fmt::Display for GroupEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupEvent::Connected => write!(f, "CONNECTED"),
            GroupEvent::Disconnected => write!(f, "DISCONNECTED"),
            GroupEvent::Changed => write!(f, "CHANGED"),
        }
    }
}

/// Lifecycle phase of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPhase {
    Stopped,
    Starting,
    Connected,
    Disconnected,
}

impl GroupPhase {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            GroupPhase::Stopped => 0,
            GroupPhase::Starting => 1,
            GroupPhase::Connected => 2,
            GroupPhase::Disconnected => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => GroupPhase::Starting,
            2 => GroupPhase::Connected,
            3 => GroupPhase::Disconnected,
            _ => GroupPhase::Stopped,
        }
    }
}

impl std::fmt::Display for GroupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupPhase::Stopped => write!(f, "STOPPED"),
            GroupPhase::Starting => write!(f, "STARTING"),
            GroupPhase::Connected => write!(f, "CONNECTED"),
            GroupPhase::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// Receives group events.
///
/// Listeners run inline on the group's worker (and, for DISCONNECTED, on
/// the store's callback thread) and must not block.
pub trait GroupListener<T: NodeState>: Send + Sync {
    fn group_event(&self, group: &dyn Group<T>, event: GroupEvent);
}

impl<T, F> GroupListener<T> for F
where
    T: NodeState,
    F: Fn(&dyn Group<T>, GroupEvent) + Send + Sync,
{
    fn group_event(&self, group: &dyn Group<T>, event: GroupEvent) {
        self(group, event)
    }
}

/// Membership and leadership of one group path
#[async_trait]
pub trait Group<T: NodeState>: Send + Sync {
    /// Whether the underlying store connection is up
    fn is_connected(&self) -> bool;

    /// Start watching the path. Idempotent.
    async fn start(&self) -> Result<()>;

    /// Stop watching and remove this member's registration. Idempotent.
    async fn close(&self) -> Result<()>;

    fn add_listener(&self, listener: Arc<dyn GroupListener<T>>);

    fn remove_listener(&self, listener: &Arc<dyn GroupListener<T>>);

    /// Publish this member's state; `None` withdraws the registration
    fn update(&self, state: Option<T>);

    /// Deduplicated members ordered by sequence
    fn members(&self) -> Arc<ActiveView<T>>;

    fn is_master(&self) -> bool;

    fn master(&self) -> Option<T>;

    fn slaves(&self) -> Vec<T>;

    /// Most recently requested state, whether or not it has been written yet
    fn last_state(&self) -> Option<T>;

    /// Path of this member's registration node
    fn id(&self) -> Option<String>;

    /// Whether a registration is in flight and not yet confirmed
    fn is_unstable(&self) -> bool;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use super::{CoordinationGroup, Group, GroupEvent, GroupListener, ServiceState};
    use crate::config::GroupConfig;
    use crate::store::{MemoryClient, MemoryStore};

    pub const GROUP_PATH: &str = "/wolfgroup/members";

    /// Poll `check` until it holds, panicking after a few seconds
    pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            if Instant::now() > deadline {
                panic!("timed out waiting for {}", what);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn state(container: &str) -> ServiceState {
        ServiceState::new("service", container)
    }

    pub fn member(store: &MemoryStore) -> (Arc<MemoryClient>, CoordinationGroup<ServiceState>) {
        let client = store.connect();
        let group = CoordinationGroup::new(client.clone(), GroupConfig::new(GROUP_PATH));
        (client, group)
    }

    /// Listener that records every event it sees
    pub fn recorder() -> (Arc<dyn GroupListener<ServiceState>>, Arc<Mutex<Vec<GroupEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&events);
        let listener = move |_group: &dyn Group<ServiceState>, event: GroupEvent| {
            seen.lock().unwrap().push(event);
        };
        (Arc::new(listener), events)
    }
}
