//! WolfGroup - Group Membership and Leader Election
//!
//! Process instances register themselves under a shared path of a
//! hierarchical coordination store, discover each other, and elect exactly
//! one master per path (or per role) without a central allocator.
//!
//! # Architecture
//!
//! Each member creates an ephemeral sequential node holding its state. The
//! store assigns strictly increasing sequence numbers, so the member with
//! the lowest active sequence is master. Watches on the path feed a single
//! worker per group that keeps a cache of the children and publishes a
//! deduplicated, ordered view of the membership.
//!
//! # Features
//!
//! - Ephemeral sequential registration with duplicate-create repair
//! - Deduplication of stale registrations by container
//! - Immediate step-down signal when the store connection drops
//! - Rebindable groups that survive store reconnection with new credentials
//! - Role-scoped mastership over a shared path
//! - In-memory coordination store for tests and simulation

pub mod config;
pub mod error;
pub mod group;
pub mod store;

pub use config::WolfGroupConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{GroupConfig, WolfGroupConfig};
    pub use crate::error::{Error, Result};
    pub use crate::group::{
        CoordinationGroup, DelegateGroup, Group, GroupEvent, GroupListener, MultiGroup,
        NodeState, ServiceState,
    };
    pub use crate::store::{CoordinationStore, MemoryStore};
}
