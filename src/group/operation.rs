//! Group Operations
//!
//! Deferred work executed by a group's worker. Watch callbacks and API
//! calls only ever build one of these and hand it to the queue.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

use super::coordination::{GroupInner, Worker};
use super::{GroupEvent, NodeState};
use crate::error::Result;

/// How much a refresh re-reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshMode {
    /// Fetch only children that are not cached yet
    Standard,
    /// Fetch data and stat of every child, cached or not
    ForceGetDataAndStat,
}

pub(crate) enum Operation<T> {
    /// Re-list the children of the group path
    Refresh(RefreshMode),
    /// Re-read one child's data
    FetchNode(String),
    /// Create, rewrite or delete this member's registration
    ApplyUpdate(Option<T>),
    /// Publish the view and call listeners
    Notify(GroupEvent),
    /// Run several operations in order
    Composite(Vec<Operation<T>>),
}

impl<T: NodeState> Operation<T> {
    /// Build a composite, flattening nested composites
    pub fn composite(ops: impl IntoIterator<Item = Operation<T>>) -> Self {
        let mut flat = Vec::new();
        for op in ops {
            match op {
                Operation::Composite(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        Operation::Composite(flat)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Refresh(_) => "refresh",
            Operation::FetchNode(_) => "fetch-node",
            Operation::ApplyUpdate(_) => "apply-update",
            Operation::Notify(_) => "notify",
            Operation::Composite(_) => "composite",
        }
    }

    /// Whether offering `self` is redundant while `queued` is still pending
    pub fn coalesces_with(&self, queued: &Operation<T>) -> bool {
        match (self, queued) {
            // a queued refresh of any mode covers a standard one
            (Operation::Refresh(RefreshMode::Standard), Operation::Refresh(_)) => true,
            (
                Operation::Refresh(RefreshMode::ForceGetDataAndStat),
                Operation::Refresh(RefreshMode::ForceGetDataAndStat),
            ) => true,
            (Operation::FetchNode(a), Operation::FetchNode(b)) => a == b,
            (Operation::Notify(a), Operation::Notify(b)) => a == b,
            _ => false,
        }
    }

    /// Execute on the worker
    pub fn invoke<'a>(
        self,
        worker: &'a mut Worker<T>,
        group: &'a Arc<GroupInner<T>>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            match self {
                Operation::Refresh(mode) => worker.refresh(group, mode).await,
                Operation::FetchNode(path) => worker.fetch(group, &path).await,
                Operation::ApplyUpdate(state) => worker.apply_update(group, state).await,
                Operation::Notify(event) => {
                    worker.notify(group, event);
                    Ok(())
                }
                Operation::Composite(ops) => {
                    for op in ops {
                        let kind = op.kind();
                        match op.invoke(&mut *worker, group).await {
                            Ok(()) => {}
                            Err(e) if e.is_retryable() => {
                                tracing::debug!("Step {} on {} deferred: {}", kind, group.path(), e)
                            }
                            Err(e) => tracing::warn!("Step {} on {} failed: {}", kind, group.path(), e),
                        }
                    }
                    Ok(())
                }
            }
        }
        .boxed()
    }
}

impl<T> std::fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Refresh(mode) => write!(f, "Refresh({:?})", mode),
            Operation::FetchNode(path) => write!(f, "FetchNode({})", path),
            Operation::ApplyUpdate(state) => {
                write!(f, "ApplyUpdate({})", if state.is_some() { "state" } else { "none" })
            }
            Operation::Notify(event) => write!(f, "Notify({})", event),
            Operation::Composite(ops) => f.debug_list().entries(ops).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::testing::state;
    use crate::group::ServiceState;

    #[test]
    fn test_composite_flattens() {
        let op = Operation::<ServiceState>::composite([
            Operation::Refresh(RefreshMode::ForceGetDataAndStat),
            Operation::composite([
                Operation::ApplyUpdate(Some(state("a"))),
                Operation::Notify(GroupEvent::Connected),
            ]),
        ]);
        match op {
            Operation::Composite(ops) => {
                let kinds: Vec<_> = ops.iter().map(Operation::kind).collect();
                assert_eq!(kinds, vec!["refresh", "apply-update", "notify"]);
            }
            other => panic!("expected composite, got {:?}", other),
        }
    }

    #[test]
    fn test_refresh_coalescing_rules() {
        let standard = Operation::<ServiceState>::Refresh(RefreshMode::Standard);
        let forced = Operation::<ServiceState>::Refresh(RefreshMode::ForceGetDataAndStat);

        assert!(standard.coalesces_with(&forced));
        assert!(standard.coalesces_with(&standard));
        assert!(forced.coalesces_with(&forced));
        // a forced refresh must not be absorbed by a cheaper one
        assert!(!forced.coalesces_with(&standard));
    }

    #[test]
    fn test_targeted_coalescing() {
        let a = Operation::<ServiceState>::FetchNode("/g/member-0000000001".into());
        let b = Operation::<ServiceState>::FetchNode("/g/member-0000000002".into());
        assert!(a.coalesces_with(&Operation::FetchNode("/g/member-0000000001".into())));
        assert!(!a.coalesces_with(&b));

        let connected = Operation::<ServiceState>::Notify(GroupEvent::Connected);
        assert!(!connected.coalesces_with(&Operation::Notify(GroupEvent::Changed)));

        let composite = Operation::<ServiceState>::composite([Operation::Refresh(RefreshMode::Standard)]);
        assert!(!composite.coalesces_with(&Operation::composite([Operation::Refresh(
            RefreshMode::Standard
        )])));
    }
}
