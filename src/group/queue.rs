//! Operation Queue
//!
//! FIFO of pending operations drained by a single worker. Offers that
//! duplicate an operation already waiting are dropped, so a burst of
//! watch events collapses into one refresh.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use super::operation::Operation;
use super::NodeState;

struct QueueState<T> {
    ops: VecDeque<Operation<T>>,
    closed: bool,
}

pub(crate) struct OperationQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Notify,
}

impl<T: NodeState> OperationQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                ops: VecDeque::new(),
                closed: false,
            }),
            ready: Notify::new(),
        }
    }

    /// Enqueue an operation. Returns false if it was coalesced with a
    /// queued one or the queue is closed.
    pub fn offer(&self, op: Operation<T>) -> bool {
        {
            let mut state = self.lock();
            if state.closed {
                tracing::trace!("Dropping {} offered to a closed queue", op.kind());
                return false;
            }
            if state.ops.iter().any(|queued| op.coalesces_with(queued)) {
                tracing::trace!("Coalesced {}", op.kind());
                return false;
            }
            state.ops.push_back(op);
        }
        self.ready.notify_one();
        true
    }

    /// Wait for the next operation. Returns `None` once the queue is closed.
    pub async fn next(&self) -> Option<Operation<T>> {
        loop {
            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(op) = state.ops.pop_front() {
                    return Some(op);
                }
            }
            self.ready.notified().await;
        }
    }

    /// Discard everything pending and wake the worker so it can exit
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.ops.clear();
        }
        self.ready.notify_one();
    }

    /// Accept operations again after a close
    pub fn reopen(&self) {
        let mut state = self.lock();
        state.closed = false;
        state.ops.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().ops.len()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
