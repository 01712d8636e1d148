use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

use parking_lot::Mutex;

/// Observable state of a [`PendingValue`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    Unresolved,
    Resolved,
    Failed,
}

enum Slot<T, E> {
    Unresolved(Vec<Waker>),
    Resolved(T),
    Failed(E),
}

/// Single-assignment cell handed out by a dispatcher for a requested key.
///
/// Every clone is a handle to the same cell and can be awaited on its own. The cell goes from
/// unresolved to resolved or failed exactly once and never changes afterwards.
pub struct PendingValue<T, E> {
    slot: Arc<Mutex<Slot<T, E>>>,
}

impl<T, E> Clone for PendingValue<T, E> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T, E> PendingValue<T, E> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::Unresolved(Vec::new()))),
        }
    }

    pub(crate) fn resolved(value: T) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::Resolved(value))),
        }
    }

    pub(crate) fn failed(error: E) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::Failed(error))),
        }
    }

    /// Settles the cell and wakes everyone awaiting it. Returns `false` if it was already settled,
    /// in which case `result` is dropped.
    pub(crate) fn settle(&self, result: Result<T, E>) -> bool {
        let wakers = {
            let mut slot = self.slot.lock();
            if !matches!(*slot, Slot::Unresolved(_)) {
                return false;
            }
            let next = match result {
                Ok(value) => Slot::Resolved(value),
                Err(error) => Slot::Failed(error),
            };
            match std::mem::replace(&mut *slot, next) {
                Slot::Unresolved(wakers) => wakers,
                Slot::Resolved(_) | Slot::Failed(_) => Vec::new(),
            }
        };
        for waker in wakers {
            waker.wake();
        }
        true
    }

    pub fn state(&self) -> PendingState {
        match *self.slot.lock() {
            Slot::Unresolved(_) => PendingState::Unresolved,
            Slot::Resolved(_) => PendingState::Resolved,
            Slot::Failed(_) => PendingState::Failed,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.state() != PendingState::Unresolved
    }

    /// Whether both handles point to the same cell.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<T: Clone, E: Clone> PendingValue<T, E> {
    /// The result if the cell is settled, without waiting for it.
    pub fn try_get(&self) -> Option<Result<T, E>> {
        match &*self.slot.lock() {
            Slot::Unresolved(_) => None,
            Slot::Resolved(value) => Some(Ok(value.clone())),
            Slot::Failed(error) => Some(Err(error.clone())),
        }
    }
}

impl<T: Clone, E: Clone> Future for PendingValue<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.lock();
        match &mut *slot {
            Slot::Unresolved(wakers) => {
                if !wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
            Slot::Resolved(value) => Poll::Ready(Ok(value.clone())),
            Slot::Failed(error) => Poll::Ready(Err(error.clone())),
        }
    }
}

impl<T, E> std::fmt::Debug for PendingValue<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingValue").field("state", &self.state()).finish()
    }
}
