//! Reentrancy gate and deferred task queue.
//!
//! The document runs on a single thread, so the gate is not a lock in the
//! threading sense. It marks the window in which a change is being applied
//! and its notifications are being delivered:
//!
//! ```text
//!   Idle ──acquire──▶ Busy ──release──▶ Idle ──▶ drain TaskQueue
//!                      │
//!                      └── mutation attempted ──▶ TaskQueue::push
//! ```
//!
//! Work attempted while `Busy` is queued on a [`TaskQueue`] and replayed in
//! FIFO order once the gate is back to `Idle`.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

/// Observable state of a [`MutualExclusionGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Busy,
}

/// Non-reentrant gate guarding merge application and the signals it fires.
#[derive(Debug, Default)]
pub struct MutualExclusionGate {
    locked: Cell<bool>,
}

/// Releases the gate on drop.
#[must_use = "the gate is released as soon as the guard is dropped"]
pub struct GateGuard<'a> {
    gate: &'a MutualExclusionGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.locked.set(false);
    }
}

impl MutualExclusionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> GateState {
        if self.locked.get() {
            GateState::Busy
        } else {
            GateState::Idle
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.get()
    }

    /// Take the gate if it is free.
    pub fn acquire(&self) -> Option<GateGuard<'_>> {
        if self.locked.replace(true) {
            return None;
        }
        Some(GateGuard { gate: self })
    }

    /// Run `action` if the gate is free, `else_action` otherwise.
    pub fn with_lock<R>(&self, action: impl FnOnce() -> R, else_action: impl FnOnce() -> R) -> R {
        match self.acquire() {
            Some(_guard) => action(),
            None => else_action(),
        }
    }

    /// Run `action` if the gate is free; `None` when it was held.
    pub fn try_lock<R>(&self, action: impl FnOnce() -> R) -> Option<R> {
        let _guard = self.acquire()?;
        Some(action())
    }
}

/// Single-threaded FIFO of deferred work.
pub struct TaskQueue<A> {
    tasks: RefCell<VecDeque<A>>,
    draining: Cell<bool>,
}

impl<A> Default for TaskQueue<A> {
    fn default() -> Self {
        Self {
            tasks: RefCell::new(VecDeque::new()),
            draining: Cell::new(false),
        }
    }
}

impl<A> TaskQueue<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: A) {
        self.tasks.borrow_mut().push_back(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.tasks.borrow_mut().clear();
    }

    /// Pop and run tasks until the queue is empty.
    ///
    /// Tasks may push more work while running; it is picked up by the same
    /// loop. A nested call while draining is a no-op.
    pub fn drain_with(&self, mut run: impl FnMut(A)) {
        if self.draining.replace(true) {
            return;
        }
        loop {
            // The borrow must end before the task runs.
            let next = self.tasks.borrow_mut().pop_front();
            match next {
                Some(task) => run(task),
                None => break,
            }
        }
        self.draining.set(false);
    }
}
