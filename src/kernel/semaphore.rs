//! Counting semaphores and barriers
//!
//! A negative semaphore value counts the blocked waiters: the queue always
//! holds `max(0, -value)` tasks.

use super::{Kernel, KernelState};
use super::scheduler::Suspend;
use super::trace::TraceCategory;
use super::waitqueue::WaitQueue;
use std::cell::RefCell;

#[derive(Debug)]
struct SemaphoreInner {
    value: i32,
    waiting: WaitQueue,
}

pub struct Semaphore {
    kernel: Kernel,
    inner: RefCell<SemaphoreInner>,
}

impl Semaphore {
    pub fn new(kernel: &Kernel, initial: i32) -> Self {
        Self {
            kernel: kernel.clone(),
            inner: RefCell::new(SemaphoreInner {
                value: initial,
                waiting: WaitQueue::new(kernel.task_count()),
            }),
        }
    }

    pub fn value(&self) -> i32 {
        self.inner.borrow().value
    }

    pub fn waiters(&self) -> usize {
        self.inner.borrow().waiting.len()
    }

    /// V: increment, waking a waiter if one was queued
    pub fn up(&self) {
        self.kernel.critical(|s| self.up_locked(s));
    }

    /// [`Semaphore::up`] for callers already inside [`Kernel::critical`]
    pub fn up_locked(&self, s: &mut KernelState) {
        let mut inner = self.inner.borrow_mut();
        inner.value += 1;
        let value = inner.value;
        s.tracer.trace(TraceCategory::Sync, "up", Some(s.tasks.current()), || {
            format!("value {}", value)
        });
        if value <= 0 {
            s.unblock(&mut inner.waiting, "semaphore");
        }
    }

    /// P: decrement, blocking if the value went negative
    pub async fn down(&self) {
        let blocked = self.kernel.critical(|s| {
            let mut inner = self.inner.borrow_mut();
            inner.value -= 1;
            if inner.value < 0 {
                s.block_current(&mut inner.waiting, "semaphore");
                true
            } else {
                false
            }
        });
        if blocked {
            Suspend::new().await;
            self.kernel.critical(|s| s.leave_kernel());
        }
    }
}

#[derive(Debug)]
struct BarrierInner {
    arrived: usize,
    waiting: WaitQueue,
}

/// Rendezvous for a fixed number of tasks, reusable across rounds
pub struct Barrier {
    kernel: Kernel,
    parties: usize,
    inner: RefCell<BarrierInner>,
}

impl Barrier {
    pub fn new(kernel: &Kernel, parties: usize) -> Self {
        Self {
            kernel: kernel.clone(),
            parties,
            inner: RefCell::new(BarrierInner {
                arrived: 0,
                waiting: WaitQueue::new(kernel.task_count()),
            }),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Tasks waiting in the current round
    pub fn arrived(&self) -> usize {
        self.inner.borrow().arrived
    }

    /// Block until `parties` tasks have arrived
    pub async fn wait(&self) {
        let blocked = self.kernel.critical(|s| {
            let mut inner = self.inner.borrow_mut();
            inner.arrived += 1;
            if inner.arrived < self.parties {
                s.block_current(&mut inner.waiting, "barrier");
                return true;
            }

            inner.arrived = 0;
            let mut woken = 0;
            while s.unblock(&mut inner.waiting, "barrier").is_some() {
                woken += 1;
            }
            s.tracer.trace(TraceCategory::Sync, "barrier", Some(s.tasks.current()), || {
                format!("released {}", woken)
            });
            false
        });
        if blocked {
            Suspend::new().await;
            self.kernel.critical(|s| s.leave_kernel());
        }
    }
}
