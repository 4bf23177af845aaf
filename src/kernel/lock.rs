//! Locks and condition variables
//!
//! Release hands a contended lock straight to the first waiter, so the
//! lock is never observably free while someone is queued for it and a
//! third task cannot slip in between the release and the waiter resuming.
//!
//! A condition variable is only a wait queue. Signals are not remembered.

use super::error::halt;
use super::scheduler::Suspend;
use super::task::TaskId;
use super::trace::TraceCategory;
use super::waitqueue::WaitQueue;
use super::{Kernel, KernelState};
use std::cell::RefCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Unlocked,
    Locked,
}

#[derive(Debug)]
struct LockInner {
    status: LockStatus,
    holder: Option<TaskId>,
    waiting: WaitQueue,
}

/// Mutual exclusion lock
pub struct Lock {
    kernel: Kernel,
    inner: RefCell<LockInner>,
}

impl Lock {
    pub fn new(kernel: &Kernel) -> Self {
        Self {
            kernel: kernel.clone(),
            inner: RefCell::new(LockInner {
                status: LockStatus::Unlocked,
                holder: None,
                waiting: WaitQueue::new(kernel.task_count()),
            }),
        }
    }

    pub fn status(&self) -> LockStatus {
        self.inner.borrow().status
    }

    pub fn holder(&self) -> Option<TaskId> {
        self.inner.borrow().holder
    }

    pub fn waiters(&self) -> usize {
        self.inner.borrow().waiting.len()
    }

    /// Take the lock, blocking while another task holds it
    pub async fn acquire(&self) {
        loop {
            let blocked = self.kernel.critical(|s| self.acquire_or_block(s));
            if !blocked {
                return;
            }
            Suspend::new().await;

            let owned = self.kernel.critical(|s| {
                s.leave_kernel();
                self.inner.borrow().holder == Some(s.tasks.current())
            });
            if owned {
                return;
            }
        }
    }

    /// Take the lock if it is free, otherwise queue the current task.
    /// Returns whether the caller must suspend.
    pub(crate) fn acquire_or_block(&self, s: &mut KernelState) -> bool {
        let me = s.tasks.current();
        let mut inner = self.inner.borrow_mut();
        match inner.status {
            LockStatus::Unlocked => {
                inner.status = LockStatus::Locked;
                inner.holder = Some(me);
                s.tracer.trace_instant(TraceCategory::Sync, "acquire", Some(me));
                false
            }
            LockStatus::Locked => {
                if inner.holder == Some(me) {
                    halt(format_args!("{} acquired a lock it already holds", me));
                }
                s.block_current(&mut inner.waiting, "lock");
                true
            }
        }
    }

    /// Give the lock up, handing it to the first waiter if there is one
    pub fn release(&self) {
        self.kernel.critical(|s| self.release_locked(s));
    }

    /// [`Lock::release`] for callers already inside [`Kernel::critical`]
    pub fn release_locked(&self, s: &mut KernelState) {
        let me = s.tasks.current();
        let mut inner = self.inner.borrow_mut();
        if inner.holder != Some(me) {
            halt(format_args!(
                "{} released a lock held by {:?}",
                me, inner.holder
            ));
        }

        match s.unblock(&mut inner.waiting, "lock") {
            Some(next) => {
                // Status stays Locked
                inner.holder = Some(next);
                s.tracer.trace(TraceCategory::Sync, "handoff", Some(me), || {
                    format!("to {}", next)
                });
            }
            None => {
                inner.status = LockStatus::Unlocked;
                inner.holder = None;
                s.tracer.trace_instant(TraceCategory::Sync, "release", Some(me));
            }
        }
    }
}

/// Condition variable
pub struct Condition {
    kernel: Kernel,
    waiting: RefCell<WaitQueue>,
}

impl Condition {
    pub fn new(kernel: &Kernel) -> Self {
        Self {
            kernel: kernel.clone(),
            waiting: RefCell::new(WaitQueue::new(kernel.task_count())),
        }
    }

    pub fn waiters(&self) -> usize {
        self.waiting.borrow().len()
    }

    /// Release `lock`, sleep until signalled, then take `lock` back
    pub async fn wait(&self, lock: &Lock) {
        self.kernel.critical(|s| {
            lock.release_locked(s);
            s.block_current(&mut self.waiting.borrow_mut(), "condition");
        });
        Suspend::new().await;

        // Straight to acquire-or-block: a signal has been consumed already
        let blocked = self.kernel.critical(|s| {
            s.leave_kernel();
            lock.acquire_or_block(s)
        });
        if blocked {
            Suspend::new().await;
            let owned = self.kernel.critical(|s| {
                s.leave_kernel();
                lock.holder() == Some(s.tasks.current())
            });
            if !owned {
                lock.acquire().await;
            }
        }
    }

    /// Wake one waiter, if any
    pub fn signal(&self) {
        self.kernel.critical(|s| self.signal_locked(s));
    }

    pub fn signal_locked(&self, s: &mut KernelState) {
        s.unblock(&mut self.waiting.borrow_mut(), "condition");
    }

    /// Wake every waiter
    pub fn broadcast(&self) {
        self.kernel.critical(|s| self.broadcast_locked(s));
    }

    pub fn broadcast_locked(&self, s: &mut KernelState) {
        let mut waiting = self.waiting.borrow_mut();
        while s.unblock(&mut waiting, "condition").is_some() {}
    }
}
