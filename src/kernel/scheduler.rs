//! Scheduler and dispatcher
//!
//! A task runs until it enters the kernel: by yielding, blocking, exiting
//! or finishing. Each entry is a `Poll::Pending` from the task's future.
//! The dispatcher then stores the future back in the TCB and runs
//! `schedule()`, which retires the task if it blocked or exited and moves
//! `current` along the ready list.
//!
//! Dispatching a `FirstTime` task calls its entry closure (the cold
//! start). Every later dispatch polls the stored future (the resume), so a
//! task always continues exactly where it suspended.
//!
//! The dispatcher refuses to switch while a critical section is open.

use super::error::{KernelError, KernelResult, PageFaultError, halt};
use super::memory::VirtAddr;
use super::task::{BoxFuture, Dispatch, TaskId, TaskKind, TaskState};
use super::trace::TraceCategory;
use super::waitqueue::WaitQueue;
use super::{Kernel, KernelState};
use futures::task::noop_waker_ref;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

// ============================================================================
// Suspension
// ============================================================================

/// A single kernel entry
///
/// Pending on the first poll, ready on the next. Whatever the task set up
/// before awaiting it (blocked on a queue, exited) has already happened.
#[derive(Debug, Default)]
pub struct Suspend {
    entered: bool,
}

impl Suspend {
    pub fn new() -> Self {
        Self { entered: false }
    }
}

impl Future for Suspend {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.entered {
            Poll::Ready(())
        } else {
            self.entered = true;
            Poll::Pending
        }
    }
}

// ============================================================================
// Task side
// ============================================================================

/// Handle a task body uses to call into the kernel
#[derive(Clone)]
pub struct TaskContext {
    kernel: Kernel,
    id: TaskId,
}

impl TaskContext {
    pub(crate) fn new(kernel: Kernel, id: TaskId) -> Self {
        Self { kernel, id }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Give up the CPU; returns when this task is next dispatched
    pub async fn yield_now(&self) {
        self.kernel.critical(|s| {
            s.tasks.current_tcb_mut().accounting.yield_count += 1;
            s.enter_kernel();
        });
        Suspend::new().await;
        self.kernel.critical(|s| s.leave_kernel());
    }

    /// Finish this task. It is never dispatched again, so the returned
    /// future never completes.
    pub async fn exit(&self) {
        self.kernel.critical(|s| {
            s.tasks.current_tcb_mut().state = TaskState::Exited;
            s.enter_kernel();
        });
        loop {
            Suspend::new().await;
        }
    }

    /// Exclude frames this task faults in from eviction
    pub fn set_pinned(&self, pinned: bool) {
        let id = self.id;
        self.kernel.critical(|s| {
            if let Some(tcb) = s.tasks.tcb_mut(id) {
                tcb.pinned = pinned;
            }
        });
    }

    fn is_user(&self) -> bool {
        let id = self.id;
        self.kernel
            .inspect(|s| s.tasks.tcb(id).map(|t| t.kind) == Some(TaskKind::Process))
    }

    /// Read from this task's address space, taking page faults as needed
    pub fn try_read_bytes(&self, addr: u32, buf: &mut [u8]) -> Result<(), PageFaultError> {
        let user = self.is_user();
        let id = self.id;
        self.kernel
            .critical(|s| s.load(id, VirtAddr(addr), buf, user))
    }

    pub fn try_write_bytes(&self, addr: u32, data: &[u8]) -> Result<(), PageFaultError> {
        let user = self.is_user();
        let id = self.id;
        self.kernel
            .critical(|s| s.store(id, VirtAddr(addr), data, user))
    }

    /// Like [`try_read_bytes`](Self::try_read_bytes), but an unresolvable
    /// fault halts the machine
    pub fn read_bytes(&self, addr: u32, buf: &mut [u8]) {
        if let Err(e) = self.try_read_bytes(addr, buf) {
            halt(e);
        }
    }

    pub fn write_bytes(&self, addr: u32, data: &[u8]) {
        if let Err(e) = self.try_write_bytes(addr, data) {
            halt(e);
        }
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        let mut word = [0u8; 4];
        self.read_bytes(addr, &mut word);
        u32::from_ne_bytes(word)
    }

    pub fn write_u32(&self, addr: u32, value: u32) {
        self.write_bytes(addr, &value.to_ne_bytes());
    }
}

// ============================================================================
// Kernel side
// ============================================================================

/// Result of one dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Some task is still runnable
    Running,
    /// Every task has exited
    Finished,
}

/// Summary of a completed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub dispatches: u64,
    pub exited: usize,
}

impl KernelState {
    /// Kernel entry from the current task
    ///
    /// Task time since the last return is charged to the current task;
    /// the kernel clock starts for the task expected to run next.
    pub(crate) fn enter_kernel(&mut self) {
        let now = Instant::now();
        let tcb = self.tasks.current_tcb_mut();
        if let Some(started) = tcb.accounting.user_started.take() {
            tcb.accounting.user_time += now - started;
        }
        let next = tcb.next();
        if let Some(next) = self.tasks.tcb_mut(next) {
            next.accounting.kernel_entered = Some(now);
        }
    }

    /// Return from the kernel into the current task
    pub(crate) fn leave_kernel(&mut self) {
        let now = Instant::now();
        let acct = &mut self.tasks.current_tcb_mut().accounting;
        if let Some(entered) = acct.kernel_entered.take() {
            acct.kernel_time += now - entered;
        }
        acct.user_started = Some(now);
    }

    /// Queue the current task on `queue` and enter the kernel
    ///
    /// The caller must await a [`Suspend`] once its critical section ends.
    pub(crate) fn block_current(&mut self, queue: &mut WaitQueue, on: &'static str) {
        let id = self.tasks.current();
        if let Err(e) = self.tasks.block(queue) {
            halt(format_args!("{} blocking on {}: {}", id, on, e));
        }
        self.tracer.scheduler.blocks += 1;
        self.tracer.trace(TraceCategory::Sync, "block", Some(id), || {
            format!("on {} ({} waiting)", on, queue.len())
        });
        self.enter_kernel();
    }

    /// Wake the head of `queue`, if any
    pub(crate) fn unblock(&mut self, queue: &mut WaitQueue, on: &'static str) -> Option<TaskId> {
        let woken = self.tasks.unblock(queue)?;
        self.tracer.scheduler.unblocks += 1;
        let by = self.tasks.current();
        self.tracer.trace(TraceCategory::Sync, "unblock", Some(woken), || {
            format!("from {} by {}", on, by)
        });
        Some(woken)
    }

    /// Take the current task's context for dispatch
    fn dispatch(&mut self) -> (TaskId, Dispatch) {
        let id = self.tasks.current();
        let Some(step) = self.tasks.take_context() else {
            halt(format_args!("{} has no saved context", id));
        };

        let tcb = self.tasks.current_tcb_mut();
        tcb.accounting.dispatch_count += 1;
        match &step {
            Dispatch::ColdStart(_) => {
                tcb.accounting.user_started = Some(Instant::now());
                let stack = tcb.start_stack();
                self.tracer.scheduler.cold_starts += 1;
                self.tracer.trace(TraceCategory::Scheduler, "cold-start", Some(id), || {
                    format!(
                        "sp={:#x} bp={:#x}",
                        stack.stack_pointer, stack.base_pointer
                    )
                });
            }
            Dispatch::Resume(_) => {
                self.tracer.scheduler.resumes += 1;
                self.tracer.trace_instant(TraceCategory::Scheduler, "resume", Some(id));
            }
        }
        (id, step)
    }

    /// Store a suspended task. Exited tasks hand their future back so it
    /// can be dropped outside the critical section.
    fn suspend(&mut self, id: TaskId, future: BoxFuture) -> Option<BoxFuture> {
        let exited = self
            .tasks
            .tcb(id)
            .is_some_and(|t| t.state == TaskState::Exited);
        if exited {
            self.retire(id);
            Some(future)
        } else {
            self.tasks.save_context(id, future);
            None
        }
    }

    /// Final bookkeeping for an exited task
    fn retire(&mut self, id: TaskId) {
        self.tasks.clear_context(id);
        self.tracer.scheduler.exits += 1;
        self.tracer.trace_instant(TraceCategory::Scheduler, "exit", Some(id));

        let Some(tcb) = self.tasks.tcb_mut(id) else {
            return;
        };
        if tcb.kind == TaskKind::Process
            && let Some(directory) = tcb.page_directory.take()
        {
            self.vm.teardown(id, directory, &mut self.tracer);
        }
    }

    /// Retire the current task if it blocked or exited and advance
    fn schedule(&mut self) -> Option<TaskId> {
        let previous = self.tasks.current();
        let (unlinked, next) = self.tasks.advance();
        if unlinked {
            self.tracer.scheduler.unlinks += 1;
            self.tracer
                .trace_instant(TraceCategory::Scheduler, "unlink", Some(previous));
        }
        next
    }
}

impl Kernel {
    /// Run one task until its next kernel entry, then schedule
    pub fn step(&self) -> KernelResult<Step> {
        if !self.inner.started.get() {
            if let Some(slot) = self.inspect(|s| s.tasks.first_unpopulated()) {
                return Err(KernelError::UnpopulatedSlot(slot));
            }
            self.inner.started.set(true);
        }

        if self.inspect(|s| s.tasks.ready_len()) == 0 {
            return self.idle();
        }

        if !self.interrupts_enabled() {
            halt("task switch with interrupts disabled");
        }

        let (id, step) = self.critical(|s| s.dispatch());
        let mut future = match step {
            Dispatch::ColdStart(entry) => entry(TaskContext::new(self.clone(), id)),
            Dispatch::Resume(future) => future,
        };

        let mut cx = Context::from_waker(noop_waker_ref());
        let finished = future.as_mut().poll(&mut cx).is_ready();

        let dropped = self.critical(|s| {
            if finished {
                // Returning from the body is an implicit exit
                if let Some(tcb) = s.tasks.tcb_mut(id) {
                    tcb.state = TaskState::Exited;
                }
                s.retire(id);
                Some(future)
            } else {
                s.suspend(id, future)
            }
        });
        drop(dropped);

        match self.critical(|s| s.schedule()) {
            Some(_) => Ok(Step::Running),
            None => self.idle(),
        }
    }

    fn idle(&self) -> KernelResult<Step> {
        let blocked = self.inspect(|s| s.tasks.blocked());
        if blocked.is_empty() {
            Ok(Step::Finished)
        } else {
            Err(KernelError::Deadlock { blocked })
        }
    }

    /// Dispatch tasks until every one has exited
    ///
    /// Fails with [`KernelError::Deadlock`] if the ready list empties while
    /// tasks are still blocked.
    pub fn run(&self) -> KernelResult<RunReport> {
        while self.step()? == Step::Running {}

        Ok(self.inspect(|s| RunReport {
            dispatches: s.tracer.scheduler.dispatches(),
            exited: s.tasks.count(TaskState::Exited),
        }))
    }

    /// Like [`run`](Self::run), but stop after `max` dispatches
    pub fn run_for(&self, max: usize) -> KernelResult<Step> {
        for _ in 0..max {
            if self.step()? == Step::Finished {
                return Ok(Step::Finished);
            }
        }
        Ok(Step::Running)
    }
}
