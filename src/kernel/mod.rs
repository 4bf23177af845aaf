//! The kernel - cooperative tasks over demand-paged memory
//!
//! - Fixed task table, one circular ready list, voluntary yields
//! - Locks, conditions, semaphores and barriers on one block/unblock pair
//! - A small frame pool shared by page tables and demand-loaded pages
//!
//! All kernel state lives in one [`KernelState`] behind a shared
//! [`Kernel`] handle. It is only touched inside [`Kernel::critical`], the
//! equivalent of running with interrupts disabled.

pub mod config;
pub mod critical;
pub mod disk;
pub mod error;
pub mod fault;
pub mod frame;
pub mod lock;
pub mod mailbox;
pub mod memory;
pub mod paging;
pub mod ring;
pub mod scheduler;
pub mod semaphore;
pub mod task;
pub mod trace;
pub mod waitqueue;

#[cfg(test)]
mod invariants_test;

pub use config::KernelConfig;
pub use disk::{BlockDevice, DiskImageBuilder, MemoryDisk, ProgramLocation};
pub use error::{KernelError, KernelResult, PageFaultError, halt};
pub use lock::{Condition, Lock, LockStatus};
pub use mailbox::{MailboxError, MailboxHandle, Mailboxes};
pub use memory::{PAGE_SIZE, PhysAddr, VirtAddr};
pub use scheduler::{RunReport, Step, Suspend, TaskContext};
pub use semaphore::{Barrier, Semaphore};
pub use task::{TaskId, TaskKind, TaskState};
pub use trace::{SchedulerStats, TraceCategory, TraceEvent, Tracer};

use critical::InterruptState;
use error::ConfigError;
use paging::{Vm, VmStats};
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use task::{Backing, BoxFuture, TaskEntry, TaskTable};

/// Everything the kernel owns
pub struct KernelState {
    pub tasks: TaskTable,
    pub vm: Vm,
    pub tracer: Tracer,
}

struct KernelInner {
    state: RefCell<KernelState>,
    interrupts: InterruptState,
    config: KernelConfig,
    started: Cell<bool>,
}

/// Shared handle to a booted kernel
#[derive(Clone)]
pub struct Kernel {
    inner: Rc<KernelInner>,
}

/// A program image on the boot disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessImage {
    /// First sector of the image
    pub location: u32,
    /// Address the image is linked to run at
    pub load_base: Option<VirtAddr>,
    /// Keep every page it touches resident
    pub pinned: bool,
}

impl ProcessImage {
    pub fn new(location: ProgramLocation) -> Self {
        Self {
            location: location.first_sector,
            load_base: None,
            pinned: false,
        }
    }

    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }
}

impl Kernel {
    /// Build the frame pool, the kernel page directory and `pool_size`
    /// empty task slots
    ///
    /// The disk must use the configured sector size.
    pub fn boot(
        config: KernelConfig,
        disk: impl BlockDevice + 'static,
        pool_size: usize,
    ) -> KernelResult<Self> {
        config.validate()?;
        if disk.sector_size() != config.sector_size {
            return Err(ConfigError::Invalid(format!(
                "disk has {}-byte sectors, config expects {}",
                disk.sector_size(),
                config.sector_size
            ))
            .into());
        }

        let mut tracer = Tracer::with_capacity(config.trace_capacity);
        if config.trace {
            tracer.enable();
        }
        let vm = Vm::new(&config, Box::new(disk), &mut tracer)?;
        let tasks = TaskTable::initialize(pool_size, &config)?;

        tracer.trace(TraceCategory::Scheduler, "boot", None, || {
            format!(
                "{} task slots, {} frames at {:#x}",
                pool_size, config.pageable_frames, config.mem_start
            )
        });

        Ok(Self {
            inner: Rc::new(KernelInner {
                state: RefCell::new(KernelState { tasks, vm, tracer }),
                interrupts: InterruptState::new(),
                config,
                started: Cell::new(false),
            }),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    /// Run `f` with task switching suppressed and the state lent to it
    ///
    /// The state is lent once. Inside `f`, use the `_locked` entry points
    /// (`Semaphore::up_locked`, `Lock::release_locked`,
    /// `Condition::signal_locked`, `KernelStats::collect`); going back
    /// through the handle halts. [`Kernel::without_switching`] is the
    /// nestable scope for code that calls the ordinary API.
    pub fn critical<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> R {
        let _section = self.inner.interrupts.disable();
        let Ok(mut state) = self.inner.state.try_borrow_mut() else {
            halt("kernel state re-entered inside a critical section");
        };
        f(&mut state)
    }

    /// Suppress task switching around `f`
    ///
    /// Sections nest, and every kernel call works inside one: each takes
    /// the state only for its own duration.
    pub fn without_switching<R>(&self, f: impl FnOnce() -> R) -> R {
        let _section = self.inner.interrupts.disable();
        f()
    }

    /// Read-only view of kernel state
    pub fn inspect<R>(&self, f: impl FnOnce(&KernelState) -> R) -> R {
        let Ok(state) = self.inner.state.try_borrow() else {
            halt("kernel state read inside a critical section");
        };
        f(&state)
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.inner.interrupts.enabled()
    }

    pub fn current(&self) -> TaskId {
        self.inspect(|s| s.tasks.current())
    }

    pub fn task_count(&self) -> usize {
        self.inspect(|s| s.tasks.capacity())
    }

    /// Fill the next slot with a kernel thread
    pub fn spawn_thread<F, Fut>(&self, name: &str, body: F) -> KernelResult<TaskId>
    where
        F: FnOnce(TaskContext) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let entry: TaskEntry = Box::new(move |cx: TaskContext| -> BoxFuture { Box::pin(body(cx)) });
        self.spawn(name, TaskKind::Thread, None, false, entry)
    }

    /// Fill the next slot with a user process backed by `image`
    pub fn spawn_process<F, Fut>(&self, name: &str, image: ProcessImage, body: F) -> KernelResult<TaskId>
    where
        F: FnOnce(TaskContext) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let backing = Backing {
            location: image.location,
            load_base: image
                .load_base
                .unwrap_or(VirtAddr(self.inner.config.process_load_base)),
        };
        let entry: TaskEntry = Box::new(move |cx: TaskContext| -> BoxFuture { Box::pin(body(cx)) });
        self.spawn(name, TaskKind::Process, Some(backing), image.pinned, entry)
    }

    fn spawn(
        &self,
        name: &str,
        kind: TaskKind,
        backing: Option<Backing>,
        pinned: bool,
        entry: TaskEntry,
    ) -> KernelResult<TaskId> {
        self.critical(|state| {
            let KernelState { tasks, vm, tracer } = state;
            let id = tasks.populate(name, kind, entry)?;

            let Some(tcb) = tasks.tcb_mut(id) else {
                return Err(KernelError::UnpopulatedSlot(id));
            };
            tcb.backing = backing;
            tcb.pinned = pinned;
            vm.setup_page_table(tcb, tracer)?;

            tracer.trace(TraceCategory::Scheduler, "create", Some(id), || {
                format!("{} {:?}", name, kind)
            });
            Ok(id)
        })
    }

    /// Snapshot of every counter the kernel keeps
    pub fn stats(&self) -> KernelStats {
        self.inspect(KernelStats::collect)
    }
}

/// Per-task counters
#[derive(Debug, Clone, Serialize)]
pub struct TaskStats {
    pub id: TaskId,
    pub name: String,
    pub kind: TaskKind,
    pub state: TaskState,
    pub yields: u64,
    pub page_faults: u64,
    pub dispatches: u64,
    pub kernel_us: u64,
    pub user_us: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct KernelStats {
    pub tasks: Vec<TaskStats>,
    pub scheduler: SchedulerStats,
    pub vm: VmStats,
    pub frames_total: usize,
    pub frames_free: usize,
    pub frames_used: usize,
}

impl KernelStats {
    pub fn collect(s: &KernelState) -> Self {
        let frames = s.vm.frames();
        Self {
            tasks: s
                .tasks
                .tcbs()
                .iter()
                .map(|t| TaskStats {
                    id: t.id,
                    name: t.name.clone(),
                    kind: t.kind,
                    state: t.state,
                    yields: t.accounting.yield_count,
                    page_faults: t.accounting.page_fault_count,
                    dispatches: t.accounting.dispatch_count,
                    kernel_us: t.accounting.kernel_time.as_micros() as u64,
                    user_us: t.accounting.user_time.as_micros() as u64,
                })
                .collect(),
            scheduler: s.tracer.scheduler.clone(),
            vm: s.vm.stats.clone(),
            frames_total: frames.capacity(),
            frames_free: frames.free_count(),
            frames_used: frames.used_count(),
        }
    }
}

impl std::fmt::Display for KernelStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{:<4} {:<14} {:<8} {:<8} {:>6} {:>6} {:>6} {:>10} {:>10}",
            "ID", "NAME", "KIND", "STATE", "YIELD", "FAULT", "DISP", "KERNEL-us", "USER-us"
        )?;
        for t in &self.tasks {
            writeln!(
                f,
                "{:<4} {:<14} {:<8} {:<8} {:>6} {:>6} {:>6} {:>10} {:>10}",
                t.id.0,
                t.name,
                format!("{:?}", t.kind),
                format!("{:?}", t.state),
                t.yields,
                t.page_faults,
                t.dispatches,
                t.kernel_us,
                t.user_us
            )?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "dispatches: {} ({} cold, {} resumed), blocks: {}, exits: {}",
            self.scheduler.dispatches(),
            self.scheduler.cold_starts,
            self.scheduler.resumes,
            self.scheduler.blocks,
            self.scheduler.exits
        )?;
        writeln!(
            f,
            "pages used: [{}/{}], faults: {}, disk reads: {}, writes: {}, evictions: {}",
            self.frames_used,
            self.frames_total,
            self.vm.page_faults,
            self.vm.disk_reads,
            self.vm.disk_writes,
            self.vm.evictions
        )
    }
}
