//! Task control blocks and the ready list
//!
//! The task table is a fixed pool of TCBs allocated at boot. Slots are
//! never freed: a task that exits only changes state. All slots start in
//! `FirstTime` and are wired into one circular ready list in slot order.
//!
//! A task's saved execution context is its suspended future. Before the
//! first dispatch the slot holds the entry closure instead; calling it is
//! the cold start, polling the future afterwards is a resume.

use super::config::KernelConfig;
use super::error::{KernelError, WaitQueueError};
use super::memory::{PhysAddr, VirtAddr};
use super::ring::{Linked, Links, Ring};
use super::scheduler::TaskContext;
use super::waitqueue::WaitQueue;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

/// Unique identifier for a task (its slot in the table)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskId(pub usize);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskKind {
    /// Runs on a kernel stack in the kernel's address space
    Thread,
    /// Runs on a user stack with a private page directory
    Process,
}

/// Task execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    /// Never dispatched
    FirstTime,
    /// On the ready list (the running task is also Ready)
    Ready,
    /// Waiting on a wait queue
    Blocked,
    /// Finished; never dispatched again
    Exited,
}

/// A boxed future representing a task body
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// Entry point: consumed once, on the first dispatch
pub type TaskEntry = Box<dyn FnOnce(TaskContext) -> BoxFuture>;

/// Stack and base pointer of one stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StackFrame {
    pub stack_pointer: u32,
    pub base_pointer: u32,
}

pub(crate) enum SavedContext {
    /// Slot not populated
    Empty,
    /// Populated but never run
    Entry(TaskEntry),
    /// Suspended at a kernel entry
    Suspended(BoxFuture),
    /// Taken out by the dispatcher while the task runs
    Running,
}

impl std::fmt::Debug for SavedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SavedContext::Empty => write!(f, "Empty"),
            SavedContext::Entry(_) => write!(f, "Entry"),
            SavedContext::Suspended(_) => write!(f, "Suspended"),
            SavedContext::Running => write!(f, "Running"),
        }
    }
}

/// Where a process image lives on the block device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backing {
    /// First sector of the image
    pub location: u32,
    /// Virtual address the image's first byte is loaded at
    pub load_base: VirtAddr,
}

/// Per-task counters and time attribution
#[derive(Debug, Clone, Default)]
pub struct Accounting {
    pub yield_count: u64,
    pub page_fault_count: u64,
    pub dispatch_count: u64,
    /// Time from the previous kernel entry until this task resumed
    pub kernel_time: Duration,
    /// Time spent running task code
    pub user_time: Duration,
    pub(crate) kernel_entered: Option<Instant>,
    pub(crate) user_started: Option<Instant>,
}

/// Task control block
#[derive(Debug)]
pub struct Tcb {
    pub id: TaskId,
    pub name: String,
    pub kind: TaskKind,
    pub state: TaskState,
    pub kernel_stack: StackFrame,
    /// Meaningful for processes only
    pub user_stack: StackFrame,
    pub(crate) context: SavedContext,
    pub page_directory: Option<PhysAddr>,
    /// Frames this task allocates are excluded from eviction
    pub pinned: bool,
    /// Set by the trap path before the fault handler runs
    pub fault_addr: VirtAddr,
    pub error_code: u32,
    pub backing: Option<Backing>,
    /// Descriptor table; the kernel only sizes it, the filesystem owns it
    pub files: Vec<Option<u32>>,
    pub accounting: Accounting,
    links: Links,
}

impl Tcb {
    /// A FirstTime slot with its stacks laid out
    pub fn new(id: TaskId, config: &KernelConfig) -> Self {
        let slot = id.0 as u32;
        let offset = config.stack_size.saturating_sub(4);

        let kernel_top = config.stack_max.wrapping_sub(slot * config.stack_size);
        let user_bottom = config.stack_min.wrapping_add(slot * config.stack_size);

        Self {
            id,
            name: String::new(),
            kind: TaskKind::Thread,
            state: TaskState::FirstTime,
            kernel_stack: StackFrame {
                stack_pointer: kernel_top.wrapping_sub(offset),
                base_pointer: kernel_top,
            },
            user_stack: StackFrame {
                stack_pointer: user_bottom,
                base_pointer: user_bottom.wrapping_add(offset),
            },
            context: SavedContext::Empty,
            page_directory: None,
            pinned: false,
            fault_addr: VirtAddr::default(),
            error_code: 0,
            backing: None,
            files: vec![None; config.open_files],
            accounting: Accounting::default(),
            links: Links::detached(id.0),
        }
    }

    /// Stack the first dispatch switches to
    pub fn start_stack(&self) -> StackFrame {
        match self.kind {
            TaskKind::Thread => self.kernel_stack,
            TaskKind::Process => self.user_stack,
        }
    }

    pub fn is_populated(&self) -> bool {
        !matches!(self.context, SavedContext::Empty)
    }

    pub fn next(&self) -> TaskId {
        TaskId(self.links.next)
    }

    pub fn previous(&self) -> TaskId {
        TaskId(self.links.prev)
    }
}

impl Linked for Tcb {
    fn links(&self) -> &Links {
        &self.links
    }
    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }
}

/// What the dispatcher does with the task it switched to
pub(crate) enum Dispatch {
    ColdStart(TaskEntry),
    Resume(BoxFuture),
}

/// The TCB store plus the ready list
#[derive(Debug)]
pub struct TaskTable {
    tcbs: Vec<Tcb>,
    ready: Ring,
    current: usize,
}

impl TaskTable {
    /// Build `pool_size` FirstTime slots wired into one ring in slot order
    pub fn initialize(pool_size: usize, config: &KernelConfig) -> Result<Self, KernelError> {
        if pool_size == 0 {
            return Err(KernelError::EmptyTaskTable);
        }

        let mut tcbs: Vec<Tcb> = (0..pool_size).map(|i| Tcb::new(TaskId(i), config)).collect();
        let mut ready = Ring::new();
        for i in 0..pool_size {
            ready.push_back(&mut tcbs, i);
        }

        Ok(Self {
            tcbs,
            ready,
            current: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.tcbs.len()
    }

    pub fn tcb(&self, id: TaskId) -> Option<&Tcb> {
        self.tcbs.get(id.0)
    }

    pub fn tcb_mut(&mut self, id: TaskId) -> Option<&mut Tcb> {
        self.tcbs.get_mut(id.0)
    }

    pub fn tcbs(&self) -> &[Tcb] {
        &self.tcbs
    }

    pub fn current(&self) -> TaskId {
        TaskId(self.current)
    }

    pub fn current_tcb(&self) -> &Tcb {
        &self.tcbs[self.current]
    }

    pub fn current_tcb_mut(&mut self) -> &mut Tcb {
        &mut self.tcbs[self.current]
    }

    /// Ready list in order, starting at the current task
    pub fn ready_list(&self) -> Vec<TaskId> {
        self.ready.iter(&self.tcbs).map(TaskId).collect()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn count(&self, state: TaskState) -> usize {
        self.tcbs.iter().filter(|t| t.state == state).count()
    }

    pub fn blocked(&self) -> Vec<TaskId> {
        self.tcbs
            .iter()
            .filter(|t| t.state == TaskState::Blocked)
            .map(|t| t.id)
            .collect()
    }

    /// Fill the lowest empty slot with a task
    pub(crate) fn populate(
        &mut self,
        name: &str,
        kind: TaskKind,
        entry: TaskEntry,
    ) -> Result<TaskId, KernelError> {
        let slot = self
            .tcbs
            .iter()
            .position(|t| !t.is_populated())
            .ok_or(KernelError::TaskTableFull {
                capacity: self.tcbs.len(),
            })?;

        let tcb = &mut self.tcbs[slot];
        tcb.name = name.to_string();
        tcb.kind = kind;
        tcb.context = SavedContext::Entry(entry);
        Ok(tcb.id)
    }

    /// First slot that never received a task
    pub(crate) fn first_unpopulated(&self) -> Option<TaskId> {
        self.tcbs.iter().find(|t| !t.is_populated()).map(|t| t.id)
    }

    /// Put the current task on `queue` and mark it Blocked
    ///
    /// It stays on the ready list until the scheduler observes the state.
    pub(crate) fn block(&mut self, queue: &mut WaitQueue) -> Result<(), WaitQueueError> {
        queue.push(TaskId(self.current))?;
        self.tcbs[self.current].state = TaskState::Blocked;
        Ok(())
    }

    /// Wake the head of `queue` and splice it in right after the current task
    pub(crate) fn unblock(&mut self, queue: &mut WaitQueue) -> Option<TaskId> {
        let id = queue.pop()?;
        let index = id.0;
        self.tcbs[index].state = TaskState::Ready;

        // Blocked but not yet retired by the scheduler
        if !self.ready.contains(&self.tcbs, index) {
            self.ready.insert_after(&mut self.tcbs, self.current, index);
        }
        Some(id)
    }

    /// Retire the current task if it blocked or exited, then advance
    ///
    /// Returns `(unlinked, next)`, or `None` for `next` when the ready list
    /// is empty.
    pub(crate) fn advance(&mut self) -> (bool, Option<TaskId>) {
        let current = self.current;
        let retire = matches!(
            self.tcbs[current].state,
            TaskState::Blocked | TaskState::Exited
        );
        if retire {
            self.ready.unlink(&mut self.tcbs, current);
        }
        if self.ready.is_empty() {
            return (retire, None);
        }

        // A just-unlinked task still points at its old neighbour
        let next = self.tcbs[current].links.next;
        self.current = next;
        self.ready.set_head(next);
        (retire, Some(TaskId(next)))
    }

    /// Take the current task's saved context for the dispatcher
    pub(crate) fn take_context(&mut self) -> Option<Dispatch> {
        let tcb = &mut self.tcbs[self.current];
        match std::mem::replace(&mut tcb.context, SavedContext::Running) {
            SavedContext::Entry(entry) if tcb.state == TaskState::FirstTime => {
                tcb.state = TaskState::Ready;
                Some(Dispatch::ColdStart(entry))
            }
            SavedContext::Suspended(future) => Some(Dispatch::Resume(future)),
            other => {
                tcb.context = other;
                None
            }
        }
    }

    /// Store a suspended task's future back into its slot
    pub(crate) fn save_context(&mut self, id: TaskId, future: BoxFuture) {
        self.tcbs[id.0].context = SavedContext::Suspended(future);
    }

    pub(crate) fn clear_context(&mut self, id: TaskId) {
        self.tcbs[id.0].context = SavedContext::Running;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> TaskEntry {
        Box::new(|_cx: TaskContext| -> BoxFuture { Box::pin(async {}) })
    }

    fn table(n: usize) -> TaskTable {
        TaskTable::initialize(n, &KernelConfig::default()).unwrap()
    }

    #[test]
    fn test_initialize_wires_ring_in_slot_order() {
        let tasks = table(4);
        assert_eq!(
            tasks.ready_list(),
            vec![TaskId(0), TaskId(1), TaskId(2), TaskId(3)]
        );
        assert!(tasks.tcbs().iter().all(|t| t.state == TaskState::FirstTime));
        assert_eq!(tasks.tcb(TaskId(3)).unwrap().next(), TaskId(0));
        assert_eq!(tasks.tcb(TaskId(0)).unwrap().previous(), TaskId(3));
    }

    #[test]
    fn test_empty_table_rejected() {
        assert_eq!(
            TaskTable::initialize(0, &KernelConfig::default()).unwrap_err(),
            KernelError::EmptyTaskTable
        );
    }

    #[test]
    fn test_file_table_sized_from_config() {
        let config = KernelConfig {
            open_files: 4,
            ..KernelConfig::default()
        };
        let tasks = TaskTable::initialize(2, &config).unwrap();
        for tcb in tasks.tcbs() {
            assert_eq!(tcb.files.len(), 4);
            assert!(tcb.files.iter().all(Option::is_none));
        }
    }

    #[test]
    fn test_stack_layout() {
        let tasks = table(3);
        let t2 = tasks.tcb(TaskId(2)).unwrap();
        assert_eq!(t2.kernel_stack.base_pointer, 0x20000 - 2 * 0x1000);
        assert_eq!(t2.kernel_stack.stack_pointer, 0x20000 - 2 * 0x1000 - 0xffc);
        assert_eq!(t2.user_stack.stack_pointer, 0x10000 + 2 * 0x1000);
        assert_eq!(t2.start_stack(), t2.kernel_stack);
    }

    #[test]
    fn test_populate_fills_slots_in_order() {
        let mut tasks = table(2);
        assert_eq!(tasks.populate("a", TaskKind::Thread, entry()).unwrap(), TaskId(0));
        assert_eq!(tasks.populate("b", TaskKind::Process, entry()).unwrap(), TaskId(1));
        assert_eq!(
            tasks.populate("c", TaskKind::Thread, entry()).unwrap_err(),
            KernelError::TaskTableFull { capacity: 2 }
        );
        assert_eq!(tasks.tcb(TaskId(1)).unwrap().kind, TaskKind::Process);
        assert_eq!(tasks.first_unpopulated(), None);
    }

    #[test]
    fn test_block_keeps_task_until_advance() {
        let mut tasks = table(3);
        let mut queue = WaitQueue::new(3);
        tasks.block(&mut queue).unwrap();

        assert_eq!(tasks.current_tcb().state, TaskState::Blocked);
        assert_eq!(tasks.ready_len(), 3);

        let (unlinked, next) = tasks.advance();
        assert!(unlinked);
        assert_eq!(next, Some(TaskId(1)));
        assert_eq!(tasks.ready_list(), vec![TaskId(1), TaskId(2)]);
    }

    #[test]
    fn test_unblock_splices_after_current() {
        let mut tasks = table(4);
        let mut queue = WaitQueue::new(4);
        tasks.block(&mut queue).unwrap();
        tasks.advance();
        tasks.advance();
        assert_eq!(tasks.current(), TaskId(2));

        assert_eq!(tasks.unblock(&mut queue), Some(TaskId(0)));
        assert_eq!(tasks.tcb(TaskId(0)).unwrap().state, TaskState::Ready);
        assert_eq!(
            tasks.ready_list(),
            vec![TaskId(2), TaskId(0), TaskId(3), TaskId(1)]
        );
    }

    #[test]
    fn test_unblock_before_retire_does_not_duplicate() {
        let mut tasks = table(2);
        let mut queue = WaitQueue::new(2);
        tasks.block(&mut queue).unwrap();
        tasks.unblock(&mut queue);

        assert_eq!(tasks.ready_len(), 2);
        let (unlinked, _) = tasks.advance();
        assert!(!unlinked);
    }

    #[test]
    fn test_advance_with_nothing_ready() {
        let mut tasks = table(1);
        tasks.current_tcb_mut().state = TaskState::Exited;
        assert_eq!(tasks.advance(), (true, None));
        assert_eq!(tasks.ready_len(), 0);
    }

    #[test]
    fn test_take_context_cold_start_then_resume() {
        let mut tasks = table(1);
        tasks.populate("a", TaskKind::Thread, entry()).unwrap();

        assert!(matches!(tasks.take_context(), Some(Dispatch::ColdStart(_))));
        assert_eq!(tasks.current_tcb().state, TaskState::Ready);
        // Entry closure is consumed
        assert!(tasks.take_context().is_none());

        tasks.save_context(TaskId(0), Box::pin(async {}));
        assert!(matches!(tasks.take_context(), Some(Dispatch::Resume(_))));
    }
}
