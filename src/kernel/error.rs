//! Kernel error types and the halt path
//!
//! Lower layers return these errors. Conditions with no recovery path
//! (no evictable frame, a full wait queue, a fault the pager cannot
//! resolve) end in [`halt`].

use super::frame::FrameId;
use super::memory::VirtAddr;
use super::task::TaskId;
use std::fmt;

/// Kernel result type
pub type KernelResult<T> = Result<T, KernelError>;

/// Frame allocator errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Free list empty and every used frame is pinned
    AllFramesPinned { frames: usize },
    /// Frame is not on the used list
    NotInUse(FrameId),
    /// Address does not name a frame in the pool
    UnknownFrame(u32),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::AllFramesPinned { frames } => {
                write!(f, "all {} used pages are pinned", frames)
            }
            FrameError::NotInUse(frame) => write!(f, "frame {} is not in use", frame.0),
            FrameError::UnknownFrame(addr) => write!(f, "no frame at {:#010x}", addr),
        }
    }
}

impl std::error::Error for FrameError {}

/// Wait queue errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitQueueError {
    /// More waiters than there are tasks
    Full { capacity: usize },
}

impl fmt::Display for WaitQueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitQueueError::Full { capacity } => {
                write!(f, "wait queue overflow (capacity {})", capacity)
            }
        }
    }
}

impl std::error::Error for WaitQueueError {}

/// Block device errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskError {
    /// Request runs past the end of the device
    OutOfRange { sector: u32, count: u32 },
    /// Buffer length does not match the request
    BadBuffer { expected: usize, actual: usize },
}

impl fmt::Display for DiskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskError::OutOfRange { sector, count } => {
                write!(f, "sectors {}..{} out of range", sector, sector + count)
            }
            DiskError::BadBuffer { expected, actual } => {
                write!(f, "buffer is {} bytes, request needs {}", actual, expected)
            }
        }
    }
}

impl std::error::Error for DiskError {}

/// Page fault handler errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageFaultError {
    /// Task has no image to demand-load from
    NoBackingStore { task: TaskId, addr: VirtAddr },
    /// Fault address lies below the task's load address
    OutsideImage { task: TaskId, addr: VirtAddr },
    /// Present mapping the pager does not own
    ProtectionViolation {
        task: TaskId,
        addr: VirtAddr,
        error_code: u32,
    },
    /// Access still faulting after the handler ran
    Unresolved { task: TaskId, addr: VirtAddr },
    /// Translation reached a physical address with no memory behind it
    Unbacked { task: TaskId, addr: VirtAddr },
    Frame(FrameError),
    Disk(DiskError),
}

impl fmt::Display for PageFaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageFaultError::NoBackingStore { task, addr } => {
                write!(f, "{}: fault at {} with no backing store", task, addr)
            }
            PageFaultError::OutsideImage { task, addr } => {
                write!(f, "{}: fault at {} below load address", task, addr)
            }
            PageFaultError::ProtectionViolation {
                task,
                addr,
                error_code,
            } => write!(
                f,
                "{}: protection violation at {} (error code {:#x})",
                task, addr, error_code
            ),
            PageFaultError::Unresolved { task, addr } => {
                write!(f, "{}: fault at {} not resolved", task, addr)
            }
            PageFaultError::Unbacked { task, addr } => {
                write!(f, "{}: {} maps to unbacked physical memory", task, addr)
            }
            PageFaultError::Frame(e) => write!(f, "frame allocation failed: {}", e),
            PageFaultError::Disk(e) => write!(f, "disk error: {}", e),
        }
    }
}

impl std::error::Error for PageFaultError {}

impl From<FrameError> for PageFaultError {
    fn from(e: FrameError) -> Self {
        PageFaultError::Frame(e)
    }
}

impl From<DiskError> for PageFaultError {
    fn from(e: DiskError) -> Self {
        PageFaultError::Disk(e)
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parse(msg) => write!(f, "config parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Top-level kernel errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    Config(ConfigError),
    /// Boot with a zero-sized task table
    EmptyTaskTable,
    /// Every slot already has a task
    TaskTableFull { capacity: usize },
    /// Slot never received a task before `run`
    UnpopulatedSlot(TaskId),
    /// No task is runnable but some are blocked
    Deadlock { blocked: Vec<TaskId> },
    Frame(FrameError),
    PageFault(PageFaultError),
    WaitQueue(WaitQueueError),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Config(e) => write!(f, "{}", e),
            KernelError::EmptyTaskTable => write!(f, "task table has no slots"),
            KernelError::TaskTableFull { capacity } => {
                write!(f, "task table full ({} slots)", capacity)
            }
            KernelError::UnpopulatedSlot(id) => write!(f, "{} was never created", id),
            KernelError::Deadlock { blocked } => {
                let names: Vec<String> = blocked.iter().map(|t| t.to_string()).collect();
                write!(f, "no runnable task; blocked: {}", names.join(", "))
            }
            KernelError::Frame(e) => write!(f, "{}", e),
            KernelError::PageFault(e) => write!(f, "{}", e),
            KernelError::WaitQueue(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<ConfigError> for KernelError {
    fn from(e: ConfigError) -> Self {
        KernelError::Config(e)
    }
}

impl From<FrameError> for KernelError {
    fn from(e: FrameError) -> Self {
        KernelError::Frame(e)
    }
}

impl From<PageFaultError> for KernelError {
    fn from(e: PageFaultError) -> Self {
        KernelError::PageFault(e)
    }
}

impl From<WaitQueueError> for KernelError {
    fn from(e: WaitQueueError) -> Self {
        KernelError::WaitQueue(e)
    }
}

/// Stop the machine with a diagnostic
///
/// There is no caller-visible error return at the scheduler/VM boundary,
/// so unrecoverable conditions end here.
#[track_caller]
pub fn halt(reason: impl fmt::Display) -> ! {
    crate::console_log!("[kernel] HALT: {}", reason);
    panic!("kernel halt: {}", reason);
}
