//! Page table manager
//!
//! Owns physical memory, the frame allocator and the block device, and
//! edits two-level page tables stored in frames.
//!
//! Every directory starts with the common map in slot 0: one pinned page
//! table identity-mapping low memory, the pageable window and the video
//! page, so trap handlers keep working whichever directory is loaded.
//! Threads share the kernel directory; each process gets its own.
//!
//! A reverse map records, per frame, the one mapping that points at it.
//! Eviction uses it to clear the stale entry (in whichever task's tables
//! it lives) and to write dirty pages back to where they were loaded from.

use super::config::KernelConfig;
use super::disk::BlockDevice;
use super::error::{FrameError, halt};
use super::frame::{FrameAllocator, FrameId, FrameList};
use super::memory::{
    PAGE_N_ENTRIES, PAGE_SIZE, PE_A, PE_D, PageEntry, PhysAddr, PhysicalMemory, VirtAddr,
};
use super::task::{TaskId, TaskKind, Tcb};
use super::trace::{TraceCategory, Tracer};
use serde::Serialize;
use std::fmt::Write as _;

// Page fault error code bits
pub const PF_PRESENT: u32 = 1 << 0;
pub const PF_WRITE: u32 = 1 << 1;
pub const PF_USER: u32 = 1 << 2;

/// The kind of memory access being translated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub write: bool,
    pub user: bool,
}

impl Access {
    /// Error code the trap layer reports for a fault on this access
    pub fn error_code(self, protection: bool) -> u32 {
        let mut code = 0;
        if protection {
            code |= PF_PRESENT;
        }
        if self.write {
            code |= PF_WRITE;
        }
        if self.user {
            code |= PF_USER;
        }
        code
    }
}

/// Owner of a data frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub task: TaskId,
    pub directory: PhysAddr,
    /// Page-aligned virtual address
    pub vaddr: VirtAddr,
    /// First backing sector the page was loaded from
    pub sector: Option<u32>,
}

/// Pager counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct VmStats {
    pub allocations: u64,
    pub evictions: u64,
    pub write_backs: u64,
    pub releases: u64,
    pub page_faults: u64,
    pub tables_installed: u64,
    pub pages_loaded: u64,
    pub remaps: u64,
    pub disk_reads: u64,
    pub disk_writes: u64,
}

pub struct Vm {
    pub(crate) memory: PhysicalMemory,
    pub(crate) frames: FrameAllocator,
    pub(crate) rmap: Vec<Option<Mapping>>,
    pub(crate) disk: Box<dyn BlockDevice>,
    kernel_directory: PhysAddr,
    low_memory_end: u32,
    video_address: u32,
    pub(crate) sector_size: usize,
    pub(crate) sectors_per_page: u32,
    pub stats: VmStats,
}

impl Vm {
    /// Build the frame pool and the kernel's page directory
    pub fn new(
        config: &KernelConfig,
        disk: Box<dyn BlockDevice>,
        tracer: &mut Tracer,
    ) -> Result<Self, FrameError> {
        let base = PhysAddr(config.mem_start);
        let mut vm = Self {
            memory: PhysicalMemory::new(base, config.pageable_frames),
            frames: FrameAllocator::new(base, config.pageable_frames),
            rmap: vec![None; config.pageable_frames],
            disk,
            kernel_directory: PhysAddr(0),
            low_memory_end: config.low_memory_end,
            video_address: config.video_address,
            sector_size: config.sector_size,
            sectors_per_page: config.sectors_per_page(),
            stats: VmStats::default(),
        };

        let directory = vm.allocate_frame(true, tracer)?;
        vm.make_common_map(directory, false, tracer)?;
        vm.kernel_directory = directory;
        Ok(vm)
    }

    pub fn kernel_directory(&self) -> PhysAddr {
        self.kernel_directory
    }

    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    pub fn mapping(&self, frame: FrameId) -> Option<Mapping> {
        self.rmap.get(frame.0).copied().flatten()
    }

    /// Allocate a zeroed frame, reclaiming one if the pool is exhausted
    pub fn allocate_frame(&mut self, pinned: bool, tracer: &mut Tracer) -> Result<PhysAddr, FrameError> {
        let alloc = self.frames.allocate(pinned)?;
        self.stats.allocations += 1;

        if alloc.evicted {
            self.reclaim(alloc.frame, tracer);
        }
        self.memory.zero_frame(alloc.address);

        tracer.trace(TraceCategory::Memory, "alloc", None, || {
            format!(
                "frame {} at {}{} ({}/{} used)",
                alloc.frame.0,
                alloc.address,
                if pinned { " pinned" } else { "" },
                self.frames.used_count(),
                self.frames.capacity()
            )
        });
        Ok(alloc.address)
    }

    /// Detach an evicted frame from the mapping that still points at it
    fn reclaim(&mut self, frame: FrameId, tracer: &mut Tracer) {
        self.stats.evictions += 1;
        let address = self.frames.descriptor(frame).address;

        let Some(mapping) = self.rmap[frame.0].take() else {
            tracer.trace(TraceCategory::Memory, "evict", None, || {
                format!("frame {} (unmapped)", frame.0)
            });
            return;
        };

        let Some(table) = self.table_for(mapping.directory, mapping.vaddr) else {
            return;
        };
        let index = mapping.vaddr.table_index();
        let Some(entry) = self.memory.entry(table, index) else {
            return;
        };
        if !entry.is_present() || entry.frame() != address {
            return;
        }

        if entry.is_dirty()
            && let Some(sector) = mapping.sector
        {
            self.write_back(address, sector, mapping, tracer);
        }
        self.memory.set_entry(table, index, PageEntry::EMPTY);

        tracer.trace(TraceCategory::Memory, "evict", Some(mapping.task), || {
            format!(
                "frame {} from {}{}",
                frame.0,
                mapping.vaddr,
                if entry.is_dirty() { " (dirty)" } else { "" }
            )
        });
    }

    fn write_back(&mut self, address: PhysAddr, sector: u32, mapping: Mapping, tracer: &mut Tracer) {
        let count = self.sectors_per_page;
        let Some(bytes) = self.memory.frame_bytes(address) else {
            return;
        };
        // The sectors were readable when the page was loaded
        if let Err(e) = self.disk.write(sector, count, bytes) {
            halt(format_args!("write-back of {} for {} failed: {}", mapping.vaddr, mapping.task, e));
        }
        self.stats.write_backs += 1;
        self.stats.disk_writes += 1;
        tracer.trace(TraceCategory::Disk, "write", Some(mapping.task), || {
            format!("sectors {}..{} from {}", sector, sector + count, address)
        });
    }

    /// Return a frame to the free list and forget its mapping
    pub fn release_frame(&mut self, address: PhysAddr, tracer: &mut Tracer) -> Result<(), FrameError> {
        let frame = self
            .frames
            .frame_at(address)
            .ok_or(FrameError::UnknownFrame(address.0))?;
        self.frames.release(frame)?;
        self.rmap[frame.0] = None;
        self.memory.zero_frame(address);
        self.stats.releases += 1;
        tracer.trace(TraceCategory::Memory, "release", None, || {
            format!("frame {} at {}", frame.0, address)
        });
        Ok(())
    }

    /// Install `vaddr -> paddr` as a present, writable entry of `table`
    pub fn map_present(&mut self, table: PhysAddr, vaddr: VirtAddr, paddr: PhysAddr, user: bool) {
        self.memory
            .set_entry(table, vaddr.table_index(), PageEntry::present(paddr, user));
    }

    /// Point the directory slot covering `vaddr` at `table`
    pub fn insert_table(&mut self, directory: PhysAddr, vaddr: VirtAddr, table: PhysAddr, user: bool) {
        self.memory.set_entry(
            directory,
            vaddr.directory_index(),
            PageEntry::present(table, user),
        );
    }

    /// Build the shared low mapping and install it at directory slot 0
    pub fn make_common_map(
        &mut self,
        directory: PhysAddr,
        user: bool,
        tracer: &mut Tracer,
    ) -> Result<(), FrameError> {
        let table = self.allocate_frame(true, tracer)?;

        // Low memory stays kernel-only even in user directories
        for addr in (0..self.low_memory_end).step_by(PAGE_SIZE) {
            self.map_present(table, VirtAddr(addr), PhysAddr(addr), false);
        }

        let start = self.memory.base().0;
        let end = self.memory.end() as u32;
        for addr in (start..end).step_by(PAGE_SIZE) {
            self.map_present(table, VirtAddr(addr), PhysAddr(addr), user);
        }

        let video = self.video_address;
        self.map_present(table, VirtAddr(video), PhysAddr(video), user);

        self.insert_table(directory, VirtAddr(0), table, user);
        Ok(())
    }

    /// Give a task its address space
    ///
    /// Threads run in the kernel's directory. Processes get a fresh pinned
    /// directory holding only the common map; everything else is faulted
    /// in on demand.
    pub fn setup_page_table(&mut self, tcb: &mut Tcb, tracer: &mut Tracer) -> Result<(), FrameError> {
        if tcb.kind == TaskKind::Thread {
            tcb.page_directory = Some(self.kernel_directory);
            return Ok(());
        }

        let directory = self.allocate_frame(true, tracer)?;
        self.make_common_map(directory, true, tracer)?;
        tcb.page_directory = Some(directory);

        tracer.trace(TraceCategory::Memory, "directory", Some(tcb.id), || {
            format!("process directory at {}", directory)
        });
        Ok(())
    }

    /// Page table covering `vaddr`, if the directory has one
    pub fn table_for(&self, directory: PhysAddr, vaddr: VirtAddr) -> Option<PhysAddr> {
        let pde = self.memory.entry(directory, vaddr.directory_index())?;
        pde.is_present().then(|| pde.frame())
    }

    /// Leaf entry for `vaddr`, if its table exists
    pub fn leaf_entry(&self, directory: PhysAddr, vaddr: VirtAddr) -> Option<PageEntry> {
        let table = self.table_for(directory, vaddr)?;
        self.memory.entry(table, vaddr.table_index())
    }

    /// Walk the tables like the MMU would
    ///
    /// On success the accessed bit (and dirty bit for writes) is set and
    /// the physical address returned. On failure the fault error code is
    /// returned.
    pub fn translate(&mut self, directory: PhysAddr, vaddr: VirtAddr, access: Access) -> Result<PhysAddr, u32> {
        let di = vaddr.directory_index();
        let pde = self.memory.entry(directory, di).unwrap_or(PageEntry::EMPTY);
        if !pde.is_present() {
            return Err(access.error_code(false));
        }
        if !permits(pde, access) {
            return Err(access.error_code(true));
        }

        let table = pde.frame();
        let ti = vaddr.table_index();
        let pte = self.memory.entry(table, ti).unwrap_or(PageEntry::EMPTY);
        if !pte.is_present() {
            return Err(access.error_code(false));
        }
        if !permits(pte, access) {
            return Err(access.error_code(true));
        }

        let flags = if access.write { PE_A | PE_D } else { PE_A };
        self.memory.set_entry(table, ti, pte.with_flags(flags));
        self.memory.set_entry(directory, di, pde.with_flags(PE_A));

        Ok(PhysAddr(pte.frame().0 | vaddr.page_offset() as u32))
    }

    /// Free every frame a process directory owns: its data pages, its
    /// page tables (including its copy of the common map) and itself
    pub fn teardown(&mut self, task: TaskId, directory: PhysAddr, tracer: &mut Tracer) {
        if directory == self.kernel_directory {
            return;
        }

        for di in 0..PAGE_N_ENTRIES {
            let Some(pde) = self.memory.entry(directory, di) else {
                break;
            };
            if !pde.is_present() || !self.memory.contains(pde.frame()) {
                continue;
            }
            let table = pde.frame();

            for ti in 0..PAGE_N_ENTRIES {
                let Some(pte) = self.memory.entry(table, ti) else {
                    break;
                };
                if !pte.is_present() {
                    continue;
                }
                let Some(frame) = self.frames.frame_at(pte.frame()) else {
                    continue;
                };
                let vaddr = VirtAddr::from_indices(di, ti);
                let owned = self
                    .mapping(frame)
                    .is_some_and(|m| m.directory == directory && m.vaddr == vaddr);
                if owned {
                    self.release_owned(pte.frame(), tracer);
                }
            }
            self.release_owned(table, tracer);
        }
        self.release_owned(directory, tracer);

        tracer.trace(TraceCategory::Memory, "teardown", Some(task), || {
            format!("directory {}", directory)
        });
    }

    fn release_owned(&mut self, address: PhysAddr, tracer: &mut Tracer) {
        let in_use = self
            .frames
            .frame_at(address)
            .is_some_and(|f| self.frames.descriptor(f).list() == FrameList::Used);
        if in_use {
            // Membership was just checked
            let _ = self.release_frame(address, tracer);
        }
    }

    /// Non-zero words of every used frame, one block per frame
    pub fn dump_frames(&self) -> String {
        let mut out = String::new();
        for frame in self.frames.used_list() {
            let desc = self.frames.descriptor(frame);
            let _ = writeln!(
                out,
                "==== frame {:02} at {}{} ====",
                frame.0,
                desc.address,
                if desc.pinned { " (pinned)" } else { "" }
            );
            if let Some(words) = self.memory.frame_words(desc.address) {
                for (i, &word) in words.iter().enumerate() {
                    if word != 0 {
                        let _ = writeln!(
                            out,
                            "{:04} - {:#010x} = {:#010x}",
                            i,
                            desc.address.0 as usize + i * 4,
                            word
                        );
                    }
                }
            }
        }
        out
    }
}

fn permits(entry: PageEntry, access: Access) -> bool {
    (!access.user || entry.is_user()) && (!access.write || entry.is_writable())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::disk::MemoryDisk;

    fn vm(frames: usize) -> (Vm, Tracer) {
        let config = KernelConfig::default().with_frames(frames);
        let mut tracer = Tracer::new();
        let disk = Box::new(MemoryDisk::new(512, 64));
        let vm = Vm::new(&config, disk, &mut tracer).unwrap();
        (vm, tracer)
    }

    #[test]
    fn test_kernel_directory_has_common_map() {
        let (mut vm, _) = vm(8);
        let dir = vm.kernel_directory();

        // Directory + common map table, both pinned
        assert_eq!(vm.frames().used_count(), 2);
        assert!(vm.frames().descriptors()[0].pinned);
        assert!(vm.frames().descriptors()[1].pinned);

        let kernel = Access {
            write: true,
            user: false,
        };
        assert_eq!(vm.translate(dir, VirtAddr(0x1234), kernel), Ok(PhysAddr(0x1234)));
        assert_eq!(vm.translate(dir, VirtAddr(0xb8010), kernel), Ok(PhysAddr(0xb8010)));
        assert_eq!(vm.translate(dir, VirtAddr(0x10_1004), kernel), Ok(PhysAddr(0x10_1004)));
        // Gap between low memory and video page is unmapped
        assert!(vm.translate(dir, VirtAddr(0xa_0000), kernel).is_err());
    }

    #[test]
    fn test_kernel_map_rejects_user_access() {
        let (mut vm, _) = vm(8);
        let dir = vm.kernel_directory();
        let user = Access {
            write: false,
            user: true,
        };
        assert_eq!(vm.translate(dir, VirtAddr(0x10_0000), user), Err(PF_PRESENT | PF_USER));
    }

    #[test]
    fn test_process_directory_user_bits() {
        let (mut vm, mut tracer) = vm(8);
        let mut tcb = Tcb::new(TaskId(0), &KernelConfig::default());
        tcb.kind = TaskKind::Process;
        vm.setup_page_table(&mut tcb, &mut tracer).unwrap();

        let dir = tcb.page_directory.unwrap();
        assert_ne!(dir, vm.kernel_directory());
        let user = Access {
            write: true,
            user: true,
        };
        // Window and video are user-visible, low memory is not
        assert!(vm.translate(dir, VirtAddr(0x10_2000), user).is_ok());
        assert!(vm.translate(dir, VirtAddr(0xb8000), user).is_ok());
        assert!(vm.translate(dir, VirtAddr(0x1000), user).is_err());
    }

    #[test]
    fn test_threads_share_kernel_directory() {
        let (mut vm, mut tracer) = vm(8);
        let mut tcb = Tcb::new(TaskId(0), &KernelConfig::default());
        let before = vm.frames().used_count();
        vm.setup_page_table(&mut tcb, &mut tracer).unwrap();

        assert_eq!(tcb.page_directory, Some(vm.kernel_directory()));
        assert_eq!(vm.frames().used_count(), before);
    }

    #[test]
    fn test_translate_sets_accessed_and_dirty() {
        let (mut vm, mut tracer) = vm(8);
        let dir = vm.kernel_directory();
        let table = vm.allocate_frame(true, &mut tracer).unwrap();
        let page = vm.allocate_frame(false, &mut tracer).unwrap();
        let vaddr = VirtAddr(0x0080_0000);
        vm.insert_table(dir, vaddr, table, false);
        vm.map_present(table, vaddr, page, false);

        let read = Access {
            write: false,
            user: false,
        };
        vm.translate(dir, vaddr, read).unwrap();
        let entry = vm.leaf_entry(dir, vaddr).unwrap();
        assert!(entry.is_accessed());
        assert!(!entry.is_dirty());

        let write = Access {
            write: true,
            user: false,
        };
        vm.translate(dir, vaddr.offset(8), write).unwrap();
        assert!(vm.leaf_entry(dir, vaddr).unwrap().is_dirty());
    }

    #[test]
    fn test_eviction_clears_stale_entry() {
        let (mut vm, mut tracer) = vm(4);
        let dir = vm.kernel_directory();
        let table = vm.allocate_frame(true, &mut tracer).unwrap();
        let page = vm.allocate_frame(false, &mut tracer).unwrap();
        let vaddr = VirtAddr(0x0080_0000);
        vm.insert_table(dir, vaddr, table, false);
        vm.map_present(table, vaddr, page, false);
        let frame = vm.frames().frame_at(page).unwrap();
        vm.rmap[frame.0] = Some(Mapping {
            task: TaskId(0),
            directory: dir,
            vaddr,
            sector: None,
        });

        // Pool is full; the only unpinned frame is reclaimed
        let again = vm.allocate_frame(false, &mut tracer).unwrap();
        assert_eq!(again, page);
        assert!(!vm.leaf_entry(dir, vaddr).unwrap().is_present());
        assert_eq!(vm.mapping(frame), None);
        assert_eq!(vm.stats.evictions, 1);
    }

    #[test]
    fn test_teardown_returns_process_frames() {
        let (mut vm, mut tracer) = vm(8);
        let mut tcb = Tcb::new(TaskId(3), &KernelConfig::default());
        tcb.kind = TaskKind::Process;
        let baseline = vm.frames().used_count();
        vm.setup_page_table(&mut tcb, &mut tracer).unwrap();
        assert_eq!(vm.frames().used_count(), baseline + 2);

        vm.teardown(tcb.id, tcb.page_directory.unwrap(), &mut tracer);
        assert_eq!(vm.frames().used_count(), baseline);
        // Kernel map untouched
        let kernel = Access {
            write: false,
            user: false,
        };
        let dir = vm.kernel_directory();
        assert!(vm.translate(dir, VirtAddr(0x10_0000), kernel).is_ok());
    }

    #[test]
    fn test_dump_lists_used_frames() {
        let (vm, _) = vm(4);
        let dump = vm.dump_frames();
        assert!(dump.contains("frame 00"));
        assert!(dump.contains("(pinned)"));
    }
}
