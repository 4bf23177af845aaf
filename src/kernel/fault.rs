//! Page fault handler and the MMU access path
//!
//! Task memory accesses walk the current task's page tables. A missing or
//! insufficient mapping is a trap: the fault address and error code are
//! written into the TCB, the handler runs, and the access is retried.
//!
//! The handler is a state machine on (table present, page present) and
//! makes exactly one step per invocation:
//!
//! 1. No page table: install a pinned one.
//! 2. Table but no page: load the page from the task's image.
//! 3. Page present but the access still faulted: re-grant it, if the
//!    reverse map says the frame really belongs to this mapping.
//!
//! A cold access therefore takes three faults at most.

use super::KernelState;
use super::error::PageFaultError;
use super::memory::{PAGE_SIZE, PageEntry, PhysAddr, VirtAddr};
use super::paging::{Access, Mapping, PF_PRESENT, PF_USER, Vm};
use super::task::{TaskId, Tcb};
use super::trace::{TraceCategory, Tracer};

/// Faults one access may take before it is declared unresolvable
pub const MAX_FAULTS_PER_ACCESS: usize = 3;

/// What one handler invocation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStep {
    /// Case 1: page table allocated and installed
    TableInstalled { table: PhysAddr },
    /// Case 2: page loaded from the backing sector
    PageLoaded { frame: PhysAddr, sector: u32 },
    /// Case 3: present entry re-granted
    Remapped { frame: PhysAddr },
}

impl Vm {
    /// Resolve the fault recorded in `tcb`
    pub fn handle_page_fault(&mut self, tcb: &mut Tcb, tracer: &mut Tracer) -> Result<FaultStep, PageFaultError> {
        tcb.accounting.page_fault_count += 1;
        self.stats.page_faults += 1;

        let task = tcb.id;
        let addr = tcb.fault_addr;
        let code = tcb.error_code;
        let user = code & PF_USER != 0;
        let directory = tcb
            .page_directory
            .ok_or(PageFaultError::Unresolved { task, addr })?;

        tracer.trace(TraceCategory::PageFault, "fault", Some(task), || {
            format!("at {} error {:#05b}", addr, code)
        });

        let Some(table) = self.table_for(directory, addr) else {
            // Tables are never evicted
            let table = self.allocate_frame(true, tracer)?;
            self.insert_table(directory, addr, table, user);
            self.stats.tables_installed += 1;
            tracer.trace(TraceCategory::PageFault, "table", Some(task), || {
                format!("directory[{}] = {}", addr.directory_index(), table)
            });
            return Ok(FaultStep::TableInstalled { table });
        };

        if user {
            self.grant_table(directory, addr, table);
        }

        let entry = self
            .memory
            .entry(table, addr.table_index())
            .unwrap_or(PageEntry::EMPTY);

        if !entry.is_present() {
            return self.load_page(tcb, directory, table, tracer);
        }

        self.remap(task, directory, table, addr, code, entry, tracer)
    }

    /// Case 2: demand-load the page holding `tcb.fault_addr`
    fn load_page(
        &mut self,
        tcb: &Tcb,
        directory: PhysAddr,
        table: PhysAddr,
        tracer: &mut Tracer,
    ) -> Result<FaultStep, PageFaultError> {
        let task = tcb.id;
        let addr = tcb.fault_addr;
        let user = tcb.error_code & PF_USER != 0;
        let backing = tcb
            .backing
            .ok_or(PageFaultError::NoBackingStore { task, addr })?;

        let page = addr.page_base();
        let offset = page
            .0
            .checked_sub(backing.load_base.0)
            .ok_or(PageFaultError::OutsideImage { task, addr })?;
        let sector = backing.location + offset / self.sector_size as u32;

        let frame = self.allocate_frame(tcb.pinned, tracer)?;
        let count = self.sectors_per_page;
        let read = match self.memory.frame_bytes_mut(frame) {
            Some(bytes) => self.disk.read(sector, count, bytes),
            None => Ok(()),
        };
        if let Err(e) = read {
            self.release_frame(frame, tracer)?;
            return Err(e.into());
        }
        self.stats.disk_reads += 1;
        tracer.trace(TraceCategory::Disk, "read", Some(task), || {
            format!("sectors {}..{} into {}", sector, sector + count, frame)
        });

        self.map_present(table, page, frame, user);
        if let Some(id) = self.frames.frame_at(frame) {
            self.rmap[id.0] = Some(Mapping {
                task,
                directory,
                vaddr: page,
                sector: Some(sector),
            });
        }
        self.stats.pages_loaded += 1;

        tracer.trace(TraceCategory::PageFault, "load", Some(task), || {
            format!(
                "{} -> {} from sector {} ({}/{} used)",
                page,
                frame,
                sector,
                self.frames.used_count(),
                self.frames.capacity()
            )
        });
        Ok(FaultStep::PageLoaded { frame, sector })
    }

    /// Case 3: the entry is present, so this was a protection fault
    #[allow(clippy::too_many_arguments)]
    fn remap(
        &mut self,
        task: TaskId,
        directory: PhysAddr,
        table: PhysAddr,
        addr: VirtAddr,
        code: u32,
        entry: PageEntry,
        tracer: &mut Tracer,
    ) -> Result<FaultStep, PageFaultError> {
        let frame = entry.frame();
        let page = addr.page_base();
        let owned = self
            .frames
            .frame_at(frame)
            .and_then(|id| self.mapping(id))
            .is_some_and(|m| m.directory == directory && m.vaddr == page);

        if !owned || code & PF_PRESENT == 0 {
            return Err(PageFaultError::ProtectionViolation {
                task,
                addr,
                error_code: code,
            });
        }

        // Keep accessed/dirty history; only the permission bits change
        let user = code & PF_USER != 0;
        let flags = entry.0 & !PageEntry::present(frame, true).0;
        let granted = PageEntry::present(frame, user).with_flags(flags);
        self.memory.set_entry(table, addr.table_index(), granted);
        self.stats.remaps += 1;

        tracer.trace(TraceCategory::PageFault, "remap", Some(task), || {
            format!("{} -> {}", page, frame)
        });
        Ok(FaultStep::Remapped { frame })
    }

    /// Give user mode access through the directory entry for `addr`
    fn grant_table(&mut self, directory: PhysAddr, addr: VirtAddr, table: PhysAddr) {
        let index = addr.directory_index();
        let user = self
            .memory
            .entry(directory, index)
            .is_some_and(PageEntry::is_user);
        if !user && directory != self.kernel_directory() {
            self.insert_table(directory, addr, table, true);
        }
    }
}

impl KernelState {
    /// Translate for `task`, taking faults as needed
    pub(crate) fn translate_for(
        &mut self,
        task: TaskId,
        vaddr: VirtAddr,
        access: Access,
    ) -> Result<PhysAddr, PageFaultError> {
        let mut faults = 0;
        loop {
            let tcb = self
                .tasks
                .tcb_mut(task)
                .ok_or(PageFaultError::Unresolved { task, addr: vaddr })?;
            let directory = tcb
                .page_directory
                .ok_or(PageFaultError::Unresolved { task, addr: vaddr })?;

            match self.vm.translate(directory, vaddr, access) {
                Ok(paddr) => return Ok(paddr),
                Err(_) if faults == MAX_FAULTS_PER_ACCESS => {
                    return Err(PageFaultError::Unresolved { task, addr: vaddr });
                }
                Err(code) => {
                    faults += 1;
                    tcb.fault_addr = vaddr;
                    tcb.error_code = code;
                    self.vm.handle_page_fault(tcb, &mut self.tracer)?;
                }
            }
        }
    }

    /// Copy task memory into `buf`, page by page
    pub(crate) fn load(
        &mut self,
        task: TaskId,
        vaddr: VirtAddr,
        buf: &mut [u8],
        user: bool,
    ) -> Result<(), PageFaultError> {
        let access = Access { write: false, user };
        let mut done = 0;
        while done < buf.len() {
            let addr = vaddr.offset(done as u32);
            let chunk = (PAGE_SIZE - addr.page_offset()).min(buf.len() - done);
            let paddr = self.translate_for(task, addr, access)?;
            if !self.vm.memory.read(paddr, &mut buf[done..done + chunk]) {
                return Err(PageFaultError::Unbacked { task, addr });
            }
            done += chunk;
        }
        Ok(())
    }

    /// Copy `data` into task memory, page by page
    pub(crate) fn store(
        &mut self,
        task: TaskId,
        vaddr: VirtAddr,
        data: &[u8],
        user: bool,
    ) -> Result<(), PageFaultError> {
        let access = Access { write: true, user };
        let mut done = 0;
        while done < data.len() {
            let addr = vaddr.offset(done as u32);
            let chunk = (PAGE_SIZE - addr.page_offset()).min(data.len() - done);
            let paddr = self.translate_for(task, addr, access)?;
            if !self.vm.memory.write(paddr, &data[done..done + chunk]) {
                return Err(PageFaultError::Unbacked { task, addr });
            }
            done += chunk;
        }
        Ok(())
    }
}
