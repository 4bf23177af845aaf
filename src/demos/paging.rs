//! Demand-paging traffic
//!
//! Each process image is a header page followed by a zeroed array of
//! [`PAGING_ARRAY_PAGES`] pages. A process stamps one word into every page
//! of its array, then walks the array again and checks what it wrote. The
//! arrays together do not fit in the default frame pool, so the second
//! pass reloads pages that were evicted and written back in between.

use super::Transcript;
use crate::kernel::{
    DiskImageBuilder, Kernel, KernelResult, MemoryDisk, PAGE_SIZE, ProcessImage, ProgramLocation,
    TaskState,
};

pub const PAGING_PROCESSES: usize = 3;
pub const PAGING_ARRAY_PAGES: usize = 16;

const MAGIC: u32 = 0xc00b_0005;

fn stamp(process: usize, page: usize) -> u32 {
    ((process as u32 + 1) << 16) | page as u32
}

/// One image per process, each with its array reserved behind the header
pub fn disk_image(sector_size: usize) -> (MemoryDisk, Vec<ProgramLocation>) {
    (0..PAGING_PROCESSES)
        .fold(DiskImageBuilder::new(sector_size), |builder, p| {
            let mut header = Vec::with_capacity(8);
            header.extend_from_slice(&MAGIC.to_ne_bytes());
            header.extend_from_slice(&(p as u32).to_ne_bytes());
            builder.program(&header, PAGING_ARRAY_PAGES)
        })
        .build()
}

pub fn spawn(kernel: &Kernel, programs: &[ProgramLocation], transcript: &Transcript) -> KernelResult<()> {
    let base = kernel.config().process_load_base;

    for (p, location) in programs.iter().enumerate() {
        let out = transcript.clone();
        kernel.spawn_process(&format!("pager-{}", p), ProcessImage::new(*location), move |cx| async move {
            if cx.read_u32(base) != MAGIC || cx.read_u32(base + 4) != p as u32 {
                out.push(format!("pager {}: bad image header", p));
                return;
            }

            let word = |page: usize| base + ((page + 1) * PAGE_SIZE) as u32;
            for page in 0..PAGING_ARRAY_PAGES {
                cx.write_u32(word(page), stamp(p, page));
                cx.yield_now().await;
            }

            let mut mismatches = 0;
            for page in 0..PAGING_ARRAY_PAGES {
                if cx.read_u32(word(page)) != stamp(p, page) {
                    mismatches += 1;
                }
                cx.yield_now().await;
            }
            out.push(format!(
                "pager {}: {} pages checked, {} mismatches",
                p, PAGING_ARRAY_PAGES, mismatches
            ));
        })?;
    }

    let out = transcript.clone();
    kernel.spawn_thread("monitor", move |cx| async move {
        let kernel = cx.kernel().clone();
        let exited = || {
            kernel.inspect(|s| {
                s.tasks
                    .tcbs()
                    .iter()
                    .filter(|t| t.id != cx.id() && t.state == TaskState::Exited)
                    .count()
            })
        };
        while exited() < PAGING_PROCESSES {
            cx.yield_now().await;
        }
        let stats = kernel.stats();
        out.push(format!(
            "pages used: [{}/{}], {} loads, {} evictions, {} write-backs",
            stats.frames_used,
            stats.frames_total,
            stats.vm.pages_loaded,
            stats.vm.evictions,
            stats.vm.write_backs
        ));
    })?;
    Ok(())
}
