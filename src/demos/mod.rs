//! Demo programs
//!
//! Small task sets that exercise the kernel call surface: counters,
//! mailbox traffic, barrier-stepped workers, the dining philosophers and
//! user processes that page through their images. The CLI and the
//! integration tests boot them through [`run`].

mod counters;
mod mailbox;
mod paging;
mod philosophers;
mod workers;

use crate::kernel::{
    DiskImageBuilder, Kernel, KernelConfig, KernelResult, KernelStats, RunReport,
};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

pub use paging::{PAGING_ARRAY_PAGES, PAGING_PROCESSES};

/// Output lines shared by every task of a demo
#[derive(Debug, Clone, Default)]
pub struct Transcript(Rc<RefCell<Vec<String>>>);

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: impl Into<String>) {
        self.0.borrow_mut().push(line.into());
    }

    pub fn lines(&self) -> Vec<String> {
        self.0.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demo {
    Counters,
    Mailbox,
    Workers,
    Philosophers,
    Paging,
}

impl Demo {
    pub const ALL: [Demo; 5] = [
        Demo::Counters,
        Demo::Mailbox,
        Demo::Workers,
        Demo::Philosophers,
        Demo::Paging,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Demo::Counters => "counters",
            Demo::Mailbox => "mailbox",
            Demo::Workers => "workers",
            Demo::Philosophers => "philosophers",
            Demo::Paging => "paging",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Demo::Counters => "threads counting and yielding in turn",
            Demo::Mailbox => "producer and consumer over a mailbox",
            Demo::Workers => "workers stepping through barrier rounds",
            Demo::Philosophers => "three philosophers sharing a lock and conditions",
            Demo::Paging => "processes walking arrays larger than their frames",
        }
    }

    /// Task slots the demo fills
    pub fn pool_size(self) -> usize {
        match self {
            Demo::Counters => counters::COUNTERS,
            Demo::Mailbox => 2,
            Demo::Workers => workers::WORKERS,
            Demo::Philosophers => philosophers::PHILOSOPHERS,
            Demo::Paging => PAGING_PROCESSES + 1,
        }
    }
}

impl fmt::Display for Demo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Demo {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Demo::ALL
            .into_iter()
            .find(|d| d.name() == s)
            .ok_or_else(|| {
                let names: Vec<_> = Demo::ALL.iter().map(|d| d.name()).collect();
                format!("unknown demo '{}' (expected one of: {})", s, names.join(", "))
            })
    }
}

/// A finished demo
pub struct DemoRun {
    pub report: RunReport,
    pub stats: KernelStats,
    pub transcript: Vec<String>,
    pub kernel: Kernel,
}

/// Boot a kernel, load `demo` into it and run until every task exits
pub fn run(demo: Demo, config: KernelConfig) -> KernelResult<DemoRun> {
    let transcript = Transcript::new();
    let kernel = boot(demo, config, &transcript)?;
    let report = kernel.run()?;
    Ok(DemoRun {
        report,
        stats: kernel.stats(),
        transcript: transcript.lines(),
        kernel,
    })
}

/// Boot a kernel with `demo`'s tasks spawned but not yet run
pub fn boot(demo: Demo, config: KernelConfig, transcript: &Transcript) -> KernelResult<Kernel> {
    let kernel = match demo {
        Demo::Paging => {
            let (disk, programs) = paging::disk_image(config.sector_size);
            let kernel = Kernel::boot(config, disk, demo.pool_size())?;
            paging::spawn(&kernel, &programs, transcript)?;
            kernel
        }
        _ => {
            let (disk, _) = DiskImageBuilder::new(config.sector_size).build();
            let kernel = Kernel::boot(config, disk, demo.pool_size())?;
            spawn_threads(demo, &kernel, transcript)?;
            kernel
        }
    };
    Ok(kernel)
}

fn spawn_threads(demo: Demo, kernel: &Kernel, transcript: &Transcript) -> KernelResult<()> {
    match demo {
        Demo::Counters => counters::spawn(kernel, transcript),
        Demo::Mailbox => mailbox::spawn(kernel, transcript),
        Demo::Workers => workers::spawn(kernel, transcript),
        Demo::Philosophers => philosophers::spawn(kernel, transcript),
        Demo::Paging => Ok(()),
    }
}
