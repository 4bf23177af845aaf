//! Critical sections
//!
//! On hardware the kernel disables interrupts around every operation that
//! touches shared state. Here the only thing that can interleave with kernel
//! code is a task switch, so "interrupts disabled" is a nesting counter with
//! an RAII guard. The dispatcher refuses to switch tasks while the counter
//! is non-zero.

use std::cell::Cell;

/// Per-CPU interrupt flag, modelled as a nesting depth
#[derive(Debug, Default)]
pub struct InterruptState {
    depth: Cell<u32>,
}

impl InterruptState {
    pub const fn new() -> Self {
        Self {
            depth: Cell::new(0),
        }
    }

    /// Enter a critical section. Nesting is allowed.
    pub fn disable(&self) -> CriticalSection<'_> {
        self.depth.set(self.depth.get() + 1);
        CriticalSection { state: self }
    }

    /// True when no critical section is open
    pub fn enabled(&self) -> bool {
        self.depth.get() == 0
    }

    pub fn depth(&self) -> u32 {
        self.depth.get()
    }
}

/// Guard for an open critical section; leaving scope re-enables switching
#[derive(Debug)]
pub struct CriticalSection<'a> {
    state: &'a InterruptState,
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        let depth = self.state.depth.get();
        debug_assert!(depth > 0, "critical section underflow");
        self.state.depth.set(depth - 1);
    }
}
