//! Instrumentation and Tracing
//!
//! Event tracing and counters for the scheduler and the pager.
//!
//! Design:
//! - Events carry a sequence number instead of a wall-clock timestamp so
//!   traces are deterministic
//! - Ring buffer of recent events (bounded memory)
//! - Counters are always maintained; events only when tracing is enabled

use super::task::TaskId;
use serde::Serialize;
use std::collections::VecDeque;

/// Default number of events kept
pub const TRACE_BUFFER_SIZE: usize = 1000;

/// Trace event categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TraceCategory {
    /// Dispatch, unlink, exit
    Scheduler,
    /// Block and unblock on wait queues
    Sync,
    /// Frame allocation, eviction, page-table edits
    Memory,
    /// Page fault handler steps
    PageFault,
    /// Block device transfers
    Disk,
}

impl std::fmt::Display for TraceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceCategory::Scheduler => write!(f, "SCHED"),
            TraceCategory::Sync => write!(f, "SYNC"),
            TraceCategory::Memory => write!(f, "MEMORY"),
            TraceCategory::PageFault => write!(f, "FAULT"),
            TraceCategory::Disk => write!(f, "DISK"),
        }
    }
}

/// A single trace event
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    /// Position in the global event sequence
    pub seq: u64,
    pub category: TraceCategory,
    pub name: &'static str,
    pub detail: Option<String>,
    /// Task the event concerns
    pub task: Option<TaskId>,
}

impl std::fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:<6} {:<6} {}", self.seq, self.category, self.name)?;
        if let Some(task) = self.task {
            write!(f, " [{}]", task)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, " {}", detail)?;
        }
        Ok(())
    }
}

/// Scheduler counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    /// First dispatches (entry point calls)
    pub cold_starts: u64,
    /// Steady-state dispatches (context restores)
    pub resumes: u64,
    /// Tasks removed from the ready list
    pub unlinks: u64,
    pub blocks: u64,
    pub unblocks: u64,
    pub exits: u64,
}

impl SchedulerStats {
    pub fn dispatches(&self) -> u64 {
        self.cold_starts + self.resumes
    }
}

/// The tracer
#[derive(Debug)]
pub struct Tracer {
    enabled: bool,
    /// Category filter (None = all)
    filter: Option<Vec<TraceCategory>>,
    capacity: usize,
    events: VecDeque<TraceEvent>,
    next_seq: u64,
    pub scheduler: SchedulerStats,
}

impl Tracer {
    pub fn new() -> Self {
        Self::with_capacity(TRACE_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            enabled: false,
            filter: None,
            capacity: capacity.max(1),
            events: VecDeque::with_capacity(capacity.max(1)),
            next_seq: 0,
            scheduler: SchedulerStats::default(),
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Set category filter (None = trace all)
    pub fn set_filter(&mut self, categories: Option<Vec<TraceCategory>>) {
        self.filter = categories;
    }

    /// Check if category should be traced
    pub fn should_trace(&self, category: TraceCategory) -> bool {
        if !self.enabled {
            return false;
        }
        match &self.filter {
            None => true,
            Some(cats) => cats.contains(&category),
        }
    }

    /// Record an event; `detail` is only built when the event is kept
    pub fn trace(
        &mut self,
        category: TraceCategory,
        name: &'static str,
        task: Option<TaskId>,
        detail: impl FnOnce() -> String,
    ) {
        if !self.should_trace(category) {
            return;
        }

        let detail = detail();
        let event = TraceEvent {
            seq: self.next_seq,
            category,
            name,
            detail: (!detail.is_empty()).then_some(detail),
            task,
        };
        self.next_seq += 1;

        // Maintain ring buffer size
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Event with no detail
    pub fn trace_instant(&mut self, category: TraceCategory, name: &'static str, task: Option<TaskId>) {
        self.trace(category, name, task, String::new);
    }

    pub fn events(&self) -> &VecDeque<TraceEvent> {
        &self.events
    }

    pub fn events_by_category(&self, category: TraceCategory) -> Vec<&TraceEvent> {
        self.events
            .iter()
            .filter(|e| e.category == category)
            .collect()
    }

    pub fn events_by_task(&self, task: TaskId) -> Vec<&TraceEvent> {
        self.events.iter().filter(|e| e.task == Some(task)).collect()
    }

    /// Count of kept events named `name`
    pub fn count(&self, name: &str) -> usize {
        self.events.iter().filter(|e| e.name == name).count()
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracer_disabled_by_default() {
        let mut tracer = Tracer::new();
        assert!(!tracer.is_enabled());

        tracer.trace_instant(TraceCategory::Scheduler, "dispatch", None);
        assert!(tracer.events().is_empty());
    }

    #[test]
    fn test_tracer_enable_disable() {
        let mut tracer = Tracer::new();
        tracer.enable();
        assert!(tracer.is_enabled());
        tracer.disable();
        assert!(!tracer.is_enabled());
    }

    #[test]
    fn test_detail_not_built_when_disabled() {
        let mut tracer = Tracer::new();
        tracer.trace(TraceCategory::Memory, "alloc", None, || {
            panic!("detail built while disabled")
        });
    }

    #[test]
    fn test_events_are_sequenced() {
        let mut tracer = Tracer::new();
        tracer.enable();
        tracer.trace_instant(TraceCategory::Scheduler, "a", None);
        tracer.trace(TraceCategory::Memory, "b", Some(TaskId(2)), || "frame 3".into());

        let events: Vec<_> = tracer.events().iter().collect();
        assert_eq!(events[0].seq, 0);
        assert_eq!(events[1].seq, 1);
        assert_eq!(events[1].detail.as_deref(), Some("frame 3"));
        assert_eq!(events[1].task, Some(TaskId(2)));
    }

    #[test]
    fn test_ring_buffer_bounded() {
        let mut tracer = Tracer::with_capacity(3);
        tracer.enable();
        for _ in 0..5 {
            tracer.trace_instant(TraceCategory::Disk, "read", None);
        }

        assert_eq!(tracer.events().len(), 3);
        // Oldest events dropped
        assert_eq!(tracer.events().front().map(|e| e.seq), Some(2));
    }

    #[test]
    fn test_category_filter() {
        let mut tracer = Tracer::new();
        tracer.enable();
        tracer.set_filter(Some(vec![TraceCategory::PageFault]));

        tracer.trace_instant(TraceCategory::Scheduler, "dispatch", None);
        tracer.trace_instant(TraceCategory::PageFault, "table", None);

        assert_eq!(tracer.events().len(), 1);
        assert_eq!(tracer.events_by_category(TraceCategory::PageFault).len(), 1);
    }

    #[test]
    fn test_event_display() {
        let mut tracer = Tracer::new();
        tracer.enable();
        tracer.trace(TraceCategory::PageFault, "load", Some(TaskId(1)), || {
            "sector 9".into()
        });
        let line = tracer.events()[0].to_string();
        assert!(line.contains("FAULT"));
        assert!(line.contains("Task(1)"));
        assert!(line.contains("sector 9"));
    }
}
