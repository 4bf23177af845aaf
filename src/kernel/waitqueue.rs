//! Wait queues
//!
//! A bounded FIFO of blocked tasks owned by one synchronization object.
//! Capacity is the size of the task table, so overflow means a task was
//! queued twice.

use super::error::WaitQueueError;
use super::task::TaskId;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct WaitQueue {
    waiters: VecDeque<TaskId>,
    capacity: usize,
}

impl WaitQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            waiters: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append at the tail
    pub fn push(&mut self, task: TaskId) -> Result<(), WaitQueueError> {
        if self.waiters.len() >= self.capacity {
            return Err(WaitQueueError::Full {
                capacity: self.capacity,
            });
        }
        self.waiters.push_back(task);
        Ok(())
    }

    /// Remove the head; later arrivals move up
    pub fn pop(&mut self) -> Option<TaskId> {
        self.waiters.pop_front()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.waiters.iter().copied()
    }
}
