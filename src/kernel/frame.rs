//! Page frame allocator
//!
//! A fixed pool of frame descriptors split between two circular lists,
//! free and used. The lists always partition the pool.
//!
//! Allocation pops the head of the free list and appends the frame to the
//! tail of the used list. When the free list is empty a victim is evicted
//! first: the used list is scanned from its head (the position just past
//! the last eviction), skipping pinned frames. The head then moves past the
//! victim, so eviction is round-robin in allocation order.
//!
//! This module only does bookkeeping. Zeroing the frame and clearing the
//! page-table entry that still points at an evicted frame is the pager's
//! job (see `paging.rs`).

use super::error::FrameError;
use super::memory::{PAGE_SIZE, PhysAddr};
use super::ring::{Linked, Links, Ring};
use serde::Serialize;

/// Stable index of a frame in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FrameId(pub usize);

/// Which list a frame is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameList {
    Free,
    Used,
}

/// One physical frame
#[derive(Debug, Clone)]
pub struct FrameDescriptor {
    pub address: PhysAddr,
    pub index: FrameId,
    /// Excluded from eviction
    pub pinned: bool,
    list: FrameList,
    links: Links,
}

impl FrameDescriptor {
    pub fn list(&self) -> FrameList {
        self.list
    }
}

impl Linked for FrameDescriptor {
    fn links(&self) -> &Links {
        &self.links
    }
    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }
}

/// Result of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub frame: FrameId,
    pub address: PhysAddr,
    /// Set when the free list was empty and this frame was reclaimed.
    /// Its old contents are still in memory and its old mapping is stale.
    pub evicted: bool,
}

#[derive(Debug)]
pub struct FrameAllocator {
    frames: Vec<FrameDescriptor>,
    free: Ring,
    used: Ring,
}

impl FrameAllocator {
    /// Build the pool: `count` frames starting at `base`, all free
    pub fn new(base: PhysAddr, count: usize) -> Self {
        let mut frames: Vec<FrameDescriptor> = (0..count)
            .map(|i| FrameDescriptor {
                address: PhysAddr(base.0 + (i * PAGE_SIZE) as u32),
                index: FrameId(i),
                pinned: false,
                list: FrameList::Free,
                links: Links::detached(i),
            })
            .collect();

        let mut free = Ring::new();
        for i in 0..count {
            free.push_back(&mut frames, i);
        }

        Self {
            frames,
            free,
            used: Ring::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn used_count(&self) -> usize {
        self.used.len()
    }

    pub fn descriptor(&self, frame: FrameId) -> &FrameDescriptor {
        &self.frames[frame.0]
    }

    pub fn descriptors(&self) -> &[FrameDescriptor] {
        &self.frames
    }

    /// Frame whose first byte is `address`
    pub fn frame_at(&self, address: PhysAddr) -> Option<FrameId> {
        let base = self.frames.first()?.address.0;
        if address.0 < base || !address.is_page_aligned() {
            return None;
        }
        let index = ((address.0 - base) as usize) / PAGE_SIZE;
        (index < self.frames.len()).then_some(FrameId(index))
    }

    /// Free list in order, head first
    pub fn free_list(&self) -> Vec<FrameId> {
        self.free.iter(&self.frames).map(FrameId).collect()
    }

    /// Used list in order, starting at the eviction cursor
    pub fn used_list(&self) -> Vec<FrameId> {
        self.used.iter(&self.frames).map(FrameId).collect()
    }

    /// Take a frame off the free list, evicting one first if it is empty
    pub fn allocate(&mut self, pinned: bool) -> Result<Allocation, FrameError> {
        let evicted = if self.free.is_empty() {
            self.evict()?;
            true
        } else {
            false
        };

        let index = self
            .free
            .pop_front(&mut self.frames)
            .ok_or(FrameError::AllFramesPinned {
                frames: self.frames.len(),
            })?;
        self.used.push_back(&mut self.frames, index);

        let frame = &mut self.frames[index];
        frame.list = FrameList::Used;
        frame.pinned = pinned;

        Ok(Allocation {
            frame: frame.index,
            address: frame.address,
            evicted,
        })
    }

    /// Move one unpinned frame from used to free and return it
    ///
    /// The victim goes to the head of the free list so the next allocation
    /// takes it.
    pub fn evict(&mut self) -> Result<FrameId, FrameError> {
        let victim = self
            .used
            .iter(&self.frames)
            .find(|&i| !self.frames[i].pinned)
            .ok_or(FrameError::AllFramesPinned {
                frames: self.frames.len(),
            })?;

        let cursor = self.frames[victim].links.next;
        self.used.unlink(&mut self.frames, victim);
        if !self.used.is_empty() {
            self.used.set_head(cursor);
        }

        self.free.push_back(&mut self.frames, victim);
        self.free.set_head(victim);

        let frame = &mut self.frames[victim];
        frame.list = FrameList::Free;
        frame.pinned = false;
        Ok(frame.index)
    }

    /// Return a used frame to the free list
    pub fn release(&mut self, frame: FrameId) -> Result<(), FrameError> {
        let index = frame.0;
        if index >= self.frames.len() || self.frames[index].list != FrameList::Used {
            return Err(FrameError::NotInUse(frame));
        }

        self.used.unlink(&mut self.frames, index);
        self.free.push_back(&mut self.frames, index);

        let desc = &mut self.frames[index];
        desc.list = FrameList::Free;
        desc.pinned = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: PhysAddr = PhysAddr(0x10_0000);

    fn assert_partitioned(alloc: &FrameAllocator) {
        assert_eq!(alloc.free_count() + alloc.used_count(), alloc.capacity());
        let mut seen: Vec<FrameId> = alloc.free_list();
        seen.extend(alloc.used_list());
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), alloc.capacity());
    }

    #[test]
    fn test_new_pool_all_free() {
        let alloc = FrameAllocator::new(BASE, 4);
        assert_eq!(alloc.free_count(), 4);
        assert_eq!(alloc.used_count(), 0);
        assert_eq!(alloc.descriptor(FrameId(2)).address, PhysAddr(0x10_2000));
        assert_partitioned(&alloc);
    }

    #[test]
    fn test_allocate_in_address_order() {
        let mut alloc = FrameAllocator::new(BASE, 3);
        let a = alloc.allocate(false).unwrap();
        let b = alloc.allocate(true).unwrap();

        assert_eq!(a.address, PhysAddr(0x10_0000));
        assert_eq!(b.address, PhysAddr(0x10_1000));
        assert!(!a.evicted);
        assert!(alloc.descriptor(b.frame).pinned);
        assert_partitioned(&alloc);
    }

    #[test]
    fn test_full_pool_evicts() {
        let mut alloc = FrameAllocator::new(BASE, 2);
        alloc.allocate(false).unwrap();
        alloc.allocate(false).unwrap();

        let c = alloc.allocate(false).unwrap();
        assert!(c.evicted);
        // Oldest allocation is reclaimed first
        assert_eq!(c.frame, FrameId(0));
        assert_partitioned(&alloc);
    }

    #[test]
    fn test_eviction_is_round_robin() {
        let mut alloc = FrameAllocator::new(BASE, 3);
        for _ in 0..3 {
            alloc.allocate(false).unwrap();
        }

        let victims: Vec<FrameId> = (0..6).map(|_| alloc.allocate(false).unwrap().frame).collect();
        assert_eq!(
            victims,
            vec![FrameId(0), FrameId(1), FrameId(2), FrameId(0), FrameId(1), FrameId(2)]
        );
    }

    #[test]
    fn test_eviction_skips_pinned() {
        let mut alloc = FrameAllocator::new(BASE, 3);
        alloc.allocate(true).unwrap();
        alloc.allocate(false).unwrap();
        alloc.allocate(true).unwrap();

        for _ in 0..4 {
            let a = alloc.allocate(false).unwrap();
            assert_eq!(a.frame, FrameId(1));
        }
        assert!(alloc.descriptor(FrameId(0)).pinned);
        assert!(alloc.descriptor(FrameId(2)).pinned);
    }

    #[test]
    fn test_all_pinned_is_an_error() {
        let mut alloc = FrameAllocator::new(BASE, 2);
        alloc.allocate(true).unwrap();
        alloc.allocate(true).unwrap();

        assert_eq!(
            alloc.allocate(false),
            Err(FrameError::AllFramesPinned { frames: 2 })
        );
        // Nothing moved
        assert_eq!(alloc.used_count(), 2);
        assert_partitioned(&alloc);
    }

    #[test]
    fn test_release_returns_frame() {
        let mut alloc = FrameAllocator::new(BASE, 2);
        let a = alloc.allocate(true).unwrap();
        alloc.release(a.frame).unwrap();

        assert_eq!(alloc.free_count(), 2);
        assert!(!alloc.descriptor(a.frame).pinned);
        assert_eq!(alloc.release(a.frame), Err(FrameError::NotInUse(a.frame)));
        assert_partitioned(&alloc);
    }

    #[test]
    fn test_single_frame_pool() {
        let mut alloc = FrameAllocator::new(BASE, 1);
        let a = alloc.allocate(false).unwrap();
        let b = alloc.allocate(false).unwrap();
        assert_eq!(a.frame, b.frame);
        assert!(b.evicted);
        assert_partitioned(&alloc);
    }

    #[test]
    fn test_frame_at() {
        let alloc = FrameAllocator::new(BASE, 4);
        assert_eq!(alloc.frame_at(PhysAddr(0x10_3000)), Some(FrameId(3)));
        assert_eq!(alloc.frame_at(PhysAddr(0x10_4000)), None);
        assert_eq!(alloc.frame_at(PhysAddr(0x0f_f000)), None);
        assert_eq!(alloc.frame_at(PhysAddr(0x10_0010)), None);
    }
}
