//! Index-linked circular lists
//!
//! The ready list and the two frame lists are circular doubly-linked lists
//! threaded through fixed tables (TCBs, frame descriptors). Nodes are named
//! by their slot index; each node stores its own `next`/`prev` links.
//!
//! A node that is unlinked keeps its stale links. The scheduler relies on
//! this: after unlinking the current task it still follows `current.next`
//! to find the successor.

/// Link pair stored inside every list node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Links {
    pub next: usize,
    pub prev: usize,
}

impl Links {
    /// Links of a node that forms a ring on its own
    pub const fn detached(index: usize) -> Self {
        Self {
            next: index,
            prev: index,
        }
    }
}

/// A table entry that can sit on a [`Ring`]
pub trait Linked {
    fn links(&self) -> &Links;
    fn links_mut(&mut self) -> &mut Links;
}

/// Head and length of one circular list over a node table
#[derive(Debug, Clone, Default)]
pub struct Ring {
    head: Option<usize>,
    len: usize,
}

impl Ring {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    pub fn head(&self) -> Option<usize> {
        self.head
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Move the head to another member of the ring
    pub fn set_head(&mut self, index: usize) {
        debug_assert!(self.len > 0, "set_head on an empty ring");
        self.head = Some(index);
    }

    /// Append `index` just before the head (the tail position)
    pub fn push_back<T: Linked>(&mut self, nodes: &mut [T], index: usize) {
        match self.head {
            None => {
                *nodes[index].links_mut() = Links::detached(index);
                self.head = Some(index);
                self.len = 1;
            }
            Some(head) => {
                let tail = nodes[head].links().prev;
                self.splice_between(nodes, tail, head, index);
            }
        }
    }

    /// Insert `index` immediately after `anchor`, which must be a member
    pub fn insert_after<T: Linked>(&mut self, nodes: &mut [T], anchor: usize, index: usize) {
        if self.head.is_none() {
            self.push_back(nodes, index);
            return;
        }
        let next = nodes[anchor].links().next;
        self.splice_between(nodes, anchor, next, index);
    }

    fn splice_between<T: Linked>(&mut self, nodes: &mut [T], prev: usize, next: usize, index: usize) {
        *nodes[index].links_mut() = Links { next, prev };
        nodes[prev].links_mut().next = index;
        nodes[next].links_mut().prev = index;
        self.len += 1;
    }

    /// Splice the neighbours of `index` together. `index` keeps its links.
    pub fn unlink<T: Linked>(&mut self, nodes: &mut [T], index: usize) {
        debug_assert!(self.len > 0, "unlink from an empty ring");
        let Links { next, prev } = *nodes[index].links();
        nodes[prev].links_mut().next = next;
        nodes[next].links_mut().prev = prev;
        self.len -= 1;

        if self.len == 0 {
            self.head = None;
        } else if self.head == Some(index) {
            self.head = Some(next);
        }
    }

    /// Remove and return the head
    pub fn pop_front<T: Linked>(&mut self, nodes: &mut [T]) -> Option<usize> {
        let head = self.head?;
        self.unlink(nodes, head);
        Some(head)
    }

    /// Walk the ring once, starting at the head
    pub fn iter<'a, T: Linked>(&self, nodes: &'a [T]) -> RingIter<'a, T> {
        RingIter {
            nodes,
            next: self.head,
            remaining: self.len,
        }
    }

    pub fn contains<T: Linked>(&self, nodes: &[T], index: usize) -> bool {
        self.iter(nodes).any(|i| i == index)
    }
}

/// Iterator over the members of a [`Ring`]
pub struct RingIter<'a, T> {
    nodes: &'a [T],
    next: Option<usize>,
    remaining: usize,
}

impl<T: Linked> Iterator for RingIter<'_, T> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.next?;
        self.remaining -= 1;
        self.next = Some(self.nodes[current].links().next);
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}
