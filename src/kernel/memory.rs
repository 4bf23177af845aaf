//! Physical memory and address arithmetic
//!
//! The machine has a small window of pageable physical memory:
//! `[mem_start, mem_start + frames * PAGE_SIZE)`. Everything the pager
//! manages lives in that window, including page directories and page
//! tables, which are ordinary frames holding 1024 32-bit entries.
//!
//! Storage is kept as words so page-table entries can be read in place;
//! byte views for disk transfers are produced with `bytemuck`.
//!
//! Virtual address layout (32-bit, two-level, 4 KiB pages):
//!
//! ```text
//!  31          22 21          12 11           0
//! +--------------+--------------+--------------+
//! |  dir index   | table index  |    offset    |
//! +--------------+--------------+--------------+
//! ```

use bytemuck::{Pod, Zeroable};
use serde::Serialize;
use std::fmt;

pub const PAGE_SIZE: usize = 4096;
/// Entries in one page directory or page table
pub const PAGE_N_ENTRIES: usize = PAGE_SIZE / std::mem::size_of::<u32>();
/// Bytes covered by one page table
pub const PTABLE_SPAN: u32 = (PAGE_SIZE * PAGE_N_ENTRIES) as u32;

pub const PAGE_DIRECTORY_BITS: u32 = 22;
pub const PAGE_TABLE_BITS: u32 = 12;
pub const PAGE_DIRECTORY_MASK: u32 = 0xffc0_0000;
pub const PAGE_TABLE_MASK: u32 = 0x003f_f000;
pub const PAGE_MASK: u32 = 0x0000_0fff;

// Page directory / page table entry bits
pub const PE_P: u32 = 1 << 0;
pub const PE_RW: u32 = 1 << 1;
pub const PE_US: u32 = 1 << 2;
pub const PE_PWT: u32 = 1 << 3;
pub const PE_PCD: u32 = 1 << 4;
pub const PE_A: u32 = 1 << 5;
pub const PE_D: u32 = 1 << 6;
pub const PE_BASE_ADDR_MASK: u32 = 0xffff_f000;

/// A physical address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PhysAddr(pub u32);

impl PhysAddr {
    pub fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p:{:#010x}", self.0)
    }
}

/// A virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Default)]
pub struct VirtAddr(pub u32);

impl VirtAddr {
    pub fn directory_index(self) -> usize {
        ((self.0 & PAGE_DIRECTORY_MASK) >> PAGE_DIRECTORY_BITS) as usize
    }

    pub fn table_index(self) -> usize {
        ((self.0 & PAGE_TABLE_MASK) >> PAGE_TABLE_BITS) as usize
    }

    pub fn page_offset(self) -> usize {
        (self.0 & PAGE_MASK) as usize
    }

    /// Address with the offset bits cleared
    pub fn page_base(self) -> VirtAddr {
        VirtAddr(self.0 & PE_BASE_ADDR_MASK)
    }

    pub fn offset(self, bytes: u32) -> VirtAddr {
        VirtAddr(self.0.wrapping_add(bytes))
    }

    /// Build an address from its directory and table indices
    pub fn from_indices(directory: usize, table: usize) -> VirtAddr {
        VirtAddr(((directory as u32) << PAGE_DIRECTORY_BITS) | ((table as u32) << PAGE_TABLE_BITS))
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v:{:#010x}", self.0)
    }
}

/// One page directory or page table entry
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct PageEntry(pub u32);

impl PageEntry {
    pub const EMPTY: PageEntry = PageEntry(0);

    /// Present, writable entry pointing at `frame`
    pub fn present(frame: PhysAddr, user: bool) -> Self {
        let mut access = PE_RW | PE_P;
        if user {
            access |= PE_US;
        }
        PageEntry((frame.0 & !PAGE_MASK) | access)
    }

    pub fn is_present(self) -> bool {
        self.0 & PE_P != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & PE_RW != 0
    }

    pub fn is_user(self) -> bool {
        self.0 & PE_US != 0
    }

    pub fn is_accessed(self) -> bool {
        self.0 & PE_A != 0
    }

    pub fn is_dirty(self) -> bool {
        self.0 & PE_D != 0
    }

    pub fn frame(self) -> PhysAddr {
        PhysAddr(self.0 & PE_BASE_ADDR_MASK)
    }

    pub fn with_flags(self, flags: u32) -> Self {
        PageEntry(self.0 | flags)
    }
}

/// The pageable physical memory window
#[derive(Debug)]
pub struct PhysicalMemory {
    base: u32,
    words: Vec<u32>,
}

impl PhysicalMemory {
    pub fn new(base: PhysAddr, frames: usize) -> Self {
        debug_assert!(base.is_page_aligned());
        Self {
            base: base.0,
            words: vec![0; frames * PAGE_N_ENTRIES],
        }
    }

    pub fn base(&self) -> PhysAddr {
        PhysAddr(self.base)
    }

    /// End of the window (exclusive)
    pub fn end(&self) -> u64 {
        self.base as u64 + (self.words.len() * 4) as u64
    }

    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr.0 >= self.base && (addr.0 as u64) < self.end()
    }

    fn frame_range(&self, frame: PhysAddr) -> Option<std::ops::Range<usize>> {
        if !self.contains(frame) || !frame.is_page_aligned() {
            return None;
        }
        let start = ((frame.0 - self.base) as usize) / 4;
        Some(start..start + PAGE_N_ENTRIES)
    }

    /// A frame as 1024 entries
    pub fn frame_words(&self, frame: PhysAddr) -> Option<&[u32]> {
        let range = self.frame_range(frame)?;
        Some(&self.words[range])
    }

    pub fn frame_words_mut(&mut self, frame: PhysAddr) -> Option<&mut [u32]> {
        let range = self.frame_range(frame)?;
        Some(&mut self.words[range])
    }

    /// A frame as raw bytes (little-endian word order)
    pub fn frame_bytes(&self, frame: PhysAddr) -> Option<&[u8]> {
        self.frame_words(frame).map(bytemuck::cast_slice)
    }

    pub fn frame_bytes_mut(&mut self, frame: PhysAddr) -> Option<&mut [u8]> {
        self.frame_words_mut(frame).map(bytemuck::cast_slice_mut)
    }

    pub fn zero_frame(&mut self, frame: PhysAddr) {
        if let Some(words) = self.frame_words_mut(frame) {
            words.fill(0);
        }
    }

    /// Read entry `index` of the table stored in `frame`
    pub fn entry(&self, frame: PhysAddr, index: usize) -> Option<PageEntry> {
        self.frame_words(frame)
            .and_then(|words| bytemuck::cast_slice::<u32, PageEntry>(words).get(index))
            .copied()
    }

    pub fn set_entry(&mut self, frame: PhysAddr, index: usize, entry: PageEntry) -> bool {
        match self.frame_words_mut(frame).and_then(|w| w.get_mut(index)) {
            Some(slot) => {
                *slot = entry.0;
                true
            }
            None => false,
        }
    }

    /// Copy bytes out of physical memory; `addr..addr+len` must stay in one frame
    pub fn read(&self, addr: PhysAddr, buf: &mut [u8]) -> bool {
        let frame = PhysAddr(addr.0 & PE_BASE_ADDR_MASK);
        let offset = (addr.0 & PAGE_MASK) as usize;
        match self.frame_bytes(frame) {
            Some(bytes) if offset + buf.len() <= PAGE_SIZE => {
                buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
                true
            }
            _ => false,
        }
    }

    /// Copy bytes into physical memory; `addr..addr+len` must stay in one frame
    pub fn write(&mut self, addr: PhysAddr, data: &[u8]) -> bool {
        let frame = PhysAddr(addr.0 & PE_BASE_ADDR_MASK);
        let offset = (addr.0 & PAGE_MASK) as usize;
        match self.frame_bytes_mut(frame) {
            Some(bytes) if offset + data.len() <= PAGE_SIZE => {
                bytes[offset..offset + data.len()].copy_from_slice(data);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_decomposition() {
        let addr = VirtAddr(0x0040_3abc);
        assert_eq!(addr.directory_index(), 1);
        assert_eq!(addr.table_index(), 3);
        assert_eq!(addr.page_offset(), 0xabc);
        assert_eq!(addr.page_base(), VirtAddr(0x0040_3000));
        assert_eq!(VirtAddr::from_indices(1, 3), VirtAddr(0x0040_3000));
    }

    #[test]
    fn test_top_of_address_space() {
        let addr = VirtAddr(0xffff_ffff);
        assert_eq!(addr.directory_index(), 1023);
        assert_eq!(addr.table_index(), 1023);
        assert_eq!(addr.page_offset(), 0xfff);
    }

    #[test]
    fn test_entry_bits() {
        let entry = PageEntry::present(PhysAddr(0x0010_2000), true);
        assert!(entry.is_present());
        assert!(entry.is_writable());
        assert!(entry.is_user());
        assert!(!entry.is_dirty());
        assert_eq!(entry.frame(), PhysAddr(0x0010_2000));

        let kernel = PageEntry::present(PhysAddr(0x0010_2000), false);
        assert!(!kernel.is_user());
        assert!(!PageEntry::EMPTY.is_present());
    }

    #[test]
    fn test_window_bounds() {
        let mem = PhysicalMemory::new(PhysAddr(0x10_0000), 2);
        assert!(mem.contains(PhysAddr(0x10_0000)));
        assert!(mem.contains(PhysAddr(0x10_1fff)));
        assert!(!mem.contains(PhysAddr(0x10_2000)));
        assert!(!mem.contains(PhysAddr(0xb_8000)));
        assert!(mem.frame_words(PhysAddr(0x10_0004)).is_none());
    }

    #[test]
    fn test_entries_and_bytes_share_storage() {
        let mut mem = PhysicalMemory::new(PhysAddr(0x10_0000), 1);
        let frame = PhysAddr(0x10_0000);
        mem.set_entry(frame, 1, PageEntry(0x1234_5678));

        let bytes = mem.frame_bytes(frame).unwrap();
        assert_eq!(&bytes[4..8], &0x1234_5678u32.to_ne_bytes());

        mem.zero_frame(frame);
        assert_eq!(mem.entry(frame, 1), Some(PageEntry::EMPTY));
    }

    #[test]
    fn test_read_write_within_frame() {
        let mut mem = PhysicalMemory::new(PhysAddr(0x10_0000), 1);
        assert!(mem.write(PhysAddr(0x10_0ffc), &[1, 2, 3, 4]));
        let mut buf = [0u8; 4];
        assert!(mem.read(PhysAddr(0x10_0ffc), &mut buf));
        assert_eq!(buf, [1, 2, 3, 4]);

        // Crossing the end of the frame is refused
        assert!(!mem.write(PhysAddr(0x10_0ffe), &[1, 2, 3, 4]));
    }
}
