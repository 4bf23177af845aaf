//! Block device interface and an in-memory disk
//!
//! The pager reads whole pages of sectors from the location a process was
//! loaded from, and writes dirty pages back to the same place on eviction.
//! There is no swap area.
//!
//! [`DiskImageBuilder`] lays program images out the way the boot-image tool
//! does: a boot sector first, then each program starting on its own sector,
//! padded to whole pages so demand loads never run off the end.

use super::error::DiskError;
use super::memory::PAGE_SIZE;

/// A sector-addressed storage device
pub trait BlockDevice {
    fn sector_size(&self) -> usize;

    /// Total number of sectors
    fn sectors(&self) -> u32;

    /// Read `count` sectors starting at `sector` into `dst`
    fn read(&mut self, sector: u32, count: u32, dst: &mut [u8]) -> Result<(), DiskError>;

    /// Write `count` sectors starting at `sector` from `src`
    fn write(&mut self, sector: u32, count: u32, src: &[u8]) -> Result<(), DiskError>;
}

/// RAM-backed block device
#[derive(Debug, Clone)]
pub struct MemoryDisk {
    sector_size: usize,
    data: Vec<u8>,
}

impl MemoryDisk {
    /// A zero-filled disk of `sectors` sectors
    pub fn new(sector_size: usize, sectors: u32) -> Self {
        Self {
            sector_size,
            data: vec![0; sector_size * sectors as usize],
        }
    }

    /// Wrap an existing image, padding it to a whole sector
    pub fn from_image(sector_size: usize, mut image: Vec<u8>) -> Self {
        let padded = image.len().div_ceil(sector_size) * sector_size;
        image.resize(padded, 0);
        Self {
            sector_size,
            data: image,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn span(&self, sector: u32, count: u32, len: usize) -> Result<std::ops::Range<usize>, DiskError> {
        let expected = count as usize * self.sector_size;
        if len != expected {
            return Err(DiskError::BadBuffer {
                expected,
                actual: len,
            });
        }
        let start = sector as usize * self.sector_size;
        let end = start + expected;
        if end > self.data.len() {
            return Err(DiskError::OutOfRange { sector, count });
        }
        Ok(start..end)
    }
}

impl BlockDevice for MemoryDisk {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sectors(&self) -> u32 {
        (self.data.len() / self.sector_size) as u32
    }

    fn read(&mut self, sector: u32, count: u32, dst: &mut [u8]) -> Result<(), DiskError> {
        let span = self.span(sector, count, dst.len())?;
        dst.copy_from_slice(&self.data[span]);
        Ok(())
    }

    fn write(&mut self, sector: u32, count: u32, src: &[u8]) -> Result<(), DiskError> {
        let span = self.span(sector, count, src.len())?;
        self.data[span].copy_from_slice(src);
        Ok(())
    }
}

/// Where a program landed on the disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramLocation {
    /// First sector of the image
    pub first_sector: u32,
    /// Sectors reserved for it, including padding and reserved pages
    pub sectors: u32,
}

/// Concatenates a boot sector and program images into one disk
#[derive(Debug)]
pub struct DiskImageBuilder {
    sector_size: usize,
    data: Vec<u8>,
    programs: Vec<ProgramLocation>,
}

impl DiskImageBuilder {
    pub fn new(sector_size: usize) -> Self {
        // Sector 0 is always the boot sector
        Self {
            sector_size,
            data: vec![0; sector_size],
            programs: Vec::new(),
        }
    }

    /// Contents of the boot sector (truncated to one sector)
    pub fn boot_sector(mut self, bytes: &[u8]) -> Self {
        let n = bytes.len().min(self.sector_size);
        self.data[..n].copy_from_slice(&bytes[..n]);
        self
    }

    /// Append a program, followed by `reserve_pages` zero pages for its
    /// data and stack
    pub fn program(mut self, image: &[u8], reserve_pages: usize) -> Self {
        let first_sector = (self.data.len() / self.sector_size) as u32;
        let pages = image.len().div_ceil(PAGE_SIZE) + reserve_pages;
        let bytes = pages.max(1) * PAGE_SIZE;

        let start = self.data.len();
        self.data.resize(start + bytes, 0);
        self.data[start..start + image.len()].copy_from_slice(image);

        self.programs.push(ProgramLocation {
            first_sector,
            sectors: (bytes / self.sector_size) as u32,
        });
        self
    }

    pub fn build(self) -> (MemoryDisk, Vec<ProgramLocation>) {
        (
            MemoryDisk::from_image(self.sector_size, self.data),
            self.programs,
        )
    }
}
