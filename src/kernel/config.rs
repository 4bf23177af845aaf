//! Kernel configuration
//!
//! Every field has a default matching the classic layout: 47 pageable
//! frames starting at 1 MiB, 512-byte sectors, processes loaded at 16 MiB.
//! A config can be loaded from JSON; missing fields take their defaults.

use super::error::ConfigError;
use super::memory::PAGE_SIZE;
use serde::{Deserialize, Serialize};

/// Frames pinned at boot: the kernel page directory and the common map table
pub const BOOT_FRAMES: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Number of frames in the simulated physical memory window
    pub pageable_frames: usize,
    /// Physical address of the first pageable frame
    pub mem_start: u32,
    /// Block device sector size in bytes
    pub sector_size: usize,
    /// Physical address of the console page
    pub video_address: u32,
    /// End of identity-mapped low memory
    pub low_memory_end: u32,
    /// Virtual address processes are linked to run at
    pub process_load_base: u32,
    /// Lowest user stack top
    pub stack_min: u32,
    /// Highest kernel stack top
    pub stack_max: u32,
    pub stack_size: u32,
    /// Descriptor slots in each task's file table
    pub open_files: usize,
    /// Start with the tracer enabled
    pub trace: bool,
    /// Events kept by the tracer
    pub trace_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            pageable_frames: 47,
            mem_start: 0x0010_0000,
            sector_size: 512,
            video_address: 0x000b_8000,
            low_memory_end: 640 * 1024,
            process_load_base: 0x0100_0000,
            stack_min: 0x0001_0000,
            stack_max: 0x0002_0000,
            stack_size: 0x1000,
            open_files: 16,
            trace: false,
            trace_capacity: 1000,
        }
    }
}

impl KernelConfig {
    /// Parse and validate a JSON config
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: KernelConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Same config with a different frame count
    pub fn with_frames(mut self, frames: usize) -> Self {
        self.pageable_frames = frames;
        self
    }

    /// End of the pageable window (exclusive)
    pub fn max_physical_memory(&self) -> u64 {
        self.mem_start as u64 + (self.pageable_frames * PAGE_SIZE) as u64
    }

    pub fn sectors_per_page(&self) -> u32 {
        (PAGE_SIZE / self.sector_size) as u32
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pageable_frames < BOOT_FRAMES {
            return Err(ConfigError::Invalid(format!(
                "pageable_frames must be at least {} (kernel directory and common map)",
                BOOT_FRAMES
            )));
        }
        if self.sector_size == 0 || PAGE_SIZE % self.sector_size != 0 {
            return Err(ConfigError::Invalid(format!(
                "sector size {} does not divide the page size",
                self.sector_size
            )));
        }
        if self.mem_start as usize % PAGE_SIZE != 0 {
            return Err(ConfigError::Invalid("mem_start is not page aligned".into()));
        }
        if self.mem_start < self.low_memory_end {
            return Err(ConfigError::Invalid(
                "pageable window overlaps low memory".into(),
            ));
        }
        let video = self.video_address as u64;
        if video >= self.mem_start as u64 && video < self.max_physical_memory() {
            return Err(ConfigError::Invalid(
                "video page lies inside the pageable window".into(),
            ));
        }
        // The common map is a single page table covering the first 4 MiB
        if self.max_physical_memory() > (1u64 << 22) {
            return Err(ConfigError::Invalid(
                "pageable window must end below 4 MiB".into(),
            ));
        }
        if (self.process_load_base as u64) < (1u64 << 22) {
            return Err(ConfigError::Invalid(
                "process_load_base collides with the common map".into(),
            ));
        }
        if self.stack_size == 0 || self.stack_max <= self.stack_min {
            return Err(ConfigError::Invalid("bad stack layout".into()));
        }
        if self.trace_capacity == 0 {
            return Err(ConfigError::Invalid("trace_capacity must be at least 1".into()));
        }
        Ok(())
    }
}
