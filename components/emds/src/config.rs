//! Compile-time capacities and run-time tuning.

/// Candidates kept per partition while scanning; older ones are dropped.
pub const MAX_CANDIDATES: usize = 4;

/// Entries that can be registered at run time with `Emds::entry_add`.
pub const MAX_DYNAMIC_ENTRIES: usize = 16;

/// Staging buffer of the streaming writer. Every supported write block size
/// has to divide it.
pub const CHUNK_SIZE: usize = 16;

/// Bytes programmed per word on NOR flash, the unit of the time estimate.
pub const WORD_SIZE: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Rejected metadata slots tolerated before a partition scan stops.
    pub scan_fail_tolerance: usize,
    /// Fixed cost of a store: critical section entry, metadata write.
    pub flash_time_base_overhead_us: u32,
    /// Programming time of one flash word.
    pub flash_time_write_one_word_us: u32,
    /// Packing and CRC time spent per chunk.
    pub flash_time_chunk_overhead_us: u32,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            scan_fail_tolerance: 8,
            flash_time_base_overhead_us: 500,
            flash_time_write_one_word_us: 41,
            flash_time_chunk_overhead_us: 4,
        }
    }

    pub const fn scan_fail_tolerance(mut self, tolerance: usize) -> Self {
        self.scan_fail_tolerance = tolerance;
        self
    }

    pub const fn flash_timing(mut self, base_us: u32, word_us: u32, chunk_us: u32) -> Self {
        self.flash_time_base_overhead_us = base_us;
        self.flash_time_write_one_word_us = word_us;
        self.flash_time_chunk_overhead_us = chunk_us;
        self
    }

    /// Worst-case duration of a store of `size` bytes, in microseconds.
    pub const fn store_time_us(&self, size: usize) -> u32 {
        let words = size.div_ceil(WORD_SIZE) as u32;
        let chunks = size.div_ceil(CHUNK_SIZE) as u32;
        self.flash_time_base_overhead_us
            + words * self.flash_time_write_one_word_us
            + chunks * self.flash_time_chunk_overhead_us
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
