#![no_std]

use core::ops::Range;

pub struct MemoryRegions {
    pub firmware: Range<usize>,
    /// Reserved for emergency data storage, split into two partitions.
    pub emds: Range<usize>,
}

impl MemoryRegions {
    /// 1 MiB NOR flash, 4 KiB pages.
    pub const NRF52: Self = Self::split(0x1_000..0x100_000, 0xF8_000);

    /// 1524 KiB RRAM, written in 16 byte blocks.
    pub const NRF54L: Self = Self::split(0x0..0x17D_000, 0x175_000);

    pub const fn split(region: Range<usize>, boundary: usize) -> Self {
        Self {
            firmware: region.start..boundary,
            emds: boundary..region.end,
        }
    }

    /// The two EMDS partitions, as flash addresses.
    pub const fn emds_partitions(&self) -> [Range<u32>; 2] {
        let start = self.emds.start as u32;
        let end = self.emds.end as u32;
        let middle = start + (end - start) / 2;
        [start..middle, middle..end]
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryRegions;

    fn check(regions: &MemoryRegions, page: u32) {
        let [first, second] = regions.emds_partitions();
        assert!(regions.firmware.end <= regions.emds.start);
        assert_eq!(first.end, second.start);
        assert_eq!(first.end - first.start, second.end - second.start);
        for partition in [first, second] {
            assert_eq!(partition.start % page, 0);
            assert_eq!(partition.end % page, 0);
        }
    }

    #[test]
    fn nrf52_partitions_are_page_aligned() {
        check(&MemoryRegions::NRF52, 4096);
    }

    #[test]
    fn nrf54l_partitions_are_block_aligned() {
        check(&MemoryRegions::NRF54L, 16);
    }
}
