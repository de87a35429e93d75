//! Raw flash partitions.
//!
//! A [`Partition`] is a plain byte range of a [`FlashDevice`], addressed with
//! partition-relative offsets. The device itself is owned by the caller and
//! passed to every operation, so both partitions can live on the same chip.

use core::ops::Range;

use embedded_storage::nor_flash::{NorFlash, NorFlashErrorKind};

use crate::config::CHUNK_SIZE;
use crate::error::{Error, Result};
use crate::metadata::{METADATA_SIZE, SNAPSHOT_CRC_OFFSET, SNAPSHOT_CRC_SIZE};

/// How the memory technology accepts writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashCaps {
    /// NOR flash: bits can only be cleared, pages need an explicit erase.
    WordWrite,
    /// RRAM and similar: writes go through a write buffer that needs a
    /// commit when it is left partially filled; memory can be rewritten in
    /// place.
    BufferedCommit,
}

impl FlashCaps {
    pub const fn explicit_erase(self) -> bool {
        matches!(self, Self::WordWrite)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlashParameters {
    /// Alignment of everything EMDS places in flash.
    pub write_block_size: usize,
    pub erase_value: u8,
    pub caps: FlashCaps,
}

/// Flash driver as seen by EMDS.
pub trait FlashDevice: NorFlash {
    fn parameters(&self) -> FlashParameters;

    /// The device has been brought up and can be used.
    fn is_ready(&self) -> bool {
        true
    }

    /// A previous operation is still in progress.
    fn is_busy(&mut self) -> bool {
        false
    }

    /// Flushes a partially filled write buffer to the memory array.
    fn commit(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

const SCRATCH_SIZE: usize = 32;

fn wait_ready<F: FlashDevice>(flash: &mut F) {
    while flash.is_busy() {
        core::hint::spin_loop();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partition {
    offset: u32,
    size: u32,
    params: FlashParameters,
}

impl Partition {
    /// Validates `region` against the device and its parameters.
    pub fn open<F: FlashDevice>(flash: &F, region: Range<u32>) -> Result<Self> {
        if !flash.is_ready() {
            error!("flash device not ready");
            return Err(Error::DeviceNotFound);
        }
        let params = flash.parameters();
        let block = params.write_block_size;

        if region.start >= region.end || region.end as usize > flash.capacity() {
            error!("partition {:x}..{:x} outside of device", region.start, region.end);
            return Err(Error::InvalidConfig);
        }
        if block == 0
            || block % F::WRITE_SIZE != 0
            || block % F::READ_SIZE != 0
            || CHUNK_SIZE % block != 0
            || SCRATCH_SIZE % F::READ_SIZE != 0
        {
            error!("unsupported write block size {}", block);
            return Err(Error::InvalidConfig);
        }

        // the buffered store path programs the snapshot CRC on its own
        if params.caps == FlashCaps::BufferedCommit
            && (SNAPSHOT_CRC_OFFSET % F::WRITE_SIZE != 0 || SNAPSHOT_CRC_SIZE % F::WRITE_SIZE != 0)
        {
            error!("driver write size {} too coarse for buffered stores", F::WRITE_SIZE);
            return Err(Error::InvalidConfig);
        }

        let align = if params.caps.explicit_erase() {
            F::ERASE_SIZE
        } else {
            block
        };
        let size = region.end - region.start;
        if region.start as usize % align != 0 || size as usize % align != 0 {
            error!("partition {:x}+{:x} not aligned to {}", region.start, size, align);
            return Err(Error::InvalidConfig);
        }
        if (size as usize) < METADATA_SIZE + block {
            return Err(Error::InvalidConfig);
        }

        Ok(Self {
            offset: region.start,
            size,
            params,
        })
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn params(&self) -> FlashParameters {
        self.params
    }

    pub fn block_size(&self) -> u32 {
        self.params.write_block_size as u32
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        self.offset < other.offset + other.size && other.offset < self.offset + self.size
    }

    fn check_bounds(&self, off: u32, len: usize) -> Result<u32> {
        let end = (off as usize).checked_add(len);
        match end {
            Some(end) if end <= self.size as usize => Ok(self.offset + off),
            _ => Err(NorFlashErrorKind::OutOfBounds.into()),
        }
    }

    pub fn read<F: FlashDevice>(&self, flash: &mut F, off: u32, buf: &mut [u8]) -> Result<()> {
        let addr = self.check_bounds(off, buf.len())?;
        let granule = F::READ_SIZE as u32;
        if granule <= 1 || (addr % granule == 0 && buf.len() as u32 % granule == 0) {
            return flash.read(addr, buf).map_err(Error::flash);
        }

        // unaligned request, go through whole read units
        let end = addr + buf.len() as u32;
        let mut cursor = addr - addr % granule;
        let mut scratch = [0u8; SCRATCH_SIZE];
        while cursor < end {
            let span = core::cmp::min(SCRATCH_SIZE as u32, (end - cursor).div_ceil(granule) * granule);
            flash
                .read(cursor, &mut scratch[..span as usize])
                .map_err(Error::flash)?;
            let from = core::cmp::max(cursor, addr);
            let to = core::cmp::min(cursor + span, end);
            buf[(from - addr) as usize..(to - addr) as usize]
                .copy_from_slice(&scratch[(from - cursor) as usize..(to - cursor) as usize]);
            cursor += span;
        }
        Ok(())
    }

    pub fn write<F: FlashDevice>(&self, flash: &mut F, off: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let addr = self.check_bounds(off, data.len())?;

        wait_ready(flash);
        match self.params.caps {
            FlashCaps::BufferedCommit => {
                flash.write(addr, data).map_err(Error::flash)?;
                if (off as usize + data.len()) % self.params.write_block_size != 0 {
                    flash.commit().map_err(Error::flash)?;
                }
            }
            FlashCaps::WordWrite => flash.write(addr, data).map_err(Error::flash)?,
        }
        wait_ready(flash);
        Ok(())
    }

    pub fn erase<F: FlashDevice>(&self, flash: &mut F) -> Result<()> {
        info!("erasing partition {:x}+{:x}", self.offset, self.size);
        wait_ready(flash);
        flash
            .erase(self.offset, self.offset + self.size)
            .map_err(Error::flash)?;
        wait_ready(flash);
        Ok(())
    }

    /// Every byte of `off..off + len` still holds the erase value.
    pub fn is_erased<F: FlashDevice>(&self, flash: &mut F, off: u32, len: u32) -> Result<bool> {
        let mut buf = [0u8; SCRATCH_SIZE];
        let end = off + len;
        let mut cursor = off;
        while cursor < end {
            let n = core::cmp::min(SCRATCH_SIZE as u32, end - cursor) as usize;
            self.read(flash, cursor, &mut buf[..n])?;
            if buf[..n].iter().any(|b| *b != self.params.erase_value) {
                return Ok(false);
            }
            cursor += n as u32;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ram::{Granular, RamFlash};

    type Nor = RamFlash<8192, 4096>;
    type Rram = RamFlash<1024, 16>;

    #[test]
    fn nor_partition_must_be_page_aligned() {
        let flash = Nor::nor();
        assert!(Partition::open(&flash, 0..4096).is_ok());
        assert_eq!(
            Partition::open(&flash, 16..4112),
            Err(Error::InvalidConfig)
        );
        assert_eq!(Partition::open(&flash, 0..2048), Err(Error::InvalidConfig));
    }

    #[test]
    fn rram_partition_needs_block_alignment_only() {
        let flash = Rram::rram();
        assert!(Partition::open(&flash, 16..528).is_ok());
        assert_eq!(Partition::open(&flash, 8..520), Err(Error::InvalidConfig));
    }

    #[test]
    fn partition_outside_device_is_rejected() {
        let flash = Nor::nor();
        assert_eq!(
            Partition::open(&flash, 4096..12288),
            Err(Error::InvalidConfig)
        );
        assert_eq!(Partition::open(&flash, 4096..4096), Err(Error::InvalidConfig));
    }

    #[test]
    fn device_not_ready() {
        let mut flash = Nor::nor();
        flash.set_ready(false);
        assert_eq!(Partition::open(&flash, 0..4096), Err(Error::DeviceNotFound));
    }

    #[test]
    fn offsets_are_partition_relative() {
        let mut flash = Nor::nor();
        let partition = Partition::open(&flash, 4096..8192).unwrap();
        partition.write(&mut flash, 8, &[1, 2, 3, 4]).unwrap();
        assert_eq!(&flash.as_slice()[4104..4108], &[1, 2, 3, 4]);

        let mut buf = [0u8; 3];
        partition.read(&mut flash, 9, &mut buf).unwrap();
        assert_eq!(buf, [2, 3, 4]);

        assert_eq!(
            partition.write(&mut flash, 4092, &[0; 8]),
            Err(Error::FlashIo(NorFlashErrorKind::OutOfBounds))
        );
    }

    #[test]
    fn unaligned_reads_go_through_whole_read_units() {
        let mut flash = Granular::<_, 4, 4>(Nor::nor());
        let partition = Partition::open(&flash, 4096..8192).unwrap();
        let pattern: [u8; 40] = core::array::from_fn(|i| i as u8);
        partition.write(&mut flash, 0, &pattern).unwrap();

        let mut buf = [0u8; 3];
        partition.read(&mut flash, 9, &mut buf).unwrap();
        assert_eq!(buf, [9, 10, 11]);

        // spans more than one scratch buffer
        let mut long = [0u8; 37];
        partition.read(&mut flash, 1, &mut long).unwrap();
        assert_eq!(&long[..], &pattern[1..38]);

        assert!(partition.is_erased(&mut flash, 41, 23).unwrap());
        assert!(!partition.is_erased(&mut flash, 38, 5).unwrap());
    }

    #[test]
    fn buffered_commit_needs_a_fine_write_size() {
        let flash = Granular::<_, 1, 16>(Rram::rram());
        assert_eq!(Partition::open(&flash, 0..512), Err(Error::InvalidConfig));
        let flash = Granular::<_, 1, 8>(Rram::rram());
        assert_eq!(Partition::open(&flash, 0..512), Err(Error::InvalidConfig));
        let flash = Granular::<_, 1, 4>(Rram::rram());
        assert!(Partition::open(&flash, 0..512).is_ok());

        // NOR writes whole metadata records, any block-sized write unit works
        let flash = Granular::<_, 1, 4>(Nor::nor());
        assert!(Partition::open(&flash, 0..4096).is_ok());
    }

    #[test]
    fn unaligned_nor_write_is_rejected_by_driver() {
        let mut flash = Nor::nor();
        let partition = Partition::open(&flash, 0..4096).unwrap();
        assert_eq!(
            partition.write(&mut flash, 2, &[0; 4]),
            Err(Error::FlashIo(NorFlashErrorKind::NotAligned))
        );
    }

    #[test]
    fn buffered_write_commits_partial_blocks() {
        let mut flash = Rram::rram();
        let partition = Partition::open(&flash, 0..512).unwrap();
        partition.write(&mut flash, 0, &[0xaa; 16]).unwrap();
        assert_eq!(flash.stats().commits, 0);
        partition.write(&mut flash, 16, &[0xbb; 20]).unwrap();
        assert_eq!(flash.stats().commits, 1);
    }

    #[test]
    fn erase_restores_erase_value() {
        let mut flash = Nor::nor();
        let partition = Partition::open(&flash, 0..4096).unwrap();
        assert!(partition.is_erased(&mut flash, 0, 4096).unwrap());
        partition.write(&mut flash, 100, &[0; 4]).unwrap();
        assert!(!partition.is_erased(&mut flash, 64, 64).unwrap());
        assert!(partition.is_erased(&mut flash, 0, 100).unwrap());
        partition.erase(&mut flash).unwrap();
        assert!(partition.is_erased(&mut flash, 0, 4096).unwrap());
    }

    #[test]
    fn overlap_detection() {
        let flash = Nor::nor();
        let a = Partition::open(&flash, 0..4096).unwrap();
        let b = Partition::open(&flash, 4096..8192).unwrap();
        let c = Partition::open(&flash, 0..8192).unwrap();
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(c.overlaps(&b));
    }
}
