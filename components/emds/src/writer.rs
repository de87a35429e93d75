//! Streaming the registered entries into an allocated snapshot.
//!
//! Entries are packed through a [`CHUNK_SIZE`] staging buffer. Each full
//! buffer is folded into the running CRC and programmed at the current data
//! offset. The snapshot only becomes visible to the scanner once the final
//! CRC has reached its metadata record.

use crate::config::CHUNK_SIZE;
use crate::entry::Registry;
use crate::error::{Error, Result};
use crate::flash::{FlashCaps, FlashDevice, Partition};
use crate::metadata::{align_up, Crc32kDigest, CRC32K, SNAPSHOT_CRC_OFFSET, SNAPSHOT_CRC_SIZE};
use crate::scan::SnapshotCandidate;

/// Fill byte of the data region tail; reads back as the padding id.
const PADDING: u8 = 0xff;

/// SoC hook around the power-fail comparator, which may otherwise fire
/// again while the store is already running.
pub trait PowerFailComparator {
    /// Disables the warning, returning whether it was enabled.
    fn suspend(&mut self) -> bool;
    fn restore(&mut self, was_enabled: bool);
}

/// No comparator to deal with.
impl PowerFailComparator for () {
    fn suspend(&mut self) -> bool {
        false
    }

    fn restore(&mut self, _was_enabled: bool) {}
}

struct ChunkWriter<'w, F> {
    flash: &'w mut F,
    partition: &'w Partition,
    off: u32,
    buf: [u8; CHUNK_SIZE],
    used: usize,
    digest: Crc32kDigest,
}

impl<'w, F: FlashDevice> ChunkWriter<'w, F> {
    fn new(flash: &'w mut F, partition: &'w Partition, off: u32) -> Self {
        Self {
            flash,
            partition,
            off,
            buf: [PADDING; CHUNK_SIZE],
            used: 0,
            digest: CRC32K.digest(),
        }
    }

    fn push(&mut self, byte: u8) -> Result<()> {
        self.buf[self.used] = byte;
        self.used += 1;
        if self.used == CHUNK_SIZE {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let chunk = &self.buf[..self.used];
        self.digest.update(chunk);
        self.partition.write(self.flash, self.off, chunk)?;
        self.off += self.used as u32;
        self.used = 0;
        Ok(())
    }

    /// Pads the last chunk to the write block size and flushes it.
    /// Returns the end offset and the CRC of everything written.
    fn finish(mut self) -> Result<(u32, u32)> {
        if self.used > 0 {
            let padded = align_up(self.used as u32, self.partition.block_size()) as usize;
            self.buf[self.used..padded].fill(PADDING);
            self.used = padded;
            self.flush()?;
        }
        Ok((self.off, self.digest.finalize()))
    }
}

/// Writes every entry, returns the CRC of the data region.
fn write_entries<F: FlashDevice>(
    flash: &mut F,
    partition: &Partition,
    allocated: &SnapshotCandidate,
    registry: &Registry<'_>,
) -> Result<u32> {
    let start = allocated.metadata.data_instance_off;
    let mut writer = ChunkWriter::new(flash, partition, start);
    for entry in registry.iter() {
        for byte in entry.header().to_bytes() {
            writer.push(byte)?;
        }
        for cell in entry.data {
            writer.push(cell.get())?;
        }
    }
    let (end, crc) = writer.finish()?;

    if end - start != allocated.metadata.data_instance_len {
        error!("entry set changed since prepare");
        return Err(Error::InvalidConfig);
    }
    Ok(crc)
}

fn write_snapshot<F: FlashDevice>(
    flash: &mut F,
    partition: &Partition,
    allocated: &mut SnapshotCandidate,
    registry: &Registry<'_>,
) -> Result<()> {
    let metadata_off = allocated.metadata_off;
    match partition.params().caps {
        FlashCaps::WordWrite => {
            allocated.metadata.snapshot_crc = write_entries(flash, partition, allocated, registry)?;
            partition.write(flash, metadata_off, &allocated.metadata.to_bytes())
        }
        FlashCaps::BufferedCommit => {
            // header first with the CRC slot blanked, the CRC itself last
            let mut raw = allocated.metadata.to_bytes();
            let crc_slot = SNAPSHOT_CRC_OFFSET..SNAPSHOT_CRC_OFFSET + SNAPSHOT_CRC_SIZE;
            raw[crc_slot.clone()].fill(partition.params().erase_value);
            partition.write(flash, metadata_off, &raw[..crc_slot.end])?;

            let crc = write_entries(flash, partition, allocated, registry)?;
            allocated.metadata.snapshot_crc = crc;
            partition.write(
                flash,
                metadata_off + SNAPSHOT_CRC_OFFSET as u32,
                &crc.to_le_bytes(),
            )
        }
    }
}

/// Writes the allocated snapshot in one uninterrupted critical section.
pub fn store<F, P>(
    flash: &mut F,
    partitions: &[Partition],
    allocated: &mut SnapshotCandidate,
    registry: &Registry<'_>,
    comparator: &mut P,
) -> Result<()>
where
    F: FlashDevice,
    P: PowerFailComparator,
{
    let partition = &partitions[allocated.partition];
    let was_enabled = comparator.suspend();
    let result =
        critical_section::with(|_cs| write_snapshot(flash, partition, allocated, registry));
    comparator.restore(was_enabled);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::allocate;
    use crate::entry::tests::cells;
    use crate::entry::Entry;
    use crate::metadata::{crc32k, SnapshotMetadata, METADATA_SIZE};
    use crate::ram::RamFlash;

    #[derive(Default)]
    struct Comparator {
        enabled: bool,
        suspended: usize,
        restored: usize,
    }

    impl PowerFailComparator for Comparator {
        fn suspend(&mut self) -> bool {
            self.suspended += 1;
            core::mem::replace(&mut self.enabled, false)
        }

        fn restore(&mut self, was_enabled: bool) {
            self.restored += 1;
            self.enabled = was_enabled;
        }
    }

    #[test]
    fn data_region_layout() {
        let mut flash = RamFlash::<8192, 4096>::nor();
        let partitions = [Partition::open(&flash, 0..4096).unwrap()];
        let a = cells::<3>(0xaa);
        let b = cells::<1>(0xbb);
        let table = [Entry::new(0x0102, &a), Entry::new(0x0304, &b)];
        let registry = Registry::new(&table);

        let len = align_up(registry.stream_len() as u32, 4);
        assert_eq!(len, 12);
        let mut allocated = allocate(&mut flash, &partitions, None, len).unwrap();
        store(&mut flash, &partitions, &mut allocated, &registry, &mut ()).unwrap();

        let expected = [
            0x02, 0x01, 0x03, 0x00, 0xaa, 0xaa, 0xaa, //
            0x04, 0x03, 0x01, 0x00, 0xbb,
        ];
        assert_eq!(&flash.as_slice()[..12], &expected);
        assert_eq!(allocated.metadata.snapshot_crc, crc32k(&expected));

        let raw: [u8; METADATA_SIZE] = flash.as_slice()[4064..4096].try_into().unwrap();
        assert_eq!(SnapshotMetadata::from_bytes(&raw), allocated.metadata);
    }

    #[test]
    fn tail_is_padded_to_the_block_size() {
        let mut flash = RamFlash::<1024, 16>::rram();
        let partitions = [Partition::open(&flash, 0..512).unwrap()];
        let a = cells::<21>(0x11);
        let table = [Entry::new(1, &a)];
        let registry = Registry::new(&table);

        let len = align_up(registry.stream_len() as u32, 16);
        assert_eq!(len, 32);
        let mut allocated = allocate(&mut flash, &partitions, None, len).unwrap();
        flash.as_mut_slice()[..64].fill(0);
        store(&mut flash, &partitions, &mut allocated, &registry, &mut ()).unwrap();

        assert_eq!(&flash.as_slice()[25..32], &[0xff; 7]);
        assert_eq!(&flash.as_slice()[32..64], &[0; 32]);
        assert_eq!(allocated.metadata.snapshot_crc, crc32k(&flash.as_slice()[..32]));
        // header and CRC update end mid-block, the data chunks do not
        assert_eq!(flash.stats().commits, 2);
    }

    #[test]
    fn changed_entry_set_is_refused() {
        let mut flash = RamFlash::<8192, 4096>::nor();
        let partitions = [Partition::open(&flash, 0..4096).unwrap()];
        let a = cells::<8>(0);
        let table = [Entry::new(1, &a)];
        let registry = Registry::new(&table);

        let mut allocated = allocate(&mut flash, &partitions, None, 4).unwrap();
        assert_eq!(
            store(&mut flash, &partitions, &mut allocated, &registry, &mut ()),
            Err(Error::InvalidConfig)
        );
    }

    #[test]
    fn comparator_is_restored_after_store() {
        let mut flash = RamFlash::<8192, 4096>::nor();
        let partitions = [Partition::open(&flash, 0..4096).unwrap()];
        let registry = Registry::new(&[]);
        let mut comparator = Comparator {
            enabled: true,
            ..Default::default()
        };

        let mut allocated = allocate(&mut flash, &partitions, None, 0).unwrap();
        store(&mut flash, &partitions, &mut allocated, &registry, &mut comparator).unwrap();
        assert_eq!((comparator.suspended, comparator.restored), (1, 1));
        assert!(comparator.enabled);
    }
}
