//! Placement of the next snapshot.
//!
//! Data grows forward from the start of a partition, metadata slots grow
//! backwards from its end. A new snapshot is chained behind the freshest one
//! when it fits, otherwise it goes to the tail of another partition, erasing
//! that partition as a last resort.

use crate::error::{Error, Result};
use crate::flash::{FlashDevice, Partition};
use crate::metadata::{align_up, SnapshotMetadata, METADATA_SIZE};
use crate::scan::SnapshotCandidate;

const SLOT: u32 = METADATA_SIZE as u32;

/// Validates one placement and builds the sealed metadata for it.
fn try_place<F: FlashDevice>(
    flash: &mut F,
    partition: &Partition,
    index: usize,
    data_off: u32,
    metadata_off: u32,
    data_len: u32,
    fresh_cnt: u32,
) -> Result<SnapshotCandidate> {
    let data_end = data_off.checked_add(data_len).ok_or(Error::NoSpace)?;
    let slot_end = metadata_off.checked_add(SLOT).ok_or(Error::NoSpace)?;
    if slot_end > partition.size() || data_end > metadata_off || metadata_off <= data_off {
        return Err(Error::NoSpace);
    }

    if partition.params().caps.explicit_erase()
        && !(partition.is_erased(flash, metadata_off, SLOT)?
            && partition.is_erased(flash, data_off, data_len)?)
    {
        debug!("partition {} not erased at {:x}/{:x}", index, data_off, metadata_off);
        return Err(Error::RegionNotEmpty);
    }

    Ok(SnapshotCandidate {
        metadata: SnapshotMetadata::new(data_off, data_len, fresh_cnt),
        metadata_off,
        partition: index,
    })
}

/// Generation of the snapshot following `freshest`. Counters are never
/// reused, an exhausted one leaves `clear` as the only way forward.
fn next_fresh_cnt(freshest: Option<&SnapshotCandidate>) -> Result<u32> {
    match freshest {
        Some(previous) => previous.fresh_cnt().checked_add(1).ok_or_else(|| {
            error!("generation counter exhausted");
            Error::NoSpace
        }),
        None => Ok(1),
    }
}

/// Right behind the previous snapshot, in its partition.
fn chain<F: FlashDevice>(
    flash: &mut F,
    partitions: &[Partition],
    previous: &SnapshotCandidate,
    data_len: u32,
) -> Result<SnapshotCandidate> {
    let partition = &partitions[previous.partition];
    let data_off = previous
        .metadata
        .data_end()
        .map(|end| align_up(end, partition.block_size()))
        .ok_or(Error::NoSpace)?;
    let metadata_off = previous.metadata_off.checked_sub(SLOT).ok_or(Error::NoSpace)?;
    try_place(
        flash,
        partition,
        previous.partition,
        data_off,
        metadata_off,
        data_len,
        next_fresh_cnt(Some(previous))?,
    )
}

/// First placement that works at the tail of a partition not holding the
/// freshest snapshot. With `erase`, each partition is erased right before
/// it is tried.
fn tail<F: FlashDevice>(
    flash: &mut F,
    partitions: &[Partition],
    freshest: Option<&SnapshotCandidate>,
    data_len: u32,
    erase: bool,
) -> Result<SnapshotCandidate> {
    let fresh_cnt = next_fresh_cnt(freshest)?;
    let mut outcome = Error::NoSpace;

    for (index, partition) in partitions.iter().enumerate() {
        if freshest.map_or(false, |f| f.partition == index) {
            continue;
        }
        if erase {
            partition.erase(flash)?;
        }
        let metadata_off = partition.size() - SLOT;
        match try_place(flash, partition, index, 0, metadata_off, data_len, fresh_cnt) {
            Ok(allocated) => return Ok(allocated),
            Err(Error::RegionNotEmpty) => outcome = Error::RegionNotEmpty,
            Err(Error::NoSpace) => {}
            Err(error) => return Err(error),
        }
    }
    Err(outcome)
}

/// Picks the location of the next snapshot of `data_len` bytes.
pub fn allocate<F: FlashDevice>(
    flash: &mut F,
    partitions: &[Partition],
    freshest: Option<&SnapshotCandidate>,
    data_len: u32,
) -> Result<SnapshotCandidate> {
    if let Some(previous) = freshest {
        match chain(flash, partitions, previous, data_len) {
            Ok(allocated) => return Ok(allocated),
            Err(error) if error.is_placement_failure() => {
                debug!("cannot chain after snapshot {}: {:?}", previous.fresh_cnt(), error);
            }
            Err(error) => return Err(error),
        }
    }

    match tail(flash, partitions, freshest, data_len, false) {
        Err(Error::RegionNotEmpty) => {
            info!("no free partition, erasing");
            tail(flash, partitions, freshest, data_len, true)
        }
        result => result,
    }
}
