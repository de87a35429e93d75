//! Boot-time discovery of the freshest intact snapshot.
//!
//! Metadata slots are walked from the end of a partition towards its start.
//! Headers that pass the marker and header CRC checks become candidates; a
//! candidate is only accepted once the CRC of its data region matches too.

use heapless::Vec;

use crate::config::{Config, CHUNK_SIZE, MAX_CANDIDATES};
use crate::error::Result;
use crate::flash::{FlashDevice, Partition};
use crate::metadata::{SnapshotMetadata, CRC32K, METADATA_SIZE};

/// A metadata record found in flash, or allocated for the next store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotCandidate {
    pub metadata: SnapshotMetadata,
    pub metadata_off: u32,
    pub partition: usize,
}

impl SnapshotCandidate {
    pub fn fresh_cnt(&self) -> u32 {
        self.metadata.fresh_cnt
    }
}

/// Bounded list of candidates, freshest first.
#[derive(Default)]
pub struct CandidateList {
    candidates: Vec<SnapshotCandidate, MAX_CANDIDATES>,
}

impl CandidateList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the list sorted; once full, the least fresh candidate goes.
    pub fn insert(&mut self, candidate: SnapshotCandidate) {
        if self.candidates.is_full() {
            match self.candidates.last() {
                Some(last) if last.fresh_cnt() >= candidate.fresh_cnt() => return,
                _ => {
                    self.candidates.pop();
                }
            }
        }
        // cannot fail, room was made above
        let _ = self.candidates.push(candidate);
        self.candidates
            .sort_unstable_by(|a, b| b.fresh_cnt().cmp(&a.fresh_cnt()));
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SnapshotCandidate> {
        self.candidates.iter()
    }
}

/// Collects plausible metadata records of one partition.
pub fn collect_candidates<F: FlashDevice>(
    flash: &mut F,
    partition: &Partition,
    index: usize,
    config: &Config,
) -> Result<CandidateList> {
    let mut list = CandidateList::new();
    let mut failures = 0;
    let mut raw = [0u8; METADATA_SIZE];
    let mut off = partition.size() - METADATA_SIZE as u32;

    loop {
        partition.read(flash, off, &mut raw)?;
        let metadata = SnapshotMetadata::from_bytes(&raw);

        let plausible = metadata.is_valid()
            && matches!(metadata.data_end(), Some(end) if end <= off);
        if plausible {
            trace!("candidate {} at {:x}+{:x}", metadata.fresh_cnt, index, off);
            list.insert(SnapshotCandidate {
                metadata,
                metadata_off: off,
                partition: index,
            });
        } else {
            failures += 1;
            if failures > config.scan_fail_tolerance {
                break;
            }
        }

        match off.checked_sub(METADATA_SIZE as u32) {
            Some(next) => off = next,
            None => break,
        }
    }

    debug!("partition {}: {} candidates, {} rejected slots", index, list.len(), failures);
    Ok(list)
}

/// Recomputes the CRC of the candidate's data region.
pub fn verify_data<F: FlashDevice>(
    flash: &mut F,
    partition: &Partition,
    candidate: &SnapshotCandidate,
) -> Result<bool> {
    let mut digest = CRC32K.digest();
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut off = candidate.metadata.data_instance_off;
    let mut left = candidate.metadata.data_instance_len as usize;

    while left > 0 {
        let n = core::cmp::min(left, CHUNK_SIZE);
        partition.read(flash, off, &mut chunk[..n])?;
        digest.update(&chunk[..n]);
        off += n as u32;
        left -= n;
    }
    Ok(digest.finalize() == candidate.metadata.snapshot_crc)
}

/// Freshest snapshot of one partition whose data is intact.
pub fn scan_partition<F: FlashDevice>(
    flash: &mut F,
    partition: &Partition,
    index: usize,
    config: &Config,
) -> Result<Option<SnapshotCandidate>> {
    let candidates = collect_candidates(flash, partition, index, config)?;
    for candidate in candidates.iter() {
        if candidate.fresh_cnt() == 0 {
            break;
        }
        if verify_data(flash, partition, candidate)? {
            return Ok(Some(*candidate));
        }
        warn!(
            "snapshot {} in partition {} has corrupted data",
            candidate.fresh_cnt(),
            index
        );
    }
    Ok(None)
}

/// Freshest intact snapshot across all partitions.
pub fn find_freshest<F: FlashDevice>(
    flash: &mut F,
    partitions: &[Partition],
    config: &Config,
) -> Result<Option<SnapshotCandidate>> {
    let mut freshest: Option<SnapshotCandidate> = None;
    for (index, partition) in partitions.iter().enumerate() {
        if let Some(found) = scan_partition(flash, partition, index, config)? {
            if freshest.map_or(true, |f| found.fresh_cnt() > f.fresh_cnt()) {
                freshest = Some(found);
            }
        }
    }
    Ok(freshest)
}
