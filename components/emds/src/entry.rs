//! Registered entries: a static table handed over at construction plus a
//! bounded set of entries added at run time.

use core::cell::Cell;

use heapless::Vec;

use crate::config::{CHUNK_SIZE, MAX_DYNAMIC_ENTRIES};
use crate::error::{Error, Result};
use crate::flash::{FlashDevice, Partition};
use crate::metadata::{EntryHeader, INVALID_ID};
use crate::scan::SnapshotCandidate;

/// One persisted value.
///
/// The application keeps its own shared reference to `data`; EMDS reads the
/// cells when storing and overwrites them when loading.
#[derive(Clone, Copy)]
pub struct Entry<'a> {
    pub id: u16,
    pub data: &'a [Cell<u8>],
}

impl<'a> Entry<'a> {
    pub const fn new(id: u16, data: &'a [Cell<u8>]) -> Self {
        Self { id, data }
    }

    /// Wraps a plain byte buffer.
    pub fn from_mut(id: u16, data: &'a mut [u8]) -> Self {
        Self {
            id,
            data: Cell::from_mut(data).as_slice_of_cells(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Length of the entry as laid out in the data region.
    pub(crate) fn stored_len(&self) -> usize {
        EntryHeader::SIZE + self.data.len()
    }

    pub(crate) fn header(&self) -> EntryHeader {
        EntryHeader {
            id: self.id,
            length: self.data.len() as u16,
        }
    }

    fn check(&self) -> Result<()> {
        if self.id == INVALID_ID || self.data.len() > u16::MAX as usize {
            warn!("entry {:x} unusable, length {}", self.id, self.data.len());
            return Err(Error::InvalidConfig);
        }
        Ok(())
    }
}

impl core::fmt::Debug for Entry<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("len", &self.data.len())
            .finish()
    }
}

pub struct Registry<'a> {
    static_entries: &'a [Entry<'a>],
    dynamic: Vec<Entry<'a>, MAX_DYNAMIC_ENTRIES>,
}

impl<'a> Registry<'a> {
    pub fn new(static_entries: &'a [Entry<'a>]) -> Self {
        Self {
            static_entries,
            dynamic: Vec::new(),
        }
    }

    /// Checks the static table for reserved ids, oversized buffers and
    /// duplicates.
    pub fn validate(&self) -> Result<()> {
        for (idx, entry) in self.static_entries.iter().enumerate() {
            entry.check()?;
            if self.static_entries[..idx].iter().any(|e| e.id == entry.id) {
                error!("static entry {:x} registered twice", entry.id);
                return Err(Error::InvalidConfig);
            }
        }
        Ok(())
    }

    pub fn add(&mut self, entry: Entry<'a>) -> Result<()> {
        entry.check()?;
        if self.find(entry.id).is_some() {
            return Err(Error::DuplicateEntry);
        }
        self.dynamic.push(entry).map_err(|_| Error::NoSpace)
    }

    /// Static entries first, then dynamic ones, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Entry<'a>> + '_ {
        self.static_entries.iter().chain(self.dynamic.iter())
    }

    pub fn find(&self, id: u16) -> Option<&Entry<'a>> {
        self.iter().find(|entry| entry.id == id)
    }

    /// Bytes of the unpadded entry stream.
    pub fn stream_len(&self) -> usize {
        self.iter().map(Entry::stored_len).sum()
    }

    /// Copies the entries of a verified snapshot into the registered buffers.
    ///
    /// Entries are matched by id and must have the registered length; anything
    /// else in the snapshot is skipped. Parsing ends at the padding.
    pub fn restore<F: FlashDevice>(
        &self,
        flash: &mut F,
        partition: &Partition,
        snapshot: &SnapshotCandidate,
    ) -> Result<usize> {
        let mut off = snapshot.metadata.data_instance_off;
        let end = off + snapshot.metadata.data_instance_len;
        let mut restored = 0;

        while end - off >= EntryHeader::SIZE as u32 {
            let mut raw = [0u8; EntryHeader::SIZE];
            partition.read(flash, off, &mut raw)?;
            let header = EntryHeader::from_bytes(raw);
            if header.is_padding() {
                break;
            }
            off += EntryHeader::SIZE as u32;
            let length = header.length as u32;
            if length > end - off {
                warn!("entry {:x} runs past the snapshot", header.id);
                break;
            }

            match self.find(header.id) {
                Some(entry) if entry.len() == header.length as usize => {
                    let mut chunk = [0u8; CHUNK_SIZE];
                    for cells in entry.data.chunks(CHUNK_SIZE) {
                        let bytes = &mut chunk[..cells.len()];
                        partition.read(flash, off, bytes)?;
                        for (cell, byte) in cells.iter().zip(bytes.iter()) {
                            cell.set(*byte);
                        }
                        off += cells.len() as u32;
                    }
                    restored += 1;
                }
                Some(_entry) => {
                    warn!(
                        "entry {:x}: stored length {} does not match {}",
                        header.id,
                        header.length,
                        _entry.len()
                    );
                    off += length;
                }
                None => {
                    warn!("skipping unknown entry {:x}", header.id);
                    off += length;
                }
            }
        }
        Ok(restored)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn cells<const N: usize>(value: u8) -> [Cell<u8>; N] {
        core::array::from_fn(|_| Cell::new(value))
    }

    #[test]
    fn dynamic_ids_must_be_unique_across_tables() {
        let a = cells::<4>(0u8);
        let b = cells::<2>(0u8);
        let table = [Entry::new(1, &a)];
        let mut registry = Registry::new(&table);
        registry.validate().unwrap();

        assert_eq!(registry.add(Entry::new(1, &b)), Err(Error::DuplicateEntry));
        registry.add(Entry::new(2, &b)).unwrap();
        assert_eq!(registry.add(Entry::new(2, &a)), Err(Error::DuplicateEntry));
        assert_eq!(registry.add(Entry::new(INVALID_ID, &a)), Err(Error::InvalidConfig));

        let ids: std::vec::Vec<u16> = registry.iter().map(|e| e.id).collect();
        assert_eq!(ids, [1, 2]);
        assert_eq!(registry.stream_len(), 4 + 4 + 4 + 2);
    }

    #[test]
    fn static_duplicates_are_rejected() {
        let a = cells::<4>(0u8);
        let table = [Entry::new(7, &a), Entry::new(8, &a), Entry::new(7, &a)];
        assert_eq!(Registry::new(&table).validate(), Err(Error::InvalidConfig));
    }

    #[test]
    fn dynamic_table_is_bounded() {
        let one = cells::<1>(0u8);
        let mut registry = Registry::new(&[]);
        for id in 0..MAX_DYNAMIC_ENTRIES as u16 {
            registry.add(Entry::new(id, &one)).unwrap();
        }
        assert_eq!(registry.add(Entry::new(1000, &one)), Err(Error::NoSpace));
    }

    #[test]
    fn from_mut_shares_the_buffer() {
        let mut raw = [0u8; 3];
        let entry = Entry::from_mut(5, &mut raw);
        for (cell, byte) in entry.data.iter().zip(1..) {
            cell.set(byte);
        }
        assert_eq!(entry.header(), EntryHeader { id: 5, length: 3 });
        assert_eq!(raw, [1, 2, 3]);
    }
}
