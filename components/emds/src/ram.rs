//! In-memory flash device for tests and host tooling.
//!
//! Models both supported technologies: NOR programming can only clear bits
//! and needs word alignment, RRAM overwrites in place and counts commits of
//! its write buffer. A byte budget can be armed to cut power in the middle of
//! a write, leaving the preceding bytes programmed and the rest untouched.

use embedded_storage::nor_flash::{
    check_read, check_write, ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash,
};

use crate::flash::{FlashCaps, FlashDevice, FlashParameters};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub reads: usize,
    pub writes: usize,
    pub bytes_written: usize,
    pub erases: usize,
    pub commits: usize,
}

impl Stats {
    /// Number of calls that touched the device at all.
    pub fn operations(&self) -> usize {
        self.reads + self.writes + self.erases + self.commits
    }
}

#[derive(Clone)]
pub struct RamFlash<const SIZE: usize, const ERASE: usize> {
    memory: [u8; SIZE],
    params: FlashParameters,
    ready: bool,
    stats: Stats,
    budget: Option<usize>,
    powered: bool,
}

impl<const SIZE: usize, const ERASE: usize> RamFlash<SIZE, ERASE> {
    pub fn new(params: FlashParameters) -> Self {
        Self {
            memory: [params.erase_value; SIZE],
            params,
            ready: true,
            stats: Stats::default(),
            budget: None,
            powered: true,
        }
    }

    /// NOR flash with 4 byte words.
    pub fn nor() -> Self {
        Self::new(FlashParameters {
            write_block_size: 4,
            erase_value: 0xff,
            caps: FlashCaps::WordWrite,
        })
    }

    /// RRAM with a 16 byte write buffer.
    pub fn rram() -> Self {
        Self::new(FlashParameters {
            write_block_size: 16,
            erase_value: 0xff,
            caps: FlashCaps::BufferedCommit,
        })
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = Stats::default();
    }

    /// Programs at most `bytes` more bytes, then the device goes dark and
    /// every further operation fails until [`RamFlash::power_restore`].
    pub fn power_cut_after_bytes(&mut self, bytes: usize) {
        self.budget = Some(bytes);
    }

    pub fn power_restore(&mut self) {
        self.budget = None;
        self.powered = true;
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.memory
    }

    /// Raw access for planting corruption.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    fn check_powered(&self) -> Result<(), NorFlashErrorKind> {
        match self.powered {
            true => Ok(()),
            false => Err(NorFlashErrorKind::Other),
        }
    }

    fn check_range(&self, offset: u32, len: usize) -> Result<usize, NorFlashErrorKind> {
        let start = offset as usize;
        match start.checked_add(len) {
            Some(end) if end <= SIZE => Ok(start),
            _ => Err(NorFlashErrorKind::OutOfBounds),
        }
    }
}

impl<const SIZE: usize, const ERASE: usize> ErrorType for RamFlash<SIZE, ERASE> {
    type Error = NorFlashErrorKind;
}

impl<const SIZE: usize, const ERASE: usize> ReadNorFlash for RamFlash<SIZE, ERASE> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.check_powered()?;
        let start = self.check_range(offset, bytes.len())?;
        self.stats.reads += 1;
        bytes.copy_from_slice(&self.memory[start..start + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        SIZE
    }
}

impl<const SIZE: usize, const ERASE: usize> NorFlash for RamFlash<SIZE, ERASE> {
    // word alignment of NOR parts is enforced at run time from the parameters
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = ERASE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        self.check_powered()?;
        if from > to {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        let start = self.check_range(from, (to - from) as usize)?;
        if from as usize % ERASE != 0 || to as usize % ERASE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        if self.budget == Some(0) {
            self.powered = false;
            return Err(NorFlashErrorKind::Other);
        }
        self.stats.erases += 1;
        self.memory[start..to as usize].fill(self.params.erase_value);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.check_powered()?;
        let start = self.check_range(offset, bytes.len())?;
        let word = self.params.write_block_size;
        if self.params.caps == FlashCaps::WordWrite
            && (start % word != 0 || bytes.len() % word != 0)
        {
            return Err(NorFlashErrorKind::NotAligned);
        }
        self.stats.writes += 1;

        let (len, torn) = match self.budget {
            Some(left) if left < bytes.len() => (left, true),
            _ => (bytes.len(), false),
        };
        let target = &mut self.memory[start..start + len];
        match self.params.caps {
            FlashCaps::WordWrite => target
                .iter_mut()
                .zip(bytes)
                .for_each(|(cell, byte)| *cell &= *byte),
            FlashCaps::BufferedCommit => target.copy_from_slice(&bytes[..len]),
        }
        self.stats.bytes_written += len;
        if let Some(left) = self.budget.as_mut() {
            *left -= len;
        }

        if torn {
            self.powered = false;
            return Err(NorFlashErrorKind::Other);
        }
        Ok(())
    }
}

impl<const SIZE: usize, const ERASE: usize> FlashDevice for RamFlash<SIZE, ERASE> {
    fn parameters(&self) -> FlashParameters {
        self.params
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn commit(&mut self) -> Result<(), Self::Error> {
        self.check_powered()?;
        self.stats.commits += 1;
        Ok(())
    }
}

/// Imposes the access granularity of a word-oriented driver on `F`:
/// reads must be `READ` aligned, writes `WRITE` aligned.
pub struct Granular<F, const READ: usize, const WRITE: usize>(pub F);

impl<F, const READ: usize, const WRITE: usize> ErrorType for Granular<F, READ, WRITE> {
    type Error = NorFlashErrorKind;
}

impl<F, const READ: usize, const WRITE: usize> ReadNorFlash for Granular<F, READ, WRITE>
where
    F: ReadNorFlash<Error = NorFlashErrorKind>,
{
    const READ_SIZE: usize = READ;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        check_read(self, offset, bytes.len())?;
        self.0.read(offset, bytes)
    }

    fn capacity(&self) -> usize {
        self.0.capacity()
    }
}

impl<F, const READ: usize, const WRITE: usize> NorFlash for Granular<F, READ, WRITE>
where
    F: NorFlash<Error = NorFlashErrorKind>,
{
    const WRITE_SIZE: usize = WRITE;
    const ERASE_SIZE: usize = F::ERASE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        self.0.erase(from, to)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        check_write(self, offset, bytes.len())?;
        self.0.write(offset, bytes)
    }
}

impl<F, const READ: usize, const WRITE: usize> FlashDevice for Granular<F, READ, WRITE>
where
    F: FlashDevice<Error = NorFlashErrorKind>,
{
    fn parameters(&self) -> FlashParameters {
        self.0.parameters()
    }

    fn is_ready(&self) -> bool {
        self.0.is_ready()
    }

    fn is_busy(&mut self) -> bool {
        self.0.is_busy()
    }

    fn commit(&mut self) -> Result<(), Self::Error> {
        self.0.commit()
    }
}
