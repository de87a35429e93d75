use std::{
    fs::{File, OpenOptions},
    io::{self, Read as _, Seek as _, SeekFrom, Write as _},
    ops::Range,
    path::{Path, PathBuf},
};

use embedded_storage::nor_flash::{ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash};
use emds::{FlashCaps, FlashDevice, FlashParameters};
use log::{debug, error, trace};

/// Flash device covering `origin..origin + size` of a board's address space,
/// kept in RAM and optionally mirrored to an image file.
///
/// `PAGE` is the erase granularity; programming follows `params.caps`.
pub struct SimFlash<const PAGE: usize> {
    origin: u32,
    memory: Vec<u8>,
    params: FlashParameters,
    image: Option<PathBuf>,
    budget: Option<usize>,
    powered: bool,
    programmed: usize,
}

impl<const PAGE: usize> SimFlash<PAGE> {
    pub fn ram(origin: u32, size: usize, params: FlashParameters) -> Self {
        Self {
            origin,
            memory: vec![params.erase_value; size],
            params,
            image: None,
            budget: None,
            powered: true,
            programmed: 0,
        }
    }

    /// Opens an existing image or creates an erased one.
    pub fn file(
        path: impl AsRef<Path>,
        origin: u32,
        size: usize,
        params: FlashParameters,
    ) -> io::Result<Self> {
        let path = path.as_ref();
        let mut flash = Self::ram(origin, size, params);

        if let Ok(mut file) = File::open(path) {
            let len = file.metadata()?.len();
            if len != size as u64 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("flash image {path:?} has {len} bytes, expected {size}"),
                ));
            }
            file.read_exact(&mut flash.memory)?;
            debug!("using existing flash image {path:?}");
        } else {
            File::create(path)?.write_all(&flash.memory)?;
            debug!("created erased flash image {path:?}");
        }

        flash.image = Some(path.into());
        Ok(flash)
    }

    pub fn power_cut_after_bytes(&mut self, bytes: usize) {
        self.budget = Some(bytes);
    }

    pub fn power_restore(&mut self) {
        self.budget = None;
        self.powered = true;
    }

    /// Bytes programmed since the device was opened.
    pub fn programmed(&self) -> usize {
        self.programmed
    }

    fn range(&self, offset: u32, len: usize) -> Result<Range<usize>, NorFlashErrorKind> {
        if !self.powered {
            return Err(NorFlashErrorKind::Other);
        }
        let start = offset
            .checked_sub(self.origin)
            .ok_or(NorFlashErrorKind::OutOfBounds)? as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.memory.len() => Ok(start..end),
            _ => Err(NorFlashErrorKind::OutOfBounds),
        }
    }

    fn sync(&self, range: Range<usize>) -> Result<(), NorFlashErrorKind> {
        let Some(path) = &self.image else {
            return Ok(());
        };
        let result = OpenOptions::new().write(true).open(path).and_then(|mut file| {
            file.seek(SeekFrom::Start(range.start as u64))?;
            file.write_all(&self.memory[range.clone()])?;
            file.flush()
        });
        result.map_err(|err| {
            error!("failed to update flash image {path:?}: {err}");
            NorFlashErrorKind::Other
        })
    }
}

impl<const PAGE: usize> ErrorType for SimFlash<PAGE> {
    type Error = NorFlashErrorKind;
}

impl<const PAGE: usize> ReadNorFlash for SimFlash<PAGE> {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let range = self.range(offset, bytes.len())?;
        bytes.copy_from_slice(&self.memory[range]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.origin as usize + self.memory.len()
    }
}

impl<const PAGE: usize> NorFlash for SimFlash<PAGE> {
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = PAGE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        trace!("erase {:x}..{:x}", from, to);
        if from > to {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        let range = self.range(from, (to - from) as usize)?;
        if range.start % PAGE != 0 || range.end % PAGE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        if self.budget == Some(0) {
            self.powered = false;
            return Err(NorFlashErrorKind::Other);
        }
        self.memory[range.clone()].fill(self.params.erase_value);
        self.sync(range)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        trace!("write {:x} {:x}", offset, bytes.len());
        let range = self.range(offset, bytes.len())?;
        let word = self.params.write_block_size;
        if self.params.caps == FlashCaps::WordWrite
            && (range.start % word != 0 || bytes.len() % word != 0)
        {
            return Err(NorFlashErrorKind::NotAligned);
        }

        let len = match self.budget {
            Some(left) => left.min(bytes.len()),
            None => bytes.len(),
        };
        let target = range.start..range.start + len;
        match self.params.caps {
            FlashCaps::WordWrite => self.memory[target.clone()]
                .iter_mut()
                .zip(bytes)
                .for_each(|(cell, byte)| *cell &= *byte),
            FlashCaps::BufferedCommit => self.memory[target.clone()].copy_from_slice(&bytes[..len]),
        }
        self.programmed += len;
        self.sync(target)?;

        if let Some(left) = self.budget.as_mut() {
            *left -= len;
            if len < bytes.len() {
                debug!("power cut after {} bytes", self.programmed);
                self.powered = false;
                return Err(NorFlashErrorKind::Other);
            }
        }
        Ok(())
    }
}

impl<const PAGE: usize> FlashDevice for SimFlash<PAGE> {
    fn parameters(&self) -> FlashParameters {
        self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::Cell;

    use emds::{Emds, Entry, Error};
    use serial_test::serial;

    const IMAGE_PATH: &str = "/tmp/emds-sim.test.bin";
    const ORIGIN: u32 = 0xF8_000;
    const SIZE: usize = 0x8_000;

    const NOR: FlashParameters = FlashParameters {
        write_block_size: 4,
        erase_value: 0xff,
        caps: FlashCaps::WordWrite,
    };

    fn regions() -> [Range<u32>; 2] {
        [ORIGIN..ORIGIN + 0x4_000, ORIGIN + 0x4_000..ORIGIN + 0x8_000]
    }

    fn fresh_image() -> SimFlash<4096> {
        let _ = std::fs::remove_file(IMAGE_PATH);
        SimFlash::file(IMAGE_PATH, ORIGIN, SIZE, NOR).unwrap()
    }

    #[test]
    #[serial]
    fn image_survives_reopen() {
        let mut flash = fresh_image();
        flash.write(ORIGIN + 8, &[1, 2, 3, 4]).unwrap();
        drop(flash);

        let mut flash = SimFlash::<4096>::file(IMAGE_PATH, ORIGIN, SIZE, NOR).unwrap();
        let mut buf = [0u8; 6];
        flash.read(ORIGIN + 6, &mut buf).unwrap();
        assert_eq!(buf, [0xff, 0xff, 1, 2, 3, 4]);

        flash.erase(ORIGIN, ORIGIN + 4096).unwrap();
        drop(flash);
        let image = std::fs::read(IMAGE_PATH).unwrap();
        assert!(image[..4096].iter().all(|b| *b == 0xff));
    }

    #[test]
    #[serial]
    fn wrong_image_size_is_rejected() {
        let _ = std::fs::remove_file(IMAGE_PATH);
        std::fs::write(IMAGE_PATH, [0u8; 16]).unwrap();
        assert!(SimFlash::<4096>::file(IMAGE_PATH, ORIGIN, SIZE, NOR).is_err());
    }

    #[test]
    fn addresses_below_origin_are_out_of_bounds() {
        let mut flash = SimFlash::<4096>::ram(ORIGIN, SIZE, NOR);
        let mut buf = [0u8; 4];
        assert_eq!(flash.read(ORIGIN - 4, &mut buf), Err(NorFlashErrorKind::OutOfBounds));
        assert_eq!(flash.capacity(), 0x100_000);
    }

    #[test]
    #[serial]
    fn snapshot_survives_restart() {
        let data = [Cell::new(0x42u8), Cell::new(0x43)];
        let table = [Entry::new(1, &data)];
        let mut emds = Emds::new(fresh_image(), regions(), &table);
        emds.init(None).unwrap();
        assert_eq!(emds.load(), Err(Error::NotFound));
        emds.prepare().unwrap();
        emds.store().unwrap();
        drop(emds);

        let restored = [Cell::new(0u8), Cell::new(0)];
        let table = [Entry::new(1, &restored)];
        let flash = SimFlash::<4096>::file(IMAGE_PATH, ORIGIN, SIZE, NOR).unwrap();
        let mut emds = Emds::new(flash, regions(), &table);
        emds.init(None).unwrap();
        emds.load().unwrap();
        assert_eq!([restored[0].get(), restored[1].get()], [0x42, 0x43]);
    }

    #[test]
    fn power_cut_keeps_programmed_prefix() {
        let mut flash = SimFlash::<4096>::ram(ORIGIN, SIZE, NOR);
        flash.power_cut_after_bytes(5);
        assert!(flash.write(ORIGIN, &[0; 8]).is_err());
        assert_eq!(flash.programmed(), 5);

        flash.power_restore();
        let mut buf = [0u8; 8];
        flash.read(ORIGIN, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 0, 0, 0xff, 0xff, 0xff]);
    }
}
