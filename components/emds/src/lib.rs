#![no_std]
#![warn(trivial_casts, unused, unused_qualifications)]

//! Emergency data storage.
//!
//! EMDS keeps a set of application buffers ([`Entry`]) in two raw flash
//! partitions and is built for the short window between a power-fail warning
//! and the actual loss of power: everything that can be decided ahead of time
//! happens in [`Emds::prepare`], leaving [`Emds::store`] with nothing but a
//! sequential write of precomputed size.
//!
//! # Usage
//! ```text
//! init -> load -> prepare -> (power-fail warning) store
//! ```
//! `store` always falls back to the initialized state, so the next snapshot
//! needs another `load`/`prepare` round. `clear` wipes both partitions.
//!
//! # Crash consistency
//! * every snapshot carries a generation counter (`fresh_cnt`), the freshest
//!   intact snapshot wins at boot
//! * the metadata record and the data region are covered by separate CRCs;
//!   a snapshot interrupted by power loss fails one of them and the previous
//!   snapshot is used instead
//! * a partition holding the freshest snapshot is never erased or
//!   overwritten by a tail placement

delog::generate_macros!();

mod allocator;
pub mod config;
mod entry;
mod error;
mod flash;
pub mod metadata;
#[cfg(any(test, feature = "ram-flash"))]
pub mod ram;
mod scan;
mod writer;


#[cfg(test)]
#[macro_use]
extern crate std;

use core::ops::Range;

pub use crate::config::Config;
pub use crate::entry::Entry;
pub use crate::error::{Error, Result};
pub use crate::flash::{FlashCaps, FlashDevice, FlashParameters, Partition};
pub use crate::scan::SnapshotCandidate;
pub use crate::writer::PowerFailComparator;

use crate::entry::Registry;
use crate::metadata::{align_up, METADATA_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    NotInitialized,
    Initialized,
    /// Flash content has been scanned, entries are loaded.
    Synchronized,
    /// A snapshot has been allocated, `store` may run.
    Ready,
}

pub struct Emds<'a, F, P = ()> {
    flash: F,
    regions: [Range<u32>; 2],
    partitions: Option<[Partition; 2]>,
    registry: Registry<'a>,
    config: Config,
    comparator: P,
    state: State,
    callback: Option<fn()>,
    freshest: Option<SnapshotCandidate>,
    allocated: Option<SnapshotCandidate>,
}

impl<'a, F: FlashDevice> Emds<'a, F> {
    /// An uninitialized context over two regions of `flash`.
    pub fn new(flash: F, regions: [Range<u32>; 2], static_entries: &'a [Entry<'a>]) -> Self {
        Self {
            flash,
            regions,
            partitions: None,
            registry: Registry::new(static_entries),
            config: Config::new(),
            comparator: (),
            state: State::NotInitialized,
            callback: None,
            freshest: None,
            allocated: None,
        }
    }
}

impl<'a, F: FlashDevice, P: PowerFailComparator> Emds<'a, F, P> {
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Suspends `comparator` for the duration of every store.
    pub fn with_power_fail_comparator<Q: PowerFailComparator>(self, comparator: Q) -> Emds<'a, F, Q> {
        Emds {
            flash: self.flash,
            regions: self.regions,
            partitions: self.partitions,
            registry: self.registry,
            config: self.config,
            comparator,
            state: self.state,
            callback: self.callback,
            freshest: self.freshest,
            allocated: self.allocated,
        }
    }

    fn expect_state(&self, expected: State) -> Result<()> {
        match self.state {
            State::NotInitialized => Err(Error::NotInitialized),
            state if state == expected => Ok(()),
            _state => {
                debug!("called in state {:?}, expected {:?}", _state, expected);
                Err(Error::WrongState)
            }
        }
    }

    /// Opens and checks both partitions and the static entry table.
    ///
    /// `callback` runs after every successful [`Emds::store`].
    pub fn init(&mut self, callback: Option<fn()>) -> Result<()> {
        if self.state != State::NotInitialized {
            return Err(Error::WrongState);
        }

        let partitions = [
            Partition::open(&self.flash, self.regions[0].clone())?,
            Partition::open(&self.flash, self.regions[1].clone())?,
        ];
        if partitions[0].overlaps(&partitions[1]) {
            error!("emds partitions overlap");
            return Err(Error::InvalidConfig);
        }
        self.registry.validate()?;

        info!(
            "emds on {:x}+{:x} and {:x}+{:x}",
            partitions[0].offset(),
            partitions[0].size(),
            partitions[1].offset(),
            partitions[1].size()
        );
        self.partitions = Some(partitions);
        self.callback = callback;
        self.state = State::Initialized;
        Ok(())
    }

    /// Registers an entry at run time. Only possible before `load`.
    pub fn entry_add(&mut self, entry: Entry<'a>) -> Result<()> {
        self.expect_state(State::Initialized)?;
        self.registry.add(entry)
    }

    /// Finds the freshest intact snapshot and copies its entries into the
    /// registered buffers.
    ///
    /// Returns [`Error::NotFound`] when there is no snapshot; the context is
    /// synchronized either way and `prepare` may follow.
    pub fn load(&mut self) -> Result<()> {
        self.expect_state(State::Initialized)?;
        let partitions = self.partitions.as_ref().ok_or(Error::NotInitialized)?;

        let freshest = scan::find_freshest(&mut self.flash, partitions, &self.config)?;
        self.freshest = freshest;
        self.allocated = None;
        self.state = State::Synchronized;

        let snapshot = freshest.ok_or(Error::NotFound)?;
        let _restored =
            self.registry
                .restore(&mut self.flash, &partitions[snapshot.partition], &snapshot)?;
        info!(
            "loaded snapshot {} from partition {}, {} entries",
            snapshot.fresh_cnt(),
            snapshot.partition,
            _restored
        );
        Ok(())
    }

    /// Reserves room for the next snapshot, erasing a partition if needed.
    pub fn prepare(&mut self) -> Result<()> {
        self.expect_state(State::Synchronized)?;
        let partitions = self.partitions.as_ref().ok_or(Error::NotInitialized)?;

        let block = partitions[0].block_size();
        let data_len = u32::try_from(self.registry.stream_len())
            .map(|len| align_up(len, block))
            .map_err(|_| Error::InvalidConfig)?;
        if partitions
            .iter()
            .any(|p| data_len as usize + METADATA_SIZE > p.size() as usize)
        {
            error!("snapshot of {} bytes cannot fit a partition", data_len);
            return Err(Error::InvalidConfig);
        }

        let allocated = allocator::allocate(
            &mut self.flash,
            partitions,
            self.freshest.as_ref(),
            data_len,
        )?;
        debug!(
            "allocated snapshot {} in partition {} at {:x}/{:x}",
            allocated.fresh_cnt(),
            allocated.partition,
            allocated.metadata.data_instance_off,
            allocated.metadata_off
        );
        self.allocated = Some(allocated);
        self.state = State::Ready;
        Ok(())
    }

    /// Writes all entries into the prepared snapshot.
    ///
    /// Runs with interrupts disabled. Afterwards the context is back in
    /// [`State::Initialized`], whether the write succeeded or not.
    pub fn store(&mut self) -> Result<()> {
        self.expect_state(State::Ready)?;
        self.state = State::Initialized;
        let partitions = self.partitions.as_ref().ok_or(Error::NotInitialized)?;
        let mut allocated = self.allocated.take().ok_or(Error::WrongState)?;

        writer::store(
            &mut self.flash,
            partitions,
            &mut allocated,
            &self.registry,
            &mut self.comparator,
        )?;

        self.freshest = Some(allocated);
        if let Some(callback) = self.callback {
            callback();
        }
        Ok(())
    }

    /// Erases both partitions and forgets every known snapshot.
    pub fn clear(&mut self) -> Result<()> {
        if self.state == State::NotInitialized {
            return Err(Error::NotInitialized);
        }
        let partitions = self.partitions.as_ref().ok_or(Error::NotInitialized)?;

        self.freshest = None;
        self.allocated = None;
        self.state = State::Initialized;
        for partition in partitions {
            partition.erase(&mut self.flash)?;
        }
        Ok(())
    }

    /// A snapshot is allocated and `store` can be called.
    pub fn is_ready(&self) -> bool {
        self.state == State::Ready
    }

    /// Bytes a store of the current entry set programs, metadata included.
    pub fn store_size_get(&self) -> usize {
        // the device is only validated by `init`
        let block = match &self.partitions {
            Some(partitions) => partitions[0].block_size(),
            None => self.flash.parameters().write_block_size.max(1) as u32,
        };
        align_up(self.registry.stream_len() as u32, block) as usize + METADATA_SIZE
    }

    /// Estimated duration of `store` in microseconds.
    pub fn store_time_get(&self) -> u32 {
        self.config.store_time_us(self.store_size_get())
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The freshest snapshot known, from `load` or the last `store`.
    pub fn snapshot(&self) -> Option<&SnapshotCandidate> {
        self.freshest.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn power_fail_comparator(&self) -> &P {
        &self.comparator
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Direct device access, bypassing the state machine.
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Gives the flash device back, e.g. to simulate a reboot.
    pub fn release(self) -> F {
        self.flash
    }
}
