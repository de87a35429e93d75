use embedded_storage::nor_flash::{NorFlashError, NorFlashErrorKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The context has not been initialized yet.
    NotInitialized,
    /// The operation is not allowed in the current state.
    WrongState,
    /// The flash device is missing or not ready.
    DeviceNotFound,
    /// Partition layout, flash parameters or the entry set are unusable.
    InvalidConfig,
    /// The flash driver rejected a read, write or erase.
    FlashIo(NorFlashErrorKind),
    /// An explicit-erase target region still holds programmed bytes.
    RegionNotEmpty,
    /// No valid snapshot was found.
    NotFound,
    /// Not enough room in a partition or in the dynamic entry table.
    NoSpace,
    /// An entry with the same id is already registered.
    DuplicateEntry,
}

impl Error {
    /// Negative errno value, for callers sitting behind a C-style interface.
    pub const fn errno(&self) -> i32 {
        match self {
            Self::NotInitialized => -13,  // EACCES
            Self::WrongState => -140,     // ECANCELED
            Self::DeviceNotFound => -19,  // ENODEV
            Self::InvalidConfig => -22,   // EINVAL
            Self::FlashIo(_) => -5,       // EIO
            Self::RegionNotEmpty => -112, // EADDRINUSE
            Self::NotFound => -2,         // ENOENT
            Self::NoSpace => -12,         // ENOMEM
            Self::DuplicateEntry => -17,  // EEXIST
        }
    }

    /// Allocation failures the allocator may recover from by trying elsewhere.
    pub(crate) const fn is_placement_failure(&self) -> bool {
        matches!(self, Self::RegionNotEmpty | Self::NoSpace)
    }

    pub(crate) fn flash<E: NorFlashError>(error: E) -> Self {
        Self::FlashIo(error.kind())
    }
}

impl From<NorFlashErrorKind> for Error {
    fn from(kind: NorFlashErrorKind) -> Self {
        Self::FlashIo(kind)
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
