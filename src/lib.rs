//! Power-fail safe image swapping for dual-slot bootloaders.
//!
//! A new firmware image is staged in the secondary slot and moved into the primary (execute) slot
//! sector by sector, using a scratch area as a temporary buffer for one sector at a time.
//! Progress is persisted in the image trailer at the end of the slots, such that a reset at any
//! point leaves the device in a state from which the swap can be resumed or rolled back.
//!
//! The entry point is [`boot_go`], which inspects the trailers, performs or resumes a swap if
//! required and tells the caller which image to jump into.
#![no_std]

#[cfg(all(feature = "log", feature = "defmt"))]
compile_error!("features `log` and `defmt` are mutually exclusive");

#[cfg(feature = "defmt")]
pub(crate) use defmt as log;

#[cfg(all(feature = "log", not(feature = "defmt")))]
pub(crate) use logger as log;

#[cfg(not(any(feature = "log", feature = "defmt")))]
pub(crate) mod log {
    macro_rules! info {
        ( $( $x:expr ),* ) => {};
    }
    pub(crate) use info;
    macro_rules! debug {
        ( $( $x:expr ),* ) => {};
    }
    pub(crate) use debug;
    macro_rules! trace {
        ( $( $x:expr ),* ) => {};
    }
    pub(crate) use trace;
    macro_rules! warner {
        ( $( $x:expr ),* ) => {};
    }
    pub(crate) use warner as warn;
    macro_rules! error {
        ( $( $x:expr ),* ) => {};
    }
    pub(crate) use error;
}

pub mod boot;
pub mod decision;
pub mod flash;
pub mod image;
pub mod loader;
pub mod manage;
pub mod state;
pub mod swap;
pub mod trailer;
pub mod verify;

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod mock;

use serde::{Deserialize, Serialize};

pub use decision::SwapType;
pub use flash::{AreaId, Flash, FlashArea, FlashError, FlashMap, Sector};
pub use image::{ImageFlags, ImageHeader, ImageVersion};
pub use loader::{BootRequest, BootResponse, boot_go};
pub use verify::{AcceptAll, Verifier};

/// Image slot with regards to the bootloader.
///
/// The primary slot is the one images are executed from, the secondary slot is where new images are staged.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Slot(pub(crate) u8);

impl Slot {
    pub const PRIMARY: Slot = Slot(0);
    pub const SECONDARY: Slot = Slot(1);

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Errors surfaced by the boot sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    #[error("flash operation failed: {0}")]
    Flash(#[from] FlashError),
    /// No recognizable or bootable image.
    #[error("no valid image header")]
    InvalidHeader,
    /// A trailer field holds a value that cannot be reconciled with the requested write.
    #[error("inconsistent image trailer")]
    CorruptTrailer,
    #[error("invalid flash configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Flash layout problems, detected before any flash is modified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    #[error("required flash area {0:?} is missing")]
    MissingArea(AreaId),
    #[error("flash area {0:?} is listed twice")]
    DuplicateArea(AreaId),
    #[error("flash areas {0:?} and {1:?} overlap")]
    OverlappingAreas(AreaId, AreaId),
    #[error("flash map is full")]
    TooManyAreas,
    #[error("more sectors than area descriptors available")]
    TooManySectors,
    #[error("sectors of {0:?} do not tile the area")]
    UnalignedSector(AreaId),
    #[error("slot sectors differ in size")]
    SectorMismatch,
    #[error("scratch area is smaller than the largest sector")]
    ScratchTooSmall,
    #[error("image trailer does not fit in the last sector")]
    TrailerTooLarge,
    #[error("write alignment is not a supported power of two")]
    BadAlignment,
    #[error("flash map blob could not be encoded or decoded")]
    Encoding,
}

pub(crate) const fn round_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}
