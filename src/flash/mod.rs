//! Flash areas and the driver seam used to access them.
//!
//! The boot sequence never talks to hardware directly: every read, write and erase goes
//! through [`Flash`], which any device backend (NOR flash, flash simulated in RAM) implements.
//! Which part of which device is used for what is described by a [`FlashMap`].

mod nor;

pub use nor::NorFlashDevice;

use heapless::Vec;
use serde::{Deserialize, Serialize};

use crate::{ConfigError, Slot};

/// Maximum number of areas in a [`FlashMap`].
pub const MAX_AREAS: usize = 8;

/// Logical purpose of a flash area.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AreaId {
    Bootloader,
    Image(Slot),
    Scratch,
}

/// A contiguous region of a flash device.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashArea {
    pub id: AreaId,
    pub device_id: u8,
    /// Offset of the area from the start of the device.
    pub offset: u32,
    pub size: u32,
}

impl FlashArea {
    pub const fn end(&self) -> u32 {
        self.offset + self.size
    }

    pub const fn overlaps(&self, other: &FlashArea) -> bool {
        self.device_id == other.device_id && self.offset < other.end() && other.offset < self.end()
    }

    /// Narrow this area down to `size` bytes starting at `offset` within it.
    pub(crate) const fn sub(&self, offset: u32, size: u32) -> FlashArea {
        FlashArea {
            id: self.id,
            device_id: self.device_id,
            offset: self.offset + offset,
            size,
        }
    }
}

/// Erasable unit within an area, with its offset relative to the start of the area.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sector {
    pub offset: u32,
    pub size: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    #[error("access outside of the area")]
    OutOfBounds,
    #[error("access not aligned to the write size")]
    NotAligned,
    #[error("write to non-erased flash")]
    NotErased,
    #[error("device failure")]
    Device,
}

/// Representation of the flash devices holding the slots and the scratch area.
///
/// All offsets are relative to the start of the given area.
#[allow(async_fn_in_trait)]
pub trait Flash {
    async fn read(&mut self, area: &FlashArea, offset: u32, buf: &mut [u8])
    -> Result<(), FlashError>;

    /// Program `data`; its length must be a multiple of the write alignment of the device.
    async fn write(&mut self, area: &FlashArea, offset: u32, data: &[u8])
    -> Result<(), FlashError>;

    /// Erase the sector that starts at `sector_offset`.
    async fn erase(&mut self, area: &FlashArea, sector_offset: u32) -> Result<(), FlashError>;

    /// Sector number `index` of the area, if the area has that many sectors.
    fn sector_info(&self, area: &FlashArea, index: u16) -> Option<Sector>;

    /// Minimum write size of the device, in bytes.
    fn write_alignment(&self, device_id: u8) -> u32;

    /// Value of every byte after an erase.
    fn erased_value(&self, _device_id: u8) -> u8 {
        0xff
    }
}

/// Validated table of flash areas, immutable once built.
///
/// Areas never overlap, and are ordered by device and offset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashMap {
    areas: Vec<FlashArea, MAX_AREAS>,
}

impl FlashMap {
    pub fn new(areas: &[FlashArea]) -> Result<Self, ConfigError> {
        let mut map = FlashMap { areas: Vec::new() };
        for area in areas {
            map.insert(*area)?;
        }
        Ok(map)
    }

    fn insert(&mut self, area: FlashArea) -> Result<(), ConfigError> {
        for existing in &self.areas {
            if existing.id == area.id {
                return Err(ConfigError::DuplicateArea(area.id));
            }
            if existing.overlaps(&area) {
                return Err(ConfigError::OverlappingAreas(existing.id, area.id));
            }
        }

        let position = self
            .areas
            .iter()
            .position(|a| (a.device_id, a.offset) > (area.device_id, area.offset))
            .unwrap_or(self.areas.len());
        self.areas
            .insert(position, area)
            .map_err(|_| ConfigError::TooManyAreas)
    }

    pub fn find(&self, id: AreaId) -> Option<&FlashArea> {
        self.areas.iter().find(|a| a.id == id)
    }

    pub fn slot(&self, slot: Slot) -> Result<&FlashArea, ConfigError> {
        let id = AreaId::Image(slot);
        self.find(id).ok_or(ConfigError::MissingArea(id))
    }

    pub fn scratch(&self) -> Result<&FlashArea, ConfigError> {
        self.find(AreaId::Scratch)
            .ok_or(ConfigError::MissingArea(AreaId::Scratch))
    }

    pub fn areas(&self) -> &[FlashArea] {
        &self.areas
    }

    /// Decode a map shipped as a postcard blob, re-validating it.
    #[cfg(feature = "map_blob")]
    pub fn from_blob(blob: &[u8]) -> Result<Self, ConfigError> {
        let decoded: FlashMap = postcard::from_bytes(blob).map_err(|_| ConfigError::Encoding)?;
        FlashMap::new(&decoded.areas)
    }

    #[cfg(feature = "map_blob")]
    pub fn to_blob<'a>(&self, buffer: &'a mut [u8]) -> Result<&'a mut [u8], ConfigError> {
        postcard::to_slice(self, buffer).map_err(|_| ConfigError::Encoding)
    }
}
