//! Boot request validation and the boot sequence itself.

use heapless::Vec;

use crate::{
    ConfigError, Error, Slot,
    boot::Boot,
    decision::{Decision, SwapType, decide},
    flash::{Flash, FlashArea, FlashMap, Sector},
    image::{ImageHeader, read_header},
    log, swap,
    trailer::{FieldValue, TrailerLayout, TrailerLocation, read_trailer, write_trailer_field},
    verify::Verifier,
};

fn sectors<'a, F: Flash>(flash: &'a F, area: &'a FlashArea) -> impl Iterator<Item = Sector> + 'a {
    (0..=u16::MAX).map_while(move |index| flash.sector_info(area, index))
}

/// Check that the sectors of `area` tile it exactly, returning the largest sector size.
fn check_tiling<F: Flash>(flash: &F, area: &FlashArea) -> Result<u32, ConfigError> {
    let mut expected = 0;
    let mut largest = 0;
    for sector in sectors(flash, area) {
        if sector.offset != expected || sector.size == 0 {
            return Err(ConfigError::UnalignedSector(area.id));
        }
        expected += sector.size;
        largest = largest.max(sector.size);
    }

    if expected != area.size {
        return Err(ConfigError::UnalignedSector(area.id));
    }
    Ok(largest)
}

/// Validated description of the areas taking part in a swap, down to individual sectors.
///
/// `N` is the maximum number of sector descriptors: the swapped sectors of both slots plus the
/// sectors of scratch.
///
/// Slots may be laid out differently; only the leading sectors they have in common (equal in
/// size) take part in a swap. Their summed size is the effective slot size, at the end of which
/// the trailer lives.
#[derive(Clone, Debug)]
pub struct BootRequest<const N: usize> {
    area_descriptors: Vec<FlashArea, N>,
    slot_area_indices: [usize; 2],
    scratch_area_index: usize,
    image_area_count: u16,
    slots: [FlashArea; 2],
    scratch: FlashArea,
    slot_size: u32,
    layout: TrailerLayout,
}

impl<const N: usize> BootRequest<N> {
    /// Validate the flash map against the geometry reported by `flash`.
    ///
    /// Fails before any flash is touched.
    pub fn build<F: Flash>(map: &FlashMap, flash: &F) -> Result<Self, ConfigError> {
        let primary = *map.slot(Slot::PRIMARY)?;
        let secondary = *map.slot(Slot::SECONDARY)?;
        let scratch = *map.scratch()?;

        check_tiling(flash, &primary)?;
        check_tiling(flash, &secondary)?;
        check_tiling(flash, &scratch)?;

        let mut image_area_count: u16 = 0;
        let mut slot_size = 0;
        let mut largest = 0;
        let mut last = 0;
        for (a, b) in sectors(flash, &primary).zip(sectors(flash, &secondary)) {
            if a.size != b.size {
                break;
            }
            image_area_count += 1;
            slot_size += a.size;
            largest = largest.max(a.size);
            last = a.size;
        }

        if image_area_count == 0 {
            return Err(ConfigError::SectorMismatch);
        }
        if primary.size != secondary.size {
            log::warn!(
                "asymmetric slots, swapping {} bytes in {} sectors",
                slot_size,
                image_area_count
            );
        }
        if scratch.size < largest {
            return Err(ConfigError::ScratchTooSmall);
        }

        let align = [primary.device_id, secondary.device_id, scratch.device_id]
            .into_iter()
            .map(|device_id| flash.write_alignment(device_id))
            .fold(1, u32::max);
        let layout = TrailerLayout::new(
            align,
            image_area_count,
            flash.erased_value(primary.device_id),
        )?;
        if layout.size() > last || layout.size() > scratch.size {
            return Err(ConfigError::TrailerTooLarge);
        }

        let mut area_descriptors = Vec::new();
        for area in [&primary, &secondary] {
            for sector in sectors(flash, area).take(usize::from(image_area_count)) {
                area_descriptors
                    .push(area.sub(sector.offset, sector.size))
                    .map_err(|_| ConfigError::TooManySectors)?;
            }
        }
        let scratch_area_index = area_descriptors.len();
        for sector in sectors(flash, &scratch) {
            area_descriptors
                .push(scratch.sub(sector.offset, sector.size))
                .map_err(|_| ConfigError::TooManySectors)?;
        }

        Ok(Self {
            area_descriptors,
            slot_area_indices: [0, usize::from(image_area_count)],
            scratch_area_index,
            image_area_count,
            slots: [primary, secondary],
            scratch,
            slot_size,
            layout,
        })
    }

    /// All sector descriptors: swapped sectors of the primary slot, of the secondary slot, then scratch.
    pub fn area_descriptors(&self) -> &[FlashArea] {
        &self.area_descriptors
    }

    /// Number of sectors per slot taking part in a swap.
    pub const fn image_area_count(&self) -> u16 {
        self.image_area_count
    }

    pub const fn slot(&self, slot: Slot) -> &FlashArea {
        &self.slots[slot.index()]
    }

    pub const fn scratch(&self) -> &FlashArea {
        &self.scratch
    }

    /// Sector `index` of `slot`, as an area of its own.
    pub fn sector(&self, slot: Slot, index: u16) -> &FlashArea {
        &self.area_descriptors[self.slot_area_indices[slot.index()] + usize::from(index)]
    }

    pub fn slot_sectors(&self, slot: Slot) -> &[FlashArea] {
        let start = self.slot_area_indices[slot.index()];
        &self.area_descriptors[start..start + usize::from(self.image_area_count)]
    }

    pub fn scratch_sectors(&self) -> &[FlashArea] {
        &self.area_descriptors[self.scratch_area_index..]
    }

    /// Effective size of either slot.
    pub const fn slot_size(&self) -> u32 {
        self.slot_size
    }

    /// Bytes available to an image: the effective slot size minus the trailer.
    pub fn capacity(&self) -> u32 {
        self.slot_size - self.layout.size()
    }

    pub const fn layout(&self) -> &TrailerLayout {
        &self.layout
    }

    pub fn trailer(&self, slot: Slot) -> TrailerLocation {
        TrailerLocation {
            area: self.slots[slot.index()],
            offset: self.capacity(),
        }
    }

    pub fn scratch_trailer(&self) -> TrailerLocation {
        TrailerLocation {
            area: self.scratch,
            offset: self.scratch.size - self.layout.size(),
        }
    }

    /// The part of `slot` an image may occupy.
    pub(crate) fn image_area(&self, slot: Slot) -> FlashArea {
        self.slots[slot.index()].sub(0, self.capacity())
    }
}

/// The image to execute, after any swap has been performed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BootResponse {
    pub header: ImageHeader,
    pub flash_id: u8,
    /// Offset of the image header within the device.
    pub image_addr: u32,
    /// Swap performed during this boot.
    pub swap: SwapType,
}

impl BootResponse {
    /// Offset of the image body, typically the vector table, within the device.
    pub const fn entry_offset(&self) -> u32 {
        self.image_addr + self.header.hdr_size as u32
    }

    /// Jump into the image, with the device memory mapped at `base`.
    ///
    /// # Safety
    /// The image must have been verified and `base` must be where the device is mapped.
    pub unsafe fn jump<B: Boot>(&self, base: u32) -> ! {
        let addr = (base + self.entry_offset()) as *const u32;
        unsafe { B::boot(addr) }
    }
}

/// Read and check the header of `slot`, yielding nothing for an empty or unbootable slot.
async fn bootable_header<F: Flash, V: Verifier<F>, const N: usize>(
    flash: &mut F,
    req: &BootRequest<N>,
    verifier: &mut V,
    slot: Slot,
) -> Result<Option<ImageHeader>, Error> {
    let header = match read_header(flash, req.slot(slot), req.capacity()).await {
        Ok(header) => header,
        Err(Error::InvalidHeader) => return Ok(None),
        Err(e) => return Err(e),
    };

    if !header.is_bootable() {
        log::warn!("image in slot {} is not bootable", slot.index());
        return Ok(None);
    }
    if !verifier.verify(flash, &req.image_area(slot), &header).await {
        log::warn!("image in slot {} failed verification", slot.index());
        return Ok(None);
    }
    Ok(Some(header))
}

async fn erase_slot<F: Flash, const N: usize>(
    flash: &mut F,
    req: &BootRequest<N>,
    slot: Slot,
) -> Result<(), Error> {
    for sector in req.slot_sectors(slot) {
        flash.erase(sector, 0).await?;
    }
    Ok(())
}

/// Check the images involved in `swap_type`, returning the swap that is actually allowed.
async fn validate<F: Flash, V: Verifier<F>, const N: usize>(
    flash: &mut F,
    req: &BootRequest<N>,
    verifier: &mut V,
    swap_type: SwapType,
) -> Result<SwapType, Error> {
    match swap_type {
        SwapType::Test | SwapType::Permanent => {
            if bootable_header(flash, req, verifier, Slot::SECONDARY)
                .await?
                .is_some()
            {
                return Ok(swap_type);
            }
            log::warn!("refusing {:?} swap, erasing secondary slot", swap_type);
            erase_slot(flash, req, Slot::SECONDARY).await?;
        }
        SwapType::Revert => {
            if read_header(flash, req.slot(Slot::SECONDARY), req.capacity())
                .await
                .is_ok()
            {
                return Ok(swap_type);
            }
            log::warn!("no image to revert to");
        }
        SwapType::None => {}
    }

    if bootable_header(flash, req, verifier, Slot::PRIMARY)
        .await?
        .is_some()
    {
        return Ok(SwapType::None);
    }

    if bootable_header(flash, req, verifier, Slot::SECONDARY)
        .await?
        .is_some()
    {
        log::warn!("primary slot unusable, installing secondary image");
        return Ok(SwapType::Permanent);
    }

    log::error!("no bootable image");
    Err(Error::InvalidHeader)
}

/// Number of bytes a swap has to move: the largest image extent among both slots.
async fn swap_size<F: Flash, const N: usize>(
    flash: &mut F,
    req: &BootRequest<N>,
) -> Result<u32, Error> {
    let mut size = 0;
    for slot in [Slot::PRIMARY, Slot::SECONDARY] {
        match read_header(flash, req.slot(slot), req.capacity()).await {
            Ok(header) => size = size.max(header.extent()),
            Err(Error::InvalidHeader) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(size)
}

/// Decide on, and perform, the swap required this boot, and locate the image to execute.
///
/// An interrupted swap is always completed first. On error no image must be booted; the flash
/// is left in a state the next call can resume from.
pub async fn boot_go<F: Flash, V: Verifier<F>, const N: usize>(
    flash: &mut F,
    req: &BootRequest<N>,
    verifier: &mut V,
) -> Result<BootResponse, Error> {
    let swap = match swap::resume(flash, req).await? {
        Some(swap_type) => swap_type,
        None => {
            let layout = req.layout();
            let primary = read_trailer(flash, &req.trailer(Slot::PRIMARY), layout).await?;
            let secondary = read_trailer(flash, &req.trailer(Slot::SECONDARY), layout).await?;

            let decision = decide(&primary, &secondary);
            log::info!("boot decision: {:?}", decision);

            let swap_type = match decision {
                Decision::Swap(swap_type) => swap_type,
                Decision::FinishConfirm => {
                    write_trailer_field(
                        flash,
                        &req.trailer(Slot::PRIMARY),
                        layout,
                        FieldValue::ImageOk,
                    )
                    .await?;
                    SwapType::None
                }
            };

            let swap_type = validate(flash, req, verifier, swap_type).await?;
            if swap_type != SwapType::None {
                let size = swap_size(flash, req).await?;
                swap::start(flash, req, swap_type, size).await?;
            }
            swap_type
        }
    };

    let primary = req.slot(Slot::PRIMARY);
    let header = read_header(flash, primary, req.capacity()).await?;
    if !header.is_bootable() {
        return Err(Error::InvalidHeader);
    }

    log::info!("booting image version {}", header.version);

    Ok(BootResponse {
        header,
        flash_id: primary.device_id,
        image_addr: primary.offset,
        swap,
    })
}
