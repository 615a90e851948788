//! One device holding bootloader, two slots of four 4K sectors, and a single scratch sector.

use std::vec::Vec;

use crate::{
    Slot,
    flash::{AreaId, FlashArea, FlashMap},
    image::{HEADER_SIZE, IMAGE_MAGIC, ImageFlags, ImageHeader, ImageVersion},
    loader::BootRequest,
    mock::MockFlash,
    trailer::TrailerLayout,
};

pub const PRIMARY: Slot = Slot::PRIMARY;
pub const SECONDARY: Slot = Slot::SECONDARY;

pub const SECTOR_SIZE: u32 = 0x1000;
pub const SECTOR_COUNT: u16 = 4;
pub const ALIGN: u32 = 8;

pub const BOOTLOADER_AREA: FlashArea = FlashArea {
    id: AreaId::Bootloader,
    device_id: 0,
    offset: 0x0000,
    size: 0x4000,
};
pub const PRIMARY_AREA: FlashArea = FlashArea {
    id: AreaId::Image(PRIMARY),
    device_id: 0,
    offset: 0x4000,
    size: 0x4000,
};
pub const SECONDARY_AREA: FlashArea = FlashArea {
    id: AreaId::Image(SECONDARY),
    device_id: 0,
    offset: 0x8000,
    size: 0x4000,
};
pub const SCRATCH_AREA: FlashArea = FlashArea {
    id: AreaId::Scratch,
    device_id: 0,
    offset: 0xc000,
    size: 0x1000,
};

pub fn map() -> FlashMap {
    FlashMap::new(&[BOOTLOADER_AREA, PRIMARY_AREA, SECONDARY_AREA, SCRATCH_AREA]).unwrap()
}

pub fn flash() -> MockFlash {
    MockFlash::new().with_device(0, 0x1_0000, SECTOR_SIZE, ALIGN)
}

pub fn layout() -> TrailerLayout {
    TrailerLayout::new(ALIGN, SECTOR_COUNT, 0xff).unwrap()
}

pub fn request(flash: &MockFlash) -> BootRequest<16> {
    BootRequest::build(&map(), flash).unwrap()
}

pub fn header(version: ImageVersion, image_size: u32) -> ImageHeader {
    ImageHeader {
        magic: IMAGE_MAGIC,
        load_addr: 0,
        hdr_size: HEADER_SIZE as u16,
        image_size,
        flags: ImageFlags::SHA256,
        version,
    }
}

/// Image bytes: header followed by a body derived from `seed`.
pub fn image(header: &ImageHeader, seed: u8) -> Vec<u8> {
    let mut bytes = Vec::from(header.encode());
    bytes.resize(usize::from(header.hdr_size), 0);
    bytes.extend((0..header.image_size).map(|i| seed.wrapping_add((i % 251) as u8)));
    bytes
}

/// Program an image and its SHA-256 TLV straight into `area`.
pub fn write_image(flash: &mut MockFlash, area: &FlashArea, header: &ImageHeader, seed: u8) {
    let bytes = image(header, seed);
    flash.poke(area.device_id, area.offset, &bytes);

    #[cfg(feature = "sha256")]
    {
        use sha2::{Digest, Sha256};

        use crate::image::{IMAGE_TLV_SHA256, Tlv};

        let tlv = Tlv {
            kind: IMAGE_TLV_SHA256,
            len: 32,
        };
        let at = area.offset + header.extent();
        flash.poke(area.device_id, at, &tlv.encode());
        flash.poke(area.device_id, at + 4, &Sha256::digest(&bytes));
    }
}
