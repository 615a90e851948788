//! Image header found at offset 0 of every slot, and the TLV records following the image body.
//!
//! All fields are little endian and encoded explicitly byte by byte.
//!
//! ```text
//!  0  magic      u32
//!  4  load_addr  u32
//!  8  hdr_size   u16
//! 10  (pad)      u16
//! 12  img_size   u32
//! 16  flags      u32
//! 20  version    major u8, minor u8, revision u16, build u32
//! 28  (pad)      u32
//! ```

use core::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::{
    Error,
    flash::{Flash, FlashArea},
    log,
};

pub const IMAGE_MAGIC: u32 = 0x96f3_b83c;
pub const IMAGE_MAGIC_NONE: u32 = 0xffff_ffff;

/// Encoded size of [`ImageHeader`].
pub const HEADER_SIZE: usize = 32;

/// TLV holding the SHA-256 of header and body.
pub const IMAGE_TLV_SHA256: u8 = 0x01;
pub const TLV_HEADER_SIZE: usize = 4;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct ImageFlags: u32 {
        /// Position independent code.
        const PIC = 0x01;
        /// Image carries a SHA-256 TLV.
        const SHA256 = 0x02;
        /// Image must never be booted directly.
        const NON_BOOTABLE = 0x10;

        const _ = !0;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    pub build: u32,
}

impl ImageVersion {
    pub const fn new(major: u8, minor: u8, revision: u16) -> Self {
        Self {
            major,
            minor,
            revision,
            build: 0,
        }
    }
}

impl fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.revision, self.build
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ImageHeader {
    pub magic: u32,
    pub load_addr: u32,
    pub hdr_size: u16,
    pub image_size: u32,
    pub flags: ImageFlags,
    pub version: ImageVersion,
}

impl ImageHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        raw[0..4].copy_from_slice(&self.magic.to_le_bytes());
        raw[4..8].copy_from_slice(&self.load_addr.to_le_bytes());
        raw[8..10].copy_from_slice(&self.hdr_size.to_le_bytes());
        raw[12..16].copy_from_slice(&self.image_size.to_le_bytes());
        raw[16..20].copy_from_slice(&self.flags.bits().to_le_bytes());
        raw[20] = self.version.major;
        raw[21] = self.version.minor;
        raw[22..24].copy_from_slice(&self.version.revision.to_le_bytes());
        raw[24..28].copy_from_slice(&self.version.build.to_le_bytes());
        raw
    }

    /// Decode and validate a raw header.
    pub fn decode(raw: &[u8; HEADER_SIZE]) -> Result<Self, Error> {
        let u16_at = |at: usize| u16::from_le_bytes([raw[at], raw[at + 1]]);
        let u32_at =
            |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);

        let header = ImageHeader {
            magic: u32_at(0),
            load_addr: u32_at(4),
            hdr_size: u16_at(8),
            image_size: u32_at(12),
            flags: ImageFlags::from_bits_retain(u32_at(16)),
            version: ImageVersion {
                major: raw[20],
                minor: raw[21],
                revision: u16_at(22),
                build: u32_at(24),
            },
        };

        if header.magic != IMAGE_MAGIC || usize::from(header.hdr_size) < HEADER_SIZE {
            return Err(Error::InvalidHeader);
        }

        Ok(header)
    }

    /// Number of bytes covered by header and image body.
    pub const fn extent(&self) -> u32 {
        (self.hdr_size as u32).saturating_add(self.image_size)
    }

    pub const fn is_bootable(&self) -> bool {
        !self.flags.contains(ImageFlags::NON_BOOTABLE)
    }
}

/// Read the header of the image in `slot`.
///
/// `capacity` is the number of bytes available to the image; an image claiming to be larger is clamped.
pub async fn read_header<F: Flash>(
    flash: &mut F,
    slot: &FlashArea,
    capacity: u32,
) -> Result<ImageHeader, Error> {
    let mut raw = [0u8; HEADER_SIZE];
    flash.read(slot, 0, &mut raw).await?;

    if raw[..4] == IMAGE_MAGIC_NONE.to_le_bytes() {
        log::debug!("slot at {} is empty", slot.offset);
        return Err(Error::InvalidHeader);
    }

    let mut header = match ImageHeader::decode(&raw) {
        Ok(header) => header,
        Err(e) => {
            log::warn!("corrupt image header in slot at {}", slot.offset);
            return Err(e);
        }
    };

    let hdr_size = u32::from(header.hdr_size);
    if hdr_size > capacity {
        return Err(Error::InvalidHeader);
    }
    if header.image_size > capacity - hdr_size {
        log::warn!(
            "image of {} bytes exceeds slot capacity, clamping",
            header.image_size
        );
        header.image_size = capacity - hdr_size;
    }

    Ok(header)
}

/// Type-length record following the image body.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Tlv {
    pub kind: u8,
    pub len: u16,
}

impl Tlv {
    pub fn encode(&self) -> [u8; TLV_HEADER_SIZE] {
        let len = self.len.to_le_bytes();
        [self.kind, 0, len[0], len[1]]
    }

    pub fn decode(raw: &[u8; TLV_HEADER_SIZE]) -> Self {
        Tlv {
            kind: raw[0],
            len: u16::from_le_bytes([raw[2], raw[3]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use super::*;
    use crate::mock::single_scratch::{self, PRIMARY};

    pub const HEADER: ImageHeader = ImageHeader {
        magic: IMAGE_MAGIC,
        load_addr: 0,
        hdr_size: 0x20,
        image_size: 0x1234,
        flags: ImageFlags::SHA256,
        version: ImageVersion {
            major: 1,
            minor: 2,
            revision: 3,
            build: 4,
        },
    };

    #[test]
    fn layout() {
        let raw = HEADER.encode();
        assert_eq!(&raw[0..4], &[0x3c, 0xb8, 0xf3, 0x96]);
        assert_eq!(&raw[8..10], &[0x20, 0x00]);
        assert_eq!(&raw[12..16], &[0x34, 0x12, 0, 0]);
        assert_eq!(&raw[20..24], &[1, 2, 3, 0]);
        assert_eq!(ImageHeader::decode(&raw), Ok(HEADER));
    }

    #[test]
    fn erased_slot_is_invalid() {
        assert_eq!(
            ImageHeader::decode(&[0xff; HEADER_SIZE]),
            Err(Error::InvalidHeader)
        );
    }

    #[test]
    fn short_header_is_invalid() {
        let raw = ImageHeader {
            hdr_size: 16,
            ..HEADER
        }
        .encode();
        assert_eq!(ImageHeader::decode(&raw), Err(Error::InvalidHeader));
    }

    #[test]
    fn unknown_flags_survive() {
        let flags = ImageFlags::from_bits_retain(0x8000_0010);
        let raw = ImageHeader { flags, ..HEADER }.encode();
        let header = ImageHeader::decode(&raw).unwrap();
        assert_eq!(header.flags.bits(), 0x8000_0010);
        assert!(!header.is_bootable());
    }

    #[test]
    fn oversized_image_is_clamped() {
        let mut flash = single_scratch::flash();
        let area = single_scratch::map().slot(PRIMARY).copied().unwrap();
        let capacity = area.size - single_scratch::layout().size();

        for image_size in [capacity, 0xffff_fff0, u32::MAX] {
            let raw = ImageHeader {
                image_size,
                ..HEADER
            }
            .encode();
            flash.poke(0, area.offset, &raw);

            let header = block_on(read_header(&mut flash, &area, capacity)).unwrap();
            assert_eq!(header.extent(), capacity);
        }
    }

    #[test]
    fn empty_and_corrupt_slots() {
        let mut flash = single_scratch::flash();
        let area = single_scratch::map().slot(PRIMARY).copied().unwrap();
        assert_eq!(
            block_on(read_header(&mut flash, &area, 0x1000)),
            Err(Error::InvalidHeader)
        );

        flash.poke(0, area.offset, &[0x00; HEADER_SIZE]);
        assert_eq!(
            block_on(read_header(&mut flash, &area, 0x1000)),
            Err(Error::InvalidHeader)
        );
    }

    #[test]
    fn version_order() {
        assert!(ImageVersion::new(1, 1, 0) > ImageVersion::new(1, 0, 9));
        assert_eq!(std::format!("{}", HEADER.version), "1.2.3.4");
    }
}
