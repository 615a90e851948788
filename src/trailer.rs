//! Image trailer at the end of a slot (or of the scratch area).
//!
//! Fields in increasing offset order, each padded to the write alignment:
//!
//! ```text
//! status log   sector_count * 3 phases * elem
//! swap_size    u32
//! swap_type    u8
//! magic        16 bytes
//! copy_done    u8
//! image_ok     u8          <- last byte of the slot
//! ```
//!
//! Fields are written in exactly this order, so any prefix present in flash is a state that can
//! be interpreted. A field is written once; flash cannot move bits back to erased without erasing
//! the whole sector.

use crate::{
    ConfigError, Error,
    decision::SwapType,
    flash::{Flash, FlashArea},
    log, round_up,
};

pub const BOOT_MAGIC: [u8; 16] = [
    0x77, 0xc2, 0x95, 0xf3, 0x60, 0xd2, 0xef, 0x7f, 0x35, 0x52, 0x50, 0x0f, 0x2c, 0xb6, 0x79, 0x80,
];

pub const FLAG_SET: u8 = 0x01;

/// Number of copies of every status log entry.
pub const STATUS_REPLICAS: u32 = 3;

/// Status log entries per sector, one for every phase of a sector swap.
pub const STATUS_PHASES: u32 = 3;

/// Largest supported write alignment.
pub const MAX_WRITE_ALIGN: u32 = 64;

/// Trailer fields besides the status log.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Field {
    SwapSize,
    SwapType,
    Magic,
    CopyDone,
    ImageOk,
}

impl Field {
    const ORDER: [Field; 5] = [
        Field::SwapSize,
        Field::SwapType,
        Field::Magic,
        Field::CopyDone,
        Field::ImageOk,
    ];

    const fn raw_len(self) -> u32 {
        match self {
            Field::SwapSize => 4,
            Field::Magic => 16,
            Field::SwapType | Field::CopyDone | Field::ImageOk => 1,
        }
    }
}

/// Value to be written to a single trailer field.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FieldValue {
    SwapSize(u32),
    SwapType(SwapType),
    Magic,
    CopyDone,
    ImageOk,
}

impl FieldValue {
    pub const fn field(&self) -> Field {
        match self {
            FieldValue::SwapSize(_) => Field::SwapSize,
            FieldValue::SwapType(_) => Field::SwapType,
            FieldValue::Magic => Field::Magic,
            FieldValue::CopyDone => Field::CopyDone,
            FieldValue::ImageOk => Field::ImageOk,
        }
    }
}

/// Byte layout of a trailer, derived from the flash geometry.
///
/// Reader and writer compute the same layout from the same geometry, the layout itself is never stored.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TrailerLayout {
    align: u32,
    sector_count: u16,
    erased: u8,
}

impl TrailerLayout {
    pub fn new(align: u32, sector_count: u16, erased: u8) -> Result<Self, ConfigError> {
        if !align.is_power_of_two() || align > MAX_WRITE_ALIGN {
            return Err(ConfigError::BadAlignment);
        }
        Ok(Self {
            align,
            sector_count,
            erased,
        })
    }

    pub const fn erased(&self) -> u8 {
        self.erased
    }

    pub const fn sector_count(&self) -> u16 {
        self.sector_count
    }

    /// Size of a single status log entry, holding all replicas.
    pub const fn status_entry_size(&self) -> u32 {
        round_up(STATUS_REPLICAS, self.align)
    }

    pub const fn status_entry_offset(&self, sector: u16, phase: u32) -> u32 {
        (sector as u32 * STATUS_PHASES + phase) * self.status_entry_size()
    }

    const fn status_size(&self) -> u32 {
        self.sector_count as u32 * STATUS_PHASES * self.status_entry_size()
    }

    pub const fn field_size(&self, field: Field) -> u32 {
        round_up(field.raw_len(), self.align)
    }

    pub fn field_offset(&self, field: Field) -> u32 {
        let mut offset = self.status_size();
        for f in Field::ORDER {
            if f == field {
                break;
            }
            offset += self.field_size(f);
        }
        offset
    }

    /// Total size of the trailer.
    pub fn size(&self) -> u32 {
        self.field_offset(Field::ImageOk) + self.field_size(Field::ImageOk)
    }
}

/// Where a trailer lives: the area and the offset of the first trailer byte within it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TrailerLocation {
    pub area: FlashArea,
    pub offset: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MagicState {
    Good,
    Unset,
    Bad,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Flag {
    Unset,
    Set,
    Bad(u8),
}

impl Flag {
    fn from_raw(raw: u8, erased: u8) -> Flag {
        match raw {
            r if r == erased => Flag::Unset,
            FLAG_SET => Flag::Set,
            other => Flag::Bad(other),
        }
    }
}

/// Snapshot of the fixed trailer fields.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Trailer {
    pub swap_size: Option<u32>,
    pub swap_type: Option<SwapType>,
    pub magic: MagicState,
    pub copy_done: Flag,
    pub image_ok: Flag,
}

impl Trailer {
    /// State of a trailer that has never been written.
    pub const ERASED: Trailer = Trailer {
        swap_size: None,
        swap_type: None,
        magic: MagicState::Unset,
        copy_done: Flag::Unset,
        image_ok: Flag::Unset,
    };
}

async fn read_field<F: Flash>(
    flash: &mut F,
    location: &TrailerLocation,
    layout: &TrailerLayout,
    field: Field,
    buf: &mut [u8],
) -> Result<(), Error> {
    let offset = location.offset + layout.field_offset(field);
    flash.read(&location.area, offset, buf).await?;
    Ok(())
}

/// Read the fixed trailer fields, back to front.
///
/// Fields never written read back as erased, which is interpreted as unset.
pub async fn read_trailer<F: Flash>(
    flash: &mut F,
    location: &TrailerLocation,
    layout: &TrailerLayout,
) -> Result<Trailer, Error> {
    let erased = layout.erased();

    let mut byte = [0u8; 1];
    read_field(flash, location, layout, Field::ImageOk, &mut byte).await?;
    let image_ok = Flag::from_raw(byte[0], erased);

    read_field(flash, location, layout, Field::CopyDone, &mut byte).await?;
    let copy_done = Flag::from_raw(byte[0], erased);

    let mut magic = [0u8; 16];
    read_field(flash, location, layout, Field::Magic, &mut magic).await?;
    let magic = if magic == BOOT_MAGIC {
        MagicState::Good
    } else if magic.iter().all(|b| *b == erased) {
        MagicState::Unset
    } else {
        MagicState::Bad
    };

    read_field(flash, location, layout, Field::SwapType, &mut byte).await?;
    let swap_type = SwapType::from_raw(byte[0]);

    let mut size = [0u8; 4];
    read_field(flash, location, layout, Field::SwapSize, &mut size).await?;
    let swap_size = (!size.iter().all(|b| *b == erased)).then(|| u32::from_le_bytes(size));

    Ok(Trailer {
        swap_size,
        swap_type,
        magic,
        copy_done,
        image_ok,
    })
}

/// Program `content` into a single write-aligned element of `len` bytes, padding with the erased value.
///
/// Writing a value that is already present is a no-op. A partially programmed element holding a
/// prefix of the same value is completed. Any other non-erased content is left untouched and
/// reported as [`Error::CorruptTrailer`].
pub(crate) async fn program_element<F: Flash>(
    flash: &mut F,
    area: &FlashArea,
    offset: u32,
    content: &[u8],
    len: u32,
    erased: u8,
) -> Result<(), Error> {
    let len = len as usize;

    let mut target = [erased; MAX_WRITE_ALIGN as usize];
    target[..content.len()].copy_from_slice(content);
    let target = &target[..len];

    let mut current = [0u8; MAX_WRITE_ALIGN as usize];
    let current = &mut current[..len];
    flash.read(area, offset, current).await?;

    if current == target {
        return Ok(());
    }

    let programmable = current.iter().zip(target).all(|(c, t)| {
        *c == *t || *c == erased || (erased == 0xff && (*c & *t) == *t)
    });
    if !programmable {
        return Err(Error::CorruptTrailer);
    }

    if current.iter().any(|c| *c != erased) {
        log::warn!("completing partially written trailer element at {}", offset);
    }

    flash.write(area, offset, target).await?;
    Ok(())
}

/// Write exactly one trailer field.
pub async fn write_trailer_field<F: Flash>(
    flash: &mut F,
    location: &TrailerLocation,
    layout: &TrailerLayout,
    value: FieldValue,
) -> Result<(), Error> {
    let field = value.field();

    let size_bytes;
    let type_byte;
    let content: &[u8] = match value {
        FieldValue::SwapSize(size) => {
            size_bytes = size.to_le_bytes();
            &size_bytes
        }
        FieldValue::SwapType(swap_type) => {
            type_byte = [swap_type.to_raw()];
            &type_byte
        }
        FieldValue::Magic => &BOOT_MAGIC,
        FieldValue::CopyDone | FieldValue::ImageOk => &[FLAG_SET],
    };

    program_element(
        flash,
        &location.area,
        location.offset + layout.field_offset(field),
        content,
        layout.field_size(field),
        layout.erased(),
    )
    .await
}
