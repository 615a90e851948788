use embedded_storage_async::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};

use crate::flash::{Flash, FlashArea, FlashError, Sector};

impl From<NorFlashErrorKind> for FlashError {
    fn from(kind: NorFlashErrorKind) -> Self {
        match kind {
            NorFlashErrorKind::NotAligned => FlashError::NotAligned,
            NorFlashErrorKind::OutOfBounds => FlashError::OutOfBounds,
            _ => FlashError::Device,
        }
    }
}

/// Bytes read at once when an access has to be widened to `READ_SIZE` boundaries.
const BOUNCE_SIZE: usize = 256;

/// A single NOR flash device with uniform sectors of `F::ERASE_SIZE` bytes.
///
/// Only areas with a matching `device_id` can be accessed through it. Reads may start and end
/// anywhere, regardless of `F::READ_SIZE`.
pub struct NorFlashDevice<F> {
    device_id: u8,
    flash: F,
}

impl<F: NorFlash> NorFlashDevice<F> {
    pub const fn new(device_id: u8, flash: F) -> Self {
        Self { device_id, flash }
    }

    pub fn release(self) -> F {
        self.flash
    }

    fn locate(&self, area: &FlashArea, offset: u32, len: usize) -> Result<u32, FlashError> {
        if area.device_id != self.device_id {
            return Err(FlashError::Device);
        }
        let end = offset
            .checked_add(len as u32)
            .ok_or(FlashError::OutOfBounds)?;
        if end > area.size {
            return Err(FlashError::OutOfBounds);
        }
        Ok(area.offset + offset)
    }
}

impl<F: NorFlash> Flash for NorFlashDevice<F> {
    async fn read(
        &mut self,
        area: &FlashArea,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), FlashError> {
        let address = self.locate(area, offset, buf.len())?;
        let unit = F::READ_SIZE;
        if address as usize % unit == 0 && buf.len() % unit == 0 {
            return self
                .flash
                .read(address, buf)
                .await
                .map_err(|e| e.kind().into());
        }
        if unit > BOUNCE_SIZE {
            return Err(FlashError::NotAligned);
        }

        // Widen to whole read units, one window at a time.
        let window = BOUNCE_SIZE / unit * unit;
        let mut bounce = [0u8; BOUNCE_SIZE];
        let mut done = 0;
        while done < buf.len() {
            let at = address as usize + done;
            let skip = at % unit;
            let want = (buf.len() - done).min(window - skip);
            let len = (skip + want).div_ceil(unit) * unit;
            self.flash
                .read((at - skip) as u32, &mut bounce[..len])
                .await
                .map_err(|e| FlashError::from(e.kind()))?;
            buf[done..done + want].copy_from_slice(&bounce[skip..skip + want]);
            done += want;
        }
        Ok(())
    }

    async fn write(
        &mut self,
        area: &FlashArea,
        offset: u32,
        data: &[u8],
    ) -> Result<(), FlashError> {
        let address = self.locate(area, offset, data.len())?;
        self.flash
            .write(address, data)
            .await
            .map_err(|e| e.kind().into())
    }

    async fn erase(&mut self, area: &FlashArea, sector_offset: u32) -> Result<(), FlashError> {
        let from = self.locate(area, sector_offset, F::ERASE_SIZE)?;
        if from % F::ERASE_SIZE as u32 != 0 {
            return Err(FlashError::NotAligned);
        }
        self.flash
            .erase(from, from + F::ERASE_SIZE as u32)
            .await
            .map_err(|e| e.kind().into())
    }

    fn sector_info(&self, area: &FlashArea, index: u16) -> Option<Sector> {
        let size = F::ERASE_SIZE as u32;
        let offset = u32::from(index) * size;
        (area.device_id == self.device_id && offset + size <= area.size)
            .then_some(Sector { offset, size })
    }

    fn write_alignment(&self, _device_id: u8) -> u32 {
        F::WRITE_SIZE as u32
    }
}
