pub mod single_scratch;

use std::{collections::BTreeMap, vec, vec::Vec};

use crate::flash::{Flash, FlashArea, FlashError, Sector};

#[derive(Debug)]
pub struct WearTracker(BTreeMap<(u8, u32), usize>);

impl WearTracker {
    pub const fn new() -> Self {
        WearTracker(BTreeMap::new())
    }

    pub fn increase(&mut self, device_id: u8, sector_offset: u32) {
        if let Some(wear) = self.0.get_mut(&(device_id, sector_offset)) {
            *wear += 1;
        } else {
            self.0.insert((device_id, sector_offset), 1);
        }
    }

    /// Check wear on all sectors of an area for worst wear.
    pub fn check_area(&self, area: &FlashArea, wear_level: usize) -> bool {
        self.0
            .iter()
            .filter(|((device, offset), _)| {
                *device == area.device_id && *offset >= area.offset && *offset < area.end()
            })
            .all(|(_, v)| *v <= wear_level)
    }
}

struct MockDevice {
    id: u8,
    sector_size: u32,
    align: u32,
    data: Vec<u8>,
}

/// Flash simulated in RAM, with NOR semantics: erase sets every byte to `0xff`, and a write can only clear bits.
///
/// Power can be cut after a number of writes and erases, optionally tearing the interrupted write.
/// While powered off every access fails.
pub struct MockFlash {
    devices: Vec<MockDevice>,
    pub wear: WearTracker,
    budget: Option<usize>,
    tear: bool,
    powered: bool,
    writes: usize,
    erases: usize,
}

impl MockFlash {
    pub fn new() -> Self {
        MockFlash {
            devices: Vec::new(),
            wear: WearTracker::new(),
            budget: None,
            tear: false,
            powered: true,
            writes: 0,
            erases: 0,
        }
    }

    pub fn with_device(mut self, id: u8, size: u32, sector_size: u32, align: u32) -> Self {
        self.devices.push(MockDevice {
            id,
            sector_size,
            align,
            data: vec![0xff; size as usize],
        });
        self
    }

    fn device(&self, id: u8) -> &MockDevice {
        self.devices.iter().find(|d| d.id == id).unwrap()
    }

    fn device_mut(&mut self, id: u8) -> &mut MockDevice {
        self.devices.iter_mut().find(|d| d.id == id).unwrap()
    }

    /// Let `ops` more writes or erases succeed, then lose power during the next one.
    ///
    /// A torn write programs only its first byte, a torn erase only the first half of the sector.
    pub fn cut_power_after(&mut self, ops: usize, tear: bool) {
        self.budget = Some(ops);
        self.tear = tear;
    }

    pub fn power_on(&mut self) {
        self.budget = None;
        self.powered = true;
    }

    pub fn write_count(&self) -> usize {
        self.writes
    }

    pub fn erase_count(&self) -> usize {
        self.erases
    }

    /// Overwrite raw device content, bypassing flash semantics.
    pub fn poke(&mut self, device_id: u8, offset: u32, bytes: &[u8]) {
        let start = offset as usize;
        self.device_mut(device_id).data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn peek(&self, device_id: u8, offset: u32, len: usize) -> &[u8] {
        let start = offset as usize;
        &self.device(device_id).data[start..start + len]
    }

    pub fn area_bytes(&self, area: &FlashArea) -> Vec<u8> {
        self.peek(area.device_id, area.offset, area.size as usize)
            .to_vec()
    }

    pub fn snapshot(&self) -> Vec<Vec<u8>> {
        self.devices.iter().map(|d| d.data.clone()).collect()
    }

    fn check(&self, area: &FlashArea, offset: u32, len: usize) -> Result<usize, FlashError> {
        if !self.powered {
            return Err(FlashError::Device);
        }
        let device = self.device(area.device_id);
        let end = offset as usize + len;
        if end > area.size as usize || (area.offset as usize + end) > device.data.len() {
            return Err(FlashError::OutOfBounds);
        }
        Ok(area.offset as usize + offset as usize)
    }

    /// Returns whether the mutating operation may proceed normally.
    fn consume(&mut self) -> bool {
        match self.budget {
            Some(0) => {
                self.powered = false;
                false
            }
            Some(ref mut ops) => {
                *ops -= 1;
                true
            }
            None => true,
        }
    }
}

impl Flash for MockFlash {
    async fn read(
        &mut self,
        area: &FlashArea,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), FlashError> {
        let start = self.check(area, offset, buf.len())?;
        buf.copy_from_slice(&self.device(area.device_id).data[start..start + buf.len()]);
        Ok(())
    }

    async fn write(
        &mut self,
        area: &FlashArea,
        offset: u32,
        data: &[u8],
    ) -> Result<(), FlashError> {
        let start = self.check(area, offset, data.len())?;
        let device = self.device(area.device_id);
        if start as u32 % device.align != 0 || data.len() as u32 % device.align != 0 {
            return Err(FlashError::NotAligned);
        }
        let current = &device.data[start..start + data.len()];
        if current.iter().zip(data).any(|(c, d)| c & d != *d) {
            return Err(FlashError::NotErased);
        }

        let proceed = self.consume();
        let tear = self.tear;
        let device = self.device_mut(area.device_id);
        if !proceed {
            if tear && !data.is_empty() {
                device.data[start] &= data[0];
            }
            return Err(FlashError::Device);
        }

        for (cell, byte) in device.data[start..start + data.len()].iter_mut().zip(data) {
            *cell &= *byte;
        }
        self.writes += 1;
        Ok(())
    }

    async fn erase(&mut self, area: &FlashArea, sector_offset: u32) -> Result<(), FlashError> {
        let sector_size = self.device(area.device_id).sector_size;
        let start = self.check(area, sector_offset, sector_size as usize)?;
        if start as u32 % sector_size != 0 {
            return Err(FlashError::NotAligned);
        }

        let proceed = self.consume();
        let tear = self.tear;
        let device = self.device_mut(area.device_id);
        let len = if proceed {
            sector_size as usize
        } else if tear {
            sector_size as usize / 2
        } else {
            return Err(FlashError::Device);
        };
        device.data[start..start + len].fill(0xff);
        if !proceed {
            return Err(FlashError::Device);
        }

        self.erases += 1;
        self.wear.increase(area.device_id, start as u32);
        Ok(())
    }

    fn sector_info(&self, area: &FlashArea, index: u16) -> Option<Sector> {
        let size = self.device(area.device_id).sector_size;
        let offset = u32::from(index) * size;
        (offset + size <= area.size).then_some(Sector { offset, size })
    }

    fn write_alignment(&self, device_id: u8) -> u32 {
        self.device(device_id).align
    }
}
