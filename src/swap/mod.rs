//! Execution of a swap, resumable at any point.
//!
//! Sectors are swapped strictly one after another, starting with the sector holding the trailer,
//! with every phase recorded in the status log before the next one starts. The log itself moves
//! along with the trailer sector: while that sector is in flight its log lives in the scratch
//! trailer, afterwards in the trailer of the primary slot.

pub mod plan;

use crate::{
    Error, Slot,
    decision::SwapType,
    flash::{Flash, FlashArea},
    loader::BootRequest,
    log,
    state::{SectorState, StatusLog, StatusSource},
    trailer::{FieldValue, TrailerLocation, read_trailer, write_trailer_field},
};

use plan::{CopyOperation, Phase, SwapPlan};

/// Size of the buffer used to move data between areas.
pub const COPY_BUFFER_SIZE: usize = 256;

async fn is_erased<F: Flash>(flash: &mut F, area: &FlashArea, erased: u8) -> Result<bool, Error> {
    let mut buf = [0u8; COPY_BUFFER_SIZE];
    let mut offset = 0;
    while offset < area.size {
        let len = (area.size - offset).min(COPY_BUFFER_SIZE as u32) as usize;
        flash.read(area, offset, &mut buf[..len]).await?;
        if buf[..len].iter().any(|b| *b != erased) {
            return Ok(false);
        }
        offset += len as u32;
    }
    Ok(true)
}

/// Erase every sector in `sectors` overlapping `target` that is not erased already.
async fn erase_overlapping<F: Flash>(
    flash: &mut F,
    sectors: &[FlashArea],
    target: &FlashArea,
    erased: u8,
) -> Result<(), Error> {
    for sector in sectors.iter().filter(|s| s.overlaps(target)) {
        if !is_erased(flash, sector, erased).await? {
            flash.erase(sector, 0).await?;
        }
    }
    Ok(())
}

async fn copy<F: Flash, const N: usize>(
    flash: &mut F,
    req: &BootRequest<N>,
    operation: &CopyOperation,
) -> Result<(), Error> {
    erase_overlapping(
        flash,
        req.area_descriptors(),
        &operation.to,
        req.layout().erased(),
    )
    .await?;

    let mut buf = [0u8; COPY_BUFFER_SIZE];
    let mut offset = 0;
    while offset < operation.len {
        let len = (operation.len - offset).min(COPY_BUFFER_SIZE as u32) as usize;
        flash.read(&operation.from, offset, &mut buf[..len]).await?;
        flash.write(&operation.to, offset, &buf[..len]).await?;
        offset += len as u32;
    }
    Ok(())
}

/// Write the fixed fields making a trailer identify a swap in progress.
async fn open_trailer<F: Flash, const N: usize>(
    flash: &mut F,
    req: &BootRequest<N>,
    location: &TrailerLocation,
    swap_type: SwapType,
    swap_size: u32,
) -> Result<(), Error> {
    let layout = req.layout();
    write_trailer_field(flash, location, layout, FieldValue::SwapSize(swap_size)).await?;
    write_trailer_field(flash, location, layout, FieldValue::SwapType(swap_type)).await?;
    write_trailer_field(flash, location, layout, FieldValue::Magic).await
}

/// A swap in flight.
struct Swap<'a, const N: usize> {
    req: &'a BootRequest<N>,
    plan: SwapPlan<'a, N>,
    swap_type: SwapType,
    swap_size: u32,
    primary_log: StatusLog,
    scratch_log: StatusLog,
}

impl<'a, const N: usize> Swap<'a, N> {
    fn new(req: &'a BootRequest<N>, swap_type: SwapType, swap_size: u32) -> Self {
        let layout = *req.layout();
        Self {
            req,
            plan: SwapPlan::new(req, swap_size),
            swap_type,
            swap_size,
            primary_log: StatusLog::new(req.trailer(Slot::PRIMARY), layout),
            scratch_log: StatusLog::new(req.scratch_trailer(), layout),
        }
    }

    /// Execute `phase` for `sector` and record it.
    async fn step<F: Flash>(&self, flash: &mut F, sector: u16, phase: Phase) -> Result<(), Error> {
        copy(flash, self.req, &self.plan.plan(sector, phase)).await?;

        let state = phase.completes();
        if sector != self.plan.trailer_sector() {
            self.primary_log
                .record_sector_state(flash, sector, state)
                .await?;
        } else {
            match phase {
                Phase::A2S => {
                    self.scratch_log
                        .record_sector_state(flash, sector, state)
                        .await?;
                    open_trailer(
                        flash,
                        self.req,
                        &self.req.scratch_trailer(),
                        self.swap_type,
                        self.swap_size,
                    )
                    .await?;
                }
                Phase::B2A => {
                    for state in [SectorState::ScratchSaved, state] {
                        self.primary_log
                            .record_sector_state(flash, sector, state)
                            .await?;
                    }
                    open_trailer(
                        flash,
                        self.req,
                        &self.req.trailer(Slot::PRIMARY),
                        self.swap_type,
                        self.swap_size,
                    )
                    .await?;
                }
                Phase::S2B => {
                    self.primary_log
                        .record_sector_state(flash, sector, state)
                        .await?;
                }
            }
        }

        log::trace!("sector {} {:?} done", sector, phase);
        Ok(())
    }

    /// Bring every sector to `Done`, starting from what `source` says has happened already.
    async fn run<F: Flash>(&self, flash: &mut F, source: StatusSource) -> Result<(), Error> {
        let trailer_sector = self.plan.trailer_sector();

        for sector in self.plan.sectors() {
            let state = if sector == trailer_sector {
                match source {
                    StatusSource::None => SectorState::Unset,
                    StatusSource::Scratch => self
                        .scratch_log
                        .read_sector_state(flash, sector)
                        .await?
                        .max(SectorState::ScratchSaved),
                    StatusSource::Primary => self
                        .primary_log
                        .read_sector_state(flash, sector)
                        .await?
                        .max(SectorState::PrimaryWritten),
                }
            } else {
                self.primary_log.read_sector_state(flash, sector).await?
            };

            for phase in Phase::remaining(state) {
                self.step(flash, sector, *phase).await?;
            }
        }

        self.complete(flash).await
    }

    async fn complete<F: Flash>(&self, flash: &mut F) -> Result<(), Error> {
        let scratch = *self.req.scratch();
        erase_overlapping(
            flash,
            self.req.scratch_sectors(),
            &scratch,
            self.req.layout().erased(),
        )
        .await?;

        let location = self.req.trailer(Slot::PRIMARY);
        let layout = self.req.layout();
        write_trailer_field(flash, &location, layout, FieldValue::CopyDone).await?;
        if self.swap_type.confirms() {
            write_trailer_field(flash, &location, layout, FieldValue::ImageOk).await?;
        }

        log::info!("{:?} swap complete", self.swap_type);
        Ok(())
    }
}

/// Start a fresh swap of `swap_size` bytes.
pub async fn start<F: Flash, const N: usize>(
    flash: &mut F,
    req: &BootRequest<N>,
    swap_type: SwapType,
    swap_size: u32,
) -> Result<(), Error> {
    log::info!("starting {:?} swap of {} bytes", swap_type, swap_size);
    Swap::new(req, swap_type, swap_size)
        .run(flash, StatusSource::None)
        .await
}

/// Complete a swap that was interrupted, if any, returning its type.
pub async fn resume<F: Flash, const N: usize>(
    flash: &mut F,
    req: &BootRequest<N>,
) -> Result<Option<SwapType>, Error> {
    let layout = req.layout();
    let primary = read_trailer(flash, &req.trailer(Slot::PRIMARY), layout).await?;
    let scratch = read_trailer(flash, &req.scratch_trailer(), layout).await?;

    let source = StatusSource::locate(&primary, &scratch);
    let trailer = match source {
        StatusSource::None => return Ok(None),
        StatusSource::Primary => primary,
        StatusSource::Scratch => scratch,
    };

    let swap_size = match trailer.swap_size {
        Some(size) if size <= req.slot_size() => size,
        _ => {
            log::warn!("unreadable swap size, swapping the whole slot");
            req.slot_size()
        }
    };
    let swap_type = match trailer.swap_type {
        Some(swap_type) if swap_type != SwapType::None => swap_type,
        _ => {
            log::warn!("unreadable swap type, assuming test");
            SwapType::Test
        }
    };

    let swap = Swap::new(req, swap_type, swap_size);
    if source == StatusSource::Primary {
        let (done, total) = swap
            .primary_log
            .progress(flash, swap.plan.sectors())
            .await?;
        log::info!(
            "resuming {:?} swap, {} of {} sectors done",
            swap_type,
            done,
            total
        );
    } else {
        log::info!("resuming {:?} swap from scratch", swap_type);
    }

    swap.run(flash, source).await?;
    Ok(Some(swap_type))
}
