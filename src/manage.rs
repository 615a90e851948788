//! Trailer updates requested by the running application or by tooling.
//!
//! These are the only writes into trailer state from outside the boot sequence.

use crate::{
    Error, Slot,
    decision::{Decision, SwapType, decide},
    flash::Flash,
    image::{ImageHeader, read_header},
    loader::BootRequest,
    state::StatusSource,
    trailer::{FieldValue, Flag, MagicState, Trailer, read_trailer, write_trailer_field},
};

/// Request the image in the secondary slot to be swapped in on the next boot.
///
/// Without `permanent` the image is booted once, and reverted unless confirmed.
pub async fn mark_test<F: Flash, const N: usize>(
    flash: &mut F,
    req: &BootRequest<N>,
    permanent: bool,
) -> Result<(), Error> {
    read_header(flash, req.slot(Slot::SECONDARY), req.capacity()).await?;

    let location = req.trailer(Slot::SECONDARY);
    let layout = req.layout();
    write_trailer_field(flash, &location, layout, FieldValue::Magic).await?;
    if permanent {
        write_trailer_field(flash, &location, layout, FieldValue::ImageOk).await?;
    }
    Ok(())
}

/// Confirm the running image, preventing it from being reverted.
///
/// An image that was not swapped in has nothing to confirm.
pub async fn mark_confirmed<F: Flash, const N: usize>(
    flash: &mut F,
    req: &BootRequest<N>,
) -> Result<(), Error> {
    let location = req.trailer(Slot::PRIMARY);
    let layout = req.layout();
    let trailer = read_trailer(flash, &location, layout).await?;

    match (trailer.copy_done, trailer.image_ok) {
        (_, Flag::Bad(_)) => Err(Error::CorruptTrailer),
        (Flag::Unset, _) | (_, Flag::Set) => Ok(()),
        (_, Flag::Unset) => {
            write_trailer_field(flash, &location, layout, FieldValue::ImageOk).await
        }
    }
}

/// The swap the next boot would perform, or the one still in progress.
pub async fn pending_swap<F: Flash, const N: usize>(
    flash: &mut F,
    req: &BootRequest<N>,
) -> Result<SwapType, Error> {
    let layout = req.layout();
    let primary = read_trailer(flash, &req.trailer(Slot::PRIMARY), layout).await?;
    let scratch = read_trailer(flash, &req.scratch_trailer(), layout).await?;

    let in_progress = match StatusSource::locate(&primary, &scratch) {
        StatusSource::None => None,
        StatusSource::Primary => Some(primary),
        StatusSource::Scratch => Some(scratch),
    };
    if let Some(trailer) = in_progress {
        return Ok(trailer.swap_type.unwrap_or(SwapType::Test));
    }

    let secondary = read_trailer(flash, &req.trailer(Slot::SECONDARY), layout).await?;
    Ok(match decide(&primary, &secondary) {
        Decision::Swap(swap_type) => swap_type,
        Decision::FinishConfirm => SwapType::None,
    })
}

/// Snapshot of a single slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SlotInfo {
    /// Header of the image in the slot, if any.
    pub header: Option<ImageHeader>,
    pub trailer: Trailer,
}

impl SlotInfo {
    pub fn is_pending(&self) -> bool {
        self.trailer.magic == MagicState::Good && self.trailer.copy_done == Flag::Unset
    }

    pub fn is_confirmed(&self) -> bool {
        self.trailer.image_ok == Flag::Set
    }
}

pub async fn read_slot<F: Flash, const N: usize>(
    flash: &mut F,
    req: &BootRequest<N>,
    slot: Slot,
) -> Result<SlotInfo, Error> {
    let header = match read_header(flash, req.slot(slot), req.capacity()).await {
        Ok(header) => Some(header),
        Err(Error::InvalidHeader) => None,
        Err(e) => return Err(e),
    };
    let trailer = read_trailer(flash, &req.trailer(slot), req.layout()).await?;
    Ok(SlotInfo { header, trailer })
}
