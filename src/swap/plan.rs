//! Planning of the sector swap using 'S <- A <- B <- S'.
//!
//! The primary (A) slot sector is first copied over to scratch (S), before writing the
//! secondary (B) slot sector to the primary (A) slot sector. Finally scratch (S) is written to
//! the secondary (B) slot sector.
//!
//! This results in the primary and secondary slots enduring a single erasure on every swapped
//! sector, whilst scratch endures one erasure for every swapped sector.

use crate::{Slot, flash::FlashArea, loader::BootRequest, state::SectorState};

/// Logical phases of swapping a single sector.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    A2S,
    B2A,
    S2B,
}

impl Phase {
    /// The state a sector is in once this phase has been executed.
    pub const fn completes(self) -> SectorState {
        match self {
            Phase::A2S => SectorState::ScratchSaved,
            Phase::B2A => SectorState::PrimaryWritten,
            Phase::S2B => SectorState::Done,
        }
    }

    /// Phases still to be executed for a sector in `state`.
    pub const fn remaining(state: SectorState) -> &'static [Phase] {
        match state {
            SectorState::Unset => &[Phase::A2S, Phase::B2A, Phase::S2B],
            SectorState::ScratchSaved => &[Phase::B2A, Phase::S2B],
            SectorState::PrimaryWritten => &[Phase::S2B],
            SectorState::Done => &[],
        }
    }
}

/// Erase `to` (if necessary) and copy the first `len` bytes of `from` to the start of `to`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CopyOperation {
    pub from: FlashArea,
    pub to: FlashArea,
    pub len: u32,
}

/// The sectors involved in a swap of `swap_size` bytes, and the copies they take.
pub struct SwapPlan<'a, const N: usize> {
    req: &'a BootRequest<N>,
    swap_size: u32,
}

impl<'a, const N: usize> SwapPlan<'a, N> {
    pub const fn new(req: &'a BootRequest<N>, swap_size: u32) -> Self {
        Self { req, swap_size }
    }

    /// Index of the sector holding the trailer.
    pub const fn trailer_sector(&self) -> u16 {
        self.req.image_area_count() - 1
    }

    /// Sectors to be swapped, in the order they are processed: the trailer sector first, then
    /// every sector holding image data, descending.
    pub fn sectors(&self) -> impl Iterator<Item = u16> + '_ {
        let trailer = self.trailer_sector();
        let data = self
            .req
            .slot_sectors(Slot::PRIMARY)
            .iter()
            .take(usize::from(trailer))
            .take_while(|sector| {
                sector.offset - self.req.slot(Slot::PRIMARY).offset < self.swap_size
            })
            .count() as u16;

        core::iter::once(trailer).chain((0..data).rev())
    }

    /// Number of bytes of sector `index` that are moved; the trailer itself is never moved.
    pub fn data_len(&self, index: u16) -> u32 {
        let size = self.req.sector(Slot::PRIMARY, index).size;
        if index == self.trailer_sector() {
            size - self.req.layout().size()
        } else {
            size
        }
    }

    pub fn plan(&self, index: u16, phase: Phase) -> CopyOperation {
        let primary = *self.req.sector(Slot::PRIMARY, index);
        let secondary = *self.req.sector(Slot::SECONDARY, index);

        // All of scratch is cleared for the trailer sector, so no stale scratch trailer remains.
        let scratch = if index == self.trailer_sector() {
            *self.req.scratch()
        } else {
            self.req.scratch().sub(0, primary.size)
        };

        let (from, to) = match phase {
            Phase::A2S => (primary, scratch),
            Phase::B2A => (secondary, primary),
            Phase::S2B => (scratch, secondary),
        };

        CopyOperation {
            from,
            to,
            len: self.data_len(index),
        }
    }
}
