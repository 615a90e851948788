//! Swap status log, recording how far along the swap of every sector is.
//!
//! The log is the single source of truth for resuming an interrupted swap; nothing about the
//! progress is cached in memory across a reset.
//!
//! Every sector goes through three phases, each owning a write-once entry in the log. An entry
//! holds its marker [`STATUS_REPLICAS`] times, so that a torn write (power lost while programming)
//! is never mistaken for a completed phase:
//!
//! * an entry is set when a majority of replicas carry the marker,
//! * an entry is erased when all replicas are erased,
//! * anything else is torn.
//!
//! The state of a sector is the most progressed phase that is set. A phase is only recorded after
//! the previous one, so a later phase being set implies all earlier work happened even if an
//! earlier entry reads torn. A torn entry above the resolved state means that phase is redone.

use crate::{
    Error,
    flash::Flash,
    log,
    trailer::{
        Flag, MAX_WRITE_ALIGN, MagicState, STATUS_REPLICAS, Trailer, TrailerLayout,
        TrailerLocation, program_element,
    },
};

/// Progress of the swap of a single sector.
///
/// Both `ScratchSaved` and `PrimaryWritten` mean the sector swap is in progress.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SectorState {
    Unset,
    /// The primary sector has been copied to scratch.
    ScratchSaved,
    /// The secondary sector has been copied to primary.
    PrimaryWritten,
    /// Scratch has been copied to the secondary sector.
    Done,
}

impl SectorState {
    const RECORDED: [SectorState; 3] = [
        SectorState::ScratchSaved,
        SectorState::PrimaryWritten,
        SectorState::Done,
    ];

    const fn phase(self) -> Option<u32> {
        match self {
            SectorState::Unset => None,
            SectorState::ScratchSaved => Some(0),
            SectorState::PrimaryWritten => Some(1),
            SectorState::Done => Some(2),
        }
    }

    const fn marker(self) -> u8 {
        match self {
            SectorState::Unset => 0xff,
            SectorState::ScratchSaved => 0x01,
            SectorState::PrimaryWritten => 0x02,
            SectorState::Done => 0x03,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Entry {
    Erased,
    Set,
    Torn,
}

fn classify(replicas: &[u8], marker: u8, erased: u8) -> Entry {
    let set = replicas.iter().filter(|r| **r == marker).count();
    if set * 2 > replicas.len() {
        Entry::Set
    } else if replicas.iter().all(|r| *r == erased) {
        Entry::Erased
    } else {
        Entry::Torn
    }
}

/// Where the status log of an interrupted swap is found.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StatusSource {
    /// No swap in progress.
    None,
    /// The primary slot trailer, once the trailer sector has been written to primary.
    Primary,
    /// The scratch trailer, while the trailer sector itself is being swapped.
    Scratch,
}

impl StatusSource {
    pub fn locate(primary: &Trailer, scratch: &Trailer) -> StatusSource {
        if primary.magic == MagicState::Good && primary.copy_done == Flag::Unset {
            StatusSource::Primary
        } else if scratch.magic == MagicState::Good {
            StatusSource::Scratch
        } else {
            StatusSource::None
        }
    }
}

/// Status log within a single trailer.
#[derive(Clone, Copy, Debug)]
pub struct StatusLog {
    location: TrailerLocation,
    layout: TrailerLayout,
}

impl StatusLog {
    pub const fn new(location: TrailerLocation, layout: TrailerLayout) -> Self {
        Self { location, layout }
    }

    /// Record that `sector` reached `state`. Recording a state twice is harmless.
    pub async fn record_sector_state<F: Flash>(
        &self,
        flash: &mut F,
        sector: u16,
        state: SectorState,
    ) -> Result<(), Error> {
        let Some(phase) = state.phase() else {
            return Ok(());
        };

        let replicas = [state.marker(); STATUS_REPLICAS as usize];
        program_element(
            flash,
            &self.location.area,
            self.location.offset + self.layout.status_entry_offset(sector, phase),
            &replicas,
            self.layout.status_entry_size(),
            self.layout.erased(),
        )
        .await
    }

    pub async fn read_sector_state<F: Flash>(
        &self,
        flash: &mut F,
        sector: u16,
    ) -> Result<SectorState, Error> {
        let mut resolved = SectorState::Unset;
        let mut torn = None;

        for state in SectorState::RECORDED {
            let Some(phase) = state.phase() else {
                continue;
            };

            let mut replicas = [0u8; MAX_WRITE_ALIGN as usize];
            let replicas = &mut replicas[..STATUS_REPLICAS as usize];
            let offset = self.location.offset + self.layout.status_entry_offset(sector, phase);
            flash.read(&self.location.area, offset, replicas).await?;

            match classify(replicas, state.marker(), self.layout.erased()) {
                Entry::Set => resolved = state,
                Entry::Torn => torn = Some(state),
                Entry::Erased => {}
            }
        }

        if let Some(state) = torn {
            if state > resolved {
                log::warn!(
                    "torn status entry {:?} for sector {}, redoing",
                    state,
                    sector
                );
            }
        }

        Ok(resolved)
    }

    /// Number of `sectors` that are done, and the number of `sectors`.
    pub async fn progress<F: Flash>(
        &self,
        flash: &mut F,
        sectors: impl Iterator<Item = u16>,
    ) -> Result<(u16, u16), Error> {
        let mut done = 0;
        let mut total = 0;
        for sector in sectors {
            total += 1;
            if self.read_sector_state(flash, sector).await? == SectorState::Done {
                done += 1;
            }
        }
        Ok((done, total))
    }
}
