//! Swap type decision, taken once per boot from the trailers of both slots.

use serde::{Deserialize, Serialize};

use crate::trailer::{Flag, MagicState, Trailer};

/// What the bootloader has to do this boot before jumping into the primary slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SwapType {
    /// Boot the primary slot as-is.
    None,
    /// Swap in the secondary image for a single trial boot.
    Test,
    /// Swap in the secondary image for good.
    Permanent,
    /// Undo a test swap whose image was never confirmed.
    Revert,
}

impl SwapType {
    pub const fn from_raw(raw: u8) -> Option<SwapType> {
        match raw {
            1 => Some(SwapType::None),
            2 => Some(SwapType::Test),
            3 => Some(SwapType::Permanent),
            4 => Some(SwapType::Revert),
            _ => None,
        }
    }

    pub const fn to_raw(self) -> u8 {
        match self {
            SwapType::None => 1,
            SwapType::Test => 2,
            SwapType::Permanent => 3,
            SwapType::Revert => 4,
        }
    }

    /// Whether the image ending up in the primary slot is confirmed once the swap completes.
    pub const fn confirms(self) -> bool {
        matches!(self, SwapType::Permanent | SwapType::Revert)
    }
}

/// Outcome of inspecting the trailers when no swap is in progress.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Decision {
    Swap(SwapType),
    /// A confirming swap completed, but power was lost before `image_ok` was written.
    FinishConfirm,
}

/// Decide the swap type from the trailer of the primary and the secondary slot.
pub fn decide(primary: &Trailer, secondary: &Trailer) -> Decision {
    // A fresh request in the secondary slot takes precedence over a pending revert.
    if secondary.magic == MagicState::Good {
        return Decision::Swap(match secondary.image_ok {
            Flag::Unset => SwapType::Test,
            Flag::Set => SwapType::Permanent,
            Flag::Bad(_) => SwapType::None,
        });
    }

    // `copy_done` is the stronger signal: without magic, or partially programmed, still assume
    // a swap finished.
    if primary.copy_done != Flag::Unset && primary.image_ok == Flag::Unset {
        return match primary.swap_type {
            Some(swap_type) if swap_type.confirms() => Decision::FinishConfirm,
            _ => Decision::Swap(SwapType::Revert),
        };
    }

    Decision::Swap(SwapType::None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: Trailer = Trailer {
        magic: MagicState::Good,
        ..Trailer::ERASED
    };

    const TESTED: Trailer = Trailer {
        swap_size: Some(0x4000),
        swap_type: Some(SwapType::Test),
        magic: MagicState::Good,
        copy_done: Flag::Set,
        image_ok: Flag::Unset,
    };

    #[test]
    fn nothing_to_do() {
        assert_eq!(
            decide(&Trailer::ERASED, &Trailer::ERASED),
            Decision::Swap(SwapType::None)
        );
    }

    #[test]
    fn requests() {
        assert_eq!(
            decide(&Trailer::ERASED, &REQUEST),
            Decision::Swap(SwapType::Test)
        );

        let permanent = Trailer {
            image_ok: Flag::Set,
            ..REQUEST
        };
        assert_eq!(
            decide(&Trailer::ERASED, &permanent),
            Decision::Swap(SwapType::Permanent)
        );

        let failed = Trailer {
            image_ok: Flag::Bad(0x00),
            ..REQUEST
        };
        assert_eq!(
            decide(&Trailer::ERASED, &failed),
            Decision::Swap(SwapType::None)
        );
    }

    #[test]
    fn unconfirmed_test_reverts() {
        assert_eq!(
            decide(&TESTED, &Trailer::ERASED),
            Decision::Swap(SwapType::Revert)
        );

        let confirmed = Trailer {
            image_ok: Flag::Set,
            ..TESTED
        };
        assert_eq!(
            decide(&confirmed, &Trailer::ERASED),
            Decision::Swap(SwapType::None)
        );
    }

    #[test]
    fn new_request_beats_revert() {
        assert_eq!(decide(&TESTED, &REQUEST), Decision::Swap(SwapType::Test));
    }

    #[test]
    fn copy_done_without_magic() {
        let corrupt = Trailer {
            magic: MagicState::Bad,
            swap_type: None,
            ..TESTED
        };
        assert_eq!(
            decide(&corrupt, &Trailer::ERASED),
            Decision::Swap(SwapType::Revert)
        );
    }

    #[test]
    fn partial_copy_done_counts_as_done() {
        let torn = Trailer {
            copy_done: Flag::Bad(0x7f),
            ..TESTED
        };
        assert_eq!(
            decide(&torn, &Trailer::ERASED),
            Decision::Swap(SwapType::Revert)
        );
    }

    #[test]
    fn interrupted_confirmation() {
        for swap_type in [SwapType::Permanent, SwapType::Revert] {
            let primary = Trailer {
                swap_type: Some(swap_type),
                ..TESTED
            };
            assert_eq!(
                decide(&primary, &Trailer::ERASED),
                Decision::FinishConfirm
            );
        }
    }

    #[test]
    fn raw_values() {
        for swap_type in [
            SwapType::None,
            SwapType::Test,
            SwapType::Permanent,
            SwapType::Revert,
        ] {
            assert_eq!(SwapType::from_raw(swap_type.to_raw()), Some(swap_type));
        }
        assert_eq!(SwapType::from_raw(0xff), None);
    }
}
