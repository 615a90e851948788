//! Handing control over to the selected image.

#[cfg(feature = "cortex_m")]
pub mod cortex_m;

/// Mechanism to start an image once [`boot_go`](crate::boot_go) selected it.
///
/// Implementations may additionally drop privileges or lock down flash before jumping.
pub trait Boot {
    /// Jump to the image body at `addr`, typically its vector table.
    ///
    /// # Safety
    /// `addr` must point to the vector table of a verified image.
    unsafe fn boot(addr: *const u32) -> !;
}

#[cfg(test)]
mod tests {
    use std::panic;

    use super::Boot;
    use crate::{
        ImageVersion, SwapType,
        loader::BootResponse,
        mock::single_scratch::{self, PRIMARY_AREA},
    };

    struct Recorder;

    impl Boot for Recorder {
        unsafe fn boot(addr: *const u32) -> ! {
            panic::panic_any(addr as u32)
        }
    }

    #[test]
    fn jumps_past_header() {
        let response = BootResponse {
            header: single_scratch::header(ImageVersion::new(1, 0, 0), 0x100),
            flash_id: 0,
            image_addr: PRIMARY_AREA.offset,
            swap: SwapType::None,
        };
        assert_eq!(response.entry_offset(), 0x4020);

        let jumped =
            panic::catch_unwind(|| -> u32 { unsafe { response.jump::<Recorder>(0x0800_0000) } })
                .unwrap_err();
        assert_eq!(jumped.downcast_ref::<u32>(), Some(&0x0800_4020));
    }
}
