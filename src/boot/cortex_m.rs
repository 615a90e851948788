use crate::boot::Boot;

/// Jump into an image on Cortex-M, loading its stack pointer and reset vector.
///
/// TrustZone is not supported.
pub struct SimpleCortexM;

impl Boot for SimpleCortexM {
    unsafe fn boot(addr: *const u32) -> ! {
        unsafe { cortex_m::asm::bootload(addr) }
    }
}
